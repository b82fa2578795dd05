/// Execution Orchestrator
///
/// **Core Responsibility:**
/// Turn a [`TestCollection`] and the available devices into a stream of
/// [`OutcomeReport`]s, exactly one per scheduled (test, device) pair.
///
/// **Per class:**
/// 1. Resolve each test's predicate and group the devices
/// 2. Report grouping-only outcomes (redundant, no device, predicate error)
/// 3. Send one `Execute` per device that has cases to that device's worker
/// 4. Forward the worker's outcomes as they arrive
///
/// **Workers:**
/// One per device, launched on first use, reused across classes, replaced
/// after a crash, shut down when the run ends. A crashed batch reports
/// `WorkerCrashed` for every case that had no outcome yet; a cancelled batch
/// reports nothing further. Once the run is cancelled no batch starts and no
/// worker is launched.
use futures_util::future::join_all;
use nanotest_common::device::{Device, DeviceId};
use nanotest_common::predicate::PredicateRegistry;
use nanotest_common::protocol::{ExecuteRequest, MessageBody};
use nanotest_common::types::{ClassTestPlan, Outcome, OutcomeReport, TestCase, TestCaseId, TestCollection};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::channel::{RequestEvent, RequestOutcome};
use crate::grouping::{group_devices, synthetic_outcomes};
use crate::supervisor::{Worker, WorkerLauncher};

#[derive(Debug, Clone, Copy)]
pub struct OrchestratorOptions {
    /// Run the device batches of a class concurrently
    pub parallel_devices: bool,
    /// Reports buffered ahead of the consumer
    pub buffer: usize,
}

impl Default for OrchestratorOptions {
    fn default() -> Self {
        Self {
            parallel_devices: false,
            buffer: 64,
        }
    }
}

pub struct ExecutionOrchestrator<L> {
    launcher: Arc<L>,
    registry: Arc<PredicateRegistry>,
    options: OrchestratorOptions,
}

impl<L: WorkerLauncher> ExecutionOrchestrator<L> {
    pub fn new(launcher: L, registry: PredicateRegistry, options: OrchestratorOptions) -> Self {
        Self {
            launcher: Arc::new(launcher),
            registry: Arc::new(registry),
            options,
        }
    }

    /// Start a run. The stream ends when every class is done or the run is
    /// cancelled; dropping it cancels the run.
    pub fn execute(
        &self,
        collection: TestCollection,
        devices: Vec<Device>,
        cancel: CancellationToken,
    ) -> ReceiverStream<OutcomeReport> {
        let (tx, rx) = mpsc::channel(self.options.buffer.max(1));
        let cancel = cancel.child_token();
        let run = Run {
            launcher: self.launcher.clone(),
            registry: self.registry.clone(),
            parallel: self.options.parallel_devices,
            devices,
            sink: OutcomeSink { tx, cancel: cancel.clone() },
            cancel,
            workers: HashMap::new(),
        };
        tokio::spawn(run.drive(collection));
        ReceiverStream::new(rx)
    }
}

/// Ordered outlet for reports; a gone consumer cancels the run
#[derive(Clone)]
struct OutcomeSink {
    tx: mpsc::Sender<OutcomeReport>,
    cancel: CancellationToken,
}

impl OutcomeSink {
    async fn emit(&self, report: OutcomeReport) {
        if self.tx.send(report).await.is_err() && !self.cancel.is_cancelled() {
            debug!("outcome stream dropped; cancelling run");
            self.cancel.cancel();
        }
    }
}

struct Run<L> {
    launcher: Arc<L>,
    registry: Arc<PredicateRegistry>,
    parallel: bool,
    devices: Vec<Device>,
    sink: OutcomeSink,
    cancel: CancellationToken,
    workers: HashMap<DeviceId, Worker>,
}

impl<L: WorkerLauncher> Run<L> {
    #[instrument(skip_all, fields(classes = collection.classes.len()))]
    async fn drive(mut self, collection: TestCollection) {
        info!(
            tests = collection.test_count(),
            devices = self.devices.len(),
            parallel = self.parallel,
            "execution started"
        );

        for plan in &collection.classes {
            if self.cancel.is_cancelled() {
                info!("execution cancelled");
                break;
            }
            let batches = self.schedule_class(plan).await;
            if self.parallel {
                self.run_parallel(batches).await;
            } else {
                for (device, batch) in batches {
                    if self.cancel.is_cancelled() {
                        break;
                    }
                    let worker = self.workers.remove(&device.id);
                    let worker = run_batch(
                        self.launcher.as_ref(),
                        worker,
                        &device,
                        batch,
                        &self.cancel,
                        &self.sink,
                    )
                    .await;
                    if let Some(worker) = worker {
                        self.workers.insert(device.id.clone(), worker);
                    }
                }
            }
        }

        let workers: Vec<Worker> = self.workers.drain().map(|(_, worker)| worker).collect();
        join_all(workers.into_iter().map(Worker::shutdown)).await;
        info!("execution finished");
    }

    /// Report grouping-only outcomes and build the per-device batches, in
    /// device order
    async fn schedule_class(&self, plan: &ClassTestPlan) -> Vec<(Device, ClassTestPlan)> {
        let mut scheduled: Vec<Vec<TestCase>> = vec![Vec::new(); self.devices.len()];

        for test in &plan.tests {
            let predicate = self.registry.resolve(&test.predicate);
            let assignment = group_devices(&self.devices, &predicate);
            debug!(
                test = %test.id,
                predicate = predicate.label(),
                representatives = assignment.representatives.len(),
                redundant = assignment.redundant.len(),
                excluded = assignment.excluded.len(),
                "devices grouped"
            );

            for report in synthetic_outcomes(test, &assignment) {
                self.sink.emit(report).await;
            }
            for representative in &assignment.representatives {
                if let Some(index) = self.devices.iter().position(|d| d.id == representative.id) {
                    scheduled[index].push(test.clone());
                }
            }
        }

        self.devices
            .iter()
            .zip(scheduled)
            .filter(|(_, tests)| !tests.is_empty())
            .map(|(device, tests)| (device.clone(), plan.with_tests(tests)))
            .collect()
    }

    async fn run_parallel(&mut self, batches: Vec<(Device, ClassTestPlan)>) {
        let launcher = self.launcher.as_ref();
        let cancel = &self.cancel;
        let sink = &self.sink;
        let runs: Vec<_> = batches
            .into_iter()
            .map(|(device, batch)| {
                let worker = self.workers.remove(&device.id);
                async move {
                    let worker = run_batch(launcher, worker, &device, batch, cancel, sink).await;
                    (device.id, worker)
                }
            })
            .collect();

        for (device, worker) in join_all(runs).await {
            if let Some(worker) = worker {
                self.workers.insert(device, worker);
            }
        }
    }
}

/// Execute one class batch on one device. Returns the worker if it is still
/// usable.
#[instrument(skip_all, fields(device = %device.id, class = %batch.class, tests = batch.tests.len()))]
async fn run_batch<L: WorkerLauncher>(
    launcher: &L,
    worker: Option<Worker>,
    device: &Device,
    batch: ClassTestPlan,
    cancel: &CancellationToken,
    sink: &OutcomeSink,
) -> Option<Worker> {
    if cancel.is_cancelled() {
        debug!("run cancelled; batch not started");
        return worker;
    }
    let worker = match worker {
        Some(worker) => worker,
        None => match launcher.launch(device.id.as_str()).await {
            Ok(worker) => worker,
            Err(e) => {
                warn!(error = %e, "failed to launch worker");
                crash_remaining(&batch, device, &HashSet::new(), &format!("failed to launch worker: {}", e), sink).await;
                return None;
            }
        },
    };

    let request = MessageBody::Execute(ExecuteRequest {
        plan: batch.clone(),
        device: device.clone(),
    });
    let mut pending = match worker.channel().start_request(request).await {
        Ok(pending) => pending,
        Err(e) => {
            crash_remaining(&batch, device, &HashSet::new(), &format!("worker unreachable: {}", e), sink).await;
            worker.shutdown().await;
            return None;
        }
    };

    let mut reported: HashSet<TestCaseId> = HashSet::new();
    let crash = loop {
        match pending.next_event(cancel).await {
            RequestEvent::Progress(MessageBody::OutcomeReported(report)) => {
                reported.insert(report.test.clone());
                sink.emit(report).await;
            }
            RequestEvent::Progress(other) => debug!(kind = other.kind(), "unexpected execution progress"),
            RequestEvent::Finished(RequestOutcome::Response(MessageBody::ExecutionComplete(summary))) => {
                debug!(reported = summary.reported, aborted = summary.aborted, "batch complete");
                break None;
            }
            RequestEvent::Finished(RequestOutcome::Response(MessageBody::Failure(failure))) => {
                break Some(failure.message)
            }
            RequestEvent::Finished(RequestOutcome::Response(other)) => {
                break Some(format!("unexpected reply {}", other.kind()))
            }
            RequestEvent::Finished(RequestOutcome::ProtocolError(reason)) => {
                break Some(format!("protocol error: {}", reason))
            }
            RequestEvent::Finished(RequestOutcome::ChannelClosed) if !cancel.is_cancelled() => {
                break Some("worker exited unexpectedly".to_string())
            }
            RequestEvent::Finished(RequestOutcome::ChannelClosed | RequestOutcome::Cancelled) => {
                debug!(reported = reported.len(), "batch cancelled");
                drop(pending);
                worker.shutdown().await;
                return None;
            }
        }
    };
    drop(pending);

    match crash {
        None => Some(worker),
        Some(reason) => {
            warn!(%reason, reported = reported.len(), "worker crashed");
            crash_remaining(&batch, device, &reported, &reason, sink).await;
            worker.shutdown().await;
            None
        }
    }
}

async fn crash_remaining(
    batch: &ClassTestPlan,
    device: &Device,
    reported: &HashSet<TestCaseId>,
    reason: &str,
    sink: &OutcomeSink,
) {
    for test in batch.tests.iter().filter(|t| !reported.contains(&t.id)) {
        let report = OutcomeReport::new(
            test.id.clone(),
            Some(device.id.clone()),
            Outcome::WorkerCrashed(reason.to_string()),
        );
        sink.emit(report).await;
    }
}
