//! Worker-side request handling.
//!
//! `Discover` reflects each requested manifest and streams one
//! `DiscoveryProgress` per assembly before `DiscoveryComplete`. `Execute`
//! runs the class state machine against the test host and streams one
//! `OutcomeReported` per finished case before `ExecutionComplete`. Both answer
//! `Cancelled` when their token fires before they are done.

use nanotest_common::predicate::PredicateRegistry;
use nanotest_common::protocol::{
    DiscoverRequest, DiscoverySummary, ExecuteRequest, ExecutionSummary, LogLevel, Message,
    MessageBody,
};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::execution::{run_class, ClassState, TestHost};
use crate::manifest;
use crate::supervisor::{MessageHandler, Responder};

pub struct WorkerHandler<H> {
    host: Arc<H>,
    registry: PredicateRegistry,
}

impl<H: TestHost> WorkerHandler<H> {
    pub fn new(host: Arc<H>, registry: PredicateRegistry) -> Self {
        Self { host, registry }
    }

    #[instrument(skip_all, fields(id = responder.id(), assemblies = request.assemblies.len()))]
    async fn discover(&self, request: DiscoverRequest, responder: &Responder, cancel: &CancellationToken) {
        let mut summary = DiscoverySummary {
            assemblies: 0,
            tests: 0,
        };

        for path in &request.assemblies {
            if cancel.is_cancelled() {
                info!(done = summary.assemblies, "discovery cancelled");
                let _ = responder.finish(MessageBody::Cancelled).await;
                return;
            }

            let resolved = request.context.resolve(path);
            let discovery = manifest::reflect_file(&resolved, &self.registry, &request.context.filter).await;
            summary.assemblies += 1;
            summary.tests += discovery.collection.test_count();

            if let Err(e) = responder.progress(MessageBody::DiscoveryProgress(discovery)).await {
                warn!(error = %e, "parent went away during discovery");
                return;
            }
        }

        let _ = responder.finish(MessageBody::DiscoveryComplete(summary)).await;
    }

    #[instrument(skip_all, fields(id = responder.id(), class = %request.plan.class, device = %request.device.id))]
    async fn execute(&self, request: ExecuteRequest, responder: &Responder, cancel: &CancellationToken) {
        responder
            .log(
                LogLevel::Info,
                format!(
                    "running {} test(s) of {} on {}",
                    request.plan.tests.len(),
                    request.plan.class,
                    request.device.id
                ),
            )
            .await;

        let (tx, mut rx) = mpsc::unbounded_channel();
        let run = run_class(&request.plan, &request.device, self.host.as_ref(), cancel, tx);
        let forward = async {
            let mut forwarded = 0usize;
            while let Some(report) = rx.recv().await {
                match responder.progress(MessageBody::OutcomeReported(report)).await {
                    Ok(()) => forwarded += 1,
                    Err(e) => debug!(error = %e, "outcome not delivered"),
                }
            }
            forwarded
        };
        let (summary, forwarded) = tokio::join!(run, forward);
        debug!(reported = summary.reported, forwarded, state = ?summary.state, "class finished");

        let terminal = if summary.cancelled {
            MessageBody::Cancelled
        } else {
            MessageBody::ExecutionComplete(ExecutionSummary {
                reported: summary.reported,
                aborted: summary.state == ClassState::Aborted,
            })
        };
        let _ = responder.finish(terminal).await;
    }
}

impl<H: TestHost> MessageHandler for WorkerHandler<H> {
    fn handle(
        self: Arc<Self>,
        message: Message,
        responder: Responder,
        cancel: CancellationToken,
    ) -> impl Future<Output = ()> + Send {
        async move {
            match message.body {
                MessageBody::Discover(request) => self.discover(request, &responder, &cancel).await,
                MessageBody::Execute(request) => self.execute(request, &responder, &cancel).await,
                other => debug!(kind = other.kind(), "ignored unsolicited message"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{ChannelConfig, MessageChannel, RequestEvent, RequestOutcome};
    use crate::execution::{Invocation, InvocationResult};
    use crate::supervisor::serve;
    use nanotest_common::device::Device;
    use nanotest_common::protocol::ProjectContext;
    use nanotest_common::types::{ClassTestPlan, Instancing, Outcome, TestCase, TestCaseId};

    struct PassingHost;

    impl TestHost for PassingHost {
        fn invoke(&self, _device: &Device, _invocation: &Invocation) -> impl Future<Output = InvocationResult> + Send {
            async { InvocationResult::Success }
        }
    }

    async fn connected() -> MessageChannel {
        let ((parent, _parent_inbound), (child, child_inbound)) = MessageChannel::pair(ChannelConfig::default());
        let handler = Arc::new(WorkerHandler::new(Arc::new(PassingHost), PredicateRegistry::new()));
        tokio::spawn(serve(child, child_inbound, handler, CancellationToken::new()));
        parent
    }

    #[tokio::test]
    async fn test_execute_streams_outcomes_then_completes() {
        let parent = connected().await;
        let plan = ClassTestPlan {
            assembly: "Sample".to_string(),
            class: "Adc".to_string(),
            setup: Vec::new(),
            cleanup: Vec::new(),
            instancing: Instancing::PerMethod,
            tests: ["Read", "Calibrate"]
                .iter()
                .map(|name| TestCase {
                    id: TestCaseId::new("Adc", *name, None),
                    assembly: "Sample".to_string(),
                    args: Vec::new(),
                    predicate: Default::default(),
                    description: name.to_string(),
                    traits: Default::default(),
                })
                .collect(),
        };
        let cancel = CancellationToken::new();

        let mut pending = parent
            .start_request(MessageBody::Execute(ExecuteRequest {
                plan,
                device: Device::new("sim"),
            }))
            .await
            .unwrap();

        let mut outcomes = Vec::new();
        let terminal = loop {
            match pending.next_event(&cancel).await {
                RequestEvent::Progress(MessageBody::OutcomeReported(report)) => outcomes.push(report),
                RequestEvent::Progress(other) => panic!("unexpected progress {:?}", other),
                RequestEvent::Finished(outcome) => break outcome,
            }
        };

        assert_eq!(outcomes.len(), 2);
        assert!(outcomes.iter().all(|r| r.outcome == Outcome::Passed));
        assert_eq!(
            terminal,
            RequestOutcome::Response(MessageBody::ExecutionComplete(ExecutionSummary {
                reported: 2,
                aborted: false,
            }))
        );
    }

    #[tokio::test]
    async fn test_discover_resolves_relative_paths() {
        let dir = std::env::temp_dir().join(format!("nanotest-worker-{}", uuid::Uuid::new_v4()));
        tokio::fs::create_dir_all(&dir).await.unwrap();
        tokio::fs::write(
            dir.join("sensors.json"),
            br#"{"classes": [{"name": "Temp", "attributes": [{"kind": "TestClass"}],
                "methods": [{"name": "Read", "attributes": [{"kind": "TestMethod"}]}]}]}"#,
        )
        .await
        .unwrap();
        let parent = connected().await;

        let mut pending = parent
            .start_request(MessageBody::Discover(DiscoverRequest {
                assemblies: vec!["sensors.json".into()],
                context: ProjectContext {
                    working_dir: Some(dir.clone()),
                    filter: Default::default(),
                },
            }))
            .await
            .unwrap();
        let cancel = CancellationToken::new();

        let progress = pending.next_event(&cancel).await;
        let terminal = pending.next_event(&cancel).await;
        tokio::fs::remove_dir_all(&dir).await.unwrap();

        match progress {
            RequestEvent::Progress(MessageBody::DiscoveryProgress(discovery)) => {
                assert_eq!(discovery.assembly, "sensors");
                assert_eq!(discovery.collection.test_count(), 1);
                assert!(discovery.diagnostics.is_empty());
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert_eq!(
            terminal,
            RequestEvent::Finished(RequestOutcome::Response(MessageBody::DiscoveryComplete(
                DiscoverySummary {
                    assemblies: 1,
                    tests: 1
                }
            )))
        );
    }
}
