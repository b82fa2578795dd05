/// Class Execution State Machine
///
/// **Core Responsibility:**
/// Run one [`ClassTestPlan`] on one device through a [`TestHost`]:
/// `NotStarted -> SetupRunning -> TestRunning* -> CleanupRunning -> Done`,
/// or `Aborted` on cancellation or setup failure.
///
/// **Instancing:**
/// - `PerMethod`: setup, body, cleanup for every test case
/// - `Shared`: setup once before the first case, cleanup once after the last
///
/// **Classification:**
/// - Body assertion failure or error -> `Failed`
/// - Setup failure -> `SetupFailed` for every case not yet run, nothing else runs
/// - Cleanup failure -> `CleanupFailed`, but only in place of a `Passed`
///
/// Cancellation is checked between test cases; a case that has started
/// always finishes, including its cleanup.
use nanotest_common::device::Device;
use nanotest_common::types::{ClassTestPlan, Instancing, MethodRef, Outcome, OutcomeReport, TestCase};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InvocationRole {
    Setup,
    Test,
    Cleanup,
}

impl fmt::Display for InvocationRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InvocationRole::Setup => write!(f, "setup"),
            InvocationRole::Test => write!(f, "test"),
            InvocationRole::Cleanup => write!(f, "cleanup"),
        }
    }
}

/// One method call on a device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Invocation {
    pub role: InvocationRole,
    pub method: MethodRef,
    #[serde(default)]
    pub args: Vec<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvocationResult {
    Success,
    /// The method ran and an assertion failed
    AssertionFailed(String),
    /// The method could not run or raised an unexpected error
    Error(String),
}

impl InvocationResult {
    fn failure(&self) -> Option<&str> {
        match self {
            InvocationResult::Success => None,
            InvocationResult::AssertionFailed(reason) | InvocationResult::Error(reason) => Some(reason),
        }
    }
}

/// Runs methods on devices. The only place that touches a device.
pub trait TestHost: Send + Sync + 'static {
    fn invoke(&self, device: &Device, invocation: &Invocation) -> impl Future<Output = InvocationResult> + Send;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClassState {
    NotStarted,
    SetupRunning,
    TestRunning,
    CleanupRunning,
    Done,
    Aborted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClassRunSummary {
    pub state: ClassState,
    pub reported: usize,
    /// Stopped between cases because the token fired
    pub cancelled: bool,
}

struct ClassRun<'a, H> {
    plan: &'a ClassTestPlan,
    device: &'a Device,
    host: &'a H,
    cancel: &'a CancellationToken,
    outcomes: mpsc::UnboundedSender<OutcomeReport>,
    state: ClassState,
    reported: usize,
    cancelled: bool,
}

/// Run every test case of `plan` on `device`, sending one report per case
/// that ran (or was failed by setup). Returns when the class is finished.
#[instrument(skip_all, fields(class = %plan.class, device = %device.id, tests = plan.tests.len()))]
pub async fn run_class<H: TestHost>(
    plan: &ClassTestPlan,
    device: &Device,
    host: &H,
    cancel: &CancellationToken,
    outcomes: mpsc::UnboundedSender<OutcomeReport>,
) -> ClassRunSummary {
    let mut run = ClassRun {
        plan,
        device,
        host,
        cancel,
        outcomes,
        state: ClassState::NotStarted,
        reported: 0,
        cancelled: false,
    };

    if cancel.is_cancelled() {
        run.cancelled = true;
        run.transition(ClassState::Aborted);
    } else {
        match plan.instancing {
            Instancing::Shared => run.shared().await,
            Instancing::PerMethod => run.per_method().await,
        }
    }

    ClassRunSummary {
        state: run.state,
        reported: run.reported,
        cancelled: run.cancelled,
    }
}

impl<'a, H: TestHost> ClassRun<'a, H> {
    fn transition(&mut self, next: ClassState) {
        debug!(from = ?self.state, to = ?next, "class state");
        self.state = next;
    }

    fn emit(&mut self, report: OutcomeReport) {
        debug!(test = %report.test, outcome = %report.outcome, "outcome");
        self.reported += 1;
        if self.outcomes.send(report).is_err() {
            debug!("outcome receiver dropped");
        }
    }

    fn report(&self, test: &TestCase, outcome: Outcome, started: Instant) -> OutcomeReport {
        OutcomeReport::new(test.id.clone(), Some(self.device.id.clone()), outcome)
            .with_duration_ms(started.elapsed().as_millis() as u64)
    }

    async fn call(&self, role: InvocationRole, method: &MethodRef, args: &[serde_json::Value]) -> InvocationResult {
        let invocation = Invocation {
            role,
            method: method.clone(),
            args: args.to_vec(),
        };
        self.host.invoke(self.device, &invocation).await
    }

    /// Run the whole chain; the first failing method stops it
    async fn setup_chain(&self) -> Result<(), String> {
        for method in &self.plan.setup {
            if let Some(reason) = self.call(InvocationRole::Setup, method, &[]).await.failure() {
                return Err(format!("{}: {}", method, reason));
            }
        }
        Ok(())
    }

    /// Every cleanup method runs; the first failure is kept
    async fn cleanup_chain(&self) -> Result<(), String> {
        let mut first_failure = None;
        for method in &self.plan.cleanup {
            if let Some(reason) = self.call(InvocationRole::Cleanup, method, &[]).await.failure() {
                warn!(method = %method, %reason, "cleanup failed");
                first_failure.get_or_insert_with(|| format!("{}: {}", method, reason));
            }
        }
        first_failure.map_or(Ok(()), Err)
    }

    async fn body(&self, test: &TestCase) -> Outcome {
        match self.call(InvocationRole::Test, &test.method_ref(), &test.args).await {
            InvocationResult::Success => Outcome::Passed,
            InvocationResult::AssertionFailed(reason) => Outcome::Failed(reason),
            InvocationResult::Error(reason) => Outcome::Failed(format!("unhandled error: {}", reason)),
        }
    }

    fn fail_setup(&mut self, tests: &[TestCase], reason: &str, started: Instant) {
        warn!(%reason, remaining = tests.len(), "setup failed");
        for test in tests {
            let report = self.report(test, Outcome::SetupFailed(reason.to_string()), started);
            self.emit(report);
        }
        self.transition(ClassState::Aborted);
    }

    async fn shared(&mut self) {
        let plan = self.plan;
        let started = Instant::now();

        self.transition(ClassState::SetupRunning);
        if let Err(reason) = self.setup_chain().await {
            self.fail_setup(&plan.tests, &reason, started);
            return;
        }

        self.transition(ClassState::TestRunning);
        // the last outcome waits for cleanup, which may still fail it
        let mut held: Option<OutcomeReport> = None;
        for test in &plan.tests {
            if self.cancel.is_cancelled() {
                self.cancelled = true;
                break;
            }
            if let Some(previous) = held.take() {
                self.emit(previous);
            }
            let started = Instant::now();
            let outcome = self.body(test).await;
            held = Some(self.report(test, outcome, started));
        }

        self.transition(ClassState::CleanupRunning);
        let cleanup = self.cleanup_chain().await;
        match (held, cleanup) {
            (Some(mut last), Err(reason)) => {
                if last.outcome.is_passed() {
                    last.outcome = Outcome::CleanupFailed(reason);
                } else {
                    warn!(test = %last.test, %reason, "cleanup failed after a failed test");
                }
                self.emit(last);
            }
            (Some(last), Ok(())) => self.emit(last),
            (None, Err(reason)) => warn!(%reason, "cleanup failed with no test to attribute it to"),
            (None, Ok(())) => {}
        }

        self.transition(if self.cancelled { ClassState::Aborted } else { ClassState::Done });
    }

    async fn per_method(&mut self) {
        let plan = self.plan;

        for (index, test) in plan.tests.iter().enumerate() {
            if self.cancel.is_cancelled() {
                self.cancelled = true;
                self.transition(ClassState::Aborted);
                return;
            }
            let started = Instant::now();

            self.transition(ClassState::SetupRunning);
            if let Err(reason) = self.setup_chain().await {
                self.fail_setup(&plan.tests[index..], &reason, started);
                return;
            }

            self.transition(ClassState::TestRunning);
            let mut outcome = self.body(test).await;

            self.transition(ClassState::CleanupRunning);
            if let Err(reason) = self.cleanup_chain().await {
                if outcome.is_passed() {
                    outcome = Outcome::CleanupFailed(reason);
                } else {
                    warn!(test = %test.id, %reason, "cleanup failed after a failed test");
                }
            }

            let report = self.report(test, outcome, started);
            self.emit(report);
        }

        self.transition(ClassState::Done);
    }
}
