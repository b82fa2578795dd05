/// Integration tests for launcher-driven invocation
///
/// These tests run real launcher processes through `sh` and verify:
/// 1. Exit codes are classified correctly
/// 2. The launcher sees the invocation in its environment
/// 3. Timeouts kill the launcher
/// 4. Spawn failures become errors instead of crashes
/// 5. A whole class runs through the worker handler end to end

#[cfg(all(test, unix))]
mod launcher_tests {
    use crate::engine::LauncherEngine;
    use nanotest_common::device::Device;
    use nanotest_common::predicate::PredicateRegistry;
    use nanotest_common::protocol::{ExecuteRequest, MessageBody};
    use nanotest_common::types::{ClassTestPlan, Instancing, MethodRef, Outcome, TestCase, TestCaseId};
    use nanotest_engine::channel::{ChannelConfig, MessageChannel, RequestEvent, RequestOutcome};
    use nanotest_engine::execution::{Invocation, InvocationResult, InvocationRole, TestHost};
    use nanotest_engine::supervisor::serve;
    use nanotest_engine::worker::WorkerHandler;
    use serde_json::json;
    use std::sync::Arc;
    use std::time::{Duration, Instant};
    use tokio_util::sync::CancellationToken;

    fn sh_device(script: &str) -> Device {
        Device::new("sim").with_launcher(["sh", "-c", script])
    }

    fn invocation(method: &str, args: Vec<serde_json::Value>) -> Invocation {
        Invocation {
            role: InvocationRole::Test,
            method: MethodRef {
                assembly: "Firmware.Tests".to_string(),
                class: "Board".to_string(),
                method: method.to_string(),
            },
            args,
        }
    }

    /// Test: a launcher exiting 0 passes
    #[tokio::test]
    async fn test_exit_zero_passes() {
        let engine = LauncherEngine::new(Duration::from_secs(10));
        let result = engine.invoke(&sh_device("echo running; exit 0"), &invocation("Boot", Vec::new())).await;
        assert_eq!(result, InvocationResult::Success);
    }

    /// Test: exit 1 is an assertion failure carrying the first stderr line
    #[tokio::test]
    async fn test_exit_one_is_assertion_failure() {
        let engine = LauncherEngine::new(Duration::from_secs(10));
        let result = engine
            .invoke(
                &sh_device("echo 'expected 3, got 4' >&2; echo 'second line' >&2; exit 1"),
                &invocation("Boot", Vec::new()),
            )
            .await;
        assert_eq!(result, InvocationResult::AssertionFailed("expected 3, got 4".to_string()));
    }

    /// Test: other exit codes are errors
    #[tokio::test]
    async fn test_other_exit_is_error() {
        let engine = LauncherEngine::new(Duration::from_secs(10));
        let result = engine
            .invoke(&sh_device("echo 'no device on /dev/ttyUSB0' >&2; exit 3"), &invocation("Boot", Vec::new()))
            .await;
        assert_eq!(
            result,
            InvocationResult::Error("launcher exited with code 3: no device on /dev/ttyUSB0".to_string())
        );
    }

    /// Test: the invocation is visible to the launcher
    #[tokio::test]
    async fn test_launcher_receives_invocation_environment() {
        let engine = LauncherEngine::new(Duration::from_secs(10));
        let device = Device::new("board-7").with_launcher([
            "sh",
            "-c",
            r#"test "$NANOTEST_ASSEMBLY" = "Firmware.Tests" \
                && test "$NANOTEST_CLASS" = "Board" \
                && test "$NANOTEST_METHOD" = "IsPositive" \
                && test "$NANOTEST_ROLE" = "test" \
                && test "$NANOTEST_DEVICE" = "board-7" \
                && test "$NANOTEST_ARGS" = "WzQyXQ==" \
                || { echo "unexpected environment" >&2; exit 1; }"#,
        ]);

        let result = engine.invoke(&device, &invocation("IsPositive", vec![json!(42)])).await;

        assert_eq!(result, InvocationResult::Success);
    }

    /// Test: a hanging launcher is killed at the timeout
    #[tokio::test]
    async fn test_timeout_kills_launcher() {
        let engine = LauncherEngine::new(Duration::from_millis(200));
        let start = Instant::now();

        let output = engine.run_launcher(&sh_device("sleep 30"), &invocation("Hang", Vec::new())).await;

        assert!(output.timed_out);
        assert!(start.elapsed() < Duration::from_secs(10));
        let result = crate::evaluator::classify(&output);
        assert!(matches!(result, InvocationResult::Error(ref reason) if reason.contains("timed out")));
    }

    /// Test: a missing launcher program is an error, not a crash
    #[tokio::test]
    async fn test_missing_program_is_error() {
        let engine = LauncherEngine::new(Duration::from_secs(10));
        let device = Device::new("sim").with_launcher(["/nonexistent/nanotest-launcher"]);

        let result = engine.invoke(&device, &invocation("Boot", Vec::new())).await;

        assert!(
            matches!(result, InvocationResult::Error(ref reason) if reason.starts_with("failed to start launcher")),
            "{:?}",
            result
        );
    }

    /// Test: setup, body and cleanup all go through the launcher
    #[tokio::test]
    async fn test_class_runs_through_worker_handler() {
        let ((parent, _parent_inbound), (child, child_inbound)) = MessageChannel::pair(ChannelConfig::default());
        let engine = Arc::new(LauncherEngine::new(Duration::from_secs(10)));
        let handler = Arc::new(WorkerHandler::new(engine, PredicateRegistry::new()));
        tokio::spawn(serve(child, child_inbound, handler, CancellationToken::new()));

        // setup and the passing test exit 0, `Broken` fails its assertion
        let script = r#"if [ "$NANOTEST_METHOD" = "Broken" ]; then echo "led stayed off" >&2; exit 1; fi"#;
        let method = |name: &str| MethodRef {
            assembly: "Firmware.Tests".to_string(),
            class: "Board".to_string(),
            method: name.to_string(),
        };
        let case = |name: &str| TestCase {
            id: TestCaseId::new("Board", name, None),
            assembly: "Firmware.Tests".to_string(),
            args: Vec::new(),
            predicate: Default::default(),
            description: format!("Board.{}", name),
            traits: Default::default(),
        };
        let plan = ClassTestPlan {
            assembly: "Firmware.Tests".to_string(),
            class: "Board".to_string(),
            setup: vec![method("PowerOn")],
            cleanup: vec![method("PowerOff")],
            instancing: Instancing::PerMethod,
            tests: vec![case("Blink"), case("Broken")],
        };

        let cancel = CancellationToken::new();
        let mut pending = parent
            .start_request(MessageBody::Execute(ExecuteRequest {
                plan,
                device: sh_device(script),
            }))
            .await
            .unwrap();

        let mut outcomes = Vec::new();
        let terminal = loop {
            match pending.next_event(&cancel).await {
                RequestEvent::Progress(MessageBody::OutcomeReported(report)) => outcomes.push(report.outcome),
                RequestEvent::Progress(_) => {}
                RequestEvent::Finished(outcome) => break outcome,
            }
        };

        assert!(matches!(terminal, RequestOutcome::Response(MessageBody::ExecutionComplete(_))));
        assert_eq!(
            outcomes,
            vec![Outcome::Passed, Outcome::Failed("led stayed off".to_string())]
        );
    }
}
