/// Invocation Evaluator - Launcher Exit Classification
///
/// **Core Responsibility:**
/// Turn the raw result of one launcher run into an [`InvocationResult`].
///
/// **Critical Properties:**
/// - Knows nothing about processes or devices
/// - Pure function: (raw output) → result
///
/// **Classification Rules (first match wins):**
/// 1. Launcher could not be started → `Error`
/// 2. Timed out → `Error`
/// 3. Exit code 0 → `Success`
/// 4. Exit code 1 → `AssertionFailed` with the first stderr line, else stdout
/// 5. Any other exit code, or killed by a signal → `Error`
///
/// **Message Normalization:**
/// - Leading and trailing whitespace trimmed
/// - `\r\n` and `\n` treated alike
/// - Only the first non-empty stderr line is used
use nanotest_engine::execution::InvocationResult;

/// Exit code a launcher uses to report a failed assertion
pub const ASSERTION_EXIT_CODE: i32 = 1;

const FALLBACK_ASSERTION_MESSAGE: &str = "assertion failed";

/// Raw output of one launcher run
/// Produced by LauncherEngine, consumed by the evaluator
#[derive(Debug, Clone, Default)]
pub struct RawInvocationOutput {
    pub stdout: String,
    pub stderr: String,
    /// `None` when the process was terminated by a signal or never exited
    pub exit_code: Option<i32>,
    pub timed_out: bool,
    pub spawn_error: Option<String>,
    pub execution_time_ms: u64,
}

/// First non-empty line, trimmed
fn first_line(output: &str) -> Option<&str> {
    output.lines().map(str::trim).find(|line| !line.is_empty())
}

/// Failure message for an assertion: stderr's first line, else stdout
fn assertion_message(output: &RawInvocationOutput) -> String {
    first_line(&output.stderr)
        .map(str::to_string)
        .or_else(|| {
            let stdout = output.stdout.trim();
            (!stdout.is_empty()).then(|| stdout.to_string())
        })
        .unwrap_or_else(|| FALLBACK_ASSERTION_MESSAGE.to_string())
}

/// Classify a launcher run
///
/// ## Arguments
/// * `output` - Raw output captured by the engine
///
/// ## Returns
/// The result handed back to the class state machine
pub fn classify(output: &RawInvocationOutput) -> InvocationResult {
    if let Some(error) = &output.spawn_error {
        return InvocationResult::Error(format!("failed to start launcher: {}", error));
    }
    if output.timed_out {
        return InvocationResult::Error(format!(
            "launcher timed out after {}ms",
            output.execution_time_ms
        ));
    }

    match output.exit_code {
        Some(0) => InvocationResult::Success,
        Some(ASSERTION_EXIT_CODE) => InvocationResult::AssertionFailed(assertion_message(output)),
        Some(code) => InvocationResult::Error(match first_line(&output.stderr) {
            Some(line) => format!("launcher exited with code {}: {}", code, line),
            None => format!("launcher exited with code {}", code),
        }),
        None => InvocationResult::Error(match first_line(&output.stderr) {
            Some(line) => format!("launcher terminated by a signal: {}", line),
            None => "launcher terminated by a signal".to_string(),
        }),
    }
}
