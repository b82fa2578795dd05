/// Launcher Engine - Device Method Invocation
///
/// **Core Responsibility:**
/// Run one setup, test or cleanup method on a device by executing the
/// device's launcher command and classifying how it exits.
///
/// **Invocation Contract:**
/// The launcher receives the invocation through its environment:
/// - `NANOTEST_ASSEMBLY`, `NANOTEST_CLASS`, `NANOTEST_METHOD`
/// - `NANOTEST_ROLE`: `setup`, `test` or `cleanup`
/// - `NANOTEST_DEVICE`: the device id
/// - `NANOTEST_ARGS`: base64 of the JSON array of data-row arguments
///
/// **Guarantees:**
/// - Hard timeout: the launcher is killed when it exceeds the invocation timeout
/// - stdin is closed; stdout and stderr are captured in full
/// - Never panics and never returns an infrastructure error: every failure
///   becomes an `InvocationResult`
use base64::{engine::general_purpose, Engine as _};
use nanotest_common::device::Device;
use nanotest_engine::execution::{Invocation, InvocationResult, TestHost};
use std::future::Future;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::process::Command;
use tracing::{debug, warn};

use crate::evaluator::{classify, RawInvocationOutput};

pub struct LauncherEngine {
    invocation_timeout: Duration,
}

impl LauncherEngine {
    pub fn new(invocation_timeout: Duration) -> Self {
        Self { invocation_timeout }
    }

    /// Run the launcher and capture everything it produced
    #[tracing::instrument(skip_all, fields(device = %device.id, method = %invocation.method, role = %invocation.role))]
    pub async fn run_launcher(&self, device: &Device, invocation: &Invocation) -> RawInvocationOutput {
        let Some((program, args)) = device.launcher.as_deref().and_then(|cmd| cmd.split_first()) else {
            return RawInvocationOutput {
                spawn_error: Some(format!("device {} has no launcher command", device.id)),
                ..Default::default()
            };
        };

        let env = match invocation_env(device, invocation) {
            Ok(env) => env,
            Err(e) => {
                return RawInvocationOutput {
                    spawn_error: Some(format!("cannot encode arguments: {}", e)),
                    ..Default::default()
                }
            }
        };

        let start = Instant::now();
        let child = Command::new(program)
            .args(args)
            .envs(env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn();
        let child = match child {
            Ok(child) => child,
            Err(e) => {
                warn!(program = %program, error = %e, "launcher failed to start");
                return RawInvocationOutput {
                    spawn_error: Some(format!("{}: {}", program, e)),
                    ..Default::default()
                };
            }
        };

        // dropping the wait future drops the child, which kills it
        let waited = tokio::time::timeout(self.invocation_timeout, child.wait_with_output()).await;
        let execution_time_ms = start.elapsed().as_millis() as u64;

        match waited {
            Ok(Ok(output)) => {
                debug!(exit_code = ?output.status.code(), execution_ms = execution_time_ms, "launcher finished");
                RawInvocationOutput {
                    stdout: String::from_utf8_lossy(&output.stdout).to_string(),
                    stderr: String::from_utf8_lossy(&output.stderr).to_string(),
                    exit_code: output.status.code(),
                    timed_out: false,
                    spawn_error: None,
                    execution_time_ms,
                }
            }
            Ok(Err(e)) => RawInvocationOutput {
                spawn_error: Some(format!("lost track of launcher: {}", e)),
                execution_time_ms,
                ..Default::default()
            },
            Err(_) => {
                warn!(
                    timeout_ms = self.invocation_timeout.as_millis() as u64,
                    "launcher timed out; killed"
                );
                RawInvocationOutput {
                    timed_out: true,
                    execution_time_ms,
                    ..Default::default()
                }
            }
        }
    }
}

impl TestHost for LauncherEngine {
    fn invoke(&self, device: &Device, invocation: &Invocation) -> impl Future<Output = InvocationResult> + Send {
        async move {
            let output = self.run_launcher(device, invocation).await;
            classify(&output)
        }
    }
}

/// Environment describing one invocation to the launcher
pub fn invocation_env(device: &Device, invocation: &Invocation) -> serde_json::Result<Vec<(String, String)>> {
    let args = general_purpose::STANDARD.encode(serde_json::to_vec(&invocation.args)?);
    Ok(vec![
        ("NANOTEST_ASSEMBLY".to_string(), invocation.method.assembly.clone()),
        ("NANOTEST_CLASS".to_string(), invocation.method.class.clone()),
        ("NANOTEST_METHOD".to_string(), invocation.method.method.clone()),
        ("NANOTEST_ROLE".to_string(), invocation.role.to_string()),
        ("NANOTEST_DEVICE".to_string(), device.id.to_string()),
        ("NANOTEST_ARGS".to_string(), args),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;
    use nanotest_common::types::MethodRef;
    use nanotest_engine::execution::InvocationRole;
    use serde_json::json;

    fn invocation(args: Vec<serde_json::Value>) -> Invocation {
        Invocation {
            role: InvocationRole::Test,
            method: MethodRef {
                assembly: "Firmware.Tests".to_string(),
                class: "Math".to_string(),
                method: "IsPositive".to_string(),
            },
            args,
        }
    }

    #[test]
    fn test_invocation_env() {
        let env = invocation_env(&Device::new("board-1"), &invocation(vec![json!(42), json!("x")])).unwrap();
        let get = |key: &str| env.iter().find(|(k, _)| k == key).map(|(_, v)| v.clone()).unwrap();

        assert_eq!(get("NANOTEST_ASSEMBLY"), "Firmware.Tests");
        assert_eq!(get("NANOTEST_CLASS"), "Math");
        assert_eq!(get("NANOTEST_METHOD"), "IsPositive");
        assert_eq!(get("NANOTEST_ROLE"), "test");
        assert_eq!(get("NANOTEST_DEVICE"), "board-1");

        let decoded = general_purpose::STANDARD.decode(get("NANOTEST_ARGS")).unwrap();
        let args: Vec<serde_json::Value> = serde_json::from_slice(&decoded).unwrap();
        assert_eq!(args, vec![json!(42), json!("x")]);
    }

    #[test]
    fn test_empty_args_encode_as_empty_array() {
        let env = invocation_env(&Device::new("sim"), &invocation(Vec::new())).unwrap();
        let (_, args) = env.iter().find(|(k, _)| k == "NANOTEST_ARGS").unwrap();
        assert_eq!(general_purpose::STANDARD.decode(args).unwrap(), b"[]");
    }

    #[tokio::test]
    async fn test_device_without_launcher_is_an_error() {
        let engine = LauncherEngine::new(Duration::from_secs(1));
        let result = engine.invoke(&Device::new("sim"), &invocation(Vec::new())).await;
        assert_eq!(
            result,
            InvocationResult::Error("failed to start launcher: device sim has no launcher command".to_string())
        );
    }
}
