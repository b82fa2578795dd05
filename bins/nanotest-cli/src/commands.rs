// CLI commands: discovery, execution and device listing
use anyhow::{Context, Result};
use nanotest_common::config::Settings;
use nanotest_common::device::Device;
use nanotest_common::predicate::PredicateRegistry;
use nanotest_common::protocol::ProjectContext;
use nanotest_common::types::{Diagnostic, OutcomeReport, RunSummary, Severity, TestCollection, TraitFilter};
use nanotest_engine::channel::ChannelConfig;
use nanotest_engine::discovery::{discover, DiscoveryReport};
use nanotest_engine::orchestrator::{ExecutionOrchestrator, OrchestratorOptions};
use nanotest_engine::supervisor::{ProcessLauncher, WorkerCommand};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

const WORKER_BINARY: &str = "nanotest-worker";

/// Worker executable: the configured path, else next to this binary
pub fn resolve_worker_path(settings: &Settings, current_exe: Option<&Path>) -> PathBuf {
    if let Some(path) = &settings.worker_path {
        return path.clone();
    }
    let file_name = format!("{}{}", WORKER_BINARY, std::env::consts::EXE_SUFFIX);
    match current_exe.and_then(Path::parent) {
        Some(dir) => dir.join(file_name),
        None => PathBuf::from(file_name),
    }
}

/// Command used for every worker; the settings travel through its environment
pub fn worker_command(settings: &Settings, debug: bool, current_exe: Option<&Path>) -> WorkerCommand {
    let mut command = WorkerCommand::new(resolve_worker_path(settings, current_exe))
        .env("NANOTEST_INVOCATION_TIMEOUT_MS", settings.invocation_timeout_ms.to_string())
        .env("NANOTEST_CANCEL_GRACE_MS", settings.cancel_grace_ms.to_string())
        .env("NANOTEST_LOG", settings.log_level.clone());
    command.debug = debug;
    command
}

fn launcher(settings: &Settings, debug: bool) -> ProcessLauncher {
    let current_exe = std::env::current_exe().ok();
    let command = worker_command(settings, debug, current_exe.as_deref());
    info!(worker = %command.program.display(), "using worker");
    ProcessLauncher::new(
        command,
        ChannelConfig {
            cancel_grace: settings.cancel_grace(),
        },
    )
}

/// Token cancelled on Ctrl-C
fn cancel_on_interrupt() -> CancellationToken {
    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupted, cancelling");
            on_signal.cancel();
        }
    });
    cancel
}

async fn discover_collection(
    settings: &Settings,
    debug: bool,
    manifests: &[PathBuf],
    filter: TraitFilter,
    cancel: &CancellationToken,
) -> Result<DiscoveryReport> {
    let context = ProjectContext {
        working_dir: Some(std::env::current_dir().context("Failed to read current directory")?),
        filter,
    };
    Ok(discover(&launcher(settings, debug), manifests, &context, cancel).await)
}

fn has_errors(diagnostics: &[Diagnostic]) -> bool {
    diagnostics.iter().any(|d| d.severity == Severity::Error)
}

fn print_diagnostics(diagnostics: &[Diagnostic]) {
    for diagnostic in diagnostics {
        let icon = match diagnostic.severity {
            Severity::Error => "❌",
            Severity::Warning => "⚠️ ",
        };
        eprintln!("{} {}", icon, diagnostic);
    }
}

#[derive(Serialize)]
struct DiscoveryOutput<'a> {
    collection: &'a TestCollection,
    diagnostics: &'a [Diagnostic],
}

/// `nanotest discover`: returns false when any manifest had errors
pub async fn discover_tests(
    settings: &Settings,
    debug: bool,
    manifests: &[PathBuf],
    filter: TraitFilter,
    json: bool,
) -> Result<bool> {
    let cancel = cancel_on_interrupt();
    let report = discover_collection(settings, debug, manifests, filter, &cancel).await?;

    if json {
        let output = DiscoveryOutput {
            collection: &report.collection,
            diagnostics: &report.diagnostics,
        };
        println!("{}", serde_json::to_string_pretty(&output)?);
    } else {
        print_diagnostics(&report.diagnostics);
        for plan in &report.collection.classes {
            println!("📦 {} ({}, {:?})", plan.class, plan.assembly, plan.instancing);
            for test in &plan.tests {
                println!("  • {}", test.description);
            }
        }
        println!(
            "\n✅ {} test(s) in {} class(es) from {} assembly(ies)",
            report.collection.test_count(),
            report.collection.classes.len(),
            report.assemblies
        );
    }

    Ok(!has_errors(&report.diagnostics))
}

/// `nanotest run`: returns false unless every outcome passed or was skipped
pub async fn run_tests(
    settings: &Settings,
    debug: bool,
    manifests: &[PathBuf],
    filter: TraitFilter,
    parallel: bool,
    json: bool,
) -> Result<bool> {
    let cancel = cancel_on_interrupt();
    let report = discover_collection(settings, debug, manifests, filter, &cancel).await?;
    print_diagnostics(&report.diagnostics);

    if report.collection.is_empty() {
        if !json {
            println!("No tests to run.");
        }
        return Ok(!has_errors(&report.diagnostics));
    }
    if settings.devices.is_empty() {
        warn!("no devices configured; every test will be skipped");
    }
    if !json {
        println!(
            "🚀 Running {} test(s) on {} device(s)\n",
            report.collection.test_count(),
            settings.devices.len()
        );
    }

    let orchestrator = ExecutionOrchestrator::new(
        launcher(settings, debug),
        PredicateRegistry::new(),
        OrchestratorOptions {
            parallel_devices: parallel,
            ..Default::default()
        },
    );
    let mut outcomes = orchestrator.execute(report.collection, settings.devices.clone(), cancel.clone());

    let mut summary = RunSummary::default();
    while let Some(outcome) = outcomes.next().await {
        summary.record(&outcome.outcome);
        if json {
            println!("{}", serde_json::to_string(&outcome)?);
        } else {
            println!("{}", format_outcome(&outcome));
        }
    }

    if json {
        println!("{}", serde_json::to_string(&summary)?);
    } else {
        println!("\n{}", format_summary(&summary));
        if cancel.is_cancelled() {
            println!("⚠️  Run was cancelled; unfinished tests have no outcome");
        }
    }

    Ok(summary.is_success() && !has_errors(&report.diagnostics) && !cancel.is_cancelled())
}

/// `nanotest devices`
pub fn list_devices(settings: &Settings, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(&settings.devices)?);
        return Ok(());
    }

    if settings.devices.is_empty() {
        println!("No devices configured.");
        println!("\n💡 Add devices to the \"devices\" array of nanotest.json");
        return Ok(());
    }

    println!("📋 Configured Devices:\n");
    println!("{:<20} {:<8} {:<30} {}", "ID", "KIND", "DEPLOYMENT", "LAUNCHER");
    println!("{}", "─".repeat(90));
    for device in &settings.devices {
        println!("{}", format_device(device));
    }
    println!("\n✅ Total: {} device(s)", settings.devices.len());
    Ok(())
}

pub fn format_device(device: &Device) -> String {
    let kind = if device.is_remote() { "remote" } else { "local" };
    let deployment = device
        .deployment
        .iter()
        .map(|(key, value)| format!("{}={}", key, value))
        .collect::<Vec<_>>()
        .join(",");
    let launcher = device
        .launcher
        .as_ref()
        .map(|command| command.join(" "))
        .unwrap_or_else(|| "-".to_string());
    format!("{:<20} {:<8} {:<30} {}", device.id, kind, deployment, launcher)
}

pub fn format_outcome(report: &OutcomeReport) -> String {
    let icon = if report.outcome.is_passed() {
        "✅"
    } else if report.outcome.is_skipped() {
        "⏭️ "
    } else {
        "❌"
    };
    let device = report
        .device
        .as_ref()
        .map(|d| d.to_string())
        .unwrap_or_else(|| "-".to_string());
    format!(
        "{} {} on {} - {} ({}ms)",
        icon, report.test, device, report.outcome, report.duration_ms
    )
}

pub fn format_summary(summary: &RunSummary) -> String {
    let mut parts = vec![
        format!("{} passed", summary.passed),
        format!("{} failed", summary.failed),
    ];
    let extra = [
        (summary.setup_failed, "setup failed"),
        (summary.cleanup_failed, "cleanup failed"),
        (summary.skipped, "skipped"),
        (summary.predicate_errors, "predicate errors"),
        (summary.worker_crashes, "worker crashes"),
    ];
    parts.extend(
        extra
            .iter()
            .filter(|(count, _)| *count > 0)
            .map(|(count, label)| format!("{} {}", count, label)),
    );
    let icon = if summary.is_success() { "✅" } else { "❌" };
    format!("{} {} total: {}", icon, summary.total(), parts.join(", "))
}
