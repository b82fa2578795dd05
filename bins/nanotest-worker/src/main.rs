mod config;
mod engine;
mod evaluator;

#[cfg(test)]
mod engine_tests;

use anyhow::{Context, Result};
use clap::Parser;
use config::WorkerConfig;
use engine::LauncherEngine;
use nanotest_common::predicate::PredicateRegistry;
use nanotest_engine::channel::{ChannelConfig, MessageChannel};
use nanotest_engine::supervisor::serve;
use nanotest_engine::worker::WorkerHandler;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// How long a `debug` worker waits for a debugger to attach
const DEBUGGER_WAIT: Duration = Duration::from_secs(60);

/// Out-of-process discovery and execution worker.
///
/// Started by the nanotest runner; speaks the framed message protocol over
/// the given streams until told to shut down.
#[derive(Parser, Debug)]
#[command(name = "nanotest-worker", version)]
struct WorkerArgs {
    /// Stream to read messages from: `stdin` or a path (e.g. a named pipe)
    input: String,

    /// Stream to write messages to: `stdout` or a path
    output: String,

    /// Session identifier announced in the handshake
    session: String,

    /// Pass `debug` to wait for a debugger before processing
    #[arg(value_parser = ["debug"])]
    mode: Option<String>,
}

impl WorkerArgs {
    fn debug(&self) -> bool {
        self.mode.is_some()
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = WorkerArgs::parse();
    let config = WorkerConfig::from_env().context("invalid worker environment")?;

    // stdout may carry the protocol, so logs always go to stderr
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_filter)),
        )
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .with_target(false)
        .init();

    info!(
        session = %args.session,
        input = %args.input,
        output = %args.output,
        invocation_timeout_ms = config.invocation_timeout.as_millis() as u64,
        "nanotest worker booting"
    );

    if args.debug() {
        wait_for_debugger(DEBUGGER_WAIT).await;
    }

    let reader = open_input(&args.input).await?;
    let writer = open_output(&args.output).await?;
    let (channel, mut inbound) = MessageChannel::new(
        reader,
        writer,
        ChannelConfig {
            cancel_grace: config.cancel_grace,
        },
    );

    let parent = channel
        .handshake(&mut inbound, &args.session)
        .await
        .context("handshake with parent failed")?;
    debug!(parent_session = %parent.session, "connected to parent");

    let engine = Arc::new(LauncherEngine::new(config.invocation_timeout));
    let handler = Arc::new(WorkerHandler::new(engine, PredicateRegistry::new()));

    let shutdown = CancellationToken::new();
    let on_signal = shutdown.clone();
    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            warn!("received interrupt, cancelling in-flight requests");
            on_signal.cancel();
        }
    });

    serve(channel.clone(), inbound, handler, shutdown).await;
    channel.close().await;

    info!("worker shutdown complete");
    Ok(())
}

async fn open_input(input: &str) -> Result<Box<dyn AsyncRead + Send + Unpin>> {
    if input == "stdin" {
        return Ok(Box::new(tokio::io::stdin()));
    }
    let path = PathBuf::from(input);
    let file = tokio::fs::File::open(&path)
        .await
        .with_context(|| format!("failed to open input stream {}", path.display()))?;
    Ok(Box::new(file))
}

async fn open_output(output: &str) -> Result<Box<dyn AsyncWrite + Send + Unpin>> {
    if output == "stdout" {
        return Ok(Box::new(tokio::io::stdout()));
    }
    let path = PathBuf::from(output);
    let file = tokio::fs::OpenOptions::new()
        .write(true)
        .open(&path)
        .await
        .with_context(|| format!("failed to open output stream {}", path.display()))?;
    Ok(Box::new(file))
}

/// Block until a tracer attaches or `limit` passes
async fn wait_for_debugger(limit: Duration) {
    info!(pid = std::process::id(), wait_secs = limit.as_secs(), "waiting for debugger to attach");
    let deadline = tokio::time::Instant::now() + limit;

    while tokio::time::Instant::now() < deadline {
        if debugger_attached().await {
            info!("debugger attached");
            return;
        }
        tokio::time::sleep(Duration::from_millis(250)).await;
    }
    warn!("no debugger attached, continuing");
}

/// Linux reports the tracer in /proc; elsewhere we cannot tell
async fn debugger_attached() -> bool {
    match tokio::fs::read_to_string("/proc/self/status").await {
        Ok(status) => tracer_pid(&status).is_some_and(|pid| pid != 0),
        Err(_) => false,
    }
}

fn tracer_pid(status: &str) -> Option<u32> {
    status
        .lines()
        .find_map(|line| line.strip_prefix("TracerPid:"))
        .and_then(|pid| pid.trim().parse().ok())
}
