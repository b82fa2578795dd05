/// Discovery Orchestrator
///
/// **Core Responsibility:**
/// Hand a set of manifests to a fresh worker, merge the per-assembly results
/// it streams back, and always return whatever was found.
///
/// **Partial Results:**
/// If the worker fails, crashes or the run is cancelled, assemblies already
/// reported are kept and every assembly that was not reported gets a
/// diagnostic explaining why.
use nanotest_common::protocol::{DiscoverRequest, MessageBody, ProjectContext};
use nanotest_common::types::{Diagnostic, TestCollection};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::channel::{RequestEvent, RequestOutcome};
use crate::supervisor::WorkerLauncher;

#[derive(Debug, Clone, Default)]
pub struct DiscoveryReport {
    pub collection: TestCollection,
    pub diagnostics: Vec<Diagnostic>,
    /// Assemblies the worker reported on
    pub assemblies: usize,
}

#[instrument(skip_all, fields(assemblies = paths.len()))]
pub async fn discover<L: WorkerLauncher>(
    launcher: &L,
    paths: &[PathBuf],
    context: &ProjectContext,
    cancel: &CancellationToken,
) -> DiscoveryReport {
    let mut report = DiscoveryReport::default();
    if paths.is_empty() {
        return report;
    }

    let worker = match launcher.launch("discovery").await {
        Ok(worker) => worker,
        Err(e) => {
            warn!(error = %e, "could not start discovery worker");
            report.diagnostics = unreported(paths, 0, &format!("discovery worker failed to start: {}", e));
            return report;
        }
    };

    let request = MessageBody::Discover(DiscoverRequest {
        assemblies: paths.to_vec(),
        context: context.clone(),
    });
    let mut pending = match worker.channel().start_request(request).await {
        Ok(pending) => pending,
        Err(e) => {
            report.diagnostics = unreported(paths, 0, &format!("discovery request not delivered: {}", e));
            worker.shutdown().await;
            return report;
        }
    };

    let failure = loop {
        match pending.next_event(cancel).await {
            RequestEvent::Progress(MessageBody::DiscoveryProgress(assembly)) => {
                debug!(
                    assembly = %assembly.assembly,
                    tests = assembly.collection.test_count(),
                    diagnostics = assembly.diagnostics.len(),
                    "assembly discovered"
                );
                report.assemblies += 1;
                report.collection.merge(assembly.collection);
                report.diagnostics.extend(assembly.diagnostics);
            }
            RequestEvent::Progress(other) => debug!(kind = other.kind(), "unexpected discovery progress"),
            RequestEvent::Finished(RequestOutcome::Response(MessageBody::DiscoveryComplete(summary))) => {
                debug!(assemblies = summary.assemblies, tests = summary.tests, "worker finished discovery");
                break None;
            }
            RequestEvent::Finished(RequestOutcome::Response(MessageBody::Failure(failure))) => {
                break Some(format!("discovery worker failed: {}", failure.message))
            }
            RequestEvent::Finished(RequestOutcome::Response(other)) => {
                break Some(format!("unexpected discovery reply {}", other.kind()))
            }
            RequestEvent::Finished(RequestOutcome::Cancelled) => {
                break Some("discovery cancelled".to_string())
            }
            RequestEvent::Finished(RequestOutcome::ChannelClosed) => {
                break Some("discovery worker exited unexpectedly".to_string())
            }
            RequestEvent::Finished(RequestOutcome::ProtocolError(reason)) => {
                break Some(format!("protocol error during discovery: {}", reason))
            }
        }
    };
    drop(pending);

    if let Some(reason) = failure {
        warn!(%reason, reported = report.assemblies, "discovery incomplete");
        report.diagnostics.extend(unreported(paths, report.assemblies, &reason));
    }
    worker.shutdown().await;

    info!(
        assemblies = report.assemblies,
        classes = report.collection.classes.len(),
        tests = report.collection.test_count(),
        diagnostics = report.diagnostics.len(),
        "discovery finished"
    );
    report
}

/// Assemblies are reported in request order, so everything from `reported`
/// on is missing
fn unreported(paths: &[PathBuf], reported: usize, reason: &str) -> Vec<Diagnostic> {
    paths
        .iter()
        .skip(reported)
        .map(|path| Diagnostic::error(path.display().to_string(), None, reason))
        .collect()
}
