//! Orchestration engine: discovery and execution of device tests delegated
//! to isolated worker processes over a framed message channel.
//!
//! Parent side: [`discovery::discover`] and
//! [`orchestrator::ExecutionOrchestrator`]. Worker side:
//! [`worker::WorkerHandler`] served by [`supervisor::serve`].

pub mod channel;
pub mod discovery;
pub mod execution;
pub mod grouping;
pub mod manifest;
pub mod orchestrator;
pub mod supervisor;
pub mod worker;
