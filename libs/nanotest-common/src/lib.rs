//! Shared vocabulary of the nanotest host and its workers.
//!
//! Everything that crosses the process boundary lives here so the parent and
//! the worker can never drift: the discovered test model, device handles and
//! selection predicates, the wire protocol, and the settings file.

pub mod config;
pub mod device;
pub mod predicate;
pub mod protocol;
pub mod types;
