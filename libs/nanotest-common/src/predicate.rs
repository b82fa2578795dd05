//! Device-selection predicates.
//!
//! A test carries a serialisable [`SelectionPredicate`] reference. Before any
//! grouping happens the reference is resolved once, through a
//! [`PredicateRegistry`], into a [`ResolvedPredicate`]: a pair of closures
//! `{should_run, are_equivalent}`. Calls into the closures are guarded so a
//! failing or panicking user predicate degrades into a [`PredicateError`].

use serde::{Deserialize, Serialize};
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use crate::device::{Device, TARGET_KEY};

/// Result type returned by user predicate closures
pub type PredicateResult = Result<bool, Box<dyn std::error::Error + Send + Sync>>;

type ShouldRunFn = dyn Fn(&Device) -> PredicateResult + Send + Sync;
type AreEquivalentFn = dyn Fn(&Device, &Device) -> PredicateResult + Send + Sync;
type PredicateFactory = dyn Fn(Option<&str>) -> ResolvedPredicate + Send + Sync;

/// Reference to the predicate a test was declared with
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SelectionPredicate {
    /// Run once, on any one usable device
    #[default]
    AnyDevice,
    /// Only local (virtual) devices; any one of them will do
    VirtualDevice,
    /// Only remote devices; one per distinct target unless `all_devices`
    RealHardware {
        #[serde(default)]
        all_devices: bool,
    },
    /// Devices exposing a deployment value, grouped by that value
    DeploymentValue {
        key: String,
        #[serde(default)]
        value: Option<String>,
    },
    /// User predicate registered under `name`
    Custom {
        name: String,
        #[serde(default)]
        argument: Option<String>,
    },
}

impl fmt::Display for SelectionPredicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SelectionPredicate::AnyDevice => write!(f, "any_device"),
            SelectionPredicate::VirtualDevice => write!(f, "virtual_device"),
            SelectionPredicate::RealHardware { all_devices: false } => write!(f, "real_hardware"),
            SelectionPredicate::RealHardware { all_devices: true } => write!(f, "real_hardware(all)"),
            SelectionPredicate::DeploymentValue { key, value: None } => {
                write!(f, "deployment_value({})", key)
            }
            SelectionPredicate::DeploymentValue { key, value: Some(value) } => {
                write!(f, "deployment_value({}={})", key, value)
            }
            SelectionPredicate::Custom { name, argument: None } => write!(f, "{}", name),
            SelectionPredicate::Custom { name, argument: Some(arg) } => write!(f, "{}({})", name, arg),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
pub enum PredicateError {
    #[error("predicate '{predicate}' failed: {message}")]
    Failed { predicate: String, message: String },

    #[error("predicate '{predicate}' panicked: {message}")]
    Panicked { predicate: String, message: String },
}

/// A predicate reference resolved into its `{should_run, are_equivalent}` pair
#[derive(Clone)]
pub struct ResolvedPredicate {
    label: String,
    should_run: Arc<ShouldRunFn>,
    are_equivalent: Arc<AreEquivalentFn>,
}

impl fmt::Debug for ResolvedPredicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResolvedPredicate")
            .field("label", &self.label)
            .finish_non_exhaustive()
    }
}

impl ResolvedPredicate {
    pub fn new<S, E>(label: impl Into<String>, should_run: S, are_equivalent: E) -> Self
    where
        S: Fn(&Device) -> PredicateResult + Send + Sync + 'static,
        E: Fn(&Device, &Device) -> PredicateResult + Send + Sync + 'static,
    {
        Self {
            label: label.into(),
            should_run: Arc::new(should_run),
            are_equivalent: Arc::new(are_equivalent),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn should_run(&self, device: &Device) -> Result<bool, PredicateError> {
        guarded(&self.label, || (self.should_run)(device))
    }

    pub fn are_equivalent(&self, a: &Device, b: &Device) -> Result<bool, PredicateError> {
        guarded(&self.label, || (self.are_equivalent)(a, b))
    }
}

fn guarded(label: &str, call: impl FnOnce() -> PredicateResult) -> Result<bool, PredicateError> {
    match panic::catch_unwind(AssertUnwindSafe(call)) {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(err)) => Err(PredicateError::Failed {
            predicate: label.to_string(),
            message: err.to_string(),
        }),
        Err(payload) => Err(PredicateError::Panicked {
            predicate: label.to_string(),
            message: panic_message(payload.as_ref()),
        }),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Registry of user predicates, keyed by the name manifests refer to
#[derive(Clone, Default)]
pub struct PredicateRegistry {
    custom: HashMap<String, Arc<PredicateFactory>>,
}

impl PredicateRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a user predicate. The factory receives the reference's
    /// optional argument and returns the closure pair.
    pub fn register<F>(&mut self, name: impl Into<String>, factory: F)
    where
        F: Fn(Option<&str>) -> ResolvedPredicate + Send + Sync + 'static,
    {
        self.custom.insert(name.into(), Arc::new(factory));
    }

    /// Whether the reference can be resolved to something other than the
    /// always-failing placeholder
    pub fn can_resolve(&self, predicate: &SelectionPredicate) -> bool {
        match predicate {
            SelectionPredicate::Custom { name, .. } => self.custom.contains_key(name),
            _ => true,
        }
    }

    pub fn registered_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.custom.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn resolve(&self, predicate: &SelectionPredicate) -> ResolvedPredicate {
        let label = predicate.to_string();
        match predicate {
            SelectionPredicate::AnyDevice => {
                ResolvedPredicate::new(label, |_| Ok(true), |_, _| Ok(true))
            }
            SelectionPredicate::VirtualDevice => {
                ResolvedPredicate::new(label, |d| Ok(!d.is_remote()), |_, _| Ok(true))
            }
            SelectionPredicate::RealHardware { all_devices } => {
                let all_devices = *all_devices;
                ResolvedPredicate::new(
                    label,
                    |d| Ok(d.is_remote()),
                    move |a, b| {
                        if all_devices {
                            Ok(a.id == b.id)
                        } else {
                            Ok(a.deployment_value(TARGET_KEY) == b.deployment_value(TARGET_KEY))
                        }
                    },
                )
            }
            SelectionPredicate::DeploymentValue { key, value } => {
                let run_key = key.clone();
                let wanted = value.clone();
                let eq_key = key.clone();
                ResolvedPredicate::new(
                    label,
                    move |d| {
                        Ok(match (d.deployment_value(&run_key), wanted.as_deref()) {
                            (Some(actual), Some(expected)) => actual == expected,
                            (Some(_), None) => true,
                            (None, _) => false,
                        })
                    },
                    move |a, b| Ok(a.deployment_value(&eq_key) == b.deployment_value(&eq_key)),
                )
            }
            SelectionPredicate::Custom { name, argument } => match self.custom.get(name) {
                Some(factory) => factory(argument.as_deref()),
                None => {
                    let missing = name.clone();
                    let missing_pair = name.clone();
                    ResolvedPredicate::new(
                        label,
                        move |_| Err(format!("no device predicate registered under '{}'", missing).into()),
                        move |_, _| {
                            Err(format!("no device predicate registered under '{}'", missing_pair).into())
                        },
                    )
                }
            },
        }
    }
}
