use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Deployment key holding the device's target name (board/firmware flavour).
pub const TARGET_KEY: &str = "target";

/// Stable identity of a device
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(pub String);

impl DeviceId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeviceId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Opaque capability handle for a test target.
///
/// The orchestration engine only ever reads the identity; selection and
/// equivalence decisions go through a test's predicate, and running code on
/// the device goes through the worker's test host (which is the only place
/// that interprets `launcher`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    pub id: DeviceId,
    /// Remote (real hardware) vs local (virtual device)
    #[serde(default)]
    pub remote: bool,
    #[serde(default)]
    pub deployment: BTreeMap<String, String>,
    /// Command used to run a single method invocation on this device
    #[serde(default)]
    pub launcher: Option<Vec<String>>,
}

impl Device {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: DeviceId(id.into()),
            remote: false,
            deployment: BTreeMap::new(),
            launcher: None,
        }
    }

    pub fn remote(mut self) -> Self {
        self.remote = true;
        self
    }

    pub fn with_value(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.deployment.insert(key.into(), value.into());
        self
    }

    pub fn with_launcher<I, S>(mut self, command: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.launcher = Some(command.into_iter().map(Into::into).collect());
        self
    }

    pub fn id(&self) -> &DeviceId {
        &self.id
    }

    pub fn is_remote(&self) -> bool {
        self.remote
    }

    /// Look up a deployment configuration value
    pub fn deployment_value(&self, key: &str) -> Option<&str> {
        self.deployment.get(key).map(String::as_str)
    }
}
