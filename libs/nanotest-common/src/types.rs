use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

use crate::device::DeviceId;
use crate::predicate::SelectionPredicate;

/// Identity of a test case: (class, method, data-row index)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TestCaseId {
    pub class: String,
    pub method: String,
    /// Index of the data row, `None` for the implicit empty-argument invocation
    #[serde(default)]
    pub row: Option<u32>,
}

impl TestCaseId {
    pub fn new(class: impl Into<String>, method: impl Into<String>, row: Option<u32>) -> Self {
        Self {
            class: class.into(),
            method: method.into(),
            row,
        }
    }
}

impl fmt::Display for TestCaseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.row {
            Some(row) => write!(f, "{}.{}[{}]", self.class, self.method, row),
            None => write!(f, "{}.{}", self.class, self.method),
        }
    }
}

/// Reference to a method of a test class (setup, cleanup or test body)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MethodRef {
    pub assembly: String,
    pub class: String,
    pub method: String,
}

impl fmt::Display for MethodRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.class, self.method)
    }
}

/// Class contract for instance lifetime
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Instancing {
    /// Fresh instance per test method: setup and cleanup wrap every test
    #[default]
    PerMethod,
    /// One instance for the whole class: setup once, cleanup once
    Shared,
}

/// One executable unit, immutable once discovered
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestCase {
    pub id: TestCaseId,
    pub assembly: String,
    /// Literal arguments of the data row (empty for the implicit invocation)
    #[serde(default)]
    pub args: Vec<serde_json::Value>,
    #[serde(default)]
    pub predicate: SelectionPredicate,
    pub description: String,
    #[serde(default)]
    pub traits: BTreeSet<String>,
}

impl TestCase {
    pub fn method_ref(&self) -> MethodRef {
        MethodRef {
            assembly: self.assembly.clone(),
            class: self.id.class.clone(),
            method: self.id.method.clone(),
        }
    }
}

/// Test cases of one class together with their setup/cleanup chain
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassTestPlan {
    pub assembly: String,
    pub class: String,
    #[serde(default)]
    pub setup: Vec<MethodRef>,
    #[serde(default)]
    pub cleanup: Vec<MethodRef>,
    #[serde(default)]
    pub instancing: Instancing,
    /// Test cases in declaration order
    #[serde(default)]
    pub tests: Vec<TestCase>,
}

impl ClassTestPlan {
    /// Same class contract, different set of test cases
    pub fn with_tests(&self, tests: Vec<TestCase>) -> Self {
        Self {
            assembly: self.assembly.clone(),
            class: self.class.clone(),
            setup: self.setup.clone(),
            cleanup: self.cleanup.clone(),
            instancing: self.instancing,
            tests,
        }
    }
}

/// Result of a discovery pass: class plans in discovery order
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TestCollection {
    pub classes: Vec<ClassTestPlan>,
}

impl TestCollection {
    pub fn new() -> Self {
        Self::default()
    }

    /// Additive merge; plans from `other` are appended in order
    pub fn merge(&mut self, other: TestCollection) {
        self.classes.extend(other.classes);
    }

    pub fn test_count(&self) -> usize {
        self.classes.iter().map(|plan| plan.tests.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.test_count() == 0
    }

    pub fn tests(&self) -> impl Iterator<Item = &TestCase> {
        self.classes.iter().flat_map(|plan| plan.tests.iter())
    }

    /// Keep only the tests the filter accepts; classes left empty are dropped
    pub fn filtered(self, filter: &TraitFilter) -> TestCollection {
        if filter.is_empty() {
            return self;
        }
        let classes = self
            .classes
            .into_iter()
            .filter_map(|plan| {
                let tests: Vec<TestCase> = plan
                    .tests
                    .iter()
                    .filter(|test| filter.matches(test))
                    .cloned()
                    .collect();
                if tests.is_empty() {
                    None
                } else {
                    Some(plan.with_tests(tests))
                }
            })
            .collect();
        TestCollection { classes }
    }
}

/// Include/exclude filter over trait tags
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TraitFilter {
    /// When non-empty, a test must carry at least one of these traits
    #[serde(default)]
    pub include: BTreeSet<String>,
    /// A test carrying any of these traits is dropped
    #[serde(default)]
    pub exclude: BTreeSet<String>,
}

impl TraitFilter {
    pub fn is_empty(&self) -> bool {
        self.include.is_empty() && self.exclude.is_empty()
    }

    pub fn matches(&self, test: &TestCase) -> bool {
        if test.traits.iter().any(|t| self.exclude.contains(t)) {
            return false;
        }
        self.include.is_empty() || test.traits.iter().any(|t| self.include.contains(t))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Warning,
    Error,
}

/// Problem found while reflecting an assembly. Never blocks the rest of
/// discovery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub severity: Severity,
    pub assembly: String,
    /// `Class` or `Class.Method` the diagnostic is about
    #[serde(default)]
    pub location: Option<String>,
    pub message: String,
}

impl Diagnostic {
    pub fn error(assembly: impl Into<String>, location: Option<String>, message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Error,
            assembly: assembly.into(),
            location,
            message: message.into(),
        }
    }

    pub fn warning(assembly: impl Into<String>, location: Option<String>, message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Warning,
            assembly: assembly.into(),
            location,
            message: message.into(),
        }
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let level = match self.severity {
            Severity::Warning => "warning",
            Severity::Error => "error",
        };
        match &self.location {
            Some(location) => write!(f, "{}: {} ({}): {}", level, self.assembly, location, self.message),
            None => write!(f, "{}: {}: {}", level, self.assembly, self.message),
        }
    }
}

/// Terminal result of one test case on one device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "detail", rename_all = "snake_case")]
pub enum Outcome {
    Passed,
    Failed(String),
    SetupFailed(String),
    CleanupFailed(String),
    SkippedNoDevice,
    SkippedRedundant(DeviceId),
    SelectionPredicateError(String),
    WorkerCrashed(String),
}

impl Outcome {
    pub fn is_passed(&self) -> bool {
        matches!(self, Outcome::Passed)
    }

    pub fn is_skipped(&self) -> bool {
        matches!(self, Outcome::SkippedNoDevice | Outcome::SkippedRedundant(_))
    }

    pub fn label(&self) -> &'static str {
        match self {
            Outcome::Passed => "passed",
            Outcome::Failed(_) => "failed",
            Outcome::SetupFailed(_) => "setup failed",
            Outcome::CleanupFailed(_) => "cleanup failed",
            Outcome::SkippedNoDevice => "skipped (no device)",
            Outcome::SkippedRedundant(_) => "skipped (redundant)",
            Outcome::SelectionPredicateError(_) => "predicate error",
            Outcome::WorkerCrashed(_) => "worker crashed",
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Failed(reason)
            | Outcome::SetupFailed(reason)
            | Outcome::CleanupFailed(reason)
            | Outcome::SelectionPredicateError(reason)
            | Outcome::WorkerCrashed(reason) => write!(f, "{}: {}", self.label(), reason),
            Outcome::SkippedRedundant(representative) => {
                write!(f, "{} with {}", self.label(), representative)
            }
            Outcome::Passed | Outcome::SkippedNoDevice => f.write_str(self.label()),
        }
    }
}

/// Outcome as reported upward: exactly one per scheduled (test, device) pair
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutcomeReport {
    pub test: TestCaseId,
    /// `None` only for `SkippedNoDevice`
    pub device: Option<DeviceId>,
    pub outcome: Outcome,
    #[serde(default)]
    pub duration_ms: u64,
    pub finished_at: DateTime<Utc>,
}

impl OutcomeReport {
    pub fn new(test: TestCaseId, device: Option<DeviceId>, outcome: Outcome) -> Self {
        Self {
            test,
            device,
            outcome,
            duration_ms: 0,
            finished_at: Utc::now(),
        }
    }

    pub fn with_duration_ms(mut self, duration_ms: u64) -> Self {
        self.duration_ms = duration_ms;
        self
    }
}

/// Outcome counts of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RunSummary {
    pub passed: usize,
    pub failed: usize,
    pub setup_failed: usize,
    pub cleanup_failed: usize,
    pub skipped: usize,
    pub predicate_errors: usize,
    pub worker_crashes: usize,
}

impl RunSummary {
    pub fn record(&mut self, outcome: &Outcome) {
        match outcome {
            Outcome::Passed => self.passed += 1,
            Outcome::Failed(_) => self.failed += 1,
            Outcome::SetupFailed(_) => self.setup_failed += 1,
            Outcome::CleanupFailed(_) => self.cleanup_failed += 1,
            Outcome::SkippedNoDevice | Outcome::SkippedRedundant(_) => self.skipped += 1,
            Outcome::SelectionPredicateError(_) => self.predicate_errors += 1,
            Outcome::WorkerCrashed(_) => self.worker_crashes += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.passed
            + self.failed
            + self.setup_failed
            + self.cleanup_failed
            + self.skipped
            + self.predicate_errors
            + self.worker_crashes
    }

    /// Nothing other than passes and skips
    pub fn is_success(&self) -> bool {
        self.passed + self.skipped == self.total()
    }
}
