//! Core domain types for droidci.
//!
//! This crate provides the fundamental types shared across the droidci
//! workspace: test targets and kinds, failed-test identifiers, ignore lists,
//! run outcomes, verdicts and the event records written to the audit log.

use std::collections::BTreeSet;
use std::fmt;
use std::path::{Component, Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use droidci_retry::RetryStrategyConfig;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Set of failed tests. Duplicates collapse and iteration order is stable.
pub type FailureSet = BTreeSet<FailedTestId>;

/// Errors produced when parsing or validating domain values.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TypeError {
    #[error("test target must not be empty")]
    EmptyTarget,
    #[error("invalid test target {0:?}: must be a module name without whitespace, ':' or path separators")]
    InvalidTarget(String),
    #[error("invalid test id {0:?}: expected <class>#<method>")]
    InvalidTestId(String),
    #[error("unknown test kind {0:?}: expected unit or integration")]
    UnknownKind(String),
}

/// A named group of tests to execute (a build module).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TestTarget(String);

impl TestTarget {
    pub fn new(name: impl Into<String>) -> Result<Self, TypeError> {
        let name = name.into();
        if name.is_empty() {
            return Err(TypeError::EmptyTarget);
        }
        if name
            .chars()
            .any(|c| c.is_whitespace() || c == ':' || c == '/' || c == '\\')
        {
            return Err(TypeError::InvalidTarget(name));
        }
        // The name is joined onto the project and results dirs, so it must be
        // exactly one plain path component.
        let mut components = Path::new(&name).components();
        if !matches!(
            (components.next(), components.next()),
            (Some(Component::Normal(_)), None)
        ) {
            return Err(TypeError::InvalidTarget(name));
        }
        Ok(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TestTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for TestTarget {
    type Err = TypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for TestTarget {
    type Error = TypeError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<TestTarget> for String {
    fn from(value: TestTarget) -> Self {
        value.0
    }
}

/// How a single failing test is selected on the build tool command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TestFilterStyle {
    /// Instrumentation runner argument used by on-device tests.
    InstrumentationClass,
}

impl TestFilterStyle {
    /// Command line arguments that restrict a run to `test`.
    pub fn args(&self, test: &FailedTestId) -> Vec<String> {
        match self {
            TestFilterStyle::InstrumentationClass => vec![format!(
                "-Pandroid.testInstrumentationRunnerArguments.class={}#{}",
                test.class, test.method
            )],
        }
    }
}

/// Per-kind data: how to run the suite and whether retries apply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KindProfile {
    /// Human readable label used in logs and summaries.
    pub label: &'static str,
    /// Build tool task name, run as `:<target>:<task>`.
    pub task: &'static str,
    /// Report directory relative to the module directory.
    pub report_dir: &'static str,
    /// How individual tests are selected for per-test retries. Kinds
    /// without one are never retried.
    pub retry_filter: Option<TestFilterStyle>,
}


const UNIT_PROFILE: KindProfile = KindProfile {
    label: "unit tests",
    task: "testDebugUnitTest",
    report_dir: "build/reports/tests/testDebugUnitTest",
    retry_filter: None,
};

const INTEGRATION_PROFILE: KindProfile = KindProfile {
    label: "integration tests",
    task: "connectedAndroidTest",
    report_dir: "build/reports/androidTests/connected",
    retry_filter: Some(TestFilterStyle::InstrumentationClass),
};

/// Kind of test suite to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestKind {
    #[default]
    Unit,
    Integration,
}

impl TestKind {
    pub fn profile(&self) -> &'static KindProfile {
        match self {
            TestKind::Unit => &UNIT_PROFILE,
            TestKind::Integration => &INTEGRATION_PROFILE,
        }
    }
}

impl fmt::Display for TestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TestKind::Unit => write!(f, "unit"),
            TestKind::Integration => write!(f, "integration"),
        }
    }
}

impl FromStr for TestKind {
    type Err = TypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "unit" | "unit_test" | "unittest" => Ok(TestKind::Unit),
            "integration" | "integration_test" | "integrationtest" => Ok(TestKind::Integration),
            other => Err(TypeError::UnknownKind(other.to_string())),
        }
    }
}

/// Fully qualified identifier of one failing test case, rendered `<class>#<method>`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct FailedTestId {
    pub class: String,
    pub method: String,
}

impl FailedTestId {
    pub fn new(class: impl Into<String>, method: impl Into<String>) -> Self {
        Self {
            class: class.into(),
            method: method.into(),
        }
    }
}

impl fmt::Display for FailedTestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.class, self.method)
    }
}

impl FromStr for FailedTestId {
    type Err = TypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        match trimmed.split_once('#') {
            Some((class, method)) if !class.is_empty() && !method.is_empty() => {
                Ok(Self::new(class, method))
            }
            _ => Err(TypeError::InvalidTestId(s.to_string())),
        }
    }
}

impl TryFrom<String> for FailedTestId {
    type Error = TypeError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<FailedTestId> for String {
    fn from(value: FailedTestId) -> Self {
        value.to_string()
    }
}

/// Caller-supplied failures that are acceptable for a target.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IgnoreList {
    tests: BTreeSet<FailedTestId>,
}

impl IgnoreList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse one id per line. Blank lines and `#`-prefixed comments are skipped.
    pub fn parse_lines(content: &str) -> Result<Self, TypeError> {
        let mut list = Self::new();
        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            list.insert(line.parse()?);
        }
        Ok(list)
    }

    pub fn insert(&mut self, test: FailedTestId) -> bool {
        self.tests.insert(test)
    }

    pub fn contains(&self, test: &FailedTestId) -> bool {
        self.tests.contains(test)
    }

    /// True when every failure in `failures` is ignored.
    pub fn covers(&self, failures: &FailureSet) -> bool {
        failures.is_subset(&self.tests)
    }

    /// Failures not covered by this list.
    pub fn uncovered(&self, failures: &FailureSet) -> FailureSet {
        failures.difference(&self.tests).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.tests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tests.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &FailedTestId> {
        self.tests.iter()
    }
}

impl FromIterator<FailedTestId> for IgnoreList {
    fn from_iter<I: IntoIterator<Item = FailedTestId>>(iter: I) -> Self {
        Self {
            tests: iter.into_iter().collect(),
        }
    }
}

impl Extend<FailedTestId> for IgnoreList {
    fn extend<I: IntoIterator<Item = FailedTestId>>(&mut self, iter: I) {
        self.tests.extend(iter);
    }
}

/// All runtime knobs for a reconciliation, after config and CLI merging.
#[derive(Debug, Clone)]
pub struct RuntimeOptions {
    /// Root of the build (where the build tool wrapper lives).
    pub project_dir: PathBuf,
    /// Build tool program, e.g. `./gradlew`.
    pub program: String,
    /// Extra arguments passed to every build tool invocation.
    pub build_args: Vec<String>,
    /// Report artifacts are collected under `<results_dir>/<target>`.
    pub results_dir: PathBuf,
    /// Build status and event log live here.
    pub state_dir: PathBuf,
    pub suite_retry: RetryStrategyConfig,
    pub test_retry: RetryStrategyConfig,
    /// Wait before each test's retry sequence begins.
    pub test_settle_delay: Duration,
    pub poll_interval: Duration,
    /// Heartbeat every N polling cycles (0 disables).
    pub heartbeat_every: u32,
    /// Per-invocation timeout for the build tool.
    pub timeout: Option<Duration>,
}

impl RuntimeOptions {
    /// Defaults for a project rooted at `project_dir`.
    pub fn for_project(project_dir: impl Into<PathBuf>) -> Self {
        Self {
            project_dir: project_dir.into(),
            program: "./gradlew".to_string(),
            build_args: Vec::new(),
            results_dir: PathBuf::from("test-results"),
            state_dir: PathBuf::from(".droidci"),
            suite_retry: RetryStrategyConfig::suite(),
            test_retry: RetryStrategyConfig::per_test(),
            test_settle_delay: Duration::from_secs(10),
            poll_interval: Duration::from_secs(10),
            heartbeat_every: 30,
            timeout: None,
        }
    }

    /// `results_dir` anchored at the project directory when relative.
    pub fn resolved_results_dir(&self) -> PathBuf {
        resolve_dir(&self.project_dir, &self.results_dir)
    }

    /// `state_dir` anchored at the project directory when relative.
    pub fn resolved_state_dir(&self) -> PathBuf {
        resolve_dir(&self.project_dir, &self.state_dir)
    }
}

fn resolve_dir(root: &std::path::Path, dir: &std::path::Path) -> PathBuf {
    if dir.is_absolute() {
        dir.to_path_buf()
    } else {
        root.join(dir)
    }
}

/// Exit status of one execution attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RunStatus {
    Passed,
    Failed { exit_code: Option<i32> },
    TimedOut,
}

impl RunStatus {
    pub fn success(&self) -> bool {
        matches!(self, RunStatus::Passed)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunStatus::Passed => write!(f, "passed"),
            RunStatus::Failed {
                exit_code: Some(code),
            } => write!(f, "failed (exit={code})"),
            RunStatus::Failed { exit_code: None } => write!(f, "failed (killed by signal)"),
            RunStatus::TimedOut => write!(f, "timed out"),
        }
    }
}

/// Result of one full-suite execution attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestRunOutcome {
    pub status: RunStatus,
    /// Report produced by the build tool for this run (may not exist).
    pub report_path: PathBuf,
    pub duration_ms: u64,
}

/// Which stage of the policy an execution attempt belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunPhase {
    Initial,
    SuiteRetry,
    TestRetry,
}

impl fmt::Display for RunPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunPhase::Initial => write!(f, "initial"),
            RunPhase::SuiteRetry => write!(f, "suite retry"),
            RunPhase::TestRetry => write!(f, "test retry"),
        }
    }
}

/// Final outcome of a reconciliation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum Verdict {
    Success,
    /// Residual failures not covered by the ignore list. Empty when the
    /// failure could not be attributed to specific tests.
    Failure { residual: FailureSet },
}

impl Verdict {
    pub fn is_success(&self) -> bool {
        matches!(self, Verdict::Success)
    }

    pub fn residual(&self) -> Option<&FailureSet> {
        match self {
            Verdict::Success => None,
            Verdict::Failure { residual } => Some(residual),
        }
    }
}

/// Why a verdict was reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerdictReason {
    /// The initial run passed.
    Passed,
    /// A whole-suite retry passed.
    PassedOnSuiteRetry,
    /// Every failing test passed when retried on its own.
    ResolvedByTestRetry,
    /// Remaining failures are all on the ignore list.
    Ignored,
    /// Unit tests failed; no retry policy applies.
    UnitTestFailed,
    /// The suite failed but no failing tests could be identified.
    Undiagnosable,
    /// Specific tests kept failing and are not ignored.
    Unresolved,
}

impl fmt::Display for VerdictReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            VerdictReason::Passed => "passed",
            VerdictReason::PassedOnSuiteRetry => "passed on suite retry",
            VerdictReason::ResolvedByTestRetry => "resolved by per-test retry",
            VerdictReason::Ignored => "remaining failures ignored",
            VerdictReason::UnitTestFailed => "unit tests failed",
            VerdictReason::Undiagnosable => "undiagnosable failure",
            VerdictReason::Unresolved => "unresolved failures",
        };
        f.write_str(s)
    }
}

/// An entry in the reconciliation event log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcileEvent {
    pub timestamp: DateTime<Utc>,
    pub target: String,
    #[serde(flatten)]
    pub event_type: EventType,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventType {
    ReconcileStarted {
        kind: TestKind,
        ignored: usize,
    },
    RunStarted {
        phase: RunPhase,
        attempt: u32,
        command: String,
    },
    RunFinished {
        phase: RunPhase,
        attempt: u32,
        status: RunStatus,
        duration_ms: u64,
    },
    ArtifactsCollected {
        destination: PathBuf,
    },
    ReportParsed {
        failures: Vec<FailedTestId>,
    },
    ReportUnreadable {
        message: String,
    },
    TestResolved {
        test: FailedTestId,
        attempts: u32,
    },
    TestUnresolved {
        test: FailedTestId,
        attempts: u32,
    },
    VerdictReached {
        verdict: Verdict,
        reason: VerdictReason,
    },
}
