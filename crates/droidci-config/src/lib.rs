//! Configuration file support for droidci (`.droidci.toml`).
//!
//! The file lives in the project root next to the build tool wrapper. Every
//! section is optional; missing values fall back to the defaults below, and
//! command line flags passed through [`CliOverrides`] take precedence over
//! the file.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use droidci_retry::{RetryStrategyConfig, RetryStrategyType};
use droidci_types::{FailedTestId, IgnoreList, RuntimeOptions, TestTarget};
use serde::{Deserialize, Serialize};

/// Config file name looked up in the project directory.
pub const CONFIG_FILE: &str = ".droidci.toml";

/// Build tool invocation settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildConfig {
    /// Build tool program, relative paths are anchored at the project dir
    #[serde(default = "default_program")]
    pub program: String,
    /// Extra arguments appended to every invocation
    #[serde(default)]
    pub args: Vec<String>,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            program: default_program(),
            args: Vec::new(),
        }
    }
}

/// Output locations
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PathsConfig {
    /// Reports are collected under `<results_dir>/<target>`
    #[serde(default = "default_results_dir")]
    pub results_dir: PathBuf,
    /// Build status and event log directory
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            results_dir: default_results_dir(),
            state_dir: default_state_dir(),
        }
    }
}

/// Per-test retry settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestRetryConfig {
    #[serde(default = "default_test_strategy")]
    pub strategy: RetryStrategyType,
    #[serde(default = "default_attempts")]
    pub max_attempts: u32,
    /// Delay between attempts of the same test (ignored for `immediate`)
    #[serde(default, with = "humantime_serde")]
    pub base_delay: Duration,
    #[serde(default = "default_max_delay", with = "humantime_serde")]
    pub max_delay: Duration,
    #[serde(default)]
    pub jitter: f64,
    /// Wait before each test's retry sequence begins
    #[serde(default = "default_settle_delay", with = "humantime_serde")]
    pub settle_delay: Duration,
}

impl Default for TestRetryConfig {
    fn default() -> Self {
        Self {
            strategy: default_test_strategy(),
            max_attempts: default_attempts(),
            base_delay: Duration::ZERO,
            max_delay: default_max_delay(),
            jitter: 0.0,
            settle_delay: default_settle_delay(),
        }
    }
}

impl TestRetryConfig {
    pub fn to_strategy(&self) -> RetryStrategyConfig {
        RetryStrategyConfig {
            strategy: self.strategy,
            max_attempts: self.max_attempts,
            base_delay: self.base_delay,
            max_delay: self.max_delay,
            jitter: self.jitter,
        }
    }
}

/// Nested retry configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Whole-suite retries when failures cannot be attributed to tests
    #[serde(default = "RetryStrategyConfig::suite")]
    pub suite: RetryStrategyConfig,
    /// Individual retries of each failing test
    #[serde(default)]
    pub test: TestRetryConfig,
}

/// Process supervision settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunnerConfig {
    /// Wait between polls of the running build
    #[serde(default = "default_poll_interval", with = "humantime_serde")]
    pub poll_interval: Duration,
    /// Print a liveness line every N polling cycles (0 disables)
    #[serde(default = "default_heartbeat_every")]
    pub heartbeat_every: u32,
    /// Kill a build invocation that runs longer than this
    #[serde(default, with = "humantime_serde")]
    pub timeout: Option<Duration>,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            poll_interval: default_poll_interval(),
            heartbeat_every: default_heartbeat_every(),
            timeout: None,
        }
    }
}

/// Configuration loaded from .droidci.toml
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DroidciConfig {
    #[serde(default)]
    pub build: BuildConfig,

    #[serde(default)]
    pub paths: PathsConfig,

    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default)]
    pub runner: RunnerConfig,

    /// Accepted failures keyed by target name
    #[serde(default)]
    pub ignore: BTreeMap<String, Vec<FailedTestId>>,
}

/// CLI overrides for merging with config file values.
///
/// `None` means "user did not pass this flag".
#[derive(Debug, Default)]
pub struct CliOverrides {
    pub program: Option<String>,
    pub build_args: Option<Vec<String>>,
    pub results_dir: Option<PathBuf>,
    pub state_dir: Option<PathBuf>,
    pub suite_attempts: Option<u32>,
    pub suite_delay: Option<Duration>,
    pub test_attempts: Option<u32>,
    pub settle_delay: Option<Duration>,
    pub poll_interval: Option<Duration>,
    pub heartbeat_every: Option<u32>,
    pub timeout: Option<Duration>,
}

fn default_program() -> String {
    "./gradlew".to_string()
}

fn default_results_dir() -> PathBuf {
    PathBuf::from("test-results")
}

fn default_state_dir() -> PathBuf {
    PathBuf::from(".droidci")
}

fn default_test_strategy() -> RetryStrategyType {
    RetryStrategyType::Immediate
}

fn default_attempts() -> u32 {
    3
}

fn default_max_delay() -> Duration {
    Duration::from_secs(60)
}

fn default_settle_delay() -> Duration {
    Duration::from_secs(10)
}

fn default_poll_interval() -> Duration {
    Duration::from_secs(10)
}

fn default_heartbeat_every() -> u32 {
    30
}

impl DroidciConfig {
    /// Load `.droidci.toml` from the project directory.
    ///
    /// Returns `Ok(None)` if no config file exists.
    pub fn load_from_project(project_dir: &Path) -> Result<Option<Self>> {
        let config_path = project_dir.join(CONFIG_FILE);
        if !config_path.exists() {
            return Ok(None);
        }
        Self::load_from_file(&config_path).map(Some)
    }

    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: DroidciConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.build.program.trim().is_empty() {
            bail!("build.program cannot be empty");
        }

        if self.retry.suite.max_attempts == 0 {
            bail!("retry.suite.max_attempts must be greater than 0");
        }

        if self.retry.test.max_attempts == 0 {
            bail!("retry.test.max_attempts must be greater than 0");
        }

        if self.retry.suite.max_delay < self.retry.suite.base_delay {
            bail!("retry.suite.max_delay must be greater than or equal to retry.suite.base_delay");
        }

        for (name, jitter) in [
            ("retry.suite.jitter", self.retry.suite.jitter),
            ("retry.test.jitter", self.retry.test.jitter),
        ] {
            if !(0.0..=1.0).contains(&jitter) {
                bail!("{name} must be between 0.0 and 1.0");
            }
        }

        if self.runner.poll_interval.is_zero() {
            bail!("runner.poll_interval must be greater than 0");
        }

        if let Some(timeout) = self.runner.timeout
            && timeout.is_zero()
        {
            bail!("runner.timeout must be greater than 0");
        }

        for target in self.ignore.keys() {
            TestTarget::new(target.as_str())
                .with_context(|| format!("invalid target in [ignore]: {target:?}"))?;
        }

        Ok(())
    }

    /// Ignore list configured for `target` (empty if none).
    pub fn ignore_list_for(&self, target: &TestTarget) -> IgnoreList {
        self.ignore
            .get(target.as_str())
            .map(|tests| tests.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Build `RuntimeOptions` by merging CLI overrides with config file values.
    ///
    /// CLI values take precedence; relative directories stay relative and are
    /// resolved against `project_dir` by the caller.
    pub fn build_runtime_options(&self, project_dir: &Path, cli: CliOverrides) -> RuntimeOptions {
        let mut suite_retry = self.retry.suite.clone();
        if let Some(attempts) = cli.suite_attempts {
            suite_retry.max_attempts = attempts;
        }
        if let Some(delay) = cli.suite_delay {
            suite_retry.base_delay = delay;
            suite_retry.max_delay = suite_retry.max_delay.max(delay);
        }

        let mut test_retry = self.retry.test.to_strategy();
        if let Some(attempts) = cli.test_attempts {
            test_retry.max_attempts = attempts;
        }

        let mut build_args = self.build.args.clone();
        if let Some(extra) = cli.build_args {
            build_args.extend(extra);
        }

        RuntimeOptions {
            project_dir: project_dir.to_path_buf(),
            program: cli.program.unwrap_or_else(|| self.build.program.clone()),
            build_args,
            results_dir: cli
                .results_dir
                .unwrap_or_else(|| self.paths.results_dir.clone()),
            state_dir: cli.state_dir.unwrap_or_else(|| self.paths.state_dir.clone()),
            suite_retry,
            test_retry,
            test_settle_delay: cli.settle_delay.unwrap_or(self.retry.test.settle_delay),
            poll_interval: cli.poll_interval.unwrap_or(self.runner.poll_interval),
            heartbeat_every: cli.heartbeat_every.unwrap_or(self.runner.heartbeat_every),
            timeout: cli.timeout.or(self.runner.timeout),
        }
    }

    /// Generate a default configuration file content as TOML string
    pub fn default_toml_template() -> String {
        r#"# droidci configuration file
# Place this file in the project root as .droidci.toml

[build]
# Build tool program (relative paths are resolved from the project root)
program = "./gradlew"
# Extra arguments appended to every invocation
args = []

[paths]
# Test reports are copied to <results_dir>/<target> after every suite run
results_dir = "test-results"
# Build status and event log
state_dir = ".droidci"

[retry.suite]
# Whole-suite retries, used when a failed run names no failing tests
strategy = "constant"
max_attempts = 3
base_delay = "10s"
max_delay = "60s"
jitter = 0.0

[retry.test]
# Individual retries of each failing test
strategy = "immediate"
max_attempts = 3
# Wait before each test's retry sequence begins
settle_delay = "10s"

[runner]
# How often the running build is polled
poll_interval = "10s"
# Print a liveness line every N polls so CI watchdogs see output
heartbeat_every = 30
# Kill a build invocation that runs longer than this (optional)
# timeout = "2h"

# Accepted failures per target
# [ignore]
# "aws-android-sdk-s3" = ["com.amazonaws.s3.TransferTest#testResume"]
"#
        .to_string()
    }
}
