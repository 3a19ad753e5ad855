//! # droidci
//!
//! Retry-and-reconcile test execution for Android SDK CI pipelines.
//!
//! Device and emulator test suites fail for reasons unrelated to the code
//! under test. droidci runs a module's suite through the build tool, reads
//! the HTML report for the tests that failed, and retries before deciding a
//! verdict:
//!
//! 1. The full suite runs once. Reports are copied to
//!    `<results_dir>/<target>` after every full-suite run.
//! 2. A passing run, or any unit test run, ends there.
//! 3. A failed integration run whose report names no failing tests is
//!    retried as a whole (3 times by default) until it passes or names them.
//! 4. Each named test is retried on its own (3 attempts by default). Tests
//!    that pass once are resolved.
//! 5. Remaining failures are checked against the caller's ignore list.
//!
//! Verdicts are folded into a persisted [`status::BuildStatus`] so one
//! failing target marks the whole pipeline run failed.
//!
//! ## Example
//!
//! ```ignore
//! use droidci::engine::{Reconciler, Reporter};
//! use droidci::runner::ProcessRunner;
//! use droidci::report::HtmlReportParser;
//! use droidci::types::{RuntimeOptions, TestKind, TestTarget};
//!
//! let opts = RuntimeOptions::for_project(".");
//! let runner = ProcessRunner::from_options(&opts);
//! let mut reconciler = Reconciler::new(opts, runner, HtmlReportParser);
//!
//! let target = TestTarget::new("aws-android-sdk-s3")?;
//! let report = reconciler.reconcile(&target, TestKind::Integration, None, &mut reporter)?;
//! println!("{}", report.summary_line());
//! ```
//!
//! ## Crates
//!
//! - [`types`]: targets, kinds, failed-test ids, verdicts, events
//! - [`retry`]: retry strategies and delays
//! - [`report`]: HTML report parsing
//! - [`events`]: JSONL event log

pub mod artifacts;
pub mod engine;
pub mod runner;
pub mod status;

pub use droidci_events as events;
pub use droidci_report as report;
pub use droidci_retry as retry;
pub use droidci_types as types;

pub use engine::{ReconcileError, ReconcileReport, Reconciler, Reporter};
pub use status::BuildStatus;
