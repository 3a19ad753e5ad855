use std::path::PathBuf;
use std::thread;
use std::time::{Duration, Instant};

use droidci_events::{EventLog, events_path};
use droidci_report::ReportParser;
use droidci_retry::{RetryExecutor, calculate_delay};
use droidci_types::{
    EventType, FailedTestId, FailureSet, IgnoreList, RunPhase, RunStatus, RuntimeOptions,
    TestFilterStyle, TestKind, TestRunOutcome, TestTarget, Verdict, VerdictReason,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::artifacts;
use crate::runner::{CommandRunner, Invocation};

pub trait Reporter {
    fn info(&mut self, msg: &str);
    fn warn(&mut self, msg: &str);
    fn error(&mut self, msg: &str);
}

/// Infrastructure failures that abort a reconciliation.
///
/// Test failures never surface here; they end up in the [`Verdict`].
#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("failed to run build tool for {target}")]
    Runner {
        target: TestTarget,
        #[source]
        source: anyhow::Error,
    },
    #[error("failed to collect test reports for {target} into {}", destination.display())]
    ArtifactCollection {
        target: TestTarget,
        destination: PathBuf,
        #[source]
        source: anyhow::Error,
    },
    #[error("failed to write event log {}", path.display())]
    EventLog {
        path: PathBuf,
        #[source]
        source: anyhow::Error,
    },
}

/// Outcome of one reconciliation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileReport {
    pub target: TestTarget,
    pub kind: TestKind,
    pub verdict: Verdict,
    pub reason: VerdictReason,
    /// Build tool executions performed, including retries.
    pub attempts: u32,
}

impl ReconcileReport {
    pub fn summary_line(&self) -> String {
        let status = if self.verdict.is_success() {
            "PASS"
        } else {
            "FAIL"
        };
        let plural = if self.attempts == 1 { "" } else { "s" };
        let mut line = format!(
            "{status} {} ({}): {} after {} run{plural}",
            self.target, self.kind, self.reason, self.attempts
        );
        if let Some(residual) = self.verdict.residual()
            && !residual.is_empty()
        {
            let names: Vec<String> = residual.iter().map(ToString::to_string).collect();
            line.push_str(&format!(" [{}]", names.join(", ")));
        }
        line
    }
}

/// Turn per-test retry results into a verdict.
///
/// `failed` is the diagnosed failure set and `resolved` the tests that passed
/// when retried individually.
pub fn decide_verdict(
    failed: &FailureSet,
    resolved: &FailureSet,
    ignore: Option<&IgnoreList>,
) -> (Verdict, VerdictReason) {
    let residual: FailureSet = failed.difference(resolved).cloned().collect();
    if residual.is_empty() {
        return (Verdict::Success, VerdictReason::ResolvedByTestRetry);
    }

    match ignore {
        Some(list) if list.covers(&residual) => (Verdict::Success, VerdictReason::Ignored),
        Some(list) => (
            Verdict::Failure {
                residual: list.uncovered(&residual),
            },
            VerdictReason::Unresolved,
        ),
        None => (Verdict::Failure { residual }, VerdictReason::Unresolved),
    }
}

/// Runs a target and applies the retry-and-reconcile policy.
pub struct Reconciler<R, P> {
    opts: RuntimeOptions,
    runner: R,
    parser: P,
    events: EventLog,
    attempts: u32,
}

impl<R: CommandRunner, P: ReportParser> Reconciler<R, P> {
    pub fn new(opts: RuntimeOptions, runner: R, parser: P) -> Self {
        Self {
            opts,
            runner,
            parser,
            events: EventLog::new(),
            attempts: 0,
        }
    }

    pub fn options(&self) -> &RuntimeOptions {
        &self.opts
    }

    pub fn runner(&self) -> &R {
        &self.runner
    }

    /// Run `target` and reconcile its failures into a verdict.
    ///
    /// Events are appended to `<state_dir>/events.jsonl` whether or not the
    /// reconciliation completes.
    pub fn reconcile(
        &mut self,
        target: &TestTarget,
        kind: TestKind,
        ignore: Option<&IgnoreList>,
        reporter: &mut dyn Reporter,
    ) -> Result<ReconcileReport, ReconcileError> {
        self.attempts = 0;
        self.events.record(
            target.as_str(),
            EventType::ReconcileStarted {
                kind,
                ignored: ignore.map(IgnoreList::len).unwrap_or(0),
            },
        );
        reporter.info(&format!("{target}: running {}", kind.profile().label));

        let result = self.reconcile_inner(target, kind, ignore, reporter);

        if let Ok((verdict, reason)) = &result {
            self.events.record(
                target.as_str(),
                EventType::VerdictReached {
                    verdict: verdict.clone(),
                    reason: *reason,
                },
            );
        }

        let path = events_path(&self.opts.resolved_state_dir());
        let flushed = self.events.flush_to(&path);
        // Drop anything left unwritten so it is not attributed to the next target.
        self.events.clear();

        let (verdict, reason) = result?;
        flushed.map_err(|source| ReconcileError::EventLog { path, source })?;

        let report = ReconcileReport {
            target: target.clone(),
            kind,
            verdict,
            reason,
            attempts: self.attempts,
        };
        if report.verdict.is_success() {
            reporter.info(&report.summary_line());
        } else {
            reporter.error(&report.summary_line());
        }
        Ok(report)
    }

    fn reconcile_inner(
        &mut self,
        target: &TestTarget,
        kind: TestKind,
        ignore: Option<&IgnoreList>,
        reporter: &mut dyn Reporter,
    ) -> Result<(Verdict, VerdictReason), ReconcileError> {
        let outcome = self.run_suite(target, kind, RunPhase::Initial, 1, reporter)?;
        if outcome.status.success() {
            return Ok((Verdict::Success, VerdictReason::Passed));
        }

        let profile = kind.profile();
        let Some(filter) = profile.retry_filter else {
            reporter.warn(&format!(
                "{target}: {} failed ({}); no retries for this kind",
                profile.label, outcome.status
            ));
            return Ok((
                Verdict::Failure {
                    residual: FailureSet::new(),
                },
                VerdictReason::UnitTestFailed,
            ));
        };

        let mut failed = self.diagnose(target, &outcome, reporter);

        if failed.is_empty() {
            reporter.warn(&format!(
                "{target}: run failed ({}) without identifiable failing tests; retrying the suite",
                outcome.status
            ));

            let suite_retry = self.opts.suite_retry.clone();
            for retry in 1..=suite_retry.max_attempts {
                let delay = calculate_delay(&suite_retry, retry);
                reporter.info(&format!(
                    "{target}: suite retry {retry}/{} in {}",
                    suite_retry.max_attempts,
                    humanize(delay)
                ));
                pause(delay);

                let outcome = self.run_suite(target, kind, RunPhase::SuiteRetry, retry, reporter)?;
                if outcome.status.success() {
                    return Ok((Verdict::Success, VerdictReason::PassedOnSuiteRetry));
                }

                failed = self.diagnose(target, &outcome, reporter);
                if !failed.is_empty() {
                    break;
                }
            }

            if failed.is_empty() {
                return Ok((
                    Verdict::Failure {
                        residual: FailureSet::new(),
                    },
                    VerdictReason::Undiagnosable,
                ));
            }
        }

        reporter.info(&format!(
            "{target}: retrying {} failed test(s) individually",
            failed.len()
        ));

        let mut resolved = FailureSet::new();
        for test in &failed {
            if self.retry_test(target, kind, filter, test, reporter)? {
                resolved.insert(test.clone());
            }
        }

        let (verdict, reason) = decide_verdict(&failed, &resolved, ignore);
        if reason == VerdictReason::Ignored {
            reporter.warn(&format!(
                "{target}: {} failure(s) remain but all are on the ignore list",
                failed.len() - resolved.len()
            ));
        }
        Ok((verdict, reason))
    }

    /// Retry `test` on its own. Returns whether any attempt passed.
    fn retry_test(
        &mut self,
        target: &TestTarget,
        kind: TestKind,
        filter: TestFilterStyle,
        test: &FailedTestId,
        reporter: &mut dyn Reporter,
    ) -> Result<bool, ReconcileError> {
        let settle = self.opts.test_settle_delay;
        reporter.info(&format!("{target}: retrying {test} in {}", humanize(settle)));
        pause(settle);

        let invocation = Invocation::single_test(&self.opts, target, kind, filter, test);
        let executor = RetryExecutor::new(self.opts.test_retry.clone());
        let max_attempts = executor.config().max_attempts;

        let mut fatal = None;
        let mut last_attempt = 0;
        let passed = executor.run(|attempt| {
            last_attempt = attempt;
            match self.execute(target, &invocation, RunPhase::TestRetry, attempt, reporter) {
                Ok(status) if status.success() => Ok(()),
                Ok(status) => {
                    reporter.warn(&format!(
                        "{target}: {test} attempt {attempt}/{max_attempts} {status}"
                    ));
                    Err(())
                }
                Err(e) => {
                    fatal = Some(e);
                    Ok(())
                }
            }
        });
        if let Some(e) = fatal {
            return Err(e);
        }

        let event = if passed.is_ok() {
            reporter.info(&format!("{target}: {test} passed on attempt {last_attempt}"));
            EventType::TestResolved {
                test: test.clone(),
                attempts: last_attempt,
            }
        } else {
            reporter.warn(&format!(
                "{target}: {test} still failing after {last_attempt} attempt(s)"
            ));
            EventType::TestUnresolved {
                test: test.clone(),
                attempts: last_attempt,
            }
        };
        self.events.record(target.as_str(), event);
        Ok(passed.is_ok())
    }

    /// Run the full suite and collect its report directory.
    fn run_suite(
        &mut self,
        target: &TestTarget,
        kind: TestKind,
        phase: RunPhase,
        attempt: u32,
        reporter: &mut dyn Reporter,
    ) -> Result<TestRunOutcome, ReconcileError> {
        let invocation = Invocation::suite(&self.opts, target, kind);
        let start = Instant::now();
        let status = self.execute(target, &invocation, phase, attempt, reporter)?;
        let duration_ms = start.elapsed().as_millis() as u64;

        self.collect(target, kind, reporter)?;

        Ok(TestRunOutcome {
            status,
            report_path: artifacts::report_path(&self.opts, target, kind),
            duration_ms,
        })
    }

    fn execute(
        &mut self,
        target: &TestTarget,
        invocation: &Invocation,
        phase: RunPhase,
        attempt: u32,
        reporter: &mut dyn Reporter,
    ) -> Result<RunStatus, ReconcileError> {
        let command = invocation.command_line();
        reporter.info(&format!("{target}: {phase} run {attempt}: {command}"));
        self.events.record(
            target.as_str(),
            EventType::RunStarted {
                phase,
                attempt,
                command,
            },
        );

        self.attempts += 1;
        let start = Instant::now();
        let status = self
            .runner
            .run(invocation, reporter)
            .map_err(|source| ReconcileError::Runner {
                target: target.clone(),
                source,
            })?;
        let duration_ms = start.elapsed().as_millis() as u64;

        self.events.record(
            target.as_str(),
            EventType::RunFinished {
                phase,
                attempt,
                status,
                duration_ms,
            },
        );
        Ok(status)
    }

    fn collect(
        &mut self,
        target: &TestTarget,
        kind: TestKind,
        reporter: &mut dyn Reporter,
    ) -> Result<(), ReconcileError> {
        let src = artifacts::report_dir(&self.opts, target, kind);
        let results_root = self.opts.resolved_results_dir();
        let destination = artifacts::results_dir_for(&self.opts, target);

        match artifacts::collect_reports(&src, &results_root, &destination) {
            Ok(Some(files)) => {
                reporter.info(&format!(
                    "{target}: collected {files} report file(s) into {}",
                    destination.display()
                ));
                self.events
                    .record(target.as_str(), EventType::ArtifactsCollected { destination });
                Ok(())
            }
            Ok(None) => {
                reporter.warn(&format!(
                    "{target}: no report directory at {}",
                    src.display()
                ));
                Ok(())
            }
            Err(source) => Err(ReconcileError::ArtifactCollection {
                target: target.clone(),
                destination,
                source,
            }),
        }
    }

    /// Failed tests named by the run's report. Unreadable reports yield an
    /// empty set.
    fn diagnose(
        &mut self,
        target: &TestTarget,
        outcome: &TestRunOutcome,
        reporter: &mut dyn Reporter,
    ) -> FailureSet {
        match self.parser.parse_failures(&outcome.report_path) {
            Ok(failures) => {
                self.events.record(
                    target.as_str(),
                    EventType::ReportParsed {
                        failures: failures.iter().cloned().collect(),
                    },
                );
                failures
            }
            Err(e) => {
                reporter.warn(&format!("{target}: {e}"));
                self.events.record(
                    target.as_str(),
                    EventType::ReportUnreadable {
                        message: e.to_string(),
                    },
                );
                FailureSet::new()
            }
        }
    }
}

fn pause(delay: Duration) {
    if !delay.is_zero() {
        thread::sleep(delay);
    }
}

fn humanize(delay: Duration) -> String {
    if delay.is_zero() {
        "0s".to_string()
    } else {
        droidci_process::format_millis(delay.as_millis() as u64)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::fs;
    use std::path::Path;

    use anyhow::bail;
    use droidci_events::EventLog;
    use droidci_report::HtmlReportParser;
    use droidci_retry::RetryStrategyConfig;
    use tempfile::{TempDir, tempdir};

    use super::*;

    #[derive(Default)]
    struct CollectingReporter {
        infos: Vec<String>,
        warns: Vec<String>,
        errors: Vec<String>,
    }

    impl Reporter for CollectingReporter {
        fn info(&mut self, msg: &str) {
            self.infos.push(msg.to_string());
        }

        fn warn(&mut self, msg: &str) {
            self.warns.push(msg.to_string());
        }

        fn error(&mut self, msg: &str) {
            self.errors.push(msg.to_string());
        }
    }

    /// What a fake build run does to the report and what it returns.
    struct Step {
        status: RunStatus,
        report: Option<String>,
    }

    impl Step {
        fn pass() -> Self {
            Self {
                status: RunStatus::Passed,
                report: Some(html_report(&[])),
            }
        }

        fn fail_with(tests: &[&str]) -> Self {
            Self {
                status: RunStatus::Failed { exit_code: Some(1) },
                report: Some(html_report(tests)),
            }
        }

        fn fail_without_report() -> Self {
            Self {
                status: RunStatus::Failed { exit_code: Some(1) },
                report: None,
            }
        }
    }

    type Script = Box<dyn FnMut(&Invocation, u32) -> anyhow::Result<Step>>;

    /// Build tool stand-in: writes the scripted report where the build tool
    /// would and returns the scripted status. The second closure argument is
    /// the per-test attempt number for filtered runs and the suite run number
    /// otherwise.
    struct FakeRunner {
        report_dir: PathBuf,
        script: Script,
        calls: Vec<Invocation>,
        test_attempts: BTreeMap<String, u32>,
    }

    impl FakeRunner {
        fn suite_runs(&self) -> usize {
            self.calls.iter().filter(|c| filtered_test(c).is_none()).count()
        }

        fn test_runs(&self, test: &str) -> usize {
            self.calls
                .iter()
                .filter(|c| filtered_test(c).as_deref() == Some(test))
                .count()
        }
    }

    impl CommandRunner for FakeRunner {
        fn run(
            &mut self,
            invocation: &Invocation,
            _reporter: &mut dyn Reporter,
        ) -> anyhow::Result<RunStatus> {
            self.calls.push(invocation.clone());
            let key = filtered_test(invocation).unwrap_or_else(|| "<suite>".to_string());
            let n = self.test_attempts.entry(key).or_insert(0);
            *n += 1;
            let step = (self.script)(invocation, *n)?;

            if filtered_test(invocation).is_none() {
                let index = self.report_dir.join("index.html");
                match step.report {
                    Some(html) => {
                        fs::create_dir_all(&self.report_dir)?;
                        fs::write(&index, html)?;
                    }
                    None => {
                        if self.report_dir.exists() {
                            fs::remove_dir_all(&self.report_dir)?;
                        }
                    }
                }
            }
            Ok(step.status)
        }
    }

    fn filtered_test(invocation: &Invocation) -> Option<String> {
        const PREFIX: &str = "-Pandroid.testInstrumentationRunnerArguments.class=";
        invocation
            .args
            .iter()
            .find_map(|a| a.strip_prefix(PREFIX).map(str::to_string))
    }

    fn html_report(failures: &[&str]) -> String {
        let mut rows = String::new();
        for failure in failures {
            let (class, method) = failure.split_once('#').expect("class#method");
            rows.push_str(&format!(
                "<tr><td class=\"failures\"><a href=\"{class}.html\">{class}</a></td>\
                 <td class=\"failures\"><a href=\"{class}.html#{method}\">{method}</a></td></tr>\n"
            ));
        }
        format!("<html><body><table>\n{rows}</table></body></html>\n")
    }

    fn id(s: &str) -> FailedTestId {
        s.parse().expect("valid id")
    }

    fn set(ids: &[&str]) -> FailureSet {
        ids.iter().map(|s| id(s)).collect()
    }

    fn target() -> TestTarget {
        TestTarget::new("T").expect("target")
    }

    fn fast_options(project: &Path) -> RuntimeOptions {
        let mut opts = RuntimeOptions::for_project(project);
        opts.suite_retry = RetryStrategyConfig {
            base_delay: Duration::ZERO,
            ..RetryStrategyConfig::suite()
        };
        opts.test_retry = RetryStrategyConfig::per_test();
        opts.test_settle_delay = Duration::ZERO;
        opts
    }

    fn reconciler(
        td: &TempDir,
        kind: TestKind,
        script: impl FnMut(&Invocation, u32) -> anyhow::Result<Step> + 'static,
    ) -> Reconciler<FakeRunner, HtmlReportParser> {
        let opts = fast_options(td.path());
        let runner = FakeRunner {
            report_dir: artifacts::report_dir(&opts, &target(), kind),
            script: Box::new(script),
            calls: Vec::new(),
            test_attempts: BTreeMap::new(),
        };
        Reconciler::new(opts, runner, HtmlReportParser)
    }

    fn events(td: &TempDir) -> EventLog {
        EventLog::read_from_file(&events_path(&td.path().join(".droidci"))).expect("events")
    }

    #[test]
    fn initial_success_runs_once() {
        let td = tempdir().expect("tempdir");
        let mut rec = reconciler(&td, TestKind::Integration, |_, _| Ok(Step::pass()));
        let mut reporter = CollectingReporter::default();

        let report = rec
            .reconcile(&target(), TestKind::Integration, None, &mut reporter)
            .expect("reconcile");

        assert_eq!(report.verdict, Verdict::Success);
        assert_eq!(report.reason, VerdictReason::Passed);
        assert_eq!(report.attempts, 1);
        assert_eq!(rec.runner().calls.len(), 1);
    }

    #[test]
    fn fresh_reconciliation_of_passing_target_is_repeatable() {
        let td = tempdir().expect("tempdir");
        let mut reporter = CollectingReporter::default();

        for _ in 0..2 {
            let mut rec = reconciler(&td, TestKind::Integration, |_, _| Ok(Step::pass()));
            let report = rec
                .reconcile(&target(), TestKind::Integration, None, &mut reporter)
                .expect("reconcile");
            assert!(report.verdict.is_success());
            assert_eq!(report.attempts, 1);
        }
    }

    #[test]
    fn unit_failure_is_final() {
        let td = tempdir().expect("tempdir");
        let mut rec = reconciler(&td, TestKind::Unit, |_, _| Ok(Step::fail_with(&["A#a"])));
        let mut reporter = CollectingReporter::default();

        let report = rec
            .reconcile(&target(), TestKind::Unit, None, &mut reporter)
            .expect("reconcile");

        assert_eq!(
            report.verdict,
            Verdict::Failure {
                residual: FailureSet::new()
            }
        );
        assert_eq!(report.reason, VerdictReason::UnitTestFailed);
        assert_eq!(report.attempts, 1);
        assert_eq!(rec.runner().calls.len(), 1);
    }

    #[test]
    fn undiagnosable_failure_retries_suite_three_times() {
        let td = tempdir().expect("tempdir");
        let mut rec = reconciler(&td, TestKind::Integration, |_, _| {
            Ok(Step::fail_without_report())
        });
        let mut reporter = CollectingReporter::default();

        let report = rec
            .reconcile(&target(), TestKind::Integration, None, &mut reporter)
            .expect("reconcile");

        assert_eq!(
            report.verdict,
            Verdict::Failure {
                residual: FailureSet::new()
            }
        );
        assert_eq!(report.reason, VerdictReason::Undiagnosable);
        assert_eq!(rec.runner().suite_runs(), 4);
        assert_eq!(report.attempts, 4);
        assert!(reporter.warns.iter().any(|w| w.contains("report not found")));
    }

    #[test]
    fn empty_report_counts_as_undiagnosed() {
        let td = tempdir().expect("tempdir");
        let mut rec = reconciler(&td, TestKind::Integration, |_, _| Ok(Step::fail_with(&[])));
        let mut reporter = CollectingReporter::default();

        let report = rec
            .reconcile(&target(), TestKind::Integration, None, &mut reporter)
            .expect("reconcile");

        assert_eq!(report.reason, VerdictReason::Undiagnosable);
        assert_eq!(rec.runner().suite_runs(), 4);
    }

    #[test]
    fn suite_retry_stops_at_first_success() {
        let td = tempdir().expect("tempdir");
        let mut rec = reconciler(&td, TestKind::Integration, |_, n| {
            Ok(if n < 3 {
                Step::fail_without_report()
            } else {
                Step::pass()
            })
        });
        let mut reporter = CollectingReporter::default();

        let report = rec
            .reconcile(&target(), TestKind::Integration, None, &mut reporter)
            .expect("reconcile");

        assert_eq!(report.verdict, Verdict::Success);
        assert_eq!(report.reason, VerdictReason::PassedOnSuiteRetry);
        assert_eq!(report.attempts, 3);
    }

    #[test]
    fn suite_retry_stops_once_failures_are_diagnosed() {
        let td = tempdir().expect("tempdir");
        let mut rec = reconciler(&td, TestKind::Integration, |inv, n| {
            Ok(match filtered_test(inv) {
                Some(_) => Step::pass(),
                None if n == 1 => Step::fail_without_report(),
                None => Step::fail_with(&["A#a"]),
            })
        });
        let mut reporter = CollectingReporter::default();

        let report = rec
            .reconcile(&target(), TestKind::Integration, None, &mut reporter)
            .expect("reconcile");

        assert_eq!(rec.runner().suite_runs(), 2);
        assert_eq!(rec.runner().test_runs("A#a"), 1);
        assert_eq!(report.reason, VerdictReason::ResolvedByTestRetry);
        assert!(report.verdict.is_success());
    }

    #[test]
    fn resolved_and_unresolved_tests_without_ignore_list() {
        let td = tempdir().expect("tempdir");
        let mut rec = reconciler(&td, TestKind::Integration, |inv, n| {
            Ok(match filtered_test(inv).as_deref() {
                None => Step::fail_with(&["A#a", "B#b"]),
                Some("A#a") if n == 2 => Step::pass(),
                Some(_) => Step::fail_with(&[]),
            })
        });
        let mut reporter = CollectingReporter::default();

        let report = rec
            .reconcile(&target(), TestKind::Integration, None, &mut reporter)
            .expect("reconcile");

        assert_eq!(
            report.verdict,
            Verdict::Failure {
                residual: set(&["B#b"])
            }
        );
        assert_eq!(report.reason, VerdictReason::Unresolved);
        assert_eq!(rec.runner().test_runs("A#a"), 2);
        assert_eq!(rec.runner().test_runs("B#b"), 3);
        assert_eq!(report.attempts, 1 + 2 + 3);
        assert_eq!(reporter.errors.len(), 1);
    }

    #[test]
    fn ignored_residual_yields_success() {
        let td = tempdir().expect("tempdir");
        let mut rec = reconciler(&td, TestKind::Integration, |inv, n| {
            Ok(match filtered_test(inv).as_deref() {
                None => Step::fail_with(&["A#a", "B#b"]),
                Some("A#a") if n == 2 => Step::pass(),
                Some(_) => Step::fail_with(&[]),
            })
        });
        let ignore: IgnoreList = [id("B#b")].into_iter().collect();
        let mut reporter = CollectingReporter::default();

        let report = rec
            .reconcile(&target(), TestKind::Integration, Some(&ignore), &mut reporter)
            .expect("reconcile");

        assert_eq!(report.verdict, Verdict::Success);
        assert_eq!(report.reason, VerdictReason::Ignored);
    }

    #[test]
    fn partially_ignored_residual_reports_only_uncovered_tests() {
        let td = tempdir().expect("tempdir");
        let mut rec = reconciler(&td, TestKind::Integration, |inv, _| {
            Ok(match filtered_test(inv) {
                None => Step::fail_with(&["A#a", "B#b", "C#c"]),
                Some(_) => Step::fail_with(&[]),
            })
        });
        let ignore: IgnoreList = [id("B#b"), id("Z#z")].into_iter().collect();
        let mut reporter = CollectingReporter::default();

        let report = rec
            .reconcile(&target(), TestKind::Integration, Some(&ignore), &mut reporter)
            .expect("reconcile");

        assert_eq!(
            report.verdict,
            Verdict::Failure {
                residual: set(&["A#a", "C#c"])
            }
        );
    }

    #[test]
    fn flaky_test_scenario_with_ignored_residual() {
        let td = tempdir().expect("tempdir");
        let mut rec = reconciler(&td, TestKind::Integration, |inv, n| {
            Ok(match filtered_test(inv).as_deref() {
                None => Step::fail_with(&["X#m1", "X#m2"]),
                Some("X#m1") if n >= 2 => Step::pass(),
                Some(_) => Step::fail_with(&[]),
            })
        });
        let ignore: IgnoreList = [id("X#m2")].into_iter().collect();
        let mut reporter = CollectingReporter::default();

        let report = rec
            .reconcile(&target(), TestKind::Integration, Some(&ignore), &mut reporter)
            .expect("reconcile");

        assert_eq!(report.verdict, Verdict::Success);
        assert_eq!(report.reason, VerdictReason::Ignored);
        assert_eq!(rec.runner().test_runs("X#m1"), 2);
        assert_eq!(rec.runner().test_runs("X#m2"), 3);

        let mut status = crate::status::BuildStatus::new();
        assert!(!status.record(&report));
        assert!(!status.is_failed());

        let log = events(&td);
        let resolved: Vec<_> = log
            .all_events()
            .iter()
            .filter_map(|e| match &e.event_type {
                EventType::TestResolved { test, attempts } => Some((test.to_string(), *attempts)),
                _ => None,
            })
            .collect();
        assert_eq!(resolved, vec![("X#m1".to_string(), 2)]);
        assert!(matches!(
            log.all_events().last().map(|e| &e.event_type),
            Some(EventType::VerdictReached {
                reason: VerdictReason::Ignored,
                ..
            })
        ));
    }

    #[test]
    fn truncated_report_is_still_diagnosed() {
        let td = tempdir().expect("tempdir");
        let mut rec = reconciler(&td, TestKind::Integration, |inv, _| {
            Ok(match filtered_test(inv) {
                None => Step {
                    status: RunStatus::Failed { exit_code: Some(1) },
                    report: Some(html_report(&["A#a"]).replace("</html>", "")),
                },
                Some(_) => Step::pass(),
            })
        });
        let mut reporter = CollectingReporter::default();

        let report = rec
            .reconcile(&target(), TestKind::Integration, None, &mut reporter)
            .expect("reconcile");

        assert_eq!(report.reason, VerdictReason::ResolvedByTestRetry);
        assert_eq!(rec.runner().suite_runs(), 1);
    }

    #[test]
    fn timed_out_run_is_an_ordinary_failure() {
        let td = tempdir().expect("tempdir");
        let mut rec = reconciler(&td, TestKind::Integration, |_, n| {
            Ok(if n == 1 {
                Step {
                    status: RunStatus::TimedOut,
                    report: None,
                }
            } else {
                Step::pass()
            })
        });
        let mut reporter = CollectingReporter::default();

        let report = rec
            .reconcile(&target(), TestKind::Integration, None, &mut reporter)
            .expect("reconcile");
        assert_eq!(report.reason, VerdictReason::PassedOnSuiteRetry);
    }

    #[test]
    fn reports_are_collected_after_each_suite_run() {
        let td = tempdir().expect("tempdir");
        let mut rec = reconciler(&td, TestKind::Integration, |_, _| Ok(Step::pass()));
        let mut reporter = CollectingReporter::default();

        rec.reconcile(&target(), TestKind::Integration, None, &mut reporter)
            .expect("reconcile");

        let collected = td.path().join("test-results").join("T").join("index.html");
        assert!(collected.is_file());
        assert!(
            events(&td)
                .all_events()
                .iter()
                .any(|e| matches!(e.event_type, EventType::ArtifactsCollected { .. }))
        );
    }

    #[test]
    fn artifact_copy_failure_is_fatal() {
        let td = tempdir().expect("tempdir");
        fs::write(td.path().join("test-results"), "not a directory").expect("write");
        let mut rec = reconciler(&td, TestKind::Integration, |_, _| Ok(Step::fail_with(&["A#a"])));
        let mut reporter = CollectingReporter::default();

        let err = rec
            .reconcile(&target(), TestKind::Integration, None, &mut reporter)
            .expect_err("copy must fail");

        assert!(matches!(err, ReconcileError::ArtifactCollection { .. }));
        assert_eq!(rec.runner().calls.len(), 1);
        assert_eq!(events(&td).len(), 3);
    }

    #[test]
    fn runner_error_aborts_mid_retry() {
        let td = tempdir().expect("tempdir");
        let mut rec = reconciler(&td, TestKind::Integration, |inv, _| match filtered_test(inv) {
            None => Ok(Step::fail_with(&["A#a"])),
            Some(_) => bail!("build tool vanished"),
        });
        let mut reporter = CollectingReporter::default();

        let err = rec
            .reconcile(&target(), TestKind::Integration, None, &mut reporter)
            .expect_err("runner failure");

        assert!(matches!(err, ReconcileError::Runner { .. }));
        assert_eq!(rec.runner().test_runs("A#a"), 1);
    }

    #[test]
    fn event_log_records_every_run() {
        let td = tempdir().expect("tempdir");
        let mut rec = reconciler(&td, TestKind::Integration, |_, _| {
            Ok(Step::fail_without_report())
        });
        let mut reporter = CollectingReporter::default();
        rec.reconcile(&target(), TestKind::Integration, None, &mut reporter)
            .expect("reconcile");

        let log = events(&td);
        let started = log
            .all_events()
            .iter()
            .filter(|e| matches!(e.event_type, EventType::RunStarted { .. }))
            .count();
        let unreadable = log
            .all_events()
            .iter()
            .filter(|e| matches!(e.event_type, EventType::ReportUnreadable { .. }))
            .count();
        assert_eq!(started, 4);
        assert_eq!(unreadable, 4);
        assert!(matches!(
            log.all_events().first().map(|e| &e.event_type),
            Some(EventType::ReconcileStarted { .. })
        ));
    }

    #[test]
    fn event_log_write_failure_is_fatal() {
        let td = tempdir().expect("tempdir");
        let mut rec = reconciler(&td, TestKind::Integration, |_, _| Ok(Step::pass()));
        fs::write(td.path().join(".droidci"), "blocks the state dir").expect("write");
        let mut reporter = CollectingReporter::default();

        let err = rec
            .reconcile(&target(), TestKind::Integration, None, &mut reporter)
            .expect_err("event log");
        assert!(matches!(err, ReconcileError::EventLog { .. }));
    }

    #[test]
    fn summary_line_names_residual_tests() {
        let report = ReconcileReport {
            target: target(),
            kind: TestKind::Integration,
            verdict: Verdict::Failure {
                residual: set(&["X#m1", "X#m2"]),
            },
            reason: VerdictReason::Unresolved,
            attempts: 7,
        };
        insta::assert_snapshot!(
            report.summary_line(),
            @"FAIL T (integration): unresolved failures after 7 runs [X#m1, X#m2]"
        );

        let passed = ReconcileReport {
            verdict: Verdict::Success,
            reason: VerdictReason::Passed,
            attempts: 1,
            ..report
        };
        insta::assert_snapshot!(passed.summary_line(), @"PASS T (integration): passed after 1 run");
    }

    #[test]
    fn decide_verdict_cases() {
        let failed = set(&["A#a", "B#b"]);

        assert_eq!(
            decide_verdict(&failed, &failed, None),
            (Verdict::Success, VerdictReason::ResolvedByTestRetry)
        );
        assert_eq!(
            decide_verdict(&failed, &set(&["A#a"]), None),
            (
                Verdict::Failure {
                    residual: set(&["B#b"])
                },
                VerdictReason::Unresolved
            )
        );
        let ignore: IgnoreList = [id("B#b")].into_iter().collect();
        assert_eq!(
            decide_verdict(&failed, &set(&["A#a"]), Some(&ignore)),
            (Verdict::Success, VerdictReason::Ignored)
        );
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        fn ids() -> impl Strategy<Value = FailureSet> {
            proptest::collection::btree_set("[A-D]#m[0-3]", 1..8)
                .prop_map(|s| s.iter().map(|x| x.parse().unwrap()).collect())
        }

        proptest! {
            #![proptest_config(ProptestConfig::with_cases(64))]

            #[test]
            fn success_requires_every_residual_to_be_ignored(
                failed in ids(),
                resolved in ids(),
                ignored in ids(),
            ) {
                let resolved: FailureSet = resolved.intersection(&failed).cloned().collect();
                let list: IgnoreList = ignored.iter().cloned().collect();
                let residual: FailureSet = failed.difference(&resolved).cloned().collect();

                let (verdict, _) = decide_verdict(&failed, &resolved, Some(&list));
                match verdict {
                    Verdict::Success => prop_assert!(list.covers(&residual)),
                    Verdict::Failure { residual: reported } => {
                        prop_assert!(!reported.is_empty());
                        prop_assert!(reported.is_subset(&residual));
                        prop_assert!(reported.iter().all(|t| !list.contains(t)));
                    }
                }
            }

            #[test]
            fn verdict_never_succeeds_when_every_attempt_fails(
                failures in proptest::collection::btree_set("[A-C]#m[0-2]", 0..5),
            ) {
                let td = tempdir().unwrap();
                let names: Vec<String> = failures.iter().cloned().collect();
                let mut rec = reconciler(&td, TestKind::Integration, move |_, _| {
                    let refs: Vec<&str> = names.iter().map(String::as_str).collect();
                    Ok(Step::fail_with(&refs))
                });
                let mut reporter = CollectingReporter::default();

                let report = rec
                    .reconcile(&target(), TestKind::Integration, None, &mut reporter)
                    .unwrap();
                prop_assert!(!report.verdict.is_success());
            }
        }
    }
}
