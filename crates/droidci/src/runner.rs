use std::path::PathBuf;

use anyhow::Result;
use droidci_process::{SupervisorOptions, display_command, format_millis, run_supervised};
use droidci_types::{
    FailedTestId, RunStatus, RuntimeOptions, TestFilterStyle, TestKind, TestTarget,
};

use crate::engine::Reporter;

/// A single build tool invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
    pub working_dir: PathBuf,
}

impl Invocation {
    /// Run the whole suite of `kind` for `target`.
    pub fn suite(opts: &RuntimeOptions, target: &TestTarget, kind: TestKind) -> Self {
        let mut args = vec![task_path(target, kind)];
        args.extend(opts.build_args.iter().cloned());
        Self {
            program: opts.program.clone(),
            args,
            working_dir: opts.project_dir.clone(),
        }
    }

    /// Run only `test` from the suite of `kind` for `target`, selected with
    /// `filter`.
    pub fn single_test(
        opts: &RuntimeOptions,
        target: &TestTarget,
        kind: TestKind,
        filter: TestFilterStyle,
        test: &FailedTestId,
    ) -> Self {
        let mut args = vec![task_path(target, kind)];
        args.extend(filter.args(test));
        args.extend(opts.build_args.iter().cloned());
        Self {
            program: opts.program.clone(),
            args,
            working_dir: opts.project_dir.clone(),
        }
    }

    pub fn command_line(&self) -> String {
        display_command(&self.program, &self.args)
    }
}

fn task_path(target: &TestTarget, kind: TestKind) -> String {
    format!(":{}:{}", target, kind.profile().task)
}

/// Executes build tool invocations.
///
/// A failing or timed-out run is an `Ok` status; `Err` means the command
/// could not be executed at all.
pub trait CommandRunner {
    fn run(&mut self, invocation: &Invocation, reporter: &mut dyn Reporter) -> Result<RunStatus>;
}

/// Runs invocations as child processes with heartbeat and timeout supervision.
#[derive(Debug, Clone)]
pub struct ProcessRunner {
    supervisor: SupervisorOptions,
}

impl ProcessRunner {
    pub fn new(supervisor: SupervisorOptions) -> Self {
        Self { supervisor }
    }

    pub fn from_options(opts: &RuntimeOptions) -> Self {
        Self::new(SupervisorOptions {
            poll_interval: opts.poll_interval,
            heartbeat_every: opts.heartbeat_every,
            timeout: opts.timeout,
        })
    }
}

impl CommandRunner for ProcessRunner {
    fn run(&mut self, invocation: &Invocation, reporter: &mut dyn Reporter) -> Result<RunStatus> {
        let command = invocation.command_line();
        let output = run_supervised(
            &invocation.program,
            &invocation.args,
            &invocation.working_dir,
            &self.supervisor,
            |hb| {
                reporter.info(&format!(
                    "still running after {}: {command}",
                    format_millis(hb.elapsed.as_millis() as u64)
                ))
            },
        )?;

        if output.timed_out {
            return Ok(RunStatus::TimedOut);
        }
        if output.success {
            Ok(RunStatus::Passed)
        } else {
            Ok(RunStatus::Failed {
                exit_code: output.exit_code,
            })
        }
    }
}
