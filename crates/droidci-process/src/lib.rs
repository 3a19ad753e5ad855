//! Supervised process execution for droidci.
//!
//! Build tool invocations can run for a long time without printing anything,
//! which trips inactivity watchdogs on hosted CI. [`run_supervised`] polls the
//! child at a fixed interval, invokes a heartbeat callback every N polling
//! cycles while the child is alive, and kills the child once an optional
//! timeout is exceeded.
//!
//! # Example
//!
//! ```ignore
//! use droidci_process::{run_supervised, SupervisorOptions};
//! use std::path::Path;
//!
//! let out = run_supervised("./gradlew", &["tasks"], Path::new("."), &SupervisorOptions::default(), |hb| {
//!     println!("still running after {:?}", hb.elapsed);
//! })?;
//! assert!(out.success);
//! ```

use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};

/// Polling, heartbeat and timeout settings for a supervised command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupervisorOptions {
    /// Wait between polls of the child process.
    pub poll_interval: Duration,
    /// Emit a heartbeat every this many polling cycles (0 disables heartbeats).
    pub heartbeat_every: u32,
    /// Kill the child once it has run this long.
    pub timeout: Option<Duration>,
}

impl Default for SupervisorOptions {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(10),
            heartbeat_every: 30,
            timeout: None,
        }
    }
}

/// Liveness signal emitted while a command is still running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Heartbeat {
    pub elapsed: Duration,
}

/// Result of a supervised command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    /// Whether the command exited with status 0
    pub success: bool,
    /// Exit code, if the process exited normally
    pub exit_code: Option<i32>,
    /// Whether the command was killed for exceeding its timeout
    pub timed_out: bool,
    /// Wall clock duration
    pub duration_ms: u64,
}

/// Resolve the program to spawn.
///
/// Relative paths containing a separator (`./gradlew`) are anchored at
/// `working_dir`; bare names are looked up on `PATH` and left untouched if
/// not found so the spawn error names the original program.
pub fn resolve_program(program: &str, working_dir: &Path) -> PathBuf {
    let path = Path::new(program);
    if path.is_absolute() {
        return path.to_path_buf();
    }
    if program.contains('/') || program.contains('\\') {
        return working_dir.join(path);
    }
    which::which(program).unwrap_or_else(|_| path.to_path_buf())
}

/// Run `program` with inherited stdio under supervision.
///
/// Returns `Err` only when the process cannot be spawned or polled. A
/// non-zero exit or a timeout is reported through [`CommandOutput`].
pub fn run_supervised<S, F>(
    program: &str,
    args: &[S],
    working_dir: &Path,
    opts: &SupervisorOptions,
    mut on_heartbeat: F,
) -> Result<CommandOutput>
where
    S: AsRef<str>,
    F: FnMut(Heartbeat),
{
    let start = Instant::now();
    let resolved = resolve_program(program, working_dir);
    let arg_list: Vec<&str> = args.iter().map(AsRef::as_ref).collect();

    let mut child = Command::new(&resolved)
        .args(&arg_list)
        .current_dir(working_dir)
        .stdin(Stdio::null())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit())
        .spawn()
        .with_context(|| {
            format!(
                "failed to run command: {} {:?} in {}",
                resolved.display(),
                arg_list,
                working_dir.display()
            )
        })?;

    let mut cycle: u64 = 0;
    loop {
        if let Some(status) = child
            .try_wait()
            .with_context(|| format!("failed to poll command: {}", resolved.display()))?
        {
            return Ok(CommandOutput {
                success: status.success(),
                exit_code: status.code(),
                timed_out: false,
                duration_ms: start.elapsed().as_millis() as u64,
            });
        }

        if let Some(limit) = opts.timeout
            && start.elapsed() >= limit
        {
            let _ = child.kill();
            let _ = child.wait();
            return Ok(CommandOutput {
                success: false,
                exit_code: None,
                timed_out: true,
                duration_ms: start.elapsed().as_millis() as u64,
            });
        }

        std::thread::sleep(opts.poll_interval);
        cycle += 1;

        if opts.heartbeat_every > 0 && cycle % u64::from(opts.heartbeat_every) == 0 {
            on_heartbeat(Heartbeat {
                elapsed: start.elapsed(),
            });
        }
    }
}

/// Render a command line for logs and event records.
pub fn display_command<S: AsRef<str>>(program: &str, args: &[S]) -> String {
    let mut line = program.to_string();
    for arg in args {
        line.push(' ');
        line.push_str(arg.as_ref());
    }
    line
}

/// `humantime` rendering of a millisecond duration, e.g. `1m 3s`.
pub fn format_millis(ms: u64) -> String {
    let rounded = Duration::from_secs(ms / 1000);
    if rounded.is_zero() {
        return format!("{ms}ms");
    }
    humantime::format_duration(rounded).to_string()
}
