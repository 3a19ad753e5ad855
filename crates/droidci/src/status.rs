//! Pipeline-wide build status.
//!
//! Each reconciliation's verdict is folded into a [`BuildStatus`]. A success
//! leaves it untouched; a failure marks the whole pipeline run failed and
//! records which target failed. The status is persisted between sequential
//! invocations and only cleared explicitly.

use std::fmt::Write as _;
use std::fs;
use std::io::Write as _;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use droidci_types::{FailureSet, TestKind, TestTarget, Verdict, VerdictReason};
use serde::{Deserialize, Serialize};

use crate::engine::ReconcileReport;

pub const BUILD_STATUS_FILE: &str = "build-status.json";

pub fn build_status_path(state_dir: &Path) -> PathBuf {
    state_dir.join(BUILD_STATUS_FILE)
}

/// One failed target recorded in the build status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetFailure {
    pub target: TestTarget,
    pub kind: TestKind,
    pub reason: VerdictReason,
    pub residual: FailureSet,
    pub recorded_at: DateTime<Utc>,
}

/// Sticky failure accumulator for a pipeline run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildStatus {
    pub failed: bool,
    #[serde(default)]
    pub failures: Vec<TargetFailure>,
}

impl BuildStatus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold a verdict in. Returns whether this report marked a failure.
    pub fn record(&mut self, report: &ReconcileReport) -> bool {
        match &report.verdict {
            Verdict::Success => false,
            Verdict::Failure { residual } => {
                self.failed = true;
                self.failures.push(TargetFailure {
                    target: report.target.clone(),
                    kind: report.kind,
                    reason: report.reason,
                    residual: residual.clone(),
                    recorded_at: Utc::now(),
                });
                true
            }
        }
    }

    pub fn is_failed(&self) -> bool {
        self.failed
    }

    /// Human readable summary, one line per failed target.
    pub fn render(&self) -> String {
        if !self.failed {
            return "build status: ok\n".to_string();
        }

        let mut out = String::from("build status: FAILED\n");
        for failure in &self.failures {
            let _ = write!(
                out,
                "  {} ({}): {}",
                failure.target, failure.kind, failure.reason
            );
            if failure.residual.is_empty() {
                out.push('\n');
            } else {
                out.push_str(":\n");
                for test in &failure.residual {
                    let _ = writeln!(out, "    - {test}");
                }
            }
        }
        out
    }
}

/// Load the persisted status. A missing file is a clean status.
pub fn load_build_status(state_dir: &Path) -> Result<BuildStatus> {
    let path = build_status_path(state_dir);
    if !path.exists() {
        return Ok(BuildStatus::default());
    }
    let content = fs::read_to_string(&path)
        .with_context(|| format!("failed to read build status {}", path.display()))?;
    let status: BuildStatus = serde_json::from_str(&content)
        .with_context(|| format!("failed to parse build status JSON {}", path.display()))?;
    Ok(status)
}

pub fn save_build_status(state_dir: &Path, status: &BuildStatus) -> Result<()> {
    fs::create_dir_all(state_dir)
        .with_context(|| format!("failed to create state dir {}", state_dir.display()))?;

    let path = build_status_path(state_dir);
    atomic_write_json(&path, status)
}

/// Remove the persisted status. Returns whether a file was removed.
pub fn clear_build_status(state_dir: &Path) -> Result<bool> {
    let path = build_status_path(state_dir);
    if !path.exists() {
        return Ok(false);
    }
    fs::remove_file(&path)
        .with_context(|| format!("failed to remove build status {}", path.display()))?;
    Ok(true)
}

fn atomic_write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let tmp = path.with_extension("tmp");
    let data = serde_json::to_vec_pretty(value).context("failed to serialize JSON")?;

    {
        let mut f = fs::File::create(&tmp)
            .with_context(|| format!("failed to create tmp file {}", tmp.display()))?;
        f.write_all(&data)
            .with_context(|| format!("failed to write tmp file {}", tmp.display()))?;
        f.sync_all().ok();
    }

    fs::rename(&tmp, path).with_context(|| {
        format!(
            "failed to rename tmp file {} to {}",
            tmp.display(),
            path.display()
        )
    })?;

    Ok(())
}
