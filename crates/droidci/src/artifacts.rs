//! Report artifact locations and collection.
//!
//! After every full-suite run the module's report directory is copied to
//! `<results_dir>/<target>` so reports survive the next build invocation,
//! which overwrites them in place.

use std::fs;
use std::path::{Component, Path, PathBuf};

use anyhow::{Context, Result, bail};
use droidci_types::{RuntimeOptions, TestKind, TestTarget};

/// Report file written by the build tool inside the report directory.
pub const REPORT_INDEX: &str = "index.html";

/// Directory the build tool writes `kind` reports to for `target`.
pub fn report_dir(opts: &RuntimeOptions, target: &TestTarget, kind: TestKind) -> PathBuf {
    opts.project_dir
        .join(target.as_str())
        .join(kind.profile().report_dir)
}

pub fn report_path(opts: &RuntimeOptions, target: &TestTarget, kind: TestKind) -> PathBuf {
    report_dir(opts, target, kind).join(REPORT_INDEX)
}

/// Where collected reports for `target` are kept.
pub fn results_dir_for(opts: &RuntimeOptions, target: &TestTarget) -> PathBuf {
    opts.resolved_results_dir().join(target.as_str())
}

/// Replace `dest` with a copy of `src`.
///
/// `dest` must lie strictly inside `results_root`; anything else is refused
/// before a file is touched. Returns `Ok(None)` when `src` does not exist,
/// otherwise the number of files copied.
pub fn collect_reports(src: &Path, results_root: &Path, dest: &Path) -> Result<Option<usize>> {
    ensure_inside(results_root, dest)?;
    if !src.is_dir() {
        return Ok(None);
    }

    if dest.exists() {
        fs::remove_dir_all(dest)
            .with_context(|| format!("failed to clear results dir {}", dest.display()))?;
    }

    let copied = copy_dir_recursive(src, dest)?;
    Ok(Some(copied))
}

fn ensure_inside(root: &Path, dest: &Path) -> Result<()> {
    let inside = dest.strip_prefix(root).is_ok_and(|rel| {
        rel.components().next().is_some()
            && rel.components().all(|c| matches!(c, Component::Normal(_)))
    });
    if !inside {
        bail!(
            "refusing to replace {}: not inside results dir {}",
            dest.display(),
            root.display()
        );
    }
    Ok(())
}

fn copy_dir_recursive(src: &Path, dest: &Path) -> Result<usize> {
    fs::create_dir_all(dest)
        .with_context(|| format!("failed to create results dir {}", dest.display()))?;

    let mut copied = 0;
    let entries =
        fs::read_dir(src).with_context(|| format!("failed to read dir {}", src.display()))?;
    for entry in entries {
        let entry = entry.with_context(|| format!("failed to read entry in {}", src.display()))?;
        let from = entry.path();
        let to = dest.join(entry.file_name());
        let file_type = entry
            .file_type()
            .with_context(|| format!("failed to stat {}", from.display()))?;

        if file_type.is_dir() {
            copied += copy_dir_recursive(&from, &to)?;
        } else {
            fs::copy(&from, &to).with_context(|| {
                format!("failed to copy {} to {}", from.display(), to.display())
            })?;
            copied += 1;
        }
    }
    Ok(copied)
}
