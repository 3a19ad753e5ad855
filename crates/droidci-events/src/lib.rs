//! Event logging for droidci reconciliation runs.
//!
//! Every execution attempt, parsed report and verdict is recorded as one
//! JSON line in `events.jsonl` under the state directory. The log is
//! append-only and shared by every target reconciled in a pipeline run, so
//! it doubles as the audit trail of which tests were retried and how often.
//! It is removed along with the build status when a new pipeline starts.
//!
//! # Example
//!
//! ```
//! use droidci_events::EventLog;
//! use droidci_types::{EventType, RunPhase};
//!
//! let mut log = EventLog::new();
//! log.record("aws-android-sdk-s3", EventType::RunStarted {
//!     phase: RunPhase::Initial,
//!     attempt: 1,
//!     command: "./gradlew :aws-android-sdk-s3:connectedAndroidTest".to_string(),
//! });
//! assert_eq!(log.len(), 1);
//! ```

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;
use droidci_types::{EventType, ReconcileEvent};

/// Default events file name
pub const EVENTS_FILE: &str = "events.jsonl";

/// Get the events file path for a state directory
pub fn events_path(state_dir: &Path) -> PathBuf {
    state_dir.join(EVENTS_FILE)
}

/// Remove the events file in `state_dir`. Returns whether one existed.
pub fn clear_events(state_dir: &Path) -> Result<bool> {
    let path = events_path(state_dir);
    if !path.exists() {
        return Ok(false);
    }
    fs::remove_file(&path)
        .with_context(|| format!("failed to remove events file {}", path.display()))?;
    Ok(true)
}

/// Buffered, append-only event log.
#[derive(Debug, Default)]
pub struct EventLog {
    events: Vec<ReconcileEvent>,
}

impl EventLog {
    pub fn new() -> Self {
        Self { events: Vec::new() }
    }

    /// Record an event for `target`, stamped with the current time.
    pub fn record(&mut self, target: &str, event_type: EventType) {
        self.push(ReconcileEvent {
            timestamp: Utc::now(),
            target: target.to_string(),
            event_type,
        });
    }

    pub fn push(&mut self, event: ReconcileEvent) {
        self.events.push(event);
    }

    /// Append all buffered events to `path` in JSONL format.
    pub fn write_to_file(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create events dir {}", parent.display()))?;
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("failed to open events file {}", path.display()))?;

        let mut writer = std::io::BufWriter::new(file);

        for event in &self.events {
            let line = serde_json::to_string(event).context("failed to serialize event to JSON")?;
            writeln!(writer, "{}", line).context("failed to write event line")?;
        }

        writer.flush().context("failed to flush events file")?;

        Ok(())
    }

    /// Write buffered events to `path` and clear the buffer.
    pub fn flush_to(&mut self, path: &Path) -> Result<()> {
        self.write_to_file(path)?;
        self.clear();
        Ok(())
    }

    /// Read all events from a JSONL file. A missing file yields an empty log.
    pub fn read_from_file(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::new());
        }

        let file = File::open(path)
            .with_context(|| format!("failed to open events file {}", path.display()))?;

        let reader = BufReader::new(file);
        let mut events = Vec::new();

        for line in reader.lines() {
            let line = line.with_context(|| {
                format!("failed to read line from events file {}", path.display())
            })?;
            if line.trim().is_empty() {
                continue;
            }
            let event: ReconcileEvent = serde_json::from_str(&line)
                .with_context(|| format!("failed to parse event JSON from line: {}", line))?;
            events.push(event);
        }

        Ok(Self { events })
    }

    pub fn all_events(&self) -> &[ReconcileEvent] {
        &self.events
    }

    pub fn clear(&mut self) {
        self.events.clear();
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}
