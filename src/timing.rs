//! Checkpoint timing for external monitoring.
//!
//! Every checkpoint is kept in memory and appended as one JSON line to a
//! shared store, so peer ranks writing the same file never rewrite each
//! other's entries.

use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::{Deserialize, Serialize};

/// Job id used for checkpoints recorded before the job is known.
pub const NO_JOB: &str = "0";

pub const PRE_STAGEIN: &str = "PILOT_PRE_STAGEIN";
pub const POST_STAGEIN: &str = "PILOT_POST_STAGEIN";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimingEntry {
    pub jobid: String,
    pub checkpoint: String,
    /// Seconds since the Unix epoch.
    pub timestamp: f64,
}

/// Append-only checkpoint log.
#[derive(Debug)]
pub struct TimingRecorder {
    store: Option<PathBuf>,
    entries: Vec<TimingEntry>,
}

impl TimingRecorder {
    /// Recorder persisting to `store`.
    pub fn new(store: impl Into<PathBuf>) -> Self {
        Self {
            store: Some(store.into()),
            entries: Vec::new(),
        }
    }

    /// Recorder that only keeps entries in memory.
    pub fn in_memory() -> Self {
        Self {
            store: None,
            entries: Vec::new(),
        }
    }

    /// Record `checkpoint` for `jobid` at the current wall-clock time.
    ///
    /// A store that cannot be written is logged and otherwise ignored.
    pub fn record(&mut self, jobid: &str, checkpoint: &str) {
        let entry = TimingEntry {
            jobid: jobid.to_string(),
            checkpoint: checkpoint.to_string(),
            timestamp: Utc::now().timestamp_micros() as f64 / 1_000_000.0,
        };
        tracing::debug!(jobid, checkpoint, timestamp = entry.timestamp, "timing checkpoint");

        if let Some(store) = &self.store {
            if let Err(e) = append_entry(store, &entry) {
                tracing::warn!(store = %store.display(), error = %e, "failed to persist timing checkpoint");
            }
        }
        self.entries.push(entry);
    }

    pub fn entries(&self) -> &[TimingEntry] {
        &self.entries
    }

    /// Whether `checkpoint` was recorded for `jobid`.
    #[cfg(test)]
    pub fn has(&self, jobid: &str, checkpoint: &str) -> bool {
        self.entries
            .iter()
            .any(|e| e.jobid == jobid && e.checkpoint == checkpoint)
    }
}

fn append_entry(store: &Path, entry: &TimingEntry) -> std::io::Result<()> {
    let mut line = serde_json::to_vec(entry)?;
    line.push(b'\n');
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(store)?;
    file.write_all(&line)
}
