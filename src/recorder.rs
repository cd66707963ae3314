//! Decision Recorder
//!
//! Appends one sorted-key JSON object per line to the decision log — the
//! audit record every external observer consumes — and maintains the current
//! posture snapshot both in memory and as `status.json` under the runtime
//! directory (atomic-rename discipline).

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::config::{ActionPreset, PathsConfig};
use crate::types::{Mode, ScoreResult};

/// Most recent posture numbers, for pollers that prefer not to tail the log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub mode: String,
    pub average: f64,
    /// Unix epoch seconds
    pub timestamp: f64,
}

impl Snapshot {
    fn initial() -> Self {
        Self { mode: Mode::Portal.as_str().to_string(), average: 0.0, timestamp: epoch_now() }
    }
}

/// One decision-log line.
#[derive(Debug, Clone, Serialize)]
pub struct DecisionEntry {
    pub timestamp: String,
    pub event: String,
    pub score: f64,
    pub classification: String,
    pub average: f64,
    pub desired_mode: String,
    pub target_mode: String,
    pub mode: String,
    pub actions: ActionPreset,
    pub src_ip: Option<String>,
    pub mode_snapshot: Snapshot,
}

/// Deep follow-up line appended by the background worker.
#[derive(Debug, Clone, Serialize)]
pub struct FollowupEntry {
    pub timestamp: String,
    pub event: String,
    pub score: f64,
    pub classification: String,
    pub deep: ScoreResult,
    pub note: String,
}

impl FollowupEntry {
    pub fn new(signature: &str, sensor_ts: Option<&str>, result: &ScoreResult) -> Self {
        Self {
            timestamp: sensor_ts.map(str::to_string).unwrap_or_else(iso_now),
            event: if signature.is_empty() { "deep_ai".to_string() } else { signature.to_string() },
            score: f64::from(result.score),
            classification: result.category.as_str().to_string(),
            deep: result.clone(),
            note: "deep_followup".to_string(),
        }
    }
}

pub struct DecisionRecorder {
    log_path: PathBuf,
    status_path: PathBuf,
    snapshot: Mutex<Snapshot>,
}

impl DecisionRecorder {
    pub fn new(paths: &PathsConfig) -> Self {
        Self {
            log_path: paths.decisions_log.clone(),
            status_path: paths.status_file(),
            snapshot: Mutex::new(Snapshot::initial()),
        }
    }

    /// Append one decision line and refresh the snapshot.
    pub fn append(&self, entry: &DecisionEntry) -> bool {
        let written = self.write_line(entry);

        {
            let mut snapshot = self.snapshot.lock().expect("snapshot lock poisoned");
            *snapshot = entry.mode_snapshot.clone();
        }
        self.write_status(&entry.mode_snapshot);

        written
    }

    /// Append one deep follow-up line (does not touch the snapshot).
    pub fn append_followup(&self, entry: &FollowupEntry) -> bool {
        self.write_line(entry)
    }

    pub fn snapshot(&self) -> Snapshot {
        self.snapshot.lock().expect("snapshot lock poisoned").clone()
    }

    fn write_line<T: Serialize>(&self, entry: &T) -> bool {
        // Through Value: serde_json objects are key-sorted maps
        let value = match serde_json::to_value(entry) {
            Ok(v) => v,
            Err(e) => {
                warn!("Cannot serialize decision entry: {}", e);
                return false;
            }
        };

        if let Some(parent) = self.log_path.parent() {
            if let Err(e) = std::fs::create_dir_all(parent) {
                warn!("Cannot create log dir {:?}: {}", parent, e);
                return false;
            }
        }

        let result = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_path)
            .and_then(|mut file| {
                writeln!(file, "{}", value)?;
                file.flush()
            });

        match result {
            Ok(()) => true,
            Err(e) => {
                warn!("Cannot append to {:?}: {}", self.log_path, e);
                false
            }
        }
    }

    fn write_status(&self, snapshot: &Snapshot) {
        let Some(parent) = self.status_path.parent() else { return };
        if std::fs::create_dir_all(parent).is_err() {
            return;
        }
        let tmp = self.status_path.with_extension("tmp");
        let Ok(serialized) = serde_json::to_string(snapshot) else { return };
        if std::fs::write(&tmp, serialized).is_ok() {
            let _ = std::fs::rename(&tmp, &self.status_path);
        }
    }
}

/// Read a snapshot file written by a (possibly other) daemon process.
pub fn read_status(path: &Path) -> Option<Snapshot> {
    let content = std::fs::read_to_string(path).ok()?;
    serde_json::from_str(&content).ok()
}

pub fn iso_now() -> String {
    Utc::now().to_rfc3339()
}

pub fn epoch_now() -> f64 {
    Utc::now().timestamp_millis() as f64 / 1000.0
}
