//! ExecResult — the structured record of one command execution.
//!
//! The engine emits one record per target as a single JSON line. Field
//! order in the serialised object follows the declaration order below, so
//! downstream consumers can rely on it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The result of executing one command against one target.
///
/// `error` is empty when the process was spawned, waited on, and exited
/// with status zero; anything else (spawn failure, non-zero exit, death by
/// signal) is described there. `exit_status` carries the exit code when
/// the wait status has one, and stays zero otherwise.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecResult {
    pub target: String,
    pub duration: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub exit_status: i32,
    pub stdout: String,
    pub stderr: String,
    #[serde(rename = "error")]
    pub error: String,
}

impl ExecResult {
    /// Open a record for `target`, stamping the start time.
    pub fn begin(target: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            target: target.into(),
            duration: String::new(),
            start_time: now,
            end_time: now,
            exit_status: 0,
            stdout: String::new(),
            stderr: String::new(),
            error: String::new(),
        }
    }

    /// Seal the record: stamp the end time and render the duration.
    ///
    /// The duration string round-trips through `humantime::parse_duration`
    /// to exactly `end_time - start_time`.
    pub fn seal(&mut self) {
        self.end_time = Utc::now();
        let elapsed = (self.end_time - self.start_time)
            .to_std()
            .unwrap_or_default();
        self.duration = humantime::format_duration(elapsed).to_string();
    }
}
