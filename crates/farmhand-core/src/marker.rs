//! The one piece of state that has to survive a worker restart.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{TaskId, TaskStatus};

/// Number of sequence numbers reserved per marker write.
pub const SEQ_BLOCK: u64 = 64;

/// Durable record of the task this worker is responsible for.
///
/// Written before a task starts executing, rewritten on every local status
/// change and sequence reservation, removed once the manager acknowledged
/// the terminal report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedTaskMarker {
    pub task_id: TaskId,

    /// Last status observed locally.
    pub status: TaskStatus,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    pub updated_at: DateTime<Utc>,

    /// Every sequence number used for this task so far is below this.
    pub seq_reserved: u64,

    /// Sequence number of the terminal update, once decided.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_seq: Option<u64>,
}

impl PersistedTaskMarker {
    /// Marker for a freshly claimed task.
    pub fn claimed(task_id: TaskId) -> Self {
        Self {
            task_id,
            status: TaskStatus::Active,
            reason: None,
            updated_at: Utc::now(),
            seq_reserved: SEQ_BLOCK,
            final_seq: None,
        }
    }

    /// Record a new reservation ceiling.
    pub fn reserve(&mut self, seq_reserved: u64) {
        self.seq_reserved = seq_reserved;
        self.updated_at = Utc::now();
    }

    /// Record the terminal status and the sequence number it goes out with.
    pub fn finish(&mut self, status: TaskStatus, reason: Option<String>, final_seq: u64) {
        self.status = status;
        self.reason = reason;
        self.final_seq = Some(final_seq);
        self.seq_reserved = self.seq_reserved.max(final_seq + 1);
        self.updated_at = Utc::now();
    }

    /// Status and reason to report after a restart.
    ///
    /// A task that never reached a terminal status locally was interrupted;
    /// it is reported failed instead of being re-run.
    pub fn recovery_status(&self) -> (TaskStatus, String) {
        if self.status.is_terminal() {
            let reason = self
                .reason
                .clone()
                .unwrap_or_else(|| format!("reported after worker restart ({})", self.status));
            (self.status, reason)
        } else {
            (TaskStatus::Failed, "worker restarted".to_string())
        }
    }

    /// Sequence number for the recovery report.
    ///
    /// Reuses the terminal update's number when one was decided, so a report
    /// that did reach the manager is recognised as a replay; otherwise the
    /// first number past the reservation, which cannot collide.
    pub fn recovery_seq(&self) -> u64 {
        self.final_seq.unwrap_or(self.seq_reserved)
    }
}
