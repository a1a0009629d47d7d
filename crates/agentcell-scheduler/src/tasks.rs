//! Task definitions — the core data model for durable work.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Default retry budget for new tasks.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Base backoff delay (first retry waits this long).
pub const BACKOFF_BASE_MS: i64 = 1_000;

/// Backoff ceiling — five minutes, regardless of retry count.
pub const BACKOFF_CAP_MS: i64 = 300_000;

/// Capped exponential backoff: `min(2^retry_count * 1000, 300000)`.
/// Non-decreasing in `retry_count`.
pub fn backoff_delay_ms(retry_count: u32) -> i64 {
    // 2^19 s already exceeds the cap; clamp the shift to avoid overflow.
    let factor = 1_i64 << retry_count.min(19);
    (factor * BACKOFF_BASE_MS).min(BACKOFF_CAP_MS)
}

/// Task status.
///
/// `pending → running → {completed | failed}` with a `pending → pending`
/// retry self-loop; `cancelled` is an externally triggered terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(TaskStatus::Pending),
            "running" => Some(TaskStatus::Running),
            "completed" => Some(TaskStatus::Completed),
            "failed" => Some(TaskStatus::Failed),
            "cancelled" => Some(TaskStatus::Cancelled),
            _ => None,
        }
    }

    /// Terminal states carry a `completed_at` timestamp and never change
    /// again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }
}

/// A persisted unit of work.
///
/// `payload` and `result` are opaque to the scheduler — only the handler at
/// the edge deserializes them.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    /// Unique ID, generated at creation, immutable.
    pub id: String,
    /// Logical task type, used for filtering/dispatch by consumers.
    pub name: String,
    /// Opaque serialized data; never interpreted by the core.
    pub payload: serde_json::Value,
    pub status: TaskStatus,
    /// Opaque success payload from the handler.
    pub result: Option<serde_json::Value>,
    /// Last failure message. Not mutually exclusive with `result`.
    pub error: Option<String>,
    pub retry_count: u32,
    pub max_retries: u32,
    /// Set once, immutable.
    pub created_at: DateTime<Utc>,
    /// Set every time the task enters `running`.
    pub started_at: Option<DateTime<Utc>>,
    /// Set iff the task is in a terminal state.
    pub completed_at: Option<DateTime<Utc>>,
    /// Future eligibility time; `None` means immediately eligible.
    pub scheduled_for: Option<DateTime<Utc>>,
}

impl Task {
    /// Create a new pending task.
    pub fn new(
        name: &str,
        payload: serde_json::Value,
        max_retries: u32,
        scheduled_for: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.to_string(),
            payload,
            status: TaskStatus::Pending,
            result: None,
            error: None,
            retry_count: 0,
            max_retries,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            scheduled_for,
        }
    }

    /// API-facing JSON representation (camelCase keys).
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or_default()
    }
}

/// A partial update: only the supplied fields are written, everything else
/// is left untouched.
#[derive(Debug, Default, Clone)]
pub struct TaskPatch {
    pub status: Option<TaskStatus>,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    pub retry_count: Option<u32>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub scheduled_for: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_values() {
        assert_eq!(backoff_delay_ms(0), 1_000);
        assert_eq!(backoff_delay_ms(1), 2_000);
        assert_eq!(backoff_delay_ms(2), 4_000);
        assert_eq!(backoff_delay_ms(8), 256_000);
        // 2^9 s = 512s > cap
        assert_eq!(backoff_delay_ms(9), 300_000);
        assert_eq!(backoff_delay_ms(63), 300_000);
    }

    #[test]
    fn test_backoff_non_decreasing_and_capped() {
        let mut prev = 0;
        for n in 0..40 {
            let d = backoff_delay_ms(n);
            assert!(d >= prev);
            assert!(d <= BACKOFF_CAP_MS);
            prev = d;
        }
    }

    #[test]
    fn test_status_roundtrip() {
        for s in [
            TaskStatus::Pending,
            TaskStatus::Running,
            TaskStatus::Completed,
            TaskStatus::Failed,
            TaskStatus::Cancelled,
        ] {
            assert_eq!(TaskStatus::parse(s.as_str()), Some(s));
        }
        assert_eq!(TaskStatus::parse("bogus"), None);
    }

    #[test]
    fn test_terminal_states() {
        assert!(!TaskStatus::Pending.is_terminal());
        assert!(!TaskStatus::Running.is_terminal());
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(TaskStatus::Cancelled.is_terminal());
    }

    #[test]
    fn test_new_task_defaults() {
        let t = Task::new("sync", serde_json::json!({"n": 1}), 3, None);
        assert_eq!(t.status, TaskStatus::Pending);
        assert_eq!(t.retry_count, 0);
        assert!(t.started_at.is_none());
        assert!(t.completed_at.is_none());
        assert!(t.scheduled_for.is_none());
        assert!(!t.id.is_empty());
    }

    #[test]
    fn test_json_shape_is_camel_case() {
        let t = Task::new("sync", serde_json::Value::Null, 2, None);
        let v = t.to_json();
        assert!(v.get("retryCount").is_some());
        assert!(v.get("maxRetries").is_some());
        assert!(v.get("createdAt").is_some());
        assert!(v.get("scheduledFor").is_some());
        assert_eq!(v["status"], "pending");
    }
}
