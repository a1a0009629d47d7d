//! Task lifecycle management: creation, execution, retry/backoff, and the
//! alarm-driven due-task batch.
//!
//! The manager is the only writer of task rows for its instance. Execution
//! itself is delegated to an injected [`TaskHandler`]; the manager only
//! orchestrates calling it and interpreting the outcome. A handler failure
//! is never propagated upward — it becomes a retry-or-fail decision.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;

use agentcell_core::{Error, Result};

use crate::alarm::{ALARM_BATCH, AlarmScheduler};
use crate::store::{InstanceDb, fmt_ts};
use crate::tasks::{DEFAULT_MAX_RETRIES, Task, TaskPatch, TaskStatus, backoff_delay_ms};

/// The per-agent execution hook. Implemented by each concrete agent and
/// injected at construction; the scheduler never interprets payloads.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn execute(&self, task: &Task) -> Result<serde_json::Value>;
}

/// Options for [`TaskLifecycleManager::create_task`].
#[derive(Debug, Default, Clone)]
pub struct CreateOptions {
    pub max_retries: Option<u32>,
    pub schedule_for: Option<DateTime<Utc>>,
}

/// Whether `retry_task` re-queued the task or forced it terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryOutcome {
    Retried,
    NotRetried,
}

pub struct TaskLifecycleManager {
    db: InstanceDb,
    handler: Arc<dyn TaskHandler>,
    alarm: Arc<AlarmScheduler>,
}

impl TaskLifecycleManager {
    pub fn new(db: InstanceDb, handler: Arc<dyn TaskHandler>, alarm: Arc<AlarmScheduler>) -> Self {
        Self { db, handler, alarm }
    }

    /// Read access for the owning instance's query routes.
    pub fn db(&self) -> &InstanceDb {
        &self.db
    }

    pub fn alarm(&self) -> &Arc<AlarmScheduler> {
        &self.alarm
    }

    /// Insert a new pending task. A scheduled task arms the alarm for its
    /// timestamp; an unscheduled one is the caller's to kick off
    /// (fire-and-forget, never awaited by the creating request).
    pub fn create_task(
        &self,
        name: &str,
        payload: serde_json::Value,
        opts: CreateOptions,
    ) -> Result<Task> {
        if name.is_empty() {
            return Err(Error::Validation("Task name required".into()));
        }
        let task = Task::new(
            name,
            payload,
            opts.max_retries.unwrap_or(DEFAULT_MAX_RETRIES),
            opts.schedule_for,
        );
        self.db.create(&task)?;
        self.touch()?;
        self.log_event(
            "info",
            "task created",
            serde_json::json!({"taskId": task.id, "name": task.name}),
        );
        tracing::info!(task = %task.id, name = %task.name, scheduled = task.scheduled_for.is_some(), "task created");
        if let Some(at) = task.scheduled_for {
            self.alarm.arm(at);
        }
        Ok(task)
    }

    /// Execute one task to its next state: `running`, then `completed` on
    /// success, or back into the retry path on handler failure.
    pub async fn run_task(&self, id: &str) -> Result<Task> {
        let now = Utc::now();
        self.db.update(
            id,
            &TaskPatch {
                status: Some(TaskStatus::Running),
                started_at: Some(now),
                ..Default::default()
            },
        )?;
        self.touch()?;
        let task = self
            .db
            .get(id)?
            .ok_or_else(|| Error::NotFound("Task not found".into()))?;

        // No timeout and no cancellation here: once invoked, the hook runs
        // to completion or returns an error.
        match self.handler.execute(&task).await {
            Ok(result) => {
                self.db.update(
                    id,
                    &TaskPatch {
                        status: Some(TaskStatus::Completed),
                        result: Some(result),
                        completed_at: Some(Utc::now()),
                        ..Default::default()
                    },
                )?;
                self.touch()?;
                self.log_event(
                    "info",
                    "task completed",
                    serde_json::json!({"taskId": id, "name": task.name}),
                );
                tracing::info!(task = %id, "task completed");
            }
            Err(e) => {
                let message = e.to_string();
                tracing::warn!(task = %id, error = %message, "task execution failed");
                self.db.update(
                    id,
                    &TaskPatch {
                        error: Some(message.clone()),
                        ..Default::default()
                    },
                )?;
                let delay = backoff_delay_ms(task.retry_count);
                let outcome = self.retry_task(id, delay)?;
                self.log_event(
                    "warn",
                    "task execution failed",
                    serde_json::json!({
                        "taskId": id,
                        "error": message,
                        "retried": outcome == RetryOutcome::Retried,
                    }),
                );
            }
        }

        self.db
            .get(id)?
            .ok_or_else(|| Error::NotFound("Task not found".into()))
    }

    /// Re-queue a task with a delay, or force it terminal when its retry
    /// budget is spent. Increments `retry_count` by exactly one per
    /// successful retry.
    pub fn retry_task(&self, id: &str, delay_ms: i64) -> Result<RetryOutcome> {
        let task = self
            .db
            .get(id)?
            .ok_or_else(|| Error::NotFound("Task not found".into()))?;

        if task.retry_count >= task.max_retries {
            self.db.update(
                id,
                &TaskPatch {
                    status: Some(TaskStatus::Failed),
                    error: Some(format!("Max retries ({}) exceeded", task.max_retries)),
                    completed_at: Some(Utc::now()),
                    ..Default::default()
                },
            )?;
            self.touch()?;
            tracing::warn!(task = %id, max_retries = task.max_retries, "retry budget exhausted");
            return Ok(RetryOutcome::NotRetried);
        }

        let at = Utc::now() + Duration::milliseconds(delay_ms);
        self.db.update(
            id,
            &TaskPatch {
                status: Some(TaskStatus::Pending),
                retry_count: Some(task.retry_count + 1),
                scheduled_for: Some(at),
                ..Default::default()
            },
        )?;
        self.touch()?;
        self.alarm.arm(at);
        tracing::info!(task = %id, attempt = task.retry_count + 1, delay_ms, "task retry scheduled");
        Ok(RetryOutcome::Retried)
    }

    /// The external `→ cancelled` transition. Only a pending task can be
    /// cancelled — there is no mechanism to interrupt a hook mid-flight.
    pub fn cancel_task(&self, id: &str) -> Result<Task> {
        let task = self
            .db
            .get(id)?
            .ok_or_else(|| Error::NotFound("Task not found".into()))?;
        if task.status != TaskStatus::Pending {
            return Err(Error::Validation(format!(
                "Cannot cancel task in status '{}'",
                task.status.as_str()
            )));
        }
        self.db.update(
            id,
            &TaskPatch {
                status: Some(TaskStatus::Cancelled),
                completed_at: Some(Utc::now()),
                ..Default::default()
            },
        )?;
        self.touch()?;
        self.db
            .get(id)?
            .ok_or_else(|| Error::NotFound("Task not found".into()))
    }

    /// One alarm firing: run up to [`ALARM_BATCH`] due tasks sequentially,
    /// oldest first, then re-arm for the earliest remaining scheduled task
    /// (clamped to now if a capped batch left overdue work behind).
    /// Returns how many tasks were processed.
    pub async fn process_due(&self) -> Result<usize> {
        let now = Utc::now();
        let batch = self.db.due_batch(now, ALARM_BATCH)?;
        let processed = batch.len();
        if processed > 0 {
            tracing::info!(count = processed, "alarm firing");
        }
        let mut batch_error = None;
        for task in &batch {
            if let Err(e) = self.run_task(&task.id).await {
                // The caller already took the armed deadline; stop the
                // batch but fall through to the re-arm so the remaining
                // scheduled tasks are not stranded.
                tracing::warn!(task = %task.id, "due-task run failed: {e}");
                batch_error = Some(e);
                break;
            }
        }

        if let Some(next) = self.db.next_scheduled()? {
            let now = Utc::now();
            self.alarm.arm(next.max(now));
        }
        match batch_error {
            Some(e) => Err(e),
            None => Ok(processed),
        }
    }

    fn touch(&self) -> Result<()> {
        self.db.state_set("last_activity", &fmt_ts(&Utc::now()))
    }

    /// Observability writes are best-effort: a failed log insert must never
    /// fail the task operation that produced it.
    fn log_event(&self, level: &str, message: &str, context: serde_json::Value) {
        if let Err(e) = self.db.log(level, message, context) {
            tracing::warn!("log write failed: {e}");
        }
    }
}
