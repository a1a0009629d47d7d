//! SQLite-backed persistence for one agent instance: tasks, the agent_state
//! key-value table, and (in `logstore`) the bounded event log.
//!
//! Timestamps are stored as fixed-width RFC 3339 UTC text with millisecond
//! precision, so lexicographic comparison in SQL equals chronological order.

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Value as SqlValue;
use std::path::Path;

use agentcell_core::{Error, Result};

use crate::tasks::{Task, TaskPatch, TaskStatus};

/// Format a timestamp for storage and comparison.
pub(crate) fn fmt_ts(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Strict parse for timestamps this store wrote itself. A corrupt value is
/// a storage error, never a substituted timestamp.
pub(crate) fn parse_ts(s: &str) -> std::result::Result<DateTime<Utc>, chrono::ParseError> {
    DateTime::parse_from_rfc3339(s).map(|d| d.with_timezone(&Utc))
}

/// Wrap a timestamp parse failure so it propagates through rusqlite's row
/// mapping like any other column conversion error.
pub(crate) fn ts_column(
    idx: usize,
    s: &str,
) -> rusqlite::Result<DateTime<Utc>> {
    parse_ts(s).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn parse_opt_ts(s: Option<String>) -> Option<DateTime<Utc>> {
    s.and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
        .map(|d| d.with_timezone(&Utc))
}

const TASK_COLUMNS: &str = "id, name, payload, status, result, error, retry_count, max_retries, \
     created_at, started_at, completed_at, scheduled_for";

/// Derived per-instance aggregate — computed from task rows, never stored.
#[derive(Debug, Clone)]
pub struct AgentStateSnapshot {
    pub tasks_completed: i64,
    pub tasks_failed: i64,
    /// True iff at least one task is currently `running`.
    pub busy: bool,
    pub last_activity: Option<DateTime<Utc>>,
}

/// Relational store owned by exactly one agent instance.
///
/// All operations are synchronous and per-statement atomic; cross-row
/// transactions are not needed because the owning instance serializes
/// every call.
pub struct InstanceDb {
    conn: std::sync::Mutex<rusqlite::Connection>,
}

impl InstanceDb {
    /// Open or create the instance database.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = rusqlite::Connection::open(path)?;
        let db = Self {
            conn: std::sync::Mutex::new(conn),
        };
        db.migrate()?;
        Ok(db)
    }

    /// In-memory store, used by tests and the `data_dir = ""` configuration.
    pub fn open_in_memory() -> Result<Self> {
        let conn = rusqlite::Connection::open_in_memory()?;
        let db = Self {
            conn: std::sync::Mutex::new(conn),
        };
        db.migrate()?;
        Ok(db)
    }

    pub(crate) fn conn(&self) -> std::sync::MutexGuard<'_, rusqlite::Connection> {
        self.conn.lock().expect("instance db mutex poisoned")
    }

    /// Run migrations to create tables and the two access-pattern indices
    /// the alarm path filters on.
    fn migrate(&self) -> Result<()> {
        self.conn().execute_batch(
            "
            CREATE TABLE IF NOT EXISTS tasks (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                payload TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                result TEXT,
                error TEXT,
                retry_count INTEGER NOT NULL DEFAULT 0,
                max_retries INTEGER NOT NULL DEFAULT 3,
                created_at TEXT NOT NULL,
                started_at TEXT,
                completed_at TEXT,
                scheduled_for TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status);
            CREATE INDEX IF NOT EXISTS idx_tasks_scheduled_for ON tasks(scheduled_for);

            CREATE TABLE IF NOT EXISTS agent_state (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS logs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                level TEXT NOT NULL,
                message TEXT NOT NULL,
                context TEXT,
                created_at TEXT NOT NULL
            );
            ",
        )?;
        Ok(())
    }

    // ─── Tasks ────────────────────────────────────────────────

    /// Insert a new task row.
    pub fn create(&self, task: &Task) -> Result<()> {
        self.conn().execute(
            "INSERT INTO tasks (id, name, payload, status, result, error, retry_count, max_retries,
                                created_at, started_at, completed_at, scheduled_for)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            rusqlite::params![
                task.id,
                task.name,
                task.payload.to_string(),
                task.status.as_str(),
                task.result.as_ref().map(|v| v.to_string()),
                task.error,
                task.retry_count,
                task.max_retries,
                fmt_ts(&task.created_at),
                task.started_at.map(|t| fmt_ts(&t)),
                task.completed_at.map(|t| fmt_ts(&t)),
                task.scheduled_for.map(|t| fmt_ts(&t)),
            ],
        )?;
        Ok(())
    }

    /// Fetch a task by id.
    pub fn get(&self, id: &str) -> Result<Option<Task>> {
        let conn = self.conn();
        let mut stmt =
            conn.prepare(&format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1"))?;
        let mut rows = stmt.query_map([id], row_to_task)?;
        match rows.next() {
            Some(task) => Ok(Some(task?)),
            None => Ok(None),
        }
    }

    /// Apply a partial update — only the fields present in the patch are
    /// written.
    pub fn update(&self, id: &str, patch: &TaskPatch) -> Result<()> {
        let mut sets: Vec<&str> = Vec::new();
        let mut args: Vec<SqlValue> = Vec::new();

        if let Some(status) = patch.status {
            sets.push("status = ?");
            args.push(SqlValue::from(status.as_str().to_string()));
        }
        if let Some(result) = &patch.result {
            sets.push("result = ?");
            args.push(SqlValue::from(result.to_string()));
        }
        if let Some(error) = &patch.error {
            sets.push("error = ?");
            args.push(SqlValue::from(error.clone()));
        }
        if let Some(rc) = patch.retry_count {
            sets.push("retry_count = ?");
            args.push(SqlValue::from(rc as i64));
        }
        if let Some(t) = patch.started_at {
            sets.push("started_at = ?");
            args.push(SqlValue::from(fmt_ts(&t)));
        }
        if let Some(t) = patch.completed_at {
            sets.push("completed_at = ?");
            args.push(SqlValue::from(fmt_ts(&t)));
        }
        if let Some(t) = patch.scheduled_for {
            sets.push("scheduled_for = ?");
            args.push(SqlValue::from(fmt_ts(&t)));
        }
        if sets.is_empty() {
            return Ok(());
        }

        let sql = format!("UPDATE tasks SET {} WHERE id = ?", sets.join(", "));
        args.push(SqlValue::from(id.to_string()));
        let changed = self
            .conn()
            .execute(&sql, rusqlite::params_from_iter(args))?;
        if changed == 0 {
            return Err(Error::NotFound("Task not found".into()));
        }
        Ok(())
    }

    /// All pending tasks, oldest first, optionally filtered by name.
    pub fn list_pending(&self, name_filter: Option<&str>) -> Result<Vec<Task>> {
        let (sql, params): (String, Vec<SqlValue>) = match name_filter {
            Some(name) => (
                format!(
                    "SELECT {TASK_COLUMNS} FROM tasks WHERE status = 'pending' AND name = ?1
                     ORDER BY created_at ASC, rowid ASC"
                ),
                vec![SqlValue::from(name.to_string())],
            ),
            None => (
                format!(
                    "SELECT {TASK_COLUMNS} FROM tasks WHERE status = 'pending'
                     ORDER BY created_at ASC, rowid ASC"
                ),
                Vec::new(),
            ),
        };
        let conn = self.conn();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(rusqlite::params_from_iter(params), row_to_task)?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }

    /// Newest tasks first, for read APIs.
    pub fn list_recent(&self, status: Option<TaskStatus>, limit: usize) -> Result<Vec<Task>> {
        let (sql, params): (String, Vec<SqlValue>) = match status {
            Some(status) => (
                format!(
                    "SELECT {TASK_COLUMNS} FROM tasks WHERE status = ?1
                     ORDER BY created_at DESC, rowid DESC LIMIT ?2"
                ),
                vec![
                    SqlValue::from(status.as_str().to_string()),
                    SqlValue::from(limit as i64),
                ],
            ),
            None => (
                format!(
                    "SELECT {TASK_COLUMNS} FROM tasks
                     ORDER BY created_at DESC, rowid DESC LIMIT ?1"
                ),
                vec![SqlValue::from(limit as i64)],
            ),
        };
        let conn = self.conn();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(rusqlite::params_from_iter(params), row_to_task)?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }

    /// Total number of tasks matching the status filter, independent of any
    /// page limit.
    pub fn count_tasks(&self, status: Option<TaskStatus>) -> Result<i64> {
        let count = match status {
            Some(status) => self.conn().query_row(
                "SELECT COUNT(*) FROM tasks WHERE status = ?1",
                [status.as_str()],
                |row| row.get(0),
            )?,
            None => self
                .conn()
                .query_row("SELECT COUNT(*) FROM tasks", [], |row| row.get(0))?,
        };
        Ok(count)
    }

    /// The alarm batch: pending tasks whose `scheduled_for` is null or due,
    /// oldest first, capped at `limit`.
    pub fn due_batch(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Task>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks
             WHERE status = 'pending' AND (scheduled_for IS NULL OR scheduled_for <= ?1)
             ORDER BY created_at ASC, rowid ASC LIMIT ?2"
        ))?;
        let rows = stmt.query_map(
            rusqlite::params![fmt_ts(&now), limit as i64],
            row_to_task,
        )?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }

    /// Earliest `scheduled_for` among pending tasks that have one, if any.
    /// The lifecycle manager clamps past values to "now" when re-arming.
    pub fn next_scheduled(&self) -> Result<Option<DateTime<Utc>>> {
        let min: Option<String> = self.conn().query_row(
            "SELECT MIN(scheduled_for) FROM tasks
             WHERE status = 'pending' AND scheduled_for IS NOT NULL",
            [],
            |row| row.get(0),
        )?;
        Ok(parse_opt_ts(min))
    }

    // ─── Agent state (key-value) ──────────────────────────────

    pub fn state_set(&self, key: &str, value: &str) -> Result<()> {
        self.conn().execute(
            "INSERT OR REPLACE INTO agent_state (key, value, updated_at) VALUES (?1, ?2, ?3)",
            rusqlite::params![key, value, fmt_ts(&Utc::now())],
        )?;
        Ok(())
    }

    pub fn state_get(&self, key: &str) -> Result<Option<String>> {
        let conn = self.conn();
        let mut stmt = conn.prepare("SELECT value FROM agent_state WHERE key = ?1")?;
        let mut rows = stmt.query_map([key], |row| row.get::<_, String>(0))?;
        match rows.next() {
            Some(v) => Ok(Some(v?)),
            None => Ok(None),
        }
    }

    /// Aggregate view over task rows plus the recorded last activity.
    pub fn state_snapshot(&self) -> Result<AgentStateSnapshot> {
        let mut completed = 0;
        let mut failed = 0;
        let mut running = 0;
        {
            let conn = self.conn();
            let mut stmt = conn.prepare("SELECT status, COUNT(*) FROM tasks GROUP BY status")?;
            let rows = stmt.query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
            })?;
            for row in rows {
                let (status, count) = row?;
                match status.as_str() {
                    "completed" => completed = count,
                    "failed" => failed = count,
                    "running" => running = count,
                    _ => {}
                }
            }
        }

        let last_activity = match self.state_get("last_activity")? {
            Some(s) => Some(
                parse_ts(&s)
                    .map_err(|e| Error::Storage(format!("bad last_activity timestamp: {e}")))?,
            ),
            None => None,
        };
        Ok(AgentStateSnapshot {
            tasks_completed: completed,
            tasks_failed: failed,
            busy: running > 0,
            last_activity,
        })
    }
}

fn row_to_task(row: &rusqlite::Row<'_>) -> rusqlite::Result<Task> {
    let payload_str: String = row.get(2)?;
    let status_str: String = row.get(3)?;
    let result_str: Option<String> = row.get(4)?;
    let created_at_str: String = row.get(8)?;

    Ok(Task {
        id: row.get(0)?,
        name: row.get(1)?,
        payload: serde_json::from_str(&payload_str).unwrap_or_default(),
        status: TaskStatus::parse(&status_str).unwrap_or(TaskStatus::Pending),
        result: result_str.and_then(|s| serde_json::from_str(&s).ok()),
        error: row.get(5)?,
        retry_count: row.get(6)?,
        max_retries: row.get(7)?,
        created_at: ts_column(8, &created_at_str)?,
        started_at: parse_opt_ts(row.get(9)?),
        completed_at: parse_opt_ts(row.get(10)?),
        scheduled_for: parse_opt_ts(row.get(11)?),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;

    fn db() -> InstanceDb {
        InstanceDb::open_in_memory().unwrap()
    }

    #[test]
    fn test_open_on_disk_and_migrate_twice() {
        let dir = std::env::temp_dir().join("agentcell-store-test");
        std::fs::create_dir_all(&dir).ok();
        let path = dir.join("instance.db");
        {
            let db = InstanceDb::open(&path).unwrap();
            db.create(&Task::new("a", json!({}), 3, None)).unwrap();
        }
        // Re-open: migrations are idempotent, data survives.
        let db = InstanceDb::open(&path).unwrap();
        assert_eq!(db.list_pending(None).unwrap().len(), 1);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_create_and_get_roundtrip() {
        let db = db();
        let task = Task::new("sync", json!({"page": 3}), 5, None);
        db.create(&task).unwrap();

        let loaded = db.get(&task.id).unwrap().unwrap();
        assert_eq!(loaded.id, task.id);
        assert_eq!(loaded.name, "sync");
        assert_eq!(loaded.payload, json!({"page": 3}));
        assert_eq!(loaded.max_retries, 5);
        assert_eq!(loaded.status, TaskStatus::Pending);
        assert!(loaded.scheduled_for.is_none());
    }

    #[test]
    fn test_get_missing_returns_none() {
        assert!(db().get("nope").unwrap().is_none());
    }

    #[test]
    fn test_update_patches_only_supplied_fields() {
        let db = db();
        let task = Task::new("sync", json!({}), 3, None);
        db.create(&task).unwrap();

        let now = Utc::now();
        db.update(
            &task.id,
            &TaskPatch {
                status: Some(TaskStatus::Running),
                started_at: Some(now),
                ..Default::default()
            },
        )
        .unwrap();

        let loaded = db.get(&task.id).unwrap().unwrap();
        assert_eq!(loaded.status, TaskStatus::Running);
        assert!(loaded.started_at.is_some());
        // Untouched fields survive.
        assert_eq!(loaded.name, "sync");
        assert_eq!(loaded.retry_count, 0);
        assert!(loaded.completed_at.is_none());
    }

    #[test]
    fn test_update_missing_task_is_not_found() {
        let err = db()
            .update(
                "ghost",
                &TaskPatch {
                    status: Some(TaskStatus::Failed),
                    ..Default::default()
                },
            )
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[test]
    fn test_list_pending_order_and_filter() {
        let db = db();
        let mut first = Task::new("alpha", json!({}), 3, None);
        first.created_at = Utc::now() - Duration::seconds(10);
        let second = Task::new("beta", json!({}), 3, None);
        db.create(&second).unwrap();
        db.create(&first).unwrap();

        let all = db.list_pending(None).unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].name, "alpha"); // oldest first

        let only_beta = db.list_pending(Some("beta")).unwrap();
        assert_eq!(only_beta.len(), 1);
        assert_eq!(only_beta[0].name, "beta");
    }

    #[test]
    fn test_list_recent_desc_with_status_and_limit() {
        let db = db();
        for i in 0..5 {
            let mut t = Task::new(&format!("t{i}"), json!({}), 3, None);
            t.created_at = Utc::now() - Duration::seconds(100 - i);
            db.create(&t).unwrap();
        }
        let recent = db.list_recent(None, 3).unwrap();
        assert_eq!(recent.len(), 3);
        assert_eq!(recent[0].name, "t4"); // newest first

        let completed = db.list_recent(Some(TaskStatus::Completed), 10).unwrap();
        assert!(completed.is_empty());

        // The count ignores the page limit.
        assert_eq!(db.count_tasks(None).unwrap(), 5);
        assert_eq!(db.count_tasks(Some(TaskStatus::Pending)).unwrap(), 5);
        assert_eq!(db.count_tasks(Some(TaskStatus::Completed)).unwrap(), 0);
    }

    #[test]
    fn test_due_batch_cap_order_and_null_or_due() {
        let db = db();
        let now = Utc::now();
        // One unscheduled (null => eligible), one due, one future.
        let mut due = Task::new("due", json!({}), 3, Some(now - Duration::seconds(5)));
        due.created_at = now - Duration::seconds(50);
        let unscheduled = Task::new("unscheduled", json!({}), 3, None);
        let future = Task::new("future", json!({}), 3, Some(now + Duration::seconds(60)));
        db.create(&unscheduled).unwrap();
        db.create(&due).unwrap();
        db.create(&future).unwrap();

        let batch = db.due_batch(now, 10).unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0].name, "due"); // older created_at first
        assert_eq!(batch[1].name, "unscheduled");

        let capped = db.due_batch(now, 1).unwrap();
        assert_eq!(capped.len(), 1);
    }

    #[test]
    fn test_next_scheduled_is_minimum_pending() {
        let db = db();
        let now = Utc::now();
        assert!(db.next_scheduled().unwrap().is_none());

        let near = Task::new("near", json!({}), 3, Some(now + Duration::seconds(5)));
        let far = Task::new("far", json!({}), 3, Some(now + Duration::seconds(500)));
        db.create(&far).unwrap();
        db.create(&near).unwrap();

        let next = db.next_scheduled().unwrap().unwrap();
        assert!((next - (now + Duration::seconds(5))).num_milliseconds().abs() < 10);

        // Completed tasks no longer count.
        db.update(
            &near.id,
            &TaskPatch {
                status: Some(TaskStatus::Completed),
                completed_at: Some(now),
                ..Default::default()
            },
        )
        .unwrap();
        let next = db.next_scheduled().unwrap().unwrap();
        assert!((next - (now + Duration::seconds(500))).num_milliseconds().abs() < 10);
    }

    #[test]
    fn test_state_kv_roundtrip() {
        let db = db();
        assert!(db.state_get("last_activity").unwrap().is_none());
        db.state_set("last_activity", "2026-01-01T00:00:00.000Z").unwrap();
        assert_eq!(
            db.state_get("last_activity").unwrap().unwrap(),
            "2026-01-01T00:00:00.000Z"
        );
        db.state_set("last_activity", "2026-02-01T00:00:00.000Z").unwrap();
        assert_eq!(
            db.state_get("last_activity").unwrap().unwrap(),
            "2026-02-01T00:00:00.000Z"
        );
    }

    #[test]
    fn test_state_snapshot_counts_and_busy() {
        let db = db();
        let a = Task::new("a", json!({}), 3, None);
        let b = Task::new("b", json!({}), 3, None);
        let c = Task::new("c", json!({}), 3, None);
        db.create(&a).unwrap();
        db.create(&b).unwrap();
        db.create(&c).unwrap();
        let now = Utc::now();
        db.update(&a.id, &TaskPatch { status: Some(TaskStatus::Completed), completed_at: Some(now), ..Default::default() }).unwrap();
        db.update(&b.id, &TaskPatch { status: Some(TaskStatus::Failed), completed_at: Some(now), ..Default::default() }).unwrap();

        let snap = db.state_snapshot().unwrap();
        assert_eq!(snap.tasks_completed, 1);
        assert_eq!(snap.tasks_failed, 1);
        assert!(!snap.busy);

        db.update(&c.id, &TaskPatch { status: Some(TaskStatus::Running), started_at: Some(now), ..Default::default() }).unwrap();
        assert!(db.state_snapshot().unwrap().busy);
    }

    #[test]
    fn test_corrupt_created_at_is_a_storage_error() {
        let db = db();
        db.conn()
            .execute(
                "INSERT INTO tasks (id, name, payload, status, created_at)
                 VALUES ('bad', 'a', '{}', 'pending', 'not-a-timestamp')",
                [],
            )
            .unwrap();

        // A row with an unparseable timestamp must surface as an error,
        // never as a row carrying an invented time.
        let err = db.get("bad").unwrap_err();
        assert!(matches!(err, Error::Storage(_)));
        assert!(db.list_pending(None).is_err());
    }

    #[test]
    fn test_timestamp_format_is_fixed_width() {
        let s = fmt_ts(&Utc::now());
        assert_eq!(s.len(), "2026-08-30T12:34:56.789Z".len());
        assert!(s.ends_with('Z'));
    }
}
