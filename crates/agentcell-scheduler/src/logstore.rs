//! Append-only, size-bounded event log per instance.
//!
//! Purely observational: nothing in the scheduling path ever reads it.
//! The cap is enforced structurally — after any insert the table holds at
//! most [`LOG_CAP`] rows, trimming the oldest [`LOG_TRIM`] as one batch so
//! the cost amortizes instead of paying a delete per insert.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use agentcell_core::Result;

use crate::store::{InstanceDb, fmt_ts, ts_column};

/// Maximum rows retained after any insert.
pub const LOG_CAP: i64 = 1_000;

/// Rows evicted per trim, oldest first.
pub const LOG_TRIM: i64 = 100;

/// A single log row. `id` is the monotonic insertion order.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEntry {
    pub id: i64,
    pub level: String,
    pub message: String,
    pub context: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl InstanceDb {
    /// Append a log entry, evicting the oldest batch when the cap is
    /// exceeded. Returns the entry's monotonic id.
    pub fn log(&self, level: &str, message: &str, context: serde_json::Value) -> Result<i64> {
        self.conn().execute(
            "INSERT INTO logs (level, message, context, created_at) VALUES (?1, ?2, ?3, ?4)",
            rusqlite::params![level, message, context.to_string(), fmt_ts(&Utc::now())],
        )?;
        let id = self.conn().last_insert_rowid();

        let count: i64 = self
            .conn()
            .query_row("SELECT COUNT(*) FROM logs", [], |row| row.get(0))?;
        if count > LOG_CAP {
            self.conn().execute(
                "DELETE FROM logs WHERE id IN (SELECT id FROM logs ORDER BY id ASC LIMIT ?1)",
                rusqlite::params![LOG_TRIM],
            )?;
        }
        Ok(id)
    }

    /// Newest entries first, optionally filtered by level.
    pub fn recent_logs(&self, level: Option<&str>, limit: usize) -> Result<Vec<LogEntry>> {
        let (sql, params): (&str, Vec<rusqlite::types::Value>) = match level {
            Some(level) => (
                "SELECT id, level, message, context, created_at FROM logs
                 WHERE level = ?1 ORDER BY id DESC LIMIT ?2",
                vec![
                    rusqlite::types::Value::from(level.to_string()),
                    rusqlite::types::Value::from(limit as i64),
                ],
            ),
            None => (
                "SELECT id, level, message, context, created_at FROM logs
                 ORDER BY id DESC LIMIT ?1",
                vec![rusqlite::types::Value::from(limit as i64)],
            ),
        };
        let conn = self.conn();
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt.query_map(rusqlite::params_from_iter(params), |row| {
            let context_str: Option<String> = row.get(3)?;
            let created_at_str: String = row.get(4)?;
            Ok(LogEntry {
                id: row.get(0)?,
                level: row.get(1)?,
                message: row.get(2)?,
                context: context_str
                    .and_then(|s| serde_json::from_str(&s).ok())
                    .unwrap_or(serde_json::Value::Null),
                created_at: ts_column(4, &created_at_str)?,
            })
        })?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }

    pub fn log_count(&self) -> Result<i64> {
        Ok(self
            .conn()
            .query_row("SELECT COUNT(*) FROM logs", [], |row| row.get(0))?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn db() -> InstanceDb {
        InstanceDb::open_in_memory().unwrap()
    }

    #[test]
    fn test_append_and_read_back() {
        let db = db();
        db.log("info", "task created", json!({"taskId": "abc"})).unwrap();
        db.log("warn", "task failed", json!({"attempt": 1})).unwrap();

        let logs = db.recent_logs(None, 10).unwrap();
        assert_eq!(logs.len(), 2);
        assert_eq!(logs[0].message, "task failed"); // newest first
        assert_eq!(logs[0].context["attempt"], 1);
    }

    #[test]
    fn test_level_filter_and_limit() {
        let db = db();
        for i in 0..5 {
            db.log("info", &format!("i{i}"), json!({})).unwrap();
            db.log("error", &format!("e{i}"), json!({})).unwrap();
        }
        let errors = db.recent_logs(Some("error"), 3).unwrap();
        assert_eq!(errors.len(), 3);
        assert!(errors.iter().all(|l| l.level == "error"));
        assert_eq!(errors[0].message, "e4");
    }

    #[test]
    fn test_ids_are_monotonic() {
        let db = db();
        let a = db.log("info", "a", json!({})).unwrap();
        let b = db.log("info", "b", json!({})).unwrap();
        assert!(b > a);
    }

    #[test]
    fn test_cap_evicts_oldest_in_batches() {
        let db = db();
        for i in 0..1_500 {
            db.log("info", &format!("entry-{i}"), json!({})).unwrap();
            // Invariant: never more than the cap after any insert.
            assert!(db.log_count().unwrap() <= LOG_CAP);
        }
        // 1500 inserts with five 100-row trims leaves exactly 1000 rows,
        // and they are the most recent 1000 by insertion order.
        assert_eq!(db.log_count().unwrap(), 1_000);
        let logs = db.recent_logs(None, 2_000).unwrap();
        assert_eq!(logs.len(), 1_000);
        assert_eq!(logs[0].message, "entry-1499");
        assert_eq!(logs[999].message, "entry-500");
    }
}
