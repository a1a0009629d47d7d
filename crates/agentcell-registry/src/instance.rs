//! A single agent instance: one durable task queue, one log store, one
//! alarm — all behind one async mutex, so every operation against the
//! instance is serialized (the single-writer contract).
//!
//! The instance speaks an HTTP-shaped interface ([`InstanceRequest`] →
//! [`InstanceResponse`]) so the registry can dispatch synthetic internal
//! requests and the gateway can forward external ones without caring which
//! is which.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;

use agentcell_core::{Error, Result};
use agentcell_scheduler::{
    AlarmScheduler, CreateOptions, InstanceDb, TaskHandler, TaskLifecycleManager, TaskStatus,
};

const DEFAULT_TASK_LIMIT: usize = 50;
const DEFAULT_LOG_LIMIT: usize = 100;

/// Static descriptor served at `GET /metadata`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentDescriptor {
    pub agent_type: String,
    pub version: String,
    pub description: String,
    pub tools: Vec<String>,
}

/// A synthetic internal request. The registry constructs these; the
/// gateway translates real HTTP into them.
#[derive(Debug, Clone)]
pub struct InstanceRequest {
    /// Uppercase HTTP method.
    pub method: String,
    /// Path within the instance, e.g. `/tasks` or `/tasks/<id>`.
    pub path: String,
    pub query: HashMap<String, String>,
    pub body: Option<serde_json::Value>,
}

impl InstanceRequest {
    pub fn get(path: &str) -> Self {
        Self {
            method: "GET".into(),
            path: path.into(),
            query: HashMap::new(),
            body: None,
        }
    }

    pub fn post(path: &str, body: serde_json::Value) -> Self {
        Self {
            method: "POST".into(),
            path: path.into(),
            query: HashMap::new(),
            body: Some(body),
        }
    }

    pub fn with_query(mut self, key: &str, value: &str) -> Self {
        self.query.insert(key.into(), value.into());
        self
    }
}

/// Status code plus JSON body, transport-agnostic.
#[derive(Debug, Clone)]
pub struct InstanceResponse {
    pub status: u16,
    pub body: serde_json::Value,
}

impl InstanceResponse {
    pub fn ok(body: serde_json::Value) -> Self {
        Self { status: 200, body }
    }

    pub fn created(body: serde_json::Value) -> Self {
        Self { status: 201, body }
    }

    pub fn from_error(e: &Error) -> Self {
        Self {
            status: e.status_code(),
            body: serde_json::json!({"error": e.to_string()}),
        }
    }
}

/// One addressable agent instance.
pub struct AgentInstance {
    id: String,
    descriptor: AgentDescriptor,
    manager: Arc<Mutex<TaskLifecycleManager>>,
    alarm: Arc<AlarmScheduler>,
}

impl std::fmt::Debug for AgentInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentInstance")
            .field("id", &self.id)
            .field("descriptor", &self.descriptor)
            .finish_non_exhaustive()
    }
}

impl AgentInstance {
    /// Open (or create) the instance's store, recover any persisted
    /// schedule, and start the alarm loop. `db_path = None` keeps the
    /// store in memory.
    pub fn open(
        id: String,
        descriptor: AgentDescriptor,
        handler: Arc<dyn TaskHandler>,
        db_path: Option<PathBuf>,
    ) -> Result<Arc<Self>> {
        let db = match &db_path {
            Some(path) => InstanceDb::open(path)?,
            None => InstanceDb::open_in_memory()?,
        };
        let alarm = Arc::new(AlarmScheduler::new());

        // Restart recovery: overdue work fires immediately, otherwise the
        // earliest persisted schedule is re-armed.
        let now = Utc::now();
        if !db.due_batch(now, 1)?.is_empty() {
            alarm.arm(now);
        } else if let Some(next) = db.next_scheduled()? {
            alarm.arm(next);
        }

        let manager = TaskLifecycleManager::new(db, handler, alarm.clone());
        let instance = Arc::new(Self {
            id,
            descriptor,
            manager: Arc::new(Mutex::new(manager)),
            alarm,
        });
        instance.clone().spawn_alarm_loop();
        Ok(instance)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn descriptor(&self) -> &AgentDescriptor {
        &self.descriptor
    }

    /// The currently armed wake-up, if any.
    pub fn armed_at(&self) -> Option<DateTime<Utc>> {
        self.alarm.armed_at()
    }

    /// Dispatch one request against this instance. Errors become status
    /// codes here; nothing escapes as a panic or a raw `Err`.
    pub async fn handle(&self, req: InstanceRequest) -> InstanceResponse {
        match self.route(req).await {
            Ok(resp) => resp,
            Err(e) => InstanceResponse::from_error(&e),
        }
    }

    async fn route(&self, req: InstanceRequest) -> Result<InstanceResponse> {
        let path = req.path.trim_end_matches('/');
        match (req.method.as_str(), path) {
            ("GET", "/metadata") => self.metadata(),
            ("GET", "/state") => self.state().await,
            ("GET", "/tasks") => self.list_tasks(&req.query).await,
            ("GET", "/logs") => self.list_logs(&req.query).await,
            ("POST", "/tasks") => self.create_task(req.body.unwrap_or_default()).await,
            ("GET", _) if path.starts_with("/tasks/") => {
                let id = path.trim_start_matches("/tasks/");
                self.get_task(id).await
            }
            (method, path) => Err(Error::NotFound(format!("No route: {method} {path}"))),
        }
    }

    fn metadata(&self) -> Result<InstanceResponse> {
        Ok(InstanceResponse::ok(serde_json::json!({
            "type": self.descriptor.agent_type,
            "version": self.descriptor.version,
            "description": self.descriptor.description,
            "tools": self.descriptor.tools,
        })))
    }

    async fn state(&self) -> Result<InstanceResponse> {
        let manager = self.manager.lock().await;
        let snap = manager.db().state_snapshot()?;
        Ok(InstanceResponse::ok(serde_json::json!({
            "id": self.id,
            "type": self.descriptor.agent_type,
            "status": if snap.busy { "busy" } else { "idle" },
            "lastActivity": snap.last_activity.map(|d| d.to_rfc3339()),
            "tasksCompleted": snap.tasks_completed,
            "tasksFailed": snap.tasks_failed,
        })))
    }

    async fn list_tasks(&self, query: &HashMap<String, String>) -> Result<InstanceResponse> {
        let status = match query.get("status").filter(|s| !s.is_empty()) {
            Some(s) => Some(
                TaskStatus::parse(s)
                    .ok_or_else(|| Error::Validation(format!("Unknown status '{s}'")))?,
            ),
            None => None,
        };
        let limit = query
            .get("limit")
            .and_then(|s| s.parse::<usize>().ok())
            .unwrap_or(DEFAULT_TASK_LIMIT);

        let manager = self.manager.lock().await;
        let tasks = manager.db().list_recent(status, limit)?;
        // Total counts every matching row, not just the returned page.
        let total = manager.db().count_tasks(status)?;
        let tasks: Vec<serde_json::Value> = tasks.iter().map(|t| t.to_json()).collect();
        Ok(InstanceResponse::ok(
            serde_json::json!({"tasks": tasks, "total": total}),
        ))
    }

    async fn get_task(&self, id: &str) -> Result<InstanceResponse> {
        let manager = self.manager.lock().await;
        let task = manager
            .db()
            .get(id)?
            .ok_or_else(|| Error::NotFound("Task not found".into()))?;
        Ok(InstanceResponse::ok(task.to_json()))
    }

    async fn create_task(&self, body: serde_json::Value) -> Result<InstanceResponse> {
        let name = body
            .get("name")
            .and_then(|v| v.as_str())
            .unwrap_or_default();
        if name.is_empty() {
            return Err(Error::Validation("Task name required".into()));
        }
        let payload = body
            .get("payload")
            .cloned()
            .unwrap_or(serde_json::Value::Null);
        let max_retries = body
            .get("maxRetries")
            .and_then(|v| v.as_u64())
            .map(|v| v as u32);
        let schedule_for = parse_schedule_for(body.get("scheduleFor"))?;

        let task = {
            let manager = self.manager.lock().await;
            manager.create_task(
                name,
                payload,
                CreateOptions {
                    max_retries,
                    schedule_for,
                },
            )?
        };

        // Unscheduled tasks are kicked off fire-and-forget: the creating
        // request returns before (and regardless of) execution.
        if task.scheduled_for.is_none() {
            self.kick_off(task.id.clone());
        }

        Ok(InstanceResponse::created(serde_json::json!({
            "taskId": task.id,
            "status": "created",
        })))
    }

    async fn list_logs(&self, query: &HashMap<String, String>) -> Result<InstanceResponse> {
        let level = query.get("level").filter(|s| !s.is_empty());
        let limit = query
            .get("limit")
            .and_then(|s| s.parse::<usize>().ok())
            .unwrap_or(DEFAULT_LOG_LIMIT);

        let manager = self.manager.lock().await;
        let logs = manager.db().recent_logs(level.map(String::as_str), limit)?;
        let logs: Vec<serde_json::Value> = logs
            .iter()
            .map(|l| serde_json::to_value(l).unwrap_or_default())
            .collect();
        Ok(InstanceResponse::ok(serde_json::json!({"logs": logs})))
    }

    fn kick_off(&self, task_id: String) {
        let manager = self.manager.clone();
        tokio::spawn(async move {
            let mgr = manager.lock().await;
            if let Err(e) = mgr.run_task(&task_id).await {
                tracing::warn!(task = %task_id, "immediate execution failed: {e}");
            }
        });
    }

    /// The alarm loop: sleep until the armed instant, then drain one due
    /// batch under the instance lock. Re-arming interrupts the sleep so an
    /// earlier deadline takes over.
    fn spawn_alarm_loop(self: Arc<Self>) {
        tokio::spawn(async move {
            loop {
                match self.alarm.armed_at() {
                    None => self.alarm.rearmed().await,
                    Some(at) => {
                        let wait = (at - Utc::now()).to_std().unwrap_or_default();
                        tokio::select! {
                            _ = tokio::time::sleep(wait) => {
                                self.alarm.take();
                                let manager = self.manager.lock().await;
                                if let Err(e) = manager.process_due().await {
                                    tracing::warn!(instance = %self.id, "alarm processing failed: {e}");
                                }
                            }
                            _ = self.alarm.rearmed() => {}
                        }
                    }
                }
            }
        });
    }
}

fn parse_schedule_for(value: Option<&serde_json::Value>) -> Result<Option<DateTime<Utc>>> {
    match value {
        None | Some(serde_json::Value::Null) => Ok(None),
        Some(serde_json::Value::String(s)) => DateTime::parse_from_rfc3339(s)
            .map(|d| Some(d.with_timezone(&Utc)))
            .map_err(|_| Error::Validation(format!("Invalid scheduleFor timestamp '{s}'"))),
        Some(serde_json::Value::Number(n)) => n
            .as_i64()
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
            .map(Some)
            .ok_or_else(|| Error::Validation("Invalid scheduleFor timestamp".into())),
        Some(_) => Err(Error::Validation(
            "scheduleFor must be an RFC 3339 string or epoch milliseconds".into(),
        )),
    }
}
