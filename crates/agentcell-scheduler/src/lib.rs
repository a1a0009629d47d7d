//! # Agentcell Scheduler
//!
//! Durable task orchestration for a single agent instance.
//!
//! ## Architecture
//! ```text
//! create_task ──► InstanceDb (SQLite: tasks / logs / agent_state)
//!      │
//!      └── scheduled? ──► AlarmScheduler (one coalesced wake-up)
//!                              │ fires
//!                              ▼
//!                  TaskLifecycleManager.process_due()
//!                      ├── ≤10 due tasks, oldest first, sequential
//!                      ├── run: pending → running → completed | retry | failed
//!                      └── re-arm to the earliest remaining scheduled task
//! ```
//!
//! Each instance is a single writer: every store operation is serialized
//! behind the owning instance's lock. The scheduler never interprets task
//! payloads — execution is delegated to an injected [`TaskHandler`].

pub mod alarm;
pub mod lifecycle;
pub mod logstore;
pub mod store;
pub mod tasks;

pub use alarm::AlarmScheduler;
pub use lifecycle::{CreateOptions, RetryOutcome, TaskHandler, TaskLifecycleManager};
pub use logstore::LogEntry;
pub use store::{AgentStateSnapshot, InstanceDb};
pub use tasks::{Task, TaskPatch, TaskStatus, backoff_delay_ms};
