//! The single coalesced wake-up timer an instance may have armed.
//!
//! An instance never holds multiple overlapping timers: `arm` keeps only
//! the earliest requested timestamp, and the owning instance's alarm loop
//! waits on exactly that instant. Re-arming interrupts the wait through a
//! [`tokio::sync::Notify`] so a new earlier deadline takes effect
//! immediately.

use chrono::{DateTime, Utc};
use std::sync::Mutex;
use tokio::sync::Notify;

/// How many due tasks one alarm firing may process. Bounds the latency of
/// a single invocation; a deeper backlog drains across multiple firings.
pub const ALARM_BATCH: usize = 10;

pub struct AlarmScheduler {
    armed: Mutex<Option<DateTime<Utc>>>,
    rearm: Notify,
}

impl AlarmScheduler {
    pub fn new() -> Self {
        Self {
            armed: Mutex::new(None),
            rearm: Notify::new(),
        }
    }

    /// Arm the wake-up for `at`, coalescing with any existing deadline —
    /// the earlier of the two wins.
    pub fn arm(&self, at: DateTime<Utc>) {
        let mut armed = self.armed.lock().expect("alarm lock poisoned");
        let changed = match *armed {
            Some(current) if current <= at => false,
            _ => {
                *armed = Some(at);
                true
            }
        };
        drop(armed);
        if changed {
            tracing::debug!("alarm armed for {at}");
            self.rearm.notify_one();
        }
    }

    /// Clear and return the armed deadline. Called by the alarm loop right
    /// before it fires.
    pub fn take(&self) -> Option<DateTime<Utc>> {
        self.armed.lock().expect("alarm lock poisoned").take()
    }

    /// The currently armed deadline, if any.
    pub fn armed_at(&self) -> Option<DateTime<Utc>> {
        *self.armed.lock().expect("alarm lock poisoned")
    }

    /// Resolves when `arm` installs a new (earlier) deadline. A permit is
    /// stored if the arm happened before the wait began.
    pub async fn rearmed(&self) {
        self.rearm.notified().await;
    }
}

impl Default for AlarmScheduler {
    fn default() -> Self {
        Self::new()
    }
}
