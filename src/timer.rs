//! Pending timer bookkeeping: BPMN timer events (intermediate catch and
//! boundary) keyed by flow object name, restorable from persisted data.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::task::AbortHandle;
use tokio::time::{Duration, sleep};

/// A single pending timeout as persisted: the absolute wake time and the
/// duration it was scheduled for (kept so logs/tests can tell how long a
/// restored timer originally was).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimerRecord {
    pub at: DateTime<Utc>,
    pub duration_ms: i64,
}

/// Pending timeouts plus, at runtime only, the scheduled task handles. A
/// single timer name has at most one scheduled callback; clearing is
/// idempotent.
#[derive(Default)]
pub struct PendingTimerEvents {
    timeouts: HashMap<String, TimerRecord>,
    scheduled: HashMap<String, AbortHandle>,
}

impl PendingTimerEvents {
    pub fn snapshot(&self) -> HashMap<String, TimerRecord> {
        self.timeouts.clone()
    }

    pub fn restore_snapshot(&mut self, timeouts: HashMap<String, TimerRecord>) {
        self.timeouts = timeouts;
    }

    /// Schedules a wake `duration_ms` from now, invoking `on_fire` exactly
    /// once. Registering a new timer for a name that already has one first
    /// clears the old one.
    pub fn schedule<F>(&mut self, name: impl Into<String>, duration_ms: i64, on_fire: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let name = name.into();
        self.clear(&name);
        let at = Utc::now() + chrono::Duration::milliseconds(duration_ms);
        self.timeouts.insert(
            name.clone(),
            TimerRecord {
                at,
                duration_ms,
            },
        );
        let handle = tokio::spawn(async move {
            sleep(Duration::from_millis(duration_ms.max(0) as u64)).await;
            on_fire();
        });
        self.scheduled.insert(name, handle.abort_handle());
    }

    /// Clears a pending timer. Safe to call for a name with no scheduled
    /// timer.
    pub fn clear(&mut self, name: &str) {
        self.timeouts.remove(name);
        if let Some(handle) = self.scheduled.remove(name) {
            handle.abort();
        }
    }

    pub fn clear_all(&mut self) {
        for (_, handle) in self.scheduled.drain() {
            handle.abort();
        }
        self.timeouts.clear();
    }

    /// Re-arms every pending timeout after a restore from persisted data.
    /// Timers already past their `at` fire immediately (on the next tick)
    /// rather than being dropped.
    pub fn reschedule_all<F>(&mut self, mut on_fire: F)
    where
        F: FnMut(&str) + Send + 'static,
        F: Clone,
    {
        let now = Utc::now();
        let entries: Vec<(String, TimerRecord)> =
            self.timeouts.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        for (name, record) in entries {
            let remaining_ms = (record.at - now).num_milliseconds().max(0);
            let mut cb = on_fire.clone();
            let fire_name = name.clone();
            let handle = tokio::spawn(async move {
                if remaining_ms > 0 {
                    sleep(Duration::from_millis(remaining_ms as u64)).await;
                }
                cb(&fire_name);
            });
            self.scheduled.insert(name, handle.abort_handle());
        }
        let _ = &mut on_fire;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, atomic::{AtomicBool, Ordering}};

    #[tokio::test]
    async fn schedule_fires_after_duration() {
        let mut timers = PendingTimerEvents::default();
        let fired = Arc::new(AtomicBool::new(false));
        let fired2 = fired.clone();
        timers.schedule("W", 10, move || fired2.store(true, Ordering::SeqCst));
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(fired.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn clear_is_idempotent() {
        let mut timers = PendingTimerEvents::default();
        timers.clear("never-scheduled");
        timers.schedule("W", 50, || {});
        timers.clear("W");
        timers.clear("W");
        assert!(timers.snapshot().is_empty());
    }
}
