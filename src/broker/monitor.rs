//! Timers that end sessions nobody is attending to.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::AbortHandle;
use tracing::debug;

use crate::sessions::SessionId;

/// What a pending timer will do when it fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    /// No admin joined within the waiting bound.
    Waiting,
    /// The admin leg dropped and has not ended the session.
    AdminGrace,
}

impl TimerKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Waiting => "waiting",
            Self::AdminGrace => "admin_grace",
        }
    }
}

type TimerKey = (SessionId, TimerKind);

/// Per-session one-shot timers with explicit cancellation.
///
/// A timer is a spawned task that sleeps and then runs its action. Cancelling
/// aborts the task, so an action never runs after `cancel` returns unless it
/// had already started.
#[derive(Default)]
pub struct TimeoutMonitor {
    timers: Arc<Mutex<HashMap<TimerKey, (u64, AbortHandle)>>>,
    generation: AtomicU64,
}

impl TimeoutMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm (or re-arm) the `kind` timer for `session_id`.
    pub fn arm<F>(&self, session_id: &str, kind: TimerKind, after: Duration, action: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        let key: TimerKey = (session_id.to_string(), kind);
        let timers = Arc::clone(&self.timers);
        let task_key = key.clone();

        // Hold the map lock across spawn so the task cannot finish and try to
        // deregister before its own entry exists.
        let mut map = self.timers.lock();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(after).await;
            {
                let mut map = timers.lock();
                if map.get(&task_key).is_some_and(|(g, _)| *g == generation) {
                    map.remove(&task_key);
                }
            }
            debug!(session_id = %task_key.0, timer = task_key.1.as_str(), "timer fired");
            action.await;
        });
        if let Some((_, previous)) = map.insert(key, (generation, handle.abort_handle())) {
            previous.abort();
        }
    }

    /// Cancel the `kind` timer for `session_id`. Returns true if one was pending.
    pub fn cancel(&self, session_id: &str, kind: TimerKind) -> bool {
        let removed = self.timers.lock().remove(&(session_id.to_string(), kind));
        match removed {
            Some((_, handle)) => {
                handle.abort();
                debug!(session_id, timer = kind.as_str(), "timer cancelled");
                true
            }
            None => false,
        }
    }

    /// Cancel every timer for `session_id`.
    pub fn cancel_all(&self, session_id: &str) {
        for kind in [TimerKind::Waiting, TimerKind::AdminGrace] {
            self.cancel(session_id, kind);
        }
    }

    pub fn is_pending(&self, session_id: &str, kind: TimerKind) -> bool {
        self.timers
            .lock()
            .contains_key(&(session_id.to_string(), kind))
    }

    pub fn pending(&self) -> usize {
        self.timers.lock().len()
    }
}

impl Drop for TimeoutMonitor {
    fn drop(&mut self) {
        for (_, (_, handle)) in self.timers.lock().drain() {
            handle.abort();
        }
    }
}
