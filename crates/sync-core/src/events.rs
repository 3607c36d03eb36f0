//! Event infrastructure for sync-core.
//!
//! Provides `SyncEvent` for monitoring and `EventBus` for subscriptions. The
//! bus is how callers learn about outcomes that never surface as errors:
//! conflict copies, per-action failures, and an abandoned vault binding.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock, Weak};

use crate::protocol::SyncActionKind;

/// Events emitted by the engine, scheduler, and binder.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum SyncEvent {
    /// A diff/execute/commit cycle began.
    CycleStarted { timestamp: DateTime<Utc> },
    /// A cycle finished (successfully or not).
    #[serde(rename_all = "camelCase")]
    CycleCompleted {
        uploaded: usize,
        downloaded: usize,
        deleted: usize,
        conflicts: usize,
        errors: usize,
        timestamp: DateTime<Utc>,
    },
    /// Both sides of a conflict were kept; the remote version lives at `conflictPath`.
    #[serde(rename_all = "camelCase")]
    ConflictCreated {
        path: String,
        conflict_path: String,
        timestamp: DateTime<Utc>,
    },
    /// One action failed and will be retried next cycle.
    ActionFailed {
        path: String,
        action: SyncActionKind,
        error: String,
        timestamp: DateTime<Utc>,
    },
    /// Vault binding gave up; surfaced so the UI can ask the user.
    #[serde(rename_all = "camelCase")]
    BindingAbandoned {
        vault_name: String,
        attempts: u32,
        reason: String,
        timestamp: DateTime<Utc>,
    },
    /// A debounced reindex fired for a file.
    ReindexRequested { path: String, timestamp: DateTime<Utc> },
}

/// Subscription handle that unsubscribes automatically when dropped.
///
/// Follows the disposer pattern: hold this value to keep receiving events,
/// drop it (or let it go out of scope) to unsubscribe.
pub struct Subscription {
    bus: Weak<EventBus>,
    id: usize,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.unsubscribe(self.id);
        }
    }
}

type Callback = Arc<dyn Fn(SyncEvent) + Send + Sync>;

/// Event bus for publishing sync events to subscribers.
///
/// Wrap in `Arc` to enable subscriptions.
pub struct EventBus {
    callbacks: RwLock<Vec<(usize, Callback)>>,
    next_id: AtomicUsize,
}

impl Default for EventBus {
    fn default() -> Self {
        Self {
            callbacks: RwLock::new(Vec::new()),
            next_id: AtomicUsize::new(0),
        }
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to events. Returns `Subscription` that unsubscribes on drop.
    pub fn subscribe(
        self: &Arc<Self>,
        callback: impl Fn(SyncEvent) + Send + Sync + 'static,
    ) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.callbacks
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push((id, Arc::new(callback)));
        Subscription {
            bus: Arc::downgrade(self),
            id,
        }
    }

    fn unsubscribe(&self, id: usize) {
        // try_write: Drop may run during unwinding while emit holds a read lock.
        if let Ok(mut guard) = self.callbacks.try_write() {
            guard.retain(|(i, _)| *i != id);
        }
    }

    /// Emit an event to all subscribers.
    pub fn emit(&self, event: SyncEvent) {
        // Snapshot so a callback may subscribe without deadlocking.
        let callbacks: Vec<Callback> = self
            .callbacks
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(_, cb)| Arc::clone(cb))
            .collect();

        for callback in callbacks {
            callback(event.clone());
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.callbacks.read().unwrap_or_else(|e| e.into_inner()).len()
    }
}
