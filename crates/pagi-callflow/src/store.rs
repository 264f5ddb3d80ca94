//! SessionStore: one `CallSession` per call id, shared across concurrent call handlers.
//!
//! The map is the only state shared between calls. Each record sits behind its own
//! async mutex, which is the per-call writer lane: events for one call queue on that
//! lock in arrival order while other calls proceed in parallel.

use crate::error::{CallflowError, CallflowResult};
use crate::session::{CallPhase, CallSession};
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard};
use tracing::debug;

/// Shared handle to one call's record.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    call_id: Arc<str>,
    inner: Arc<Mutex<CallSession>>,
}

impl SessionHandle {
    fn new(call_id: &str) -> Self {
        Self {
            call_id: Arc::from(call_id),
            inner: Arc::new(Mutex::new(CallSession::new(call_id))),
        }
    }

    pub fn call_id(&self) -> &str {
        &self.call_id
    }

    /// Acquire the call's writer lane. Waiters are served in FIFO order.
    pub async fn lock(&self) -> MutexGuard<'_, CallSession> {
        self.inner.lock().await
    }

    pub async fn snapshot(&self) -> CallSession {
        self.inner.lock().await.clone()
    }

    /// Current phase without waiting; `None` while a turn holds the lock.
    pub fn try_phase(&self) -> Option<CallPhase> {
        self.inner.try_lock().ok().map(|s| s.phase)
    }

    /// True when both handles point at the same record.
    pub fn same_record(&self, other: &SessionHandle) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

#[derive(Debug, Default)]
pub struct SessionStore {
    sessions: DashMap<String, SessionHandle>,
    /// Calls that hung up; late events for these must not recreate a session.
    terminated: DashMap<String, DateTime<Utc>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Atomic, idempotent upsert. A second caller racing on the same unseen id gets the
    /// record the first one created. Terminated ids are refused.
    pub fn get_or_create(&self, call_id: &str) -> CallflowResult<SessionHandle> {
        // The shard lock taken by `entry` makes check-and-insert a single step.
        match self.sessions.entry(call_id.to_string()) {
            Entry::Occupied(existing) => {
                if self.terminated.contains_key(call_id) {
                    return Err(CallflowError::CallTerminated(call_id.to_string()));
                }
                Ok(existing.get().clone())
            }
            Entry::Vacant(slot) => {
                if self.terminated.contains_key(call_id) {
                    return Err(CallflowError::CallTerminated(call_id.to_string()));
                }
                debug!(call_id = %call_id, "Session created");
                let handle = SessionHandle::new(call_id);
                slot.insert(handle.clone());
                Ok(handle)
            }
        }
    }

    pub fn get(&self, call_id: &str) -> Option<SessionHandle> {
        self.sessions.get(call_id).map(|h| h.value().clone())
    }

    /// Release the call. Idempotent; never errors when the id is absent.
    pub fn remove(&self, call_id: &str) -> Option<SessionHandle> {
        // Tombstone first so a concurrent `get_or_create` cannot resurrect the id.
        self.terminated.insert(call_id.to_string(), Utc::now());
        let removed = self.sessions.remove(call_id).map(|(_, h)| h);
        if removed.is_some() {
            debug!(call_id = %call_id, "Session removed");
        }
        removed
    }

    pub fn is_terminated(&self, call_id: &str) -> bool {
        self.terminated.contains_key(call_id)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn active_call_ids(&self) -> Vec<String> {
        self.sessions.iter().map(|e| e.key().clone()).collect()
    }

    /// Drop tombstones older than `max_age`. Returns how many were dropped.
    pub fn prune_terminated(&self, max_age: chrono::Duration) -> usize {
        let Some(cutoff) = Utc::now().checked_sub_signed(max_age) else {
            return 0;
        };
        let before = self.terminated.len();
        self.terminated.retain(|_, ended_at| *ended_at > cutoff);
        before.saturating_sub(self.terminated.len())
    }

    /// Number of hung-up calls still remembered.
    pub fn terminated_len(&self) -> usize {
        self.terminated.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_get_or_create_yields_one_record() {
        let store = Arc::new(SessionStore::new());
        let mut tasks = Vec::new();
        for _ in 0..16 {
            let store = Arc::clone(&store);
            tasks.push(tokio::spawn(async move { store.get_or_create("X").unwrap() }));
        }
        let mut handles = Vec::new();
        for t in tasks {
            handles.push(t.await.unwrap());
        }
        assert_eq!(store.len(), 1);
        assert!(handles.iter().all(|h| h.same_record(&handles[0])));
        assert_eq!(handles[0].snapshot().await.phase, CallPhase::Entry);
    }

    #[test]
    fn test_second_create_returns_first_record() {
        let store = SessionStore::new();
        let first = store.get_or_create("call-a").unwrap();
        tokio_test::block_on(async {
            first.lock().await.unclear_streak = 1;
        });
        let second = store.get_or_create("call-a").unwrap();
        assert!(first.same_record(&second));
        let snapshot = tokio_test::block_on(second.snapshot());
        assert_eq!(snapshot.unclear_streak, 1);
    }

    #[test]
    fn test_remove_is_idempotent_and_blocks_recreation() {
        let store = SessionStore::new();
        store.get_or_create("call-b").unwrap();
        assert!(store.remove("call-b").is_some());
        assert!(store.remove("call-b").is_none());
        assert!(store.remove("never-seen").is_none());
        assert!(store.is_terminated("call-b"));
        assert!(matches!(
            store.get_or_create("call-b"),
            Err(CallflowError::CallTerminated(_))
        ));
        assert!(store.get("call-b").is_none());
    }

    #[test]
    fn test_prune_terminated() {
        let store = SessionStore::new();
        store.remove("old");
        assert_eq!(store.prune_terminated(chrono::Duration::hours(1)), 0);
        assert_eq!(store.prune_terminated(chrono::Duration::seconds(-1)), 1);
        assert!(!store.is_terminated("old"));
    }
}
