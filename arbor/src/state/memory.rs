//! In-memory state store.
//!
//! The reference [`StateStore`] implementation: a pair of mutex-guarded
//! maps. Locks expire by TTL so an abandoned holder cannot wedge a run
//! forever. Suitable for tests and single-process deployments.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::Result;

use super::store::{LockAcquisition, LockHandle, StateStore};
use super::RunState;

struct LockEntry {
    token: String,
    expires_at: Instant,
}

/// A [`StateStore`] backed by process memory.
#[derive(Default)]
pub struct MemoryStateStore {
    states: Mutex<HashMap<String, RunState>>,
    locks: Mutex<HashMap<String, LockEntry>>,
}

impl MemoryStateStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of states currently held.
    pub async fn len(&self) -> usize {
        self.states.lock().await.len()
    }

    /// Whether the store holds no states.
    pub async fn is_empty(&self) -> bool {
        self.states.lock().await.is_empty()
    }
}

impl std::fmt::Debug for MemoryStateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStateStore").finish_non_exhaustive()
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn get(&self, run_id: &str) -> Result<Option<RunState>> {
        Ok(self.states.lock().await.get(run_id).cloned())
    }

    async fn put(&self, state: &RunState) -> Result<()> {
        self.states
            .lock()
            .await
            .insert(state.run_id.clone(), state.clone());
        Ok(())
    }

    async fn delete(&self, run_id: &str) -> Result<()> {
        self.states.lock().await.remove(run_id);
        Ok(())
    }

    async fn acquire_lock(&self, run_id: &str, ttl: Duration) -> Result<LockAcquisition> {
        let mut locks = self.locks.lock().await;
        let now = Instant::now();
        if let Some(entry) = locks.get(run_id)
            && entry.expires_at > now
        {
            return Ok(LockAcquisition::AlreadyHeld);
        }
        let token = Uuid::new_v4().to_string();
        locks.insert(
            run_id.to_owned(),
            LockEntry {
                token: token.clone(),
                expires_at: now + ttl,
            },
        );
        Ok(LockAcquisition::Acquired(LockHandle {
            run_id: run_id.to_owned(),
            token,
        }))
    }

    async fn release_lock(&self, handle: &LockHandle) -> Result<()> {
        let mut locks = self.locks.lock().await;
        if locks
            .get(&handle.run_id)
            .is_some_and(|entry| entry.token == handle.token)
        {
            locks.remove(&handle.run_id);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::delete_recursive;

    #[tokio::test]
    async fn put_then_get_roundtrips() {
        let store = MemoryStateStore::new();
        let state = RunState::new("run-1", "root", "1");
        store.put(&state).await.unwrap();

        let loaded = store.get("run-1").await.unwrap().unwrap();
        assert_eq!(loaded.run_id, "run-1");
        assert!(store.get("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn lock_is_exclusive_until_released() {
        let store = MemoryStateStore::new();
        let ttl = Duration::from_secs(30);

        let LockAcquisition::Acquired(handle) = store.acquire_lock("run-1", ttl).await.unwrap()
        else {
            panic!("first acquisition must succeed");
        };
        assert_eq!(
            store.acquire_lock("run-1", ttl).await.unwrap(),
            LockAcquisition::AlreadyHeld
        );

        store.release_lock(&handle).await.unwrap();
        assert!(matches!(
            store.acquire_lock("run-1", ttl).await.unwrap(),
            LockAcquisition::Acquired(_)
        ));
    }

    #[tokio::test]
    async fn stale_release_does_not_steal() {
        let store = MemoryStateStore::new();
        let ttl = Duration::from_secs(30);

        let LockAcquisition::Acquired(first) = store.acquire_lock("run-1", ttl).await.unwrap()
        else {
            panic!("first acquisition must succeed");
        };
        store.release_lock(&first).await.unwrap();

        let LockAcquisition::Acquired(_second) = store.acquire_lock("run-1", ttl).await.unwrap()
        else {
            panic!("second acquisition must succeed");
        };

        // Releasing with the stale first handle must not free the lock.
        store.release_lock(&first).await.unwrap();
        assert_eq!(
            store.acquire_lock("run-1", ttl).await.unwrap(),
            LockAcquisition::AlreadyHeld
        );
    }

    #[tokio::test(start_paused = true)]
    async fn lock_expires_after_ttl() {
        let store = MemoryStateStore::new();
        let ttl = Duration::from_secs(5);

        let LockAcquisition::Acquired(_handle) = store.acquire_lock("run-1", ttl).await.unwrap()
        else {
            panic!("first acquisition must succeed");
        };

        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(matches!(
            store.acquire_lock("run-1", ttl).await.unwrap(),
            LockAcquisition::Acquired(_)
        ));
    }

    #[tokio::test]
    async fn recursive_delete_descends_children() {
        let store = MemoryStateStore::new();

        let mut root = RunState::new("root-run", "root", "1");
        root.child_run_ids.push("mid-run".to_owned());
        let mut mid = RunState::new("mid-run", "mid", "1");
        mid.child_run_ids.push("leaf-run".to_owned());
        let leaf = RunState::new("leaf-run", "leaf", "1");

        for state in [&root, &mid, &leaf] {
            store.put(state).await.unwrap();
        }

        delete_recursive(&store, "root-run").await.unwrap();
        assert!(store.is_empty().await);
    }
}
