//! The state store consumed by the runtime.
//!
//! Implementations own durability; the runtime only requires
//! read-your-writes under one lock holder and mutual exclusion with
//! TTL-based release on the per-run lock.

use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;

use crate::error::Result;

use super::RunState;

/// Proof of lock ownership, returned by a successful acquisition and
/// required for release.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockHandle {
    /// The locked run id.
    pub run_id: String,
    /// Holder token; release is a no-op for a stale token.
    pub token: String,
}

/// Outcome of a lock acquisition attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockAcquisition {
    /// The lock was acquired.
    Acquired(LockHandle),
    /// Another holder owns the lock. Not an error; the caller reports
    /// the run as already running.
    AlreadyHeld,
}

/// Persistence for run states and their per-run locks.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Load a state by run id.
    async fn get(&self, run_id: &str) -> Result<Option<RunState>>;

    /// Write a state. The caller must hold the run's lock.
    async fn put(&self, state: &RunState) -> Result<()>;

    /// Delete a single state. Use [`delete_recursive`] to also remove
    /// descendants.
    async fn delete(&self, run_id: &str) -> Result<()>;

    /// Try to acquire the per-run lock with the given TTL.
    async fn acquire_lock(&self, run_id: &str, ttl: Duration) -> Result<LockAcquisition>;

    /// Release a held lock. Releasing with a stale token is a no-op.
    async fn release_lock(&self, handle: &LockHandle) -> Result<()>;

    /// Re-issue any time-limited references held inside the state's
    /// messages (externalized file urls). The default is the identity;
    /// stores backed by an object store override this.
    async fn refresh_content(&self, state: RunState) -> Result<RunState> {
        Ok(state)
    }
}

/// Delete a state and, recursively, every descendant recorded in its
/// `child_run_ids`. Children are removed before the node itself.
pub fn delete_recursive<'a>(
    store: &'a dyn StateStore,
    run_id: &'a str,
) -> BoxFuture<'a, Result<()>> {
    Box::pin(async move {
        if let Some(state) = store.get(run_id).await? {
            for child in &state.child_run_ids {
                delete_recursive(store, child).await?;
            }
        }
        store.delete(run_id).await
    })
}
