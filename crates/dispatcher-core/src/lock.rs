//! Coordinator singleton lock (C6): prevents two dispatcher processes from
//! competing for the same fleet under the same `worker_id`.

use async_trait::async_trait;

#[async_trait]
pub trait CoordinatorLock: Send + Sync {
    /// Attempt to acquire the named lock. Returns `false` (not an error)
    /// when another holder already owns it — the caller decides that's
    /// fatal, the lock itself just reports the fact.
    async fn try_acquire(&self, worker_id: &str) -> crate::error::Result<bool>;

    /// Release a previously acquired lock. A no-op if not held.
    async fn release(&self, worker_id: &str) -> crate::error::Result<()>;
}
