//! State store trait definition.
//!
//! Backends persist a whole [`StateSnapshot`] per write. Callers that need
//! per-resource durability go through [`super::StateLedger`].

use async_trait::async_trait;

use super::lock::LockInfo;
use super::types::StateSnapshot;
use crate::error::Result;

/// Trait for state storage backends.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Loads and verifies the persisted snapshot.
    ///
    /// Returns `None` if no state exists yet.
    ///
    /// # Errors
    ///
    /// Returns a corruption error if the stored document fails verification.
    async fn load(&self) -> Result<Option<StateSnapshot>>;

    /// Durably saves the snapshot, replacing any previous one.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend write fails.
    async fn save(&self, snapshot: &StateSnapshot) -> Result<()>;

    /// Deletes the persisted state.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend delete fails.
    async fn delete(&self) -> Result<()>;

    /// Checks if state exists.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot be queried.
    async fn exists(&self) -> Result<bool>;

    /// Acquires the state lock for `operation`.
    ///
    /// # Errors
    ///
    /// Returns [`crate::error::StateError::LockedByOther`] if an unexpired
    /// lock is held.
    async fn acquire_lock(&self, holder: &str, operation: &str) -> Result<LockInfo>;

    /// Releases the lock if `lock_id` still owns it.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock cannot be removed.
    async fn release_lock(&self, lock_id: &str) -> Result<()>;

    /// Removes any lock regardless of owner.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock cannot be removed.
    async fn force_unlock(&self) -> Result<()>;

    /// Gets current lock information if locked.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock cannot be read.
    async fn get_lock_info(&self) -> Result<Option<LockInfo>>;

    /// Checks if the state is locked by an unexpired lock.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock cannot be read.
    async fn is_locked(&self) -> Result<bool> {
        Ok(self
            .get_lock_info()
            .await?
            .is_some_and(|lock| !lock.is_expired()))
    }

    /// Gets the backend type name.
    fn backend_type(&self) -> &'static str;
}
