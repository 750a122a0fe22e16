//! Per-resource durable writes during a run.
//!
//! Apply steps finish concurrently, but every success must reach the backend
//! before the step is reported done. The ledger serializes those writes: each
//! one mutates a copy of the snapshot, persists it, and only then commits it
//! in memory, so the in-memory view never runs ahead of the durable one.

use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

use super::store::StateStore;
use super::types::{HistoryEntry, StateRecord, StateSnapshot};
use crate::error::Result;
use crate::graph::ResourceId;

/// Shared, write-through view of the state for one run.
pub struct StateLedger {
    store: Arc<dyn StateStore>,
    snapshot: Mutex<StateSnapshot>,
}

impl StateLedger {
    /// Wraps a loaded snapshot and the store it came from.
    #[must_use]
    pub fn new(store: Arc<dyn StateStore>, snapshot: StateSnapshot) -> Self {
        Self {
            store,
            snapshot: Mutex::new(snapshot),
        }
    }

    /// Durably records a resource.
    ///
    /// # Errors
    ///
    /// Returns the backend error if the write fails. The in-memory view is
    /// left unchanged in that case.
    pub async fn upsert(&self, record: StateRecord) -> Result<()> {
        let key = record.id().key();
        self.commit(|snapshot| {
            let record = record.created_at_from(snapshot.resources.get(&key));
            snapshot.upsert(record);
        })
        .await?;
        debug!("Recorded {key} in state");
        Ok(())
    }

    /// Durably removes a resource. Removing an absent record is a no-op.
    ///
    /// # Errors
    ///
    /// Returns the backend error if the write fails.
    pub async fn remove(&self, id: &ResourceId) -> Result<()> {
        if self.snapshot.lock().await.get(id).is_none() {
            return Ok(());
        }
        self.commit(|snapshot| {
            snapshot.remove(id);
        })
        .await?;
        debug!("Removed {id} from state");
        Ok(())
    }

    /// Durably appends a run history entry and sets the applied config hash.
    ///
    /// # Errors
    ///
    /// Returns the backend error if the write fails.
    pub async fn record_run(&self, entry: HistoryEntry) -> Result<()> {
        self.commit(|snapshot| {
            if entry.success {
                snapshot.config_hash.clone_from(&entry.config_hash);
            }
            snapshot.add_history(entry);
        })
        .await
    }

    /// A copy of the current snapshot.
    pub async fn snapshot(&self) -> StateSnapshot {
        self.snapshot.lock().await.clone()
    }

    /// The current record for a resource, if any.
    pub async fn get(&self, id: &ResourceId) -> Option<StateRecord> {
        self.snapshot.lock().await.get(id).cloned()
    }

    /// Consumes the ledger, returning the final snapshot.
    #[must_use]
    pub fn into_snapshot(self) -> StateSnapshot {
        self.snapshot.into_inner()
    }

    async fn commit(&self, mutate: impl FnOnce(&mut StateSnapshot)) -> Result<()> {
        let mut current = self.snapshot.lock().await;
        let mut next = current.clone();
        mutate(&mut next);
        self.store.save(&next).await?;
        *current = next;
        Ok(())
    }
}

impl std::fmt::Debug for StateLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateLedger")
            .field("backend", &self.store.backend_type())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{KeelError, StateError};
    use crate::graph::Attributes;
    use crate::state::{LocalStateStore, MockStateStore, RunOperation};
    use serde_json::json;
    use tempfile::TempDir;

    fn record(name: &str) -> StateRecord {
        StateRecord::new(
            &ResourceId::new("t", name),
            format!("id-{name}"),
            Attributes::from([(String::from("name"), json!(name))]),
            Attributes::new(),
            vec![],
        )
    }

    #[tokio::test]
    async fn test_each_write_is_persisted() {
        let temp = TempDir::new().expect("Failed to create temp dir");
        let store = Arc::new(LocalStateStore::with_base_dir(temp.path()));
        let ledger = StateLedger::new(store.clone(), StateSnapshot::new("demo", "dev"));

        ledger.upsert(record("a")).await.expect("upsert a");
        let on_disk = store.load().await.expect("load").expect("exists");
        assert!(on_disk.get(&ResourceId::new("t", "a")).is_some());

        ledger.upsert(record("b")).await.expect("upsert b");
        ledger
            .remove(&ResourceId::new("t", "a"))
            .await
            .expect("remove a");

        let on_disk = store.load().await.expect("load").expect("exists");
        assert_eq!(on_disk, ledger.snapshot().await);
        assert_eq!(on_disk.len(), 1);
    }

    #[tokio::test]
    async fn test_failed_save_leaves_view_unchanged() {
        let mut store = MockStateStore::new();
        store
            .expect_save()
            .returning(|_| Err(KeelError::State(StateError::backend("disk full"))));
        store.expect_backend_type().return_const("mock");

        let ledger = StateLedger::new(Arc::new(store), StateSnapshot::new("demo", "dev"));
        assert!(ledger.upsert(record("a")).await.is_err());

        let snapshot = ledger.snapshot().await;
        assert!(snapshot.is_empty());
        assert_eq!(snapshot.serial, 0);
    }

    #[tokio::test]
    async fn test_remove_absent_is_noop() {
        let mut store = MockStateStore::new();
        store.expect_save().never();

        let ledger = StateLedger::new(Arc::new(store), StateSnapshot::new("demo", "dev"));
        ledger
            .remove(&ResourceId::new("t", "missing"))
            .await
            .expect("remove should succeed");
    }

    #[tokio::test]
    async fn test_record_run_sets_config_hash() {
        let temp = TempDir::new().expect("Failed to create temp dir");
        let store = Arc::new(LocalStateStore::with_base_dir(temp.path()));
        let ledger = StateLedger::new(store, StateSnapshot::new("demo", "dev"));

        ledger
            .record_run(HistoryEntry::new(RunOperation::Apply, "h1", vec![], None))
            .await
            .expect("record run");
        ledger
            .record_run(HistoryEntry::new(
                RunOperation::Apply,
                "h2",
                vec![],
                Some(String::from("1 failed")),
            ))
            .await
            .expect("record run");

        let snapshot = ledger.into_snapshot();
        assert_eq!(snapshot.config_hash, "h1");
        assert_eq!(snapshot.history.len(), 2);
    }
}
