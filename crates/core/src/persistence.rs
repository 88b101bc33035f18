//! The persistence adapter surface for persisted collections.
//!
//! Concrete adapters (embedded SQLite and the like) live outside the core;
//! this module fixes the contract they implement and the schema mismatch
//! policy applied when a persisted collection is reopened.

use crate::error::{Error, SchemaError};
use crate::sync::SubsetRequest;
use futures::future::BoxFuture;
use mirrordb_value::{Key, Value};

/// One committed transaction as handed to the persistence layer.
#[derive(Clone, Debug)]
pub struct CommittedTx {
    pub tx_id: u64,
    pub term: u64,
    pub seq: u64,
    pub row_version: u64,
    pub mutations: Vec<PersistedMutation>,
}

#[derive(Clone, Debug)]
pub struct PersistedMutation {
    pub key: Key,
    pub value: Option<Value>,
}

pub trait PersistenceAdapter: Send + Sync {
    /// Durably apply a committed transaction.
    fn apply_committed_tx(&self, collection_id: &str, tx: CommittedTx) -> BoxFuture<'_, Result<(), Error>>;

    /// Load rows (with keys) matching the request.
    fn load_subset(
        &self,
        collection_id: &str,
        request: SubsetRequest,
    ) -> BoxFuture<'_, Result<Vec<(Key, Value)>, Error>>;

    /// Ordered changes since `from_row_version`, if the adapter tracks them.
    fn pull_since(
        &self,
        _collection_id: &str,
        _from_row_version: u64,
    ) -> Option<BoxFuture<'_, Result<Vec<(Key, Option<Value>)>, Error>>> {
        None
    }

    /// The schema version recorded for a collection, if any.
    fn persisted_schema_version(&self, collection_id: &str) -> Option<u64>;

    /// Drop all persisted state for a collection.
    fn reset(&self, collection_id: &str) -> BoxFuture<'_, Result<(), Error>>;
}

/// What to do when the declared schema version does not match persisted
/// state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SchemaMismatchPolicy {
    /// Reset local state and rely on the sync source to repopulate.
    SyncPresentReset,
    /// No sync source to recover from: surface the mismatch.
    SyncAbsentError,
    /// Always reset.
    Reset,
}

/// The default policy: resetting is only safe when a sync source can
/// repopulate the data.
pub fn default_policy(has_sync_source: bool) -> SchemaMismatchPolicy {
    if has_sync_source {
        SchemaMismatchPolicy::SyncPresentReset
    } else {
        SchemaMismatchPolicy::SyncAbsentError
    }
}

/// Outcome of opening persisted state under a schema version.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OpenOutcome {
    /// Versions matched (or nothing was persisted yet).
    Loaded,
    /// The mismatch policy elected to reset; the caller must re-sync.
    Reset,
}

/// Check the persisted schema version against `requested` and apply the
/// mismatch policy.
pub async fn open_persisted(
    adapter: &dyn PersistenceAdapter,
    collection_id: &str,
    requested_version: u64,
    policy: SchemaMismatchPolicy,
) -> Result<OpenOutcome, Error> {
    match adapter.persisted_schema_version(collection_id) {
        None => Ok(OpenOutcome::Loaded),
        Some(persisted) if persisted == requested_version => Ok(OpenOutcome::Loaded),
        Some(persisted) => match policy {
            SchemaMismatchPolicy::SyncAbsentError => Err(SchemaError::VersionMismatch {
                persisted,
                requested: requested_version,
            }
            .into()),
            SchemaMismatchPolicy::SyncPresentReset | SchemaMismatchPolicy::Reset => {
                log::warn!(
                    "collection `{collection_id}`: schema version changed ({persisted} -> {requested_version}), resetting persisted state"
                );
                adapter.reset(collection_id).await?;
                Ok(OpenOutcome::Reset)
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct FakeAdapter {
        version: Mutex<Option<u64>>,
        resets: Mutex<usize>,
    }

    impl PersistenceAdapter for FakeAdapter {
        fn apply_committed_tx(&self, _: &str, _: CommittedTx) -> BoxFuture<'_, Result<(), Error>> {
            Box::pin(async { Ok(()) })
        }

        fn load_subset(
            &self,
            _: &str,
            _: SubsetRequest,
        ) -> BoxFuture<'_, Result<Vec<(Key, Value)>, Error>> {
            Box::pin(async { Ok(Vec::new()) })
        }

        fn persisted_schema_version(&self, _: &str) -> Option<u64> {
            *self.version.lock()
        }

        fn reset(&self, _: &str) -> BoxFuture<'_, Result<(), Error>> {
            *self.resets.lock() += 1;
            *self.version.lock() = None;
            Box::pin(async { Ok(()) })
        }
    }

    #[tokio::test]
    async fn mismatch_without_sync_source_errors() {
        let adapter = FakeAdapter::default();
        *adapter.version.lock() = Some(1);
        let err = open_persisted(&adapter, "todos", 2, default_policy(false))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Schema version mismatch"));
        assert_eq!(*adapter.resets.lock(), 0);
    }

    #[tokio::test]
    async fn mismatch_with_sync_source_resets() {
        let adapter = FakeAdapter::default();
        *adapter.version.lock() = Some(1);
        let outcome = open_persisted(&adapter, "todos", 2, default_policy(true))
            .await
            .unwrap();
        assert_eq!(outcome, OpenOutcome::Reset);
        assert_eq!(*adapter.resets.lock(), 1);
    }

    #[tokio::test]
    async fn matching_version_loads() {
        let adapter = FakeAdapter::default();
        *adapter.version.lock() = Some(3);
        let outcome = open_persisted(&adapter, "todos", 3, default_policy(false))
            .await
            .unwrap();
        assert_eq!(outcome, OpenOutcome::Loaded);
    }
}
