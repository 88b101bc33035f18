//! User-level optimistic transactions.
//!
//! A transaction collects mutations across one or more collections. Each
//! mutation immediately becomes part of the owning collection's optimistic
//! overlay; `commit` drives `pending → persisting → completed/failed`
//! through the collections' persistence handlers. While a transaction is
//! persisting, sync commits on its collections are retained and applied
//! together with the overlay drop, so subscribers never observe the gap
//! between "optimistic state removed" and "synced state arrived".

use crate::collection::Collection;
use crate::config::MutationHandler;
use crate::error::{Error, TransactionError};
use mirrordb_value::{Key, Value};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransactionStatus {
    Pending,
    Persisting,
    Completed,
    Failed,
}

impl TransactionStatus {
    fn name(self) -> &'static str {
        match self {
            TransactionStatus::Pending => "pending",
            TransactionStatus::Persisting => "persisting",
            TransactionStatus::Completed => "completed",
            TransactionStatus::Failed => "failed",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MutationKind {
    Insert,
    Update,
    Delete,
}

/// One optimistic mutation. `value` is `None` for deletes.
#[derive(Clone)]
pub struct Mutation {
    pub kind: MutationKind,
    pub key: Key,
    pub value: Option<Value>,
    pub previous: Option<Value>,
    pub collection: Collection,
}

struct TxData {
    status: TransactionStatus,
    mutations: Vec<Mutation>,
}

struct TxInner {
    id: u64,
    data: Mutex<TxData>,
}

/// A user transaction handle. Cheap to clone; collections hold one while
/// the transaction is active.
#[derive(Clone)]
pub struct Transaction {
    inner: Arc<TxInner>,
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.inner.id)
            .finish()
    }
}

impl Default for Transaction {
    fn default() -> Self {
        Self::new()
    }
}

impl Transaction {
    pub fn new() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Transaction {
            inner: Arc::new(TxInner {
                id: NEXT.fetch_add(1, Ordering::Relaxed),
                data: Mutex::new(TxData {
                    status: TransactionStatus::Pending,
                    mutations: Vec::new(),
                }),
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn status(&self) -> TransactionStatus {
        self.inner.data.lock().status
    }

    pub fn insert(&self, collection: &Collection, value: Value) -> Result<Key, Error> {
        collection.optimistic_insert(self, value)
    }

    /// Mutate the current visible row for `key` through `f`.
    pub fn update(
        &self,
        collection: &Collection,
        key: &Key,
        f: impl FnOnce(&mut Value),
    ) -> Result<(), Error> {
        collection.optimistic_update(self, key, f)
    }

    pub fn delete(&self, collection: &Collection, key: &Key) -> Result<(), Error> {
        collection.optimistic_delete(self, key)
    }

    /// Persist the transaction through each touched collection's mutation
    /// handlers. Resolves to the overlay being dropped (with any retained
    /// sync commits applied in the same batch) or rolls back on rejection.
    pub async fn commit(&self) -> Result<(), Error> {
        let (mutations, collections) = {
            let mut data = self.inner.data.lock();
            match data.status {
                TransactionStatus::Pending => {}
                TransactionStatus::Completed | TransactionStatus::Persisting => {
                    return Err(TransactionError::AlreadyCommitted.into());
                }
                status => return Err(TransactionError::NotPending(status.name()).into()),
            }
            data.status = TransactionStatus::Persisting;
            (data.mutations.clone(), distinct_collections(&data.mutations))
        };

        // Hold back downstream sync commits before the first suspension
        // point.
        for collection in &collections {
            collection.begin_persist();
        }

        let result = run_handlers(&mutations, &collections).await;

        let success = result.is_ok();
        self.inner.data.lock().status = if success {
            TransactionStatus::Completed
        } else {
            TransactionStatus::Failed
        };
        // One logical transaction context for the whole finalization, so
        // downstream graph runs coalesce across collections.
        crate::scheduler::with_transaction(|| {
            for collection in &collections {
                collection.finalize_transaction(self, true);
            }
        });
        result
    }

    /// Abort a pending transaction, atomically removing its overlay.
    pub fn rollback(&self) -> Result<(), Error> {
        let collections = {
            let mut data = self.inner.data.lock();
            if data.status != TransactionStatus::Pending {
                return Err(TransactionError::NotPending(data.status.name()).into());
            }
            data.status = TransactionStatus::Failed;
            distinct_collections(&data.mutations)
        };
        crate::scheduler::clear_context();
        crate::scheduler::with_transaction(|| {
            for collection in &collections {
                collection.finalize_transaction(self, false);
            }
        });
        Ok(())
    }

    pub fn mutations(&self) -> Vec<Mutation> {
        self.inner.data.lock().mutations.clone()
    }

    pub(crate) fn record(&self, mutation: Mutation) -> Result<(), Error> {
        let mut data = self.inner.data.lock();
        if data.status != TransactionStatus::Pending {
            return Err(TransactionError::NotPending(data.status.name()).into());
        }
        data.mutations.push(mutation);
        Ok(())
    }

    /// The overlay effect of this transaction on `key`:
    /// `None` untouched, `Some(None)` deleted, `Some(Some(v))` present.
    pub(crate) fn overlay(&self, collection_id: u64, key: &Key) -> Option<Option<Value>> {
        let data = self.inner.data.lock();
        if !matches!(
            data.status,
            TransactionStatus::Pending | TransactionStatus::Persisting
        ) {
            return None;
        }
        let mut effect = None;
        for mutation in &data.mutations {
            if mutation.collection.id() != collection_id || &mutation.key != key {
                continue;
            }
            effect = Some(match mutation.kind {
                MutationKind::Insert | MutationKind::Update => mutation.value.clone(),
                MutationKind::Delete => None,
            });
        }
        effect
    }

    pub(crate) fn touched_keys(&self, collection_id: u64) -> Vec<Key> {
        let data = self.inner.data.lock();
        let mut keys = Vec::new();
        for mutation in &data.mutations {
            if mutation.collection.id() == collection_id && !keys.contains(&mutation.key) {
                keys.push(mutation.key.clone());
            }
        }
        keys
    }
}

fn distinct_collections(mutations: &[Mutation]) -> Vec<Collection> {
    let mut out: Vec<Collection> = Vec::new();
    for mutation in mutations {
        if !out.iter().any(|c| c.id() == mutation.collection.id()) {
            out.push(mutation.collection.clone());
        }
    }
    out
}

async fn run_handlers(mutations: &[Mutation], collections: &[Collection]) -> Result<(), Error> {
    for collection in collections {
        let for_collection: Vec<&Mutation> = mutations
            .iter()
            .filter(|m| m.collection.id() == collection.id())
            .collect();
        let groups: [(MutationKind, Option<MutationHandler>); 3] = [
            (MutationKind::Insert, collection.options().on_insert.clone()),
            (MutationKind::Update, collection.options().on_update.clone()),
            (MutationKind::Delete, collection.options().on_delete.clone()),
        ];
        for (kind, handler) in groups {
            let Some(handler) = handler else {
                continue;
            };
            let batch: Vec<Mutation> = for_collection
                .iter()
                .filter(|m| m.kind == kind)
                .map(|m| (*m).clone())
                .collect();
            if batch.is_empty() {
                continue;
            }
            handler(batch)
                .await
                .map_err(|e| Error::from(TransactionError::HandlerFailed(e.to_string())))?;
        }
    }
    Ok(())
}
