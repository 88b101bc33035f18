//! The synced base state and its pending sync transactions.
//!
//! `StateStore` is the authoritative keyed store a sync adapter writes into.
//! Writes accumulate in pending transactions; committed transactions are
//! applied in commit order (possibly retained first, while a user
//! transaction is persisting). The overlay composition and event diffing
//! live in the collection, which owns both this store and the optimistic
//! transaction list.

use crate::change::ChangeKind;
use crate::error::SyncError;
use indexmap::IndexMap;
use mirrordb_value::{Key, Value};
use std::collections::{HashMap, HashSet, VecDeque};

/// One write received from the sync adapter.
#[derive(Clone, Debug)]
pub(crate) struct SyncOp {
    pub kind: ChangeKind,
    pub key: Key,
    pub value: Value,
    pub metadata: Option<Value>,
}

#[derive(Debug, Default)]
pub(crate) struct PendingSyncedTx {
    pub committed: bool,
    pub truncate: bool,
    pub operations: Vec<SyncOp>,
    /// Keys inserted by this transaction, for duplicate detection.
    inserted_keys: HashSet<Key>,
    pub deleted_keys: HashSet<Key>,
}

#[derive(Default)]
pub(crate) struct StateStore {
    pub synced: IndexMap<Key, Value>,
    pub metadata: HashMap<Key, Value>,
    pending: VecDeque<PendingSyncedTx>,
}

impl StateStore {
    /// Open a new pending sync transaction. Must be matched by `commit` or
    /// `rollback`.
    pub fn begin(&mut self) {
        self.pending.push_back(PendingSyncedTx::default());
    }

    fn current_open(&mut self) -> Option<&mut PendingSyncedTx> {
        self.pending.back_mut().filter(|tx| !tx.committed)
    }

    pub fn write(&mut self, op: SyncOp) -> Result<(), SyncError> {
        // Check duplicate inserts against the base before borrowing the
        // current transaction mutably.
        let base_has_key = self.synced.contains_key(&op.key);
        let Some(tx) = self.pending.back_mut() else {
            return Err(SyncError::NoPendingSyncTransactionWrite);
        };
        if tx.committed {
            return Err(SyncError::SyncTransactionAlreadyCommittedWrite);
        }
        match op.kind {
            ChangeKind::Insert => {
                let masked = tx.truncate || tx.deleted_keys.contains(&op.key);
                let duplicate_in_tx = tx.inserted_keys.contains(&op.key) && !tx.deleted_keys.contains(&op.key);
                if duplicate_in_tx || (base_has_key && !masked) {
                    return Err(SyncError::DuplicateKeySync(op.key));
                }
                tx.inserted_keys.insert(op.key.clone());
                tx.deleted_keys.remove(&op.key);
            }
            ChangeKind::Update => {}
            ChangeKind::Delete => {
                tx.deleted_keys.insert(op.key.clone());
                tx.inserted_keys.remove(&op.key);
            }
        }
        tx.operations.push(op);
        Ok(())
    }

    /// Mark the current transaction as truncating: its buffered operations
    /// are dropped and, on apply, the whole base is replaced.
    pub fn truncate(&mut self) -> Result<(), SyncError> {
        let Some(tx) = self.current_open() else {
            return Err(SyncError::NoPendingSyncTransactionWrite);
        };
        tx.truncate = true;
        tx.operations.clear();
        tx.inserted_keys.clear();
        tx.deleted_keys.clear();
        Ok(())
    }

    pub fn commit(&mut self) -> Result<(), SyncError> {
        let Some(tx) = self.current_open() else {
            return Err(SyncError::NoPendingSyncTransactionCommit);
        };
        tx.committed = true;
        Ok(())
    }

    /// Drop the current open transaction without applying it.
    pub fn rollback(&mut self) {
        if self.pending.back().is_some_and(|tx| !tx.committed) {
            self.pending.pop_back();
        }
    }

    pub fn has_committed(&self) -> bool {
        self.pending.front().is_some_and(|tx| tx.committed)
    }

    /// Take the committed prefix of the pending queue, in commit order.
    pub fn take_committed(&mut self) -> Vec<PendingSyncedTx> {
        let mut out = Vec::new();
        while self.pending.front().is_some_and(|tx| tx.committed) {
            out.push(self.pending.pop_front().unwrap());
        }
        out
    }

    pub fn discard_pending(&mut self) {
        self.pending.clear();
    }

    /// Apply one committed transaction to the base, returning the keys whose
    /// base value may have changed (in operation order, truncated keys
    /// first).
    pub fn apply(&mut self, tx: &PendingSyncedTx) -> Vec<Key> {
        debug_assert!(tx.committed);
        let mut touched = Vec::new();
        let mut seen = HashSet::new();
        if tx.truncate {
            for key in self.synced.keys() {
                if seen.insert(key.clone()) {
                    touched.push(key.clone());
                }
            }
            self.synced.clear();
            self.metadata.clear();
        }
        for op in &tx.operations {
            if seen.insert(op.key.clone()) {
                touched.push(op.key.clone());
            }
            match op.kind {
                ChangeKind::Insert | ChangeKind::Update => {
                    self.synced.insert(op.key.clone(), op.value.clone());
                    if let Some(meta) = &op.metadata {
                        self.metadata.insert(op.key.clone(), meta.clone());
                    }
                }
                ChangeKind::Delete => {
                    self.synced.shift_remove(&op.key);
                    self.metadata.remove(&op.key);
                }
            }
        }
        touched
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mirrordb_value::row;

    fn insert_op(id: i64) -> SyncOp {
        SyncOp {
            kind: ChangeKind::Insert,
            key: Key::Int(id),
            value: row! { "id" => id },
            metadata: None,
        }
    }

    fn delete_op(id: i64) -> SyncOp {
        SyncOp {
            kind: ChangeKind::Delete,
            key: Key::Int(id),
            value: row! { "id" => id },
            metadata: None,
        }
    }

    #[test]
    fn write_requires_open_transaction() {
        let mut store = StateStore::default();
        assert!(matches!(
            store.write(insert_op(1)),
            Err(SyncError::NoPendingSyncTransactionWrite)
        ));
        store.begin();
        store.write(insert_op(1)).unwrap();
        store.commit().unwrap();
        assert!(matches!(
            store.write(insert_op(2)),
            Err(SyncError::SyncTransactionAlreadyCommittedWrite)
        ));
    }

    #[test]
    fn double_commit_is_rejected() {
        let mut store = StateStore::default();
        store.begin();
        store.commit().unwrap();
        assert!(matches!(
            store.commit(),
            Err(SyncError::NoPendingSyncTransactionCommit)
        ));
    }

    #[test]
    fn duplicate_insert_needs_prior_delete_or_truncate() {
        let mut store = StateStore::default();
        store.begin();
        store.write(insert_op(1)).unwrap();
        store.commit().unwrap();
        for tx in store.take_committed() {
            store.apply(&tx);
        }

        store.begin();
        assert!(matches!(
            store.write(insert_op(1)),
            Err(SyncError::DuplicateKeySync(Key::Int(1)))
        ));
        store.write(delete_op(1)).unwrap();
        store.write(insert_op(1)).unwrap();
        store.commit().unwrap();

        store.begin();
        store.truncate().unwrap();
        store.write(insert_op(1)).unwrap();
        store.commit().unwrap();
    }

    #[test]
    fn truncate_clears_base_and_applies_fresh_writes() {
        let mut store = StateStore::default();
        store.begin();
        store.write(insert_op(1)).unwrap();
        store.commit().unwrap();
        for tx in store.take_committed() {
            store.apply(&tx);
        }

        store.begin();
        store.write(insert_op(3)).unwrap();
        store.truncate().unwrap(); // drops the buffered insert of 3
        store.write(insert_op(2)).unwrap();
        store.commit().unwrap();
        let txs = store.take_committed();
        assert_eq!(txs.len(), 1);
        let touched = store.apply(&txs[0]);
        assert_eq!(touched, vec![Key::Int(1), Key::Int(2)]);
        assert_eq!(store.synced.len(), 1);
        assert!(store.synced.contains_key(&Key::Int(2)));
    }

    #[test]
    fn committed_transactions_apply_in_commit_order() {
        let mut store = StateStore::default();
        store.begin();
        store.write(insert_op(1)).unwrap();
        store.commit().unwrap();
        store.begin();
        store.write(insert_op(2)).unwrap();
        store.commit().unwrap();
        let txs = store.take_committed();
        assert_eq!(txs.len(), 2);
        for tx in &txs {
            store.apply(tx);
        }
        let keys: Vec<_> = store.synced.keys().cloned().collect();
        assert_eq!(keys, vec![Key::Int(1), Key::Int(2)]);
    }
}
