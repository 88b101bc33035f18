use mirrordb_value::Key;
use thiserror::Error;

use crate::lifecycle::CollectionStatus;

#[derive(Error, Debug)]
pub enum LifecycleError {
    #[error("invalid status transition from `{from:?}` to `{to:?}`")]
    InvalidTransition {
        from: CollectionStatus,
        to: CollectionStatus,
    },
    #[error("operation on collection `{0}` which is in the error state")]
    CollectionErrored(String),
    #[error("subscriber count for collection `{0}` went negative")]
    NegativeSubscriberCount(String),
}

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("write without a pending sync transaction")]
    NoPendingSyncTransactionWrite,
    #[error("commit without a pending sync transaction")]
    NoPendingSyncTransactionCommit,
    #[error("write on an already committed sync transaction")]
    SyncTransactionAlreadyCommittedWrite,
    #[error("duplicate insert of key `{0}` within a sync transaction")]
    DuplicateKeySync(Key),
    #[error("sync write produced a record with no usable key")]
    InvalidKey,
    #[error("sync adapter failed: {0}")]
    Adapter(String),
}

#[derive(Error, Debug)]
pub enum TransactionError {
    #[error("transaction is no longer pending (state: {0})")]
    NotPending(&'static str),
    #[error("transaction was already committed")]
    AlreadyCommitted,
    #[error("optimistic insert of key `{0}` which is already present")]
    DuplicateKey(Key),
    #[error("optimistic {op} of missing key `{key}`")]
    MissingKey { op: &'static str, key: Key },
    #[error("persistence handler rejected the transaction: {0}")]
    HandlerFailed(String),
    #[error("record has no usable key (expected string or integer)")]
    InvalidKey,
}

#[derive(Error, Debug)]
pub enum IndexError {
    #[error("index `{0:?}` not found")]
    NotFound(crate::index::IndexId),
    #[error("index was removed while building")]
    Removed,
    #[error("operation not supported by this index kind")]
    Unsupported,
}

#[derive(Error, Debug)]
pub enum SchemaError {
    #[error("Schema version mismatch: persisted version {persisted}, requested {requested}")]
    VersionMismatch { persisted: u64, requested: u64 },
    #[error("schema validation failed: {0}")]
    Validation(String),
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("LifecycleError: {0}")]
    Lifecycle(#[from] LifecycleError),
    #[error("SyncError: {0}")]
    Sync(#[from] SyncError),
    #[error("TransactionError: {0}")]
    Transaction(#[from] TransactionError),
    #[error("IndexError: {0}")]
    Index(#[from] IndexError),
    #[error("SchemaError: {0}")]
    Schema(#[from] SchemaError),
    #[error("RowError: {0}")]
    Row(#[from] mirrordb_value::RowError),
    #[error("{0}")]
    Other(String),
}
