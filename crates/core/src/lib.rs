//! mirrordb core: live collections with optimistic mutation and sync
//! ingestion.
//!
//! A [`Collection`] mirrors the subscribed subset of some external source.
//! A sync adapter feeds it batches through an imperative session; user
//! mutations compose an optimistic overlay over the synced base; change
//! subscribers see one coalesced batch per logical transaction. The live
//! query layer is built on top of these primitives in `mirrordb-livequery`.

pub mod change;
pub mod collection;
pub mod config;
pub mod error;
mod events;
pub mod index;
pub mod lifecycle;
pub mod local;
pub mod persistence;
pub mod scheduler;
mod state;
pub mod subscribers;
pub mod sync;
pub mod transactions;
pub mod typed;

pub use change::{ChangeKind, ChangeMessage};
pub use collection::{
    Collection, EventHandle, LoadSubsetOutcome, SubscriptionHandle, WeakCollection,
};
pub use config::{CollectionOptions, KeyFn, MutationHandler, StringCollation, Validator};
pub use error::Error;
pub use index::{IndexId, IndexKind};
pub use lifecycle::CollectionStatus;
pub use local::{local_collection_options, LocalAdapter, SessionAdapter};
pub use scheduler::JobId;
pub use subscribers::{ChangeCallback, RowPredicate, SubscribeOptions};
pub use sync::{
    SubsetRequest, SyncAdapter, SyncHandle, SyncMetadata, SyncMode, SyncSession, WriteMessage,
};
pub use transactions::{Mutation, MutationKind, Transaction, TransactionStatus};
pub use typed::TypedCollection;
