//! The collection: a local mirror of a synced set of rows, with an
//! optimistic overlay and change fanout.
//!
//! All state lives behind one mutex. Methods compute an [`Outbox`] of
//! callbacks under the lock and deliver it after release, inside a
//! scheduler transaction context, so subscribers (live query runtimes
//! included) can re-enter the collection freely and graph runs coalesce per
//! logical transaction.

use crate::change::ChangeMessage;
use crate::config::CollectionOptions;
use crate::error::{Error, LifecycleError, SyncError, TransactionError};
use crate::events::Listeners;
use crate::index::{IndexCatalog, IndexId};
use crate::lifecycle::{validate_transition, CollectionStatus};
use crate::scheduler;
use crate::state::{StateStore, SyncOp};
use crate::subscribers::{ChangeCallback, RowPredicate, SubscribeOptions, SubscriberTable};
use crate::sync::{SubsetRequest, SyncHandle, SyncMetadata, SyncSession, WriteMessage};
use crate::transactions::{Mutation, MutationKind, Transaction};
use indexmap::IndexMap;
use mirrordb_expr::Expr;
use mirrordb_value::{Key, Value};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::oneshot;

pub struct CollectionInner {
    id: u64,
    options: CollectionOptions,
    state: Mutex<CollectionState>,
}

struct CollectionState {
    status: CollectionStatus,
    error_message: Option<String>,
    store: StateStore,
    /// Cached visible state: synced base with the optimistic overlay
    /// applied, in insertion order.
    visible: IndexMap<Key, Value>,
    active_txs: Vec<Transaction>,
    /// Number of touching transactions currently persisting; while nonzero,
    /// committed sync transactions are retained.
    persisting: usize,
    indexes: IndexCatalog,
    subscribers: SubscriberTable,
    status_listeners: Listeners<CollectionStatus>,
    loading_listeners: Listeners<bool>,
    first_ready: Vec<Box<dyn FnOnce() + Send>>,
    first_ready_fired: bool,
    ready_waiters: Vec<oneshot::Sender<Result<(), String>>>,
    sync_handle: Option<Box<dyn SyncHandle>>,
    loading_subsets: HashSet<String>,
    gc_generation: u64,
}

impl Default for CollectionState {
    fn default() -> Self {
        CollectionState {
            status: CollectionStatus::Idle,
            error_message: None,
            store: StateStore::default(),
            visible: IndexMap::new(),
            active_txs: Vec::new(),
            persisting: 0,
            indexes: IndexCatalog::default(),
            subscribers: SubscriberTable::default(),
            status_listeners: Listeners::default(),
            loading_listeners: Listeners::default(),
            first_ready: Vec::new(),
            first_ready_fired: false,
            ready_waiters: Vec::new(),
            sync_handle: None,
            loading_subsets: HashSet::new(),
            gc_generation: 0,
        }
    }
}

/// Callbacks gathered under the lock, delivered after it is released.
#[derive(Default)]
struct Outbox {
    changes: Vec<(ChangeCallback, Vec<ChangeMessage>)>,
    status: Vec<(Arc<dyn Fn(&CollectionStatus) + Send + Sync>, CollectionStatus)>,
    loading: Vec<(Arc<dyn Fn(&bool) + Send + Sync>, bool)>,
    first_ready: Vec<Box<dyn FnOnce() + Send>>,
    ready_waiters: Vec<(oneshot::Sender<Result<(), String>>, Result<(), String>)>,
}

impl Outbox {
    fn is_empty(&self) -> bool {
        self.changes.is_empty()
            && self.status.is_empty()
            && self.loading.is_empty()
            && self.first_ready.is_empty()
            && self.ready_waiters.is_empty()
    }

    fn deliver(self) {
        if self.is_empty() {
            return;
        }
        scheduler::with_transaction(|| {
            for (callback, batch) in self.changes {
                callback(&batch);
            }
            for (listener, status) in self.status {
                listener(&status);
            }
            for (listener, loading) in self.loading {
                listener(&loading);
            }
            for callback in self.first_ready {
                callback();
            }
            for (waiter, result) in self.ready_waiters {
                let _ = waiter.send(result);
            }
        })
    }
}

#[derive(Clone)]
pub struct Collection {
    inner: Arc<CollectionInner>,
}

#[derive(Clone)]
pub struct WeakCollection(Weak<CollectionInner>);

impl WeakCollection {
    pub fn upgrade(&self) -> Option<Collection> {
        self.0.upgrade().map(|inner| Collection { inner })
    }
}

impl Collection {
    pub fn new(options: CollectionOptions) -> Collection {
        static NEXT_ID: AtomicU64 = AtomicU64::new(1);
        let collection = Collection {
            inner: Arc::new(CollectionInner {
                id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
                options,
                state: Mutex::new(CollectionState::default()),
            }),
        };
        if collection.inner.options.start_sync {
            collection.start_sync_immediate();
        }
        collection
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn name(&self) -> &str {
        &self.inner.options.name
    }

    pub fn options(&self) -> &CollectionOptions {
        &self.inner.options
    }

    pub fn downgrade(&self) -> WeakCollection {
        WeakCollection(Arc::downgrade(&self.inner))
    }

    pub fn status(&self) -> CollectionStatus {
        self.inner.state.lock().status
    }

    pub fn is_ready(&self) -> bool {
        self.status().is_ready()
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    pub fn get(&self, key: &Key) -> Option<Value> {
        self.ensure_active();
        self.inner.state.lock().visible.get(key).cloned()
    }

    pub fn has(&self, key: &Key) -> bool {
        self.ensure_active();
        self.inner.state.lock().visible.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.ensure_active();
        self.inner.state.lock().visible.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn to_array(&self) -> Vec<Value> {
        self.ensure_active();
        self.inner.state.lock().visible.values().cloned().collect()
    }

    pub fn entries(&self) -> Vec<(Key, Value)> {
        self.ensure_active();
        self.inner
            .state
            .lock()
            .visible
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// The current visible state as a synthetic insert batch, optionally
    /// filtered; what `include_initial_state` subscribers receive.
    pub fn current_state_as_changes(&self, filter: Option<RowPredicate>) -> Vec<ChangeMessage> {
        self.ensure_active();
        self.inner
            .state
            .lock()
            .visible
            .iter()
            .filter(|(_, row)| filter.as_ref().is_none_or(|f| f(row)))
            .map(|(key, row)| ChangeMessage::insert(key.clone(), row.clone()))
            .collect()
    }

    pub fn synced_metadata(&self, key: &Key) -> Option<Value> {
        self.inner.state.lock().store.metadata.get(key).cloned()
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Begin syncing now rather than on first access.
    pub fn start_sync_immediate(&self) {
        let adapter = {
            let mut state = self.inner.state.lock();
            let mut outbox = Outbox::default();
            match state.status {
                CollectionStatus::Idle => {}
                CollectionStatus::CleanedUp => {
                    // A fresh lifecycle gets a fresh first-ready edge.
                    state.first_ready_fired = false;
                }
                CollectionStatus::Error => {
                    // Explicit restart out of the error state.
                    if set_status(&mut state, CollectionStatus::Idle, &mut outbox).is_err() {
                        return;
                    }
                    state.error_message = None;
                    state.first_ready_fired = false;
                }
                _ => return,
            }
            if let Err(e) = set_status(&mut state, CollectionStatus::Loading, &mut outbox) {
                log::error!("{}: {e}", self.inner.options.name);
                return;
            }
            drop(state);
            outbox.deliver();
            self.inner.options.sync.clone()
        };
        match adapter {
            None => {
                // No sync source: the collection is purely local and
                // immediately ready.
                self.mark_ready();
            }
            Some(adapter) => {
                let session = SyncSession {
                    collection: self.downgrade(),
                };
                match adapter.start(session) {
                    Ok(handle) => {
                        self.inner.state.lock().sync_handle = Some(handle);
                    }
                    Err(e) => self.set_error(format!("sync adapter failed to start: {e}")),
                }
            }
        }
    }

    /// Wait until the collection has its initial data (or errors).
    pub async fn preload(&self) -> Result<(), Error> {
        self.ensure_active();
        self.start_sync_immediate();
        let waiter = {
            let mut state = self.inner.state.lock();
            match state.status {
                CollectionStatus::Ready => None,
                CollectionStatus::Error => {
                    let message = state.error_message.clone().unwrap_or_default();
                    return Err(Error::Other(message));
                }
                _ => {
                    let (tx, rx) = oneshot::channel();
                    state.ready_waiters.push(tx);
                    Some(rx)
                }
            }
        };
        match waiter {
            None => Ok(()),
            Some(rx) => match rx.await {
                Ok(Ok(())) => Ok(()),
                Ok(Err(message)) => Err(Error::Other(message)),
                Err(_) => Err(Error::Other("collection dropped while preloading".into())),
            },
        }
    }

    /// Tear the collection down: abort sync, discard pending transactions
    /// and all state, and notify status listeners (dependent live queries
    /// transition to error through that signal).
    pub fn cleanup(&self) -> Result<(), Error> {
        let (handle, outbox) = {
            let mut state = self.inner.state.lock();
            if state.status == CollectionStatus::CleanedUp {
                return Ok(());
            }
            let mut outbox = Outbox::default();
            set_status(&mut state, CollectionStatus::CleanedUp, &mut outbox)?;
            state.store = StateStore::default();
            state.visible.clear();
            state.active_txs.clear();
            state.persisting = 0;
            state.indexes.mark_all_removed();
            state.subscribers.clear();
            state.loading_subsets.clear();
            state.ready_waiters.clear();
            state.gc_generation += 1;
            (state.sync_handle.take(), outbox)
        };
        if let Some(handle) = handle {
            handle.cleanup();
        }
        outbox.deliver();
        Ok(())
    }

    /// Transition to the error state and fail pending waiters.
    pub fn set_error(&self, message: String) {
        log::error!("collection `{}` errored: {message}", self.inner.options.name);
        let outbox = {
            let mut state = self.inner.state.lock();
            if state.status == CollectionStatus::Error {
                return;
            }
            let mut outbox = Outbox::default();
            if let Err(e) = set_status(&mut state, CollectionStatus::Error, &mut outbox) {
                log::error!("{e}");
                return;
            }
            state.error_message = Some(message.clone());
            for waiter in state.ready_waiters.drain(..) {
                outbox.ready_waiters.push((waiter, Err(message.clone())));
            }
            outbox
        };
        outbox.deliver();
    }

    pub fn error_message(&self) -> Option<String> {
        self.inner.state.lock().error_message.clone()
    }

    /// Lazily start sync on first use, and restart it when the collection
    /// was cleaned up: any operation on a cleaned-up collection goes
    /// through here.
    fn ensure_active(&self) {
        match self.status() {
            CollectionStatus::Idle => self.start_sync_immediate(),
            CollectionStatus::CleanedUp => {
                log::debug!(
                    "collection `{}` used after cleanup; restarting sync",
                    self.inner.options.name
                );
                self.start_sync_immediate();
            }
            _ => {}
        }
    }

    // ------------------------------------------------------------------
    // Sync ingestion (driven by the adapter through `SyncSession`)
    // ------------------------------------------------------------------

    pub(crate) fn sync_begin(&self) {
        self.inner.state.lock().store.begin();
    }

    pub(crate) fn sync_write(&self, message: WriteMessage) -> Result<(), Error> {
        let mut state = self.inner.state.lock();
        let key = match message.key {
            Some(key) => key,
            None => (self.inner.options.key_fn)(&message.value).ok_or(SyncError::InvalidKey)?,
        };
        state.store.write(SyncOp {
            kind: message.kind,
            key,
            value: message.value,
            metadata: message.metadata,
        })?;
        Ok(())
    }

    pub(crate) fn sync_truncate(&self) -> Result<(), Error> {
        self.inner.state.lock().store.truncate()?;
        Ok(())
    }

    pub(crate) fn sync_commit(&self) -> Result<(), Error> {
        let outbox = {
            let mut state = self.inner.state.lock();
            state.store.commit()?;
            let mut outbox = Outbox::default();
            if state.persisting > 0 {
                log::debug!(
                    "collection `{}`: sync commit retained behind a persisting transaction",
                    self.inner.options.name
                );
            } else {
                self.apply_ready_sync_txs(&mut state, &mut outbox);
            }
            outbox
        };
        outbox.deliver();
        Ok(())
    }

    /// The adapter's "initial data present" signal.
    pub fn mark_ready(&self) {
        let outbox = {
            let mut state = self.inner.state.lock();
            let mut outbox = Outbox::default();
            match state.status {
                CollectionStatus::Loading | CollectionStatus::InitialCommit => {
                    if let Err(e) = set_status(&mut state, CollectionStatus::Ready, &mut outbox) {
                        log::error!("{e}");
                        return;
                    }
                }
                CollectionStatus::Ready => {}
                status => {
                    log::warn!(
                        "mark_ready on collection `{}` in status {status:?}",
                        self.inner.options.name
                    );
                    return;
                }
            }
            if !state.first_ready_fired {
                state.first_ready_fired = true;
                outbox.first_ready = std::mem::take(&mut state.first_ready);
            }
            for waiter in state.ready_waiters.drain(..) {
                outbox.ready_waiters.push((waiter, Ok(())));
            }
            outbox
        };
        outbox.deliver();
    }

    /// Apply every committed pending sync transaction and stage the
    /// resulting effective events.
    fn apply_ready_sync_txs(&self, state: &mut CollectionState, outbox: &mut Outbox) {
        if state.persisting > 0 || !state.store.has_committed() {
            return;
        }
        let txs = state.store.take_committed();
        let mut touched = Vec::new();
        for tx in &txs {
            touched.extend(state.store.apply(tx));
        }
        let events = self.recompute_visible(state, touched);
        if state.status == CollectionStatus::Loading {
            let mut scratch = Outbox::default();
            if set_status(state, CollectionStatus::InitialCommit, &mut scratch).is_ok() {
                outbox.status.append(&mut scratch.status);
            }
        }
        if events.is_empty() {
            return;
        }
        state.indexes.apply_changes(&events);
        outbox.changes.extend(state.subscribers.route(&events));
    }

    /// Diff old visible state against the new effective state for the
    /// touched keys, updating the cache and producing the event batch in
    /// operation order.
    fn recompute_visible(&self, state: &mut CollectionState, touched: Vec<Key>) -> Vec<ChangeMessage> {
        let mut seen = HashSet::new();
        let mut events = Vec::new();
        for key in touched {
            if !seen.insert(key.clone()) {
                continue;
            }
            let old = state.visible.get(&key).cloned();
            let new = effective_value(self.inner.id, state, &key);
            let mut event = match (old, new) {
                (None, Some(value)) => {
                    state.visible.insert(key.clone(), value.clone());
                    ChangeMessage::insert(key, value)
                }
                (Some(previous), Some(value)) => {
                    if previous == value {
                        continue;
                    }
                    state.visible.insert(key.clone(), value.clone());
                    ChangeMessage::update(key, value, previous)
                }
                (Some(previous), None) => {
                    state.visible.shift_remove(&key);
                    ChangeMessage::delete(key, previous)
                }
                (None, None) => continue,
            };
            event.metadata = state.store.metadata.get(&event.key).cloned();
            events.push(event);
        }
        events
    }

    // ------------------------------------------------------------------
    // Optimistic mutation (driven by `Transaction`)
    // ------------------------------------------------------------------

    pub(crate) fn optimistic_insert(&self, tx: &Transaction, value: Value) -> Result<Key, Error> {
        self.ensure_active();
        let (key, outbox) = {
            let mut state = self.inner.state.lock();
            self.check_writable(&state)?;
            self.validate(&value)?;
            let key = (self.inner.options.key_fn)(&value).ok_or(TransactionError::InvalidKey)?;
            if state.visible.contains_key(&key) {
                return Err(TransactionError::DuplicateKey(key).into());
            }
            tx.record(Mutation {
                kind: MutationKind::Insert,
                key: key.clone(),
                value: Some(value),
                previous: None,
                collection: self.clone(),
            })?;
            register_tx(&mut state, tx);
            let outbox = self.stage_recompute(&mut state, vec![key.clone()]);
            (key, outbox)
        };
        outbox.deliver();
        Ok(key)
    }

    pub(crate) fn optimistic_update(
        &self,
        tx: &Transaction,
        key: &Key,
        f: impl FnOnce(&mut Value),
    ) -> Result<(), Error> {
        self.ensure_active();
        let outbox = {
            let mut state = self.inner.state.lock();
            self.check_writable(&state)?;
            let current = state.visible.get(key).cloned().ok_or_else(|| TransactionError::MissingKey {
                op: "update",
                key: key.clone(),
            })?;
            let mut draft = current.clone();
            f(&mut draft);
            self.validate(&draft)?;
            tx.record(Mutation {
                kind: MutationKind::Update,
                key: key.clone(),
                value: Some(draft),
                previous: Some(current),
                collection: self.clone(),
            })?;
            register_tx(&mut state, tx);
            self.stage_recompute(&mut state, vec![key.clone()])
        };
        outbox.deliver();
        Ok(())
    }

    pub(crate) fn optimistic_delete(&self, tx: &Transaction, key: &Key) -> Result<(), Error> {
        self.ensure_active();
        let outbox = {
            let mut state = self.inner.state.lock();
            self.check_writable(&state)?;
            let current = state.visible.get(key).cloned().ok_or_else(|| TransactionError::MissingKey {
                op: "delete",
                key: key.clone(),
            })?;
            tx.record(Mutation {
                kind: MutationKind::Delete,
                key: key.clone(),
                value: None,
                previous: Some(current),
                collection: self.clone(),
            })?;
            register_tx(&mut state, tx);
            self.stage_recompute(&mut state, vec![key.clone()])
        };
        outbox.deliver();
        Ok(())
    }

    /// Single-mutation conveniences: open a transaction, apply, persist.
    pub async fn insert(&self, value: Value) -> Result<Transaction, Error> {
        let tx = Transaction::new();
        tx.insert(self, value)?;
        tx.commit().await?;
        Ok(tx)
    }

    pub async fn update(&self, key: &Key, f: impl FnOnce(&mut Value)) -> Result<Transaction, Error> {
        let tx = Transaction::new();
        tx.update(self, key, f)?;
        tx.commit().await?;
        Ok(tx)
    }

    pub async fn delete(&self, key: &Key) -> Result<Transaction, Error> {
        let tx = Transaction::new();
        tx.delete(self, key)?;
        tx.commit().await?;
        Ok(tx)
    }

    pub(crate) fn begin_persist(&self) {
        self.inner.state.lock().persisting += 1;
    }

    /// Drop a finished transaction's overlay and apply any sync commits
    /// retained behind it, as one observable batch.
    pub(crate) fn finalize_transaction(&self, tx: &Transaction, was_persisting: bool) {
        let outbox = {
            let mut state = self.inner.state.lock();
            if was_persisting {
                state.persisting = state.persisting.saturating_sub(1);
            }
            state.active_txs.retain(|t| t.id() != tx.id());
            let mut touched = tx.touched_keys(self.inner.id);
            if state.persisting == 0 && state.store.has_committed() {
                for synced in state.store.take_committed() {
                    touched.extend(state.store.apply(&synced));
                }
            }
            self.stage_recompute(&mut state, touched)
        };
        outbox.deliver();
    }

    fn stage_recompute(&self, state: &mut CollectionState, touched: Vec<Key>) -> Outbox {
        let mut outbox = Outbox::default();
        let events = self.recompute_visible(state, touched);
        if !events.is_empty() {
            state.indexes.apply_changes(&events);
            outbox.changes.extend(state.subscribers.route(&events));
        }
        outbox
    }

    fn check_writable(&self, state: &CollectionState) -> Result<(), Error> {
        if state.status == CollectionStatus::Error {
            return Err(LifecycleError::CollectionErrored(self.inner.options.name.clone()).into());
        }
        Ok(())
    }

    fn validate(&self, value: &Value) -> Result<(), Error> {
        if let Some(schema) = &self.inner.options.schema {
            schema.validate(value)?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Subscriptions & events
    // ------------------------------------------------------------------

    pub fn subscribe_changes(&self, callback: ChangeCallback, options: SubscribeOptions) -> SubscriptionHandle {
        self.ensure_active();
        let (id, outbox) = {
            let mut state = self.inner.state.lock();
            if let Some(expr) = &options.where_expression {
                let visible = std::mem::take(&mut state.visible);
                state
                    .indexes
                    .ensure(expr, self.inner.options.default_index_type, &visible);
                state.visible = visible;
            }
            let id = state.subscribers.add(callback.clone(), &options);
            state.gc_generation += 1;
            let mut outbox = Outbox::default();
            if options.include_initial_state {
                let initial = state.subscribers.initial_state(id, &state.visible);
                if !initial.is_empty() {
                    outbox.changes.push((callback, initial));
                }
            }
            (id, outbox)
        };
        outbox.deliver();
        SubscriptionHandle {
            collection: self.downgrade(),
            id,
            active: AtomicBool::new(true),
        }
    }

    /// Subscribe to changes of a single key.
    pub fn subscribe_changes_key(
        &self,
        key: Key,
        callback: ChangeCallback,
        mut options: SubscribeOptions,
    ) -> SubscriptionHandle {
        options.key = Some(key);
        self.subscribe_changes(callback, options)
    }

    fn unsubscribe(&self, id: u64) {
        let arm_gc = {
            let mut state = self.inner.state.lock();
            state.subscribers.remove(id) && state.subscribers.active_count() == 0
        };
        if arm_gc {
            self.arm_gc();
        }
    }

    fn flush_subscriber(&self, id: u64) {
        let delivery = self.inner.state.lock().subscribers.flush_batched(id);
        if let Some((callback, batch)) = delivery {
            scheduler::with_transaction(|| callback(&batch));
        }
    }

    pub fn active_subscriber_count(&self) -> usize {
        self.inner.state.lock().subscribers.active_count()
    }

    pub fn on_status_change(&self, listener: Arc<dyn Fn(&CollectionStatus) + Send + Sync>) -> EventHandle {
        let id = self.inner.state.lock().status_listeners.add(listener);
        EventHandle {
            collection: self.downgrade(),
            id,
            kind: EventKind::Status,
        }
    }

    pub fn on_loading_subset_change(&self, listener: Arc<dyn Fn(&bool) + Send + Sync>) -> EventHandle {
        let id = self.inner.state.lock().loading_listeners.add(listener);
        EventHandle {
            collection: self.downgrade(),
            id,
            kind: EventKind::LoadingSubset,
        }
    }

    /// Register a callback fired exactly once per lifecycle, when the
    /// collection first becomes ready. Registering after the edge has
    /// passed fires immediately.
    pub fn on_first_ready(&self, callback: Box<dyn FnOnce() + Send>) {
        let run_now = {
            let mut state = self.inner.state.lock();
            if state.first_ready_fired && state.status == CollectionStatus::Ready {
                Some(callback)
            } else {
                state.first_ready.push(callback);
                None
            }
        };
        if let Some(callback) = run_now {
            callback();
        }
    }

    // ------------------------------------------------------------------
    // GC
    // ------------------------------------------------------------------

    fn arm_gc(&self) {
        let gc_time = self.inner.options.gc_time;
        if gc_time.is_zero() {
            return;
        }
        let generation = {
            let mut state = self.inner.state.lock();
            if state.status == CollectionStatus::CleanedUp {
                return;
            }
            state.gc_generation += 1;
            state.gc_generation
        };
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            log::debug!(
                "collection `{}`: no async runtime, GC timer not armed",
                self.inner.options.name
            );
            return;
        };
        let weak = self.downgrade();
        handle.spawn(async move {
            tokio::time::sleep(gc_time).await;
            if let Some(collection) = weak.upgrade() {
                collection.try_gc(generation);
            }
        });
    }

    fn try_gc(&self, generation: u64) {
        let expired = {
            let state = self.inner.state.lock();
            state.gc_generation == generation
                && state.subscribers.active_count() == 0
                && state.status != CollectionStatus::CleanedUp
        };
        if expired {
            log::debug!("collection `{}`: GC expired, cleaning up", self.inner.options.name);
            if let Err(e) = self.cleanup() {
                log::error!("GC cleanup of `{}` failed: {e}", self.inner.options.name);
            }
        }
    }

    // ------------------------------------------------------------------
    // On-demand loading
    // ------------------------------------------------------------------

    /// Forward a windowed load request to the sync adapter, deduplicating
    /// by the request's canonical serialization. `on_done` fires after the
    /// source resolves (never for deduplicated or unsupported requests).
    pub fn request_load_subset(
        &self,
        request: SubsetRequest,
        on_done: Box<dyn FnOnce() + Send>,
    ) -> LoadSubsetOutcome {
        let canonical = request.canonical_key();
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            log::warn!("request_load_subset outside an async runtime");
            return LoadSubsetOutcome::Unsupported;
        };
        let (future, went_loading, listeners) = {
            let mut state = self.inner.state.lock();
            let Some(sync_handle) = &state.sync_handle else {
                return LoadSubsetOutcome::Unsupported;
            };
            if state.loading_subsets.contains(&canonical) {
                return LoadSubsetOutcome::Deduplicated;
            }
            let Some(future) = sync_handle.load_subset(&request) else {
                return LoadSubsetOutcome::Unsupported;
            };
            let went_loading = state.loading_subsets.is_empty();
            state.loading_subsets.insert(canonical.clone());
            (future, went_loading, state.loading_listeners.snapshot())
        };
        if went_loading {
            for listener in listeners {
                listener(&true);
            }
        }
        let weak = self.downgrade();
        handle.spawn(async move {
            let result = future.await;
            if let Some(collection) = weak.upgrade() {
                collection.finish_load_subset(&canonical, result);
            }
            on_done();
        });
        LoadSubsetOutcome::Started
    }

    fn finish_load_subset(&self, canonical: &str, result: Result<(), Error>) {
        let (now_idle, listeners) = {
            let mut state = self.inner.state.lock();
            state.loading_subsets.remove(canonical);
            (state.loading_subsets.is_empty(), state.loading_listeners.snapshot())
        };
        if let Err(e) = result {
            self.set_error(format!("load_subset failed: {e}"));
        }
        if now_idle {
            for listener in listeners {
                listener(&false);
            }
        }
    }

    pub fn is_loading_subset(&self) -> bool {
        !self.inner.state.lock().loading_subsets.is_empty()
    }

    pub fn sync_metadata(&self) -> SyncMetadata {
        self.inner
            .state
            .lock()
            .sync_handle
            .as_ref()
            .map(|h| h.metadata())
            .unwrap_or_default()
    }

    /// Ensure an index exists for `expr` (alias-free), returning its id.
    pub fn ensure_index(&self, expr: &Expr) -> IndexId {
        let mut state = self.inner.state.lock();
        let visible = std::mem::take(&mut state.visible);
        let id = state
            .indexes
            .ensure(expr, self.inner.options.default_index_type, &visible);
        state.visible = visible;
        id
    }

    /// Equality lookup through a previously ensured index.
    pub fn index_lookup_eq(&self, id: IndexId, value: &Value) -> Option<Vec<Key>> {
        let mut state = self.inner.state.lock();
        let visible = std::mem::take(&mut state.visible);
        let result = state.indexes.lookup_eq(id, value, &visible);
        state.visible = visible;
        result
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoadSubsetOutcome {
    Started,
    Deduplicated,
    Unsupported,
}

fn register_tx(state: &mut CollectionState, tx: &Transaction) {
    if !state.active_txs.iter().any(|t| t.id() == tx.id()) {
        state.active_txs.push(tx.clone());
    }
}

/// Base value with the optimistic overlay of every active transaction (in
/// transaction order) applied.
fn effective_value(collection_id: u64, state: &CollectionState, key: &Key) -> Option<Value> {
    let mut value = state.store.synced.get(key).cloned();
    for tx in &state.active_txs {
        if let Some(effect) = tx.overlay(collection_id, key) {
            value = effect;
        }
    }
    value
}

fn set_status(
    state: &mut CollectionState,
    to: CollectionStatus,
    outbox: &mut Outbox,
) -> Result<(), LifecycleError> {
    validate_transition(state.status, to)?;
    state.status = to;
    for listener in state.status_listeners.snapshot() {
        outbox.status.push((listener, to));
    }
    Ok(())
}

/// A change subscription. Dropping (or explicitly unsubscribing) removes
/// the subscriber; the last removal arms the GC timer.
pub struct SubscriptionHandle {
    collection: WeakCollection,
    id: u64,
    active: AtomicBool,
}

impl SubscriptionHandle {
    pub fn unsubscribe(&self) {
        if self.active.swap(false, Ordering::AcqRel) {
            if let Some(collection) = self.collection.upgrade() {
                collection.unsubscribe(self.id);
            }
        }
    }

    /// Force emission of accumulated events on a batching subscription.
    pub fn flush(&self) {
        if let Some(collection) = self.collection.upgrade() {
            collection.flush_subscriber(self.id);
        }
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

enum EventKind {
    Status,
    LoadingSubset,
}

/// Handle for a status/loading listener; dropping unregisters.
pub struct EventHandle {
    collection: WeakCollection,
    id: u64,
    kind: EventKind,
}

impl Drop for EventHandle {
    fn drop(&mut self) {
        if let Some(collection) = self.collection.upgrade() {
            let mut state = collection.inner.state.lock();
            match self.kind {
                EventKind::Status => {
                    state.status_listeners.remove(self.id);
                }
                EventKind::LoadingSubset => {
                    state.loading_listeners.remove(self.id);
                }
            }
        }
    }
}
