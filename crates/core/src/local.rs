//! A purely local sync source.
//!
//! `LocalAdapter` marks the collection ready immediately and loops user
//! mutations back as sync commits, so local-only collections move through
//! the same ingest path as remote-backed ones. Used for client-side state
//! and heavily throughout the test suites.

use crate::change::ChangeKind;
use crate::config::{CollectionOptions, MutationHandler};
use crate::error::Error;
use crate::sync::{SyncAdapter, SyncHandle, SyncSession, WriteMessage};
use crate::transactions::{Mutation, MutationKind};
use parking_lot::Mutex;
use std::sync::Arc;

#[derive(Default)]
pub struct LocalAdapter {
    session: Mutex<Option<SyncSession>>,
}

impl LocalAdapter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Confirm a persisted batch by replaying it through the sync session.
    fn confirm(&self, mutations: &[Mutation]) {
        let session = self.session.lock().clone();
        let Some(session) = session else {
            log::warn!("local adapter confirm before sync started");
            return;
        };
        session.begin();
        for mutation in mutations {
            let message = match mutation.kind {
                MutationKind::Insert | MutationKind::Update => WriteMessage {
                    kind: if mutation.kind == MutationKind::Insert {
                        ChangeKind::Insert
                    } else {
                        ChangeKind::Update
                    },
                    key: Some(mutation.key.clone()),
                    value: mutation.value.clone().unwrap_or_default(),
                    metadata: None,
                },
                MutationKind::Delete => WriteMessage {
                    kind: ChangeKind::Delete,
                    key: Some(mutation.key.clone()),
                    value: mutation.previous.clone().unwrap_or_default(),
                    metadata: None,
                },
            };
            if let Err(e) = session.write(message) {
                session.error(format!("local loopback write failed: {e}"));
                return;
            }
        }
        if let Err(e) = session.commit() {
            session.error(format!("local loopback commit failed: {e}"));
        }
    }
}

struct LocalHandle;

impl SyncHandle for LocalHandle {}

impl SyncAdapter for LocalAdapter {
    fn start(&self, session: SyncSession) -> Result<Box<dyn SyncHandle>, Error> {
        session.mark_ready();
        *self.session.lock() = Some(session);
        Ok(Box::new(LocalHandle))
    }
}

/// An adapter that simply hands its session back out, for callers that
/// drive a collection's ingest path themselves (live query runtimes write
/// their results through one of these).
#[derive(Default)]
pub struct SessionAdapter {
    mark_ready_on_start: bool,
    session: Mutex<Option<SyncSession>>,
}

impl SessionAdapter {
    pub fn new(mark_ready_on_start: bool) -> Arc<Self> {
        Arc::new(SessionAdapter {
            mark_ready_on_start,
            session: Mutex::new(None),
        })
    }

    pub fn session(&self) -> Option<SyncSession> {
        self.session.lock().clone()
    }
}

impl SyncAdapter for SessionAdapter {
    fn start(&self, session: SyncSession) -> Result<Box<dyn SyncHandle>, Error> {
        if self.mark_ready_on_start {
            session.mark_ready();
        }
        *self.session.lock() = Some(session);
        Ok(Box::new(LocalHandle))
    }
}

/// Options for a local-only collection: the adapter plus mutation handlers
/// that loop every committed transaction back through sync.
pub fn local_collection_options(name: impl Into<String>, key_path: &str) -> CollectionOptions {
    let adapter = LocalAdapter::new();
    let handler: MutationHandler = {
        let adapter = adapter.clone();
        Arc::new(move |mutations: Vec<Mutation>| {
            let adapter = adapter.clone();
            Box::pin(async move {
                adapter.confirm(&mutations);
                Ok(())
            })
        })
    };
    CollectionOptions::new(name, key_path)
        .sync(adapter)
        .start_sync(true)
        .on_insert(handler.clone())
        .on_update(handler.clone())
        .on_delete(handler)
}
