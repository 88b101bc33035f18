use mirrordb_core::change::ChangeMessage;
use mirrordb_core::subscribers::ChangeCallback;
use mirrordb_core::sync::{SyncAdapter, SyncHandle, SyncSession};
use mirrordb_core::Error;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// A sync adapter driven directly by the test: it hands the session back
/// out so the test can play the role of the remote source.
#[derive(Default)]
pub struct TestAdapter {
    session: Mutex<Option<SyncSession>>,
    cleanups: Arc<AtomicUsize>,
}

impl TestAdapter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn session(&self) -> SyncSession {
        self.session.lock().clone().expect("sync not started")
    }

    pub fn cleanup_count(&self) -> usize {
        self.cleanups.load(Ordering::SeqCst)
    }
}

struct TestHandle {
    cleanups: Arc<AtomicUsize>,
}

impl SyncHandle for TestHandle {
    fn cleanup(&self) {
        self.cleanups.fetch_add(1, Ordering::SeqCst);
    }
}

impl SyncAdapter for TestAdapter {
    fn start(&self, session: SyncSession) -> Result<Box<dyn SyncHandle>, Error> {
        *self.session.lock() = Some(session);
        Ok(Box::new(TestHandle {
            cleanups: self.cleanups.clone(),
        }))
    }
}

pub type Batches = Arc<Mutex<Vec<Vec<ChangeMessage>>>>;

/// A change callback that records every delivered batch.
pub fn recording_subscriber() -> (ChangeCallback, Batches) {
    let seen: Batches = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let callback: ChangeCallback = Arc::new(move |batch: &[ChangeMessage]| {
        sink.lock().push(batch.to_vec());
    });
    (callback, seen)
}
