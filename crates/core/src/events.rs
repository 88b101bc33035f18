use indexmap::IndexMap;
use std::sync::Arc;

/// A small keyed listener registry. Emission snapshots the callbacks so the
/// collection lock can be released before any listener runs.
pub(crate) struct Listeners<T> {
    next: u64,
    entries: IndexMap<u64, Arc<dyn Fn(&T) + Send + Sync>>,
}

impl<T> Default for Listeners<T> {
    fn default() -> Self {
        Listeners {
            next: 0,
            entries: IndexMap::new(),
        }
    }
}

impl<T> Listeners<T> {
    pub fn add(&mut self, listener: Arc<dyn Fn(&T) + Send + Sync>) -> u64 {
        self.next += 1;
        self.entries.insert(self.next, listener);
        self.next
    }

    pub fn remove(&mut self, id: u64) -> bool {
        self.entries.shift_remove(&id).is_some()
    }

    pub fn snapshot(&self) -> Vec<Arc<dyn Fn(&T) + Send + Sync>> {
        self.entries.values().cloned().collect()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
