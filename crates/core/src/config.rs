use crate::error::{Error, SchemaError};
use crate::index::IndexKind;
use crate::sync::SyncAdapter;
use crate::transactions::Mutation;
use futures::future::BoxFuture;
use mirrordb_value::{Key, Value};
use std::sync::Arc;
use std::time::Duration;

pub type KeyFn = Arc<dyn Fn(&Value) -> Option<Key> + Send + Sync>;

/// Persistence handler invoked with the mutations of one kind from a
/// committing transaction. The transaction completes when every handler
/// resolves and fails when any rejects.
pub type MutationHandler = Arc<dyn Fn(Vec<Mutation>) -> BoxFuture<'static, Result<(), Error>> + Send + Sync>;

/// Optional schema validation, invoked on user mutations before the
/// optimistic overlay is applied.
pub trait Validator: Send + Sync {
    fn validate(&self, row: &Value) -> Result<(), SchemaError>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum StringCollation {
    #[default]
    Binary,
    CaseInsensitive,
}

/// Collection configuration.
#[derive(Clone)]
pub struct CollectionOptions {
    pub name: String,
    pub key_fn: KeyFn,
    /// Inactivity period before an unobserved collection is garbage
    /// collected. Zero disables GC.
    pub gc_time: Duration,
    pub default_index_type: IndexKind,
    pub default_string_collation: StringCollation,
    pub sync: Option<Arc<dyn SyncAdapter>>,
    /// Start syncing on construction instead of on first use.
    pub start_sync: bool,
    pub schema: Option<Arc<dyn Validator>>,
    pub on_insert: Option<MutationHandler>,
    pub on_update: Option<MutationHandler>,
    pub on_delete: Option<MutationHandler>,
    /// Set on collections maintained by a live query runtime: the scheduler
    /// job that writes them, so downstream queries can order themselves
    /// after it within a transaction context.
    pub scheduler_job: Option<crate::scheduler::JobId>,
}

impl CollectionOptions {
    /// Options with the key taken from `key_path` on each row.
    pub fn new(name: impl Into<String>, key_path: &str) -> Self {
        let path = key_path.to_owned();
        Self::with_key_fn(
            name,
            Arc::new(move |row: &Value| row.path(&path).and_then(Key::from_value)),
        )
    }

    pub fn with_key_fn(name: impl Into<String>, key_fn: KeyFn) -> Self {
        CollectionOptions {
            name: name.into(),
            key_fn,
            gc_time: Duration::from_secs(300),
            default_index_type: IndexKind::Lazy,
            default_string_collation: StringCollation::default(),
            sync: None,
            start_sync: false,
            schema: None,
            on_insert: None,
            on_update: None,
            on_delete: None,
            scheduler_job: None,
        }
    }

    pub fn scheduler_job(mut self, job: crate::scheduler::JobId) -> Self {
        self.scheduler_job = Some(job);
        self
    }

    pub fn gc_time(mut self, gc_time: Duration) -> Self {
        self.gc_time = gc_time;
        self
    }

    pub fn default_index_type(mut self, kind: IndexKind) -> Self {
        self.default_index_type = kind;
        self
    }

    pub fn sync(mut self, adapter: Arc<dyn SyncAdapter>) -> Self {
        self.sync = Some(adapter);
        self
    }

    pub fn start_sync(mut self, start: bool) -> Self {
        self.start_sync = start;
        self
    }

    pub fn schema(mut self, validator: Arc<dyn Validator>) -> Self {
        self.schema = Some(validator);
        self
    }

    pub fn on_insert(mut self, handler: MutationHandler) -> Self {
        self.on_insert = Some(handler);
        self
    }

    pub fn on_update(mut self, handler: MutationHandler) -> Self {
        self.on_update = Some(handler);
        self
    }

    pub fn on_delete(mut self, handler: MutationHandler) -> Self {
        self.on_delete = Some(handler);
        self
    }
}
