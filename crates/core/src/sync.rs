//! The sync adapter contract.
//!
//! An adapter owns whatever async machinery feeds it (a websocket, a change
//! stream, an embedded database); the core exposes an imperative session of
//! `begin`/`write`/`commit`/`truncate`/`mark_ready` calls. Adapters must not
//! hold a `begin` open across an unrelated commit.

use crate::change::ChangeKind;
use crate::collection::WeakCollection;
use crate::error::Error;
use futures::future::BoxFuture;
use mirrordb_expr::{Expr, OrderDir};
use mirrordb_value::{canonical_string, Value};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum SyncMode {
    /// The source pushes the full subscribed set up front.
    #[default]
    Eager,
    /// Rows arrive only through `load_subset` requests.
    OnDemand,
    /// An initial window arrives eagerly, the rest on demand.
    Progressive,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct SyncMetadata {
    pub sync_mode: SyncMode,
}

/// A write delivered by the adapter. The key is derived by the collection's
/// key function unless the source supplies one explicitly.
#[derive(Clone, Debug)]
pub struct WriteMessage {
    pub kind: ChangeKind,
    pub key: Option<mirrordb_value::Key>,
    pub value: Value,
    pub metadata: Option<Value>,
}

impl WriteMessage {
    pub fn insert(value: Value) -> Self {
        WriteMessage {
            kind: ChangeKind::Insert,
            key: None,
            value,
            metadata: None,
        }
    }

    pub fn update(value: Value) -> Self {
        WriteMessage {
            kind: ChangeKind::Update,
            key: None,
            value,
            metadata: None,
        }
    }

    pub fn delete(value: Value) -> Self {
        WriteMessage {
            kind: ChangeKind::Delete,
            key: None,
            value,
            metadata: None,
        }
    }

    pub fn with_key(mut self, key: mirrordb_value::Key) -> Self {
        self.key = Some(key);
        self
    }
}

/// A request for more rows from an on-demand source.
#[derive(Clone, Debug, Default)]
pub struct SubsetRequest {
    pub order_by: Option<Vec<(String, OrderDir)>>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
    /// Cursor: rows strictly greater than these values in the declared
    /// order.
    pub min_values: Option<Vec<Value>>,
    pub where_expr: Option<Expr>,
}

impl SubsetRequest {
    /// Canonical serialization used to deduplicate identical requests.
    pub fn canonical_key(&self) -> String {
        let mut parts = Vec::new();
        if let Some(order_by) = &self.order_by {
            let fields: Value = order_by
                .iter()
                .map(|(f, dir)| Value::from(format!("{f}:{dir:?}")))
                .collect();
            parts.push(("order_by".to_string(), fields));
        }
        if let Some(limit) = self.limit {
            parts.push(("limit".to_string(), Value::Int(limit as i64)));
        }
        if let Some(offset) = self.offset {
            parts.push(("offset".to_string(), Value::Int(offset as i64)));
        }
        if let Some(min_values) = &self.min_values {
            parts.push(("min_values".to_string(), Value::Array(min_values.clone())));
        }
        if let Some(expr) = &self.where_expr {
            parts.push(("where".to_string(), Value::from(expr.signature())));
        }
        canonical_string(&Value::object(parts))
    }
}

/// The imperative write surface handed to an adapter.
///
/// Holds a weak reference: a session outliving its collection becomes a
/// no-op rather than keeping the collection alive.
#[derive(Clone)]
pub struct SyncSession {
    pub(crate) collection: WeakCollection,
}

impl SyncSession {
    pub fn begin(&self) {
        if let Some(c) = self.collection.upgrade() {
            c.sync_begin();
        }
    }

    pub fn write(&self, message: WriteMessage) -> Result<(), Error> {
        match self.collection.upgrade() {
            Some(c) => c.sync_write(message),
            None => Ok(()),
        }
    }

    pub fn commit(&self) -> Result<(), Error> {
        match self.collection.upgrade() {
            Some(c) => c.sync_commit(),
            None => Ok(()),
        }
    }

    pub fn truncate(&self) -> Result<(), Error> {
        match self.collection.upgrade() {
            Some(c) => c.sync_truncate(),
            None => Ok(()),
        }
    }

    pub fn mark_ready(&self) {
        if let Some(c) = self.collection.upgrade() {
            c.mark_ready();
        }
    }

    /// Report an adapter-side failure; transitions the collection to the
    /// error state.
    pub fn error(&self, message: impl Into<String>) {
        if let Some(c) = self.collection.upgrade() {
            c.set_error(message.into());
        }
    }
}

pub trait SyncAdapter: Send + Sync + 'static {
    /// Start syncing into `session`. The returned handle is kept for the
    /// collection's lifetime and torn down on cleanup.
    fn start(&self, session: SyncSession) -> Result<Box<dyn SyncHandle>, Error>;
}

pub trait SyncHandle: Send + Sync {
    /// Invoked on collection teardown.
    fn cleanup(&self) {}

    /// Ask the source for more rows. `None` means the source does not
    /// support on-demand loading.
    fn load_subset(&self, _request: &SubsetRequest) -> Option<BoxFuture<'static, Result<(), Error>>> {
        None
    }

    fn metadata(&self) -> SyncMetadata {
        SyncMetadata::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mirrordb_expr::builder::{col, lit};

    #[test]
    fn canonical_key_is_stable_and_discriminating() {
        let a = SubsetRequest {
            order_by: Some(vec![("n".into(), OrderDir::Asc)]),
            limit: Some(10),
            min_values: Some(vec![Value::Int(5)]),
            ..Default::default()
        };
        let same = SubsetRequest {
            order_by: Some(vec![("n".into(), OrderDir::Asc)]),
            limit: Some(10),
            min_values: Some(vec![Value::Int(5)]),
            ..Default::default()
        };
        assert_eq!(a.canonical_key(), same.canonical_key());

        let different = SubsetRequest {
            min_values: Some(vec![Value::Int(6)]),
            ..same.clone()
        };
        assert_ne!(a.canonical_key(), different.canonical_key());

        let with_where = SubsetRequest {
            where_expr: Some(col("n").gt(lit(1))),
            ..Default::default()
        };
        assert_ne!(a.canonical_key(), with_where.canonical_key());
    }
}
