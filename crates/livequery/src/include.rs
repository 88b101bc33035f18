//! Child collections for `include` sub-queries.
//!
//! Each include entry runs one secondary pipeline whose output envelopes
//! carry a correlation value; the runtime demultiplexes them into one child
//! collection per correlation key. Parent deletion disposes the child
//! collection; nested includes recurse through the same machinery, with
//! grandchildren found by scanning the disposed child's rows for their
//! nested correlation values.

use crate::compiler::{CompiledInclude, ENV_CORR};
use crate::runtime::{convert_envelopes, Execution, OutputState};
use mirrordb_core::{
    ChangeKind, Collection, CollectionOptions, SessionAdapter, SubscriptionHandle, SyncSession,
    WriteMessage,
};
use itertools::Itertools;
use mirrordb_dataflow::Delta;
use mirrordb_value::{canonical_string, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

pub(crate) struct ChildEntry {
    pub collection: Collection,
    pub session: SyncSession,
    pub output: OutputState,
}

pub(crate) struct IncludeState {
    pub compiled: CompiledInclude,
    pub subscriptions: Vec<SubscriptionHandle>,
    /// Buffered deltas from the child pipeline's alias subscriptions.
    pub pending: Vec<(String, Delta)>,
    /// Correlation key (canonical) → child collection.
    pub children: HashMap<String, ChildEntry>,
    pub nested: Vec<IncludeState>,
}

impl IncludeState {
    pub fn build(compiled: CompiledInclude) -> IncludeState {
        let mut compiled = compiled;
        let nested = std::mem::take(&mut compiled.child.includes)
            .into_iter()
            .map(IncludeState::build)
            .collect();
        IncludeState {
            compiled,
            subscriptions: Vec::new(),
            pending: Vec::new(),
            children: HashMap::new(),
            nested,
        }
    }

    fn ensure_child(&mut self, corr: &Value, parent_name: &str) -> &mut ChildEntry {
        let canonical = canonical_string(corr);
        let field = self.compiled.field_name.clone();
        let ordered = self.compiled.child.ordered;
        self.children.entry(canonical.clone()).or_insert_with(|| {
            let adapter = SessionAdapter::new(true);
            let collection = Collection::new(
                CollectionOptions::with_key_fn(
                    format!("{parent_name}.{field}[{canonical}]"),
                    Arc::new(|_| None),
                )
                .sync(adapter.clone())
                .start_sync(true)
                // Owned by the parent runtime; never independently GCed.
                .gc_time(Duration::ZERO),
            );
            let session = adapter.session().expect("session adapter started");
            ChildEntry {
                collection,
                session,
                output: OutputState::new(None, ordered),
            }
        })
    }

    /// Run the five include phases for one parent flush.
    pub fn process(&mut self, parent_ops: &[WriteMessage], parent_name: &str, exec: &mut Execution) {
        // Phase 1: make sure a child collection exists for every parent row
        // entering the batch.
        for op in parent_ops {
            if matches!(op.kind, ChangeKind::Insert | ChangeKind::Update) {
                if let Some(corr) = op.value.path(&self.compiled.correlation_field).cloned() {
                    self.ensure_child(&corr, parent_name);
                }
            }
        }

        // Phase 2: drain pending child pipeline input and step the graph.
        let mut delta = Vec::new();
        for (input, batch) in self.pending.drain(..) {
            self.compiled.child.graph.push_input(&input, batch);
        }
        delta.extend(self.compiled.child.graph.step());

        // Phase 3: route output envelopes to their child collections by
        // correlation key.
        let by_corr: HashMap<String, Delta> = delta.into_iter().into_group_map_by(|(env, _)| {
            canonical_string(env.get(ENV_CORR).unwrap_or(&Value::Null))
        });
        let mut child_ops_all = Vec::new();
        for (_, group) in by_corr {
            // Children can receive rows before their parent arrives; they
            // attach when it does.
            let corr_value = group
                .first()
                .and_then(|(env, _)| env.get(ENV_CORR).cloned())
                .unwrap_or(Value::Null);
            let entry = self.ensure_child(&corr_value, parent_name);
            let ops = convert_envelopes(&mut entry.output, group);
            if !ops.is_empty() {
                child_ops_all.extend(ops.clone());
                exec.batches.push((entry.session.clone(), ops));
            }
        }

        // Phase 4: recurse into nested includes with the child batch as
        // their parent flush.
        for nested in &mut self.nested {
            nested.process(&child_ops_all, parent_name, exec);
        }

        // Phase 5: dispose children of deleted parents and purge routing
        // for their rows.
        for op in parent_ops {
            if op.kind != ChangeKind::Delete {
                continue;
            }
            let Some(corr) = op.value.path(&self.compiled.correlation_field) else {
                continue;
            };
            let canonical = canonical_string(corr);
            if let Some(entry) = self.children.remove(&canonical) {
                for nested in &mut self.nested {
                    nested.dispose_for_rows(&entry.collection.to_array(), exec);
                }
                exec.disposals.push(entry.collection);
            }
        }
    }

    /// Dispose grandchildren correlated with any of `rows` (rows of a child
    /// collection being torn down).
    fn dispose_for_rows(&mut self, rows: &[Value], exec: &mut Execution) {
        for row in rows {
            let Some(corr) = row.path(&self.compiled.correlation_field) else {
                continue;
            };
            let canonical = canonical_string(corr);
            if let Some(entry) = self.children.remove(&canonical) {
                for nested in &mut self.nested {
                    nested.dispose_for_rows(&entry.collection.to_array(), exec);
                }
                exec.disposals.push(entry.collection);
            }
        }
    }

    pub fn child_for(&self, corr: &Value) -> Option<Collection> {
        self.children
            .get(&canonical_string(corr))
            .map(|entry| entry.collection.clone())
    }

    /// Every source collection referenced by this include's pipeline tree.
    pub fn sources(&self) -> Vec<Collection> {
        let mut out: Vec<Collection> = self
            .compiled
            .child
            .aliases
            .iter()
            .map(|a| a.collection.clone())
            .collect();
        for nested in &self.nested {
            out.extend(nested.sources());
        }
        out
    }

    pub fn dispose_all(&mut self, exec: &mut Execution) {
        for (_, entry) in self.children.drain() {
            exec.disposals.push(entry.collection);
        }
        for nested in &mut self.nested {
            nested.dispose_all(exec);
        }
        self.subscriptions.clear();
        self.pending.clear();
    }
}
