//! Secondary indexes over a collection's visible state.
//!
//! Indexes are keyed by a canonical signature of their expression, so asking
//! twice for the same expression reuses the same index. Eager indexes build
//! on creation; lazy ones build on first use. Cleanup marks entries removed
//! so any in-flight build can short-circuit.

use crate::change::{ChangeKind, ChangeMessage};
use indexmap::IndexMap;
use mirrordb_expr::{eval, Expr};
use mirrordb_value::{Key, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::time::Instant;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IndexId(u64);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum IndexKind {
    Eager,
    #[default]
    Lazy,
}

#[derive(Debug, Default)]
pub(crate) struct BTreeIndex {
    map: BTreeMap<Value, BTreeSet<Key>>,
}

impl BTreeIndex {
    fn add(&mut self, value: Value, key: Key) {
        self.map.entry(value).or_default().insert(key);
    }

    fn remove(&mut self, value: &Value, key: &Key) {
        if let Some(keys) = self.map.get_mut(value) {
            keys.remove(key);
            if keys.is_empty() {
                self.map.remove(value);
            }
        }
    }

    pub fn get(&self, value: &Value) -> impl Iterator<Item = &Key> {
        self.map.get(value).into_iter().flatten()
    }

    pub fn len(&self) -> usize {
        self.map.values().map(BTreeSet::len).sum()
    }
}

enum IndexState {
    /// Lazy index not yet built.
    Pending,
    Resolved(BTreeIndex),
    Removed,
}

pub(crate) struct IndexEntry {
    pub id: IndexId,
    pub signature: String,
    /// Alias-free expression evaluated against the bare row.
    pub expr: Expr,
    pub kind: IndexKind,
    state: IndexState,
    pub last_built_at: Option<Instant>,
}

fn index_value(expr: &Expr, row: &Value) -> Value {
    eval::eval(expr, row).unwrap_or_else(|e| {
        log::warn!("index expression failed to evaluate: {e}");
        Value::Null
    })
}

#[derive(Default)]
pub(crate) struct IndexCatalog {
    next_id: u64,
    entries: IndexMap<IndexId, IndexEntry>,
}

impl IndexCatalog {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Get or create the index for `expr`. Eager indexes (and `resolve`d
    /// lazy ones) are built from `visible`.
    pub fn ensure(&mut self, expr: &Expr, kind: IndexKind, visible: &IndexMap<Key, Value>) -> IndexId {
        let signature = expr.signature();
        if let Some(entry) = self.entries.values().find(|e| e.signature == signature) {
            log::debug!(
                "reusing {:?} index {:?} (built {:?})",
                entry.kind,
                entry.id,
                entry.last_built_at
            );
            return entry.id;
        }
        self.next_id += 1;
        let id = IndexId(self.next_id);
        let mut entry = IndexEntry {
            id,
            signature,
            expr: expr.clone(),
            kind,
            state: IndexState::Pending,
            last_built_at: None,
        };
        if kind == IndexKind::Eager {
            entry.state = IndexState::Resolved(build(&entry.expr, visible));
            entry.last_built_at = Some(Instant::now());
        }
        self.entries.insert(id, entry);
        id
    }

    /// Look up keys whose indexed value equals `value`, building a lazy
    /// index on first use. Returns `None` for removed/unknown indexes.
    pub fn lookup_eq(&mut self, id: IndexId, value: &Value, visible: &IndexMap<Key, Value>) -> Option<Vec<Key>> {
        let entry = self.entries.get_mut(&id)?;
        if matches!(entry.state, IndexState::Removed) {
            return None;
        }
        if matches!(entry.state, IndexState::Pending) {
            entry.state = IndexState::Resolved(build(&entry.expr, visible));
            entry.last_built_at = Some(Instant::now());
        }
        match &entry.state {
            IndexState::Resolved(index) => Some(index.get(value).cloned().collect()),
            _ => None,
        }
    }

    /// Maintain every resolved index from one effective change batch.
    pub fn apply_changes(&mut self, changes: &[ChangeMessage]) {
        for entry in self.entries.values_mut() {
            let IndexState::Resolved(index) = &mut entry.state else {
                continue;
            };
            for change in changes {
                match change.kind {
                    ChangeKind::Insert => {
                        index.add(index_value(&entry.expr, &change.value), change.key.clone());
                    }
                    ChangeKind::Update => {
                        if let Some(previous) = &change.previous_value {
                            index.remove(&index_value(&entry.expr, previous), &change.key);
                        }
                        index.add(index_value(&entry.expr, &change.value), change.key.clone());
                    }
                    ChangeKind::Delete => {
                        index.remove(&index_value(&entry.expr, &change.value), &change.key);
                    }
                }
            }
        }
    }

    /// Mark everything removed (cleanup); in-flight lazy builds observe the
    /// flag and stop.
    pub fn mark_all_removed(&mut self) {
        for entry in self.entries.values_mut() {
            entry.state = IndexState::Removed;
        }
        self.entries.clear();
        self.next_id = 0;
    }
}

fn build(expr: &Expr, visible: &IndexMap<Key, Value>) -> BTreeIndex {
    let mut index = BTreeIndex::default();
    for (key, row) in visible {
        index.add(index_value(expr, row), key.clone());
    }
    index
}

#[cfg(test)]
mod tests {
    use super::*;
    use mirrordb_expr::builder::col;
    use mirrordb_value::row;

    fn visible() -> IndexMap<Key, Value> {
        let mut m = IndexMap::new();
        m.insert(Key::Int(1), row! { "id" => 1, "team" => "a" });
        m.insert(Key::Int(2), row! { "id" => 2, "team" => "b" });
        m.insert(Key::Int(3), row! { "id" => 3, "team" => "a" });
        m
    }

    fn team_expr() -> Expr {
        col("team").strip_alias()
    }

    #[test]
    fn same_expression_reuses_the_index() {
        let mut catalog = IndexCatalog::default();
        let visible = visible();
        let a = catalog.ensure(&team_expr(), IndexKind::Lazy, &visible);
        let b = catalog.ensure(&team_expr(), IndexKind::Lazy, &visible);
        assert_eq!(a, b);
        assert_eq!(catalog.len(), 1);
    }

    #[test]
    fn lazy_index_builds_on_first_lookup() {
        let mut catalog = IndexCatalog::default();
        let visible = visible();
        let id = catalog.ensure(&team_expr(), IndexKind::Lazy, &visible);
        let keys = catalog.lookup_eq(id, &Value::from("a"), &visible).unwrap();
        assert_eq!(keys, vec![Key::Int(1), Key::Int(3)]);
    }

    #[test]
    fn changes_maintain_resolved_indexes() {
        let mut catalog = IndexCatalog::default();
        let visible = visible();
        let id = catalog.ensure(&team_expr(), IndexKind::Eager, &visible);

        catalog.apply_changes(&[ChangeMessage::update(
            Key::Int(2),
            row! { "id" => 2, "team" => "a" },
            row! { "id" => 2, "team" => "b" },
        )]);
        let keys = catalog.lookup_eq(id, &Value::from("a"), &visible).unwrap();
        assert_eq!(keys, vec![Key::Int(1), Key::Int(2), Key::Int(3)]);
        assert!(catalog
            .lookup_eq(id, &Value::from("b"), &visible)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn removed_indexes_short_circuit() {
        let mut catalog = IndexCatalog::default();
        let visible = visible();
        let id = catalog.ensure(&team_expr(), IndexKind::Lazy, &visible);
        catalog.mark_all_removed();
        assert_eq!(catalog.lookup_eq(id, &Value::from("a"), &visible), None);
    }
}
