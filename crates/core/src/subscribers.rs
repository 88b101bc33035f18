//! Change subscription fanout.
//!
//! Whole-collection subscribers see every effective change; per-key
//! subscribers only their key. A `where` filter reshapes updates at the
//! filter boundary: a row updated into the filtered set arrives as an
//! insert, a row updated out of it as a delete.

use crate::change::{ChangeKind, ChangeMessage};
use indexmap::IndexMap;
use mirrordb_expr::{eval, Expr};
use mirrordb_value::{Key, Value};
use std::sync::Arc;

pub type ChangeCallback = Arc<dyn Fn(&[ChangeMessage]) + Send + Sync>;
pub type RowPredicate = Arc<dyn Fn(&Value) -> bool + Send + Sync>;

#[derive(Clone, Default)]
pub struct SubscribeOptions {
    /// Restrict to changes of a single key.
    pub key: Option<Key>,
    /// Arbitrary row predicate.
    pub where_filter: Option<RowPredicate>,
    /// IR predicate (alias-free); an index for it is ensured automatically.
    pub where_expression: Option<Expr>,
    /// Emit a synthetic insert batch for the current visible state before
    /// attaching.
    pub include_initial_state: bool,
    /// Accumulate events until the subscriber is explicitly flushed.
    pub should_batch_events: bool,
}

pub(crate) struct Subscriber {
    callback: ChangeCallback,
    key: Option<Key>,
    where_filter: Option<RowPredicate>,
    where_expression: Option<Expr>,
    /// `Some` while batching: accumulated events awaiting a flush.
    batch: Option<Vec<ChangeMessage>>,
}

impl Subscriber {
    fn matches_row(&self, row: &Value) -> bool {
        if let Some(filter) = &self.where_filter {
            if !filter(row) {
                return false;
            }
        }
        if let Some(expr) = &self.where_expression {
            if !eval::eval_predicate(expr, row) {
                return false;
            }
        }
        true
    }

    /// Reshape one change through the subscriber's filter; `None` drops it.
    fn filter_change(&self, change: &ChangeMessage) -> Option<ChangeMessage> {
        if let Some(key) = &self.key {
            if key != &change.key {
                return None;
            }
        }
        if self.where_filter.is_none() && self.where_expression.is_none() {
            return Some(change.clone());
        }
        let new_matches = self.matches_row(&change.value);
        match change.kind {
            ChangeKind::Insert => new_matches.then(|| change.clone()),
            ChangeKind::Delete => self.matches_row(&change.value).then(|| change.clone()),
            ChangeKind::Update => {
                let old_matches = change
                    .previous_value
                    .as_ref()
                    .is_some_and(|prev| self.matches_row(prev));
                match (old_matches, new_matches) {
                    (true, true) => Some(change.clone()),
                    (false, true) => Some(ChangeMessage::insert(change.key.clone(), change.value.clone())),
                    (true, false) => Some(ChangeMessage::delete(
                        change.key.clone(),
                        change.previous_value.clone().unwrap_or_else(|| change.value.clone()),
                    )),
                    (false, false) => None,
                }
            }
        }
    }
}

pub(crate) struct SubscriberTable {
    next: u64,
    entries: IndexMap<u64, Subscriber>,
}

impl Default for SubscriberTable {
    fn default() -> Self {
        SubscriberTable {
            next: 0,
            entries: IndexMap::new(),
        }
    }
}

impl SubscriberTable {
    pub fn add(&mut self, callback: ChangeCallback, options: &SubscribeOptions) -> u64 {
        self.next += 1;
        self.entries.insert(
            self.next,
            Subscriber {
                callback,
                key: options.key.clone(),
                where_filter: options.where_filter.clone(),
                where_expression: options.where_expression.clone(),
                batch: options.should_batch_events.then(Vec::new),
            },
        );
        self.next
    }

    pub fn remove(&mut self, id: u64) -> bool {
        self.entries.shift_remove(&id).is_some()
    }

    pub fn active_count(&self) -> usize {
        self.entries.len()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Route one effective batch, returning the deliveries to make once the
    /// collection lock is released. Batching subscribers accumulate instead.
    pub fn route(&mut self, changes: &[ChangeMessage]) -> Vec<(ChangeCallback, Vec<ChangeMessage>)> {
        let mut out = Vec::new();
        for subscriber in self.entries.values_mut() {
            let filtered: Vec<ChangeMessage> =
                changes.iter().filter_map(|c| subscriber.filter_change(c)).collect();
            if filtered.is_empty() {
                continue;
            }
            match &mut subscriber.batch {
                Some(buffer) => buffer.extend(filtered),
                None => out.push((subscriber.callback.clone(), filtered)),
            }
        }
        out
    }

    /// Force emission of a batching subscriber's accumulated events.
    pub fn flush_batched(&mut self, id: u64) -> Option<(ChangeCallback, Vec<ChangeMessage>)> {
        let subscriber = self.entries.get_mut(&id)?;
        let buffer = subscriber.batch.as_mut()?;
        if buffer.is_empty() {
            return None;
        }
        Some((subscriber.callback.clone(), std::mem::take(buffer)))
    }

    /// The synthetic insert batch for `include_initial_state`, filtered the
    /// way live events for this subscriber would be.
    pub fn initial_state(&self, id: u64, visible: &indexmap::IndexMap<Key, Value>) -> Vec<ChangeMessage> {
        let Some(subscriber) = self.entries.get(&id) else {
            return Vec::new();
        };
        visible
            .iter()
            .filter(|(key, row)| {
                subscriber.key.as_ref().is_none_or(|k| k == *key) && subscriber.matches_row(row)
            })
            .map(|(key, row)| ChangeMessage::insert(key.clone(), row.clone()))
            .collect()
    }
}
