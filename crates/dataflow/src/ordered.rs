use crate::{key_between, Delta, Diff, Operator, SortKey};
use mirrordb_value::Value;
use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;

struct OrderEntry {
    index: String,
    count: Diff,
}

/// Assigns each row a fractional index string that compares
/// lexicographically in sort order. Existing rows keep their index when
/// neighbours arrive; only genuinely new positions allocate a key.
pub struct FractionalOrder {
    sort_key: Box<dyn Fn(&Value) -> SortKey + Send>,
    /// Attach the index to the outgoing row.
    augment: Box<dyn Fn(&Value, &str) -> Value + Send>,
    state: BTreeMap<SortKey, OrderEntry>,
}

impl FractionalOrder {
    pub fn new(
        sort_key: impl Fn(&Value) -> SortKey + Send + 'static,
        augment: impl Fn(&Value, &str) -> Value + Send + 'static,
    ) -> Self {
        FractionalOrder {
            sort_key: Box::new(sort_key),
            augment: Box::new(augment),
            state: BTreeMap::new(),
        }
    }

    /// The sort key of the greatest row currently held, used by the lazy
    /// loading protocol as its `min_values` cursor.
    pub fn greatest_sort_values(&self) -> Option<Vec<Value>> {
        self.state.keys().next_back().map(|k| k.values.clone())
    }

    pub fn len(&self) -> usize {
        self.state.values().map(|e| e.count.max(0) as usize).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.state.is_empty()
    }
}

impl Operator for FractionalOrder {
    fn flush(&mut self, inputs: &mut [Delta], out: &mut Delta) {
        for (row, diff) in inputs[0].drain(..) {
            let key = (self.sort_key)(&row);
            if let Some(entry) = self.state.get_mut(&key) {
                entry.count += diff;
                out.push(((self.augment)(&row, &entry.index), diff));
                if entry.count <= 0 {
                    self.state.remove(&key);
                }
                continue;
            }
            if diff <= 0 {
                log::warn!("retraction of a row the ordering operator never saw");
                continue;
            }
            let prev = self
                .state
                .range((Bound::Unbounded, Bound::Excluded(&key)))
                .next_back()
                .map(|(_, e)| e.index.clone());
            let next = self
                .state
                .range((Bound::Excluded(&key), Bound::Unbounded))
                .next()
                .map(|(_, e)| e.index.clone());
            let index = key_between(prev.as_deref(), next.as_deref());
            out.push(((self.augment)(&row, &index), diff));
            self.state.insert(key, OrderEntry { index, count: diff });
        }
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// A sliding `offset`/`limit` window over fractionally-indexed rows.
///
/// The full pre-window state is cached, so moving the bounds replays from
/// memory; the runtime consults [`Window::demand`] to decide whether the
/// source must be asked for more rows.
pub struct Window {
    offset: usize,
    limit: Option<usize>,
    index_of: Box<dyn Fn(&Value) -> String + Send>,
    state: BTreeMap<(String, Value), Diff>,
    emitted: HashMap<Value, Diff>,
}

impl Window {
    pub fn new(offset: usize, limit: Option<usize>, index_of: impl Fn(&Value) -> String + Send + 'static) -> Self {
        Window {
            offset,
            limit,
            index_of: Box::new(index_of),
            state: BTreeMap::new(),
            emitted: HashMap::new(),
        }
    }

    /// Update the bounds. The caller must replay the operator afterwards to
    /// flow the membership changes downstream.
    pub fn set_window(&mut self, offset: usize, limit: Option<usize>) {
        self.offset = offset;
        self.limit = limit;
    }

    pub fn bounds(&self) -> (usize, Option<usize>) {
        (self.offset, self.limit)
    }

    /// How many more rows the window could use from upstream to fill
    /// `offset + limit`, if any.
    pub fn demand(&self) -> Option<usize> {
        let limit = self.limit?;
        let needed = self.offset + limit;
        let have: usize = self.state.values().map(|c| (*c).max(0) as usize).sum();
        (have < needed).then(|| needed - have)
    }

    fn desired_membership(&self) -> HashMap<Value, Diff> {
        let mut desired: HashMap<Value, Diff> = HashMap::new();
        let mut skipped = 0usize;
        let mut taken = 0usize;
        for ((_, row), count) in &self.state {
            let mut copies = (*count).max(0) as usize;
            if skipped < self.offset {
                let skip = copies.min(self.offset - skipped);
                skipped += skip;
                copies -= skip;
            }
            if copies == 0 {
                continue;
            }
            let copies = match self.limit {
                Some(limit) => {
                    if taken >= limit {
                        break;
                    }
                    copies.min(limit - taken)
                }
                None => copies,
            };
            taken += copies;
            *desired.entry(row.clone()).or_insert(0) += copies as Diff;
        }
        desired
    }
}

impl Operator for Window {
    fn flush(&mut self, inputs: &mut [Delta], out: &mut Delta) {
        for (row, diff) in inputs[0].drain(..) {
            let index = (self.index_of)(&row);
            let slot = self.state.entry((index, row)).or_insert(0);
            *slot += diff;
            if *slot == 0 {
                self.state.retain(|_, c| *c != 0);
            }
        }

        let desired = self.desired_membership();
        for (row, want) in &desired {
            let have = self.emitted.get(row).copied().unwrap_or(0);
            if want - have != 0 {
                out.push((row.clone(), want - have));
            }
        }
        for (row, have) in &self.emitted {
            if !desired.contains_key(row) {
                out.push((row.clone(), -have));
            }
        }
        self.emitted = desired;
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SortDir;
    use mirrordb_value::row;
    use pretty_assertions::assert_eq;

    fn order_by_n() -> FractionalOrder {
        let dirs: std::sync::Arc<[SortDir]> = vec![SortDir::Asc].into();
        FractionalOrder::new(
            move |r| SortKey::new(vec![r.get("n").cloned().unwrap_or(Value::Null)], dirs.clone(), r.clone()),
            |r, idx| {
                let mut out = r.clone();
                out.set("idx", Value::from(idx.to_owned()));
                out
            },
        )
    }

    fn flush_op(op: &mut dyn Operator, delta: Delta) -> Delta {
        let mut inputs = vec![delta];
        let mut out = Vec::new();
        op.flush(&mut inputs, &mut out);
        out
    }

    fn idx(v: &Value) -> String {
        v.get("idx").and_then(Value::as_str).unwrap().to_owned()
    }

    #[test]
    fn indexes_compare_in_sort_order() {
        let mut op = order_by_n();
        let out = flush_op(&mut op, vec![(row! { "n" => 2 }, 1), (row! { "n" => 1 }, 1), (row! { "n" => 3 }, 1)]);
        let mut rows: Vec<_> = out.into_iter().map(|(r, _)| r).collect();
        rows.sort_by_key(|r| idx(r));
        let ns: Vec<_> = rows.iter().map(|r| r.get("n").cloned().unwrap()).collect();
        assert_eq!(ns, vec![Value::Int(1), Value::Int(2), Value::Int(3)]);
    }

    #[test]
    fn existing_rows_keep_their_index() {
        let mut op = order_by_n();
        let first = flush_op(&mut op, vec![(row! { "n" => 1 }, 1), (row! { "n" => 3 }, 1)]);
        let old: HashMap<_, _> = first.iter().map(|(r, _)| (r.get("n").cloned().unwrap(), idx(r))).collect();
        let out = flush_op(&mut op, vec![(row! { "n" => 2 }, 1)]);
        assert_eq!(out.len(), 1);
        let mid = idx(&out[0].0);
        assert!(old[&Value::Int(1)] < mid && mid < old[&Value::Int(3)]);
    }

    #[test]
    fn window_maintains_top_k() {
        let mut win = Window::new(0, Some(2), |r| idx(r));
        let mut ord = order_by_n();
        let indexed = flush_op(&mut ord, vec![(row! { "n" => 1 }, 1), (row! { "n" => 2 }, 1), (row! { "n" => 3 }, 1)]);
        let out = flush_op(&mut win, indexed);
        let mut ns: Vec<_> = out
            .iter()
            .map(|(r, d)| {
                assert_eq!(*d, 1);
                r.get("n").and_then(Value::as_int).unwrap()
            })
            .collect();
        ns.sort();
        assert_eq!(ns, vec![1, 2]);

        // A new smallest row displaces the old second element.
        let indexed = flush_op(&mut ord, vec![(row! { "n" => 0 }, 1)]);
        let out = flush_op(&mut win, indexed);
        assert_eq!(out.len(), 2);
        assert!(out
            .iter()
            .any(|(r, d)| *d == 1 && r.get("n") == Some(&Value::Int(0))));
        assert!(out
            .iter()
            .any(|(r, d)| *d == -1 && r.get("n") == Some(&Value::Int(2))));
        assert_eq!(win.demand(), None);
    }

    #[test]
    fn widening_the_window_reports_demand() {
        let mut win = Window::new(0, Some(2), |r| idx(r));
        let mut ord = order_by_n();
        let indexed = flush_op(&mut ord, vec![(row! { "n" => 1 }, 1), (row! { "n" => 2 }, 1)]);
        flush_op(&mut win, indexed);
        win.set_window(0, Some(5));
        assert_eq!(win.demand(), Some(3));
    }
}
