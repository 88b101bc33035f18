use crate::{Delta, Diff, Operator};
use mirrordb_value::Value;
use std::any::Any;
use std::collections::HashMap;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JoinSide {
    Inner,
    /// Left outer: left rows with no match are emitted null-extended.
    Left,
}

type RowMultiset = HashMap<Value, Diff>;

/// Streaming binary equi-join. Port 0 is the left input, port 1 the right.
///
/// Both sides keep their full row multisets indexed by join key. Rows whose
/// join key evaluates to `Null` never match (and on the left side of an
/// outer join are emitted null-extended).
pub struct Join {
    side: JoinSide,
    left_key: Box<dyn Fn(&Value) -> Value + Send>,
    right_key: Box<dyn Fn(&Value) -> Value + Send>,
    /// Combine a left row with a matched right row (`None` = null-extended).
    merge: Box<dyn Fn(&Value, Option<&Value>) -> Value + Send>,
    left: HashMap<Value, RowMultiset>,
    right: HashMap<Value, RowMultiset>,
    right_totals: HashMap<Value, Diff>,
}

impl Join {
    pub fn new(
        side: JoinSide,
        left_key: impl Fn(&Value) -> Value + Send + 'static,
        right_key: impl Fn(&Value) -> Value + Send + 'static,
        merge: impl Fn(&Value, Option<&Value>) -> Value + Send + 'static,
    ) -> Self {
        Join {
            side,
            left_key: Box::new(left_key),
            right_key: Box::new(right_key),
            merge: Box::new(merge),
            left: HashMap::new(),
            right: HashMap::new(),
            right_totals: HashMap::new(),
        }
    }

    fn on_left(&mut self, row: Value, diff: Diff, out: &mut Delta) {
        let key = (self.left_key)(&row);
        if key.is_null() {
            if self.side == JoinSide::Left {
                out.push(((self.merge)(&row, None), diff));
            }
            return;
        }
        let matched = self.right_totals.get(&key).copied().unwrap_or(0);
        if matched > 0 {
            for (r, mr) in &self.right[&key] {
                out.push(((self.merge)(&row, Some(r)), diff * mr));
            }
        } else if self.side == JoinSide::Left {
            out.push(((self.merge)(&row, None), diff));
        }
        update_multiset(self.left.entry(key).or_default(), row, diff);
    }

    fn on_right(&mut self, row: Value, diff: Diff, out: &mut Delta) {
        let key = (self.right_key)(&row);
        if key.is_null() {
            // Null keys never match; nothing to retain.
            return;
        }
        if let Some(lefts) = self.left.get(&key) {
            for (l, ml) in lefts {
                out.push(((self.merge)(l, Some(&row)), ml * diff));
            }
            if self.side == JoinSide::Left {
                let old_total = self.right_totals.get(&key).copied().unwrap_or(0);
                let new_total = old_total + diff;
                // Crossing zero flips the null-extended rows.
                if old_total <= 0 && new_total > 0 {
                    for (l, ml) in lefts {
                        out.push(((self.merge)(l, None), -ml));
                    }
                } else if old_total > 0 && new_total <= 0 {
                    for (l, ml) in lefts {
                        out.push(((self.merge)(l, None), *ml));
                    }
                }
            }
        }
        *self.right_totals.entry(key.clone()).or_insert(0) += diff;
        if self.right_totals[&key] == 0 {
            self.right_totals.remove(&key);
        }
        update_multiset(self.right.entry(key).or_default(), row, diff);
    }
}

fn update_multiset(set: &mut RowMultiset, row: Value, diff: Diff) {
    let count = set.entry(row).or_insert(0);
    *count += diff;
    if *count == 0 {
        set.retain(|_, c| *c != 0);
    }
}

impl Operator for Join {
    fn flush(&mut self, inputs: &mut [Delta], out: &mut Delta) {
        // Left deltas join against the pre-batch right state, then right
        // deltas against the already-updated left state, so the cross term
        // is counted exactly once.
        let left_delta: Delta = inputs[0].drain(..).collect();
        let right_delta: Delta = inputs[1].drain(..).collect();
        for (row, diff) in left_delta {
            self.on_left(row, diff, out);
        }
        for (row, diff) in right_delta {
            self.on_right(row, diff, out);
        }
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mirrordb_value::{row, Value};
    use pretty_assertions::assert_eq;

    fn make_join(side: JoinSide) -> Join {
        Join::new(
            side,
            |l| l.get("k").cloned().unwrap_or(Value::Null),
            |r| r.get("k").cloned().unwrap_or(Value::Null),
            |l, r| {
                Value::object([
                    ("l".to_string(), l.clone()),
                    ("r".to_string(), r.cloned().unwrap_or(Value::Null)),
                ])
            },
        )
    }

    fn flush(join: &mut Join, left: Delta, right: Delta) -> Delta {
        let mut inputs = vec![left, right];
        let mut out = Vec::new();
        join.flush(&mut inputs, &mut out);
        out
    }

    #[test]
    fn inner_join_matches_within_one_batch() {
        let mut j = make_join(JoinSide::Inner);
        let l = row! { "k" => 1, "side" => "l" };
        let r = row! { "k" => 1, "side" => "r" };
        let out = flush(&mut j, vec![(l.clone(), 1)], vec![(r.clone(), 1)]);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].1, 1);

        // Retracting the right row retracts the pair.
        let out = flush(&mut j, vec![], vec![(r, -1)]);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].1, -1);
    }

    #[test]
    fn null_keys_never_match() {
        let mut j = make_join(JoinSide::Inner);
        let l = row! { "side" => "l" };
        let r = row! { "side" => "r" };
        let out = flush(&mut j, vec![(l, 1)], vec![(r, 1)]);
        assert!(out.is_empty());
    }

    #[test]
    fn left_join_null_extends_and_upgrades() {
        let mut j = make_join(JoinSide::Left);
        let l = row! { "k" => 1, "side" => "l" };
        let out = flush(&mut j, vec![(l.clone(), 1)], vec![]);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].0.get("r"), Some(&Value::Null));

        // A matching right row retracts the null-extension and emits the pair.
        let r = row! { "k" => 1, "side" => "r" };
        let out = flush(&mut j, vec![], vec![(r.clone(), 1)]);
        assert_eq!(out.len(), 2);
        let retraction = out.iter().find(|(_, d)| *d == -1).unwrap();
        assert_eq!(retraction.0.get("r"), Some(&Value::Null));
        let pair = out.iter().find(|(_, d)| *d == 1).unwrap();
        assert_eq!(pair.0.get("r"), Some(&r));

        // Removing it goes back to the null-extended row.
        let out = flush(&mut j, vec![], vec![(r, -1)]);
        assert_eq!(out.len(), 2);
        let reinstated = out.iter().find(|(_, d)| *d == 1).unwrap();
        assert_eq!(reinstated.0.get("r"), Some(&Value::Null));
    }
}
