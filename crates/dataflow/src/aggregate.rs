use crate::{Delta, Diff, Operator};
use mirrordb_value::Value;
use std::any::Any;
use std::collections::{BTreeMap, HashMap};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AggKind {
    Count,
    Sum,
    Avg,
    Min,
    Max,
}

/// One aggregate column: the kind plus an extractor for its argument.
pub struct AggSpec {
    pub kind: AggKind,
    pub arg: Option<Box<dyn Fn(&Value) -> Value + Send>>,
}

/// Per-group state: the input row multiset. Aggregates are recomputed from
/// the multiset on every touched group, which keeps min/max retractable
/// without per-aggregate shadow structures.
#[derive(Default)]
struct GroupState {
    rows: BTreeMap<Value, Diff>,
    total: Diff,
}

impl GroupState {
    fn apply(&mut self, row: Value, diff: Diff) {
        self.total += diff;
        let count = self.rows.entry(row).or_insert(0);
        *count += diff;
        if *count == 0 {
            self.rows.retain(|_, c| *c != 0);
        }
    }

    fn compute(&self, spec: &AggSpec) -> Value {
        let arg_values = || {
            self.rows.iter().flat_map(|(row, count)| {
                let v = spec.arg.as_ref().map(|f| f(row)).unwrap_or(Value::Null);
                std::iter::repeat_n(v, (*count).max(0) as usize)
            })
        };
        match spec.kind {
            AggKind::Count => Value::Int(self.total),
            AggKind::Sum => {
                let mut int_sum = 0i64;
                let mut float_sum = 0f64;
                let mut saw_float = false;
                for v in arg_values() {
                    match v {
                        Value::Int(i) => int_sum += i,
                        Value::Float(f) => {
                            saw_float = true;
                            float_sum += f;
                        }
                        _ => {}
                    }
                }
                if saw_float {
                    Value::Float(float_sum + int_sum as f64)
                } else {
                    Value::Int(int_sum)
                }
            }
            AggKind::Avg => {
                let mut sum = 0f64;
                let mut n = 0i64;
                for v in arg_values() {
                    if let Some(f) = v.as_f64() {
                        sum += f;
                        n += 1;
                    }
                }
                if n == 0 {
                    Value::Null
                } else {
                    Value::Float(sum / n as f64)
                }
            }
            AggKind::Min => arg_values().filter(|v| !v.is_null()).min().unwrap_or(Value::Null),
            AggKind::Max => arg_values().filter(|v| !v.is_null()).max().unwrap_or(Value::Null),
        }
    }
}

/// Grouped aggregation. Emits a retract/insert pair for every group whose
/// output row changed in the batch; groups whose count reaches zero are
/// retracted and dropped.
pub struct Aggregate {
    group_key: Box<dyn Fn(&Value) -> Value + Send>,
    specs: Vec<AggSpec>,
    /// Assemble the output row from the group key and aggregate results.
    build_row: Box<dyn Fn(&Value, &[Value]) -> Value + Send>,
    groups: HashMap<Value, GroupState>,
    last_emitted: HashMap<Value, Value>,
}

impl Aggregate {
    pub fn new(
        group_key: impl Fn(&Value) -> Value + Send + 'static,
        specs: Vec<AggSpec>,
        build_row: impl Fn(&Value, &[Value]) -> Value + Send + 'static,
    ) -> Self {
        Aggregate {
            group_key: Box::new(group_key),
            specs,
            build_row: Box::new(build_row),
            groups: HashMap::new(),
            last_emitted: HashMap::new(),
        }
    }
}

impl Operator for Aggregate {
    fn flush(&mut self, inputs: &mut [Delta], out: &mut Delta) {
        let mut touched = Vec::new();
        for (row, diff) in inputs[0].drain(..) {
            let key = (self.group_key)(&row);
            if !touched.contains(&key) {
                touched.push(key.clone());
            }
            self.groups.entry(key).or_default().apply(row, diff);
        }

        for key in touched {
            let next = self.groups.get(&key).filter(|g| g.total > 0).map(|group| {
                let results: Vec<Value> = self.specs.iter().map(|s| group.compute(s)).collect();
                (self.build_row)(&key, &results)
            });
            let prev = self.last_emitted.get(&key);
            if prev == next.as_ref() {
                continue;
            }
            if let Some(prev) = prev {
                out.push((prev.clone(), -1));
            }
            match next {
                Some(row) => {
                    out.push((row.clone(), 1));
                    self.last_emitted.insert(key.clone(), row);
                }
                None => {
                    self.last_emitted.remove(&key);
                    self.groups.remove(&key);
                }
            }
        }
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
