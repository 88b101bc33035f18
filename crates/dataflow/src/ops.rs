use crate::{Delta, Diff, Operator};
use mirrordb_value::Value;
use std::any::Any;
use std::collections::HashMap;

/// Entry point node for a named input stream.
pub struct InputOp;

impl Operator for InputOp {
    fn flush(&mut self, inputs: &mut [Delta], out: &mut Delta) {
        out.append(&mut inputs[0]);
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

pub struct Filter {
    predicate: Box<dyn Fn(&Value) -> bool + Send>,
}

impl Filter {
    pub fn new(predicate: impl Fn(&Value) -> bool + Send + 'static) -> Self {
        Filter {
            predicate: Box::new(predicate),
        }
    }
}

impl Operator for Filter {
    fn flush(&mut self, inputs: &mut [Delta], out: &mut Delta) {
        out.extend(inputs[0].drain(..).filter(|(row, _)| (self.predicate)(row)));
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

pub struct Map {
    f: Box<dyn Fn(&Value) -> Value + Send>,
}

impl Map {
    pub fn new(f: impl Fn(&Value) -> Value + Send + 'static) -> Self {
        Map { f: Box::new(f) }
    }
}

impl Operator for Map {
    fn flush(&mut self, inputs: &mut [Delta], out: &mut Delta) {
        out.extend(inputs[0].drain(..).map(|(row, diff)| ((self.f)(&row), diff)));
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Collapses multiplicities to 0/1: a row is emitted when its count becomes
/// positive and retracted when it returns to zero.
#[derive(Default)]
pub struct Distinct {
    counts: HashMap<Value, Diff>,
}

impl Distinct {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Operator for Distinct {
    fn flush(&mut self, inputs: &mut [Delta], out: &mut Delta) {
        for (row, diff) in inputs[0].drain(..) {
            let count = self.counts.entry(row.clone()).or_insert(0);
            let was_present = *count > 0;
            *count += diff;
            let is_present = *count > 0;
            if *count == 0 {
                self.counts.remove(&row);
            }
            match (was_present, is_present) {
                (false, true) => out.push((row, 1)),
                (true, false) => out.push((row, -1)),
                _ => {}
            }
        }
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mirrordb_value::row;

    fn flush_one(op: &mut dyn Operator, delta: Delta) -> Delta {
        let mut inputs = vec![delta];
        let mut out = Vec::new();
        op.flush(&mut inputs, &mut out);
        out
    }

    #[test]
    fn distinct_suppresses_duplicate_multiplicity() {
        let mut d = Distinct::new();
        let r = row! { "id" => 1 };
        let out = flush_one(&mut d, vec![(r.clone(), 1), (r.clone(), 1)]);
        assert_eq!(out, vec![(r.clone(), 1)]);

        // Dropping one copy keeps the row; dropping the second retracts it.
        let out = flush_one(&mut d, vec![(r.clone(), -1)]);
        assert!(out.is_empty());
        let out = flush_one(&mut d, vec![(r.clone(), -1)]);
        assert_eq!(out, vec![(r, -1)]);
    }
}
