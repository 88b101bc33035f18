use mirrordb_value::Value;
use std::cmp::Ordering;
use std::sync::Arc;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SortDir {
    Asc,
    Desc,
}

/// A composite sort key: the evaluated `order_by` values plus the row itself
/// as a deterministic tie breaker. Direction is carried alongside so the
/// same `BTreeMap` can hold mixed asc/desc orderings.
#[derive(Clone, Debug)]
pub struct SortKey {
    pub values: Vec<Value>,
    pub dirs: Arc<[SortDir]>,
    pub tie: Value,
}

impl SortKey {
    pub fn new(values: Vec<Value>, dirs: Arc<[SortDir]>, tie: Value) -> Self {
        SortKey { values, dirs, tie }
    }
}

impl PartialEq for SortKey {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for SortKey {}

impl PartialOrd for SortKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for SortKey {
    fn cmp(&self, other: &Self) -> Ordering {
        let n = self.values.len().max(other.values.len());
        for i in 0..n {
            let a = self.values.get(i).unwrap_or(&Value::Null);
            let b = other.values.get(i).unwrap_or(&Value::Null);
            let mut ord = a.cmp(b);
            if self.dirs.get(i) == Some(&SortDir::Desc) {
                ord = ord.reverse();
            }
            if ord != Ordering::Equal {
                return ord;
            }
        }
        self.tie.cmp(&other.tie)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(values: Vec<Value>, dirs: &[SortDir], tie: i64) -> SortKey {
        SortKey::new(values, dirs.to_vec().into(), Value::Int(tie))
    }

    #[test]
    fn desc_reverses_per_column() {
        let dirs = [SortDir::Desc, SortDir::Asc];
        let a = key(vec![Value::Int(2), Value::from("a")], &dirs, 0);
        let b = key(vec![Value::Int(1), Value::from("a")], &dirs, 0);
        assert!(a < b, "higher first column sorts first under desc");
    }

    #[test]
    fn equal_values_fall_back_to_tie() {
        let dirs = [SortDir::Asc];
        let a = key(vec![Value::Int(1)], &dirs, 1);
        let b = key(vec![Value::Int(1)], &dirs, 2);
        assert!(a < b);
        assert_ne!(a, b);
    }
}
