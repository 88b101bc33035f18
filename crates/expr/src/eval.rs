//! Expression evaluation against dynamic rows.
//!
//! A row is evaluated in a namespace: for joined rows the namespace is an
//! object keyed by alias, for pushdown predicates on a single source the
//! namespace is the row itself (refs are alias-stripped first).

use crate::{EvalError, Expr, ScalarFunc};
use mirrordb_value::Value;
use std::cmp::Ordering;

/// Evaluate `expr` against `row`. Missing fields evaluate to `Null` rather
/// than erroring, matching how rows with absent columns behave in filters.
pub fn eval(expr: &Expr, row: &Value) -> Result<Value, EvalError> {
    match expr {
        Expr::Ref { alias, path } => {
            let base = if alias.is_empty() {
                Some(row)
            } else {
                row.get(alias)
            };
            Ok(base
                .and_then(|b| b.path_segments(path.iter().map(String::as_str)))
                .cloned()
                .unwrap_or(Value::Null))
        }
        Expr::Val(v) => Ok(v.clone()),
        Expr::Func(func, args) => eval_func(*func, args, row),
        // Aggregates are folded away by the dataflow compiler; any aggregate
        // reaching the scalar evaluator is a residual reference to the
        // already-computed group row.
        Expr::Agg(..) => Ok(Value::Null),
    }
}

/// Evaluate `expr` as a predicate: only `Bool(true)` passes, `Null` and
/// everything else is falsy.
pub fn eval_predicate(expr: &Expr, row: &Value) -> bool {
    matches!(eval(expr, row), Ok(Value::Bool(true)))
}

fn eval_func(func: ScalarFunc, args: &[Expr], row: &Value) -> Result<Value, EvalError> {
    use ScalarFunc::*;

    let arity = |expected: usize| -> Result<(), EvalError> {
        if args.len() == expected {
            Ok(())
        } else {
            Err(EvalError::Arity {
                func,
                expected,
                got: args.len(),
            })
        }
    };

    match func {
        And => {
            for arg in args {
                match eval(arg, row)? {
                    Value::Bool(true) => continue,
                    _ => return Ok(Value::Bool(false)),
                }
            }
            Ok(Value::Bool(true))
        }
        Or => {
            for arg in args {
                if let Value::Bool(true) = eval(arg, row)? {
                    return Ok(Value::Bool(true));
                }
            }
            Ok(Value::Bool(false))
        }
        Not => {
            arity(1)?;
            Ok(Value::Bool(!matches!(eval(&args[0], row)?, Value::Bool(true))))
        }
        IsNull => {
            arity(1)?;
            Ok(Value::Bool(eval(&args[0], row)?.is_null()))
        }
        Eq | Neq => {
            arity(2)?;
            let (l, r) = (eval(&args[0], row)?, eval(&args[1], row)?);
            if l.is_null() || r.is_null() {
                return Ok(Value::Null);
            }
            let eq = l.loosely_eq(&r);
            Ok(Value::Bool(if func == Eq { eq } else { !eq }))
        }
        Gt | Gte | Lt | Lte => {
            arity(2)?;
            let (l, r) = (eval(&args[0], row)?, eval(&args[1], row)?);
            if l.is_null() || r.is_null() {
                return Ok(Value::Null);
            }
            let ord = l.cmp(&r);
            let pass = match func {
                Gt => ord == Ordering::Greater,
                Gte => ord != Ordering::Less,
                Lt => ord == Ordering::Less,
                Lte => ord != Ordering::Greater,
                _ => unreachable!(),
            };
            Ok(Value::Bool(pass))
        }
        Add | Sub | Mul | Div => {
            arity(2)?;
            let (l, r) = (eval(&args[0], row)?, eval(&args[1], row)?);
            numeric_op(func, &l, &r)
        }
        Upper => {
            arity(1)?;
            string_op(func, &eval(&args[0], row)?, |s| s.to_uppercase())
        }
        Lower => {
            arity(1)?;
            string_op(func, &eval(&args[0], row)?, |s| s.to_lowercase())
        }
        Length => {
            arity(1)?;
            match eval(&args[0], row)? {
                Value::Str(s) => Ok(Value::Int(s.chars().count() as i64)),
                Value::Array(items) => Ok(Value::Int(items.len() as i64)),
                Value::Null => Ok(Value::Null),
                _ => Err(EvalError::BadOperand { func }),
            }
        }
        Concat => {
            let mut out = String::new();
            for arg in args {
                match eval(arg, row)? {
                    Value::Str(s) => out.push_str(&s),
                    Value::Int(i) => out.push_str(&i.to_string()),
                    Value::Null => {}
                    _ => return Err(EvalError::BadOperand { func }),
                }
            }
            Ok(Value::Str(out))
        }
        Coalesce => {
            for arg in args {
                let v = eval(arg, row)?;
                if !v.is_null() {
                    return Ok(v);
                }
            }
            Ok(Value::Null)
        }
        Like => {
            arity(2)?;
            match (eval(&args[0], row)?, eval(&args[1], row)?) {
                (Value::Str(s), Value::Str(pattern)) => Ok(Value::Bool(like_match(&s, &pattern))),
                (Value::Null, _) | (_, Value::Null) => Ok(Value::Null),
                _ => Err(EvalError::BadOperand { func }),
            }
        }
        In => {
            arity(2)?;
            let needle = eval(&args[0], row)?;
            match eval(&args[1], row)? {
                Value::Array(items) => Ok(Value::Bool(items.iter().any(|i| i.loosely_eq(&needle)))),
                Value::Null => Ok(Value::Null),
                _ => Err(EvalError::BadOperand { func }),
            }
        }
    }
}

fn numeric_op(func: ScalarFunc, l: &Value, r: &Value) -> Result<Value, EvalError> {
    if l.is_null() || r.is_null() {
        return Ok(Value::Null);
    }
    match (l, r) {
        (Value::Int(a), Value::Int(b)) => match func {
            ScalarFunc::Add => Ok(Value::Int(a.wrapping_add(*b))),
            ScalarFunc::Sub => Ok(Value::Int(a.wrapping_sub(*b))),
            ScalarFunc::Mul => Ok(Value::Int(a.wrapping_mul(*b))),
            ScalarFunc::Div => {
                if *b == 0 {
                    Err(EvalError::DivisionByZero)
                } else {
                    Ok(Value::Int(a / b))
                }
            }
            _ => unreachable!(),
        },
        _ => {
            let (a, b) = match (l.as_f64(), r.as_f64()) {
                (Some(a), Some(b)) => (a, b),
                _ => return Err(EvalError::BadOperand { func }),
            };
            let out = match func {
                ScalarFunc::Add => a + b,
                ScalarFunc::Sub => a - b,
                ScalarFunc::Mul => a * b,
                ScalarFunc::Div => {
                    if b == 0.0 {
                        return Err(EvalError::DivisionByZero);
                    }
                    a / b
                }
                _ => unreachable!(),
            };
            Ok(Value::Float(out))
        }
    }
}

fn string_op(func: ScalarFunc, v: &Value, f: impl FnOnce(&str) -> String) -> Result<Value, EvalError> {
    match v {
        Value::Str(s) => Ok(Value::Str(f(s))),
        Value::Null => Ok(Value::Null),
        _ => Err(EvalError::BadOperand { func }),
    }
}

/// SQL LIKE with `%` (any run) and `_` (single char).
fn like_match(s: &str, pattern: &str) -> bool {
    fn inner(s: &[char], p: &[char]) -> bool {
        match p.split_first() {
            None => s.is_empty(),
            Some(('%', rest)) => (0..=s.len()).any(|i| inner(&s[i..], rest)),
            Some(('_', rest)) => !s.is_empty() && inner(&s[1..], rest),
            Some((c, rest)) => s.first() == Some(c) && inner(&s[1..], rest),
        }
    }
    let s: Vec<char> = s.chars().collect();
    let p: Vec<char> = pattern.chars().collect();
    inner(&s, &p)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::{col, lit};
    use mirrordb_value::row;

    fn ctx() -> Value {
        Value::object([("u".to_string(), row! { "name" => "Ada", "age" => 36 })])
    }

    #[test]
    fn refs_resolve_through_alias() {
        let v = eval(&col("u.name"), &ctx()).unwrap();
        assert_eq!(v, Value::from("Ada"));
        assert_eq!(eval(&col("u.missing"), &ctx()).unwrap(), Value::Null);
    }

    #[test]
    fn comparisons_with_null_are_not_true() {
        assert!(!eval_predicate(&col("u.missing").eq(lit(1)), &ctx()));
        assert!(!eval_predicate(&col("u.missing").neq(lit(1)), &ctx()));
        assert!(eval_predicate(&col("u.missing").is_null(), &ctx()));
    }

    #[test]
    fn numeric_comparison_crosses_int_float() {
        assert!(eval_predicate(&col("u.age").eq(lit(36.0)), &ctx()));
        assert!(eval_predicate(&col("u.age").gt(lit(35)), &ctx()));
    }

    #[test]
    fn like_wildcards() {
        assert!(like_match("mirrordb", "mirror%"));
        assert!(like_match("mirrordb", "%db"));
        assert!(like_match("abc", "a_c"));
        assert!(!like_match("abc", "a_d"));
    }

    #[test]
    fn arithmetic() {
        let e = col("u.age").clone();
        let sum = Expr::Func(ScalarFunc::Add, vec![e, lit(4)]);
        assert_eq!(eval(&sum, &ctx()).unwrap(), Value::Int(40));
        let div = Expr::Func(ScalarFunc::Div, vec![lit(1), lit(0)]);
        assert_eq!(eval(&div, &ctx()), Err(EvalError::DivisionByZero));
    }
}
