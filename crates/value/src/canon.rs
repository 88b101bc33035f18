use crate::Value;
use std::fmt::Write;

/// Deterministic serialization of a value.
///
/// Used wherever two structurally equal values must produce the same bytes:
/// index signatures, `load_subset` request dedup keys, and include
/// correlation keys. Object fields are emitted in sorted order (guaranteed
/// by `BTreeMap`), floats through Rust's shortest round-trip formatting.
pub fn canonical_string(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(true) => out.push_str("true"),
        Value::Bool(false) => out.push_str("false"),
        Value::Int(i) => {
            let _ = write!(out, "{i}");
        }
        Value::Float(f) => {
            if f.is_nan() {
                out.push_str("nan");
            } else if f.is_infinite() {
                out.push_str(if *f > 0.0 { "inf" } else { "-inf" });
            } else {
                let _ = write!(out, "{f:?}");
            }
        }
        Value::Str(s) => write_escaped(s, out),
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        Value::Object(fields) => {
            out.push('{');
            for (i, (k, v)) in fields.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_escaped(k, out);
                out.push(':');
                write_canonical(v, out);
            }
            out.push('}');
        }
    }
}

fn write_escaped(s: &str, out: &mut String) {
    out.push('"');
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            c => out.push(c),
        }
    }
    out.push('"');
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::row;

    #[test]
    fn object_fields_are_sorted() {
        let a = row! { "b" => 2, "a" => 1 };
        let b = row! { "a" => 1, "b" => 2 };
        assert_eq!(canonical_string(&a), canonical_string(&b));
        assert_eq!(canonical_string(&a), r#"{"a":1,"b":2}"#);
    }

    #[test]
    fn floats_and_ints_stay_distinct() {
        assert_ne!(
            canonical_string(&Value::Int(1)),
            canonical_string(&Value::Float(1.0))
        );
    }

    #[test]
    fn strings_escape_quotes() {
        assert_eq!(canonical_string(&Value::from(r#"a"b"#)), r#""a\"b""#);
    }
}
