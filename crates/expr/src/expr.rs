use mirrordb_value::Value;
use std::collections::BTreeSet;

/// A scalar expression over the rows of one or more aliases.
#[derive(Clone, Debug, PartialEq)]
pub enum Expr {
    /// A column reference: the alias introduced by `from`/`join`, followed by
    /// a field path into that alias's row.
    Ref { alias: String, path: Vec<String> },
    /// A literal.
    Val(Value),
    /// A scalar function application.
    Func(ScalarFunc, Vec<Expr>),
    /// An aggregate application. Only valid under `select`/`having` of a
    /// grouped query.
    Agg(AggFunc, Option<Box<Expr>>),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScalarFunc {
    Eq,
    Neq,
    Gt,
    Gte,
    Lt,
    Lte,
    And,
    Or,
    Not,
    Add,
    Sub,
    Mul,
    Div,
    Upper,
    Lower,
    Length,
    Concat,
    Coalesce,
    Like,
    In,
    IsNull,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AggFunc {
    Count,
    Sum,
    Avg,
    Min,
    Max,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum OrderDir {
    #[default]
    Asc,
    Desc,
}

impl Expr {
    pub fn and(self, other: Expr) -> Expr {
        Expr::Func(ScalarFunc::And, vec![self, other])
    }

    pub fn or(self, other: Expr) -> Expr {
        Expr::Func(ScalarFunc::Or, vec![self, other])
    }

    pub fn not(self) -> Expr {
        Expr::Func(ScalarFunc::Not, vec![self])
    }

    pub fn eq(self, other: impl Into<Expr>) -> Expr {
        Expr::Func(ScalarFunc::Eq, vec![self, other.into()])
    }

    pub fn neq(self, other: impl Into<Expr>) -> Expr {
        Expr::Func(ScalarFunc::Neq, vec![self, other.into()])
    }

    pub fn gt(self, other: impl Into<Expr>) -> Expr {
        Expr::Func(ScalarFunc::Gt, vec![self, other.into()])
    }

    pub fn gte(self, other: impl Into<Expr>) -> Expr {
        Expr::Func(ScalarFunc::Gte, vec![self, other.into()])
    }

    pub fn lt(self, other: impl Into<Expr>) -> Expr {
        Expr::Func(ScalarFunc::Lt, vec![self, other.into()])
    }

    pub fn lte(self, other: impl Into<Expr>) -> Expr {
        Expr::Func(ScalarFunc::Lte, vec![self, other.into()])
    }

    pub fn is_null(self) -> Expr {
        Expr::Func(ScalarFunc::IsNull, vec![self])
    }

    /// Split a conjunction into its top-level conjuncts.
    pub fn conjuncts(&self) -> Vec<&Expr> {
        let mut out = Vec::new();
        fn walk<'a>(e: &'a Expr, out: &mut Vec<&'a Expr>) {
            match e {
                Expr::Func(ScalarFunc::And, args) => {
                    for arg in args {
                        walk(arg, out);
                    }
                }
                other => out.push(other),
            }
        }
        walk(self, &mut out);
        out
    }

    /// Rebuild a conjunction from conjuncts. `None` for an empty list.
    pub fn all(conjuncts: impl IntoIterator<Item = Expr>) -> Option<Expr> {
        conjuncts.into_iter().reduce(Expr::and)
    }

    /// Every alias referenced anywhere in this expression.
    pub fn referenced_aliases(&self) -> BTreeSet<&str> {
        let mut out = BTreeSet::new();
        self.visit(&mut |e| {
            if let Expr::Ref { alias, .. } = e {
                out.insert(alias.as_str());
            }
        });
        out
    }

    /// Whether the expression contains an aggregate application.
    pub fn contains_aggregate(&self) -> bool {
        let mut found = false;
        self.visit(&mut |e| {
            if matches!(e, Expr::Agg(..)) {
                found = true;
            }
        });
        found
    }

    /// A ref made of exactly one path segment into `alias`, as required for
    /// pushing `order_by` down to a source.
    pub fn as_single_segment_ref(&self) -> Option<(&str, &str)> {
        match self {
            Expr::Ref { alias, path } if path.len() == 1 => Some((alias, &path[0])),
            _ => None,
        }
    }

    fn visit<'a>(&'a self, f: &mut impl FnMut(&'a Expr)) {
        f(self);
        match self {
            Expr::Ref { .. } | Expr::Val(_) => {}
            Expr::Func(_, args) => {
                for arg in args {
                    arg.visit(f);
                }
            }
            Expr::Agg(_, arg) => {
                if let Some(arg) = arg {
                    arg.visit(f);
                }
            }
        }
    }

    /// A canonical, deterministic serialization of the expression.
    ///
    /// Two structurally equal expressions produce identical signatures; used
    /// to key indexes and dedup pushdown subscriptions.
    pub fn signature(&self) -> String {
        use std::fmt::Write;
        let mut out = String::new();
        fn walk(e: &Expr, out: &mut String) {
            match e {
                Expr::Ref { alias, path } => {
                    let _ = write!(out, "ref({alias}");
                    for segment in path {
                        let _ = write!(out, ".{segment}");
                    }
                    out.push(')');
                }
                Expr::Val(v) => {
                    let _ = write!(out, "val({})", mirrordb_value::canonical_string(v));
                }
                Expr::Func(f, args) => {
                    let _ = write!(out, "{f:?}(");
                    for (i, arg) in args.iter().enumerate() {
                        if i > 0 {
                            out.push(',');
                        }
                        walk(arg, out);
                    }
                    out.push(')');
                }
                Expr::Agg(a, arg) => {
                    let _ = write!(out, "{a:?}(");
                    if let Some(arg) = arg {
                        walk(arg, out);
                    }
                    out.push(')');
                }
            }
        }
        walk(self, &mut out);
        out
    }

    /// Rewrite every `Ref` so its alias is dropped and the path is resolved
    /// against the single remaining row, used when an expression is pushed
    /// down to a source collection that has no alias namespace.
    pub fn strip_alias(&self) -> Expr {
        match self {
            Expr::Ref { path, .. } => Expr::Ref {
                alias: String::new(),
                path: path.clone(),
            },
            Expr::Val(v) => Expr::Val(v.clone()),
            Expr::Func(f, args) => Expr::Func(*f, args.iter().map(Expr::strip_alias).collect()),
            Expr::Agg(a, arg) => Expr::Agg(*a, arg.as_ref().map(|e| Box::new(e.strip_alias()))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::{col, lit};

    #[test]
    fn conjuncts_flatten_nested_ands() {
        let a = col("a.x").eq(lit(1));
        let b = col("b.y").gt(lit(2));
        let c = col("a.z").lt(lit(3));
        let e = a.clone().and(b.clone().and(c.clone()));
        assert_eq!(e.conjuncts(), vec![&a, &b, &c]);

        // Rebuilding left-associates; the conjunct set is preserved.
        let rebuilt = Expr::all([a.clone(), b.clone(), c.clone()]).unwrap();
        assert_eq!(rebuilt.conjuncts(), vec![&a, &b, &c]);
    }

    #[test]
    fn referenced_aliases_walks_the_tree() {
        let e = col("e.manager_id").eq(col("m.id")).and(col("e.active").eq(lit(true)));
        let aliases: Vec<_> = e.referenced_aliases().into_iter().collect();
        assert_eq!(aliases, vec!["e", "m"]);
    }

    #[test]
    fn single_segment_ref_detection() {
        assert_eq!(col("x.n").as_single_segment_ref(), Some(("x", "n")));
        assert_eq!(col("x.a.b").as_single_segment_ref(), None);
    }
}
