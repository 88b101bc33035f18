//! Query construction surface.
//!
//! Fields are named by string paths (`col("e.manager_id")`): the first
//! segment is the alias, the rest is the path into that alias's row. The
//! builder only assembles the IR; validation happens in [`crate::plan`].

use crate::{
    AggFunc, Expr, Include, Join, JoinKind, OrderByClause, OrderDir, Query, SelectField, Source,
};
use mirrordb_value::Value;

/// A column reference. `col("u.address.city")` refers to alias `u`, path
/// `address.city`.
pub fn col(path: &str) -> Expr {
    let mut segments = path.split('.').map(str::to_owned);
    let alias = segments.next().unwrap_or_default();
    Expr::Ref {
        alias,
        path: segments.collect(),
    }
}

pub fn lit(v: impl Into<Value>) -> Expr {
    Expr::Val(v.into())
}

pub fn count() -> Expr {
    Expr::Agg(AggFunc::Count, None)
}

pub fn sum(e: Expr) -> Expr {
    Expr::Agg(AggFunc::Sum, Some(Box::new(e)))
}

pub fn avg(e: Expr) -> Expr {
    Expr::Agg(AggFunc::Avg, Some(Box::new(e)))
}

pub fn min(e: Expr) -> Expr {
    Expr::Agg(AggFunc::Min, Some(Box::new(e)))
}

pub fn max(e: Expr) -> Expr {
    Expr::Agg(AggFunc::Max, Some(Box::new(e)))
}

pub struct QueryBuilder<C> {
    query: Query<C>,
}

/// Start a query from a collection under `alias`.
pub fn from<C>(alias: impl Into<String>, collection: C) -> QueryBuilder<C> {
    QueryBuilder {
        query: Query::new(Source::Collection {
            alias: alias.into(),
            collection,
        }),
    }
}

/// Start a query from a subquery under `alias`.
pub fn from_query<C>(alias: impl Into<String>, query: Query<C>) -> QueryBuilder<C> {
    QueryBuilder {
        query: Query::new(Source::Query {
            alias: alias.into(),
            query: Box::new(query),
        }),
    }
}

impl<C> QueryBuilder<C> {
    pub fn join(mut self, alias: impl Into<String>, collection: C, on: Expr) -> Self {
        self.query.joins.push(Join {
            from: Source::Collection {
                alias: alias.into(),
                collection,
            },
            on,
            kind: JoinKind::Inner,
        });
        self
    }

    pub fn left_join(mut self, alias: impl Into<String>, collection: C, on: Expr) -> Self {
        self.query.joins.push(Join {
            from: Source::Collection {
                alias: alias.into(),
                collection,
            },
            on,
            kind: JoinKind::Left,
        });
        self
    }

    /// AND another predicate onto the `where` clause.
    pub fn filter(mut self, expr: Expr) -> Self {
        self.query.where_clause = Some(match self.query.where_clause.take() {
            Some(existing) => existing.and(expr),
            None => expr,
        });
        self
    }

    pub fn select(mut self, fields: impl IntoIterator<Item = (&'static str, Expr)>) -> Self {
        self.query.select = Some(
            fields
                .into_iter()
                .map(|(name, expr)| SelectField {
                    name: name.to_owned(),
                    expr,
                })
                .collect(),
        );
        self
    }

    pub fn group_by(mut self, exprs: impl IntoIterator<Item = Expr>) -> Self {
        self.query.group_by.extend(exprs);
        self
    }

    pub fn having(mut self, expr: Expr) -> Self {
        self.query.having = Some(expr);
        self
    }

    pub fn order_by(mut self, expr: Expr, dir: OrderDir) -> Self {
        self.query.order_by.push(OrderByClause { expr, dir });
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.query.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: usize) -> Self {
        self.query.offset = Some(offset);
        self
    }

    pub fn distinct(mut self) -> Self {
        self.query.distinct = true;
        self
    }

    /// Attach a correlated sub-query whose results become a child collection
    /// under `field_name` on each parent row.
    pub fn include(
        mut self,
        field_name: impl Into<String>,
        correlation_field: impl Into<String>,
        child_correlation_field: impl Into<String>,
        query: Query<C>,
    ) -> Self {
        self.query.includes.push(Include {
            field_name: field_name.into(),
            correlation_field: correlation_field.into(),
            child_correlation_field: child_correlation_field.into(),
            query,
        });
        self
    }

    pub fn single_result(mut self) -> Self {
        self.query.single_result = true;
        self
    }

    pub fn build(self) -> Query<C> {
        self.query
    }
}
