use crate::{Expr, OrderDir};

/// A query source: a collection under an alias, or a nested subquery.
///
/// The IR is generic over the collection handle `C` so it can be planned and
/// tested without depending on the collection implementation; the live query
/// layer instantiates `C` with its collection type.
#[derive(Clone, Debug)]
pub enum Source<C> {
    Collection { alias: String, collection: C },
    Query { alias: String, query: Box<Query<C>> },
}

impl<C> Source<C> {
    pub fn alias(&self) -> &str {
        match self {
            Source::Collection { alias, .. } | Source::Query { alias, .. } => alias,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum JoinKind {
    #[default]
    Inner,
    Left,
}

#[derive(Clone, Debug)]
pub struct Join<C> {
    pub from: Source<C>,
    pub on: Expr,
    pub kind: JoinKind,
}

#[derive(Clone, Debug)]
pub struct SelectField {
    pub name: String,
    pub expr: Expr,
}

#[derive(Clone, Debug)]
pub struct OrderByClause {
    pub expr: Expr,
    pub dir: OrderDir,
}

/// A correlated sub-query whose per-parent results become a child collection
/// attached to the parent row under `field_name`.
#[derive(Clone, Debug)]
pub struct Include<C> {
    pub field_name: String,
    /// Path on the parent row whose value correlates parent and child.
    pub correlation_field: String,
    /// Path on the child row holding the matching value.
    pub child_correlation_field: String,
    pub query: Query<C>,
}

/// The algebraic query tree.
#[derive(Clone, Debug)]
pub struct Query<C> {
    pub from: Source<C>,
    pub joins: Vec<Join<C>>,
    pub where_clause: Option<Expr>,
    pub group_by: Vec<Expr>,
    pub having: Option<Expr>,
    pub select: Option<Vec<SelectField>>,
    pub order_by: Vec<OrderByClause>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
    pub distinct: bool,
    pub includes: Vec<Include<C>>,
    pub single_result: bool,
}

impl<C> Query<C> {
    pub fn new(from: Source<C>) -> Self {
        Query {
            from,
            joins: Vec::new(),
            where_clause: None,
            group_by: Vec::new(),
            having: None,
            select: None,
            order_by: Vec::new(),
            limit: None,
            offset: None,
            distinct: false,
            includes: Vec::new(),
            single_result: false,
        }
    }

    pub fn is_ordered(&self) -> bool {
        !self.order_by.is_empty()
    }

    /// Aliases introduced at this level (not descending into subqueries).
    pub fn own_aliases(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.from.alias()).chain(self.joins.iter().map(|j| j.from.alias()))
    }
}
