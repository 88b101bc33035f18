//! The query planner.
//!
//! Planning enumerates every alias the query references (self-joins give the
//! same collection several independent aliases), derives per-alias pushdown
//! predicates from the `where` clause, detects `order_by` shapes that can be
//! passed to a source as a load hint, and recursively plans subquery sources
//! and includes.

use crate::{Expr, Include, JoinKind, OrderDir, PlanError, Query, Source};
use std::collections::BTreeSet;

/// Where an alias's rows come from.
#[derive(Debug)]
pub enum AliasSource<C> {
    Collection(C),
    /// A nested subquery, planned in its own right; its output stream feeds
    /// this alias.
    Subquery(Box<QueryPlan<C>>),
}

/// The per-alias subscription plan.
#[derive(Debug)]
pub struct AliasPlan<C> {
    pub alias: String,
    pub source: AliasSource<C>,
    /// Conjunction of `where` conjuncts that reference only this alias,
    /// alias-stripped so it can be evaluated against the bare source row.
    pub pushdown: Option<Expr>,
    /// Set when the query's `order_by` is entirely simple refs into this
    /// alias; passed to the source as a load hint for on-demand sync.
    pub order_hint: Option<Vec<(String, OrderDir)>>,
    /// Whether this alias sits on the nullable side of a left join. Pushdown
    /// still applies (absent rows null-extend rather than drop the parent).
    pub nullable: bool,
}

/// An `order_by` that the windowing protocol can drive with cursors: every
/// clause is a one-segment ref into the same alias.
#[derive(Clone, Debug, PartialEq)]
pub struct OrderBySpec {
    pub alias: String,
    pub fields: Vec<(String, OrderDir)>,
}

#[derive(Debug)]
pub struct IncludePlan<C> {
    pub include: Include<C>,
    pub plan: Box<QueryPlan<C>>,
}

#[derive(Debug)]
pub struct QueryPlan<C> {
    pub query: Query<C>,
    pub aliases: Vec<AliasPlan<C>>,
    /// What remains of the `where` clause after pushdown.
    pub residual_where: Option<Expr>,
    pub optimizable_order_by: Option<OrderBySpec>,
    pub includes: Vec<IncludePlan<C>>,
}

impl<C> QueryPlan<C> {
    /// Total number of distinct alias inputs in the whole tree, nested
    /// subqueries included (but not includes, which run their own pipelines).
    pub fn input_count(&self) -> usize {
        self.aliases
            .iter()
            .map(|a| match &a.source {
                AliasSource::Collection(_) => 1,
                AliasSource::Subquery(plan) => plan.input_count(),
            })
            .sum()
    }
}

pub fn plan<C: Clone>(query: &Query<C>) -> Result<QueryPlan<C>, PlanError> {
    let query = query.clone();

    // Alias table for this level; duplicates are an error even for
    // self-joins, which must use distinct aliases.
    let mut seen = BTreeSet::new();
    for alias in query.own_aliases() {
        if !seen.insert(alias.to_owned()) {
            return Err(PlanError::DuplicateAlias(alias.to_owned()));
        }
    }

    check_refs(&query, &seen)?;
    if query.having.is_some() && query.group_by.is_empty() {
        return Err(PlanError::HavingWithoutGroupBy);
    }
    if let Some(w) = &query.where_clause {
        if let Some(agg) = first_aggregate(w) {
            return Err(PlanError::MisplacedAggregate(agg));
        }
    }

    // Split the where clause into per-alias pushdown and graph residual.
    let mut pushdown: Vec<(String, Vec<Expr>)> = seen.iter().map(|a| (a.clone(), Vec::new())).collect();
    let mut residual = Vec::new();
    if let Some(where_clause) = &query.where_clause {
        for conjunct in where_clause.conjuncts() {
            let aliases = conjunct.referenced_aliases();
            if aliases.len() == 1 && !conjunct.contains_aggregate() {
                let alias = *aliases.iter().next().unwrap();
                let slot = pushdown.iter_mut().find(|(a, _)| a == alias).unwrap();
                slot.1.push(conjunct.strip_alias());
            } else {
                residual.push(conjunct.clone());
            }
        }
    }

    let optimizable_order_by = detect_order_hint(&query);

    let mut aliases = Vec::new();
    let mut push_alias = |source: &Source<C>, nullable: bool| -> Result<(), PlanError> {
        let alias = source.alias().to_owned();
        let push = pushdown
            .iter_mut()
            .find(|(a, _)| *a == alias)
            .map(|(_, conjuncts)| Expr::all(std::mem::take(conjuncts)))
            .unwrap_or(None);
        let order_hint = optimizable_order_by
            .as_ref()
            .filter(|spec| spec.alias == alias)
            .map(|spec| spec.fields.clone());
        let alias_source = match source {
            Source::Collection { collection, .. } => AliasSource::Collection(collection.clone()),
            Source::Query { query, .. } => AliasSource::Subquery(Box::new(plan(query)?)),
        };
        aliases.push(AliasPlan {
            alias,
            source: alias_source,
            pushdown: push,
            order_hint,
            nullable,
        });
        Ok(())
    };
    push_alias(&query.from, false)?;
    for join in &query.joins {
        push_alias(&join.from, join.kind == JoinKind::Left)?;
    }

    let mut includes = Vec::new();
    for include in &query.includes {
        if include.field_name.is_empty() {
            return Err(PlanError::InvalidInclude(include.field_name.clone()));
        }
        includes.push(IncludePlan {
            plan: Box::new(plan(&include.query)?),
            include: include.clone(),
        });
    }

    Ok(QueryPlan {
        query,
        aliases,
        residual_where: Expr::all(residual),
        optimizable_order_by,
        includes,
    })
}

/// `order_by` is a source hint only when every clause is a one-segment ref
/// and all clauses land on the same alias.
fn detect_order_hint<C>(query: &Query<C>) -> Option<OrderBySpec> {
    if query.order_by.is_empty() || !query.group_by.is_empty() {
        return None;
    }
    let mut alias: Option<&str> = None;
    let mut fields = Vec::new();
    for clause in &query.order_by {
        let (a, field) = clause.expr.as_single_segment_ref()?;
        match alias {
            None => alias = Some(a),
            Some(existing) if existing == a => {}
            Some(_) => return None,
        }
        fields.push((field.to_owned(), clause.dir));
    }
    Some(OrderBySpec {
        alias: alias?.to_owned(),
        fields,
    })
}

fn first_aggregate(expr: &Expr) -> Option<crate::AggFunc> {
    match expr {
        Expr::Agg(f, _) => Some(*f),
        Expr::Func(_, args) => args.iter().find_map(first_aggregate),
        _ => None,
    }
}

fn check_refs<C>(query: &Query<C>, aliases: &BTreeSet<String>) -> Result<(), PlanError> {
    let check = |expr: &Expr| -> Result<(), PlanError> {
        for alias in expr.referenced_aliases() {
            if !aliases.contains(alias) {
                return Err(PlanError::UnknownAlias(alias.to_owned()));
            }
        }
        Ok(())
    };
    for join in &query.joins {
        check(&join.on)?;
    }
    if let Some(w) = &query.where_clause {
        check(w)?;
    }
    if let Some(h) = &query.having {
        check(h)?;
    }
    for g in &query.group_by {
        check(g)?;
    }
    if let Some(select) = &query.select {
        for field in select {
            check(&field.expr)?;
        }
    }
    for clause in &query.order_by {
        check(&clause.expr)?;
    }
    Ok(())
}
