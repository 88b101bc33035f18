//! Lowers a planned query onto the dataflow operator library.
//!
//! Rows flowing through a compiled pipeline are *envelopes*: objects with a
//! `key` (output identity), `row` (the user-visible value), and for ordered
//! queries `sort` values and a fractional `index`. Include pipelines add a
//! `corr` field carrying the child's correlation value. The runtime only
//! ever consumes envelopes.

use crate::error::CompileError;
use mirrordb_core::{Collection, StringCollation};
use mirrordb_dataflow::{
    AggKind, AggSpec, Aggregate, Delta, Distinct, Filter, FractionalOrder, Graph, GraphBuilder,
    Join, JoinSide, Map, NodeId, SortDir, SortKey, Window,
};
use mirrordb_expr::plan::{AliasSource, QueryPlan};
use mirrordb_expr::{eval, AggFunc, Expr, JoinKind, OrderDir, ScalarFunc};
use mirrordb_value::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

pub const ENV_KEY: &str = "key";
pub const ENV_ROW: &str = "row";
pub const ENV_SORT: &str = "sort";
pub const ENV_INDEX: &str = "index";
pub const ENV_CORR: &str = "corr";
const ENV_AGGS: &str = "aggs";

pub struct CompiledAlias {
    /// Graph input stream name, unique across nested subqueries.
    pub input: String,
    pub alias: String,
    pub collection: Collection,
    /// Alias-stripped predicate pushed into the source subscription.
    pub pushdown: Option<Expr>,
    /// Order hint passed to on-demand sources.
    pub order_hint: Option<Vec<(String, OrderDir)>>,
    pub nullable: bool,
}

pub struct CompiledInclude {
    pub field_name: String,
    pub correlation_field: String,
    pub child: CompiledQuery,
}

pub struct CompiledQuery {
    pub graph: Graph,
    pub aliases: Vec<CompiledAlias>,
    pub order_node: Option<NodeId>,
    pub window_node: Option<NodeId>,
    pub ordered: bool,
    /// The alias driving cursor-based lazy loading, when the ordering is
    /// optimizable.
    pub ordered_alias: Option<String>,
    pub includes: Vec<CompiledInclude>,
    pub single_result: bool,
}

pub fn compile(plan: &QueryPlan<Collection>) -> Result<CompiledQuery, CompileError> {
    let mut counter = 0usize;
    compile_inner(plan, &mut counter, None)
}

fn compile_inner(
    plan: &QueryPlan<Collection>,
    counter: &mut usize,
    corr_field: Option<&str>,
) -> Result<CompiledQuery, CompileError> {
    let mut builder = GraphBuilder::new();
    let mut aliases = Vec::new();
    let lowered = lower(plan, &mut builder, &mut aliases, counter, corr_field)?;
    let graph = builder.finish(lowered.out);

    let expected = plan.input_count();
    let produced = graph.input_names().count();
    if produced != expected {
        return Err(CompileError::MissingAliasInputs {
            expected,
            missing: expected.saturating_sub(produced),
        });
    }

    let mut includes = Vec::new();
    for include_plan in &plan.includes {
        let child = compile_inner(
            &include_plan.plan,
            counter,
            Some(&include_plan.include.child_correlation_field),
        )?;
        includes.push(CompiledInclude {
            field_name: include_plan.include.field_name.clone(),
            correlation_field: include_plan.include.correlation_field.clone(),
            child,
        });
    }

    Ok(CompiledQuery {
        graph,
        aliases,
        order_node: lowered.order_node,
        window_node: lowered.window_node,
        ordered: lowered.ordered,
        ordered_alias: plan.optimizable_order_by.as_ref().map(|o| o.alias.clone()),
        includes,
        single_result: plan.query.single_result,
    })
}

struct Lowered {
    out: NodeId,
    order_node: Option<NodeId>,
    window_node: Option<NodeId>,
    ordered: bool,
}

type KeyExtractor = Arc<dyn Fn(&Value) -> Value + Send + Sync>;

fn lower(
    plan: &QueryPlan<Collection>,
    b: &mut GraphBuilder,
    aliases: &mut Vec<CompiledAlias>,
    counter: &mut usize,
    corr_field: Option<&str>,
) -> Result<Lowered, CompileError> {
    let query = &plan.query;
    if (query.limit.is_some() || query.offset.is_some()) && query.order_by.is_empty() {
        return Err(CompileError::LimitWithoutOrderBy);
    }

    // One wrapped input per alias. Every alias node emits `{alias: row}`.
    let mut alias_nodes: Vec<(String, NodeId, KeyExtractor)> = Vec::new();
    for alias_plan in &plan.aliases {
        let alias = alias_plan.alias.clone();
        match &alias_plan.source {
            AliasSource::Collection(collection) => {
                *counter += 1;
                let input_name = format!("{}#{counter}", alias);
                let input = b.add_input(&input_name);
                let wrap_alias = alias.clone();
                let wrapped = b.add_node(
                    Box::new(Map::new(move |row: &Value| {
                        Value::object([(wrap_alias.clone(), row.clone())])
                    })),
                    &[input],
                );
                aliases.push(CompiledAlias {
                    input: input_name,
                    alias: alias.clone(),
                    collection: collection.clone(),
                    pushdown: alias_plan.pushdown.clone(),
                    order_hint: alias_plan.order_hint.clone(),
                    nullable: alias_plan.nullable,
                });
                let key_fn = collection.options().key_fn.clone();
                let extractor: KeyExtractor = Arc::new(move |row: &Value| {
                    key_fn(row).map(|k| k.to_value()).unwrap_or_else(|| row.clone())
                });
                alias_nodes.push((alias, wrapped, extractor));
            }
            AliasSource::Subquery(subplan) => {
                let sub = lower(subplan, b, aliases, counter, None)?;
                let wrap_alias = alias.clone();
                let unwrapped = b.add_node(
                    Box::new(Map::new(move |env: &Value| {
                        Value::object([(
                            wrap_alias.clone(),
                            env.get(ENV_ROW).cloned().unwrap_or(Value::Null),
                        )])
                    })),
                    &[sub.out],
                );
                let node = match &alias_plan.pushdown {
                    Some(pushdown) => {
                        let predicate = pushdown.clone();
                        let filter_alias = alias.clone();
                        b.add_node(
                            Box::new(Filter::new(move |ns: &Value| {
                                eval::eval_predicate(
                                    &predicate,
                                    ns.get(&filter_alias).unwrap_or(&Value::Null),
                                )
                            })),
                            &[unwrapped],
                        )
                    }
                    None => unwrapped,
                };
                // Subquery rows have no primary key; their identity is the
                // row itself.
                let extractor: KeyExtractor = Arc::new(|row: &Value| row.clone());
                alias_nodes.push((alias, node, extractor));
            }
        }
    }

    // Fold joins left to right.
    let mut acc = alias_nodes[0].1;
    let mut acc_aliases = vec![alias_nodes[0].0.clone()];
    for (i, join) in query.joins.iter().enumerate() {
        let (right_alias, right_node, _) = &alias_nodes[i + 1];
        let (left_keys, right_keys, residual) = split_equi_join(&join.on, &acc_aliases, right_alias)?;
        if residual.is_some() && join.kind == JoinKind::Left {
            return Err(CompileError::LeftJoinResidual);
        }

        let left_key = join_key_fn(left_keys);
        let right_key = join_key_fn(right_keys);
        let merge_alias = right_alias.clone();
        let merge = move |left: &Value, right: Option<&Value>| -> Value {
            let mut fields: BTreeMap<String, Value> = match left {
                Value::Object(fields) => fields.clone(),
                other => BTreeMap::from([("".to_string(), other.clone())]),
            };
            match right {
                Some(Value::Object(right_fields)) => {
                    fields.extend(right_fields.clone());
                }
                Some(other) => {
                    fields.insert(merge_alias.clone(), other.clone());
                }
                None => {
                    fields.insert(merge_alias.clone(), Value::Null);
                }
            }
            Value::Object(fields)
        };
        let side = match join.kind {
            JoinKind::Inner => JoinSide::Inner,
            JoinKind::Left => JoinSide::Left,
        };
        acc = b.add_node(
            Box::new(Join::new(side, left_key, right_key, merge)),
            &[acc, *right_node],
        );
        if let Some(residual) = residual {
            acc = b.add_node(
                Box::new(Filter::new(move |ns: &Value| eval::eval_predicate(&residual, ns))),
                &[acc],
            );
        }
        acc_aliases.push(right_alias.clone());
    }

    // Residual where clause stays in the graph.
    if let Some(residual) = plan.residual_where.clone() {
        acc = b.add_node(
            Box::new(Filter::new(move |ns: &Value| eval::eval_predicate(&residual, ns))),
            &[acc],
        );
    }

    let grouped = !query.group_by.is_empty()
        || query
            .select
            .as_ref()
            .is_some_and(|fields| fields.iter().any(|f| f.expr.contains_aggregate()));

    let collation = order_collation(plan);
    let order_by = query.order_by.clone();

    acc = if grouped {
        lower_grouped(plan, b, acc, collation)?
    } else {
        lower_plain(plan, b, acc, &alias_nodes, collation)?
    };

    // Ordering: assign fractional indexes, then window if bounded.
    let mut order_node = None;
    let mut window_node = None;
    let ordered = !order_by.is_empty();
    if ordered {
        let dirs: Arc<[SortDir]> = order_by
            .iter()
            .map(|c| match c.dir {
                OrderDir::Asc => SortDir::Asc,
                OrderDir::Desc => SortDir::Desc,
            })
            .collect::<Vec<_>>()
            .into();
        let node = b.add_node(
            Box::new(FractionalOrder::new(
                move |env: &Value| {
                    let values = env
                        .get(ENV_SORT)
                        .and_then(Value::as_array)
                        .map(<[Value]>::to_vec)
                        .unwrap_or_default();
                    let tie = env.get(ENV_KEY).cloned().unwrap_or(Value::Null);
                    SortKey::new(values, dirs.clone(), tie)
                },
                |env: &Value, index: &str| {
                    let mut out = env.clone();
                    out.set(ENV_INDEX, Value::from(index.to_owned()));
                    out
                },
            )),
            &[acc],
        );
        order_node = Some(node);
        acc = node;
        // Ordered queries always get a window so its bounds can be set
        // later; unbounded windows pass everything through.
        let node = b.add_node(
            Box::new(Window::new(query.offset.unwrap_or(0), query.limit, |env: &Value| {
                env.get(ENV_INDEX)
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_owned()
            })),
            &[acc],
        );
        window_node = Some(node);
        acc = node;
    }

    // Include pipelines tag each envelope with its correlation value.
    if let Some(corr) = corr_field {
        let corr = corr.to_owned();
        acc = b.add_node(
            Box::new(Map::new(move |env: &Value| {
                let value = env
                    .get(ENV_ROW)
                    .and_then(|row| row.path(&corr))
                    .cloned()
                    .unwrap_or(Value::Null);
                let mut out = env.clone();
                out.set(ENV_CORR, value);
                out
            })),
            &[acc],
        );
    }

    Ok(Lowered {
        out: acc,
        order_node,
        window_node,
        ordered,
    })
}

/// Sort values honor the ordered source's string collation.
fn order_collation(plan: &QueryPlan<Collection>) -> StringCollation {
    plan.optimizable_order_by
        .as_ref()
        .and_then(|spec| {
            plan.aliases.iter().find(|a| a.alias == spec.alias).and_then(|a| match &a.source {
                AliasSource::Collection(c) => Some(c.options().default_string_collation),
                AliasSource::Subquery(_) => None,
            })
        })
        .unwrap_or_default()
}

fn collate(value: Value, collation: StringCollation) -> Value {
    match (collation, value) {
        (StringCollation::CaseInsensitive, Value::Str(s)) => Value::Str(s.to_lowercase()),
        (_, value) => value,
    }
}

fn lower_plain(
    plan: &QueryPlan<Collection>,
    b: &mut GraphBuilder,
    acc: NodeId,
    alias_nodes: &[(String, NodeId, KeyExtractor)],
    collation: StringCollation,
) -> Result<NodeId, CompileError> {
    let query = &plan.query;
    let select = query.select.clone();
    let distinct = query.distinct;
    let order_exprs: Vec<Expr> = if distinct {
        query.order_by.iter().map(|c| c.expr.strip_alias()).collect()
    } else {
        query.order_by.iter().map(|c| c.expr.clone()).collect()
    };
    let extractors: Vec<(String, KeyExtractor)> = alias_nodes
        .iter()
        .map(|(alias, _, ex)| (alias.clone(), ex.clone()))
        .collect();
    let single_alias = extractors.len() == 1;

    let env = move |ns: &Value| -> Value {
        let row = match &select {
            Some(fields) => Value::object(fields.iter().map(|f| {
                (
                    f.name.clone(),
                    eval::eval(&f.expr, ns).unwrap_or(Value::Null),
                )
            })),
            None if single_alias => ns.get(&extractors[0].0).cloned().unwrap_or(Value::Null),
            None => ns.clone(),
        };
        let key = if distinct {
            row.clone()
        } else if single_alias {
            let source_row = ns.get(&extractors[0].0).cloned().unwrap_or(Value::Null);
            (extractors[0].1)(&source_row)
        } else {
            extractors
                .iter()
                .map(|(alias, ex)| {
                    let source_row = ns.get(alias).cloned().unwrap_or(Value::Null);
                    if source_row.is_null() {
                        Value::Null
                    } else {
                        ex(&source_row)
                    }
                })
                .collect()
        };
        let mut fields = vec![(ENV_KEY.to_string(), key), (ENV_ROW.to_string(), row)];
        if !order_exprs.is_empty() {
            let basis = if distinct {
                fields[1].1.clone()
            } else {
                ns.clone()
            };
            let sort: Value = order_exprs
                .iter()
                .map(|e| collate(eval::eval(e, &basis).unwrap_or(Value::Null), collation))
                .collect();
            fields.push((ENV_SORT.to_string(), sort));
        }
        Value::object(fields)
    };

    let mut node = b.add_node(Box::new(Map::new(env)), &[acc]);
    if distinct {
        node = b.add_node(Box::new(Distinct::new()), &[node]);
    }
    Ok(node)
}

fn lower_grouped(
    plan: &QueryPlan<Collection>,
    b: &mut GraphBuilder,
    acc: NodeId,
    collation: StringCollation,
) -> Result<NodeId, CompileError> {
    let query = &plan.query;
    let select = query
        .select
        .clone()
        .ok_or(CompileError::GroupedQueryRequiresSelect)?;

    // Collect every distinct aggregate from select and having.
    let mut agg_exprs: Vec<Expr> = Vec::new();
    let mut collect = |expr: &Expr| {
        for agg in find_aggregates(expr) {
            if !agg_exprs.iter().any(|e| e.signature() == agg.signature()) {
                agg_exprs.push(agg);
            }
        }
    };
    for field in &select {
        collect(&field.expr);
    }
    if let Some(having) = &query.having {
        collect(having);
    }

    let specs: Vec<AggSpec> = agg_exprs
        .iter()
        .map(|expr| {
            let Expr::Agg(func, arg) = expr else {
                unreachable!("find_aggregates returns Agg nodes");
            };
            let kind = match func {
                AggFunc::Count => AggKind::Count,
                AggFunc::Sum => AggKind::Sum,
                AggFunc::Avg => AggKind::Avg,
                AggFunc::Min => AggKind::Min,
                AggFunc::Max => AggKind::Max,
            };
            let arg = arg.as_ref().map(|arg| {
                let arg = (**arg).clone();
                Box::new(move |ns: &Value| eval::eval(&arg, ns).unwrap_or(Value::Null))
                    as Box<dyn Fn(&Value) -> Value + Send>
            });
            AggSpec { kind, arg }
        })
        .collect();

    // Map each select field onto either an aggregate slot or a group key
    // slot.
    enum FieldSrc {
        Agg(usize),
        Key(usize),
    }
    let group_by = query.group_by.clone();
    let mut field_srcs = Vec::new();
    for field in &select {
        let src = if let Some(i) = agg_exprs
            .iter()
            .position(|a| a.signature() == field.expr.signature())
        {
            FieldSrc::Agg(i)
        } else if let Some(j) = group_by
            .iter()
            .position(|g| g.signature() == field.expr.signature())
        {
            FieldSrc::Key(j)
        } else {
            return Err(CompileError::UngroupedSelectField(field.name.clone()));
        };
        field_srcs.push((field.name.clone(), src));
    }

    let group_key_exprs = group_by.clone();
    let group_key = move |ns: &Value| -> Value {
        group_key_exprs
            .iter()
            .map(|e| eval::eval(e, ns).unwrap_or(Value::Null))
            .collect()
    };

    let build_row = move |key: &Value, results: &[Value]| -> Value {
        let row = Value::object(field_srcs.iter().map(|(name, src)| {
            let value = match src {
                FieldSrc::Agg(i) => results[*i].clone(),
                FieldSrc::Key(j) => key
                    .as_array()
                    .and_then(|k| k.get(*j))
                    .cloned()
                    .unwrap_or(Value::Null),
            };
            (name.clone(), value)
        }));
        Value::object([
            (ENV_KEY.to_string(), key.clone()),
            (ENV_ROW.to_string(), row),
            (ENV_AGGS.to_string(), Value::Array(results.to_vec())),
        ])
    };

    let mut node = b.add_node(Box::new(Aggregate::new(group_key, specs, build_row)), &[acc]);

    // Having filters on the env (aggregate slots included).
    if let Some(having) = &query.having {
        let rewritten = rewrite_over_env(having, &agg_exprs, &group_by)?;
        node = b.add_node(
            Box::new(Filter::new(move |env: &Value| {
                eval::eval_predicate(&rewritten, env)
            })),
            &[node],
        );
    }

    // Ordered grouped queries sort on env-rewritten expressions.
    if !query.order_by.is_empty() {
        let sort_exprs: Vec<Expr> = query
            .order_by
            .iter()
            .map(|c| rewrite_over_env(&c.expr, &agg_exprs, &group_by))
            .collect::<Result<_, _>>()?;
        node = b.add_node(
            Box::new(Map::new(move |env: &Value| {
                let sort: Value = sort_exprs
                    .iter()
                    .map(|e| collate(eval::eval(e, env).unwrap_or(Value::Null), collation))
                    .collect();
                let mut out = env.clone();
                out.set(ENV_SORT, sort);
                out
            })),
            &[node],
        );
    }

    // Strip the aggregate slots before the envelope leaves the pipeline.
    node = b.add_node(
        Box::new(Map::new(|env: &Value| {
            let mut out = env.clone();
            if let Value::Object(fields) = &mut out {
                fields.remove(ENV_AGGS);
            }
            out
        })),
        &[node],
    );
    Ok(node)
}

fn find_aggregates(expr: &Expr) -> Vec<Expr> {
    match expr {
        Expr::Agg(..) => vec![expr.clone()],
        Expr::Func(_, args) => args.iter().flat_map(find_aggregates).collect(),
        _ => Vec::new(),
    }
}

/// Rewrite a post-aggregation expression to read from the envelope:
/// aggregates from `aggs[i]`, grouped expressions from `key[j]`.
fn rewrite_over_env(expr: &Expr, agg_exprs: &[Expr], group_by: &[Expr]) -> Result<Expr, CompileError> {
    if let Some(i) = agg_exprs.iter().position(|a| a.signature() == expr.signature()) {
        return Ok(Expr::Ref {
            alias: String::new(),
            path: vec![ENV_AGGS.to_string(), i.to_string()],
        });
    }
    if let Some(j) = group_by.iter().position(|g| g.signature() == expr.signature()) {
        return Ok(Expr::Ref {
            alias: String::new(),
            path: vec![ENV_KEY.to_string(), j.to_string()],
        });
    }
    match expr {
        Expr::Func(f, args) => Ok(Expr::Func(
            *f,
            args.iter()
                .map(|a| rewrite_over_env(a, agg_exprs, group_by))
                .collect::<Result<_, _>>()?,
        )),
        Expr::Val(v) => Ok(Expr::Val(v.clone())),
        Expr::Ref { alias, path } => Err(CompileError::HavingFieldNotGrouped(format!(
            "{alias}.{}",
            path.join(".")
        ))),
        Expr::Agg(..) => unreachable!("aggregates matched by signature above"),
    }
}

fn join_key_fn(exprs: Vec<Expr>) -> impl Fn(&Value) -> Value + Send + 'static {
    move |ns: &Value| {
        let mut parts = Vec::with_capacity(exprs.len());
        for expr in &exprs {
            match eval::eval(expr, ns) {
                Ok(v) if !v.is_null() => parts.push(v),
                // Null join keys never match.
                _ => return Value::Null,
            }
        }
        Value::Array(parts)
    }
}

/// Split a join condition into equi-key pairs between the accumulated
/// aliases and the newly joined alias, plus a residual predicate.
fn split_equi_join(
    on: &Expr,
    left_aliases: &[String],
    right_alias: &str,
) -> Result<(Vec<Expr>, Vec<Expr>, Option<Expr>), CompileError> {
    let mut left_keys = Vec::new();
    let mut right_keys = Vec::new();
    let mut residual = Vec::new();
    for conjunct in on.conjuncts() {
        if let Expr::Func(ScalarFunc::Eq, args) = conjunct {
            if let [a, b] = args.as_slice() {
                let a_aliases = a.referenced_aliases();
                let b_aliases = b.referenced_aliases();
                let a_is_right = a_aliases.len() == 1 && a_aliases.contains(right_alias);
                let b_is_right = b_aliases.len() == 1 && b_aliases.contains(right_alias);
                let a_is_left = a_aliases.iter().all(|al| left_aliases.iter().any(|l| l == al));
                let b_is_left = b_aliases.iter().all(|al| left_aliases.iter().any(|l| l == al));
                if a_is_left && b_is_right {
                    left_keys.push(a.clone());
                    right_keys.push(b.clone());
                    continue;
                }
                if b_is_left && a_is_right {
                    left_keys.push(b.clone());
                    right_keys.push(a.clone());
                    continue;
                }
            }
        }
        residual.push(conjunct.clone());
    }
    if left_keys.is_empty() {
        return Err(CompileError::UnsupportedJoinCondition {
            left: left_aliases.join(","),
            right: right_alias.to_owned(),
        });
    }
    Ok((left_keys, right_keys, Expr::all(residual)))
}

/// Convert a collection change batch into the alias input delta.
pub fn changes_to_delta(changes: &[mirrordb_core::ChangeMessage]) -> Delta {
    let mut delta = Vec::new();
    for change in changes {
        match change.kind {
            mirrordb_core::ChangeKind::Insert => delta.push((change.value.clone(), 1)),
            mirrordb_core::ChangeKind::Delete => delta.push((change.value.clone(), -1)),
            mirrordb_core::ChangeKind::Update => {
                if let Some(previous) = &change.previous_value {
                    delta.push((previous.clone(), -1));
                }
                delta.push((change.value.clone(), 1));
            }
        }
    }
    delta
}
