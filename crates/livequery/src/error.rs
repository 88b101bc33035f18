use thiserror::Error;

#[derive(Error, Debug)]
pub enum CompileError {
    #[error("plan error: {0}")]
    Plan(#[from] mirrordb_expr::PlanError),
    #[error("query graph is missing inputs for {missing} of {expected} aliases")]
    MissingAliasInputs { expected: usize, missing: usize },
    #[error("limit/offset requires an order_by clause")]
    LimitWithoutOrderBy,
    #[error("join condition has no equality between `{left}` and `{right}`")]
    UnsupportedJoinCondition { left: String, right: String },
    #[error("left join conditions must be pure equalities")]
    LeftJoinResidual,
    #[error("grouped queries require an explicit select")]
    GroupedQueryRequiresSelect,
    #[error("select field `{0}` is neither an aggregate nor part of group_by")]
    UngroupedSelectField(String),
    #[error("having references `{0}` which is neither aggregated nor grouped")]
    HavingFieldNotGrouped(String),
}

#[derive(Error, Debug)]
pub enum LiveQueryError {
    #[error("CompileError: {0}")]
    Compile(#[from] CompileError),
    #[error("set_window on an unordered query")]
    SetWindowOnUnordered,
    #[error("CollectionError: {0}")]
    Collection(#[from] mirrordb_core::Error),
    #[error("live query source `{source_name}` became unusable: {reason}")]
    SourceFailed { source_name: String, reason: String },
}
