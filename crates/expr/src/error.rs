use thiserror::Error;

#[derive(Error, Debug, PartialEq)]
pub enum PlanError {
    #[error("duplicate alias `{0}` in query")]
    DuplicateAlias(String),
    #[error("expression references unknown alias `{0}`")]
    UnknownAlias(String),
    #[error("aggregate used outside of select/having: `{0:?}`")]
    MisplacedAggregate(crate::AggFunc),
    #[error("include `{0}` requires an object-producing query")]
    InvalidInclude(String),
    #[error("`having` requires a `group_by` clause")]
    HavingWithoutGroupBy,
}

#[derive(Error, Debug, PartialEq)]
pub enum EvalError {
    #[error("function `{func:?}` expected {expected} argument(s), got {got}")]
    Arity {
        func: crate::ScalarFunc,
        expected: usize,
        got: usize,
    },
    #[error("function `{func:?}` not defined for operand type")]
    BadOperand { func: crate::ScalarFunc },
    #[error("division by zero")]
    DivisionByZero,
}
