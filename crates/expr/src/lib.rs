//! The query IR for mirrordb live queries.
//!
//! Queries are not parsed from SQL; they are constructed directly as an IR
//! tree (the builder in [`builder`] is the public construction surface).
//! The [`plan`] module turns a query tree into the per-alias subscription
//! plan the live query runtime executes.

pub mod builder;
mod error;
pub mod eval;
mod expr;
pub mod plan;
mod query;

pub use error::{EvalError, PlanError};
pub use expr::{AggFunc, Expr, OrderDir, ScalarFunc};
pub use query::{Include, Join, JoinKind, OrderByClause, Query, SelectField, Source};
