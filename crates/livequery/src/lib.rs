//! mirrordb live queries.
//!
//! A [`LiveQuery`] compiles a declarative query tree (built with
//! [`mirrordb_expr::builder`]) into an incremental dataflow over one or
//! more source collections and maintains its results as a collection of
//! its own: filters and `order_by` hints push down into per-alias
//! subscriptions, changes coalesce to one graph run per transaction, and
//! ordered/windowed queries pull additional rows from on-demand sources
//! through cursor-based `load_subset` requests.

pub mod compiler;
mod error;
mod include;
mod runtime;

pub use error::{CompileError, LiveQueryError};
pub use runtime::{GetKeyFn, LiveQuery, LiveQueryOptions};

/// Re-exported builder surface, instantiated for collections.
pub mod query {
    use mirrordb_core::Collection;

    pub use mirrordb_expr::builder::{avg, col, count, from, from_query, lit, max, min, sum};
    pub use mirrordb_expr::{Expr, JoinKind, OrderDir};

    pub type Query = mirrordb_expr::Query<Collection>;
    pub type QueryBuilder = mirrordb_expr::builder::QueryBuilder<Collection>;
}
