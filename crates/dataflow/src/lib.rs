//! Incremental view maintenance primitives.
//!
//! Streams carry multiset deltas: `(row, diff)` pairs where a positive diff
//! inserts copies of a row and a negative diff retracts them. Operators are
//! stateful nodes in a [`Graph`]; pushing deltas into the graph's inputs and
//! calling [`Graph::step`] produces the delta of the query's output.
//!
//! The graph knows nothing about the query IR. The compiler in the live
//! query crate lowers expressions into the closures these operators take.

mod aggregate;
mod fractional;
mod graph;
mod join;
mod ops;
mod ordered;
mod sort;

pub use aggregate::{AggKind, AggSpec, Aggregate};
pub use fractional::key_between;
pub use graph::{Delta, Diff, Graph, GraphBuilder, NodeId, Operator};
pub use join::{Join, JoinSide};
pub use ops::{Distinct, Filter, InputOp, Map};
pub use ordered::{FractionalOrder, Window};
pub use sort::{SortDir, SortKey};
