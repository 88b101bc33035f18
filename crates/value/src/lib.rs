//! Dynamic row values for mirrordb.
//!
//! Collections store rows as [`Value`]s: a JSON-shaped dynamic value with a
//! total order, so rows can be indexed, sorted and used as cursor bounds
//! without knowing their static type. Typed records enter and leave the
//! engine through the [`Record`] serde bridge.

mod canon;
mod key;
mod record;
mod value;

pub use canon::canonical_string;
pub use key::Key;
pub use record::{Record, RowError};
pub use value::Value;
