use crate::Value;
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RowError {
    #[error("failed to serialize record into a row: {0}")]
    Serialize(#[source] serde_json::Error),
    #[error("failed to deserialize row into a record: {0}")]
    Deserialize(#[source] serde_json::Error),
}

/// A typed record that can cross into and out of the dynamic engine.
///
/// Blanket-implemented for anything serde can handle; collections store the
/// [`Value`] form and materialize `T` on read.
pub trait Record: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    fn into_row(&self) -> Result<Value, RowError> {
        serde_json::to_value(self).map(Value::from).map_err(RowError::Serialize)
    }

    fn from_row(row: &Value) -> Result<Self, RowError> {
        serde_json::from_value(serde_json::Value::from(row.clone())).map_err(RowError::Deserialize)
    }
}

impl<T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static> Record for T {}
