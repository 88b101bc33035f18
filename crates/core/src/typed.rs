//! A typed façade over the dynamic collection.
//!
//! The engine stores rows as [`Value`]s; `TypedCollection<T>` converts at
//! the boundary so application code works with its own record types.

use crate::collection::Collection;
use crate::error::Error;
use crate::transactions::Transaction;
use mirrordb_value::{Key, Record, Value};
use std::marker::PhantomData;

#[derive(Clone)]
pub struct TypedCollection<T: Record> {
    collection: Collection,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Record> TypedCollection<T> {
    pub fn new(collection: Collection) -> Self {
        TypedCollection {
            collection,
            _marker: PhantomData,
        }
    }

    /// The underlying dynamic collection (for queries and subscriptions).
    pub fn raw(&self) -> &Collection {
        &self.collection
    }

    pub fn get(&self, key: &Key) -> Result<Option<T>, Error> {
        match self.collection.get(key) {
            None => Ok(None),
            Some(row) => Ok(Some(T::from_row(&row)?)),
        }
    }

    pub fn to_vec(&self) -> Result<Vec<T>, Error> {
        self.collection
            .to_array()
            .iter()
            .map(|row| T::from_row(row).map_err(Error::from))
            .collect()
    }

    pub async fn insert(&self, record: &T) -> Result<Transaction, Error> {
        self.collection.insert(record.into_row()?).await
    }

    pub async fn update(&self, key: &Key, f: impl FnOnce(&mut T)) -> Result<Transaction, Error> {
        // Convert, mutate, convert back; errors inside the closure surface
        // as a failed conversion before any overlay is applied.
        let mut conversion_error = None;
        let tx = self
            .collection
            .update(key, |row: &mut Value| match T::from_row(row) {
                Ok(mut record) => {
                    f(&mut record);
                    match record.into_row() {
                        Ok(updated) => *row = updated,
                        Err(e) => conversion_error = Some(e),
                    }
                }
                Err(e) => conversion_error = Some(e),
            })
            .await?;
        match conversion_error {
            Some(e) => Err(e.into()),
            None => Ok(tx),
        }
    }

    pub async fn delete(&self, key: &Key) -> Result<Transaction, Error> {
        self.collection.delete(key).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::local::local_collection_options;
    use serde::{Deserialize, Serialize};

    #[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
    struct Todo {
        id: i64,
        title: String,
    }

    #[tokio::test]
    async fn typed_crud_round_trips() {
        let todos: TypedCollection<Todo> =
            TypedCollection::new(Collection::new(local_collection_options("todos", "id")));
        todos
            .insert(&Todo {
                id: 1,
                title: "a".into(),
            })
            .await
            .unwrap();
        todos
            .update(&Key::Int(1), |todo| todo.title = "b".into())
            .await
            .unwrap();
        assert_eq!(
            todos.get(&Key::Int(1)).unwrap(),
            Some(Todo {
                id: 1,
                title: "b".into()
            })
        );
    }
}
