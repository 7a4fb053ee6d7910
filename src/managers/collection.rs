use serde_json::{Map, Value};
use std::marker::PhantomData;
use std::sync::Arc;

use crate::db::{DocumentStore, Entity, Query};
use crate::error::{Result, StoreError};

/// Typed access to the collection backing one entity type.
pub struct Collection<T> {
    store: Arc<dyn DocumentStore>,
    _entity: PhantomData<fn() -> T>,
}

impl<T> Clone for Collection<T> {
    fn clone(&self) -> Self {
        Collection {
            store: self.store.clone(),
            _entity: PhantomData,
        }
    }
}

impl<T: Entity> Collection<T> {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Collection {
            store,
            _entity: PhantomData,
        }
    }

    pub fn name(&self) -> &'static str {
        T::COLLECTION
    }

    /// A query against this collection with no filters yet.
    pub fn query(&self) -> Query {
        Query::collection(T::COLLECTION)
    }

    /// Store a new record. An empty id asks the store to generate one; the
    /// returned copy carries the final id.
    pub async fn create(&self, entity: &T) -> Result<T> {
        let requested = Some(entity.id()).filter(|id| !id.is_empty());
        let id = self
            .store
            .create(T::COLLECTION, requested, entity.to_fields()?)
            .await?;
        let mut stored = entity.clone();
        stored.set_id(id);
        Ok(stored)
    }

    pub async fn get(&self, id: &str) -> Result<Option<T>> {
        self.store
            .get(T::COLLECTION, id)
            .await?
            .map(T::from_document)
            .transpose()
    }

    pub async fn require(&self, id: &str) -> Result<T> {
        self.get(id)
            .await?
            .ok_or_else(|| StoreError::not_found(T::COLLECTION, id))
    }

    /// Overwrite the stored record with `entity`.
    pub async fn save(&self, entity: &T) -> Result<()> {
        if entity.id().is_empty() {
            return Err(StoreError::InvalidInput(format!(
                "cannot save a {} record without an id",
                T::COLLECTION
            )));
        }
        self.store
            .set(T::COLLECTION, entity.id(), entity.to_fields()?)
            .await
    }

    pub async fn patch(&self, id: &str, fields: Map<String, Value>) -> Result<()> {
        self.store.update(T::COLLECTION, id, fields).await
    }

    pub async fn delete(&self, id: &str) -> Result<()> {
        self.store.delete(T::COLLECTION, id).await
    }

    pub async fn fetch(&self, query: Query) -> Result<Vec<T>> {
        debug_assert_eq!(query.collection, T::COLLECTION);
        let docs = self.store.query(&query).await?;
        docs.into_iter().map(T::from_document).collect()
    }
}

/// Build a field map for a partial update.
#[macro_export]
macro_rules! patch {
    ($($field:expr => $value:expr),* $(,)?) => {{
        let mut map = ::serde_json::Map::new();
        $( map.insert($field.to_string(), ::serde_json::json!($value)); )*
        map
    }};
}
