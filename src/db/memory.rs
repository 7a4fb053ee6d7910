//! In-process document store.

use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::RwLock;

use super::query::{IndexSpec, Query};
use super::{new_document_id, Document, DocumentStore};
use crate::error::{Result, StoreError};

type Collections = HashMap<String, BTreeMap<String, Map<String, Value>>>;

/// Collections held in a `RwLock`ed map.
///
/// With index enforcement on, queries behave like the remote store without
/// the composite index provisioned: any query whose
/// [`Query::required_index`] has not been registered through
/// [`MemoryStore::provision_index`] fails with `MissingIndex`.
#[derive(Debug, Default)]
pub struct MemoryStore {
    collections: RwLock<Collections>,
    indexes: RwLock<HashSet<IndexSpec>>,
    enforce_indexes: bool,
}

fn poisoned() -> StoreError {
    StoreError::Unavailable("memory store lock poisoned".into())
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_index_enforcement() -> Self {
        MemoryStore {
            enforce_indexes: true,
            ..Self::default()
        }
    }

    pub fn provision_index(&self, collection: &str, fields: &[&str]) -> Result<()> {
        let spec = IndexSpec {
            collection: collection.to_string(),
            fields: fields.iter().map(|f| f.to_string()).collect(),
        };
        self.indexes.write().map_err(|_| poisoned())?.insert(spec);
        Ok(())
    }

    /// Documents currently held in `collection`.
    pub fn count(&self, collection: &str) -> Result<usize> {
        let collections = self.collections.read().map_err(|_| poisoned())?;
        Ok(collections.get(collection).map_or(0, |docs| docs.len()))
    }

    fn check_index(&self, query: &Query) -> Result<()> {
        if !self.enforce_indexes {
            return Ok(());
        }
        if let Some(spec) = query.required_index() {
            let indexes = self.indexes.read().map_err(|_| poisoned())?;
            if !indexes.contains(&spec) {
                tracing::warn!(collection = %spec.collection, fields = ?spec.fields, "query needs an unprovisioned index");
                return Err(StoreError::MissingIndex {
                    collection: spec.collection,
                    fields: spec.fields,
                    hint: Some("call provision_index with these fields".into()),
                });
            }
        }
        Ok(())
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn get(&self, collection: &str, id: &str) -> Result<Option<Document>> {
        let collections = self.collections.read().map_err(|_| poisoned())?;
        Ok(collections
            .get(collection)
            .and_then(|docs| docs.get(id))
            .map(|fields| Document {
                id: id.to_string(),
                fields: fields.clone(),
            }))
    }

    async fn query(&self, query: &Query) -> Result<Vec<Document>> {
        query.validate()?;
        self.check_index(query)?;

        let collections = self.collections.read().map_err(|_| poisoned())?;
        let Some(docs) = collections.get(&query.collection) else {
            return Ok(Vec::new());
        };
        let candidates = docs.iter().map(|(id, fields)| Document {
            id: id.clone(),
            fields: fields.clone(),
        });
        let out = query.apply(candidates);
        tracing::debug!(collection = %query.collection, results = out.len(), "memory query");
        Ok(out)
    }

    async fn create(&self, collection: &str, id: Option<&str>, fields: Map<String, Value>) -> Result<String> {
        let id = id.map(str::to_string).unwrap_or_else(new_document_id);
        let mut collections = self.collections.write().map_err(|_| poisoned())?;
        let docs = collections.entry(collection.to_string()).or_default();
        if docs.contains_key(&id) {
            return Err(StoreError::Remote {
                status: 409,
                message: format!("{}/{} already exists", collection, id),
            });
        }
        docs.insert(id.clone(), fields);
        Ok(id)
    }

    async fn set(&self, collection: &str, id: &str, fields: Map<String, Value>) -> Result<()> {
        let mut collections = self.collections.write().map_err(|_| poisoned())?;
        collections
            .entry(collection.to_string())
            .or_default()
            .insert(id.to_string(), fields);
        Ok(())
    }

    async fn update(&self, collection: &str, id: &str, fields: Map<String, Value>) -> Result<()> {
        let mut collections = self.collections.write().map_err(|_| poisoned())?;
        let existing = collections
            .get_mut(collection)
            .and_then(|docs| docs.get_mut(id))
            .ok_or_else(|| StoreError::not_found(collection, id))?;
        for (k, v) in fields {
            existing.insert(k, v);
        }
        Ok(())
    }

    async fn delete(&self, collection: &str, id: &str) -> Result<()> {
        let mut collections = self.collections.write().map_err(|_| poisoned())?;
        if let Some(docs) = collections.get_mut(collection) {
            docs.remove(id);
        }
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}
