mod criteria;
mod firestore;
mod memory;
mod models;
mod query;
mod sqlite;

pub use criteria::{DateRange, EqualityFilter, QueryCriteria, QueryShape};
pub use firestore::{decode_value, encode_value, FirestoreStore, TimestampEncoding};
pub use memory::MemoryStore;
pub use models::{
    fields,
    Building, Computer, Entity, HourlyCleaning, Issue, IssueType, Os, Printer, PrinterKind,
    PrinterStatus, Site, SiteReady, SiteType, SupplyCount, SupplyRequest, SupplyType, User,
};
pub use query::{compare_values, Direction, Filter, IndexSpec, Op, OrderBy, Query};
pub use sqlite::SqliteStore;

use async_trait::async_trait;
use serde_json::{Map, Value};
use std::sync::Arc;

use crate::error::{Result, StoreError};
use crate::settings::{Backend, Settings};

/// One stored record: its id within the collection plus its fields.
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    pub id: String,
    pub fields: Map<String, Value>,
}

/// A schemaless store of named collections of documents.
///
/// Every call goes straight to the backend; nothing is cached.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn get(&self, collection: &str, id: &str) -> Result<Option<Document>>;

    async fn query(&self, query: &Query) -> Result<Vec<Document>>;

    /// Insert a new document, generating an id when `id` is `None`.
    /// Returns the id the document was stored under.
    async fn create(&self, collection: &str, id: Option<&str>, fields: Map<String, Value>) -> Result<String>;

    /// Overwrite (or insert) the whole document.
    async fn set(&self, collection: &str, id: &str, fields: Map<String, Value>) -> Result<()>;

    /// Merge `fields` into an existing document. Fails with `NotFound` if
    /// it does not exist.
    async fn update(&self, collection: &str, id: &str, fields: Map<String, Value>) -> Result<()>;

    /// Remove a document. Deleting a missing document is not an error.
    async fn delete(&self, collection: &str, id: &str) -> Result<()>;

    fn backend_name(&self) -> &'static str;
}

pub(crate) fn new_document_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

/// Open the store selected by `settings`.
pub fn open_store(settings: &Settings) -> Result<Arc<dyn DocumentStore>> {
    open_store_with_token(settings, None)
}

/// Like [`open_store`], attaching a signed-in user's ID token to remote
/// requests. Local backends ignore the token.
pub fn open_store_with_token(settings: &Settings, id_token: Option<String>) -> Result<Arc<dyn DocumentStore>> {
    let store: Arc<dyn DocumentStore> = match settings.backend {
        Backend::Memory => {
            tracing::warn!("using in-memory document store; data is lost on exit");
            Arc::new(MemoryStore::new())
        }
        Backend::Sqlite => {
            let path = settings.resolved_db_path();
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| StoreError::Unavailable(format!("{}: {}", parent.display(), e)))?;
            }
            tracing::info!(path = %path.display(), "opening sqlite document store");
            Arc::new(SqliteStore::new(&path)?)
        }
        Backend::Firestore => {
            let project_id = settings
                .firestore_project_id
                .as_deref()
                .filter(|p| !p.is_empty())
                .ok_or_else(|| StoreError::Unavailable("firestore project id is not configured".into()))?;
            let store = match settings.firestore_emulator_host.as_deref().filter(|h| !h.is_empty()) {
                Some(host) => {
                    let host = if host.starts_with("http") { host.to_string() } else { format!("http://{}", host) };
                    tracing::info!(host = %host, project = project_id, "using firestore emulator");
                    FirestoreStore::with_host(&host, project_id, &settings.firestore_database)
                }
                None => {
                    tracing::info!(project = project_id, database = %settings.firestore_database, "using firestore document store");
                    FirestoreStore::new(project_id, &settings.firestore_database)
                }
            };
            let store = store
                .with_api_key(settings.api_key.clone())
                .with_timestamp_encoding(settings.firestore_timestamps);
            store.set_id_token(id_token);
            Arc::new(store)
        }
    };
    Ok(store)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_store_by_backend() {
        let memory = Settings { backend: Backend::Memory, ..Default::default() };
        assert_eq!(open_store(&memory).unwrap().backend_name(), "memory");

        let dir = tempfile::TempDir::new().unwrap();
        let sqlite = Settings {
            backend: Backend::Sqlite,
            db_path: Some(dir.path().join("data").join("sites.db").display().to_string()),
            ..Default::default()
        };
        assert_eq!(open_store(&sqlite).unwrap().backend_name(), "sqlite");

        let firestore = Settings { backend: Backend::Firestore, ..Default::default() };
        assert!(matches!(open_store(&firestore), Err(StoreError::Unavailable(_))));
    }
}
