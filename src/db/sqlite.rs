use async_trait::async_trait;
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use serde_json::{Map, Value};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use super::query::{Direction, Filter, Op, Query};
use super::{new_document_id, Document, DocumentStore};
use crate::error::{Result, StoreError};

/// Document store kept in a single SQLite table, one JSON body per row.
pub struct SqliteStore {
    conn: Mutex<Connection>,
    path: String,
}

impl SqliteStore {
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path_str = path.as_ref().to_string_lossy().to_string();
        let conn = Connection::open(&path)?;
        let store = SqliteStore { conn: Mutex::new(conn), path: path_str };
        store.init()?;
        Ok(store)
    }

    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let store = SqliteStore { conn: Mutex::new(conn), path: ":memory:".to_string() };
        store.init()?;
        Ok(store)
    }

    pub fn get_path(&self) -> String {
        self.path.clone()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| StoreError::Unavailable("sqlite connection lock poisoned".into()))
    }

    fn init(&self) -> Result<()> {
        let conn = self.lock()?;

        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS documents (
                collection TEXT NOT NULL,
                id TEXT NOT NULL,
                data TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                PRIMARY KEY (collection, id)
            );

            CREATE INDEX IF NOT EXISTS idx_documents_collection ON documents(collection);
            ",
        )?;

        // Migration: stores created before updates were tracked lack updated_at
        let has_updated_at: bool = conn
            .query_row(
                "SELECT COUNT(*) > 0 FROM pragma_table_info('documents') WHERE name = 'updated_at'",
                [],
                |row| row.get(0),
            )
            .unwrap_or(false);

        if !has_updated_at {
            conn.execute("ALTER TABLE documents ADD COLUMN updated_at INTEGER", [])?;
            conn.execute("UPDATE documents SET updated_at = created_at", [])?;
            tracing::info!("migration: added updated_at column to documents");
        }

        Ok(())
    }

    fn row_to_document(row: &rusqlite::Row) -> rusqlite::Result<(String, String)> {
        Ok((row.get(0)?, row.get(1)?))
    }

    fn decode(collection: &str, id: String, data: &str) -> Result<Document> {
        let fields: Map<String, Value> =
            serde_json::from_str(data).map_err(|source| StoreError::Decode {
                collection: collection.to_string(),
                id: id.clone(),
                source,
            })?;
        Ok(Document { id, fields })
    }

    fn encode(fields: &Map<String, Value>) -> Result<String> {
        serde_json::to_string(fields).map_err(StoreError::Encode)
    }

    fn now() -> i64 {
        chrono::Utc::now().timestamp_millis()
    }
}

fn json_path(field: &str) -> String {
    format!("$.\"{}\"", field.replace('"', "\\\""))
}

/// SQL condition for one filter, pushing its parameters.
///
/// `json_type` guards keep comparisons within one kind of value, and a
/// missing field yields NULL so the row never matches.
fn filter_sql(filter: &Filter, params: &mut Vec<SqlValue>) -> String {
    let path = json_path(&filter.field);
    let op = filter.op.as_sql();
    // Incomparable kinds only ever match on equality
    let equality_like = matches!(filter.op, Op::Eq | Op::Le | Op::Ge);

    match &filter.value {
        Value::Null => {
            if !equality_like {
                return "0".to_string();
            }
            params.push(SqlValue::Text(path));
            "json_type(data, ?) = 'null'".to_string()
        }
        Value::Bool(b) => {
            params.push(SqlValue::Text(path.clone()));
            params.push(SqlValue::Text(path));
            params.push(SqlValue::Integer(i64::from(*b)));
            format!("(json_type(data, ?) IN ('true', 'false') AND json_extract(data, ?) {} ?)", op)
        }
        Value::Number(n) => {
            params.push(SqlValue::Text(path.clone()));
            params.push(SqlValue::Text(path));
            match n.as_i64() {
                Some(i) => params.push(SqlValue::Integer(i)),
                None => params.push(SqlValue::Real(n.as_f64().unwrap_or(f64::NAN))),
            }
            format!("(json_type(data, ?) IN ('integer', 'real') AND json_extract(data, ?) {} ?)", op)
        }
        Value::String(s) => {
            params.push(SqlValue::Text(path.clone()));
            params.push(SqlValue::Text(path));
            params.push(SqlValue::Text(s.clone()));
            format!("(json_type(data, ?) = 'text' AND json_extract(data, ?) {} ?)", op)
        }
        Value::Array(_) | Value::Object(_) => {
            if !equality_like {
                return "0".to_string();
            }
            params.push(SqlValue::Text(path.clone()));
            params.push(SqlValue::Text(path));
            params.push(SqlValue::Text(filter.value.to_string()));
            "(json_type(data, ?) IN ('array', 'object') AND json(json_extract(data, ?)) = json(?))"
                .to_string()
        }
    }
}

fn compile(query: &Query) -> (String, Vec<SqlValue>) {
    let mut params: Vec<SqlValue> = vec![SqlValue::Text(query.collection.clone())];
    let mut conditions = vec!["collection = ?".to_string()];

    for filter in &query.filters {
        conditions.push(filter_sql(filter, &mut params));
    }
    for order in &query.order_by {
        params.push(SqlValue::Text(json_path(&order.field)));
        conditions.push("json_type(data, ?) IS NOT NULL".to_string());
    }

    let mut order_terms = Vec::new();
    for order in &query.order_by {
        let dir = match order.direction {
            Direction::Ascending => "ASC",
            Direction::Descending => "DESC",
        };
        let path = json_path(&order.field);
        params.push(SqlValue::Text(path.clone()));
        order_terms.push(format!(
            "CASE json_type(data, ?) WHEN 'null' THEN 0 WHEN 'true' THEN 1 WHEN 'false' THEN 1 \
             WHEN 'integer' THEN 2 WHEN 'real' THEN 2 WHEN 'text' THEN 3 WHEN 'array' THEN 4 ELSE 5 END {}",
            dir
        ));
        params.push(SqlValue::Text(path));
        order_terms.push(format!("json_extract(data, ?) {}", dir));
    }
    order_terms.push("id ASC".to_string());

    let mut sql = format!(
        "SELECT id, data FROM documents WHERE {} ORDER BY {}",
        conditions.join(" AND "),
        order_terms.join(", ")
    );
    if let Some(limit) = query.limit {
        sql.push_str(&format!(" LIMIT {}", limit));
    }
    (sql, params)
}

#[async_trait]
impl DocumentStore for SqliteStore {
    async fn get(&self, collection: &str, id: &str) -> Result<Option<Document>> {
        let conn = self.lock()?;
        let row = conn
            .query_row(
                "SELECT id, data FROM documents WHERE collection = ?1 AND id = ?2",
                params![collection, id],
                Self::row_to_document,
            )
            .optional()?;
        row.map(|(id, data)| Self::decode(collection, id, &data)).transpose()
    }

    async fn query(&self, query: &Query) -> Result<Vec<Document>> {
        query.validate()?;
        let (sql, params) = compile(query);
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params_from_iter(params), Self::row_to_document)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        tracing::debug!(collection = %query.collection, results = rows.len(), "sqlite query");
        rows.into_iter()
            .map(|(id, data)| Self::decode(&query.collection, id, &data))
            .collect()
    }

    async fn create(&self, collection: &str, id: Option<&str>, fields: Map<String, Value>) -> Result<String> {
        let id = id.map(str::to_string).unwrap_or_else(new_document_id);
        let data = Self::encode(&fields)?;
        let now = Self::now();
        let conn = self.lock()?;

        let exists: bool = conn.query_row(
            "SELECT COUNT(*) > 0 FROM documents WHERE collection = ?1 AND id = ?2",
            params![collection, id],
            |row| row.get(0),
        )?;
        if exists {
            return Err(StoreError::Remote {
                status: 409,
                message: format!("{}/{} already exists", collection, id),
            });
        }

        conn.execute(
            "INSERT INTO documents (collection, id, data, created_at, updated_at) VALUES (?1, ?2, ?3, ?4, ?4)",
            params![collection, id, data, now],
        )?;
        Ok(id)
    }

    async fn set(&self, collection: &str, id: &str, fields: Map<String, Value>) -> Result<()> {
        let data = Self::encode(&fields)?;
        let now = Self::now();
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO documents (collection, id, data, created_at, updated_at) VALUES (?1, ?2, ?3, ?4, ?4)
             ON CONFLICT(collection, id) DO UPDATE SET data = excluded.data, updated_at = excluded.updated_at",
            params![collection, id, data, now],
        )?;
        Ok(())
    }

    async fn update(&self, collection: &str, id: &str, fields: Map<String, Value>) -> Result<()> {
        let conn = self.lock()?;
        let existing: Option<String> = conn
            .query_row(
                "SELECT data FROM documents WHERE collection = ?1 AND id = ?2",
                params![collection, id],
                |row| row.get(0),
            )
            .optional()?;
        let existing = existing.ok_or_else(|| StoreError::not_found(collection, id))?;

        let mut merged = Self::decode(collection, id.to_string(), &existing)?.fields;
        for (k, v) in fields {
            merged.insert(k, v);
        }
        conn.execute(
            "UPDATE documents SET data = ?3, updated_at = ?4 WHERE collection = ?1 AND id = ?2",
            params![collection, id, Self::encode(&merged)?, Self::now()],
        )?;
        Ok(())
    }

    async fn delete(&self, collection: &str, id: &str) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "DELETE FROM documents WHERE collection = ?1 AND id = ?2",
            params![collection, id],
        )?;
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "sqlite"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fields(v: Value) -> Map<String, Value> {
        v.as_object().cloned().unwrap()
    }

    async fn seeded() -> SqliteStore {
        let store = SqliteStore::in_memory().unwrap();
        let rows = [
            ("a", json!({"siteId": "s1", "timestamp": 100, "resolved": false, "description": "Mouse broken"})),
            ("b", json!({"siteId": "s1", "timestamp": 300, "resolved": true, "description": "Printer jam"})),
            ("c", json!({"siteId": "s2", "timestamp": 200, "resolved": false, "description": "No paper"})),
            ("d", json!({"siteId": "s1", "timestamp": "300", "resolved": false})),
            ("e", json!({"siteId": "s1"})),
        ];
        for (id, body) in rows {
            store.set("Issues", id, fields(body)).await.unwrap();
        }
        store
    }

    fn ids(docs: &[Document]) -> Vec<&str> {
        docs.iter().map(|d| d.id.as_str()).collect()
    }

    #[tokio::test]
    async fn test_equality_range_and_order() {
        let store = seeded().await;
        let q = Query::collection("Issues")
            .where_eq("siteId", "s1")
            .where_ge("timestamp", 100)
            .where_le("timestamp", 300)
            .order_by("timestamp", Direction::Descending);
        let docs = store.query(&q).await.unwrap();
        // "d" holds a string timestamp and "e" none: neither matches
        assert_eq!(ids(&docs), vec!["b", "a"]);
    }

    #[tokio::test]
    async fn test_bool_filter() {
        let store = seeded().await;
        let q = Query::collection("Issues")
            .where_eq("resolved", false)
            .order_by("timestamp", Direction::Ascending);
        let docs = store.query(&q).await.unwrap();
        // Mixed kinds sort numbers before strings
        assert_eq!(ids(&docs), vec!["a", "c", "d"]);
    }

    #[tokio::test]
    async fn test_matches_in_memory_evaluation() {
        let store = seeded().await;
        let q = Query::collection("Issues").order_by("timestamp", Direction::Descending).limit(2);
        let from_sql = store.query(&q).await.unwrap();

        let all = store.query(&Query::collection("Issues")).await.unwrap();
        let in_memory = q.apply(all);
        assert_eq!(ids(&from_sql), ids(&in_memory));
    }

    #[tokio::test]
    async fn test_update_merges_and_missing_is_not_found() {
        let store = seeded().await;
        store
            .update("Issues", "a", fields(json!({"resolved": true, "ticket": "INC-1"})))
            .await
            .unwrap();
        let doc = store.get("Issues", "a").await.unwrap().unwrap();
        assert_eq!(doc.fields["resolved"], json!(true));
        assert_eq!(doc.fields["description"], json!("Mouse broken"));

        let err = store.update("Issues", "zz", Map::new()).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_create_generates_id_and_rejects_duplicates() {
        let store = SqliteStore::in_memory().unwrap();
        let id = store.create("Sites", None, fields(json!({"name": "Lab"}))).await.unwrap();
        assert!(!id.is_empty());
        let err = store.create("Sites", Some(&id), Map::new()).await.unwrap_err();
        assert!(matches!(err, StoreError::Remote { status: 409, .. }));
    }

    #[tokio::test]
    async fn test_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sites.db");
        {
            let store = SqliteStore::new(&path).unwrap();
            store.set("Sites", "s1", fields(json!({"name": "Lab"}))).await.unwrap();
        }
        let store = SqliteStore::new(&path).unwrap();
        let doc = store.get("Sites", "s1").await.unwrap().unwrap();
        assert_eq!(doc.fields["name"], json!("Lab"));
    }

    #[tokio::test]
    async fn test_invalid_query_rejected_before_sql() {
        let store = SqliteStore::in_memory().unwrap();
        let q = Query::collection("Issues").where_ge("a", 1).where_ge("b", 1);
        assert!(matches!(store.query(&q).await, Err(StoreError::InvalidQuery(_))));
    }
}
