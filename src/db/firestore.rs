//! Cloud Firestore backend over the v1 REST API.
//!
//! Documents are converted between plain JSON and Firestore's typed value
//! encoding. Timestamps written by other clients (`timestampValue`) decode
//! to epoch milliseconds, matching how entities store time. With
//! [`TimestampEncoding::Timestamp`] the time fields are sent back as
//! `timestampValue` too, so range filters compare against native timestamps.

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::{Client, Method, RequestBuilder, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::sync::RwLock;
use std::time::Duration;

use super::models::fields;
use super::query::{Direction, Query};
use super::{new_document_id, Document, DocumentStore};
use crate::error::{Result, StoreError};

const DEFAULT_HOST: &str = "https://firestore.googleapis.com";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Wire type for the time fields in [`fields::TIME_FIELDS`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimestampEncoding {
    /// `integerValue` epoch milliseconds
    #[default]
    Millis,
    /// `timestampValue` RFC 3339, as the mobile clients write them
    Timestamp,
}

impl TimestampEncoding {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "millis" | "integer" => Some(TimestampEncoding::Millis),
            "timestamp" | "native" => Some(TimestampEncoding::Timestamp),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TimestampEncoding::Millis => "millis",
            TimestampEncoding::Timestamp => "timestamp",
        }
    }

    /// Encode `value` stored under `field`.
    pub fn encode(&self, field: &str, value: &Value) -> Value {
        if *self == TimestampEncoding::Timestamp && fields::TIME_FIELDS.contains(&field) {
            if let Some(at) = value.as_i64().and_then(DateTime::<Utc>::from_timestamp_millis) {
                return json!({ "timestampValue": at.to_rfc3339_opts(SecondsFormat::Millis, true) });
            }
        }
        encode_value(value)
    }

    pub fn encode_fields(&self, fields: &Map<String, Value>) -> Map<String, Value> {
        fields.iter().map(|(k, v)| (k.clone(), self.encode(k, v))).collect()
    }
}

pub struct FirestoreStore {
    client: Client,
    /// `.../v1/projects/{project}/databases/{database}/documents`
    documents_url: String,
    api_key: Option<String>,
    id_token: RwLock<Option<String>>,
    timestamps: TimestampEncoding,
}

#[derive(Debug, Deserialize)]
struct RawDocument {
    name: String,
    #[serde(default)]
    fields: Map<String, Value>,
}

#[derive(Debug, Deserialize)]
struct RunQueryItem {
    #[serde(default)]
    document: Option<RawDocument>,
    #[serde(default)]
    error: Option<ErrorBody>,
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    code: u16,
    #[serde(default)]
    message: String,
    #[serde(default)]
    status: String,
}

impl FirestoreStore {
    pub fn new(project_id: &str, database_id: &str) -> Self {
        Self::with_host(DEFAULT_HOST, project_id, database_id)
    }

    /// Point at another host, e.g. `http://localhost:8080` for the emulator.
    pub fn with_host(host: &str, project_id: &str, database_id: &str) -> Self {
        let documents_url = format!(
            "{}/v1/projects/{}/databases/{}/documents",
            host.trim_end_matches('/'),
            project_id,
            if database_id.is_empty() { "(default)" } else { database_id }
        );
        FirestoreStore {
            client: Client::builder()
                .timeout(REQUEST_TIMEOUT)
                .build()
                .unwrap_or_default(),
            documents_url,
            api_key: None,
            id_token: RwLock::new(None),
            timestamps: TimestampEncoding::default(),
        }
    }

    pub fn with_timestamp_encoding(mut self, timestamps: TimestampEncoding) -> Self {
        self.timestamps = timestamps;
        self
    }

    pub fn with_api_key(mut self, api_key: Option<String>) -> Self {
        self.api_key = api_key.filter(|k| !k.is_empty());
        self
    }

    /// Attach (or clear) the signed-in user's ID token for later requests.
    pub fn set_id_token(&self, token: Option<String>) {
        if let Ok(mut guard) = self.id_token.write() {
            *guard = token;
        }
    }

    pub fn documents_url(&self) -> &str {
        &self.documents_url
    }

    fn doc_url(&self, collection: &str, id: &str) -> String {
        format!(
            "{}/{}/{}",
            self.documents_url,
            urlencoding::encode(collection),
            urlencoding::encode(id)
        )
    }

    fn request(&self, method: Method, url: &str) -> RequestBuilder {
        let mut req = self.client.request(method, url);
        if let Some(key) = &self.api_key {
            req = req.query(&[("key", key.as_str())]);
        }
        let token = self.id_token.read().ok().and_then(|t| t.clone());
        if let Some(token) = token {
            req = req.bearer_auth(token);
        }
        req
    }

    async fn send(req: RequestBuilder) -> Result<(StatusCode, String)> {
        let resp = req
            .send()
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        let status = resp.status();
        let body = resp
            .text()
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        Ok((status, body))
    }

    fn parse<T: serde::de::DeserializeOwned>(body: &str) -> Result<T> {
        serde_json::from_str(body).map_err(|e| StoreError::Remote {
            status: 200,
            message: format!("unexpected response body: {}", e),
        })
    }
}

fn document_id(name: &str) -> String {
    name.rsplit('/').next().unwrap_or(name).to_string()
}

fn field_path(field: &str) -> String {
    let simple = field
        .chars()
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && field.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
    if simple {
        field.to_string()
    } else {
        format!("`{}`", field.replace('`', "\\`"))
    }
}

/// Plain JSON to a Firestore `Value`.
pub fn encode_value(value: &Value) -> Value {
    match value {
        Value::Null => json!({ "nullValue": null }),
        Value::Bool(b) => json!({ "booleanValue": b }),
        Value::Number(n) => match n.as_i64() {
            Some(i) => json!({ "integerValue": i.to_string() }),
            None => json!({ "doubleValue": n.as_f64() }),
        },
        Value::String(s) => json!({ "stringValue": s }),
        Value::Array(items) => {
            json!({ "arrayValue": { "values": items.iter().map(encode_value).collect::<Vec<_>>() } })
        }
        Value::Object(map) => json!({ "mapValue": { "fields": encode_fields(map) } }),
    }
}

pub fn encode_fields(fields: &Map<String, Value>) -> Map<String, Value> {
    fields.iter().map(|(k, v)| (k.clone(), encode_value(v))).collect()
}

/// Firestore `Value` to plain JSON. Unknown encodings decode to null.
pub fn decode_value(value: &Value) -> Value {
    let Some(obj) = value.as_object() else {
        return Value::Null;
    };
    let Some((kind, inner)) = obj.iter().next() else {
        return Value::Null;
    };
    match kind.as_str() {
        "nullValue" => Value::Null,
        "booleanValue" => Value::Bool(inner.as_bool().unwrap_or(false)),
        "integerValue" => match inner {
            Value::String(s) => s.parse::<i64>().map(Value::from).unwrap_or(Value::Null),
            Value::Number(n) => Value::Number(n.clone()),
            _ => Value::Null,
        },
        "doubleValue" => match inner {
            Value::Number(n) => Value::Number(n.clone()),
            // NaN and Infinity arrive as strings and have no JSON form
            _ => Value::Null,
        },
        "timestampValue" => inner
            .as_str()
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| Value::from(dt.timestamp_millis()))
            .unwrap_or(Value::Null),
        "stringValue" | "referenceValue" | "bytesValue" => inner.clone(),
        "geoPointValue" => inner.clone(),
        "arrayValue" => Value::Array(
            inner
                .get("values")
                .and_then(Value::as_array)
                .map(|items| items.iter().map(decode_value).collect())
                .unwrap_or_default(),
        ),
        "mapValue" => Value::Object(
            inner
                .get("fields")
                .and_then(Value::as_object)
                .map(decode_fields)
                .unwrap_or_default(),
        ),
        _ => Value::Null,
    }
}

pub fn decode_fields(fields: &Map<String, Value>) -> Map<String, Value> {
    fields.iter().map(|(k, v)| (k.clone(), decode_value(v))).collect()
}

/// The `structuredQuery` body for `documents:runQuery`.
pub fn structured_query(query: &Query, timestamps: TimestampEncoding) -> Value {
    let mut sq = Map::new();
    sq.insert("from".into(), json!([{ "collectionId": query.collection }]));

    let filters: Vec<Value> = query
        .filters
        .iter()
        .map(|f| {
            json!({
                "fieldFilter": {
                    "field": { "fieldPath": field_path(&f.field) },
                    "op": f.op.as_firestore(),
                    "value": timestamps.encode(&f.field, &f.value),
                }
            })
        })
        .collect();
    match filters.len() {
        0 => {}
        1 => {
            sq.insert("where".into(), filters.into_iter().next().unwrap_or(Value::Null));
        }
        _ => {
            sq.insert(
                "where".into(),
                json!({ "compositeFilter": { "op": "AND", "filters": filters } }),
            );
        }
    }

    if !query.order_by.is_empty() {
        let orders: Vec<Value> = query
            .order_by
            .iter()
            .map(|o| {
                json!({
                    "field": { "fieldPath": field_path(&o.field) },
                    "direction": match o.direction {
                        Direction::Ascending => "ASCENDING",
                        Direction::Descending => "DESCENDING",
                    },
                })
            })
            .collect();
        sq.insert("orderBy".into(), Value::Array(orders));
    }
    if let Some(limit) = query.limit {
        sq.insert("limit".into(), json!(limit));
    }

    json!({ "structuredQuery": sq })
}

/// Map a non-success response to a store error.
///
/// A `FAILED_PRECONDITION` that mentions an index is the missing composite
/// index case; its console link becomes the hint.
fn remote_error(status: StatusCode, body: &str, query: Option<&Query>) -> StoreError {
    let parsed = serde_json::from_str::<ErrorEnvelope>(body)
        .map(|e| e.error)
        .or_else(|_| {
            serde_json::from_str::<Vec<ErrorEnvelope>>(body)
                .ok()
                .and_then(|v| v.into_iter().next())
                .map(|e| e.error)
                .ok_or(())
        })
        .ok();

    let (code, message, grpc_status) = match parsed {
        Some(e) => (if e.code == 0 { status.as_u16() } else { e.code }, e.message, e.status),
        None => (status.as_u16(), body.to_string(), String::new()),
    };
    index_error(&grpc_status, &message, query).unwrap_or(StoreError::Remote { status: code, message })
}

fn index_error(grpc_status: &str, message: &str, query: Option<&Query>) -> Option<StoreError> {
    if grpc_status != "FAILED_PRECONDITION" || !message.to_ascii_lowercase().contains("index") {
        return None;
    }
    let hint = message
        .split_whitespace()
        .find(|w| w.starts_with("https://"))
        .map(str::to_string)
        .or_else(|| Some(message.to_string()));
    let (collection, fields) = match query {
        Some(q) => (
            q.collection.clone(),
            q.required_index().map(|i| i.fields).unwrap_or_default(),
        ),
        None => (String::new(), Vec::new()),
    };
    tracing::warn!(collection = %collection, "firestore query needs a composite index");
    Some(StoreError::MissingIndex { collection, fields, hint })
}

#[async_trait]
impl DocumentStore for FirestoreStore {
    async fn get(&self, collection: &str, id: &str) -> Result<Option<Document>> {
        let url = self.doc_url(collection, id);
        let (status, body) = Self::send(self.request(Method::GET, &url)).await?;
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            return Err(remote_error(status, &body, None));
        }
        let raw: RawDocument = Self::parse(&body)?;
        Ok(Some(Document {
            id: document_id(&raw.name),
            fields: decode_fields(&raw.fields),
        }))
    }

    async fn query(&self, query: &Query) -> Result<Vec<Document>> {
        query.validate()?;
        let url = format!("{}:runQuery", self.documents_url);
        let req = self.request(Method::POST, &url).json(&structured_query(query, self.timestamps));
        let (status, body) = Self::send(req).await?;
        if !status.is_success() {
            return Err(remote_error(status, &body, Some(query)));
        }

        let items: Vec<RunQueryItem> = Self::parse(&body)?;
        let mut docs = Vec::with_capacity(items.len());
        for item in items {
            if let Some(err) = item.error {
                return Err(index_error(&err.status, &err.message, Some(query)).unwrap_or(
                    StoreError::Remote { status: err.code, message: err.message },
                ));
            }
            if let Some(raw) = item.document {
                docs.push(Document {
                    id: document_id(&raw.name),
                    fields: decode_fields(&raw.fields),
                });
            }
        }
        tracing::debug!(collection = %query.collection, results = docs.len(), "firestore query");
        Ok(docs)
    }

    async fn create(&self, collection: &str, id: Option<&str>, fields: Map<String, Value>) -> Result<String> {
        let id = id.map(str::to_string).unwrap_or_else(new_document_id);
        let url = format!("{}/{}", self.documents_url, urlencoding::encode(collection));
        let req = self
            .request(Method::POST, &url)
            .query(&[("documentId", id.as_str())])
            .json(&json!({ "fields": self.timestamps.encode_fields(&fields) }));
        let (status, body) = Self::send(req).await?;
        if !status.is_success() {
            return Err(remote_error(status, &body, None));
        }
        Ok(id)
    }

    async fn set(&self, collection: &str, id: &str, fields: Map<String, Value>) -> Result<()> {
        let url = self.doc_url(collection, id);
        let req = self
            .request(Method::PATCH, &url)
            .json(&json!({ "fields": self.timestamps.encode_fields(&fields) }));
        let (status, body) = Self::send(req).await?;
        if !status.is_success() {
            return Err(remote_error(status, &body, None));
        }
        Ok(())
    }

    async fn update(&self, collection: &str, id: &str, fields: Map<String, Value>) -> Result<()> {
        let url = self.doc_url(collection, id);
        let mut params: Vec<(&str, String)> = fields
            .keys()
            .map(|k| ("updateMask.fieldPaths", field_path(k)))
            .collect();
        params.push(("currentDocument.exists", "true".to_string()));
        let req = self
            .request(Method::PATCH, &url)
            .query(&params)
            .json(&json!({ "fields": self.timestamps.encode_fields(&fields) }));
        let (status, body) = Self::send(req).await?;
        if status == StatusCode::NOT_FOUND {
            return Err(StoreError::not_found(collection, id));
        }
        if !status.is_success() {
            return Err(remote_error(status, &body, None));
        }
        Ok(())
    }

    async fn delete(&self, collection: &str, id: &str) -> Result<()> {
        let url = self.doc_url(collection, id);
        let (status, body) = Self::send(self.request(Method::DELETE, &url)).await?;
        if !status.is_success() && status != StatusCode::NOT_FOUND {
            return Err(remote_error(status, &body, None));
        }
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "firestore"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{DateRange, QueryCriteria};
    use chrono::NaiveDate;

    #[test]
    fn test_encode_decode_typed_values() {
        let plain = json!({
            "name": "Lab",
            "count": 12,
            "ratio": 0.5,
            "open": true,
            "room": null,
            "tags": ["a", "b"],
            "nested": {"x": 1}
        });
        let encoded = encode_fields(plain.as_object().unwrap());
        assert_eq!(encoded["count"], json!({"integerValue": "12"}));
        assert_eq!(encoded["ratio"], json!({"doubleValue": 0.5}));
        assert_eq!(encoded["tags"]["arrayValue"]["values"][1], json!({"stringValue": "b"}));

        let decoded = decode_fields(&encoded);
        assert_eq!(Value::Object(decoded), plain);
    }

    #[test]
    fn test_timestamp_value_decodes_to_millis() {
        let v = json!({"timestampValue": "2024-03-01T12:00:00.250Z"});
        assert_eq!(decode_value(&v), json!(1_709_294_400_250i64));
    }

    #[test]
    fn test_structured_query_shape() {
        let q = Query::collection("Issues")
            .where_eq("siteId", "s1")
            .where_ge("timestamp", 10)
            .order_by("timestamp", Direction::Descending)
            .limit(5);
        let body = structured_query(&q, TimestampEncoding::Millis);
        let sq = &body["structuredQuery"];
        assert_eq!(sq["from"][0]["collectionId"], json!("Issues"));
        assert_eq!(sq["where"]["compositeFilter"]["op"], json!("AND"));
        assert_eq!(
            sq["where"]["compositeFilter"]["filters"][1]["fieldFilter"]["op"],
            json!("GREATER_THAN_OR_EQUAL")
        );
        assert_eq!(sq["orderBy"][0]["direction"], json!("DESCENDING"));
        assert_eq!(sq["limit"], json!(5));
    }

    #[test]
    fn test_range_bounds_as_native_timestamps() {
        let range = DateRange::day(NaiveDate::from_ymd_opt(2024, 9, 1).unwrap()).unwrap();
        let q = QueryCriteria::new()
            .equal("siteId", "s1")
            .within(Some(range))
            .compose("HourlyCleanings", "timestamp", true);

        let native = structured_query(&q, TimestampEncoding::Timestamp);
        let filters = &native["structuredQuery"]["where"]["compositeFilter"]["filters"];
        assert_eq!(filters[0]["fieldFilter"]["value"], json!({"stringValue": "s1"}));
        assert_eq!(
            filters[1]["fieldFilter"]["value"],
            json!({"timestampValue": "2024-09-01T00:00:00.000Z"})
        );
        assert_eq!(
            filters[2]["fieldFilter"]["value"],
            json!({"timestampValue": "2024-09-01T23:59:59.999Z"})
        );

        let millis = structured_query(&q, TimestampEncoding::Millis);
        assert_eq!(
            millis["structuredQuery"]["where"]["compositeFilter"]["filters"][1]["fieldFilter"]["value"],
            json!({"integerValue": range.start_millis().to_string()})
        );
    }

    #[test]
    fn test_native_timestamps_round_trip_on_write() {
        let plain = json!({"timestamp": 1_709_294_400_250i64, "lastCleaned": null, "count": 3});
        let encoded = TimestampEncoding::Timestamp.encode_fields(plain.as_object().unwrap());
        assert_eq!(encoded["timestamp"], json!({"timestampValue": "2024-03-01T12:00:00.250Z"}));
        assert_eq!(encoded["lastCleaned"], json!({"nullValue": null}));
        assert_eq!(encoded["count"], json!({"integerValue": "3"}));
        assert_eq!(Value::Object(decode_fields(&encoded)), plain);

        assert_eq!(TimestampEncoding::from_str("Timestamp"), Some(TimestampEncoding::Timestamp));
        assert_eq!(TimestampEncoding::from_str("epoch"), None);
    }

    #[test]
    fn test_single_filter_is_not_composite() {
        let q = Query::collection("Sites").where_eq("buildingId", "b1");
        let body = structured_query(&q, TimestampEncoding::Millis);
        assert!(body["structuredQuery"]["where"]["fieldFilter"].is_object());
        assert!(body["structuredQuery"].get("orderBy").is_none());
    }

    #[test]
    fn test_missing_index_error_is_recognised() {
        let q = Query::collection("Issues")
            .where_eq("siteId", "s1")
            .order_by("timestamp", Direction::Descending);
        let body = r#"[{"error": {"code": 400, "status": "FAILED_PRECONDITION",
            "message": "The query requires an index. You can create it here: https://console.firebase.google.com/project/x/indexes?create=abc"}}]"#;
        match remote_error(StatusCode::BAD_REQUEST, body, Some(&q)) {
            StoreError::MissingIndex { collection, fields, hint } => {
                assert_eq!(collection, "Issues");
                assert_eq!(fields, vec!["siteId", "timestamp"]);
                assert!(hint.unwrap().starts_with("https://console.firebase.google.com"));
            }
            other => panic!("expected MissingIndex, got {:?}", other),
        }
    }

    #[test]
    fn test_other_errors_keep_status() {
        let body = r#"{"error": {"code": 403, "status": "PERMISSION_DENIED", "message": "Missing or insufficient permissions."}}"#;
        match remote_error(StatusCode::FORBIDDEN, body, None) {
            StoreError::Remote { status, message } => {
                assert_eq!(status, 403);
                assert!(message.contains("permissions"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_urls_and_ids() {
        let store = FirestoreStore::with_host("http://localhost:8080/", "demo", "");
        assert_eq!(
            store.documents_url(),
            "http://localhost:8080/v1/projects/demo/databases/(default)/documents"
        );
        assert_eq!(document_id("projects/p/databases/d/documents/Sites/abc"), "abc");
        assert_eq!(field_path("siteId"), "siteId");
        assert_eq!(field_path("has space"), "`has space`");
    }

    #[tokio::test]
    async fn test_unreachable_host_is_unavailable() {
        // Port 9 (discard) on localhost is closed in test environments
        let store = FirestoreStore::with_host("http://127.0.0.1:9", "demo", "");
        let err = store.query(&Query::collection("Sites")).await.unwrap_err();
        assert!(matches!(err, StoreError::Unavailable(_)));
        assert!(err.is_remote_query_error());
    }
}
