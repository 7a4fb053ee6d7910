//! Error types shared across the crate.

use thiserror::Error;

pub type Result<T, E = StoreError> = std::result::Result<T, E>;

/// Failures raised by document stores and the managers built on them.
///
/// `Unavailable`, `MissingIndex` and `Remote` are the remote query failures:
/// they come from the backing service and are always handed back to the
/// caller untouched.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("document store unavailable: {0}")]
    Unavailable(String),

    #[error("query on '{collection}' needs a composite index on ({})", fields.join(", "))]
    MissingIndex {
        collection: String,
        fields: Vec<String>,
        /// Console link or provider message describing how to create it
        hint: Option<String>,
    },

    #[error("remote store returned {status}: {message}")]
    Remote { status: u16, message: String },

    #[error("invalid query: {0}")]
    InvalidQuery(String),

    /// A record failed validation before it was written.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("invalid date range: start {start} is after end {end}")]
    InvalidRange { start: String, end: String },

    #[error("{collection}/{id} not found")]
    NotFound { collection: String, id: String },

    #[error("failed to decode {collection}/{id}: {source}")]
    Decode {
        collection: String,
        id: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to encode document: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

impl StoreError {
    pub fn not_found(collection: &str, id: &str) -> Self {
        StoreError::NotFound {
            collection: collection.to_string(),
            id: id.to_string(),
        }
    }

    /// True for failures reported by the backing service rather than by
    /// local validation or decoding.
    pub fn is_remote_query_error(&self) -> bool {
        matches!(
            self,
            StoreError::Unavailable(_) | StoreError::MissingIndex { .. } | StoreError::Remote { .. }
        )
    }
}

/// Failures from the identity provider.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("no account exists for that email")]
    EmailNotFound,

    #[error("incorrect email or password")]
    InvalidCredentials,

    #[error("an account already exists for that email")]
    EmailExists,

    #[error("this account has been disabled")]
    UserDisabled,

    #[error("no API key configured for the identity provider")]
    MissingApiKey,

    #[error("identity provider rejected the request: {0}")]
    Provider(String),

    #[error("identity provider unreachable: {0}")]
    Unavailable(String),
}

impl AuthError {
    /// Map an identity toolkit error code (`"INVALID_PASSWORD"`,
    /// `"EMAIL_EXISTS : ..."`) to a variant.
    pub fn from_code(code: &str) -> Self {
        let head = code.split(':').next().unwrap_or(code).trim();
        match head {
            "EMAIL_NOT_FOUND" => AuthError::EmailNotFound,
            "INVALID_PASSWORD" | "INVALID_LOGIN_CREDENTIALS" => AuthError::InvalidCredentials,
            "EMAIL_EXISTS" => AuthError::EmailExists,
            "USER_DISABLED" => AuthError::UserDisabled,
            _ => AuthError::Provider(code.to_string()),
        }
    }
}

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("failed to serialize settings: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("failed to write settings to {path}: {source}")]
    Write {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("unknown backend '{0}' (expected memory, sqlite or firestore)")]
    UnknownBackend(String),

    #[error("firestore backend needs a project id")]
    MissingProjectId,

    #[error("unknown firestore timestamp encoding '{0}' (expected millis or timestamp)")]
    UnknownTimestampEncoding(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remote_query_errors() {
        assert!(StoreError::Unavailable("dns".into()).is_remote_query_error());
        assert!(StoreError::MissingIndex {
            collection: "Issues".into(),
            fields: vec!["siteId".into(), "timestamp".into()],
            hint: None,
        }
        .is_remote_query_error());
        assert!(!StoreError::not_found("Sites", "a").is_remote_query_error());
        assert!(!StoreError::InvalidQuery("x".into()).is_remote_query_error());
        assert!(!StoreError::InvalidInput("x".into()).is_remote_query_error());
    }

    #[test]
    fn test_missing_index_message_lists_fields() {
        let err = StoreError::MissingIndex {
            collection: "Issues".into(),
            fields: vec!["siteId".into(), "timestamp".into()],
            hint: None,
        };
        assert_eq!(
            err.to_string(),
            "query on 'Issues' needs a composite index on (siteId, timestamp)"
        );
    }

    #[test]
    fn test_auth_error_codes() {
        assert!(matches!(AuthError::from_code("EMAIL_NOT_FOUND"), AuthError::EmailNotFound));
        assert!(matches!(
            AuthError::from_code("INVALID_LOGIN_CREDENTIALS"),
            AuthError::InvalidCredentials
        ));
        assert!(matches!(
            AuthError::from_code("EMAIL_EXISTS : The email address is already in use"),
            AuthError::EmailExists
        ));
        assert!(matches!(AuthError::from_code("TOO_MANY_ATTEMPTS_TRY_LATER"), AuthError::Provider(_)));
    }
}
