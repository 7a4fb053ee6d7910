//! Application settings storage
//!
//! Backend selection and credentials live in a JSON file in the app data
//! directory. Environment variables override the file.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::db::TimestampEncoding;
use crate::error::SettingsError;
use crate::logging::LogFormat;

const APP_DIR: &str = "sitekeeper";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    Memory,
    #[default]
    Sqlite,
    Firestore,
}

impl Backend {
    pub fn from_str(s: &str) -> Result<Self, SettingsError> {
        match s.trim().to_ascii_lowercase().as_str() {
            "memory" | "mem" => Ok(Backend::Memory),
            "sqlite" => Ok(Backend::Sqlite),
            "firestore" => Ok(Backend::Firestore),
            other => Err(SettingsError::UnknownBackend(other.to_string())),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Backend::Memory => "memory",
            Backend::Sqlite => "sqlite",
            Backend::Firestore => "firestore",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub backend: Backend,
    /// SQLite file; defaults to `sitekeeper.db` next to the settings file
    #[serde(default)]
    pub db_path: Option<String>,
    #[serde(default)]
    pub firestore_project_id: Option<String>,
    #[serde(default = "default_database")]
    pub firestore_database: String,
    /// e.g. `http://localhost:8080`
    #[serde(default)]
    pub firestore_emulator_host: Option<String>,
    /// `timestamp` when the collections hold native Firestore timestamps
    #[serde(default)]
    pub firestore_timestamps: TimestampEncoding,
    /// Web API key for Firestore REST and the identity toolkit
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub log_format: LogFormat,
    #[serde(default = "default_bind")]
    pub bind: String,
}

fn default_database() -> String {
    "(default)".to_string()
}

fn default_bind() -> String {
    "127.0.0.1:3750".to_string()
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            backend: Backend::default(),
            db_path: None,
            firestore_project_id: None,
            firestore_database: default_database(),
            firestore_emulator_host: None,
            firestore_timestamps: TimestampEncoding::default(),
            api_key: None,
            log_format: LogFormat::default(),
            bind: default_bind(),
        }
    }
}

impl Settings {
    /// `<data dir>/sitekeeper/settings.json`
    pub fn default_path() -> PathBuf {
        data_dir().join("settings.json")
    }

    /// Load settings from disk, falling back to defaults when the file is
    /// missing or unreadable.
    pub fn load(path: &Path) -> Self {
        match fs::read_to_string(path) {
            Ok(content) => match serde_json::from_str(&content) {
                Ok(settings) => settings,
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "ignoring corrupt settings file");
                    Settings::default()
                }
            },
            Err(_) => Settings::default(),
        }
    }

    /// File settings with environment overrides applied.
    pub fn load_with_env(path: &Path) -> Result<Self, SettingsError> {
        let mut settings = Self::load(path);
        settings.apply_env(|key| std::env::var(key).ok())?;
        Ok(settings)
    }

    pub fn save(&self, path: &Path) -> Result<(), SettingsError> {
        let content = serde_json::to_string_pretty(self)?;
        let write_err = |source| SettingsError::Write {
            path: path.display().to_string(),
            source,
        };

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(write_err)?;
        }
        fs::write(path, content).map_err(write_err)?;
        Ok(())
    }

    /// Apply overrides from `lookup` (normally `std::env::var`). Empty values
    /// are ignored.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), SettingsError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(backend) = get("SITEKEEPER_BACKEND") {
            self.backend = Backend::from_str(&backend)?;
        }
        if let Some(path) = get("SITEKEEPER_DB") {
            self.db_path = Some(path);
        }
        if let Some(bind) = get("SITEKEEPER_BIND") {
            self.bind = bind;
        }
        if let Some(format) = get("SITEKEEPER_LOG_FORMAT").and_then(|f| LogFormat::from_str(&f)) {
            self.log_format = format;
        }
        if let Some(project) = get("FIRESTORE_PROJECT_ID") {
            self.firestore_project_id = Some(project);
        }
        if let Some(host) = get("FIRESTORE_EMULATOR_HOST") {
            self.firestore_emulator_host = Some(host);
        }
        if let Some(encoding) = get("FIRESTORE_TIMESTAMPS") {
            self.firestore_timestamps = TimestampEncoding::from_str(&encoding)
                .ok_or(SettingsError::UnknownTimestampEncoding(encoding))?;
        }
        if let Some(key) = get("FIREBASE_API_KEY") {
            self.api_key = Some(key);
        }
        Ok(())
    }

    /// Check the selected backend has what it needs.
    pub fn validate(&self) -> Result<(), SettingsError> {
        if self.backend == Backend::Firestore
            && self.firestore_project_id.as_deref().map_or(true, str::is_empty)
        {
            return Err(SettingsError::MissingProjectId);
        }
        Ok(())
    }

    pub fn resolved_db_path(&self) -> PathBuf {
        match &self.db_path {
            Some(p) if !p.is_empty() => PathBuf::from(p),
            _ => data_dir().join("sitekeeper.db"),
        }
    }

    /// First and last four characters of the API key.
    pub fn masked_api_key(&self) -> Option<String> {
        self.api_key.as_ref().map(|key| {
            if key.len() > 12 && key.is_ascii() {
                format!("{}...{}", &key[..4], &key[key.len() - 4..])
            } else {
                "****".to_string()
            }
        })
    }
}

fn data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_DIR)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::TempDir;

    #[test]
    fn test_missing_or_corrupt_file_gives_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("settings.json");
        let settings = Settings::load(&path);
        assert_eq!(settings.backend, Backend::Sqlite);
        assert_eq!(settings.firestore_database, "(default)");

        fs::write(&path, "{ not json").unwrap();
        assert_eq!(Settings::load(&path).bind, "127.0.0.1:3750");
    }

    #[test]
    fn test_save_and_reload() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("settings.json");
        let settings = Settings {
            backend: Backend::Firestore,
            firestore_project_id: Some("campus-sites".into()),
            log_format: LogFormat::Json,
            ..Default::default()
        };
        settings.save(&path).unwrap();

        let loaded = Settings::load(&path);
        assert_eq!(loaded.backend, Backend::Firestore);
        assert_eq!(loaded.firestore_project_id.as_deref(), Some("campus-sites"));
        assert_eq!(loaded.log_format, LogFormat::Json);
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("settings.json");
        fs::write(&path, r#"{"backend": "memory"}"#).unwrap();
        let loaded = Settings::load(&path);
        assert_eq!(loaded.backend, Backend::Memory);
        assert_eq!(loaded.firestore_database, "(default)");
        assert_eq!(loaded.firestore_timestamps, TimestampEncoding::Millis);
    }

    #[test]
    fn test_timestamp_encoding_from_file_and_env() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("settings.json");
        fs::write(&path, r#"{"backend": "firestore", "firestore_timestamps": "timestamp"}"#).unwrap();
        assert_eq!(Settings::load(&path).firestore_timestamps, TimestampEncoding::Timestamp);

        let mut settings = Settings::default();
        settings
            .apply_env(|k| (k == "FIRESTORE_TIMESTAMPS").then(|| "native".to_string()))
            .unwrap();
        assert_eq!(settings.firestore_timestamps, TimestampEncoding::Timestamp);

        let err = settings
            .apply_env(|k| (k == "FIRESTORE_TIMESTAMPS").then(|| "epoch".to_string()))
            .unwrap_err();
        assert!(matches!(err, SettingsError::UnknownTimestampEncoding(_)));
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("SITEKEEPER_BACKEND", "firestore"),
            ("FIRESTORE_PROJECT_ID", "campus-sites"),
            ("FIREBASE_API_KEY", "AIzaSyExampleKey123456"),
            ("SITEKEEPER_DB", ""),
        ]);
        let mut settings = Settings::default();
        settings
            .apply_env(|k| env.get(k).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(settings.backend, Backend::Firestore);
        assert_eq!(settings.db_path, None);
        assert!(settings.validate().is_ok());
        assert_eq!(settings.masked_api_key().as_deref(), Some("AIza...3456"));

        let mut bad = Settings::default();
        let err = bad
            .apply_env(|k| (k == "SITEKEEPER_BACKEND").then(|| "mongo".to_string()))
            .unwrap_err();
        assert!(matches!(err, SettingsError::UnknownBackend(_)));
    }

    #[test]
    fn test_firestore_needs_project() {
        let settings = Settings { backend: Backend::Firestore, ..Default::default() };
        assert!(matches!(settings.validate(), Err(SettingsError::MissingProjectId)));
    }
}
