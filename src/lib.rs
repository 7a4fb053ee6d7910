//! Facilities data layer for university computer sites.
//!
//! Entities live in a document store ([`db::DocumentStore`]) behind one of
//! three backends. Managers turn optional criteria (a foreign-key filter, a
//! date range, a sort flag) into one of four fixed query shapes and decode
//! the results into typed entities.

pub mod auth;
pub mod db;
pub mod error;
pub mod logging;
pub mod managers;
pub mod search;
pub mod settings;
pub mod utils;

pub use db::{open_store, open_store_with_token, DocumentStore};
pub use error::{AuthError, Result, SettingsError, StoreError};
pub use managers::Managers;
pub use settings::Settings;
