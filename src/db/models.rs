use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Result, StoreError};

use super::Document;

/// A record type stored one-to-one in a collection.
pub trait Entity: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    const COLLECTION: &'static str;

    fn id(&self) -> &str;
    fn set_id(&mut self, id: String);

    /// Stored fields. The id lives in the document name, not the body.
    fn to_fields(&self) -> Result<Map<String, Value>> {
        match serde_json::to_value(self).map_err(StoreError::Encode)? {
            Value::Object(mut map) => {
                map.remove("id");
                Ok(map)
            }
            other => Err(StoreError::Encode(serde::ser::Error::custom(format!(
                "{} did not serialize to an object: {}",
                Self::COLLECTION,
                other
            )))),
        }
    }

    fn from_document(doc: Document) -> Result<Self> {
        let Document { id, mut fields } = doc;
        fields.insert("id".to_string(), Value::String(id.clone()));
        serde_json::from_value(Value::Object(fields)).map_err(|source| StoreError::Decode {
            collection: Self::COLLECTION.to_string(),
            id,
            source,
        })
    }
}

macro_rules! entity {
    ($ty:ty, $collection:literal) => {
        impl Entity for $ty {
            const COLLECTION: &'static str = $collection;

            fn id(&self) -> &str {
                &self.id
            }

            fn set_id(&mut self, id: String) {
                self.id = id;
            }
        }
    };
}

// Field names as stored; managers build queries from these.
pub mod fields {
    pub const NAME: &str = "name";
    pub const BUILDING_ID: &str = "buildingId";
    pub const SITE_ID: &str = "siteId";
    pub const USER_ID: &str = "userId";
    pub const SUPPLY_TYPE_ID: &str = "supplyTypeId";
    pub const TIMESTAMP: &str = "timestamp";
    pub const RESOLVED: &str = "resolved";
    pub const FULFILLED: &str = "fulfilled";
    pub const EMAIL: &str = "email";

    /// Fields holding a point in time, stored as epoch milliseconds
    pub const TIME_FIELDS: &[&str] = &[TIMESTAMP, "lastCleaned", "lastUpdated", "fulfilledAt", "createdAt", "lastSignIn"];
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Building {
    #[serde(default)]
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub abbreviation: String,
}

entity!(Building, "Buildings");

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub enum SiteType {
    #[default]
    ComputerLab,
    Classroom,
    Library,
    Office,
    Other,
}

impl SiteType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SiteType::ComputerLab => "computerLab",
            SiteType::Classroom => "classroom",
            SiteType::Library => "library",
            SiteType::Office => "office",
            SiteType::Other => "other",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Site {
    #[serde(default)]
    pub id: String,
    pub name: String,
    pub building_id: String,
    #[serde(default)]
    pub site_type: SiteType,
    #[serde(default)]
    pub room: Option<String>,
    #[serde(default)]
    pub has_clock: bool,
    #[serde(default)]
    pub has_inventory: bool,
    #[serde(default)]
    pub has_printer: bool,
}

entity!(Site, "Sites");

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Os {
    Windows,
    Mac,
    Linux,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Computer {
    #[serde(default)]
    pub id: String,
    pub site_id: String,
    pub name: String,
    pub os: Os,
    #[serde(default)]
    pub section: Option<String>,
    #[serde(default, with = "chrono::serde::ts_milliseconds_option")]
    pub last_cleaned: Option<DateTime<Utc>>,
}

entity!(Computer, "Computers");

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PrinterKind {
    Bw,
    Color,
    Plotter,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum PrinterStatus {
    Working,
    Offline,
    Jammed,
    OutOfToner,
    OutOfPaper,
}

impl PrinterStatus {
    pub fn is_working(&self) -> bool {
        matches!(self, PrinterStatus::Working)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Printer {
    #[serde(default)]
    pub id: String,
    pub site_id: String,
    pub name: String,
    pub kind: PrinterKind,
    pub status: PrinterStatus,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub last_updated: DateTime<Utc>,
}

entity!(Printer, "Printers");

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "lowercase")]
pub enum IssueType {
    Computer,
    Printer,
    Supplies,
    Cleanliness,
    Furniture,
    Other,
}

impl IssueType {
    pub fn label(&self) -> &'static str {
        match self {
            IssueType::Computer => "Computer",
            IssueType::Printer => "Printer",
            IssueType::Supplies => "Supplies",
            IssueType::Cleanliness => "Cleanliness",
            IssueType::Furniture => "Furniture",
            IssueType::Other => "Other",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "computer" => Some(IssueType::Computer),
            "printer" => Some(IssueType::Printer),
            "supplies" | "supply" => Some(IssueType::Supplies),
            "cleanliness" => Some(IssueType::Cleanliness),
            "furniture" => Some(IssueType::Furniture),
            "other" => Some(IssueType::Other),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Issue {
    #[serde(default)]
    pub id: String,
    pub site_id: String,
    pub issue_type: IssueType,
    pub description: String,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub timestamp: DateTime<Utc>,
    pub user_submitted: String,
    #[serde(default)]
    pub resolved: bool,
    #[serde(default)]
    pub ticket: Option<String>,
    #[serde(default)]
    pub computer_id: Option<String>,
}

entity!(Issue, "Issues");

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HourlyCleaning {
    #[serde(default)]
    pub id: String,
    pub site_id: String,
    pub user_id: String,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub cleaned_computers: Vec<String>,
    #[serde(default)]
    pub notes: Option<String>,
}

entity!(HourlyCleaning, "HourlyCleanings");

/// "Site ready" inspection survey filled in when a site is opened.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SiteReady {
    #[serde(default)]
    pub id: String,
    pub site_id: String,
    pub user_id: String,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub timestamp: DateTime<Utc>,
    pub chairs_pushed_in: bool,
    pub clock_correct: bool,
    pub computers_working: bool,
    pub printers_working: bool,
    pub posters_present: bool,
    pub trash_emptied: bool,
    #[serde(default)]
    pub comments: Option<String>,
    /// Issues filed while completing the survey
    #[serde(default)]
    pub issue_ids: Vec<String>,
}

entity!(SiteReady, "SiteReady");

impl SiteReady {
    pub fn passed(&self) -> bool {
        self.chairs_pushed_in
            && self.clock_correct
            && self.computers_working
            && self.printers_working
            && self.posters_present
            && self.trash_emptied
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SupplyType {
    #[serde(default)]
    pub id: String,
    pub name: String,
    /// Counted across all sites rather than per site
    #[serde(default)]
    pub collective: bool,
}

entity!(SupplyType, "SupplyTypes");

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SupplyCount {
    #[serde(default)]
    pub id: String,
    pub site_id: String,
    pub supply_type_id: String,
    pub count: i64,
    #[serde(default)]
    pub par_level: i64,
}

entity!(SupplyCount, "SupplyCounts");

impl SupplyCount {
    pub fn needs_restock(&self) -> bool {
        self.count < self.par_level
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SupplyRequest {
    #[serde(default)]
    pub id: String,
    pub site_id: String,
    pub supply_type_id: String,
    pub count: i64,
    pub user_id: String,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub fulfilled: bool,
    #[serde(default, with = "chrono::serde::ts_milliseconds_option")]
    pub fulfilled_at: Option<DateTime<Utc>>,
}

entity!(SupplyRequest, "SupplyRequests");

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct User {
    #[serde(default)]
    pub id: String,
    pub email: String,
    #[serde(default)]
    pub first_name: String,
    #[serde(default)]
    pub last_name: String,
    #[serde(default)]
    pub is_admin: bool,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub created_at: DateTime<Utc>,
    #[serde(default, with = "chrono::serde::ts_milliseconds_option")]
    pub last_sign_in: Option<DateTime<Utc>>,
}

entity!(User, "Users");

impl User {
    pub fn display_name(&self) -> String {
        let full = format!("{} {}", self.first_name, self.last_name);
        let full = full.trim();
        if full.is_empty() {
            self.email.clone()
        } else {
            full.to_string()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    #[test]
    fn test_fields_exclude_id_and_use_camel_case() {
        let issue = Issue {
            id: "i1".into(),
            site_id: "s1".into(),
            issue_type: IssueType::Printer,
            description: "Paper jam".into(),
            timestamp: Utc.timestamp_millis_opt(1_700_000_000_000).unwrap(),
            user_submitted: "u1".into(),
            resolved: false,
            ticket: None,
            computer_id: None,
        };
        let fields = issue.to_fields().unwrap();
        assert!(!fields.contains_key("id"));
        assert_eq!(fields["siteId"], json!("s1"));
        assert_eq!(fields["issueType"], json!("printer"));
        assert_eq!(fields["timestamp"], json!(1_700_000_000_000i64));
    }

    #[test]
    fn test_from_document_injects_id_and_defaults() {
        let doc = Document {
            id: "site-1".into(),
            fields: json!({"name": "Library 2nd floor", "buildingId": "b1"})
                .as_object()
                .cloned()
                .unwrap(),
        };
        let site = Site::from_document(doc).unwrap();
        assert_eq!(site.id, "site-1");
        assert_eq!(site.site_type, SiteType::ComputerLab);
        assert!(!site.has_printer);
    }

    #[test]
    fn test_decode_error_names_document() {
        let doc = Document {
            id: "bad".into(),
            fields: json!({"siteId": 7}).as_object().cloned().unwrap(),
        };
        match Issue::from_document(doc) {
            Err(StoreError::Decode { collection, id, .. }) => {
                assert_eq!(collection, "Issues");
                assert_eq!(id, "bad");
            }
            other => panic!("expected decode error, got {:?}", other),
        }
    }

    #[test]
    fn test_site_ready_passed() {
        let mut survey = SiteReady {
            id: String::new(),
            site_id: "s".into(),
            user_id: "u".into(),
            timestamp: Utc::now(),
            chairs_pushed_in: true,
            clock_correct: true,
            computers_working: true,
            printers_working: true,
            posters_present: true,
            trash_emptied: true,
            comments: None,
            issue_ids: vec![],
        };
        assert!(survey.passed());
        survey.clock_correct = false;
        assert!(!survey.passed());
    }

    #[test]
    fn test_user_display_name_falls_back_to_email() {
        let user = User {
            id: "u".into(),
            email: "tech@example.edu".into(),
            first_name: String::new(),
            last_name: String::new(),
            is_admin: false,
            created_at: Utc::now(),
            last_sign_in: None,
        };
        assert_eq!(user.display_name(), "tech@example.edu");
    }
}
