use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

use super::{Collection, Scope};
use crate::db::{fields, DateRange, Direction, DocumentStore, HourlyCleaning, SiteReady};
use crate::error::{Result, StoreError};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewCleaning {
    pub site_id: String,
    pub user_id: String,
    #[serde(default)]
    pub cleaned_computers: Vec<String>,
    #[serde(default)]
    pub notes: Option<String>,
}

#[derive(Clone)]
pub struct HourlyCleaningManager {
    cleanings: Collection<HourlyCleaning>,
}

impl HourlyCleaningManager {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        HourlyCleaningManager { cleanings: Collection::new(store) }
    }

    /// Cleanings for a site or a user (or everyone), optionally within a
    /// range. Newest first unless `descending` says otherwise.
    pub async fn list(&self, scope: &Scope, range: Option<DateRange>, descending: Option<bool>) -> Result<Vec<HourlyCleaning>> {
        let criteria = scope.criteria().within(range).descending(descending);
        tracing::debug!(shape = criteria.shape().as_str(), "listing hourly cleanings");
        let query = criteria.compose(self.cleanings.name(), fields::TIMESTAMP, true);
        self.cleanings.fetch(query).await
    }

    pub async fn log(&self, new: NewCleaning, at: DateTime<Utc>) -> Result<HourlyCleaning> {
        if new.site_id.is_empty() || new.user_id.is_empty() {
            return Err(StoreError::InvalidInput("a cleaning needs a site and a user".into()));
        }
        let cleaning = HourlyCleaning {
            id: String::new(),
            site_id: new.site_id,
            user_id: new.user_id,
            timestamp: at,
            cleaned_computers: new.cleaned_computers,
            notes: new.notes.filter(|n| !n.trim().is_empty()),
        };
        self.cleanings.create(&cleaning).await
    }

    pub async fn delete(&self, id: &str) -> Result<()> {
        self.cleanings.delete(id).await
    }

    /// Most recent cleaning per site within `range`, keyed by site id.
    pub async fn latest_by_site(&self, range: DateRange) -> Result<BTreeMap<String, HourlyCleaning>> {
        let cleanings = self.list(&Scope::All, Some(range), Some(true)).await?;
        let mut latest = BTreeMap::new();
        for cleaning in cleanings {
            latest.entry(cleaning.site_id.clone()).or_insert(cleaning);
        }
        Ok(latest)
    }

    /// Of `site_ids`, those with no cleaning logged within `range`.
    pub async fn sites_missing_cleaning(&self, site_ids: &[String], range: DateRange) -> Result<Vec<String>> {
        let latest = self.latest_by_site(range).await?;
        Ok(site_ids
            .iter()
            .filter(|id| !latest.contains_key(*id))
            .cloned()
            .collect())
    }
}

/// A filled-in survey. The id comes from the store and the timestamp from
/// [`SiteReadyManager::submit`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewSiteReady {
    pub site_id: String,
    pub user_id: String,
    pub chairs_pushed_in: bool,
    pub clock_correct: bool,
    pub computers_working: bool,
    pub printers_working: bool,
    pub posters_present: bool,
    pub trash_emptied: bool,
    #[serde(default)]
    pub comments: Option<String>,
    #[serde(default)]
    pub issue_ids: Vec<String>,
}

impl NewSiteReady {
    /// All checks passing, to be switched off one by one.
    pub fn all_passing(site_id: String, user_id: String) -> Self {
        NewSiteReady {
            site_id,
            user_id,
            chairs_pushed_in: true,
            clock_correct: true,
            computers_working: true,
            printers_working: true,
            posters_present: true,
            trash_emptied: true,
            comments: None,
            issue_ids: Vec::new(),
        }
    }
}

#[derive(Clone)]
pub struct SiteReadyManager {
    surveys: Collection<SiteReady>,
}

impl SiteReadyManager {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        SiteReadyManager { surveys: Collection::new(store) }
    }

    pub async fn list(&self, scope: &Scope, range: Option<DateRange>, descending: Option<bool>) -> Result<Vec<SiteReady>> {
        let criteria = scope.criteria().within(range).descending(descending);
        tracing::debug!(shape = criteria.shape().as_str(), "listing site ready surveys");
        let query = criteria.compose(self.surveys.name(), fields::TIMESTAMP, true);
        self.surveys.fetch(query).await
    }

    /// Store a completed survey, stamped with `at`.
    pub async fn submit(&self, new: NewSiteReady, at: DateTime<Utc>) -> Result<SiteReady> {
        if new.site_id.is_empty() || new.user_id.is_empty() {
            return Err(StoreError::InvalidInput("a survey needs a site and a user".into()));
        }
        let survey = SiteReady {
            id: String::new(),
            site_id: new.site_id,
            user_id: new.user_id,
            timestamp: at,
            chairs_pushed_in: new.chairs_pushed_in,
            clock_correct: new.clock_correct,
            computers_working: new.computers_working,
            printers_working: new.printers_working,
            posters_present: new.posters_present,
            trash_emptied: new.trash_emptied,
            comments: new.comments.filter(|c| !c.trim().is_empty()),
            issue_ids: new.issue_ids,
        };
        let created = self.surveys.create(&survey).await?;
        if !created.passed() {
            tracing::info!(site = %created.site_id, survey = %created.id, "site ready survey recorded failures");
        }
        Ok(created)
    }

    pub async fn latest_for_site(&self, site_id: &str) -> Result<Option<SiteReady>> {
        let query = self
            .surveys
            .query()
            .where_eq(fields::SITE_ID, site_id)
            .order_by(fields::TIMESTAMP, Direction::Descending)
            .limit(1);
        Ok(self.surveys.fetch(query).await?.into_iter().next())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::managers::test_store;
    use chrono::{Duration, TimeZone};

    fn t(minutes: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 9, 2, 8, 0, 0).unwrap() + Duration::minutes(minutes)
    }

    fn cleaning(site: &str, user: &str) -> NewCleaning {
        NewCleaning {
            site_id: site.into(),
            user_id: user.into(),
            cleaned_computers: vec![],
            notes: None,
        }
    }

    async fn seeded() -> HourlyCleaningManager {
        let manager = HourlyCleaningManager::new(test_store());
        manager.log(cleaning("s1", "alice"), t(0)).await.unwrap();
        manager.log(cleaning("s2", "bob"), t(30)).await.unwrap();
        manager.log(cleaning("s1", "bob"), t(60)).await.unwrap();
        manager.log(cleaning("s1", "alice"), t(120)).await.unwrap();
        manager
    }

    #[tokio::test]
    async fn test_combinatorial_selection() {
        let manager = seeded().await;
        let morning = DateRange::new(t(0), t(60)).unwrap();

        assert_eq!(manager.list(&Scope::All, None, None).await.unwrap().len(), 4);
        assert_eq!(manager.list(&Scope::Site("s1".into()), None, None).await.unwrap().len(), 3);
        assert_eq!(manager.list(&Scope::User("bob".into()), None, None).await.unwrap().len(), 2);
        assert_eq!(manager.list(&Scope::All, Some(morning), None).await.unwrap().len(), 3);

        let alice_morning = manager
            .list(&Scope::User("alice".into()), Some(morning), None)
            .await
            .unwrap();
        assert_eq!(alice_morning.len(), 1);
        assert_eq!(alice_morning[0].timestamp, t(0));

        let oldest_first = manager.list(&Scope::Site("s1".into()), None, Some(false)).await.unwrap();
        assert_eq!(oldest_first.first().map(|c| c.timestamp), Some(t(0)));
        assert_eq!(oldest_first.last().map(|c| c.timestamp), Some(t(120)));
    }

    #[tokio::test]
    async fn test_latest_by_site_and_missing() {
        let manager = seeded().await;
        let range = DateRange::new(t(0), t(180)).unwrap();
        let latest = manager.latest_by_site(range).await.unwrap();
        assert_eq!(latest["s1"].timestamp, t(120));
        assert_eq!(latest["s2"].timestamp, t(30));

        let late = DateRange::new(t(90), t(180)).unwrap();
        let missing = manager
            .sites_missing_cleaning(&["s1".to_string(), "s2".to_string(), "s3".to_string()], late)
            .await
            .unwrap();
        assert_eq!(missing, vec!["s2", "s3"]);
    }

    #[tokio::test]
    async fn test_log_requires_site_and_user() {
        let manager = HourlyCleaningManager::new(test_store());
        assert!(matches!(
            manager.log(cleaning("", "alice"), t(0)).await,
            Err(StoreError::InvalidInput(_))
        ));
    }

    fn survey(site: &str, ok: bool) -> NewSiteReady {
        NewSiteReady {
            clock_correct: ok,
            ..NewSiteReady::all_passing(site.into(), "alice".into())
        }
    }

    #[tokio::test]
    async fn test_site_ready_submit_and_latest() {
        let manager = SiteReadyManager::new(test_store());
        let first = manager.submit(survey("s1", true), t(5)).await.unwrap();
        assert!(!first.id.is_empty());
        assert_eq!(first.timestamp, t(5));
        assert!(first.passed());
        manager.submit(survey("s1", false), t(65)).await.unwrap();
        manager.submit(survey("s2", true), t(70)).await.unwrap();

        let latest = manager.latest_for_site("s1").await.unwrap().unwrap();
        assert_eq!(latest.timestamp, t(65));
        assert!(!latest.passed());
        assert!(manager.latest_for_site("s9").await.unwrap().is_none());

        let window = DateRange::new(t(60), t(120)).unwrap();
        assert_eq!(manager.list(&Scope::All, Some(window), None).await.unwrap().len(), 2);
        assert_eq!(manager.list(&Scope::User("alice".into()), None, None).await.unwrap().len(), 3);
    }

    #[test]
    fn test_new_survey_payload_needs_no_id_or_timestamp() {
        let body = r#"{
            "site_id": "s1",
            "user_id": "alice",
            "chairs_pushed_in": true,
            "clock_correct": false,
            "computers_working": true,
            "printers_working": true,
            "posters_present": true,
            "trash_emptied": true
        }"#;
        let new: NewSiteReady = serde_json::from_str(body).unwrap();
        assert!(!new.clock_correct);
        assert!(new.issue_ids.is_empty());
    }

    #[tokio::test]
    async fn test_submit_requires_site_and_user() {
        let manager = SiteReadyManager::new(test_store());
        assert!(matches!(
            manager.submit(survey("", true), t(0)).await,
            Err(StoreError::InvalidInput(_))
        ));
    }
}
