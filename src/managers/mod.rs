//! Per-entity managers.
//!
//! Each manager wraps one collection and owns the small decision table that
//! turns optional criteria into one of the fixed query shapes. Filters that
//! would need a composite index for no real gain (name ordering inside one
//! site, resolved flags) are applied in memory after an equality query.

mod cleaning;
mod collection;
mod equipment;
mod issues;
mod sites;
mod supplies;
mod users;

pub use cleaning::{HourlyCleaningManager, NewCleaning, NewSiteReady, SiteReadyManager};
pub use collection::Collection;
pub use equipment::{ComputersManager, PrintersManager};
pub use issues::{IssueQuery, IssuesManager, NewIssue};
pub use sites::{BuildingsManager, SitesManager};
pub use supplies::{
    NewSupplyRequest, SupplyCountScope, SupplyCountsManager, SupplyRequestsManager,
    SupplyTypesManager,
};
pub use users::UsersManager;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::db::{fields, Computer, DocumentStore, Entity, HourlyCleaning, QueryCriteria};
use crate::error::{Result, StoreError};

/// Whose records a log query covers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "by", content = "id")]
pub enum Scope {
    #[default]
    All,
    Site(String),
    User(String),
}

impl Scope {
    pub fn from_options(site_id: Option<String>, user_id: Option<String>) -> Self {
        match (site_id, user_id) {
            (Some(site), _) => Scope::Site(site),
            (None, Some(user)) => Scope::User(user),
            (None, None) => Scope::All,
        }
    }

    pub(crate) fn criteria(&self) -> QueryCriteria {
        match self {
            Scope::All => QueryCriteria::new(),
            Scope::Site(id) => QueryCriteria::new().equal(fields::SITE_ID, id.as_str()),
            Scope::User(id) => QueryCriteria::new().equal(fields::USER_ID, id.as_str()),
        }
    }
}

/// Every manager over one shared store.
#[derive(Clone)]
pub struct Managers {
    pub buildings: BuildingsManager,
    pub sites: SitesManager,
    pub computers: ComputersManager,
    pub printers: PrintersManager,
    pub issues: IssuesManager,
    pub cleaning: HourlyCleaningManager,
    pub site_ready: SiteReadyManager,
    pub supply_types: SupplyTypesManager,
    pub supply_counts: SupplyCountsManager,
    pub supply_requests: SupplyRequestsManager,
    pub users: UsersManager,
    store: Arc<dyn DocumentStore>,
}

impl Managers {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Managers {
            buildings: BuildingsManager::new(store.clone()),
            sites: SitesManager::new(store.clone()),
            computers: ComputersManager::new(store.clone()),
            printers: PrintersManager::new(store.clone()),
            issues: IssuesManager::new(store.clone()),
            cleaning: HourlyCleaningManager::new(store.clone()),
            site_ready: SiteReadyManager::new(store.clone()),
            supply_types: SupplyTypesManager::new(store.clone()),
            supply_counts: SupplyCountsManager::new(store.clone()),
            supply_requests: SupplyRequestsManager::new(store.clone()),
            users: UsersManager::new(store.clone()),
            store,
        }
    }

    pub fn store(&self) -> &Arc<dyn DocumentStore> {
        &self.store
    }

    /// Record a cleaning and stamp the computers it lists.
    ///
    /// Every listed computer must exist before anything is written, so an
    /// unknown id leaves no cleaning behind.
    pub async fn log_cleaning(&self, new: NewCleaning, at: DateTime<Utc>) -> Result<HourlyCleaning> {
        let mut ids = new.cleaned_computers.clone();
        ids.sort();
        ids.dedup();
        for id in &ids {
            if self.computers.get(id).await?.is_none() {
                return Err(StoreError::not_found(Computer::COLLECTION, id));
            }
        }
        let cleaning = self.cleaning.log(new, at).await?;
        self.computers.mark_all_cleaned(&ids, at).await?;
        tracing::info!(site = %cleaning.site_id, computers = ids.len(), "logged cleaning");
        Ok(cleaning)
    }
}

#[cfg(test)]
pub(crate) fn test_store() -> Arc<dyn DocumentStore> {
    Arc::new(crate::db::MemoryStore::new())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{Os, QueryShape};
    use chrono::TimeZone;

    #[test]
    fn test_scope_prefers_site_over_user() {
        let scope = Scope::from_options(Some("s1".into()), Some("u1".into()));
        assert_eq!(scope, Scope::Site("s1".into()));
        assert_eq!(Scope::from_options(None, Some("u1".into())), Scope::User("u1".into()));
        assert_eq!(Scope::from_options(None, None), Scope::All);
    }

    #[test]
    fn test_scope_criteria() {
        assert_eq!(Scope::All.criteria().shape(), QueryShape::FullCollection);
        let c = Scope::User("u1".into()).criteria();
        assert_eq!(c.shape(), QueryShape::Equality);
        assert_eq!(c.equality.unwrap().field, "userId");
    }

    #[tokio::test]
    async fn test_log_cleaning_checks_computers_first() {
        let managers = Managers::new(test_store());
        let pc = managers
            .computers
            .create(&Computer {
                id: String::new(),
                site_id: "s1".into(),
                name: "PC-01".into(),
                os: Os::Windows,
                section: None,
                last_cleaned: None,
            })
            .await
            .unwrap();
        let at = Utc.with_ymd_and_hms(2024, 9, 2, 9, 0, 0).unwrap();
        let new = |computers: Vec<String>| NewCleaning {
            site_id: "s1".into(),
            user_id: "alice".into(),
            cleaned_computers: computers,
            notes: None,
        };

        let err = managers
            .log_cleaning(new(vec![pc.id.clone(), "ghost".into()]), at)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound { ref id, .. } if id == "ghost"));
        assert!(managers.cleaning.list(&Scope::All, None, None).await.unwrap().is_empty());
        assert_eq!(managers.computers.get(&pc.id).await.unwrap().unwrap().last_cleaned, None);

        let logged = managers
            .log_cleaning(new(vec![pc.id.clone(), pc.id.clone()]), at)
            .await
            .unwrap();
        assert_eq!(logged.site_id, "s1");
        assert_eq!(managers.cleaning.list(&Scope::All, None, None).await.unwrap().len(), 1);
        let stamped = managers.computers.get(&pc.id).await.unwrap().unwrap();
        assert_eq!(stamped.last_cleaned.map(|t| t.timestamp_millis()), Some(at.timestamp_millis()));
    }

    #[tokio::test]
    async fn test_managers_share_one_store() {
        let managers = Managers::new(test_store());
        assert_eq!(managers.store().backend_name(), "memory");
        let b = managers.buildings.create("Hillman Library", "HL").await.unwrap();
        assert_eq!(managers.buildings.all().await.unwrap(), vec![b]);
    }
}
