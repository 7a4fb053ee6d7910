use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::Collection;
use crate::db::{
    fields, DateRange, Direction, DocumentStore, QueryCriteria, SupplyCount, SupplyRequest,
    SupplyType,
};
use crate::error::{Result, StoreError};
use crate::patch;

#[derive(Clone)]
pub struct SupplyTypesManager {
    types: Collection<SupplyType>,
}

impl SupplyTypesManager {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        SupplyTypesManager { types: Collection::new(store) }
    }

    pub async fn all(&self) -> Result<Vec<SupplyType>> {
        let query = self.types.query().order_by(fields::NAME, Direction::Ascending);
        self.types.fetch(query).await
    }

    pub async fn create(&self, name: &str, collective: bool) -> Result<SupplyType> {
        let supply = SupplyType {
            id: String::new(),
            name: name.trim().to_string(),
            collective,
        };
        self.types.create(&supply).await
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum SupplyCountScope {
    #[default]
    All,
    Site(String),
    SupplyType(String),
}

#[derive(Clone)]
pub struct SupplyCountsManager {
    counts: Collection<SupplyCount>,
}

impl SupplyCountsManager {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        SupplyCountsManager { counts: Collection::new(store) }
    }

    /// Counts ordered by site then supply type.
    pub async fn list(&self, scope: &SupplyCountScope) -> Result<Vec<SupplyCount>> {
        let query = match scope {
            SupplyCountScope::All => self.counts.query(),
            SupplyCountScope::Site(site) => self.counts.query().where_eq(fields::SITE_ID, site.as_str()),
            SupplyCountScope::SupplyType(supply) => {
                self.counts.query().where_eq(fields::SUPPLY_TYPE_ID, supply.as_str())
            }
        };
        let mut counts = self.counts.fetch(query).await?;
        counts.sort_by(|a, b| {
            a.site_id
                .cmp(&b.site_id)
                .then_with(|| a.supply_type_id.cmp(&b.supply_type_id))
                .then_with(|| a.id.cmp(&b.id))
        });
        Ok(counts)
    }

    pub async fn create(&self, count: &SupplyCount) -> Result<SupplyCount> {
        if count.count < 0 {
            return Err(StoreError::InvalidInput("supply count cannot be negative".into()));
        }
        self.counts.create(count).await
    }

    pub async fn set_count(&self, id: &str, count: i64) -> Result<()> {
        if count < 0 {
            return Err(StoreError::InvalidInput("supply count cannot be negative".into()));
        }
        self.counts.patch(id, patch! { "count" => count }).await
    }

    /// Counts below their par level.
    pub async fn low_stock(&self, site_id: Option<&str>) -> Result<Vec<SupplyCount>> {
        let scope = match site_id {
            Some(site) => SupplyCountScope::Site(site.to_string()),
            None => SupplyCountScope::All,
        };
        let counts = self.list(&scope).await?;
        Ok(counts.into_iter().filter(SupplyCount::needs_restock).collect())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewSupplyRequest {
    pub site_id: String,
    pub supply_type_id: String,
    pub count: i64,
    pub user_id: String,
}

#[derive(Clone)]
pub struct SupplyRequestsManager {
    requests: Collection<SupplyRequest>,
}

impl SupplyRequestsManager {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        SupplyRequestsManager { requests: Collection::new(store) }
    }

    pub async fn list(&self, site_id: Option<&str>, range: Option<DateRange>, descending: Option<bool>) -> Result<Vec<SupplyRequest>> {
        let criteria = QueryCriteria::new()
            .maybe_equal(fields::SITE_ID, site_id)
            .within(range)
            .descending(descending);
        tracing::debug!(shape = criteria.shape().as_str(), "listing supply requests");
        let query = criteria.compose(self.requests.name(), fields::TIMESTAMP, true);
        self.requests.fetch(query).await
    }

    /// Unfulfilled requests, oldest first.
    pub async fn pending(&self, site_id: Option<&str>) -> Result<Vec<SupplyRequest>> {
        let mut query = self.requests.query().where_eq(fields::FULFILLED, false);
        if let Some(site) = site_id {
            query = query.where_eq(fields::SITE_ID, site);
        }
        let mut requests = self.requests.fetch(query).await?;
        requests.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.id.cmp(&b.id)));
        Ok(requests)
    }

    pub async fn create(&self, new: NewSupplyRequest, at: DateTime<Utc>) -> Result<SupplyRequest> {
        if new.count <= 0 {
            return Err(StoreError::InvalidInput("a supply request needs a positive count".into()));
        }
        let request = SupplyRequest {
            id: String::new(),
            site_id: new.site_id,
            supply_type_id: new.supply_type_id,
            count: new.count,
            user_id: new.user_id,
            timestamp: at,
            fulfilled: false,
            fulfilled_at: None,
        };
        self.requests.create(&request).await
    }

    pub async fn fulfil(&self, id: &str, at: DateTime<Utc>) -> Result<()> {
        self.requests
            .patch(id, patch! { fields::FULFILLED => true, "fulfilledAt" => at.timestamp_millis() })
            .await?;
        tracing::info!(request = id, "supply request fulfilled");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::managers::test_store;
    use chrono::{Duration, TimeZone};

    fn count(site: &str, supply: &str, n: i64, par: i64) -> SupplyCount {
        SupplyCount {
            id: String::new(),
            site_id: site.into(),
            supply_type_id: supply.into(),
            count: n,
            par_level: par,
        }
    }

    #[tokio::test]
    async fn test_counts_scopes_and_low_stock() {
        let manager = SupplyCountsManager::new(test_store());
        manager.create(&count("s2", "paper", 3, 10)).await.unwrap();
        let toner = manager.create(&count("s1", "toner", 1, 2)).await.unwrap();
        manager.create(&count("s1", "paper", 12, 10)).await.unwrap();

        let all = manager.list(&SupplyCountScope::All).await.unwrap();
        let keys: Vec<(String, String)> = all.iter().map(|c| (c.site_id.clone(), c.supply_type_id.clone())).collect();
        assert_eq!(
            keys,
            vec![
                ("s1".into(), "paper".into()),
                ("s1".into(), "toner".into()),
                ("s2".into(), "paper".into())
            ]
        );
        assert_eq!(manager.list(&SupplyCountScope::SupplyType("paper".into())).await.unwrap().len(), 2);

        assert_eq!(manager.low_stock(None).await.unwrap().len(), 2);
        assert_eq!(manager.low_stock(Some("s1")).await.unwrap().len(), 1);

        manager.set_count(&toner.id, 5).await.unwrap();
        assert!(manager.low_stock(Some("s1")).await.unwrap().is_empty());
        assert!(manager.set_count(&toner.id, -1).await.is_err());
    }

    #[tokio::test]
    async fn test_requests_pending_and_fulfil() {
        let manager = SupplyRequestsManager::new(test_store());
        let base = Utc.with_ymd_and_hms(2024, 9, 3, 9, 0, 0).unwrap();
        let req = |site: &str| NewSupplyRequest {
            site_id: site.into(),
            supply_type_id: "paper".into(),
            count: 2,
            user_id: "u1".into(),
        };

        let first = manager.create(req("s1"), base).await.unwrap();
        manager.create(req("s1"), base + Duration::hours(1)).await.unwrap();
        manager.create(req("s2"), base + Duration::hours(2)).await.unwrap();

        let pending = manager.pending(Some("s1")).await.unwrap();
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].id, first.id);

        manager.fulfil(&first.id, base + Duration::hours(3)).await.unwrap();
        assert_eq!(manager.pending(None).await.unwrap().len(), 2);

        let history = manager.list(Some("s1"), None, None).await.unwrap();
        assert_eq!(history.len(), 2);
        let done = history.iter().find(|r| r.id == first.id).unwrap();
        assert!(done.fulfilled);
        assert_eq!(done.fulfilled_at, Some(base + Duration::hours(3)));

        let window = DateRange::new(base + Duration::minutes(30), base + Duration::hours(5)).unwrap();
        assert_eq!(manager.list(None, Some(window), None).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_request_needs_positive_count() {
        let manager = SupplyRequestsManager::new(test_store());
        let bad = NewSupplyRequest {
            site_id: "s1".into(),
            supply_type_id: "paper".into(),
            count: 0,
            user_id: "u1".into(),
        };
        assert!(manager.create(bad, Utc::now()).await.is_err());
    }

    #[tokio::test]
    async fn test_supply_types_sorted() {
        let manager = SupplyTypesManager::new(test_store());
        manager.create("Toner", false).await.unwrap();
        manager.create("Paper", true).await.unwrap();
        let names: Vec<String> = manager.all().await.unwrap().into_iter().map(|s| s.name).collect();
        assert_eq!(names, vec!["Paper", "Toner"]);
    }
}
