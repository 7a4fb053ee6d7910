use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::Collection;
use crate::db::{fields, DateRange, DocumentStore, Issue, IssueType, Query, QueryCriteria};
use crate::error::{Result, StoreError};
use crate::patch;

/// Optional criteria for listing issues.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IssueQuery {
    pub site_id: Option<String>,
    pub range: Option<DateRange>,
    /// Newest first when unset
    pub descending: Option<bool>,
}

impl IssueQuery {
    pub fn criteria(&self) -> QueryCriteria {
        QueryCriteria::new()
            .maybe_equal(fields::SITE_ID, self.site_id.as_deref())
            .within(self.range)
            .descending(self.descending)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewIssue {
    pub site_id: String,
    pub issue_type: IssueType,
    pub description: String,
    pub user_submitted: String,
    #[serde(default)]
    pub ticket: Option<String>,
    #[serde(default)]
    pub computer_id: Option<String>,
}

#[derive(Clone)]
pub struct IssuesManager {
    issues: Collection<Issue>,
}

impl IssuesManager {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        IssuesManager { issues: Collection::new(store) }
    }

    pub async fn list(&self, query: &IssueQuery) -> Result<Vec<Issue>> {
        let criteria = query.criteria();
        tracing::debug!(shape = criteria.shape().as_str(), "listing issues");
        let query = criteria.compose(self.issues.name(), fields::TIMESTAMP, true);
        self.issues.fetch(query).await
    }

    /// Open issues, newest first, optionally for one site.
    ///
    /// Equality-only so it runs without a composite index; ordering happens
    /// here.
    pub async fn unresolved(&self, site_id: Option<&str>) -> Result<Vec<Issue>> {
        let mut query: Query = self.issues.query().where_eq(fields::RESOLVED, false);
        if let Some(site) = site_id {
            query = query.where_eq(fields::SITE_ID, site);
        }
        let mut issues = self.issues.fetch(query).await?;
        issues.sort_by(|a, b| b.timestamp.cmp(&a.timestamp).then_with(|| a.id.cmp(&b.id)));
        Ok(issues)
    }

    pub async fn get(&self, id: &str) -> Result<Option<Issue>> {
        self.issues.get(id).await
    }

    pub async fn create(&self, new: NewIssue, at: DateTime<Utc>) -> Result<Issue> {
        if new.description.trim().is_empty() {
            return Err(StoreError::InvalidInput("issue description is required".into()));
        }
        let issue = Issue {
            id: String::new(),
            site_id: new.site_id,
            issue_type: new.issue_type,
            description: new.description.trim().to_string(),
            timestamp: at,
            user_submitted: new.user_submitted,
            resolved: false,
            ticket: new.ticket.filter(|t| !t.trim().is_empty()),
            computer_id: new.computer_id,
        };
        let created = self.issues.create(&issue).await?;
        tracing::info!(issue = %created.id, site = %created.site_id, kind = created.issue_type.label(), "issue reported");
        Ok(created)
    }

    pub async fn set_resolved(&self, id: &str, resolved: bool) -> Result<()> {
        self.issues.patch(id, patch! { fields::RESOLVED => resolved }).await
    }

    pub async fn resolve(&self, id: &str) -> Result<()> {
        self.set_resolved(id, true).await
    }

    pub async fn reopen(&self, id: &str) -> Result<()> {
        self.set_resolved(id, false).await
    }

    pub async fn set_ticket(&self, id: &str, ticket: Option<&str>) -> Result<()> {
        self.issues.patch(id, patch! { "ticket" => ticket }).await
    }

    pub async fn delete(&self, id: &str) -> Result<()> {
        self.issues.delete(id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{MemoryStore, QueryShape};
    use crate::managers::test_store;
    use chrono::{Duration, TimeZone};

    fn new_issue(site: &str, description: &str) -> NewIssue {
        NewIssue {
            site_id: site.into(),
            issue_type: IssueType::Computer,
            description: description.into(),
            user_submitted: "u1".into(),
            ticket: None,
            computer_id: None,
        }
    }

    fn t(hours: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 9, 1, 0, 0, 0).unwrap() + Duration::hours(hours)
    }

    async fn seeded() -> IssuesManager {
        let manager = IssuesManager::new(test_store());
        manager.create(new_issue("s1", "Monitor flickers"), t(1)).await.unwrap();
        manager.create(new_issue("s2", "Keyboard missing keys"), t(2)).await.unwrap();
        manager.create(new_issue("s1", "Login loop"), t(3)).await.unwrap();
        manager.create(new_issue("s1", "Mouse dead"), t(10)).await.unwrap();
        manager
    }

    fn descriptions(issues: &[Issue]) -> Vec<&str> {
        issues.iter().map(|i| i.description.as_str()).collect()
    }

    #[tokio::test]
    async fn test_full_collection_defaults_newest_first() {
        let manager = seeded().await;
        let all = manager.list(&IssueQuery::default()).await.unwrap();
        assert_eq!(
            descriptions(&all),
            vec!["Mouse dead", "Login loop", "Keyboard missing keys", "Monitor flickers"]
        );
    }

    #[test]
    fn test_query_payload_rejects_inverted_range() {
        let inverted = r#"{
            "site_id": "s1",
            "range": {"start": "2024-09-05T00:00:00Z", "end": "2024-09-01T00:00:00Z"}
        }"#;
        assert!(serde_json::from_str::<IssueQuery>(inverted).is_err());

        let ok = r#"{"range": {"start": "2024-09-01T00:00:00Z", "end": "2024-09-05T00:00:00Z"}}"#;
        let query: IssueQuery = serde_json::from_str(ok).unwrap();
        assert_eq!(query.criteria().shape(), QueryShape::Range);
    }

    #[tokio::test]
    async fn test_each_query_shape() {
        let manager = seeded().await;
        let range = DateRange::new(t(0), t(3)).unwrap();

        let by_site = IssueQuery { site_id: Some("s1".into()), ..Default::default() };
        assert_eq!(by_site.criteria().shape(), QueryShape::Equality);
        assert_eq!(
            descriptions(&manager.list(&by_site).await.unwrap()),
            vec!["Mouse dead", "Login loop", "Monitor flickers"]
        );

        let in_range = IssueQuery { range: Some(range), descending: Some(false), ..Default::default() };
        assert_eq!(in_range.criteria().shape(), QueryShape::Range);
        assert_eq!(
            descriptions(&manager.list(&in_range).await.unwrap()),
            vec!["Monitor flickers", "Keyboard missing keys", "Login loop"]
        );

        let both = IssueQuery { site_id: Some("s1".into()), range: Some(range), descending: None };
        assert_eq!(both.criteria().shape(), QueryShape::EqualityRange);
        assert_eq!(
            descriptions(&manager.list(&both).await.unwrap()),
            vec!["Login loop", "Monitor flickers"]
        );
    }

    #[tokio::test]
    async fn test_no_matches_is_empty_not_error() {
        let manager = seeded().await;
        let q = IssueQuery { site_id: Some("nowhere".into()), ..Default::default() };
        assert!(manager.list(&q).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_missing_index_surfaces_to_caller() {
        let manager = IssuesManager::new(Arc::new(MemoryStore::with_index_enforcement()));
        let q = IssueQuery { site_id: Some("s1".into()), ..Default::default() };
        let err = manager.list(&q).await.unwrap_err();
        assert!(matches!(err, StoreError::MissingIndex { .. }));

        // Equality-only lookups keep working without the index
        assert!(manager.unresolved(Some("s1")).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_resolve_and_unresolved() {
        let manager = seeded().await;
        let open = manager.unresolved(Some("s1")).await.unwrap();
        assert_eq!(open.len(), 3);

        manager.resolve(&open[0].id).await.unwrap();
        let open = manager.unresolved(Some("s1")).await.unwrap();
        assert_eq!(descriptions(&open), vec!["Login loop", "Monitor flickers"]);
        assert_eq!(manager.unresolved(None).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_create_validates_and_trims() {
        let manager = IssuesManager::new(test_store());
        assert!(matches!(
            manager.create(new_issue("s1", "   "), t(0)).await,
            Err(StoreError::InvalidInput(_))
        ));

        let mut with_ticket = new_issue("s1", "  Projector dim ");
        with_ticket.ticket = Some(" ".into());
        let created = manager.create(with_ticket, t(0)).await.unwrap();
        assert_eq!(created.description, "Projector dim");
        assert_eq!(created.ticket, None);
        assert!(!created.resolved);

        manager.set_ticket(&created.id, Some("INC0012345")).await.unwrap();
        let stored = manager.get(&created.id).await.unwrap().unwrap();
        assert_eq!(stored.ticket.as_deref(), Some("INC0012345"));
    }
}
