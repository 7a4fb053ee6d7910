use chrono::{DateTime, Utc};
use std::sync::Arc;

use super::Collection;
use crate::db::{fields, Direction, DocumentStore, User};
use crate::error::Result;
use crate::patch;

#[derive(Clone)]
pub struct UsersManager {
    users: Collection<User>,
}

impl UsersManager {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        UsersManager { users: Collection::new(store) }
    }

    pub async fn all(&self) -> Result<Vec<User>> {
        let query = self.users.query().order_by(fields::EMAIL, Direction::Ascending);
        self.users.fetch(query).await
    }

    pub async fn get(&self, id: &str) -> Result<Option<User>> {
        self.users.get(id).await
    }

    /// Create the profile on first sign-in, otherwise bump `lastSignIn`.
    /// Profiles are keyed by the identity provider's user id.
    pub async fn record_sign_in(&self, user_id: &str, email: &str, at: DateTime<Utc>) -> Result<User> {
        if let Some(mut existing) = self.users.get(user_id).await? {
            self.users
                .patch(user_id, patch! { "lastSignIn" => at.timestamp_millis() })
                .await?;
            existing.last_sign_in = Some(at);
            return Ok(existing);
        }

        let user = User {
            id: user_id.to_string(),
            email: email.to_string(),
            first_name: String::new(),
            last_name: String::new(),
            is_admin: false,
            created_at: at,
            last_sign_in: Some(at),
        };
        let created = self.users.create(&user).await?;
        tracing::info!(user = %created.id, "created user profile");
        Ok(created)
    }

    pub async fn set_name(&self, id: &str, first: &str, last: &str) -> Result<()> {
        self.users
            .patch(id, patch! { "firstName" => first.trim(), "lastName" => last.trim() })
            .await
    }

    pub async fn set_admin(&self, id: &str, is_admin: bool) -> Result<()> {
        self.users.patch(id, patch! { "isAdmin" => is_admin }).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::managers::test_store;
    use chrono::{Duration, TimeZone};

    #[tokio::test]
    async fn test_record_sign_in_creates_then_updates() {
        let manager = UsersManager::new(test_store());
        // Stored timestamps keep millisecond precision
        let first = Utc.timestamp_millis_opt(Utc::now().timestamp_millis()).unwrap();
        let created = manager.record_sign_in("uid-1", "tech@example.edu", first).await.unwrap();
        assert_eq!(created.id, "uid-1");
        assert_eq!(created.created_at, first);

        let later = first + Duration::hours(4);
        let again = manager.record_sign_in("uid-1", "tech@example.edu", later).await.unwrap();
        assert_eq!(again.created_at, first);
        assert_eq!(again.last_sign_in, Some(later));
        assert_eq!(manager.all().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_profile_edits() {
        let manager = UsersManager::new(test_store());
        manager.record_sign_in("uid-2", "b@example.edu", Utc::now()).await.unwrap();
        manager.set_name("uid-2", " Pat ", "Lee").await.unwrap();
        manager.set_admin("uid-2", true).await.unwrap();
        let user = manager.get("uid-2").await.unwrap().unwrap();
        assert_eq!(user.display_name(), "Pat Lee");
        assert!(user.is_admin);
    }
}
