use std::sync::Arc;

use chrono::Utc;

use crate::error::AppError;
use crate::store::DocumentStore;
use crate::types::{Membership, ProfileUpsert, UpsertUserRequest, UserAccount, UserCounter};

/// Owns user profiles and the counters other managers bump.
pub struct UserAccounts {
    store: Arc<dyn DocumentStore>,
}

impl UserAccounts {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self { store }
    }

    /// Create the profile on first sight, otherwise refresh name and photo.
    /// Returns whether a record was created. Membership only applies on
    /// creation, so an existing "yes" is never downgraded.
    pub async fn upsert_profile(&self, req: UpsertUserRequest) -> Result<bool, AppError> {
        let email = req
            .email
            .map(|e| e.trim().to_string())
            .filter(|e| !e.is_empty())
            .ok_or_else(|| AppError::validation("Email is required"))?;
        if !email.contains('@') {
            return Err(AppError::validation("Email is invalid"));
        }

        let profile = ProfileUpsert {
            user_id: uuid::Uuid::new_v4().to_string(),
            email,
            name: req.name,
            photo_url: req.photourl,
            membership: req.membership.unwrap_or_default(),
            now: Utc::now(),
        };
        let created = self.store.upsert_user(&profile).await?;
        tracing::info!(email = %profile.email, created, "user profile upserted");
        Ok(created)
    }

    pub async fn get_profile(&self, email: &str) -> Result<UserAccount, AppError> {
        self.store
            .find_user(email)
            .await?
            .ok_or_else(|| AppError::not_found("User not found"))
    }

    pub async fn list_users(&self) -> Result<Vec<UserAccount>, AppError> {
        Ok(self.store.list_users().await?)
    }

    pub async fn grant_membership(&self, email: &str) -> Result<(), AppError> {
        if !self
            .store
            .set_membership(email, Membership::Yes, Utc::now())
            .await?
        {
            return Err(AppError::not_found("User not found"));
        }
        tracing::info!(%email, "membership granted");
        Ok(())
    }

    /// Atomically add `delta` to the account's post count. `None` when no
    /// account has this email. Callers treat the count as a metric, not as
    /// accounting.
    pub async fn adjust_post_count(&self, email: &str, delta: i64) -> Result<Option<i64>, AppError> {
        self.adjust(email, UserCounter::Posts, delta).await
    }

    /// Like [`adjust_post_count`](Self::adjust_post_count). A negative result
    /// is reported but left alone.
    pub async fn adjust_request_count(
        &self,
        email: &str,
        delta: i64,
    ) -> Result<Option<i64>, AppError> {
        let value = self.adjust(email, UserCounter::Requests, delta).await?;
        if let Some(count) = value.filter(|c| *c < 0) {
            tracing::warn!(%email, request_count = count, "request count went negative");
        }
        Ok(value)
    }

    async fn adjust(
        &self,
        email: &str,
        counter: UserCounter,
        delta: i64,
    ) -> Result<Option<i64>, AppError> {
        let value = self.store.add_to_user_counter(email, counter, delta).await?;
        if value.is_none() {
            tracing::warn!(%email, counter = counter.attribute(), delta, "counter target has no account");
        }
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn accounts() -> UserAccounts {
        UserAccounts::new(Arc::new(MemoryStore::new()))
    }

    fn upsert(email: &str, membership: Option<Membership>) -> UpsertUserRequest {
        UpsertUserRequest {
            email: Some(email.to_string()),
            name: Some("Ada".into()),
            photourl: None,
            membership,
        }
    }

    #[tokio::test]
    async fn first_upsert_creates_then_updates() {
        let users = accounts();
        assert!(users.upsert_profile(upsert("a@example.com", None)).await.unwrap());
        assert!(!users.upsert_profile(upsert("a@example.com", None)).await.unwrap());

        let profile = users.get_profile("a@example.com").await.unwrap();
        assert_eq!(profile.post_count, 0);
        assert_eq!(profile.membership, Membership::No);
        assert_eq!(users.list_users().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn upsert_never_downgrades_membership() {
        let users = accounts();
        users.upsert_profile(upsert("m@example.com", None)).await.unwrap();
        users.grant_membership("m@example.com").await.unwrap();

        for _ in 0..3 {
            users
                .upsert_profile(upsert("m@example.com", Some(Membership::No)))
                .await
                .unwrap();
        }
        let profile = users.get_profile("m@example.com").await.unwrap();
        assert_eq!(profile.membership, Membership::Yes);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_upserts_create_one_record() {
        let users = Arc::new(accounts());
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let users = Arc::clone(&users);
                tokio::spawn(async move { users.upsert_profile(upsert("race@example.com", None)).await })
            })
            .collect();

        let mut created = 0;
        for handle in handles {
            if handle.await.unwrap().unwrap() {
                created += 1;
            }
        }
        assert_eq!(created, 1);
        assert_eq!(users.list_users().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn rejects_missing_email() {
        let err = accounts()
            .upsert_profile(UpsertUserRequest {
                email: Some("  ".into()),
                name: None,
                photourl: None,
                membership: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
    }

    #[tokio::test]
    async fn membership_for_unknown_user_is_not_found() {
        let err = accounts().grant_membership("ghost@example.com").await.unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
    }

    #[tokio::test]
    async fn counters_for_unknown_users_are_no_ops() {
        let users = accounts();
        assert_eq!(users.adjust_post_count("ghost@example.com", 1).await.unwrap(), None);
        assert!(users.get_profile("ghost@example.com").await.is_err());
    }

    #[tokio::test]
    async fn request_count_may_go_negative() {
        let users = accounts();
        users.upsert_profile(upsert("n@example.com", None)).await.unwrap();
        assert_eq!(users.adjust_request_count("n@example.com", -1).await.unwrap(), Some(-1));
    }
}
