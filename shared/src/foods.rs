use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::error::AppError;
use crate::store::{DocumentStore, FoodUpdate, StatusChange};
use crate::types::{
    CreateFoodRequest, FoodFilter, FoodItem, FoodPatch, FoodStatus, SortOrder,
};
use crate::users::UserAccounts;

/// Listing ids are UUIDs; anything else is a client error rather than a miss.
pub fn validate_food_id(food_id: &str) -> Result<(), AppError> {
    uuid::Uuid::parse_str(food_id)
        .map(|_| ())
        .map_err(|_| AppError::validation("Invalid food id"))
}

pub struct FoodListings {
    store: Arc<dyn DocumentStore>,
    users: Arc<UserAccounts>,
}

impl FoodListings {
    pub fn new(store: Arc<dyn DocumentStore>, users: Arc<UserAccounts>) -> Self {
        Self { store, users }
    }

    /// Insert an available listing and bump the donor's post count.
    pub async fn create_listing(&self, req: CreateFoodRequest) -> Result<FoodItem, AppError> {
        let extra = req.extra_fields();
        let donor_email = non_blank(req.donor_email);
        let food_name = non_blank(req.food_name);
        let (Some(donor_email), Some(food_name)) = (donor_email, food_name) else {
            return Err(AppError::validation("donorEmail and foodName are required"));
        };
        let quantity = req.quantity.unwrap_or(1);
        if quantity < 0 {
            return Err(AppError::validation("foodQuantity must not be negative"));
        }

        let now = Utc::now();
        let item = FoodItem {
            food_id: uuid::Uuid::new_v4().to_string(),
            donor_email,
            donor_name: req.donor_name,
            donor_image: req.donor_image,
            food_name,
            food_image: req.food_image,
            quantity,
            pickup_location: req.pickup_location,
            expires_at: req.expires_at,
            additional_notes: req.additional_notes,
            food_status: FoodStatus::Available,
            extra,
            created_at: now,
            updated_at: now,
        };
        self.store.insert_food(&item).await?;
        tracing::info!(food_id = %item.food_id, donor = %item.donor_email, "listing created");

        // The listing stands even if the counter can't be bumped.
        if let Err(e) = self.users.adjust_post_count(&item.donor_email, 1).await {
            tracing::warn!(donor = %item.donor_email, error = %e, "post count not incremented");
        }
        Ok(item)
    }

    pub async fn get_listing(&self, food_id: &str) -> Result<FoodItem, AppError> {
        validate_food_id(food_id)?;
        self.store
            .find_food(food_id)
            .await?
            .ok_or_else(|| AppError::not_found("Food not found"))
    }

    /// Merge display fields into a listing. The quantity is frozen once
    /// someone has an active request against it.
    pub async fn update_listing(&self, food_id: &str, patch: FoodPatch) -> Result<FoodItem, AppError> {
        validate_food_id(food_id)?;
        let patch = patch.sanitized();
        if patch.is_empty() {
            return Err(AppError::validation("No fields to update"));
        }
        if patch.quantity.is_some_and(|q| q < 0) {
            return Err(AppError::validation("foodQuantity must not be negative"));
        }

        match self.store.update_food(food_id, &patch, Utc::now()).await? {
            FoodUpdate::Updated(item) => {
                tracing::info!(%food_id, "listing updated");
                Ok(item)
            }
            FoodUpdate::NotFound => Err(AppError::not_found("Food not found")),
            FoodUpdate::QuantityLocked => Err(AppError::validation(
                "foodQuantity cannot change while requests are active",
            )),
        }
    }

    /// Move a listing along its lifecycle; `requested` when no target given.
    pub async fn transition_status(
        &self,
        food_id: &str,
        target: Option<FoodStatus>,
    ) -> Result<FoodItem, AppError> {
        validate_food_id(food_id)?;
        let target = target.unwrap_or(FoodStatus::Requested);
        match self
            .store
            .update_food_status(food_id, target, target.allowed_predecessors(), Utc::now())
            .await?
        {
            StatusChange::Updated(item) => {
                tracing::info!(%food_id, status = target.as_str(), "listing status changed");
                Ok(item)
            }
            StatusChange::NotFound => Err(AppError::not_found("Food not found")),
            StatusChange::Rejected { current } => Err(AppError::validation(format!(
                "Cannot change food status from {} to {}",
                current.as_str(),
                target.as_str()
            ))),
        }
    }

    /// Remove a listing owned by `requester_email`. Requests against it are
    /// left in place.
    pub async fn delete_listing(&self, food_id: &str, requester_email: &str) -> Result<(), AppError> {
        validate_food_id(food_id)?;
        let item = self
            .store
            .find_food(food_id)
            .await?
            .ok_or_else(|| AppError::not_found("Food not found"))?;
        if !item.donor_email.eq_ignore_ascii_case(requester_email) {
            tracing::warn!(%food_id, requester = %requester_email, "delete refused for non-owner");
            return Err(AppError::forbidden("Forbidden: not your listing"));
        }
        if !self.store.delete_food(food_id, &item.donor_email).await? {
            return Err(AppError::not_found("Food not found"));
        }
        tracing::info!(%food_id, "listing deleted");
        Ok(())
    }

    /// Listings matching `filter` that have not expired by `cutoff`, ordered
    /// by expiry.
    pub async fn search(
        &self,
        status: Option<FoodStatus>,
        name: Option<&str>,
        cutoff: DateTime<Utc>,
        order: SortOrder,
    ) -> Result<Vec<FoodItem>, AppError> {
        let filter = FoodFilter {
            status,
            name_contains: name
                .map(|n| n.trim().to_lowercase())
                .filter(|n| !n.is_empty()),
            expires_after: Some(cutoff),
        };
        let mut items = self.store.find_foods(&filter).await?;
        items.sort_by(|a, b| match order {
            SortOrder::Ascending => a.expires_at.cmp(&b.expires_at),
            SortOrder::Descending => b.expires_at.cmp(&a.expires_at),
        });
        Ok(items)
    }

    pub async fn list_for_donor(&self, donor_email: &str) -> Result<Vec<FoodItem>, AppError> {
        Ok(self.store.list_foods_by_donor(donor_email).await?)
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::types::{FoodRequest, RequestStatus, UpsertUserRequest};
    use chrono::Duration;

    struct Fixture {
        store: Arc<MemoryStore>,
        users: Arc<UserAccounts>,
        foods: FoodListings,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let users = Arc::new(UserAccounts::new(store.clone()));
        let foods = FoodListings::new(store.clone(), Arc::clone(&users));
        Fixture { store, users, foods }
    }

    fn listing(donor: &str, name: &str, expires_in: Duration) -> CreateFoodRequest {
        CreateFoodRequest {
            donor_email: Some(donor.to_string()),
            food_name: Some(name.to_string()),
            quantity: Some(2),
            expires_at: Some(Utc::now() + expires_in),
            ..Default::default()
        }
    }

    async fn register(users: &UserAccounts, email: &str) {
        users
            .upsert_profile(UpsertUserRequest {
                email: Some(email.to_string()),
                name: None,
                photourl: None,
                membership: None,
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn creating_a_listing_bumps_post_count_by_one() {
        let fx = fixture();
        register(&fx.users, "donor@example.com").await;
        let before = fx.users.get_profile("donor@example.com").await.unwrap().post_count;

        let item = fx
            .foods
            .create_listing(listing("donor@example.com", "Apples", Duration::days(1)))
            .await
            .unwrap();

        let after = fx.users.get_profile("donor@example.com").await.unwrap().post_count;
        assert_eq!(after, before + 1);
        assert_eq!(item.food_status, FoodStatus::Available);
    }

    #[tokio::test]
    async fn listing_without_a_profile_still_gets_created() {
        let fx = fixture();
        let item = fx
            .foods
            .create_listing(listing("anon@example.com", "Pears", Duration::days(1)))
            .await
            .unwrap();
        assert!(fx.foods.get_listing(&item.food_id).await.is_ok());
    }

    #[tokio::test]
    async fn create_requires_donor_and_name() {
        let fx = fixture();
        let mut req = listing("donor@example.com", "", Duration::days(1));
        req.food_name = Some("   ".into());
        assert!(matches!(
            fx.foods.create_listing(req).await,
            Err(AppError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn quantity_defaults_to_one() {
        let fx = fixture();
        let mut req = listing("donor@example.com", "Milk", Duration::days(1));
        req.quantity = None;
        assert_eq!(fx.foods.create_listing(req).await.unwrap().quantity, 1);
    }

    #[tokio::test]
    async fn malformed_ids_are_validation_errors() {
        let fx = fixture();
        assert!(matches!(
            fx.foods.get_listing("not-a-uuid").await,
            Err(AppError::Validation(_))
        ));
        assert!(matches!(
            fx.foods.get_listing(&uuid::Uuid::new_v4().to_string()).await,
            Err(AppError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn non_owner_delete_is_forbidden_and_leaves_listing_unchanged() {
        let fx = fixture();
        let item = fx
            .foods
            .create_listing(listing("donor@example.com", "Bread", Duration::days(1)))
            .await
            .unwrap();

        let err = fx
            .foods
            .delete_listing(&item.food_id, "thief@example.com")
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Forbidden(_)));
        assert_eq!(fx.foods.get_listing(&item.food_id).await.unwrap(), item);

        fx.foods
            .delete_listing(&item.food_id, "donor@example.com")
            .await
            .unwrap();
        assert!(matches!(
            fx.foods.get_listing(&item.food_id).await,
            Err(AppError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn owner_may_delete_whatever_the_email_case() {
        let fx = fixture();
        let item = fx
            .foods
            .create_listing(listing("Donor@Example.com", "Rolls", Duration::days(1)))
            .await
            .unwrap();

        fx.foods
            .delete_listing(&item.food_id, "donor@example.com")
            .await
            .unwrap();
        assert!(fx.store.find_food(&item.food_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn search_never_returns_expired_listings() {
        let fx = fixture();
        for (name, offset) in [
            ("Old Soup", Duration::hours(-3)),
            ("Fresh Soup", Duration::hours(5)),
            ("Soup Later", Duration::days(2)),
            ("Stale Rice", Duration::minutes(-1)),
        ] {
            fx.foods
                .create_listing(listing("donor@example.com", name, offset))
                .await
                .unwrap();
        }

        let now = Utc::now();
        let found = fx
            .foods
            .search(Some(FoodStatus::Available), None, now, SortOrder::Ascending)
            .await
            .unwrap();
        assert_eq!(found.len(), 2);
        assert!(found.iter().all(|f| f.expires_at.unwrap() > now));
        assert_eq!(found[0].food_name, "Fresh Soup");

        let desc = fx
            .foods
            .search(Some(FoodStatus::Available), Some("SOUP"), now, SortOrder::Descending)
            .await
            .unwrap();
        assert_eq!(
            desc.iter().map(|f| f.food_name.as_str()).collect::<Vec<_>>(),
            vec!["Soup Later", "Fresh Soup"]
        );
    }

    #[tokio::test]
    async fn quantity_is_frozen_while_requests_are_active() {
        let fx = fixture();
        let item = fx
            .foods
            .create_listing(listing("donor@example.com", "Eggs", Duration::days(1)))
            .await
            .unwrap();
        let now = Utc::now();
        fx.store
            .insert_active_request(&FoodRequest {
                request_id: uuid::Uuid::new_v4().to_string(),
                food_id: item.food_id.clone(),
                user_email: "hungry@example.com".into(),
                requested_quantity: 1,
                additional_notes: None,
                status: RequestStatus::Pending,
                requested_at: now,
                updated_at: now,
            })
            .await
            .unwrap();

        let quantity_patch = FoodPatch {
            quantity: Some(10),
            ..Default::default()
        };
        assert!(matches!(
            fx.foods.update_listing(&item.food_id, quantity_patch).await,
            Err(AppError::Validation(_))
        ));

        let rename = FoodPatch {
            food_name: Some("Brown Eggs".into()),
            ..Default::default()
        };
        let updated = fx.foods.update_listing(&item.food_id, rename).await.unwrap();
        assert_eq!(updated.food_name, "Brown Eggs");
        assert_eq!(updated.quantity, 2);
    }

    #[tokio::test]
    async fn empty_patches_are_rejected() {
        let fx = fixture();
        let item = fx
            .foods
            .create_listing(listing("donor@example.com", "Tea", Duration::days(1)))
            .await
            .unwrap();
        assert!(matches!(
            fx.foods.update_listing(&item.food_id, FoodPatch::default()).await,
            Err(AppError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn status_follows_the_listing_lifecycle() {
        let fx = fixture();
        let item = fx
            .foods
            .create_listing(listing("donor@example.com", "Cake", Duration::days(1)))
            .await
            .unwrap();

        let requested = fx.foods.transition_status(&item.food_id, None).await.unwrap();
        assert_eq!(requested.food_status, FoodStatus::Requested);

        fx.foods
            .transition_status(&item.food_id, Some(FoodStatus::Completed))
            .await
            .unwrap();
        let err = fx
            .foods
            .transition_status(&item.food_id, Some(FoodStatus::Available))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
    }

    #[tokio::test]
    async fn donor_listings_come_back_newest_first() {
        let fx = fixture();
        let first = fx
            .foods
            .create_listing(listing("donor@example.com", "One", Duration::days(1)))
            .await
            .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let second = fx
            .foods
            .create_listing(listing("donor@example.com", "Two", Duration::days(1)))
            .await
            .unwrap();
        fx.foods
            .create_listing(listing("other@example.com", "Three", Duration::days(1)))
            .await
            .unwrap();

        let mine = fx.foods.list_for_donor("donor@example.com").await.unwrap();
        assert_eq!(
            mine.iter().map(|f| f.food_id.clone()).collect::<Vec<_>>(),
            vec![second.food_id, first.food_id]
        );
    }
}
