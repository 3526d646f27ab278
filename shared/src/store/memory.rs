//! In-process document store.
//!
//! Used by the test suite and by `STORE_BACKEND=memory` for local runs. All
//! collections sit behind one mutex that is never held across an await, so
//! each trait call is atomic just like a conditional write on DynamoDB.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use super::{DocumentStore, FoodUpdate, StatusChange, StoreError};
use crate::types::{
    FoodFilter, FoodItem, FoodPatch, FoodRequest, FoodStatus, Membership, PaymentRecord,
    ProfileUpsert, UserAccount, UserCounter,
};

#[derive(Default)]
struct Collections {
    users: HashMap<String, UserAccount>,
    foods: HashMap<String, FoodItem>,
    requests: HashMap<String, FoodRequest>,
    /// (food_id, user_email) -> request_id for every active request.
    active: HashMap<(String, String), String>,
    /// Keyed by transaction id.
    payments: HashMap<String, PaymentRecord>,
}

#[derive(Default)]
pub struct MemoryStore {
    collections: Mutex<Collections>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn active_key(food_id: &str, user_email: &str) -> (String, String) {
    (food_id.to_string(), user_email.to_string())
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn upsert_user(&self, profile: &ProfileUpsert) -> Result<bool, StoreError> {
        let mut c = self.collections.lock().await;
        if let Some(existing) = c.users.get_mut(&profile.email) {
            if let Some(name) = &profile.name {
                existing.name = Some(name.clone());
            }
            if let Some(photo) = &profile.photo_url {
                existing.photo_url = Some(photo.clone());
            }
            existing.updated_at = profile.now;
            return Ok(false);
        }
        c.users.insert(
            profile.email.clone(),
            UserAccount {
                user_id: profile.user_id.clone(),
                email: profile.email.clone(),
                name: profile.name.clone(),
                photo_url: profile.photo_url.clone(),
                membership: profile.membership,
                post_count: 0,
                request_count: 0,
                created_at: profile.now,
                updated_at: profile.now,
            },
        );
        Ok(true)
    }

    async fn find_user(&self, email: &str) -> Result<Option<UserAccount>, StoreError> {
        Ok(self.collections.lock().await.users.get(email).cloned())
    }

    async fn list_users(&self) -> Result<Vec<UserAccount>, StoreError> {
        let c = self.collections.lock().await;
        let mut users: Vec<UserAccount> = c.users.values().cloned().collect();
        users.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(users)
    }

    async fn set_membership(
        &self,
        email: &str,
        membership: Membership,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut c = self.collections.lock().await;
        match c.users.get_mut(email) {
            Some(user) => {
                user.membership = membership;
                user.updated_at = now;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn add_to_user_counter(
        &self,
        email: &str,
        counter: UserCounter,
        delta: i64,
    ) -> Result<Option<i64>, StoreError> {
        let mut c = self.collections.lock().await;
        Ok(c.users.get_mut(email).map(|user| {
            let slot = match counter {
                UserCounter::Posts => &mut user.post_count,
                UserCounter::Requests => &mut user.request_count,
            };
            *slot += delta;
            *slot
        }))
    }

    async fn insert_food(&self, item: &FoodItem) -> Result<(), StoreError> {
        let mut c = self.collections.lock().await;
        if c.foods.contains_key(&item.food_id) {
            return Err(StoreError::conflict(format!(
                "food {} already exists",
                item.food_id
            )));
        }
        c.foods.insert(item.food_id.clone(), item.clone());
        Ok(())
    }

    async fn find_food(&self, food_id: &str) -> Result<Option<FoodItem>, StoreError> {
        Ok(self.collections.lock().await.foods.get(food_id).cloned())
    }

    async fn update_food(
        &self,
        food_id: &str,
        patch: &FoodPatch,
        now: DateTime<Utc>,
    ) -> Result<FoodUpdate, StoreError> {
        let mut c = self.collections.lock().await;
        if patch.quantity.is_some() && c.active.keys().any(|(food, _)| food == food_id) {
            return Ok(FoodUpdate::QuantityLocked);
        }
        Ok(match c.foods.get_mut(food_id) {
            Some(item) => {
                patch.apply_to(item, now);
                FoodUpdate::Updated(item.clone())
            }
            None => FoodUpdate::NotFound,
        })
    }

    async fn update_food_status(
        &self,
        food_id: &str,
        target: FoodStatus,
        allowed_from: &[FoodStatus],
        now: DateTime<Utc>,
    ) -> Result<StatusChange, StoreError> {
        let mut c = self.collections.lock().await;
        let Some(item) = c.foods.get_mut(food_id) else {
            return Ok(StatusChange::NotFound);
        };
        if !allowed_from.contains(&item.food_status) {
            return Ok(StatusChange::Rejected {
                current: item.food_status,
            });
        }
        item.food_status = target;
        item.updated_at = now;
        Ok(StatusChange::Updated(item.clone()))
    }

    async fn delete_food(&self, food_id: &str, donor_email: &str) -> Result<bool, StoreError> {
        let mut c = self.collections.lock().await;
        let owned = c
            .foods
            .get(food_id)
            .is_some_and(|item| item.donor_email == donor_email);
        if owned {
            c.foods.remove(food_id);
        }
        Ok(owned)
    }

    async fn find_foods(&self, filter: &FoodFilter) -> Result<Vec<FoodItem>, StoreError> {
        let c = self.collections.lock().await;
        Ok(c.foods
            .values()
            .filter(|item| filter.matches(item))
            .cloned()
            .collect())
    }

    async fn list_foods_by_donor(&self, donor_email: &str) -> Result<Vec<FoodItem>, StoreError> {
        let c = self.collections.lock().await;
        let mut items: Vec<FoodItem> = c
            .foods
            .values()
            .filter(|item| item.donor_email == donor_email)
            .cloned()
            .collect();
        items.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(items)
    }

    async fn add_to_food_quantity(
        &self,
        food_id: &str,
        delta: i64,
    ) -> Result<Option<i64>, StoreError> {
        let mut c = self.collections.lock().await;
        Ok(c.foods.get_mut(food_id).map(|item| {
            item.quantity += delta;
            item.quantity
        }))
    }

    async fn find_active_request(
        &self,
        food_id: &str,
        user_email: &str,
    ) -> Result<Option<FoodRequest>, StoreError> {
        let c = self.collections.lock().await;
        let Some(request_id) = c.active.get(&active_key(food_id, user_email)) else {
            return Ok(None);
        };
        c.requests
            .get(request_id)
            .cloned()
            .map(Some)
            .ok_or_else(|| {
                StoreError::corrupt(format!("active slot points at missing request {request_id}"))
            })
    }

    async fn insert_active_request(&self, request: &FoodRequest) -> Result<(), StoreError> {
        let mut c = self.collections.lock().await;
        let key = active_key(&request.food_id, &request.user_email);
        if c.active.contains_key(&key) {
            return Err(StoreError::conflict(format!(
                "{} already has an active request for food {}",
                request.user_email, request.food_id
            )));
        }
        c.active.insert(key, request.request_id.clone());
        c.requests
            .insert(request.request_id.clone(), request.clone());
        Ok(())
    }

    async fn merge_into_request(
        &self,
        request_id: &str,
        quantity: i64,
        notes: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<Option<FoodRequest>, StoreError> {
        let mut c = self.collections.lock().await;
        let Some(request) = c.requests.get_mut(request_id) else {
            return Ok(None);
        };
        if !request.status.is_active() {
            return Ok(None);
        }
        request.requested_quantity += quantity;
        request.additional_notes = notes;
        request.updated_at = now;
        Ok(Some(request.clone()))
    }

    async fn find_request(&self, request_id: &str) -> Result<Option<FoodRequest>, StoreError> {
        Ok(self.collections.lock().await.requests.get(request_id).cloned())
    }

    async fn delete_request(&self, request: &FoodRequest) -> Result<bool, StoreError> {
        let mut c = self.collections.lock().await;
        if c.requests.remove(&request.request_id).is_none() {
            return Ok(false);
        }
        let key = active_key(&request.food_id, &request.user_email);
        if c.active.get(&key) == Some(&request.request_id) {
            c.active.remove(&key);
        }
        Ok(true)
    }

    async fn list_requests_for_user(
        &self,
        user_email: &str,
    ) -> Result<Vec<FoodRequest>, StoreError> {
        let c = self.collections.lock().await;
        let mut requests: Vec<FoodRequest> = c
            .requests
            .values()
            .filter(|r| r.user_email == user_email)
            .cloned()
            .collect();
        requests.sort_by(|a, b| b.requested_at.cmp(&a.requested_at));
        Ok(requests)
    }

    async fn insert_payment(&self, record: &PaymentRecord) -> Result<(), StoreError> {
        let mut c = self.collections.lock().await;
        if c.payments.contains_key(&record.transaction_id) {
            return Err(StoreError::conflict(format!(
                "payment {} already recorded",
                record.transaction_id
            )));
        }
        c.payments
            .insert(record.transaction_id.clone(), record.clone());
        Ok(())
    }

    async fn list_payments_for_user(&self, email: &str) -> Result<Vec<PaymentRecord>, StoreError> {
        let c = self.collections.lock().await;
        let mut payments: Vec<PaymentRecord> = c
            .payments
            .values()
            .filter(|p| p.email == email)
            .cloned()
            .collect();
        payments.sort_by(|a, b| b.date.cmp(&a.date));
        Ok(payments)
    }

    async fn close(&self) -> Result<(), StoreError> {
        tracing::debug!("memory store closed");
        Ok(())
    }
}
