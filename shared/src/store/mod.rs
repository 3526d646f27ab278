//! Document store port and its adapters.
//!
//! Managers only see [`DocumentStore`]. Every counter mutation is an atomic
//! add at the store level, and an active request for a (food, user) pair is
//! unique at the store level too, so no manager has to read-modify-write
//! shared state in process memory.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::types::{
    FoodFilter, FoodItem, FoodPatch, FoodRequest, FoodStatus, Membership, PaymentRecord,
    ProfileUpsert, UserAccount, UserCounter,
};

pub mod dynamo;
pub mod memory;

pub use dynamo::DynamoStore;
pub use memory::MemoryStore;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// A uniqueness condition rejected the write.
    #[error("{message}")]
    Conflict { message: String },

    #[error("document store timed out after {}ms", .after.as_millis())]
    Timeout { after: Duration },

    #[error("document store request failed: {message}")]
    Backend { message: String },

    /// A stored record could not be decoded.
    #[error("{message}")]
    Corrupt { message: String },
}

impl StoreError {
    pub fn conflict(message: impl Into<String>) -> Self {
        StoreError::Conflict {
            message: message.into(),
        }
    }

    pub fn backend(message: impl Into<String>) -> Self {
        StoreError::Backend {
            message: message.into(),
        }
    }

    pub fn corrupt(message: impl Into<String>) -> Self {
        StoreError::Corrupt {
            message: message.into(),
        }
    }
}

/// Result of a conditional status change on a listing.
#[derive(Debug, Clone, PartialEq)]
pub enum StatusChange {
    Updated(FoodItem),
    NotFound,
    /// The listing exists but is in a state the change may not start from.
    Rejected { current: FoodStatus },
}

/// Result of merging a patch into a listing.
#[derive(Debug, Clone, PartialEq)]
pub enum FoodUpdate {
    Updated(FoodItem),
    NotFound,
    /// The patch sets `quantity` while requests are still open against the
    /// listing. Nothing was written.
    QuantityLocked,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Create the profile if the email is new, otherwise refresh display
    /// fields. Returns `true` when a record was created.
    async fn upsert_user(&self, profile: &ProfileUpsert) -> Result<bool, StoreError>;

    async fn find_user(&self, email: &str) -> Result<Option<UserAccount>, StoreError>;

    async fn list_users(&self) -> Result<Vec<UserAccount>, StoreError>;

    /// Returns `false` if no account has this email.
    async fn set_membership(
        &self,
        email: &str,
        membership: Membership,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    /// Atomically add `delta`. Returns the new value, or `None` when the
    /// account does not exist (nothing is created).
    async fn add_to_user_counter(
        &self,
        email: &str,
        counter: UserCounter,
        delta: i64,
    ) -> Result<Option<i64>, StoreError>;

    async fn insert_food(&self, item: &FoodItem) -> Result<(), StoreError>;

    async fn find_food(&self, food_id: &str) -> Result<Option<FoodItem>, StoreError>;

    /// Merge `patch` into the listing. A patch carrying `quantity` is
    /// refused in the same atomic step if any request is active.
    async fn update_food(
        &self,
        food_id: &str,
        patch: &FoodPatch,
        now: DateTime<Utc>,
    ) -> Result<FoodUpdate, StoreError>;

    /// Move the listing to `target` only if it is currently in one of
    /// `allowed_from`.
    async fn update_food_status(
        &self,
        food_id: &str,
        target: FoodStatus,
        allowed_from: &[FoodStatus],
        now: DateTime<Utc>,
    ) -> Result<StatusChange, StoreError>;

    /// Delete the listing if it still belongs to `donor_email`.
    async fn delete_food(&self, food_id: &str, donor_email: &str) -> Result<bool, StoreError>;

    async fn find_foods(&self, filter: &FoodFilter) -> Result<Vec<FoodItem>, StoreError>;

    /// Newest first.
    async fn list_foods_by_donor(&self, donor_email: &str) -> Result<Vec<FoodItem>, StoreError>;

    /// Atomically add `delta` to the listing quantity. `None` when missing.
    async fn add_to_food_quantity(
        &self,
        food_id: &str,
        delta: i64,
    ) -> Result<Option<i64>, StoreError>;

    async fn find_active_request(
        &self,
        food_id: &str,
        user_email: &str,
    ) -> Result<Option<FoodRequest>, StoreError>;

    /// Insert a pending request. Fails with [`StoreError::Conflict`] if the
    /// pair already has an active request.
    async fn insert_active_request(&self, request: &FoodRequest) -> Result<(), StoreError>;

    /// Add `quantity` to an active request and replace its notes. `None` if
    /// the request is gone or no longer active.
    async fn merge_into_request(
        &self,
        request_id: &str,
        quantity: i64,
        notes: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<Option<FoodRequest>, StoreError>;

    async fn find_request(&self, request_id: &str) -> Result<Option<FoodRequest>, StoreError>;

    /// Remove the request and release its active slot in one step. `false`
    /// if it was already gone.
    async fn delete_request(&self, request: &FoodRequest) -> Result<bool, StoreError>;

    /// Most recent first.
    async fn list_requests_for_user(
        &self,
        user_email: &str,
    ) -> Result<Vec<FoodRequest>, StoreError>;

    /// Append a payment. Conflict if the transaction id was already recorded.
    async fn insert_payment(&self, record: &PaymentRecord) -> Result<(), StoreError>;

    async fn list_payments_for_user(&self, email: &str) -> Result<Vec<PaymentRecord>, StoreError>;

    async fn close(&self) -> Result<(), StoreError>;
}
