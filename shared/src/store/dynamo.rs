//! DynamoDB single-table adapter.
//!
//! | Record        | PK                     | SK                 | GSI1PK              |
//! |---------------|------------------------|--------------------|---------------------|
//! | user          | `USER#{email}`         | `PROFILE`          |                     |
//! | food          | `FOOD#{id}`            | `METADATA`         | `DONOR#{email}`     |
//! | active slot   | `FOOD#{food_id}`       | `ACTIVE#{email}`   |                     |
//! | open count    | `FOOD#{food_id}`       | `OPEN_REQUESTS`    |                     |
//! | request       | `REQUEST#{id}`         | `METADATA`         | `REQUESTER#{email}` |
//! | payment       | `PAYMENT#{txn_id}`     | `METADATA`         | `PAYER#{email}`     |
//!
//! `GSI1SK` holds the record's creation timestamp so index queries come back
//! in time order. The open count moves in the same transactions that write
//! and delete active slots, and gates quantity edits on the listing.

use std::collections::HashMap;
use std::future::Future;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use aws_sdk_dynamodb::{
    error::{DisplayErrorContext, SdkError},
    operation::{transact_write_items::TransactWriteItemsError, update_item::UpdateItemError},
    types::{AttributeValue, ConditionCheck, Delete, Put, ReturnValue, TransactWriteItem, Update},
    Client as DynamoClient,
};
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

use super::{DocumentStore, FoodUpdate, StatusChange, StoreError};
use crate::types::{
    format_timestamp, parse_timestamp, FoodFilter, FoodItem, FoodPatch, FoodRequest, FoodStatus,
    Membership, PaymentRecord, ProfileUpsert, RequestStatus, UserAccount, UserCounter,
};

type Item = HashMap<String, AttributeValue>;

const GSI1: &str = "GSI1";
const METADATA: &str = "METADATA";
const PROFILE: &str = "PROFILE";
/// Per-listing count of active requests, kept beside the listing itself.
const OPEN_REQUESTS: &str = "OPEN_REQUESTS";
const SLOT_READS: usize = 3;

fn user_pk(email: &str) -> String {
    format!("USER#{}", email)
}

fn food_pk(food_id: &str) -> String {
    format!("FOOD#{}", food_id)
}

fn active_sk(user_email: &str) -> String {
    format!("ACTIVE#{}", user_email)
}

fn request_pk(request_id: &str) -> String {
    format!("REQUEST#{}", request_id)
}

fn payment_pk(transaction_id: &str) -> String {
    format!("PAYMENT#{}", transaction_id)
}

pub struct DynamoStore {
    client: DynamoClient,
    table_name: String,
    /// Operation timeout the SDK client was configured with; reported when
    /// a call times out.
    operation_timeout: Duration,
}

impl DynamoStore {
    pub fn new(client: DynamoClient, table_name: impl Into<String>, operation_timeout: Duration) -> Self {
        Self {
            client,
            table_name: table_name.into(),
            operation_timeout,
        }
    }

    /// Build the adapter and make sure the table is reachable before any
    /// request is served.
    pub async fn open(
        client: DynamoClient,
        table_name: impl Into<String>,
        operation_timeout: Duration,
    ) -> Result<Self, StoreError> {
        let store = Self::new(client, table_name, operation_timeout);
        store
            .client
            .describe_table()
            .table_name(&store.table_name)
            .send()
            .await
            .map_err(|e| store.sdk_error(e))?;
        tracing::info!(table = %store.table_name, "document store connected");
        Ok(store)
    }

    fn sdk_error<E, R>(&self, err: SdkError<E, R>) -> StoreError
    where
        E: std::error::Error + Send + Sync + 'static,
        R: std::fmt::Debug + Send + Sync + 'static,
    {
        match err {
            SdkError::TimeoutError(_) => StoreError::Timeout {
                after: self.operation_timeout,
            },
            other => StoreError::backend(DisplayErrorContext(&other).to_string()),
        }
    }

    async fn get(&self, pk: String, sk: &str) -> Result<Option<Item>, StoreError> {
        let result = self
            .client
            .get_item()
            .table_name(&self.table_name)
            .key("PK", AttributeValue::S(pk))
            .key("SK", AttributeValue::S(sk.to_string()))
            .consistent_read(true)
            .send()
            .await
            .map_err(|e| self.sdk_error(e))?;
        Ok(result.item().cloned())
    }

    /// Run an index query on `GSI1PK = gsi_pk`, newest first.
    async fn query_index(&self, gsi_pk: String) -> Result<Vec<Item>, StoreError> {
        let items: Result<Vec<Item>, _> = self
            .client
            .query()
            .table_name(&self.table_name)
            .index_name(GSI1)
            .key_condition_expression("GSI1PK = :pk")
            .expression_attribute_values(":pk", AttributeValue::S(gsi_pk))
            .scan_index_forward(false)
            .into_paginator()
            .items()
            .send()
            .collect()
            .await;
        items.map_err(|e| self.sdk_error(e))
    }

    async fn add_counter(
        &self,
        pk: String,
        sk: &str,
        attribute: &str,
        delta: i64,
    ) -> Result<Option<i64>, StoreError> {
        let mut expr = UpdateExpr::default();
        expr.add(attribute, AttributeValue::N(delta.to_string()));

        let result = expr
            .apply(
                self.client
                    .update_item()
                    .table_name(&self.table_name)
                    .key("PK", AttributeValue::S(pk))
                    .key("SK", AttributeValue::S(sk.to_string())),
            )
            .condition_expression("attribute_exists(PK)")
            .return_values(ReturnValue::UpdatedNew)
            .send()
            .await;

        match result {
            Ok(output) => output
                .attributes()
                .and_then(|attrs| get_n::<i64>(attrs, attribute))
                .map(Some)
                .ok_or_else(|| StoreError::corrupt(format!("{} missing after update", attribute))),
            Err(e) if is_conditional_failure(&e) => Ok(None),
            Err(e) => Err(self.sdk_error(e)),
        }
    }

    /// Apply a patch that sets `quantity`, checking in the same transaction
    /// that no request is open against the listing.
    async fn update_food_quantity(
        &self,
        food_id: &str,
        expr: UpdateExpr,
    ) -> Result<FoodUpdate, StoreError> {
        let update = expr.into_update(
            &self.table_name,
            food_pk(food_id),
            METADATA,
            Some("attribute_exists(PK)"),
        )?;
        let unlocked = ConditionCheck::builder()
            .table_name(&self.table_name)
            .key("PK", AttributeValue::S(food_pk(food_id)))
            .key("SK", AttributeValue::S(OPEN_REQUESTS.to_string()))
            .condition_expression("attribute_not_exists(PK) OR #open_requests <= :zero")
            .expression_attribute_names("#open_requests", "open_requests")
            .expression_attribute_values(":zero", AttributeValue::N("0".to_string()))
            .build()
            .map_err(|e| StoreError::backend(format!("failed to build condition check: {}", e)))?;

        let result = self
            .client
            .transact_write_items()
            .transact_items(TransactWriteItem::builder().update(update).build())
            .transact_items(TransactWriteItem::builder().condition_check(unlocked).build())
            .send()
            .await;

        match result {
            // Transactions return no attributes; read the listing back.
            Ok(_) => Ok(match self.find_food(food_id).await? {
                Some(item) => FoodUpdate::Updated(item),
                None => FoodUpdate::NotFound,
            }),
            Err(e) => match transaction_cancel(&e) {
                Some(TransactionCancel::ConditionFailed(failed)) if failed.contains(&0) => {
                    Ok(FoodUpdate::NotFound)
                }
                Some(TransactionCancel::ConditionFailed(_)) => Ok(FoodUpdate::QuantityLocked),
                Some(TransactionCancel::Contention) => Err(StoreError::conflict(format!(
                    "food {} is being updated concurrently",
                    food_id
                ))),
                None => Err(self.sdk_error(e)),
            },
        }
    }

    /// `ADD open_requests :delta` on the listing's open count, as a
    /// transaction item.
    fn open_requests_delta(&self, food_id: &str, delta: i64) -> Result<Update, StoreError> {
        let mut expr = UpdateExpr::default();
        expr.add("open_requests", AttributeValue::N(delta.to_string()));
        expr.into_update(&self.table_name, food_pk(food_id), OPEN_REQUESTS, None)
    }
}

#[async_trait]
impl DocumentStore for DynamoStore {
    async fn upsert_user(&self, profile: &ProfileUpsert) -> Result<bool, StoreError> {
        let now = AttributeValue::S(format_timestamp(&profile.now));
        let mut expr = UpdateExpr::default();
        expr.set("email", AttributeValue::S(profile.email.clone()))
            .set("updated_at", now.clone())
            .set_if_absent("user_id", AttributeValue::S(profile.user_id.clone()))
            .set_if_absent("membership", AttributeValue::S(profile.membership.as_str().to_string()))
            .set_if_absent("post_count", AttributeValue::N("0".to_string()))
            .set_if_absent("request_count", AttributeValue::N("0".to_string()))
            .set_if_absent("created_at", now);
        if let Some(name) = &profile.name {
            expr.set("name", AttributeValue::S(name.clone()));
        }
        if let Some(photo) = &profile.photo_url {
            expr.set("photourl", AttributeValue::S(photo.clone()));
        }

        // A single keyed item per email: concurrent upserts land on the same
        // record. ALL_OLD is empty exactly when this write created it.
        let output = expr
            .apply(
                self.client
                    .update_item()
                    .table_name(&self.table_name)
                    .key("PK", AttributeValue::S(user_pk(&profile.email)))
                    .key("SK", AttributeValue::S(PROFILE.to_string())),
            )
            .return_values(ReturnValue::AllOld)
            .send()
            .await
            .map_err(|e| self.sdk_error(e))?;

        Ok(output.attributes().map_or(true, |old| old.is_empty()))
    }

    async fn find_user(&self, email: &str) -> Result<Option<UserAccount>, StoreError> {
        self.get(user_pk(email), PROFILE)
            .await?
            .map(|item| decode_user(&item))
            .transpose()
    }

    async fn list_users(&self) -> Result<Vec<UserAccount>, StoreError> {
        let items: Result<Vec<Item>, _> = self
            .client
            .scan()
            .table_name(&self.table_name)
            .filter_expression("begins_with(PK, :prefix) AND SK = :sk")
            .expression_attribute_values(":prefix", AttributeValue::S("USER#".to_string()))
            .expression_attribute_values(":sk", AttributeValue::S(PROFILE.to_string()))
            .into_paginator()
            .items()
            .send()
            .collect()
            .await;
        let mut users = items
            .map_err(|e| self.sdk_error(e))?
            .iter()
            .map(decode_user)
            .collect::<Result<Vec<_>, _>>()?;
        users.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(users)
    }

    async fn set_membership(
        &self,
        email: &str,
        membership: Membership,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut expr = UpdateExpr::default();
        expr.set("membership", AttributeValue::S(membership.as_str().to_string()))
            .set("updated_at", AttributeValue::S(format_timestamp(&now)));

        let result = expr
            .apply(
                self.client
                    .update_item()
                    .table_name(&self.table_name)
                    .key("PK", AttributeValue::S(user_pk(email)))
                    .key("SK", AttributeValue::S(PROFILE.to_string())),
            )
            .condition_expression("attribute_exists(PK)")
            .send()
            .await;

        match result {
            Ok(_) => Ok(true),
            Err(e) if is_conditional_failure(&e) => Ok(false),
            Err(e) => Err(self.sdk_error(e)),
        }
    }

    async fn add_to_user_counter(
        &self,
        email: &str,
        counter: UserCounter,
        delta: i64,
    ) -> Result<Option<i64>, StoreError> {
        self.add_counter(user_pk(email), PROFILE, counter.attribute(), delta)
            .await
    }

    async fn insert_food(&self, item: &FoodItem) -> Result<(), StoreError> {
        let result = self
            .client
            .put_item()
            .table_name(&self.table_name)
            .set_item(Some(encode_food(item)))
            .condition_expression("attribute_not_exists(PK)")
            .send()
            .await;

        match result {
            Ok(_) => Ok(()),
            Err(e) if is_conditional_failure(&e) => Err(StoreError::conflict(format!(
                "food {} already exists",
                item.food_id
            ))),
            Err(e) => Err(self.sdk_error(e)),
        }
    }

    async fn find_food(&self, food_id: &str) -> Result<Option<FoodItem>, StoreError> {
        self.get(food_pk(food_id), METADATA)
            .await?
            .map(|item| decode_food(&item))
            .transpose()
    }

    async fn update_food(
        &self,
        food_id: &str,
        patch: &FoodPatch,
        now: DateTime<Utc>,
    ) -> Result<FoodUpdate, StoreError> {
        let mut expr = UpdateExpr::default();
        expr.set("updated_at", AttributeValue::S(format_timestamp(&now)));
        set_opt(&mut expr, "donor_name", &patch.donor_name);
        set_opt(&mut expr, "donor_image", &patch.donor_image);
        set_opt(&mut expr, "food_image", &patch.food_image);
        set_opt(&mut expr, "pickup_location", &patch.pickup_location);
        set_opt(&mut expr, "additional_notes", &patch.additional_notes);
        if let Some(name) = &patch.food_name {
            expr.set("food_name", AttributeValue::S(name.clone()))
                .set("food_name_search", AttributeValue::S(name.to_lowercase()));
        }
        if let Some(quantity) = patch.quantity {
            expr.set("quantity", AttributeValue::N(quantity.to_string()));
        }
        if let Some(expiry) = &patch.expires_at {
            expr.set("expires_at", AttributeValue::S(format_timestamp(expiry)));
        }
        for (i, (key, value)) in patch.extra.iter().enumerate() {
            expr.set_map_entry("extra", i, key, AttributeValue::S(value.to_string()));
        }

        if patch.quantity.is_some() {
            return self.update_food_quantity(food_id, expr).await;
        }

        let result = expr
            .apply(
                self.client
                    .update_item()
                    .table_name(&self.table_name)
                    .key("PK", AttributeValue::S(food_pk(food_id)))
                    .key("SK", AttributeValue::S(METADATA.to_string())),
            )
            .condition_expression("attribute_exists(PK)")
            .return_values(ReturnValue::AllNew)
            .send()
            .await;

        match result {
            Ok(output) => match output.attributes() {
                Some(attrs) => Ok(FoodUpdate::Updated(decode_food(attrs)?)),
                None => Err(StoreError::corrupt("food update returned no attributes")),
            },
            Err(e) if is_conditional_failure(&e) => Ok(FoodUpdate::NotFound),
            Err(e) if is_update_contention(&e) => Err(StoreError::conflict(format!(
                "food {} is being updated concurrently",
                food_id
            ))),
            Err(e) => Err(self.sdk_error(e)),
        }
    }

    async fn update_food_status(
        &self,
        food_id: &str,
        target: FoodStatus,
        allowed_from: &[FoodStatus],
        now: DateTime<Utc>,
    ) -> Result<StatusChange, StoreError> {
        if allowed_from.is_empty() {
            return match self.find_food(food_id).await? {
                Some(item) => Ok(StatusChange::Rejected {
                    current: item.food_status,
                }),
                None => Ok(StatusChange::NotFound),
            };
        }

        let mut expr = UpdateExpr::default();
        expr.set("food_status", AttributeValue::S(target.as_str().to_string()))
            .set("updated_at", AttributeValue::S(format_timestamp(&now)));
        let placeholders: Vec<String> = allowed_from
            .iter()
            .enumerate()
            .map(|(i, status)| {
                let placeholder = format!(":from{}", i);
                expr.value(&placeholder, AttributeValue::S(status.as_str().to_string()));
                placeholder
            })
            .collect();
        let condition = format!(
            "attribute_exists(PK) AND #food_status IN ({})",
            placeholders.join(", ")
        );

        let result = expr
            .apply(
                self.client
                    .update_item()
                    .table_name(&self.table_name)
                    .key("PK", AttributeValue::S(food_pk(food_id)))
                    .key("SK", AttributeValue::S(METADATA.to_string())),
            )
            .condition_expression(condition)
            .return_values(ReturnValue::AllNew)
            .send()
            .await;

        match result {
            Ok(output) => match output.attributes() {
                Some(attrs) => Ok(StatusChange::Updated(decode_food(attrs)?)),
                None => Err(StoreError::corrupt("status update returned no attributes")),
            },
            // Either missing or in the wrong state; read back to tell which.
            Err(e) if is_conditional_failure(&e) => match self.find_food(food_id).await? {
                Some(item) => Ok(StatusChange::Rejected {
                    current: item.food_status,
                }),
                None => Ok(StatusChange::NotFound),
            },
            Err(e) => Err(self.sdk_error(e)),
        }
    }

    async fn delete_food(&self, food_id: &str, donor_email: &str) -> Result<bool, StoreError> {
        let result = self
            .client
            .delete_item()
            .table_name(&self.table_name)
            .key("PK", AttributeValue::S(food_pk(food_id)))
            .key("SK", AttributeValue::S(METADATA.to_string()))
            .condition_expression("attribute_exists(PK) AND #donor_email = :donor")
            .expression_attribute_names("#donor_email", "donor_email")
            .expression_attribute_values(":donor", AttributeValue::S(donor_email.to_string()))
            .send()
            .await;

        match result {
            Ok(_) => Ok(true),
            Err(e) if is_conditional_failure(&e) => Ok(false),
            Err(e) => Err(self.sdk_error(e)),
        }
    }

    async fn find_foods(&self, filter: &FoodFilter) -> Result<Vec<FoodItem>, StoreError> {
        let mut conditions = vec!["begins_with(PK, :prefix)".to_string(), "SK = :sk".to_string()];
        let mut names = HashMap::new();
        let mut values = HashMap::new();
        values.insert(":prefix".to_string(), AttributeValue::S("FOOD#".to_string()));
        values.insert(":sk".to_string(), AttributeValue::S(METADATA.to_string()));

        if let Some(status) = filter.status {
            conditions.push("#food_status = :status".to_string());
            names.insert("#food_status".to_string(), "food_status".to_string());
            values.insert(":status".to_string(), AttributeValue::S(status.as_str().to_string()));
        }
        if let Some(cutoff) = &filter.expires_after {
            conditions.push("#expires_at > :cutoff".to_string());
            names.insert("#expires_at".to_string(), "expires_at".to_string());
            values.insert(":cutoff".to_string(), AttributeValue::S(format_timestamp(cutoff)));
        }
        if let Some(needle) = filter.name_contains.as_deref().filter(|n| !n.is_empty()) {
            conditions.push("contains(#food_name_search, :needle)".to_string());
            names.insert("#food_name_search".to_string(), "food_name_search".to_string());
            values.insert(":needle".to_string(), AttributeValue::S(needle.to_string()));
        }

        let items: Result<Vec<Item>, _> = self
            .client
            .scan()
            .table_name(&self.table_name)
            .filter_expression(conditions.join(" AND "))
            .set_expression_attribute_names((!names.is_empty()).then_some(names))
            .set_expression_attribute_values(Some(values))
            .into_paginator()
            .items()
            .send()
            .collect()
            .await;

        items
            .map_err(|e| self.sdk_error(e))?
            .iter()
            .map(decode_food)
            .collect()
    }

    async fn list_foods_by_donor(&self, donor_email: &str) -> Result<Vec<FoodItem>, StoreError> {
        self.query_index(format!("DONOR#{}", donor_email))
            .await?
            .iter()
            .map(decode_food)
            .collect()
    }

    async fn add_to_food_quantity(
        &self,
        food_id: &str,
        delta: i64,
    ) -> Result<Option<i64>, StoreError> {
        self.add_counter(food_pk(food_id), METADATA, "quantity", delta)
            .await
    }

    async fn find_active_request(
        &self,
        food_id: &str,
        user_email: &str,
    ) -> Result<Option<FoodRequest>, StoreError> {
        let (pk, sk) = (food_pk(food_id), active_sk(user_email));
        let (pk, sk) = (&pk, &sk);
        follow_active_slot(
            move || async move {
                self.get(pk.clone(), sk)
                    .await?
                    .map(|slot| require_s(&slot, "request_id"))
                    .transpose()
            },
            move |request_id: String| async move { self.find_request(&request_id).await },
        )
        .await
    }

    async fn insert_active_request(&self, request: &FoodRequest) -> Result<(), StoreError> {
        let slot = Put::builder()
            .table_name(&self.table_name)
            .set_item(Some(encode_active_slot(request)))
            .condition_expression("attribute_not_exists(PK)")
            .build()
            .map_err(|e| StoreError::backend(format!("failed to build put: {}", e)))?;
        let record = Put::builder()
            .table_name(&self.table_name)
            .set_item(Some(encode_request(request)))
            .condition_expression("attribute_not_exists(PK)")
            .build()
            .map_err(|e| StoreError::backend(format!("failed to build put: {}", e)))?;
        let opened = self.open_requests_delta(&request.food_id, 1)?;

        let result = self
            .client
            .transact_write_items()
            .transact_items(TransactWriteItem::builder().put(slot).build())
            .transact_items(TransactWriteItem::builder().put(record).build())
            .transact_items(TransactWriteItem::builder().update(opened).build())
            .send()
            .await;

        match result {
            Ok(_) => Ok(()),
            Err(e) => match transaction_cancel(&e) {
                Some(TransactionCancel::ConditionFailed(_)) => Err(StoreError::conflict(format!(
                    "{} already has an active request for food {}",
                    request.user_email, request.food_id
                ))),
                Some(TransactionCancel::Contention) => Err(StoreError::conflict(format!(
                    "active request for {} on food {} is being written concurrently",
                    request.user_email, request.food_id
                ))),
                None => Err(self.sdk_error(e)),
            },
        }
    }

    async fn merge_into_request(
        &self,
        request_id: &str,
        quantity: i64,
        notes: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<Option<FoodRequest>, StoreError> {
        let mut expr = UpdateExpr::default();
        expr.add("requested_quantity", AttributeValue::N(quantity.to_string()))
            .set("updated_at", AttributeValue::S(format_timestamp(&now)));
        match notes {
            Some(notes) => {
                expr.set("additional_notes", AttributeValue::S(notes));
            }
            None => {
                expr.remove("additional_notes");
            }
        }
        expr.name("status")
            .value(":pending", AttributeValue::S(RequestStatus::Pending.as_str().to_string()))
            .value(":accepted", AttributeValue::S(RequestStatus::Accepted.as_str().to_string()));

        let result = expr
            .apply(
                self.client
                    .update_item()
                    .table_name(&self.table_name)
                    .key("PK", AttributeValue::S(request_pk(request_id)))
                    .key("SK", AttributeValue::S(METADATA.to_string())),
            )
            .condition_expression("attribute_exists(PK) AND #status IN (:pending, :accepted)")
            .return_values(ReturnValue::AllNew)
            .send()
            .await;

        match result {
            Ok(output) => output.attributes().map(decode_request).transpose(),
            Err(e) if is_conditional_failure(&e) => Ok(None),
            // A cancel transaction holds the item; the caller re-reads and retries.
            Err(e) if is_update_contention(&e) => Err(StoreError::conflict(format!(
                "request {} is being updated concurrently",
                request_id
            ))),
            Err(e) => Err(self.sdk_error(e)),
        }
    }

    async fn find_request(&self, request_id: &str) -> Result<Option<FoodRequest>, StoreError> {
        self.get(request_pk(request_id), METADATA)
            .await?
            .map(|item| decode_request(&item))
            .transpose()
    }

    async fn delete_request(&self, request: &FoodRequest) -> Result<bool, StoreError> {
        let record = Delete::builder()
            .table_name(&self.table_name)
            .key("PK", AttributeValue::S(request_pk(&request.request_id)))
            .key("SK", AttributeValue::S(METADATA.to_string()))
            .condition_expression("attribute_exists(PK)")
            .build()
            .map_err(|e| StoreError::backend(format!("failed to build delete: {}", e)))?;
        // The slot must still point at this request, so the open count only
        // drops for a slot that really goes away.
        let slot = Delete::builder()
            .table_name(&self.table_name)
            .key("PK", AttributeValue::S(food_pk(&request.food_id)))
            .key("SK", AttributeValue::S(active_sk(&request.user_email)))
            .condition_expression("request_id = :rid")
            .expression_attribute_values(":rid", AttributeValue::S(request.request_id.clone()))
            .build()
            .map_err(|e| StoreError::backend(format!("failed to build delete: {}", e)))?;
        let closed = self.open_requests_delta(&request.food_id, -1)?;

        let result = self
            .client
            .transact_write_items()
            .transact_items(TransactWriteItem::builder().delete(record).build())
            .transact_items(TransactWriteItem::builder().delete(slot).build())
            .transact_items(TransactWriteItem::builder().update(closed).build())
            .send()
            .await;

        match result {
            Ok(_) => Ok(true),
            Err(e) => match transaction_cancel(&e) {
                Some(TransactionCancel::ConditionFailed(_)) => Ok(false),
                Some(TransactionCancel::Contention) => Err(StoreError::conflict(format!(
                    "request {} is being updated concurrently",
                    request.request_id
                ))),
                None => Err(self.sdk_error(e)),
            },
        }
    }

    async fn list_requests_for_user(
        &self,
        user_email: &str,
    ) -> Result<Vec<FoodRequest>, StoreError> {
        self.query_index(format!("REQUESTER#{}", user_email))
            .await?
            .iter()
            .map(decode_request)
            .collect()
    }

    async fn insert_payment(&self, record: &PaymentRecord) -> Result<(), StoreError> {
        let result = self
            .client
            .put_item()
            .table_name(&self.table_name)
            .set_item(Some(encode_payment(record)))
            .condition_expression("attribute_not_exists(PK)")
            .send()
            .await;

        match result {
            Ok(_) => Ok(()),
            Err(e) if is_conditional_failure(&e) => Err(StoreError::conflict(format!(
                "payment {} already recorded",
                record.transaction_id
            ))),
            Err(e) => Err(self.sdk_error(e)),
        }
    }

    async fn list_payments_for_user(&self, email: &str) -> Result<Vec<PaymentRecord>, StoreError> {
        self.query_index(format!("PAYER#{}", email))
            .await?
            .iter()
            .map(decode_payment)
            .collect()
    }

    async fn close(&self) -> Result<(), StoreError> {
        tracing::info!(table = %self.table_name, "document store closed");
        Ok(())
    }
}

/// Resolve an active slot to its request. A cancel may delete both between
/// the two reads, so a missing request sends us back to the slot; only a slot
/// that keeps pointing at the same missing request is corrupt.
async fn follow_active_slot<Slot, SlotFut, Lookup, LookupFut>(
    mut read_slot: Slot,
    mut read_request: Lookup,
) -> Result<Option<FoodRequest>, StoreError>
where
    Slot: FnMut() -> SlotFut,
    SlotFut: Future<Output = Result<Option<String>, StoreError>>,
    Lookup: FnMut(String) -> LookupFut,
    LookupFut: Future<Output = Result<Option<FoodRequest>, StoreError>>,
{
    let mut dangling: Option<String> = None;
    for _ in 0..SLOT_READS {
        let Some(request_id) = read_slot().await? else {
            return Ok(None);
        };
        if let Some(request) = read_request(request_id.clone()).await? {
            return Ok(Some(request));
        }
        if dangling.as_deref() == Some(request_id.as_str()) {
            return Err(StoreError::corrupt(format!(
                "active slot points at missing request {}",
                request_id
            )));
        }
        dangling = Some(request_id);
    }
    Err(StoreError::conflict("active slot kept changing while being read"))
}

// ========== conditional-failure detection ==========

/// Implemented by every single-item write error that can carry a failed
/// condition.
trait ConditionalError {
    fn is_condition_failed(&self) -> bool;
}

macro_rules! conditional_error {
    ($($ty:ty),* $(,)?) => {
        $(impl ConditionalError for $ty {
            fn is_condition_failed(&self) -> bool {
                self.is_conditional_check_failed_exception()
            }
        })*
    };
}

conditional_error!(
    aws_sdk_dynamodb::operation::put_item::PutItemError,
    aws_sdk_dynamodb::operation::update_item::UpdateItemError,
    aws_sdk_dynamodb::operation::delete_item::DeleteItemError,
);

fn is_conditional_failure<E: ConditionalError, R>(err: &SdkError<E, R>) -> bool {
    err.as_service_error()
        .is_some_and(ConditionalError::is_condition_failed)
}

fn is_update_contention<R>(err: &SdkError<UpdateItemError, R>) -> bool {
    err.as_service_error()
        .is_some_and(UpdateItemError::is_transaction_conflict_exception)
}

/// Why a `TransactWriteItems` call was cancelled, read from its per-item
/// reasons.
#[derive(Debug, PartialEq)]
enum TransactionCancel {
    /// Conditions failed on the items at these positions.
    ConditionFailed(Vec<usize>),
    /// Another write to one of the items was in flight. Safe to retry.
    Contention,
}

fn transaction_cancel<R>(err: &SdkError<TransactWriteItemsError, R>) -> Option<TransactionCancel> {
    let Some(TransactWriteItemsError::TransactionCanceledException(cancelled)) =
        err.as_service_error()
    else {
        return None;
    };
    let reasons = cancelled.cancellation_reasons();
    let failed: Vec<usize> = reasons
        .iter()
        .enumerate()
        .filter(|(_, reason)| reason.code() == Some("ConditionalCheckFailed"))
        .map(|(i, _)| i)
        .collect();
    if !failed.is_empty() {
        return Some(TransactionCancel::ConditionFailed(failed));
    }
    reasons
        .iter()
        .any(|reason| reason.code() == Some("TransactionConflict"))
        .then_some(TransactionCancel::Contention)
}

// ========== update expressions ==========

/// Accumulates an update expression with placeholder names for every
/// attribute, so reserved words (`name`, `status`, `date`) never matter.
#[derive(Default)]
struct UpdateExpr {
    sets: Vec<String>,
    adds: Vec<String>,
    removes: Vec<String>,
    names: HashMap<String, String>,
    values: HashMap<String, AttributeValue>,
}

impl UpdateExpr {
    fn name(&mut self, attribute: &str) -> &mut Self {
        self.names
            .insert(format!("#{}", attribute), attribute.to_string());
        self
    }

    fn value(&mut self, placeholder: &str, value: AttributeValue) -> &mut Self {
        self.values.insert(placeholder.to_string(), value);
        self
    }

    fn set(&mut self, attribute: &str, value: AttributeValue) -> &mut Self {
        self.name(attribute).value(&format!(":{}", attribute), value);
        self.sets.push(format!("#{0} = :{0}", attribute));
        self
    }

    fn set_if_absent(&mut self, attribute: &str, value: AttributeValue) -> &mut Self {
        self.name(attribute).value(&format!(":{}", attribute), value);
        self.sets
            .push(format!("#{0} = if_not_exists(#{0}, :{0})", attribute));
        self
    }

    /// `SET #map.#key = :value` for one entry of a map attribute.
    fn set_map_entry(&mut self, map: &str, index: usize, key: &str, value: AttributeValue) -> &mut Self {
        let key_name = format!("#{}_k{}", map, index);
        let placeholder = format!(":{}_v{}", map, index);
        self.name(map);
        self.names.insert(key_name.clone(), key.to_string());
        self.values.insert(placeholder.clone(), value);
        self.sets
            .push(format!("#{}.{} = {}", map, key_name, placeholder));
        self
    }

    fn add(&mut self, attribute: &str, value: AttributeValue) -> &mut Self {
        self.name(attribute).value(&format!(":{}", attribute), value);
        self.adds.push(format!("#{0} :{0}", attribute));
        self
    }

    fn remove(&mut self, attribute: &str) -> &mut Self {
        self.name(attribute);
        self.removes.push(format!("#{}", attribute));
        self
    }

    fn expression(&self) -> String {
        let mut clauses = Vec::new();
        if !self.sets.is_empty() {
            clauses.push(format!("SET {}", self.sets.join(", ")));
        }
        if !self.adds.is_empty() {
            clauses.push(format!("ADD {}", self.adds.join(", ")));
        }
        if !self.removes.is_empty() {
            clauses.push(format!("REMOVE {}", self.removes.join(", ")));
        }
        clauses.join(" ")
    }

    /// The same expression as one item of a `TransactWriteItems` call.
    fn into_update(
        self,
        table_name: &str,
        pk: String,
        sk: &str,
        condition: Option<&str>,
    ) -> Result<Update, StoreError> {
        let expression = self.expression();
        Update::builder()
            .table_name(table_name)
            .key("PK", AttributeValue::S(pk))
            .key("SK", AttributeValue::S(sk.to_string()))
            .update_expression(expression)
            .set_condition_expression(condition.map(str::to_string))
            .set_expression_attribute_names(Some(self.names))
            .set_expression_attribute_values((!self.values.is_empty()).then_some(self.values))
            .build()
            .map_err(|e| StoreError::backend(format!("failed to build update: {}", e)))
    }

    fn apply(
        self,
        builder: aws_sdk_dynamodb::operation::update_item::builders::UpdateItemFluentBuilder,
    ) -> aws_sdk_dynamodb::operation::update_item::builders::UpdateItemFluentBuilder {
        let expression = self.expression();
        builder
            .update_expression(expression)
            .set_expression_attribute_names(Some(self.names))
            .set_expression_attribute_values((!self.values.is_empty()).then_some(self.values))
    }
}

fn set_opt(expr: &mut UpdateExpr, attribute: &str, value: &Option<String>) {
    if let Some(v) = value {
        expr.set(attribute, AttributeValue::S(v.clone()));
    }
}

// ========== encoding ==========

fn put_s(item: &mut Item, key: &str, value: impl Into<String>) {
    item.insert(key.to_string(), AttributeValue::S(value.into()));
}

fn put_opt_s(item: &mut Item, key: &str, value: &Option<String>) {
    if let Some(v) = value {
        put_s(item, key, v.clone());
    }
}

fn put_n(item: &mut Item, key: &str, value: impl ToString) {
    item.insert(key.to_string(), AttributeValue::N(value.to_string()));
}

fn encode_food(food: &FoodItem) -> Item {
    let mut item = Item::new();
    put_s(&mut item, "PK", food_pk(&food.food_id));
    put_s(&mut item, "SK", METADATA);
    put_s(&mut item, "GSI1PK", format!("DONOR#{}", food.donor_email));
    put_s(&mut item, "GSI1SK", format_timestamp(&food.created_at));
    put_s(&mut item, "food_id", food.food_id.clone());
    put_s(&mut item, "donor_email", food.donor_email.clone());
    put_opt_s(&mut item, "donor_name", &food.donor_name);
    put_opt_s(&mut item, "donor_image", &food.donor_image);
    put_s(&mut item, "food_name", food.food_name.clone());
    put_s(&mut item, "food_name_search", food.food_name.to_lowercase());
    put_opt_s(&mut item, "food_image", &food.food_image);
    put_n(&mut item, "quantity", food.quantity);
    put_opt_s(&mut item, "pickup_location", &food.pickup_location);
    if let Some(expiry) = &food.expires_at {
        put_s(&mut item, "expires_at", format_timestamp(expiry));
    }
    put_opt_s(&mut item, "additional_notes", &food.additional_notes);
    put_s(&mut item, "food_status", food.food_status.as_str());
    // Always present so patches can set individual entries.
    item.insert(
        "extra".to_string(),
        AttributeValue::M(
            food.extra
                .iter()
                .map(|(k, v)| (k.clone(), AttributeValue::S(v.to_string())))
                .collect(),
        ),
    );
    put_s(&mut item, "created_at", format_timestamp(&food.created_at));
    put_s(&mut item, "updated_at", format_timestamp(&food.updated_at));
    item
}

fn encode_active_slot(request: &FoodRequest) -> Item {
    let mut item = Item::new();
    put_s(&mut item, "PK", food_pk(&request.food_id));
    put_s(&mut item, "SK", active_sk(&request.user_email));
    put_s(&mut item, "request_id", request.request_id.clone());
    put_s(&mut item, "created_at", format_timestamp(&request.requested_at));
    item
}

fn encode_request(request: &FoodRequest) -> Item {
    let mut item = Item::new();
    put_s(&mut item, "PK", request_pk(&request.request_id));
    put_s(&mut item, "SK", METADATA);
    put_s(&mut item, "GSI1PK", format!("REQUESTER#{}", request.user_email));
    put_s(&mut item, "GSI1SK", format_timestamp(&request.requested_at));
    put_s(&mut item, "request_id", request.request_id.clone());
    put_s(&mut item, "food_id", request.food_id.clone());
    put_s(&mut item, "user_email", request.user_email.clone());
    put_n(&mut item, "requested_quantity", request.requested_quantity);
    put_opt_s(&mut item, "additional_notes", &request.additional_notes);
    put_s(&mut item, "status", request.status.as_str());
    put_s(&mut item, "requested_at", format_timestamp(&request.requested_at));
    put_s(&mut item, "updated_at", format_timestamp(&request.updated_at));
    item
}

fn encode_payment(record: &PaymentRecord) -> Item {
    let mut item = Item::new();
    put_s(&mut item, "PK", payment_pk(&record.transaction_id));
    put_s(&mut item, "SK", METADATA);
    put_s(&mut item, "GSI1PK", format!("PAYER#{}", record.email));
    put_s(&mut item, "GSI1SK", format_timestamp(&record.date));
    put_s(&mut item, "payment_id", record.payment_id.clone());
    put_s(&mut item, "email", record.email.clone());
    put_n(&mut item, "amount", record.amount);
    put_s(&mut item, "transaction_id", record.transaction_id.clone());
    put_s(&mut item, "status", record.status.clone());
    put_s(&mut item, "date", format_timestamp(&record.date));
    item
}

// ========== decoding ==========

fn get_s(item: &Item, key: &str) -> Option<String> {
    item.get(key).and_then(|v| v.as_s().ok()).cloned()
}

fn get_n<T: FromStr>(item: &Item, key: &str) -> Option<T> {
    item.get(key)
        .and_then(|v| v.as_n().ok())
        .and_then(|n| n.parse().ok())
}

fn require_s(item: &Item, key: &str) -> Result<String, StoreError> {
    get_s(item, key).ok_or_else(|| StoreError::corrupt(format!("record is missing {}", key)))
}

fn require_n<T: FromStr>(item: &Item, key: &str) -> Result<T, StoreError> {
    get_n(item, key).ok_or_else(|| StoreError::corrupt(format!("record has no numeric {}", key)))
}

fn require_ts(item: &Item, key: &str) -> Result<DateTime<Utc>, StoreError> {
    let raw = require_s(item, key)?;
    parse_timestamp(&raw).ok_or_else(|| StoreError::corrupt(format!("{} is not a timestamp: {}", key, raw)))
}

fn decode_user(item: &Item) -> Result<UserAccount, StoreError> {
    let membership = require_s(item, "membership")?;
    Ok(UserAccount {
        user_id: require_s(item, "user_id")?,
        email: require_s(item, "email")?,
        name: get_s(item, "name"),
        photo_url: get_s(item, "photourl"),
        membership: Membership::parse(&membership)
            .ok_or_else(|| StoreError::corrupt(format!("unknown membership {}", membership)))?,
        post_count: get_n(item, "post_count").unwrap_or(0),
        request_count: get_n(item, "request_count").unwrap_or(0),
        created_at: require_ts(item, "created_at")?,
        updated_at: require_ts(item, "updated_at")?,
    })
}

fn decode_food(item: &Item) -> Result<FoodItem, StoreError> {
    let status = require_s(item, "food_status")?;
    let extra: Map<String, Value> = item
        .get("extra")
        .and_then(|v| v.as_m().ok())
        .map(|m| {
            m.iter()
                .filter_map(|(k, v)| {
                    let raw = v.as_s().ok()?;
                    Some((k.clone(), serde_json::from_str(raw).unwrap_or(Value::String(raw.clone()))))
                })
                .collect()
        })
        .unwrap_or_default();

    Ok(FoodItem {
        food_id: require_s(item, "food_id")?,
        donor_email: require_s(item, "donor_email")?,
        donor_name: get_s(item, "donor_name"),
        donor_image: get_s(item, "donor_image"),
        food_name: require_s(item, "food_name")?,
        food_image: get_s(item, "food_image"),
        quantity: require_n(item, "quantity")?,
        pickup_location: get_s(item, "pickup_location"),
        expires_at: get_s(item, "expires_at").and_then(|raw| parse_timestamp(&raw)),
        additional_notes: get_s(item, "additional_notes"),
        food_status: FoodStatus::parse(&status)
            .ok_or_else(|| StoreError::corrupt(format!("unknown food status {}", status)))?,
        extra,
        created_at: require_ts(item, "created_at")?,
        updated_at: require_ts(item, "updated_at")?,
    })
}

fn decode_request(item: &Item) -> Result<FoodRequest, StoreError> {
    let status = require_s(item, "status")?;
    Ok(FoodRequest {
        request_id: require_s(item, "request_id")?,
        food_id: require_s(item, "food_id")?,
        user_email: require_s(item, "user_email")?,
        requested_quantity: require_n(item, "requested_quantity")?,
        additional_notes: get_s(item, "additional_notes"),
        status: RequestStatus::parse(&status)
            .ok_or_else(|| StoreError::corrupt(format!("unknown request status {}", status)))?,
        requested_at: require_ts(item, "requested_at")?,
        updated_at: require_ts(item, "updated_at")?,
    })
}

fn decode_payment(item: &Item) -> Result<PaymentRecord, StoreError> {
    Ok(PaymentRecord {
        payment_id: require_s(item, "payment_id")?,
        email: require_s(item, "email")?,
        amount: require_n(item, "amount")?,
        transaction_id: require_s(item, "transaction_id")?,
        status: require_s(item, "status")?,
        date: require_ts(item, "date")?,
    })
}
