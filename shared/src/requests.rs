//! Food-request lifecycle.
//!
//! A (food, user) pair has at most one active request. Submissions for a pair
//! that already has one merge into it; the store enforces uniqueness and a
//! submission that loses a race re-reads and merges on the next attempt.
//!
//! Cancelling deletes the request first and then restores the listing's
//! quantity and the requester's counter. Those follow-ups are reported one by
//! one so a caller can tell a clean cancel from a partial one.

use std::sync::Arc;

use chrono::Utc;

use crate::error::AppError;
use crate::store::{DocumentStore, StoreError};
use crate::types::{FoodRequest, RequestStatus, SubmitFoodRequest};
use crate::users::UserAccounts;

/// Attempts before a contended submission gives up with a conflict.
const MAX_SUBMIT_ATTEMPTS: usize = 3;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    Merged { request_id: String, new_quantity: i64 },
    Inserted { inserted_id: String },
}

/// Result of one follow-up step of a cancellation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SideEffect {
    Applied,
    /// The record to adjust no longer exists; nothing to do.
    TargetMissing,
    Failed(String),
}

impl SideEffect {
    pub fn is_failed(&self) -> bool {
        matches!(self, SideEffect::Failed(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CancelReport {
    pub request_id: String,
    pub food_id: String,
    pub user_email: String,
    pub food_restored: SideEffect,
    pub user_adjusted: SideEffect,
}

impl CancelReport {
    /// Names of the steps that took effect (or had nothing to do).
    pub fn completed_steps(&self) -> Vec<&'static str> {
        let mut steps = vec!["request_deleted"];
        if !self.food_restored.is_failed() {
            steps.push("food_quantity_restored");
        }
        if !self.user_adjusted.is_failed() {
            steps.push("request_count_adjusted");
        }
        steps
    }

    pub fn failed_steps(&self) -> Vec<&'static str> {
        let mut steps = Vec::new();
        if self.food_restored.is_failed() {
            steps.push("food_quantity_restored");
        }
        if self.user_adjusted.is_failed() {
            steps.push("request_count_adjusted");
        }
        steps
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CancelOutcome {
    Completed(CancelReport),
    /// The request is gone but at least one follow-up failed.
    PartiallyApplied(CancelReport),
}

fn side_effect(result: Result<Option<i64>, AppError>) -> SideEffect {
    match result {
        Ok(Some(_)) => SideEffect::Applied,
        Ok(None) => SideEffect::TargetMissing,
        Err(e) => SideEffect::Failed(e.to_string()),
    }
}

pub struct RequestLifecycle {
    store: Arc<dyn DocumentStore>,
    users: Arc<UserAccounts>,
}

impl RequestLifecycle {
    pub fn new(store: Arc<dyn DocumentStore>, users: Arc<UserAccounts>) -> Self {
        Self { store, users }
    }

    /// Open a request for a listing, or add to the caller's active one.
    pub async fn submit_request(&self, req: SubmitFoodRequest) -> Result<SubmitOutcome, AppError> {
        let food_id = req.food_id.map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let user_email = req.user_email.map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let (Some(food_id), Some(user_email)) = (food_id, user_email) else {
            return Err(AppError::validation("foodId and userEmail are required"));
        };
        let quantity = match req.requested_quantity {
            Some(q) if q > 0 => q,
            _ => return Err(AppError::validation("requestedQuantity must be a positive integer")),
        };

        for attempt in 1..=MAX_SUBMIT_ATTEMPTS {
            let now = Utc::now();
            let existing = match self.store.find_active_request(&food_id, &user_email).await {
                Ok(existing) => existing,
                Err(StoreError::Conflict { .. }) => {
                    tracing::debug!(attempt, %food_id, %user_email, "active request moving, retrying");
                    continue;
                }
                Err(e) => return Err(e.into()),
            };
            if let Some(existing) = existing {
                match self
                    .store
                    .merge_into_request(&existing.request_id, quantity, req.notes.clone(), now)
                    .await
                {
                    Err(StoreError::Conflict { .. }) => {
                        tracing::debug!(attempt, request_id = %existing.request_id, "merge contended, retrying");
                        continue;
                    }
                    Err(e) => return Err(e.into()),
                    Ok(Some(merged)) => {
                        tracing::info!(
                            request_id = %merged.request_id,
                            %food_id,
                            %user_email,
                            new_quantity = merged.requested_quantity,
                            "request merged"
                        );
                        return Ok(SubmitOutcome::Merged {
                            request_id: merged.request_id,
                            new_quantity: merged.requested_quantity,
                        });
                    }
                    Ok(None) => {
                        tracing::debug!(attempt, request_id = %existing.request_id, "merge target went away, retrying");
                        continue;
                    }
                }
            }

            let request = FoodRequest {
                request_id: uuid::Uuid::new_v4().to_string(),
                food_id: food_id.clone(),
                user_email: user_email.clone(),
                requested_quantity: quantity,
                additional_notes: req.notes.clone(),
                status: RequestStatus::Pending,
                requested_at: now,
                updated_at: now,
            };
            match self.store.insert_active_request(&request).await {
                Ok(()) => {
                    tracing::info!(request_id = %request.request_id, %food_id, %user_email, quantity, "request created");
                    return Ok(SubmitOutcome::Inserted {
                        inserted_id: request.request_id,
                    });
                }
                Err(StoreError::Conflict { .. }) => {
                    tracing::debug!(attempt, %food_id, %user_email, "lost insert race, retrying as merge");
                }
                Err(e) => return Err(e.into()),
            }
        }

        tracing::warn!(%food_id, %user_email, "request submission exhausted retries");
        Err(AppError::Conflict(
            "Request is being updated concurrently, please retry".to_string(),
        ))
    }

    /// Delete a request, then give its unit back to the listing and take one
    /// off the requester's count. When `owner` is set, only that user may
    /// cancel.
    pub async fn cancel_request(
        &self,
        request_id: &str,
        owner: Option<&str>,
    ) -> Result<CancelOutcome, AppError> {
        let request = self
            .store
            .find_request(request_id)
            .await?
            .ok_or_else(|| AppError::not_found("Request not found"))?;
        if let Some(owner) = owner {
            if !request.user_email.eq_ignore_ascii_case(owner) {
                return Err(AppError::forbidden("Forbidden access"));
            }
        }

        if !self.store.delete_request(&request).await? {
            // Someone else cancelled it between the read and the delete.
            return Err(AppError::not_found("Request not found"));
        }

        let food_restored = side_effect(
            self.store
                .add_to_food_quantity(&request.food_id, 1)
                .await
                .map_err(AppError::from),
        );
        let user_adjusted = side_effect(self.users.adjust_request_count(&request.user_email, -1).await);

        let report = CancelReport {
            request_id: request.request_id,
            food_id: request.food_id,
            user_email: request.user_email,
            food_restored,
            user_adjusted,
        };

        if report.food_restored.is_failed() || report.user_adjusted.is_failed() {
            tracing::error!(
                request_id = %report.request_id,
                food_id = %report.food_id,
                user_email = %report.user_email,
                food_quantity_delta = if report.food_restored.is_failed() { 1 } else { 0 },
                request_count_delta = if report.user_adjusted.is_failed() { -1 } else { 0 },
                "cancellation partially applied; pending compensation"
            );
            return Ok(CancelOutcome::PartiallyApplied(report));
        }

        tracing::info!(
            request_id = %report.request_id,
            food_restored = ?report.food_restored,
            user_adjusted = ?report.user_adjusted,
            "request cancelled"
        );
        Ok(CancelOutcome::Completed(report))
    }

    /// Most recent first.
    pub async fn list_requests_for_user(&self, user_email: &str) -> Result<Vec<FoodRequest>, AppError> {
        Ok(self.store.list_requests_for_user(user_email).await?)
    }
}
