//! Payment intents through the payment processor and the local payment
//! history.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use reqwest::{Client, StatusCode};
use serde::Deserialize;

use crate::deadline;
use crate::error::{AppError, Dependency};
use crate::store::DocumentStore;
use crate::types::{PaymentIntent, PaymentRecord, RecordPaymentRequest};

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    /// Open a payment intent for `amount` minor units of `currency`.
    async fn create_intent(&self, amount: i64, currency: &str) -> Result<PaymentIntent, AppError>;
}

#[derive(Deserialize)]
struct IntentDto {
    id: String,
    client_secret: Option<String>,
}

/// Stripe's `POST /v1/payment_intents`, form-encoded with the secret key as
/// bearer credential.
pub struct StripeGateway {
    client: Client,
    api_base: String,
    secret_key: String,
    timeout: Duration,
}

impl StripeGateway {
    /// # Errors
    ///
    /// Returns an error when the reqwest client cannot be constructed.
    pub fn new(
        api_base: impl Into<String>,
        secret_key: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, reqwest::Error> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            api_base: api_base.into(),
            secret_key: secret_key.into(),
            timeout,
        })
    }
}

#[async_trait]
impl PaymentGateway for StripeGateway {
    async fn create_intent(&self, amount: i64, currency: &str) -> Result<PaymentIntent, AppError> {
        let amount = amount.to_string();
        let response = self
            .client
            .post(format!("{}/v1/payment_intents", self.api_base))
            .bearer_auth(&self.secret_key)
            .form(&[
                ("amount", amount.as_str()),
                ("currency", currency),
                ("automatic_payment_methods[enabled]", "true"),
            ])
            .send()
            .await
            .map_err(|e| map_transport_error(e, self.timeout))?;

        let status = response.status();
        let body = response.bytes().await.map_err(|e| map_transport_error(e, self.timeout))?;
        if !status.is_success() {
            return Err(map_status_error(status, body.as_ref()));
        }

        let dto: IntentDto = serde_json::from_slice(&body).map_err(|e| {
            AppError::dependency(
                Dependency::PaymentGateway,
                format!("invalid payment intent payload: {}", e),
            )
        })?;
        let client_secret = dto.client_secret.ok_or_else(|| {
            AppError::dependency(Dependency::PaymentGateway, "payment intent has no client secret")
        })?;
        Ok(PaymentIntent {
            intent_id: dto.id,
            client_secret,
        })
    }
}

fn map_transport_error(error: reqwest::Error, timeout: Duration) -> AppError {
    if error.is_timeout() {
        AppError::DependencyTimeout {
            dependency: Dependency::PaymentGateway,
            after: timeout,
        }
    } else {
        AppError::dependency(Dependency::PaymentGateway, error.to_string())
    }
}

fn map_status_error(status: StatusCode, body: &[u8]) -> AppError {
    const PREVIEW_CHAR_LIMIT: usize = 160;
    let preview: String = String::from_utf8_lossy(body)
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .chars()
        .take(PREVIEW_CHAR_LIMIT)
        .collect();
    AppError::dependency(
        Dependency::PaymentGateway,
        format!("status {}: {}", status.as_u16(), preview),
    )
}

/// Major units to minor units, e.g. 12.34 -> 1234.
pub fn to_minor_units(price: f64) -> Result<i64, AppError> {
    if !price.is_finite() || price <= 0.0 {
        return Err(AppError::validation("Invalid price"));
    }
    let amount = (price * 100.0).round();
    if amount < 1.0 || amount > i64::MAX as f64 {
        return Err(AppError::validation("Invalid price"));
    }
    Ok(amount as i64)
}

pub struct Payments {
    store: Arc<dyn DocumentStore>,
    gateway: Arc<dyn PaymentGateway>,
    currency: String,
    timeout: Duration,
}

impl Payments {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        gateway: Arc<dyn PaymentGateway>,
        currency: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            store,
            gateway,
            currency: currency.into(),
            timeout,
        }
    }

    pub async fn create_intent(&self, price: Option<f64>) -> Result<PaymentIntent, AppError> {
        let price = price.ok_or_else(|| AppError::validation("Invalid price"))?;
        let amount = to_minor_units(price)?;
        let intent = deadline::within(
            Dependency::PaymentGateway,
            self.timeout,
            self.gateway.create_intent(amount, &self.currency),
        )
        .await?;
        tracing::info!(intent_id = %intent.intent_id, amount, currency = %self.currency, "payment intent created");
        Ok(intent)
    }

    pub async fn record_payment(&self, req: RecordPaymentRequest) -> Result<PaymentRecord, AppError> {
        let email = required(req.email, "email")?;
        let transaction_id = required(req.transaction_id, "transactionId")?;
        let status = required(req.status, "status")?;
        let amount = req
            .amount
            .filter(|a| a.is_finite() && *a > 0.0)
            .ok_or_else(|| AppError::validation("Missing required payment fields"))?;

        let record = PaymentRecord {
            payment_id: uuid::Uuid::new_v4().to_string(),
            email,
            amount,
            transaction_id,
            status,
            date: req.date.unwrap_or_else(Utc::now),
        };
        self.store.insert_payment(&record).await?;
        tracing::info!(
            payment_id = %record.payment_id,
            transaction_id = %record.transaction_id,
            "payment recorded"
        );
        Ok(record)
    }

    pub async fn list_for_user(&self, email: &str) -> Result<Vec<PaymentRecord>, AppError> {
        Ok(self.store.list_payments_for_user(email).await?)
    }
}

fn required(value: Option<String>, field: &str) -> Result<String, AppError> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .ok_or_else(|| {
            tracing::debug!(field, "payment field missing");
            AppError::validation("Missing required payment fields")
        })
}
