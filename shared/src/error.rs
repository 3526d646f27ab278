//! Error taxonomy shared by every manager and the HTTP surface.
//!
//! Managers return [`AppError`]; the router turns it into a status code and a
//! `{"error": message}` body with [`AppError::into_response`].

use std::fmt;
use std::time::Duration;

use lambda_http::{http::StatusCode, Body, Response};
use thiserror::Error;

/// External collaborators a request may wait on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dependency {
    DocumentStore,
    IdentityProvider,
    PaymentGateway,
}

impl fmt::Display for Dependency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Dependency::DocumentStore => "document store",
            Dependency::IdentityProvider => "identity provider",
            Dependency::PaymentGateway => "payment gateway",
        })
    }
}

#[derive(Debug, Error)]
pub enum AppError {
    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    Unauthorized(String),

    #[error("{0}")]
    Forbidden(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    #[error("{dependency} failed: {message}")]
    Dependency {
        dependency: Dependency,
        message: String,
    },

    #[error("{dependency} timed out after {}ms", .after.as_millis())]
    DependencyTimeout {
        dependency: Dependency,
        after: Duration,
    },

    #[error("{0}")]
    Internal(String),
}

impl AppError {
    pub fn validation(message: impl Into<String>) -> Self {
        AppError::Validation(message.into())
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        AppError::NotFound(message.into())
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        AppError::Forbidden(message.into())
    }

    pub fn dependency(dependency: Dependency, message: impl Into<String>) -> Self {
        AppError::Dependency {
            dependency,
            message: message.into(),
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            AppError::Validation(_) => StatusCode::BAD_REQUEST,
            AppError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            AppError::Forbidden(_) => StatusCode::FORBIDDEN,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Conflict(_) => StatusCode::CONFLICT,
            AppError::Dependency { .. } => StatusCode::BAD_GATEWAY,
            AppError::DependencyTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Message safe to hand to a client. Internal details stay in the logs.
    pub fn public_message(&self) -> String {
        match self {
            AppError::Internal(_) => "Internal server error".to_string(),
            other => other.to_string(),
        }
    }

    pub fn into_response(self) -> Result<Response<Body>, lambda_http::Error> {
        match &self {
            AppError::Internal(detail) => tracing::error!(error = %detail, "internal error"),
            AppError::Dependency { .. } | AppError::DependencyTimeout { .. } => {
                tracing::error!(error = %self, "dependency failure")
            }
            _ => tracing::debug!(error = %self, status = %self.status(), "request rejected"),
        }

        crate::responses::json(
            self.status(),
            &serde_json::json!({ "error": self.public_message() }),
        )
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::Validation(format!("Invalid request body: {}", err))
    }
}

impl From<lambda_http::Error> for AppError {
    fn from(err: lambda_http::Error) -> Self {
        AppError::Internal(format!("failed to build response: {}", err))
    }
}

impl From<crate::store::StoreError> for AppError {
    fn from(err: crate::store::StoreError) -> Self {
        use crate::store::StoreError;
        match err {
            StoreError::Conflict { message } => AppError::Conflict(message),
            StoreError::Timeout { after } => AppError::DependencyTimeout {
                dependency: Dependency::DocumentStore,
                after,
            },
            StoreError::Backend { message } => {
                AppError::dependency(Dependency::DocumentStore, message)
            }
            StoreError::Corrupt { message } => {
                AppError::Internal(format!("corrupt record: {}", message))
            }
        }
    }
}

impl From<crate::config::ConfigError> for AppError {
    fn from(err: crate::config::ConfigError) -> Self {
        AppError::Internal(err.to_string())
    }
}
