//! Bearer-token verification against the identity provider.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use aws_sdk_cognitoidentityprovider::{error::SdkError, Client as CognitoClient};
use lambda_http::http::HeaderMap;

use crate::deadline;
use crate::error::{AppError, Dependency};

/// The verified caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub email: String,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait IdentityVerifier: Send + Sync {
    /// Resolve a bearer credential to the caller it belongs to.
    async fn verify(&self, token: &str) -> Result<Principal, AppError>;
}

/// Pull the credential out of `Authorization: Bearer <token>`.
pub fn bearer_token(headers: &HeaderMap) -> Result<&str, AppError> {
    headers
        .get("Authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .ok_or_else(|| AppError::Unauthorized("No token".to_string()))
}

/// Verify the request's bearer token, bounded by `limit`.
pub async fn authenticate(
    verifier: &Arc<dyn IdentityVerifier>,
    headers: &HeaderMap,
    limit: Duration,
) -> Result<Principal, AppError> {
    let token = bearer_token(headers)?;
    deadline::within(Dependency::IdentityProvider, limit, verifier.verify(token)).await
}

/// Fail with 403 unless the caller is `email`.
pub fn require_principal(principal: &Principal, email: &str) -> Result<(), AppError> {
    if principal.email.eq_ignore_ascii_case(email) {
        Ok(())
    } else {
        Err(AppError::forbidden("Forbidden access"))
    }
}

/// Access tokens are checked with Cognito `GetUser`, which both validates the
/// token and returns the account's attributes.
pub struct CognitoVerifier {
    client: CognitoClient,
    /// Operation timeout the client was built with.
    operation_timeout: Duration,
}

impl CognitoVerifier {
    pub fn new(client: CognitoClient, operation_timeout: Duration) -> Self {
        Self {
            client,
            operation_timeout,
        }
    }
}

#[async_trait]
impl IdentityVerifier for CognitoVerifier {
    async fn verify(&self, token: &str) -> Result<Principal, AppError> {
        let output = match self.client.get_user().access_token(token).send().await {
            Ok(output) => output,
            Err(SdkError::ServiceError(err))
                if err.err().is_not_authorized_exception()
                    || err.err().is_user_not_found_exception() =>
            {
                tracing::debug!("access token rejected by identity provider");
                return Err(AppError::forbidden("Invalid token"));
            }
            Err(SdkError::TimeoutError(_)) => {
                return Err(AppError::DependencyTimeout {
                    dependency: Dependency::IdentityProvider,
                    after: self.operation_timeout,
                })
            }
            Err(err) => {
                return Err(AppError::dependency(
                    Dependency::IdentityProvider,
                    aws_sdk_cognitoidentityprovider::error::DisplayErrorContext(&err).to_string(),
                ))
            }
        };

        output
            .user_attributes()
            .iter()
            .find(|attr| attr.name() == "email")
            .and_then(|attr| attr.value())
            .map(|email| Principal {
                email: email.to_string(),
            })
            .ok_or_else(|| AppError::forbidden("Invalid token"))
    }
}
