use std::future::Future;
use std::time::Duration;

use crate::error::{AppError, Dependency};

/// Await `call`, giving up with [`AppError::DependencyTimeout`] once `limit`
/// elapses. The caller gets control back either way.
pub async fn within<T, F>(dependency: Dependency, limit: Duration, call: F) -> Result<T, AppError>
where
    F: Future<Output = Result<T, AppError>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => {
            tracing::warn!(%dependency, limit_ms = limit.as_millis() as u64, "dependency call timed out");
            Err(AppError::DependencyTimeout {
                dependency,
                after: limit,
            })
        }
    }
}
