//! External collaborators: image classifier and settlement signer
//!
//! Every call is bounded by a timeout and retried with exponential backoff
//! while the failure is transient. Explicit rejections are never retried.

pub mod classifier;
pub mod http;
pub mod signer;

use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

use crate::error::CoreError;

pub use classifier::{Classifier, HttpClassifier, ImageUpload};
pub use http::{HttpSecurityConfig, SecureHttpClient};
pub use signer::{HttpSigner, SettlementReceipt, SettlementRequest, TokenSigner, UnconfiguredSigner};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExternalError {
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("unavailable: {0}")]
    Unavailable(String),

    /// The collaborator answered and refused the request
    #[error("rejected: {0}")]
    Rejected(String),
}

impl ExternalError {
    pub fn is_transient(&self) -> bool {
        !matches!(self, ExternalError::Rejected(_))
    }

    pub fn into_core(self, service: &'static str) -> CoreError {
        CoreError::ExternalService {
            service,
            reason: self.to_string(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct RetryConfig {
    /// Total attempts including the first
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(5),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Backoff after attempt `attempt` (0-indexed)
    pub fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        let backoff_ms = (self.initial_backoff.as_millis() as f64
            * self.backoff_multiplier.powi(attempt as i32)) as u128;
        let backoff = Duration::from_millis(backoff_ms.min(u64::MAX as u128) as u64);
        backoff.min(self.max_backoff)
    }
}

/// Run `op` until it succeeds, is rejected, or attempts run out. Each attempt
/// is cut off after `timeout`.
pub async fn call_with_retry<T, F, Fut>(
    service: &'static str,
    retry: &RetryConfig,
    timeout: Duration,
    mut op: F,
) -> Result<T, ExternalError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ExternalError>>,
{
    let attempts = retry.max_attempts.max(1);
    let mut attempt = 0;
    loop {
        let outcome = match tokio::time::timeout(timeout, op()).await {
            Ok(result) => result,
            Err(_) => Err(ExternalError::Timeout(timeout)),
        };

        match outcome {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && attempt + 1 < attempts => {
                let backoff = retry.backoff_for_attempt(attempt);
                warn!(
                    service,
                    attempt = attempt + 1,
                    backoff_ms = backoff.as_millis() as u64,
                    error = %e,
                    "External call failed, retrying"
                );
                tokio::time::sleep(backoff).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_retry() -> RetryConfig {
        RetryConfig {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(5),
            backoff_multiplier: 2.0,
        }
    }

    #[test]
    fn test_exponential_backoff() {
        let config = RetryConfig::default();
        assert_eq!(config.backoff_for_attempt(0), Duration::from_millis(100));
        assert_eq!(config.backoff_for_attempt(1), Duration::from_millis(200));
        assert_eq!(config.backoff_for_attempt(10), Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_retry_until_available() {
        let calls = Arc::new(AtomicU32::new(0));
        let result = call_with_retry("test", &fast_retry(), Duration::from_secs(1), || {
            let calls = calls.clone();
            async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(ExternalError::Unavailable("503".to_string()))
                } else {
                    Ok(7)
                }
            }
        })
        .await;
        assert_eq!(result, Ok(7));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_rejection_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let result: Result<(), _> =
            call_with_retry("test", &fast_retry(), Duration::from_secs(1), || {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(ExternalError::Rejected("bad wallet".to_string()))
                }
            })
            .await;
        assert!(matches!(result, Err(ExternalError::Rejected(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_timeout() {
        let result: Result<(), _> =
            call_with_retry("test", &fast_retry(), Duration::from_millis(10), || async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .await;
        assert_eq!(result, Err(ExternalError::Timeout(Duration::from_millis(10))));
    }
}
