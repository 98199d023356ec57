//! Bounded retries for stage calls to external collaborators.
//!
//! Every attempt is capped by a timeout; only errors reporting
//! [`AppError::is_transient`] are retried, with exponential backoff.

use crate::config::RetrySettings;
use crate::error::AppError;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

pub async fn with_retry<T, F, Fut>(
    settings: &RetrySettings,
    timeout: Duration,
    operation: &str,
    mut make_call: F,
) -> Result<T, AppError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, AppError>>,
{
    let max_attempts = settings.max_retries + 1;
    let mut attempt = 0;

    loop {
        let result = match tokio::time::timeout(timeout, make_call()).await {
            Ok(result) => result,
            Err(_) => Err(AppError::Timeout {
                operation: operation.to_string(),
                secs: timeout.as_secs(),
            }),
        };

        match result {
            Ok(value) => {
                if attempt > 0 {
                    debug!(operation, attempt = attempt + 1, "call succeeded after retry");
                }
                return Ok(value);
            }
            Err(error) if error.is_transient() && attempt + 1 < max_attempts => {
                let delay = settings.delay_for_attempt(attempt);
                warn!(
                    operation,
                    error = %error,
                    attempt = attempt + 1,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    "transient failure, will retry after delay"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(error) => {
                if attempt > 0 {
                    warn!(
                        operation,
                        error = %error,
                        attempts = attempt + 1,
                        "call failed after all retry attempts"
                    );
                }
                return Err(error);
            }
        }
    }
}
