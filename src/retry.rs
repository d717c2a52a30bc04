//! Bounded retry loop around one render attempt.

use crate::{Config, RenderError};
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Attempts including the first one
    pub max_attempts: usize,
    /// Fixed pause between attempts
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 2,
            backoff: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_attempts: config.max_retries.max(1),
            backoff: config.retry_backoff,
        }
    }

    /// Run `job` until it succeeds or the attempts are used up.
    ///
    /// `job` receives the zero-based attempt number. Errors that cannot be
    /// fixed by retrying are returned as they are; otherwise the last error is
    /// wrapped in [`RenderError::AttemptsExhausted`].
    pub async fn run<T, F, Fut>(&self, mut job: F) -> Result<T, RenderError>
    where
        F: FnMut(usize) -> Fut,
        Fut: Future<Output = Result<T, RenderError>>,
    {
        let attempts = self.max_attempts.max(1);
        let mut last_error = None;

        for attempt in 0..attempts {
            match job(attempt).await {
                Ok(value) => return Ok(value),
                Err(e) if !e.is_retryable() => return Err(e),
                Err(e) => {
                    warn!(
                        "Attempt {}/{} failed ({}): {}",
                        attempt + 1,
                        attempts,
                        e.kind(),
                        e
                    );
                    last_error = Some(e);

                    if attempt + 1 < attempts {
                        debug!("Retrying after {:?}", self.backoff);
                        sleep(self.backoff).await;
                    }
                }
            }
        }

        Err(RenderError::AttemptsExhausted {
            attempts,
            last: Box::new(
                last_error.unwrap_or_else(|| RenderError::Page("no attempt was made".into())),
            ),
        })
    }
}
