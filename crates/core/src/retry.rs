use crate::error::ServiceError;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub rate_limit_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(1_000),
            rate_limit_delay: Duration::from_millis(5_000),
            max_delay: Duration::from_secs(30),
        }
    }
}

#[derive(Debug)]
pub struct RetryExhausted {
    pub attempts: u32,
    pub last_error: ServiceError,
}

impl RetryPolicy {
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base_delay: Duration::ZERO,
            rate_limit_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    pub fn delay_after(&self, failed_attempt: u32, error: &ServiceError) -> Duration {
        let base = if error.is_rate_limited() {
            self.rate_limit_delay
        } else {
            self.base_delay
        };
        let exponent = failed_attempt.saturating_sub(1).min(16);
        let scaled = base.saturating_mul(1u32 << exponent).min(self.max_delay);

        match error {
            ServiceError::RateLimited {
                retry_after_secs: Some(secs),
                ..
            } => scaled.max(Duration::from_secs(*secs).min(self.max_delay)),
            _ => scaled,
        }
    }

    /// Runs `operation` until it succeeds, `should_retry` rejects the error,
    /// or `max_attempts` is reached. `operation` receives the 1-based attempt.
    pub async fn run<T, F, Fut, P>(
        &self,
        label: &str,
        should_retry: P,
        mut operation: F,
    ) -> Result<T, RetryExhausted>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, ServiceError>>,
        P: Fn(&ServiceError) -> bool,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 1;

        loop {
            match operation(attempt).await {
                Ok(value) => return Ok(value),
                Err(error) => {
                    if attempt >= max_attempts || !should_retry(&error) {
                        return Err(RetryExhausted {
                            attempts: attempt,
                            last_error: error,
                        });
                    }

                    let delay = self.delay_after(attempt, &error);
                    warn!(
                        operation = label,
                        attempt,
                        max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        rate_limited = error.is_rate_limited(),
                        error = %error,
                        "retrying after failure"
                    );
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                    attempt += 1;
                }
            }
        }
    }
}
