use rand::Rng;
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

use crate::constants::replicator::{BACKOFF_FACTOR, BACKOFF_MAX, BACKOFF_MIN};
use crate::errors::ChangesetError;

/// Exponential backoff; create one per retried operation
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    pub min: Duration,
    pub max: Duration,
    pub factor: f64,
    pub jitter: bool,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            min: BACKOFF_MIN,
            max: BACKOFF_MAX,
            factor: BACKOFF_FACTOR,
            jitter: true,
        }
    }
}

impl BackoffPolicy {
    /// Upper bound of the delay before retry number `attempt` (0-based)
    pub fn ceiling(&self, attempt: u32) -> Duration {
        let scaled = self.min.as_secs_f64() * self.factor.powi(attempt.min(63) as i32);
        if !scaled.is_finite() || scaled >= self.max.as_secs_f64() {
            return self.max;
        }
        Duration::from_secs_f64(scaled).max(self.min)
    }

    /// Delay before retry number `attempt`, jittered between `min` and the ceiling
    pub fn delay(&self, attempt: u32) -> Duration {
        let ceiling = self.ceiling(attempt);
        if !self.jitter || ceiling <= self.min {
            return ceiling;
        }
        let secs = rand::thread_rng().gen_range(self.min.as_secs_f64()..=ceiling.as_secs_f64());
        Duration::from_secs_f64(secs)
    }

    /// Runs `f` until it succeeds, retrying up to `max_retries` times
    pub async fn retry<T, E, F, Fut>(
        &self,
        operation: &str,
        max_retries: u32,
        mut f: F,
    ) -> Result<T, ChangesetError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        let mut attempt = 0;
        loop {
            match f().await {
                Ok(value) => return Ok(value),
                Err(e) if attempt >= max_retries => {
                    return Err(ChangesetError::RetriesExhausted {
                        operation: operation.to_string(),
                        attempts: attempt + 1,
                        reason: e.to_string(),
                    })
                }
                Err(e) => {
                    let delay = self.delay(attempt);
                    warn!(
                        "{} failed (attempt {}): {}, retrying in {:?}",
                        operation,
                        attempt + 1,
                        e,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}
