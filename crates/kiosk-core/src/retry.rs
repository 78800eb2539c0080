//! [`RetryPolicy`] – bounded retries with exponential backoff.
//!
//! Shared by the manifest fetch and every per-file download. Attempt `n`
//! (1-based) that fails is followed by a pause of `base_delay * 2^n`, and at
//! most `max_retries + 1` attempts are made in total.

use std::time::Duration;

use kiosk_types::EngineError;
use tracing::warn;

use crate::cancel::CancelToken;

/// Upper bound on the exponent so the pause cannot overflow.
const MAX_EXPONENT: u32 = 16;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Pause after the failed 1-based `attempt`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.base_delay
            .saturating_mul(1u32 << attempt.min(MAX_EXPONENT))
    }

    /// Run `op` until it succeeds or the attempts are exhausted.
    ///
    /// `op` receives the 1-based attempt number and reports either a
    /// retryable failure or an [`Attempt::Abort`] that ends the loop at once.
    /// The last error is returned when every attempt fails; cancellation
    /// aborts immediately with [`EngineError::Interrupted`].
    pub fn run<T, E, F>(&self, cancel: &CancelToken, label: &str, mut op: F) -> Result<T, RetryError<E>>
    where
        F: FnMut(u32) -> Result<T, Attempt<E>>,
        E: std::fmt::Display,
    {
        let attempts = self.max_attempts();
        let mut attempt = 1;
        loop {
            cancel.check().map_err(RetryError::Aborted)?;
            match op(attempt) {
                Ok(value) => return Ok(value),
                Err(Attempt::Abort(e)) => return Err(RetryError::Aborted(e)),
                Err(Attempt::Retry(e)) if attempt >= attempts => {
                    warn!(target_name = label, attempt, attempts, error = %e, "attempts exhausted");
                    return Err(RetryError::Exhausted { attempts, last: e });
                }
                Err(Attempt::Retry(e)) => {
                    let pause = self.backoff(attempt);
                    warn!(
                        target_name = label,
                        attempt,
                        attempts,
                        backoff_secs = pause.as_secs_f64(),
                        error = %e,
                        "attempt failed, backing off"
                    );
                    cancel.sleep(pause).map_err(RetryError::Aborted)?;
                }
            }
            attempt += 1;
        }
    }
}

/// Failure of a single attempt.
#[derive(Debug)]
pub enum Attempt<E> {
    Retry(E),
    Abort(EngineError),
}

/// Failure of a [`RetryPolicy::run`].
#[derive(Debug)]
pub enum RetryError<E> {
    Exhausted { attempts: u32, last: E },
    /// Cancelled, or the operation reported a non-retryable engine error.
    Aborted(EngineError),
}
