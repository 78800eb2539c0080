//! [`CancelToken`] – cooperative cancellation tripped by a signal handler.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use kiosk_types::EngineError;

/// Polling granularity of [`CancelToken::sleep`].
const SLEEP_SLICE: Duration = Duration::from_millis(200);

/// Shared flag set once a termination signal arrives.
///
/// Clones observe the same flag. Long-running loops call
/// [`CancelToken::check`] so the run unwinds through its RAII guards.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// `Err(EngineError::Interrupted)` once cancelled.
    pub fn check(&self) -> Result<(), EngineError> {
        if self.is_cancelled() {
            Err(EngineError::Interrupted)
        } else {
            Ok(())
        }
    }

    /// Sleep for `duration`, waking early when cancelled.
    pub fn sleep(&self, duration: Duration) -> Result<(), EngineError> {
        let deadline = Instant::now() + duration;
        loop {
            self.check()?;
            let now = Instant::now();
            if now >= deadline {
                return Ok(());
            }
            std::thread::sleep(SLEEP_SLICE.min(deadline - now));
        }
    }
}
