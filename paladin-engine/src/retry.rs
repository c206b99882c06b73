//! Indefinite retry with exponential backoff.
//!
//! Used by the domain init loop: every failure is retried until success or
//! scope cancellation, with the delay growing by `factor` up to `max_delay`.

use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{EngineError, Result};

/// Exponential backoff policy.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Delay before the first retry.
    pub initial: Duration,
    /// Multiplier applied after every failure.
    pub factor: f64,
    /// Ceiling on the delay.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(250),
            factor: 2.0,
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// A fast policy for tests.
    #[must_use]
    pub const fn fast() -> Self {
        Self {
            initial: Duration::from_millis(1),
            factor: 1.5,
            max_delay: Duration::from_millis(20),
        }
    }

    /// The delay before retry `attempt` (1-based).
    #[must_use]
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = self.factor.max(1.0).powi(attempt.saturating_sub(1) as i32);
        let delay = self.initial.mul_f64(factor);
        delay.min(self.max_delay)
    }

    /// Run `operation` until it succeeds or `cancel` fires.
    ///
    /// Every failure is logged and retried indefinitely; only cancellation
    /// is terminal.
    pub async fn run_indefinitely<T, F, Fut>(
        &self,
        cancel: &CancellationToken,
        mut operation: F,
    ) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let mut attempt: u32 = 1;
        loop {
            if cancel.is_cancelled() {
                return Err(EngineError::Cancelled);
            }
            match operation(attempt).await {
                Ok(value) => {
                    debug!(attempt, "operation succeeded");
                    return Ok(value);
                }
                Err(EngineError::Cancelled) => return Err(EngineError::Cancelled),
                Err(error) => {
                    let delay = self.delay(attempt);
                    warn!(attempt, %error, ?delay, "operation failed, retrying");
                    tokio::select! {
                        () = tokio::time::sleep(delay) => {}
                        () = cancel.cancelled() => return Err(EngineError::Cancelled),
                    }
                    attempt = attempt.saturating_add(1);
                }
            }
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// TESTS
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[rstest::rstest]
    #[case(1, 100)]
    #[case(2, 200)]
    #[case(3, 400)]
    #[case(4, 450)] // capped
    fn delay_grows_to_cap(#[case] attempt: u32, #[case] expected_ms: u64) {
        let policy = RetryPolicy {
            initial: Duration::from_millis(100),
            factor: 2.0,
            max_delay: Duration::from_millis(450),
        };
        assert_eq!(policy.delay(attempt), Duration::from_millis(expected_ms));
    }

    #[tokio::test]
    async fn retries_until_success() {
        let attempts = AtomicU32::new(0);
        let result = RetryPolicy::fast()
            .run_indefinitely(&CancellationToken::new(), |_| async {
                if attempts.fetch_add(1, Ordering::SeqCst) < 3 {
                    Err(EngineError::Internal("nope".into()))
                } else {
                    Ok(42)
                }
            })
            .await
            .unwrap();
        assert_eq!(result, 42);
        assert_eq!(attempts.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn cancellation_is_terminal() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result: Result<()> = RetryPolicy::fast()
            .run_indefinitely(&cancel, |_| async {
                Err(EngineError::Internal("never succeeds".into()))
            })
            .await;
        assert!(matches!(result, Err(EngineError::Cancelled)));
    }
}
