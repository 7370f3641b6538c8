//! Connection-level backoff.
//!
//! Used when opening the database pool, connecting the broker client, subscribing
//! consumers and settling deliveries. Individual outbox messages are never retried
//! here: a failed publish stays in the outbox and the sweeper picks it up later.
//!
//! # Example
//!
//! ```rust
//! use courier_runtime::retry::{RetryPolicy, retry_with_backoff};
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let reconnect = RetryPolicy::builder()
//!     .max_retries(8)
//!     .initial_delay(Duration::from_millis(250))
//!     .max_delay(Duration::from_secs(5))
//!     .build();
//!
//! let pool_size = retry_with_backoff(&reconnect, || async { Ok::<_, String>(10) }).await?;
//! assert_eq!(pool_size, 10);
//! # Ok(())
//! # }
//! ```

use crate::metrics::RetryMetrics;
use rand::Rng;
use std::future::Future;
use std::time::Duration;

/// Exponential backoff settings.
///
/// | Field           | Default |
/// |-----------------|---------|
/// | `max_retries`   | 5       |
/// | `initial_delay` | 200ms   |
/// | `max_delay`     | 30s     |
/// | `multiplier`    | 2.0     |
/// | `jitter`        | on      |
///
/// With jitter on, every delay is scaled by a random factor in `[0.5, 1.0]`.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: u32,
    /// Delay before the first retry
    pub initial_delay: Duration,
    /// Ceiling for any single delay
    pub max_delay: Duration,
    /// Growth factor between consecutive delays
    pub multiplier: f64,
    /// Randomize delays so reconnecting workers spread out
    pub jitter: bool,
}

impl RetryPolicy {
    const DEFAULT: Self = Self {
        max_retries: 5,
        initial_delay: Duration::from_millis(200),
        max_delay: Duration::from_secs(30),
        multiplier: 2.0,
        jitter: true,
    };

    /// Start from the defaults.
    #[must_use]
    pub const fn builder() -> RetryPolicyBuilder {
        RetryPolicyBuilder {
            policy: Self::DEFAULT,
        }
    }

    /// Delay before retry number `attempt`, counting from zero.
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let grown = self.initial_delay.as_secs_f64() * self.multiplier.powi(exponent);
        let capped = grown.min(self.max_delay.as_secs_f64());
        let scale = if self.jitter {
            rand::thread_rng().gen_range(0.5..=1.0)
        } else {
            1.0
        };

        Duration::try_from_secs_f64(capped * scale).unwrap_or(self.max_delay)
    }

    /// Whether `retries_so_far` still leaves room for another retry.
    #[must_use]
    pub const fn should_retry(&self, retries_so_far: u32) -> bool {
        retries_so_far < self.max_retries
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// Builder for [`RetryPolicy`]; unset fields keep their defaults.
#[derive(Debug, Clone)]
pub struct RetryPolicyBuilder {
    policy: RetryPolicy,
}

impl RetryPolicyBuilder {
    /// Retries after the first attempt.
    #[must_use]
    pub const fn max_retries(mut self, retries: u32) -> Self {
        self.policy.max_retries = retries;
        self
    }

    /// Delay before the first retry.
    #[must_use]
    pub const fn initial_delay(mut self, delay: Duration) -> Self {
        self.policy.initial_delay = delay;
        self
    }

    /// Ceiling for any single delay.
    #[must_use]
    pub const fn max_delay(mut self, ceiling: Duration) -> Self {
        self.policy.max_delay = ceiling;
        self
    }

    /// Growth factor between consecutive delays.
    #[must_use]
    pub const fn multiplier(mut self, factor: f64) -> Self {
        self.policy.multiplier = factor;
        self
    }

    /// Turn jitter on or off.
    #[must_use]
    pub const fn jitter(mut self, jitter: bool) -> Self {
        self.policy.jitter = jitter;
        self
    }

    /// Finish.
    #[must_use]
    pub const fn build(self) -> RetryPolicy {
        self.policy
    }
}

/// Run `operation` until it succeeds or `policy` runs out of retries.
///
/// # Errors
///
/// Returns the error of the final attempt.
pub async fn retry_with_backoff<F, Fut, T, E>(policy: &RetryPolicy, operation: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    retry_with_predicate(policy, operation, |_| true).await
}

/// Like [`retry_with_backoff`], but gives up at once on errors `is_retryable` rejects.
///
/// # Errors
///
/// Returns the first rejected error, or the error of the final attempt.
///
/// # Example
///
/// ```rust
/// use courier_core::BrokerError;
/// use courier_runtime::retry::{RetryPolicy, retry_with_predicate};
///
/// # async fn example() -> Result<(), BrokerError> {
/// retry_with_predicate(
///     &RetryPolicy::default(),
///     || async { Ok::<_, BrokerError>(()) },
///     BrokerError::is_retryable,
/// )
/// .await?;
/// # Ok(())
/// # }
/// ```
pub async fn retry_with_predicate<F, Fut, T, E, P>(
    policy: &RetryPolicy,
    mut operation: F,
    is_retryable: P,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    P: Fn(&E) -> bool,
{
    let mut retries = 0;

    loop {
        let err = match operation().await {
            Ok(value) => {
                if retries > 0 {
                    tracing::info!(retries, "Recovered after retrying");
                    RetryMetrics::record_success();
                }
                return Ok(value);
            }
            Err(err) => err,
        };

        if !is_retryable(&err) {
            tracing::warn!(error = %err, "Giving up on non-retryable error");
            return Err(err);
        }
        if !policy.should_retry(retries) {
            tracing::error!(retries, error = %err, "Retries exhausted");
            RetryMetrics::record_exhausted();
            return Err(err);
        }

        let delay = policy.delay_for_attempt(retries);
        tracing::warn!(
            retries,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            error = %err,
            "Attempt failed; backing off"
        );
        RetryMetrics::record_attempt();
        tokio::time::sleep(delay).await;
        retries += 1;
    }
}
