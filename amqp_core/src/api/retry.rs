//! Retry options and the retry policy shared by every recovery chain.
//!
//! A single [`RetryPolicy`] instance is consulted at each retry decision point of a chain,
//! so the connection cache, the send channel and the message flux back off uniformly.
use std::{fmt, future::Future, sync::Arc, time::Duration};

use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::time;
use tracing::{debug, warn};

use super::{error::Error, Result};

/// Max random jitter added to a backoff, as a fraction of the base delay.
const JITTER_FACTOR: f64 = 0.08;
/// Extra wait when the broker reports it is busy.
pub(crate) const SERVER_BUSY_WAIT_TIME: Duration = Duration::from_secs(4);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RetryMode {
    /// Constant delay between attempts.
    Fixed,
    /// Delay doubles with every attempt.
    Exponential,
}

/// Retry configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryOptions {
    /// Default: `3`
    pub max_retries: u32,
    /// Default: `800ms`
    pub delay: Duration,
    /// Default: `60s`
    pub max_delay: Duration,
    /// Time allowed for one attempt of an operation. Default: `60s`
    pub try_timeout: Duration,
    /// Default: `Exponential`
    pub mode: RetryMode,
}

impl Default for RetryOptions {
    fn default() -> Self {
        Self {
            max_retries: 3,
            delay: Duration::from_millis(800),
            max_delay: Duration::from_secs(60),
            try_timeout: Duration::from_secs(60),
            mode: RetryMode::Exponential,
        }
    }
}

impl RetryOptions {
    /// Create new options with defaults.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn max_retries(&mut self, max_retries: u32) -> &mut Self {
        self.max_retries = max_retries;
        self
    }

    pub fn delay(&mut self, delay: Duration) -> &mut Self {
        self.delay = delay;
        self
    }

    pub fn max_delay(&mut self, max_delay: Duration) -> &mut Self {
        self.max_delay = max_delay;
        self
    }

    pub fn try_timeout(&mut self, try_timeout: Duration) -> &mut Self {
        self.try_timeout = try_timeout;
        self
    }

    pub fn mode(&mut self, mode: RetryMode) -> &mut Self {
        self.mode = mode;
        self
    }

    pub fn finish(&mut self) -> Self {
        self.clone()
    }

    /// # Errors
    ///
    /// Returns `InvalidArgument` if a duration is zero or `delay` exceeds `max_delay`.
    pub fn validate(&self) -> Result<()> {
        if self.delay.is_zero() || self.max_delay.is_zero() || self.try_timeout.is_zero() {
            return Err(Error::InvalidArgument(
                "retry delays and try timeout must be greater than zero".to_string(),
            ));
        }
        if self.delay > self.max_delay {
            return Err(Error::InvalidArgument(format!(
                "retry delay {:?} cannot exceed max delay {:?}",
                self.delay, self.max_delay
            )));
        }
        Ok(())
    }
}

/////////////////////////////////////////////////////////////////////////////
/// Decides whether, and after how long, a failed operation is retried.
pub trait RetryPolicy: fmt::Debug + Send + Sync + 'static {
    fn options(&self) -> &RetryOptions;

    /// Backoff before attempt `retry_count + 1`, without checking the retry budget.
    fn calculate_backoff(&self, retry_count: u32) -> Duration;

    /// Backoff before retrying after `error`, or `None` if the error is not retriable
    /// or `retry_count` reached the max retries.
    fn calculate_retry_delay(&self, error: &Error, retry_count: u32) -> Option<Duration> {
        if retry_count >= self.options().max_retries || !error.is_transient() {
            return None;
        }
        let mut delay = self.calculate_backoff(retry_count);
        if error.is_server_busy() {
            delay += SERVER_BUSY_WAIT_TIME;
        }
        Some(delay.min(self.options().max_delay))
    }

    fn max_retries(&self) -> u32 {
        self.options().max_retries
    }

    fn try_timeout(&self) -> Duration {
        self.options().try_timeout
    }
}

/// Fixed or exponential backoff with jitter, as configured by [`RetryOptions::mode`].
#[derive(Debug, Clone)]
pub struct AmqpRetryPolicy {
    options: RetryOptions,
}

impl AmqpRetryPolicy {
    pub fn new(options: RetryOptions) -> Self {
        Self { options }
    }

    /// Wrapped in an `Arc` so one instance can be shared by a whole recovery chain.
    pub fn shared(options: RetryOptions) -> Arc<dyn RetryPolicy> {
        Arc::new(Self::new(options))
    }
}

impl RetryPolicy for AmqpRetryPolicy {
    fn options(&self) -> &RetryOptions {
        &self.options
    }

    fn calculate_backoff(&self, retry_count: u32) -> Duration {
        let base = match self.options.mode {
            RetryMode::Fixed => self.options.delay,
            RetryMode::Exponential => {
                // 2^31 * delay already saturates any sane max delay
                let factor = 1u32 << retry_count.min(31);
                self.options.delay.saturating_mul(factor)
            }
        };
        let jitter = self
            .options
            .delay
            .mul_f64(JITTER_FACTOR * rand::thread_rng().gen::<f64>());
        base.saturating_add(jitter).min(self.options.max_delay)
    }
}

/////////////////////////////////////////////////////////////////////////////
/// Runs `op` under the policy's try timeout and retries transient failures.
///
/// # Errors
///
/// Returns the last error once it is not retriable or the retry budget is exhausted.
pub async fn with_retry<F, Fut, T>(
    policy: &dyn RetryPolicy,
    description: &str,
    mut op: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut retry_count = 0;
    loop {
        let res = match time::timeout(policy.try_timeout(), op()).await {
            Ok(res) => res,
            Err(_) => Err(Error::Timeout(format!(
                "'{}' did not complete within {:?}",
                description,
                policy.try_timeout()
            ))),
        };
        let err = match res {
            Ok(v) => return Ok(v),
            Err(err) => err,
        };
        match policy.calculate_retry_delay(&err, retry_count) {
            Some(delay) => {
                warn!(
                    "'{}' failed, retry attempt {} after {:?}, cause: {}.",
                    description,
                    retry_count + 1,
                    delay,
                    err
                );
                time::sleep(delay).await;
                retry_count += 1;
            }
            None => {
                debug!("'{}' is not retried, cause: {}.", description, err);
                return Err(err);
            }
        }
    }
}
