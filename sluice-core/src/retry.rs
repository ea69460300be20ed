//! Retry with backoff for transient failures.
//!
//! Only [`DbError::is_transient`] failures are retried: connection loss,
//! serialization conflicts, deadlocks, lock timeouts. Everything else
//! propagates on the first occurrence. The wrapped operation is re-run
//! whole, so it must be safe to invoke more than once.
//!
//! # Backoff
//!
//! [`Backoff::Fixed`] is the default: every retry waits `base_delay`.
//! [`Backoff::Exponential`] waits `base_delay * 2^(n-1)` before retry `n`,
//! capped at `max_delay`. Optional jitter adds up to half the delay.
//!
//! # Deadline
//!
//! With a deadline set, both in-flight attempts and backoff sleeps are
//! aborted once it passes, yielding [`DbError::DeadlineExceeded`].

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{DbError, Result};

/// Default cap on exponential backoff delays.
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(30);

/// Delay growth between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backoff {
    /// Same delay before every retry.
    #[default]
    Fixed,
    /// Delay doubles after each failed attempt.
    Exponential,
}

/// Bounded re-attempt of a fallible async operation.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_delay: Duration,
    backoff: Backoff,
    max_delay: Duration,
    jitter: bool,
    deadline: Option<Instant>,
}

impl RetryPolicy {
    /// Fixed-delay policy. `max_attempts` counts the first try.
    pub fn new(max_attempts: u32, base_delay: Duration) -> Result<Self> {
        if max_attempts == 0 {
            return Err(DbError::invalid_argument("max_attempts must be at least 1"));
        }
        Ok(Self {
            max_attempts,
            base_delay,
            backoff: Backoff::Fixed,
            max_delay: DEFAULT_MAX_DELAY.max(base_delay),
            jitter: false,
            deadline: None,
        })
    }

    /// Exponential policy capped at `max_delay`.
    pub fn exponential(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Result<Self> {
        Ok(Self::new(max_attempts, base_delay)?
            .with_backoff(Backoff::Exponential)
            .with_max_delay(max_delay))
    }

    /// A single attempt, no waiting.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            base_delay: Duration::ZERO,
            backoff: Backoff::Fixed,
            max_delay: Duration::ZERO,
            jitter: false,
            deadline: None,
        }
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Abort attempts and waits once `deadline` passes.
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Deadline relative to now.
    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn base_delay(&self) -> Duration {
        self.base_delay
    }

    pub fn backoff(&self) -> Backoff {
        self.backoff
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Wait before the retry that follows failed attempt `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let delay = match self.backoff {
            Backoff::Fixed => self.base_delay,
            Backoff::Exponential => {
                let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
                self.base_delay.saturating_mul(factor).min(self.max_delay)
            }
        };
        if self.jitter && !delay.is_zero() {
            let extra = rand::thread_rng().gen_range(0..=delay.as_millis() as u64 / 2);
            delay + Duration::from_millis(extra)
        } else {
            delay
        }
    }

    /// Run `op` until it succeeds, fails permanently, or the attempt budget
    /// runs out. `op` receives the 1-based attempt number.
    pub async fn run<T, F, Fut>(&self, mut op: F) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let started = Instant::now();
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let outcome = self.bounded(started, op(attempt)).await?;
            match outcome {
                Ok(value) => {
                    if attempt > 1 {
                        info!(attempt, "operation succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(err) if !err.is_transient() => {
                    debug!(attempt, error = %err, "permanent failure, not retrying");
                    return Err(err);
                }
                Err(err) if attempt >= self.max_attempts => {
                    warn!(attempts = attempt, error = %err, "max retries reached");
                    return Err(DbError::ExhaustedRetries {
                        attempts: attempt,
                        last: Box::new(err),
                    });
                }
                Err(err) => {
                    let delay = self.delay_for(attempt);
                    warn!(
                        attempt,
                        max_attempts = self.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "attempt failed, retrying"
                    );
                    self.bounded(started, tokio::time::sleep(delay)).await?;
                }
            }
        }
    }

    async fn bounded<F: Future>(&self, started: Instant, fut: F) -> Result<F::Output> {
        match self.deadline {
            Some(deadline) => tokio::time::timeout_at(deadline, fut)
                .await
                .map_err(|_| DbError::DeadlineExceeded {
                    elapsed: started.elapsed(),
                }),
            None => Ok(fut.await),
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            backoff: Backoff::Fixed,
            max_delay: DEFAULT_MAX_DELAY,
            jitter: false,
            deadline: None,
        }
    }
}

/// Fixed-delay retry of `op`, at most `max_attempts` invocations.
pub async fn with_retry<T, F, Fut>(max_attempts: u32, base_delay: Duration, op: F) -> Result<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    RetryPolicy::new(max_attempts, base_delay)?.run(op).await
}

/// Run `fut` but give up at `deadline`.
pub async fn with_deadline<T, F>(deadline: Instant, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    let started = Instant::now();
    tokio::time::timeout_at(deadline, fut)
        .await
        .map_err(|_| DbError::DeadlineExceeded {
            elapsed: started.elapsed(),
        })?
}
