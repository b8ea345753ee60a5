//! Retrying execution with jittered exponential backoff.
//!
//! The executor runs an attempt closure until it succeeds, fails in a way
//! that retrying cannot help, or the attempt budget is exhausted. Backoff
//! sleeps are plain awaits, so dropping the returned future (client
//! disconnect, deadline) cancels a pending retry immediately.

use rand::Rng;
use std::future::Future;
use std::time::Duration;

/// Retry policy applied to upstream attempts.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retries after the first attempt; total attempts = `max_retries + 1`.
    pub max_retries: u32,
    /// Backoff before the first retry.
    pub initial_interval: Duration,
    /// Upper bound on any single backoff.
    pub max_interval: Duration,
    /// Growth factor between consecutive backoffs. Must be > 1.
    pub multiplier: f64,
    /// Jitter range: each backoff is scaled by `1 + U(0, randomization)`.
    pub randomization: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_interval: Duration::from_millis(100),
            max_interval: Duration::from_secs(1),
            multiplier: 2.0,
            randomization: 0.1,
        }
    }
}

impl RetryPolicy {
    /// A policy that performs a single attempt and never sleeps.
    pub fn single_attempt(&self) -> Self {
        Self {
            max_retries: 0,
            ..self.clone()
        }
    }

    /// Backoff before retry number `attempt + 1`, where `attempt` counts
    /// failed attempts so far (0-indexed). Jitter included.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let base = self.base_backoff(attempt);
        let jitter = 1.0 + rand::thread_rng().gen_range(0.0..=self.randomization.max(0.0));
        base.mul_f64(jitter)
    }

    /// Backoff before retry number `attempt + 1` without jitter:
    /// `min(max_interval, initial_interval * multiplier^attempt)`.
    pub fn base_backoff(&self, attempt: u32) -> Duration {
        let scaled = self.initial_interval.as_secs_f64() * self.multiplier.powi(attempt as i32);
        Duration::from_secs_f64(scaled.min(self.max_interval.as_secs_f64()))
    }
}

/// Outcome of a single attempt, classified by the caller.
#[derive(Debug)]
pub enum Attempt<T, E> {
    /// The attempt succeeded.
    Ok(T),
    /// The attempt failed in a way that is safe and useful to retry.
    Retry(E),
    /// The attempt failed and retrying cannot help.
    Terminal(E),
}

/// Why the executor gave up.
#[derive(Debug)]
pub enum RetryError<E> {
    /// The last retryable failure, after all attempts were spent.
    Exhausted(E),
    /// A failure classified as terminal by the attempt itself.
    Terminal(E),
}

/// Run `attempt_fn` under `policy`.
///
/// The closure receives the 0-indexed attempt number. It is run up to
/// `max_retries + 1` times; the first `Attempt::Ok` is returned, a
/// `Terminal` failure returns immediately, and a `Retry` failure sleeps
/// the jittered backoff before the next attempt.
pub async fn execute<T, E, F, Fut>(policy: &RetryPolicy, mut attempt_fn: F) -> Result<T, RetryError<E>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Attempt<T, E>>,
{
    let mut last_err = None;

    for attempt in 0..=policy.max_retries {
        match attempt_fn(attempt).await {
            Attempt::Ok(value) => return Ok(value),
            Attempt::Terminal(e) => return Err(RetryError::Terminal(e)),
            Attempt::Retry(e) => last_err = Some(e),
        }

        if attempt < policy.max_retries {
            tokio::time::sleep(policy.backoff(attempt)).await;
        }
    }

    // max_retries is finite and the loop body ran at least once.
    Err(RetryError::Exhausted(last_err.expect("at least one attempt ran")))
}
