//! Bounded exponential backoff
//!
//! A [`Backoff`] is a plain value describing how long to wait between attempts
//! and how many attempts to make. [`Backoff::retry`] drives an async operation
//! with it, sleeping between failed attempts and giving up once the step budget
//! is spent.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::debug;

const DEFAULT_INITIAL_DELAY: Duration = Duration::from_millis(500);
const DEFAULT_FACTOR: f64 = 1.5;
const DEFAULT_JITTER: f64 = 0.1;
const DEFAULT_STEPS: u32 = 10;

/// Exponential retry policy: `initial_delay * factor^n`, plus up to
/// `jitter * delay` of random extra wait, for at most `steps` attempts.
#[derive(Clone, Debug, PartialEq)]
pub struct Backoff {
    /// Delay after the first failed attempt
    pub initial_delay: Duration,
    /// Growth factor applied after every attempt
    pub factor: f64,
    /// Random extra fraction of each delay (0.0 disables)
    pub jitter: f64,
    /// Total number of attempts
    pub steps: u32,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial_delay: DEFAULT_INITIAL_DELAY,
            factor: DEFAULT_FACTOR,
            jitter: DEFAULT_JITTER,
            steps: DEFAULT_STEPS,
        }
    }
}

/// Returned when every attempt failed
#[derive(Debug)]
pub struct Exhausted<E> {
    /// Number of attempts made
    pub attempts: u32,
    /// Error of the final attempt
    pub last: E,
}

impl Backoff {
    /// Create a backoff with explicit parameters
    pub const fn new(initial_delay: Duration, factor: f64, jitter: f64, steps: u32) -> Self {
        Self {
            initial_delay,
            factor,
            jitter,
            steps,
        }
    }

    /// Constant interval, no jitter
    pub const fn fixed(interval: Duration, steps: u32) -> Self {
        Self::new(interval, 1.0, 0.0, steps)
    }

    /// Replace the jitter fraction
    #[must_use]
    pub const fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter;
        self
    }

    /// Replace the step budget
    #[must_use]
    pub const fn with_steps(mut self, steps: u32) -> Self {
        self.steps = steps;
        self
    }

    /// Attempts actually made; a zero budget still runs the operation once
    pub fn attempts(&self) -> u32 {
        self.steps.max(1)
    }

    /// Delay before attempt `attempt + 1`, without jitter
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let scaled = self.initial_delay.as_secs_f64() * self.factor.max(1.0).powi(exponent);
        Duration::try_from_secs_f64(scaled).unwrap_or(Duration::MAX)
    }

    fn jittered(&self, delay: Duration) -> Duration {
        if self.jitter <= 0.0 {
            return delay;
        }
        let extra = delay.as_secs_f64() * self.jitter * rand::thread_rng().gen::<f64>();
        delay.saturating_add(Duration::try_from_secs_f64(extra).unwrap_or(Duration::MAX))
    }

    /// Run `op` until it succeeds or the step budget is exhausted.
    ///
    /// `op` receives the zero-based attempt number. Every `Err` is treated as
    /// retryable; callers that need to abort early should return `Ok` with a
    /// value describing the abort.
    pub async fn retry<T, E, F, Fut>(&self, mut op: F) -> Result<T, Exhausted<E>>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let attempts = self.attempts();
        let mut attempt = 0;
        loop {
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(last) => {
                    let made = attempt.saturating_add(1);
                    if made >= attempts {
                        return Err(Exhausted {
                            attempts: made,
                            last,
                        });
                    }
                    let wait = self.jittered(self.delay(attempt));
                    debug!(attempt = made, wait_ms = wait.as_millis() as u64, "retrying after backoff");
                    tokio::time::sleep(wait).await;
                    attempt = made;
                }
            }
        }
    }
}
