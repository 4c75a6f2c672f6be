//! The one shared retry primitive used by registry auth retry, probe
//! attempts, and notification dispatch (see design notes on a single
//! retry helper parameterized by timeout/retries/backoff/retry_on).

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RetryStrategy {
    Immediate,
    #[default]
    Exponential,
    Linear,
    Constant,
}

/// A cooperative cancellation token: an atomic flag plus an optional
/// deadline. Threaded by reference (or clone, since it's `Arc`-backed) into
/// every blocking operation named in the concurrency model, so no subsystem
/// ever performs an unbounded wait.
#[derive(Debug, Clone)]
pub struct Cancellation {
    cancelled: Arc<AtomicBool>,
    deadline: Option<Instant>,
}

impl Default for Cancellation {
    fn default() -> Self {
        Self {
            cancelled: Arc::new(AtomicBool::new(false)),
            deadline: None,
        }
    }
}

impl Cancellation {
    pub fn new() -> Self {
        Self::default()
    }

    /// A token that cancels itself once `timeout` has elapsed.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            cancelled: Arc::new(AtomicBool::new(false)),
            deadline: Some(Instant::now() + timeout),
        }
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// True if explicitly cancelled, or if a deadline was set and has passed.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
            || self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    /// Derives a child token that shares the cancellation flag but clamps
    /// the deadline to whichever of `self`'s and `timeout`'s is tighter.
    /// Used when a component (e.g. the scheduler) wraps a caller-provided
    /// token with its own bounded per-job timeout.
    pub fn child(&self, timeout: Duration) -> Self {
        let candidate = Instant::now() + timeout;
        let deadline = match self.deadline {
            Some(existing) => existing.min(candidate),
            None => candidate,
        };
        Self {
            cancelled: Arc::clone(&self.cancelled),
            deadline: Some(deadline),
        }
    }

    /// Remaining time until the deadline, if one is set.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    pub strategy: RetryStrategy,
    pub max_attempts: u32,
    #[serde(with = "humantime_serde")]
    pub base_delay: Duration,
    #[serde(with = "humantime_serde")]
    pub max_delay: Duration,
    /// 0.0 = no jitter, 1.0 = full jitter.
    pub jitter: f64,
}

impl RetryConfig {
    /// One 401-challenge retry for the registry client: a
    /// single immediate retry, no backoff needed.
    pub fn registry_auth() -> Self {
        Self {
            strategy: RetryStrategy::Immediate,
            max_attempts: 2,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            jitter: 0.0,
        }
    }

    /// Notification dispatch: up to 3 attempts, exponential
    /// backoff `1s * 2^n`.
    pub fn notification() -> Self {
        Self {
            strategy: RetryStrategy::Exponential,
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            jitter: 0.0,
        }
    }

    /// Probe attempts: `retries` attempts, constant `retry_backoff`
    /// between them.
    pub fn probe(retries: u32, retry_backoff: Duration) -> Self {
        Self {
            strategy: RetryStrategy::Constant,
            max_attempts: retries.max(1),
            base_delay: retry_backoff,
            max_delay: retry_backoff,
            jitter: 0.0,
        }
    }
}

/// Computes the delay before `attempt` (1-indexed), capped at `max_delay`
/// and with jitter applied if configured.
pub fn calculate_delay(config: &RetryConfig, attempt: u32) -> Duration {
    let raw = match config.strategy {
        RetryStrategy::Immediate => Duration::ZERO,
        RetryStrategy::Constant => config.base_delay,
        RetryStrategy::Linear => config.base_delay.saturating_mul(attempt),
        RetryStrategy::Exponential => {
            let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
            config.base_delay.saturating_mul(factor)
        }
    };
    let capped = raw.min(config.max_delay.max(config.base_delay));
    apply_jitter(capped, config.jitter)
}

fn apply_jitter(delay: Duration, jitter: f64) -> Duration {
    if jitter <= 0.0 {
        return delay;
    }
    let jitter = jitter.min(1.0);
    let factor = 1.0 - jitter + rand::random::<f64>() * (2.0 * jitter);
    Duration::from_secs_f64((delay.as_secs_f64() * factor).max(0.0))
}

/// Whether a non-2xx HTTP status should be retried: retry 5xx and 429,
/// never other 4xx.
pub fn http_status_is_retryable(status: u16) -> bool {
    status == 429 || (500..600).contains(&status)
}

/// Runs `op` up to `config.max_attempts` times, sleeping
/// `calculate_delay` between attempts and honoring `cancel`. `op` receives
/// the 1-indexed attempt number. Returns the last error if every attempt
/// fails or if cancellation stops the loop before success.
pub fn retry_with<T, E>(
    config: &RetryConfig,
    cancel: &Cancellation,
    mut op: impl FnMut(u32) -> Result<T, E>,
) -> Result<T, E> {
    let mut attempt = 1;
    loop {
        let result = op(attempt);
        match result {
            Ok(v) => return Ok(v),
            Err(e) => {
                if attempt >= config.max_attempts || cancel.is_cancelled() {
                    return Err(e);
                }
                let delay = calculate_delay(config, attempt);
                if !delay.is_zero() {
                    sleep_cancellable(delay, cancel);
                }
                if cancel.is_cancelled() {
                    return Err(e);
                }
                attempt += 1;
            }
        }
    }
}

/// Sleeps in small slices so cancellation is observed promptly rather than
/// only after the full delay elapses.
pub fn sleep_cancellable(total: Duration, cancel: &Cancellation) {
    const SLICE: Duration = Duration::from_millis(50);
    let mut remaining = total;
    while !remaining.is_zero() {
        if cancel.is_cancelled() {
            return;
        }
        let step = remaining.min(SLICE);
        thread::sleep(step);
        remaining -= step;
    }
}
