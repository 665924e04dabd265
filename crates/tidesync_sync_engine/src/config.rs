//! Configuration for the sync engine.

use rand::Rng;
use std::time::Duration;

/// Configuration for sync runs.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Maximum number of entries taken from the change log per batch.
    pub batch_size: usize,
    /// Timeout for a single push.
    pub push_timeout: Duration,
    /// Maximum number of batches in one run.
    pub max_passes: usize,
    /// Retry configuration for aborted runs.
    pub retry: RetryConfig,
}

impl SyncConfig {
    /// Creates a new sync configuration with default values.
    pub fn new() -> Self {
        Self {
            batch_size: 50,
            push_timeout: Duration::from_secs(10),
            max_passes: 16,
            retry: RetryConfig::default(),
        }
    }

    /// Sets the batch size.
    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size.max(1);
        self
    }

    /// Sets the push timeout.
    pub fn with_push_timeout(mut self, timeout: Duration) -> Self {
        self.push_timeout = timeout;
        self
    }

    /// Sets the maximum number of batches per run.
    pub fn with_max_passes(mut self, passes: usize) -> Self {
        self.max_passes = passes.max(1);
        self
    }

    /// Sets the retry configuration.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Configuration for retry behavior.
///
/// Delays grow exponentially from `initial_delay`, are capped at
/// `max_delay`, and are spread by `jitter` in both directions.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of consecutive retries, or `None` to keep retrying.
    pub max_attempts: Option<u32>,
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Maximum delay between retries.
    pub max_delay: Duration,
    /// Multiplier for exponential backoff.
    pub backoff_multiplier: f64,
    /// Relative jitter, `0.2` meaning ±20%.
    pub jitter: f64,
}

impl RetryConfig {
    /// Creates a new retry configuration.
    pub fn new() -> Self {
        Self {
            max_attempts: None,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            backoff_multiplier: 2.0,
            jitter: 0.2,
        }
    }

    /// Creates a configuration with no retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: Some(0),
            ..Self::new()
        }
    }

    /// Sets the maximum number of retries.
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = Some(attempts);
        self
    }

    /// Sets the initial delay.
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Sets the maximum delay.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Sets the backoff multiplier.
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Sets the relative jitter.
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Returns true if retry number `attempt` (1-indexed) is allowed.
    #[must_use]
    pub fn allows(&self, attempt: u32) -> bool {
        self.max_attempts.map_or(true, |max| attempt <= max)
    }

    /// Delay before retry number `attempt` (1-indexed), without jitter.
    #[must_use]
    pub fn base_delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        // The fields are public; out-of-range values are clamped here.
        let multiplier = if self.backoff_multiplier.is_nan() {
            1.0
        } else {
            self.backoff_multiplier.max(1.0)
        };
        let exponent = i32::try_from(attempt - 1).unwrap_or(i32::MAX);
        let delay = self.initial_delay.as_secs_f64() * multiplier.powi(exponent);
        Duration::try_from_secs_f64(delay.min(self.max_delay.as_secs_f64()))
            .unwrap_or(self.max_delay)
    }

    /// Delay before retry number `attempt` (1-indexed), with jitter.
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.base_delay_for_attempt(attempt);
        let jitter = if self.jitter.is_nan() {
            0.0
        } else {
            self.jitter.clamp(0.0, 1.0)
        };
        if jitter == 0.0 || base.is_zero() {
            return base;
        }

        let factor = rand::thread_rng().gen_range(1.0 - jitter..=1.0 + jitter);
        Duration::try_from_secs_f64(base.as_secs_f64() * factor).unwrap_or(base)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Configuration for the connectivity monitor.
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// How long a reachability change must hold before it is reported.
    pub settle_window: Duration,
    /// Settled state before the first report.
    pub initially_online: bool,
}

impl MonitorConfig {
    /// Creates a new monitor configuration with default values.
    pub fn new() -> Self {
        Self {
            settle_window: Duration::from_secs(2),
            initially_online: false,
        }
    }

    /// Sets the settle window.
    pub fn with_settle_window(mut self, window: Duration) -> Self {
        self.settle_window = window;
        self
    }

    /// Sets the initial settled state.
    pub fn with_initially_online(mut self, online: bool) -> Self {
        self.initially_online = online;
        self
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self::new()
    }
}
