//! Configuration for the sync engine.

use crate::error::{SyncError, SyncResult};
use rand::Rng;
use std::time::Duration;
use storysync_core::FieldOwnership;

/// Upper bound on the worker pool size.
pub const MAX_CONCURRENCY: usize = 16;

/// Configuration for sync runs.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Number of worker threads enriching and reconciling records.
    ///
    /// Kept low on purpose: the destination's rate limit, not CPU, is the
    /// bottleneck.
    pub concurrency: usize,
    /// Retry configuration for rate limits and transient errors.
    pub retry: RetryConfig,
    /// Cancel the run after this long. In-flight records still complete.
    pub run_timeout: Option<Duration>,
    /// Refresh tracked keys that the incremental listing did not return.
    pub track_existing: bool,
    /// Seed tracked keys from the destination index when none are tracked.
    pub bootstrap_tracked: bool,
    /// Which destination properties belong to downstream consumers.
    pub ownership: FieldOwnership,
    /// Overwrite downstream-owned fields and derived content on update.
    pub regenerate_derived: bool,
    /// Extra conditions a record must meet before a document is created.
    pub creation_guard: CreationGuard,
    /// Decide outcomes without writing anything.
    pub dry_run: bool,
}

impl SyncConfig {
    /// Creates a configuration with defaults.
    pub fn new() -> Self {
        Self {
            concurrency: 2,
            retry: RetryConfig::default(),
            run_timeout: None,
            track_existing: true,
            bootstrap_tracked: true,
            ownership: FieldOwnership::default(),
            regenerate_derived: false,
            creation_guard: CreationGuard::default(),
            dry_run: false,
        }
    }

    /// Sets the worker count.
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    /// Sets the retry configuration.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the run timeout.
    pub fn with_run_timeout(mut self, timeout: Duration) -> Self {
        self.run_timeout = Some(timeout);
        self
    }

    /// Enables or disables tracked-key refresh.
    pub fn with_track_existing(mut self, enabled: bool) -> Self {
        self.track_existing = enabled;
        self
    }

    /// Enables or disables tracked-key bootstrap from the destination.
    pub fn with_bootstrap_tracked(mut self, enabled: bool) -> Self {
        self.bootstrap_tracked = enabled;
        self
    }

    /// Sets the field ownership table.
    pub fn with_ownership(mut self, ownership: FieldOwnership) -> Self {
        self.ownership = ownership;
        self
    }

    /// Regenerates downstream-owned content on update.
    pub fn with_regenerate_derived(mut self, regenerate: bool) -> Self {
        self.regenerate_derived = regenerate;
        self
    }

    /// Sets the creation guard.
    pub fn with_creation_guard(mut self, guard: CreationGuard) -> Self {
        self.creation_guard = guard;
        self
    }

    /// Enables dry-run mode.
    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    /// Checks the configuration for values the runner cannot work with.
    pub fn validate(&self) -> SyncResult<()> {
        if self.concurrency == 0 || self.concurrency > MAX_CONCURRENCY {
            return Err(SyncError::InvalidConfig(format!(
                "concurrency must be between 1 and {MAX_CONCURRENCY}, got {}",
                self.concurrency
            )));
        }
        if self.retry.max_attempts == 0 {
            return Err(SyncError::InvalidConfig(
                "retry.max_attempts must be at least 1".into(),
            ));
        }
        if self.retry.backoff_multiplier < 1.0 {
            return Err(SyncError::InvalidConfig(
                "retry.backoff_multiplier must be >= 1.0".into(),
            ));
        }
        Ok(())
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Conditions on creating new destination documents.
///
/// Updates are never guarded. An empty guard allows every creation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CreationGuard {
    /// Record must have an owner containing one of these substrings.
    pub owner_substrings: Vec<String>,
    /// Record must belong to this iteration.
    pub iteration: Option<String>,
}

impl CreationGuard {
    /// Creates a guard that allows everything.
    pub fn none() -> Self {
        Self::default()
    }

    /// Requires an owner match.
    pub fn with_owners<I, S>(mut self, substrings: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.owner_substrings = substrings.into_iter().map(Into::into).collect();
        self
    }

    /// Requires an iteration match.
    pub fn with_iteration(mut self, iteration: impl Into<String>) -> Self {
        self.iteration = Some(iteration.into());
        self
    }

    /// Returns true if the guard allows everything.
    pub fn is_open(&self) -> bool {
        self.owner_substrings.is_empty() && self.iteration.is_none()
    }
}

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts, including the first.
    pub max_attempts: u32,
    /// Initial delay between retries.
    pub initial_delay: Duration,
    /// Maximum delay between retries.
    pub max_delay: Duration,
    /// Multiplier for exponential backoff.
    pub backoff_multiplier: f64,
    /// Whether to add jitter to delays.
    pub add_jitter: bool,
}

impl RetryConfig {
    /// Creates a new retry configuration.
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            add_jitter: true,
        }
    }

    /// Creates a configuration with no retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff_multiplier: 1.0,
            add_jitter: false,
        }
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

    /// Enables or disables jitter.
    pub fn with_jitter(mut self, add_jitter: bool) -> Self {
        self.add_jitter = add_jitter;
        self
    }

    /// Calculates the delay before a given attempt (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let base_delay = self.initial_delay.as_secs_f64()
            * self.backoff_multiplier.powi(attempt.saturating_sub(1) as i32);

        let delay_secs = base_delay.min(self.max_delay.as_secs_f64());

        if self.add_jitter {
            // Up to 25% jitter
            let jitter = delay_secs * 0.25 * rand::thread_rng().gen::<f64>();
            Duration::from_secs_f64(delay_secs + jitter)
        } else {
            Duration::from_secs_f64(delay_secs)
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(5)
    }
}
