//! Bounded retry and the process-wide rate-limit pause.

use crate::config::RetryConfig;
use crate::error::{SyncError, SyncResult};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::warn;

/// Cooperative cancellation flag shared between a run and its caller.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    /// Creates a token that is not cancelled.
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Returns true once cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Shared "do not call the destination before" deadline.
///
/// When any worker is rate limited, every worker waits here before its next
/// destination call.
#[derive(Debug, Default)]
pub struct PauseGate {
    until: Mutex<Option<Instant>>,
}

impl PauseGate {
    /// Creates an open gate.
    pub fn new() -> Self {
        Self::default()
    }

    /// Closes the gate for at least `delay`. Never shortens an existing pause.
    pub fn pause_for(&self, delay: Duration) {
        let deadline = Instant::now() + delay;
        let mut until = self.until.lock();
        if until.map_or(true, |current| current < deadline) {
            *until = Some(deadline);
        }
    }

    /// Time left before the gate opens, if it is closed.
    pub fn remaining(&self) -> Option<Duration> {
        let until = (*self.until.lock())?;
        until.checked_duration_since(Instant::now()).filter(|d| !d.is_zero())
    }

    /// Blocks until the gate is open.
    pub fn wait(&self) {
        while let Some(remaining) = self.remaining() {
            std::thread::sleep(remaining);
        }
    }
}

/// Runs destination and upstream calls under a bounded retry policy.
#[derive(Debug, Clone)]
pub struct Retrier {
    config: RetryConfig,
    pause: Arc<PauseGate>,
}

impl Retrier {
    /// Creates a retrier with its own pause gate.
    pub fn new(config: RetryConfig) -> Self {
        Self::with_gate(config, Arc::new(PauseGate::new()))
    }

    /// Creates a retrier sharing an existing pause gate.
    pub fn with_gate(config: RetryConfig, pause: Arc<PauseGate>) -> Self {
        Self { config, pause }
    }

    /// Returns the shared pause gate.
    pub fn gate(&self) -> &Arc<PauseGate> {
        &self.pause
    }

    /// Returns the retry configuration.
    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Calls `op` until it succeeds, fails permanently, or the attempt
    /// budget is spent.
    ///
    /// Rate limits close the shared pause gate for the larger of the
    /// requested delay and the backoff delay. Other retryable errors only
    /// delay the calling thread. A retryable error on the last attempt is
    /// returned as [`SyncError::RetriesExhausted`].
    pub fn run<T>(&self, what: &str, mut op: impl FnMut() -> SyncResult<T>) -> SyncResult<T> {
        let max_attempts = self.config.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            self.pause.wait();
            attempt += 1;

            let err = match op() {
                Ok(value) => return Ok(value),
                Err(err) if !err.is_retryable() => return Err(err),
                Err(err) => err,
            };

            if attempt >= max_attempts {
                warn!(what, attempts = attempt, error = %err, "retries exhausted");
                return Err(SyncError::RetriesExhausted {
                    attempts: attempt,
                    last: Box::new(err),
                });
            }

            let backoff = self.config.delay_for_attempt(attempt);
            match err.retry_after() {
                Some(retry_after) => {
                    let delay = retry_after.max(backoff);
                    warn!(
                        what,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "rate limited, pausing all workers"
                    );
                    self.pause.pause_for(delay);
                }
                None => {
                    warn!(
                        what,
                        attempt,
                        error = %err,
                        delay_ms = backoff.as_millis() as u64,
                        "transient failure, retrying"
                    );
                    std::thread::sleep(backoff);
                }
            }
        }
    }
}
