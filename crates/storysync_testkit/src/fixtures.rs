//! Test fixtures and runner helpers.
//!
//! Provides temporary cursor directories, fixed timestamps and a
//! [`Harness`] that wires the in-memory upstream and destination to a
//! [`BatchRunner`].

use chrono::{TimeZone, Utc};
use std::path::{Path, PathBuf};
use std::time::Duration;
use storysync_core::{read_cursor_dir, Cursor, CursorDir, Record, Timestamp};
use storysync_engine::{
    BatchRunner, CancelToken, CompositeEnricher, Enricher, Invocation, MemoryDestination,
    MemoryUpstream, OperationClass, RetryConfig, RunRequest, RunSummary, SafetyGate, SyncConfig,
    DESTRUCTIVE_ACK, WRITE_ACK,
};
use tempfile::TempDir;

/// A cursor directory with automatic cleanup.
pub struct TestCursorDir {
    path: PathBuf,
    _temp_dir: TempDir,
}

impl TestCursorDir {
    /// Creates a fresh, empty cursor directory path.
    ///
    /// The directory itself does not exist yet; the runner creates it.
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let path = temp_dir.path().join("sync");
        Self {
            path,
            _temp_dir: temp_dir,
        }
    }

    /// Returns the cursor directory path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads the persisted cursor without taking the lock.
    pub fn cursor(&self) -> Cursor {
        read_cursor_dir(&self.path).expect("Failed to read cursor")
    }

    /// Overwrites the persisted cursor.
    pub fn write(&self, cursor: &Cursor) {
        let dir = CursorDir::open(&self.path, true).expect("Failed to open cursor dir");
        dir.save(cursor).expect("Failed to save cursor");
    }

    /// Takes the cursor lock and holds it until the guard is dropped.
    pub fn hold_lock(&self) -> CursorDir {
        CursorDir::open(&self.path, true).expect("Failed to lock cursor dir")
    }
}

impl Default for TestCursorDir {
    fn default() -> Self {
        Self::new()
    }
}

/// A fixed timestamp on 2024-05-01.
pub fn ts(hour: u32, minute: u32) -> Timestamp {
    Utc.with_ymd_and_hms(2024, 5, 1, hour, minute, 0)
        .single()
        .expect("valid timestamp")
}

/// A record with a description and one owner.
pub fn story(key: &str, title: &str, updated_at: Timestamp) -> Record {
    Record::new(key, title, updated_at)
        .with_description(format!("目标: ship {title}\n验收: {title} works\nsupport {key}"))
        .with_owner("Alice Zhang")
}

/// Retry settings that keep tests fast.
pub fn fast_retry() -> RetryConfig {
    RetryConfig::new(4)
        .with_initial_delay(Duration::from_millis(1))
        .with_max_delay(Duration::from_millis(5))
        .with_jitter(false)
}

/// The acknowledgment a request of `class` needs.
pub fn ack_for(class: OperationClass) -> Option<String> {
    match class {
        OperationClass::ReadOnly => None,
        OperationClass::AdditiveWrite => Some(WRITE_ACK.to_string()),
        OperationClass::Destructive => Some(DESTRUCTIVE_ACK.to_string()),
    }
}

/// Fake upstream, fake destination and a cursor directory.
pub struct Harness {
    /// Upstream fake.
    pub upstream: MemoryUpstream,
    /// Destination fake.
    pub destination: MemoryDestination,
    /// Enricher used by every run.
    pub enricher: Box<dyn Enricher>,
    /// Runner configuration.
    pub config: SyncConfig,
    /// Safety gate.
    pub gate: SafetyGate,
    /// Cursor directory.
    pub cursor_dir: TestCursorDir,
}

impl Harness {
    /// Creates a harness with the rule-based enricher and fast retries.
    pub fn new() -> Self {
        Self {
            upstream: MemoryUpstream::new(),
            destination: MemoryDestination::new(),
            enricher: Box::new(CompositeEnricher::rule_based()),
            config: SyncConfig::new().with_retry(fast_retry()),
            gate: SafetyGate::new(),
            cursor_dir: TestCursorDir::new(),
        }
    }

    /// Replaces the configuration.
    #[must_use]
    pub fn with_config(mut self, config: SyncConfig) -> Self {
        self.config = config;
        self
    }

    /// Replaces the enricher.
    #[must_use]
    pub fn with_enricher(mut self, enricher: impl Enricher + 'static) -> Self {
        self.enricher = Box::new(enricher);
        self
    }

    /// Builds a runner over the harness fakes.
    pub fn runner(&self) -> BatchRunner<'_> {
        BatchRunner::new(
            self.config.clone(),
            &self.upstream,
            &self.destination,
            self.enricher.as_ref(),
        )
        .with_gate(self.gate)
    }

    /// Runs `invocation` unfiltered, acknowledged as needed.
    pub fn run(&self, invocation: Invocation) -> RunSummary {
        let class = invocation.plan().class;
        let mut request = RunRequest::new(invocation);
        request.ack = ack_for(class);
        self.run_request(&request)
    }

    /// Runs a prepared request.
    pub fn run_request(&self, request: &RunRequest) -> RunSummary {
        self.runner().run(self.cursor_dir.path(), request)
    }

    /// Runs `invocation` with an externally controlled cancellation token.
    pub fn run_cancellable(&self, invocation: Invocation, token: CancelToken) -> RunSummary {
        let class = invocation.plan().class;
        let mut request = RunRequest::new(invocation);
        request.ack = ack_for(class);
        self.runner()
            .with_cancel_token(token)
            .run(self.cursor_dir.path(), &request)
    }

    /// Reads the persisted cursor.
    pub fn cursor(&self) -> Cursor {
        self.cursor_dir.cursor()
    }
}

impl Default for Harness {
    fn default() -> Self {
        Self::new()
    }
}
