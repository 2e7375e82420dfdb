//! Run summary returned by every invocation.

use serde::Serialize;
use std::time::Duration;
use storysync_core::{ExternalKey, Timestamp};
use uuid::Uuid;

/// Final status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Every selected record was handled.
    Success,
    /// Some records failed, or the run was cancelled before finishing.
    PartialFailure,
    /// The run could not proceed at all.
    Failure,
}

impl RunStatus {
    /// Process exit code for this status.
    pub fn exit_code(self) -> i32 {
        match self {
            RunStatus::Success => 0,
            RunStatus::Failure => 1,
            RunStatus::PartialFailure => 2,
        }
    }
}

/// Pipeline stage where a record failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureStage {
    /// Fetching from the upstream.
    Fetch,
    /// Enrichment.
    Enrich,
    /// Destination lookup or write.
    Reconcile,
}

/// What happened to one record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeKind {
    /// A document was created.
    Created,
    /// A document was updated.
    Updated,
    /// Nothing was written.
    Skipped,
    /// The record failed.
    Failed,
    /// Fetched but deliberately not reconciled.
    Filtered,
    /// Fetched but not started before cancellation.
    Unprocessed,
}

/// Per-record line of the summary.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecordReport {
    /// Record key, if known.
    pub key: Option<ExternalKey>,
    /// Outcome.
    pub outcome: OutcomeKind,
    /// Destination id for writes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub destination_id: Option<String>,
    /// Skip, filter or failure reason.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// One failed record.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailureDetail {
    /// Record key, if known.
    pub key: Option<ExternalKey>,
    /// Where it failed.
    pub stage: FailureStage,
    /// Error text.
    pub cause: String,
}

/// Aggregated result of one run.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    /// Unique id of this run, used in logs.
    pub run_id: Uuid,
    /// Invocation mode name.
    pub mode: String,
    /// Whether writes were suppressed.
    pub dry_run: bool,
    /// When the run started.
    pub started_at: Timestamp,
    /// Wall-clock duration in milliseconds.
    pub elapsed_ms: u64,
    /// Documents created.
    pub created: usize,
    /// Documents updated.
    pub updated: usize,
    /// Records skipped by mode or guard.
    pub skipped: usize,
    /// Records that failed at any stage.
    pub failed: usize,
    /// Records fetched but filtered out.
    pub filtered: usize,
    /// Records left unprocessed by cancellation.
    pub unprocessed: usize,
    /// Failure details, in arrival order.
    pub failures: Vec<FailureDetail>,
    /// Per-record outcomes, in arrival order.
    pub records: Vec<RecordReport>,
    /// Watermark when the run started.
    pub watermark_before: Option<Timestamp>,
    /// Watermark persisted at the end (equal to `watermark_before` when
    /// nothing was committed).
    pub watermark_after: Option<Timestamp>,
    /// Whether the cursor was written.
    pub cursor_committed: bool,
    /// Whether the run was cancelled or timed out.
    pub cancelled: bool,
    /// Error that stopped the run, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fatal: Option<String>,
    /// Final status.
    pub status: RunStatus,
}

impl RunSummary {
    /// Starts an empty summary.
    pub fn new(mode: impl Into<String>, dry_run: bool, started_at: Timestamp) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            mode: mode.into(),
            dry_run,
            started_at,
            elapsed_ms: 0,
            created: 0,
            updated: 0,
            skipped: 0,
            failed: 0,
            filtered: 0,
            unprocessed: 0,
            failures: Vec::new(),
            records: Vec::new(),
            watermark_before: None,
            watermark_after: None,
            cursor_committed: false,
            cancelled: false,
            fatal: None,
            status: RunStatus::Success,
        }
    }

    /// Records a non-failure outcome.
    pub fn record(
        &mut self,
        key: Option<ExternalKey>,
        outcome: OutcomeKind,
        destination_id: Option<String>,
        detail: Option<String>,
    ) {
        match outcome {
            OutcomeKind::Created => self.created += 1,
            OutcomeKind::Updated => self.updated += 1,
            OutcomeKind::Skipped => self.skipped += 1,
            OutcomeKind::Failed => self.failed += 1,
            OutcomeKind::Filtered => self.filtered += 1,
            OutcomeKind::Unprocessed => self.unprocessed += 1,
        }
        self.records.push(RecordReport {
            key,
            outcome,
            destination_id,
            detail,
        });
    }

    /// Records a failure.
    pub fn fail(&mut self, key: Option<ExternalKey>, stage: FailureStage, cause: String) {
        self.failures.push(FailureDetail {
            key: key.clone(),
            stage,
            cause: cause.clone(),
        });
        self.record(key, OutcomeKind::Failed, None, Some(cause));
    }

    /// Marks the run as stopped by a fatal error.
    pub fn abort(&mut self, cause: impl std::fmt::Display) {
        self.fatal = Some(cause.to_string());
    }

    /// Sets elapsed time and derives the final status.
    pub fn finish(&mut self, elapsed: Duration) {
        self.elapsed_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX);
        self.status = if self.fatal.is_some() {
            RunStatus::Failure
        } else if self.failed > 0 || self.unprocessed > 0 || self.cancelled {
            RunStatus::PartialFailure
        } else {
            RunStatus::Success
        };
    }

    /// Keys of records with the given outcome.
    pub fn keys_with(&self, outcome: OutcomeKind) -> Vec<&ExternalKey> {
        self.records
            .iter()
            .filter(|r| r.outcome == outcome)
            .filter_map(|r| r.key.as_ref())
            .collect()
    }
}

impl std::fmt::Display for RunSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "created={} updated={} skipped={} failed={} filtered={} unprocessed={}",
            self.created, self.updated, self.skipped, self.failed, self.filtered, self.unprocessed
        )
    }
}
