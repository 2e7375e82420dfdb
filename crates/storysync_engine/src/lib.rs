//! # StorySync Engine
//!
//! Incremental, idempotent one-way sync from an upstream work-item tracker
//! into a document-style destination.
//!
//! This crate provides:
//! - Upstream and destination transport traits plus in-memory fakes
//! - Change fetching with owner, iteration and tracked-key handling
//! - Pluggable enrichment (decorators and derived-content generators)
//! - Create / update / skip reconciliation with merge-preserve writes
//! - Retry with exponential backoff and a shared rate-limit pause
//! - A safety gate for write and destructive invocations
//! - The batch runner and its run summary
//!
//! ## Architecture
//!
//! One run is a single batch:
//! 1. Evaluate the safety gate (no I/O before it passes)
//! 2. Lock and load the cursor
//! 3. Fetch changed records since the watermark
//! 4. Enrich and reconcile them on a bounded worker pool
//! 5. Commit watermark, tracked keys and failed keys in one atomic write
//!
//! ## Key Invariants
//!
//! - At most one destination document per external key
//! - Re-running with no upstream changes performs no creates
//! - The watermark never moves past a record that was not processed
//! - A record's failure never aborts the batch
//! - Two records with the same key are never reconciled concurrently

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod config;
mod enricher;
mod error;
mod fetcher;
mod gate;
mod mapper;
mod memory;
mod reconciler;
mod retry;
mod runner;
mod summary;
mod transport;

pub use config::{CreationGuard, RetryConfig, SyncConfig, MAX_CONCURRENCY};
pub use enricher::{
    CompositeEnricher, ContentGenerator, Decorator, Enricher, FnDecorator, RuleBasedGenerator,
};
pub use error::{SyncError, SyncResult};
pub use fetcher::{
    owner_matches, ChangeFetcher, Fetch, FetchItem, FetchPlan, FilterReason,
};
pub use gate::{
    GateDecision, OperationClass, SafetyGate, Scope, DESTRUCTIVE_ACK, WRITE_ACK,
};
pub use mapper::{
    map_record, normalize_status, PROP_CREATOR, PROP_ITERATION, PROP_MODULE, PROP_OWNERS,
    PROP_STATUS, PROP_TITLE, PROP_UPDATED_AT, SYNC_VERSION,
};
pub use memory::{MemoryDestination, MemoryUpstream, WriteCall};
pub use reconciler::{
    KeyGuard, KeyLocks, Outcome, ReconcileMode, ReconcileOptions, Reconciler, SkipReason,
};
pub use retry::{CancelToken, PauseGate, Retrier};
pub use runner::{BatchRunner, Invocation, RunPlan, RunRequest, RunState};
pub use summary::{FailureDetail, FailureStage, OutcomeKind, RecordReport, RunStatus, RunSummary};
pub use transport::{
    split_csv, DestinationStore, FetchFailure, Filters, IterationFilter, RecordStream,
    UpstreamSource,
};
