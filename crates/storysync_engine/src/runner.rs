//! Batch runner: gate, lock, fetch, enrich, reconcile, commit.
//!
//! ```text
//!            ┌──────────┐  records   ┌──────────┐  events  ┌────────────┐
//! upstream ─►│ fetcher  ├──(bounded)─► workers  ├─────────►│ aggregator │
//!            │ (caller  │            │ enrich + │          │ summary +  │
//!            │  thread) ├─filtered/failed───────┼─────────►│ cursor     │
//!            └──────────┘            └──────────┘          └────────────┘
//! ```
//!
//! The cursor is loaded after the safety gate passes and written once, at
//! the end, in a single atomic replace.

use crate::config::SyncConfig;
use crate::enricher::Enricher;
use crate::error::{SyncError, SyncResult};
use crate::fetcher::{ChangeFetcher, Fetch, FetchItem, FetchPlan};
use crate::gate::{OperationClass, SafetyGate, Scope};
use crate::reconciler::{Outcome, ReconcileMode, ReconcileOptions, Reconciler, SkipReason};
use crate::retry::{CancelToken, Retrier};
use crate::summary::{FailureStage, OutcomeKind, RunSummary};
use crate::transport::{DestinationStore, Filters, UpstreamSource};
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::mpsc::{self, Receiver, Sender};
use std::time::Instant;
use storysync_core::{Cursor, CursorDir, ExternalKey, Record, Timestamp};
use tracing::{debug, error, info, warn};

/// The current state of the runner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    /// Not running.
    Idle,
    /// Evaluating the safety gate.
    Gating,
    /// Fetching and reconciling records.
    Fetching,
    /// Writing the cursor.
    Committing,
    /// Last run completed.
    Done,
    /// Last run stopped on a fatal error.
    Error,
    /// Last run was cancelled or timed out.
    Cancelled,
}

impl RunState {
    /// Returns true while a run is in progress.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            RunState::Gating | RunState::Fetching | RunState::Committing
        )
    }

    /// Returns true if a new run can start.
    pub fn can_start(&self) -> bool {
        !self.is_active()
    }
}

/// What kind of run to perform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Invocation {
    /// List everything and upsert.
    FullRebuild,
    /// List changes since the watermark and upsert.
    Incremental,
    /// Look up the given keys and upsert them. The watermark stays put.
    ExplicitIds(Vec<ExternalKey>),
    /// List changes since the watermark; only create.
    InsertOnly,
    /// List changes since the watermark; only update.
    UpdateOnly {
        /// Also create documents that do not exist yet.
        create_missing: bool,
    },
    /// Archive the documents in scope, forget their tracked keys, then
    /// rebuild from a full listing. Unscoped, the whole destination goes.
    WipeAndRebuild,
}

/// How an [`Invocation`] is carried out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunPlan {
    /// Mode name used in logs and summaries.
    pub name: &'static str,
    /// List since the stored watermark (otherwise list everything).
    pub from_watermark: bool,
    /// Allowed writes.
    pub mode: ReconcileMode,
    /// Gate class when not a dry run.
    pub class: OperationClass,
    /// Whether a successful run may move the watermark.
    pub advance_watermark: bool,
    /// Whether tracked keys missing from the listing are refreshed.
    pub refresh_tracked: bool,
    /// Archive the destination first.
    pub wipe: bool,
}

impl Invocation {
    /// Maps the invocation to its fetch, reconcile and gate settings.
    pub fn plan(&self) -> RunPlan {
        let base = RunPlan {
            name: "incremental",
            from_watermark: true,
            mode: ReconcileMode::Upsert,
            class: OperationClass::AdditiveWrite,
            advance_watermark: true,
            refresh_tracked: true,
            wipe: false,
        };
        match self {
            Invocation::Incremental => base,
            Invocation::FullRebuild => RunPlan {
                name: "full",
                from_watermark: false,
                ..base
            },
            Invocation::ExplicitIds(_) => RunPlan {
                name: "ids",
                advance_watermark: false,
                refresh_tracked: false,
                ..base
            },
            Invocation::InsertOnly => RunPlan {
                name: "insert-only",
                mode: ReconcileMode::InsertOnly,
                refresh_tracked: false,
                ..base
            },
            Invocation::UpdateOnly { create_missing } => RunPlan {
                name: "update-only",
                mode: ReconcileMode::UpdateOnly {
                    create_missing: *create_missing,
                },
                ..base
            },
            Invocation::WipeAndRebuild => RunPlan {
                name: "wipe-rebuild",
                from_watermark: false,
                class: OperationClass::Destructive,
                refresh_tracked: false,
                wipe: true,
                ..base
            },
        }
    }
}

/// One invocation of the runner.
#[derive(Debug, Clone)]
pub struct RunRequest {
    /// What to do.
    pub invocation: Invocation,
    /// Record selection.
    pub filters: Filters,
    /// Operator acknowledgment for the safety gate.
    pub ack: Option<String>,
}

impl RunRequest {
    /// Creates a request without filters or acknowledgment.
    pub fn new(invocation: Invocation) -> Self {
        Self {
            invocation,
            filters: Filters::new(),
            ack: None,
        }
    }

    /// Sets the filters.
    #[must_use]
    pub fn with_filters(mut self, filters: Filters) -> Self {
        self.filters = filters;
        self
    }

    /// Sets the acknowledgment token.
    #[must_use]
    pub fn with_ack(mut self, ack: impl Into<String>) -> Self {
        self.ack = Some(ack.into());
        self
    }
}

/// Runs sync invocations against one upstream and one destination.
pub struct BatchRunner<'a> {
    config: SyncConfig,
    upstream: &'a dyn UpstreamSource,
    destination: &'a dyn DestinationStore,
    enricher: &'a dyn Enricher,
    gate: SafetyGate,
    state: RwLock<RunState>,
    cancel: CancelToken,
}

impl<'a> BatchRunner<'a> {
    /// Creates a runner.
    pub fn new(
        config: SyncConfig,
        upstream: &'a dyn UpstreamSource,
        destination: &'a dyn DestinationStore,
        enricher: &'a dyn Enricher,
    ) -> Self {
        Self {
            config,
            upstream,
            destination,
            enricher,
            gate: SafetyGate::new(),
            state: RwLock::new(RunState::Idle),
            cancel: CancelToken::new(),
        }
    }

    /// Replaces the safety gate.
    #[must_use]
    pub fn with_gate(mut self, gate: SafetyGate) -> Self {
        self.gate = gate;
        self
    }

    /// Uses an externally owned cancellation token.
    #[must_use]
    pub fn with_cancel_token(mut self, token: CancelToken) -> Self {
        self.cancel = token;
        self
    }

    /// Gets the current state.
    pub fn state(&self) -> RunState {
        *self.state.read()
    }

    /// Returns a handle that cancels the current run.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Cancels the current run. In-flight records still complete.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    fn set_state(&self, state: RunState) {
        *self.state.write() = state;
    }

    fn begin(&self) -> SyncResult<()> {
        let mut state = self.state.write();
        if !state.can_start() {
            return Err(SyncError::InvalidStateTransition {
                from: format!("{:?}", *state),
                to: "Gating".into(),
            });
        }
        *state = RunState::Gating;
        Ok(())
    }

    /// Performs one run and reports what happened.
    ///
    /// Never returns an error: fatal problems (gate denial, cursor lock held
    /// elsewhere, unreadable cursor, listing failure) end the run with
    /// [`RunStatus::Failure`](crate::RunStatus::Failure) and the cause in
    /// [`RunSummary::fatal`].
    pub fn run(&self, cursor_dir: &Path, request: &RunRequest) -> RunSummary {
        let started = Instant::now();
        let plan = request.invocation.plan();
        let mut summary = RunSummary::new(plan.name, self.config.dry_run, Utc::now());
        info!(
            run_id = %summary.run_id,
            mode = plan.name,
            dry_run = self.config.dry_run,
            "sync run starting"
        );

        let outcome = self
            .begin()
            .and_then(|()| self.execute(cursor_dir, request, &plan, started, &mut summary));
        match outcome {
            Ok(()) if summary.cancelled => self.set_state(RunState::Cancelled),
            Ok(()) => self.set_state(RunState::Done),
            Err(err) => {
                error!(run_id = %summary.run_id, error = %err, "sync run failed");
                summary.abort(&err);
                if !matches!(err, SyncError::InvalidStateTransition { .. }) {
                    self.set_state(RunState::Error);
                }
            }
        }

        summary.finish(started.elapsed());
        info!(
            run_id = %summary.run_id,
            status = ?summary.status,
            elapsed_ms = summary.elapsed_ms,
            "sync run finished: {summary}"
        );
        summary
    }

    fn execute(
        &self,
        cursor_dir: &Path,
        request: &RunRequest,
        plan: &RunPlan,
        started: Instant,
        summary: &mut RunSummary,
    ) -> SyncResult<()> {
        self.config.validate()?;
        let dry_run = self.config.dry_run;

        let mut filters = request.filters.clone();
        if let Invocation::ExplicitIds(ids) = &request.invocation {
            filters = filters.with_ids(ids.iter().cloned());
            if filters.ids.is_empty() {
                return Err(SyncError::InvalidConfig("no valid ids given".into()));
            }
        }
        let explicit = filters.restrict_to_ids();

        let class = if dry_run {
            OperationClass::ReadOnly
        } else {
            plan.class
        };
        self.gate
            .check(class, &Scope::from_filters(&filters), request.ack.as_deref())
            .into_result()?;

        let dir = CursorDir::open(cursor_dir, true)?;
        let mut cursor = dir.load()?;
        summary.watermark_before = cursor.last_sync_at;
        summary.watermark_after = cursor.last_sync_at;
        self.set_state(RunState::Fetching);

        let retrier = Retrier::new(self.config.retry.clone());
        if plan.wipe {
            self.wipe(&retrier, &filters, &mut cursor, dry_run)?;
        } else if self.config.bootstrap_tracked && cursor.tracked_keys.is_empty() && !explicit {
            match retrier.run("external_keys", || self.destination.external_keys()) {
                Ok(keys) => {
                    info!(count = keys.len(), "tracked keys seeded from destination");
                    cursor.track(keys);
                }
                Err(err) => warn!(error = %err, "could not seed tracked keys"),
            }
        }

        let fetch_plan = FetchPlan {
            since: if plan.from_watermark {
                cursor.last_sync_at
            } else {
                None
            },
            filters,
            tracked: cursor.tracked_keys.clone(),
            refresh_tracked: plan.refresh_tracked && self.config.track_existing,
        };
        let options = ReconcileOptions {
            mode: plan.mode,
            ownership: self.config.ownership.clone(),
            regenerate_derived: self.config.regenerate_derived,
            creation_guard: self.config.creation_guard.clone(),
            apply_creation_guard: !explicit,
            dry_run,
            synced_at: summary.started_at,
        };

        let fetch = ChangeFetcher::new(self.upstream, &retrier).fetch(fetch_plan)?;
        let reconciler = Reconciler::new(self.destination, &retrier, options);
        let stopper = Stopper {
            cancel: &self.cancel,
            deadline: self.config.run_timeout.map(|t| started + t),
        };
        let result = self.pipeline(fetch, &reconciler, &stopper, summary);
        summary.cancelled = result.cancelled;

        if dry_run {
            info!("dry run, cursor not written");
            return Ok(());
        }

        self.set_state(RunState::Committing);
        for key in &result.synced {
            cursor.mark_synced(key);
        }
        for (key, reason) in &result.failed {
            cursor.mark_failed(key, reason.as_str());
        }
        if plan.advance_watermark && !explicit {
            match result.watermark_candidate() {
                Some(candidate) => {
                    if !cursor.advance_watermark(candidate) {
                        debug!(%candidate, "watermark unchanged");
                    }
                }
                None if result.cancelled => {
                    warn!("run cancelled before a safe watermark was reached, keeping previous");
                }
                None => {}
            }
        }
        dir.save(&cursor)?;
        summary.cursor_committed = true;
        summary.watermark_after = cursor.last_sync_at;
        Ok(())
    }

    /// Archives the documents a destructive rebuild will recreate.
    ///
    /// A scoped wipe lists its scope first and archives only those keys.
    /// Documents outside the scope stay live and tracked.
    fn wipe(
        &self,
        retrier: &Retrier,
        filters: &Filters,
        cursor: &mut Cursor,
        dry_run: bool,
    ) -> SyncResult<()> {
        if !filters.is_scoped() {
            if dry_run {
                info!("dry run, destination not archived");
            } else {
                let archived = retrier.run("archive_all", || self.destination.archive_all())?;
                warn!(archived, "destination archived before rebuild");
            }
            cursor.tracked_keys.clear();
            return Ok(());
        }

        let listing = ChangeFetcher::new(self.upstream, retrier).fetch(FetchPlan {
            filters: filters.clone(),
            ..FetchPlan::default()
        })?;
        let scoped: BTreeSet<ExternalKey> = listing
            .filter_map(|item| match item {
                FetchItem::Record(record) => Some(record.external_key),
                _ => None,
            })
            .collect();

        if dry_run {
            info!(count = scoped.len(), "dry run, scoped documents not archived");
        } else {
            let archived =
                retrier.run("archive_keys", || self.destination.archive_keys(&scoped))?;
            warn!(archived, scope = scoped.len(), "scoped documents archived before rebuild");
        }
        cursor.tracked_keys.retain(|key| !scoped.contains(key));
        Ok(())
    }

    fn pipeline(
        &self,
        mut fetch: Fetch<'_>,
        reconciler: &Reconciler<'_>,
        stopper: &Stopper<'_>,
        summary: &mut RunSummary,
    ) -> PipelineResult {
        let workers = self.config.concurrency;
        let (work_tx, work_rx) = mpsc::sync_channel::<Record>(workers);
        let work_rx = Mutex::new(work_rx);
        let (event_tx, event_rx) = mpsc::channel::<Event>();

        std::thread::scope(|scope| {
            let aggregator = scope.spawn(move || aggregate(event_rx, summary));
            for worker in 0..workers {
                let events = event_tx.clone();
                let work_rx = &work_rx;
                scope.spawn(move || self.work(worker, work_rx, &events, reconciler, stopper));
            }

            let mut fetched_max = None;
            let mut exhausted = false;
            let mut stopped = false;
            loop {
                if stopper.should_stop() {
                    info!("cancellation requested, no further records dequeued");
                    stopped = true;
                    break;
                }
                let Some(item) = fetch.next() else {
                    exhausted = true;
                    break;
                };
                fetched_max = fetched_max.max(item.observed_at());

                let sent = match item {
                    FetchItem::Record(record) => work_tx.send(record).is_ok(),
                    FetchItem::Filtered {
                        key,
                        updated_at,
                        reason,
                    } => event_tx
                        .send(Event {
                            key: Some(key),
                            observed_at: updated_at,
                            kind: EventKind::Done {
                                outcome: OutcomeKind::Filtered,
                                destination_id: None,
                                detail: Some(reason.to_string()),
                                track: false,
                            },
                        })
                        .is_ok(),
                    FetchItem::Failed {
                        key,
                        updated_at,
                        error,
                    } => event_tx
                        .send(Event {
                            key,
                            observed_at: updated_at,
                            kind: EventKind::Failed {
                                stage: FailureStage::Fetch,
                                cause: error.to_string(),
                            },
                        })
                        .is_ok(),
                };
                if !sent {
                    break;
                }
            }
            drop(work_tx);
            drop(event_tx);

            let aggregate = aggregator
                .join()
                .unwrap_or_else(|panic| std::panic::resume_unwind(panic));
            PipelineResult {
                cancelled: stopped || aggregate.unprocessed > 0,
                listing_exhausted: exhausted,
                fetched_max,
                processed_max: aggregate.processed_max,
                unprocessed_min: aggregate.unprocessed_min,
                synced: aggregate.synced,
                failed: aggregate.failed,
            }
        })
    }

    fn work(
        &self,
        worker: usize,
        queue: &Mutex<Receiver<Record>>,
        events: &Sender<Event>,
        reconciler: &Reconciler<'_>,
        stopper: &Stopper<'_>,
    ) {
        debug!(worker, "worker started");
        loop {
            let next = queue.lock().recv();
            let Ok(record) = next else { break };
            let event = if stopper.should_stop() {
                Event {
                    key: Some(record.external_key.clone()),
                    observed_at: Some(record.updated_at),
                    kind: EventKind::Unprocessed,
                }
            } else {
                self.process(&record, reconciler)
            };
            if events.send(event).is_err() {
                break;
            }
        }
        debug!(worker, "worker stopped");
    }

    fn process(&self, record: &Record, reconciler: &Reconciler<'_>) -> Event {
        let key = record.external_key.clone();
        let observed_at = Some(record.updated_at);

        let enriched = match self.enricher.enrich(record) {
            Ok(enriched) => enriched,
            Err(err) => {
                warn!(key = %key, error = %err, "enrichment failed");
                return Event {
                    key: Some(key),
                    observed_at,
                    kind: EventKind::Failed {
                        stage: FailureStage::Enrich,
                        cause: err.to_string(),
                    },
                };
            }
        };

        let kind = match reconciler.reconcile(&enriched) {
            Outcome::Created { destination_id } => EventKind::Done {
                outcome: OutcomeKind::Created,
                destination_id,
                detail: None,
                track: true,
            },
            Outcome::Updated { destination_id } => EventKind::Done {
                outcome: OutcomeKind::Updated,
                destination_id: Some(destination_id),
                detail: None,
                track: true,
            },
            Outcome::Skipped(reason) => EventKind::Done {
                outcome: OutcomeKind::Skipped,
                destination_id: None,
                detail: Some(reason.to_string()),
                track: reason == SkipReason::AlreadyExists,
            },
            Outcome::Failed(err) => EventKind::Failed {
                stage: FailureStage::Reconcile,
                cause: err.to_string(),
            },
        };
        Event {
            key: Some(key),
            observed_at,
            kind,
        }
    }
}

struct Stopper<'c> {
    cancel: &'c CancelToken,
    deadline: Option<Instant>,
}

impl Stopper<'_> {
    fn should_stop(&self) -> bool {
        self.cancel.is_cancelled() || self.deadline.is_some_and(|d| Instant::now() >= d)
    }
}

struct Event {
    key: Option<ExternalKey>,
    observed_at: Option<Timestamp>,
    kind: EventKind,
}

enum EventKind {
    Done {
        outcome: OutcomeKind,
        destination_id: Option<String>,
        detail: Option<String>,
        track: bool,
    },
    Failed {
        stage: FailureStage,
        cause: String,
    },
    Unprocessed,
}

#[derive(Default)]
struct Aggregate {
    processed_max: Option<Timestamp>,
    unprocessed_min: Option<Timestamp>,
    unprocessed: usize,
    synced: Vec<ExternalKey>,
    failed: Vec<(ExternalKey, String)>,
}

fn aggregate(events: Receiver<Event>, summary: &mut RunSummary) -> Aggregate {
    let mut agg = Aggregate::default();
    for event in events {
        match event.kind {
            EventKind::Done {
                outcome,
                destination_id,
                detail,
                track,
            } => {
                agg.processed_max = agg.processed_max.max(event.observed_at);
                if track {
                    if let Some(key) = &event.key {
                        agg.synced.push(key.clone());
                    }
                }
                summary.record(event.key, outcome, destination_id, detail);
            }
            EventKind::Failed { stage, cause } => {
                agg.processed_max = agg.processed_max.max(event.observed_at);
                if let Some(key) = &event.key {
                    agg.failed.push((key.clone(), cause.clone()));
                }
                summary.fail(event.key, stage, cause);
            }
            EventKind::Unprocessed => {
                agg.unprocessed += 1;
                agg.unprocessed_min = match (agg.unprocessed_min, event.observed_at) {
                    (Some(a), Some(b)) => Some(a.min(b)),
                    (a, b) => a.or(b),
                };
                summary.record(event.key, OutcomeKind::Unprocessed, None, None);
            }
        }
    }
    agg
}

struct PipelineResult {
    cancelled: bool,
    listing_exhausted: bool,
    fetched_max: Option<Timestamp>,
    processed_max: Option<Timestamp>,
    unprocessed_min: Option<Timestamp>,
    synced: Vec<ExternalKey>,
    failed: Vec<(ExternalKey, String)>,
}

impl PipelineResult {
    /// Watermark this run may commit, if any.
    ///
    /// A complete run commits the newest timestamp it fetched. A cancelled
    /// run commits the newest processed timestamp only when the listing was
    /// drained and nothing left unprocessed is older than it.
    fn watermark_candidate(&self) -> Option<Timestamp> {
        if !self.cancelled {
            return self.fetched_max;
        }
        if !self.listing_exhausted {
            return None;
        }
        match (self.processed_max, self.unprocessed_min) {
            (Some(processed), Some(pending)) if pending < processed => None,
            (processed, _) => processed,
        }
    }
}
