//! Create / update / skip decisions against the destination.

use crate::config::CreationGuard;
use crate::error::SyncError;
use crate::fetcher::owner_matches;
use crate::mapper::map_record;
use crate::retry::Retrier;
use crate::transport::DestinationStore;
use parking_lot::{Condvar, Mutex};
use std::collections::HashSet;
use storysync_core::{
    merge_preserve, DestinationDocument, ExternalKey, FieldOwnership, Record, Timestamp,
};
use tracing::{debug, error, warn};

/// Which writes a run may perform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReconcileMode {
    /// Create missing documents and update existing ones.
    #[default]
    Upsert,
    /// Only create; existing documents are left untouched.
    InsertOnly,
    /// Only update; missing documents are created when `create_missing`.
    UpdateOnly {
        /// Create documents that do not exist yet.
        create_missing: bool,
    },
}

/// Why a record was skipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Insert-only run and the document exists.
    AlreadyExists,
    /// Update-only run and the document does not exist.
    MissingDownstream,
    /// The creation guard rejected a new document.
    CreationGuard,
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            SkipReason::AlreadyExists => "already exists",
            SkipReason::MissingDownstream => "missing downstream",
            SkipReason::CreationGuard => "creation guard",
        })
    }
}

/// Result of reconciling one record.
#[derive(Debug)]
pub enum Outcome {
    /// A document was created. The id is `None` in dry runs.
    Created {
        /// Id assigned by the destination.
        destination_id: Option<String>,
    },
    /// The existing document was overwritten.
    Updated {
        /// Id of the updated document.
        destination_id: String,
    },
    /// Nothing was written.
    Skipped(SkipReason),
    /// The record could not be reconciled.
    Failed(SyncError),
}

impl Outcome {
    /// Returns true for created or updated records.
    pub fn is_write(&self) -> bool {
        matches!(self, Outcome::Created { .. } | Outcome::Updated { .. })
    }
}

/// Serializes work per external key.
///
/// Two workers holding records with the same key never touch the
/// destination for it at the same time.
#[derive(Debug, Default)]
pub struct KeyLocks {
    held: Mutex<HashSet<ExternalKey>>,
    released: Condvar,
}

impl KeyLocks {
    /// Creates an empty lock table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Blocks until `key` is free, then holds it until the guard drops.
    pub fn lock(&self, key: &ExternalKey) -> KeyGuard<'_> {
        let mut held = self.held.lock();
        while held.contains(key) {
            self.released.wait(&mut held);
        }
        held.insert(key.clone());
        KeyGuard {
            locks: self,
            key: key.clone(),
        }
    }
}

/// Holds one key in a [`KeyLocks`] table.
#[derive(Debug)]
pub struct KeyGuard<'a> {
    locks: &'a KeyLocks,
    key: ExternalKey,
}

impl Drop for KeyGuard<'_> {
    fn drop(&mut self) {
        self.locks.held.lock().remove(&self.key);
        self.locks.released.notify_all();
    }
}

/// Per-run reconciliation settings.
#[derive(Debug, Clone)]
pub struct ReconcileOptions {
    /// Allowed writes.
    pub mode: ReconcileMode,
    /// Property ownership for merge-preserve.
    pub ownership: FieldOwnership,
    /// Overwrite downstream-owned content.
    pub regenerate_derived: bool,
    /// Conditions for creating documents.
    pub creation_guard: CreationGuard,
    /// Whether the creation guard applies (not for explicit ids).
    pub apply_creation_guard: bool,
    /// Decide without writing.
    pub dry_run: bool,
    /// Timestamp stamped on every written document.
    pub synced_at: Timestamp,
}

impl ReconcileOptions {
    /// Creates upsert options stamped with `synced_at`.
    pub fn new(synced_at: Timestamp) -> Self {
        Self {
            mode: ReconcileMode::Upsert,
            ownership: FieldOwnership::default(),
            regenerate_derived: false,
            creation_guard: CreationGuard::none(),
            apply_creation_guard: true,
            dry_run: false,
            synced_at,
        }
    }
}

/// Applies enriched records to the destination.
pub struct Reconciler<'a> {
    destination: &'a dyn DestinationStore,
    retrier: &'a Retrier,
    options: ReconcileOptions,
    locks: KeyLocks,
}

impl<'a> Reconciler<'a> {
    /// Creates a reconciler.
    pub fn new(
        destination: &'a dyn DestinationStore,
        retrier: &'a Retrier,
        options: ReconcileOptions,
    ) -> Self {
        Self {
            destination,
            retrier,
            options,
            locks: KeyLocks::new(),
        }
    }

    /// Returns the options in effect.
    pub fn options(&self) -> &ReconcileOptions {
        &self.options
    }

    /// Reconciles one record. Never panics on destination errors; every
    /// failure comes back as [`Outcome::Failed`].
    pub fn reconcile(&self, record: &Record) -> Outcome {
        let key = &record.external_key;
        let _guard = self.locks.lock(key);

        let matches = match self
            .retrier
            .run("find_by_external_key", || self.destination.find_by_external_key(key))
        {
            Ok(matches) => matches,
            Err(err) => {
                warn!(key = %key, error = %err, "destination lookup failed");
                return Outcome::Failed(err);
            }
        };

        let outcome = match matches.as_slice() {
            [] => self.create(record),
            [existing] => self.update(record, existing),
            many => {
                let destination_ids: Vec<String> = many
                    .iter()
                    .map(|d| d.destination_id.clone().unwrap_or_default())
                    .collect();
                error!(
                    key = %key,
                    destination_ids = ?destination_ids,
                    "multiple destination documents share one external key"
                );
                Outcome::Failed(SyncError::DuplicateDestination {
                    key: key.clone(),
                    destination_ids,
                })
            }
        };

        match &outcome {
            Outcome::Failed(err) => warn!(key = %key, error = %err, "record failed"),
            other => debug!(
                key = %key,
                outcome = ?other,
                dry_run = self.options.dry_run,
                "record reconciled"
            ),
        }
        outcome
    }

    fn create(&self, record: &Record) -> Outcome {
        match self.options.mode {
            ReconcileMode::UpdateOnly {
                create_missing: false,
            } => return Outcome::Skipped(SkipReason::MissingDownstream),
            ReconcileMode::Upsert
            | ReconcileMode::InsertOnly
            | ReconcileMode::UpdateOnly { .. } => {}
        }
        if self.options.apply_creation_guard && !guard_allows(&self.options.creation_guard, record)
        {
            return Outcome::Skipped(SkipReason::CreationGuard);
        }
        if self.options.dry_run {
            return Outcome::Created {
                destination_id: None,
            };
        }

        let doc = map_record(record, self.options.synced_at);
        match self.retrier.run("create", || self.destination.create(&doc)) {
            Ok(id) => Outcome::Created {
                destination_id: Some(id),
            },
            Err(err) => Outcome::Failed(err),
        }
    }

    fn update(&self, record: &Record, existing: &DestinationDocument) -> Outcome {
        if self.options.mode == ReconcileMode::InsertOnly {
            return Outcome::Skipped(SkipReason::AlreadyExists);
        }
        let Some(destination_id) = existing.destination_id.clone() else {
            return Outcome::Failed(SyncError::Structural(format!(
                "existing document for {} has no destination id",
                record.external_key
            )));
        };
        if self.options.dry_run {
            return Outcome::Updated { destination_id };
        }

        let candidate = map_record(record, self.options.synced_at);
        let merged = merge_preserve(
            existing,
            candidate,
            &self.options.ownership,
            self.options.regenerate_derived,
        );
        match self
            .retrier
            .run("update", || self.destination.update(&destination_id, &merged))
        {
            Ok(()) => Outcome::Updated { destination_id },
            Err(err) => Outcome::Failed(err),
        }
    }
}

fn guard_allows(guard: &CreationGuard, record: &Record) -> bool {
    if !owner_matches(&record.owners, &guard.owner_substrings) {
        return false;
    }
    match &guard.iteration {
        Some(iteration) => record.iteration.as_deref() == Some(iteration.as_str()),
        None => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetryConfig;
    use crate::memory::MemoryDestination;
    use chrono::{TimeZone, Utc};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use storysync_core::{BlockKind, ContentBlock, FieldValue};

    fn at(hour: u32, minute: u32) -> Timestamp {
        Utc.with_ymd_and_hms(2024, 5, 1, hour, minute, 0).unwrap()
    }

    fn retrier(max_attempts: u32) -> Retrier {
        Retrier::new(
            RetryConfig::new(max_attempts)
                .with_initial_delay(Duration::from_millis(1))
                .with_max_delay(Duration::from_millis(2))
                .with_jitter(false),
        )
    }

    fn options() -> ReconcileOptions {
        ReconcileOptions::new(at(12, 0))
    }

    fn record(key: &str) -> Record {
        Record::new(key, format!("story {key}"), at(10, 0))
    }

    #[test]
    fn creates_then_updates() {
        let dest = MemoryDestination::new();
        let retrier = retrier(3);
        let reconciler = Reconciler::new(&dest, &retrier, options());

        assert!(matches!(
            reconciler.reconcile(&record("A")),
            Outcome::Created {
                destination_id: Some(_)
            }
        ));
        assert!(matches!(
            reconciler.reconcile(&record("A")),
            Outcome::Updated { .. }
        ));
        assert_eq!(dest.len(), 1);
    }

    #[test]
    fn duplicates_are_never_resolved() {
        let dest = MemoryDestination::new();
        dest.insert_raw(DestinationDocument::new(ExternalKey::new("A")));
        dest.insert_raw(DestinationDocument::new(ExternalKey::new("A")));
        let retrier = retrier(3);
        let reconciler = Reconciler::new(&dest, &retrier, options());

        match reconciler.reconcile(&record("A")) {
            Outcome::Failed(SyncError::DuplicateDestination {
                destination_ids, ..
            }) => assert_eq!(destination_ids.len(), 2),
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(dest.write_attempts(), 0);
    }

    #[test]
    fn insert_only_skips_existing() {
        let dest = MemoryDestination::new();
        dest.insert_raw(DestinationDocument::new(ExternalKey::new("A")));
        let retrier = retrier(3);
        let opts = ReconcileOptions {
            mode: ReconcileMode::InsertOnly,
            ..options()
        };
        let reconciler = Reconciler::new(&dest, &retrier, opts);

        assert!(matches!(
            reconciler.reconcile(&record("A")),
            Outcome::Skipped(SkipReason::AlreadyExists)
        ));
        assert!(matches!(
            reconciler.reconcile(&record("B")),
            Outcome::Created { .. }
        ));
    }

    #[test]
    fn update_only_respects_create_missing() {
        let dest = MemoryDestination::new();
        let retrier = retrier(3);

        let strict = Reconciler::new(
            &dest,
            &retrier,
            ReconcileOptions {
                mode: ReconcileMode::UpdateOnly {
                    create_missing: false,
                },
                ..options()
            },
        );
        assert!(matches!(
            strict.reconcile(&record("A")),
            Outcome::Skipped(SkipReason::MissingDownstream)
        ));

        let lenient = Reconciler::new(
            &dest,
            &retrier,
            ReconcileOptions {
                mode: ReconcileMode::UpdateOnly {
                    create_missing: true,
                },
                ..options()
            },
        );
        assert!(matches!(
            lenient.reconcile(&record("A")),
            Outcome::Created { .. }
        ));
    }

    #[test]
    fn creation_guard_blocks_only_creates() {
        let dest = MemoryDestination::new();
        dest.insert_raw(DestinationDocument::new(ExternalKey::new("B")));
        let retrier = retrier(3);
        let opts = ReconcileOptions {
            creation_guard: CreationGuard::none().with_owners(["alice"]),
            ..options()
        };
        let reconciler = Reconciler::new(&dest, &retrier, opts.clone());

        assert!(matches!(
            reconciler.reconcile(&record("A").with_owner("bob")),
            Outcome::Skipped(SkipReason::CreationGuard)
        ));
        assert!(matches!(
            reconciler.reconcile(&record("C").with_owner("Alice W.")),
            Outcome::Created { .. }
        ));
        assert!(matches!(
            reconciler.reconcile(&record("B").with_owner("bob")),
            Outcome::Updated { .. }
        ));

        let explicit = Reconciler::new(
            &dest,
            &retrier,
            ReconcileOptions {
                apply_creation_guard: false,
                ..opts
            },
        );
        assert!(matches!(
            explicit.reconcile(&record("A").with_owner("bob")),
            Outcome::Created { .. }
        ));
    }

    #[test]
    fn dry_run_decides_without_writing() {
        let dest = MemoryDestination::new();
        dest.insert_raw(DestinationDocument::new(ExternalKey::new("B")));
        let retrier = retrier(3);
        let reconciler = Reconciler::new(
            &dest,
            &retrier,
            ReconcileOptions {
                dry_run: true,
                ..options()
            },
        );

        assert!(matches!(
            reconciler.reconcile(&record("A")),
            Outcome::Created {
                destination_id: None
            }
        ));
        assert!(matches!(
            reconciler.reconcile(&record("B")),
            Outcome::Updated { .. }
        ));
        assert_eq!(dest.write_attempts(), 0);
        assert_eq!(dest.lookup_count(), 2);
    }

    #[test]
    fn rate_limits_are_retried_then_exhausted() {
        let dest = MemoryDestination::new();
        let retrier = retrier(3);
        let reconciler = Reconciler::new(&dest, &retrier, options());

        dest.rate_limit_next(2, Duration::from_millis(1));
        assert!(reconciler.reconcile(&record("A")).is_write());
        assert_eq!(dest.write_attempts(), 3);

        dest.rate_limit_next(5, Duration::from_millis(1));
        match reconciler.reconcile(&record("B")) {
            Outcome::Failed(err) => {
                assert!(matches!(err.root_cause(), SyncError::RateLimited { .. }));
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(dest.write_attempts(), 6);
    }

    #[test]
    fn structural_failures_are_isolated() {
        let dest = MemoryDestination::new();
        dest.reject_structurally(&ExternalKey::new("A"));
        let retrier = retrier(3);
        let reconciler = Reconciler::new(&dest, &retrier, options());

        assert!(matches!(
            reconciler.reconcile(&record("A")),
            Outcome::Failed(SyncError::Structural(_))
        ));
        assert_eq!(dest.write_attempts(), 1);
        assert!(reconciler.reconcile(&record("B")).is_write());
    }

    #[test]
    fn update_preserves_downstream_content() {
        let dest = MemoryDestination::new();
        let existing = DestinationDocument::new(ExternalKey::new("A"))
            .with_property("analysis", FieldValue::text("hand written"))
            .with_blocks(vec![ContentBlock::derived(BlockKind::Paragraph, "edited")]);
        dest.insert_raw(existing);
        let retrier = retrier(3);
        let reconciler = Reconciler::new(&dest, &retrier, options());

        let mut incoming = record("A");
        incoming.derived_content = vec![
            ContentBlock::upstream(BlockKind::Paragraph, "fresh description"),
            ContentBlock::derived(BlockKind::Paragraph, "regenerated"),
        ];
        assert!(reconciler.reconcile(&incoming).is_write());

        let stored = dest.get(&ExternalKey::new("A")).unwrap();
        assert_eq!(stored.properties["analysis"], FieldValue::text("hand written"));
        let texts: Vec<_> = stored.content_blocks.iter().map(|b| b.text.as_str()).collect();
        assert_eq!(texts, vec!["fresh description", "edited"]);
        assert_eq!(stored.last_synced_at(), Some(at(12, 0)));
    }

    #[test]
    fn key_locks_serialize_same_key() {
        let locks = KeyLocks::new();
        let active = AtomicUsize::new(0);
        let overlaps = AtomicUsize::new(0);
        let key = ExternalKey::new("A");

        std::thread::scope(|s| {
            for _ in 0..4 {
                s.spawn(|| {
                    let _guard = locks.lock(&key);
                    if active.fetch_add(1, Ordering::SeqCst) > 0 {
                        overlaps.fetch_add(1, Ordering::SeqCst);
                    }
                    std::thread::sleep(Duration::from_millis(5));
                    active.fetch_sub(1, Ordering::SeqCst);
                });
            }
        });
        assert_eq!(overlaps.load(Ordering::SeqCst), 0);
    }
}
