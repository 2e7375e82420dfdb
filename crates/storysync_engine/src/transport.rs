//! Collaborator interfaces for the upstream ticket system and the
//! destination document store.
//!
//! The engine never talks HTTP itself. Everything it needs from either side
//! goes through these two traits, so clients can be swapped (real API,
//! snapshot file, in-memory fake) without touching reconciliation logic.

use crate::error::{SyncError, SyncResult};
use std::collections::BTreeSet;
use storysync_core::{DestinationDocument, ExternalKey, Record, Timestamp};

/// Lazy sequence of upstream records, with per-item failures.
pub type RecordStream<'a> = Box<dyn Iterator<Item = Result<Record, FetchFailure>> + 'a>;

/// A record the upstream could not deliver.
#[derive(Debug)]
pub struct FetchFailure {
    /// Key of the failed record, when the upstream told us.
    pub key: Option<ExternalKey>,
    /// Why it failed.
    pub error: SyncError,
}

impl FetchFailure {
    /// Creates a failure for a known key.
    pub fn for_key(key: ExternalKey, error: SyncError) -> Self {
        Self {
            key: Some(key),
            error,
        }
    }

    /// Creates a failure that cannot be attributed to a key.
    pub fn unattributed(error: SyncError) -> Self {
        Self { key: None, error }
    }
}

/// How the iteration filter is resolved.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum IterationFilter {
    /// No iteration restriction.
    #[default]
    Any,
    /// Restrict to whatever the upstream reports as the current iteration.
    Current,
    /// Restrict to a specific iteration.
    Id(String),
}

/// Record selection for one run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Filters {
    /// Owner substrings, matched locally against every owner name.
    pub owners: Vec<String>,
    /// Creator, passed to the upstream.
    pub creator: Option<String>,
    /// Iteration restriction.
    pub iteration: IterationFilter,
    /// Module, passed to the upstream.
    pub module: Option<String>,
    /// Explicit keys. When non-empty, every other filter is ignored and
    /// each key is fetched directly.
    pub ids: Vec<ExternalKey>,
}

impl Filters {
    /// Creates an empty filter set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses a comma-separated owner list.
    pub fn with_owners(mut self, owners: &str) -> Self {
        self.owners = split_csv(owners);
        self
    }

    /// Sets the creator.
    pub fn with_creator(mut self, creator: impl Into<String>) -> Self {
        self.creator = Some(creator.into());
        self
    }

    /// Sets the iteration restriction.
    pub fn with_iteration(mut self, iteration: IterationFilter) -> Self {
        self.iteration = iteration;
        self
    }

    /// Sets the module.
    pub fn with_module(mut self, module: impl Into<String>) -> Self {
        self.module = Some(module.into());
        self
    }

    /// Restricts the run to explicit keys.
    pub fn with_ids<I>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = ExternalKey>,
    {
        self.ids = ids.into_iter().filter(ExternalKey::is_valid).collect();
        self
    }

    /// Returns true when the run fetches explicit keys only.
    pub fn restrict_to_ids(&self) -> bool {
        !self.ids.is_empty()
    }

    /// Returns true if the filters narrow the run to an owner or iteration.
    pub fn is_scoped(&self) -> bool {
        self.restrict_to_ids()
            || !self.owners.is_empty()
            || self.iteration != IterationFilter::Any
    }
}

/// Splits a comma-separated list, trimming and dropping empty entries.
pub fn split_csv(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// The upstream source of truth.
pub trait UpstreamSource: Send + Sync {
    /// Lists records changed at or after `since` (all records when `None`),
    /// in the upstream's pagination order.
    ///
    /// Implementations apply `creator`, `module` and [`IterationFilter::Id`]
    /// server-side when they can. Owner matching is done by the engine, and
    /// [`IterationFilter::Current`] is resolved before this is called.
    fn list_changed(&self, since: Option<Timestamp>, filters: &Filters)
        -> SyncResult<RecordStream<'_>>;

    /// Fetches one record directly.
    fn get_by_id(&self, key: &ExternalKey) -> SyncResult<Record>;

    /// Returns the id of the current iteration, if the upstream has one.
    fn current_iteration(&self) -> SyncResult<Option<String>> {
        Ok(None)
    }
}

/// The destination document store.
///
/// Write methods return [`SyncError::RateLimited`] when the store asks the
/// caller to back off, and [`SyncError::Structural`] when the document
/// itself is unacceptable.
pub trait DestinationStore: Send + Sync {
    /// Returns every document carrying `key`. More than one is corruption.
    fn find_by_external_key(&self, key: &ExternalKey) -> SyncResult<Vec<DestinationDocument>>;

    /// Creates a document and returns its destination id.
    fn create(&self, doc: &DestinationDocument) -> SyncResult<String>;

    /// Overwrites the document with the given destination id.
    fn update(&self, destination_id: &str, doc: &DestinationDocument) -> SyncResult<()>;

    /// Lists the external keys of every live document.
    fn external_keys(&self) -> SyncResult<Vec<ExternalKey>>;

    /// Archives every live document whose key is in `keys`. Returns how many
    /// were archived.
    fn archive_keys(&self, keys: &BTreeSet<ExternalKey>) -> SyncResult<usize>;

    /// Archives every document. Returns how many were archived.
    fn archive_all(&self) -> SyncResult<usize>;
}
