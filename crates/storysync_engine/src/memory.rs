//! In-memory collaborators for testing and offline runs.
//!
//! Both implementations support fault injection so failure handling can be
//! exercised without a network.

use crate::error::{SyncError, SyncResult};
use crate::transport::{
    DestinationStore, FetchFailure, Filters, IterationFilter, RecordStream, UpstreamSource,
};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use storysync_core::{DestinationDocument, ExternalKey, Record, Timestamp};
use uuid::Uuid;

const DEFAULT_PAGE_SIZE: usize = 50;

/// In-memory upstream.
///
/// Records are listed in insertion order, one page at a time, so a consumer
/// that stops early never causes later pages to be read.
#[derive(Debug)]
pub struct MemoryUpstream {
    records: RwLock<Vec<Record>>,
    page_size: usize,
    current_iteration: Mutex<Option<String>>,
    listing_failures: Mutex<Vec<(Option<ExternalKey>, String)>>,
    transient_get_failures: Mutex<HashMap<ExternalKey, u32>>,
    pages_served: AtomicUsize,
    get_calls: Mutex<Vec<ExternalKey>>,
}

impl MemoryUpstream {
    /// Creates an empty upstream.
    pub fn new() -> Self {
        Self::with_page_size(DEFAULT_PAGE_SIZE)
    }

    /// Creates an empty upstream with a custom page size.
    pub fn with_page_size(page_size: usize) -> Self {
        Self {
            records: RwLock::new(Vec::new()),
            page_size: page_size.max(1),
            current_iteration: Mutex::new(None),
            listing_failures: Mutex::new(Vec::new()),
            transient_get_failures: Mutex::new(HashMap::new()),
            pages_served: AtomicUsize::new(0),
            get_calls: Mutex::new(Vec::new()),
        }
    }

    /// Adds or replaces a record. A replaced record keeps its position.
    pub fn put(&self, record: Record) {
        let mut records = self.records.write();
        match records
            .iter_mut()
            .find(|r| r.external_key == record.external_key)
        {
            Some(slot) => *slot = record,
            None => records.push(record),
        }
    }

    /// Appends a record even if its key is already present, simulating
    /// overlapping pages.
    pub fn push_duplicate(&self, record: Record) {
        self.records.write().push(record);
    }

    /// Sets the iteration reported as current.
    pub fn set_current_iteration(&self, iteration: impl Into<String>) {
        *self.current_iteration.lock() = Some(iteration.into());
    }

    /// Appends a failed item to the end of every listing.
    pub fn fail_in_listing(&self, key: Option<ExternalKey>, reason: impl Into<String>) {
        self.listing_failures.lock().push((key, reason.into()));
    }

    /// Makes the next `times` direct lookups of `key` fail transiently.
    pub fn fail_get_transiently(&self, key: &ExternalKey, times: u32) {
        self.transient_get_failures
            .lock()
            .insert(key.clone(), times);
    }

    /// Number of listing pages handed out so far.
    pub fn pages_served(&self) -> usize {
        self.pages_served.load(Ordering::SeqCst)
    }

    /// Keys looked up directly so far, in call order.
    pub fn get_calls(&self) -> Vec<ExternalKey> {
        self.get_calls.lock().clone()
    }

    fn page(
        &self,
        index: usize,
        since: Option<Timestamp>,
        filters: &Filters,
    ) -> Option<Vec<Record>> {
        let records = self.records.read();
        let start = index * self.page_size;
        if start >= records.len() {
            return None;
        }
        self.pages_served.fetch_add(1, Ordering::SeqCst);
        let end = (start + self.page_size).min(records.len());
        Some(
            records[start..end]
                .iter()
                .filter(|r| matches_listing(r, since, filters))
                .cloned()
                .collect(),
        )
    }
}

impl Default for MemoryUpstream {
    fn default() -> Self {
        Self::new()
    }
}

fn matches_listing(record: &Record, since: Option<Timestamp>, filters: &Filters) -> bool {
    if since.is_some_and(|s| record.updated_at < s) {
        return false;
    }
    if let Some(creator) = &filters.creator {
        if record.creator.as_deref() != Some(creator.as_str()) {
            return false;
        }
    }
    if let Some(module) = &filters.module {
        if record.module.as_deref() != Some(module.as_str()) {
            return false;
        }
    }
    if let IterationFilter::Id(iteration) = &filters.iteration {
        if record.iteration.as_deref() != Some(iteration.as_str()) {
            return false;
        }
    }
    true
}

struct Listing<'a> {
    source: &'a MemoryUpstream,
    since: Option<Timestamp>,
    filters: Filters,
    next_page: usize,
    buffer: std::vec::IntoIter<Record>,
    exhausted: bool,
    failures: std::vec::IntoIter<(Option<ExternalKey>, String)>,
}

impl Iterator for Listing<'_> {
    type Item = Result<Record, FetchFailure>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(record) = self.buffer.next() {
                return Some(Ok(record));
            }
            if self.exhausted {
                return self.failures.next().map(|(key, reason)| {
                    Err(FetchFailure {
                        key,
                        error: SyncError::transport_fatal(reason),
                    })
                });
            }
            match self.source.page(self.next_page, self.since, &self.filters) {
                Some(page) => {
                    self.next_page += 1;
                    self.buffer = page.into_iter();
                }
                None => self.exhausted = true,
            }
        }
    }
}

impl UpstreamSource for MemoryUpstream {
    fn list_changed(
        &self,
        since: Option<Timestamp>,
        filters: &Filters,
    ) -> SyncResult<RecordStream<'_>> {
        let failures = self.listing_failures.lock().clone();
        Ok(Box::new(Listing {
            source: self,
            since,
            filters: filters.clone(),
            next_page: 0,
            buffer: Vec::new().into_iter(),
            exhausted: false,
            failures: failures.into_iter(),
        }))
    }

    fn get_by_id(&self, key: &ExternalKey) -> SyncResult<Record> {
        self.get_calls.lock().push(key.clone());

        if let Some(remaining) = self.transient_get_failures.lock().get_mut(key) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(SyncError::transport_retryable(format!(
                    "upstream unavailable for {key}"
                )));
            }
        }

        self.records
            .read()
            .iter()
            .find(|r| &r.external_key == key)
            .cloned()
            .ok_or_else(|| SyncError::NotFound { key: key.clone() })
    }

    fn current_iteration(&self) -> SyncResult<Option<String>> {
        Ok(self.current_iteration.lock().clone())
    }
}

/// One write call seen by a [`MemoryDestination`].
#[derive(Debug, Clone)]
pub struct WriteCall {
    /// Key of the written document.
    pub key: ExternalKey,
    /// When the call arrived.
    pub at: Instant,
    /// Whether it was answered with a rate limit.
    pub rate_limited: bool,
}

#[derive(Debug, Default)]
struct RateLimitScript {
    remaining: u32,
    retry_after: Duration,
}

/// In-memory destination store.
#[derive(Debug, Default)]
pub struct MemoryDestination {
    documents: Mutex<Vec<DestinationDocument>>,
    archived: Mutex<Vec<DestinationDocument>>,
    rate_limit: Mutex<RateLimitScript>,
    structural_rejects: Mutex<HashSet<ExternalKey>>,
    write_delay: Mutex<Duration>,
    in_flight: Mutex<HashSet<ExternalKey>>,
    overlapping_writes: AtomicUsize,
    write_log: Mutex<Vec<WriteCall>>,
    lookups: AtomicUsize,
    creates: AtomicUsize,
    updates: AtomicUsize,
    write_attempts: AtomicUsize,
}

impl MemoryDestination {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores a document directly and returns its id. Several documents may
    /// share a key this way.
    pub fn insert_raw(&self, mut doc: DestinationDocument) -> String {
        let id = doc
            .destination_id
            .clone()
            .unwrap_or_else(new_document_id);
        doc.destination_id = Some(id.clone());
        self.documents.lock().push(doc);
        id
    }

    /// Answers the next `times` writes with `RateLimited { retry_after }`.
    pub fn rate_limit_next(&self, times: u32, retry_after: Duration) {
        *self.rate_limit.lock() = RateLimitScript {
            remaining: times,
            retry_after,
        };
    }

    /// Rejects every write for `key` as structurally invalid.
    pub fn reject_structurally(&self, key: &ExternalKey) {
        self.structural_rejects.lock().insert(key.clone());
    }

    /// Makes every write take at least `delay`.
    pub fn set_write_delay(&self, delay: Duration) {
        *self.write_delay.lock() = delay;
    }

    /// Returns all live documents.
    pub fn documents(&self) -> Vec<DestinationDocument> {
        self.documents.lock().clone()
    }

    /// Returns the first live document with `key`.
    pub fn get(&self, key: &ExternalKey) -> Option<DestinationDocument> {
        self.documents
            .lock()
            .iter()
            .find(|d| &d.external_key == key)
            .cloned()
    }

    /// Returns the number of live documents.
    pub fn len(&self) -> usize {
        self.documents.lock().len()
    }

    /// Returns true if there are no live documents.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the number of archived documents.
    pub fn archived_count(&self) -> usize {
        self.archived.lock().len()
    }

    /// Number of lookups by external key.
    pub fn lookup_count(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }

    /// Number of successful creates.
    pub fn create_count(&self) -> usize {
        self.creates.load(Ordering::SeqCst)
    }

    /// Number of successful updates.
    pub fn update_count(&self) -> usize {
        self.updates.load(Ordering::SeqCst)
    }

    /// Number of write calls, including rejected ones.
    pub fn write_attempts(&self) -> usize {
        self.write_attempts.load(Ordering::SeqCst)
    }

    /// Every write call so far, in arrival order.
    pub fn write_calls(&self) -> Vec<WriteCall> {
        self.write_log.lock().clone()
    }

    /// Number of times two writes for the same key overlapped in time.
    pub fn overlapping_writes(&self) -> usize {
        self.overlapping_writes.load(Ordering::SeqCst)
    }

    fn write<T>(
        &self,
        key: &ExternalKey,
        apply: impl FnOnce(&mut Vec<DestinationDocument>) -> SyncResult<T>,
    ) -> SyncResult<T> {
        self.write_attempts.fetch_add(1, Ordering::SeqCst);
        let at = Instant::now();

        let limited = {
            let mut script = self.rate_limit.lock();
            if script.remaining > 0 {
                script.remaining -= 1;
                Some(script.retry_after)
            } else {
                None
            }
        };
        self.write_log.lock().push(WriteCall {
            key: key.clone(),
            at,
            rate_limited: limited.is_some(),
        });
        if let Some(retry_after) = limited {
            return Err(SyncError::RateLimited { retry_after });
        }

        if self.structural_rejects.lock().contains(key) {
            return Err(SyncError::Structural(format!(
                "document for {key} does not match the schema"
            )));
        }

        if !self.in_flight.lock().insert(key.clone()) {
            self.overlapping_writes.fetch_add(1, Ordering::SeqCst);
        }
        let delay = *self.write_delay.lock();
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
        let result = apply(&mut self.documents.lock());
        self.in_flight.lock().remove(key);
        result
    }
}

fn new_document_id() -> String {
    format!("page-{}", Uuid::new_v4().simple())
}

impl DestinationStore for MemoryDestination {
    fn find_by_external_key(&self, key: &ExternalKey) -> SyncResult<Vec<DestinationDocument>> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .documents
            .lock()
            .iter()
            .filter(|d| &d.external_key == key)
            .cloned()
            .collect())
    }

    fn create(&self, doc: &DestinationDocument) -> SyncResult<String> {
        let id = self.write(&doc.external_key, |documents| {
            let id = new_document_id();
            let mut stored = doc.clone();
            stored.destination_id = Some(id.clone());
            documents.push(stored);
            Ok(id)
        })?;
        self.creates.fetch_add(1, Ordering::SeqCst);
        Ok(id)
    }

    fn update(&self, destination_id: &str, doc: &DestinationDocument) -> SyncResult<()> {
        self.write(&doc.external_key, |documents| {
            let slot = documents
                .iter_mut()
                .find(|d| d.destination_id.as_deref() == Some(destination_id))
                .ok_or_else(|| {
                    SyncError::transport_fatal(format!("no document with id {destination_id}"))
                })?;
            let mut stored = doc.clone();
            stored.destination_id = Some(destination_id.to_string());
            *slot = stored;
            Ok(())
        })?;
        self.updates.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn external_keys(&self) -> SyncResult<Vec<ExternalKey>> {
        let keys: BTreeSet<ExternalKey> = self
            .documents
            .lock()
            .iter()
            .map(|d| d.external_key.clone())
            .collect();
        Ok(keys.into_iter().collect())
    }

    fn archive_keys(&self, keys: &BTreeSet<ExternalKey>) -> SyncResult<usize> {
        let mut documents = self.documents.lock();
        let (archived, kept): (Vec<_>, Vec<_>) = documents
            .drain(..)
            .partition(|d| keys.contains(&d.external_key));
        *documents = kept;
        let count = archived.len();
        self.archived.lock().extend(archived);
        Ok(count)
    }

    fn archive_all(&self) -> SyncResult<usize> {
        let drained: Vec<_> = self.documents.lock().drain(..).collect();
        let count = drained.len();
        self.archived.lock().extend(drained);
        Ok(count)
    }
}
