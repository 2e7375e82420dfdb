//! Interruption helpers for cancellation and crash tests.
//!
//! ## Test Strategy
//!
//! 1. **Cancel mid-batch** - [`CancelAfter`] trips a token after N records
//! 2. **Crash during cursor save** - [`leave_torn_temp_file`] leaves the
//!    half-written temporary file a killed process would leave behind
//! 3. **Enrichment failure** - [`FailKeys`] rejects chosen keys

use parking_lot::Mutex;
use std::collections::HashSet;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use storysync_core::{ExternalKey, Record};
use storysync_engine::{CancelToken, CompositeEnricher, Enricher, SyncError, SyncResult};

/// Enricher that cancels a token once `after` records have been enriched.
pub struct CancelAfter {
    inner: CompositeEnricher,
    token: CancelToken,
    after: usize,
    seen: AtomicUsize,
    enriched: Mutex<Vec<ExternalKey>>,
}

impl CancelAfter {
    /// Cancels `token` after `after` records.
    pub fn new(token: CancelToken, after: usize) -> Self {
        Self {
            inner: CompositeEnricher::rule_based(),
            token,
            after,
            seen: AtomicUsize::new(0),
            enriched: Mutex::new(Vec::new()),
        }
    }

    /// Keys enriched so far, in call order.
    pub fn enriched(&self) -> Vec<ExternalKey> {
        self.enriched.lock().clone()
    }
}

impl Enricher for CancelAfter {
    fn enrich(&self, record: &Record) -> SyncResult<Record> {
        let seen = self.seen.fetch_add(1, Ordering::SeqCst) + 1;
        self.enriched.lock().push(record.external_key.clone());
        if seen >= self.after {
            self.token.cancel();
        }
        self.inner.enrich(record)
    }
}

/// Enricher that fails for a fixed set of keys.
pub struct FailKeys {
    inner: CompositeEnricher,
    keys: HashSet<ExternalKey>,
}

impl FailKeys {
    /// Fails every key in `keys`.
    pub fn new<I, S>(keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            inner: CompositeEnricher::rule_based(),
            keys: keys.into_iter().map(ExternalKey::new).collect(),
        }
    }
}

impl Enricher for FailKeys {
    fn enrich(&self, record: &Record) -> SyncResult<Record> {
        if self.keys.contains(&record.external_key) {
            return Err(SyncError::enrichment(&record.external_key, "comments: timed out"));
        }
        self.inner.enrich(record)
    }
}

/// Writes a truncated `cursor.json.tmp` into `dir`, as a process killed
/// between write and rename would.
pub fn leave_torn_temp_file(dir: &Path) {
    fs::create_dir_all(dir).expect("Failed to create cursor dir");
    fs::write(dir.join("cursor.json.tmp"), br#"{"last_sync_at":"2024-05-01T1"#)
        .expect("Failed to write temp file");
}
