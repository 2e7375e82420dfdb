//! Change fetcher: turns a watermark and a filter set into a lazy sequence
//! of upstream records.
//!
//! The sequence has three phases:
//!
//! 1. Explicit ids, looked up one by one (only phase when ids are given)
//! 2. The incremental listing since the watermark, with local filtering
//! 3. A refresh of tracked keys the listing did not return
//!
//! Nothing is pulled from the upstream until the consumer asks for the next
//! item, so a cancelled run stops fetching immediately.

use crate::error::{SyncError, SyncResult};
use crate::retry::Retrier;
use crate::transport::{Filters, IterationFilter, RecordStream, UpstreamSource};
use std::collections::{BTreeSet, HashSet};
use storysync_core::{ExternalKey, Record, Timestamp};
use tracing::{debug, warn};

/// Why a fetched record is not reconciled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterReason {
    /// No owner matches the owner filter.
    OwnerMismatch,
    /// The record belongs to another iteration.
    IterationMismatch,
    /// The key was already produced earlier in this run.
    Duplicate,
    /// A tracked key no longer exists upstream.
    GoneUpstream,
}

impl std::fmt::Display for FilterReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            FilterReason::OwnerMismatch => "owner mismatch",
            FilterReason::IterationMismatch => "iteration mismatch",
            FilterReason::Duplicate => "duplicate",
            FilterReason::GoneUpstream => "gone upstream",
        };
        f.write_str(text)
    }
}

/// One item produced by the fetcher.
#[derive(Debug)]
pub enum FetchItem {
    /// A record to enrich and reconcile.
    Record(Record),
    /// A record deliberately left alone.
    Filtered {
        /// The record's key.
        key: ExternalKey,
        /// Its upstream timestamp, when it was fetched.
        updated_at: Option<Timestamp>,
        /// Why it was filtered.
        reason: FilterReason,
    },
    /// A record that could not be fetched or is unusable.
    Failed {
        /// The record's key, when known and valid.
        key: Option<ExternalKey>,
        /// Its upstream timestamp, when the record itself arrived.
        updated_at: Option<Timestamp>,
        /// What went wrong.
        error: SyncError,
    },
}

impl FetchItem {
    /// The upstream timestamp this item contributes to the watermark.
    pub fn observed_at(&self) -> Option<Timestamp> {
        match self {
            FetchItem::Record(record) => Some(record.updated_at),
            FetchItem::Filtered { updated_at, .. } | FetchItem::Failed { updated_at, .. } => {
                *updated_at
            }
        }
    }

    /// The item's key, if known.
    pub fn key(&self) -> Option<&ExternalKey> {
        match self {
            FetchItem::Record(record) => Some(&record.external_key),
            FetchItem::Filtered { key, .. } => Some(key),
            FetchItem::Failed { key, .. } => key.as_ref(),
        }
    }
}

/// What to fetch in one run.
#[derive(Debug, Clone, Default)]
pub struct FetchPlan {
    /// Watermark; `None` lists everything.
    pub since: Option<Timestamp>,
    /// Record selection.
    pub filters: Filters,
    /// Keys already materialized downstream.
    pub tracked: BTreeSet<ExternalKey>,
    /// Refresh tracked keys that the listing did not return.
    pub refresh_tracked: bool,
}

/// Returns true if any owner contains any of the substrings.
///
/// Comparison ignores case and every non-alphanumeric character, so
/// `"Zhang San (zs)"` matches `"zhangsan"`. An empty substring list matches
/// everything.
pub fn owner_matches(owners: &[String], substrings: &[String]) -> bool {
    if substrings.is_empty() {
        return true;
    }
    let needles: Vec<String> = substrings
        .iter()
        .map(|s| normalize_name(s))
        .filter(|s| !s.is_empty())
        .collect();
    if needles.is_empty() {
        return true;
    }
    owners.iter().map(|o| normalize_name(o)).any(|owner| {
        needles.iter().any(|needle| owner.contains(needle.as_str()))
    })
}

fn normalize_name(name: &str) -> String {
    name.chars()
        .filter(|c| c.is_alphanumeric())
        .flat_map(char::to_lowercase)
        .collect()
}

/// Pulls records from an upstream according to a [`FetchPlan`].
pub struct ChangeFetcher<'a> {
    upstream: &'a dyn UpstreamSource,
    retrier: &'a Retrier,
}

impl<'a> ChangeFetcher<'a> {
    /// Creates a fetcher.
    pub fn new(upstream: &'a dyn UpstreamSource, retrier: &'a Retrier) -> Self {
        Self { upstream, retrier }
    }

    /// Starts fetching.
    ///
    /// # Errors
    ///
    /// Fails only when the listing itself cannot be opened or the current
    /// iteration cannot be resolved. Per-record problems are reported as
    /// [`FetchItem::Failed`].
    pub fn fetch(&self, plan: FetchPlan) -> SyncResult<Fetch<'a>> {
        if plan.filters.restrict_to_ids() {
            let mut unique = HashSet::new();
            let ids: Vec<ExternalKey> = plan
                .filters
                .ids
                .iter()
                .filter(|id| unique.insert((*id).clone()))
                .cloned()
                .collect();
            debug!(count = ids.len(), "fetching explicit ids");
            return Ok(Fetch::new(
                self.upstream,
                self.retrier.clone(),
                Phase::Ids(ids.into_iter()),
                plan,
                None,
            ));
        }

        let mut filters = plan.filters.clone();
        if filters.iteration == IterationFilter::Current {
            filters.iteration = match self
                .retrier
                .run("current_iteration", || self.upstream.current_iteration())?
            {
                Some(id) => {
                    debug!(iteration = %id, "resolved current iteration");
                    IterationFilter::Id(id)
                }
                None => {
                    warn!("upstream reports no current iteration, not restricting");
                    IterationFilter::Any
                }
            };
        }
        let iteration = match &filters.iteration {
            IterationFilter::Id(id) => Some(id.clone()),
            _ => None,
        };

        debug!(since = ?plan.since, "listing changed records");
        let listing = self.upstream.list_changed(plan.since, &filters)?;
        let plan = FetchPlan { filters, ..plan };
        Ok(Fetch::new(
            self.upstream,
            self.retrier.clone(),
            Phase::Listing(listing),
            plan,
            iteration,
        ))
    }
}

enum Phase<'a> {
    Ids(std::vec::IntoIter<ExternalKey>),
    Listing(RecordStream<'a>),
    Refresh(std::vec::IntoIter<ExternalKey>),
    Done,
}

/// Lazy fetch sequence. See the module docs for its phases.
pub struct Fetch<'a> {
    upstream: &'a dyn UpstreamSource,
    retrier: Retrier,
    phase: Phase<'a>,
    plan: FetchPlan,
    iteration: Option<String>,
    seen: HashSet<ExternalKey>,
}

impl<'a> Fetch<'a> {
    fn new(
        upstream: &'a dyn UpstreamSource,
        retrier: Retrier,
        phase: Phase<'a>,
        plan: FetchPlan,
        iteration: Option<String>,
    ) -> Self {
        Self {
            upstream,
            retrier,
            phase,
            plan,
            iteration,
            seen: HashSet::new(),
        }
    }

    /// Returns true once every phase has been drained.
    pub fn is_exhausted(&self) -> bool {
        matches!(self.phase, Phase::Done)
    }

    fn lookup(&self, key: ExternalKey) -> FetchItem {
        match self
            .retrier
            .run("get_by_id", || self.upstream.get_by_id(&key))
        {
            Ok(record) => FetchItem::Record(record),
            Err(error) => {
                warn!(key = %key, error = %error, "direct lookup failed");
                FetchItem::Failed {
                    key: Some(key),
                    updated_at: None,
                    error,
                }
            }
        }
    }

    fn classify(&mut self, record: Record) -> FetchItem {
        if let Err(err) = record.validate() {
            warn!(key = %record.external_key, "record has an unusable key");
            return FetchItem::Failed {
                key: None,
                updated_at: Some(record.updated_at),
                error: err.into(),
            };
        }

        let key = record.external_key.clone();
        if !self.seen.insert(key.clone()) {
            return filtered(&record, FilterReason::Duplicate);
        }
        if !owner_matches(&record.owners, &self.plan.filters.owners) {
            return filtered(&record, FilterReason::OwnerMismatch);
        }
        if let Some(iteration) = &self.iteration {
            let tracked = self.plan.tracked.contains(&key);
            if !tracked && record.iteration.as_deref() != Some(iteration.as_str()) {
                return filtered(&record, FilterReason::IterationMismatch);
            }
        }
        FetchItem::Record(record)
    }

    fn start_refresh(&mut self) {
        if !self.plan.refresh_tracked {
            self.phase = Phase::Done;
            return;
        }
        let pending: Vec<ExternalKey> = self
            .plan
            .tracked
            .iter()
            .filter(|key| !self.seen.contains(*key))
            .cloned()
            .collect();
        debug!(count = pending.len(), "refreshing tracked keys");
        self.phase = Phase::Refresh(pending.into_iter());
    }
}

fn filtered(record: &Record, reason: FilterReason) -> FetchItem {
    debug!(key = %record.external_key, %reason, "record filtered");
    FetchItem::Filtered {
        key: record.external_key.clone(),
        updated_at: Some(record.updated_at),
        reason,
    }
}

impl Iterator for Fetch<'_> {
    type Item = FetchItem;

    fn next(&mut self) -> Option<FetchItem> {
        loop {
            match &mut self.phase {
                Phase::Ids(ids) => match ids.next() {
                    Some(key) => return Some(self.lookup(key)),
                    None => self.phase = Phase::Done,
                },
                Phase::Listing(listing) => match listing.next() {
                    Some(Ok(record)) => return Some(self.classify(record)),
                    Some(Err(failure)) => {
                        warn!(key = ?failure.key, error = %failure.error, "listing item failed");
                        if let Some(key) = &failure.key {
                            self.seen.insert(key.clone());
                        }
                        return Some(FetchItem::Failed {
                            key: failure.key.filter(ExternalKey::is_valid),
                            updated_at: None,
                            error: failure.error,
                        });
                    }
                    None => self.start_refresh(),
                },
                Phase::Refresh(keys) => match keys.next() {
                    Some(key) => {
                        self.seen.insert(key.clone());
                        return Some(match self.lookup(key) {
                            FetchItem::Failed {
                                key: Some(key),
                                error: SyncError::NotFound { .. },
                                ..
                            } => FetchItem::Filtered {
                                key,
                                updated_at: None,
                                reason: FilterReason::GoneUpstream,
                            },
                            other => other,
                        });
                    }
                    None => self.phase = Phase::Done,
                },
                Phase::Done => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetryConfig;
    use crate::memory::MemoryUpstream;
    use chrono::{TimeZone, Utc};
    use std::time::Duration;

    fn at(hour: u32, minute: u32) -> Timestamp {
        Utc.with_ymd_and_hms(2024, 5, 1, hour, minute, 0).unwrap()
    }

    fn retrier() -> Retrier {
        Retrier::new(
            RetryConfig::new(3)
                .with_initial_delay(Duration::from_millis(1))
                .with_jitter(false),
        )
    }

    fn summarize(items: Vec<FetchItem>) -> Vec<String> {
        items
            .into_iter()
            .map(|item| match item {
                FetchItem::Record(r) => r.external_key.to_string(),
                FetchItem::Filtered { key, reason, .. } => format!("{key}~{reason}"),
                FetchItem::Failed { key, .. } => {
                    format!("{}!", key.map(|k| k.to_string()).unwrap_or_default())
                }
            })
            .collect()
    }

    fn tracked(keys: &[&str]) -> BTreeSet<ExternalKey> {
        keys.iter().map(|k| ExternalKey::new(*k)).collect()
    }

    #[test]
    fn owner_matching_ignores_punctuation_and_case() {
        let owners = vec!["Zhang San (zs)".to_string(), "li.si;".to_string()];
        assert!(owner_matches(&owners, &["zhangsan".into()]));
        assert!(owner_matches(&owners, &["LiSi".into()]));
        assert!(!owner_matches(&owners, &["wangwu".into()]));
        assert!(owner_matches(&owners, &[]));
        assert!(!owner_matches(&[], &["zhangsan".into()]));
    }

    #[test]
    fn listing_then_tracked_refresh() {
        let upstream = MemoryUpstream::new();
        upstream.put(Record::new("A", "a", at(10, 0)));
        upstream.put(Record::new("B", "b", at(10, 5)));
        upstream.put(Record::new("C", "c", at(10, 2)));
        let retrier = retrier();

        let plan = FetchPlan {
            since: Some(at(10, 5)),
            tracked: tracked(&["A", "B", "C"]),
            refresh_tracked: true,
            ..FetchPlan::default()
        };
        let mut fetch = ChangeFetcher::new(&upstream, &retrier).fetch(plan).unwrap();
        let mut items = Vec::new();
        for item in fetch.by_ref() {
            items.push(item);
        }
        assert!(fetch.is_exhausted());
        assert_eq!(summarize(items), vec!["B", "A", "C"]);
        assert_eq!(
            upstream.get_calls(),
            vec![ExternalKey::new("A"), ExternalKey::new("C")]
        );
    }

    #[test]
    fn refresh_can_be_disabled() {
        let upstream = MemoryUpstream::new();
        upstream.put(Record::new("A", "a", at(9, 0)));
        let retrier = retrier();

        let plan = FetchPlan {
            since: Some(at(10, 0)),
            tracked: tracked(&["A"]),
            refresh_tracked: false,
            ..FetchPlan::default()
        };
        let items: Vec<_> = ChangeFetcher::new(&upstream, &retrier)
            .fetch(plan)
            .unwrap()
            .collect();
        assert!(items.is_empty());
    }

    #[test]
    fn tracked_key_gone_upstream_is_filtered() {
        let upstream = MemoryUpstream::new();
        let retrier = retrier();
        let plan = FetchPlan {
            tracked: tracked(&["Z"]),
            refresh_tracked: true,
            ..FetchPlan::default()
        };
        let items: Vec<_> = ChangeFetcher::new(&upstream, &retrier)
            .fetch(plan)
            .unwrap()
            .collect();
        assert_eq!(summarize(items), vec!["Z~gone upstream"]);
    }

    #[test]
    fn explicit_ids_bypass_filters_and_dedupe() {
        let upstream = MemoryUpstream::new();
        upstream.put(Record::new("A", "a", at(8, 0)).with_owner("nobody"));
        upstream.put(Record::new("B", "b", at(8, 0)));
        let retrier = retrier();

        let filters = Filters::new().with_owners("alice").with_ids(vec![
            ExternalKey::new("B"),
            ExternalKey::new("A"),
            ExternalKey::new("B"),
            ExternalKey::new("missing"),
        ]);
        let plan = FetchPlan {
            since: Some(at(10, 0)),
            filters,
            tracked: tracked(&["Q"]),
            refresh_tracked: true,
        };
        let items: Vec<_> = ChangeFetcher::new(&upstream, &retrier)
            .fetch(plan)
            .unwrap()
            .collect();
        assert_eq!(summarize(items), vec!["B", "A", "missing!"]);
        assert_eq!(upstream.pages_served(), 0);
    }

    #[test]
    fn transient_lookup_failures_are_retried() {
        let upstream = MemoryUpstream::new();
        let key = ExternalKey::new("A");
        upstream.put(Record::new("A", "a", at(8, 0)));
        upstream.fail_get_transiently(&key, 2);
        let retrier = retrier();

        let plan = FetchPlan {
            filters: Filters::new().with_ids(vec![key]),
            ..FetchPlan::default()
        };
        let items: Vec<_> = ChangeFetcher::new(&upstream, &retrier)
            .fetch(plan)
            .unwrap()
            .collect();
        assert_eq!(summarize(items), vec!["A"]);
        assert_eq!(upstream.get_calls().len(), 3);
    }

    #[test]
    fn local_filters_and_duplicates() {
        let upstream = MemoryUpstream::new();
        upstream.put(Record::new("A", "a", at(10, 0)).with_owner("Alice Wong"));
        upstream.put(Record::new("B", "b", at(10, 1)).with_owner("Bob"));
        upstream.push_duplicate(Record::new("A", "a", at(10, 0)).with_owner("Alice Wong"));
        upstream.put(Record::new("None", "placeholder", at(10, 3)));
        let retrier = retrier();

        let plan = FetchPlan {
            filters: Filters::new().with_owners("alice"),
            ..FetchPlan::default()
        };
        let items: Vec<_> = ChangeFetcher::new(&upstream, &retrier)
            .fetch(plan)
            .unwrap()
            .collect();
        let observed: Vec<_> = items.iter().filter_map(FetchItem::observed_at).collect();
        assert_eq!(observed.len(), 4);
        assert_eq!(
            summarize(items),
            vec!["A", "B~owner mismatch", "A~duplicate", "!"]
        );
    }

    #[test]
    fn current_iteration_is_resolved_and_guarded() {
        let upstream = MemoryUpstream::new();
        upstream.set_current_iteration("it-7");
        upstream.put(Record::new("A", "a", at(10, 0)).with_iteration("it-7"));
        upstream.put(Record::new("B", "b", at(10, 0)).with_iteration("it-6"));
        let retrier = retrier();

        let plan = FetchPlan {
            filters: Filters::new().with_iteration(IterationFilter::Current),
            ..FetchPlan::default()
        };
        let items: Vec<_> = ChangeFetcher::new(&upstream, &retrier)
            .fetch(plan)
            .unwrap()
            .collect();
        // The memory upstream filters server-side, so B never arrives.
        assert_eq!(summarize(items), vec!["A"]);
    }

    #[test]
    fn listing_failures_are_reported_per_item() {
        let upstream = MemoryUpstream::new();
        upstream.put(Record::new("A", "a", at(10, 0)));
        upstream.fail_in_listing(Some(ExternalKey::new("X")), "bad payload");
        upstream.fail_in_listing(None, "truncated page");
        let retrier = retrier();

        let items: Vec<_> = ChangeFetcher::new(&upstream, &retrier)
            .fetch(FetchPlan::default())
            .unwrap()
            .collect();
        assert_eq!(summarize(items), vec!["A", "X!", "!"]);
    }

    #[test]
    fn fetch_is_lazy() {
        let upstream = MemoryUpstream::with_page_size(1);
        for i in 0..5 {
            upstream.put(Record::new(format!("K{i}"), "t", at(10, i)));
        }
        let retrier = retrier();
        let mut fetch = ChangeFetcher::new(&upstream, &retrier)
            .fetch(FetchPlan::default())
            .unwrap();
        fetch.next();
        fetch.next();
        assert_eq!(upstream.pages_served(), 2);
        assert!(!fetch.is_exhausted());
    }
}
