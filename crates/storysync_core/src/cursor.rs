//! The persisted sync cursor.

use crate::types::{ExternalKey, Timestamp};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Process-wide sync state that survives restarts.
///
/// The cursor is loaded at run start, mutated in memory by the batch runner
/// and written back atomically when the batch completes. It is never shared
/// between concurrent runs; see [`CursorDir`](crate::CursorDir).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cursor {
    /// Watermark: the newest upstream change already incorporated.
    #[serde(default)]
    pub last_sync_at: Option<Timestamp>,
    /// Keys known to be materialized in the destination.
    #[serde(default)]
    pub tracked_keys: BTreeSet<ExternalKey>,
    /// Keys whose last attempt failed, with the failure reason.
    #[serde(default)]
    pub failed_keys: BTreeMap<ExternalKey, String>,
}

impl Cursor {
    /// Creates an empty cursor.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Moves the watermark forward. Never moves it backward.
    ///
    /// Returns true if the watermark changed.
    pub fn advance_watermark(&mut self, candidate: Timestamp) -> bool {
        match self.last_sync_at {
            Some(current) if current >= candidate => false,
            _ => {
                self.last_sync_at = Some(candidate);
                true
            }
        }
    }

    /// Records a successful write for a key.
    pub fn mark_synced(&mut self, key: &ExternalKey) {
        self.failed_keys.remove(key);
        self.tracked_keys.insert(key.clone());
    }

    /// Records a failure for a key, replacing any older reason.
    pub fn mark_failed(&mut self, key: &ExternalKey, reason: impl Into<String>) {
        self.failed_keys.insert(key.clone(), reason.into());
    }

    /// Adds keys to the tracked set.
    pub fn track<I>(&mut self, keys: I)
    where
        I: IntoIterator<Item = ExternalKey>,
    {
        self.tracked_keys.extend(keys);
    }

    /// Drops empty and placeholder keys, which older files may contain.
    pub fn normalize(&mut self) {
        self.tracked_keys = std::mem::take(&mut self.tracked_keys)
            .into_iter()
            .map(|k| ExternalKey::new(k.as_str()))
            .filter(ExternalKey::is_valid)
            .collect();
        self.failed_keys = std::mem::take(&mut self.failed_keys)
            .into_iter()
            .map(|(k, reason)| (ExternalKey::new(k.as_str()), reason))
            .filter(|(k, _)| k.is_valid())
            .collect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn at(hour: u32, minute: u32) -> Timestamp {
        Utc.with_ymd_and_hms(2024, 5, 1, hour, minute, 0).unwrap()
    }

    #[test]
    fn watermark_is_monotonic() {
        let mut cursor = Cursor::new();
        assert!(cursor.advance_watermark(at(9, 0)));
        assert!(cursor.advance_watermark(at(10, 5)));
        assert!(!cursor.advance_watermark(at(10, 2)));
        assert!(!cursor.advance_watermark(at(10, 5)));
        assert_eq!(cursor.last_sync_at, Some(at(10, 5)));
    }

    #[test]
    fn synced_clears_failure() {
        let mut cursor = Cursor::new();
        let key = ExternalKey::new("A");
        cursor.mark_failed(&key, "rate limited");
        assert!(cursor.failed_keys.contains_key(&key));

        cursor.mark_synced(&key);
        assert!(!cursor.failed_keys.contains_key(&key));
        assert!(cursor.tracked_keys.contains(&key));
    }

    #[test]
    fn normalize_drops_placeholders() {
        let json = r#"{
            "last_sync_at": null,
            "tracked_keys": [" 12 ", "", "None"],
            "failed_keys": {"unknown": "x", "7": "boom"}
        }"#;
        let mut cursor: Cursor = serde_json::from_str(json).unwrap();
        cursor.normalize();

        assert_eq!(
            cursor.tracked_keys.iter().map(ExternalKey::as_str).collect::<Vec<_>>(),
            vec!["12"]
        );
        assert_eq!(cursor.failed_keys.len(), 1);
    }

    #[test]
    fn missing_fields_default() {
        let cursor: Cursor = serde_json::from_str("{}").unwrap();
        assert_eq!(cursor, Cursor::new());
    }

    mod props {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn watermark_is_running_max(offsets in prop::collection::vec(0i64..86_400, 0..20)) {
                let base = at(0, 0);
                let mut cursor = Cursor::new();
                for offset in &offsets {
                    cursor.advance_watermark(base + chrono::Duration::seconds(*offset));
                }
                let expected = offsets
                    .iter()
                    .max()
                    .map(|o| base + chrono::Duration::seconds(*o));
                prop_assert_eq!(cursor.last_sync_at, expected);
            }
        }
    }
}
