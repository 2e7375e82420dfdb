//! Property-based test generators using proptest.
//!
//! Provides strategies for generating upstream records and batches with
//! unique keys.

use crate::fixtures::ts;
use proptest::prelude::*;
use std::collections::BTreeMap;
use storysync_core::{ExternalKey, Record, Timestamp};

/// Strategy for generating valid external keys.
pub fn key_strategy() -> impl Strategy<Value = ExternalKey> {
    prop::string::string_regex("[A-Z]{2}-[0-9]{1,4}")
        .expect("Invalid regex")
        .prop_map(ExternalKey::new)
}

/// Strategy for timestamps between 08:00 and 17:59 on the fixture day.
pub fn timestamp_strategy() -> impl Strategy<Value = Timestamp> {
    (8u32..18, 0u32..60).prop_map(|(h, m)| ts(h, m))
}

/// Strategy for a single record.
pub fn record_strategy() -> impl Strategy<Value = Record> {
    (
        key_strategy(),
        "[a-z ]{0,24}",
        timestamp_strategy(),
        prop::collection::vec("[A-Za-z ]{1,12}", 0..3),
    )
        .prop_map(|(key, title, updated_at, owners)| {
            let mut record = Record::new(key, title, updated_at)
                .with_description("目标: faster checkout\n验收: p95 under 200ms");
            record.owners = owners;
            record
        })
}

/// Strategy for a batch of records with distinct keys.
pub fn record_batch_strategy(max: usize) -> impl Strategy<Value = Vec<Record>> {
    prop::collection::vec(record_strategy(), 0..max).prop_map(|records| {
        let unique: BTreeMap<ExternalKey, Record> = records
            .into_iter()
            .map(|r| (r.external_key.clone(), r))
            .collect();
        unique.into_values().collect()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    proptest! {
        #[test]
        fn generated_keys_are_valid(key in key_strategy()) {
            prop_assert!(key.is_valid());
        }

        #[test]
        fn batches_have_unique_keys(batch in record_batch_strategy(20)) {
            let keys: HashSet<_> = batch.iter().map(|r| r.external_key.clone()).collect();
            prop_assert_eq!(keys.len(), batch.len());
        }
    }
}
