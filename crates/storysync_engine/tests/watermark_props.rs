//! Property tests for watermark and reconciliation invariants.

use proptest::prelude::*;
use std::collections::BTreeSet;
use storysync_core::{Cursor, ExternalKey};
use storysync_engine::{Invocation, RunStatus, SyncConfig};
use storysync_testkit::prelude::*;

fn harness_with(records: &[Record], watermark: Option<Timestamp>) -> Harness {
    let h = Harness::new().with_config(
        SyncConfig::new()
            .with_concurrency(3)
            .with_retry(fast_retry()),
    );
    for record in records {
        h.upstream.put(record.clone());
    }
    if let Some(at) = watermark {
        let mut cursor = Cursor::new();
        cursor.advance_watermark(at);
        h.cursor_dir.write(&cursor);
    }
    h
}

fn destination_keys(h: &Harness) -> BTreeSet<ExternalKey> {
    h.destination
        .documents()
        .into_iter()
        .map(|d| d.external_key)
        .collect()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn watermark_never_moves_backward(
        batch in record_batch_strategy(12),
        start in proptest::option::of(timestamp_strategy()),
    ) {
        let h = harness_with(&batch, start);
        let summary = h.run(Invocation::Incremental);
        prop_assert_eq!(summary.status, RunStatus::Success);

        let newest = batch.iter().map(|r| r.updated_at).max();
        let expected = start.max(newest);
        prop_assert_eq!(h.cursor().last_sync_at, expected);
        prop_assert!(h.cursor().last_sync_at >= start);
    }

    #[test]
    fn rerun_without_changes_creates_nothing(batch in record_batch_strategy(12)) {
        let h = harness_with(&batch, None);
        let first = h.run(Invocation::Incremental);
        prop_assert_eq!(first.created, batch.len());

        let second = h.run(Invocation::Incremental);
        prop_assert_eq!(second.created, 0);
        prop_assert_eq!(h.destination.len(), batch.len());
    }

    #[test]
    fn fetch_order_does_not_change_the_result(batch in record_batch_strategy(12)) {
        let forward = harness_with(&batch, None);
        let mut reversed_batch = batch.clone();
        reversed_batch.reverse();
        let reversed = harness_with(&reversed_batch, None);

        forward.run(Invocation::FullRebuild);
        reversed.run(Invocation::FullRebuild);

        prop_assert_eq!(destination_keys(&forward), destination_keys(&reversed));
        prop_assert_eq!(forward.cursor(), reversed.cursor());
    }
}
