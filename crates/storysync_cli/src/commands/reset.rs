//! Reset command implementation.
//!
//! Discarding sync state is destructive: the next run re-lists from the
//! beginning and may touch every document again.

use clap::Args;
use std::path::Path;
use storysync_core::{Cursor, CursorDir, ExternalKey};
use storysync_engine::{split_csv, Filters, OperationClass, SafetyGate, Scope};
use tracing::warn;

/// Arguments of `storysync reset`.
#[derive(Debug, Args)]
pub struct ResetArgs {
    /// Comma-separated keys to forget; without it the whole cursor is reset
    #[arg(long)]
    pub keys: Option<String>,

    /// Only forget failure records, keep tracked keys and the watermark
    #[arg(long)]
    pub failed_only: bool,

    /// Acknowledgment phrase for destructive operations
    #[arg(long)]
    pub ack: Option<String>,

    /// Allow resetting every key
    #[arg(long)]
    pub allow_unscoped: bool,
}

/// What a reset removed.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct ResetStats {
    /// Tracked keys forgotten.
    pub tracked_removed: usize,
    /// Failed keys forgotten.
    pub failed_removed: usize,
    /// Whether the watermark was cleared.
    pub watermark_cleared: bool,
}

/// Applies a reset to a cursor.
pub fn apply(cursor: &mut Cursor, keys: &[ExternalKey], failed_only: bool) -> ResetStats {
    let mut stats = ResetStats::default();
    if keys.is_empty() {
        stats.failed_removed = cursor.failed_keys.len();
        cursor.failed_keys.clear();
        if !failed_only {
            stats.tracked_removed = cursor.tracked_keys.len();
            stats.watermark_cleared = cursor.last_sync_at.is_some();
            *cursor = Cursor::new();
        }
        return stats;
    }

    for key in keys {
        if cursor.failed_keys.remove(key).is_some() {
            stats.failed_removed += 1;
        }
        if !failed_only && cursor.tracked_keys.remove(key) {
            stats.tracked_removed += 1;
        }
    }
    stats
}

/// Runs the reset command.
pub fn run(path: &Path, args: &ResetArgs) -> Result<(), Box<dyn std::error::Error>> {
    let keys: Vec<ExternalKey> = args
        .keys
        .as_deref()
        .map(split_csv)
        .unwrap_or_default()
        .into_iter()
        .map(ExternalKey::new)
        .collect();
    let scope = Scope::from_filters(&Filters::new().with_ids(keys.iter().cloned()));

    SafetyGate::new()
        .allow_unscoped(args.allow_unscoped)
        .check(OperationClass::Destructive, &scope, args.ack.as_deref())
        .into_result()?;

    let dir = CursorDir::open(path, false)?;
    let mut cursor = dir.load()?;
    let stats = apply(&mut cursor, &keys, args.failed_only);
    dir.save(&cursor)?;

    warn!(
        tracked = stats.tracked_removed,
        failed = stats.failed_removed,
        watermark_cleared = stats.watermark_cleared,
        "cursor reset"
    );
    println!("Reset {scope}:");
    println!("  Tracked keys removed: {}", stats.tracked_removed);
    println!("  Failed keys removed:  {}", stats.failed_removed);
    println!("  Watermark cleared:    {}", stats.watermark_cleared);
    Ok(())
}
