//! # StorySync Core
//!
//! Record model and persisted sync cursor for StorySync.
//!
//! This crate provides:
//! - Upstream [`Record`]s with typed custom fields
//! - [`DestinationDocument`]s and the merge-preserve write policy
//! - The [`Cursor`] (watermark, tracked keys, failed keys)
//! - [`CursorDir`], an exclusively locked, atomically written cursor store
//!
//! ## Key Invariants
//!
//! - At most one destination document per external key
//! - The watermark never moves backward
//! - The cursor file is replaced atomically; readers never see a partial write
//! - Only one run holds the cursor lock at a time

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod cursor;
mod dir;
mod document;
mod error;
mod record;
mod types;

pub use cursor::Cursor;
pub use dir::{read_cursor_dir, CursorDir};
pub use document::{
    merge_preserve, DestinationDocument, FieldOwner, FieldOwnership, PROP_EXTERNAL_KEY,
    PROP_LAST_SYNCED_AT, PROP_SYNC_VERSION,
};
pub use error::{CoreError, CoreResult};
pub use record::{BlockKind, BlockOrigin, ContentBlock, Record};
pub use types::{CustomFields, ExternalKey, FieldValue, Timestamp};
