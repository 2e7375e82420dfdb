//! # StorySync Testkit
//!
//! Test utilities for StorySync.
//!
//! This crate provides:
//! - Temporary cursor directories and timestamp helpers
//! - A harness wiring fake upstream, fake destination and runner together
//! - Interruption helpers for cancellation and crash tests
//! - Property-based test generators using proptest
//!
//! ## Usage
//!
//! ```rust,ignore
//! use storysync_testkit::prelude::*;
//!
//! #[test]
//! fn creates_then_updates() {
//!     let h = Harness::new();
//!     h.upstream.put(story("A", "first", ts(10, 0)));
//!     assert_eq!(h.run(Invocation::Incremental).created, 1);
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod fixtures;
pub mod generators;
pub mod interrupt;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use crate::interrupt::*;
    pub use storysync_core::{Cursor, ExternalKey, Record, Timestamp};
    pub use storysync_engine::{
        Filters, Invocation, MemoryDestination, MemoryUpstream, OutcomeKind, RunRequest,
        RunStatus, RunSummary, SyncConfig,
    };
}

pub use fixtures::*;
pub use generators::*;
pub use interrupt::*;
