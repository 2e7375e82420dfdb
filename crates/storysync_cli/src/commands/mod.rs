//! CLI command implementations.

use clap::ValueEnum;

pub mod failed;
pub mod inspect;
pub mod reset;
pub mod sync;

/// Output format shared by the reporting commands.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable text
    #[default]
    Text,
    /// Pretty-printed JSON
    Json,
}
