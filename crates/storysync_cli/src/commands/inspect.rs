//! Inspect command implementation.

use super::OutputFormat;
use serde::Serialize;
use std::path::Path;
use storysync_core::{read_cursor_dir, Cursor};

/// Cursor inspection result.
#[derive(Debug, Serialize)]
pub struct InspectResult {
    /// Cursor directory.
    pub path: String,
    /// Whether a cursor file exists.
    pub initialized: bool,
    /// Watermark, RFC 3339.
    pub last_sync_at: Option<String>,
    /// Number of tracked keys.
    pub tracked: usize,
    /// Number of failed keys.
    pub failed: usize,
}

impl InspectResult {
    fn new(path: &Path, cursor: &Cursor) -> Self {
        Self {
            path: path.display().to_string(),
            initialized: path.join("cursor.json").exists(),
            last_sync_at: cursor.last_sync_at.map(|t| t.to_rfc3339()),
            tracked: cursor.tracked_keys.len(),
            failed: cursor.failed_keys.len(),
        }
    }
}

/// Runs the inspect command.
pub fn run(path: &Path, format: OutputFormat) -> Result<(), Box<dyn std::error::Error>> {
    let cursor = read_cursor_dir(path)?;
    let result = InspectResult::new(path, &cursor);

    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        OutputFormat::Text => {
            println!("Cursor at {}", result.path);
            if !result.initialized {
                println!("  (no sync has committed yet)");
            }
            println!(
                "  Watermark:    {}",
                result.last_sync_at.as_deref().unwrap_or("none")
            );
            println!("  Tracked keys: {}", result.tracked);
            println!("  Failed keys:  {}", result.failed);
        }
    }
    Ok(())
}
