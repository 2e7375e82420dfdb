//! Failed command implementation.

use super::OutputFormat;
use std::path::Path;
use storysync_core::read_cursor_dir;

/// Runs the failed command.
pub fn run(path: &Path, format: OutputFormat) -> Result<(), Box<dyn std::error::Error>> {
    let cursor = read_cursor_dir(path)?;

    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&cursor.failed_keys)?);
        }
        OutputFormat::Text => {
            if cursor.failed_keys.is_empty() {
                println!("No failed keys");
                return Ok(());
            }
            println!("{} failed key(s):", cursor.failed_keys.len());
            for (key, reason) in &cursor.failed_keys {
                println!("  {key}: {reason}");
            }
            println!();
            println!("Retry with: storysync sync --retry-failed --execute --ack ...");
        }
    }
    Ok(())
}
