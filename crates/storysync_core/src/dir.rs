//! Cursor directory management.
//!
//! This module handles the file system layout of the sync cursor:
//!
//! ```text
//! <cursor_dir>/
//! ├─ LOCK              # Advisory lock, one run at a time
//! └─ cursor.json       # Watermark, tracked keys, failed keys
//! ```
//!
//! The LOCK file ensures only one run can mutate the cursor at a time.
//! `cursor.json` is replaced atomically, so a crash leaves either the old
//! or the new file on disk, never a half-written one.

use crate::cursor::Cursor;
use crate::error::{CoreError, CoreResult};
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

const CURSOR_FILE: &str = "cursor.json";
const LOCK_FILE: &str = "LOCK";
/// Temporary file for atomic cursor writes.
const CURSOR_TEMP: &str = "cursor.json.tmp";

/// Exclusive handle on a cursor directory.
///
/// Holding a `CursorDir` means holding the directory lock; it is released
/// when the value is dropped.
///
/// # Example
///
/// ```rust,ignore
/// use storysync_core::CursorDir;
/// use std::path::Path;
///
/// let dir = CursorDir::open(Path::new("data/sync"), true)?;
/// let mut cursor = dir.load()?;
/// cursor.advance_watermark(now);
/// dir.save(&cursor)?;
/// ```
#[derive(Debug)]
pub struct CursorDir {
    path: PathBuf,
    _lock_file: File,
}

impl CursorDir {
    /// Opens or creates a cursor directory and takes its lock.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The directory doesn't exist and `create_if_missing` is false
    /// - Another run holds the lock (returns `CursorLocked`)
    /// - I/O errors occur
    pub fn open(path: &Path, create_if_missing: bool) -> CoreResult<Self> {
        if !path.exists() {
            if create_if_missing {
                fs::create_dir_all(path)?;
            } else {
                return Err(CoreError::invalid_format(format!(
                    "cursor directory does not exist: {}",
                    path.display()
                )));
            }
        }

        if !path.is_dir() {
            return Err(CoreError::invalid_format(format!(
                "path is not a directory: {}",
                path.display()
            )));
        }

        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path.join(LOCK_FILE))?;

        if lock_file.try_lock_exclusive().is_err() {
            return Err(CoreError::CursorLocked {
                path: path.display().to_string(),
            });
        }

        tracing::debug!(path = %path.display(), "cursor lock acquired");

        Ok(Self {
            path: path.to_path_buf(),
            _lock_file: lock_file,
        })
    }

    /// Returns the path to the cursor directory.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the path to the cursor file.
    #[must_use]
    pub fn cursor_path(&self) -> PathBuf {
        self.path.join(CURSOR_FILE)
    }

    /// Loads the cursor, returning an empty one if none was saved yet.
    pub fn load(&self) -> CoreResult<Cursor> {
        read_cursor(&self.cursor_path())
    }

    /// Saves the cursor atomically.
    ///
    /// 1. Write to a temporary file
    /// 2. Sync the temporary file to disk
    /// 3. Rename it over `cursor.json`
    /// 4. Fsync the directory so the rename is durable
    pub fn save(&self, cursor: &Cursor) -> CoreResult<()> {
        let temp_path = self.path.join(CURSOR_TEMP);

        let data = serde_json::to_vec_pretty(cursor)?;
        let mut file = File::create(&temp_path)?;
        file.write_all(&data)?;
        file.sync_all()?;
        drop(file);

        fs::rename(&temp_path, self.cursor_path())?;
        self.sync_directory()?;

        tracing::debug!(
            path = %self.cursor_path().display(),
            tracked = cursor.tracked_keys.len(),
            failed = cursor.failed_keys.len(),
            "cursor saved"
        );
        Ok(())
    }

    #[cfg(unix)]
    fn sync_directory(&self) -> CoreResult<()> {
        let dir = File::open(&self.path)?;
        dir.sync_all()?;
        Ok(())
    }

    #[cfg(not(unix))]
    fn sync_directory(&self) -> CoreResult<()> {
        // NTFS journals metadata; there is no directory fsync.
        Ok(())
    }
}

/// Reads a cursor directory without taking the lock.
///
/// Safe for read-only inspection because writers only ever rename a
/// complete file into place.
pub fn read_cursor_dir(path: &Path) -> CoreResult<Cursor> {
    read_cursor(&path.join(CURSOR_FILE))
}

fn read_cursor(cursor_path: &Path) -> CoreResult<Cursor> {
    if !cursor_path.exists() {
        return Ok(Cursor::new());
    }

    let mut data = Vec::new();
    File::open(cursor_path)?.read_to_end(&mut data)?;
    if data.is_empty() {
        return Ok(Cursor::new());
    }

    let mut cursor: Cursor = serde_json::from_slice(&data).map_err(|e| {
        CoreError::invalid_format(format!("{}: {e}", cursor_path.display()))
    })?;
    cursor.normalize();
    Ok(cursor)
}
