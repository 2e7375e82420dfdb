//! File-backed upstream and destination adapters.
//!
//! The upstream is a JSON snapshot exported from the tracker:
//!
//! ```json
//! { "current_iteration": "it-42", "records": [ { "external_key": "1001", ... } ] }
//! ```
//!
//! A bare array of records is accepted too. The destination is a JSON file
//! holding live and archived documents, rewritten atomically after every
//! change.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use storysync_core::{DestinationDocument, ExternalKey, Record};
use storysync_engine::{DestinationStore, MemoryUpstream, SyncError, SyncResult};
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

/// Errors raised while loading adapter files.
#[derive(Debug, Error)]
pub enum AdapterError {
    /// The file could not be read or written.
    #[error("{path}: {source}")]
    Io {
        /// File involved.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },

    /// The file is not valid JSON of the expected shape.
    #[error("{path}: {source}")]
    Json {
        /// File involved.
        path: PathBuf,
        /// Underlying error.
        source: serde_json::Error,
    },
}

#[derive(Deserialize)]
#[serde(untagged)]
enum SnapshotFile {
    Wrapped {
        #[serde(default)]
        current_iteration: Option<String>,
        records: Vec<Record>,
    },
    Bare(Vec<Record>),
}

/// Loads an upstream snapshot into an in-memory upstream.
pub fn load_snapshot(path: &Path) -> Result<MemoryUpstream, AdapterError> {
    let data = fs::read(path).map_err(|source| AdapterError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let snapshot: SnapshotFile =
        serde_json::from_slice(&data).map_err(|source| AdapterError::Json {
            path: path.to_path_buf(),
            source,
        })?;

    let upstream = MemoryUpstream::new();
    let (iteration, records) = match snapshot {
        SnapshotFile::Wrapped {
            current_iteration,
            records,
        } => (current_iteration, records),
        SnapshotFile::Bare(records) => (None, records),
    };
    if let Some(iteration) = iteration {
        upstream.set_current_iteration(iteration);
    }
    debug!(path = %path.display(), records = records.len(), "snapshot loaded");
    for record in records {
        upstream.put(record);
    }
    Ok(upstream)
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreFile {
    #[serde(default)]
    documents: Vec<DestinationDocument>,
    #[serde(default)]
    archived: Vec<DestinationDocument>,
}

/// Destination store persisted as one JSON file.
#[derive(Debug)]
pub struct JsonFileDestination {
    path: PathBuf,
    state: Mutex<StoreFile>,
}

impl JsonFileDestination {
    /// Opens the store, starting empty if the file does not exist.
    pub fn open(path: &Path) -> Result<Self, AdapterError> {
        let state = if path.exists() {
            let data = fs::read(path).map_err(|source| AdapterError::Io {
                path: path.to_path_buf(),
                source,
            })?;
            serde_json::from_slice(&data).map_err(|source| AdapterError::Json {
                path: path.to_path_buf(),
                source,
            })?
        } else {
            StoreFile::default()
        };
        Ok(Self {
            path: path.to_path_buf(),
            state: Mutex::new(state),
        })
    }

    /// Number of live documents.
    pub fn len(&self) -> usize {
        self.state.lock().documents.len()
    }

    /// Returns true if there are no live documents.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn persist(&self, state: &StoreFile) -> SyncResult<()> {
        let temp_path = self.path.with_extension("json.tmp");
        let data = serde_json::to_vec_pretty(state)
            .map_err(|e| SyncError::transport_fatal(format!("encode store: {e}")))?;
        let write = || -> std::io::Result<()> {
            let mut file = File::create(&temp_path)?;
            file.write_all(&data)?;
            file.sync_all()?;
            fs::rename(&temp_path, &self.path)
        };
        write().map_err(|e| {
            SyncError::transport_fatal(format!("write {}: {e}", self.path.display()))
        })
    }
}

impl DestinationStore for JsonFileDestination {
    fn find_by_external_key(&self, key: &ExternalKey) -> SyncResult<Vec<DestinationDocument>> {
        Ok(self
            .state
            .lock()
            .documents
            .iter()
            .filter(|d| &d.external_key == key)
            .cloned()
            .collect())
    }

    fn create(&self, doc: &DestinationDocument) -> SyncResult<String> {
        let mut state = self.state.lock();
        let id = Uuid::new_v4().to_string();
        let mut stored = doc.clone();
        stored.destination_id = Some(id.clone());
        state.documents.push(stored);
        if let Err(err) = self.persist(&state) {
            state.documents.pop();
            return Err(err);
        }
        Ok(id)
    }

    fn update(&self, destination_id: &str, doc: &DestinationDocument) -> SyncResult<()> {
        let mut state = self.state.lock();
        let index = state
            .documents
            .iter()
            .position(|d| d.destination_id.as_deref() == Some(destination_id))
            .ok_or_else(|| {
                SyncError::Structural(format!("no document with id {destination_id}"))
            })?;
        let mut stored = doc.clone();
        stored.destination_id = Some(destination_id.to_string());
        let previous = std::mem::replace(&mut state.documents[index], stored);
        if let Err(err) = self.persist(&state) {
            state.documents[index] = previous;
            return Err(err);
        }
        Ok(())
    }

    fn external_keys(&self) -> SyncResult<Vec<ExternalKey>> {
        let mut keys: Vec<ExternalKey> = self
            .state
            .lock()
            .documents
            .iter()
            .map(|d| d.external_key.clone())
            .collect();
        keys.sort();
        keys.dedup();
        Ok(keys)
    }

    fn archive_keys(&self, keys: &BTreeSet<ExternalKey>) -> SyncResult<usize> {
        let mut state = self.state.lock();
        let (archived, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut state.documents)
            .into_iter()
            .partition(|d| keys.contains(&d.external_key));
        let count = archived.len();
        state.documents = kept;
        state.archived.extend(archived);
        if let Err(err) = self.persist(&state) {
            let split = state.archived.len() - count;
            let restored = state.archived.split_off(split);
            state.documents.extend(restored);
            return Err(err);
        }
        Ok(count)
    }

    fn archive_all(&self) -> SyncResult<usize> {
        let mut state = self.state.lock();
        let count = state.documents.len();
        let drained: Vec<_> = state.documents.drain(..).collect();
        state.archived.extend(drained);
        self.persist(&state)?;
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use storysync_engine::UpstreamSource;
    use tempfile::tempdir;

    #[test]
    fn loads_wrapped_and_bare_snapshots() {
        let temp = tempdir().unwrap();
        let wrapped = temp.path().join("wrapped.json");
        fs::write(
            &wrapped,
            r#"{"current_iteration":"it-1","records":[
                {"external_key":"1","title":"a","updated_at":"2024-05-01T10:00:00Z"}]}"#,
        )
        .unwrap();
        let bare = temp.path().join("bare.json");
        fs::write(
            &bare,
            r#"[{"external_key":"2","updated_at":"2024-05-01T10:00:00Z"}]"#,
        )
        .unwrap();

        let upstream = load_snapshot(&wrapped).unwrap();
        assert_eq!(upstream.current_iteration().unwrap().as_deref(), Some("it-1"));
        assert!(upstream.get_by_id(&ExternalKey::new("1")).is_ok());
        let upstream = load_snapshot(&bare).unwrap();
        assert!(upstream.get_by_id(&ExternalKey::new("2")).is_ok());
    }

    #[test]
    fn rejects_malformed_snapshot() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("bad.json");
        fs::write(&path, "{").unwrap();
        assert!(matches!(load_snapshot(&path), Err(AdapterError::Json { .. })));
    }

    #[test]
    fn destination_survives_reopen() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("store.json");

        let store = JsonFileDestination::open(&path).unwrap();
        let id = store
            .create(&DestinationDocument::new(ExternalKey::new("A")))
            .unwrap();
        store
            .update(&id, &DestinationDocument::new(ExternalKey::new("A")))
            .unwrap();
        drop(store);

        let store = JsonFileDestination::open(&path).unwrap();
        assert_eq!(store.len(), 1);
        assert_eq!(
            store.external_keys().unwrap(),
            vec![ExternalKey::new("A")]
        );
        assert_eq!(store.archive_all().unwrap(), 1);
        assert!(store.is_empty());
    }

    #[test]
    fn scoped_archive_keeps_other_documents() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("store.json");
        let store = JsonFileDestination::open(&path).unwrap();
        store
            .create(&DestinationDocument::new(ExternalKey::new("A")))
            .unwrap();
        store
            .create(&DestinationDocument::new(ExternalKey::new("B")))
            .unwrap();

        let keys = BTreeSet::from([ExternalKey::new("A")]);
        assert_eq!(store.archive_keys(&keys).unwrap(), 1);
        drop(store);

        let store = JsonFileDestination::open(&path).unwrap();
        assert_eq!(store.external_keys().unwrap(), vec![ExternalKey::new("B")]);
    }

    #[test]
    fn update_of_unknown_id_is_structural() {
        let temp = tempdir().unwrap();
        let store = JsonFileDestination::open(&temp.path().join("store.json")).unwrap();
        let err = store
            .update("nope", &DestinationDocument::new(ExternalKey::new("A")))
            .unwrap_err();
        assert!(matches!(err, SyncError::Structural(_)));
    }
}
