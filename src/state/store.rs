//! Persistent record of each task's last successful execution.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::state::fingerprint::FileSnapshot;
use crate::Result;

pub const STORE_VERSION: u32 = 1;

/// What the engine knew right after a task last succeeded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreEntry {
    /// Signature of the action that ran.
    pub action: String,
    /// Input fingerprints taken before the action ran.
    #[serde(default)]
    pub inputs: FileSnapshot,
    /// Output fingerprints taken after the action finished.
    #[serde(default)]
    pub outputs: FileSnapshot,
    pub completed_at: DateTime<Utc>,
    #[serde(default)]
    pub exit_status: i32,
}

#[derive(Serialize)]
struct StoreFileOut<'a> {
    version: u32,
    entries: &'a BTreeMap<String, StoreEntry>,
}

#[derive(Deserialize)]
struct StoreFileIn {
    version: u32,
    #[serde(default)]
    entries: BTreeMap<String, Value>,
}

/// Fingerprint store backed by a single JSON file.
///
/// Only the scheduler's control loop writes to it, so there is no locking.
/// Every commit rewrites the whole file through a temporary file and a
/// rename, so readers never observe a half-written store.
#[derive(Debug, Clone)]
pub struct FingerprintStore {
    path: PathBuf,
    entries: BTreeMap<String, StoreEntry>,
}

impl FingerprintStore {
    /// Create an empty store that will persist to `path`.
    pub fn empty(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            entries: BTreeMap::new(),
        }
    }

    /// Load the store, falling back to an empty one.
    ///
    /// A missing, unreadable or corrupt file, or one written by an unknown
    /// schema version, only costs a full rebuild. Individual entries that no
    /// longer parse are dropped.
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        debug!("FingerprintStore::load path={}", path.display());

        let contents = match fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!("Fingerprint store not found, starting fresh");
                return Self::empty(path);
            }
            Err(e) => {
                warn!(
                    "Cannot read fingerprint store {}: {}, starting fresh",
                    path.display(),
                    e
                );
                return Self::empty(path);
            }
        };

        let file: StoreFileIn = match serde_json::from_str(&contents) {
            Ok(file) => file,
            Err(e) => {
                warn!(
                    "Fingerprint store {} is corrupt ({}), starting fresh",
                    path.display(),
                    e
                );
                return Self::empty(path);
            }
        };

        if file.version != STORE_VERSION {
            warn!(
                "Fingerprint store {} has unsupported version {}, starting fresh",
                path.display(),
                file.version
            );
            return Self::empty(path);
        }

        let mut entries = BTreeMap::new();
        for (name, raw) in file.entries {
            match serde_json::from_value::<StoreEntry>(raw) {
                Ok(entry) => {
                    entries.insert(name, entry);
                }
                Err(e) => warn!("Dropping unreadable store entry for '{}': {}", name, e),
            }
        }

        info!("Loaded fingerprint store with {} entries", entries.len());
        Self { path, entries }
    }

    /// Entry recorded for a task's last success.
    pub fn get(&self, task: &str) -> Option<&StoreEntry> {
        self.entries.get(task)
    }

    /// Replace a task's entry and persist the whole store.
    ///
    /// If the write fails the previous entry is restored, so a later
    /// successful commit cannot persist a success that was never recorded.
    pub fn commit(&mut self, task: &str, entry: StoreEntry) -> Result<()> {
        debug!("FingerprintStore::commit task={}", task);
        let previous = self.entries.insert(task.to_string(), entry);
        if let Err(e) = self.save() {
            match previous {
                Some(old) => self.entries.insert(task.to_string(), old),
                None => self.entries.remove(task),
            };
            return Err(e);
        }
        Ok(())
    }

    /// Write the store atomically: temp file, fsync, rename.
    pub fn save(&self) -> Result<()> {
        let contents = serde_json::to_string(&StoreFileOut {
            version: STORE_VERSION,
            entries: &self.entries,
        })?;

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                debug!("Creating store directory: {}", parent.display());
                fs::create_dir_all(parent)?;
            }
        }

        let temp_path = self.path.with_extension("json.tmp");
        {
            let mut file = fs::File::create(&temp_path)?;
            file.write_all(contents.as_bytes())?;
            file.sync_all()?;
        }
        fs::rename(&temp_path, &self.path)?;
        debug!("Fingerprint store saved: {}", self.path.display());
        Ok(())
    }

    /// Delete the store file, forcing the next run to rebuild everything.
    ///
    /// Returns whether a file was removed.
    pub fn remove_file(path: &Path) -> Result<bool> {
        match fs::remove_file(path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn task_names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(|k| k.as_str())
    }
}
