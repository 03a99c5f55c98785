//! Content fingerprints for files and task actions.
//!
//! Files are hashed with BLAKE3. Declared directories are expanded into one
//! entry per contained file so that a change anywhere below them counts.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::core::task::{Action, Task};
use crate::{Error, Result};

/// Strong content signature of a single file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fingerprint {
    /// Hex-encoded BLAKE3 digest.
    pub hash: String,
    /// Size in bytes.
    pub size: u64,
}

impl Fingerprint {
    pub fn short(&self) -> &str {
        &self.hash[..self.hash.len().min(12)]
    }
}

/// Observed state of a set of paths. `None` marks a declared path that does
/// not exist.
pub type FileSnapshot = BTreeMap<PathBuf, Option<Fingerprint>>;

/// Hash one file.
pub fn fingerprint_file(path: &Path) -> io::Result<Fingerprint> {
    let mut hasher = blake3::Hasher::new();
    hasher.update_mmap(path)?;
    Ok(Fingerprint {
        hash: hasher.finalize().to_hex().to_string(),
        size: hasher.count(),
    })
}

/// Fingerprint every declared path, relative to `root`.
///
/// Keys in the result stay relative so the snapshot survives moving the
/// project directory.
///
/// # Errors
/// Returns `Error::Fingerprint` when a path exists but cannot be read.
pub fn snapshot<P: AsRef<Path>>(root: &Path, paths: &[P]) -> Result<FileSnapshot> {
    let mut snap = FileSnapshot::new();
    let mut visited = HashSet::new();
    for declared in paths {
        record(root, declared.as_ref(), &mut snap, &mut visited)?;
    }
    Ok(snap)
}

/// Fingerprint of a symlink by the path it points to, not by its contents.
fn link_fingerprint(target: &Path) -> Fingerprint {
    let text = target.to_string_lossy();
    Fingerprint {
        hash: blake3::hash(text.as_bytes()).to_hex().to_string(),
        size: 0,
    }
}

/// Walk one declared path. `visited` holds the canonical form of every
/// directory already expanded, so symlinks pointing back up the tree are
/// recorded by their target instead of being followed again.
fn record(
    root: &Path,
    relative: &Path,
    snap: &mut FileSnapshot,
    visited: &mut HashSet<PathBuf>,
) -> Result<()> {
    let full = root.join(relative);
    let unreadable = |source: io::Error| Error::Fingerprint {
        path: relative.to_path_buf(),
        source,
    };

    let meta = match fs::metadata(&full) {
        Ok(meta) => meta,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            snap.insert(relative.to_path_buf(), None);
            return Ok(());
        }
        Err(e) => return Err(unreadable(e)),
    };

    if meta.is_dir() {
        let canonical = fs::canonicalize(&full).map_err(unreadable)?;
        if !visited.insert(canonical) {
            let link = fs::symlink_metadata(&full).map_err(unreadable)?;
            if link.file_type().is_symlink() {
                let target = fs::read_link(&full).map_err(unreadable)?;
                snap.insert(relative.to_path_buf(), Some(link_fingerprint(&target)));
            }
            // A plain directory seen twice was declared twice; already recorded
            return Ok(());
        }
        let mut children = BTreeSet::new();
        for entry in fs::read_dir(&full).map_err(unreadable)? {
            children.insert(entry.map_err(unreadable)?.file_name());
        }
        for child in children {
            record(root, &relative.join(child), snap, visited)?;
        }
    } else {
        let fp = fingerprint_file(&full).map_err(unreadable)?;
        snap.insert(relative.to_path_buf(), Some(fp));
    }
    Ok(())
}

#[derive(Serialize)]
struct ActionIdentity<'a> {
    action: &'a Action,
    cwd: &'a Path,
    env: &'a BTreeMap<String, String>,
}

/// Signature over everything that determines what a task's action does.
pub fn action_signature(task: &Task) -> Result<String> {
    let identity = ActionIdentity {
        action: &task.action,
        cwd: &task.cwd,
        env: &task.env,
    };
    let canonical = to_canonical_json(&serde_json::to_value(&identity)?);
    Ok(blake3::hash(canonical.as_bytes()).to_hex().to_string())
}

/// Serialize a JSON value with sorted object keys and no whitespace.
pub fn to_canonical_json(value: &Value) -> String {
    match value {
        Value::Array(items) => {
            let items: Vec<String> = items.iter().map(to_canonical_json).collect();
            format!("[{}]", items.join(","))
        }
        Value::Object(map) => {
            let sorted: BTreeMap<&String, String> = map
                .iter()
                .map(|(k, v)| (k, to_canonical_json(v)))
                .collect();
            let items: Vec<String> = sorted
                .into_iter()
                .map(|(k, v)| format!("{}:{}", Value::String(k.clone()), v))
                .collect();
            format!("{{{}}}", items.join(","))
        }
        scalar => scalar.to_string(),
    }
}
