// ring-node/src/storage.rs
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use anyhow::Result;
use tracing::debug;

use crate::id::{key_for_filename, Identifier};

struct Inner {
    dir: PathBuf,
    files: BTreeMap<String, Identifier>,
}

/// Files this peer currently owns, one flat directory per peer.
///
/// Each file remembers the ring key it was stored under so migration can
/// re-route it without recomputing anything. All operations share one lock,
/// so no two of them ever touch the same file at once.
pub struct FileStore {
    inner: Mutex<Inner>,
}

impl FileStore {
    /// Open (creating if needed) a store rooted at `dir`, picking up files a
    /// previous run left behind.
    pub fn new(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        let files = scan(&dir)?;
        Ok(Self {
            inner: Mutex::new(Inner { dir, files }),
        })
    }

    fn inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn dir(&self) -> PathBuf {
        self.inner().dir.clone()
    }

    /// Move an empty store to a new directory.
    pub fn relocate(&self, dir: impl AsRef<Path>) -> Result<()> {
        let mut inner = self.inner();
        if !inner.files.is_empty() {
            anyhow::bail!("Cannot relocate a store holding {} files", inner.files.len());
        }
        let dir = dir.as_ref().to_path_buf();
        inner.files = scan(&dir)?;
        inner.dir = dir;
        Ok(())
    }

    /// Write `content` unless a file of that name is already stored.
    /// Returns whether it was written.
    pub fn write(&self, filename: &str, key: Identifier, content: &[u8]) -> Result<bool> {
        check_name(filename)?;
        let mut inner = self.inner();
        let path = inner.dir.join(filename);
        if inner.files.contains_key(filename) || path.exists() {
            return Ok(false);
        }
        fs::write(&path, content)?;
        inner.files.insert(filename.to_string(), key);
        debug!("Stored {} ({} bytes) under {}", filename, content.len(), key);
        Ok(true)
    }

    pub fn read(&self, filename: &str) -> Result<Option<Vec<u8>>> {
        check_name(filename)?;
        let inner = self.inner();
        if !inner.files.contains_key(filename) {
            return Ok(None);
        }
        Ok(Some(fs::read(inner.dir.join(filename))?))
    }

    /// Remove a stored file. Returns whether anything was removed.
    pub fn delete(&self, filename: &str) -> Result<bool> {
        check_name(filename)?;
        let mut inner = self.inner();
        if inner.files.remove(filename).is_none() {
            return Ok(false);
        }
        let path = inner.dir.join(filename);
        if path.exists() {
            fs::remove_file(path)?;
        }
        Ok(true)
    }

    pub fn contains(&self, filename: &str) -> bool {
        self.inner().files.contains_key(filename)
    }

    pub fn key_of(&self, filename: &str) -> Option<Identifier> {
        self.inner().files.get(filename).copied()
    }

    /// Stored files with their keys, ordered by name.
    pub fn list(&self) -> Vec<(String, Identifier)> {
        self.inner()
            .files
            .iter()
            .map(|(name, key)| (name.clone(), *key))
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.inner().files.is_empty()
    }

    /// Bytes on disk under the store's directory.
    pub fn usage(&self) -> Result<u64> {
        let dir = self.dir();
        if !dir.exists() {
            return Ok(0);
        }
        let mut total = 0u64;
        for entry in walkdir::WalkDir::new(&dir) {
            let entry = entry?;
            if entry.file_type().is_file() {
                total += entry.metadata()?.len();
            }
        }
        Ok(total)
    }
}

fn check_name(filename: &str) -> Result<()> {
    let plain = Path::new(filename).file_name().and_then(|name| name.to_str());
    if filename.is_empty() || plain != Some(filename) {
        anyhow::bail!("Invalid stored filename: {:?}", filename);
    }
    Ok(())
}

fn scan(dir: &Path) -> Result<BTreeMap<String, Identifier>> {
    fs::create_dir_all(dir)?;
    let mut files = BTreeMap::new();
    for entry in walkdir::WalkDir::new(dir).min_depth(1).max_depth(1) {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        if let Some(name) = entry.file_name().to_str() {
            files.insert(name.to_string(), key_for_filename(name));
        }
    }
    Ok(files)
}
