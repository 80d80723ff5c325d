//! Local record storage
//!
//! A [`BlobStore`] keeps named byte records: one for the queue snapshot, one
//! for the key seed. [`FileBlobStore`] writes each record to its own file via
//! a temp file and rename, so a crash mid-write leaves the previous record
//! intact. [`MemoryBlobStore`] backs tests and ephemeral sessions.

use std::collections::HashMap;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use shared_crypto::SecretSeed;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Invalid record name: {0}")]
    InvalidName(String),

    #[error("Storage I/O error on {name}: {source}")]
    Io {
        name: String,
        #[source]
        source: io::Error,
    },
}

pub trait BlobStore: Send + Sync {
    /// Read a record; `Ok(None)` if it does not exist
    fn load(&self, name: &str) -> Result<Option<Vec<u8>>, StorageError>;

    /// Replace a record
    fn save(&self, name: &str, bytes: &[u8]) -> Result<(), StorageError>;

    /// Delete a record; missing records are not an error
    fn remove(&self, name: &str) -> Result<(), StorageError>;

    /// Move a record aside so it is kept for inspection but no longer read.
    /// Returns the new name.
    fn quarantine(&self, name: &str) -> Result<String, StorageError> {
        let target = format!("{}.corrupt-{}", name, Utc::now().format("%Y%m%dT%H%M%S%3f"));
        if let Some(bytes) = self.load(name)? {
            self.save(&target, &bytes)?;
        }
        self.remove(name)?;
        Ok(target)
    }
}

fn check_name(name: &str) -> Result<(), StorageError> {
    let ok = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
        && !name.starts_with('.');
    if ok {
        Ok(())
    } else {
        Err(StorageError::InvalidName(name.to_string()))
    }
}

/// One file per record under a directory
#[derive(Debug, Clone)]
pub struct FileBlobStore {
    dir: PathBuf,
}

impl FileBlobStore {
    /// Open (and create if needed) a storage directory
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|source| StorageError::Io {
            name: dir.display().to_string(),
            source,
        })?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path(&self, name: &str) -> Result<PathBuf, StorageError> {
        check_name(name)?;
        Ok(self.dir.join(name))
    }
}

impl BlobStore for FileBlobStore {
    fn load(&self, name: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let path = self.path(name)?;
        match fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(StorageError::Io {
                name: name.to_string(),
                source,
            }),
        }
    }

    fn save(&self, name: &str, bytes: &[u8]) -> Result<(), StorageError> {
        let path = self.path(name)?;
        let tmp = self.dir.join(format!(".{}.tmp", name));
        let io_err = |source| StorageError::Io {
            name: name.to_string(),
            source,
        };

        let mut file = fs::File::create(&tmp).map_err(io_err)?;
        file.write_all(bytes).map_err(io_err)?;
        file.sync_all().map_err(io_err)?;
        drop(file);
        fs::rename(&tmp, &path).map_err(io_err)
    }

    fn remove(&self, name: &str) -> Result<(), StorageError> {
        let path = self.path(name)?;
        match fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(StorageError::Io {
                name: name.to_string(),
                source,
            }),
        }
    }

    fn quarantine(&self, name: &str) -> Result<String, StorageError> {
        let from = self.path(name)?;
        let target = format!("{}.corrupt-{}", name, Utc::now().format("%Y%m%dT%H%M%S%3f"));
        let to = self.path(&target)?;
        match fs::rename(from, to) {
            Ok(()) => Ok(target),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(target),
            Err(source) => Err(StorageError::Io {
                name: name.to_string(),
                source,
            }),
        }
    }
}

/// In-process store; clones share the same records
#[derive(Debug, Clone, Default)]
pub struct MemoryBlobStore {
    records: Arc<Mutex<HashMap<String, Vec<u8>>>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Names of all records, sorted
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.lock().keys().cloned().collect();
        names.sort();
        names
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Vec<u8>>> {
        // A panic while holding the lock cannot leave a half-written record
        self.records.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl BlobStore for MemoryBlobStore {
    fn load(&self, name: &str) -> Result<Option<Vec<u8>>, StorageError> {
        check_name(name)?;
        Ok(self.lock().get(name).cloned())
    }

    fn save(&self, name: &str, bytes: &[u8]) -> Result<(), StorageError> {
        check_name(name)?;
        self.lock().insert(name.to_string(), bytes.to_vec());
        Ok(())
    }

    fn remove(&self, name: &str) -> Result<(), StorageError> {
        check_name(name)?;
        self.lock().remove(name);
        Ok(())
    }
}

/// Memory store whose saves to selected records fail until allowed again
#[cfg(test)]
#[derive(Debug, Default)]
pub(crate) struct FlakyBlobStore {
    inner: MemoryBlobStore,
    failing: Mutex<std::collections::HashSet<String>>,
}

#[cfg(test)]
impl FlakyBlobStore {
    pub(crate) fn fail_saves(&self, name: &str) {
        self.failing.lock().unwrap().insert(name.to_string());
    }

    pub(crate) fn allow_saves(&self, name: &str) {
        self.failing.lock().unwrap().remove(name);
    }
}

#[cfg(test)]
impl BlobStore for FlakyBlobStore {
    fn load(&self, name: &str) -> Result<Option<Vec<u8>>, StorageError> {
        self.inner.load(name)
    }

    fn save(&self, name: &str, bytes: &[u8]) -> Result<(), StorageError> {
        if self.failing.lock().unwrap().contains(name) {
            return Err(StorageError::Io {
                name: name.to_string(),
                source: io::Error::other("disk full"),
            });
        }
        self.inner.save(name, bytes)
    }

    fn remove(&self, name: &str) -> Result<(), StorageError> {
        self.inner.remove(name)
    }
}

/// Load the key seed stored under `name`, generating and saving a new one if
/// the record is missing or not a valid seed.
pub fn load_or_create_seed(store: &dyn BlobStore, name: &str) -> Result<SecretSeed, StorageError> {
    match store.load(name)? {
        Some(bytes) => {
            let parsed = std::str::from_utf8(&bytes).ok().and_then(SecretSeed::parse);
            if let Some(seed) = parsed {
                return Ok(seed);
            }
            warn!(record = name, "Stored key seed is invalid, generating a new one");
        }
        None => info!(record = name, "No key seed found, generating a new one"),
    }
    create_seed(store, name)
}

/// Generate a fresh seed and persist it, replacing any existing one
pub fn create_seed(store: &dyn BlobStore, name: &str) -> Result<SecretSeed, StorageError> {
    let seed = SecretSeed::generate();
    store.save(name, seed.to_hex().as_bytes())?;
    info!(record = name, fingerprint = %seed.fingerprint(), "Stored new key seed");
    Ok(seed)
}
