//! On-disk state for one client: the key seed and the encrypted queue

use std::sync::{Arc, Mutex};

use shared_crypto::SecretSeed;
use tracing::{error, info};

use crate::config::SyncConfig;
use crate::queue::{QueueStore, RecoveredRecord, SharedQueue, StoreError};
use crate::storage::{load_or_create_seed, BlobStore, FileBlobStore};

pub struct OfflineStore {
    blobs: Arc<dyn BlobStore>,
    key_record: String,
    seed: SecretSeed,
    queue: SharedQueue,
    recovered: Option<RecoveredRecord>,
}

impl OfflineStore {
    /// Open the data directory named by `config`, creating the key seed if
    /// needed. An unreadable queue record is moved aside and reported through
    /// [`OfflineStore::recovered`].
    pub fn open(config: &SyncConfig) -> Result<Self, StoreError> {
        let blobs: Arc<dyn BlobStore> = Arc::new(FileBlobStore::open(&config.data_dir)?);
        Self::open_with(blobs, &config.queue_record, &config.key_record)
    }

    pub fn open_with(
        blobs: Arc<dyn BlobStore>,
        queue_record: &str,
        key_record: &str,
    ) -> Result<Self, StoreError> {
        let seed = load_or_create_seed(blobs.as_ref(), key_record)?;
        let (queue, recovered) = QueueStore::open_or_recover(blobs.clone(), queue_record, seed.key())?;
        Ok(Self {
            blobs,
            key_record: key_record.to_string(),
            seed,
            queue: Arc::new(Mutex::new(queue)),
            recovered,
        })
    }

    pub fn queue(&self) -> SharedQueue {
        self.queue.clone()
    }

    pub fn recovered(&self) -> Option<&RecoveredRecord> {
        self.recovered.as_ref()
    }

    pub fn key_fingerprint(&self) -> String {
        self.seed.fingerprint()
    }

    /// Generate a new seed and re-seal the queue under it.
    ///
    /// The queue is re-sealed before the seed is replaced, and the queue's key
    /// always matches the stored seed on return. If the re-seal fails nothing
    /// changes. If saving the new seed fails the queue goes back to the old
    /// key; should that write fail too, the next queue mutation rewrites it.
    pub fn rotate_key(&mut self) -> Result<String, StoreError> {
        let next = SecretSeed::generate();
        let mut queue = self.queue.lock().unwrap_or_else(|e| e.into_inner());
        queue.rekey(next.key())?;

        if let Err(e) = self.blobs.save(&self.key_record, next.to_hex().as_bytes()) {
            error!(error = %e, "Failed to store rotated key seed, restoring previous key");
            queue.replace_key(self.seed.key());
            if let Err(flush_err) = queue.flush() {
                error!(error = %flush_err, "Failed to re-seal queue under previous key");
            }
            return Err(e.into());
        }
        drop(queue);

        info!(
            from = %self.seed.fingerprint(),
            to = %next.fingerprint(),
            "Rotated queue encryption key"
        );
        self.seed = next;
        Ok(self.seed.fingerprint())
    }
}
