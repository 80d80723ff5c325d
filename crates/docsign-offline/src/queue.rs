//! Offline queue store
//!
//! Pending [`SyncItem`]s in arrival order, optionally bound to a
//! [`BlobStore`]. When bound, every mutation rewrites a single record holding
//! the whole queue, sealed as an encrypted envelope.
//!
//! The in-memory state is authoritative. If a write fails the mutation still
//! stands, the error is returned, and the next mutation (or [`QueueStore::flush`])
//! writes the full state again. `add` and `rekey` are the exceptions: a failed
//! write undoes them. A delivered item that reappears after a failed
//! write is replayed; the sync endpoint merges signatures by field id, so the
//! replay is harmless.

use std::sync::{Arc, Mutex};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use shared_crypto::{CipherError, DecryptionError, EncryptionKey, StoredRecord};
use shared_types::{NewSyncItem, SyncItem};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::storage::{BlobStore, StorageError};

/// Default record name for the queue snapshot
pub const DEFAULT_QUEUE_RECORD: &str = "offline_queue";

/// Queue shared between producers and the scheduler.
/// Never hold the lock across an `.await`.
pub type SharedQueue = Arc<Mutex<QueueStore>>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("Queue record {record} could not be decrypted: {source}")]
    Decryption {
        record: String,
        #[source]
        source: DecryptionError,
    },

    #[error("Queue record {record} is corrupt: {reason}")]
    Corrupt { record: String, reason: String },

    #[error(transparent)]
    Cipher(#[from] CipherError),

    #[error("Failed to encode queue snapshot: {0}")]
    Encode(#[from] serde_json::Error),
}

impl StoreError {
    /// Whether the persisted record itself is unusable (as opposed to the
    /// storage being unavailable)
    pub fn is_unreadable_record(&self) -> bool {
        matches!(self, StoreError::Decryption { .. } | StoreError::Corrupt { .. })
    }
}

/// An item whose payload could not be decoded, kept for inspection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuarantinedItem {
    pub item: SyncItem,
    pub reason: String,
    pub quarantined_at: i64,
}

/// A persisted record that could not be opened and was moved aside
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveredRecord {
    pub moved_to: String,
    pub reason: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueueSnapshot {
    items: Vec<SyncItem>,
    #[serde(default)]
    quarantined: Vec<QuarantinedItem>,
}

struct Persistence {
    blobs: Arc<dyn BlobStore>,
    record: String,
    key: EncryptionKey,
}

impl std::fmt::Debug for Persistence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Persistence")
            .field("record", &self.record)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Default)]
pub struct QueueStore {
    items: Vec<SyncItem>,
    quarantined: Vec<QuarantinedItem>,
    persistence: Option<Persistence>,
}

impl QueueStore {
    /// A queue that lives only in memory
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Open the queue stored under `record`, decrypting it with `key`.
    ///
    /// A missing record gives an empty queue. A legacy plaintext record is
    /// accepted as already decrypted and immediately re-sealed.
    pub fn open(
        blobs: Arc<dyn BlobStore>,
        record: &str,
        key: EncryptionKey,
    ) -> Result<Self, StoreError> {
        let snapshot = match blobs.load(record)? {
            None => {
                debug!(record, "No persisted queue, starting empty");
                None
            }
            Some(bytes) => Some(read_record(record, &bytes, &key)?),
        };

        let mut store = Self {
            items: Vec::new(),
            quarantined: Vec::new(),
            persistence: Some(Persistence {
                blobs,
                record: record.to_string(),
                key,
            }),
        };

        if let Some((snapshot, was_sealed)) = snapshot {
            store.items = snapshot.items;
            store.quarantined = snapshot.quarantined;
            if !was_sealed {
                info!(record, items = store.items.len(), "Migrating plaintext queue record");
                store.flush()?;
            }
        }

        info!(
            record,
            pending = store.items.len(),
            quarantined = store.quarantined.len(),
            "Opened offline queue"
        );
        Ok(store)
    }

    /// Like [`QueueStore::open`], but an unreadable record is moved aside and
    /// the queue starts empty instead of failing. Storage errors still fail.
    pub fn open_or_recover(
        blobs: Arc<dyn BlobStore>,
        record: &str,
        key: EncryptionKey,
    ) -> Result<(Self, Option<RecoveredRecord>), StoreError> {
        match Self::open(blobs.clone(), record, key.clone()) {
            Ok(store) => Ok((store, None)),
            Err(e) if e.is_unreadable_record() => {
                let moved_to = blobs.quarantine(record)?;
                error!(record, moved_to = %moved_to, error = %e, "Quarantined unreadable queue record");
                let store = Self::open(blobs, record, key)?;
                Ok((
                    store,
                    Some(RecoveredRecord {
                        moved_to,
                        reason: e.to_string(),
                    }),
                ))
            }
            Err(e) => Err(e),
        }
    }

    /// Append an item with a zero retry count.
    ///
    /// Ids are expected to be unique; a duplicate is logged and appended anyway.
    pub fn add(&mut self, item: NewSyncItem) -> Result<(), StoreError> {
        if self.get(&item.id).is_some() {
            warn!(id = %item.id, "Duplicate sync item id added to queue");
        }
        debug!(id = %item.id, session_id = %item.session_id, "Queued sync item");
        self.items.push(item.into());
        if let Err(e) = self.flush() {
            // A failed add leaves nothing queued, so retrying cannot duplicate it
            self.items.pop();
            return Err(e);
        }
        Ok(())
    }

    /// Remove the first item with `id`. Absent ids are a no-op.
    pub fn remove(&mut self, id: &str) -> Result<Option<SyncItem>, StoreError> {
        let Some(pos) = self.items.iter().position(|i| i.id == id) else {
            return Ok(None);
        };
        let removed = self.items.remove(pos);
        self.flush()?;
        Ok(Some(removed))
    }

    /// Bump the retry counter of `id`, returning the new count.
    /// Absent ids are a no-op.
    pub fn increment_retry(&mut self, id: &str) -> Result<Option<u32>, StoreError> {
        let Some(item) = self.items.iter_mut().find(|i| i.id == id) else {
            return Ok(None);
        };
        item.retry_count = item.retry_count.saturating_add(1);
        let count = item.retry_count;
        self.flush()?;
        Ok(Some(count))
    }

    /// Move an item to quarantine. Returns false if `id` is not pending.
    pub fn quarantine(&mut self, id: &str, reason: impl Into<String>) -> Result<bool, StoreError> {
        let Some(pos) = self.items.iter().position(|i| i.id == id) else {
            return Ok(false);
        };
        let item = self.items.remove(pos);
        let reason = reason.into();
        error!(id = %item.id, reason = %reason, "Quarantined undecodable sync item");
        self.quarantined.push(QuarantinedItem {
            item,
            reason,
            quarantined_at: Utc::now().timestamp_millis(),
        });
        self.flush()?;
        Ok(true)
    }

    /// Drop all quarantined items, returning how many were removed
    pub fn clear_quarantine(&mut self) -> Result<usize, StoreError> {
        let count = self.quarantined.len();
        self.quarantined.clear();
        if count > 0 {
            self.flush()?;
        }
        Ok(count)
    }

    /// Item with the smallest timestamp; the earliest-added wins ties
    pub fn oldest(&self) -> Option<&SyncItem> {
        self.items.iter().min_by_key(|i| i.timestamp)
    }

    pub fn get(&self, id: &str) -> Option<&SyncItem> {
        self.items.iter().find(|i| i.id == id)
    }

    /// Pending items in arrival order
    pub fn items(&self) -> &[SyncItem] {
        &self.items
    }

    /// Pending items sorted by timestamp, arrival order among equals
    pub fn oldest_first(&self) -> Vec<SyncItem> {
        let mut items = self.items.clone();
        items.sort_by_key(|i| i.timestamp);
        items
    }

    pub fn quarantined(&self) -> &[QuarantinedItem] {
        &self.quarantined
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn is_persistent(&self) -> bool {
        self.persistence.is_some()
    }

    /// Re-seal the queue under a new key. If the write fails the previous key
    /// stays in use.
    pub fn rekey(&mut self, key: EncryptionKey) -> Result<(), StoreError> {
        let Some(previous) = self.replace_key(key) else {
            return Ok(());
        };
        if let Err(e) = self.flush() {
            self.replace_key(previous);
            return Err(e);
        }
        Ok(())
    }

    /// Swap the sealing key without writing, returning the old one.
    /// `None` for in-memory queues.
    pub(crate) fn replace_key(&mut self, key: EncryptionKey) -> Option<EncryptionKey> {
        self.persistence
            .as_mut()
            .map(|p| std::mem::replace(&mut p.key, key))
    }

    /// Write the full queue to storage. No-op for in-memory queues.
    pub fn flush(&self) -> Result<(), StoreError> {
        let Some(p) = &self.persistence else {
            return Ok(());
        };
        let snapshot = QueueSnapshotRef {
            items: &self.items,
            quarantined: &self.quarantined,
        };
        let plaintext = serde_json::to_vec(&snapshot)?;
        let bytes = StoredRecord::seal(&plaintext, &p.key)?.to_bytes()?;
        p.blobs.save(&p.record, &bytes)?;
        Ok(())
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct QueueSnapshotRef<'a> {
    items: &'a [SyncItem],
    quarantined: &'a [QuarantinedItem],
}

/// Decode a stored record. Returns the snapshot and whether it was sealed.
fn read_record(
    record: &str,
    bytes: &[u8],
    key: &EncryptionKey,
) -> Result<(QueueSnapshot, bool), StoreError> {
    let stored = StoredRecord::classify(bytes);
    let was_sealed = stored.is_encrypted();
    let plaintext = stored.open(key).map_err(|source| StoreError::Decryption {
        record: record.to_string(),
        source,
    })?;
    let snapshot = parse_snapshot(&plaintext).map_err(|reason| StoreError::Corrupt {
        record: record.to_string(),
        reason,
    })?;
    Ok((snapshot, was_sealed))
}

/// Accepts the current snapshot shape, a bare array of sync items, or the
/// legacy array of queued submissions written before sync items existed.
fn parse_snapshot(plaintext: &[u8]) -> Result<QueueSnapshot, String> {
    if plaintext.iter().all(u8::is_ascii_whitespace) {
        return Ok(QueueSnapshot::default());
    }
    let value: Value = serde_json::from_slice(plaintext).map_err(|e| e.to_string())?;
    match value {
        Value::Object(_) => serde_json::from_value(value).map_err(|e| e.to_string()),
        Value::Array(entries) => {
            let as_items: Result<Vec<SyncItem>, _> =
                serde_json::from_value(Value::Array(entries.clone()));
            match as_items {
                Ok(items) => Ok(QueueSnapshot {
                    items,
                    quarantined: Vec::new(),
                }),
                Err(_) => Ok(QueueSnapshot {
                    items: entries.into_iter().map(legacy_submission_item).collect(),
                    quarantined: Vec::new(),
                }),
            }
        }
        _ => Err("expected a queue object or array".to_string()),
    }
}

/// Wrap a legacy queued submission as a sync item. The payload is carried
/// verbatim; the codec validates it at delivery time.
fn legacy_submission_item(entry: Value) -> SyncItem {
    let session_id = entry
        .get("sessionId")
        .or_else(|| entry.get("session_id"))
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let timestamp = entry
        .get("timestamp")
        .and_then(Value::as_f64)
        .filter(|ms| ms.is_finite())
        .map(|ms| ms as i64)
        .unwrap_or_default();

    SyncItem {
        id: uuid::Uuid::new_v4().to_string(),
        session_id,
        field_id: None,
        signature_data: entry.to_string(),
        timestamp,
        retry_count: 0,
    }
}
