//! Offline signature sync
//!
//! Keeps a signing client working without a network connection. Completed
//! submissions are validated, encoded, sealed with AES-GCM and persisted in a
//! local queue; the scheduler drains that queue against the signing API once
//! connectivity returns, with per-item exponential backoff and a retry ceiling.
//!
//! ```text
//! SigningSession ─► codec ─► QueueStore (sealed record) ─► SyncScheduler ─► DeliveryTransport
//! ```

pub mod codec;
pub mod config;
pub mod history;
pub mod queue;
pub mod retry;
pub mod scheduler;
pub mod session;
pub mod storage;
pub mod store;
pub mod transport;
pub mod validator;

pub use codec::{deserialize_queued_submission, serialize_queued_submission, CodecError};
pub use config::{ConfigError, SyncConfig};
pub use history::{CanvasHistory, HistoryBuffer};
pub use queue::{QuarantinedItem, QueueStore, RecoveredRecord, SharedQueue, StoreError};
pub use retry::{calculate_backoff, should_retry, RetryPolicy};
pub use scheduler::{
    ConnectivityHandle, FailureKind, PermanentFailure, SchedulerSettings, SyncReport,
    SyncScheduler, SyncState, SyncStatus,
};
pub use session::{SessionError, SigningSession};
pub use storage::{BlobStore, FileBlobStore, MemoryBlobStore, StorageError};
pub use store::OfflineStore;
pub use transport::{DeliveryReceipt, DeliveryTransport, HttpTransport, TransportError};
pub use validator::{
    are_all_required_fields_complete, check_session_not_expired, filter_fields_by_recipient,
    is_session_expired, validate_session_params, SessionTimestamp, SessionValidation, ValidationError,
};
