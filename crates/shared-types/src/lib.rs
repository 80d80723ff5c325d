//! Shared data model for offline signing
//!
//! Session parameters, signing fields, queued submissions and sync items
//! exchanged between the signing UI, the offline queue and the sync endpoint.

pub mod types;

pub use types::{
    FieldType, NewSyncItem, QueuedSubmission, SessionParams, SignatureMap, SigningField, SyncItem,
};
