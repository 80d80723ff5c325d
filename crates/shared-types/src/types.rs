use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Signature values keyed by field id.
///
/// Values are heterogeneous: a drawn signature is usually a data URL string,
/// a typed one may be a structured object with text and font.
pub type SignatureMap = Map<String, Value>;

/// Session parameters as they arrive from the signing link
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionParams {
    pub session_id: Option<String>,
    pub recipient_id: Option<String>,
    pub signing_key: Option<String>,
}

impl SessionParams {
    pub fn new(
        session_id: impl Into<String>,
        recipient_id: impl Into<String>,
        signing_key: impl Into<String>,
    ) -> Self {
        Self {
            session_id: Some(session_id.into()),
            recipient_id: Some(recipient_id.into()),
            signing_key: Some(signing_key.into()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    Signature,
    Initials,
    Date,
    Text,
}

/// A field placed on the document for a specific recipient
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SigningField {
    pub id: String,
    #[serde(rename = "type")]
    pub field_type: FieldType,
    pub page: u32,
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
    pub required: bool,
    pub recipient_id: String,
}

/// A completed signing result waiting for network sync.
///
/// This is also the exact wire shape posted to the delivery endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedSubmission {
    pub session_id: String,
    pub recipient_id: String,
    pub signing_key: String,
    pub signatures: SignatureMap,
    /// ISO-8601 completion time
    pub completed_at: String,
    /// Epoch milliseconds at queue time
    pub timestamp: i64,
}

/// A unit of work owned by the offline queue
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncItem {
    pub id: String,
    pub session_id: String,
    /// Set when the item carries a single field's signature
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field_id: Option<String>,
    /// Serialized `QueuedSubmission` to deliver
    pub signature_data: String,
    pub timestamp: i64,
    pub retry_count: u32,
}

/// A sync item before it enters the queue (no retry counter yet)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewSyncItem {
    pub id: String,
    pub session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field_id: Option<String>,
    pub signature_data: String,
    pub timestamp: i64,
}

impl From<NewSyncItem> for SyncItem {
    fn from(item: NewSyncItem) -> Self {
        Self {
            id: item.id,
            session_id: item.session_id,
            field_id: item.field_id,
            signature_data: item.signature_data,
            timestamp: item.timestamp,
            retry_count: 0,
        }
    }
}
