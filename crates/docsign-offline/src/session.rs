//! Signing session tracking
//!
//! A [`SigningSession`] is built only from parameters that pass validation.
//! It sees the fields assigned to its recipient, collects a signature value per
//! field, and turns a finished session into a [`QueuedSubmission`] for the
//! offline queue.

use std::collections::HashSet;

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::Value;
use shared_types::{NewSyncItem, QueuedSubmission, SessionParams, SignatureMap, SigningField};
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

use crate::codec::{serialize_queued_submission, CodecError};
use crate::queue::{QueueStore, StoreError};
use crate::validator::{
    are_all_required_fields_complete, check_session_not_expired, check_session_params,
    filter_fields_by_recipient, SessionTimestamp, ValidationError,
};

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Invalid field list: {0}")]
    Fields(#[from] serde_json::Error),
}

#[derive(Debug, Clone)]
pub struct SigningSession {
    session_id: String,
    recipient_id: String,
    signing_key: String,
    fields: Vec<SigningField>,
    signatures: SignatureMap,
    completed_fields: HashSet<String>,
    created_at: Option<SessionTimestamp>,
}

impl SigningSession {
    /// Create a session from link parameters. Values are trimmed.
    pub fn new(params: &SessionParams) -> Result<Self, ValidationError> {
        check_session_params(params)?;
        let trimmed = |v: &Option<String>| v.as_deref().unwrap_or_default().trim().to_string();
        Ok(Self {
            session_id: trimmed(&params.session_id),
            recipient_id: trimmed(&params.recipient_id),
            signing_key: trimmed(&params.signing_key),
            fields: Vec::new(),
            signatures: SignatureMap::new(),
            completed_fields: HashSet::new(),
            created_at: None,
        })
    }

    pub fn with_created_at(mut self, created_at: impl Into<SessionTimestamp>) -> Self {
        self.created_at = Some(created_at.into());
        self
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn recipient_id(&self) -> &str {
        &self.recipient_id
    }

    /// Expired when a TTL is given and the creation time is older than it.
    /// Without a TTL or a known creation time the session never expires.
    pub fn is_expired(&self, ttl_ms: Option<i64>) -> bool {
        check_session_not_expired(self.created_at.clone(), ttl_ms).is_err()
    }

    /// Load fields from a JSON array, replacing any loaded before
    pub fn load_fields(&mut self, fields_json: &str) -> Result<(), SessionError> {
        let fields: Vec<SigningField> = serde_json::from_str(fields_json)?;
        self.set_fields(fields);
        Ok(())
    }

    pub fn set_fields(&mut self, fields: Vec<SigningField>) {
        self.fields = fields;
        let visible: HashSet<&str> = self
            .visible_fields()
            .into_iter()
            .map(|f| f.id.as_str())
            .collect();
        let stale: Vec<String> = self
            .completed_fields
            .iter()
            .filter(|id| !visible.contains(id.as_str()))
            .cloned()
            .collect();
        for id in stale {
            self.clear_signature(&id);
        }
    }

    /// Fields assigned to this recipient
    pub fn visible_fields(&self) -> Vec<&SigningField> {
        filter_fields_by_recipient(&self.fields, &self.recipient_id)
    }

    pub fn field_count(&self) -> usize {
        self.visible_fields().len()
    }

    pub fn required_field_count(&self) -> usize {
        self.visible_fields().iter().filter(|f| f.required).count()
    }

    pub fn completed_field_count(&self) -> usize {
        self.completed_fields.len()
    }

    /// Record a signature value for one of this recipient's fields
    pub fn record_signature(&mut self, field_id: &str, value: Value) -> Result<(), ValidationError> {
        if !self.visible_fields().iter().any(|f| f.id == field_id) {
            return Err(ValidationError::FieldNotAssigned(field_id.to_string()));
        }
        self.signatures.insert(field_id.to_string(), value);
        self.completed_fields.insert(field_id.to_string());
        Ok(())
    }

    pub fn clear_signature(&mut self, field_id: &str) {
        self.signatures.remove(field_id);
        self.completed_fields.remove(field_id);
    }

    pub fn is_field_completed(&self, field_id: &str) -> bool {
        self.completed_fields.contains(field_id)
    }

    pub fn can_finish(&self) -> bool {
        are_all_required_fields_complete(self.visible_fields(), &self.completed_fields)
    }

    pub fn signatures(&self) -> &SignatureMap {
        &self.signatures
    }

    /// Build the submission for a session completed at `completed_at`
    pub fn to_submission(&self, completed_at: DateTime<Utc>) -> Result<QueuedSubmission, ValidationError> {
        if !self.can_finish() {
            return Err(ValidationError::IncompleteFields);
        }
        Ok(QueuedSubmission {
            session_id: self.session_id.clone(),
            recipient_id: self.recipient_id.clone(),
            signing_key: self.signing_key.clone(),
            signatures: self.signatures.clone(),
            completed_at: completed_at.to_rfc3339_opts(SecondsFormat::Millis, true),
            timestamp: completed_at.timestamp_millis(),
        })
    }

    /// Finish now and append the submission to the offline queue.
    /// Returns the new item's id. A session past `ttl_ms` is not queued.
    pub fn queue_for_offline(
        &self,
        queue: &mut QueueStore,
        ttl_ms: Option<i64>,
    ) -> Result<String, SessionError> {
        check_session_not_expired(self.created_at.clone(), ttl_ms)?;
        let submission = self.to_submission(Utc::now())?;
        let item = NewSyncItem {
            id: Uuid::new_v4().to_string(),
            session_id: submission.session_id.clone(),
            field_id: None,
            signature_data: serialize_queued_submission(&submission)?,
            timestamp: submission.timestamp,
        };
        let id = item.id.clone();
        queue.add(item)?;
        info!(id = %id, session_id = %self.session_id, "Queued submission for offline sync");
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::deserialize_queued_submission;
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use shared_types::FieldType;

    const FIELDS: &str = r#"[
        {"id":"sig-1","type":"signature","page":1,"x":100,"y":600,"width":200,"height":50,"required":true,"recipientId":"r1"},
        {"id":"date-1","type":"date","page":1,"x":320,"y":600,"width":100,"height":20,"required":false,"recipientId":"r1"},
        {"id":"sig-2","type":"signature","page":2,"x":100,"y":600,"width":200,"height":50,"required":true,"recipientId":"r2"}
    ]"#;

    fn session() -> SigningSession {
        let mut session = SigningSession::new(&SessionParams::new(" sess-123 ", "r1", "key-abc")).unwrap();
        session.load_fields(FIELDS).unwrap();
        session
    }

    #[test]
    fn test_invalid_params_are_rejected() {
        let err = SigningSession::new(&SessionParams::new("ab", "r1", "validkey")).unwrap_err();
        assert!(err.to_string().contains("session"));
    }

    #[test]
    fn test_sees_only_own_fields() {
        let session = session();
        assert_eq!(session.session_id(), "sess-123");
        assert_eq!(session.field_count(), 2);
        assert_eq!(session.required_field_count(), 1);
        assert_eq!(session.visible_fields()[1].field_type, FieldType::Date);
    }

    #[test]
    fn test_cannot_sign_other_recipients_field() {
        let mut session = session();
        assert_eq!(
            session.record_signature("sig-2", json!("data:image/png;base64,AAAA")),
            Err(ValidationError::FieldNotAssigned("sig-2".into()))
        );
        assert_eq!(session.completed_field_count(), 0);
    }

    #[test]
    fn test_finish_requires_required_fields() {
        let mut session = session();
        let at = Utc.with_ymd_and_hms(2025, 1, 1, 12, 0, 0).unwrap();
        assert!(!session.can_finish());
        assert_eq!(session.to_submission(at), Err(ValidationError::IncompleteFields));

        session.record_signature("sig-1", json!("data:image/png;base64,AAAA")).unwrap();
        assert!(session.can_finish());

        let sub = session.to_submission(at).unwrap();
        assert_eq!(sub.completed_at, "2025-01-01T12:00:00.000Z");
        assert_eq!(sub.timestamp, 1_735_732_800_000);
        assert_eq!(sub.signatures.len(), 1);
    }

    #[test]
    fn test_reloading_fields_drops_stale_signatures() {
        let mut session = session();
        session.record_signature("date-1", json!("2025-01-01")).unwrap();
        session
            .load_fields(r#"[{"id":"sig-1","type":"signature","page":1,"x":0,"y":0,"width":1,"height":1,"required":true,"recipientId":"r1"}]"#)
            .unwrap();
        assert!(!session.is_field_completed("date-1"));
        assert!(session.signatures().is_empty());
    }

    #[test]
    fn test_queue_for_offline_enqueues_decodable_item() {
        let mut session = session();
        session.record_signature("sig-1", json!({"text": "JD", "font": "cursive"})).unwrap();

        let mut queue = QueueStore::in_memory();
        let id = session.queue_for_offline(&mut queue, None).unwrap();

        let item = queue.get(&id).unwrap();
        assert_eq!(item.retry_count, 0);
        assert_eq!(item.session_id, "sess-123");
        let decoded = deserialize_queued_submission(&item.signature_data).unwrap();
        assert_eq!(decoded.signatures["sig-1"], json!({"text": "JD", "font": "cursive"}));
    }

    #[test]
    fn test_expired_session_is_not_queued() {
        let mut session = session().with_created_at(0i64);
        session.record_signature("sig-1", json!("data:image/png;base64,AAAA")).unwrap();
        let mut queue = QueueStore::in_memory();

        let err = session.queue_for_offline(&mut queue, Some(60_000)).unwrap_err();
        assert!(matches!(err, SessionError::Validation(ValidationError::SessionExpired)));
        assert!(queue.is_empty());

        session.queue_for_offline(&mut queue, None).unwrap();
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_failed_queue_write_returns_error_without_item() {
        use crate::storage::FlakyBlobStore;
        use shared_crypto::SecretSeed;
        use std::sync::Arc;

        let mut session = session();
        session.record_signature("sig-1", json!("data:image/png;base64,AAAA")).unwrap();
        let blobs = Arc::new(FlakyBlobStore::default());
        let mut queue =
            QueueStore::open(blobs.clone(), "offline_queue", SecretSeed::generate().key()).unwrap();

        blobs.fail_saves("offline_queue");
        assert!(matches!(
            session.queue_for_offline(&mut queue, None),
            Err(SessionError::Store(_))
        ));
        assert!(queue.is_empty());

        blobs.allow_saves("offline_queue");
        session.queue_for_offline(&mut queue, None).unwrap();
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_expiry_needs_ttl_and_creation_time() {
        let session = session();
        assert!(!session.is_expired(Some(1)));

        let old = session.clone().with_created_at(0i64);
        assert!(old.is_expired(Some(1_000)));
        assert!(!old.is_expired(None));

        let garbage = session.with_created_at("not a date");
        assert!(garbage.is_expired(Some(i64::MAX)));
    }
}
