//! Durable text encoding for queued submissions
//!
//! The encoding is plain JSON in the wire shape of [`QueuedSubmission`].
//! Decoding validates fields one by one in a fixed order so a corrupt record
//! always produces the same message.

use serde_json::Value;
use shared_types::QueuedSubmission;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    /// Text is not syntactically valid JSON
    #[error("Invalid queued submission format: {0}")]
    Format(String),

    /// First missing or ill-typed field, in validation order
    #[error("Invalid {0}")]
    Field(&'static str),
}

/// Encode a submission for storage
pub fn serialize_queued_submission(sub: &QueuedSubmission) -> Result<String, CodecError> {
    serde_json::to_string(sub).map_err(|e| CodecError::Format(e.to_string()))
}

/// Decode and validate a stored submission.
///
/// Checks run in order: sessionId, recipientId, signingKey, signatures,
/// completedAt, timestamp. The first failure is reported.
pub fn deserialize_queued_submission(text: &str) -> Result<QueuedSubmission, CodecError> {
    let value: Value = serde_json::from_str(text).map_err(|e| CodecError::Format(e.to_string()))?;
    let Value::Object(mut obj) = value else {
        return Err(CodecError::Format("expected a JSON object".to_string()));
    };

    let session_id = take_string(&mut obj, "sessionId")?;
    let recipient_id = take_string(&mut obj, "recipientId")?;
    let signing_key = take_string(&mut obj, "signingKey")?;

    let signatures = match obj.remove("signatures") {
        Some(Value::Object(map)) => map,
        _ => return Err(CodecError::Field("signatures")),
    };

    let completed_at = take_string(&mut obj, "completedAt")?;

    let timestamp = obj
        .get("timestamp")
        .and_then(timestamp_millis)
        .ok_or(CodecError::Field("timestamp"))?;

    Ok(QueuedSubmission {
        session_id,
        recipient_id,
        signing_key,
        signatures,
        completed_at,
        timestamp,
    })
}

fn take_string(
    obj: &mut serde_json::Map<String, Value>,
    field: &'static str,
) -> Result<String, CodecError> {
    match obj.remove(field) {
        Some(Value::String(s)) => Ok(s),
        _ => Err(CodecError::Field(field)),
    }
}

/// Integral epoch milliseconds. Fractional values (a `performance.now()`-style
/// clock) are truncated; non-finite or out-of-range values are rejected.
fn timestamp_millis(value: &Value) -> Option<i64> {
    if let Some(ms) = value.as_i64() {
        return Some(ms);
    }
    let ms = value.as_f64()?;
    (ms.is_finite() && ms.abs() < i64::MAX as f64).then_some(ms.trunc() as i64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;
    use serde_json::json;
    use shared_types::SignatureMap;

    fn submission() -> QueuedSubmission {
        let mut signatures = SignatureMap::new();
        signatures.insert("sig-1".into(), json!("data:image/png;base64,iVBORw0KGgo="));
        signatures.insert(
            "init-1".into(),
            json!({"text": "JD", "font": "Dancing Script", "strokes": [[1, 2], [3.5, 4]]}),
        );
        QueuedSubmission {
            session_id: "sess-123".into(),
            recipient_id: "r1".into(),
            signing_key: "key-abc".into(),
            signatures,
            completed_at: "2025-01-01T12:00:00.000Z".into(),
            timestamp: 1_735_732_800_000,
        }
    }

    fn without(field: &str) -> String {
        let mut value = serde_json::to_value(submission()).unwrap();
        value.as_object_mut().unwrap().remove(field);
        value.to_string()
    }

    #[test]
    fn test_roundtrip_preserves_nested_signatures() {
        let sub = submission();
        let text = serialize_queued_submission(&sub).unwrap();
        assert_eq!(deserialize_queued_submission(&text).unwrap(), sub);
    }

    #[test]
    fn test_missing_timestamp_is_invalid_timestamp() {
        let text = r#"{"sessionId":"s1","recipientId":"r1","signingKey":"k1","signatures":{},"completedAt":"2025-01-01"}"#;
        let err = deserialize_queued_submission(text).unwrap_err();
        assert_eq!(err, CodecError::Field("timestamp"));
        assert!(err.to_string().contains("Invalid timestamp"));
    }

    #[test]
    fn test_each_missing_field_is_named() {
        for field in [
            "sessionId",
            "recipientId",
            "signingKey",
            "signatures",
            "completedAt",
            "timestamp",
        ] {
            let err = deserialize_queued_submission(&without(field)).unwrap_err();
            assert_eq!(err.to_string(), format!("Invalid {}", field));
        }
    }

    #[test]
    fn test_first_missing_field_wins() {
        let text = r#"{"signingKey":"k1","signatures":[]}"#;
        assert_eq!(
            deserialize_queued_submission(text).unwrap_err(),
            CodecError::Field("sessionId")
        );

        let text = r#"{"sessionId":"s1","recipientId":"r1","signingKey":"k1","signatures":null}"#;
        assert_eq!(
            deserialize_queued_submission(text).unwrap_err(),
            CodecError::Field("signatures")
        );
    }

    #[test]
    fn test_wrong_types_are_rejected() {
        let mut value = serde_json::to_value(submission()).unwrap();
        value["signatures"] = json!(["a", "b"]);
        assert_eq!(
            deserialize_queued_submission(&value.to_string()).unwrap_err(),
            CodecError::Field("signatures")
        );

        let mut value = serde_json::to_value(submission()).unwrap();
        value["timestamp"] = json!("1735732800000");
        assert_eq!(
            deserialize_queued_submission(&value.to_string()).unwrap_err(),
            CodecError::Field("timestamp")
        );

        let mut value = serde_json::to_value(submission()).unwrap();
        value["recipientId"] = json!(42);
        assert_eq!(
            deserialize_queued_submission(&value.to_string()).unwrap_err(),
            CodecError::Field("recipientId")
        );
    }

    #[test]
    fn test_syntax_errors_are_format_errors() {
        for text in ["", "{", "not json", "{\"sessionId\": }"] {
            assert!(matches!(
                deserialize_queued_submission(text),
                Err(CodecError::Format(_))
            ));
        }
        assert!(matches!(
            deserialize_queued_submission("[1,2,3]"),
            Err(CodecError::Format(_))
        ));
    }

    #[test]
    fn test_fractional_timestamp_is_truncated() {
        let mut value = serde_json::to_value(submission()).unwrap();
        value["timestamp"] = json!(1_735_732_800_000.75);
        let decoded = deserialize_queued_submission(&value.to_string()).unwrap();
        assert_eq!(decoded.timestamp, 1_735_732_800_000);
    }

    #[test]
    fn test_unknown_keys_are_ignored() {
        let mut value = serde_json::to_value(submission()).unwrap();
        value["clientVersion"] = json!("1.2.0");
        assert_eq!(
            deserialize_queued_submission(&value.to_string()).unwrap(),
            submission()
        );
    }

    fn signature_value() -> impl Strategy<Value = Value> {
        let leaf = prop_oneof![
            any::<bool>().prop_map(Value::from),
            any::<i64>().prop_map(Value::from),
            "[ -~]{0,24}".prop_map(Value::from),
        ];
        leaf.prop_recursive(3, 16, 4, |inner| {
            prop_oneof![
                prop::collection::vec(inner.clone(), 0..4).prop_map(Value::from),
                prop::collection::btree_map("[a-z]{1,6}", inner, 0..4)
                    .prop_map(|m| Value::Object(m.into_iter().collect())),
            ]
        })
    }

    proptest! {
        #[test]
        fn any_valid_submission_roundtrips(
            session_id in "[a-zA-Z0-9-]{3,36}",
            recipient_id in "[a-zA-Z0-9-]{1,20}",
            signing_key in "[a-zA-Z0-9]{3,64}",
            signatures in prop::collection::btree_map("[a-z0-9-]{1,12}", signature_value(), 0..6),
            completed_at in "20[2-3][0-9]-[01][0-9]-[0-2][0-9]T[0-2][0-9]:[0-5][0-9]:[0-5][0-9]Z",
            timestamp in 0i64..4_102_444_800_000,
        ) {
            let sub = QueuedSubmission {
                session_id,
                recipient_id,
                signing_key,
                signatures: signatures.into_iter().collect(),
                completed_at,
                timestamp,
            };
            let text = serialize_queued_submission(&sub).unwrap();
            prop_assert_eq!(deserialize_queued_submission(&text).unwrap(), sub);
        }
    }
}
