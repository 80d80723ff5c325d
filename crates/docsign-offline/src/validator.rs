//! Session and field validation
//!
//! Pure checks run before anything is queued. Invalid input is reported as a
//! value, never as a panic; callers match on the keywords `session`,
//! `recipient` and `signing key` in the message to pick an inline hint.

use std::collections::HashSet;

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::Serialize;
use shared_types::{SessionParams, SigningField};
use thiserror::Error;

/// Minimum trimmed length of a session id
pub const MIN_SESSION_ID_LEN: usize = 3;
/// Minimum trimmed length of a recipient id
pub const MIN_RECIPIENT_ID_LEN: usize = 1;
/// Minimum trimmed length of a signing key
pub const MIN_SIGNING_KEY_LEN: usize = 3;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("Missing required parameter: session")]
    MissingSession,

    #[error("Invalid session ID format")]
    InvalidSession,

    #[error("Missing required parameter: recipient")]
    MissingRecipient,

    #[error("Missing required parameter: signing key")]
    MissingSigningKey,

    #[error("Invalid signing key format")]
    InvalidSigningKey,

    #[error("Cannot submit: not all required fields are completed")]
    IncompleteFields,

    #[error("Field {0} is not assigned to this recipient")]
    FieldNotAssigned(String),

    #[error("This signing session has expired")]
    SessionExpired,
}

/// Session validation result, in the shape the signing page expects
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionValidation {
    pub valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl From<Result<(), ValidationError>> for SessionValidation {
    fn from(result: Result<(), ValidationError>) -> Self {
        match result {
            Ok(()) => Self {
                valid: true,
                error: None,
            },
            Err(e) => Self {
                valid: false,
                error: Some(e.to_string()),
            },
        }
    }
}

/// Validate session URL parameters.
/// Rules run in order: session, recipient, signing key. First failure wins.
pub fn validate_session_params(params: &SessionParams) -> SessionValidation {
    check_session_params(params).into()
}

/// Same rules as [`validate_session_params`], as a `Result`
pub fn check_session_params(params: &SessionParams) -> Result<(), ValidationError> {
    // Whitespace-only values fail the length checks
    let session_id = params
        .session_id
        .as_deref()
        .ok_or(ValidationError::MissingSession)?
        .trim();
    if session_id.is_empty() {
        return Err(ValidationError::MissingSession);
    }
    if session_id.chars().count() < MIN_SESSION_ID_LEN {
        return Err(ValidationError::InvalidSession);
    }

    let recipient_id = params.recipient_id.as_deref().map(str::trim).unwrap_or("");
    if recipient_id.chars().count() < MIN_RECIPIENT_ID_LEN {
        return Err(ValidationError::MissingRecipient);
    }

    let signing_key = params
        .signing_key
        .as_deref()
        .ok_or(ValidationError::MissingSigningKey)?
        .trim();
    if signing_key.is_empty() {
        return Err(ValidationError::MissingSigningKey);
    }
    if signing_key.chars().count() < MIN_SIGNING_KEY_LEN {
        return Err(ValidationError::InvalidSigningKey);
    }

    Ok(())
}

/// Session creation time as received: epoch milliseconds or an ISO-8601 string
#[derive(Debug, Clone, PartialEq)]
pub enum SessionTimestamp {
    EpochMillis(f64),
    Iso(String),
}

impl From<i64> for SessionTimestamp {
    fn from(ms: i64) -> Self {
        SessionTimestamp::EpochMillis(ms as f64)
    }
}

impl From<f64> for SessionTimestamp {
    fn from(ms: f64) -> Self {
        SessionTimestamp::EpochMillis(ms)
    }
}

impl From<&str> for SessionTimestamp {
    fn from(s: &str) -> Self {
        SessionTimestamp::Iso(s.to_string())
    }
}

impl From<String> for SessionTimestamp {
    fn from(s: String) -> Self {
        SessionTimestamp::Iso(s)
    }
}

impl SessionTimestamp {
    /// Read a command-line or header value: numbers are epoch milliseconds,
    /// anything else is kept as an ISO string.
    pub fn from_text(s: &str) -> Self {
        match s.trim().parse::<f64>() {
            Ok(ms) => SessionTimestamp::EpochMillis(ms),
            Err(_) => SessionTimestamp::Iso(s.to_string()),
        }
    }

    /// Epoch milliseconds, or `None` when unparseable
    pub fn to_millis(&self) -> Option<f64> {
        match self {
            SessionTimestamp::EpochMillis(ms) => ms.is_finite().then_some(*ms),
            SessionTimestamp::Iso(s) => parse_iso_millis(s.trim()).map(|ms| ms as f64),
        }
    }
}

/// Offset-less date-times and bare dates are read as UTC.
fn parse_iso_millis(s: &str) -> Option<i64> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.timestamp_millis());
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%dT%H:%M"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, format) {
            return Some(naive.and_utc().timestamp_millis());
        }
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc().timestamp_millis())
}

/// Whether a session created at `created_at` has outlived `ttl_ms`.
/// Unparseable timestamps count as expired.
pub fn is_session_expired(created_at: impl Into<SessionTimestamp>, ttl_ms: i64) -> bool {
    is_session_expired_at(created_at, ttl_ms, Utc::now().timestamp_millis())
}

/// [`is_session_expired`] against an explicit clock
pub fn is_session_expired_at(
    created_at: impl Into<SessionTimestamp>,
    ttl_ms: i64,
    now_ms: i64,
) -> bool {
    match created_at.into().to_millis() {
        Some(created) => now_ms as f64 - created > ttl_ms as f64,
        None => true,
    }
}

/// Reject a session past its TTL. Without a TTL or a known creation time
/// the session never expires.
pub fn check_session_not_expired(
    created_at: Option<SessionTimestamp>,
    ttl_ms: Option<i64>,
) -> Result<(), ValidationError> {
    match (created_at, ttl_ms) {
        (Some(created), Some(ttl)) if is_session_expired(created.clone(), ttl) => {
            Err(ValidationError::SessionExpired)
        }
        _ => Ok(()),
    }
}

/// Fields assigned to `recipient_id`, in document order
pub fn filter_fields_by_recipient<'a>(
    fields: &'a [SigningField],
    recipient_id: &str,
) -> Vec<&'a SigningField> {
    fields
        .iter()
        .filter(|f| f.recipient_id == recipient_id)
        .collect()
}

/// True when every required field has been completed. Optional fields never block.
pub fn are_all_required_fields_complete<'a, I>(fields: I, completed_ids: &HashSet<String>) -> bool
where
    I: IntoIterator<Item = &'a SigningField>,
{
    fields
        .into_iter()
        .filter(|f| f.required)
        .all(|f| completed_ids.contains(&f.id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use shared_types::FieldType;

    fn field(id: &str, recipient: &str, required: bool) -> SigningField {
        SigningField {
            id: id.to_string(),
            field_type: FieldType::Signature,
            page: 1,
            x: 100.0,
            y: 100.0,
            width: 150.0,
            height: 50.0,
            required,
            recipient_id: recipient.to_string(),
        }
    }

    fn error_of(params: SessionParams) -> String {
        validate_session_params(&params).error.unwrap_or_default()
    }

    // ============================================================
    // Session Parameter Tests
    // ============================================================

    #[test]
    fn test_valid_session_params() {
        let result = validate_session_params(&SessionParams::new("abc", "r", "key"));
        assert!(result.valid);
        assert!(result.error.is_none());
    }

    #[test]
    fn test_short_session_id_mentions_session() {
        let result = validate_session_params(&SessionParams::new("ab", "r1", "validkey"));
        assert!(!result.valid);
        assert!(result.error.unwrap().contains("session"));
    }

    #[test]
    fn test_missing_fields_mention_their_keyword() {
        let mut params = SessionParams::new("sess", "r1", "key");
        params.session_id = None;
        assert!(error_of(params).contains("session"));

        let mut params = SessionParams::new("sess", "r1", "key");
        params.recipient_id = None;
        assert!(error_of(params).contains("recipient"));

        let mut params = SessionParams::new("sess", "r1", "key");
        params.signing_key = None;
        assert!(error_of(params).contains("signing key"));
    }

    #[test]
    fn test_whitespace_is_trimmed_before_length_checks() {
        assert!(error_of(SessionParams::new("  ab  ", "r1", "key")).contains("session"));
        assert!(error_of(SessionParams::new("abc", "   ", "key")).contains("recipient"));
        assert!(error_of(SessionParams::new("abc", "r1", " k ")).contains("signing key"));
        assert!(error_of(SessionParams::new("   ", "r1", "key")).contains("session"));
    }

    #[test]
    fn test_first_failure_wins() {
        let params = SessionParams {
            session_id: Some("x".into()),
            recipient_id: None,
            signing_key: None,
        };
        assert!(error_of(params).contains("session"));

        let params = SessionParams {
            session_id: Some("abc".into()),
            recipient_id: Some("".into()),
            signing_key: Some("".into()),
        };
        assert!(error_of(params).contains("recipient"));
    }

    // ============================================================
    // Expiry Tests
    // ============================================================

    const HOUR: i64 = 60 * 60 * 1000;
    const NOW: i64 = 1_735_689_600_000; // 2025-01-01T00:00:00Z

    #[test]
    fn test_expiry_with_epoch_millis() {
        assert!(!is_session_expired_at(NOW - HOUR, 2 * HOUR, NOW));
        assert!(is_session_expired_at(NOW - 3 * HOUR, 2 * HOUR, NOW));
        assert!(!is_session_expired_at(NOW - 2 * HOUR, 2 * HOUR, NOW));
        assert!(!is_session_expired_at(NOW + HOUR, 0, NOW));
    }

    #[test]
    fn test_expiry_with_iso_strings() {
        assert!(!is_session_expired_at("2024-12-31T23:00:00Z", 2 * HOUR, NOW));
        assert!(is_session_expired_at("2024-12-31T20:00:00+00:00", 2 * HOUR, NOW));
        assert!(is_session_expired_at("2024-12-30", 2 * HOUR, NOW));
        assert!(!is_session_expired_at("2024-12-31T23:30:00.000", HOUR, NOW));
    }

    #[test]
    fn test_unparseable_timestamp_is_expired() {
        assert!(is_session_expired_at("not a date", i64::MAX, NOW));
        assert!(is_session_expired_at("", i64::MAX, NOW));
        assert!(is_session_expired_at(f64::NAN, i64::MAX, NOW));
        assert!(is_session_expired_at(f64::INFINITY, i64::MAX, NOW));
    }

    #[test]
    fn test_expiry_check_needs_ttl_and_creation_time() {
        let old = Some(SessionTimestamp::from(0i64));
        assert_eq!(
            check_session_not_expired(old.clone(), Some(HOUR)),
            Err(ValidationError::SessionExpired)
        );
        assert_eq!(check_session_not_expired(old, None), Ok(()));
        assert_eq!(check_session_not_expired(None, Some(1)), Ok(()));
    }

    #[test]
    fn test_timestamp_from_text() {
        assert_eq!(
            SessionTimestamp::from_text("1735732800000"),
            SessionTimestamp::EpochMillis(1_735_732_800_000.0)
        );
        assert_eq!(
            SessionTimestamp::from_text("2025-01-01T12:00:00Z"),
            SessionTimestamp::Iso("2025-01-01T12:00:00Z".into())
        );
    }

    // ============================================================
    // Field Tests
    // ============================================================

    #[test]
    fn test_filter_fields_keeps_order_and_identity() {
        let fields = vec![
            field("a", "r1", true),
            field("b", "r2", true),
            field("c", "r1", false),
        ];
        let mine = filter_fields_by_recipient(&fields, "r1");
        assert_eq!(mine.len(), 2);
        assert!(std::ptr::eq(mine[0], &fields[0]));
        assert!(std::ptr::eq(mine[1], &fields[2]));
        assert!(filter_fields_by_recipient(&fields, "nobody").is_empty());
    }

    #[test]
    fn test_required_field_completion() {
        let fields = vec![field("a", "r1", true), field("b", "r1", false)];
        let mut done = HashSet::new();
        assert!(!are_all_required_fields_complete(&fields, &done));
        done.insert("a".to_string());
        assert!(are_all_required_fields_complete(&fields, &done));
        assert!(are_all_required_fields_complete(&Vec::<SigningField>::new(), &HashSet::new()));
    }

    // ============================================================
    // Property Tests
    // ============================================================

    proptest! {
        #[test]
        fn params_meeting_minimums_are_valid(
            session in "[a-zA-Z0-9-]{3,40}",
            recipient in "[a-zA-Z0-9-]{1,40}",
            key in "[a-zA-Z0-9]{3,64}",
            pad in " {0,3}",
        ) {
            let params = SessionParams::new(
                format!("{pad}{session}{pad}"),
                format!("{pad}{recipient}"),
                format!("{key}{pad}"),
            );
            prop_assert!(validate_session_params(&params).valid);
        }

        #[test]
        fn short_signing_key_is_invalid(key in "[a-z]{0,2}", pad in " {0,3}") {
            let params = SessionParams::new("session-1", "r1", format!("{pad}{key}{pad}"));
            let result = validate_session_params(&params);
            prop_assert!(!result.valid);
            prop_assert!(result.error.unwrap().contains("signing key"));
        }

        #[test]
        fn recent_sessions_are_not_expired(age in 0i64..HOUR, ttl in HOUR..10 * HOUR) {
            prop_assert!(!is_session_expired_at(NOW - age, ttl, NOW));
        }

        #[test]
        fn old_sessions_are_expired(ttl in 0i64..HOUR, extra in 1i64..HOUR) {
            prop_assert!(is_session_expired_at(NOW - ttl - extra, ttl, NOW));
        }

        #[test]
        fn filter_returns_exact_matching_subset(owners in prop::collection::vec(0u8..3, 0..20)) {
            let fields: Vec<_> = owners
                .iter()
                .enumerate()
                .map(|(i, o)| field(&format!("f{i}"), &format!("r{o}"), true))
                .collect();
            let filtered = filter_fields_by_recipient(&fields, "r1");
            let expected: Vec<_> = fields.iter().filter(|f| f.recipient_id == "r1").collect();
            prop_assert_eq!(filtered, expected);
        }
    }
}
