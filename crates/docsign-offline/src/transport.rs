//! Delivery of queued submissions to the signing API

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;
use shared_types::QueuedSubmission;
use thiserror::Error;
use tracing::debug;

/// Server acknowledgement of a delivered submission
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeliveryReceipt {
    pub all_signed: bool,
    pub download_url: Option<String>,
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Server error ({status}): {message}")]
    Status { status: u16, message: String },

    #[error("Submission rejected ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("Delivery timed out after {0:?}")]
    Timeout(Duration),
}

impl TransportError {
    /// Whether the same submission may succeed on a later attempt
    pub fn is_retryable(&self) -> bool {
        !matches!(self, TransportError::Rejected { .. })
    }

    /// Classify a non-success HTTP status
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        if status == 408 || status == 429 || status >= 500 {
            TransportError::Status { status, message }
        } else {
            TransportError::Rejected { status, message }
        }
    }
}

#[async_trait]
pub trait DeliveryTransport: Send + Sync {
    async fn deliver(&self, submission: &QueuedSubmission) -> Result<DeliveryReceipt, TransportError>;
}

/// POSTs submissions to `{api_base}/session/{session_id}/signed`
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: Client,
    api_base: String,
}

impl HttpTransport {
    pub fn new(api_base: impl Into<String>) -> Self {
        Self::with_client(Client::new(), api_base)
    }

    pub fn with_client(client: Client, api_base: impl Into<String>) -> Self {
        let api_base = api_base.into().trim_end_matches('/').to_string();
        Self { client, api_base }
    }

    pub fn submission_url(&self, session_id: &str) -> String {
        format!("{}/session/{}/signed", self.api_base, session_id)
    }
}

#[async_trait]
impl DeliveryTransport for HttpTransport {
    async fn deliver(&self, submission: &QueuedSubmission) -> Result<DeliveryReceipt, TransportError> {
        let url = self.submission_url(&submission.session_id);

        let response = self
            .client
            .post(&url)
            .header("X-Recipient-Id", &submission.recipient_id)
            .header("X-Signing-Key", &submission.signing_key)
            .json(submission)
            .send()
            .await
            .map_err(|e| TransportError::Network(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(TransportError::from_status(status.as_u16(), message));
        }

        // The body is informational; a 2xx without JSON still counts as delivered
        let body: Value = response.json().await.unwrap_or(Value::Null);
        debug!(url = %url, status = %status, "Submission delivered");
        Ok(receipt_from_body(&body))
    }
}

fn receipt_from_body(body: &Value) -> DeliveryReceipt {
    DeliveryReceipt {
        all_signed: body
            .get("all_signed")
            .and_then(Value::as_bool)
            .unwrap_or(false),
        download_url: body
            .get("download_url")
            .and_then(Value::as_str)
            .map(String::from),
    }
}
