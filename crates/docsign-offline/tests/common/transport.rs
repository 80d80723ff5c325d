//! Scripted delivery transport for scheduler tests

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use docsign_offline::codec::serialize_queued_submission;
use docsign_offline::{
    ConnectivityHandle, DeliveryReceipt, DeliveryTransport, QueueStore, TransportError,
};
use shared_types::{NewSyncItem, QueuedSubmission, SignatureMap};

/// One scripted response. Deliveries past the end of the script succeed.
pub enum Step {
    Deliver,
    Status(u16),
    Network,
    /// Sleep before answering; used to trip the delivery timeout
    Hang(Duration),
    /// Succeed, but drop connectivity before answering
    DeliverThenOffline,
}

#[derive(Default)]
pub struct ScriptedTransport {
    script: Mutex<VecDeque<Step>>,
    calls: Mutex<Vec<String>>,
    connectivity: Mutex<Option<ConnectivityHandle>>,
}

impl ScriptedTransport {
    pub fn new(script: Vec<Step>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            ..Default::default()
        }
    }

    pub fn attach(&self, handle: ConnectivityHandle) {
        *self.connectivity.lock().unwrap() = Some(handle);
    }

    /// Session ids in delivery order
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl DeliveryTransport for ScriptedTransport {
    async fn deliver(&self, submission: &QueuedSubmission) -> Result<DeliveryReceipt, TransportError> {
        self.calls.lock().unwrap().push(submission.session_id.clone());
        let step = self.script.lock().unwrap().pop_front().unwrap_or(Step::Deliver);
        match step {
            Step::Deliver => Ok(DeliveryReceipt::default()),
            Step::Status(status) => Err(TransportError::from_status(status, "scripted")),
            Step::Network => Err(TransportError::Network("connection reset".into())),
            Step::Hang(delay) => {
                tokio::time::sleep(delay).await;
                Ok(DeliveryReceipt::default())
            }
            Step::DeliverThenOffline => {
                if let Some(handle) = self.connectivity.lock().unwrap().as_ref() {
                    handle.set_online(false);
                }
                Ok(DeliveryReceipt::default())
            }
        }
    }
}

pub fn submission(session_id: &str, timestamp: i64) -> QueuedSubmission {
    let mut signatures = SignatureMap::new();
    signatures.insert("sig-1".into(), "data:image/png;base64,iVBORw0KGgo=".into());
    QueuedSubmission {
        session_id: session_id.into(),
        recipient_id: "r1".into(),
        signing_key: "key-abc".into(),
        signatures,
        completed_at: "2025-01-01T12:00:00.000Z".into(),
        timestamp,
    }
}

/// Queue one submission per session id, timestamps in the given order
pub fn enqueue(store: &mut QueueStore, sessions: &[(&str, i64)]) {
    for (session_id, timestamp) in sessions {
        let sub = submission(session_id, *timestamp);
        store
            .add(NewSyncItem {
                id: format!("item-{session_id}"),
                session_id: session_id.to_string(),
                field_id: None,
                signature_data: serialize_queued_submission(&sub).unwrap(),
                timestamp: *timestamp,
            })
            .unwrap();
    }
}
