//! Sync scheduler
//!
//! Drains the shared queue against a [`DeliveryTransport`], oldest item first.
//! Each attempt is bounded by a timeout. A retryable failure bumps the item's
//! retry count and parks it until its backoff deadline; once the ceiling is
//! reached the item is dropped and reported. Rejections and undecodable
//! payloads are never retried.
//!
//! Status is published on a watch channel. Connectivity is set from outside
//! through a [`ConnectivityHandle`]; while offline nothing is attempted, and
//! going offline mid-drain stops the batch after the in-flight attempt.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, MutexGuard};
use std::time::Duration;

use serde::Serialize;
use shared_types::SyncItem;
use tokio::sync::watch;
use tokio::time::{timeout, Instant};
use tracing::{debug, error, info, warn};

use crate::codec::deserialize_queued_submission;
use crate::queue::{QueueStore, SharedQueue, StoreError};
use crate::retry::RetryPolicy;
use crate::transport::{DeliveryReceipt, DeliveryTransport, TransportError};

pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(30);
pub const DEFAULT_DELIVERY_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    Idle,
    Syncing,
    Error,
    Success,
}

impl std::fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SyncStatus::Idle => "idle",
            SyncStatus::Syncing => "syncing",
            SyncStatus::Error => "error",
            SyncStatus::Success => "success",
        };
        f.write_str(s)
    }
}

/// Snapshot published to observers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncState {
    pub status: SyncStatus,
    pub is_online: bool,
    pub pending: usize,
    /// Pending items that have failed at least once, plus quarantined items
    pub stuck: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum FailureKind {
    RetriesExhausted,
    Rejected,
    Undecodable,
}

/// An item that left the queue without being delivered
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PermanentFailure {
    pub item_id: String,
    pub session_id: String,
    pub kind: FailureKind,
    pub retry_count: u32,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Delivered {
    pub item_id: String,
    pub session_id: String,
    pub all_signed: bool,
    pub download_url: Option<String>,
}

/// Outcome of one drain cycle
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncReport {
    pub attempted: usize,
    pub delivered: Vec<Delivered>,
    /// Ids that failed and will be retried
    pub retried: Vec<String>,
    /// Items skipped because their backoff deadline had not passed
    pub deferred: usize,
    pub failures: Vec<PermanentFailure>,
    pub storage_errors: Vec<String>,
    /// Stopped early (or never started) because the client was offline
    pub halted_offline: bool,
}

impl SyncReport {
    /// Status the cycle ends in
    pub fn status(&self) -> SyncStatus {
        if !self.failures.is_empty() || !self.storage_errors.is_empty() {
            SyncStatus::Error
        } else if self.retried.is_empty() && self.deferred == 0 && !self.halted_offline {
            SyncStatus::Success
        } else {
            SyncStatus::Idle
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerSettings {
    pub policy: RetryPolicy,
    pub delivery_timeout: Duration,
    pub retry_interval: Duration,
    pub initially_online: bool,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            policy: RetryPolicy::default(),
            delivery_timeout: DEFAULT_DELIVERY_TIMEOUT,
            retry_interval: DEFAULT_RETRY_INTERVAL,
            initially_online: true,
        }
    }
}

/// Sets the online flag seen by a scheduler
#[derive(Debug, Clone)]
pub struct ConnectivityHandle {
    online: Arc<watch::Sender<bool>>,
    state: Arc<watch::Sender<SyncState>>,
}

impl ConnectivityHandle {
    pub fn set_online(&self, online: bool) {
        let changed = self.online.send_if_modified(|current| {
            let changed = *current != online;
            *current = online;
            changed
        });
        if changed {
            info!(online, "Connectivity changed");
            self.state.send_modify(|s| s.is_online = online);
        }
    }

    pub fn is_online(&self) -> bool {
        *self.online.borrow()
    }
}

pub struct SyncScheduler {
    queue: SharedQueue,
    transport: Arc<dyn DeliveryTransport>,
    settings: SchedulerSettings,
    online: Arc<watch::Sender<bool>>,
    state: Arc<watch::Sender<SyncState>>,
    not_before: HashMap<String, Instant>,
}

impl SyncScheduler {
    pub fn new(
        queue: SharedQueue,
        transport: Arc<dyn DeliveryTransport>,
        settings: SchedulerSettings,
    ) -> Self {
        let (pending, stuck) = {
            let store = lock(&queue);
            counts(&store)
        };
        let (online, _) = watch::channel(settings.initially_online);
        let (state, _) = watch::channel(SyncState {
            status: SyncStatus::Idle,
            is_online: settings.initially_online,
            pending,
            stuck,
        });
        Self {
            queue,
            transport,
            settings,
            online: Arc::new(online),
            state: Arc::new(state),
            not_before: HashMap::new(),
        }
    }

    pub fn connectivity(&self) -> ConnectivityHandle {
        ConnectivityHandle {
            online: self.online.clone(),
            state: self.state.clone(),
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<SyncState> {
        self.state.subscribe()
    }

    pub fn state(&self) -> SyncState {
        *self.state.borrow()
    }

    pub fn queue(&self) -> &SharedQueue {
        &self.queue
    }

    fn is_online(&self) -> bool {
        *self.online.borrow()
    }

    /// Run one drain cycle
    pub async fn drain(&mut self) -> SyncReport {
        let mut report = SyncReport::default();

        // error/success fall back to idle before a new cycle starts
        self.state.send_modify(|s| s.status = SyncStatus::Idle);

        if !self.is_online() {
            debug!("Offline, skipping sync cycle");
            report.halted_offline = true;
            self.publish(SyncStatus::Idle);
            return report;
        }

        let items = lock(&self.queue).oldest_first();
        if items.is_empty() {
            self.not_before.clear();
            self.publish(SyncStatus::Idle);
            return report;
        }

        self.publish(SyncStatus::Syncing);
        info!(pending = items.len(), "Starting sync cycle");

        for item in items {
            if !self.is_online() {
                info!("Went offline, halting sync cycle");
                report.halted_offline = true;
                break;
            }
            if self
                .not_before
                .get(&item.id)
                .is_some_and(|deadline| Instant::now() < *deadline)
            {
                report.deferred += 1;
                continue;
            }
            self.attempt(item, &mut report).await;
        }

        let store = lock(&self.queue);
        self.not_before.retain(|id, _| store.get(id).is_some());
        drop(store);

        let status = report.status();
        self.publish(status);
        info!(
            status = %status,
            attempted = report.attempted,
            delivered = report.delivered.len(),
            retried = report.retried.len(),
            failed = report.failures.len(),
            deferred = report.deferred,
            "Sync cycle finished"
        );
        report
    }

    async fn attempt(&mut self, item: SyncItem, report: &mut SyncReport) {
        let submission = match deserialize_queued_submission(&item.signature_data) {
            Ok(sub) => sub,
            Err(e) => {
                let reason = e.to_string();
                let result = lock(&self.queue)
                    .quarantine(&item.id, reason.clone())
                    .map(|_| ());
                record_store_result(result, report);
                report.failures.push(PermanentFailure {
                    item_id: item.id,
                    session_id: item.session_id,
                    kind: FailureKind::Undecodable,
                    retry_count: item.retry_count,
                    reason,
                });
                return;
            }
        };

        report.attempted += 1;
        debug!(id = %item.id, session_id = %item.session_id, retry_count = item.retry_count, "Delivering");

        let limit = self.settings.delivery_timeout;
        let outcome = match timeout(limit, self.transport.deliver(&submission)).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout(limit)),
        };

        match outcome {
            Ok(receipt) => self.on_delivered(item, receipt, report),
            Err(e) if !e.is_retryable() => {
                error!(id = %item.id, session_id = %item.session_id, error = %e, "Submission rejected, dropping");
                let result = lock(&self.queue).remove(&item.id).map(|_| ());
                record_store_result(result, report);
                self.not_before.remove(&item.id);
                report.failures.push(PermanentFailure {
                    item_id: item.id,
                    session_id: item.session_id,
                    kind: FailureKind::Rejected,
                    retry_count: item.retry_count,
                    reason: e.to_string(),
                });
            }
            Err(e) => self.on_retryable_failure(item, e, report),
        }
    }

    fn on_delivered(&mut self, item: SyncItem, receipt: DeliveryReceipt, report: &mut SyncReport) {
        info!(id = %item.id, session_id = %item.session_id, "Synced queued submission");
        let result = lock(&self.queue).remove(&item.id).map(|_| ());
        record_store_result(result, report);
        self.not_before.remove(&item.id);
        report.delivered.push(Delivered {
            item_id: item.id,
            session_id: item.session_id,
            all_signed: receipt.all_signed,
            download_url: receipt.download_url,
        });
    }

    fn on_retryable_failure(&mut self, item: SyncItem, err: TransportError, report: &mut SyncReport) {
        let policy = self.settings.policy;
        let mut store = lock(&self.queue);
        let retry_count = match store.increment_retry(&item.id) {
            Ok(Some(count)) => count,
            // Removed by someone else while the attempt was in flight
            Ok(None) => return,
            Err(e) => {
                report.storage_errors.push(e.to_string());
                store.get(&item.id).map_or(item.retry_count, |i| i.retry_count)
            }
        };

        if retry_count >= policy.max_retries {
            error!(
                id = %item.id,
                session_id = %item.session_id,
                retry_count,
                error = %err,
                "Retries exhausted, dropping submission"
            );
            let result = store.remove(&item.id).map(|_| ());
            drop(store);
            record_store_result(result, report);
            self.not_before.remove(&item.id);
            report.failures.push(PermanentFailure {
                item_id: item.id,
                session_id: item.session_id,
                kind: FailureKind::RetriesExhausted,
                retry_count,
                reason: err.to_string(),
            });
            return;
        }
        drop(store);

        let delay = policy.backoff(item.retry_count);
        warn!(
            id = %item.id,
            retry_count,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "Delivery failed, will retry"
        );
        self.not_before.insert(item.id.clone(), Instant::now() + delay);
        report.retried.push(item.id);
    }

    fn publish(&self, status: SyncStatus) {
        let (pending, stuck) = counts(&lock(&self.queue));
        let is_online = self.is_online();
        self.state.send_replace(SyncState {
            status,
            is_online,
            pending,
            stuck,
        });
    }

    /// Time until the next cycle: the retry interval, or sooner if a
    /// backoff deadline falls inside it
    fn next_wakeup(&self) -> Duration {
        if !self.is_online() {
            return self.settings.retry_interval;
        }
        let now = Instant::now();
        self.not_before
            .values()
            .filter(|deadline| **deadline > now)
            .map(|deadline| *deadline - now)
            .min()
            .map_or(self.settings.retry_interval, |d| d.min(self.settings.retry_interval))
    }

    /// Drain repeatedly until `shutdown` resolves. Wakes on the retry
    /// interval, on connectivity changes, and on backoff deadlines.
    pub async fn run_until<F>(&mut self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        let mut online = self.online.subscribe();
        info!(
            retry_interval_ms = self.settings.retry_interval.as_millis() as u64,
            "Sync scheduler started"
        );

        loop {
            self.drain().await;
            let wait = self.next_wakeup();
            tokio::select! {
                _ = &mut shutdown => break,
                _ = tokio::time::sleep(wait) => {}
                _ = online.changed() => {}
            }
        }

        info!("Sync scheduler stopped");
    }
}

fn lock(queue: &SharedQueue) -> MutexGuard<'_, QueueStore> {
    // Mutations persist before returning, so a poisoned store is still consistent
    queue.lock().unwrap_or_else(|e| e.into_inner())
}

fn counts(store: &QueueStore) -> (usize, usize) {
    let failing = store.items().iter().filter(|i| i.retry_count > 0).count();
    (store.len(), failing + store.quarantined().len())
}

fn record_store_result(result: Result<(), StoreError>, report: &mut SyncReport) {
    if let Err(e) = result {
        error!(error = %e, "Failed to persist queue");
        report.storage_errors.push(e.to_string());
    }
}
