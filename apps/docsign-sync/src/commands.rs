//! Subcommand implementations

use std::fs;
use std::path::Path;
use std::process::ExitCode;
use std::sync::{Arc, MutexGuard};

use anyhow::Context;
use docsign_offline::validator::{check_session_not_expired, check_session_params};
use docsign_offline::{
    deserialize_queued_submission, validate_session_params, HttpTransport, OfflineStore,
    QueueStore, SessionTimestamp, SharedQueue, SyncConfig, SyncScheduler,
};
use serde_json::json;
use shared_types::{NewSyncItem, SessionParams};
use tracing::{info, warn};

fn open_store(config: &SyncConfig) -> anyhow::Result<OfflineStore> {
    let store = OfflineStore::open(config)
        .with_context(|| format!("Failed to open data directory: {}", config.data_dir.display()))?;
    if let Some(recovered) = store.recovered() {
        warn!(
            moved_to = %recovered.moved_to,
            reason = %recovered.reason,
            "Queue record was unreadable and has been set aside"
        );
    }
    Ok(store)
}

fn lock(queue: &SharedQueue) -> MutexGuard<'_, QueueStore> {
    queue.lock().unwrap_or_else(|e| e.into_inner())
}

fn print_json(value: &impl serde::Serialize) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

pub fn validate(
    session_id: Option<String>,
    recipient_id: Option<String>,
    signing_key: Option<String>,
) -> anyhow::Result<ExitCode> {
    let result = validate_session_params(&SessionParams {
        session_id,
        recipient_id,
        signing_key,
    });
    print_json(&result)?;
    Ok(if result.valid {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

/// Queue a submission file. The file must decode as a queued submission and
/// carry valid session parameters. When the session creation time is given
/// and `session_ttl_ms` is set, expired sessions are refused.
pub fn enqueue(config: &SyncConfig, path: &Path, created_at: Option<&str>) -> anyhow::Result<ExitCode> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("Failed to read submission: {}", path.display()))?;
    let id = enqueue_text(config, &text, created_at)?;
    println!("{id}");
    Ok(ExitCode::SUCCESS)
}

fn enqueue_text(config: &SyncConfig, text: &str, created_at: Option<&str>) -> anyhow::Result<String> {
    let submission = deserialize_queued_submission(text)?;
    check_session_params(&SessionParams::new(
        submission.session_id.as_str(),
        submission.recipient_id.as_str(),
        submission.signing_key.as_str(),
    ))?;
    check_session_not_expired(created_at.map(SessionTimestamp::from_text), config.session_ttl_ms)?;

    let store = open_store(config)?;
    let queue = store.queue();
    let id = uuid::Uuid::new_v4().to_string();
    lock(&queue).add(NewSyncItem {
        id: id.clone(),
        session_id: submission.session_id.clone(),
        field_id: None,
        signature_data: text.trim().to_string(),
        timestamp: submission.timestamp,
    })?;
    info!(id = %id, session_id = %submission.session_id, "Queued submission");
    Ok(id)
}

pub fn status(config: &SyncConfig) -> anyhow::Result<ExitCode> {
    print_json(&status_json(config)?)?;
    Ok(ExitCode::SUCCESS)
}

fn status_json(config: &SyncConfig) -> anyhow::Result<serde_json::Value> {
    let store = open_store(config)?;
    let queue = store.queue();
    let queue = lock(&queue);
    let items: Vec<_> = queue
        .oldest_first()
        .into_iter()
        .map(|i| {
            json!({
                "id": i.id,
                "sessionId": i.session_id,
                "timestamp": i.timestamp,
                "retryCount": i.retry_count,
            })
        })
        .collect();
    Ok(json!({
        "pending": queue.len(),
        "quarantined": queue.quarantined(),
        "items": items,
        "keyFingerprint": store.key_fingerprint(),
    }))
}

pub async fn drain(config: &SyncConfig) -> anyhow::Result<ExitCode> {
    let store = open_store(config)?;
    let transport = Arc::new(HttpTransport::new(config.api_base.clone()));
    let mut scheduler = SyncScheduler::new(store.queue(), transport, config.scheduler_settings());

    let report = scheduler.drain().await;
    print_json(&json!({
        "state": scheduler.state(),
        "report": report,
    }))?;
    Ok(if report.failures.is_empty() && report.storage_errors.is_empty() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

pub async fn run(config: &SyncConfig) -> anyhow::Result<ExitCode> {
    let store = open_store(config)?;
    let transport = Arc::new(HttpTransport::new(config.api_base.clone()));
    let mut scheduler = SyncScheduler::new(store.queue(), transport, config.scheduler_settings());

    info!(api_base = %config.api_base, "Syncing until interrupted");
    scheduler
        .run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "Failed to listen for Ctrl-C, stopping");
            }
        })
        .await;

    print_json(&scheduler.state())?;
    Ok(ExitCode::SUCCESS)
}

pub fn rotate_key(config: &SyncConfig) -> anyhow::Result<ExitCode> {
    let mut store = open_store(config)?;
    let fingerprint = store.rotate_key().context("Failed to rotate key")?;
    println!("{fingerprint}");
    Ok(ExitCode::SUCCESS)
}
