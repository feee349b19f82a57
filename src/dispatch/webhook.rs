// Webhook dispatcher - HTTP fan-out with retry

//! # Webhook Dispatcher
//!
//! POSTs a fixed JSON payload to the kanban's configured endpoint for every
//! enabled event. Header values support `${ENV_VAR}` substitution from the
//! process environment, every request carries a timeout, and failures
//! retry through the queue like email notifications do.
//!
//! The payload shape is stable so receivers can rely on it:
//!
//! ```json
//! {
//!   "event_type": "state_changed",
//!   "timestamp": "...",
//!   "kanban": {"id": "...", "name": "..."},
//!   "process": { "process_id": "...", "current_state": "...", ... }
//! }
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::dispatch::{
    channel_enabled, DispatchRecord, DispatchStatus, WorkflowEvent, MAX_RETRIES, QUEUE_CAPACITY,
};
use crate::models::kanban::KanbanDefinition;
use crate::models::process::Process;

/// Default per-request timeout in seconds.
pub const DEFAULT_TIMEOUT_SECS: u64 = 10;

struct QueuedWebhook {
    url: String,
    headers: HashMap<String, String>,
    event_type: String,
    payload: Value,
    queued_at: DateTime<Utc>,
    retry_count: u32,
}

/// Queued webhook notifications.
pub struct WebhookDispatcher {
    client: reqwest::Client,
    tx: mpsc::Sender<QueuedWebhook>,
    queue_depth: Arc<AtomicUsize>,
    history: Arc<Mutex<Vec<DispatchRecord>>>,
    timeout: Duration,
}

impl WebhookDispatcher {
    /// Start the dispatcher and its background worker.
    pub fn new() -> Self {
        Self::with_timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECS))
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        let client = reqwest::Client::new();
        let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
        let queue_depth = Arc::new(AtomicUsize::new(0));
        let history = Arc::new(Mutex::new(Vec::new()));

        let dispatcher = WebhookDispatcher {
            client: client.clone(),
            tx: tx.clone(),
            queue_depth: queue_depth.clone(),
            history: history.clone(),
            timeout,
        };

        tokio::spawn(worker(client, timeout, rx, tx, queue_depth, history));
        info!("webhook dispatcher started");
        dispatcher
    }

    /// Fan one event out to the kanban's webhook channel. Returns whether
    /// a webhook was queued.
    pub async fn notify(
        &self,
        event: WorkflowEvent,
        process: &Process,
        kanban: &KanbanDefinition,
        additional: &HashMap<String, Value>,
    ) -> bool {
        if !channel_enabled(kanban, event, "webhook") {
            return false;
        }

        let Some(webhook_config) = kanban
            .notifications
            .as_ref()
            .and_then(|n| n.webhook_config.as_ref())
        else {
            return false;
        };

        let queued = QueuedWebhook {
            url: webhook_config.url.clone(),
            headers: substitute_env_headers(&webhook_config.headers),
            event_type: event.as_str().to_string(),
            payload: prepare_payload(event, process, kanban, additional),
            queued_at: Utc::now(),
            retry_count: 0,
        };

        match self.tx.try_send(queued) {
            Ok(()) => {
                self.queue_depth.fetch_add(1, Ordering::SeqCst);
                true
            }
            Err(err) => {
                warn!(error = %err, "webhook queue full, notification dropped");
                false
            }
        }
    }

    /// Bypass the queue and POST immediately.
    pub async fn send_now(
        &self,
        url: &str,
        payload: &Value,
        headers: &HashMap<String, String>,
    ) -> (bool, Option<Value>) {
        post(&self.client, self.timeout, url, headers, payload).await
    }

    /// Connectivity probe with a marked test payload.
    pub async fn test_webhook(&self, url: &str) -> (bool, Option<Value>) {
        let payload = json!({
            "event_type": "test",
            "timestamp": Utc::now().to_rfc3339(),
            "test": true,
        });
        self.send_now(url, &payload, &HashMap::new()).await
    }

    /// Webhooks waiting in the queue.
    pub fn queue_size(&self) -> usize {
        self.queue_depth.load(Ordering::SeqCst)
    }

    /// The most recent delivery results, newest first.
    pub fn history(&self, limit: usize) -> Vec<DispatchRecord> {
        let history = self.history.lock().unwrap();
        history.iter().rev().take(limit).cloned().collect()
    }
}

impl Default for WebhookDispatcher {
    fn default() -> Self {
        WebhookDispatcher::new()
    }
}

async fn worker(
    client: reqwest::Client,
    timeout: Duration,
    mut rx: mpsc::Receiver<QueuedWebhook>,
    tx: mpsc::Sender<QueuedWebhook>,
    queue_depth: Arc<AtomicUsize>,
    history: Arc<Mutex<Vec<DispatchRecord>>>,
) {
    while let Some(mut item) = rx.recv().await {
        queue_depth.fetch_sub(1, Ordering::SeqCst);

        let (success, response) =
            post(&client, timeout, &item.url, &item.headers, &item.payload).await;

        if success {
            debug!(url = %item.url, "webhook delivered");
            history.lock().unwrap().push(DispatchRecord {
                target: item.url.clone(),
                event_type: item.event_type.clone(),
                status: DispatchStatus::Sent,
                retry_count: item.retry_count,
                queued_at: item.queued_at,
                finished_at: Utc::now(),
                detail: response.map(|r| r.to_string()),
            });
        } else if item.retry_count + 1 < MAX_RETRIES {
            item.retry_count += 1;
            warn!(url = %item.url, attempt = item.retry_count, "webhook failed, requeueing");
            if tx.try_send(item).is_ok() {
                queue_depth.fetch_add(1, Ordering::SeqCst);
            }
        } else {
            error!(url = %item.url, "webhook failed after max retries");
            history.lock().unwrap().push(DispatchRecord {
                target: item.url.clone(),
                event_type: item.event_type.clone(),
                status: DispatchStatus::Failed,
                retry_count: item.retry_count,
                queued_at: item.queued_at,
                finished_at: Utc::now(),
                detail: response.map(|r| r.to_string()),
            });
        }
    }
}

async fn post(
    client: &reqwest::Client,
    timeout: Duration,
    url: &str,
    headers: &HashMap<String, String>,
    payload: &Value,
) -> (bool, Option<Value>) {
    let mut request = client.post(url).json(payload).timeout(timeout);
    for (name, value) in headers {
        request = request.header(name, value);
    }

    match request.send().await {
        Ok(response) => {
            let status = response.status();
            let body: Value = response.json().await.unwrap_or(Value::Null);
            let detail = json!({"status_code": status.as_u16(), "body": body});
            (status.is_success(), Some(detail))
        }
        Err(err) if err.is_timeout() => (false, Some(json!({"error": "timeout"}))),
        Err(err) => (false, Some(json!({"error": err.to_string()}))),
    }
}

/// The fixed payload shape: event, timestamp, kanban identity and a
/// curated projection of the process.
fn prepare_payload(
    event: WorkflowEvent,
    process: &Process,
    kanban: &KanbanDefinition,
    additional: &HashMap<String, Value>,
) -> Value {
    let mut payload = json!({
        "event_type": event.as_str(),
        "timestamp": Utc::now().to_rfc3339(),
        "kanban": {"id": kanban.id, "name": kanban.name},
        "process": {
            "process_id": process.process_id,
            "current_state": process.current_state,
            "created_at": process.created_at.to_rfc3339(),
            "updated_at": process.updated_at.to_rfc3339(),
            "field_values": process.field_values,
            "tags": process.tags,
            "assigned_to": process.assigned_to,
            "sla": process.sla,
        },
    });

    if let Some(object) = payload.as_object_mut() {
        for (key, value) in additional {
            object.insert(key.clone(), value.clone());
        }
    }
    payload
}

/// Substitute `${VAR}` from the process environment in header values.
/// Unresolvable variables leave the original value untouched.
fn substitute_env_headers(headers: &HashMap<String, String>) -> HashMap<String, String> {
    headers
        .iter()
        .map(|(name, value)| {
            if !value.contains("${") {
                return (name.clone(), value.clone());
            }

            let mut env: HashMap<String, String> = HashMap::new();
            let mut rest = value.as_str();
            let mut resolvable = true;
            while let Some(start) = rest.find("${") {
                let tail = &rest[start + 2..];
                let Some(end) = tail.find('}') else { break };
                let var = &tail[..end];
                match std::env::var(var) {
                    Ok(v) => {
                        env.insert(var.to_string(), v);
                    }
                    Err(_) => {
                        warn!(variable = var, "environment variable not found");
                        resolvable = false;
                        break;
                    }
                }
                rest = &tail[end + 1..];
            }

            if resolvable {
                (name.clone(), crate::dispatch::substitute_vars(value, &env))
            } else {
                (name.clone(), value.clone())
            }
        })
        .collect()
}
