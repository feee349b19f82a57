// Email dispatcher - templated notifications over a pluggable transport

//! # Email Dispatcher
//!
//! Renders `$variable` templates into messages and drains them through a
//! background worker. The SMTP client itself lives behind the
//! [`MailTransport`] trait (embedders plug in a real client, tests plug
//! in a recorder), so the dispatcher owns queueing, templating and retry,
//! nothing wire-level.
//!
//! Templates are registered once at startup and read without locking
//! afterwards. Failed sends requeue with an incremented retry count until
//! [`MAX_RETRIES`](super::MAX_RETRIES) is exhausted, then land in the
//! history as failed.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::dispatch::{
    channel_enabled, substitute_vars, template_context, DispatchRecord, DispatchStatus,
    WorkflowEvent, MAX_RETRIES, QUEUE_CAPACITY,
};
use crate::models::kanban::KanbanDefinition;
use crate::models::process::Process;
use crate::Result;

/// SMTP connection settings, conventionally taken from the environment.
#[derive(Debug, Clone)]
pub struct SmtpConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub from_email: String,
    pub use_tls: bool,
}

impl SmtpConfig {
    /// Read `SMTP_HOST`, `SMTP_PORT`, `SMTP_USERNAME`, `SMTP_PASSWORD`,
    /// `SMTP_FROM_EMAIL` and `SMTP_USE_TLS`.
    pub fn from_env() -> Self {
        let var = |name: &str, default: &str| {
            std::env::var(name).unwrap_or_else(|_| default.to_string())
        };
        SmtpConfig {
            host: var("SMTP_HOST", "localhost"),
            port: var("SMTP_PORT", "587").parse().unwrap_or(587),
            username: var("SMTP_USERNAME", ""),
            password: var("SMTP_PASSWORD", ""),
            from_email: var("SMTP_FROM_EMAIL", "noreply@flowboard.local"),
            use_tls: var("SMTP_USE_TLS", "true").to_lowercase() == "true",
        }
    }
}

/// One rendered message ready for a transport.
#[derive(Debug, Clone)]
pub struct EmailMessage {
    pub recipients: Vec<String>,
    pub subject: String,
    pub body: String,
}

/// The wire-level mail client, out of the engine's scope.
#[async_trait]
pub trait MailTransport: Send + Sync {
    async fn send(&self, config: &SmtpConfig, message: &EmailMessage) -> Result<()>;
}

struct EmailTemplate {
    subject: String,
    body: String,
}

struct QueuedEmail {
    recipients: Vec<String>,
    template_name: String,
    event_type: String,
    context: HashMap<String, String>,
    queued_at: DateTime<Utc>,
    retry_count: u32,
}

/// Queued, templated email notifications.
pub struct EmailDispatcher {
    templates: Arc<DashMap<String, EmailTemplate>>,
    tx: mpsc::Sender<QueuedEmail>,
    queue_depth: Arc<AtomicUsize>,
    history: Arc<Mutex<Vec<DispatchRecord>>>,
}

impl EmailDispatcher {
    /// Start the dispatcher and its background worker.
    pub fn new(config: SmtpConfig, transport: Arc<dyn MailTransport>) -> Self {
        let templates: Arc<DashMap<String, EmailTemplate>> = Arc::new(DashMap::new());
        templates.insert(
            "default".to_string(),
            EmailTemplate {
                subject: "[Workflow] $event_type - $kanban_name".to_string(),
                body: "Process $process_id in kanban '$kanban_name' is now in state \
                       '$current_state' (event: $event_type)."
                    .to_string(),
            },
        );

        let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
        let queue_depth = Arc::new(AtomicUsize::new(0));
        let history = Arc::new(Mutex::new(Vec::new()));

        let dispatcher = EmailDispatcher {
            templates: templates.clone(),
            tx: tx.clone(),
            queue_depth: queue_depth.clone(),
            history: history.clone(),
        };

        tokio::spawn(worker(
            config, transport, templates, rx, tx, queue_depth, history,
        ));
        info!("email dispatcher started");
        dispatcher
    }

    /// Register a template. Subject and body support `$variable`
    /// substitution.
    pub fn register_template(&self, name: &str, subject: &str, body: &str) {
        self.templates.insert(
            name.to_string(),
            EmailTemplate {
                subject: subject.to_string(),
                body: body.to_string(),
            },
        );
        debug!(template = name, "email template registered");
    }

    /// Fan one event out to the kanban's email channel. Returns whether a
    /// notification was queued.
    pub async fn notify(
        &self,
        event: WorkflowEvent,
        process: &Process,
        kanban: &KanbanDefinition,
        additional: &HashMap<String, String>,
    ) -> bool {
        if !channel_enabled(kanban, event, "email") {
            return false;
        }

        let Some(email_config) = kanban
            .notifications
            .as_ref()
            .and_then(|n| n.email_config.as_ref())
        else {
            return false;
        };
        if email_config.recipients.is_empty() {
            return false;
        }

        let queued = QueuedEmail {
            recipients: email_config.recipients.clone(),
            template_name: email_config
                .template
                .clone()
                .unwrap_or_else(|| "default".to_string()),
            event_type: event.as_str().to_string(),
            context: template_context(event, process, kanban, additional),
            queued_at: Utc::now(),
            retry_count: 0,
        };

        // Producers do not block unless the queue is full
        match self.tx.try_send(queued) {
            Ok(()) => {
                self.queue_depth.fetch_add(1, Ordering::SeqCst);
                true
            }
            Err(err) => {
                warn!(error = %err, "email queue full, notification dropped");
                false
            }
        }
    }

    /// Notifications waiting in the queue.
    pub fn queue_size(&self) -> usize {
        self.queue_depth.load(Ordering::SeqCst)
    }

    /// The most recent delivery results, newest first.
    pub fn history(&self, limit: usize) -> Vec<DispatchRecord> {
        let history = self.history.lock().unwrap();
        history.iter().rev().take(limit).cloned().collect()
    }
}

async fn worker(
    config: SmtpConfig,
    transport: Arc<dyn MailTransport>,
    templates: Arc<DashMap<String, EmailTemplate>>,
    mut rx: mpsc::Receiver<QueuedEmail>,
    tx: mpsc::Sender<QueuedEmail>,
    queue_depth: Arc<AtomicUsize>,
    history: Arc<Mutex<Vec<DispatchRecord>>>,
) {
    while let Some(mut item) = rx.recv().await {
        queue_depth.fetch_sub(1, Ordering::SeqCst);

        let message = render(&templates, &item);
        match transport.send(&config, &message).await {
            Ok(()) => {
                debug!(recipients = message.recipients.len(), "email sent");
                history.lock().unwrap().push(DispatchRecord {
                    target: message.recipients.join(", "),
                    event_type: item.event_type.clone(),
                    status: DispatchStatus::Sent,
                    retry_count: item.retry_count,
                    queued_at: item.queued_at,
                    finished_at: Utc::now(),
                    detail: None,
                });
            }
            Err(err) if item.retry_count + 1 < MAX_RETRIES => {
                item.retry_count += 1;
                warn!(attempt = item.retry_count, error = %err, "email send failed, requeueing");
                if tx.try_send(item).is_ok() {
                    queue_depth.fetch_add(1, Ordering::SeqCst);
                }
            }
            Err(err) => {
                error!(error = %err, "email failed after max retries");
                history.lock().unwrap().push(DispatchRecord {
                    target: message.recipients.join(", "),
                    event_type: item.event_type.clone(),
                    status: DispatchStatus::Failed,
                    retry_count: item.retry_count,
                    queued_at: item.queued_at,
                    finished_at: Utc::now(),
                    detail: Some(err.to_string()),
                });
            }
        }
    }
}

fn render(templates: &DashMap<String, EmailTemplate>, item: &QueuedEmail) -> EmailMessage {
    let template = templates
        .get(&item.template_name)
        .or_else(|| templates.get("default"));

    let (subject, body) = match template {
        Some(t) => (
            substitute_vars(&t.subject, &item.context),
            substitute_vars(&t.body, &item.context),
        ),
        None => (
            format!("[Workflow] {}", item.event_type),
            String::new(),
        ),
    };

    EmailMessage {
        recipients: item.recipients.clone(),
        subject,
        body,
    }
}
