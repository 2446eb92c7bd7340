// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Push sink — best-effort out-of-band notification for recipients with no
//! live session. Never blocks the dispatcher: notifications go through a
//! bounded queue and a dedicated worker; overflow and backend failures are
//! logged and forgotten. Duplicate notifications for the same envelope are
//! suppressed for a minute.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::json;
use tokio::sync::mpsc;
use tokio::time::{Duration, Instant};
use tracing::{debug, info, warn};

use hamn_wire::Id;

use crate::config::PushBackendConfig;
use crate::error::StationError;

/// Dedup window per `(recipient, envelope signature)`.
pub const DEDUP_WINDOW: Duration = Duration::from_secs(60);
const QUEUE_DEPTH: usize = 1024;
/// Dedup map size that triggers an opportunistic prune.
const DEDUP_PRUNE_AT: usize = 4096;

/// Pluggable delivery backend (APNs, FCM, webhook, …).
#[async_trait]
pub trait PushBackend: Send + Sync + 'static {
    fn name(&self) -> &'static str;
    async fn push(&self, recipient: &Id, summary: &str) -> Result<(), StationError>;
}

/// Log-only backend, the default.
pub struct LogBackend;

#[async_trait]
impl PushBackend for LogBackend {
    fn name(&self) -> &'static str {
        "log"
    }

    async fn push(&self, recipient: &Id, summary: &str) -> Result<(), StationError> {
        info!(recipient = %recipient, summary, "push notification");
        Ok(())
    }
}

/// POSTs `{recipient, summary}` to an HTTP endpoint.
pub struct WebhookBackend {
    url: String,
    client: reqwest::Client,
}

impl WebhookBackend {
    pub fn new(url: String) -> Self {
        Self {
            url,
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl PushBackend for WebhookBackend {
    fn name(&self) -> &'static str {
        "webhook"
    }

    async fn push(&self, recipient: &Id, summary: &str) -> Result<(), StationError> {
        self.client
            .post(&self.url)
            .json(&json!({
                "recipient": recipient.to_string(),
                "summary": summary,
            }))
            .send()
            .await
            .and_then(|resp| resp.error_for_status())
            .map_err(|e| StationError::Transport(e.to_string()))?;
        Ok(())
    }
}

pub fn backend_from(config: &PushBackendConfig) -> Arc<dyn PushBackend> {
    match config {
        PushBackendConfig::Log => Arc::new(LogBackend),
        PushBackendConfig::Webhook { url } => Arc::new(WebhookBackend::new(url.clone())),
    }
}

struct Job {
    recipient: Id,
    summary: String,
}

pub struct PushSink {
    tx: mpsc::Sender<Job>,
    dedup: Mutex<HashMap<(String, String), Instant>>,
    badges: DashMap<String, u32>,
}

impl PushSink {
    /// Spawn the worker and return the sink.
    pub fn spawn(backend: Arc<dyn PushBackend>) -> Self {
        let (tx, mut rx) = mpsc::channel::<Job>(QUEUE_DEPTH);
        tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                if let Err(err) = backend.push(&job.recipient, &job.summary).await {
                    warn!(backend = backend.name(), "push failed: {err}");
                }
            }
        });
        Self {
            tx,
            dedup: Mutex::new(HashMap::new()),
            badges: DashMap::new(),
        }
    }

    /// Queue a notification for `recipient` about the envelope with
    /// `signature`. Synchronous and lossy by design.
    pub fn notify(&self, recipient: &Id, signature: &str) {
        let key = (recipient.address.to_string(), signature.to_string());
        {
            let mut dedup = self.dedup.lock().unwrap_or_else(|e| e.into_inner());
            let now = Instant::now();
            if dedup
                .get(&key)
                .is_some_and(|at| now.duration_since(*at) < DEDUP_WINDOW)
            {
                debug!(recipient = %recipient, "push deduplicated");
                return;
            }
            if dedup.len() >= DEDUP_PRUNE_AT {
                dedup.retain(|_, at| now.duration_since(*at) < DEDUP_WINDOW);
            }
            dedup.insert(key, now);
        }

        let badge = {
            let mut entry = self.badges.entry(recipient.address.to_string()).or_insert(0);
            *entry += 1;
            *entry
        };
        let summary = if badge == 1 {
            "1 new message".to_string()
        } else {
            format!("{badge} new messages")
        };

        if self
            .tx
            .try_send(Job {
                recipient: recipient.clone(),
                summary,
            })
            .is_err()
        {
            warn!(recipient = %recipient, "push queue full, notification dropped");
        }
    }

    /// Reset the unread badge, done by the receptionist once the spool for
    /// `recipient` is drained.
    pub fn clear_badge(&self, recipient: &Id) {
        self.badges.remove(&recipient.address.to_string());
    }

    pub fn badge(&self, recipient: &Id) -> u32 {
        self.badges
            .get(&recipient.address.to_string())
            .map(|b| *b)
            .unwrap_or(0)
    }
}
