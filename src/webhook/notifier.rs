//! Fan-out delivery of job lifecycle events to registered webhooks.
//!
//! Implements `LifecycleListener` as a one-way edge from the job manager
//! (spec §9 design note): the manager calls `on_event` and never looks
//! back into the notifier. Retry/backoff mirrors the teacher's job queue
//! backoff formula (`kernel/jobs/queue.rs`): `2^retry_count` seconds,
//! capped.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use reqwest::Client;
use serde_json::json;
use tokio::sync::RwLock;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::job::{JobEvent, LifecycleListener};

use super::model::Webhook;

const MAX_BACKOFF: Duration = Duration::from_secs(60);

/// Delivers job lifecycle events to every enabled, subscribed webhook.
/// Delivery happens on spawned tasks so a slow or unreachable endpoint
/// never blocks the worker that produced the event.
pub struct WebhookNotifier {
    client: Client,
    webhooks: RwLock<Vec<Webhook>>,
}

impl WebhookNotifier {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            webhooks: RwLock::new(Vec::new()),
        }
    }

    pub async fn register(&self, webhook: Webhook) {
        self.webhooks.write().await.push(webhook);
    }

    pub async fn unregister(&self, id: Uuid) {
        self.webhooks.write().await.retain(|w| w.id != id);
    }

    pub async fn list(&self) -> Vec<Webhook> {
        self.webhooks.read().await.clone()
    }

    async fn deliver_with_retry(client: Client, webhook: Webhook, body: serde_json::Value) {
        let mut attempt = 0u32;
        loop {
            let mut req = client.post(&webhook.url).json(&body);
            for (key, value) in &webhook.headers {
                req = req.header(key, value);
            }
            let result = req.send().await;
            match result {
                Ok(resp) if resp.status().is_success() => {
                    debug!(url = %webhook.url, "webhook delivered");
                    return;
                }
                Ok(resp) => {
                    warn!(url = %webhook.url, status = %resp.status(), "webhook rejected");
                }
                Err(e) => {
                    warn!(url = %webhook.url, error = %e, "webhook delivery failed");
                }
            }

            attempt += 1;
            if attempt >= webhook.max_retries {
                warn!(url = %webhook.url, attempt, "webhook delivery exhausted retries");
                return;
            }
            let backoff = Duration::from_secs(2u64.saturating_pow(attempt)).min(MAX_BACKOFF);
            tokio::time::sleep(backoff).await;
        }
    }
}

#[async_trait]
impl LifecycleListener for WebhookNotifier {
    async fn on_event(&self, event: JobEvent) {
        let name = event.name();
        let body = json!({
            "event": name,
            "job_id": event.job_id(),
            "data": event,
            "timestamp": Utc::now(),
        });

        let subscribers: Vec<Webhook> = self
            .webhooks
            .read()
            .await
            .iter()
            .filter(|w| w.subscribes_to(name))
            .cloned()
            .collect();

        for webhook in subscribers {
            let client = self.client.clone();
            let body = body.clone();
            tokio::spawn(async move {
                Self::deliver_with_retry(client, webhook, body).await;
            });
        }
    }
}
