//! Alert delivery.

use async_trait::async_trait;
use log::{error, warn};
use serde::Serialize;

#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn emit(&self, message: &str);
}

/// Writes alerts to the log only.
pub struct LogAlerts;

#[async_trait]
impl AlertSink for LogAlerts {
    async fn emit(&self, message: &str) {
        warn!("ALERT: {}", message);
    }
}

#[derive(Serialize)]
struct WebhookBody<'a> {
    text: &'a str,
}

/// Posts alerts as `{"text": ...}` to a webhook, logging them as well.
pub struct WebhookAlerts {
    client: reqwest::Client,
    url: String,
}

impl WebhookAlerts {
    pub fn new(client: reqwest::Client, url: String) -> Self {
        Self { client, url }
    }
}

#[async_trait]
impl AlertSink for WebhookAlerts {
    async fn emit(&self, message: &str) {
        LogAlerts.emit(message).await;
        let result = self
            .client
            .post(&self.url)
            .json(&WebhookBody { text: message })
            .send()
            .await
            .and_then(|r| r.error_for_status());
        if let Err(e) = result {
            error!("Failed to deliver alert to webhook: {}", e);
        }
    }
}
