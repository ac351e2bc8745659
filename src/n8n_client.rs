use crate::errors::AppError;
use chrono::Utc;
use serde_json::{json, Value};
use std::time::Duration;

/// Forwards CRM events to an n8n webhook.
#[derive(Clone)]
pub struct N8nForwarder {
    client: reqwest::Client,
    webhook_url: String,
}

impl N8nForwarder {
    pub fn new(webhook_url: String) -> Result<Self, AppError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| AppError::ExternalApiError(format!("Failed to create n8n client: {}", e)))?;

        Ok(Self {
            client,
            webhook_url,
        })
    }

    /// Posts `{event, payload, sent_at}` to the webhook.
    pub async fn forward(&self, event: &str, payload: &Value) -> Result<(), AppError> {
        let body = json!({
            "event": event,
            "payload": payload,
            "sent_at": Utc::now().to_rfc3339(),
        });

        let response = self
            .client
            .post(&self.webhook_url)
            .json(&body)
            .send()
            .await
            .map_err(|e| AppError::ExternalApiError(format!("n8n request failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(AppError::ExternalApiError(format!(
                "n8n returned {} for {}",
                response.status(),
                event
            )));
        }

        tracing::debug!("Forwarded '{}' to n8n", event);
        Ok(())
    }

    /// Fire-and-forget variant used from request handlers.
    pub fn spawn_forward(&self, event: &'static str, payload: Value) {
        let forwarder = self.clone();
        tokio::spawn(async move {
            if let Err(e) = forwarder.forward(event, &payload).await {
                tracing::warn!("n8n forward of '{}' failed: {}", event, e);
            }
        });
    }
}
