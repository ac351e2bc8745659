use crate::errors::AppError;
use serde_json::json;
use std::time::Duration;

/// Client for the WhatsApp gateway (Evolution-style REST API).
#[derive(Clone)]
pub struct WhatsAppGatewayClient {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    instance: String,
}

impl WhatsAppGatewayClient {
    /// Creates a new `WhatsAppGatewayClient`.
    ///
    /// # Arguments
    ///
    /// * `base_url` - The gateway base URL, without trailing slash.
    /// * `api_key` - Sent in the `apikey` header.
    /// * `instance` - The connected WhatsApp instance name.
    pub fn new(base_url: String, api_key: String, instance: String) -> Result<Self, AppError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| {
                AppError::ExternalApiError(format!("Failed to create gateway client: {}", e))
            })?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            instance,
        })
    }

    /// Sends a text message.
    ///
    /// # Arguments
    ///
    /// * `phone` - Recipient phone, digits only with country code.
    /// * `text` - Message body.
    ///
    /// # Returns
    ///
    /// * `Result<Option<String>, AppError>` - The gateway message id, when the gateway returns one.
    pub async fn send_text(&self, phone: &str, text: &str) -> Result<Option<String>, AppError> {
        if text.trim().is_empty() {
            return Err(AppError::BadRequest("Refusing to send an empty message".to_string()));
        }

        let url = format!("{}/message/sendText/{}", self.base_url, self.instance);
        tracing::info!("Sending WhatsApp message to {} ({} chars)", phone, text.len());

        let body = json!({
            "number": phone,
            "text": text
        });

        let response = self
            .client
            .post(&url)
            .header("apikey", &self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| AppError::ExternalApiError(format!("Gateway request failed: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(AppError::ExternalApiError(format!(
                "Gateway send failed {}: {}",
                status, error_text
            )));
        }

        // Some gateway versions answer with an empty body
        let response_data: serde_json::Value = response.json().await.unwrap_or_default();
        let message_id = response_data
            .get("key")
            .and_then(|k| k.get("id"))
            .or_else(|| response_data.get("id"))
            .or_else(|| response_data.get("messageId"))
            .and_then(|id| id.as_str())
            .map(str::to_string);

        tracing::info!("✓ Message sent to {} (id: {:?})", phone, message_id);
        Ok(message_id)
    }

    /// Checks the connection state of the instance.
    pub async fn connection_state(&self) -> Result<String, AppError> {
        let url = format!(
            "{}/instance/connectionState/{}",
            self.base_url, self.instance
        );

        let response = self
            .client
            .get(&url)
            .header("apikey", &self.api_key)
            .send()
            .await
            .map_err(|e| AppError::ExternalApiError(format!("Gateway request failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(AppError::ExternalApiError(format!(
                "Gateway returned {} for connection state",
                response.status()
            )));
        }

        let data: serde_json::Value = response.json().await.map_err(|e| {
            AppError::ExternalApiError(format!("Failed to parse gateway response: {}", e))
        })?;

        Ok(data
            .get("instance")
            .and_then(|i| i.get("state"))
            .or_else(|| data.get("state"))
            .and_then(|s| s.as_str())
            .unwrap_or("unknown")
            .to_string())
    }
}
