//! Realtime events: the API publishes them on a Redis channel and the
//! `realtime-relay` binary fans them out to admin browser tabs over WebSocket.

use crate::auth::constant_time_compare;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Utc};
use futures::{SinkExt, StreamExt};
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use uuid::Uuid;

pub const EVENT_LEAD_CREATED: &str = "lead.created";
pub const EVENT_LEAD_UPDATED: &str = "lead.updated";
pub const EVENT_MESSAGE_RECEIVED: &str = "message.received";
pub const EVENT_MESSAGE_SENT: &str = "message.sent";
pub const EVENT_DISPARO_PROGRESS: &str = "disparo.progress";
pub const EVENT_GATEWAY: &str = "gateway.event";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RealtimeEvent {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub telefone: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lead_id: Option<Uuid>,
    pub payload: Value,
    pub timestamp: DateTime<Utc>,
}

impl RealtimeEvent {
    pub fn new(kind: &str, payload: Value) -> Self {
        Self {
            kind: kind.to_string(),
            telefone: None,
            lead_id: None,
            payload,
            timestamp: Utc::now(),
        }
    }

    pub fn with_phone(mut self, telefone: &str) -> Self {
        self.telefone = Some(telefone.to_string());
        self
    }

    pub fn with_lead(mut self, lead_id: Uuid) -> Self {
        self.lead_id = Some(lead_id);
        self
    }
}

/// Publishes events on the Redis channel. Disabled when Redis is not configured
/// or unreachable at startup; publish failures are only logged.
#[derive(Clone)]
pub struct RealtimePublisher {
    connection: Option<redis::aio::MultiplexedConnection>,
    channel: String,
}

impl RealtimePublisher {
    pub fn disabled(channel: &str) -> Self {
        Self {
            connection: None,
            channel: channel.to_string(),
        }
    }

    pub async fn connect(redis_url: Option<&str>, channel: &str) -> Self {
        let Some(url) = redis_url else {
            tracing::warn!("REDIS_URL not set - realtime events disabled");
            return Self::disabled(channel);
        };

        let connection = match redis::Client::open(url) {
            Ok(client) => client.get_multiplexed_async_connection().await,
            Err(e) => Err(e),
        };

        match connection {
            Ok(connection) => {
                tracing::info!("✓ Realtime publisher connected (channel: {})", channel);
                Self {
                    connection: Some(connection),
                    channel: channel.to_string(),
                }
            }
            Err(e) => {
                tracing::error!("Redis unavailable, realtime events disabled: {}", e);
                Self::disabled(channel)
            }
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.connection.is_some()
    }

    pub async fn publish(&self, event: &RealtimeEvent) {
        let Some(connection) = &self.connection else {
            return;
        };

        let message = match serde_json::to_string(event) {
            Ok(message) => message,
            Err(e) => {
                tracing::error!("Failed to serialize realtime event: {}", e);
                return;
            }
        };

        let mut connection = connection.clone();
        match connection
            .publish::<_, _, i64>(&self.channel, message)
            .await
        {
            Ok(receivers) => {
                tracing::debug!("Published '{}' to {} subscriber(s)", event.kind, receivers)
            }
            Err(e) => tracing::warn!("Failed to publish '{}': {}", event.kind, e),
        }
    }

    /// Publishes from a background task so callers never wait on Redis.
    pub fn spawn_publish(&self, event: RealtimeEvent) {
        if !self.is_enabled() {
            return;
        }
        let publisher = self.clone();
        tokio::spawn(async move {
            publisher.publish(&event).await;
        });
    }
}

// ============ Relay ============

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub redis_url: String,
    pub channel: String,
    pub port: u16,
    pub token: Option<String>,
}

impl RelayConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let redis_url = std::env::var("REDIS_URL")
            .ok()
            .filter(|s| !s.trim().is_empty())
            .ok_or_else(|| anyhow::anyhow!("REDIS_URL environment variable required"))?;
        if !redis_url.starts_with("redis://") && !redis_url.starts_with("rediss://") {
            anyhow::bail!("REDIS_URL must start with redis:// or rediss://");
        }

        let port = match std::env::var("RELAY_PORT") {
            Ok(raw) => raw
                .parse()
                .map_err(|_| anyhow::anyhow!("RELAY_PORT has an invalid value: {}", raw))?,
            Err(_) => 3001,
        };

        let token = std::env::var("RELAY_TOKEN")
            .ok()
            .filter(|s| !s.trim().is_empty());
        if token.is_none() {
            tracing::warn!("⚠️  RELAY_TOKEN not set - any client can subscribe to events");
        }

        Ok(Self {
            redis_url,
            channel: std::env::var("REALTIME_CHANNEL")
                .ok()
                .filter(|s| !s.trim().is_empty())
                .unwrap_or_else(|| "crm:events".to_string()),
            port,
            token,
        })
    }
}

pub struct RelayState {
    pub tx: broadcast::Sender<String>,
    pub token: Option<String>,
}

impl RelayState {
    pub fn new(token: Option<String>) -> Self {
        let (tx, _) = broadcast::channel(256);
        Self { tx, token }
    }
}

#[derive(Debug, Deserialize)]
pub struct WsParams {
    pub token: Option<String>,
}

pub fn relay_router(state: Arc<RelayState>) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(relay_health))
        .with_state(state)
}

async fn relay_health(State(state): State<Arc<RelayState>>) -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "service": "realtime-relay",
        "clients": state.tx.receiver_count(),
    }))
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<RelayState>>,
    Query(params): Query<WsParams>,
) -> Response {
    if let Some(expected) = &state.token {
        let given = params.token.as_deref().unwrap_or_default();
        if !constant_time_compare(given, expected) {
            tracing::warn!("Rejected WebSocket client with invalid token");
            return (StatusCode::UNAUTHORIZED, "invalid token").into_response();
        }
    }

    let rx = state.tx.subscribe();
    ws.on_upgrade(move |socket| handle_socket(socket, rx))
}

async fn handle_socket(socket: WebSocket, mut rx: broadcast::Receiver<String>) {
    let (mut sender, mut receiver) = socket.split();
    let client_id = Uuid::new_v4();
    tracing::info!("WebSocket client {} connected", client_id);

    let greeting = json!({
        "type": "connected",
        "client_id": client_id,
        "timestamp": Utc::now().to_rfc3339(),
    });
    if sender
        .send(Message::Text(greeting.to_string()))
        .await
        .is_err()
    {
        return;
    }

    loop {
        tokio::select! {
            event = rx.recv() => match event {
                Ok(text) => {
                    if sender.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!("WebSocket client {} lagged, dropped {} events", client_id, n);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            incoming = receiver.next() => match incoming {
                Some(Ok(Message::Text(text))) if text.trim().eq_ignore_ascii_case("ping") => {
                    if sender.send(Message::Text("pong".to_string())).await.is_err() {
                        break;
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Err(e)) => {
                    tracing::debug!("WebSocket client {} error: {}", client_id, e);
                    break;
                }
                Some(Ok(_)) => {}
            },
        }
    }

    tracing::info!("WebSocket client {} disconnected", client_id);
}

/// Subscribes to the channel and forwards every payload to the broadcast
/// channel. Reconnects with a fixed delay whenever the subscription drops.
pub async fn run_redis_subscriber(client: redis::Client, channel: String, tx: broadcast::Sender<String>) {
    loop {
        match subscribe_once(&client, &channel, &tx).await {
            Ok(()) => tracing::warn!("Redis subscription to '{}' ended", channel),
            Err(e) => tracing::error!("Redis subscription error: {}", e),
        }
        tokio::time::sleep(Duration::from_secs(5)).await;
    }
}

async fn subscribe_once(
    client: &redis::Client,
    channel: &str,
    tx: &broadcast::Sender<String>,
) -> redis::RedisResult<()> {
    let mut pubsub = client.get_async_pubsub().await?;
    pubsub.subscribe(channel).await?;
    tracing::info!("✓ Subscribed to Redis channel '{}'", channel);

    let mut messages = pubsub.on_message();
    while let Some(msg) = messages.next().await {
        let payload: String = match msg.get_payload() {
            Ok(payload) => payload,
            Err(e) => {
                tracing::warn!("Skipping non-text payload: {}", e);
                continue;
            }
        };
        // No connected tabs is not an error
        let _ = tx.send(payload);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serialization() {
        let lead_id = Uuid::new_v4();
        let event = RealtimeEvent::new(EVENT_MESSAGE_RECEIVED, json!({"text": "oi"}))
            .with_phone("5511987654321")
            .with_lead(lead_id);

        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "message.received");
        assert_eq!(value["telefone"], "5511987654321");
        assert_eq!(value["lead_id"], lead_id.to_string());
        assert_eq!(value["payload"]["text"], "oi");
    }

    #[test]
    fn test_event_without_phone_omits_field() {
        let value = serde_json::to_value(RealtimeEvent::new(EVENT_GATEWAY, Value::Null)).unwrap();
        assert!(value.get("telefone").is_none());
        assert!(value.get("lead_id").is_none());
    }

    #[tokio::test]
    async fn test_disabled_publisher_is_noop() {
        let publisher = RealtimePublisher::connect(None, "crm:events").await;
        assert!(!publisher.is_enabled());
        publisher
            .publish(&RealtimeEvent::new(EVENT_LEAD_CREATED, Value::Null))
            .await;
    }

    #[test]
    fn test_broadcast_fans_out_to_every_client() {
        let state = RelayState::new(None);
        let mut a = state.tx.subscribe();
        let mut b = state.tx.subscribe();
        state.tx.send("{\"type\":\"lead.created\"}".to_string()).unwrap();
        assert_eq!(a.try_recv().unwrap(), "{\"type\":\"lead.created\"}");
        assert_eq!(b.try_recv().unwrap(), "{\"type\":\"lead.created\"}");
    }
}
