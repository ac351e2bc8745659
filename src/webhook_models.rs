use crate::validation::canonical_whatsapp_phone;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const EVENT_MESSAGES_UPSERT: &str = "messages.upsert";

/// Gateway webhook envelope.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GatewayWebhook {
    pub event: String,
    #[serde(default)]
    pub instance: Option<String>,
    /// Message object, or an array of them for batched deliveries.
    #[serde(default)]
    pub data: Value,
}

impl GatewayWebhook {
    /// Event name in dotted lowercase; `MESSAGES_UPSERT` becomes `messages.upsert`.
    pub fn event_name(&self) -> String {
        self.event.trim().to_lowercase().replace('_', ".")
    }

    pub fn is_message_upsert(&self) -> bool {
        self.event_name() == EVENT_MESSAGES_UPSERT
    }

    /// Every message object carried by the event.
    pub fn message_items(&self) -> Vec<&Value> {
        match &self.data {
            Value::Array(items) => items.iter().collect(),
            Value::Object(_) => vec![&self.data],
            _ => Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MessageKey {
    remote_jid: String,
    #[serde(default)]
    from_me: bool,
    id: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MessageData {
    key: MessageKey,
    push_name: Option<String>,
    #[serde(default)]
    message: Value,
    message_type: Option<String>,
    message_timestamp: Option<Value>,
}

/// Why an inbound item is not routed to the bot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    FromMe,
    NotAContact,
    Malformed(String),
}

/// A chat message from a contact, ready for routing.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InboundMessage {
    pub message_id: String,
    /// Canonical phone (digits, ninth digit restored).
    pub telefone: String,
    pub push_name: Option<String>,
    pub text: Option<String>,
    pub media_type: Option<String>,
    pub timestamp: Option<i64>,
}

const MEDIA_KEYS: &[&str] = &[
    "imageMessage",
    "videoMessage",
    "audioMessage",
    "documentMessage",
    "stickerMessage",
    "locationMessage",
    "contactMessage",
];

fn non_empty(value: Option<&Value>) -> Option<String> {
    value
        .and_then(|v| v.as_str())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn extract_text(message: &Value) -> Option<String> {
    non_empty(message.get("conversation"))
        .or_else(|| non_empty(message.pointer("/extendedTextMessage/text")))
        .or_else(|| non_empty(message.pointer("/imageMessage/caption")))
        .or_else(|| non_empty(message.pointer("/videoMessage/caption")))
        .or_else(|| non_empty(message.pointer("/documentMessage/caption")))
        .or_else(|| non_empty(message.pointer("/buttonsResponseMessage/selectedDisplayText")))
        .or_else(|| non_empty(message.pointer("/listResponseMessage/title")))
}

fn extract_media_type(message: &Value, message_type: Option<&str>) -> Option<String> {
    MEDIA_KEYS
        .iter()
        .find(|key| message.get(**key).is_some())
        .map(|key| key.trim_end_matches("Message").to_string())
        .or_else(|| {
            message_type
                .filter(|t| *t != "conversation" && *t != "extendedTextMessage")
                .map(|t| t.trim_end_matches("Message").to_string())
        })
}

fn parse_timestamp(value: Option<&Value>) -> Option<i64> {
    match value? {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

impl InboundMessage {
    pub fn from_data(data: &Value) -> Result<Self, SkipReason> {
        let parsed: MessageData = serde_json::from_value(data.clone())
            .map_err(|e| SkipReason::Malformed(e.to_string()))?;

        if parsed.key.from_me {
            return Err(SkipReason::FromMe);
        }

        let telefone =
            canonical_whatsapp_phone(&parsed.key.remote_jid).ok_or(SkipReason::NotAContact)?;

        let text = extract_text(&parsed.message);
        let media_type = if text.is_none() {
            extract_media_type(&parsed.message, parsed.message_type.as_deref())
        } else {
            None
        };

        Ok(Self {
            message_id: parsed.key.id,
            telefone,
            push_name: parsed
                .push_name
                .map(|n| n.trim().to_string())
                .filter(|n| !n.is_empty()),
            text,
            media_type,
            timestamp: parse_timestamp(parsed.message_timestamp.as_ref()),
        })
    }

    /// Text stored in the chat log.
    pub fn log_content(&self) -> String {
        match (&self.text, &self.media_type) {
            (Some(text), _) => text.clone(),
            (None, Some(media)) => format!("[midia:{}]", media),
            (None, None) => "[midia:desconhecida]".to_string(),
        }
    }

    /// Only messages with text get a bot reply.
    pub fn is_answerable(&self) -> bool {
        self.text.is_some()
    }
}

/// Response of the WhatsApp webhook.
#[derive(Debug, Serialize, Deserialize)]
pub struct WebhookResponse {
    pub status: String,
    pub event: String,
    pub received: usize,
    pub routed: usize,
    pub skipped: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn upsert(data: Value) -> GatewayWebhook {
        serde_json::from_value(json!({
            "event": "messages.upsert",
            "instance": "crm",
            "data": data
        }))
        .unwrap()
    }

    #[test]
    fn test_text_message() {
        let hook = upsert(json!({
            "key": {"remoteJid": "551187654321@s.whatsapp.net", "fromMe": false, "id": "ABC1"},
            "pushName": "Maria ",
            "message": {"conversation": "Quero regularizar meu MEI"},
            "messageType": "conversation",
            "messageTimestamp": 1717000000
        }));
        assert!(hook.is_message_upsert());

        let msg = InboundMessage::from_data(hook.message_items()[0]).unwrap();
        assert_eq!(msg.telefone, "5511987654321");
        assert_eq!(msg.push_name.as_deref(), Some("Maria"));
        assert_eq!(msg.text.as_deref(), Some("Quero regularizar meu MEI"));
        assert_eq!(msg.timestamp, Some(1717000000));
        assert!(msg.is_answerable());
    }

    #[test]
    fn test_extended_text_and_uppercase_event() {
        let hook: GatewayWebhook = serde_json::from_value(json!({
            "event": "MESSAGES_UPSERT",
            "data": [{
                "key": {"remoteJid": "5511987654321@s.whatsapp.net", "id": "X"},
                "message": {"extendedTextMessage": {"text": "oi"}},
                "messageTimestamp": "1717000001"
            }]
        }))
        .unwrap();
        assert!(hook.is_message_upsert());
        let msg = InboundMessage::from_data(hook.message_items()[0]).unwrap();
        assert_eq!(msg.text.as_deref(), Some("oi"));
        assert_eq!(msg.timestamp, Some(1717000001));
    }

    #[test]
    fn test_media_without_caption() {
        let msg = InboundMessage::from_data(&json!({
            "key": {"remoteJid": "5511987654321@s.whatsapp.net", "id": "M1"},
            "message": {"audioMessage": {"seconds": 12}},
            "messageType": "audioMessage"
        }))
        .unwrap();
        assert_eq!(msg.media_type.as_deref(), Some("audio"));
        assert_eq!(msg.log_content(), "[midia:audio]");
        assert!(!msg.is_answerable());
    }

    #[test]
    fn test_image_caption_is_text() {
        let msg = InboundMessage::from_data(&json!({
            "key": {"remoteJid": "5511987654321@s.whatsapp.net", "id": "M2"},
            "message": {"imageMessage": {"caption": "minha guia do DAS"}}
        }))
        .unwrap();
        assert_eq!(msg.text.as_deref(), Some("minha guia do DAS"));
        assert_eq!(msg.media_type, None);
    }

    #[test]
    fn test_skips() {
        let from_me = json!({
            "key": {"remoteJid": "5511987654321@s.whatsapp.net", "fromMe": true, "id": "1"},
            "message": {"conversation": "eco"}
        });
        assert_eq!(InboundMessage::from_data(&from_me), Err(SkipReason::FromMe));

        let group = json!({
            "key": {"remoteJid": "120363025@g.us", "id": "2"},
            "message": {"conversation": "grupo"}
        });
        assert_eq!(InboundMessage::from_data(&group), Err(SkipReason::NotAContact));

        assert!(matches!(
            InboundMessage::from_data(&json!({"message": {}})),
            Err(SkipReason::Malformed(_))
        ));
    }

    #[test]
    fn test_non_message_event() {
        let hook: GatewayWebhook =
            serde_json::from_value(json!({"event": "connection.update", "data": {"state": "open"}}))
                .unwrap();
        assert!(!hook.is_message_upsert());
        assert_eq!(hook.event_name(), "connection.update");
    }
}
