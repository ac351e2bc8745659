use crate::agents::{self, AgentContext, AgentKind, FALLBACK_REPLY};
use crate::auth::{check_header_secret, WEBHOOK_TOKEN_HEADER};
use crate::errors::AppError;
use crate::handlers::AppState;
use crate::models::{LeadFull, NewChatEntry, NewLead, QualificacaoUpdate};
use crate::qualification::{lead_state, LeadStatus};
use crate::realtime::{
    RealtimeEvent, EVENT_GATEWAY, EVENT_LEAD_CREATED, EVENT_MESSAGE_RECEIVED, EVENT_MESSAGE_SENT,
};
use crate::webhook_models::{GatewayWebhook, InboundMessage, SkipReason, WebhookResponse};
use axum::{extract::State, http::HeaderMap, Json};
use chrono::Utc;
use moka::future::Cache;
use serde_json::json;
use std::sync::Arc;

/// WhatsApp gateway webhook.
///
/// Every event is republished to the realtime channel. Only `messages.upsert`
/// is routed: the message is logged against the lead and, unless a human took
/// over, answered by the agent for the lead's state in a background task.
///
/// Authentication: X-Webhook-Token header must match WEBHOOK_SECRET when set.
pub async fn whatsapp_webhook(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(hook): Json<GatewayWebhook>,
) -> Result<Json<WebhookResponse>, AppError> {
    check_header_secret(
        &headers,
        WEBHOOK_TOKEN_HEADER,
        state.config.webhook_secret.as_deref(),
    )?;

    let event = hook.event_name();
    tracing::debug!("Gateway event '{}' from {:?}", event, hook.instance);

    state.publish(RealtimeEvent::new(
        EVENT_GATEWAY,
        json!({"event": event, "instance": hook.instance, "data": hook.data}),
    ));

    if !hook.is_message_upsert() {
        return Ok(Json(WebhookResponse {
            status: "ignored".to_string(),
            event,
            received: 0,
            routed: 0,
            skipped: 0,
        }));
    }

    let items = hook.message_items();
    let received = items.len();
    let mut routed = 0;
    let mut skipped = 0;

    for item in items {
        let message = match InboundMessage::from_data(item) {
            Ok(message) => message,
            Err(SkipReason::Malformed(e)) => {
                tracing::warn!("Skipping malformed gateway message: {}", e);
                skipped += 1;
                continue;
            }
            Err(reason) => {
                tracing::debug!("Skipping gateway message: {:?}", reason);
                skipped += 1;
                continue;
            }
        };

        if !claim_message(&state.processed_messages, &message.message_id).await {
            tracing::debug!("Duplicate gateway message {}", message.message_id);
            skipped += 1;
            continue;
        }

        let message_id = message.message_id.clone();
        match route_inbound(&state, message).await {
            Ok(()) => routed += 1,
            Err(e) => {
                tracing::error!("Failed to route inbound message {}: {}", message_id, e);
                // A gateway retry of this id must be routed again
                release_message(&state.processed_messages, &message_id).await;
                skipped += 1;
            }
        }
    }

    tracing::info!(
        "WhatsApp webhook: {} received, {} routed, {} skipped",
        received,
        routed,
        skipped
    );

    Ok(Json(WebhookResponse {
        status: "received".to_string(),
        event,
        received,
        routed,
        skipped,
    }))
}

/// Marks a gateway message id as seen. False when it already was.
async fn claim_message(seen: &Cache<String, i64>, message_id: &str) -> bool {
    seen.entry(message_id.to_string())
        .or_insert(Utc::now().timestamp())
        .await
        .is_fresh()
}

async fn release_message(seen: &Cache<String, i64>, message_id: &str) {
    seen.invalidate(message_id).await;
}

/// Why an inbound message gets no bot reply, if it gets none.
fn reply_skip_reason(message: &InboundMessage, lead: &LeadFull) -> Option<&'static str> {
    if !message.is_answerable() {
        Some("media without text")
    } else if lead.atendimento.as_ref().is_some_and(|a| a.bot_pausado) {
        Some("bot paused, leaving message to a human")
    } else {
        None
    }
}

/// Logs an inbound message and schedules the bot reply.
async fn route_inbound(state: &Arc<AppState>, message: InboundMessage) -> Result<(), AppError> {
    let telefone = message.telefone.as_str();
    let lead_id = match state.storage.find_by_phone(telefone).await? {
        Some(lead) => lead.id,
        None => {
            let lead_id = state
                .storage
                .upsert_lead(&NewLead {
                    telefone: telefone.to_string(),
                    nome: message.push_name.clone(),
                    email: None,
                    origem: Some("whatsapp".to_string()),
                })
                .await?;
            state
                .storage
                .upsert_qualificacao(lead_id, &QualificacaoUpdate::default())
                .await?;

            tracing::info!("New lead {} from WhatsApp ({})", lead_id, telefone);
            let payload = json!({"lead_id": lead_id, "nome": message.push_name, "origem": "whatsapp"});
            state.publish(
                RealtimeEvent::new(EVENT_LEAD_CREATED, payload.clone())
                    .with_phone(telefone)
                    .with_lead(lead_id),
            );
            state.forward_n8n(EVENT_LEAD_CREATED, payload);
            lead_id
        }
    };

    let conteudo = message.log_content();
    state
        .storage
        .append_chat(&NewChatEntry {
            telefone,
            lead_id: Some(lead_id),
            role: "user",
            conteudo: &conteudo,
            message_id: Some(&message.message_id),
        })
        .await?;
    state.storage.touch_ultimo_contato(lead_id).await?;

    let payload = json!({
        "message_id": message.message_id,
        "conteudo": conteudo,
        "push_name": message.push_name,
        "media_type": message.media_type,
    });
    state.publish(
        RealtimeEvent::new(EVENT_MESSAGE_RECEIVED, payload.clone())
            .with_phone(telefone)
            .with_lead(lead_id),
    );
    state.forward_n8n(EVENT_MESSAGE_RECEIVED, payload);

    let lead = state
        .storage
        .get_lead_full(lead_id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Lead {} vanished", lead_id)))?;

    if let Some(reason) = reply_skip_reason(&message, &lead) {
        tracing::info!("No bot reply for lead {}: {}", lead_id, reason);
        return Ok(());
    }

    let text = message.text.unwrap_or_default();
    spawn_agent_reply(state.clone(), lead, text, message.message_id);
    Ok(())
}

fn spawn_agent_reply(state: Arc<AppState>, lead: LeadFull, text: String, message_id: String) {
    tokio::spawn(async move {
        let lead_id = lead.lead.id;
        if let Err(e) = reply_to_lead(&state, &lead, &text, &message_id).await {
            tracing::error!("Agent reply to lead {} failed: {}", lead_id, e);
        }
    });
}

async fn reply_to_lead(
    state: &AppState,
    lead: &LeadFull,
    text: &str,
    message_id: &str,
) -> Result<(), AppError> {
    let lead_id = lead.lead.id;
    let telefone = lead.lead.telefone.as_str();
    let kind = AgentKind::for_state(lead_state(lead));

    let mut history = state
        .storage
        .recent_chat(telefone, state.config.chat_history_limit)
        .await?;
    history.retain(|entry| entry.message_id.as_deref() != Some(message_id));

    let reply = match &state.llm {
        Some(llm) => {
            let ctx = AgentContext::from_lead(lead);
            match agents::respond(llm, kind, &ctx, &history, text).await {
                Ok(reply) => reply,
                Err(e) => {
                    tracing::warn!("LLM failed for lead {}, using fallback: {}", lead_id, e);
                    FALLBACK_REPLY.to_string()
                }
            }
        }
        None => FALLBACK_REPLY.to_string(),
    };

    let sent_id = state.gateway.send_text(telefone, &reply).await?;

    state
        .storage
        .append_chat(&NewChatEntry {
            telefone,
            lead_id: Some(lead_id),
            role: "assistant",
            conteudo: &reply,
            message_id: sent_id.as_deref(),
        })
        .await?;

    let is_new = lead
        .qualificacao
        .as_ref()
        .map(|q| q.status == LeadStatus::Novo.as_str())
        .unwrap_or(true);
    if is_new {
        state
            .storage
            .upsert_qualificacao(
                lead_id,
                &QualificacaoUpdate {
                    status: Some(LeadStatus::EmAtendimento.as_str().to_string()),
                    ..Default::default()
                },
            )
            .await?;
    }

    state.publish(
        RealtimeEvent::new(
            EVENT_MESSAGE_SENT,
            json!({"message_id": sent_id, "conteudo": reply, "agente": kind.as_str()}),
        )
        .with_phone(telefone)
        .with_lead(lead_id),
    );

    tracing::info!("✓ Agent '{}' answered lead {}", kind.as_str(), lead_id);
    Ok(())
}
