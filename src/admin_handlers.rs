use crate::cache_validator::{lookup_key, ValidatedCacheEntry};
use crate::errors::AppError;
use crate::handlers::AppState;
use crate::models::*;
use crate::qualification::LeadStatus;
use crate::realtime::{RealtimeEvent, EVENT_LEAD_UPDATED, EVENT_MESSAGE_SENT};
use crate::serpro_client::{empresarial_from_cnpj, DocumentoTipo, SerproResponse};
use crate::validation::{digits_only, is_valid_cnpj, normalize_uf};
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use uuid::Uuid;

/// GET /api/admin/dashboard
pub async fn dashboard(State(state): State<Arc<AppState>>) -> Result<Json<DashboardStats>, AppError> {
    Ok(Json(state.storage.dashboard_stats().await?))
}

/// GET /api/admin/leads
pub async fn list_leads(
    State(state): State<Arc<AppState>>,
    Query(query): Query<LeadListQuery>,
) -> Result<Json<LeadListResponse>, AppError> {
    let (page, per_page) = query.pagination();
    let (leads, total) = state.storage.list_leads(&query).await?;
    tracing::debug!("Listing leads page {} ({} of {})", page, leads.len(), total);

    Ok(Json(LeadListResponse {
        leads,
        total,
        page,
        per_page,
    }))
}

/// GET /api/admin/leads/:id
pub async fn get_lead(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<LeadFull>, AppError> {
    state
        .storage
        .get_lead_full(id)
        .await?
        .map(Json)
        .ok_or_else(|| AppError::NotFound(format!("Lead {} not found", id)))
}

/// Normalizes document and state fields of an admin edit, rejecting invalid ones.
fn clean_empresarial(mut empresarial: EmpresarialUpdate) -> Result<EmpresarialUpdate, AppError> {
    empresarial.cnpj = empresarial
        .cnpj
        .map(|c| digits_only(&c))
        .filter(|c| !c.is_empty());
    if let Some(cnpj) = &empresarial.cnpj {
        if !is_valid_cnpj(cnpj) {
            return Err(AppError::BadRequest(format!("CNPJ inválido: {}", cnpj)));
        }
    }

    empresarial.uf = match empresarial.uf.as_deref().map(str::trim) {
        None | Some("") => None,
        Some(raw) => Some(
            normalize_uf(raw).ok_or_else(|| AppError::BadRequest(format!("UF inválida: {}", raw)))?,
        ),
    };

    Ok(empresarial)
}

/// Validates the status of an admin edit. The tier is derived, never written directly.
fn clean_qualificacao(mut qualificacao: QualificacaoUpdate) -> Result<QualificacaoUpdate, AppError> {
    if let Some(status) = &qualificacao.status {
        status.parse::<LeadStatus>().map_err(AppError::BadRequest)?;
    }
    qualificacao.status = qualificacao.status.map(|s| s.trim().to_lowercase());
    qualificacao.tier = None;
    Ok(qualificacao)
}

/// PATCH /api/admin/leads/:id
///
/// Applies each section present in the body, then reclassifies the tier.
pub async fn update_lead(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(body): Json<UpdateLeadRequest>,
) -> Result<Json<LeadFull>, AppError> {
    if state.storage.get_lead_full(id).await?.is_none() {
        return Err(AppError::NotFound(format!("Lead {} not found", id)));
    }

    if let Some(lead) = &body.lead {
        state.storage.update_lead(id, lead).await?;
    }
    let empresarial = body.empresarial.clone().map(clean_empresarial).transpose()?;
    let qualificacao = body.qualificacao.clone().map(clean_qualificacao).transpose()?;

    if let Some(empresarial) = &empresarial {
        state.storage.upsert_empresarial(id, empresarial).await?;
    }
    if let Some(qualificacao) = &qualificacao {
        state.storage.upsert_qualificacao(id, qualificacao).await?;
    }
    if let Some(financeiro) = &body.financeiro {
        state.storage.upsert_financeiro(id, financeiro).await?;
    }
    if let Some(vendas) = &body.vendas {
        state.storage.upsert_vendas(id, vendas).await?;
    }
    if let Some(atendimento) = &body.atendimento {
        state.storage.upsert_atendimento(id, atendimento).await?;
    }

    state
        .storage
        .refresh_tier(id, state.config.icp_min_divida)
        .await?;

    let lead = state
        .storage
        .get_lead_full(id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Lead {} not found", id)))?;

    state.publish(
        RealtimeEvent::new(EVENT_LEAD_UPDATED, json!({"lead_id": id, "origem": "admin"}))
            .with_phone(&lead.lead.telefone)
            .with_lead(id),
    );

    Ok(Json(lead))
}

/// DELETE /api/admin/leads/:id
pub async fn delete_lead(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, AppError> {
    if state.storage.delete_lead(id).await? {
        tracing::info!("Deleted lead {}", id);
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(AppError::NotFound(format!("Lead {} not found", id)))
    }
}

#[derive(Debug, Deserialize)]
pub struct ChatQuery {
    pub limit: Option<i64>,
}

/// GET /api/admin/leads/:id/chat
pub async fn lead_chat(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Query(query): Query<ChatQuery>,
) -> Result<Json<Vec<ChatHistoryEntry>>, AppError> {
    let lead = state
        .storage
        .get_lead_full(id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Lead {} not found", id)))?;

    let limit = query.limit.unwrap_or(200).clamp(1, 1000);
    let history = state.storage.recent_chat(&lead.lead.telefone, limit).await?;
    Ok(Json(history))
}

#[derive(Debug, Deserialize)]
pub struct ManualMessageRequest {
    pub texto: String,
    /// Pause the bot for this lead after sending.
    #[serde(default)]
    pub pausar_bot: bool,
}

/// POST /api/admin/leads/:id/mensagem
pub async fn send_manual_message(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(body): Json<ManualMessageRequest>,
) -> Result<Json<ChatHistoryEntry>, AppError> {
    let texto = body.texto.trim();
    if texto.is_empty() {
        return Err(AppError::BadRequest("Mensagem vazia".to_string()));
    }

    let lead = state
        .storage
        .get_lead_full(id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Lead {} not found", id)))?;
    let telefone = lead.lead.telefone.as_str();

    let message_id = state.gateway.send_text(telefone, texto).await?;
    let entry = state
        .storage
        .append_chat(&NewChatEntry {
            telefone,
            lead_id: Some(id),
            role: "admin",
            conteudo: texto,
            message_id: message_id.as_deref(),
        })
        .await?;
    state.storage.touch_ultimo_contato(id).await?;

    if body.pausar_bot {
        state
            .storage
            .upsert_atendimento(
                id,
                &AtendimentoUpdate {
                    bot_pausado: Some(true),
                    ..Default::default()
                },
            )
            .await?;
    }

    state.publish(
        RealtimeEvent::new(
            EVENT_MESSAGE_SENT,
            json!({"message_id": message_id, "conteudo": texto, "agente": "admin"}),
        )
        .with_phone(telefone)
        .with_lead(id),
    );

    Ok(Json(entry))
}

#[derive(Debug, Deserialize)]
pub struct SerproQuery {
    pub lead_id: Option<Uuid>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SerproLookup {
    pub tipo: DocumentoTipo,
    pub documento: String,
    pub cached: bool,
    pub status_http: u16,
    pub dados: Value,
}

/// Cached Serpro lookup. Real calls are logged to `consultas_serpro` and, for a
/// lead, stamp the lookup time; CNPJ answers fill empty company fields.
async fn run_serpro_lookup(
    state: &AppState,
    tipo: DocumentoTipo,
    raw: &str,
    lead_id: Option<Uuid>,
) -> Result<SerproLookup, AppError> {
    let serpro = state
        .serpro
        .as_ref()
        .ok_or_else(|| AppError::ServiceUnavailable("Serpro is not configured".to_string()))?;
    let documento = tipo.normalize(raw)?;
    let cache_key = lookup_key(tipo.as_str(), &documento);

    if let Some(sealed) = state.serpro_cache.get(&cache_key).await {
        if let Some(cached) = ValidatedCacheEntry::open::<SerproResponse>(&sealed) {
            tracing::debug!("Serpro cache HIT (validated) for {}", cache_key);
            return Ok(SerproLookup {
                tipo,
                documento,
                cached: true,
                status_http: cached.status_http,
                dados: cached.dados,
            });
        }
        tracing::warn!("Serpro cache entry for {} failed validation, refetching", cache_key);
    }

    let response = serpro.consultar_documento(tipo, &documento).await?;

    state
        .storage
        .insert_consulta_serpro(
            lead_id,
            tipo.as_str(),
            &documento,
            i32::from(response.status_http),
            Some(&response.dados),
        )
        .await?;

    if response.is_success() {
        if let Some(sealed) = ValidatedCacheEntry::seal(&response) {
            state.serpro_cache.insert(cache_key, sealed).await;
        }
    }

    if let Some(lead_id) = lead_id {
        state.storage.set_ultima_consulta(lead_id).await?;
        if response.is_success() && tipo == DocumentoTipo::Cnpj {
            state
                .storage
                .fill_empresarial(lead_id, &empresarial_from_cnpj(&response.dados))
                .await?;
        }
    }

    Ok(SerproLookup {
        tipo,
        documento,
        cached: false,
        status_http: response.status_http,
        dados: response.dados,
    })
}

async fn ensure_lead(state: &AppState, lead_id: Option<Uuid>) -> Result<(), AppError> {
    if let Some(id) = lead_id {
        if state.storage.get_lead_full(id).await?.is_none() {
            return Err(AppError::NotFound(format!("Lead {} not found", id)));
        }
    }
    Ok(())
}

/// POST /api/admin/serpro/cnpj/:cnpj
pub async fn serpro_cnpj(
    State(state): State<Arc<AppState>>,
    Path(cnpj): Path<String>,
    Query(query): Query<SerproQuery>,
) -> Result<Json<SerproLookup>, AppError> {
    ensure_lead(&state, query.lead_id).await?;
    let lookup = run_serpro_lookup(&state, DocumentoTipo::Cnpj, &cnpj, query.lead_id).await?;
    Ok(Json(lookup))
}

/// POST /api/admin/serpro/cpf/:cpf
pub async fn serpro_cpf(
    State(state): State<Arc<AppState>>,
    Path(cpf): Path<String>,
    Query(query): Query<SerproQuery>,
) -> Result<Json<SerproLookup>, AppError> {
    ensure_lead(&state, query.lead_id).await?;
    let lookup = run_serpro_lookup(&state, DocumentoTipo::Cpf, &cpf, query.lead_id).await?;
    Ok(Json(lookup))
}

/// GET /api/admin/serpro/consultas
pub async fn serpro_consultas(
    State(state): State<Arc<AppState>>,
    Query(query): Query<SerproQuery>,
) -> Result<Json<Vec<ConsultaSerpro>>, AppError> {
    let rows = state
        .storage
        .list_consultas_serpro(query.lead_id, 100)
        .await?;
    Ok(Json(rows))
}

/// GET /api/admin/gateway/status
pub async fn gateway_status(State(state): State<Arc<AppState>>) -> Json<Value> {
    match state.gateway.connection_state().await {
        Ok(connection) => Json(json!({"connected": connection == "open", "state": connection})),
        Err(e) => {
            tracing::warn!("Gateway status check failed: {}", e);
            Json(json!({"connected": false, "state": "unreachable"}))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clean_empresarial_normalizes_and_rejects() {
        let cleaned = clean_empresarial(EmpresarialUpdate {
            cnpj: Some("11.222.333/0001-81".to_string()),
            uf: Some(" mg ".to_string()),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(cleaned.cnpj.as_deref(), Some("11222333000181"));
        assert_eq!(cleaned.uf.as_deref(), Some("MG"));

        let bad_uf = clean_empresarial(EmpresarialUpdate {
            uf: Some("Sao Paulo".to_string()),
            ..Default::default()
        });
        assert!(matches!(bad_uf, Err(AppError::BadRequest(msg)) if msg.contains("UF")));

        let bad_cnpj = clean_empresarial(EmpresarialUpdate {
            cnpj: Some("11.222.333/0001-00".to_string()),
            ..Default::default()
        });
        assert!(matches!(bad_cnpj, Err(AppError::BadRequest(_))));

        let blank = clean_empresarial(EmpresarialUpdate {
            cnpj: Some("  ".to_string()),
            uf: Some("".to_string()),
            ..Default::default()
        })
        .unwrap();
        assert!(blank.cnpj.is_none() && blank.uf.is_none());
    }

    #[test]
    fn test_clean_qualificacao_drops_tier() {
        let body: UpdateLeadRequest = serde_json::from_value(json!({
            "qualificacao": {"status": " Qualificado ", "tier": "SQL", "score": 80}
        }))
        .unwrap();
        let cleaned = clean_qualificacao(body.qualificacao.unwrap()).unwrap();
        assert_eq!(cleaned.tier, None);
        assert_eq!(cleaned.status.as_deref(), Some("qualificado"));
        assert_eq!(cleaned.score, Some(80));

        let bad = clean_qualificacao(QualificacaoUpdate {
            status: Some("sumido".to_string()),
            ..Default::default()
        });
        assert!(matches!(bad, Err(AppError::BadRequest(_))));
    }
}
