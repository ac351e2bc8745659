use crate::config::Config;
use crate::db_storage::LeadStorage;
use crate::disparos::DisparoStorage;
use crate::errors::AppError;
use crate::gateway_client::WhatsAppGatewayClient;
use crate::llm_client::LlmClient;
use crate::models::*;
use crate::n8n_client::N8nForwarder;
use crate::qualification::{calcular_parcelamento, QualificationTier};
use crate::realtime::{RealtimeEvent, RealtimePublisher, EVENT_LEAD_CREATED, EVENT_LEAD_UPDATED};
use crate::serpro_client::SerproClient;
use crate::validation::{
    digits_only, is_valid_cnpj, is_valid_cpf, is_valid_email, normalize_phone, normalize_uf,
};
use axum::{extract::State, http::StatusCode, Json};
use bigdecimal::{BigDecimal, Zero};
use moka::future::Cache;
use serde_json::{json, Value};
use sqlx::PgPool;
use std::sync::Arc;
use uuid::Uuid;

/// Shared application state injected into handlers.
#[derive(Clone)]
pub struct AppState {
    /// Database connection pool.
    pub db: PgPool,
    pub storage: LeadStorage,
    pub disparos: DisparoStorage,
    pub config: Config,
    pub gateway: WhatsAppGatewayClient,
    /// None when `OPENAI_API_KEY` is not set; agents answer with the fallback.
    pub llm: Option<LlmClient>,
    pub serpro: Option<SerproClient>,
    pub realtime: RealtimePublisher,
    pub n8n: Option<N8nForwarder>,
    /// Gateway message ids already handled (10 min TTL).
    pub processed_messages: Cache<String, i64>,
    /// Validated Serpro answers keyed by `tipo:documento` (24h TTL).
    pub serpro_cache: Cache<String, String>,
}

impl AppState {
    pub fn publish(&self, event: RealtimeEvent) {
        self.realtime.spawn_publish(event);
    }

    pub fn forward_n8n(&self, event: &'static str, payload: Value) {
        if let Some(n8n) = &self.n8n {
            n8n.spawn_forward(event, payload);
        }
    }
}

/// Health check endpoint. Reports 503 when the database does not answer.
pub async fn health(State(state): State<Arc<AppState>>) -> (StatusCode, Json<Value>) {
    let database = sqlx::query_scalar::<_, i32>("SELECT 1")
        .fetch_one(&state.db)
        .await
        .is_ok();
    let status = if database {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        Json(json!({
            "status": if database { "healthy" } else { "degraded" },
            "service": "rust-crm-api",
            "database": database,
            "realtime": state.realtime.is_enabled(),
            "version": env!("CARGO_PKG_VERSION")
        })),
    )
}

const FORM_THANKS: &str = "Recebemos seus dados! Em breve um especialista fala com você pelo WhatsApp.";

fn required_phone(raw: &str) -> Result<String, AppError> {
    normalize_phone(raw)
        .ok_or_else(|| AppError::BadRequest(format!("Telefone inválido: {}", raw)))
}

fn required_name(raw: &str) -> Result<String, AppError> {
    let nome = raw.trim();
    if nome.is_empty() {
        return Err(AppError::BadRequest("Nome é obrigatório".to_string()));
    }
    Ok(nome.to_string())
}

/// Keeps a valid email, dropping invalid ones with a warning.
fn optional_email(raw: Option<&str>) -> Option<String> {
    let email = raw.map(str::trim).filter(|e| !e.is_empty())?;
    if is_valid_email(email) {
        Some(email.to_lowercase())
    } else {
        tracing::warn!("Dropping invalid email from form: {}", email);
        None
    }
}

/// Keeps a valid CNPJ (digits only), dropping invalid ones with a warning.
fn optional_cnpj(raw: Option<&str>) -> Option<String> {
    let raw = raw.map(str::trim).filter(|c| !c.is_empty())?;
    let cnpj = digits_only(raw);
    if is_valid_cnpj(&cnpj) {
        Some(cnpj)
    } else {
        tracing::warn!("Dropping invalid CNPJ from form: {}", raw);
        None
    }
}

/// Keeps a known state code, dropping anything else with a warning.
fn optional_uf(raw: Option<&str>) -> Option<String> {
    let raw = raw.map(str::trim).filter(|u| !u.is_empty())?;
    let uf = normalize_uf(raw);
    if uf.is_none() {
        tracing::warn!("Dropping invalid UF from form: {}", raw);
    }
    uf
}

fn non_blank(raw: Option<&str>) -> Option<String> {
    raw.map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// Debt figures plus the installment plan, for a positive debt.
fn financeiro_for_debt(
    divida: Option<&BigDecimal>,
    tipo_empresa: Option<&str>,
    parcelas_desejadas: Option<i32>,
) -> Option<FinanceiroUpdate> {
    let divida = divida.filter(|d| **d > BigDecimal::zero())?;
    let plano = calcular_parcelamento(divida, tipo_empresa, parcelas_desejadas);

    Some(FinanceiroUpdate {
        valor_divida_total: Some(divida.clone()),
        qtd_parcelas: plano.as_ref().map(|p| p.parcelas),
        valor_parcela: plano.map(|p| p.valor_parcela),
        ..Default::default()
    })
}

/// Ensures the qualification row exists, reclassifies and announces the lead.
async fn finish_intake(
    state: &AppState,
    lead_id: Uuid,
    telefone: &str,
    event: &'static str,
    mut payload: Value,
) -> Result<QualificationTier, AppError> {
    state
        .storage
        .upsert_qualificacao(lead_id, &QualificacaoUpdate::default())
        .await?;

    let tier = state
        .storage
        .refresh_tier(lead_id, state.config.icp_min_divida)
        .await?
        .unwrap_or(QualificationTier::Mql);

    payload["lead_id"] = json!(lead_id);
    payload["tier"] = json!(tier.as_str());

    state.publish(
        RealtimeEvent::new(event, payload.clone())
            .with_phone(telefone)
            .with_lead(lead_id),
    );
    state.forward_n8n(event, payload);

    Ok(tier)
}

/// POST /api/leads
///
/// Public intake form. Creates or merges the lead by phone.
pub async fn submit_lead(
    State(state): State<Arc<AppState>>,
    Json(form): Json<LeadFormRequest>,
) -> Result<(StatusCode, Json<LeadFormResponse>), AppError> {
    let telefone = required_phone(&form.telefone)?;
    let nome = required_name(&form.nome)?;
    let origem = non_blank(form.origem.as_deref()).unwrap_or_else(|| "formulario".to_string());
    tracing::info!("Lead form received: {} (origem: {})", telefone, origem);

    let lead_id = state
        .storage
        .upsert_lead(&NewLead {
            telefone: telefone.clone(),
            nome: Some(nome.clone()),
            email: optional_email(form.email.as_deref()),
            origem: Some(origem.clone()),
        })
        .await?;

    let stored_tipo = state.storage.tipo_empresa(lead_id).await?;
    let tipo_empresa = non_blank(form.tipo_empresa.as_deref())
        .map(|t| t.to_uppercase())
        .or(stored_tipo);

    let empresarial = EmpresarialUpdate {
        cnpj: optional_cnpj(form.cnpj.as_deref()),
        razao_social: non_blank(form.razao_social.as_deref()),
        tipo_empresa: tipo_empresa.clone(),
        faturamento_anual: form.faturamento_anual.clone(),
        cidade: non_blank(form.cidade.as_deref()),
        uf: optional_uf(form.uf.as_deref()),
        ..Default::default()
    };
    state.storage.upsert_empresarial(lead_id, &empresarial).await?;

    if let Some(financeiro) = financeiro_for_debt(
        form.divida_estimada.as_ref(),
        tipo_empresa.as_deref(),
        form.parcelas_desejadas,
    ) {
        state.storage.upsert_financeiro(lead_id, &financeiro).await?;
    }

    let tier = finish_intake(
        &state,
        lead_id,
        &telefone,
        EVENT_LEAD_CREATED,
        json!({"nome": nome, "origem": origem, "formulario": "leads"}),
    )
    .await?;

    tracing::info!("✓ Lead {} stored as {}", lead_id, tier);
    Ok((
        StatusCode::CREATED,
        Json(LeadFormResponse {
            success: true,
            lead_id,
            tier: tier.as_str().to_string(),
            message: FORM_THANKS.to_string(),
        }),
    ))
}

/// POST /api/forms/mei
pub async fn submit_mei_form(
    State(state): State<Arc<AppState>>,
    Json(form): Json<MeiFormRequest>,
) -> Result<(StatusCode, Json<LeadFormResponse>), AppError> {
    let telefone = required_phone(&form.telefone)?;
    let nome = required_name(&form.nome)?;
    let cnpj = digits_only(&form.cnpj);
    if !is_valid_cnpj(&cnpj) {
        return Err(AppError::BadRequest(format!("CNPJ inválido: {}", form.cnpj)));
    }
    tracing::info!("MEI form received: {} / {}", telefone, cnpj);

    let lead_id = state
        .storage
        .upsert_lead(&NewLead {
            telefone: telefone.clone(),
            nome: Some(nome.clone()),
            email: optional_email(form.email.as_deref()),
            origem: Some("mei".to_string()),
        })
        .await?;

    state
        .storage
        .upsert_empresarial(
            lead_id,
            &EmpresarialUpdate {
                cnpj: Some(cnpj.clone()),
                tipo_empresa: Some("MEI".to_string()),
                ..Default::default()
            },
        )
        .await?;

    if form.possui_dividas {
        let mut financeiro = financeiro_for_debt(
            form.valor_divida.as_ref(),
            Some("MEI"),
            form.parcelas_desejadas,
        )
        .unwrap_or_default();
        financeiro.anos_em_atraso = form.anos_em_atraso;
        state.storage.upsert_financeiro(lead_id, &financeiro).await?;
    }

    let tier = finish_intake(
        &state,
        lead_id,
        &telefone,
        EVENT_LEAD_CREATED,
        json!({"nome": nome, "origem": "mei", "cnpj": cnpj, "formulario": "mei"}),
    )
    .await?;

    Ok((
        StatusCode::CREATED,
        Json(LeadFormResponse {
            success: true,
            lead_id,
            tier: tier.as_str().to_string(),
            message: FORM_THANKS.to_string(),
        }),
    ))
}

/// POST /api/forms/ecac
///
/// Power-of-attorney data for a lead that already exists.
pub async fn submit_ecac_form(
    State(state): State<Arc<AppState>>,
    Json(form): Json<EcacFormRequest>,
) -> Result<Json<LeadFormResponse>, AppError> {
    let telefone = required_phone(&form.telefone)?;
    let cpf = digits_only(&form.cpf);
    if !is_valid_cpf(&cpf) {
        return Err(AppError::BadRequest(format!("CPF inválido: {}", form.cpf)));
    }
    let cnpj = match non_blank(form.cnpj.as_deref()) {
        Some(raw) => {
            let cnpj = digits_only(&raw);
            if !is_valid_cnpj(&cnpj) {
                return Err(AppError::BadRequest(format!("CNPJ inválido: {}", raw)));
            }
            Some(cnpj)
        }
        None => None,
    };

    let lead = state
        .storage
        .find_by_phone(&telefone)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Nenhum cadastro para o telefone {}", telefone)))?;

    state
        .storage
        .upsert_empresarial(
            lead.id,
            &EmpresarialUpdate {
                cpf: Some(cpf),
                cnpj,
                ..Default::default()
            },
        )
        .await?;

    state
        .storage
        .upsert_vendas(
            lead.id,
            &VendasUpdate {
                procuracao_solicitada: form.autoriza_procuracao.then_some(true),
                possui_certificado_digital: Some(form.possui_certificado_digital),
                ..Default::default()
            },
        )
        .await?;

    let tier = finish_intake(
        &state,
        lead.id,
        &telefone,
        EVENT_LEAD_UPDATED,
        json!({
            "formulario": "ecac",
            "autoriza_procuracao": form.autoriza_procuracao,
            "possui_certificado_digital": form.possui_certificado_digital
        }),
    )
    .await?;

    tracing::info!("✓ e-CAC data stored for lead {}", lead.id);
    Ok(Json(LeadFormResponse {
        success: true,
        lead_id: lead.id,
        tier: tier.as_str().to_string(),
        message: "Dados recebidos! Vamos preparar a procuração e te avisamos pelo WhatsApp."
            .to_string(),
    }))
}
