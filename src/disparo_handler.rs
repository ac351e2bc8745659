use crate::auth::{check_header_secret, CRON_SECRET_HEADER};
use crate::disparos::{process_pending, DisparoFiltro, DisparoRunSummary, DisparoStatus, NewDisparo};
use crate::errors::AppError;
use crate::handlers::AppState;
use crate::models::{Disparo, DisparoLog};
use crate::realtime::{RealtimeEvent, EVENT_DISPARO_PROGRESS};
use crate::templates::{render_template, unknown_placeholders};
use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

#[derive(Debug, Deserialize)]
pub struct CreateDisparoRequest {
    pub nome: String,
    pub mensagem_template: String,
    #[serde(default)]
    pub filtros: DisparoFiltro,
    pub agendado_para: Option<DateTime<Utc>>,
    /// Create already active instead of as a draft.
    #[serde(default)]
    pub ativar: bool,
}

/// Rejects empty templates and unknown placeholders.
fn validate_template(template: &str) -> Result<(), AppError> {
    if template.trim().is_empty() {
        return Err(AppError::BadRequest("Template da mensagem vazio".to_string()));
    }
    let unknown = unknown_placeholders(template);
    if !unknown.is_empty() {
        return Err(AppError::BadRequest(format!(
            "Placeholders desconhecidos: {}",
            unknown.join(", ")
        )));
    }
    Ok(())
}

/// POST /api/admin/disparos
pub async fn create_disparo(
    State(state): State<Arc<AppState>>,
    Json(body): Json<CreateDisparoRequest>,
) -> Result<(StatusCode, Json<Disparo>), AppError> {
    let nome = body.nome.trim();
    if nome.is_empty() {
        return Err(AppError::BadRequest("Nome do disparo é obrigatório".to_string()));
    }
    validate_template(&body.mensagem_template)?;

    let disparo = state
        .disparos
        .create(&NewDisparo {
            nome: nome.to_string(),
            mensagem_template: body.mensagem_template.trim().to_string(),
            filtros: body.filtros,
            status: if body.ativar {
                DisparoStatus::Ativo
            } else {
                DisparoStatus::Rascunho
            },
            agendado_para: body.agendado_para,
        })
        .await?;

    tracing::info!("Disparo '{}' created ({})", disparo.nome, disparo.status);
    Ok((StatusCode::CREATED, Json(disparo)))
}

/// GET /api/admin/disparos
pub async fn list_disparos(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<Disparo>>, AppError> {
    Ok(Json(state.disparos.list().await?))
}

#[derive(Debug, Serialize)]
pub struct DisparoDetail {
    #[serde(flatten)]
    pub disparo: Disparo,
    /// Matching leads not yet messaged by this campaign.
    pub pendentes: i64,
}

/// GET /api/admin/disparos/:id
pub async fn get_disparo(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<DisparoDetail>, AppError> {
    let disparo = state
        .disparos
        .get(id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Disparo {} not found", id)))?;

    let filtro: DisparoFiltro = serde_json::from_value(disparo.filtros.clone())?;
    let pendentes = state.disparos.count_targets(&filtro, Some(id)).await?;

    Ok(Json(DisparoDetail { disparo, pendentes }))
}

#[derive(Debug, Deserialize)]
pub struct UpdateStatusRequest {
    pub status: String,
}

/// PATCH /api/admin/disparos/:id/status
pub async fn update_disparo_status(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(body): Json<UpdateStatusRequest>,
) -> Result<Json<Disparo>, AppError> {
    let status: DisparoStatus = body.status.parse().map_err(AppError::BadRequest)?;

    let disparo = state
        .disparos
        .update_status(id, status)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Disparo {} not found", id)))?;

    tracing::info!("Disparo {} is now {}", id, status);
    Ok(Json(disparo))
}

#[derive(Debug, Deserialize)]
pub struct LogsQuery {
    pub status: Option<String>,
    pub limit: Option<i64>,
}

/// GET /api/admin/disparos/:id/logs
pub async fn disparo_logs(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Query(query): Query<LogsQuery>,
) -> Result<Json<Vec<DisparoLog>>, AppError> {
    let limit = query.limit.unwrap_or(100).clamp(1, 1000);
    let status = query.status.as_deref().filter(|s| !s.is_empty());
    Ok(Json(state.disparos.logs(id, status, limit).await?))
}

#[derive(Debug, Deserialize)]
pub struct PreviewRequest {
    pub mensagem_template: String,
    #[serde(default)]
    pub filtros: DisparoFiltro,
}

#[derive(Debug, Serialize)]
pub struct PreviewSample {
    pub telefone: String,
    pub mensagem: String,
}

#[derive(Debug, Serialize)]
pub struct PreviewResponse {
    pub total_alvos: i64,
    pub amostras: Vec<PreviewSample>,
    pub placeholders_desconhecidos: Vec<String>,
}

/// POST /api/admin/disparos/preview
pub async fn preview_disparo(
    State(state): State<Arc<AppState>>,
    Json(body): Json<PreviewRequest>,
) -> Result<Json<PreviewResponse>, AppError> {
    let total_alvos = state.disparos.count_targets(&body.filtros, None).await?;
    let amostras = state
        .disparos
        .select_targets(&body.filtros, None, 3)
        .await?
        .into_iter()
        .map(|target| PreviewSample {
            mensagem: render_template(&body.mensagem_template, &target.template_vars()),
            telefone: target.telefone,
        })
        .collect();

    Ok(Json(PreviewResponse {
        total_alvos,
        amostras,
        placeholders_desconhecidos: unknown_placeholders(&body.mensagem_template),
    }))
}

/// POST /api/disparos/process
///
/// Called by the external scheduler. Authentication: X-Cron-Secret header
/// must match CRON_SECRET when set.
pub async fn process_disparos(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<DisparoRunSummary>, AppError> {
    check_header_secret(&headers, CRON_SECRET_HEADER, state.config.cron_secret.as_deref())?;

    let summary = process_pending(
        &state.disparos,
        &state.gateway,
        state.config.disparo_batch_size,
        Duration::from_millis(state.config.disparo_delay_ms),
    )
    .await?;

    for campanha in &summary.campanhas {
        state.publish(RealtimeEvent::new(
            EVENT_DISPARO_PROGRESS,
            serde_json::to_value(campanha)?,
        ));
    }

    Ok(Json(summary))
}
