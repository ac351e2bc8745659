//! Batch WhatsApp campaigns ("disparos").
//!
//! Each call to [`process_pending`] sends to at most `batch_size` recipients
//! across the active, due campaigns. A recipient is claimed in `disparo_logs`
//! before sending, so the unique (campaign, phone) row is what keeps a phone
//! from ever being messaged twice by the same campaign.

use crate::circuit_breaker::create_gateway_circuit_breaker;
use crate::errors::{AppError, ResultExt};
use crate::gateway_client::WhatsAppGatewayClient;
use crate::models::{Disparo, DisparoLog};
use crate::templates::{render_template, TemplateVars};
use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use failsafe::futures::CircuitBreaker;
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgPool, Postgres, QueryBuilder};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DisparoStatus {
    Rascunho,
    Ativo,
    Pausado,
    Concluido,
}

impl DisparoStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DisparoStatus::Rascunho => "rascunho",
            DisparoStatus::Ativo => "ativo",
            DisparoStatus::Pausado => "pausado",
            DisparoStatus::Concluido => "concluido",
        }
    }
}

impl FromStr for DisparoStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "rascunho" => Ok(DisparoStatus::Rascunho),
            "ativo" => Ok(DisparoStatus::Ativo),
            "pausado" => Ok(DisparoStatus::Pausado),
            "concluido" => Ok(DisparoStatus::Concluido),
            other => Err(format!("Unknown disparo status '{}'", other)),
        }
    }
}

impl fmt::Display for DisparoStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Audience filter stored as JSON in `disparos.filtros`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DisparoFiltro {
    pub status: Vec<String>,
    pub tiers: Vec<String>,
    pub uf: Option<String>,
    pub cidade: Option<String>,
    pub apenas_mei: bool,
    pub divida_min: Option<BigDecimal>,
    pub divida_max: Option<BigDecimal>,
    pub criado_depois: Option<DateTime<Utc>>,
    pub criado_antes: Option<DateTime<Utc>>,
}

/// A recipient selected by a filter.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct DisparoTarget {
    pub lead_id: Uuid,
    pub telefone: String,
    pub nome: Option<String>,
    pub razao_social: Option<String>,
    pub nome_fantasia: Option<String>,
    pub cnpj: Option<String>,
    pub cidade: Option<String>,
    pub uf: Option<String>,
    pub valor_divida_total: Option<BigDecimal>,
}

impl DisparoTarget {
    pub fn template_vars(&self) -> TemplateVars {
        TemplateVars {
            nome: self.nome.clone(),
            empresa: self
                .nome_fantasia
                .clone()
                .or_else(|| self.razao_social.clone()),
            cnpj: self.cnpj.clone(),
            cidade: self.cidade.clone(),
            uf: self.uf.clone(),
            divida: self.valor_divida_total.clone(),
            telefone: Some(self.telefone.clone()),
        }
    }
}

const TARGET_FROM: &str = " FROM leads l \
     LEFT JOIN leads_empresarial e ON e.lead_id = l.id \
     LEFT JOIN leads_qualificacao q ON q.lead_id = l.id \
     LEFT JOIN leads_financeiro f ON f.lead_id = l.id \
     WHERE 1=1";

fn clean_list(values: &[String], upper: bool) -> Vec<String> {
    values
        .iter()
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
        .map(|v| if upper { v.to_uppercase() } else { v.to_lowercase() })
        .collect()
}

/// Appends the filter conditions. With a campaign id, phones already logged
/// for that campaign are excluded.
fn push_target_filters(
    qb: &mut QueryBuilder<'_, Postgres>,
    filtro: &DisparoFiltro,
    disparo_id: Option<Uuid>,
) {
    qb.push(TARGET_FROM);

    let status = clean_list(&filtro.status, false);
    if !status.is_empty() {
        qb.push(" AND q.status = ANY(");
        qb.push_bind(status);
        qb.push(")");
    }

    let tiers = clean_list(&filtro.tiers, true);
    if !tiers.is_empty() {
        qb.push(" AND q.tier = ANY(");
        qb.push_bind(tiers);
        qb.push(")");
    }

    if let Some(uf) = filtro.uf.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
        qb.push(" AND e.uf = ");
        qb.push_bind(uf.to_uppercase());
    }

    if let Some(cidade) = filtro.cidade.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
        qb.push(" AND e.cidade ILIKE ");
        qb.push_bind(crate::validation::escape_like(cidade));
        qb.push(" ESCAPE '\\'");
    }

    if filtro.apenas_mei {
        qb.push(" AND UPPER(e.tipo_empresa) = 'MEI'");
    }

    if let Some(min) = &filtro.divida_min {
        qb.push(" AND f.valor_divida_total >= ");
        qb.push_bind(min.clone());
    }

    if let Some(max) = &filtro.divida_max {
        qb.push(" AND f.valor_divida_total <= ");
        qb.push_bind(max.clone());
    }

    if let Some(depois) = filtro.criado_depois {
        qb.push(" AND l.created_at >= ");
        qb.push_bind(depois);
    }

    if let Some(antes) = filtro.criado_antes {
        qb.push(" AND l.created_at < ");
        qb.push_bind(antes);
    }

    if let Some(disparo_id) = disparo_id {
        qb.push(
            " AND NOT EXISTS (SELECT 1 FROM disparo_logs dl \
             WHERE dl.telefone = l.telefone AND dl.disparo_id = ",
        );
        qb.push_bind(disparo_id);
        qb.push(")");
    }
}

/// Target selection, oldest leads first.
pub fn build_target_query<'a>(
    filtro: &DisparoFiltro,
    disparo_id: Option<Uuid>,
    limit: i64,
) -> QueryBuilder<'a, Postgres> {
    let mut qb = QueryBuilder::new(
        "SELECT l.id AS lead_id, l.telefone, l.nome, e.razao_social, e.nome_fantasia, \
         e.cnpj, e.cidade, e.uf, f.valor_divida_total",
    );
    push_target_filters(&mut qb, filtro, disparo_id);
    qb.push(" ORDER BY l.created_at ASC, l.id ASC LIMIT ");
    qb.push_bind(limit);
    qb
}

pub fn build_target_count<'a>(
    filtro: &DisparoFiltro,
    disparo_id: Option<Uuid>,
) -> QueryBuilder<'a, Postgres> {
    let mut qb = QueryBuilder::new("SELECT COUNT(*)");
    push_target_filters(&mut qb, filtro, disparo_id);
    qb
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewDisparo {
    pub nome: String,
    pub mensagem_template: String,
    pub filtros: DisparoFiltro,
    pub status: DisparoStatus,
    pub agendado_para: Option<DateTime<Utc>>,
}

/// Storage for campaigns and their send ledger.
#[derive(Clone)]
pub struct DisparoStorage {
    pool: PgPool,
}

impl DisparoStorage {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn create(&self, disparo: &NewDisparo) -> Result<Disparo, AppError> {
        let filtros = serde_json::to_value(&disparo.filtros)?;
        let row = sqlx::query_as::<_, Disparo>(
            r#"
            INSERT INTO disparos (nome, mensagem_template, filtros, status, agendado_para)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING *
            "#,
        )
        .bind(&disparo.nome)
        .bind(&disparo.mensagem_template)
        .bind(filtros)
        .bind(disparo.status.as_str())
        .bind(disparo.agendado_para)
        .fetch_one(&self.pool)
        .await
        .context("creating disparo")?;
        Ok(row)
    }

    pub async fn list(&self) -> Result<Vec<Disparo>, AppError> {
        let rows = sqlx::query_as::<_, Disparo>("SELECT * FROM disparos ORDER BY created_at DESC")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }

    pub async fn get(&self, id: Uuid) -> Result<Option<Disparo>, AppError> {
        let row = sqlx::query_as::<_, Disparo>("SELECT * FROM disparos WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    pub async fn update_status(
        &self,
        id: Uuid,
        status: DisparoStatus,
    ) -> Result<Option<Disparo>, AppError> {
        let row = sqlx::query_as::<_, Disparo>(
            "UPDATE disparos SET status = $2, updated_at = now() WHERE id = $1 RETURNING *",
        )
        .bind(id)
        .bind(status.as_str())
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    pub async fn logs(
        &self,
        disparo_id: Uuid,
        status: Option<&str>,
        limit: i64,
    ) -> Result<Vec<DisparoLog>, AppError> {
        let rows = sqlx::query_as::<_, DisparoLog>(
            r#"
            SELECT * FROM disparo_logs
            WHERE disparo_id = $1 AND ($2::text IS NULL OR status = $2)
            ORDER BY created_at DESC
            LIMIT $3
            "#,
        )
        .bind(disparo_id)
        .bind(status)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Active campaigns whose schedule has arrived, oldest first.
    pub async fn due_campaigns(&self) -> Result<Vec<Disparo>, AppError> {
        let rows = sqlx::query_as::<_, Disparo>(
            r#"
            SELECT * FROM disparos
            WHERE status = 'ativo' AND (agendado_para IS NULL OR agendado_para <= now())
            ORDER BY created_at ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn select_targets(
        &self,
        filtro: &DisparoFiltro,
        disparo_id: Option<Uuid>,
        limit: i64,
    ) -> Result<Vec<DisparoTarget>, AppError> {
        let targets = build_target_query(filtro, disparo_id, limit)
            .build_query_as::<DisparoTarget>()
            .fetch_all(&self.pool)
            .await
            .context("selecting disparo targets")?;
        Ok(targets)
    }

    pub async fn count_targets(
        &self,
        filtro: &DisparoFiltro,
        disparo_id: Option<Uuid>,
    ) -> Result<i64, AppError> {
        let total = build_target_count(filtro, disparo_id)
            .build_query_scalar::<i64>()
            .fetch_one(&self.pool)
            .await?;
        Ok(total)
    }

    /// Claims a recipient. None means another run already has it.
    pub async fn claim(
        &self,
        disparo_id: Uuid,
        target: &DisparoTarget,
        mensagem: &str,
    ) -> Result<Option<Uuid>, AppError> {
        let id = sqlx::query_scalar::<_, Uuid>(
            r#"
            INSERT INTO disparo_logs (disparo_id, lead_id, telefone, status, mensagem)
            VALUES ($1, $2, $3, 'pendente', $4)
            ON CONFLICT (disparo_id, telefone) DO NOTHING
            RETURNING id
            "#,
        )
        .bind(disparo_id)
        .bind(target.lead_id)
        .bind(&target.telefone)
        .bind(mensagem)
        .fetch_optional(&self.pool)
        .await?;
        Ok(id)
    }

    pub async fn mark_sent(&self, log_id: Uuid) -> Result<(), AppError> {
        sqlx::query("UPDATE disparo_logs SET status = 'enviado', enviado_em = now() WHERE id = $1")
            .bind(log_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn mark_failed(&self, log_id: Uuid, erro: &str) -> Result<(), AppError> {
        sqlx::query("UPDATE disparo_logs SET status = 'falhou', erro = $2 WHERE id = $1")
            .bind(log_id)
            .bind(erro)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Drops a claim that was never attempted so a later run can retry it.
    pub async fn release_claim(&self, log_id: Uuid) -> Result<(), AppError> {
        sqlx::query("DELETE FROM disparo_logs WHERE id = $1 AND status = 'pendente'")
            .bind(log_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn add_counters(
        &self,
        disparo_id: Uuid,
        enviados: i32,
        falhas: i32,
    ) -> Result<(), AppError> {
        sqlx::query(
            r#"
            UPDATE disparos SET
                total_enviados = total_enviados + $2,
                total_falhas = total_falhas + $3,
                updated_at = now()
            WHERE id = $1
            "#,
        )
        .bind(disparo_id)
        .bind(enviados)
        .bind(falhas)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

/// Outcome of one campaign within a run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CampaignRun {
    pub disparo_id: Uuid,
    pub nome: String,
    pub selecionados: usize,
    pub enviados: i32,
    pub falhas: i32,
    pub concluido: bool,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct DisparoRunSummary {
    /// Recipients actually handed to the gateway.
    pub tentativas: usize,
    pub enviados: i32,
    pub falhas: i32,
    /// True when the circuit breaker stopped the run.
    pub interrompido: bool,
    pub campanhas: Vec<CampaignRun>,
}

/// Ledger operations a batch run needs.
#[allow(async_fn_in_trait)]
pub trait DisparoLedger {
    async fn due_campaigns(&self) -> Result<Vec<Disparo>, AppError>;
    async fn select_targets(
        &self,
        filtro: &DisparoFiltro,
        disparo_id: Option<Uuid>,
        limit: i64,
    ) -> Result<Vec<DisparoTarget>, AppError>;
    async fn claim(
        &self,
        disparo_id: Uuid,
        target: &DisparoTarget,
        mensagem: &str,
    ) -> Result<Option<Uuid>, AppError>;
    async fn mark_sent(&self, log_id: Uuid) -> Result<(), AppError>;
    async fn mark_failed(&self, log_id: Uuid, erro: &str) -> Result<(), AppError>;
    async fn release_claim(&self, log_id: Uuid) -> Result<(), AppError>;
    async fn add_counters(&self, disparo_id: Uuid, enviados: i32, falhas: i32)
        -> Result<(), AppError>;
    async fn conclude(&self, disparo_id: Uuid) -> Result<(), AppError>;
}

impl DisparoLedger for DisparoStorage {
    async fn due_campaigns(&self) -> Result<Vec<Disparo>, AppError> {
        DisparoStorage::due_campaigns(self).await
    }

    async fn select_targets(
        &self,
        filtro: &DisparoFiltro,
        disparo_id: Option<Uuid>,
        limit: i64,
    ) -> Result<Vec<DisparoTarget>, AppError> {
        DisparoStorage::select_targets(self, filtro, disparo_id, limit).await
    }

    async fn claim(
        &self,
        disparo_id: Uuid,
        target: &DisparoTarget,
        mensagem: &str,
    ) -> Result<Option<Uuid>, AppError> {
        DisparoStorage::claim(self, disparo_id, target, mensagem).await
    }

    async fn mark_sent(&self, log_id: Uuid) -> Result<(), AppError> {
        DisparoStorage::mark_sent(self, log_id).await
    }

    async fn mark_failed(&self, log_id: Uuid, erro: &str) -> Result<(), AppError> {
        DisparoStorage::mark_failed(self, log_id, erro).await
    }

    async fn release_claim(&self, log_id: Uuid) -> Result<(), AppError> {
        DisparoStorage::release_claim(self, log_id).await
    }

    async fn add_counters(
        &self,
        disparo_id: Uuid,
        enviados: i32,
        falhas: i32,
    ) -> Result<(), AppError> {
        DisparoStorage::add_counters(self, disparo_id, enviados, falhas).await
    }

    async fn conclude(&self, disparo_id: Uuid) -> Result<(), AppError> {
        self.update_status(disparo_id, DisparoStatus::Concluido)
            .await
            .map(|_| ())
    }
}

/// Runs one batch over the active, due campaigns.
pub async fn process_pending<L: DisparoLedger>(
    ledger: &L,
    gateway: &WhatsAppGatewayClient,
    batch_size: usize,
    delay: Duration,
) -> Result<DisparoRunSummary, AppError> {
    let breaker = create_gateway_circuit_breaker();
    let mut summary = DisparoRunSummary::default();

    for campaign in ledger.due_campaigns().await? {
        let remaining = batch_size.saturating_sub(summary.tentativas);
        if remaining == 0 || summary.interrompido {
            break;
        }

        let filtro: DisparoFiltro = match serde_json::from_value(campaign.filtros.clone()) {
            Ok(filtro) => filtro,
            Err(e) => {
                tracing::warn!("Skipping disparo {} with unreadable filter: {}", campaign.id, e);
                continue;
            }
        };

        let targets = ledger
            .select_targets(&filtro, Some(campaign.id), remaining as i64)
            .await?;
        let mut run = CampaignRun {
            disparo_id: campaign.id,
            nome: campaign.nome.clone(),
            selecionados: targets.len(),
            ..Default::default()
        };
        tracing::info!(
            "Disparo '{}': {} target(s) selected (limit {})",
            campaign.nome,
            targets.len(),
            remaining
        );

        let sent = send_to_targets(
            ledger,
            gateway,
            &breaker,
            &campaign,
            &targets,
            delay,
            &mut run,
            &mut summary,
        )
        .await;

        // Counters follow every attempted send, even when a ledger write failed
        ledger
            .add_counters(campaign.id, run.enviados, run.falhas)
            .await?;
        summary.enviados += run.enviados;
        summary.falhas += run.falhas;
        sent?;

        if !summary.interrompido && targets.len() < remaining {
            ledger.conclude(campaign.id).await?;
            run.concluido = true;
            tracing::info!("✓ Disparo '{}' concluded", campaign.nome);
        }

        summary.campanhas.push(run);
    }

    tracing::info!(
        "Disparo run: {} attempted, {} sent, {} failed{}",
        summary.tentativas,
        summary.enviados,
        summary.falhas,
        if summary.interrompido { " (interrupted)" } else { "" }
    );
    Ok(summary)
}

#[allow(clippy::too_many_arguments)]
async fn send_to_targets<L, B>(
    ledger: &L,
    gateway: &WhatsAppGatewayClient,
    breaker: &B,
    campaign: &Disparo,
    targets: &[DisparoTarget],
    delay: Duration,
    run: &mut CampaignRun,
    summary: &mut DisparoRunSummary,
) -> Result<(), AppError>
where
    L: DisparoLedger,
    B: CircuitBreaker,
{
    for target in targets {
        let mensagem = render_template(&campaign.mensagem_template, &target.template_vars());
        let Some(log_id) = ledger.claim(campaign.id, target, &mensagem).await? else {
            tracing::debug!("{} already claimed for disparo {}", target.telefone, campaign.id);
            continue;
        };

        if summary.tentativas > 0 && !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        match breaker.call(gateway.send_text(&target.telefone, &mensagem)).await {
            Ok(_) => {
                run.enviados += 1;
                summary.tentativas += 1;
                ledger.mark_sent(log_id).await?;
            }
            Err(failsafe::Error::Inner(e)) => {
                tracing::warn!("Disparo send to {} failed: {}", target.telefone, e);
                run.falhas += 1;
                summary.tentativas += 1;
                ledger.mark_failed(log_id, &e.to_string()).await?;
            }
            Err(failsafe::Error::Rejected) => {
                tracing::error!("Gateway circuit open - stopping disparo batch");
                summary.interrompido = true;
                ledger.release_claim(log_id).await?;
                break;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashSet;
    use std::sync::Mutex;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[derive(Default)]
    struct LedgerState {
        claimed: HashSet<(Uuid, String)>,
        sent: Vec<Uuid>,
        failed: Vec<Uuid>,
        released: Vec<Uuid>,
        counters: Vec<(Uuid, i32, i32)>,
        concluded: Vec<Uuid>,
        limits: Vec<i64>,
        fail_mark_sent_after: Option<usize>,
    }

    /// In-memory ledger with the same claim semantics as the unique log row.
    struct MemoryLedger {
        campaigns: Vec<Disparo>,
        targets: Vec<(Uuid, DisparoTarget)>,
        state: Mutex<LedgerState>,
    }

    impl MemoryLedger {
        fn new(campaigns: Vec<(Disparo, usize)>) -> Self {
            let mut targets = Vec::new();
            for (campaign, count) in &campaigns {
                for n in 0..*count {
                    targets.push((campaign.id, target(&format!("55119876543{:02}", n))));
                }
            }
            Self {
                campaigns: campaigns.into_iter().map(|(c, _)| c).collect(),
                targets,
                state: Mutex::new(LedgerState::default()),
            }
        }
    }

    impl DisparoLedger for MemoryLedger {
        async fn due_campaigns(&self) -> Result<Vec<Disparo>, AppError> {
            Ok(self.campaigns.clone())
        }

        async fn select_targets(
            &self,
            _filtro: &DisparoFiltro,
            disparo_id: Option<Uuid>,
            limit: i64,
        ) -> Result<Vec<DisparoTarget>, AppError> {
            let mut state = self.state.lock().unwrap();
            state.limits.push(limit);
            Ok(self
                .targets
                .iter()
                .filter(|(id, t)| {
                    Some(*id) == disparo_id && !state.claimed.contains(&(*id, t.telefone.clone()))
                })
                .take(limit as usize)
                .map(|(_, t)| t.clone())
                .collect())
        }

        async fn claim(
            &self,
            disparo_id: Uuid,
            target: &DisparoTarget,
            _mensagem: &str,
        ) -> Result<Option<Uuid>, AppError> {
            let mut state = self.state.lock().unwrap();
            Ok(state
                .claimed
                .insert((disparo_id, target.telefone.clone()))
                .then(Uuid::new_v4))
        }

        async fn mark_sent(&self, log_id: Uuid) -> Result<(), AppError> {
            let mut state = self.state.lock().unwrap();
            if state.fail_mark_sent_after == Some(state.sent.len()) {
                return Err(AppError::DatabaseError(sqlx::Error::PoolTimedOut));
            }
            state.sent.push(log_id);
            Ok(())
        }

        async fn mark_failed(&self, log_id: Uuid, _erro: &str) -> Result<(), AppError> {
            self.state.lock().unwrap().failed.push(log_id);
            Ok(())
        }

        async fn release_claim(&self, log_id: Uuid) -> Result<(), AppError> {
            self.state.lock().unwrap().released.push(log_id);
            Ok(())
        }

        async fn add_counters(
            &self,
            disparo_id: Uuid,
            enviados: i32,
            falhas: i32,
        ) -> Result<(), AppError> {
            self.state
                .lock()
                .unwrap()
                .counters
                .push((disparo_id, enviados, falhas));
            Ok(())
        }

        async fn conclude(&self, disparo_id: Uuid) -> Result<(), AppError> {
            self.state.lock().unwrap().concluded.push(disparo_id);
            Ok(())
        }
    }

    fn campaign(nome: &str) -> Disparo {
        Disparo {
            id: Uuid::new_v4(),
            nome: nome.to_string(),
            mensagem_template: "Olá {{primeiro_nome}}!".to_string(),
            filtros: json!({}),
            status: "ativo".to_string(),
            agendado_para: None,
            total_enviados: 0,
            total_falhas: 0,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn target(telefone: &str) -> DisparoTarget {
        DisparoTarget {
            lead_id: Uuid::new_v4(),
            telefone: telefone.to_string(),
            nome: Some("Ana Souza".to_string()),
            razao_social: None,
            nome_fantasia: None,
            cnpj: None,
            cidade: None,
            uf: None,
            valor_divida_total: None,
        }
    }

    async fn gateway_answering(status: u16) -> (MockServer, WhatsAppGatewayClient) {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/message/sendText/crm"))
            .respond_with(
                ResponseTemplate::new(status).set_body_json(json!({"key": {"id": "3EB0"}})),
            )
            .mount(&server)
            .await;
        let gateway =
            WhatsAppGatewayClient::new(server.uri(), "gw-key".to_string(), "crm".to_string())
                .unwrap();
        (server, gateway)
    }

    #[tokio::test]
    async fn test_batch_limit_is_shared_across_campaigns() {
        let first = campaign("Primeira");
        let second = campaign("Segunda");
        let (first_id, second_id) = (first.id, second.id);
        let ledger = MemoryLedger::new(vec![(first, 3), (second, 3)]);
        let (server, gateway) = gateway_answering(201).await;

        let summary = process_pending(&ledger, &gateway, 4, Duration::ZERO)
            .await
            .unwrap();

        assert_eq!(summary.tentativas, 4);
        assert_eq!(summary.enviados, 4);
        assert!(!summary.interrompido);
        assert_eq!(server.received_requests().await.unwrap().len(), 4);

        let state = ledger.state.lock().unwrap();
        assert_eq!(state.limits, vec![4, 1]);
        assert_eq!(state.counters, vec![(first_id, 3, 0), (second_id, 1, 0)]);
        // Fewer targets than the limit means the first campaign ran dry
        assert_eq!(state.concluded, vec![first_id]);
    }

    #[tokio::test]
    async fn test_open_breaker_releases_claim_and_stops() {
        let only = campaign("Gateway fora");
        let only_id = only.id;
        let ledger = MemoryLedger::new(vec![(only, 7)]);
        let (server, gateway) = gateway_answering(500).await;

        let summary = process_pending(&ledger, &gateway, 10, Duration::ZERO)
            .await
            .unwrap();

        assert!(summary.interrompido);
        assert_eq!(summary.tentativas, 5);
        assert_eq!(summary.falhas, 5);
        assert_eq!(summary.enviados, 0);
        assert_eq!(server.received_requests().await.unwrap().len(), 5);

        let state = ledger.state.lock().unwrap();
        assert_eq!(state.failed.len(), 5);
        assert_eq!(state.released.len(), 1);
        assert_eq!(state.counters, vec![(only_id, 0, 5)]);
        assert!(state.concluded.is_empty());
    }

    #[tokio::test]
    async fn test_gateway_failures_are_recorded_without_release() {
        let only = campaign("Instável");
        let only_id = only.id;
        let ledger = MemoryLedger::new(vec![(only, 2)]);
        let (_server, gateway) = gateway_answering(502).await;

        let summary = process_pending(&ledger, &gateway, 10, Duration::ZERO)
            .await
            .unwrap();

        assert!(!summary.interrompido);
        assert_eq!(summary.falhas, 2);
        let state = ledger.state.lock().unwrap();
        assert_eq!(state.failed.len(), 2);
        assert!(state.released.is_empty());
        assert_eq!(state.concluded, vec![only_id]);
    }

    #[tokio::test]
    async fn test_delay_between_sends() {
        let ledger = MemoryLedger::new(vec![(campaign("Pausada"), 3)]);
        let (_server, gateway) = gateway_answering(201).await;

        let started = std::time::Instant::now();
        let summary = process_pending(&ledger, &gateway, 3, Duration::from_millis(40))
            .await
            .unwrap();

        assert_eq!(summary.enviados, 3);
        assert!(started.elapsed() >= Duration::from_millis(80));
    }

    #[tokio::test]
    async fn test_counters_flushed_when_ledger_write_fails() {
        let only = campaign("Banco instável");
        let only_id = only.id;
        let ledger = MemoryLedger::new(vec![(only, 3)]);
        ledger.state.lock().unwrap().fail_mark_sent_after = Some(1);
        let (server, gateway) = gateway_answering(201).await;

        let result = process_pending(&ledger, &gateway, 10, Duration::ZERO).await;

        assert!(matches!(result, Err(AppError::DatabaseError(_))));
        assert_eq!(server.received_requests().await.unwrap().len(), 2);
        let state = ledger.state.lock().unwrap();
        assert_eq!(state.counters, vec![(only_id, 2, 0)]);
        assert!(state.concluded.is_empty());
    }

    #[test]
    fn test_filter_from_partial_json() {
        let filtro: DisparoFiltro =
            serde_json::from_value(json!({"tiers": ["icp"], "uf": "sp"})).unwrap();
        assert_eq!(filtro.tiers, vec!["icp"]);
        assert!(!filtro.apenas_mei);
        assert!(filtro.status.is_empty());

        let empty: DisparoFiltro = serde_json::from_value(json!({})).unwrap();
        assert_eq!(empty, DisparoFiltro::default());
    }

    #[test]
    fn test_target_query_binds_every_filter() {
        let filtro = DisparoFiltro {
            status: vec!["novo".to_string(), " ".to_string()],
            tiers: vec!["icp".to_string()],
            uf: Some("sp".to_string()),
            cidade: Some("Campinas".to_string()),
            apenas_mei: true,
            divida_min: Some("10000".parse().unwrap()),
            divida_max: None,
            criado_depois: None,
            criado_antes: None,
        };
        let qb = build_target_query(&filtro, Some(Uuid::new_v4()), 20);
        let sql = qb.sql();

        assert!(sql.contains("q.status = ANY($1)"));
        assert!(sql.contains("q.tier = ANY($2)"));
        assert!(sql.contains("e.uf = $3"));
        assert!(sql.contains("e.cidade ILIKE $4 ESCAPE '\\'"));
        assert!(sql.contains("UPPER(e.tipo_empresa) = 'MEI'"));
        assert!(sql.contains("f.valor_divida_total >= $5"));
        assert!(sql.contains("dl.disparo_id = $6"));
        assert!(sql.ends_with("ORDER BY l.created_at ASC, l.id ASC LIMIT $7"));
        assert!(!sql.contains("Campinas"));
    }

    #[test]
    fn test_preview_count_has_no_exclusion() {
        let qb = build_target_count(&DisparoFiltro::default(), None);
        let sql = qb.sql();
        assert!(sql.starts_with("SELECT COUNT(*) FROM leads l"));
        assert!(!sql.contains("disparo_logs"));
        assert!(!sql.contains('$'));
    }

    #[test]
    fn test_target_template_vars_prefer_trade_name() {
        let target = DisparoTarget {
            lead_id: Uuid::new_v4(),
            telefone: "5511987654321".to_string(),
            nome: Some("João Lima".to_string()),
            razao_social: Some("JOAO LIMA 12345678900".to_string()),
            nome_fantasia: Some("Lima Marmitas".to_string()),
            cnpj: None,
            cidade: None,
            uf: Some("MG".to_string()),
            valor_divida_total: Some("4200".parse().unwrap()),
        };
        let text = render_template(
            "{{primeiro_nome}}, a {{empresa}} tem {{divida}} em débitos.",
            &target.template_vars(),
        );
        assert_eq!(text, "João, a Lima Marmitas tem R$ 4.200,00 em débitos.");
    }

    #[test]
    fn test_status_parse() {
        assert_eq!("ATIVO".parse::<DisparoStatus>(), Ok(DisparoStatus::Ativo));
        assert!("enviando".parse::<DisparoStatus>().is_err());
    }
}
