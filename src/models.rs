use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

// ============ Database Models ============

/// Identity row of a lead. The phone (digits only, with country code) is the natural key.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Lead {
    pub id: Uuid,
    /// Phone in digits, e.g. `5511987654321`.
    pub telefone: String,
    pub nome: Option<String>,
    pub email: Option<String>,
    /// Where the lead came from (`formulario`, `mei`, `whatsapp`, ...).
    pub origem: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Business and tax identifiers plus address.
#[derive(Debug, Clone, Default, FromRow, Serialize, Deserialize)]
pub struct LeadEmpresarial {
    pub lead_id: Uuid,
    pub cnpj: Option<String>,
    pub cpf: Option<String>,
    pub razao_social: Option<String>,
    pub nome_fantasia: Option<String>,
    /// `MEI`, `ME`, `EPP` or free text.
    pub tipo_empresa: Option<String>,
    pub faturamento_anual: Option<BigDecimal>,
    pub situacao_cadastral: Option<String>,
    pub cep: Option<String>,
    pub logradouro: Option<String>,
    pub numero: Option<String>,
    pub bairro: Option<String>,
    pub cidade: Option<String>,
    pub uf: Option<String>,
}

/// Funnel status and qualification tier.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct LeadQualificacao {
    pub lead_id: Uuid,
    pub status: String,
    pub tier: String,
    pub score: Option<i32>,
    pub motivo_desqualificacao: Option<String>,
}

/// Debt figures and the installment plan derived from them.
#[derive(Debug, Clone, Default, FromRow, Serialize, Deserialize)]
pub struct LeadFinanceiro {
    pub lead_id: Uuid,
    pub valor_divida_total: Option<BigDecimal>,
    pub valor_divida_ativa: Option<BigDecimal>,
    pub anos_em_atraso: Option<i32>,
    pub qtd_parcelas: Option<i32>,
    pub valor_parcela: Option<BigDecimal>,
    pub possui_parcelamento: bool,
}

/// Negotiation state, meeting time and power-of-attorney flags.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct LeadVendas {
    pub lead_id: Uuid,
    pub status_negociacao: String,
    pub valor_proposta: Option<BigDecimal>,
    pub data_reuniao: Option<DateTime<Utc>>,
    pub procuracao_solicitada: bool,
    pub procuracao_ativa: bool,
    pub possui_certificado_digital: Option<bool>,
}

/// Operational bookkeeping.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct LeadAtendimento {
    pub lead_id: Uuid,
    pub ultimo_contato: Option<DateTime<Utc>>,
    pub observacoes: Option<String>,
    pub responsavel: Option<String>,
    pub ultima_consulta_serpro: Option<DateTime<Utc>>,
    /// Human takeover: the bot does not answer while set.
    pub bot_pausado: bool,
}

/// A lead with every satellite row it has.
#[derive(Debug, Clone, Serialize)]
pub struct LeadFull {
    pub lead: Lead,
    pub empresarial: Option<LeadEmpresarial>,
    pub qualificacao: Option<LeadQualificacao>,
    pub financeiro: Option<LeadFinanceiro>,
    pub vendas: Option<LeadVendas>,
    pub atendimento: Option<LeadAtendimento>,
}

/// Row of the admin lead listing.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct LeadSummary {
    pub id: Uuid,
    pub telefone: String,
    pub nome: Option<String>,
    pub email: Option<String>,
    pub origem: Option<String>,
    pub status: Option<String>,
    pub tier: Option<String>,
    pub cnpj: Option<String>,
    pub razao_social: Option<String>,
    pub valor_divida_total: Option<BigDecimal>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct ChatHistoryEntry {
    pub id: i64,
    pub telefone: String,
    pub lead_id: Option<Uuid>,
    /// `user`, `assistant` or `admin`.
    pub role: String,
    pub conteudo: String,
    pub message_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Batch campaign definition.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Disparo {
    pub id: Uuid,
    pub nome: String,
    pub mensagem_template: String,
    /// Serialized `DisparoFiltro`.
    pub filtros: serde_json::Value,
    pub status: String,
    pub agendado_para: Option<DateTime<Utc>>,
    pub total_enviados: i32,
    pub total_falhas: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Per-recipient send ledger row.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct DisparoLog {
    pub id: Uuid,
    pub disparo_id: Uuid,
    pub lead_id: Option<Uuid>,
    pub telefone: String,
    pub status: String,
    pub mensagem: Option<String>,
    pub erro: Option<String>,
    pub enviado_em: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Append-only Serpro lookup log.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct ConsultaSerpro {
    pub id: Uuid,
    pub lead_id: Option<Uuid>,
    pub tipo: String,
    pub documento: String,
    pub status_http: i32,
    pub sucesso: bool,
    pub resposta: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

// ============ Write models ============

#[derive(Debug, Clone, Default, Deserialize)]
pub struct NewLead {
    pub telefone: String,
    pub nome: Option<String>,
    pub email: Option<String>,
    pub origem: Option<String>,
}

/// Partial update of `leads` identity fields.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LeadUpdate {
    pub nome: Option<String>,
    pub email: Option<String>,
    pub origem: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct EmpresarialUpdate {
    pub cnpj: Option<String>,
    pub cpf: Option<String>,
    pub razao_social: Option<String>,
    pub nome_fantasia: Option<String>,
    pub tipo_empresa: Option<String>,
    pub faturamento_anual: Option<BigDecimal>,
    pub situacao_cadastral: Option<String>,
    pub cep: Option<String>,
    pub logradouro: Option<String>,
    pub numero: Option<String>,
    pub bairro: Option<String>,
    pub cidade: Option<String>,
    pub uf: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct QualificacaoUpdate {
    pub status: Option<String>,
    pub tier: Option<String>,
    pub score: Option<i32>,
    pub motivo_desqualificacao: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct FinanceiroUpdate {
    pub valor_divida_total: Option<BigDecimal>,
    pub valor_divida_ativa: Option<BigDecimal>,
    pub anos_em_atraso: Option<i32>,
    pub qtd_parcelas: Option<i32>,
    pub valor_parcela: Option<BigDecimal>,
    pub possui_parcelamento: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct VendasUpdate {
    pub status_negociacao: Option<String>,
    pub valor_proposta: Option<BigDecimal>,
    pub data_reuniao: Option<DateTime<Utc>>,
    pub procuracao_solicitada: Option<bool>,
    pub procuracao_ativa: Option<bool>,
    pub possui_certificado_digital: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AtendimentoUpdate {
    pub observacoes: Option<String>,
    pub responsavel: Option<String>,
    pub bot_pausado: Option<bool>,
}

#[derive(Debug, Clone)]
pub struct NewChatEntry<'a> {
    pub telefone: &'a str,
    pub lead_id: Option<Uuid>,
    pub role: &'a str,
    pub conteudo: &'a str,
    pub message_id: Option<&'a str>,
}

// ============ API Models ============

/// Public lead intake form.
#[derive(Debug, Clone, Deserialize)]
pub struct LeadFormRequest {
    pub nome: String,
    pub telefone: String,
    pub email: Option<String>,
    pub cnpj: Option<String>,
    pub razao_social: Option<String>,
    /// e.g. `MEI`, `ME`, `EPP`; drives the minimum installment.
    pub tipo_empresa: Option<String>,
    pub faturamento_anual: Option<BigDecimal>,
    pub divida_estimada: Option<BigDecimal>,
    pub parcelas_desejadas: Option<i32>,
    pub cidade: Option<String>,
    pub uf: Option<String>,
    pub origem: Option<String>,
}

/// MEI-specific intake form.
#[derive(Debug, Clone, Deserialize)]
pub struct MeiFormRequest {
    pub nome: String,
    pub telefone: String,
    pub email: Option<String>,
    pub cnpj: String,
    #[serde(default)]
    pub possui_dividas: bool,
    pub valor_divida: Option<BigDecimal>,
    pub anos_em_atraso: Option<i32>,
    pub parcelas_desejadas: Option<i32>,
}

/// e-CAC / power-of-attorney form.
#[derive(Debug, Clone, Deserialize)]
pub struct EcacFormRequest {
    pub telefone: String,
    pub cpf: String,
    pub cnpj: Option<String>,
    #[serde(default)]
    pub possui_certificado_digital: bool,
    #[serde(default)]
    pub autoriza_procuracao: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct LeadFormResponse {
    pub success: bool,
    pub lead_id: Uuid,
    pub tier: String,
    pub message: String,
}

/// Query string of `GET /api/admin/leads`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LeadListQuery {
    pub status: Option<String>,
    pub tier: Option<String>,
    pub busca: Option<String>,
    pub page: Option<i64>,
    pub per_page: Option<i64>,
}

/// Deepest page the admin listing serves.
pub const MAX_PAGE: i64 = 10_000;

impl LeadListQuery {
    /// Page number clamped to 1..=MAX_PAGE and page size clamped to 1..=100.
    pub fn pagination(&self) -> (i64, i64) {
        let page = self.page.unwrap_or(1).clamp(1, MAX_PAGE);
        let per_page = self.per_page.unwrap_or(25).clamp(1, 100);
        (page, per_page)
    }

    /// Row offset for the clamped page.
    pub fn offset(&self) -> i64 {
        let (page, per_page) = self.pagination();
        (page - 1) * per_page
    }
}

#[derive(Debug, Serialize)]
pub struct LeadListResponse {
    pub leads: Vec<LeadSummary>,
    pub total: i64,
    pub page: i64,
    pub per_page: i64,
}

/// Admin partial update; each section is optional.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpdateLeadRequest {
    pub lead: Option<LeadUpdate>,
    pub empresarial: Option<EmpresarialUpdate>,
    pub qualificacao: Option<QualificacaoUpdate>,
    pub financeiro: Option<FinanceiroUpdate>,
    pub vendas: Option<VendasUpdate>,
    pub atendimento: Option<AtendimentoUpdate>,
}

#[derive(Debug, Clone, Serialize, FromRow)]
pub struct CountByKey {
    pub chave: String,
    pub total: i64,
}

#[derive(Debug, Serialize)]
pub struct DashboardStats {
    pub total_leads: i64,
    pub leads_hoje: i64,
    pub por_status: Vec<CountByKey>,
    pub por_tier: Vec<CountByKey>,
    pub disparos_ativos: i64,
    pub divida_total: Option<BigDecimal>,
}
