//! Funnel classification: statuses, MQL/ICP/SQL tiers, the lead state used by the
//! chat router, and installment plans for tax debt.

use crate::models::LeadFull;
use crate::validation::is_valid_cnpj;
use bigdecimal::{BigDecimal, ToPrimitive, Zero};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Funnel status stored in `leads_qualificacao.status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LeadStatus {
    Novo,
    EmAtendimento,
    Qualificado,
    Desqualificado,
    Cliente,
}

impl LeadStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LeadStatus::Novo => "novo",
            LeadStatus::EmAtendimento => "em_atendimento",
            LeadStatus::Qualificado => "qualificado",
            LeadStatus::Desqualificado => "desqualificado",
            LeadStatus::Cliente => "cliente",
        }
    }
}

impl FromStr for LeadStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "novo" => Ok(LeadStatus::Novo),
            "em_atendimento" => Ok(LeadStatus::EmAtendimento),
            "qualificado" => Ok(LeadStatus::Qualificado),
            "desqualificado" => Ok(LeadStatus::Desqualificado),
            "cliente" => Ok(LeadStatus::Cliente),
            other => Err(format!("Unknown lead status '{}'", other)),
        }
    }
}

impl fmt::Display for LeadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Marketing/sales funnel tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum QualificationTier {
    /// Marketing-qualified: filled a form or talked to the bot.
    #[serde(rename = "MQL")]
    Mql,
    /// Matches the ideal customer profile.
    #[serde(rename = "ICP")]
    Icp,
    /// Sales-qualified: in an active negotiation.
    #[serde(rename = "SQL")]
    Sql,
}

impl QualificationTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            QualificationTier::Mql => "MQL",
            QualificationTier::Icp => "ICP",
            QualificationTier::Sql => "SQL",
        }
    }
}

impl FromStr for QualificationTier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "MQL" => Ok(QualificationTier::Mql),
            "ICP" => Ok(QualificationTier::Icp),
            "SQL" => Ok(QualificationTier::Sql),
            other => Err(format!("Unknown qualification tier '{}'", other)),
        }
    }
}

impl fmt::Display for QualificationTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a lead stands for the chat router.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LeadState {
    Lead,
    Qualified,
    Customer,
}

/// Negotiation states that make a lead sales-qualified.
const ACTIVE_NEGOTIATION: &[&str] = &["em_negociacao", "proposta_enviada", "fechado"];

/// Classifies the tier of a lead from its current data.
pub fn classify_tier(lead: &LeadFull, icp_min_divida: i64) -> QualificationTier {
    if let Some(vendas) = &lead.vendas {
        if vendas.data_reuniao.is_some()
            || ACTIVE_NEGOTIATION.contains(&vendas.status_negociacao.as_str())
        {
            return QualificationTier::Sql;
        }
    }

    let has_cnpj = lead
        .empresarial
        .as_ref()
        .and_then(|e| e.cnpj.as_deref())
        .map(is_valid_cnpj)
        .unwrap_or(false);

    let debt_over_threshold = lead
        .financeiro
        .as_ref()
        .and_then(|f| f.valor_divida_total.as_ref())
        .map(|total| *total >= BigDecimal::from(icp_min_divida))
        .unwrap_or(false);

    if has_cnpj && debt_over_threshold {
        QualificationTier::Icp
    } else {
        QualificationTier::Mql
    }
}

/// Lead state used to pick the chat agent.
pub fn lead_state(lead: &LeadFull) -> LeadState {
    let negotiation_closed = lead
        .vendas
        .as_ref()
        .map(|v| v.status_negociacao == "fechado")
        .unwrap_or(false);

    let status = lead
        .qualificacao
        .as_ref()
        .and_then(|q| q.status.parse::<LeadStatus>().ok());
    let tier = lead
        .qualificacao
        .as_ref()
        .and_then(|q| q.tier.parse::<QualificationTier>().ok());

    if negotiation_closed || status == Some(LeadStatus::Cliente) {
        return LeadState::Customer;
    }

    if status == Some(LeadStatus::Qualificado)
        || matches!(tier, Some(QualificationTier::Icp) | Some(QualificationTier::Sql))
    {
        return LeadState::Qualified;
    }

    LeadState::Lead
}

/// Maximum number of installments offered.
pub const MAX_PARCELAS: i64 = 60;

/// An installment plan for a debt.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Parcelamento {
    pub parcelas: i32,
    pub valor_parcela: BigDecimal,
    pub valor_minimo_parcela: BigDecimal,
    pub max_parcelas: i32,
}

/// Minimum installment value for a company type.
pub fn valor_minimo_parcela(tipo_empresa: Option<&str>) -> BigDecimal {
    match tipo_empresa.map(|t| t.trim().to_uppercase()) {
        Some(t) if t == "MEI" => BigDecimal::from(50),
        _ => BigDecimal::from(300),
    }
}

/// Computes an installment plan.
///
/// The requested count is clamped to `[1, max]`, where `max` is the smaller of
/// 60 and the number of installments that keep each one above the minimum.
/// Returns `None` for zero or negative debt.
pub fn calcular_parcelamento(
    total: &BigDecimal,
    tipo_empresa: Option<&str>,
    parcelas_desejadas: Option<i32>,
) -> Option<Parcelamento> {
    if total <= &BigDecimal::zero() {
        return None;
    }

    let minimo = valor_minimo_parcela(tipo_empresa);
    let by_minimum = (total / &minimo).to_i64().unwrap_or(0);
    let max_parcelas = by_minimum.clamp(1, MAX_PARCELAS);

    let requested = parcelas_desejadas.map(i64::from).unwrap_or(max_parcelas);
    let parcelas = requested.clamp(1, max_parcelas);

    let valor_parcela = (total / BigDecimal::from(parcelas)).round(2);

    Some(Parcelamento {
        parcelas: parcelas as i32,
        valor_parcela,
        valor_minimo_parcela: minimo,
        max_parcelas: max_parcelas as i32,
    })
}
