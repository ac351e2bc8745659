//! Prompt-driven chat agents. One agent per lead state.

use crate::errors::AppError;
use crate::llm_client::{LlmClient, LlmMessage};
use crate::models::{ChatHistoryEntry, LeadFull};
use crate::qualification::LeadState;
use crate::templates::format_brl;
use serde::Serialize;

/// Reply used when no LLM is configured or the LLM call fails.
pub const FALLBACK_REPLY: &str =
    "Olá! Recebemos sua mensagem e um especialista da nossa equipe vai te responder em breve.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentKind {
    /// First contact: presents the service and collects company data.
    Atendimento,
    /// Qualified lead: digs into the debt and books a meeting.
    Qualificacao,
    /// Customer: follow-up on power of attorney and installments.
    Cliente,
}

impl AgentKind {
    pub fn for_state(state: LeadState) -> Self {
        match state {
            LeadState::Lead => AgentKind::Atendimento,
            LeadState::Qualified => AgentKind::Qualificacao,
            LeadState::Customer => AgentKind::Cliente,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AgentKind::Atendimento => "atendimento",
            AgentKind::Qualificacao => "qualificacao",
            AgentKind::Cliente => "cliente",
        }
    }

    fn instructions(&self) -> &'static str {
        match self {
            AgentKind::Atendimento => {
                "Você é a assistente virtual de um escritório que regulariza dívidas de \
                 empresas (MEI, ME e EPP) com a Receita Federal. Seu objetivo neste primeiro \
                 contato é: apresentar o serviço em poucas palavras, descobrir o nome do \
                 responsável, o CNPJ da empresa e se existem débitos em atraso. Faça uma \
                 pergunta por vez."
            }
            AgentKind::Qualificacao => {
                "Você é a assistente virtual de um escritório que regulariza dívidas de \
                 empresas com a Receita Federal. Este lead já foi qualificado. Confirme o valor \
                 aproximado da dívida, explique que existe possibilidade de parcelamento e \
                 convide para uma reunião curta com um especialista, pedindo o melhor dia e \
                 horário."
            }
            AgentKind::Cliente => {
                "Você é a assistente virtual de um escritório que regulariza dívidas de \
                 empresas com a Receita Federal. Esta pessoa já é cliente. Ajude com dúvidas \
                 sobre a procuração no e-CAC, parcelas e andamento do processo. Se não souber \
                 responder algo específico do processo, diga que vai encaminhar para o \
                 especialista responsável."
            }
        }
    }
}

/// Lead facts injected into the system prompt.
#[derive(Debug, Clone, Default, Serialize)]
pub struct AgentContext {
    pub nome: Option<String>,
    pub empresa: Option<String>,
    pub cnpj: Option<String>,
    pub tipo_empresa: Option<String>,
    pub divida_total: Option<String>,
    pub parcelas: Option<String>,
    pub status: Option<String>,
    pub tier: Option<String>,
    pub reuniao: Option<String>,
    pub procuracao_ativa: bool,
}

impl AgentContext {
    pub fn from_lead(lead: &LeadFull) -> Self {
        let empresarial = lead.empresarial.as_ref();
        let financeiro = lead.financeiro.as_ref();
        let vendas = lead.vendas.as_ref();

        Self {
            nome: lead.lead.nome.clone(),
            empresa: empresarial
                .and_then(|e| e.nome_fantasia.clone().or_else(|| e.razao_social.clone())),
            cnpj: empresarial.and_then(|e| e.cnpj.clone()),
            tipo_empresa: empresarial.and_then(|e| e.tipo_empresa.clone()),
            divida_total: financeiro
                .and_then(|f| f.valor_divida_total.as_ref())
                .map(format_brl),
            parcelas: financeiro.and_then(|f| match (f.qtd_parcelas, &f.valor_parcela) {
                (Some(qtd), Some(valor)) => Some(format!("{}x de {}", qtd, format_brl(valor))),
                _ => None,
            }),
            status: lead.qualificacao.as_ref().map(|q| q.status.clone()),
            tier: lead.qualificacao.as_ref().map(|q| q.tier.clone()),
            reuniao: vendas
                .and_then(|v| v.data_reuniao)
                .map(|d| d.format("%d/%m/%Y %H:%M UTC").to_string()),
            procuracao_ativa: vendas.map(|v| v.procuracao_ativa).unwrap_or(false),
        }
    }

    fn describe(&self) -> String {
        let mut lines = Vec::new();
        let mut push = |label: &str, value: &Option<String>| {
            if let Some(v) = value {
                lines.push(format!("- {}: {}", label, v));
            }
        };
        push("Nome", &self.nome);
        push("Empresa", &self.empresa);
        push("CNPJ", &self.cnpj);
        push("Porte", &self.tipo_empresa);
        push("Dívida estimada", &self.divida_total);
        push("Parcelamento simulado", &self.parcelas);
        push("Status no funil", &self.status);
        push("Classificação", &self.tier);
        push("Reunião agendada", &self.reuniao);
        if self.procuracao_ativa {
            lines.push("- Procuração e-CAC: ativa".to_string());
        }

        if lines.is_empty() {
            "Ainda não temos dados deste contato.".to_string()
        } else {
            lines.join("\n")
        }
    }
}

/// Builds the system prompt for an agent.
pub fn system_prompt(kind: AgentKind, ctx: &AgentContext) -> String {
    format!(
        "{}\n\nResponda sempre em português do Brasil, em no máximo 3 frases curtas, \
         em tom cordial e sem prometer valores ou prazos.\n\nDados conhecidos do contato:\n{}",
        kind.instructions(),
        ctx.describe()
    )
}

/// Builds the full message list: system prompt, history, then the incoming text.
pub fn build_messages(
    kind: AgentKind,
    ctx: &AgentContext,
    history: &[ChatHistoryEntry],
    incoming: &str,
) -> Vec<LlmMessage> {
    let mut messages = Vec::with_capacity(history.len() + 2);
    messages.push(LlmMessage::system(system_prompt(kind, ctx)));

    for entry in history {
        match entry.role.as_str() {
            "user" => messages.push(LlmMessage::user(entry.conteudo.clone())),
            "assistant" | "admin" => messages.push(LlmMessage::assistant(entry.conteudo.clone())),
            _ => {}
        }
    }

    messages.push(LlmMessage::user(incoming));
    messages
}

/// Runs an agent and returns the reply text.
pub async fn respond(
    llm: &LlmClient,
    kind: AgentKind,
    ctx: &AgentContext,
    history: &[ChatHistoryEntry],
    incoming: &str,
) -> Result<String, AppError> {
    let messages = build_messages(kind, ctx, history, incoming);
    tracing::info!(
        "Running agent '{}' with {} history messages",
        kind.as_str(),
        history.len()
    );
    llm.chat(&messages).await
}
