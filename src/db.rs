use sqlx::{postgres::PgPoolOptions, PgPool};

/// Schema statements, applied in order at startup. Every statement is idempotent.
pub const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS leads (
        id UUID PRIMARY KEY DEFAULT gen_random_uuid(),
        telefone TEXT NOT NULL UNIQUE,
        nome TEXT,
        email TEXT,
        origem TEXT,
        created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
        updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS leads_empresarial (
        id UUID PRIMARY KEY DEFAULT gen_random_uuid(),
        lead_id UUID NOT NULL UNIQUE REFERENCES leads(id) ON DELETE CASCADE,
        cnpj TEXT,
        cpf TEXT,
        razao_social TEXT,
        nome_fantasia TEXT,
        tipo_empresa TEXT,
        faturamento_anual NUMERIC(14, 2),
        situacao_cadastral TEXT,
        cep TEXT,
        logradouro TEXT,
        numero TEXT,
        bairro TEXT,
        cidade TEXT,
        uf CHAR(2),
        updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS leads_qualificacao (
        id UUID PRIMARY KEY DEFAULT gen_random_uuid(),
        lead_id UUID NOT NULL UNIQUE REFERENCES leads(id) ON DELETE CASCADE,
        status TEXT NOT NULL DEFAULT 'novo',
        tier TEXT NOT NULL DEFAULT 'MQL',
        score INTEGER,
        motivo_desqualificacao TEXT,
        updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS leads_financeiro (
        id UUID PRIMARY KEY DEFAULT gen_random_uuid(),
        lead_id UUID NOT NULL UNIQUE REFERENCES leads(id) ON DELETE CASCADE,
        valor_divida_total NUMERIC(14, 2),
        valor_divida_ativa NUMERIC(14, 2),
        anos_em_atraso INTEGER,
        qtd_parcelas INTEGER,
        valor_parcela NUMERIC(14, 2),
        possui_parcelamento BOOLEAN NOT NULL DEFAULT false,
        updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS leads_vendas (
        id UUID PRIMARY KEY DEFAULT gen_random_uuid(),
        lead_id UUID NOT NULL UNIQUE REFERENCES leads(id) ON DELETE CASCADE,
        status_negociacao TEXT NOT NULL DEFAULT 'aberta',
        valor_proposta NUMERIC(14, 2),
        data_reuniao TIMESTAMPTZ,
        procuracao_solicitada BOOLEAN NOT NULL DEFAULT false,
        procuracao_ativa BOOLEAN NOT NULL DEFAULT false,
        possui_certificado_digital BOOLEAN,
        updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS leads_atendimento (
        id UUID PRIMARY KEY DEFAULT gen_random_uuid(),
        lead_id UUID NOT NULL UNIQUE REFERENCES leads(id) ON DELETE CASCADE,
        ultimo_contato TIMESTAMPTZ,
        observacoes TEXT,
        responsavel TEXT,
        ultima_consulta_serpro TIMESTAMPTZ,
        bot_pausado BOOLEAN NOT NULL DEFAULT false,
        updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS disparos (
        id UUID PRIMARY KEY DEFAULT gen_random_uuid(),
        nome TEXT NOT NULL,
        mensagem_template TEXT NOT NULL,
        filtros JSONB NOT NULL DEFAULT '{}'::jsonb,
        status TEXT NOT NULL DEFAULT 'rascunho',
        agendado_para TIMESTAMPTZ,
        total_enviados INTEGER NOT NULL DEFAULT 0,
        total_falhas INTEGER NOT NULL DEFAULT 0,
        created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
        updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS disparo_logs (
        id UUID PRIMARY KEY DEFAULT gen_random_uuid(),
        disparo_id UUID NOT NULL REFERENCES disparos(id) ON DELETE CASCADE,
        lead_id UUID REFERENCES leads(id) ON DELETE CASCADE,
        telefone TEXT NOT NULL,
        status TEXT NOT NULL DEFAULT 'pendente',
        mensagem TEXT,
        erro TEXT,
        enviado_em TIMESTAMPTZ,
        created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
        UNIQUE (disparo_id, telefone)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS consultas_serpro (
        id UUID PRIMARY KEY DEFAULT gen_random_uuid(),
        lead_id UUID REFERENCES leads(id) ON DELETE CASCADE,
        tipo TEXT NOT NULL,
        documento TEXT NOT NULL,
        status_http INTEGER NOT NULL,
        sucesso BOOLEAN NOT NULL,
        resposta JSONB,
        created_at TIMESTAMPTZ NOT NULL DEFAULT now()
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS chat_history (
        id BIGSERIAL PRIMARY KEY,
        telefone TEXT NOT NULL,
        lead_id UUID REFERENCES leads(id) ON DELETE CASCADE,
        role TEXT NOT NULL,
        conteudo TEXT NOT NULL,
        message_id TEXT,
        created_at TIMESTAMPTZ NOT NULL DEFAULT now()
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_chat_history_telefone ON chat_history (telefone, created_at)",
    "CREATE INDEX IF NOT EXISTS idx_consultas_serpro_lead ON consultas_serpro (lead_id, created_at)",
    "CREATE INDEX IF NOT EXISTS idx_disparos_status ON disparos (status, agendado_para)",
    "CREATE INDEX IF NOT EXISTS idx_leads_created_at ON leads (created_at)",
];

/// Tables the service owns, used by the schema inspector.
pub const CRM_TABLES: &[&str] = &[
    "leads",
    "leads_empresarial",
    "leads_qualificacao",
    "leads_financeiro",
    "leads_vendas",
    "leads_atendimento",
    "disparos",
    "disparo_logs",
    "consultas_serpro",
    "chat_history",
];

pub struct Database {
    pub pool: PgPool,
}

impl Database {
    pub async fn new(database_url: &str) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await?;

        sqlx::query("SELECT 1").execute(&pool).await?;

        Ok(Self { pool })
    }

    /// Applies the schema statements in order.
    pub async fn apply_schema(&self) -> anyhow::Result<()> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        tracing::info!("Schema applied ({} statements)", SCHEMA.len());
        Ok(())
    }
}
