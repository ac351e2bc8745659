use crate::errors::{AppError, ResultExt};
use crate::models::*;
use crate::qualification::{classify_tier, QualificationTier};
use bigdecimal::BigDecimal;
use sqlx::{PgPool, Postgres, QueryBuilder};
use uuid::Uuid;

/// A satellite column and, for NOT NULL columns, the value used when a new row
/// is inserted without it.
struct Col {
    name: &'static str,
    default: Option<&'static str>,
}

const fn col(name: &'static str) -> Col {
    Col {
        name,
        default: None,
    }
}

const fn col_default(name: &'static str, default: &'static str) -> Col {
    Col {
        name,
        default: Some(default),
    }
}

const EMPRESARIAL_COLS: &[Col] = &[
    col("cnpj"),
    col("cpf"),
    col("razao_social"),
    col("nome_fantasia"),
    col("tipo_empresa"),
    col("faturamento_anual"),
    col("situacao_cadastral"),
    col("cep"),
    col("logradouro"),
    col("numero"),
    col("bairro"),
    col("cidade"),
    col("uf"),
];

const QUALIFICACAO_COLS: &[Col] = &[
    col_default("status", "'novo'"),
    col_default("tier", "'MQL'"),
    col("score"),
    col("motivo_desqualificacao"),
];

const FINANCEIRO_COLS: &[Col] = &[
    col("valor_divida_total"),
    col("valor_divida_ativa"),
    col("anos_em_atraso"),
    col("qtd_parcelas"),
    col("valor_parcela"),
    col_default("possui_parcelamento", "false"),
];

const VENDAS_COLS: &[Col] = &[
    col_default("status_negociacao", "'aberta'"),
    col("valor_proposta"),
    col("data_reuniao"),
    col_default("procuracao_solicitada", "false"),
    col_default("procuracao_ativa", "false"),
    col("possui_certificado_digital"),
];

const ATENDIMENTO_COLS: &[Col] = &[
    col("observacoes"),
    col("responsavel"),
    col_default("bot_pausado", "false"),
];

/// Builds the one-row-per-lead upsert for a satellite table.
///
/// `$1` is the lead id and `$2..` follow `cols`. A NULL parameter never
/// overwrites a stored value. With `prefer_existing`, stored values also win over
/// new ones, so the statement only fills gaps.
fn satellite_upsert_sql(table: &str, cols: &[Col], prefer_existing: bool) -> String {
    let names: Vec<&str> = cols.iter().map(|c| c.name).collect();

    let values: Vec<String> = cols
        .iter()
        .enumerate()
        .map(|(i, c)| match c.default {
            Some(default) => format!("COALESCE(${}, {})", i + 2, default),
            None => format!("${}", i + 2),
        })
        .collect();

    let updates: Vec<String> = cols
        .iter()
        .enumerate()
        .map(|(i, c)| {
            if prefer_existing {
                format!("{col} = COALESCE({table}.{col}, ${n})", col = c.name, table = table, n = i + 2)
            } else {
                format!("{col} = COALESCE(${n}, {table}.{col})", col = c.name, table = table, n = i + 2)
            }
        })
        .collect();

    format!(
        "INSERT INTO {table} (lead_id, {names}) VALUES ($1, {values}) \
         ON CONFLICT (lead_id) DO UPDATE SET {updates}, updated_at = now()",
        table = table,
        names = names.join(", "),
        values = values.join(", "),
        updates = updates.join(", ")
    )
}

/// Appends the listing filters shared by the count and page queries.
fn push_lead_filters(qb: &mut QueryBuilder<'_, Postgres>, query: &LeadListQuery) {
    qb.push(
        " FROM leads l \
         LEFT JOIN leads_qualificacao q ON q.lead_id = l.id \
         LEFT JOIN leads_empresarial e ON e.lead_id = l.id \
         LEFT JOIN leads_financeiro f ON f.lead_id = l.id \
         WHERE 1=1",
    );

    if let Some(status) = query.status.as_deref().filter(|s| !s.is_empty()) {
        qb.push(" AND q.status = ");
        qb.push_bind(status.to_lowercase());
    }

    if let Some(tier) = query.tier.as_deref().filter(|s| !s.is_empty()) {
        qb.push(" AND q.tier = ");
        qb.push_bind(tier.to_uppercase());
    }

    if let Some(busca) = query.busca.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
        let pattern = format!("%{}%", crate::validation::escape_like(busca));
        let digits = crate::validation::digits_only(busca);

        qb.push(" AND (l.nome ILIKE ");
        qb.push_bind(pattern.clone());
        qb.push(" ESCAPE '\\' OR l.email ILIKE ");
        qb.push_bind(pattern.clone());
        qb.push(" ESCAPE '\\' OR e.razao_social ILIKE ");
        qb.push_bind(pattern);
        qb.push(" ESCAPE '\\'");
        if !digits.is_empty() {
            let digit_pattern = format!("%{}%", digits);
            qb.push(" OR l.telefone LIKE ");
            qb.push_bind(digit_pattern.clone());
            qb.push(" OR e.cnpj LIKE ");
            qb.push_bind(digit_pattern);
        }
        qb.push(")");
    }
}

/// Database storage for leads and their satellite tables.
#[derive(Clone)]
pub struct LeadStorage {
    pool: PgPool,
}

impl LeadStorage {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Creates the lead or merges into the existing one with the same phone.
    /// The first recorded origin is kept.
    pub async fn upsert_lead(&self, lead: &NewLead) -> Result<Uuid, AppError> {
        let id = sqlx::query_scalar::<_, Uuid>(
            r#"
            INSERT INTO leads (telefone, nome, email, origem)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (telefone) DO UPDATE SET
                nome = COALESCE($2, leads.nome),
                email = COALESCE($3, leads.email),
                origem = COALESCE(leads.origem, $4),
                updated_at = now()
            RETURNING id
            "#,
        )
        .bind(&lead.telefone)
        .bind(&lead.nome)
        .bind(&lead.email)
        .bind(&lead.origem)
        .fetch_one(&self.pool)
        .await
        .with_context(|| format!("upserting lead {}", lead.telefone))?;

        tracing::debug!("Upserted lead {} -> {}", lead.telefone, id);
        Ok(id)
    }

    /// Partial update of the identity row. Returns false when the lead does not exist.
    pub async fn update_lead(&self, id: Uuid, update: &LeadUpdate) -> Result<bool, AppError> {
        let result = sqlx::query(
            r#"
            UPDATE leads SET
                nome = COALESCE($2, nome),
                email = COALESCE($3, email),
                origem = COALESCE($4, origem),
                updated_at = now()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(&update.nome)
        .bind(&update.email)
        .bind(&update.origem)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn upsert_empresarial(
        &self,
        lead_id: Uuid,
        data: &EmpresarialUpdate,
    ) -> Result<(), AppError> {
        self.write_empresarial(lead_id, data, false).await
    }

    /// Fills only the empresarial fields that are still empty.
    pub async fn fill_empresarial(
        &self,
        lead_id: Uuid,
        data: &EmpresarialUpdate,
    ) -> Result<(), AppError> {
        self.write_empresarial(lead_id, data, true).await
    }

    async fn write_empresarial(
        &self,
        lead_id: Uuid,
        data: &EmpresarialUpdate,
        prefer_existing: bool,
    ) -> Result<(), AppError> {
        let sql = satellite_upsert_sql("leads_empresarial", EMPRESARIAL_COLS, prefer_existing);
        sqlx::query(&sql)
            .bind(lead_id)
            .bind(&data.cnpj)
            .bind(&data.cpf)
            .bind(&data.razao_social)
            .bind(&data.nome_fantasia)
            .bind(&data.tipo_empresa)
            .bind(&data.faturamento_anual)
            .bind(&data.situacao_cadastral)
            .bind(&data.cep)
            .bind(&data.logradouro)
            .bind(&data.numero)
            .bind(&data.bairro)
            .bind(&data.cidade)
            .bind(&data.uf)
            .execute(&self.pool)
            .await
            .context("upserting leads_empresarial")?;
        Ok(())
    }

    pub async fn upsert_qualificacao(
        &self,
        lead_id: Uuid,
        data: &QualificacaoUpdate,
    ) -> Result<(), AppError> {
        let sql = satellite_upsert_sql("leads_qualificacao", QUALIFICACAO_COLS, false);
        sqlx::query(&sql)
            .bind(lead_id)
            .bind(&data.status)
            .bind(&data.tier)
            .bind(data.score)
            .bind(&data.motivo_desqualificacao)
            .execute(&self.pool)
            .await
            .context("upserting leads_qualificacao")?;
        Ok(())
    }

    pub async fn upsert_financeiro(
        &self,
        lead_id: Uuid,
        data: &FinanceiroUpdate,
    ) -> Result<(), AppError> {
        let sql = satellite_upsert_sql("leads_financeiro", FINANCEIRO_COLS, false);
        sqlx::query(&sql)
            .bind(lead_id)
            .bind(&data.valor_divida_total)
            .bind(&data.valor_divida_ativa)
            .bind(data.anos_em_atraso)
            .bind(data.qtd_parcelas)
            .bind(&data.valor_parcela)
            .bind(data.possui_parcelamento)
            .execute(&self.pool)
            .await
            .context("upserting leads_financeiro")?;
        Ok(())
    }

    pub async fn upsert_vendas(&self, lead_id: Uuid, data: &VendasUpdate) -> Result<(), AppError> {
        let sql = satellite_upsert_sql("leads_vendas", VENDAS_COLS, false);
        sqlx::query(&sql)
            .bind(lead_id)
            .bind(&data.status_negociacao)
            .bind(&data.valor_proposta)
            .bind(data.data_reuniao)
            .bind(data.procuracao_solicitada)
            .bind(data.procuracao_ativa)
            .bind(data.possui_certificado_digital)
            .execute(&self.pool)
            .await
            .context("upserting leads_vendas")?;
        Ok(())
    }

    pub async fn upsert_atendimento(
        &self,
        lead_id: Uuid,
        data: &AtendimentoUpdate,
    ) -> Result<(), AppError> {
        let sql = satellite_upsert_sql("leads_atendimento", ATENDIMENTO_COLS, false);
        sqlx::query(&sql)
            .bind(lead_id)
            .bind(&data.observacoes)
            .bind(&data.responsavel)
            .bind(data.bot_pausado)
            .execute(&self.pool)
            .await
            .context("upserting leads_atendimento")?;
        Ok(())
    }

    /// Stamps the last contact time.
    pub async fn touch_ultimo_contato(&self, lead_id: Uuid) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO leads_atendimento (lead_id, ultimo_contato)
            VALUES ($1, now())
            ON CONFLICT (lead_id) DO UPDATE SET ultimo_contato = now(), updated_at = now()
            "#,
        )
        .bind(lead_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Stamps the last Serpro lookup time.
    pub async fn set_ultima_consulta(&self, lead_id: Uuid) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO leads_atendimento (lead_id, ultima_consulta_serpro)
            VALUES ($1, now())
            ON CONFLICT (lead_id) DO UPDATE SET ultima_consulta_serpro = now(), updated_at = now()
            "#,
        )
        .bind(lead_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn find_by_phone(&self, telefone: &str) -> Result<Option<Lead>, AppError> {
        let lead = sqlx::query_as::<_, Lead>("SELECT * FROM leads WHERE telefone = $1")
            .bind(telefone)
            .fetch_optional(&self.pool)
            .await?;
        Ok(lead)
    }

    /// Company type already recorded for a lead.
    pub async fn tipo_empresa(&self, lead_id: Uuid) -> Result<Option<String>, AppError> {
        let tipo = sqlx::query_scalar::<_, Option<String>>(
            "SELECT tipo_empresa FROM leads_empresarial WHERE lead_id = $1",
        )
        .bind(lead_id)
        .fetch_optional(&self.pool)
        .await?
        .flatten();
        Ok(tipo)
    }

    /// Loads a lead with all its satellite rows.
    /// Uses one query per table; satellites are optional.
    pub async fn get_lead_full(&self, id: Uuid) -> Result<Option<LeadFull>, AppError> {
        let Some(lead) = sqlx::query_as::<_, Lead>("SELECT * FROM leads WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
        else {
            return Ok(None);
        };

        let empresarial = sqlx::query_as::<_, LeadEmpresarial>(
            "SELECT * FROM leads_empresarial WHERE lead_id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        let qualificacao = sqlx::query_as::<_, LeadQualificacao>(
            "SELECT * FROM leads_qualificacao WHERE lead_id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        let financeiro = sqlx::query_as::<_, LeadFinanceiro>(
            "SELECT * FROM leads_financeiro WHERE lead_id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        let vendas =
            sqlx::query_as::<_, LeadVendas>("SELECT * FROM leads_vendas WHERE lead_id = $1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;

        let atendimento = sqlx::query_as::<_, LeadAtendimento>(
            "SELECT * FROM leads_atendimento WHERE lead_id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(Some(LeadFull {
            lead,
            empresarial,
            qualificacao,
            financeiro,
            vendas,
            atendimento,
        }))
    }

    /// Filtered, paginated admin listing, newest first.
    pub async fn list_leads(
        &self,
        query: &LeadListQuery,
    ) -> Result<(Vec<LeadSummary>, i64), AppError> {
        let (_, per_page) = query.pagination();

        let mut count_qb = QueryBuilder::<Postgres>::new("SELECT COUNT(*)");
        push_lead_filters(&mut count_qb, query);
        let total = count_qb
            .build_query_scalar::<i64>()
            .fetch_one(&self.pool)
            .await
            .context("counting leads")?;

        let mut qb = QueryBuilder::<Postgres>::new(
            "SELECT l.id, l.telefone, l.nome, l.email, l.origem, q.status, q.tier, \
             e.cnpj, e.razao_social, f.valor_divida_total, l.created_at",
        );
        push_lead_filters(&mut qb, query);
        qb.push(" ORDER BY l.created_at DESC LIMIT ");
        qb.push_bind(per_page);
        qb.push(" OFFSET ");
        qb.push_bind(query.offset());

        let leads = qb
            .build_query_as::<LeadSummary>()
            .fetch_all(&self.pool)
            .await
            .context("listing leads")?;

        Ok((leads, total))
    }

    /// Deletes a lead; satellites, chat and logs cascade.
    pub async fn delete_lead(&self, id: Uuid) -> Result<bool, AppError> {
        let result = sqlx::query("DELETE FROM leads WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn dashboard_stats(&self) -> Result<DashboardStats, AppError> {
        let total_leads = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM leads")
            .fetch_one(&self.pool)
            .await?;

        let leads_hoje = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM leads WHERE created_at >= date_trunc('day', now())",
        )
        .fetch_one(&self.pool)
        .await?;

        let por_status = sqlx::query_as::<_, CountByKey>(
            "SELECT status AS chave, COUNT(*) AS total FROM leads_qualificacao \
             GROUP BY status ORDER BY total DESC",
        )
        .fetch_all(&self.pool)
        .await?;

        let por_tier = sqlx::query_as::<_, CountByKey>(
            "SELECT tier AS chave, COUNT(*) AS total FROM leads_qualificacao \
             GROUP BY tier ORDER BY total DESC",
        )
        .fetch_all(&self.pool)
        .await?;

        let disparos_ativos =
            sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM disparos WHERE status = 'ativo'")
                .fetch_one(&self.pool)
                .await?;

        let divida_total = sqlx::query_scalar::<_, Option<BigDecimal>>(
            "SELECT SUM(valor_divida_total) FROM leads_financeiro",
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(DashboardStats {
            total_leads,
            leads_hoje,
            por_status,
            por_tier,
            disparos_ativos,
            divida_total,
        })
    }

    /// Reclassifies the tier from current data and stores it.
    pub async fn refresh_tier(
        &self,
        lead_id: Uuid,
        icp_min_divida: i64,
    ) -> Result<Option<QualificationTier>, AppError> {
        let Some(full) = self.get_lead_full(lead_id).await? else {
            return Ok(None);
        };

        let tier = classify_tier(&full, icp_min_divida);
        self.upsert_qualificacao(
            lead_id,
            &QualificacaoUpdate {
                tier: Some(tier.as_str().to_string()),
                ..Default::default()
            },
        )
        .await?;

        tracing::debug!("Lead {} classified as {}", lead_id, tier);
        Ok(Some(tier))
    }

    pub async fn append_chat(&self, entry: &NewChatEntry<'_>) -> Result<ChatHistoryEntry, AppError> {
        let row = sqlx::query_as::<_, ChatHistoryEntry>(
            r#"
            INSERT INTO chat_history (telefone, lead_id, role, conteudo, message_id)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING *
            "#,
        )
        .bind(entry.telefone)
        .bind(entry.lead_id)
        .bind(entry.role)
        .bind(entry.conteudo)
        .bind(entry.message_id)
        .fetch_one(&self.pool)
        .await
        .context("appending chat history")?;
        Ok(row)
    }

    /// Last `limit` messages for a phone, oldest first.
    pub async fn recent_chat(
        &self,
        telefone: &str,
        limit: i64,
    ) -> Result<Vec<ChatHistoryEntry>, AppError> {
        let rows = sqlx::query_as::<_, ChatHistoryEntry>(
            r#"
            SELECT * FROM (
                SELECT * FROM chat_history
                WHERE telefone = $1
                ORDER BY created_at DESC, id DESC
                LIMIT $2
            ) recent
            ORDER BY created_at ASC, id ASC
            "#,
        )
        .bind(telefone)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn insert_consulta_serpro(
        &self,
        lead_id: Option<Uuid>,
        tipo: &str,
        documento: &str,
        status_http: i32,
        resposta: Option<&serde_json::Value>,
    ) -> Result<ConsultaSerpro, AppError> {
        let row = sqlx::query_as::<_, ConsultaSerpro>(
            r#"
            INSERT INTO consultas_serpro (lead_id, tipo, documento, status_http, sucesso, resposta)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING *
            "#,
        )
        .bind(lead_id)
        .bind(tipo)
        .bind(documento)
        .bind(status_http)
        .bind((200..300).contains(&status_http))
        .bind(resposta)
        .fetch_one(&self.pool)
        .await
        .context("logging Serpro lookup")?;
        Ok(row)
    }

    pub async fn list_consultas_serpro(
        &self,
        lead_id: Option<Uuid>,
        limit: i64,
    ) -> Result<Vec<ConsultaSerpro>, AppError> {
        let rows = sqlx::query_as::<_, ConsultaSerpro>(
            r#"
            SELECT * FROM consultas_serpro
            WHERE ($1::uuid IS NULL OR lead_id = $1)
            ORDER BY created_at DESC
            LIMIT $2
            "#,
        )
        .bind(lead_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_satellite_upsert_overwrites_with_non_null() {
        let sql = satellite_upsert_sql("leads_qualificacao", QUALIFICACAO_COLS, false);
        assert!(sql.starts_with(
            "INSERT INTO leads_qualificacao (lead_id, status, tier, score, motivo_desqualificacao) \
             VALUES ($1, COALESCE($2, 'novo'), COALESCE($3, 'MQL'), $4, $5)"
        ));
        assert!(sql.contains("ON CONFLICT (lead_id) DO UPDATE SET"));
        assert!(sql.contains("status = COALESCE($2, leads_qualificacao.status)"));
        assert!(sql.ends_with("updated_at = now()"));
    }

    #[test]
    fn test_satellite_upsert_prefer_existing() {
        let sql = satellite_upsert_sql("leads_empresarial", EMPRESARIAL_COLS, true);
        assert!(sql.contains("razao_social = COALESCE(leads_empresarial.razao_social, $4)"));
        assert!(sql.contains("uf = COALESCE(leads_empresarial.uf, $14)"));
    }

    #[test]
    fn test_lead_filters_bind_every_value() {
        let query = LeadListQuery {
            status: Some("Qualificado".to_string()),
            tier: Some("icp".to_string()),
            busca: Some("11 98765".to_string()),
            ..Default::default()
        };
        let mut qb = QueryBuilder::<Postgres>::new("SELECT COUNT(*)");
        push_lead_filters(&mut qb, &query);
        let sql = qb.sql();

        assert!(sql.contains("q.status = $1"));
        assert!(sql.contains("q.tier = $2"));
        assert!(sql.contains("l.nome ILIKE $3 ESCAPE '\\'"));
        assert!(sql.contains("e.razao_social ILIKE $5 ESCAPE '\\'"));
        assert!(sql.contains("l.telefone LIKE $6"));
        assert!(sql.contains("e.cnpj LIKE $7"));
        assert!(!sql.contains("98765"));
    }

    #[test]
    fn test_lead_filters_text_search_without_digits() {
        let query = LeadListQuery {
            busca: Some("padaria".to_string()),
            ..Default::default()
        };
        let mut qb = QueryBuilder::<Postgres>::new("SELECT COUNT(*)");
        push_lead_filters(&mut qb, &query);
        let sql = qb.sql();
        assert!(sql.contains("e.razao_social ILIKE $3"));
        assert!(!sql.contains("l.telefone LIKE"));
    }
}
