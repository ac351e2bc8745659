use bigdecimal::BigDecimal;
use std::env;
use uuid::Uuid;

use rust_crm_api::db::Database;
use rust_crm_api::db_storage::LeadStorage;
use rust_crm_api::core::disparos::{DisparoFiltro, DisparoStatus, DisparoStorage, DisparoTarget, NewDisparo};
use rust_crm_api::core::models::{EmpresarialUpdate, FinanceiroUpdate, NewChatEntry, NewLead};
use rust_crm_api::core::qualification::QualificationTier;

/// Connects and applies the schema. Set TEST_DATABASE_URL to run these tests.
async fn test_db() -> anyhow::Result<Database> {
    let db_url = env::var("TEST_DATABASE_URL")
        .or_else(|_| env::var("DATABASE_URL"))
        .map_err(|_| anyhow::anyhow!("Set TEST_DATABASE_URL or DATABASE_URL to run this test"))?;

    let db = Database::new(&db_url).await?;
    db.apply_schema().await?;
    Ok(db)
}

fn unique_phone() -> String {
    format!("55119{:08}", Uuid::new_v4().as_u128() % 100_000_000)
}

/// Marked ignored to avoid running against production by accident.
#[tokio::test]
#[ignore]
async fn lead_upsert_keeps_first_origin_and_classifies_icp() -> anyhow::Result<()> {
    let db = test_db().await?;
    let storage = LeadStorage::new(db.pool.clone());
    let telefone = unique_phone();

    let id = storage
        .upsert_lead(&NewLead {
            telefone: telefone.clone(),
            nome: Some("Padaria Teste".to_string()),
            email: None,
            origem: Some("formulario".to_string()),
        })
        .await
        .map_err(|e| anyhow::anyhow!(e.to_string()))?;

    let again = storage
        .upsert_lead(&NewLead {
            telefone: telefone.clone(),
            nome: None,
            email: Some("contato@padaria.com.br".to_string()),
            origem: Some("whatsapp".to_string()),
        })
        .await
        .map_err(|e| anyhow::anyhow!(e.to_string()))?;
    assert_eq!(id, again);

    storage
        .upsert_empresarial(
            id,
            &EmpresarialUpdate {
                cnpj: Some("11222333000181".to_string()),
                ..Default::default()
            },
        )
        .await
        .map_err(|e| anyhow::anyhow!(e.to_string()))?;
    storage
        .upsert_financeiro(
            id,
            &FinanceiroUpdate {
                valor_divida_total: Some(BigDecimal::from(85_000)),
                ..Default::default()
            },
        )
        .await
        .map_err(|e| anyhow::anyhow!(e.to_string()))?;

    let tier = storage
        .refresh_tier(id, 10_000)
        .await
        .map_err(|e| anyhow::anyhow!(e.to_string()))?;
    assert_eq!(tier, Some(QualificationTier::Icp));

    let full = storage
        .get_lead_full(id)
        .await
        .map_err(|e| anyhow::anyhow!(e.to_string()))?
        .ok_or_else(|| anyhow::anyhow!("lead vanished"))?;
    assert_eq!(full.lead.origem.as_deref(), Some("formulario"));
    assert_eq!(full.lead.nome.as_deref(), Some("Padaria Teste"));
    assert_eq!(full.lead.email.as_deref(), Some("contato@padaria.com.br"));
    assert_eq!(full.qualificacao.map(|q| q.tier).as_deref(), Some("ICP"));

    assert!(storage.delete_lead(id).await.map_err(|e| anyhow::anyhow!(e.to_string()))?);
    Ok(())
}

#[tokio::test]
#[ignore]
async fn chat_history_is_returned_in_order() -> anyhow::Result<()> {
    let db = test_db().await?;
    let storage = LeadStorage::new(db.pool.clone());
    let telefone = unique_phone();

    for (role, text) in [("user", "oi"), ("assistant", "Olá!"), ("user", "tenho dívida")] {
        storage
            .append_chat(&NewChatEntry {
                telefone: &telefone,
                lead_id: None,
                role,
                conteudo: text,
                message_id: None,
            })
            .await
            .map_err(|e| anyhow::anyhow!(e.to_string()))?;
    }

    let history = storage
        .recent_chat(&telefone, 2)
        .await
        .map_err(|e| anyhow::anyhow!(e.to_string()))?;
    let texts: Vec<&str> = history.iter().map(|h| h.conteudo.as_str()).collect();
    assert_eq!(texts, vec!["Olá!", "tenho dívida"]);
    Ok(())
}

#[tokio::test]
#[ignore]
async fn disparo_claim_is_once_per_phone() -> anyhow::Result<()> {
    let db = test_db().await?;
    let leads = LeadStorage::new(db.pool.clone());
    let disparos = DisparoStorage::new(db.pool.clone());
    let telefone = unique_phone();

    let lead_id = leads
        .upsert_lead(&NewLead {
            telefone: telefone.clone(),
            nome: Some("Maria".to_string()),
            email: None,
            origem: Some("formulario".to_string()),
        })
        .await
        .map_err(|e| anyhow::anyhow!(e.to_string()))?;

    let disparo = disparos
        .create(&NewDisparo {
            nome: format!("teste-{}", Uuid::new_v4()),
            mensagem_template: "Oi {{primeiro_nome}}".to_string(),
            filtros: DisparoFiltro::default(),
            status: DisparoStatus::Rascunho,
            agendado_para: None,
        })
        .await
        .map_err(|e| anyhow::anyhow!(e.to_string()))?;

    let target = DisparoTarget {
        lead_id,
        telefone: telefone.clone(),
        nome: Some("Maria".to_string()),
        razao_social: None,
        nome_fantasia: None,
        cnpj: None,
        cidade: None,
        uf: None,
        valor_divida_total: None,
    };

    let first = disparos
        .claim(disparo.id, &target, "Oi Maria")
        .await
        .map_err(|e| anyhow::anyhow!(e.to_string()))?;
    let second = disparos
        .claim(disparo.id, &target, "Oi Maria")
        .await
        .map_err(|e| anyhow::anyhow!(e.to_string()))?;
    assert!(first.is_some());
    assert!(second.is_none());

    let log_id = first.ok_or_else(|| anyhow::anyhow!("missing claim"))?;
    disparos
        .mark_sent(log_id)
        .await
        .map_err(|e| anyhow::anyhow!(e.to_string()))?;
    let logs = disparos
        .logs(disparo.id, Some("enviado"), 10)
        .await
        .map_err(|e| anyhow::anyhow!(e.to_string()))?;
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].telefone, telefone);

    leads
        .delete_lead(lead_id)
        .await
        .map_err(|e| anyhow::anyhow!(e.to_string()))?;
    Ok(())
}
