/// Integration tests with mocked external APIs
/// Exercises the gateway, Serpro, LLM and n8n clients without hitting real services
use rust_crm_api::agents::{self, AgentContext, AgentKind};
use rust_crm_api::errors::AppError;
use rust_crm_api::gateway_client::WhatsAppGatewayClient;
use rust_crm_api::llm_client::{LlmClient, LlmMessage};
use rust_crm_api::n8n_client::N8nForwarder;
use rust_crm_api::serpro_client::{empresarial_from_cnpj, DocumentoTipo, SerproClient};
use serde_json::json;
use wiremock::matchers::{body_json, body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const VALID_CNPJ: &str = "11222333000181";
const VALID_CPF: &str = "52998224725";

fn gateway(uri: String) -> WhatsAppGatewayClient {
    WhatsAppGatewayClient::new(uri, "gw-key".to_string(), "crm".to_string()).unwrap()
}

fn serpro(uri: String) -> SerproClient {
    SerproClient::new(uri, "consumer".to_string(), "secret".to_string()).unwrap()
}

async fn mount_token(server: &MockServer, expected_calls: u64) {
    Mock::given(method("POST"))
        .and(path("/token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": "tok-123",
            "token_type": "bearer",
            "expires_in": 3600
        })))
        .expect(expected_calls)
        .mount(server)
        .await;
}

#[tokio::test]
async fn test_gateway_send_text_returns_message_id() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/message/sendText/crm"))
        .and(header("apikey", "gw-key"))
        .and(body_json(json!({"number": "5511987654321", "text": "Olá!"})))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({
            "key": {"id": "3EB0ABC", "remoteJid": "5511987654321@s.whatsapp.net", "fromMe": true},
            "status": "PENDING"
        })))
        .expect(1)
        .mount(&mock_server)
        .await;

    let id = gateway(mock_server.uri())
        .send_text("5511987654321", "Olá!")
        .await
        .unwrap();
    assert_eq!(id.as_deref(), Some("3EB0ABC"));
}

#[tokio::test]
async fn test_gateway_send_failure_is_external_error() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/message/sendText/crm"))
        .respond_with(ResponseTemplate::new(500).set_body_string("instance disconnected"))
        .mount(&mock_server)
        .await;

    let result = gateway(mock_server.uri())
        .send_text("5511987654321", "Olá!")
        .await;
    assert!(matches!(result, Err(AppError::ExternalApiError(msg)) if msg.contains("instance disconnected")));
}

#[tokio::test]
async fn test_gateway_rejects_empty_text_without_calling() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&mock_server)
        .await;

    let result = gateway(mock_server.uri()).send_text("5511987654321", "  ").await;
    assert!(matches!(result, Err(AppError::BadRequest(_))));
}

#[tokio::test]
async fn test_gateway_connection_state() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/instance/connectionState/crm"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "instance": {"instanceName": "crm", "state": "open"}
        })))
        .mount(&mock_server)
        .await;

    let state = gateway(mock_server.uri()).connection_state().await.unwrap();
    assert_eq!(state, "open");
}

#[tokio::test]
async fn test_serpro_cnpj_lookup_reuses_token() {
    let mock_server = MockServer::start().await;
    mount_token(&mock_server, 1).await;

    Mock::given(method("GET"))
        .and(path(format!("/consulta-cnpj-df/v2/basica/{}", VALID_CNPJ)))
        .and(header("Authorization", "Bearer tok-123"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "ni": VALID_CNPJ,
            "nomeEmpresarial": "PADARIA BOM PAO LTDA",
            "nomeFantasia": "BOM PAO",
            "situacaoCadastral": {"codigo": "2"},
            "endereco": {
                "tipoLogradouro": "RUA",
                "logradouro": "DAS FLORES",
                "numero": "100",
                "cep": "01001000",
                "bairro": "CENTRO",
                "municipio": {"descricao": "SAO PAULO"},
                "uf": "SP"
            }
        })))
        .expect(2)
        .mount(&mock_server)
        .await;

    let client = serpro(mock_server.uri());
    let first = client.consultar_cnpj("11.222.333/0001-81").await.unwrap();
    let second = client
        .consultar_documento(DocumentoTipo::Cnpj, VALID_CNPJ)
        .await
        .unwrap();

    assert!(first.is_success());
    assert_eq!(first.dados, second.dados);

    let empresarial = empresarial_from_cnpj(&first.dados);
    assert_eq!(empresarial.razao_social.as_deref(), Some("PADARIA BOM PAO LTDA"));
    assert_eq!(empresarial.situacao_cadastral.as_deref(), Some("ATIVA"));
    assert_eq!(empresarial.uf.as_deref(), Some("SP"));
}

#[tokio::test]
async fn test_serpro_refreshes_token_after_401() {
    let mock_server = MockServer::start().await;
    mount_token(&mock_server, 2).await;

    let lookup_path = format!("/consulta-cpf-df/v1/cpf/{}", VALID_CPF);
    Mock::given(method("GET"))
        .and(path(lookup_path.as_str()))
        .respond_with(ResponseTemplate::new(401))
        .up_to_n_times(1)
        .mount(&mock_server)
        .await;
    Mock::given(method("GET"))
        .and(path(lookup_path.as_str()))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "ni": VALID_CPF,
            "nome": "MARIA DA SILVA",
            "situacao": {"codigo": "0", "descricao": "Regular"}
        })))
        .mount(&mock_server)
        .await;

    let response = serpro(mock_server.uri())
        .consultar_cpf("529.982.247-25")
        .await
        .unwrap();
    assert_eq!(response.status_http, 200);
    assert_eq!(response.dados["nome"], "MARIA DA SILVA");
}

#[tokio::test]
async fn test_serpro_not_found_is_reported_not_raised() {
    let mock_server = MockServer::start().await;
    mount_token(&mock_server, 1).await;

    Mock::given(method("GET"))
        .and(path(format!("/consulta-cnpj-df/v2/basica/{}", VALID_CNPJ)))
        .respond_with(ResponseTemplate::new(404).set_body_json(json!({"mensagem": "CNPJ não encontrado"})))
        .mount(&mock_server)
        .await;

    let response = serpro(mock_server.uri())
        .consultar_cnpj(VALID_CNPJ)
        .await
        .unwrap();
    assert_eq!(response.status_http, 404);
    assert!(!response.is_success());
}

#[tokio::test]
async fn test_serpro_invalid_document_skips_http() {
    let mock_server = MockServer::start().await;
    mount_token(&mock_server, 0).await;

    let result = serpro(mock_server.uri()).consultar_cpf("123.456.789-00").await;
    assert!(matches!(result, Err(AppError::BadRequest(_))));
}

#[tokio::test]
async fn test_llm_chat_returns_first_choice() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(header("Authorization", "Bearer sk-test"))
        .and(body_partial_json(json!({"model": "gpt-4o-mini"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "choices": [
                {"index": 0, "message": {"role": "assistant", "content": "  Olá! Como posso ajudar?  "}}
            ]
        })))
        .mount(&mock_server)
        .await;

    let client = LlmClient::new(
        mock_server.uri(),
        "sk-test".to_string(),
        "gpt-4o-mini".to_string(),
    )
    .unwrap();
    let reply = client.chat(&[LlmMessage::user("oi")]).await.unwrap();
    assert_eq!(reply, "Olá! Como posso ajudar?");
}

#[tokio::test]
async fn test_agent_respond_sends_system_prompt_first() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(body_partial_json(json!({"messages": [{"role": "system"}]})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "choices": [{"message": {"content": "Qual o CNPJ da sua empresa?"}}]
        })))
        .mount(&mock_server)
        .await;

    let client = LlmClient::new(
        mock_server.uri(),
        "sk-test".to_string(),
        "gpt-4o-mini".to_string(),
    )
    .unwrap();
    let ctx = AgentContext {
        nome: Some("Carlos".to_string()),
        ..Default::default()
    };
    let reply = agents::respond(&client, AgentKind::Atendimento, &ctx, &[], "tenho dívida")
        .await
        .unwrap();
    assert_eq!(reply, "Qual o CNPJ da sua empresa?");
}

#[tokio::test]
async fn test_llm_empty_choice_is_error() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"choices": []})))
        .mount(&mock_server)
        .await;

    let client = LlmClient::new(mock_server.uri(), "k".to_string(), "m".to_string()).unwrap();
    let result = client.chat(&[LlmMessage::user("oi")]).await;
    assert!(matches!(result, Err(AppError::ExternalApiError(_))));
}

#[tokio::test]
async fn test_n8n_forward_posts_envelope() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/webhook/crm"))
        .and(body_partial_json(json!({
            "event": "lead.created",
            "payload": {"telefone": "5511987654321"}
        })))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&mock_server)
        .await;

    let forwarder = N8nForwarder::new(format!("{}/webhook/crm", mock_server.uri())).unwrap();
    forwarder
        .forward("lead.created", &json!({"telefone": "5511987654321"}))
        .await
        .unwrap();
}

#[tokio::test]
async fn test_n8n_failure_surfaces_status() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(502))
        .mount(&mock_server)
        .await;

    let forwarder = N8nForwarder::new(mock_server.uri()).unwrap();
    let result = forwarder.forward("lead.updated", &json!({})).await;
    assert!(matches!(result, Err(AppError::ExternalApiError(msg)) if msg.contains("502")));
}
