use crate::errors::AppError;
use crate::models::EmpresarialUpdate;
use crate::validation::{digits_only, is_valid_cnpj, is_valid_cpf, normalize_uf};
use moka::future::Cache;
use moka::Expiry;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::{Duration, Instant};

const TOKEN_KEY: &str = "serpro";
/// Refresh the token this long before Serpro says it expires.
const TOKEN_EXPIRY_MARGIN: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentoTipo {
    Cnpj,
    Cpf,
}

impl DocumentoTipo {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentoTipo::Cnpj => "cnpj",
            DocumentoTipo::Cpf => "cpf",
        }
    }

    /// Strips punctuation and checks the verification digits.
    pub fn normalize(&self, raw: &str) -> Result<String, AppError> {
        let digits = digits_only(raw);
        let valid = match self {
            DocumentoTipo::Cnpj => is_valid_cnpj(&digits),
            DocumentoTipo::Cpf => is_valid_cpf(&digits),
        };
        if valid {
            Ok(digits)
        } else {
            Err(AppError::BadRequest(format!(
                "Invalid {}: {}",
                self.as_str().to_uppercase(),
                raw
            )))
        }
    }
}

/// Raw Serpro answer. Non-2xx answers are returned too so they can be logged.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SerproResponse {
    pub status_http: u16,
    pub dados: Value,
}

impl SerproResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status_http)
    }
}

#[derive(Debug, Clone)]
struct BearerToken {
    access_token: String,
    ttl: Duration,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<u64>,
}

struct TokenExpiry;

impl Expiry<&'static str, BearerToken> for TokenExpiry {
    fn expire_after_create(
        &self,
        _key: &&'static str,
        value: &BearerToken,
        _created_at: Instant,
    ) -> Option<Duration> {
        Some(value.ttl)
    }
}

/// Client for the Serpro CNPJ/CPF APIs (OAuth2 client credentials).
#[derive(Clone)]
pub struct SerproClient {
    client: reqwest::Client,
    base_url: String,
    consumer_key: String,
    consumer_secret: String,
    token: Cache<&'static str, BearerToken>,
}

impl SerproClient {
    pub fn new(
        base_url: String,
        consumer_key: String,
        consumer_secret: String,
    ) -> Result<Self, AppError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| {
                AppError::ExternalApiError(format!("Failed to create Serpro client: {}", e))
            })?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            consumer_key,
            consumer_secret,
            token: Cache::builder()
                .max_capacity(1)
                .expire_after(TokenExpiry)
                .build(),
        })
    }

    async fn access_token(&self) -> Result<String, AppError> {
        if let Some(token) = self.token.get(TOKEN_KEY).await {
            return Ok(token.access_token);
        }

        tracing::debug!("Requesting Serpro access token");
        let response = self
            .client
            .post(format!("{}/token", self.base_url))
            .basic_auth(&self.consumer_key, Some(&self.consumer_secret))
            .form(&[("grant_type", "client_credentials")])
            .send()
            .await
            .map_err(|e| AppError::ExternalApiError(format!("Serpro token request failed: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            tracing::error!("Serpro token endpoint returned {}", status);
            return Err(AppError::ExternalApiError(format!(
                "Serpro token endpoint returned {}",
                status
            )));
        }

        let body: TokenResponse = response.json().await.map_err(|e| {
            AppError::ExternalApiError(format!("Failed to parse Serpro token: {}", e))
        })?;

        let lifetime = Duration::from_secs(body.expires_in.unwrap_or(3600));
        let token = BearerToken {
            access_token: body.access_token.clone(),
            ttl: lifetime
                .checked_sub(TOKEN_EXPIRY_MARGIN)
                .unwrap_or(lifetime / 2),
        };
        self.token.insert(TOKEN_KEY, token).await;

        Ok(body.access_token)
    }

    pub async fn consultar_cnpj(&self, cnpj: &str) -> Result<SerproResponse, AppError> {
        let cnpj = DocumentoTipo::Cnpj.normalize(cnpj)?;
        self.consultar(&format!("consulta-cnpj-df/v2/basica/{}", cnpj))
            .await
    }

    pub async fn consultar_cpf(&self, cpf: &str) -> Result<SerproResponse, AppError> {
        let cpf = DocumentoTipo::Cpf.normalize(cpf)?;
        self.consultar(&format!("consulta-cpf-df/v1/cpf/{}", cpf))
            .await
    }

    pub async fn consultar_documento(
        &self,
        tipo: DocumentoTipo,
        documento: &str,
    ) -> Result<SerproResponse, AppError> {
        match tipo {
            DocumentoTipo::Cnpj => self.consultar_cnpj(documento).await,
            DocumentoTipo::Cpf => self.consultar_cpf(documento).await,
        }
    }

    async fn consultar(&self, path: &str) -> Result<SerproResponse, AppError> {
        let url = format!("{}/{}", self.base_url, path);

        let mut response = self.get_with_token(&url).await?;
        if response.status() == reqwest::StatusCode::UNAUTHORIZED {
            tracing::warn!("Serpro rejected the cached token, requesting a new one");
            self.token.invalidate(TOKEN_KEY).await;
            response = self.get_with_token(&url).await?;
        }

        let status_http = response.status().as_u16();
        let text = response.text().await.unwrap_or_default();
        let dados = serde_json::from_str(&text).unwrap_or_else(|_| {
            if text.is_empty() {
                Value::Null
            } else {
                Value::String(text)
            }
        });

        if (200..300).contains(&status_http) {
            tracing::info!("✓ Serpro lookup {} -> {}", path, status_http);
        } else {
            tracing::warn!("Serpro lookup {} returned {}", path, status_http);
        }

        Ok(SerproResponse { status_http, dados })
    }

    async fn get_with_token(&self, url: &str) -> Result<reqwest::Response, AppError> {
        let token = self.access_token().await?;
        self.client
            .get(url)
            .bearer_auth(token)
            .header("Accept", "application/json")
            .send()
            .await
            .map_err(|e| AppError::ExternalApiError(format!("Serpro request failed: {}", e)))
    }
}

fn situacao_descricao(codigo: &str) -> Option<&'static str> {
    match codigo {
        "1" => Some("NULA"),
        "2" => Some("ATIVA"),
        "3" => Some("SUSPENSA"),
        "4" => Some("INAPTA"),
        "8" => Some("BAIXADA"),
        _ => None,
    }
}

fn text_at(value: &Value, pointer: &str) -> Option<String> {
    value
        .pointer(pointer)
        .and_then(|v| v.as_str())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// Maps a CNPJ lookup body to the empresarial fields it can fill.
pub fn empresarial_from_cnpj(dados: &Value) -> EmpresarialUpdate {
    let situacao = text_at(dados, "/situacaoCadastral/codigo").map(|codigo| {
        situacao_descricao(&codigo)
            .map(str::to_string)
            .unwrap_or(codigo)
    });

    let logradouro = match (
        text_at(dados, "/endereco/tipoLogradouro"),
        text_at(dados, "/endereco/logradouro"),
    ) {
        (Some(tipo), Some(nome)) => Some(format!("{} {}", tipo, nome)),
        (None, nome) => nome,
        (tipo, None) => tipo,
    };

    EmpresarialUpdate {
        cnpj: text_at(dados, "/ni").map(|ni| digits_only(&ni)),
        razao_social: text_at(dados, "/nomeEmpresarial"),
        nome_fantasia: text_at(dados, "/nomeFantasia"),
        situacao_cadastral: situacao,
        cep: text_at(dados, "/endereco/cep").map(|cep| digits_only(&cep)),
        logradouro,
        numero: text_at(dados, "/endereco/numero"),
        bairro: text_at(dados, "/endereco/bairro"),
        cidade: text_at(dados, "/endereco/municipio/descricao"),
        uf: text_at(dados, "/endereco/uf").and_then(|uf| normalize_uf(&uf)),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_normalize_documents() {
        assert_eq!(
            DocumentoTipo::Cnpj.normalize("11.222.333/0001-81").unwrap(),
            "11222333000181"
        );
        assert_eq!(
            DocumentoTipo::Cpf.normalize("529.982.247-25").unwrap(),
            "52998224725"
        );
        assert!(matches!(
            DocumentoTipo::Cpf.normalize("111.111.111-11"),
            Err(AppError::BadRequest(_))
        ));
    }

    #[test]
    fn test_empresarial_from_cnpj() {
        let dados = json!({
            "ni": "11222333000181",
            "nomeEmpresarial": "SOUZA DOCES LTDA",
            "nomeFantasia": "",
            "situacaoCadastral": {"codigo": "2", "data": "2015-03-02", "motivo": ""},
            "endereco": {
                "tipoLogradouro": "RUA",
                "logradouro": "DAS FLORES",
                "numero": "120",
                "cep": "01310-100",
                "bairro": "CENTRO",
                "municipio": {"codigo": "7107", "descricao": "SAO PAULO"},
                "uf": "sp"
            }
        });

        let update = empresarial_from_cnpj(&dados);
        assert_eq!(update.razao_social.as_deref(), Some("SOUZA DOCES LTDA"));
        assert_eq!(update.nome_fantasia, None);
        assert_eq!(update.situacao_cadastral.as_deref(), Some("ATIVA"));
        assert_eq!(update.logradouro.as_deref(), Some("RUA DAS FLORES"));
        assert_eq!(update.cep.as_deref(), Some("01310100"));
        assert_eq!(update.cidade.as_deref(), Some("SAO PAULO"));
        assert_eq!(update.uf.as_deref(), Some("SP"));
        assert_eq!(update.cpf, None);
    }

    #[test]
    fn test_unknown_situacao_code_kept() {
        let update = empresarial_from_cnpj(&json!({"situacaoCadastral": {"codigo": "9"}}));
        assert_eq!(update.situacao_cadastral.as_deref(), Some("9"));
    }
}
