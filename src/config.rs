#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub port: u16,
    pub gateway_base_url: String,
    pub gateway_api_key: String,
    pub gateway_instance: String,
    pub openai_base_url: String,
    pub openai_api_key: Option<String>,
    pub openai_model: String,
    pub serpro_base_url: String,
    pub serpro_consumer_key: Option<String>,
    pub serpro_consumer_secret: Option<String>,
    pub redis_url: Option<String>,
    pub realtime_channel: String,
    pub n8n_webhook_url: Option<String>,
    pub webhook_secret: Option<String>,
    pub admin_api_key: Option<String>,
    pub cron_secret: Option<String>,
    pub disparo_batch_size: usize,
    pub disparo_delay_ms: u64,
    pub icp_min_divida: i64,
    pub chat_history_limit: i64,
    pub is_production: bool,
}

/// Reads an optional variable, treating blank values as unset.
fn optional_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|s| !s.trim().is_empty())
}

fn required_var(name: &str) -> anyhow::Result<String> {
    std::env::var(name)
        .map_err(|_| anyhow::anyhow!("{} environment variable required", name))
        .and_then(|value| {
            if value.trim().is_empty() {
                anyhow::bail!("{} cannot be empty", name);
            }
            Ok(value)
        })
}

/// Validates an http(s) base URL and strips the trailing slash.
pub(crate) fn validate_http_url(name: &str, raw: String) -> anyhow::Result<String> {
    let parsed = url::Url::parse(&raw)
        .map_err(|e| anyhow::anyhow!("{} is not a valid URL: {}", name, e))?;
    if parsed.scheme() != "http" && parsed.scheme() != "https" {
        anyhow::bail!("{} must start with http:// or https://", name);
    }
    Ok(raw.trim_end_matches('/').to_string())
}

fn parse_var<T: std::str::FromStr>(name: &str, default: T) -> anyhow::Result<T> {
    match optional_var(name) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| anyhow::anyhow!("{} has an invalid value: {}", name, raw)),
        None => Ok(default),
    }
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let config = Self {
            database_url: std::env::var("DATABASE_URL")
                .or_else(|_| std::env::var("DB_URL"))
                .map_err(|_| {
                    anyhow::anyhow!("DATABASE_URL or DB_URL environment variable required")
                })
                .and_then(|url| {
                    if url.trim().is_empty() {
                        anyhow::bail!("DATABASE_URL cannot be empty");
                    }
                    if !url.starts_with("postgresql://") && !url.starts_with("postgres://") {
                        anyhow::bail!("DATABASE_URL must start with postgresql:// or postgres://");
                    }
                    Ok(url)
                })?,
            port: std::env::var("PORT")
                .unwrap_or_else(|_| "3000".to_string())
                .parse()
                .map_err(|_| anyhow::anyhow!("PORT must be a valid number between 1-65535"))?,
            gateway_base_url: required_var("GATEWAY_BASE_URL")
                .and_then(|url| validate_http_url("GATEWAY_BASE_URL", url))?,
            gateway_api_key: required_var("GATEWAY_API_KEY")?,
            gateway_instance: required_var("GATEWAY_INSTANCE")?,
            openai_base_url: validate_http_url(
                "OPENAI_BASE_URL",
                optional_var("OPENAI_BASE_URL")
                    .unwrap_or_else(|| "https://api.openai.com/v1".to_string()),
            )?,
            openai_api_key: optional_var("OPENAI_API_KEY"),
            openai_model: optional_var("OPENAI_MODEL")
                .unwrap_or_else(|| "gpt-4o-mini".to_string()),
            serpro_base_url: validate_http_url(
                "SERPRO_BASE_URL",
                optional_var("SERPRO_BASE_URL")
                    .unwrap_or_else(|| "https://gateway.apiserpro.serpro.gov.br".to_string()),
            )?,
            serpro_consumer_key: optional_var("SERPRO_CONSUMER_KEY"),
            serpro_consumer_secret: optional_var("SERPRO_CONSUMER_SECRET"),
            redis_url: optional_var("REDIS_URL"),
            realtime_channel: optional_var("REALTIME_CHANNEL")
                .unwrap_or_else(|| "crm:events".to_string()),
            n8n_webhook_url: optional_var("N8N_WEBHOOK_URL")
                .map(|url| validate_http_url("N8N_WEBHOOK_URL", url))
                .transpose()?,
            webhook_secret: optional_var("WEBHOOK_SECRET"),
            admin_api_key: optional_var("ADMIN_API_KEY"),
            cron_secret: optional_var("CRON_SECRET"),
            disparo_batch_size: parse_var("DISPARO_BATCH_SIZE", 20usize)?,
            disparo_delay_ms: parse_var("DISPARO_DELAY_MS", 3000u64)?,
            icp_min_divida: parse_var("ICP_MIN_DIVIDA", 10_000i64)?,
            chat_history_limit: parse_var("CHAT_HISTORY_LIMIT", 20i64)?,
            is_production: optional_var("RUST_ENV").as_deref() == Some("production"),
        };

        if config.disparo_batch_size == 0 {
            anyhow::bail!("DISPARO_BATCH_SIZE must be at least 1");
        }
        if config.serpro_consumer_key.is_some() != config.serpro_consumer_secret.is_some() {
            anyhow::bail!("SERPRO_CONSUMER_KEY and SERPRO_CONSUMER_SECRET must be set together");
        }

        // Log successful configuration load (without sensitive values)
        tracing::info!("Configuration loaded successfully");
        tracing::debug!("Database host: {}", database_host(&config.database_url));
        tracing::debug!(
            "Gateway: {} (instance {})",
            config.gateway_base_url,
            config.gateway_instance
        );
        if config.openai_api_key.is_none() {
            tracing::warn!("OPENAI_API_KEY not set - bot agents will answer with the fallback text");
        }
        if config.serpro_consumer_key.is_none() {
            tracing::warn!("Serpro credentials not set - government lookups disabled");
        }
        if config.redis_url.is_none() {
            tracing::warn!("REDIS_URL not set - realtime events will not be published");
        }
        if config.webhook_secret.is_none() {
            tracing::warn!("WEBHOOK_SECRET not set - WhatsApp webhook accepts unauthenticated calls");
        }
        tracing::debug!(
            "Disparo batch: {} recipients, {}ms delay",
            config.disparo_batch_size,
            config.disparo_delay_ms
        );
        tracing::debug!("Server Port: {}", config.port);

        Ok(config)
    }

    /// Serpro credentials, when both halves are configured.
    pub fn serpro_credentials(&self) -> Option<(&str, &str)> {
        match (&self.serpro_consumer_key, &self.serpro_consumer_secret) {
            (Some(key), Some(secret)) => Some((key.as_str(), secret.as_str())),
            _ => None,
        }
    }
}

/// Host (and port) of a database URL, never its credentials.
fn database_host(database_url: &str) -> String {
    url::Url::parse(database_url)
        .ok()
        .and_then(|url| {
            let host = url.host_str()?.to_string();
            Some(match url.port() {
                Some(port) => format!("{}:{}", host, port),
                None => host,
            })
        })
        .unwrap_or_else(|| "<unparseable>".to_string())
}
