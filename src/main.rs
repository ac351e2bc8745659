use axum::{
    middleware,
    routing::{get, patch, post},
    Router,
};
use moka::future::Cache;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceBuilder;
use tower_governor::{
    governor::GovernorConfigBuilder, key_extractor::SmartIpKeyExtractor, GovernorLayer,
};
use tower_http::{cors::CorsLayer, limit::RequestBodyLimitLayer, trace::TraceLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use rust_crm_api::api::handlers::{self, AppState};
use rust_crm_api::api::{admin_handlers, auth, disparo_handler, webhook_handler};
use rust_crm_api::config::Config;
use rust_crm_api::core::disparos::DisparoStorage;
use rust_crm_api::db::Database;
use rust_crm_api::db_storage::LeadStorage;
use rust_crm_api::integrations::gateway_client::WhatsAppGatewayClient;
use rust_crm_api::integrations::llm_client::LlmClient;
use rust_crm_api::integrations::n8n_client::N8nForwarder;
use rust_crm_api::integrations::realtime::RealtimePublisher;
use rust_crm_api::integrations::serpro_client::SerproClient;

/// Main entry point.
///
/// Initializes logging, configuration, the database (applying the schema),
/// caches and outbound clients, then serves the public, webhook and admin routes.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "rust_crm_api=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env()?;
    tracing::info!("Configuration loaded successfully");

    let db = Database::new(&config.database_url).await?;
    db.apply_schema().await?;
    tracing::info!("Database connection pool established");

    // Gateway message-id dedup (10 minute TTL)
    let processed_messages = Cache::builder()
        .time_to_live(Duration::from_secs(600))
        .max_capacity(50_000)
        .build();

    // Serpro answers (24 hour TTL)
    let serpro_cache = Cache::builder()
        .time_to_live(Duration::from_secs(86_400))
        .max_capacity(20_000)
        .build();
    tracing::info!("Caches initialized (message dedup 10m, Serpro 24h)");

    let gateway = WhatsAppGatewayClient::new(
        config.gateway_base_url.clone(),
        config.gateway_api_key.clone(),
        config.gateway_instance.clone(),
    )?;
    tracing::info!(
        "✓ WhatsApp gateway client initialized: {} ({})",
        config.gateway_base_url,
        config.gateway_instance
    );

    let llm = match &config.openai_api_key {
        Some(key) => {
            let client = LlmClient::new(
                config.openai_base_url.clone(),
                key.clone(),
                config.openai_model.clone(),
            )?;
            tracing::info!("✓ LLM client initialized (model: {})", client.model());
            Some(client)
        }
        None => {
            tracing::warn!("OPENAI_API_KEY not set - agents will answer with the fallback reply");
            None
        }
    };

    let serpro = match config.serpro_credentials() {
        Some((key, secret)) => Some(SerproClient::new(
            config.serpro_base_url.clone(),
            key.to_string(),
            secret.to_string(),
        )?),
        None => {
            tracing::warn!("Serpro credentials not set - document lookups disabled");
            None
        }
    };

    let n8n = match &config.n8n_webhook_url {
        Some(url) => Some(N8nForwarder::new(url.clone())?),
        None => None,
    };

    let realtime =
        RealtimePublisher::connect(config.redis_url.as_deref(), &config.realtime_channel).await;

    let app_state = Arc::new(AppState {
        db: db.pool.clone(),
        storage: LeadStorage::new(db.pool.clone()),
        disparos: DisparoStorage::new(db.pool.clone()),
        config: config.clone(),
        gateway,
        llm,
        serpro,
        realtime,
        n8n,
        processed_messages,
        serpro_cache,
    });

    // Configure rate limiter: 10 requests/second per IP, burst of 20
    let governor_conf = Arc::new(
        GovernorConfigBuilder::default()
            .per_second(10)
            .burst_size(20)
            .key_extractor(SmartIpKeyExtractor)
            .finish()
            .ok_or_else(|| anyhow::anyhow!("Invalid rate limiter configuration"))?,
    );

    let admin_routes = Router::new()
        .route("/dashboard", get(admin_handlers::dashboard))
        .route("/leads", get(admin_handlers::list_leads))
        .route(
            "/leads/:id",
            get(admin_handlers::get_lead)
                .patch(admin_handlers::update_lead)
                .delete(admin_handlers::delete_lead),
        )
        .route("/leads/:id/chat", get(admin_handlers::lead_chat))
        .route("/leads/:id/mensagem", post(admin_handlers::send_manual_message))
        .route("/serpro/cnpj/:cnpj", post(admin_handlers::serpro_cnpj))
        .route("/serpro/cpf/:cpf", post(admin_handlers::serpro_cpf))
        .route("/serpro/consultas", get(admin_handlers::serpro_consultas))
        .route("/gateway/status", get(admin_handlers::gateway_status))
        .route(
            "/disparos",
            get(disparo_handler::list_disparos).post(disparo_handler::create_disparo),
        )
        .route("/disparos/preview", post(disparo_handler::preview_disparo))
        .route("/disparos/:id", get(disparo_handler::get_disparo))
        .route(
            "/disparos/:id/status",
            patch(disparo_handler::update_disparo_status),
        )
        .route("/disparos/:id/logs", get(disparo_handler::disparo_logs))
        .layer(middleware::from_fn_with_state(
            app_state.clone(),
            auth::require_admin_key,
        ));

    let protected_routes = Router::new()
        // Public forms
        .route("/api/leads", post(handlers::submit_lead))
        .route("/api/forms/mei", post(handlers::submit_mei_form))
        .route("/api/forms/ecac", post(handlers::submit_ecac_form))
        // Gateway webhook and scheduler trigger
        .route(
            "/api/webhook/whatsapp",
            post(webhook_handler::whatsapp_webhook),
        )
        .route(
            "/api/disparos/process",
            post(disparo_handler::process_disparos),
        )
        .nest("/api/admin", admin_routes)
        .layer(
            ServiceBuilder::new()
                // Request size limit: 5MB max payload
                .layer(RequestBodyLimitLayer::new(5 * 1024 * 1024))
                // Rate limiting: 10 req/sec per IP, burst of 20
                .layer(GovernorLayer {
                    config: governor_conf,
                }),
        );

    // Health check bypasses rate limiting
    let app = Router::new()
        .route("/health", get(handlers::health))
        .merge(protected_routes)
        .with_state(app_state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Server listening on {}", addr);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}
