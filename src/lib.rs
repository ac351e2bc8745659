//! Lead-funnel CRM API library.
//!
//! Lead intake forms, the admin API, the WhatsApp chat router with its three
//! agents, batch campaigns (disparos), Serpro lookups and the realtime relay.
//!
//! # Modules
//!
//! - `api`: HTTP handlers and auth middleware.
//! - `core`: Domain rules (qualification, templates, agents, disparos).
//! - `integrations`: Outbound clients (gateway, LLM, Serpro, n8n, Redis).

pub mod api;
pub mod core;
pub mod integrations;

// Re-export primary modules for shared use in tests and other binaries
pub mod admin_handlers;
pub mod agents;
pub mod auth;
pub mod cache_validator;
pub mod circuit_breaker;
pub mod config;
pub mod db;
pub mod db_storage;
pub mod disparo_handler;
pub mod disparos;
pub mod errors;
pub mod gateway_client;
pub mod handlers;
pub mod llm_client;
pub mod models;
pub mod n8n_client;
pub mod qualification;
pub mod realtime;
pub mod serpro_client;
pub mod templates;
pub mod validation;
pub mod webhook_handler;
pub mod webhook_models;
