//! Shared-secret checks: admin key middleware, webhook and cron tokens.

use crate::errors::AppError;
use crate::handlers::AppState;
use axum::{
    extract::{Request, State},
    http::HeaderMap,
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::sync::Arc;

pub const ADMIN_KEY_HEADER: &str = "X-Admin-Key";
pub const WEBHOOK_TOKEN_HEADER: &str = "X-Webhook-Token";
pub const CRON_SECRET_HEADER: &str = "X-Cron-Secret";

/// Compares two secrets without short-circuiting on the first differing byte.
pub fn constant_time_compare(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }

    a.as_bytes()
        .iter()
        .zip(b.as_bytes().iter())
        .fold(0u8, |acc, (x, y)| acc | (x ^ y))
        == 0
}

/// Checks an optional shared secret sent in `header`.
/// Passes when no secret is configured.
pub fn check_header_secret(
    headers: &HeaderMap,
    header: &str,
    expected: Option<&str>,
) -> Result<(), AppError> {
    let Some(expected) = expected else {
        return Ok(());
    };

    let provided = headers
        .get(header)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| AppError::Unauthorized(format!("Missing {} header", header)))?;

    if !constant_time_compare(provided, expected) {
        tracing::warn!("Invalid {} received", header);
        return Err(AppError::Unauthorized(format!("Invalid {}", header)));
    }

    Ok(())
}

/// Decides admin access from the configured key, the provided key and the environment.
pub fn authorize_admin(
    expected: Option<&str>,
    provided: Option<&str>,
    is_production: bool,
) -> Result<(), AppError> {
    match (expected, provided) {
        (Some(expected), Some(provided)) if constant_time_compare(provided, expected) => Ok(()),
        (Some(_), provided) => {
            tracing::warn!(
                "❌ Admin access denied - invalid or missing {}: {:?}",
                ADMIN_KEY_HEADER,
                provided.map(|_| "<redacted>")
            );
            Err(AppError::Unauthorized("Invalid or missing admin key".to_string()))
        }
        (None, _) if is_production => {
            tracing::error!("🚨 ADMIN_API_KEY not configured in production! Blocking admin access.");
            Err(AppError::ServiceUnavailable(
                "Admin API is not configured".to_string(),
            ))
        }
        (None, _) => {
            tracing::warn!("⚠️  ADMIN_API_KEY not configured - allowing admin access in development");
            Ok(())
        }
    }
}

/// Middleware guarding `/api/admin/*`.
pub async fn require_admin_key(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    request: Request,
    next: Next,
) -> Response {
    let provided = headers.get(ADMIN_KEY_HEADER).and_then(|v| v.to_str().ok());

    match authorize_admin(
        state.config.admin_api_key.as_deref(),
        provided,
        state.config.is_production,
    ) {
        Ok(()) => next.run(request).await,
        Err(e) => e.into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_constant_time_compare() {
        assert!(constant_time_compare("segredo", "segredo"));
        assert!(!constant_time_compare("segredo", "segredO"));
        assert!(!constant_time_compare("curto", "mais longo"));
    }

    #[test]
    fn test_admin_key_matrix() {
        assert!(authorize_admin(Some("k"), Some("k"), true).is_ok());
        assert!(matches!(
            authorize_admin(Some("k"), Some("x"), false),
            Err(AppError::Unauthorized(_))
        ));
        assert!(matches!(
            authorize_admin(Some("k"), None, false),
            Err(AppError::Unauthorized(_))
        ));
        assert!(authorize_admin(None, None, false).is_ok());
        assert!(matches!(
            authorize_admin(None, Some("k"), true),
            Err(AppError::ServiceUnavailable(_))
        ));
    }

    #[test]
    fn test_header_secret() {
        let mut headers = HeaderMap::new();
        assert!(check_header_secret(&headers, CRON_SECRET_HEADER, None).is_ok());
        assert!(check_header_secret(&headers, CRON_SECRET_HEADER, Some("s3")).is_err());

        headers.insert(CRON_SECRET_HEADER, HeaderValue::from_static("s3"));
        assert!(check_header_secret(&headers, CRON_SECRET_HEADER, Some("s3")).is_ok());
        assert!(check_header_secret(&headers, CRON_SECRET_HEADER, Some("s4")).is_err());
    }
}
