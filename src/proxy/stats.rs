//! Tenant-facing stats and health endpoints

use axum::{extract::State, http::HeaderMap, Json};
use chrono::Utc;
use serde::Serialize;

use crate::tenant::{millis_to_rfc3339, now_millis};

use super::error::ProxyError;
use super::helpers;
use super::state::ProxyState;

/// GET /stats response for the authenticated tenant.
#[derive(Debug, Serialize)]
pub struct StatsResponse {
    pub key: String,
    pub name: String,
    pub model: String,
    pub token_limit_per_5h: u64,
    pub expiry_date: String,
    pub created_at: String,
    pub last_used: String,
    pub is_expired: bool,
    pub current_usage: CurrentUsage,
    pub total_lifetime_tokens: u64,
}

#[derive(Debug, Serialize)]
pub struct CurrentUsage {
    pub tokens_used_in_current_window: u64,
    pub window_started_at: Option<String>,
    pub window_ends_at: String,
    pub remaining_tokens: u64,
}

/// GET /health response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub timestamp: String,
}

/// GET /stats - usage summary for the calling tenant's own key.
pub async fn tenant_stats(
    State(state): State<ProxyState>,
    headers: HeaderMap,
) -> Result<Json<StatsResponse>, ProxyError> {
    let key = helpers::extract_credential(&headers).ok_or(ProxyError::Unauthenticated)?;
    let now = now_millis();
    let stats = state
        .store
        .with_tenant(&key, |record| {
            let used = record.rolling_window.total(now);
            StatsResponse {
                key: record.key.clone(),
                name: record.name.clone(),
                model: record.model.clone(),
                token_limit_per_5h: record.token_limit_per_5h,
                expiry_date: millis_to_rfc3339(record.expiry_date),
                created_at: millis_to_rfc3339(record.created_at),
                last_used: millis_to_rfc3339(record.last_used),
                is_expired: record.is_expired(now),
                current_usage: CurrentUsage {
                    tokens_used_in_current_window: used,
                    window_started_at: record
                        .rolling_window
                        .oldest_bucket_start()
                        .map(millis_to_rfc3339),
                    window_ends_at: millis_to_rfc3339(record.rolling_window.window_ends_at(now)),
                    remaining_tokens: record.token_limit_per_5h.saturating_sub(used),
                },
                total_lifetime_tokens: record.lifetime_tokens,
            }
        })
        .ok_or(ProxyError::InvalidCredential)?;
    Ok(Json(stats))
}

/// GET /health - liveness probe.
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        timestamp: Utc::now().to_rfc3339(),
    })
}
