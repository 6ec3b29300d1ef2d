//! Admin API - tenant key CRUD
//!
//! Protected by a separate admin credential (`ADMIN_API_KEY`); when that is
//! unconfigured the whole surface refuses with 401. Every mutation is
//! write-through: success means the change is on disk and visible to the
//! very next proxied request, no restart involved.

use axum::{
    extract::{Path, State},
    http::HeaderMap,
    Json,
};
use serde::{Deserialize, Serialize};

use crate::store::ValidatedPatch;
use crate::tenant::{
    self, millis_to_rfc3339, now_millis, FieldError, TenantPatch, TenantRecord,
};
use crate::window::RollingWindow;

use super::error::ProxyError;
use super::helpers;
use super::state::ProxyState;

/// Wire form of a tenant key on the admin surface. Timestamps go out as
/// ISO-8601 even though the store keeps millis.
#[derive(Debug, Clone, Serialize)]
pub struct KeyResponse {
    pub key: String,
    pub name: String,
    pub model: String,
    pub token_limit_per_5h: u64,
    pub created_at: String,
    pub last_used: String,
    pub expiry_date: String,
    pub lifetime_tokens: u64,
    pub is_expired: bool,
}

impl KeyResponse {
    fn from_record(record: &TenantRecord, now_ms: i64) -> Self {
        Self {
            key: record.key.clone(),
            name: record.name.clone(),
            model: record.model.clone(),
            token_limit_per_5h: record.token_limit_per_5h,
            created_at: millis_to_rfc3339(record.created_at),
            last_used: millis_to_rfc3339(record.last_used),
            expiry_date: millis_to_rfc3339(record.expiry_date),
            lifetime_tokens: record.lifetime_tokens,
            is_expired: record.is_expired(now_ms),
        }
    }
}

/// POST /api/keys payload.
#[derive(Debug, Deserialize)]
pub struct CreateKeyRequest {
    /// Omit to have one generated.
    pub key: Option<String>,
    pub name: String,
    pub model: String,
    pub token_limit_per_5h: u64,
    /// ISO-8601, must not be in the past.
    pub expiry_date: String,
}

/// GET /api/keys/:id/usage payload.
#[derive(Debug, Serialize)]
pub struct KeyUsageResponse {
    pub key: String,
    pub tokens_used_in_current_window: u64,
    pub token_limit_per_5h: u64,
    pub remaining_tokens: u64,
    pub window_started_at: Option<String>,
    pub window_ends_at: String,
    pub total_lifetime_tokens: u64,
}

/// GET /api/metrics payload: one row per pool plus the shared subsystems.
#[derive(Debug, Serialize)]
pub struct MetricsResponse {
    pub pools: Vec<PoolDiagnostics>,
    pub pipeline: crate::pool::pipeline::PipelineMetricsSnapshot,
    pub cache: crate::cache::CacheMetricsSnapshot,
    pub events: EventsDiagnostics,
    pub storage_degraded: bool,
    pub profiler: Option<std::collections::HashMap<&'static str, crate::profiler::PhaseStats>>,
}

#[derive(Debug, Serialize)]
pub struct PoolDiagnostics {
    pub base_url: String,
    pub metrics: crate::pool::PoolMetricsSnapshot,
    pub connections: Vec<crate::pool::ConnectionInfo>,
}

#[derive(Debug, Serialize)]
pub struct EventsDiagnostics {
    pub subscribers: usize,
    pub slow_consumer_drops: u64,
}

/// Require the admin credential (bearer token or `x-admin-key`). A server
/// without a configured admin key refuses everything.
fn require_admin(state: &ProxyState, headers: &HeaderMap) -> Result<(), ProxyError> {
    let Some(expected) = &state.config.admin_api_key else {
        return Err(ProxyError::Unauthenticated);
    };
    let presented = headers
        .get("x-admin-key")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
        .or_else(|| {
            headers
                .get("authorization")
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.strip_prefix("Bearer "))
                .map(|s| s.to_string())
        })
        .ok_or(ProxyError::Unauthenticated)?;
    if &presented != expected {
        return Err(ProxyError::InvalidCredential);
    }
    Ok(())
}

/// Generate an opaque key: `tg-` plus timestamp and random hex.
/// Uses RandomState to get randomness without adding a dependency.
fn generate_key() -> String {
    use std::collections::hash_map::RandomState;
    use std::hash::{BuildHasher, Hasher};

    let random = RandomState::new().build_hasher().finish();
    format!("{}-{:016x}", "tg", random ^ (now_millis() as u64))
}

/// GET /api/keys - list every tenant key.
pub async fn list_keys(
    State(state): State<ProxyState>,
    headers: HeaderMap,
) -> Result<Json<Vec<KeyResponse>>, ProxyError> {
    require_admin(&state, &headers)?;
    let now = now_millis();
    let mut keys: Vec<KeyResponse> = state
        .store
        .iterate()
        .iter()
        .map(|r| KeyResponse::from_record(r, now))
        .collect();
    keys.sort_by(|a, b| a.key.cmp(&b.key));
    Ok(Json(keys))
}

/// POST /api/keys - create a tenant key. 201 on success.
pub async fn create_key(
    State(state): State<ProxyState>,
    headers: HeaderMap,
    Json(payload): Json<CreateKeyRequest>,
) -> Result<(axum::http::StatusCode, Json<KeyResponse>), ProxyError> {
    require_admin(&state, &headers)?;
    let now = now_millis();

    let mut errors: Vec<FieldError> = Vec::new();
    let name = tenant::validate_name(&payload.name).map_err(|e| errors.push(e)).ok();
    let model = tenant::validate_model(&payload.model, &state.config.allowed_models)
        .map_err(|e| errors.push(e))
        .ok();
    let limit = tenant::validate_token_limit(payload.token_limit_per_5h)
        .map_err(|e| errors.push(e))
        .ok();
    let expiry = tenant::validate_expiry(&payload.expiry_date, now)
        .map_err(|e| errors.push(e))
        .ok();
    if !errors.is_empty() {
        return Err(ProxyError::Validation(errors));
    }

    let record = TenantRecord {
        key: payload.key.filter(|k| !k.trim().is_empty()).unwrap_or_else(generate_key),
        name: name.unwrap_or_default(),
        model: model.unwrap_or_default(),
        token_limit_per_5h: limit.unwrap_or_default(),
        created_at: now,
        last_used: now,
        expiry_date: expiry.unwrap_or_default(),
        lifetime_tokens: 0,
        rolling_window: RollingWindow::new(state.config.window_ms, state.config.bucket_ms),
    };

    let created = state.store.create(record)?;
    tracing::info!(key = %helpers::hash_credential(&created.key), "admin created key");
    Ok((
        axum::http::StatusCode::CREATED,
        Json(KeyResponse::from_record(&created, now)),
    ))
}

/// GET /api/keys/:id - fetch one key.
pub async fn get_key(
    State(state): State<ProxyState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<KeyResponse>, ProxyError> {
    require_admin(&state, &headers)?;
    let record = state.store.lookup(&id).ok_or(ProxyError::NotFound)?;
    Ok(Json(KeyResponse::from_record(&record, now_millis())))
}

/// PUT /api/keys/:id - patch one key.
pub async fn update_key(
    State(state): State<ProxyState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(patch): Json<TenantPatch>,
) -> Result<Json<KeyResponse>, ProxyError> {
    require_admin(&state, &headers)?;
    let now = now_millis();
    let validated = ValidatedPatch::from_patch(&patch, &state.config.allowed_models, now)
        .map_err(ProxyError::Validation)?;
    let updated = state.store.update(&id, validated)?;
    Ok(Json(KeyResponse::from_record(&updated, now)))
}

/// DELETE /api/keys/:id - 204 on success, 404 when absent.
pub async fn delete_key(
    State(state): State<ProxyState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<axum::http::StatusCode, ProxyError> {
    require_admin(&state, &headers)?;
    state.store.delete(&id)?;
    Ok(axum::http::StatusCode::NO_CONTENT)
}

/// GET /api/keys/:id/usage - rolling-window usage for one key.
pub async fn key_usage(
    State(state): State<ProxyState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<KeyUsageResponse>, ProxyError> {
    require_admin(&state, &headers)?;
    let now = now_millis();
    let usage = state
        .store
        .with_tenant(&id, |record| {
            let used = record.rolling_window.total(now);
            KeyUsageResponse {
                key: record.key.clone(),
                tokens_used_in_current_window: used,
                token_limit_per_5h: record.token_limit_per_5h,
                remaining_tokens: record.token_limit_per_5h.saturating_sub(used),
                window_started_at: record
                    .rolling_window
                    .oldest_bucket_start()
                    .map(millis_to_rfc3339),
                window_ends_at: millis_to_rfc3339(record.rolling_window.window_ends_at(now)),
                total_lifetime_tokens: record.lifetime_tokens,
            }
        })
        .ok_or(ProxyError::NotFound)?;
    Ok(Json(usage))
}

/// GET /api/metrics - request-path diagnostics for dashboards.
pub async fn metrics(
    State(state): State<ProxyState>,
    headers: HeaderMap,
) -> Result<Json<MetricsResponse>, ProxyError> {
    require_admin(&state, &headers)?;

    let pools = state
        .pools
        .as_deref()
        .map(|by_base| {
            let mut rows: Vec<PoolDiagnostics> = by_base
                .values()
                .map(|pool| PoolDiagnostics {
                    base_url: pool.base_url().to_string(),
                    metrics: pool.metrics(),
                    connections: pool.connections(),
                })
                .collect();
            rows.sort_by(|a, b| a.base_url.cmp(&b.base_url));
            rows
        })
        .unwrap_or_default();

    Ok(Json(MetricsResponse {
        pools,
        pipeline: state.pipeline.metrics(),
        cache: state.cache.metrics(),
        events: EventsDiagnostics {
            subscribers: state.broadcaster.subscriber_count(),
            slow_consumer_drops: state.broadcaster.slow_consumer_drops(),
        },
        storage_degraded: state.store.is_degraded(),
        profiler: state
            .profiler
            .is_enabled()
            .then(|| state.profiler.snapshot()),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_keys_are_unique_and_prefixed() {
        let a = generate_key();
        let b = generate_key();
        assert!(a.starts_with("tg-"));
        assert_ne!(a, b);
    }

    #[test]
    fn test_key_response_uses_iso_timestamps() {
        let now = 1_700_000_100_000;
        let record = TenantRecord {
            key: "tg-x".into(),
            name: "x".into(),
            model: "glm-4.7".into(),
            token_limit_per_5h: 10,
            created_at: now,
            last_used: now,
            expiry_date: now - 1,
            lifetime_tokens: 3,
            rolling_window: RollingWindow::default(),
        };
        let response = KeyResponse::from_record(&record, now);
        assert!(response.created_at.starts_with("2023-11-14T"));
        assert!(response.is_expired);
    }
}
