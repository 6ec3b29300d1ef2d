//! Main proxy handler - the request-path engine
//!
//! One inbound request walks the whole chain: credential lookup, rate-limit
//! check (a one-token hint, no advance charge), model injection through the
//! JSON peephole, dispatch over a pooled connection under a pipelining slot,
//! then either a straight byte-for-byte stream back to the client or a
//! buffered response that gets token accounting and (optionally) cached.
//!
//! Streamed responses are never cached and never charged - token counts are
//! not extracted from SSE bodies, a documented limitation.

use std::sync::OnceLock;
use std::time::Instant;

use axum::{
    body::Body,
    extract::State,
    http::{Request, Response},
};
use bytes::Bytes;
use futures::{StreamExt, TryStreamExt};
use regex::Regex;

use crate::cache::{CachedResponse, ResponseCache};
use crate::limiter::Decision;
use crate::peephole;
use crate::pool::pipeline::Priority;
use crate::tenant::now_millis;

use super::error::ProxyError;
use super::helpers;
use super::state::{ProxyState, UpstreamShape, UpstreamTarget};
use super::stream::Rechunk;

/// Cap on bodies we are willing to hold in memory for injection.
const MAX_BUFFERED_BODY: usize = 10 * 1024 * 1024;

/// Check if a response is SSE based on content-type header
fn is_sse_response(headers: &reqwest::header::HeaderMap) -> bool {
    headers
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .map(|ct| ct.contains("text/event-stream"))
        .unwrap_or(false)
}

/// Does a buffered JSON body ask for a streamed response?
fn wants_stream(body: &[u8]) -> bool {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| {
        Regex::new(r#""stream"\s*:\s*true"#).expect("stream pattern compiles")
    });
    std::str::from_utf8(body).map(|s| re.is_match(s)).unwrap_or(false)
}

enum Outbound {
    Buffered(Bytes),
    Streamed(reqwest::Body),
}

/// Main proxy handler - authenticates, limits, transforms, dispatches,
/// streams, accounts.
pub async fn proxy_handler(
    State(state): State<ProxyState>,
    req: Request<Body>,
) -> Result<Response<Body>, ProxyError> {
    let mut profile = state.profiler.begin();
    let request_id = helpers::generate_request_id();

    let method = req.method().clone();
    let uri = req.uri().clone();
    let headers = req.headers().clone();

    let target = UpstreamTarget::resolve(uri.path(), &state.config).ok_or(ProxyError::NotFound)?;

    // Authenticate the tenant.
    let key = helpers::extract_credential(&headers).ok_or(ProxyError::Unauthenticated)?;
    let tenant = state
        .store
        .lookup(&key)
        .ok_or(ProxyError::InvalidCredential)?;
    tracing::debug!(
        request_id,
        key = %helpers::hash_credential(&key),
        method = %method,
        path = %uri.path(),
        "proxying request"
    );
    profile.mark("auth");

    // Point-in-time rate decision; capacity is not reserved.
    let now = now_millis();
    match state.store.check_rate(&key, 1, now) {
        Some(Decision::Allow) => {}
        Some(Decision::Deny(reason)) => return Err(reason.into()),
        None => return Err(ProxyError::InvalidCredential),
    }
    profile.mark("rate_check");

    let upstream_key = state
        .config
        .upstream_api_key
        .clone()
        .ok_or_else(|| ProxyError::Configuration("upstream API key is not configured".into()))?;

    // Buffer JSON mutation bodies for model injection; everything else
    // passes through unchanged and unbuffered.
    let is_mutation = matches!(method.as_str(), "POST" | "PUT" | "PATCH");
    let is_json = headers
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .map(|ct| ct.contains("application/json"))
        .unwrap_or(false);

    let outbound = if is_mutation && is_json {
        let bytes = axum::body::to_bytes(req.into_body(), MAX_BUFFERED_BODY)
            .await
            .map_err(|e| ProxyError::BodyRead(e.to_string()))?;
        let body = match peephole::inject_model(&bytes, &tenant.model, true) {
            Ok(outcome) => {
                if outcome.modified {
                    tracing::debug!(
                        request_id,
                        model = %tenant.model,
                        full_parse = outcome.used_full_parse,
                        "model injected"
                    );
                }
                outcome.body
            }
            Err(e) => {
                // Do not corrupt: forward the original bytes, surface the
                // failure in the log stream.
                tracing::warn!(request_id, error = %e, "model injection skipped");
                bytes
            }
        };
        profile.mark("inject");
        Outbound::Buffered(body)
    } else {
        let stream = req
            .into_body()
            .into_data_stream()
            .map_err(std::io::Error::other);
        Outbound::Streamed(reqwest::Body::wrap_stream(stream))
    };

    // Cache probe: only buffered, non-streaming candidates qualify.
    let mut cache_key = None;
    if state.cache.is_enabled() && method == axum::http::Method::POST {
        if let Outbound::Buffered(body) = &outbound {
            if !wants_stream(body) {
                let fp =
                    ResponseCache::fingerprint(method.as_str(), uri.path(), body, &tenant.model);
                if let Some(hit) = state.cache.get(&fp) {
                    tracing::debug!(request_id, "response cache hit");
                    return replay_cached(hit);
                }
                cache_key = Some(fp);
            }
        }
    }

    // Acquire a pooled connection and a pipelining slot; fall back to the
    // shared client when pooling is disabled.
    let started = Instant::now();
    let (pool, conn, permit, client) = match state.pool_for(&target.base_url) {
        Some(pool) => {
            let conn = pool.acquire().await?;
            let permit = state
                .pipeline
                .acquire(conn.id(), Priority::Normal)
                .await?;
            let client = conn.client().clone();
            (Some(pool), Some(conn), Some(permit), client)
        }
        None => (None, None, None, state.client.clone()),
    };
    profile.mark("dispatch_wait");

    // Build the forwarded request.
    let forward_method = reqwest::Method::from_bytes(method.as_str().as_bytes())
        .map_err(|e| ProxyError::Internal(format!("invalid HTTP method: {}", e)))?;
    let mut forward = client.request(forward_method, target.url(uri.query()));

    for (name, value) in headers.iter() {
        let name = name.as_str();
        // Hop-by-hop headers stay; the tenant credential never leaves this
        // process.
        if helpers::is_hop_by_hop(name) || helpers::is_auth_header(name) {
            continue;
        }
        if target.shape == UpstreamShape::Anthropic && name == "anthropic-version" {
            continue;
        }
        forward = forward.header(name, value.as_bytes());
    }
    forward = match target.shape {
        UpstreamShape::Openai => forward.header("authorization", format!("Bearer {}", upstream_key)),
        UpstreamShape::Anthropic => forward
            .header("x-api-key", upstream_key)
            .header("anthropic-version", &state.config.anthropic_version),
    };
    forward = match outbound {
        Outbound::Buffered(body) => forward.body(body),
        Outbound::Streamed(body) => forward.body(body),
    };

    let response = forward.send().await.map_err(|e| {
        if let Some(pool) = &pool {
            pool.record_request(started.elapsed(), false);
        }
        tracing::warn!(request_id, error = %e, "upstream request failed");
        ProxyError::Upstream(format!("upstream request failed: {}", e))
    })?;

    let status = response.status();
    let resp_headers = response.headers().clone();
    profile.mark("upstream");

    // Streamed responses go straight back: no buffering, no caching, no
    // token accounting.
    if is_sse_response(&resp_headers) {
        if let Some(pool) = &pool {
            pool.record_request(started.elapsed(), status.is_success());
        }

        let mut builder = Response::builder().status(status.as_u16());
        for (name, value) in resp_headers.iter() {
            let name = name.as_str();
            if helpers::is_hop_by_hop(name) || name == "content-type" {
                continue;
            }
            builder = builder.header(name, value.as_bytes());
        }
        builder = builder.header("content-type", "text/event-stream");
        if !resp_headers.contains_key("cache-control") {
            builder = builder.header("cache-control", "no-cache");
        }

        // The connection checkout and pipelining slot ride inside the
        // stream so they release exactly when the last byte moves (or the
        // client goes away).
        let raw = response
            .bytes_stream()
            .map_err(std::io::Error::other)
            .map(move |item| {
                let _held = (&conn, &permit);
                item
            })
            .boxed();
        let body = if state.config.stream_buffer_pool {
            Body::from_stream(Rechunk::new(raw, state.config.stream_chunk_size))
        } else {
            Body::from_stream(raw)
        };

        profile.finish(&state.profiler, &request_id);
        return builder
            .body(body)
            .map_err(|e| ProxyError::Internal(e.to_string()));
    }

    // Buffered response: read fully, then account and maybe cache.
    let body = response.bytes().await.map_err(|e| {
        if let Some(pool) = &pool {
            pool.record_request(started.elapsed(), false);
        }
        ProxyError::Upstream(format!("failed to read upstream response: {}", e))
    })?;
    if let Some(pool) = &pool {
        pool.record_request(started.elapsed(), status.is_success());
    }
    drop(permit);
    drop(conn);
    profile.mark("read_body");

    if status.is_success() {
        let extraction = peephole::extract_tokens(&body);
        if let Some(tokens) = extraction.tokens.filter(|n| *n > 0) {
            // Fire-and-forget: accounting never delays (or fails) the
            // response already in hand.
            let store = state.store.clone();
            let tenant_key = key.clone();
            let model = tenant.model.clone();
            let rid = request_id.clone();
            tokio::spawn(async move {
                if let Err(e) = store.record_usage(&tenant_key, tokens, &model, now_millis()) {
                    tracing::warn!(request_id = rid, error = %e, "usage accounting failed");
                }
            });
        }

        if let Some(cache_key) = cache_key {
            let kept_headers: Vec<(String, String)> = resp_headers
                .iter()
                .filter(|(name, _)| !helpers::is_hop_by_hop(name.as_str()))
                .filter_map(|(name, value)| {
                    value
                        .to_str()
                        .ok()
                        .map(|v| (name.as_str().to_string(), v.to_string()))
                })
                .collect();
            state.cache.set(
                cache_key,
                CachedResponse {
                    body: body.clone(),
                    status: status.as_u16(),
                    headers: kept_headers,
                    tokens_used: extraction.tokens,
                },
                None,
            );
        }
    }
    profile.mark("account");

    // Upstream non-2xx forwards as-is: status, headers, body.
    let mut builder = Response::builder().status(status.as_u16());
    for (name, value) in resp_headers.iter() {
        if helpers::is_hop_by_hop(name.as_str()) {
            continue;
        }
        builder = builder.header(name.as_str(), value.as_bytes());
    }
    let response = builder
        .body(Body::from(body))
        .map_err(|e| ProxyError::Internal(e.to_string()))?;
    profile.finish(&state.profiler, &request_id);
    Ok(response)
}

/// Rebuild a response from a cache entry.
fn replay_cached(hit: CachedResponse) -> Result<Response<Body>, ProxyError> {
    let mut builder = Response::builder().status(hit.status);
    for (name, value) in &hit.headers {
        builder = builder.header(name.as_str(), value.as_str());
    }
    builder
        .body(Body::from(hit.body))
        .map_err(|e| ProxyError::Internal(e.to_string()))
}
