//! Utility functions for request/response processing

use std::sync::atomic::{AtomicU64, Ordering};

use sha2::{Digest, Sha256};

/// Extract the tenant credential from `Authorization: Bearer <key>` or
/// `x-api-key: <key>`.
pub(crate) fn extract_credential(headers: &axum::http::HeaderMap) -> Option<String> {
    if let Some(key) = headers.get("x-api-key").and_then(|v| v.to_str().ok()) {
        if !key.is_empty() {
            return Some(key.to_string());
        }
    }
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.strip_prefix("Bearer "))
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
}

/// Hash a credential for log correlation (never log the actual key!).
pub(crate) fn hash_credential(key: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(key.as_bytes());
    let hash = hasher.finalize();
    format!("{:x}", hash)[..16].to_string()
}

/// Headers that must not be forwarded in either direction.
pub(crate) fn is_hop_by_hop(name: &str) -> bool {
    matches!(
        name,
        "host" | "connection" | "transfer-encoding" | "keep-alive" | "upgrade" | "content-length"
    )
}

/// Headers carrying the inbound tenant credential. Stripped before the
/// request leaves for the upstream.
pub(crate) fn is_auth_header(name: &str) -> bool {
    let lower = name.to_lowercase();
    lower == "authorization" || lower == "x-api-key"
}

/// Opaque per-request id for logs and profiler marks.
pub(crate) fn generate_request_id() -> String {
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    let n = COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("{:x}-{:04x}", crate::tenant::now_millis(), n & 0xFFFF)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderMap;

    #[test]
    fn test_extract_credential_prefers_x_api_key() {
        let mut headers = HeaderMap::new();
        headers.insert("x-api-key", "tg-abc".parse().unwrap());
        headers.insert("authorization", "Bearer tg-other".parse().unwrap());
        assert_eq!(extract_credential(&headers).as_deref(), Some("tg-abc"));
    }

    #[test]
    fn test_extract_credential_bearer() {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", "Bearer tg-xyz".parse().unwrap());
        assert_eq!(extract_credential(&headers).as_deref(), Some("tg-xyz"));
    }

    #[test]
    fn test_extract_credential_rejects_other_schemes() {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", "Basic dXNlcg==".parse().unwrap());
        assert_eq!(extract_credential(&headers), None);
        assert_eq!(extract_credential(&HeaderMap::new()), None);
    }

    #[test]
    fn test_hash_credential_is_short_and_stable() {
        let a = hash_credential("tg-abc");
        assert_eq!(a.len(), 16);
        assert_eq!(a, hash_credential("tg-abc"));
        assert_ne!(a, hash_credential("tg-abd"));
    }

    #[test]
    fn test_hop_by_hop_and_auth_headers() {
        assert!(is_hop_by_hop("host"));
        assert!(is_hop_by_hop("transfer-encoding"));
        assert!(!is_hop_by_hop("content-type"));
        assert!(is_auth_header("Authorization"));
        assert!(is_auth_header("x-api-key"));
        assert!(!is_auth_header("anthropic-version"));
    }

    #[test]
    fn test_request_ids_are_unique() {
        let a = generate_request_id();
        let b = generate_request_id();
        assert_ne!(a, b);
    }
}
