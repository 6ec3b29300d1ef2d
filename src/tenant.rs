//! Tenant records and validation
//!
//! A tenant is a caller identified by one opaque API key, carrying its own
//! quota, upstream model binding, and rolling-window state. Records are what
//! the store persists and what the admin surface creates and edits.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::window::RollingWindow;

/// Upper bound on a per-window token quota accepted by the admin surface.
pub const MAX_TOKEN_LIMIT: u64 = 10_000_000;

/// Maximum tenant name length after trimming.
pub const MAX_NAME_LEN: usize = 255;

/// One tenant: key, label, model binding, quota, counters, window state.
///
/// Timestamps are wall-clock milliseconds. `lifetime_tokens` only increases.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TenantRecord {
    /// Opaque API key presented by clients. Primary identity.
    pub key: String,
    /// Human label, 1..=255 chars after trim.
    pub name: String,
    /// Upstream model this tenant's traffic is rewritten to.
    pub model: String,
    /// Per-window token quota. Always positive.
    pub token_limit_per_5h: u64,
    pub created_at: i64,
    pub last_used: i64,
    pub expiry_date: i64,
    /// Monotonic total of all tokens ever charged to this key.
    pub lifetime_tokens: u64,
    #[serde(default)]
    pub rolling_window: RollingWindow,
}

impl TenantRecord {
    pub fn is_expired(&self, now_millis: i64) -> bool {
        self.expiry_date < now_millis
    }
}

/// Partial update applied by the admin surface. Absent fields keep their
/// current value.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TenantPatch {
    pub name: Option<String>,
    pub model: Option<String>,
    pub token_limit_per_5h: Option<u64>,
    /// ISO-8601; validated against `now` before being applied.
    pub expiry_date: Option<String>,
}

/// One field-level validation failure, reported back as `{field, message}`.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct FieldError {
    pub field: String,
    pub message: String,
}

impl FieldError {
    pub fn new(field: &str, message: impl Into<String>) -> Self {
        Self {
            field: field.to_string(),
            message: message.into(),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Validation
// ─────────────────────────────────────────────────────────────────────────────

/// Validate a tenant name. Returns the trimmed form.
pub fn validate_name(name: &str) -> Result<String, FieldError> {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return Err(FieldError::new("name", "must not be empty"));
    }
    if trimmed.chars().count() > MAX_NAME_LEN {
        return Err(FieldError::new(
            "name",
            format!("must be at most {} characters", MAX_NAME_LEN),
        ));
    }
    Ok(trimmed.to_string())
}

pub fn validate_token_limit(limit: u64) -> Result<u64, FieldError> {
    if limit == 0 || limit > MAX_TOKEN_LIMIT {
        return Err(FieldError::new(
            "token_limit_per_5h",
            format!("must be between 1 and {}", MAX_TOKEN_LIMIT),
        ));
    }
    Ok(limit)
}

/// Parse and validate an ISO-8601 expiry. Must not be in the past.
pub fn validate_expiry(expiry: &str, now_millis: i64) -> Result<i64, FieldError> {
    let parsed = DateTime::parse_from_rfc3339(expiry)
        .map_err(|_| FieldError::new("expiry_date", "must be an ISO-8601 timestamp"))?;
    let millis = parsed.timestamp_millis();
    if millis < now_millis {
        return Err(FieldError::new("expiry_date", "must not be in the past"));
    }
    Ok(millis)
}

/// Validate a model name against the configured allow-list.
pub fn validate_model(model: &str, allowed: &[String]) -> Result<String, FieldError> {
    if allowed.iter().any(|m| m == model) {
        Ok(model.to_string())
    } else {
        Err(FieldError::new(
            "model",
            format!("must be one of: {}", allowed.join(", ")),
        ))
    }
}

/// Millis -> ISO-8601 UTC string for API responses and event envelopes.
pub fn millis_to_rfc3339(millis: i64) -> String {
    Utc.timestamp_millis_opt(millis)
        .single()
        .unwrap_or_else(Utc::now)
        .to_rfc3339()
}

/// Current wall-clock time in milliseconds.
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_name_trims() {
        assert_eq!(validate_name("  ops team  ").unwrap(), "ops team");
    }

    #[test]
    fn test_validate_name_rejects_empty_after_trim() {
        assert!(validate_name("   ").is_err());
        assert!(validate_name("").is_err());
    }

    #[test]
    fn test_validate_name_rejects_overlong() {
        let long = "x".repeat(256);
        assert!(validate_name(&long).is_err());
        let ok = "x".repeat(255);
        assert!(validate_name(&ok).is_ok());
    }

    #[test]
    fn test_validate_token_limit_bounds() {
        assert!(validate_token_limit(0).is_err());
        assert!(validate_token_limit(1).is_ok());
        assert!(validate_token_limit(10_000_000).is_ok());
        assert!(validate_token_limit(10_000_001).is_err());
    }

    #[test]
    fn test_validate_expiry_rejects_past_and_garbage() {
        let now = now_millis();
        assert!(validate_expiry("not a date", now).is_err());
        assert!(validate_expiry("2020-01-01T00:00:00Z", now).is_err());
        assert!(validate_expiry("2099-01-01T00:00:00Z", now).is_ok());
    }

    #[test]
    fn test_validate_model_allow_list() {
        let allowed = vec!["glm-4.7".to_string(), "glm-4.7-air".to_string()];
        assert_eq!(validate_model("glm-4.7", &allowed).unwrap(), "glm-4.7");
        assert!(validate_model("gpt-4", &allowed).is_err());
    }

    #[test]
    fn test_record_expiry() {
        let now = 1_700_000_100_000;
        let rec = TenantRecord {
            key: "tg-test".into(),
            name: "test".into(),
            model: "glm-4.7".into(),
            token_limit_per_5h: 1000,
            created_at: now,
            last_used: now,
            expiry_date: now + 86_400_000,
            lifetime_tokens: 0,
            rolling_window: RollingWindow::default(),
        };
        assert!(!rec.is_expired(now));
        assert!(!rec.is_expired(now + 86_400_000));
        assert!(rec.is_expired(now + 86_400_001));
    }

    #[test]
    fn test_record_serde_roundtrip() {
        let now = 1_700_000_100_000;
        let mut rec = TenantRecord {
            key: "tg-abc".into(),
            name: "abc".into(),
            model: "glm-4.7".into(),
            token_limit_per_5h: 500,
            created_at: now,
            last_used: now,
            expiry_date: now + 1000,
            lifetime_tokens: 42,
            rolling_window: RollingWindow::default(),
        };
        rec.rolling_window.add(now, 42);
        let json = serde_json::to_string(&rec).unwrap();
        let mut back: TenantRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back.key, rec.key);
        assert_eq!(back.lifetime_tokens, 42);
        assert_eq!(back.rolling_window.total(now + 1), 42);
    }
}
