//! JSON peephole transformer
//!
//! The hot path rewrites exactly one known field on ingress (`model`) and
//! reads exactly one known field on egress (`usage`). Neither needs a full
//! parse/serialize round-trip in the common case: `inject_model` splices the
//! value region of a top-level `"model"` key found by a small depth-aware
//! scanner, and `extract_tokens` pattern-matches the OpenAI usage block.
//! Anything ambiguous or malformed defers to a full `serde_json` pass, and a
//! body that cannot be rewritten at all is returned unchanged with the error
//! surfaced — never corrupted.

use std::sync::OnceLock;

use bytes::Bytes;
use regex::Regex;
use serde_json::Value;

/// Result of a model injection.
#[derive(Debug, Clone)]
pub struct InjectOutcome {
    pub body: Bytes,
    /// True when the output differs from the input.
    pub modified: bool,
    /// True when the slow full-parse path ran.
    pub used_full_parse: bool,
}

/// Result of a usage extraction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenExtraction {
    pub tokens: Option<u64>,
    pub used_full_parse: bool,
}

/// A body that could not be rewritten even by the full-parse fallback.
/// The caller forwards the original bytes and logs the failure.
#[derive(Debug)]
pub struct PeepholeError(pub String);

impl std::fmt::Display for PeepholeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "model injection failed: {}", self.0)
    }
}

impl std::error::Error for PeepholeError {}

// ─────────────────────────────────────────────────────────────────────────────
// Model injection
// ─────────────────────────────────────────────────────────────────────────────

/// Rewrite the top-level `"model"` field of a JSON object body to `new_model`.
///
/// The fast path splices only the value region: surrounding whitespace and
/// field order are untouched. When the field is absent, `fallback` controls
/// whether a full parse inserts it. When the body is not an object or the
/// scanner cannot make sense of it, the full parse decides; if that fails
/// too, the error is surfaced and the body is left alone.
pub fn inject_model(
    body: &[u8],
    new_model: &str,
    fallback: bool,
) -> Result<InjectOutcome, PeepholeError> {
    let text = match std::str::from_utf8(body) {
        Ok(t) => t,
        Err(e) => return Err(PeepholeError(format!("body is not UTF-8: {}", e))),
    };

    match find_top_level_model(text) {
        Scan::Found { vstart, vend } => {
            let old = &text[vstart..vend];
            let escaped = escape_json_string(new_model);
            if old == escaped {
                return Ok(InjectOutcome {
                    body: Bytes::copy_from_slice(body),
                    modified: false,
                    used_full_parse: false,
                });
            }
            let mut out = String::with_capacity(text.len() + escaped.len());
            out.push_str(&text[..vstart]);
            out.push_str(&escaped);
            out.push_str(&text[vend..]);
            Ok(InjectOutcome {
                body: Bytes::from(out),
                modified: true,
                used_full_parse: false,
            })
        }
        Scan::Absent => {
            if fallback {
                inject_full_parse(body, new_model)
            } else {
                Ok(InjectOutcome {
                    body: Bytes::copy_from_slice(body),
                    modified: false,
                    used_full_parse: false,
                })
            }
        }
        // Non-string value or a document the scanner gave up on: let the
        // full parse decide.
        Scan::FoundNonString | Scan::Malformed => inject_full_parse(body, new_model),
    }
}

/// Full parse + rewrite. The output is guaranteed well-formed JSON.
fn inject_full_parse(body: &[u8], new_model: &str) -> Result<InjectOutcome, PeepholeError> {
    let mut value: Value = serde_json::from_slice(body)
        .map_err(|e| PeepholeError(format!("body is not valid JSON: {}", e)))?;
    let Some(obj) = value.as_object_mut() else {
        return Err(PeepholeError("body is not a JSON object".to_string()));
    };
    obj.insert("model".to_string(), Value::String(new_model.to_string()));
    let out =
        serde_json::to_vec(&value).map_err(|e| PeepholeError(format!("serialize: {}", e)))?;
    Ok(InjectOutcome {
        body: Bytes::from(out),
        modified: true,
        used_full_parse: true,
    })
}

/// Escape a model name for splicing inside a JSON string literal.
fn escape_json_string(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            c => out.push(c),
        }
    }
    out
}

/// Where the scanner found (or didn't find) a top-level `"model"` key.
#[derive(Debug, PartialEq, Eq)]
enum Scan {
    /// String value spans `vstart..vend` (exclusive of the quotes).
    Found { vstart: usize, vend: usize },
    /// Key exists at top level but the value is not a string.
    FoundNonString,
    /// Scanned the whole top-level object; the key is not there.
    Absent,
    /// Not an object, or the scanner lost track. Defer to full parse.
    Malformed,
}

/// Depth-aware scan for a top-level `"model"` key.
///
/// Tracks object/array depth and string state so a nested `"model"` (for
/// example inside `messages`) is never mistaken for the top-level field.
fn find_top_level_model(text: &str) -> Scan {
    let b = text.as_bytes();
    let mut i = 0;
    while i < b.len() && b[i].is_ascii_whitespace() {
        i += 1;
    }
    if i >= b.len() || b[i] != b'{' {
        return Scan::Malformed;
    }
    i += 1;

    let mut depth: usize = 1;
    // At depth 1, strings alternate between keys and values; `,` and `{`
    // reset to key position, `:` moves to value position.
    let mut expecting_key = true;

    while i < b.len() {
        match b[i] {
            b'"' => {
                let Some(end) = string_end(b, i) else {
                    return Scan::Malformed;
                };
                if depth == 1 && expecting_key {
                    let key = &text[i + 1..end];
                    let mut j = end + 1;
                    while j < b.len() && b[j].is_ascii_whitespace() {
                        j += 1;
                    }
                    if j >= b.len() || b[j] != b':' {
                        return Scan::Malformed;
                    }
                    if key == "model" {
                        let mut k = j + 1;
                        while k < b.len() && b[k].is_ascii_whitespace() {
                            k += 1;
                        }
                        if k < b.len() && b[k] == b'"' {
                            return match string_end(b, k) {
                                Some(vend) => Scan::Found {
                                    vstart: k + 1,
                                    vend,
                                },
                                None => Scan::Malformed,
                            };
                        }
                        return Scan::FoundNonString;
                    }
                    expecting_key = false;
                    i = j + 1;
                    continue;
                }
                i = end + 1;
                continue;
            }
            b'{' | b'[' => depth += 1,
            b'}' | b']' => {
                depth -= 1;
                if depth == 0 {
                    return Scan::Absent;
                }
            }
            b',' if depth == 1 => expecting_key = true,
            _ => {}
        }
        i += 1;
    }
    // Ran off the end without closing the object.
    Scan::Malformed
}

/// Index of the closing quote of the string starting at `start` (which must
/// point at the opening quote). Honors backslash escapes.
fn string_end(b: &[u8], start: usize) -> Option<usize> {
    let mut i = start + 1;
    while i < b.len() {
        match b[i] {
            b'\\' => i += 2,
            b'"' => return Some(i),
            _ => i += 1,
        }
    }
    None
}

// ─────────────────────────────────────────────────────────────────────────────
// Usage extraction
// ─────────────────────────────────────────────────────────────────────────────

/// OpenAI-shaped usage block: `"usage":{..."total_tokens":N...}`.
fn total_tokens_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#""usage"\s*:\s*\{[^{}]*"total_tokens"\s*:\s*(\d+)"#)
            .expect("total_tokens pattern compiles")
    })
}

/// Pull the token count out of a response body.
///
/// The regex peephole handles the OpenAI shape without parsing. Anything
/// else falls back to a full parse that recognizes both `usage.total_tokens`
/// and the Anthropic `usage.input_tokens + usage.output_tokens` split.
pub fn extract_tokens(body: &[u8]) -> TokenExtraction {
    if let Ok(text) = std::str::from_utf8(body) {
        if let Some(caps) = total_tokens_pattern().captures(text) {
            if let Ok(n) = caps[1].parse::<u64>() {
                return TokenExtraction {
                    tokens: Some(n),
                    used_full_parse: false,
                };
            }
        }
    }

    let tokens = serde_json::from_slice::<Value>(body)
        .ok()
        .and_then(|v| usage_from_value(&v));
    TokenExtraction {
        tokens,
        used_full_parse: true,
    }
}

fn usage_from_value(v: &Value) -> Option<u64> {
    let usage = v.get("usage")?;
    if let Some(total) = usage.get("total_tokens").and_then(Value::as_u64) {
        return Some(total);
    }
    let input = usage.get("input_tokens").and_then(Value::as_u64);
    let output = usage.get("output_tokens").and_then(Value::as_u64);
    match (input, output) {
        (None, None) => None,
        (i, o) => Some(i.unwrap_or(0) + o.unwrap_or(0)),
    }
}
