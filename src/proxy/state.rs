//! Proxy state types and shared coordination structures

use std::collections::HashMap;
use std::sync::Arc;

use crate::cache::ResponseCache;
use crate::config::Config;
use crate::events::Broadcaster;
use crate::pool::pipeline::PipeliningManager;
use crate::pool::ConnectionPool;
use crate::profiler::Profiler;
use crate::store::TenantStore;

/// Which upstream wire shape a request is bound for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpstreamShape {
    /// `<base>/chat/completions`, bearer auth, `usage.total_tokens`.
    Openai,
    /// `<base>/v1/messages`, `x-api-key` + `anthropic-version`,
    /// `usage.input_tokens + usage.output_tokens`.
    Anthropic,
}

/// Resolved forwarding target for one inbound path.
#[derive(Debug, Clone)]
pub struct UpstreamTarget {
    pub shape: UpstreamShape,
    pub base_url: String,
    /// Path under the base URL, leading slash included.
    pub path: String,
}

impl UpstreamTarget {
    /// Map an inbound path onto an upstream. `/v1/<rest>` goes to the
    /// OpenAI-shaped base, `/anthropic/<rest>` to the Anthropic-shaped one.
    pub fn resolve(path: &str, config: &Config) -> Option<Self> {
        if let Some(rest) = path.strip_prefix("/v1/") {
            return Some(Self {
                shape: UpstreamShape::Openai,
                base_url: config.upstream_url.clone(),
                path: format!("/{}", rest),
            });
        }
        if let Some(rest) = path.strip_prefix("/anthropic/") {
            return Some(Self {
                shape: UpstreamShape::Anthropic,
                base_url: config.anthropic_url.clone(),
                path: format!("/{}", rest),
            });
        }
        None
    }

    pub fn url(&self, query: Option<&str>) -> String {
        match query {
            Some(q) if !q.is_empty() => format!("{}{}?{}", self.base_url, self.path, q),
            _ => format!("{}{}", self.base_url, self.path),
        }
    }
}

/// Shared state for the proxy server
#[derive(Clone)]
pub struct ProxyState {
    pub config: Arc<Config>,
    /// Tenant records + persistence
    pub store: Arc<TenantStore>,
    /// Connection pools keyed by upstream base URL; `None` when pooling is
    /// disabled and requests go straight through `client`.
    pub pools: Option<Arc<HashMap<String, Arc<ConnectionPool>>>>,
    /// Per-connection request pipelining
    pub pipeline: Arc<PipeliningManager>,
    /// Response memoization (optional)
    pub cache: Arc<ResponseCache>,
    /// Dashboard event fan-out
    pub broadcaster: Broadcaster,
    /// Per-request timing marks (inert when disabled)
    pub profiler: Arc<Profiler>,
    /// Direct client used when the pool is disabled
    pub client: reqwest::Client,
}

impl ProxyState {
    /// Pool serving `base_url`, when pooling is enabled.
    pub fn pool_for(&self, base_url: &str) -> Option<Arc<ConnectionPool>> {
        self.pools.as_ref()?.get(base_url).cloned()
    }
}
