// Proxy module - the HTTP surface and the request-path engine
//
// Routes tenant traffic through authentication, rate limiting, model
// injection, pooled dispatch, and streaming passthrough; hosts the admin
// CRUD surface and the dashboard event channel alongside.

pub mod admin;
pub mod error;
pub mod handler;
pub mod helpers;
pub mod server;
pub mod state;
pub mod stats;
pub mod stream;
pub mod ws;

pub use server::{build_router, start_server};
pub use state::ProxyState;

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::Arc;

    use crate::cache::{CacheConfig, ResponseCache};
    use crate::config::Config;
    use crate::events::Broadcaster;
    use crate::limiter::RateLimiter;
    use crate::pool::pipeline::PipeliningManager;
    use crate::profiler::Profiler;
    use crate::store::{StoreConfig, TenantStore};

    use super::ProxyState;

    /// Minimal state over a scratch file-backed store. Pooling is off so no
    /// sockets get involved.
    pub(crate) async fn test_state(admin_key: Option<&str>) -> ProxyState {
        let dir = tempfile::tempdir().expect("tempdir").into_path();
        let mut config = Config::default();
        config.admin_api_key = admin_key.map(|s| s.to_string());
        config.upstream_api_key = Some("upstream-master".to_string());
        config.pool_enabled = false;
        config.store = StoreConfig {
            data_file: dir.join("keys.json"),
            sqlite_path: None,
            ..Default::default()
        };

        let limiter = Arc::new(RateLimiter::new());
        let broadcaster = Broadcaster::new(config.subscriber_buffer);
        let store = TenantStore::open(config.store.clone(), limiter, broadcaster.clone())
            .expect("test store");

        ProxyState {
            pipeline: Arc::new(PipeliningManager::new(config.pipeline.clone())),
            cache: Arc::new(ResponseCache::new(CacheConfig::default())),
            profiler: Arc::new(Profiler::new(false)),
            client: reqwest::Client::new(),
            pools: None,
            broadcaster,
            store,
            config: Arc::new(config),
        }
    }
}
