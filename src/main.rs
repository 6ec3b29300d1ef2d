// tollgate - multi-tenant token-metered reverse proxy for LLM upstreams
//
// Fronts an OpenAI-shaped and an Anthropic-shaped upstream behind
// tenant-scoped API keys. Every request is authenticated, checked against a
// per-key rolling token quota, rewritten to the tenant's bound model, and
// dispatched over a pooled, pipelined connection; responses stream back
// while token usage is extracted for accounting.
//
// Architecture:
// - Proxy server (axum): tenant surface, admin CRUD, and the /ws channel
// - Tenant store: per-key records with file or SQLite persistence
// - Rate limiter: O(1) rolling-window quota decisions
// - Connection pool + pipelining: bounded, prioritized upstream dispatch
// - Broadcaster: key-lifecycle events fanned out to dashboard subscribers

mod cache;
mod cli;
mod config;
mod events;
mod limiter;
mod peephole;
mod pool;
mod profiler;
mod proxy;
mod startup;
mod store;
mod tenant;
mod window;

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use cache::ResponseCache;
use cli::Cli;
use config::Config;
use events::Broadcaster;
use limiter::RateLimiter;
use pool::pipeline::PipeliningManager;
use pool::ConnectionPool;
use profiler::Profiler;
use proxy::ProxyState;
use store::TenantStore;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = Config::load(cli.config.as_deref());
    cli.apply(&mut config);

    if cli.print_config {
        println!("{:#?}", config);
        return Ok(());
    }

    // Precedence: RUST_LOG env var > config level > default "info"
    let default_filter = format!("tollgate={},tower_http=info", config.log_level);
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter.into());
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    startup::print_startup(&config);
    startup::log_startup(&config);

    // Core components. The limiter is shared between the store (usage
    // recording) and the request path (decisions).
    let limiter = Arc::new(RateLimiter::new());
    let broadcaster = Broadcaster::new(config.subscriber_buffer);
    let store = TenantStore::open(config.store.clone(), limiter, broadcaster.clone())
        .context("Failed to open tenant store")?;
    let flush_handle = store.spawn_flush_task();

    // One pool per upstream base URL, each with its own health loop.
    let mut maintenance_handles = Vec::new();
    let pools = if config.pool_enabled {
        let mut by_base = HashMap::new();
        for base_url in [config.upstream_url.clone(), config.anthropic_url.clone()] {
            let pool = ConnectionPool::new(base_url.clone(), config.pool.clone());
            if config.pool.warm_pool {
                if let Err(e) = pool.warm() {
                    tracing::warn!(base_url = %base_url, error = %e, "pool warmup failed");
                }
            }
            maintenance_handles.push(pool.spawn_maintenance());
            by_base.insert(base_url, pool);
        }
        Some(Arc::new(by_base))
    } else {
        tracing::info!("connection pool disabled, using direct dispatch");
        None
    };

    let pipeline = Arc::new(PipeliningManager::new(config.pipeline.clone()));
    let cache = Arc::new(ResponseCache::new(config.cache.clone()));
    let profiler = Arc::new(Profiler::new(config.profiler_enabled));

    // Fallback client for the pool-disabled path.
    let client = reqwest::Client::builder()
        .timeout(config.pool.request_timeout)
        .pool_max_idle_per_host(10)
        .build()
        .context("Failed to create HTTP client")?;

    let state = ProxyState {
        config: Arc::new(config),
        store: store.clone(),
        pools: pools.clone(),
        pipeline: pipeline.clone(),
        cache,
        broadcaster: broadcaster.clone(),
        profiler,
        client,
    };

    // Graceful shutdown: stop accepting, let in-flight requests finish,
    // then drain queues and flush pending usage.
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();
    let server_handle = tokio::spawn(proxy::start_server(state, shutdown_rx));

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    tracing::info!("Shutting down...");

    let _ = shutdown_tx.send(());
    match server_handle.await {
        Ok(result) => result?,
        Err(e) => tracing::error!(error = %e, "server task panicked"),
    }

    pipeline.shutdown();
    if let Some(pools) = &pools {
        for pool in pools.values() {
            pool.shutdown();
        }
    }
    broadcaster.shutdown();

    // Final usage flush so nothing recorded in the last second is lost.
    store.flush_pending();
    flush_handle.abort();
    for handle in maintenance_handles {
        handle.abort();
    }

    tracing::info!("Shutdown complete");
    Ok(())
}
