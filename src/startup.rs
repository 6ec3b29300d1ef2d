//! Startup banner and boot-time logging

use crate::config::{Config, VERSION};

/// Print the startup summary to stdout (before logs take over).
pub fn print_startup(config: &Config) {
    println!("tollgate v{}", VERSION);
    println!("  listening     {}", config.bind_addr);
    println!("  upstream      {}", config.upstream_url);
    println!("  anthropic     {}", config.anthropic_url);
    println!(
        "  storage       {}",
        match &config.store.sqlite_path {
            Some(path) => format!("sqlite ({})", path.display()),
            None => format!("file ({})", config.store.data_file.display()),
        }
    );
    println!(
        "  pool          {}",
        if config.pool_enabled {
            format!(
                "{}-{} connections, pipeline x{}",
                config.pool.min_connections,
                config.pool.max_connections,
                config.pipeline.max_concurrent_per_connection
            )
        } else {
            "disabled".to_string()
        }
    );
    println!(
        "  cache         {}",
        if config.cache.enabled {
            format!("{} entries", config.cache.max_size)
        } else {
            "disabled".to_string()
        }
    );
    if config.upstream_api_key.is_none() {
        println!("  WARNING       ZAI_API_KEY is not set; proxied requests will fail");
    }
    if config.admin_api_key.is_none() {
        println!("  WARNING       ADMIN_API_KEY is not set; admin API is disabled");
    }
}

/// Mirror the summary into the log stream for headless captures.
pub fn log_startup(config: &Config) {
    tracing::info!(
        version = VERSION,
        bind = %config.bind_addr,
        upstream = %config.upstream_url,
        pool_enabled = config.pool_enabled,
        cache_enabled = config.cache.enabled,
        window_ms = config.window_ms,
        bucket_ms = config.bucket_ms,
        "tollgate starting"
    );
}
