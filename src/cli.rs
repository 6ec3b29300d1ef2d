//! Command-line interface

use std::path::PathBuf;

use clap::Parser;

/// Multi-tenant token-metered reverse proxy for LLM upstreams.
#[derive(Debug, Parser)]
#[command(name = "tollgate", version, about)]
pub struct Cli {
    /// Path to a TOML config file (default: ~/.config/tollgate/config.toml)
    #[arg(long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Bind address, e.g. 127.0.0.1:8788 (overrides config)
    #[arg(long, value_name = "ADDR")]
    pub bind: Option<String>,

    /// Disable the response cache regardless of config
    #[arg(long)]
    pub no_cache: bool,

    /// Print the effective configuration and exit
    #[arg(long)]
    pub print_config: bool,
}

impl Cli {
    /// Fold CLI flags over an already-loaded config.
    pub fn apply(&self, config: &mut crate::config::Config) {
        if let Some(bind) = self.bind.as_deref().and_then(|s| s.parse().ok()) {
            config.bind_addr = bind;
        }
        if self.no_cache {
            config.cache.enabled = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_override_config() {
        let cli = Cli::parse_from(["tollgate", "--bind", "0.0.0.0:9999", "--no-cache"]);
        let mut config = crate::config::Config::default();
        config.cache.enabled = true;
        cli.apply(&mut config);
        assert_eq!(config.bind_addr.port(), 9999);
        assert!(!config.cache.enabled);
    }

    #[test]
    fn test_defaults_leave_config_alone() {
        let cli = Cli::parse_from(["tollgate"]);
        let mut config = crate::config::Config::default();
        let before = config.bind_addr;
        cli.apply(&mut config);
        assert_eq!(config.bind_addr, before);
    }
}
