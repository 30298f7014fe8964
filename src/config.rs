//! Command-line configuration for the router server
//!
//! Routing behaviour lives in the JSON config file (see `settings`); this covers how the
//! process itself runs.
use anyhow::anyhow;
use clap::Parser;
use std::path::PathBuf;

#[derive(Debug, Clone, Parser)]
#[command(version, about, long_about = None)]
pub struct Config {
    /// The port on which the router will listen.
    #[arg(short = 'p', long, env = "SMART_ROUTER_PORT", default_value_t = 3000)]
    pub port: u16,

    /// The port on which the metrics server will listen.
    #[arg(long, default_value_t = 9090)]
    pub metrics_port: u16,

    /// Whether to enable the metrics endpoint.
    #[arg(short = 'm', long, default_value_t = true)]
    pub metrics: bool,

    /// The JSON config file with backend, routing and model settings.
    #[arg(short = 'f', long, env = "SMART_ROUTER_CONFIG")]
    pub config: PathBuf,

    /// Whether we should continue watching the config file for changes
    #[arg(short = 'w', long, default_value_t = true)]
    pub watch: bool,

    /// The prefix to use for metrics.
    #[arg(long, default_value = "smart_router")]
    pub metrics_prefix: String,

    /// Maximum number of idle HTTP connections to keep alive per backend host.
    #[arg(long, default_value_t = 100)]
    pub pool_max_idle_per_host: usize,

    /// How long (in seconds) to keep idle HTTP connections alive.
    #[arg(long, default_value_t = 90)]
    pub pool_idle_timeout_secs: u64,
}

impl Config {
    pub fn validate(self) -> Result<Self, anyhow::Error> {
        if !self.config.exists() {
            return Err(anyhow!(
                "Config file '{}' does not exist",
                self.config.display()
            ));
        }
        Ok(self)
    }
}
