//! AetherTunnel Client
//!
//! Dials out to the server, authenticates, registers the configured
//! proxies, and serves work connections that carry end-user traffic to the
//! local upstreams.

use aethertunnel::client::Client;
use aethertunnel::config::{Config, LoggingConfig};
use anyhow::{anyhow, Context, Result};
use clap::Parser;
use tracing::info;

/// AetherTunnel Client - reverse tunneling gateway
#[derive(Parser, Debug)]
#[command(name = "aether-client")]
#[command(about = "AetherTunnel client - expose local services through a public server")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// Log level override (trace, debug, info, warn, error)
    #[arg(short = 'v', long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = Config::load(&args.config).context("failed to load configuration")?;
    init_logging(&config.logging, args.log_level.as_deref());

    let client_config = config
        .client
        .ok_or_else(|| anyhow!("no [client] section in {}", args.config))?;

    let client = Client::new(client_config).context("failed to initialise client")?;

    info!(version = aethertunnel::VERSION, "aether-client starting");

    tokio::select! {
        result = client.run() => {
            result.context("client failed")?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("shutting down");
        }
    }

    Ok(())
}

fn init_logging(config: &LoggingConfig, override_level: Option<&str>) {
    let level = override_level.unwrap_or(&config.level);
    let builder = tracing_subscriber::fmt().with_env_filter(level);
    if config.format == "json" {
        builder.json().init();
    } else {
        builder.init();
    }
}
