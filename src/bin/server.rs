//! AetherTunnel Server
//!
//! Accepts authenticated client sessions on the control port, opens remote
//! listeners on their behalf, and relays end-user traffic back through
//! client-dialed work connections.

use aethertunnel::config::{Config, LoggingConfig};
use aethertunnel::server::Server;
use anyhow::{anyhow, Context, Result};
use clap::Parser;
use tracing::info;

/// AetherTunnel Server - reverse tunneling gateway
#[derive(Parser, Debug)]
#[command(name = "aether-server")]
#[command(about = "AetherTunnel server - expose services behind NAT")]
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

    let server_config = config
        .server
        .ok_or_else(|| anyhow!("no [server] section in {}", args.config))?;

    let server = Server::bind(server_config)
        .await
        .context("failed to bind control port")?;

    info!(version = aethertunnel::VERSION, "aether-server starting");

    tokio::select! {
        result = server.run() => {
            result.context("server failed")?;
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
