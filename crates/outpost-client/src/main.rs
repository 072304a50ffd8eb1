//! outpost-client: exposes local services through an outpost relay.

use clap::Parser;
use outpost_client::config::ClientConfig;
use outpost_client::proxy::ClientProxy;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{error, info};

/// Delay between reconnect attempts after a dropped session.
const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// outpost-client — reverse tunnel client
#[derive(Parser, Debug)]
#[command(name = "outpost-client", version, about = "Reverse tunnel client")]
struct Cli {
    /// Relay tunnel endpoint, e.g. ws://relay.example.com:8081
    #[arg(long)]
    server: Option<String>,

    /// Auth token presented on connect
    #[arg(long)]
    token: Option<String>,

    /// Tunnel binding as host=port; repeatable
    #[arg(long = "tunnel")]
    tunnels: Vec<String>,

    /// Config file path
    #[arg(long, default_value = "~/.outpost/client.toml")]
    config: String,

    /// Exit instead of reconnecting when the session drops
    #[arg(long)]
    once: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    use tracing_subscriber::EnvFilter;
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    let config_path = PathBuf::from(&cli.config);
    let config = match ClientConfig::load(
        Some(&config_path),
        cli.server.as_deref(),
        cli.token.as_deref(),
        &cli.tunnels,
    ) {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "failed to load config");
            std::process::exit(1);
        }
    };

    if config.bindings.is_empty() {
        error!("no tunnels configured; use --tunnel host=port or [[tunnels]] in the config file");
        std::process::exit(1);
    }

    info!(
        version = env!("CARGO_PKG_VERSION"),
        server = %config.server_url,
        tunnels = config.bindings.len(),
        "starting outpost-client"
    );

    let proxy = ClientProxy::new(config);
    loop {
        match proxy.run().await {
            Ok(()) => {
                info!("tunnel session ended");
                break;
            }
            Err(e) => {
                error!(error = %e, "tunnel session failed");
                if cli.once {
                    std::process::exit(1);
                }
                info!(delay_secs = RECONNECT_DELAY.as_secs(), "reconnecting");
                tokio::time::sleep(RECONNECT_DELAY).await;
            }
        }
    }
}
