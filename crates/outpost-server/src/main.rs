//! outpost-server: public relay for reverse HTTP tunnels.
//!
//! Binds the public HTTP listener and the tunnel WebSocket listener,
//! authorizes incoming tunnel clients, and routes public traffic to the
//! session owning each hostname.

use clap::Parser;
use outpost_server::auth::{Authorizer, OpenAuthorizer, TokenAuthorizer};
use outpost_server::certs::{CertificateProvider, StaticCertProvider};
use outpost_server::config::ServerConfig;
use outpost_server::relay::Relay;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};

/// outpost-server — reverse tunnel relay
#[derive(Parser, Debug)]
#[command(name = "outpost-server", version, about = "Reverse tunnel relay")]
struct Cli {
    /// Public HTTP listen port
    #[arg(long)]
    http_port: Option<u16>,

    /// Tunnel WebSocket listen port
    #[arg(long)]
    tunnel_port: Option<u16>,

    /// The relay's own hostname (requests for it are served locally)
    #[arg(long)]
    host: Option<String>,

    /// TLS certificate (PEM)
    #[arg(long)]
    cert: Option<String>,

    /// TLS private key (PEM)
    #[arg(long)]
    key: Option<String>,

    /// Config file path
    #[arg(long, default_value = "~/.outpost/server.toml")]
    config: String,

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

    info!(version = env!("CARGO_PKG_VERSION"), "starting outpost-server");

    let config_path = PathBuf::from(&cli.config);
    let config = match ServerConfig::load(
        Some(&config_path),
        cli.http_port,
        cli.tunnel_port,
        cli.host.as_deref(),
        cli.cert.as_deref(),
        cli.key.as_deref(),
    ) {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "failed to load config");
            std::process::exit(1);
        }
    };

    let certs: Arc<dyn CertificateProvider> =
        match (&config.cert_path, &config.key_path) {
            (Some(cert), Some(key)) => match StaticCertProvider::from_files(cert, key) {
                Ok(provider) => Arc::new(provider),
                Err(e) => {
                    error!(error = %e, "failed to load TLS material");
                    std::process::exit(1);
                }
            },
            _ => Arc::new(StaticCertProvider::plaintext()),
        };

    let authorizer: Arc<dyn Authorizer> = if config.tokens.is_empty() {
        Arc::new(OpenAuthorizer::new())
    } else {
        info!(clients = config.tokens.len(), "token authorization enabled");
        Arc::new(TokenAuthorizer::new(&config.tokens))
    };

    let relay = Relay::new(config, authorizer, certs);
    let mut handle = match relay.start().await {
        Ok(handle) => handle,
        Err(e) => {
            error!(error = %e, "failed to start relay");
            std::process::exit(1);
        }
    };

    tokio::select! {
        result = handle.wait() => {
            if let Err(e) = result {
                error!(error = %e, "relay error");
                std::process::exit(1);
            }
        }
        _ = shutdown_signal() => {
            info!("received shutdown signal");
        }
    }

    info!("outpost-server stopped");
}

/// Wait for SIGTERM or SIGINT (Ctrl+C).
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}
