//! Client configuration: TOML file + CLI overrides.

use outpost_core::{OutpostError, OutpostResult};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub client: ClientSection,
    #[serde(default)]
    pub tunnels: Vec<TunnelSection>,
}

/// `[client]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct ClientSection {
    #[serde(default = "default_server")]
    pub server: String,
    pub token: Option<String>,
    #[serde(default = "default_ping_interval")]
    pub ping_interval_secs: u64,
    #[serde(default = "default_max_chunk_size")]
    pub max_chunk_size: usize,
}

impl Default for ClientSection {
    fn default() -> Self {
        Self {
            server: default_server(),
            token: None,
            ping_interval_secs: default_ping_interval(),
            max_chunk_size: default_max_chunk_size(),
        }
    }
}

/// One `[[tunnels]]` entry: a public host served by a local port.
#[derive(Debug, Clone, Deserialize)]
pub struct TunnelSection {
    pub host: String,
    pub local_port: u16,
}

fn default_server() -> String {
    "ws://localhost:8081".to_string()
}
fn default_ping_interval() -> u64 {
    30
}
fn default_max_chunk_size() -> usize {
    outpost_core::DEFAULT_MAX_CHUNK_SIZE
}

/// A public host claim backed by a local port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Binding {
    pub host: String,
    pub local_port: u16,
}

/// Resolved client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub server_url: String,
    pub token: Option<String>,
    pub bindings: Vec<Binding>,
    pub ping_interval: Duration,
    pub max_chunk_size: usize,
}

impl ClientConfig {
    /// Load config from a TOML file, then apply CLI overrides. Tunnels
    /// given on the command line replace the file's tunnel table.
    pub fn load(
        config_path: Option<&Path>,
        cli_server: Option<&str>,
        cli_token: Option<&str>,
        cli_tunnels: &[String],
    ) -> OutpostResult<Self> {
        let file_config = read_config_file(config_path)?;

        let bindings = if cli_tunnels.is_empty() {
            file_config
                .tunnels
                .iter()
                .map(|t| Binding {
                    host: normalize_host(&t.host),
                    local_port: t.local_port,
                })
                .collect()
        } else {
            cli_tunnels
                .iter()
                .map(|s| parse_tunnel_arg(s))
                .collect::<OutpostResult<Vec<_>>>()?
        };

        Ok(Self {
            server_url: cli_server
                .map(|s| s.to_string())
                .unwrap_or(file_config.client.server),
            token: cli_token
                .map(|s| s.to_string())
                .or(file_config.client.token),
            bindings,
            ping_interval: Duration::from_secs(file_config.client.ping_interval_secs),
            max_chunk_size: file_config.client.max_chunk_size,
        })
    }
}

/// Parse a `host=port` tunnel argument.
pub fn parse_tunnel_arg(s: &str) -> OutpostResult<Binding> {
    let (host, port) = s
        .split_once('=')
        .ok_or_else(|| OutpostError::Config(format!("bad tunnel spec {s:?}, expected host=port")))?;
    let local_port: u16 = port
        .parse()
        .map_err(|_| OutpostError::Config(format!("bad local port in tunnel spec {s:?}")))?;
    if host.is_empty() {
        return Err(OutpostError::Config(format!(
            "empty host in tunnel spec {s:?}"
        )));
    }
    Ok(Binding {
        host: normalize_host(host),
        local_port,
    })
}

fn read_config_file(config_path: Option<&Path>) -> OutpostResult<ConfigFile> {
    let Some(path) = config_path else {
        return Ok(ConfigFile::default());
    };
    let expanded = expand_tilde(&path.to_string_lossy());
    if !expanded.exists() {
        info!(path = %expanded.display(), "config file not found, using defaults");
        return Ok(ConfigFile::default());
    }
    info!(path = %expanded.display(), "loading config file");
    let content = std::fs::read_to_string(&expanded)?;
    toml::from_str::<ConfigFile>(&content)
        .map_err(|e| OutpostError::Config(format!("config parse error: {e}")))
}

/// Lowercase a hostname and strip any port suffix.
pub fn normalize_host(host: &str) -> String {
    host.split(':').next().unwrap_or(host).to_ascii_lowercase()
}

/// Expand `~` to the user's home directory.
fn expand_tilde(s: &str) -> PathBuf {
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(s)
}
