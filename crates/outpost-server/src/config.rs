//! Server configuration: TOML file + CLI overrides.

use outpost_core::{OutpostError, OutpostResult};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub auth: AuthSection,
}

/// `[server]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_http_port")]
    pub http_port: u16,
    #[serde(default = "default_tunnel_port")]
    pub tunnel_port: u16,
    /// The relay's own hostname; requests for it are served locally.
    #[serde(default = "default_host")]
    pub host: String,
    pub cert: Option<String>,
    pub key: Option<String>,
    #[serde(default = "default_max_chunk_size")]
    pub max_chunk_size: usize,
    #[serde(default = "default_call_timeout")]
    pub call_timeout_secs: u64,
    #[serde(default = "default_assembly_timeout")]
    pub assembly_timeout_secs: u64,
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            http_port: default_http_port(),
            tunnel_port: default_tunnel_port(),
            host: default_host(),
            cert: None,
            key: None,
            max_chunk_size: default_max_chunk_size(),
            call_timeout_secs: default_call_timeout(),
            assembly_timeout_secs: default_assembly_timeout(),
            max_body_bytes: default_max_body_bytes(),
        }
    }
}

/// `[auth]` section of the config TOML.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AuthSection {
    /// client name -> token. Empty means the relay accepts all clients.
    #[serde(default)]
    pub tokens: HashMap<String, String>,
}

fn default_http_port() -> u16 {
    8080
}
fn default_tunnel_port() -> u16 {
    8081
}
fn default_host() -> String {
    "localhost".to_string()
}
fn default_max_chunk_size() -> usize {
    outpost_core::DEFAULT_MAX_CHUNK_SIZE
}
fn default_call_timeout() -> u64 {
    30
}
fn default_assembly_timeout() -> u64 {
    30
}
fn default_max_body_bytes() -> usize {
    10 * 1024 * 1024
}

/// Resolved server configuration (paths expanded, CLI overrides applied).
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub http_port: u16,
    pub tunnel_port: u16,
    pub host: String,
    pub cert_path: Option<PathBuf>,
    pub key_path: Option<PathBuf>,
    pub max_chunk_size: usize,
    pub call_timeout: Duration,
    pub assembly_timeout: Duration,
    pub max_body_bytes: usize,
    pub tokens: HashMap<String, String>,
}

impl ServerConfig {
    /// Load config from a TOML file, then apply CLI overrides.
    pub fn load(
        config_path: Option<&Path>,
        cli_http_port: Option<u16>,
        cli_tunnel_port: Option<u16>,
        cli_host: Option<&str>,
        cli_cert: Option<&str>,
        cli_key: Option<&str>,
    ) -> OutpostResult<Self> {
        let file_config = read_config_file(config_path)?;

        let cert = cli_cert
            .map(|s| s.to_string())
            .or(file_config.server.cert);
        let key = cli_key.map(|s| s.to_string()).or(file_config.server.key);

        let host = cli_host
            .map(|s| s.to_string())
            .unwrap_or(file_config.server.host);

        Ok(Self {
            http_port: cli_http_port.unwrap_or(file_config.server.http_port),
            tunnel_port: cli_tunnel_port.unwrap_or(file_config.server.tunnel_port),
            host: normalize_host(&host),
            cert_path: cert.as_deref().map(expand_tilde),
            key_path: key.as_deref().map(expand_tilde),
            max_chunk_size: file_config.server.max_chunk_size,
            call_timeout: Duration::from_secs(file_config.server.call_timeout_secs),
            assembly_timeout: Duration::from_secs(file_config.server.assembly_timeout_secs),
            max_body_bytes: file_config.server.max_body_bytes,
            tokens: file_config.auth.tokens,
        })
    }
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
pub fn expand_tilde(s: &str) -> PathBuf {
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(s)
}
