//! TLS certificate collaborator.
//!
//! Certificate acquisition and renewal (ACME) live outside the core. The
//! relay only needs a provider that can hand over the current PEM pair and
//! answer pending HTTP-01 challenge lookups on the local routes.

use outpost_core::{OutpostError, OutpostResult};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;
use tracing::info;

/// Supplies the relay's TLS material and pending ACME challenges.
pub trait CertificateProvider: Send + Sync {
    /// Current PEM-encoded certificate chain and private key, if any.
    /// `None` means the public listener serves plain HTTP.
    fn current_certificate_and_key(&self) -> Option<(Vec<u8>, Vec<u8>)>;

    /// Proof body for a pending HTTP-01 challenge token.
    fn challenge_token(&self, token: &str) -> Option<String>;

    /// Whether a challenge is currently pending for the given host.
    fn is_challenge_active(&self, host: &str) -> bool;

    /// Register a pending challenge for a host.
    fn set_challenge(&self, host: &str, token: &str, proof: &str);

    /// Remove the pending challenge for a host.
    fn clear_challenge(&self, host: &str);
}

/// Provider backed by static PEM files loaded once at startup.
pub struct StaticCertProvider {
    cert_pem: Option<Vec<u8>>,
    key_pem: Option<Vec<u8>>,
    /// host -> (token, proof)
    challenges: Mutex<HashMap<String, (String, String)>>,
}

impl StaticCertProvider {
    /// A provider with no certificate: the public listener stays on plain HTTP.
    pub fn plaintext() -> Self {
        Self {
            cert_pem: None,
            key_pem: None,
            challenges: Mutex::new(HashMap::new()),
        }
    }

    /// Load a certificate chain and key from PEM files. Failing to read
    /// either file is a startup error.
    pub fn from_files(cert_path: &Path, key_path: &Path) -> OutpostResult<Self> {
        let cert_pem = std::fs::read(cert_path).map_err(|e| {
            OutpostError::Config(format!("cannot read cert {}: {e}", cert_path.display()))
        })?;
        let key_pem = std::fs::read(key_path).map_err(|e| {
            OutpostError::Config(format!("cannot read key {}: {e}", key_path.display()))
        })?;
        info!(cert = %cert_path.display(), "loaded TLS certificate");
        Ok(Self {
            cert_pem: Some(cert_pem),
            key_pem: Some(key_pem),
            challenges: Mutex::new(HashMap::new()),
        })
    }
}

impl CertificateProvider for StaticCertProvider {
    fn current_certificate_and_key(&self) -> Option<(Vec<u8>, Vec<u8>)> {
        match (&self.cert_pem, &self.key_pem) {
            (Some(cert), Some(key)) => Some((cert.clone(), key.clone())),
            _ => None,
        }
    }

    fn challenge_token(&self, token: &str) -> Option<String> {
        let challenges = self.challenges.lock().ok()?;
        challenges
            .values()
            .find(|(t, _)| t == token)
            .map(|(_, proof)| proof.clone())
    }

    fn is_challenge_active(&self, host: &str) -> bool {
        self.challenges
            .lock()
            .map(|c| c.contains_key(host))
            .unwrap_or(false)
    }

    fn set_challenge(&self, host: &str, token: &str, proof: &str) {
        if let Ok(mut challenges) = self.challenges.lock() {
            challenges.insert(host.to_string(), (token.to_string(), proof.to_string()));
        }
    }

    fn clear_challenge(&self, host: &str) {
        if let Ok(mut challenges) = self.challenges.lock() {
            challenges.remove(host);
        }
    }
}

/// Assemble a rustls server config from PEM bytes, with ALPN for
/// HTTP/2 and HTTP/1.1.
pub fn tls_server_config(cert_pem: &[u8], key_pem: &[u8]) -> OutpostResult<rustls::ServerConfig> {
    let certs: Vec<rustls::pki_types::CertificateDer<'static>> =
        rustls_pemfile::certs(&mut &cert_pem[..])
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| OutpostError::Config(format!("bad certificate PEM: {e}")))?;

    let key = rustls_pemfile::private_key(&mut &key_pem[..])
        .map_err(|e| OutpostError::Config(format!("bad key PEM: {e}")))?
        .ok_or_else(|| OutpostError::Config("no private key found in PEM".into()))?;

    let mut config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| OutpostError::Config(format!("TLS config rejected: {e}")))?;

    config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plaintext_provider_has_no_material() {
        let provider = StaticCertProvider::plaintext();
        assert!(provider.current_certificate_and_key().is_none());
        assert!(provider.challenge_token("t").is_none());
        assert!(!provider.is_challenge_active("a.example.com"));
    }

    #[test]
    fn challenge_lifecycle() {
        let provider = StaticCertProvider::plaintext();
        provider.set_challenge("a.example.com", "tok", "tok.proof");

        assert!(provider.is_challenge_active("a.example.com"));
        assert_eq!(provider.challenge_token("tok").as_deref(), Some("tok.proof"));

        provider.clear_challenge("a.example.com");
        assert!(!provider.is_challenge_active("a.example.com"));
        assert!(provider.challenge_token("tok").is_none());
    }
}
