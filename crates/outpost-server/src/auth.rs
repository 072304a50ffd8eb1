//! Authorization collaborator.
//!
//! Whether a set of credentials may open a tunnel session is decided
//! upstream of the core; the relay only consumes the yes/no answer.

use std::collections::HashMap;
use tracing::warn;

/// An authenticated tunnel client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub name: String,
}

/// Decides whether presented credentials may open a tunnel session.
pub trait Authorizer: Send + Sync {
    /// Map credentials to an identity, or reject with `None`.
    fn authorize(&self, credentials: Option<&str>) -> Option<Identity>;
}

/// Token-table authorizer backed by the `[auth.tokens]` config section.
pub struct TokenAuthorizer {
    /// token -> client name
    tokens: HashMap<String, String>,
}

impl TokenAuthorizer {
    /// Build from a `name -> token` table as it appears in config.
    pub fn new(named_tokens: &HashMap<String, String>) -> Self {
        let tokens = named_tokens
            .iter()
            .map(|(name, token)| (token.clone(), name.clone()))
            .collect();
        Self { tokens }
    }
}

impl Authorizer for TokenAuthorizer {
    fn authorize(&self, credentials: Option<&str>) -> Option<Identity> {
        let token = credentials?;
        self.tokens.get(token).map(|name| Identity { name: name.clone() })
    }
}

/// Accepts every connection. Used when no tokens are configured.
pub struct OpenAuthorizer;

impl OpenAuthorizer {
    pub fn new() -> Self {
        warn!("no auth tokens configured — accepting all tunnel connections");
        Self
    }
}

impl Default for OpenAuthorizer {
    fn default() -> Self {
        Self::new()
    }
}

impl Authorizer for OpenAuthorizer {
    fn authorize(&self, _credentials: Option<&str>) -> Option<Identity> {
        Some(Identity {
            name: "anonymous".to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_table_maps_token_to_name() {
        let mut named = HashMap::new();
        named.insert("alice".to_string(), "s3cret".to_string());
        let auth = TokenAuthorizer::new(&named);

        assert_eq!(
            auth.authorize(Some("s3cret")),
            Some(Identity {
                name: "alice".into()
            })
        );
        assert_eq!(auth.authorize(Some("wrong")), None);
        assert_eq!(auth.authorize(None), None);
    }

    #[test]
    fn open_authorizer_accepts_anything() {
        let auth = OpenAuthorizer;
        assert!(auth.authorize(None).is_some());
        assert!(auth.authorize(Some("whatever")).is_some());
    }
}
