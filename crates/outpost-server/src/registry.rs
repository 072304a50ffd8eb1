//! Host-to-session directory with single-owner-per-host enforcement.
//!
//! All mutations and lookups are serialized on one mutex so the conflict
//! check and commit in [`TunnelRegistry::bind`] are atomic: two concurrent
//! binds for the same host can never both succeed. The lock is only ever
//! held for map operations, never across a network call.

use crate::session::Session;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Outcome of a bind attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BindOutcome {
    Bound,
    /// Another live session already owns the host.
    Conflict { owner: String },
}

/// Directory mapping a bound hostname to the session serving it.
pub struct TunnelRegistry {
    tunnels: Mutex<HashMap<String, Arc<Session>>>,
}

impl TunnelRegistry {
    pub fn new() -> Self {
        Self {
            tunnels: Mutex::new(HashMap::new()),
        }
    }

    /// Atomically check-and-bind. A dead owner still in the map is replaced
    /// rather than reported as a conflict.
    pub async fn bind(&self, host: &str, session: &Arc<Session>) -> BindOutcome {
        let mut tunnels = self.tunnels.lock().await;
        if let Some(existing) = tunnels.get(host) {
            if existing.id() != session.id() && existing.is_active().await {
                debug!(host, owner = %existing.id(), "bind conflict");
                return BindOutcome::Conflict {
                    owner: existing.id().to_string(),
                };
            }
        }
        tunnels.insert(host.to_string(), session.clone());
        info!(host, session_id = %session.id(), "tunnel bound");
        BindOutcome::Bound
    }

    /// Remove the binding only if `session` is the current owner. A stale or
    /// duplicate remove is a no-op.
    pub async fn unbind(&self, host: &str, session: &Session) {
        let mut tunnels = self.tunnels.lock().await;
        if tunnels
            .get(host)
            .map(|owner| owner.id() == session.id())
            .unwrap_or(false)
        {
            tunnels.remove(host);
            info!(host, session_id = %session.id(), "tunnel unbound");
        }
    }

    /// Look up the session serving a host. Absence means "no tunnel", not
    /// an error.
    pub async fn resolve(&self, host: &str) -> Option<Arc<Session>> {
        self.tunnels.lock().await.get(host).cloned()
    }

    /// Drop every binding owned by a closed session. Returns the hosts that
    /// were removed.
    pub async fn on_session_closed(&self, session: &Session) -> Vec<String> {
        let mut tunnels = self.tunnels.lock().await;
        let mut removed = Vec::new();
        tunnels.retain(|host, owner| {
            if owner.id() == session.id() {
                removed.push(host.clone());
                false
            } else {
                true
            }
        });
        if !removed.is_empty() {
            debug!(
                session_id = %session.id(),
                count = removed.len(),
                "dropped bindings for closed session"
            );
        }
        removed
    }

    /// Sweep entries whose session closed without the close path reaching
    /// the registry. Backstop only; the close path is the normal route.
    pub async fn prune_closed(&self) -> usize {
        let mut tunnels = self.tunnels.lock().await;
        let mut dead = Vec::new();
        for (host, session) in tunnels.iter() {
            if !session.is_active().await {
                dead.push(host.clone());
            }
        }
        for host in &dead {
            tunnels.remove(host);
        }
        if !dead.is_empty() {
            debug!(count = dead.len(), "pruned bindings for dead sessions");
        }
        dead.len()
    }

    /// Number of live bindings.
    pub async fn count(&self) -> usize {
        self.tunnels.lock().await.len()
    }
}

impl Default for TunnelRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    async fn session() -> Arc<Session> {
        // Registry tests never send, so the receiver can be dropped.
        let (tx, _rx) = mpsc::channel(8);
        let session = Arc::new(Session::new(tx, outpost_core::DEFAULT_MAX_CHUNK_SIZE));
        session.activate().await;
        session
    }

    #[tokio::test]
    async fn second_bind_conflicts_and_owner_is_kept() {
        let registry = TunnelRegistry::new();
        let a = session().await;
        let b = session().await;

        assert_eq!(registry.bind("a.example.com", &a).await, BindOutcome::Bound);
        assert!(matches!(
            registry.bind("a.example.com", &b).await,
            BindOutcome::Conflict { owner } if owner == a.id()
        ));

        let resolved = registry.resolve("a.example.com").await.unwrap();
        assert_eq!(resolved.id(), a.id());
    }

    #[tokio::test]
    async fn rebind_by_same_session_is_not_a_conflict() {
        let registry = TunnelRegistry::new();
        let a = session().await;
        assert_eq!(registry.bind("a.example.com", &a).await, BindOutcome::Bound);
        assert_eq!(registry.bind("a.example.com", &a).await, BindOutcome::Bound);
        assert_eq!(registry.count().await, 1);
    }

    #[tokio::test]
    async fn unbind_only_removes_for_the_owner() {
        let registry = TunnelRegistry::new();
        let a = session().await;
        let b = session().await;
        registry.bind("a.example.com", &a).await;

        // Stale remove from a non-owner is a no-op.
        registry.unbind("a.example.com", &b).await;
        assert!(registry.resolve("a.example.com").await.is_some());

        registry.unbind("a.example.com", &a).await;
        assert!(registry.resolve("a.example.com").await.is_none());
        // Duplicate remove stays a no-op.
        registry.unbind("a.example.com", &a).await;
    }

    #[tokio::test]
    async fn session_close_releases_all_hosts_for_rebinding() {
        let registry = TunnelRegistry::new();
        let a = session().await;
        let b = session().await;
        registry.bind("a.example.com", &a).await;
        registry.bind("b.example.com", &a).await;

        a.close().await;
        let mut removed = registry.on_session_closed(&a).await;
        removed.sort();
        assert_eq!(removed, vec!["a.example.com", "b.example.com"]);
        assert!(registry.resolve("a.example.com").await.is_none());
        assert!(registry.resolve("b.example.com").await.is_none());

        assert_eq!(registry.bind("a.example.com", &b).await, BindOutcome::Bound);
    }

    #[tokio::test]
    async fn dead_owner_is_replaced_without_conflict() {
        let registry = TunnelRegistry::new();
        let a = session().await;
        let b = session().await;
        registry.bind("a.example.com", &a).await;

        // A closed but not yet pruned: bind must treat it as absent.
        a.close().await;
        assert_eq!(registry.bind("a.example.com", &b).await, BindOutcome::Bound);

        // The late close notification must not evict the new owner.
        registry.on_session_closed(&a).await;
        let resolved = registry.resolve("a.example.com").await.unwrap();
        assert_eq!(resolved.id(), b.id());
    }

    #[tokio::test]
    async fn prune_sweeps_dead_sessions() {
        let registry = TunnelRegistry::new();
        let a = session().await;
        registry.bind("a.example.com", &a).await;

        assert_eq!(registry.prune_closed().await, 0);
        a.close().await;
        assert_eq!(registry.prune_closed().await, 1);
        assert_eq!(registry.count().await, 0);
    }
}
