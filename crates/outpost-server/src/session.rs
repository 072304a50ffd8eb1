//! Server-side tunnel session.
//!
//! A `Session` owns one live client connection: it queues outbound frames
//! for the connection's writer task, correlates inbound responses to
//! pending calls by request id, and tracks which hostnames the connection
//! has bound. `bound_hosts` is mutated only by the session's own read loop.

use outpost_core::{
    encode_chunked, OutpostError, OutpostResult, RequestEnvelope, ResponseEnvelope, ServerMessage,
};
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};
use uuid::Uuid;

/// Upper bound on buffered responses that arrived before their caller
/// registered a waiter.
const MAX_ORPHANED_RESPONSES: usize = 64;

/// Lifecycle of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Active,
    Closing,
    Closed,
}

#[derive(Default)]
struct PendingCalls {
    waiters: HashMap<Uuid, oneshot::Sender<ResponseEnvelope>>,
    /// Responses that raced ahead of their call's waiter registration.
    orphaned: HashMap<Uuid, ResponseEnvelope>,
}

/// One live tunnel connection, server side.
pub struct Session {
    id: String,
    outbound: mpsc::Sender<Message>,
    state: Mutex<SessionState>,
    pending: Mutex<PendingCalls>,
    bound_hosts: Mutex<HashSet<String>>,
    max_chunk_size: usize,
}

impl Session {
    /// Create a session around the connection's outbound queue. Starts in
    /// `Connecting`; call [`Session::activate`] once the writer is running.
    pub fn new(outbound: mpsc::Sender<Message>, max_chunk_size: usize) -> Self {
        Self {
            id: generate_session_id(),
            outbound,
            state: Mutex::new(SessionState::Connecting),
            pending: Mutex::new(PendingCalls::default()),
            bound_hosts: Mutex::new(HashSet::new()),
            max_chunk_size,
        }
    }

    /// Opaque session identifier.
    pub fn id(&self) -> &str {
        &self.id
    }

    pub async fn state(&self) -> SessionState {
        *self.state.lock().await
    }

    pub async fn is_active(&self) -> bool {
        *self.state.lock().await == SessionState::Active
    }

    /// Transition `Connecting -> Active`.
    pub async fn activate(&self) {
        let mut state = self.state.lock().await;
        if *state == SessionState::Connecting {
            *state = SessionState::Active;
        }
    }

    /// Send a request and suspend until the matching response arrives.
    ///
    /// Fails with [`OutpostError::SessionClosed`] if the session closes
    /// first, and [`OutpostError::Timeout`] on expiry; the waiter is removed
    /// in both cases so it can never hang. The request is not retracted from
    /// the far side on timeout (at-most-once, no cancellation propagation).
    pub async fn call(
        &self,
        request: RequestEnvelope,
        timeout: Duration,
    ) -> OutpostResult<ResponseEnvelope> {
        if !self.is_active().await {
            return Err(OutpostError::SessionClosed);
        }

        let id = request.id;
        let rx = {
            let mut pending = self.pending.lock().await;
            // A response may have arrived before we got here; take it
            // instead of registering a waiter that would never fire.
            if let Some(early) = pending.orphaned.remove(&id) {
                return Ok(early);
            }
            let (tx, rx) = oneshot::channel();
            pending.waiters.insert(id, tx);
            rx
        };

        if let Err(e) = self
            .send_message(&ServerMessage::Request { envelope: request })
            .await
        {
            self.pending.lock().await.waiters.remove(&id);
            return Err(e);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(response)) => Ok(response),
            // Sender dropped: the close path drained the waiter map.
            Ok(Err(_)) => Err(OutpostError::SessionClosed),
            Err(_) => {
                self.pending.lock().await.waiters.remove(&id);
                Err(OutpostError::Timeout)
            }
        }
    }

    /// Fire-and-forget send of a control message.
    pub async fn push(&self, message: &ServerMessage) -> OutpostResult<()> {
        if !self.is_active().await {
            return Err(OutpostError::SessionClosed);
        }
        self.send_message(message).await
    }

    /// Hand an inbound response to its pending call, or buffer it for a
    /// call that has not registered yet.
    pub async fn resolve_response(&self, response: ResponseEnvelope) {
        let mut pending = self.pending.lock().await;
        match pending.waiters.remove(&response.id) {
            Some(waiter) => {
                // The caller may have timed out in the meantime.
                let _ = waiter.send(response);
            }
            None => {
                if pending.orphaned.len() >= MAX_ORPHANED_RESPONSES {
                    warn!(
                        session_id = %self.id,
                        response_id = %response.id,
                        "orphaned response buffer full, dropping response"
                    );
                    return;
                }
                debug!(
                    session_id = %self.id,
                    response_id = %response.id,
                    "buffering response with no pending call"
                );
                pending.orphaned.insert(response.id, response);
            }
        }
    }

    /// Transition to `Closed`, failing every pending call.
    ///
    /// Returns `true` only for the first invocation; callers use that to
    /// notify the registry exactly once even when close is detected via
    /// multiple paths.
    pub async fn close(&self) -> bool {
        {
            let mut state = self.state.lock().await;
            if matches!(*state, SessionState::Closing | SessionState::Closed) {
                return false;
            }
            *state = SessionState::Closing;
        }

        let waiters = {
            let mut pending = self.pending.lock().await;
            pending.orphaned.clear();
            std::mem::take(&mut pending.waiters)
        };
        // Dropping the senders wakes every pending call with SessionClosed.
        drop(waiters);

        self.bound_hosts.lock().await.clear();
        *self.state.lock().await = SessionState::Closed;
        debug!(session_id = %self.id, "session closed");
        true
    }

    /// Record a host this session now serves. Read-loop only.
    pub async fn note_bound(&self, host: &str) {
        self.bound_hosts.lock().await.insert(host.to_string());
    }

    /// Forget a host this session served. Read-loop only.
    pub async fn note_unbound(&self, host: &str) {
        self.bound_hosts.lock().await.remove(host);
    }

    /// Snapshot of the hosts bound by this session.
    pub async fn bound_hosts(&self) -> Vec<String> {
        self.bound_hosts.lock().await.iter().cloned().collect()
    }

    async fn send_message(&self, message: &ServerMessage) -> OutpostResult<()> {
        let frames = encode_chunked(message, self.max_chunk_size)?;
        for frame in frames {
            self.outbound
                .send(Message::Binary(frame.into()))
                .await
                .map_err(|_| OutpostError::SessionClosed)?;
        }
        Ok(())
    }
}

/// Random session id (16 bytes, hex-encoded).
fn generate_session_id() -> String {
    use rand::Rng;
    let mut rng = rand::thread_rng();
    let bytes: Vec<u8> = (0..16).map(|_| rng.gen()).collect();
    hex::encode(bytes)
}
