//! WebSocket listener for tunnel connections.
//!
//! Clients dial out to this listener; credentials ride the upgrade request
//! as an `Authorization: Bearer` header and are captured here for the
//! relay's authorizer to judge.

use outpost_core::{OutpostError, OutpostResult};
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::server::{
    Request as UpgradeRequest, Response as UpgradeResponse,
};
use tracing::{debug, error, info, warn};

/// A handle to an accepted tunnel connection.
pub struct TunnelConnection {
    pub ws_stream: tokio_tungstenite::WebSocketStream<TcpStream>,
    pub remote_addr: SocketAddr,
    /// Bearer token presented on the upgrade request, if any.
    pub credentials: Option<String>,
}

/// Start accepting tunnel connections on a pre-bound listener.
///
/// Returns a receiver that yields upgraded connections.
pub fn start_listener(listener: TcpListener) -> OutpostResult<mpsc::Receiver<TunnelConnection>> {
    let addr = listener
        .local_addr()
        .map_err(|e| OutpostError::Transport(format!("tunnel listener address: {e}")))?;
    info!(addr = %addr, "tunnel listener started");

    let (tx, rx) = mpsc::channel::<TunnelConnection>(64);

    tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((stream, remote_addr)) => {
                    let tx = tx.clone();
                    tokio::spawn(async move {
                        match upgrade(stream, remote_addr).await {
                            Ok(conn) => {
                                if tx.send(conn).await.is_err() {
                                    warn!("tunnel connection channel closed");
                                }
                            }
                            Err(e) => {
                                warn!(remote = %remote_addr, error = %e, "tunnel upgrade failed");
                            }
                        }
                    });
                }
                Err(e) => {
                    error!(error = %e, "TCP accept failed");
                }
            }
        }
    });

    Ok(rx)
}

async fn upgrade(stream: TcpStream, remote_addr: SocketAddr) -> OutpostResult<TunnelConnection> {
    let mut credentials = None;
    let callback = |request: &UpgradeRequest, response: UpgradeResponse| {
        credentials = request
            .headers()
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .map(str::to_string);
        Ok(response)
    };

    let ws_stream = tokio_tungstenite::accept_hdr_async(stream, callback)
        .await
        .map_err(|e| OutpostError::Transport(format!("WebSocket handshake failed: {e}")))?;

    debug!(remote = %remote_addr, "tunnel connection accepted");
    Ok(TunnelConnection {
        ws_stream,
        remote_addr,
        credentials,
    })
}
