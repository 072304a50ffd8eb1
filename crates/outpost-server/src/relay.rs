//! Relay assembly: listeners, per-connection session loops, lifecycle.
//!
//! The `Relay` owns the registry and the collaborator interfaces. `start`
//! binds the public HTTP listener (plain or TLS, depending on what the
//! certificate provider can supply) and the tunnel WebSocket listener, then
//! serves until the handle is shut down. A fault in one session never
//! reaches another session or the process.

use crate::auth::Authorizer;
use crate::bridge::{self, BridgeState};
use crate::certs::{tls_server_config, CertificateProvider};
use crate::config::{normalize_host, ServerConfig};
use crate::registry::{BindOutcome, TunnelRegistry};
use crate::session::Session;
use crate::transport::{self, TunnelConnection};
use axum::response::IntoResponse;
use axum::Router;
use futures_util::stream::SplitStream;
use futures_util::{SinkExt, StreamExt};
use outpost_core::{
    cbor_decode, Chunk, ChunkAssembler, ClientMessage, ErrorKind, OutpostError, OutpostResult,
    ServerMessage, MAX_FRAME_SIZE,
};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info, warn};

/// How often the registry backstop sweep runs.
const REGISTRY_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// The relay instance.
pub struct Relay {
    config: ServerConfig,
    registry: Arc<TunnelRegistry>,
    authorizer: Arc<dyn Authorizer>,
    certs: Arc<dyn CertificateProvider>,
}

/// A running relay: bound addresses plus the serving tasks.
pub struct RelayHandle {
    pub http_addr: SocketAddr,
    pub tunnel_addr: SocketAddr,
    pub registry: Arc<TunnelRegistry>,
    http_task: JoinHandle<OutpostResult<()>>,
    tunnel_task: JoinHandle<()>,
    sweep_task: JoinHandle<()>,
}

impl RelayHandle {
    /// Wait for a listener to fail. Serving normally never returns.
    pub async fn wait(&mut self) -> OutpostResult<()> {
        tokio::select! {
            result = &mut self.http_task => match result {
                Ok(r) => r,
                Err(e) => Err(OutpostError::Other(format!("HTTP listener task died: {e}"))),
            },
            result = &mut self.tunnel_task => match result {
                Ok(()) => Err(OutpostError::Transport("tunnel listener stopped".into())),
                Err(e) => Err(OutpostError::Other(format!("tunnel listener task died: {e}"))),
            },
        }
    }

    /// Stop serving. In-flight sessions are dropped.
    pub fn shutdown(&self) {
        self.http_task.abort();
        self.tunnel_task.abort();
        self.sweep_task.abort();
    }
}

impl Drop for RelayHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl Relay {
    pub fn new(
        config: ServerConfig,
        authorizer: Arc<dyn Authorizer>,
        certs: Arc<dyn CertificateProvider>,
    ) -> Self {
        Self {
            config,
            registry: Arc::new(TunnelRegistry::new()),
            authorizer,
            certs,
        }
    }

    /// Bind both listeners and start serving. Bind or TLS failures here are
    /// fatal startup errors for the caller to act on.
    pub async fn start(self) -> OutpostResult<RelayHandle> {
        let relay = Arc::new(self);

        let http_listener = TcpListener::bind(("0.0.0.0", relay.config.http_port))
            .await
            .map_err(|e| {
                OutpostError::Config(format!(
                    "cannot bind HTTP port {}: {e}",
                    relay.config.http_port
                ))
            })?;
        let tunnel_listener = TcpListener::bind(("0.0.0.0", relay.config.tunnel_port))
            .await
            .map_err(|e| {
                OutpostError::Config(format!(
                    "cannot bind tunnel port {}: {e}",
                    relay.config.tunnel_port
                ))
            })?;
        let http_addr = http_listener.local_addr()?;
        let tunnel_addr = tunnel_listener.local_addr()?;

        let state = Arc::new(BridgeState {
            registry: relay.registry.clone(),
            certs: relay.certs.clone(),
            advertised_host: relay.config.host.clone(),
            call_timeout: relay.config.call_timeout,
            max_body_bytes: relay.config.max_body_bytes,
        });
        let app = bridge::router(state);

        let http_task = match relay.certs.current_certificate_and_key() {
            Some((cert_pem, key_pem)) => {
                let tls = Arc::new(tls_server_config(&cert_pem, &key_pem)?);
                tokio::spawn(serve_tls(http_listener, app, tls))
            }
            None => tokio::spawn(async move {
                axum::serve(http_listener, app)
                    .await
                    .map_err(|e| OutpostError::Transport(format!("HTTP listener failed: {e}")))
            }),
        };

        let mut conn_rx = transport::start_listener(tunnel_listener)?;
        let tunnel_task = {
            let relay = relay.clone();
            tokio::spawn(async move {
                while let Some(conn) = conn_rx.recv().await {
                    let relay = relay.clone();
                    tokio::spawn(async move {
                        if let Err(e) = relay.handle_connection(conn).await {
                            warn!(error = %e, "tunnel connection error");
                        }
                    });
                }
            })
        };

        let sweep_task = {
            let registry = relay.registry.clone();
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(REGISTRY_SWEEP_INTERVAL);
                loop {
                    interval.tick().await;
                    registry.prune_closed().await;
                }
            })
        };

        info!(
            http_addr = %http_addr,
            tunnel_addr = %tunnel_addr,
            host = %relay.config.host,
            "outpost relay ready"
        );

        Ok(RelayHandle {
            http_addr,
            tunnel_addr,
            registry: relay.registry.clone(),
            http_task,
            tunnel_task,
            sweep_task,
        })
    }

    /// Drive one tunnel connection from upgrade to close.
    async fn handle_connection(&self, conn: TunnelConnection) -> OutpostResult<()> {
        let remote = conn.remote_addr;

        let Some(identity) = self.authorizer.authorize(conn.credentials.as_deref()) else {
            warn!(remote = %remote, "tunnel connection rejected: unauthorized");
            let mut ws_stream = conn.ws_stream;
            let _ = ws_stream
                .close(Some(CloseFrame {
                    code: CloseCode::Policy,
                    reason: "unauthorized".into(),
                }))
                .await;
            return Ok(());
        };

        let (mut ws_sink, mut ws_read) = conn.ws_stream.split();
        let (outbound_tx, mut outbound_rx) = mpsc::channel::<Message>(64);
        let session = Arc::new(Session::new(outbound_tx.clone(), self.config.max_chunk_size));
        session.activate().await;

        info!(
            remote = %remote,
            client = %identity.name,
            session_id = %session.id(),
            "tunnel session started"
        );

        // Writer: drain the session's outbound queue into the socket.
        let writer = tokio::spawn(async move {
            while let Some(message) = outbound_rx.recv().await {
                if ws_sink.send(message).await.is_err() {
                    break;
                }
            }
            let _ = ws_sink.close().await;
        });

        let result = self.read_loop(&session, &mut ws_read, &outbound_tx).await;

        // Both the explicit close and a read-loop error land here; the
        // session's close gate makes the registry notification fire once.
        if session.close().await {
            self.registry.on_session_closed(&session).await;
        }
        writer.abort();
        info!(session_id = %session.id(), "tunnel session ended");
        result
    }

    /// The session's read loop: reassemble frames, decode, dispatch.
    async fn read_loop(
        &self,
        session: &Arc<Session>,
        ws_read: &mut SplitStream<WebSocketStream<TcpStream>>,
        outbound: &mpsc::Sender<Message>,
    ) -> OutpostResult<()> {
        let mut assembler = ChunkAssembler::new(self.config.assembly_timeout);

        while let Some(message) = ws_read.next().await {
            match message {
                Ok(Message::Binary(data)) => {
                    if data.len() > MAX_FRAME_SIZE {
                        warn!(
                            session_id = %session.id(),
                            len = data.len(),
                            "dropping oversized frame"
                        );
                        continue;
                    }
                    let chunk = match Chunk::parse(&data) {
                        Ok(chunk) => chunk,
                        Err(e) => {
                            warn!(session_id = %session.id(), error = %e, "dropping malformed frame");
                            continue;
                        }
                    };
                    let payload = match assembler.feed(chunk) {
                        Ok(Some(payload)) => payload,
                        Ok(None) => continue,
                        Err(e) => {
                            warn!(session_id = %session.id(), error = %e, "dropping invalid chunk");
                            continue;
                        }
                    };
                    match cbor_decode::<ClientMessage>(&payload) {
                        Ok(decoded) => self.dispatch(session, decoded).await,
                        Err(e) => {
                            warn!(session_id = %session.id(), error = %e, "dropping undecodable message");
                        }
                    }
                }
                Ok(Message::Ping(payload)) => {
                    let _ = outbound.send(Message::Pong(payload)).await;
                }
                Ok(Message::Close(_)) => {
                    debug!(session_id = %session.id(), "client closed the tunnel");
                    break;
                }
                Ok(_) => continue,
                Err(e) => {
                    debug!(session_id = %session.id(), error = %e, "tunnel read error");
                    break;
                }
            }
        }
        Ok(())
    }

    /// Demultiplex one inbound message.
    async fn dispatch(&self, session: &Arc<Session>, message: ClientMessage) {
        match message {
            ClientMessage::Response { envelope } => {
                session.resolve_response(envelope).await;
            }
            ClientMessage::AddTunnel { host } => {
                let host = normalize_host(&host);
                match self.registry.bind(&host, session).await {
                    BindOutcome::Bound => {
                        session.note_bound(&host).await;
                    }
                    BindOutcome::Conflict { owner } => {
                        warn!(
                            host,
                            session_id = %session.id(),
                            owner,
                            "bind rejected, host already owned"
                        );
                        let _ = session
                            .push(&ServerMessage::Error {
                                kind: ErrorKind::AlreadyBound,
                                host,
                            })
                            .await;
                    }
                }
            }
            ClientMessage::RemoveTunnel { host } => {
                let host = normalize_host(&host);
                self.registry.unbind(&host, session).await;
                session.note_unbound(&host).await;
            }
        }
    }
}

/// Serve the public router over TLS, HTTP/1.1 and HTTP/2 via ALPN.
async fn serve_tls(
    listener: TcpListener,
    app: Router,
    tls_config: Arc<rustls::ServerConfig>,
) -> OutpostResult<()> {
    use hyper::service::service_fn;
    use hyper_util::rt::{TokioExecutor, TokioIo};
    use hyper_util::server::conn::auto::Builder as AutoBuilder;
    use tokio_rustls::TlsAcceptor;
    use tower::ServiceExt;

    let acceptor = TlsAcceptor::from(tls_config);

    loop {
        let (tcp_stream, remote_addr) = match listener.accept().await {
            Ok(conn) => conn,
            Err(e) => {
                warn!(error = %e, "TLS accept failed");
                continue;
            }
        };

        let acceptor = acceptor.clone();
        let app = app.clone();

        tokio::spawn(async move {
            let tls_stream = match acceptor.accept(tcp_stream).await {
                Ok(stream) => stream,
                Err(e) => {
                    debug!(remote = %remote_addr, error = %e, "TLS handshake failed");
                    return;
                }
            };

            let io = TokioIo::new(tls_stream);
            let service = service_fn(move |request: hyper::Request<hyper::body::Incoming>| {
                let app = app.clone();
                async move {
                    let request = request.map(axum::body::Body::new);
                    Ok::<_, Infallible>(app.oneshot(request).await.into_response())
                }
            });

            if let Err(e) = AutoBuilder::new(TokioExecutor::new())
                .serve_connection(io, service)
                .await
            {
                debug!(remote = %remote_addr, error = %e, "TLS connection error");
            }
        });
    }
}
