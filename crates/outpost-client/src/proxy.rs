//! Client-side proxy.
//!
//! Owns the outbound tunnel session: announces the configured host
//! bindings, receives requests the relay pushed down, forwards each to the
//! matching local port, and pushes the wrapped response back. A response is
//! a push, never a call — the client does not wait for delivery acks.

use crate::config::ClientConfig;
use futures_util::{SinkExt, Stream, StreamExt};
use outpost_core::{
    cbor_decode, encode_chunked, Chunk, ChunkAssembler, ClientMessage, ErrorKind, OutpostError,
    OutpostResult, RequestEnvelope, ResponseEnvelope, ServerMessage, StatusLine, MAX_FRAME_SIZE,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

/// How long a partial chunk assembly may sit before eviction.
const ASSEMBLY_TIMEOUT: Duration = Duration::from_secs(30);

/// The client-side proxy: one outbound session plus the binding table.
pub struct ClientProxy {
    config: ClientConfig,
    http: reqwest::Client,
}

impl ClientProxy {
    pub fn new(config: ClientConfig) -> Self {
        Self {
            config,
            http: reqwest::Client::new(),
        }
    }

    /// Connect, announce every binding, and serve until the session ends.
    ///
    /// Returns `Ok(())` when the session ended on purpose (every binding
    /// was rejected or removed); a dropped connection is an error so the
    /// caller can decide to reconnect.
    pub async fn run(&self) -> OutpostResult<()> {
        if self.config.bindings.is_empty() {
            return Err(OutpostError::Config("no tunnels configured".into()));
        }

        let mut request = self
            .config
            .server_url
            .as_str()
            .into_client_request()
            .map_err(|e| OutpostError::Config(format!("bad server url: {e}")))?;
        if let Some(token) = &self.config.token {
            let value = format!("Bearer {token}")
                .parse()
                .map_err(|_| OutpostError::Config("token is not a valid header value".into()))?;
            request.headers_mut().insert("authorization", value);
        }

        let (ws_stream, _response) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(|e| OutpostError::Transport(format!("connect failed: {e}")))?;
        info!(server = %self.config.server_url, "tunnel session connected");

        let (mut ws_sink, mut ws_read) = ws_stream.split();
        let (outbound_tx, mut outbound_rx) = mpsc::channel::<Message>(64);

        // Writer: drain the outbound queue into the socket and keep the
        // session alive with pings. Ends, closing the socket, once every
        // sender is gone — which also covers this task being aborted.
        let ping_interval = self.config.ping_interval;
        let writer = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(ping_interval);
            ticker.tick().await; // skip the immediate first tick
            loop {
                tokio::select! {
                    maybe = outbound_rx.recv() => match maybe {
                        Some(message) => {
                            if ws_sink.send(message).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    },
                    _ = ticker.tick() => {
                        if ws_sink.send(Message::Ping(Vec::new().into())).await.is_err() {
                            break;
                        }
                    }
                }
            }
            let _ = ws_sink.close().await;
        });

        let bindings: Arc<Mutex<HashMap<String, u16>>> = Arc::new(Mutex::new(
            self.config
                .bindings
                .iter()
                .map(|b| (b.host.clone(), b.local_port))
                .collect(),
        ));

        let mut result = Ok(());
        for binding in &self.config.bindings {
            info!(host = %binding.host, local_port = binding.local_port, "announcing tunnel");
            if let Err(e) = send_message(
                &outbound_tx,
                &ClientMessage::AddTunnel {
                    host: binding.host.clone(),
                },
                self.config.max_chunk_size,
            )
            .await
            {
                result = Err(e);
                break;
            }
        }

        if result.is_ok() {
            result = self.read_loop(&mut ws_read, &outbound_tx, &bindings).await;
        }

        // Let the writer flush queued frames (a Close among them on the
        // orderly path) before giving up on it.
        drop(outbound_tx);
        let _ = tokio::time::timeout(Duration::from_secs(2), writer).await;
        result
    }

    async fn read_loop(
        &self,
        ws_read: &mut (impl Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>>
              + Unpin),
        outbound: &mpsc::Sender<Message>,
        bindings: &Arc<Mutex<HashMap<String, u16>>>,
    ) -> OutpostResult<()> {
        let mut assembler = ChunkAssembler::new(ASSEMBLY_TIMEOUT);

        while let Some(message) = ws_read.next().await {
            match message {
                Ok(Message::Binary(data)) => {
                    if data.len() > MAX_FRAME_SIZE {
                        warn!(len = data.len(), "dropping oversized frame");
                        continue;
                    }
                    let chunk = match Chunk::parse(&data) {
                        Ok(chunk) => chunk,
                        Err(e) => {
                            warn!(error = %e, "dropping malformed frame");
                            continue;
                        }
                    };
                    let payload = match assembler.feed(chunk) {
                        Ok(Some(payload)) => payload,
                        Ok(None) => continue,
                        Err(e) => {
                            warn!(error = %e, "dropping invalid chunk");
                            continue;
                        }
                    };
                    let decoded = match cbor_decode::<ServerMessage>(&payload) {
                        Ok(decoded) => decoded,
                        Err(e) => {
                            warn!(error = %e, "dropping undecodable message");
                            continue;
                        }
                    };
                    match decoded {
                        ServerMessage::Request { envelope } => {
                            let http = self.http.clone();
                            let outbound = outbound.clone();
                            let bindings = bindings.clone();
                            let max_chunk_size = self.config.max_chunk_size;
                            tokio::spawn(async move {
                                handle_request(http, bindings, outbound, envelope, max_chunk_size)
                                    .await;
                            });
                        }
                        ServerMessage::Error {
                            kind: ErrorKind::AlreadyBound,
                            host,
                        } => {
                            warn!(host, "relay rejected binding: host already bound");
                            let mut bindings = bindings.lock().await;
                            bindings.remove(&host);
                            if bindings.is_empty() {
                                info!("no bindings remain, closing session");
                                let _ = outbound.send(Message::Close(None)).await;
                                return Ok(());
                            }
                        }
                    }
                }
                Ok(Message::Ping(payload)) => {
                    let _ = outbound.send(Message::Pong(payload)).await;
                }
                Ok(Message::Close(_)) => {
                    return Err(OutpostError::Transport("session closed by relay".into()));
                }
                Ok(_) => continue,
                Err(e) => {
                    return Err(OutpostError::Transport(format!("tunnel read error: {e}")));
                }
            }
        }
        Err(OutpostError::Transport("tunnel connection lost".into()))
    }
}

/// Serve one pushed request: look up the local port for its host, forward,
/// and push the response back under the original request id.
async fn handle_request(
    http: reqwest::Client,
    bindings: Arc<Mutex<HashMap<String, u16>>>,
    outbound: mpsc::Sender<Message>,
    envelope: RequestEnvelope,
    max_chunk_size: usize,
) {
    let local_port = bindings.lock().await.get(&envelope.host).copied();

    let response = match local_port {
        // The relay should never route a host we did not bind; answer with
        // a synthetic error instead of tearing anything down.
        None => {
            warn!(host = %envelope.host, "request for host with no local binding");
            ResponseEnvelope::synthetic(
                envelope.id,
                502,
                "Bad Gateway",
                "no local binding for host",
            )
        }
        Some(port) => match forward_local(&http, port, &envelope).await {
            Ok(response) => response,
            Err(e) => {
                warn!(host = %envelope.host, local_port = port, error = %e, "local forward failed");
                ResponseEnvelope::synthetic(
                    envelope.id,
                    502,
                    "Bad Gateway",
                    &format!("local forward failed: {e}"),
                )
            }
        },
    };

    let message = ClientMessage::Response { envelope: response };
    if let Err(e) = send_message(&outbound, &message, max_chunk_size).await {
        debug!(error = %e, "could not push response, session gone");
    }
}

/// Forward a request envelope to the local service and wrap its answer.
async fn forward_local(
    http: &reqwest::Client,
    local_port: u16,
    request: &RequestEnvelope,
) -> OutpostResult<ResponseEnvelope> {
    let path = if request.path.is_empty() {
        "/"
    } else {
        request.path.as_str()
    };
    let url = format!("http://127.0.0.1:{local_port}{path}");
    let method = reqwest::Method::from_bytes(request.method.as_bytes())
        .map_err(|_| OutpostError::Protocol(format!("bad method {:?}", request.method)))?;

    let mut builder = http.request(method, &url);
    for (name, values) in &request.headers {
        if skip_forward_header(name) {
            continue;
        }
        for value in values {
            builder = builder.header(name.as_str(), value.as_str());
        }
    }
    if let Some(body) = &request.body {
        builder = builder.body(body.clone());
    }

    let response = builder
        .send()
        .await
        .map_err(|e| OutpostError::Transport(format!("local request failed: {e}")))?;

    let status = StatusLine {
        code: response.status().as_u16(),
        reason: response
            .status()
            .canonical_reason()
            .unwrap_or_default()
            .to_string(),
    };
    let mut headers = Vec::new();
    for name in response.headers().keys() {
        let values: Vec<String> = response
            .headers()
            .get_all(name)
            .iter()
            .filter_map(|v| v.to_str().ok().map(str::to_string))
            .collect();
        headers.push((name.as_str().to_string(), values));
    }
    let body = response
        .bytes()
        .await
        .map_err(|e| OutpostError::Transport(format!("local response body failed: {e}")))?;

    Ok(ResponseEnvelope {
        id: request.id,
        status,
        headers,
        body: if body.is_empty() {
            None
        } else {
            Some(body.to_vec())
        },
    })
}

/// Headers the local forward must not carry through: reqwest derives them
/// from the URL and body it sends.
fn skip_forward_header(name: &str) -> bool {
    matches!(
        name.to_ascii_lowercase().as_str(),
        "host" | "content-length" | "transfer-encoding" | "connection"
    )
}

async fn send_message(
    outbound: &mpsc::Sender<Message>,
    message: &ClientMessage,
    max_chunk_size: usize,
) -> OutpostResult<()> {
    for frame in encode_chunked(message, max_chunk_size)? {
        outbound
            .send(Message::Binary(frame.into()))
            .await
            .map_err(|_| OutpostError::SessionClosed)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn request(host: &str) -> RequestEnvelope {
        RequestEnvelope {
            id: Uuid::new_v4(),
            host: host.to_string(),
            path: "/ping".into(),
            method: "GET".into(),
            headers: Vec::new(),
            body: None,
        }
    }

    async fn pushed_response(outbound: &mut mpsc::Receiver<Message>) -> ResponseEnvelope {
        let frame = match outbound.recv().await.unwrap() {
            Message::Binary(data) => data,
            other => panic!("unexpected outbound message: {other:?}"),
        };
        let mut assembler = ChunkAssembler::default();
        let payload = assembler
            .feed(Chunk::parse(&frame).unwrap())
            .unwrap()
            .unwrap();
        match cbor_decode::<ClientMessage>(&payload).unwrap() {
            ClientMessage::Response { envelope } => envelope,
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[tokio::test]
    async fn unknown_host_yields_synthetic_error_response() {
        let (tx, mut rx) = mpsc::channel(8);
        let envelope = request("never-bound.example.com");
        let id = envelope.id;

        handle_request(
            reqwest::Client::new(),
            Arc::new(Mutex::new(HashMap::new())),
            tx,
            envelope,
            outpost_core::DEFAULT_MAX_CHUNK_SIZE,
        )
        .await;

        let response = pushed_response(&mut rx).await;
        assert_eq!(response.id, id);
        assert_eq!(response.status.code, 502);
    }

    #[tokio::test]
    async fn unreachable_local_service_yields_synthetic_error_response() {
        let (tx, mut rx) = mpsc::channel(8);
        let envelope = request("a.example.com");
        let id = envelope.id;

        let mut bindings = HashMap::new();
        // Reserved port with nothing listening.
        bindings.insert("a.example.com".to_string(), 1u16);

        handle_request(
            reqwest::Client::new(),
            Arc::new(Mutex::new(bindings)),
            tx,
            envelope,
            outpost_core::DEFAULT_MAX_CHUNK_SIZE,
        )
        .await;

        let response = pushed_response(&mut rx).await;
        assert_eq!(response.id, id);
        assert_eq!(response.status.code, 502);
    }

    #[test]
    fn forward_skips_derived_headers() {
        assert!(skip_forward_header("Host"));
        assert!(skip_forward_header("content-length"));
        assert!(!skip_forward_header("x-custom"));
    }
}
