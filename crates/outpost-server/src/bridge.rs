//! HTTP-to-tunnel routing bridge.
//!
//! An axum middleware resolves each request's Host header (port stripped)
//! against the tunnel registry and bridges matching requests onto the
//! owning session's call path. Requests for the relay's own advertised
//! host fall through to the local routes (health, ACME challenge).
//!
//! An unknown host or a failed tunnel call is a `502 Bad Gateway`, never a
//! fault that escapes the bridge.

use crate::certs::CertificateProvider;
use crate::config::normalize_host;
use crate::registry::TunnelRegistry;
use axum::{
    body::Body,
    extract::{Path, Request, State},
    http::{header, HeaderMap, HeaderName, HeaderValue, Response, StatusCode},
    middleware::{self, Next},
    routing::get,
    Router,
};
use outpost_core::{OutpostResult, RequestEnvelope, ResponseEnvelope};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

/// Shared state for the public HTTP surface.
pub struct BridgeState {
    pub registry: Arc<TunnelRegistry>,
    pub certs: Arc<dyn CertificateProvider>,
    /// The relay's own hostname; requests for it are served locally.
    pub advertised_host: String,
    pub call_timeout: Duration,
    pub max_body_bytes: usize,
}

/// Build the public router: local routes behind the tunnel middleware.
pub fn router(state: Arc<BridgeState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/.well-known/acme-challenge/:token", get(acme_challenge))
        .fallback(local_not_found)
        .layer(middleware::from_fn_with_state(state.clone(), route_by_host))
        .with_state(state)
}

/// The bridging middleware: own host passes through, everything else is
/// routed via the registry.
async fn route_by_host(
    State(state): State<Arc<BridgeState>>,
    request: Request,
    next: Next,
) -> Response<Body> {
    let Some(host) = request_host(&request) else {
        return gateway_error("missing_host", "request carries no Host header");
    };

    if host == state.advertised_host {
        return next.run(request).await;
    }

    let Some(session) = state.registry.resolve(&host).await else {
        debug!(host, "no tunnel for host");
        return gateway_error("no_tunnel", &format!("no tunnel bound for {host}"));
    };

    match bridge_request(&state, &host, request, &session).await {
        Ok(response) => response,
        Err(e) => {
            warn!(host, session_id = %session.id(), error = %e, "tunnel call failed");
            gateway_error("tunnel_failed", &format!("tunnel call failed: {e}"))
        }
    }
}

async fn bridge_request(
    state: &BridgeState,
    host: &str,
    request: Request,
    session: &Arc<crate::session::Session>,
) -> OutpostResult<Response<Body>> {
    let envelope = into_envelope(host, request, state.max_body_bytes).await?;
    let response = session.call(envelope, state.call_timeout).await?;
    Ok(into_http_response(response))
}

/// Capture an inbound HTTP request as a wire envelope.
async fn into_envelope(
    host: &str,
    request: Request,
    max_body_bytes: usize,
) -> OutpostResult<RequestEnvelope> {
    let (parts, body) = request.into_parts();
    let path = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());
    let headers = flatten_headers(&parts.headers);
    let body = axum::body::to_bytes(body, max_body_bytes)
        .await
        .map_err(|e| {
            outpost_core::OutpostError::Other(format!("failed to buffer request body: {e}"))
        })?;

    Ok(RequestEnvelope {
        id: Uuid::new_v4(),
        host: host.to_string(),
        path,
        method: parts.method.to_string(),
        headers,
        body: if body.is_empty() {
            None
        } else {
            Some(body.to_vec())
        },
    })
}

/// Translate a wire response back into an HTTP response.
fn into_http_response(envelope: ResponseEnvelope) -> Response<Body> {
    let status =
        StatusCode::from_u16(envelope.status.code).unwrap_or(StatusCode::BAD_GATEWAY);

    let mut response = Response::new(Body::from(envelope.body.unwrap_or_default()));
    *response.status_mut() = status;

    let headers = response.headers_mut();
    for (name, values) in &envelope.headers {
        if is_hop_by_hop(name) {
            continue;
        }
        let Ok(name) = HeaderName::try_from(name.as_str()) else {
            continue;
        };
        for value in values {
            if let Ok(value) = HeaderValue::try_from(value.as_str()) {
                headers.append(name.clone(), value);
            }
        }
    }
    response
}

/// Routing host: Host header first, URI authority as the HTTP/2 fallback,
/// port stripped and lowercased.
fn request_host(request: &Request) -> Option<String> {
    let raw = request
        .headers()
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .or_else(|| request.uri().host().map(str::to_string))?;
    Some(normalize_host(&raw))
}

/// Flatten an HTTP header map into the wire's ordered multimap form.
pub fn flatten_headers(headers: &HeaderMap) -> Vec<(String, Vec<String>)> {
    let mut out = Vec::new();
    for name in headers.keys() {
        let values: Vec<String> = headers
            .get_all(name)
            .iter()
            .filter_map(|v| v.to_str().ok().map(str::to_string))
            .collect();
        out.push((name.as_str().to_string(), values));
    }
    out
}

fn is_hop_by_hop(name: &str) -> bool {
    matches!(
        name.to_ascii_lowercase().as_str(),
        "connection" | "keep-alive" | "transfer-encoding" | "upgrade" | "proxy-connection"
    )
}

fn gateway_error(code: &str, message: &str) -> Response<Body> {
    let body = serde_json::json!({
        "error": { "code": code, "message": message }
    });
    let mut response = Response::new(Body::from(body.to_string()));
    *response.status_mut() = StatusCode::BAD_GATEWAY;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );
    response
}

async fn healthz() -> &'static str {
    "ok"
}

/// HTTP-01 challenge responder, answered by the certificate collaborator.
async fn acme_challenge(
    State(state): State<Arc<BridgeState>>,
    Path(token): Path<String>,
) -> Response<Body> {
    match state.certs.challenge_token(&token) {
        Some(proof) => Response::new(Body::from(proof)),
        None => {
            let mut response = Response::new(Body::from("no pending challenge"));
            *response.status_mut() = StatusCode::NOT_FOUND;
            response
        }
    }
}

async fn local_not_found() -> Response<Body> {
    let mut response = Response::new(Body::from("no such route"));
    *response.status_mut() = StatusCode::NOT_FOUND;
    response
}
