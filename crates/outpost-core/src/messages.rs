//! Wire message schema for the tunnel control channel.
//!
//! Messages are CBOR-encoded, internally tagged on `tag`, and carried inside
//! the chunked frames defined in [`crate::frame`]. Requests flow only
//! server→client; responses and tunnel control flow client→server.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// An HTTP status line carried across the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusLine {
    pub code: u16,
    pub reason: String,
}

/// An HTTP request captured at the public boundary and carried unchanged to
/// the owning client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestEnvelope {
    /// Correlation id; the sole link between a request and its response.
    pub id: Uuid,
    /// Routing host, port already stripped.
    pub host: String,
    /// Path plus query string.
    pub path: String,
    pub method: String,
    /// Ordered multimap; repeated header names keep their values grouped.
    pub headers: Vec<(String, Vec<String>)>,
    pub body: Option<Vec<u8>>,
}

/// The response to one [`RequestEnvelope`], correlated by `id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    pub id: Uuid,
    pub status: StatusLine,
    pub headers: Vec<(String, Vec<String>)>,
    pub body: Option<Vec<u8>>,
}

impl ResponseEnvelope {
    /// Build a relay-generated response (local forward failed, host not
    /// bound) for the given request id.
    pub fn synthetic(id: Uuid, code: u16, reason: &str, body: &str) -> Self {
        Self {
            id,
            status: StatusLine {
                code,
                reason: reason.to_string(),
            },
            headers: vec![(
                "content-type".to_string(),
                vec!["text/plain; charset=utf-8".to_string()],
            )],
            body: Some(body.as_bytes().to_vec()),
        }
    }
}

/// Messages the client sends to the relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "tag", rename_all = "camelCase")]
pub enum ClientMessage {
    Response { envelope: ResponseEnvelope },
    AddTunnel { host: String },
    RemoveTunnel { host: String },
}

/// Messages the relay sends to the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "tag", rename_all = "camelCase")]
pub enum ServerMessage {
    Request { envelope: RequestEnvelope },
    Error { kind: ErrorKind, host: String },
}

/// Out-of-band error kinds pushed to the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ErrorKind {
    AlreadyBound,
}
