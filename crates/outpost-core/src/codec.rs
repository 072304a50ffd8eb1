//! CBOR message codec layered over chunked framing.

use crate::error::OutpostResult;
use crate::frame::fragment;
use std::io::Cursor;
use uuid::Uuid;

/// Serialize a value to CBOR and split it into wire frames under a fresh
/// message id. A small message yields exactly one frame.
pub fn encode_chunked<T: serde::Serialize>(
    value: &T,
    max_chunk_size: usize,
) -> OutpostResult<Vec<Vec<u8>>> {
    let mut payload = Vec::new();
    ciborium::into_writer(value, &mut payload)?;
    fragment(Uuid::new_v4(), &payload, max_chunk_size)
}

/// Decode a reassembled CBOR payload into a typed value.
pub fn cbor_decode<T: serde::de::DeserializeOwned>(data: &[u8]) -> OutpostResult<T> {
    let value: T = ciborium::from_reader(Cursor::new(data))?;
    Ok(value)
}
