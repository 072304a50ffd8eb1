//! outpost-core: shared protocol library for the outpost tunnel relay.
//!
//! Provides the wire message schema, CBOR codec, chunked framing with
//! out-of-order reassembly, and the shared error type.

pub mod codec;
pub mod error;
pub mod frame;
pub mod messages;

// Re-export commonly used items at crate root.
pub use codec::{cbor_decode, encode_chunked};
pub use error::{OutpostError, OutpostResult};
pub use frame::{Chunk, ChunkAssembler, DEFAULT_MAX_CHUNK_SIZE, MAX_FRAME_SIZE};
pub use messages::{
    ClientMessage, ErrorKind, RequestEnvelope, ResponseEnvelope, ServerMessage, StatusLine,
};
