//! Chunked framing for tunnel messages.
//!
//! Wire format (big-endian):
//!
//! - frame 0: `[16-byte message id][u16 chunk index = 0][u16 chunk count][payload]`
//! - frames 1..n-1: `[16-byte message id][u16 chunk index][payload]`
//!
//! A message that fits in one frame is still sent with the full frame-0
//! header (`count = 1`). Completion is judged purely by having collected
//! `count` distinct indices, in any arrival order; reassembly concatenates
//! payloads in index order.

use crate::error::{OutpostError, OutpostResult};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Header size of frame 0 (message id + index + count).
pub const FIRST_HEADER_LEN: usize = 20;
/// Header size of continuation frames (message id + index).
pub const CONT_HEADER_LEN: usize = 18;

/// Default upper bound for one transport frame, header included.
pub const DEFAULT_MAX_CHUNK_SIZE: usize = 256 * 1024;

/// Hard cap on a single received frame (consistent with the WS transport limit).
pub const MAX_FRAME_SIZE: usize = 1_048_576;

/// How long a partial assembly may sit before it is evicted.
pub const DEFAULT_ASSEMBLY_TIMEOUT: Duration = Duration::from_secs(30);

/// One parsed transport frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub message_id: Uuid,
    pub index: u16,
    /// Present exactly when `index == 0`.
    pub count: Option<u16>,
    pub payload: Vec<u8>,
}

impl Chunk {
    /// Parse one wire frame. Continuation headers are 2 bytes shorter, so
    /// the count field exists exactly when the index is 0.
    pub fn parse(frame: &[u8]) -> OutpostResult<Chunk> {
        if frame.len() < CONT_HEADER_LEN {
            return Err(OutpostError::Protocol(format!(
                "frame too short: {} bytes",
                frame.len()
            )));
        }
        let message_id = Uuid::from_slice(&frame[..16])
            .map_err(|e| OutpostError::Protocol(format!("bad message id: {e}")))?;
        let index = u16::from_be_bytes([frame[16], frame[17]]);

        if index == 0 {
            if frame.len() < FIRST_HEADER_LEN {
                return Err(OutpostError::Protocol(
                    "first frame missing chunk count".into(),
                ));
            }
            let count = u16::from_be_bytes([frame[18], frame[19]]);
            if count == 0 {
                return Err(OutpostError::Protocol("zero chunk count".into()));
            }
            Ok(Chunk {
                message_id,
                index,
                count: Some(count),
                payload: frame[FIRST_HEADER_LEN..].to_vec(),
            })
        } else {
            Ok(Chunk {
                message_id,
                index,
                count: None,
                payload: frame[CONT_HEADER_LEN..].to_vec(),
            })
        }
    }
}

/// Split a serialized message into wire frames of at most `max_chunk_size`
/// bytes each, header included.
pub fn fragment(
    message_id: Uuid,
    payload: &[u8],
    max_chunk_size: usize,
) -> OutpostResult<Vec<Vec<u8>>> {
    let first_cap = max_chunk_size
        .checked_sub(FIRST_HEADER_LEN)
        .filter(|c| *c > 0)
        .ok_or_else(|| {
            OutpostError::Codec(format!(
                "max chunk size {max_chunk_size} leaves no room for payload"
            ))
        })?;
    let cont_cap = max_chunk_size - CONT_HEADER_LEN;

    if payload.len() <= first_cap {
        return Ok(vec![build_first(message_id, 1, payload)]);
    }

    let rest = payload.len() - first_cap;
    let count = 1 + rest.div_ceil(cont_cap);
    if count > u16::MAX as usize {
        return Err(OutpostError::Codec(format!(
            "message of {} bytes needs {count} chunks, exceeding the u16 index space",
            payload.len()
        )));
    }

    let mut frames = Vec::with_capacity(count);
    frames.push(build_first(message_id, count as u16, &payload[..first_cap]));
    for (i, part) in payload[first_cap..].chunks(cont_cap).enumerate() {
        frames.push(build_cont(message_id, (i + 1) as u16, part));
    }
    Ok(frames)
}

fn build_first(message_id: Uuid, count: u16, payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(FIRST_HEADER_LEN + payload.len());
    frame.extend_from_slice(message_id.as_bytes());
    frame.extend_from_slice(&0u16.to_be_bytes());
    frame.extend_from_slice(&count.to_be_bytes());
    frame.extend_from_slice(payload);
    frame
}

fn build_cont(message_id: Uuid, index: u16, payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(CONT_HEADER_LEN + payload.len());
    frame.extend_from_slice(message_id.as_bytes());
    frame.extend_from_slice(&index.to_be_bytes());
    frame.extend_from_slice(payload);
    frame
}

/// A partially reassembled message.
#[derive(Debug)]
struct Assembly {
    count: Option<u16>,
    parts: HashMap<u16, Vec<u8>>,
    started: Instant,
}

/// Reassembles chunked frames into complete message payloads.
///
/// Purely data-driven: nothing here suspends. Partial assemblies older than
/// `max_age` are evicted on the next frame arrival so abandoned transfers
/// cannot grow memory without bound.
#[derive(Debug)]
pub struct ChunkAssembler {
    assemblies: HashMap<Uuid, Assembly>,
    max_age: Duration,
}

impl Default for ChunkAssembler {
    fn default() -> Self {
        Self::new(DEFAULT_ASSEMBLY_TIMEOUT)
    }
}

impl ChunkAssembler {
    pub fn new(max_age: Duration) -> Self {
        Self {
            assemblies: HashMap::new(),
            max_age,
        }
    }

    /// Feed one parsed chunk. Returns the reassembled payload once all
    /// `count` distinct indices for its message id have arrived.
    ///
    /// A chunk whose index is outside `0..count` is a protocol violation;
    /// the frame is dropped and the assembly left as it was.
    pub fn feed(&mut self, chunk: Chunk) -> OutpostResult<Option<Vec<u8>>> {
        self.evict_stale();

        let known_count = chunk.count.or_else(|| {
            self.assemblies
                .get(&chunk.message_id)
                .and_then(|a| a.count)
        });
        if let Some(count) = known_count {
            if chunk.index >= count {
                return Err(OutpostError::Protocol(format!(
                    "chunk index {} out of range for count {count}",
                    chunk.index
                )));
            }
        }

        let assembly = self
            .assemblies
            .entry(chunk.message_id)
            .or_insert_with(|| Assembly {
                count: None,
                parts: HashMap::new(),
                started: Instant::now(),
            });

        if let Some(count) = chunk.count {
            assembly.count = Some(count);
            // Frames buffered before frame 0 arrived may now be out of range.
            let before = assembly.parts.len();
            assembly.parts.retain(|&index, _| index < count);
            if assembly.parts.len() < before {
                tracing::debug!(
                    message_id = %chunk.message_id,
                    dropped = before - assembly.parts.len(),
                    "dropped buffered chunks outside the announced count"
                );
            }
        }

        assembly.parts.entry(chunk.index).or_insert(chunk.payload);

        let complete =
            matches!(assembly.count, Some(count) if assembly.parts.len() == count as usize);
        if !complete {
            return Ok(None);
        }

        let Some(mut assembly) = self.assemblies.remove(&chunk.message_id) else {
            return Ok(None);
        };
        let count = assembly.count.unwrap_or(0);
        let total: usize = assembly.parts.values().map(Vec::len).sum();
        let mut message = Vec::with_capacity(total);
        for index in 0..count {
            if let Some(part) = assembly.parts.remove(&index) {
                message.extend_from_slice(&part);
            }
        }
        Ok(Some(message))
    }

    /// Number of partial assemblies currently buffered.
    pub fn pending(&self) -> usize {
        self.assemblies.len()
    }

    fn evict_stale(&mut self) {
        let max_age = self.max_age;
        let before = self.assemblies.len();
        self.assemblies
            .retain(|_, assembly| assembly.started.elapsed() <= max_age);
        let evicted = before - self.assemblies.len();
        if evicted > 0 {
            tracing::debug!(evicted, "evicted stale chunk assemblies");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::seq::SliceRandom;

    const MAX: usize = 64;

    fn payload_of(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    fn reassemble(frames: &[Vec<u8>]) -> Option<Vec<u8>> {
        let mut assembler = ChunkAssembler::default();
        let mut out = None;
        for frame in frames {
            let chunk = Chunk::parse(frame).unwrap();
            if let Some(message) = assembler.feed(chunk).unwrap() {
                out = Some(message);
            }
        }
        out
    }

    #[test]
    fn round_trip_all_sizes() {
        for len in 0..=10 * MAX {
            let payload = payload_of(len);
            let frames = fragment(Uuid::new_v4(), &payload, MAX).unwrap();
            for frame in &frames {
                assert!(frame.len() <= MAX);
            }
            assert_eq!(reassemble(&frames).unwrap(), payload);
        }
    }

    #[test]
    fn round_trip_shuffled_arrival() {
        let mut rng = rand::thread_rng();
        for len in [0, 1, MAX, 3 * MAX, 10 * MAX] {
            let payload = payload_of(len);
            let mut frames = fragment(Uuid::new_v4(), &payload, MAX).unwrap();
            for _ in 0..10 {
                frames.shuffle(&mut rng);
                assert_eq!(reassemble(&frames).unwrap(), payload);
            }
        }
    }

    #[test]
    fn single_frame_when_it_fits() {
        let payload = payload_of(MAX - FIRST_HEADER_LEN);
        let frames = fragment(Uuid::new_v4(), &payload, MAX).unwrap();
        assert_eq!(frames.len(), 1);

        let chunk = Chunk::parse(&frames[0]).unwrap();
        assert_eq!(chunk.index, 0);
        assert_eq!(chunk.count, Some(1));
        assert_eq!(chunk.payload, payload);
    }

    #[test]
    fn continuation_header_is_shorter() {
        let frames = fragment(Uuid::new_v4(), &payload_of(3 * MAX), MAX).unwrap();
        assert!(frames.len() > 2);

        let first = Chunk::parse(&frames[0]).unwrap();
        assert!(first.count.is_some());
        let cont = Chunk::parse(&frames[1]).unwrap();
        assert_eq!(cont.count, None);
        // Continuation frames fit 2 more payload bytes under the same cap.
        assert_eq!(cont.payload.len(), MAX - CONT_HEADER_LEN);
    }

    #[test]
    fn interleaved_messages_assemble_independently() {
        let payload_a = payload_of(4 * MAX);
        let payload_b = payload_of(5 * MAX + 7);
        let frames_a = fragment(Uuid::new_v4(), &payload_a, MAX).unwrap();
        let frames_b = fragment(Uuid::new_v4(), &payload_b, MAX).unwrap();

        let mut assembler = ChunkAssembler::default();
        let mut done = Vec::new();
        for pair in frames_a.iter().zip(frames_b.iter()) {
            for frame in [pair.0, pair.1] {
                if let Some(msg) = assembler.feed(Chunk::parse(frame).unwrap()).unwrap() {
                    done.push(msg);
                }
            }
        }
        for frame in frames_b.iter().skip(frames_a.len()) {
            if let Some(msg) = assembler.feed(Chunk::parse(frame).unwrap()).unwrap() {
                done.push(msg);
            }
        }

        assert_eq!(done, vec![payload_a, payload_b]);
    }

    #[test]
    fn out_of_range_index_is_rejected() {
        let id = Uuid::new_v4();
        let mut assembler = ChunkAssembler::default();
        let frames = fragment(id, &payload_of(2 * MAX), MAX).unwrap();
        assembler.feed(Chunk::parse(&frames[0]).unwrap()).unwrap();

        let bogus = Chunk {
            message_id: id,
            index: 99,
            count: None,
            payload: vec![1, 2, 3],
        };
        assert!(matches!(
            assembler.feed(bogus),
            Err(OutpostError::Protocol(_))
        ));
        // The assembly itself survives the bad frame.
        assert_eq!(assembler.pending(), 1);
    }

    #[test]
    fn duplicate_index_is_ignored() {
        let payload = payload_of(3 * MAX);
        let frames = fragment(Uuid::new_v4(), &payload, MAX).unwrap();

        let mut assembler = ChunkAssembler::default();
        let mut out = None;
        for frame in frames.iter().chain(frames.iter().take(1)) {
            if let Some(msg) = assembler.feed(Chunk::parse(frame).unwrap()).unwrap() {
                out = Some(msg);
            }
        }
        assert_eq!(out.unwrap(), payload);
    }

    #[test]
    fn stale_assembly_is_evicted() {
        let mut assembler = ChunkAssembler::new(Duration::from_millis(10));
        let frames = fragment(Uuid::new_v4(), &payload_of(3 * MAX), MAX).unwrap();
        assembler.feed(Chunk::parse(&frames[0]).unwrap()).unwrap();
        assert_eq!(assembler.pending(), 1);

        std::thread::sleep(Duration::from_millis(20));
        // Any later frame triggers the sweep.
        let other = fragment(Uuid::new_v4(), b"x", MAX).unwrap();
        assembler.feed(Chunk::parse(&other[0]).unwrap()).unwrap();
        assert_eq!(assembler.pending(), 0);
    }

    #[test]
    fn zero_count_and_short_frames_are_rejected() {
        assert!(Chunk::parse(&[0u8; 4]).is_err());

        let id = Uuid::new_v4();
        let mut frame = Vec::new();
        frame.extend_from_slice(id.as_bytes());
        frame.extend_from_slice(&0u16.to_be_bytes());
        frame.extend_from_slice(&0u16.to_be_bytes());
        assert!(Chunk::parse(&frame).is_err());
    }

    #[test]
    fn oversized_message_is_an_encode_error() {
        // Would need more than u16::MAX chunks at a tiny chunk size.
        let payload = payload_of((u16::MAX as usize + 2) * (MAX - CONT_HEADER_LEN));
        assert!(matches!(
            fragment(Uuid::new_v4(), &payload, MAX),
            Err(OutpostError::Codec(_))
        ));
    }
}
