// src/codec.rs
//
// Wire format: an ordered chain of [4-byte big-endian length][raw bytes]
// blocks, gzip-compressed as one unit. The first block of an envelope is the
// routing header; everything after it is the payload, opaque to the router.
// Chains can be extended at the front and split at the head without parsing
// anything behind the first length prefix.

use std::io::{Read, Write};

use bytes::{BufMut, Bytes, BytesMut};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::envelope::TaskEnvelope;
use crate::plan::{ExecutionPlan, PlanError};

const LEN_PREFIX: usize = 4;

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("chain is empty")]
    EmptyChain,
    #[error("chain truncated: block wants {needed} bytes, {have} remain")]
    Truncated { needed: usize, have: usize },
    #[error("corrupt compression stream")]
    Compression(#[source] std::io::Error),
    #[error("malformed routing header")]
    Header(#[from] serde_json::Error),
    #[error("routing header is inconsistent with its plan")]
    Plan(#[from] PlanError),
}

#[derive(Serialize)]
struct HeaderRef<'a> {
    task_id: Uuid,
    plan: &'a ExecutionPlan,
    current_node_id: u32,
}

#[derive(Deserialize)]
struct Header {
    task_id: Uuid,
    plan: ExecutionPlan,
    current_node_id: u32,
}

/// Frame `block` and place it ahead of `chain`, without re-parsing the tail.
/// An empty `chain` yields a single-block chain.
pub fn prepend(block: &[u8], chain: &[u8]) -> Bytes {
    let mut out = BytesMut::with_capacity(LEN_PREFIX + block.len() + chain.len());
    out.put_u32(block.len() as u32);
    out.put_slice(block);
    out.put_slice(chain);
    out.freeze()
}

/// Split the first block off a chain, returning (head, rest). Only the head's
/// length prefix is interpreted; the rest is returned verbatim.
pub fn split_head(chain: &[u8]) -> Result<(Bytes, Bytes), DecodeError> {
    if chain.is_empty() {
        return Err(DecodeError::EmptyChain);
    }
    if chain.len() < LEN_PREFIX {
        return Err(DecodeError::Truncated {
            needed: LEN_PREFIX,
            have: chain.len(),
        });
    }
    let len = u32::from_be_bytes([chain[0], chain[1], chain[2], chain[3]]) as usize;
    let rest = &chain[LEN_PREFIX..];
    if rest.len() < len {
        return Err(DecodeError::Truncated {
            needed: len,
            have: rest.len(),
        });
    }
    Ok((
        Bytes::copy_from_slice(&rest[..len]),
        Bytes::copy_from_slice(&rest[len..]),
    ))
}

/// Walk a whole chain into its blocks. Convenience over repeated
/// [`split_head`]; used for unpacking archives, not on the hot path.
pub fn split_all(chain: &[u8]) -> Result<Vec<Bytes>, DecodeError> {
    let mut blocks = Vec::new();
    let mut rest = Bytes::copy_from_slice(chain);
    while !rest.is_empty() {
        let (head, tail) = split_head(&rest)?;
        blocks.push(head);
        rest = tail;
    }
    Ok(blocks)
}

/// Compress a chain as one atomic unit. No streaming; message size is
/// bounded by available memory.
pub fn compress(raw: &[u8]) -> Vec<u8> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(raw).expect("gzip into a Vec cannot fail");
    encoder.finish().expect("gzip into a Vec cannot fail")
}

pub fn decompress(compressed: &[u8]) -> Result<Vec<u8>, DecodeError> {
    let mut raw = Vec::new();
    GzDecoder::new(compressed)
        .read_to_end(&mut raw)
        .map_err(DecodeError::Compression)?;
    Ok(raw)
}

/// Serialize an envelope into its wire form: header block prepended to the
/// opaque payload bytes, compressed as one unit.
pub fn encode(envelope: &TaskEnvelope) -> Vec<u8> {
    let header = HeaderRef {
        task_id: envelope.task_id(),
        plan: envelope.plan(),
        current_node_id: envelope.current_node_id(),
    };
    let header_block =
        serde_json::to_vec(&header).expect("routing header serialization cannot fail");
    compress(&prepend(&header_block, envelope.payload()))
}

/// Inverse of [`encode`]; round-trip exact.
pub fn decode(wire: &[u8]) -> Result<TaskEnvelope, DecodeError> {
    let chain = decompress(wire)?;
    let (header_block, payload) = split_head(&chain)?;
    let header: Header = serde_json::from_slice(&header_block)?;
    Ok(TaskEnvelope::from_parts(
        header.task_id,
        header.plan,
        header.current_node_id,
        payload.to_vec(),
    )?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::StageNode;

    fn sample_envelope() -> TaskEnvelope {
        let plan = ExecutionPlan::new(vec![
            StageNode::new(0, "track", vec![1, 2]),
            StageNode::new(1, "attr", vec![]),
            StageNode::new(2, "reid", vec![]),
        ])
        .unwrap();
        TaskEnvelope::new(plan, 0, b"video123".to_vec()).unwrap()
    }

    #[test]
    fn envelope_round_trip_is_exact() {
        let mut envelope = sample_envelope();
        envelope.mark_current_executed().unwrap();
        let decoded = decode(&encode(&envelope)).unwrap();
        assert_eq!(decoded, envelope);
    }

    #[test]
    fn split_then_recombine_reproduces_the_chain() {
        let chain = prepend(b"head", &prepend(b"tail-1", &prepend(b"tail-2", &[])));
        let (head, rest) = split_head(&chain).unwrap();
        assert_eq!(&head[..], b"head");
        assert_eq!(prepend(&head, &rest), chain);
    }

    #[test]
    fn prepend_then_split_returns_the_new_block() {
        let original = prepend(b"opaque block the stage does not understand", &[]);
        let chain = prepend(b"my result", &original);
        let (head, rest) = split_head(&chain).unwrap();
        assert_eq!(&head[..], b"my result");
        assert_eq!(rest, original);
    }

    #[test]
    fn split_all_walks_every_block() {
        let chain = prepend(b"a", &prepend(b"", &prepend(b"c", &[])));
        let blocks = split_all(&chain).unwrap();
        assert_eq!(blocks.len(), 3);
        assert_eq!(&blocks[0][..], b"a");
        assert!(blocks[1].is_empty());
        assert_eq!(&blocks[2][..], b"c");
    }

    #[test]
    fn truncated_chain_is_reported() {
        let chain = prepend(b"block", &[]);
        let cut = &chain[..chain.len() - 2];
        assert!(matches!(
            split_head(cut),
            Err(DecodeError::Truncated { needed: 5, have: 3 })
        ));
        assert!(matches!(split_head(&[]), Err(DecodeError::EmptyChain)));
    }

    #[test]
    fn compression_round_trip() {
        let raw = b"a chain compressed as one unit".repeat(100);
        let compressed = compress(&raw);
        assert!(compressed.len() < raw.len());
        assert_eq!(decompress(&compressed).unwrap(), raw);
    }

    #[test]
    fn garbage_wire_bytes_are_a_decode_error() {
        assert!(matches!(
            decode(b"definitely not gzip"),
            Err(DecodeError::Compression(_))
        ));
    }

    #[test]
    fn corrupt_header_is_a_decode_error() {
        let wire = compress(&prepend(b"{not json", b"payload"));
        assert!(matches!(decode(&wire), Err(DecodeError::Header(_))));
    }

    #[test]
    fn empty_payload_survives_round_trip() {
        let plan = ExecutionPlan::new(vec![StageNode::new(0, "track", vec![])]).unwrap();
        let envelope = TaskEnvelope::new(plan, 0, Vec::new()).unwrap();
        let decoded = decode(&encode(&envelope)).unwrap();
        assert!(decoded.payload().is_empty());
        assert_eq!(decoded, envelope);
    }
}
