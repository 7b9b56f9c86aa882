//! Fragment reassembly (§4.7 fragment types `5..7`): a payload too
//! large for one packet is split into `FRAGMENT_START`/`CONTINUE`/`END`
//! packets sharing a fragment id, reassembled into a fresh `MESSAGE`
//! once `FRAGMENT_END` arrives.
//!
//! The wire format of a non-terminal fragment's payload (not otherwise
//! specified) is `[u8 id_len][id bytes][u16 index][chunk bytes]` —
//! `index` counts from zero at `FRAGMENT_START`. The terminal
//! (`FRAGMENT_END`) fragment additionally carries, ahead of that same
//! header, a 1-byte trailer flag plus an optional 64-byte signature:
//! `[u8 trailer_flags][signature?][u8 id_len][id bytes][u16 index][chunk bytes]`.
//! This is how the enclosing message's compression flag and signature
//! — both otherwise only known from the original, unfragmented packet
//! — survive reassembly regardless of which fragment happens to
//! complete it.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::error::{CodecError, CodecResult};

/// Maximum bytes of reassembly state held per sending peer (§5).
pub const FRAGMENT_CAP_PER_PEER: usize = 4 * 64 * 1024;

const TRAILER_IS_COMPRESSED: u8 = 0b0000_0001;
const TRAILER_HAS_SIGNATURE: u8 = 0b0000_0010;
const SIGNATURE_LEN: usize = 64;

/// One still-in-progress reassembly, keyed by `(sender_id, fragment id)`.
struct PendingFragment {
    chunks: HashMap<u16, Vec<u8>>,
    total_bytes: usize,
    end_index: Option<u16>,
    end_is_compressed: bool,
    end_signature: Option<[u8; 64]>,
    started_at: Instant,
}

fn decode_header_and_chunk(body: &[u8]) -> CodecResult<(String, u16, Vec<u8>)> {
    if body.is_empty() {
        return Err(CodecError::BadRecord("empty fragment payload".into()));
    }
    let id_len = body[0] as usize;
    if body.len() < 1 + id_len + 2 {
        return Err(CodecError::BadRecord("truncated fragment header".into()));
    }
    let id = String::from_utf8(body[1..1 + id_len].to_vec())
        .map_err(|_| CodecError::BadRecord("fragment id is not valid UTF-8".into()))?;
    let index_offset = 1 + id_len;
    let index = u16::from_be_bytes([body[index_offset], body[index_offset + 1]]);
    let chunk = body[index_offset + 2..].to_vec();
    Ok((id, index, chunk))
}

/// Splits a fragment packet's payload into its declared id, index, and
/// chunk bytes. For `FRAGMENT_END` payloads (`is_end`), also returns
/// the enclosing message's compression flag and signature, carried in
/// a trailer ahead of the usual fragment header.
pub fn decode_fragment_payload(
    payload: &[u8],
    is_end: bool,
) -> CodecResult<(String, u16, Vec<u8>, Option<bool>, Option<[u8; 64]>)> {
    if !is_end {
        let (id, index, chunk) = decode_header_and_chunk(payload)?;
        return Ok((id, index, chunk, None, None));
    }

    if payload.is_empty() {
        return Err(CodecError::BadRecord("missing fragment-end trailer".into()));
    }
    let trailer_flags = payload[0];
    let is_compressed = trailer_flags & TRAILER_IS_COMPRESSED != 0;
    let has_signature = trailer_flags & TRAILER_HAS_SIGNATURE != 0;

    let mut offset = 1;
    let signature = if has_signature {
        if payload.len() < offset + SIGNATURE_LEN {
            return Err(CodecError::BadRecord("truncated fragment-end signature".into()));
        }
        let mut sig = [0u8; 64];
        sig.copy_from_slice(&payload[offset..offset + SIGNATURE_LEN]);
        offset += SIGNATURE_LEN;
        Some(sig)
    } else {
        None
    };

    let (id, index, chunk) = decode_header_and_chunk(&payload[offset..])?;
    Ok((id, index, chunk, Some(is_compressed), signature))
}

/// Encodes a non-terminal fragment payload for a given id/index/chunk.
pub fn encode_fragment_payload(id: &str, index: u16, chunk: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + id.len() + 2 + chunk.len());
    out.push(id.len() as u8);
    out.extend_from_slice(id.as_bytes());
    out.extend_from_slice(&index.to_be_bytes());
    out.extend_from_slice(chunk);
    out
}

/// Encodes the terminal (`FRAGMENT_END`) fragment's payload, additionally
/// carrying the reassembled message's compression flag and signature.
pub fn encode_fragment_end_payload(
    id: &str,
    index: u16,
    chunk: &[u8],
    is_compressed: bool,
    signature: Option<[u8; 64]>,
) -> Vec<u8> {
    let mut trailer_flags = 0u8;
    if is_compressed {
        trailer_flags |= TRAILER_IS_COMPRESSED;
    }
    if signature.is_some() {
        trailer_flags |= TRAILER_HAS_SIGNATURE;
    }

    let mut out = Vec::with_capacity(1 + SIGNATURE_LEN + 1 + id.len() + 2 + chunk.len());
    out.push(trailer_flags);
    if let Some(signature) = signature {
        out.extend_from_slice(&signature);
    }
    out.extend_from_slice(&encode_fragment_payload(id, index, chunk));
    out
}

/// Splits `payload` into chunks of at most `chunk_size` bytes, each
/// wrapped with the fragment header; the last chunk also carries
/// `is_compressed`/`signature` so reassembly can restore them
/// regardless of which fragment completes it. The caller wraps the
/// first as `FRAGMENT_START`, the middle ones as `FRAGMENT_CONTINUE`,
/// and the last as `FRAGMENT_END`.
pub fn split_into_fragments(
    id: &str,
    payload: &[u8],
    chunk_size: usize,
    is_compressed: bool,
    signature: Option<[u8; 64]>,
) -> Vec<Vec<u8>> {
    let chunks: Vec<&[u8]> = payload.chunks(chunk_size.max(1)).collect();
    let last = chunks.len().saturating_sub(1);
    chunks
        .iter()
        .enumerate()
        .map(|(index, chunk)| {
            if index == last {
                encode_fragment_end_payload(id, index as u16, chunk, is_compressed, signature)
            } else {
                encode_fragment_payload(id, index as u16, chunk)
            }
        })
        .collect()
}

/// Per-sender reassembly state. Each sender gets its own fragment id
/// -> buffer map, with a hard cap on total bytes held per sender and
/// a 60s expiry for stalled reassemblies.
pub struct FragmentReassembler {
    timeout: Duration,
    cap_per_peer: usize,
    by_sender: HashMap<[u8; 8], HashMap<String, PendingFragment>>,
}

impl FragmentReassembler {
    pub fn new(timeout: Duration) -> Self {
        Self::with_cap(timeout, FRAGMENT_CAP_PER_PEER)
    }

    pub fn with_cap(timeout: Duration, cap_per_peer: usize) -> Self {
        Self {
            timeout,
            cap_per_peer,
            by_sender: HashMap::new(),
        }
    }

    /// Records one fragment. Returns `Some((reassembled_bytes,
    /// is_compressed, signature))` once the `FRAGMENT_END` for this id
    /// arrives and every index from 0 up to it has been seen; `None`
    /// while reassembly is still incomplete (including when the cap is
    /// exceeded, which drops the buffer). `is_compressed`/`signature`
    /// are only meaningful once `FRAGMENT_END` has been seen, which is
    /// guaranteed by the time this returns `Some`.
    pub fn accept(
        &mut self,
        sender_id: [u8; 8],
        id: String,
        index: u16,
        chunk: Vec<u8>,
        is_end: bool,
        end_is_compressed: Option<bool>,
        end_signature: Option<[u8; 64]>,
    ) -> Option<(Vec<u8>, bool, Option<[u8; 64]>)> {
        let peer_buffers = self.by_sender.entry(sender_id).or_default();
        let pending = peer_buffers.entry(id.clone()).or_insert_with(|| PendingFragment {
            chunks: HashMap::new(),
            total_bytes: 0,
            end_index: None,
            end_is_compressed: false,
            end_signature: None,
            started_at: Instant::now(),
        });

        pending.total_bytes += chunk.len();
        pending.chunks.insert(index, chunk);
        if is_end {
            pending.end_index = Some(index);
            pending.end_is_compressed = end_is_compressed.unwrap_or(false);
            pending.end_signature = end_signature;
        }

        if pending.total_bytes > self.cap_per_peer {
            peer_buffers.remove(&id);
            return None;
        }

        let Some(end_index) = pending.end_index else {
            return None;
        };
        if (0..=end_index).any(|i| !pending.chunks.contains_key(&i)) {
            return None;
        }

        let pending = peer_buffers.remove(&id)?;
        let mut out = Vec::with_capacity(pending.total_bytes);
        for i in 0..=end_index {
            out.extend_from_slice(&pending.chunks[&i]);
        }
        Some((out, pending.end_is_compressed, pending.end_signature))
    }

    /// Drops reassembly buffers that have not completed within the
    /// fragment timeout.
    pub fn gc(&mut self) {
        let timeout = self.timeout;
        let now = Instant::now();
        self.by_sender.retain(|_, buffers| {
            buffers.retain(|_, pending| now.duration_since(pending.started_at) <= timeout);
            !buffers.is_empty()
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn three_fragments_reassemble_to_the_original_payload() {
        let payload: Vec<u8> = (0..1500u32).map(|i| (i % 251) as u8).collect();
        let fragments = split_into_fragments("msg-1", &payload, 512, false, None);
        assert_eq!(fragments.len(), 3);

        let mut reassembler = FragmentReassembler::new(Duration::from_secs(60));
        let mut result = None;
        for (i, fragment) in fragments.iter().enumerate() {
            let is_end = i == fragments.len() - 1;
            let (id, index, chunk, is_compressed, signature) =
                decode_fragment_payload(fragment, is_end).unwrap();
            result = reassembler.accept(*b"AAAAAAAA", id, index, chunk, is_end, is_compressed, signature);
        }
        let (reassembled, is_compressed, signature) = result.unwrap();
        assert_eq!(reassembled, payload);
        assert!(!is_compressed);
        assert_eq!(signature, None);
    }

    #[test]
    fn fragment_end_carries_compression_flag_and_signature() {
        let payload: Vec<u8> = (0..1500u32).map(|i| (i % 251) as u8).collect();
        let signature = [7u8; 64];
        let fragments = split_into_fragments("msg-sig", &payload, 512, true, Some(signature));

        let mut reassembler = FragmentReassembler::new(Duration::from_secs(60));
        let mut result = None;
        for (i, fragment) in fragments.iter().enumerate() {
            let is_end = i == fragments.len() - 1;
            let (id, index, chunk, is_compressed, sig) = decode_fragment_payload(fragment, is_end).unwrap();
            result = reassembler.accept(*b"AAAAAAAA", id, index, chunk, is_end, is_compressed, sig);
        }
        let (reassembled, is_compressed, sig) = result.unwrap();
        assert_eq!(reassembled, payload);
        assert!(is_compressed);
        assert_eq!(sig, Some(signature));
    }

    #[test]
    fn missing_middle_fragment_never_completes() {
        let payload: Vec<u8> = (0..1500u32).map(|i| (i % 251) as u8).collect();
        let fragments = split_into_fragments("msg-2", &payload, 512, false, None);

        let mut reassembler = FragmentReassembler::new(Duration::from_secs(60));
        let (id0, idx0, chunk0, _, _) = decode_fragment_payload(&fragments[0], false).unwrap();
        assert!(reassembler
            .accept(*b"AAAAAAAA", id0, idx0, chunk0, false, None, None)
            .is_none());

        let (id2, idx2, chunk2, is_compressed, signature) = decode_fragment_payload(&fragments[2], true).unwrap();
        assert!(reassembler
            .accept(*b"AAAAAAAA", id2, idx2, chunk2, true, is_compressed, signature)
            .is_none());
    }

    #[test]
    fn reassembly_completes_even_when_the_end_fragment_arrives_before_a_gap_fills() {
        // Out-of-order arrival: END (index 2) shows up before CONTINUE
        // (index 1), so completion is triggered by the later, non-END
        // fragment filling the last gap rather than by processing END
        // itself — the carried signature must still survive.
        let payload: Vec<u8> = (0..1500u32).map(|i| (i % 251) as u8).collect();
        let signature = [9u8; 64];
        let fragments = split_into_fragments("msg-ooo", &payload, 512, false, Some(signature));

        let mut reassembler = FragmentReassembler::new(Duration::from_secs(60));
        let (id0, idx0, chunk0, _, _) = decode_fragment_payload(&fragments[0], false).unwrap();
        assert!(reassembler
            .accept(*b"AAAAAAAA", id0, idx0, chunk0, false, None, None)
            .is_none());

        let (id2, idx2, chunk2, is_compressed2, sig2) = decode_fragment_payload(&fragments[2], true).unwrap();
        assert!(reassembler
            .accept(*b"AAAAAAAA", id2, idx2, chunk2, true, is_compressed2, sig2)
            .is_none());

        let (id1, idx1, chunk1, _, _) = decode_fragment_payload(&fragments[1], false).unwrap();
        let (reassembled, is_compressed, sig) = reassembler
            .accept(*b"AAAAAAAA", id1, idx1, chunk1, false, None, None)
            .unwrap();
        assert_eq!(reassembled, payload);
        assert!(!is_compressed);
        assert_eq!(sig, Some(signature));
    }

    #[test]
    fn stalled_reassembly_expires_after_timeout() {
        let mut reassembler = FragmentReassembler::new(Duration::from_secs(0));
        reassembler.accept(*b"AAAAAAAA", "msg-3".into(), 0, b"a".to_vec(), false, None, None);
        reassembler.gc();
        assert!(reassembler
            .by_sender
            .get(&*b"AAAAAAAA")
            .map(|buffers| buffers.is_empty())
            .unwrap_or(true));
    }
}
