//! Payload compression heuristic and codec, backed by `lz4_flex`.

/// Minimum payload size worth attempting compression on.
const MIN_COMPRESS_LEN: usize = 100;

/// Minimum Shannon entropy (bits/byte) a payload must exhibit before
/// compression is attempted at all — already-dense data rarely
/// compresses and the attempt is wasted work.
const MIN_ENTROPY_BITS_PER_BYTE: f64 = 4.0;

/// A compressed result must be no more than this fraction of the
/// original size to be worth using.
const MAX_COMPRESSED_RATIO: f64 = 0.8;

/// Magic bytes of formats that are already compressed; payloads
/// starting with these are not worth attempting again.
const KNOWN_COMPRESSED_MAGIC: [&[u8]; 3] = [
    &[0x1F, 0x8B],       // gzip
    &[0x78, 0x9C],       // zlib (default compression)
    &[0x04, 0x22],       // lz4 frame (little-endian magic leading byte pair)
];

/// Shannon entropy in bits/byte over the byte-value histogram of
/// `data`.
pub fn shannon_entropy(data: &[u8]) -> f64 {
    if data.is_empty() {
        return 0.0;
    }
    let mut counts = [0u32; 256];
    for &b in data {
        counts[b as usize] += 1;
    }
    let len = data.len() as f64;
    counts
        .iter()
        .filter(|&&c| c > 0)
        .map(|&c| {
            let p = c as f64 / len;
            -p * p.log2()
        })
        .sum()
}

fn starts_with_known_magic(data: &[u8]) -> bool {
    KNOWN_COMPRESSED_MAGIC
        .iter()
        .any(|magic| data.starts_with(magic))
}

/// Whether the encoder should attempt compression on `payload` at
/// all, per the size/magic/entropy heuristic.
pub fn should_attempt(payload: &[u8]) -> bool {
    payload.len() >= MIN_COMPRESS_LEN
        && !starts_with_known_magic(payload)
        && shannon_entropy(payload) >= MIN_ENTROPY_BITS_PER_BYTE
}

/// Attempts to compress `payload`. Returns `Some(compressed)` only if
/// [`should_attempt`] passes and the result is at least 20% smaller;
/// otherwise `None`, telling the caller to send the payload
/// uncompressed.
pub fn try_compress(payload: &[u8]) -> Option<Vec<u8>> {
    if !should_attempt(payload) {
        return None;
    }
    let compressed = lz4_flex::compress(payload);
    if (compressed.len() as f64) <= payload.len() as f64 * MAX_COMPRESSED_RATIO {
        Some(compressed)
    } else {
        None
    }
}

/// Decompresses `data`, which was produced by `lz4_flex::compress`,
/// verifying the output is exactly `original_len` bytes and does not
/// exceed the hard safety cap.
pub fn decompress(data: &[u8], original_len: usize) -> Option<Vec<u8>> {
    const MAX_DECOMPRESSED_LEN: usize = 256 * 1024;
    if original_len > MAX_DECOMPRESSED_LEN {
        return None;
    }
    let decompressed = lz4_flex::decompress(data, original_len).ok()?;
    if decompressed.len() == original_len {
        Some(decompressed)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entropy_of_constant_bytes_is_zero() {
        let data = vec![0x41u8; 200];
        assert_eq!(shannon_entropy(&data), 0.0);
    }

    #[test]
    fn short_payloads_are_never_attempted() {
        let data = vec![0xFFu8; 10];
        assert!(!should_attempt(&data));
    }

    #[test]
    fn compress_then_decompress_round_trips() {
        let payload: Vec<u8> = (0..500u32).map(|i| (i % 251) as u8).collect();
        if let Some(compressed) = try_compress(&payload) {
            let restored = decompress(&compressed, payload.len()).unwrap();
            assert_eq!(restored, payload);
        }
    }

    #[test]
    fn known_magic_payload_is_skipped() {
        let mut data = vec![0x1F, 0x8B];
        data.extend(vec![0x20u8; 200]);
        assert!(!should_attempt(&data));
    }

    mod proptests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn entropy_is_never_negative_or_nan(data in proptest::collection::vec(any::<u8>(), 0..500)) {
                let entropy = shannon_entropy(&data);
                prop_assert!(entropy >= 0.0);
                prop_assert!(!entropy.is_nan());
            }

            #[test]
            fn try_compress_output_always_decompresses_back(
                data in proptest::collection::vec(any::<u8>(), 0..2000),
            ) {
                if let Some(compressed) = try_compress(&data) {
                    let restored = decompress(&compressed, data.len()).unwrap();
                    prop_assert_eq!(restored, data);
                }
            }

            #[test]
            fn decompress_never_panics_on_arbitrary_bytes(
                data in proptest::collection::vec(any::<u8>(), 0..200),
                claimed_len in 0usize..4000,
            ) {
                let _ = decompress(&data, claimed_len);
            }
        }
    }
}
