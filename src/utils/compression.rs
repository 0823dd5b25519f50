//! LZ4 payload compression with decompression-bomb protection.
//!
//! The decompression cap aligns with the frame ceiling: a peer cannot make
//! the server allocate more than one frame's worth of plaintext no matter
//! what the compressed stream claims.

use crate::core::frame::MAX_FRAME_LEN;
use crate::error::{ProtocolError, Result};

/// Maximum output size accepted from decompression.
const MAX_DECOMPRESSED_LEN: usize = MAX_FRAME_LEN;

/// Compresses a payload, prepending the uncompressed size.
pub fn compress(data: &[u8]) -> Vec<u8> {
    lz4_flex::compress_prepend_size(data)
}

/// Decompresses a size-prepended payload.
///
/// # Errors
/// Returns `ProtocolError::DecompressionFailure` if:
/// - The input is too short to carry a size header
/// - The claimed output size exceeds the frame ceiling
/// - The stream is malformed
pub fn decompress(data: &[u8]) -> Result<Vec<u8>> {
    // Validate the claimed size before lz4_flex attempts allocation. The
    // prefix is a 4-byte little-endian uncompressed length.
    if data.len() < 4 {
        return Err(ProtocolError::DecompressionFailure);
    }
    let claimed = u32::from_le_bytes([data[0], data[1], data[2], data[3]]) as usize;
    if claimed > MAX_DECOMPRESSED_LEN {
        return Err(ProtocolError::DecompressionFailure);
    }

    let decompressed = lz4_flex::decompress_size_prepended(data)
        .map_err(|_| ProtocolError::DecompressionFailure)?;
    if decompressed.len() > MAX_DECOMPRESSED_LEN {
        return Err(ProtocolError::DecompressionFailure);
    }
    Ok(decompressed)
}

/// Compress a payload if it meets the threshold and actually shrinks.
/// Returns the output bytes and whether compression was applied.
pub fn maybe_compress(data: &[u8], threshold_bytes: usize) -> (Vec<u8>, bool) {
    if data.len() < threshold_bytes {
        return (data.to_vec(), false);
    }
    let compressed = compress(data);
    if compressed.len() < data.len() {
        (compressed, true)
    } else {
        (data.to_vec(), false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip() {
        let original = b"Hello, World! This is a test of LZ4 compression.";
        let compressed = compress(original);
        let decompressed = decompress(&compressed).expect("decompress");
        assert_eq!(original.as_slice(), decompressed.as_slice());
    }

    #[test]
    fn oversized_claim_rejected() {
        // Claims to decompress to far more than a frame can hold.
        let claimed = (MAX_DECOMPRESSED_LEN + 1) as u32;
        let mut malicious = claimed.to_le_bytes().to_vec();
        malicious.extend_from_slice(&[0u8; 16]);
        assert!(decompress(&malicious).is_err());
    }

    #[test]
    fn short_input_rejected() {
        assert!(decompress(&[0x2B, 0x60]).is_err());
    }

    #[test]
    fn malformed_stream_rejected() {
        let malformed = vec![0x10, 0x00, 0x00, 0x00, 0xFF, 0xFF, 0xFF];
        assert!(decompress(&malformed).is_err());
    }

    #[test]
    fn below_threshold_passes_through() {
        let data = b"tiny";
        let (out, applied) = maybe_compress(data, 512);
        assert!(!applied);
        assert_eq!(out, data);
    }

    #[test]
    fn above_threshold_compresses() {
        let data = vec![1u8; 2048];
        let (out, applied) = maybe_compress(&data, 512);
        assert!(applied);
        assert!(out.len() < data.len());
        assert_eq!(decompress(&out).expect("decompress"), data);
    }
}
