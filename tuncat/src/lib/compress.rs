//! Wraps the Snappy block compressor behind the fixed four-operation contract
//! SPEC_FULL.md §4.2 asks for, so the engine never touches `snap` directly.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CompressError {
    #[error("snappy compression failed: {0}")]
    Compress(#[source] snap::Error),
    #[error("snappy decompression failed: {0}")]
    Decompress(#[source] snap::Error),
}

/// Upper bound on the compressed size of an input of `uncompressed_size` bytes.
pub fn max_compressed_size(uncompressed_size: usize) -> usize {
    snap::raw::max_compress_len(uncompressed_size)
}

/// Compresses `input` into `output`, returning the number of bytes written.
/// `output` must be at least [`max_compressed_size`] of `input.len()`.
pub fn compress(input: &[u8], output: &mut [u8]) -> Result<usize, CompressError> {
    snap::raw::Encoder::new().compress(input, output).map_err(CompressError::Compress)
}

/// The size a compressed `block` will expand to, without decompressing it.
pub fn uncompressed_size(block: &[u8]) -> Result<usize, CompressError> {
    snap::raw::decompress_len(block).map_err(CompressError::Decompress)
}

/// Restores the original bytes of `block` into `output`, returning the number of bytes written.
pub fn uncompress(block: &[u8], output: &mut [u8]) -> Result<usize, CompressError> {
    snap::raw::Decoder::new().decompress(block, output).map_err(CompressError::Decompress)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn round_trips_a_frame() {
        let input = vec![0x41u8; 100];
        let mut compressed = vec![0u8; max_compressed_size(input.len())];
        let n = compress(&input, &mut compressed).unwrap();
        compressed.truncate(n);

        let restored_len = uncompressed_size(&compressed).unwrap();
        assert_eq!(restored_len, input.len());

        let mut restored = vec![0u8; restored_len];
        let written = uncompress(&compressed, &mut restored).unwrap();
        assert_eq!(written, input.len());
        assert_eq!(restored, input);
    }

    #[test]
    fn malformed_block_is_an_error_not_a_panic() {
        let garbage = [0xffu8, 0xff, 0xff, 0xff];
        assert!(uncompressed_size(&garbage).is_err());
    }
}
