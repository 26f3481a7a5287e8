//! zstd payload compression.

use crate::TransformError;

/// Compression level. Conservative default favoring throughput over ratio.
const LEVEL: i32 = 3;

/// Compress a payload.
///
/// # Errors
///
/// - `TransformError::CompressFailed` on an internal zstd error.
pub fn compress(bytes: &[u8]) -> Result<Vec<u8>, TransformError> {
    zstd::bulk::compress(bytes, LEVEL)
        .map_err(|e| TransformError::CompressFailed { reason: e.to_string() })
}

/// Decompress a payload, bounded by `max_size` output bytes.
///
/// # Errors
///
/// - `TransformError::DecompressTooLarge` if output would exceed the cap
/// - `TransformError::DecompressFailed` on corrupt input.
pub fn decompress(bytes: &[u8], max_size: usize) -> Result<Vec<u8>, TransformError> {
    let out = zstd::bulk::decompress(bytes, max_size).map_err(|e| {
        TransformError::DecompressFailed { reason: e.to_string() }
    })?;
    if out.len() > max_size {
        return Err(TransformError::DecompressTooLarge { max: max_size });
    }
    Ok(out)
}
