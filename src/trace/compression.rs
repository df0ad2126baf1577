//! Transparent gzip support for VGZ files
//!
//! `.vgz` files are VGM files wrapped in a gzip stream. [`decompress_if_needed`]
//! detects the gzip magic and inflates; plain VGM data passes through.

use super::vgm::VgmTrace;
use crate::{PlayerError, Result};
use flate2::read::GzDecoder;
use std::io::Read;
use std::path::Path;

/// gzip member header magic
const GZIP_MAGIC: [u8; 2] = [0x1F, 0x8B];

/// Maximum inflated size: 64 MiB
///
/// NES VGM files are rarely above a few megabytes; the cap guards against
/// decompression bombs.
const MAX_DECOMPRESSED_SIZE: usize = 64 * 1024 * 1024;

/// Whether the data starts with a gzip header
pub fn is_gzip_compressed(data: &[u8]) -> bool {
    data.starts_with(&GZIP_MAGIC)
}

/// Inflate gzip data, otherwise return a copy unchanged
///
/// # Errors
/// Returns [`PlayerError::TraceError`] when inflation fails or the output
/// reaches the size cap.
pub fn decompress_if_needed(data: &[u8]) -> Result<Vec<u8>> {
    if !is_gzip_compressed(data) {
        return Ok(data.to_vec());
    }

    let decoder = GzDecoder::new(data);
    let mut decompressed = Vec::new();
    decoder
        .take(MAX_DECOMPRESSED_SIZE as u64)
        .read_to_end(&mut decompressed)
        .map_err(|e| PlayerError::TraceError(format!("VGZ decompression failed: {}", e)))?;

    if decompressed.len() >= MAX_DECOMPRESSED_SIZE {
        return Err(PlayerError::TraceError(
            "Decompressed data exceeded maximum safe size (64MB)".to_string(),
        ));
    }
    Ok(decompressed)
}

/// Build a trace from VGM or VGZ bytes
pub fn load_bytes(data: &[u8]) -> Result<VgmTrace> {
    VgmTrace::new(decompress_if_needed(data)?)
}

/// Read a VGM or VGZ file from disk
pub fn load_file(path: impl AsRef<Path>) -> Result<VgmTrace> {
    let data = std::fs::read(path.as_ref())?;
    load_bytes(&data)
}
