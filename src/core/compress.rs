// src/core/compress.rs

//! Artifact compression. The algorithm is carried by the file-name suffix,
//! so decoding always dispatches on the stored path, never on metadata.

use crate::core::EdgeCacheError;
use serde::{Deserialize, Serialize};
use std::path::Path;
use strum_macros::Display;

/// Recognized artifact encodings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, Serialize, Deserialize, Default)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    #[default]
    None,
    Snappy,
    Lz4,
}

impl Compression {
    /// The file-name suffix for this encoding, including the leading dot.
    /// `None` has no suffix.
    pub fn suffix(&self) -> &'static str {
        match self {
            Compression::None => "",
            Compression::Snappy => ".snappy",
            Compression::Lz4 => ".lz4",
        }
    }

    /// Identifies the encoding from a stored file path. Unknown suffixes are
    /// not an error here: anything that is not `.snappy` or `.lz4` is
    /// treated as an uncompressed artifact, and the `.html` check below
    /// rejects paths that carry some other trailing extension.
    pub fn from_path(path: &Path) -> Result<Self, EdgeCacheError> {
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default();
        if name.ends_with(".snappy") {
            Ok(Compression::Snappy)
        } else if name.ends_with(".lz4") {
            Ok(Compression::Lz4)
        } else if name.ends_with(".html") {
            Ok(Compression::None)
        } else {
            Err(EdgeCacheError::Decompression(format!(
                "unknown artifact suffix on '{name}'"
            )))
        }
    }

    /// Encodes `data`. `None` passes the input through unchanged.
    pub fn compress(&self, data: &[u8]) -> Result<Vec<u8>, EdgeCacheError> {
        match self {
            Compression::None => Ok(data.to_vec()),
            Compression::Snappy => snap::raw::Encoder::new()
                .compress_vec(data)
                .map_err(|e| EdgeCacheError::Internal(format!("snappy encode: {e}"))),
            Compression::Lz4 => Ok(lz4_flex::compress_prepend_size(data)),
        }
    }

    /// Decodes `data`. Corrupt input surfaces as a `Decompression` error,
    /// which callers treat as a self-heal trigger.
    pub fn decompress(&self, data: &[u8]) -> Result<Vec<u8>, EdgeCacheError> {
        match self {
            Compression::None => Ok(data.to_vec()),
            Compression::Snappy => snap::raw::Decoder::new()
                .decompress_vec(data)
                .map_err(|e| EdgeCacheError::Decompression(format!("snappy: {e}"))),
            Compression::Lz4 => lz4_flex::decompress_size_prepended(data)
                .map_err(|e| EdgeCacheError::Decompression(format!("lz4: {e}"))),
        }
    }
}

/// Encodes a payload for storage, skipping compression for payloads below
/// the configured threshold. Returns the bytes to store and the encoding
/// actually applied (which decides the file-name suffix).
pub fn encode_for_storage(
    algo: Compression,
    data: &[u8],
    min_size: usize,
) -> Result<(Vec<u8>, Compression), EdgeCacheError> {
    if algo == Compression::None || data.len() < min_size {
        return Ok((data.to_vec(), Compression::None));
    }
    let encoded = algo.compress(data)?;
    Ok((encoded, algo))
}
