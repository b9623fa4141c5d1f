//! GGUF model file checks
//!
//! Cheap header validation done on the calling thread before a model path is
//! handed to llama.cpp.

use std::fs::File;
use std::io::Read;
use std::path::Path;

use thiserror::Error;

/// Magic bytes at the start of every GGUF file
pub const GGUF_MAGIC: [u8; 4] = *b"GGUF";

/// Errors found while inspecting a model file
#[derive(Debug, Error)]
pub enum ModelError {
    #[error("Model file not found: {0}")]
    NotFound(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Not a GGUF file (bad magic)")]
    BadMagic,

    #[error("Unsupported GGUF version {0}")]
    UnsupportedVersion(u32),
}

/// Fixed-size GGUF header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GgufHeader {
    pub version: u32,
    pub tensor_count: u64,
    pub metadata_kv_count: u64,
}

/// Read and check the GGUF header of `path`
pub fn validate_gguf<P: AsRef<Path>>(path: P) -> Result<GgufHeader, ModelError> {
    let path = path.as_ref();
    if !path.is_file() {
        return Err(ModelError::NotFound(path.display().to_string()));
    }

    let mut file = File::open(path)?;
    let mut header = [0u8; 24];
    file.read_exact(&mut header)?;

    if header[0..4] != GGUF_MAGIC {
        return Err(ModelError::BadMagic);
    }

    let version = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
    // v1 used 32-bit counts and is no longer loadable by llama.cpp
    if !(2..=3).contains(&version) {
        return Err(ModelError::UnsupportedVersion(version));
    }

    let mut count = [0u8; 8];
    count.copy_from_slice(&header[8..16]);
    let tensor_count = u64::from_le_bytes(count);
    count.copy_from_slice(&header[16..24]);
    let metadata_kv_count = u64::from_le_bytes(count);

    Ok(GgufHeader {
        version,
        tensor_count,
        metadata_kv_count,
    })
}
