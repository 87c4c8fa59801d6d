//! GGUF model file validation
//!
//! Checks that a model artifact exists and carries a GGUF header llama.cpp can load,
//! and extracts the few metadata keys the engine reports or warns about.

use std::fs::File;
use std::io::{BufReader, ErrorKind, Read};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Magic bytes at the start of every GGUF file
pub const GGUF_MAGIC: [u8; 4] = *b"GGUF";

/// GGUF container versions llama.cpp still loads
pub const SUPPORTED_GGUF_VERSIONS: [u32; 2] = [2, 3];

const MAX_STRING_LEN: u64 = 16 * 1024 * 1024;
const MAX_KV_COUNT: u64 = 1 << 20;

/// Errors raised while validating a model file
#[derive(Debug, Error)]
pub enum ModelError {
    #[error("Model file not found: {0}")]
    NotFound(PathBuf),
    #[error("Model path is not a file: {0}")]
    NotAFile(PathBuf),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Not a GGUF file (magic {0:02x?})")]
    BadMagic([u8; 4]),
    #[error("Unsupported GGUF version: {0}")]
    UnsupportedVersion(u32),
    #[error("Corrupt GGUF header: {0}")]
    Corrupt(String),
}

/// Header metadata read from a GGUF file
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GgufMetadata {
    pub version: u32,
    pub tensor_count: u64,
    pub kv_count: u64,
    /// `general.architecture`, e.g. "llama"
    pub architecture: Option<String>,
    /// `general.name`
    pub name: Option<String>,
    /// Whether `tokenizer.chat_template` is present
    pub has_chat_template: bool,
}

/// Value type tags of GGUF metadata entries
mod value_type {
    pub const U8: u32 = 0;
    pub const I8: u32 = 1;
    pub const U16: u32 = 2;
    pub const I16: u32 = 3;
    pub const U32: u32 = 4;
    pub const I32: u32 = 5;
    pub const F32: u32 = 6;
    pub const BOOL: u32 = 7;
    pub const STRING: u32 = 8;
    pub const ARRAY: u32 = 9;
    pub const U64: u32 = 10;
    pub const I64: u32 = 11;
    pub const F64: u32 = 12;
}

/// Validate a model file on disk and return its header metadata
pub fn validate_gguf(path: &Path) -> Result<GgufMetadata, ModelError> {
    if !path.exists() {
        return Err(ModelError::NotFound(path.to_path_buf()));
    }
    if !path.is_file() {
        return Err(ModelError::NotAFile(path.to_path_buf()));
    }

    let file = File::open(path)?;
    let metadata = read_gguf_header(&mut BufReader::new(file))?;

    tracing::debug!(
        "GGUF v{} with {} tensors, {} metadata entries: {:?}",
        metadata.version,
        metadata.tensor_count,
        metadata.kv_count,
        path
    );
    Ok(metadata)
}

/// Parse the GGUF header and metadata section from a reader
pub fn read_gguf_header<R: Read>(reader: &mut R) -> Result<GgufMetadata, ModelError> {
    let mut magic = [0u8; 4];
    read_exact(reader, &mut magic)?;
    if magic != GGUF_MAGIC {
        return Err(ModelError::BadMagic(magic));
    }

    let version = read_u32(reader)?;
    if !SUPPORTED_GGUF_VERSIONS.contains(&version) {
        return Err(ModelError::UnsupportedVersion(version));
    }

    let tensor_count = read_u64(reader)?;
    let kv_count = read_u64(reader)?;
    if kv_count > MAX_KV_COUNT {
        return Err(ModelError::Corrupt(format!(
            "implausible metadata count {}",
            kv_count
        )));
    }

    let mut metadata = GgufMetadata {
        version,
        tensor_count,
        kv_count,
        ..Default::default()
    };
    for _ in 0..kv_count {
        let key = read_string(reader)?;
        let ty = read_u32(reader)?;

        match (key.as_str(), ty) {
            ("general.architecture", value_type::STRING) => {
                metadata.architecture = Some(read_string(reader)?);
            }
            ("general.name", value_type::STRING) => {
                metadata.name = Some(read_string(reader)?);
            }
            ("tokenizer.chat_template", _) => {
                metadata.has_chat_template = true;
                skip_value(reader, ty)?;
            }
            _ => skip_value(reader, ty)?,
        }
    }

    Ok(metadata)
}

fn skip_value<R: Read>(reader: &mut R, ty: u32) -> Result<(), ModelError> {
    match ty {
        value_type::U8 | value_type::I8 | value_type::BOOL => skip_bytes(reader, 1),
        value_type::U16 | value_type::I16 => skip_bytes(reader, 2),
        value_type::U32 | value_type::I32 | value_type::F32 => skip_bytes(reader, 4),
        value_type::U64 | value_type::I64 | value_type::F64 => skip_bytes(reader, 8),
        value_type::STRING => {
            let len = read_string_len(reader)?;
            skip_bytes(reader, len)
        }
        value_type::ARRAY => {
            let elem_ty = read_u32(reader)?;
            let count = read_u64(reader)?;
            match fixed_size(elem_ty) {
                Some(size) => {
                    let total = size.checked_mul(count).ok_or_else(|| {
                        ModelError::Corrupt(format!("array of {} elements overflows", count))
                    })?;
                    skip_bytes(reader, total)
                }
                None => {
                    for _ in 0..count {
                        skip_value(reader, elem_ty)?;
                    }
                    Ok(())
                }
            }
        }
        other => Err(ModelError::Corrupt(format!("unknown value type {}", other))),
    }
}

fn fixed_size(ty: u32) -> Option<u64> {
    match ty {
        value_type::U8 | value_type::I8 | value_type::BOOL => Some(1),
        value_type::U16 | value_type::I16 => Some(2),
        value_type::U32 | value_type::I32 | value_type::F32 => Some(4),
        value_type::U64 | value_type::I64 | value_type::F64 => Some(8),
        _ => None,
    }
}

fn skip_bytes<R: Read>(reader: &mut R, n: u64) -> Result<(), ModelError> {
    let copied = std::io::copy(&mut reader.by_ref().take(n), &mut std::io::sink())?;
    if copied != n {
        return Err(ModelError::Corrupt("truncated metadata".to_string()));
    }
    Ok(())
}

fn read_exact<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<(), ModelError> {
    reader.read_exact(buf).map_err(|e| match e.kind() {
        ErrorKind::UnexpectedEof => ModelError::Corrupt("truncated header".to_string()),
        _ => ModelError::Io(e),
    })
}

fn read_u32<R: Read>(reader: &mut R) -> Result<u32, ModelError> {
    let mut buf = [0u8; 4];
    read_exact(reader, &mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

fn read_u64<R: Read>(reader: &mut R) -> Result<u64, ModelError> {
    let mut buf = [0u8; 8];
    read_exact(reader, &mut buf)?;
    Ok(u64::from_le_bytes(buf))
}

fn read_string_len<R: Read>(reader: &mut R) -> Result<u64, ModelError> {
    let len = read_u64(reader)?;
    if len > MAX_STRING_LEN {
        return Err(ModelError::Corrupt(format!("string of {} bytes", len)));
    }
    Ok(len)
}

fn read_string<R: Read>(reader: &mut R) -> Result<String, ModelError> {
    let len = read_string_len(reader)?;
    let mut buf = vec![0u8; len as usize];
    read_exact(reader, &mut buf)?;
    Ok(String::from_utf8_lossy(&buf).into_owned())
}
