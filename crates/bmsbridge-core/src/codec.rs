//! Wire payload codec.
//!
//! Event payloads arrive as `base64(gzip(utf8(json)))`. [`decode`] peels
//! the layers in order and reports the first one that fails; nothing is
//! returned unless every stage succeeds. [`encode`] builds the same shape
//! for tests and tooling.

use std::io::{Read, Write};

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use serde_json::Value;
use thiserror::Error;

/// The layer of the wire format that could not be decoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum DecodeStage {
    Base64,
    Gzip,
    Utf8,
    Json,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{stage} stage failed: {message}")]
pub struct DecodeError {
    pub stage: DecodeStage,
    pub message: String,
}

impl DecodeError {
    fn at(stage: DecodeStage, err: impl std::fmt::Display) -> Self {
        Self {
            stage,
            message: err.to_string(),
        }
    }
}

/// Decode a wire payload into its JSON value.
pub fn decode(wire: &str) -> Result<Value, DecodeError> {
    let compressed = STANDARD
        .decode(wire.trim())
        .map_err(|e| DecodeError::at(DecodeStage::Base64, e))?;

    let mut bytes = Vec::new();
    GzDecoder::new(compressed.as_slice())
        .read_to_end(&mut bytes)
        .map_err(|e| DecodeError::at(DecodeStage::Gzip, e))?;

    let text = String::from_utf8(bytes).map_err(|e| DecodeError::at(DecodeStage::Utf8, e))?;

    serde_json::from_str(&text).map_err(|e| DecodeError::at(DecodeStage::Json, e))
}

/// Encode a JSON value into the wire format.
pub fn encode(value: &Value) -> std::io::Result<String> {
    let json = serde_json::to_vec(value)?;
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(&json)?;
    let compressed = encoder.finish()?;
    Ok(STANDARD.encode(compressed))
}
