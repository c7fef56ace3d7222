// msim-msg::codec — payload encoding for rank-to-rank messages.
//
// Every payload is a bincode (standard config) encoding of a serde value.
// The transport itself only moves opaque byte vectors.

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{MsgError, Result};

/// Safety limit: reject any single payload larger than 256 MiB.
pub const MAX_PAYLOAD_BYTES: usize = 256 * 1024 * 1024;

pub fn encode<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>> {
    let buf = bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| MsgError::Encode(e.to_string()))?;
    if buf.len() > MAX_PAYLOAD_BYTES {
        return Err(MsgError::Encode(format!(
            "payload too large: {} bytes (max {MAX_PAYLOAD_BYTES})",
            buf.len()
        )));
    }
    Ok(buf)
}

pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    let (value, used) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| MsgError::Decode(e.to_string()))?;
    if used != bytes.len() {
        return Err(MsgError::Decode(format!(
            "{} trailing bytes after payload",
            bytes.len() - used
        )));
    }
    Ok(value)
}

/// Decode an accumulator value array and check its element count.
pub fn decode_values(bytes: &[u8], expected: usize) -> Result<Vec<f64>> {
    let values: Vec<f64> = decode(bytes)?;
    if values.len() != expected {
        return Err(MsgError::SizeMismatch { expected, actual: values.len() });
    }
    Ok(values)
}

// ── Tests ─────────────────────────────────────────────────────────────────────
