//! Binary codec for embedding `BLOB` columns and JSON codec for the
//! structured `TEXT` columns, shared by every table's CRUD module.

use memfuse_core::error::{Error, Result};
use serde::{de::DeserializeOwned, Serialize};

#[must_use]
pub fn encode_embedding(embedding: &[f32]) -> Vec<u8> {
    embedding.iter().flat_map(|f| f.to_le_bytes()).collect()
}

pub fn decode_embedding(bytes: &[u8]) -> Result<Vec<f32>> {
    if bytes.len() % 4 != 0 {
        return Err(Error::Storage("embedding blob length not a multiple of 4".to_string()));
    }
    Ok(bytes
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect())
}

pub fn encode_json<T: Serialize>(value: &T) -> Result<String> {
    serde_json::to_string(value).map_err(Error::Serialization)
}

pub fn decode_json<T: DeserializeOwned>(raw: &str) -> Result<T> {
    serde_json::from_str(raw).map_err(Error::Serialization)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn embedding_round_trips() {
        let original = vec![0.5_f32, -1.25, 3.0, 0.0];
        let encoded = encode_embedding(&original);
        let decoded = decode_embedding(&encoded).unwrap();
        assert_eq!(original, decoded);
    }

    #[test]
    fn malformed_embedding_blob_is_an_error() {
        assert!(decode_embedding(&[0, 1, 2]).is_err());
    }
}
