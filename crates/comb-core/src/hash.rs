use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::errors::AuditError;
use crate::serde::to_canonical_json_bytes;

/// Computes a stable SHA-256 hex digest for the provided serializable value.
pub fn stable_hash_string<T: Serialize>(value: &T) -> Result<String, AuditError> {
    let bytes = to_canonical_json_bytes(value)?;
    Ok(hex::encode(Sha256::digest(bytes)))
}

/// Hex SHA-256 digest of raw bytes.
pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}
