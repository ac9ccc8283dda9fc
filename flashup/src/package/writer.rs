//! Container writer: the inverse of the parser, used by packaging tooling
//! and tests.

use crate::error::{Error, Result};
use crate::package::{MAGIC, REQUIRED_FIELDS};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

/// Serialize a container from metadata and a payload.
///
/// The `sha256` field is computed here and overrides any caller-provided
/// value, so the emitted container always parses cleanly. All other
/// required fields (`name`, `version`, `target`, `timestamp`) must be
/// present and non-empty.
pub fn encode_package(metadata: &BTreeMap<String, String>, payload: &[u8]) -> Result<Vec<u8>> {
    if payload.is_empty() {
        return Err(Error::EmptyPayload);
    }

    let mut metadata = metadata.clone();
    let mut hasher = Sha256::new();
    hasher.update(payload);
    metadata.insert("sha256".to_string(), hex::encode(hasher.finalize()));

    for field in REQUIRED_FIELDS {
        match metadata.get(*field) {
            Some(value) if !value.is_empty() => {}
            _ => return Err(Error::MissingField((*field).to_string())),
        }
    }

    let meta_json = serde_json::to_vec(&metadata)
        .map_err(|e| Error::InvalidMetadata(format!("metadata not serializable: {e}")))?;

    let mut out = Vec::with_capacity(MAGIC.len() + 4 + meta_json.len() + payload.len());
    out.extend_from_slice(MAGIC);
    out.extend_from_slice(&(meta_json.len() as u32).to_le_bytes());
    out.extend_from_slice(&meta_json);
    out.extend_from_slice(payload);
    Ok(out)
}

/// Write a container file to `path`.
pub fn write_package<P: AsRef<Path>>(
    path: P,
    metadata: &BTreeMap<String, String>,
    payload: &[u8],
) -> Result<()> {
    let bytes = encode_package(metadata, payload)?;
    fs::write(path, bytes)?;
    Ok(())
}
