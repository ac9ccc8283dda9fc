//! FLASHUP firmware container format.
//!
//! A FLASHUP container wraps a raw firmware image together with a JSON
//! metadata block describing it:
//!
//! ```text
//! +------------------+
//! |  Magic (7B)      |  "FLASHUP"
//! +------------------+
//! |  Meta len (4B)   |  u32 little-endian = M
//! +------------------+
//! |  Metadata (M B)  |  UTF-8 JSON object, string values only
//! +------------------+
//! |  Payload         |  raw firmware image, to EOF
//! +------------------+
//! ```
//!
//! The metadata object must carry `name`, `version`, `target`, `timestamp`
//! and `sha256` (hex digest of the payload). An optional `signature` field
//! is reserved for future signature verification.
//!
//! Parsing validates eagerly: a [`FirmwarePackage`] that constructs
//! successfully has a well-formed header, complete metadata and a payload
//! whose SHA-256 matches the recorded digest. The backing file stays open
//! read-only for the lifetime of the package so chunks can be served
//! without re-reading the whole image.

pub mod writer;

use crate::error::{Error, Result};
use byteorder::{LittleEndian, ReadBytesExt};
use log::debug;
use sha2::{Digest, Sha256};
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

/// Magic bytes identifying a FLASHUP container.
pub const MAGIC: &[u8; 7] = b"FLASHUP";

/// Fixed header size: magic plus the metadata length field.
pub const HEADER_LEN: u64 = 7 + 4;

/// Metadata fields every container must carry with a non-empty value.
pub const REQUIRED_FIELDS: &[&str] = &["name", "version", "target", "timestamp", "sha256"];

/// Read size used while hashing the payload.
const HASH_BLOCK: usize = 64 * 1024;

/// Outcome of the (reserved) signature check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureStatus {
    /// The container carries no `signature` field.
    Absent,
    /// A signature is present but verification is not implemented yet.
    Unverified,
}

/// A parsed, validated firmware container.
///
/// Holds the backing file open; [`FirmwarePackage::get_chunk`] seeks on the
/// retained handle, so a package is meant to have a single reader at a time
/// (the update job).
pub struct FirmwarePackage {
    metadata: BTreeMap<String, String>,
    sha256: String,
    signature: Option<String>,
    payload_offset: u64,
    payload_size: u64,
    file: RefCell<File>,
}

impl FirmwarePackage {
    /// Open and validate a container file.
    ///
    /// Fails fast on any malformation: wrong magic, truncated header,
    /// non-object or non-string metadata, missing required fields, an empty
    /// payload, or a payload digest that does not match `sha256`.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        debug!("Loading firmware package from {}", path.display());

        let mut file = File::open(path)?;
        let file_len = file.metadata()?.len();

        let mut magic = [0u8; 7];
        if file.read(&mut magic)? < magic.len() || &magic != MAGIC {
            return Err(Error::InvalidFormat(
                "missing FLASHUP magic signature".into(),
            ));
        }

        let meta_len = file
            .read_u32::<LittleEndian>()
            .map_err(|_| Error::InvalidFormat("truncated metadata length field".into()))?
            as u64;

        if HEADER_LEN + meta_len > file_len {
            return Err(Error::InvalidFormat(format!(
                "metadata length {meta_len} exceeds file size {file_len}"
            )));
        }

        let mut meta_buf = vec![0u8; meta_len as usize];
        file.read_exact(&mut meta_buf)
            .map_err(|_| Error::InvalidFormat("truncated metadata block".into()))?;

        let metadata = parse_metadata(&meta_buf)?;

        for field in REQUIRED_FIELDS {
            match metadata.get(*field) {
                Some(value) if !value.is_empty() => {}
                _ => return Err(Error::MissingField((*field).to_string())),
            }
        }

        let payload_offset = HEADER_LEN + meta_len;
        if payload_offset >= file_len {
            return Err(Error::EmptyPayload);
        }
        let payload_size = file_len - payload_offset;

        let sha256 = metadata["sha256"].clone();
        let signature = metadata.get("signature").cloned().filter(|s| !s.is_empty());

        let package = Self {
            metadata,
            sha256,
            signature,
            payload_offset,
            payload_size,
            file: RefCell::new(file),
        };
        package.verify_checksum()?;

        debug!(
            "Loaded firmware {} v{} ({} payload bytes)",
            package.metadata["name"], package.metadata["version"], payload_size
        );
        Ok(package)
    }

    /// Snapshot of the metadata mapping.
    pub fn metadata(&self) -> BTreeMap<String, String> {
        self.metadata.clone()
    }

    /// Payload size in bytes. Always > 0 for a constructed package.
    pub fn size(&self) -> u64 {
        self.payload_size
    }

    /// Hex SHA-256 digest recorded in the metadata.
    pub fn sha256(&self) -> &str {
        &self.sha256
    }

    /// Optional hex signature from the metadata.
    pub fn signature(&self) -> Option<&str> {
        self.signature.as_deref()
    }

    /// Read a contiguous byte range of the payload.
    ///
    /// The range is clamped to the payload: a `size` reaching past the end
    /// is truncated, and an `offset` at or past the end yields an empty
    /// vector rather than an error.
    pub fn get_chunk(&self, offset: u64, size: u64) -> Result<Vec<u8>> {
        if offset >= self.payload_size {
            return Ok(Vec::new());
        }
        let size = size.min(self.payload_size - offset);

        let mut file = self.file.borrow_mut();
        file.seek(SeekFrom::Start(self.payload_offset + offset))?;
        let mut chunk = vec![0u8; size as usize];
        file.read_exact(&mut chunk)?;
        Ok(chunk)
    }

    /// Number of chunks an upload with the given chunk size will take.
    pub fn chunk_count(&self, chunk_size: u64) -> u64 {
        if chunk_size == 0 {
            return 0;
        }
        self.payload_size.div_ceil(chunk_size)
    }

    /// Reserved signature verification hook.
    ///
    /// Cryptographic verification is not wired up yet; callers get an
    /// explicit status instead of a silent success.
    pub fn verify_signature(&self) -> SignatureStatus {
        match self.signature {
            Some(_) => SignatureStatus::Unverified,
            None => SignatureStatus::Absent,
        }
    }

    /// Hash the payload and compare against the recorded digest.
    fn verify_checksum(&self) -> Result<()> {
        let mut file = self.file.borrow_mut();
        file.seek(SeekFrom::Start(self.payload_offset))?;

        let mut hasher = Sha256::new();
        let mut remaining = self.payload_size;
        let mut buf = vec![0u8; HASH_BLOCK];
        while remaining > 0 {
            let want = remaining.min(buf.len() as u64) as usize;
            file.read_exact(&mut buf[..want])?;
            hasher.update(&buf[..want]);
            remaining -= want as u64;
        }

        let actual = hex::encode(hasher.finalize());
        if !actual.eq_ignore_ascii_case(&self.sha256) {
            return Err(Error::ChecksumMismatch {
                expected: self.sha256.clone(),
                actual,
            });
        }
        debug!("Payload checksum verified: {actual}");
        Ok(())
    }
}

impl std::fmt::Debug for FirmwarePackage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FirmwarePackage")
            .field("metadata", &self.metadata)
            .field("payload_offset", &self.payload_offset)
            .field("payload_size", &self.payload_size)
            .finish()
    }
}

/// Parse the metadata block: a JSON object whose values are all strings.
fn parse_metadata(buf: &[u8]) -> Result<BTreeMap<String, String>> {
    let value: serde_json::Value = serde_json::from_slice(buf)
        .map_err(|e| Error::InvalidMetadata(format!("not valid JSON: {e}")))?;

    let object = value
        .as_object()
        .ok_or_else(|| Error::InvalidMetadata("metadata is not a JSON object".into()))?;

    let mut metadata = BTreeMap::new();
    for (key, value) in object {
        let text = value.as_str().ok_or_else(|| {
            Error::InvalidMetadata(format!("value of \"{key}\" is not a string"))
        })?;
        metadata.insert(key.clone(), text.to_string());
    }
    Ok(metadata)
}

#[cfg(test)]
mod tests {
    use super::writer::encode_package;
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn sample_metadata() -> BTreeMap<String, String> {
        let mut meta = BTreeMap::new();
        meta.insert("name".to_string(), "blinky".to_string());
        meta.insert("version".to_string(), "1.2.0".to_string());
        meta.insert("target".to_string(), "esp32".to_string());
        meta.insert("timestamp".to_string(), "2024-05-01T12:00:00Z".to_string());
        meta
    }

    fn write_temp(bytes: &[u8]) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(bytes).unwrap();
        file.flush().unwrap();
        file
    }

    fn sample_package(payload: &[u8]) -> NamedTempFile {
        let bytes = encode_package(&sample_metadata(), payload).unwrap();
        write_temp(&bytes)
    }

    #[test]
    fn test_round_trip() {
        let payload: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        let file = sample_package(&payload);

        let package = FirmwarePackage::from_file(file.path()).unwrap();
        assert_eq!(package.size(), payload.len() as u64);

        let meta = package.metadata();
        assert_eq!(meta["name"], "blinky");
        assert_eq!(meta["version"], "1.2.0");
        assert_eq!(meta["target"], "esp32");
        assert!(!meta["sha256"].is_empty());

        let recovered = package.get_chunk(0, package.size()).unwrap();
        assert_eq!(recovered, payload);
    }

    #[test]
    fn test_empty_file_is_invalid_format() {
        let file = write_temp(&[]);
        assert!(matches!(
            FirmwarePackage::from_file(file.path()),
            Err(Error::InvalidFormat(_))
        ));
    }

    #[test]
    fn test_short_header_is_invalid_format() {
        let file = write_temp(b"FLASHUP\x05");
        assert!(matches!(
            FirmwarePackage::from_file(file.path()),
            Err(Error::InvalidFormat(_))
        ));
    }

    #[test]
    fn test_wrong_magic_is_invalid_format() {
        let file = write_temp(b"NOTFWUP\x00\x00\x00\x00payload");
        assert!(matches!(
            FirmwarePackage::from_file(file.path()),
            Err(Error::InvalidFormat(_))
        ));
    }

    #[test]
    fn test_zero_length_metadata_is_invalid_metadata() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(MAGIC);
        bytes.extend_from_slice(&0u32.to_le_bytes());
        bytes.extend_from_slice(b"payload");
        let file = write_temp(&bytes);
        assert!(matches!(
            FirmwarePackage::from_file(file.path()),
            Err(Error::InvalidMetadata(_))
        ));
    }

    #[test]
    fn test_metadata_length_past_eof_is_invalid_format() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(MAGIC);
        bytes.extend_from_slice(&1024u32.to_le_bytes());
        bytes.extend_from_slice(b"{}");
        let file = write_temp(&bytes);
        assert!(matches!(
            FirmwarePackage::from_file(file.path()),
            Err(Error::InvalidFormat(_))
        ));
    }

    #[test]
    fn test_non_string_value_is_invalid_metadata() {
        let meta = br#"{"name":"x","version":"1","target":"t","timestamp":"0","sha256":42}"#;
        let mut bytes = Vec::new();
        bytes.extend_from_slice(MAGIC);
        bytes.extend_from_slice(&(meta.len() as u32).to_le_bytes());
        bytes.extend_from_slice(meta);
        bytes.extend_from_slice(b"payload");
        let file = write_temp(&bytes);
        assert!(matches!(
            FirmwarePackage::from_file(file.path()),
            Err(Error::InvalidMetadata(_))
        ));
    }

    #[test]
    fn test_missing_field_names_the_field() {
        let meta = br#"{"name":"x","version":"1","target":"t","sha256":"00"}"#;
        let mut bytes = Vec::new();
        bytes.extend_from_slice(MAGIC);
        bytes.extend_from_slice(&(meta.len() as u32).to_le_bytes());
        bytes.extend_from_slice(meta);
        bytes.extend_from_slice(b"payload");
        let file = write_temp(&bytes);
        match FirmwarePackage::from_file(file.path()) {
            Err(Error::MissingField(field)) => assert_eq!(field, "timestamp"),
            other => panic!("expected MissingField, got {other:?}"),
        }
    }

    #[test]
    fn test_empty_payload() {
        let bytes = {
            // encode_package refuses an empty payload, so build by hand
            let meta = serde_json::json!({
                "name": "x", "version": "1", "target": "t",
                "timestamp": "0", "sha256": "00",
            });
            let meta = serde_json::to_vec(&meta).unwrap();
            let mut bytes = Vec::new();
            bytes.extend_from_slice(MAGIC);
            bytes.extend_from_slice(&(meta.len() as u32).to_le_bytes());
            bytes.extend_from_slice(&meta);
            bytes
        };
        let file = write_temp(&bytes);
        assert!(matches!(
            FirmwarePackage::from_file(file.path()),
            Err(Error::EmptyPayload)
        ));
    }

    #[test]
    fn test_checksum_mismatch() {
        let payload = b"firmware image bytes";
        let bytes = encode_package(&sample_metadata(), payload).unwrap();
        // Corrupt the last payload byte after the digest was embedded.
        let mut bytes = bytes;
        *bytes.last_mut().unwrap() ^= 0xFF;
        let file = write_temp(&bytes);
        assert!(matches!(
            FirmwarePackage::from_file(file.path()),
            Err(Error::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn test_digest_comparison_is_case_insensitive() {
        let payload = b"case insensitive digest";
        let mut meta = sample_metadata();
        let digest = {
            let mut hasher = Sha256::new();
            hasher.update(payload);
            hex::encode(hasher.finalize()).to_uppercase()
        };
        meta.insert("sha256".to_string(), digest);

        let meta_json = serde_json::to_vec(&meta).unwrap();
        let mut bytes = Vec::new();
        bytes.extend_from_slice(MAGIC);
        bytes.extend_from_slice(&(meta_json.len() as u32).to_le_bytes());
        bytes.extend_from_slice(&meta_json);
        bytes.extend_from_slice(payload);

        let file = write_temp(&bytes);
        assert!(FirmwarePackage::from_file(file.path()).is_ok());
    }

    #[test]
    fn test_get_chunk_boundaries() {
        let payload: Vec<u8> = (0..1000u32).map(|i| (i % 256) as u8).collect();
        let file = sample_package(&payload);
        let package = FirmwarePackage::from_file(file.path()).unwrap();
        let size = package.size();

        // Offset at the end: empty, not an error.
        assert!(package.get_chunk(size, 4096).unwrap().is_empty());
        assert!(package.get_chunk(size + 10, 1).unwrap().is_empty());

        // One byte before the end: exactly one byte.
        let tail = package.get_chunk(size - 1, 4096).unwrap();
        assert_eq!(tail.len(), 1);
        assert_eq!(tail[0], payload[payload.len() - 1]);

        // Interior range is served verbatim.
        let mid = package.get_chunk(100, 50).unwrap();
        assert_eq!(mid, &payload[100..150]);
    }

    #[test]
    fn test_chunk_count() {
        let payload = vec![0xA5u8; 10_000];
        let file = sample_package(&payload);
        let package = FirmwarePackage::from_file(file.path()).unwrap();

        assert_eq!(package.chunk_count(1024), 10);
        assert_eq!(package.chunk_count(10_000), 1);
        assert_eq!(package.chunk_count(10_001), 1);
        assert_eq!(package.chunk_count(0), 0);
    }

    #[test]
    fn test_signature_status() {
        let payload = b"signed payload";
        let file = sample_package(payload);
        let package = FirmwarePackage::from_file(file.path()).unwrap();
        assert_eq!(package.verify_signature(), SignatureStatus::Absent);

        let mut meta = sample_metadata();
        meta.insert("signature".to_string(), "deadbeef".to_string());
        let bytes = encode_package(&meta, payload).unwrap();
        let file = write_temp(&bytes);
        let package = FirmwarePackage::from_file(file.path()).unwrap();
        assert_eq!(package.verify_signature(), SignatureStatus::Unverified);
        assert_eq!(package.signature(), Some("deadbeef"));
    }
}
