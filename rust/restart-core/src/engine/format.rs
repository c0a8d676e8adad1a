// rust/restart-core/src/engine/format.rs

//! On-disk layout of one dataset in a local container.
//!
//! ```text
//! +--------------------------+
//! | Header Length (4 bytes)  |  <- u32 little-endian
//! +--------------------------+
//! | Header (bincode)         |  <- DatasetHeader
//! +--------------------------+
//! | Header Checksum (8 bytes)|  <- XXHash64 of the header bytes, little-endian
//! +--------------------------+
//! | Element Data             |  <- row-major, native byte order
//! +--------------------------+
//! ```
//!
//! The element data has a fixed size known from the header, so every rank
//! can address its hyperslab without coordination once the file exists.

use std::hash::Hasher;
use std::io::Read;
use std::path::Path;

use serde::{Deserialize, Serialize};
use twox_hash::XxHash64;

use crate::element::ElementType;
use crate::error::{RestartError, Result};

/// Metadata stored in front of every dataset's element data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetHeader {
    /// Magic bytes identifying a dataset file ("RSTD")
    pub magic: [u8; 4],
    /// Format version number
    pub version: u32,
    /// Dataset name as given by the writer
    pub name: String,
    /// Element type tag
    pub element_type: ElementType,
    /// Global shape, one extent per dimension
    pub shape: Vec<u64>,
}

impl DatasetHeader {
    /// Magic bytes for dataset files
    pub const MAGIC: [u8; 4] = *b"RSTD";

    /// Current format version
    pub const VERSION: u32 = 1;

    pub fn new(name: &str, element_type: ElementType, shape: &[u64]) -> Self {
        Self {
            magic: Self::MAGIC,
            version: Self::VERSION,
            name: name.to_string(),
            element_type,
            shape: shape.to_vec(),
        }
    }

    /// Size of the element data in bytes.
    pub fn data_len(&self) -> Result<u64> {
        self.shape
            .iter()
            .try_fold(self.element_type.size() as u64, |acc, &n| acc.checked_mul(n))
            .ok_or_else(|| {
                RestartError::config(format!("dataset '{}' is too large to address", self.name))
            })
    }

    /// Serializes the header prefix: length, header and checksum.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let header_bytes = bincode::serialize(self)
            .map_err(|e| RestartError::serialization(format!("failed to serialize header: {e}")))?;
        let header_len = u32::try_from(header_bytes.len())
            .map_err(|_| RestartError::serialization("dataset header exceeds 4 GiB"))?;

        let mut prefix = Vec::with_capacity(4 + header_bytes.len() + 8);
        prefix.extend_from_slice(&header_len.to_le_bytes());
        prefix.extend_from_slice(&header_bytes);
        prefix.extend_from_slice(&checksum(&header_bytes).to_le_bytes());
        Ok(prefix)
    }

    /// Reads and verifies a header prefix, returning the header and the byte
    /// offset at which element data begins.
    pub fn decode(reader: &mut impl Read, path: &Path) -> Result<(Self, u64)> {
        let mut len_bytes = [0u8; 4];
        reader
            .read_exact(&mut len_bytes)
            .map_err(|e| RestartError::resource_with_source(path, "failed to read header length", e))?;
        let header_len = u32::from_le_bytes(len_bytes) as usize;

        let mut header_bytes = vec![0u8; header_len];
        reader
            .read_exact(&mut header_bytes)
            .map_err(|e| RestartError::resource_with_source(path, "failed to read header", e))?;

        let mut sum_bytes = [0u8; 8];
        reader
            .read_exact(&mut sum_bytes)
            .map_err(|e| RestartError::resource_with_source(path, "failed to read header checksum", e))?;

        let expected = u64::from_le_bytes(sum_bytes);
        let computed = checksum(&header_bytes);
        if computed != expected {
            return Err(RestartError::format(
                path,
                format!("header checksum mismatch: expected {expected}, got {computed}"),
            ));
        }

        let header: DatasetHeader = bincode::deserialize(&header_bytes)
            .map_err(|e| RestartError::format(path, format!("failed to deserialize header: {e}")))?;

        if !header.validate_magic() {
            return Err(RestartError::format(
                path,
                format!(
                    "invalid magic bytes: expected {:?}, got {:?}",
                    Self::MAGIC,
                    header.magic
                ),
            ));
        }
        if !header.validate_version() {
            return Err(RestartError::format(
                path,
                format!(
                    "unsupported version: expected {}, got {}",
                    Self::VERSION,
                    header.version
                ),
            ));
        }

        Ok((header, (4 + header_len + 8) as u64))
    }

    /// Validates the header magic bytes.
    pub fn validate_magic(&self) -> bool {
        self.magic == Self::MAGIC
    }

    /// Validates the header version.
    pub fn validate_version(&self) -> bool {
        self.version == Self::VERSION
    }
}

fn checksum(data: &[u8]) -> u64 {
    let mut hasher = XxHash64::with_seed(0);
    hasher.write(data);
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn header() -> DatasetHeader {
        DatasetHeader::new("shared dataset", ElementType::Int(4), &[1024, 1024])
    }

    #[test]
    fn test_header_new() {
        let header = header();
        assert_eq!(header.magic, DatasetHeader::MAGIC);
        assert_eq!(header.version, DatasetHeader::VERSION);
        assert_eq!(header.shape, vec![1024, 1024]);
        assert_eq!(header.data_len().unwrap(), 4 * 1024 * 1024);
    }

    #[test]
    fn test_encode_decode() {
        let header = header();
        let prefix = header.encode().unwrap();

        let (decoded, data_offset) =
            DatasetHeader::decode(&mut Cursor::new(&prefix), Path::new("t")).unwrap();

        assert_eq!(decoded, header);
        assert_eq!(data_offset, prefix.len() as u64);
    }

    #[test]
    fn test_decode_detects_corruption() {
        let mut prefix = header().encode().unwrap();
        prefix[10] ^= 0xff;

        let err = DatasetHeader::decode(&mut Cursor::new(&prefix), Path::new("t")).unwrap_err();
        assert!(err.to_string().contains("checksum mismatch"));
    }

    #[test]
    fn test_decode_rejects_bad_magic() {
        let mut header = header();
        header.magic = *b"XXXX";
        let prefix = header.encode().unwrap();

        let err = DatasetHeader::decode(&mut Cursor::new(&prefix), Path::new("t")).unwrap_err();
        assert!(err.to_string().contains("invalid magic"));
    }

    #[test]
    fn test_decode_rejects_future_version() {
        let mut header = header();
        header.version = 99;
        let prefix = header.encode().unwrap();

        let err = DatasetHeader::decode(&mut Cursor::new(&prefix), Path::new("t")).unwrap_err();
        assert!(err.to_string().contains("unsupported version"));
    }

    #[test]
    fn test_decode_truncated() {
        let prefix = header().encode().unwrap();
        let truncated = &prefix[..prefix.len() - 3];
        assert!(DatasetHeader::decode(&mut Cursor::new(truncated), Path::new("t")).is_err());
    }

    #[test]
    fn test_data_len_overflow() {
        let header = DatasetHeader::new("huge", ElementType::Float(8), &[u64::MAX, 2]);
        assert!(header.data_len().is_err());
    }
}
