use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};

use crate::constants::snapshot::{CHUNKS_DIR, HEADER_FILE};

pub type Hash = [u8; 32];

pub fn sha256(bytes: &[u8]) -> Hash {
    Sha256::digest(bytes).into()
}

/// Header describing one chunked snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub height: u64,
    pub format: u32,
    pub chunk_count: u32,
    #[serde(with = "hex_hash_list")]
    pub chunk_hashes: Vec<Hash>,
    /// sha256 of the uncompressed, sanitized dump
    #[serde(with = "hex_hash")]
    pub snapshot_hash: Hash,
    /// Total compressed size in bytes
    pub snapshot_size: u64,
}

impl Snapshot {
    /// Structural checks that need no peer or disk access
    pub fn check_shape(&self) -> Result<(), String> {
        if self.height == 0 {
            return Err("height must be positive".to_string());
        }
        if self.chunk_count == 0 {
            return Err("chunk count must be positive".to_string());
        }
        if self.chunk_hashes.len() != self.chunk_count as usize {
            return Err(format!(
                "chunk count {} does not match {} chunk hashes",
                self.chunk_count,
                self.chunk_hashes.len()
            ));
        }
        Ok(())
    }

    /// Whether a provider's view of the same height agrees with this one
    pub fn matches(&self, other: &Snapshot) -> bool {
        self.height == other.height
            && self.snapshot_size == other.snapshot_size
            && self.chunk_count == other.chunk_count
            && self.snapshot_hash == other.snapshot_hash
    }
}

pub fn height_dir(root: &Path, height: u64) -> PathBuf {
    root.join(format!("block-{}", height))
}

pub fn format_dir(root: &Path, height: u64, format: u32) -> PathBuf {
    height_dir(root, height).join(format!("format-{}", format))
}

pub fn header_path(root: &Path, height: u64, format: u32) -> PathBuf {
    format_dir(root, height, format).join(HEADER_FILE)
}

pub fn chunks_dir(root: &Path, height: u64, format: u32) -> PathBuf {
    format_dir(root, height, format).join(CHUNKS_DIR)
}

pub fn chunk_file_name(index: u32) -> String {
    format!("chunk-{}.sql.gz", index)
}

pub fn chunk_path(root: &Path, height: u64, format: u32, index: u32) -> PathBuf {
    chunks_dir(root, height, format).join(chunk_file_name(index))
}

/// Parses `block-<height>` directory names
pub fn parse_height_dir(name: &str) -> Option<u64> {
    name.strip_prefix("block-")?.parse().ok()
}

pub(crate) mod hex_hash {
    use super::Hash;
    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(hash: &Hash, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(hash))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Hash, D::Error> {
        let s = String::deserialize(deserializer)?;
        decode(&s).map_err(D::Error::custom)
    }

    pub(super) fn decode(s: &str) -> Result<Hash, String> {
        let bytes = hex::decode(s).map_err(|e| e.to_string())?;
        Hash::try_from(bytes.as_slice())
            .map_err(|_| format!("expected 32-byte hash, got {} bytes", bytes.len()))
    }
}

mod hex_hash_list {
    use super::Hash;
    use serde::{de::Error, ser::SerializeSeq, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(hashes: &[Hash], serializer: S) -> Result<S::Ok, S::Error> {
        let mut seq = serializer.serialize_seq(Some(hashes.len()))?;
        for hash in hashes {
            seq.serialize_element(&hex::encode(hash))?;
        }
        seq.end()
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<Hash>, D::Error> {
        let strings = Vec::<String>::deserialize(deserializer)?;
        strings
            .iter()
            .map(|s| super::hex_hash::decode(s).map_err(D::Error::custom))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header() -> Snapshot {
        Snapshot {
            height: 10,
            format: 0,
            chunk_count: 2,
            chunk_hashes: vec![sha256(b"a"), sha256(b"b")],
            snapshot_hash: sha256(b"dump"),
            snapshot_size: 42,
        }
    }

    #[test]
    fn header_json_uses_hex_hashes() {
        let json = serde_json::to_value(header()).unwrap();
        assert_eq!(
            json["snapshot_hash"],
            serde_json::Value::String(hex::encode(sha256(b"dump")))
        );
        assert_eq!(json["chunk_hashes"].as_array().unwrap().len(), 2);

        let back: Snapshot = serde_json::from_value(json).unwrap();
        assert_eq!(back, header());
    }

    #[test]
    fn short_hashes_are_rejected() {
        let json = serde_json::json!({
            "height": 1, "format": 0, "chunk_count": 1,
            "chunk_hashes": ["abcd"], "snapshot_hash": hex::encode([0u8; 32]),
            "snapshot_size": 1
        });
        assert!(serde_json::from_value::<Snapshot>(json).is_err());
    }

    #[test]
    fn shape_check_catches_inconsistent_counts() {
        let mut snapshot = header();
        assert!(snapshot.check_shape().is_ok());
        snapshot.chunk_count = 3;
        assert!(snapshot.check_shape().is_err());
        snapshot.chunk_count = 0;
        snapshot.chunk_hashes.clear();
        assert!(snapshot.check_shape().is_err());
    }

    #[test]
    fn layout_paths() {
        let root = Path::new("/snaps");
        assert_eq!(
            chunk_path(root, 7, 0, 3),
            PathBuf::from("/snaps/block-7/format-0/chunks/chunk-3.sql.gz")
        );
        assert_eq!(parse_height_dir("block-42"), Some(42));
        assert_eq!(parse_height_dir("block-x"), None);
        assert_eq!(parse_height_dir("format-0"), None);
    }
}
