//! `changeset_migration` vote payload
//!
//! Layout (all integers little endian):
//! `version u16 | height u64 | chunk_idx u64 | total_chunks u64 |
//!  has_prev u8 | prev_height u64 | payload_len u32 | payload`

use crate::constants::changeset::CHUNK_PAYLOAD_VERSION;
use crate::errors::ChangesetError;

const HEADER_LEN: usize = 2 + 8 + 8 + 8 + 1 + 8 + 4;

/// One slice of a height's changeset, as voted on by the destination chain
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangesetChunk {
    pub height: u64,
    pub chunk_idx: u64,
    pub total_chunks: u64,
    pub payload: Vec<u8>,
    /// Most recent earlier height that produced changeset data
    pub previous_height_with_data: Option<u64>,
}

impl ChangesetChunk {
    /// Empty single-chunk marker emitted for a window end height without data
    pub fn sentinel(height: u64, previous_height_with_data: Option<u64>) -> Self {
        Self {
            height,
            chunk_idx: 0,
            total_chunks: 1,
            payload: Vec::new(),
            previous_height_with_data,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_LEN + self.payload.len());
        out.extend_from_slice(&CHUNK_PAYLOAD_VERSION.to_le_bytes());
        out.extend_from_slice(&self.height.to_le_bytes());
        out.extend_from_slice(&self.chunk_idx.to_le_bytes());
        out.extend_from_slice(&self.total_chunks.to_le_bytes());
        match self.previous_height_with_data {
            Some(prev) => {
                out.push(1);
                out.extend_from_slice(&prev.to_le_bytes());
            }
            None => {
                out.push(0);
                out.extend_from_slice(&0u64.to_le_bytes());
            }
        }
        out.extend_from_slice(&(self.payload.len() as u32).to_le_bytes());
        out.extend_from_slice(&self.payload);
        out
    }

    pub fn decode(data: &[u8]) -> Result<Self, ChangesetError> {
        if data.len() < HEADER_LEN {
            return Err(ChangesetError::decode(format!(
                "changeset chunk too short: {} bytes",
                data.len()
            )));
        }

        let version = u16::from_le_bytes([data[0], data[1]]);
        if version != CHUNK_PAYLOAD_VERSION {
            return Err(ChangesetError::decode(format!(
                "unsupported changeset chunk version {}",
                version
            )));
        }

        let height = read_u64(data, 2);
        let chunk_idx = read_u64(data, 10);
        let total_chunks = read_u64(data, 18);
        let previous_height_with_data = match data[26] {
            0 => None,
            1 => Some(read_u64(data, 27)),
            other => {
                return Err(ChangesetError::decode(format!(
                    "invalid previous height marker {}",
                    other
                )))
            }
        };
        let len = u32::from_le_bytes([data[35], data[36], data[37], data[38]]) as usize;
        let payload = &data[HEADER_LEN..];
        if payload.len() != len {
            return Err(ChangesetError::decode(format!(
                "declared payload of {} bytes, found {}",
                len,
                payload.len()
            )));
        }

        if total_chunks == 0 || chunk_idx >= total_chunks {
            return Err(ChangesetError::decode(format!(
                "chunk index {} outside {} chunks",
                chunk_idx, total_chunks
            )));
        }

        Ok(Self {
            height,
            chunk_idx,
            total_chunks,
            payload: payload.to_vec(),
            previous_height_with_data,
        })
    }
}

fn read_u64(data: &[u8], offset: usize) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&data[offset..offset + 8]);
    u64::from_le_bytes(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_hand_built_payload() {
        let mut data = Vec::new();
        data.extend_from_slice(&0u16.to_le_bytes());
        data.extend_from_slice(&12u64.to_le_bytes());
        data.extend_from_slice(&1u64.to_le_bytes());
        data.extend_from_slice(&3u64.to_le_bytes());
        data.push(1);
        data.extend_from_slice(&9u64.to_le_bytes());
        data.extend_from_slice(&2u32.to_le_bytes());
        data.extend_from_slice(b"ab");

        let chunk = ChangesetChunk::decode(&data).unwrap();
        assert_eq!(chunk.height, 12);
        assert_eq!(chunk.chunk_idx, 1);
        assert_eq!(chunk.total_chunks, 3);
        assert_eq!(chunk.previous_height_with_data, Some(9));
        assert_eq!(chunk.payload, b"ab");
        assert_eq!(chunk.encode(), data);
    }

    #[test]
    fn sentinel_has_one_empty_chunk() {
        let chunk = ChangesetChunk::decode(&ChangesetChunk::sentinel(20, None).encode()).unwrap();
        assert_eq!(chunk.total_chunks, 1);
        assert_eq!(chunk.chunk_idx, 0);
        assert!(chunk.payload.is_empty());
        assert_eq!(chunk.previous_height_with_data, None);
    }

    #[test]
    fn rejects_bad_payloads() {
        let good = ChangesetChunk {
            height: 4,
            chunk_idx: 0,
            total_chunks: 1,
            payload: vec![1, 2, 3],
            previous_height_with_data: None,
        }
        .encode();

        assert!(ChangesetChunk::decode(&good[..10]).is_err());
        assert!(ChangesetChunk::decode(&good[..good.len() - 1]).is_err());

        let mut wrong_version = good.clone();
        wrong_version[0] = 7;
        assert!(ChangesetChunk::decode(&wrong_version).is_err());

        let mut bad_index = good;
        bad_index[10] = 5;
        assert!(ChangesetChunk::decode(&bad_index).is_err());
    }
}
