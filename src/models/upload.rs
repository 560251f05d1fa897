//! Represents an in-progress chunked upload.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One chunked transfer that has been started but not yet finalized.
///
/// Chunk payloads live on disk under the upload's chunk area; this record only
/// tracks which indices have been durably written.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Upload {
    /// Opaque identifier handed to the client as `file_id`.
    pub upload_id: String,

    /// Capability token required for every chunk write and for finalize.
    pub upload_secret: String,

    /// Client-supplied filename, reused in the download header.
    pub original_name: String,

    /// Size the client declared when starting the upload.
    pub declared_size: u64,

    /// Number of chunks the declared size splits into (never zero).
    pub expected_chunk_count: u32,

    /// One flag per chunk index, `true` once that chunk is on disk.
    pub chunk_status: Vec<bool>,

    /// Download quota carried forward to the retrieval entry.
    pub max_downloads: u32,

    /// Retention carried forward to the retrieval entry.
    pub max_retention_hours: u32,

    pub created_at: DateTime<Utc>,
}

impl Upload {
    /// Ceiling division of `declared_size` by `chunk_size`, with a floor of one
    /// chunk so that empty files still have something to finalize.
    pub fn chunk_count_for(declared_size: u64, chunk_size: u64) -> u32 {
        let chunks = declared_size.div_ceil(chunk_size.max(1)).max(1);
        u32::try_from(chunks).unwrap_or(u32::MAX)
    }

    pub fn is_received(&self, index: u32) -> bool {
        self.chunk_status
            .get(index as usize)
            .copied()
            .unwrap_or(false)
    }

    /// Indices that have not been written yet.
    pub fn missing_chunks(&self) -> Vec<u32> {
        self.chunk_status
            .iter()
            .enumerate()
            .filter(|(_, received)| !**received)
            .map(|(index, _)| index as u32)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MIB: u64 = 1024 * 1024;

    #[test]
    fn test_chunk_count_rounds_up() {
        assert_eq!(Upload::chunk_count_for(0, 4 * MIB), 1);
        assert_eq!(Upload::chunk_count_for(1, 4 * MIB), 1);
        assert_eq!(Upload::chunk_count_for(4 * MIB, 4 * MIB), 1);
        assert_eq!(Upload::chunk_count_for(4 * MIB + 1, 4 * MIB), 2);
        assert_eq!(Upload::chunk_count_for(10 * MIB, 4 * MIB), 3);
    }

    #[test]
    fn test_missing_chunks() {
        let upload = Upload {
            upload_id: "id".into(),
            upload_secret: "secret".into(),
            original_name: "a.bin".into(),
            declared_size: 12,
            expected_chunk_count: 3,
            chunk_status: vec![true, false, false],
            max_downloads: 1,
            max_retention_hours: 1,
            created_at: Utc::now(),
        };

        assert!(upload.is_received(0));
        assert!(!upload.is_received(2));
        assert!(!upload.is_received(7));
        assert_eq!(upload.missing_chunks(), vec![1, 2]);
    }
}
