//! Represents an assembled file on disk.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// A merged upload, independent of any retrieval code pointing at it.
///
/// The artifact id reuses the originating upload id. An artifact stays on disk
/// for as long as at least one retrieval entry references it.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Artifact {
    pub artifact_id: String,

    /// Original filename of the upload.
    pub filename: String,

    /// Size in bytes of the merged file.
    pub byte_size: u64,

    /// MD5 of the merged bytes, served as the `ETag`.
    pub etag: String,

    /// When the merge completed.
    pub created_at: DateTime<Utc>,

    /// Location of the merged file.
    pub path: PathBuf,
}
