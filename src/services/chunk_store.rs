//! src/services/chunk_store.rs
//!
//! ChunkStore: durable on-disk storage for chunk payloads and merged
//! artifacts. Chunk areas live at `base_path/parts/{upload_id}/{index}.chk`,
//! merged files at `base_path/results/{upload_id}.rst`. Every write goes to a
//! temporary file, is fsynced, and is then renamed into place so readers never
//! observe a half-written payload.

use crate::errors::{ShareError, ShareResult};
use md5::Context;
use std::{
    io::{self, ErrorKind},
    path::{Path, PathBuf},
};
use tokio::{
    fs::{self, File},
    io::AsyncWriteExt,
};
use tracing::debug;
use uuid::Uuid;

const PARTS_DIR: &str = "parts";
const RESULTS_DIR: &str = "results";
const CHUNK_EXT: &str = "chk";
const ARTIFACT_EXT: &str = "rst";
const TMP_PREFIX: &str = ".tmp-";

/// Outcome of assembling a chunk area into a single file.
#[derive(Debug, Clone)]
pub struct MergedFile {
    pub path: PathBuf,
    pub byte_size: u64,
    pub etag: String,
}

#[derive(Debug, Clone)]
pub struct ChunkStore {
    /// Base directory holding `parts/` and `results/`.
    base_path: PathBuf,
}

impl ChunkStore {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
        }
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// Create the `parts/` and `results/` roots.
    pub async fn init(&self) -> ShareResult<()> {
        fs::create_dir_all(self.parts_root()).await?;
        fs::create_dir_all(self.results_root()).await?;
        Ok(())
    }

    fn parts_root(&self) -> PathBuf {
        self.base_path.join(PARTS_DIR)
    }

    fn results_root(&self) -> PathBuf {
        self.base_path.join(RESULTS_DIR)
    }

    /// Upload ids end up in paths, so only accept the characters we generate.
    fn ensure_id_safe(id: &str) -> ShareResult<()> {
        if id.is_empty()
            || id.len() > 64
            || !id.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-')
        {
            return Err(ShareError::NotFound(format!("upload `{}`", id)));
        }
        Ok(())
    }

    pub fn area_path(&self, upload_id: &str) -> PathBuf {
        self.parts_root().join(upload_id)
    }

    pub fn chunk_path(&self, upload_id: &str, index: u32) -> PathBuf {
        self.area_path(upload_id)
            .join(format!("{}.{}", index, CHUNK_EXT))
    }

    pub fn artifact_path(&self, artifact_id: &str) -> PathBuf {
        self.results_root()
            .join(format!("{}.{}", artifact_id, ARTIFACT_EXT))
    }

    /// Allocate the chunk area for a new upload. Idempotent.
    pub async fn create_area(&self, upload_id: &str) -> ShareResult<()> {
        Self::ensure_id_safe(upload_id)?;
        fs::create_dir_all(self.area_path(upload_id)).await?;
        Ok(())
    }

    /// Durably write one chunk payload, replacing any previous bytes for the
    /// same index. Returns only after the data has been fsynced and renamed.
    pub async fn write_chunk(&self, upload_id: &str, index: u32, data: &[u8]) -> ShareResult<()> {
        Self::ensure_id_safe(upload_id)?;
        let area = self.area_path(upload_id);
        fs::create_dir_all(&area).await?;

        let final_path = self.chunk_path(upload_id, index);
        let tmp_path = area.join(format!("{}{}", TMP_PREFIX, Uuid::new_v4()));
        if let Err(err) = write_synced(&tmp_path, data).await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(ShareError::Io(err));
        }
        if let Err(err) = fs::rename(&tmp_path, &final_path).await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(ShareError::Io(err));
        }
        sync_dir(&area).await?;

        debug!(
            upload_id = %upload_id,
            index,
            bytes = data.len(),
            "chunk persisted"
        );
        Ok(())
    }

    /// Concatenate chunks `0..chunk_count` in index order into the artifact
    /// file for `upload_id`.
    ///
    /// - Streams into a temporary file under `results/`
    /// - Computes size and MD5 while copying
    /// - Fsyncs, then renames into the final location
    ///
    /// A missing chunk file aborts the merge and leaves no artifact behind.
    pub async fn merge_chunks(&self, upload_id: &str, chunk_count: u32) -> ShareResult<MergedFile> {
        Self::ensure_id_safe(upload_id)?;
        let results = self.results_root();
        fs::create_dir_all(&results).await?;

        let tmp_path = results.join(format!("{}{}", TMP_PREFIX, Uuid::new_v4()));
        let merged = match self.concat_into(&tmp_path, upload_id, chunk_count).await {
            Ok(merged) => merged,
            Err(err) => {
                let _ = fs::remove_file(&tmp_path).await;
                return Err(err);
            }
        };

        let final_path = self.artifact_path(upload_id);
        if let Err(err) = fs::rename(&tmp_path, &final_path).await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(ShareError::Io(err));
        }
        sync_dir(&results).await?;

        debug!(
            upload_id = %upload_id,
            chunks = chunk_count,
            bytes = merged.0,
            "chunks merged"
        );
        Ok(MergedFile {
            path: final_path,
            byte_size: merged.0,
            etag: merged.1,
        })
    }

    async fn concat_into(
        &self,
        tmp_path: &Path,
        upload_id: &str,
        chunk_count: u32,
    ) -> ShareResult<(u64, String)> {
        let mut out = File::create(tmp_path).await?;
        let mut digest = Context::new();
        let mut byte_size: u64 = 0;

        for index in 0..chunk_count {
            let chunk_path = self.chunk_path(upload_id, index);
            let chunk = fs::read(&chunk_path).await.map_err(|err| {
                if err.kind() == ErrorKind::NotFound {
                    ShareError::NotFound(format!("chunk {} of upload `{}`", index, upload_id))
                } else {
                    ShareError::Io(err)
                }
            })?;
            digest.consume(&chunk);
            out.write_all(&chunk).await?;
            byte_size += chunk.len() as u64;
        }

        out.flush().await?;
        out.sync_all().await?;
        Ok((byte_size, format!("{:x}", digest.compute())))
    }

    /// Open a merged artifact for streaming out.
    pub async fn open_artifact(&self, path: &Path) -> ShareResult<File> {
        File::open(path).await.map_err(|err| {
            if err.kind() == ErrorKind::NotFound {
                ShareError::NotFound(format!("artifact file {}", display_name(path)))
            } else {
                ShareError::Io(err)
            }
        })
    }

    /// Remove a chunk area and everything in it. Missing areas are fine.
    pub async fn remove_area(&self, upload_id: &str) -> io::Result<()> {
        let area = self.area_path(upload_id);
        match fs::remove_dir_all(&area).await {
            Ok(()) => {
                debug!("removed chunk area {}", area.display());
                Ok(())
            }
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err),
        }
    }

    /// Remove a merged artifact file. Missing files are fine.
    pub async fn remove_file(&self, path: &Path) -> io::Result<()> {
        match fs::remove_file(path).await {
            Ok(()) => {
                debug!("removed physical file {}", path.display());
                Ok(())
            }
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err),
        }
    }

    /// Names of every chunk area currently on disk.
    pub async fn list_areas(&self) -> io::Result<Vec<String>> {
        let mut areas = Vec::new();
        let mut entries = match fs::read_dir(self.parts_root()).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(areas),
            Err(err) => return Err(err),
        };
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_dir() {
                areas.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        Ok(areas)
    }

    /// Artifact ids of every finished `results/{id}.rst` file on disk.
    /// In-flight temporary merge files are skipped.
    pub async fn list_artifact_files(&self) -> io::Result<Vec<String>> {
        let mut ids = Vec::new();
        let mut entries = match fs::read_dir(self.results_root()).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(ids),
            Err(err) => return Err(err),
        };
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with(TMP_PREFIX) {
                continue;
            }
            if let Some(id) = name.strip_suffix(&format!(".{}", ARTIFACT_EXT)) {
                ids.push(id.to_string());
            }
        }
        Ok(ids)
    }
}

async fn write_synced(path: &Path, data: &[u8]) -> io::Result<()> {
    let mut file = File::create(path).await?;
    file.write_all(data).await?;
    file.flush().await?;
    file.sync_all().await
}

/// Fsync a directory so a rename inside it survives power loss.
pub(crate) async fn sync_dir(dir: &Path) -> io::Result<()> {
    File::open(dir).await?.sync_all().await
}

fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default()
}
