//! Upload tracker.
//!
//! Holds every in-progress upload and its chunk bitmap. Each upload gets its
//! own slot with an async I/O lock, so chunk writes for different uploads run
//! in parallel while writes and finalize for the same upload are serialized.

use crate::{
    errors::{ShareError, ShareResult},
    models::{artifact::Artifact, retrieval::RetentionPolicy, upload::Upload},
    services::chunk_store::ChunkStore,
};
use base64::{Engine as _, engine::general_purpose};
use chrono::Utc;
use std::{
    collections::{BTreeMap, HashMap, HashSet},
    sync::{Arc, Mutex as StdMutex, MutexGuard},
};
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Parameters for `UploadTracker::start`.
#[derive(Debug, Clone)]
pub struct NewUpload {
    pub filename: String,
    pub declared_size: u64,
    pub policy: RetentionPolicy,
}

/// Result of a chunk write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkOutcome {
    Stored,
    AlreadyReceived,
}

impl ChunkOutcome {
    pub fn message(self) -> &'static str {
        match self {
            ChunkOutcome::Stored => "chunk uploaded",
            ChunkOutcome::AlreadyReceived => "chunk already uploaded",
        }
    }
}

struct UploadSlot {
    /// Held across chunk I/O and the whole finalize sequence.
    io: Arc<Mutex<()>>,

    /// Record and consumed flag; never held across an await.
    state: StdMutex<SlotState>,
}

struct SlotState {
    upload: Upload,
    finished: bool,
}

impl UploadSlot {
    fn new(upload: Upload) -> Self {
        Self {
            io: Arc::new(Mutex::new(())),
            state: StdMutex::new(SlotState {
                upload,
                finished: false,
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, SlotState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// An upload whose finalize lock is held. While this value lives no chunk
/// write or second finalize for the same upload can proceed.
pub struct FinishingUpload {
    slot: Arc<UploadSlot>,
    upload: Upload,
    _guard: OwnedMutexGuard<()>,
}

impl FinishingUpload {
    pub fn upload(&self) -> &Upload {
        &self.upload
    }

    /// Assemble the chunk area into the artifact file.
    pub async fn merge(&self, store: &ChunkStore) -> ShareResult<Artifact> {
        let merged = store
            .merge_chunks(&self.upload.upload_id, self.upload.expected_chunk_count)
            .await?;
        Ok(Artifact {
            artifact_id: self.upload.upload_id.clone(),
            filename: self.upload.original_name.clone(),
            byte_size: merged.byte_size,
            etag: merged.etag,
            created_at: Utc::now(),
            path: merged.path,
        })
    }
}

pub struct UploadTracker {
    store: Arc<ChunkStore>,
    uploads: RwLock<HashMap<String, Arc<UploadSlot>>>,
    chunk_size: u64,
    max_file_size: u64,
}

impl UploadTracker {
    pub fn new(store: Arc<ChunkStore>, chunk_size: u64, max_file_size: u64) -> Self {
        Self {
            store,
            uploads: RwLock::new(HashMap::new()),
            chunk_size,
            max_file_size,
        }
    }

    /// Register a new upload and allocate its chunk area.
    ///
    /// Rejects sizes over the configured maximum before anything is created.
    pub async fn start(&self, request: NewUpload) -> ShareResult<Upload> {
        if request.declared_size > self.max_file_size {
            return Err(ShareError::SizeLimitExceeded {
                size: request.declared_size,
                max: self.max_file_size,
            });
        }

        let expected_chunk_count = Upload::chunk_count_for(request.declared_size, self.chunk_size);
        let upload = Upload {
            upload_id: Uuid::new_v4().simple().to_string(),
            upload_secret: generate_secret(),
            original_name: request.filename,
            declared_size: request.declared_size,
            expected_chunk_count,
            chunk_status: vec![false; expected_chunk_count as usize],
            max_downloads: request.policy.max_downloads,
            max_retention_hours: request.policy.max_retention_hours,
            created_at: Utc::now(),
        };

        // Record first, area second: an area on disk always has a record, so
        // the orphan scan can never race a fresh upload.
        self.uploads.write().await.insert(
            upload.upload_id.clone(),
            Arc::new(UploadSlot::new(upload.clone())),
        );
        if let Err(err) = self.store.create_area(&upload.upload_id).await {
            self.uploads.write().await.remove(&upload.upload_id);
            return Err(err);
        }

        info!(
            upload_id = %upload.upload_id,
            filename = %upload.original_name,
            size = upload.declared_size,
            chunks = expected_chunk_count,
            "upload started"
        );
        Ok(upload)
    }

    async fn slot(&self, upload_id: &str) -> ShareResult<Arc<UploadSlot>> {
        self.uploads
            .read()
            .await
            .get(upload_id)
            .cloned()
            .ok_or_else(|| ShareError::NotFound(format!("upload `{}`", upload_id)))
    }

    /// Store one chunk.
    ///
    /// A chunk that is already marked received is left untouched and reported
    /// as `AlreadyReceived`. Otherwise the bytes are made durable first and
    /// the flag flipped afterwards.
    pub async fn write_chunk(
        &self,
        upload_id: &str,
        chunk_index: i64,
        secret: &str,
        payload: &[u8],
    ) -> ShareResult<ChunkOutcome> {
        let slot = self.slot(upload_id).await?;
        let _io = slot.io.lock().await;

        let index = {
            let state = slot.state();
            if state.finished {
                return Err(ShareError::NotFound(format!("upload `{}`", upload_id)));
            }
            if !secrets_match(&state.upload.upload_secret, secret) {
                return Err(ShareError::Forbidden("upload token mismatch".into()));
            }
            let count = state.upload.expected_chunk_count;
            let index = match u32::try_from(chunk_index) {
                Ok(index) if index < count => index,
                _ => {
                    return Err(ShareError::IndexOutOfRange {
                        index: chunk_index,
                        count,
                    });
                }
            };
            if state.upload.is_received(index) {
                debug!(upload_id = %upload_id, index, "duplicate chunk ignored");
                return Ok(ChunkOutcome::AlreadyReceived);
            }
            index
        };

        self.store.write_chunk(upload_id, index, payload).await?;
        slot.state().upload.chunk_status[index as usize] = true;
        Ok(ChunkOutcome::Stored)
    }

    /// Take the finalize lock for an upload after checking its secret and that
    /// every chunk has arrived.
    ///
    /// Concurrent callers queue on the same lock; whoever comes second finds
    /// the upload consumed and gets `NotFound`.
    pub async fn begin_finish(&self, upload_id: &str, secret: &str) -> ShareResult<FinishingUpload> {
        let slot = self.slot(upload_id).await?;
        let guard = slot.io.clone().lock_owned().await;

        let upload = {
            let state = slot.state();
            if state.finished {
                return Err(ShareError::NotFound(format!("upload `{}`", upload_id)));
            }
            if !secrets_match(&state.upload.upload_secret, secret) {
                return Err(ShareError::Forbidden("upload token mismatch".into()));
            }
            let missing = state.upload.missing_chunks();
            if !missing.is_empty() {
                return Err(ShareError::IncompleteUpload {
                    missing: missing.len(),
                });
            }
            state.upload.clone()
        };

        Ok(FinishingUpload {
            slot,
            upload,
            _guard: guard,
        })
    }

    /// Mark a finalized upload consumed, drop its record and delete its chunk
    /// area. Chunk cleanup is best effort; leftovers are swept as orphans.
    pub async fn complete(&self, finishing: FinishingUpload) {
        let upload_id = finishing.upload.upload_id.clone();
        finishing.slot.state().finished = true;
        self.uploads.write().await.remove(&upload_id);
        if let Err(err) = self.store.remove_area(&upload_id).await {
            warn!(upload_id = %upload_id, error = %err, "failed to remove chunk area");
        }
        drop(finishing);
        info!(upload_id = %upload_id, "upload finalized");
    }

    /// Ids of every upload still in progress.
    pub async fn upload_ids(&self) -> HashSet<String> {
        self.uploads.read().await.keys().cloned().collect()
    }

    pub async fn get(&self, upload_id: &str) -> Option<Upload> {
        let slot = self.uploads.read().await.get(upload_id).cloned()?;
        let state = slot.state();
        (!state.finished).then(|| state.upload.clone())
    }

    /// Copy of the upload table for checkpointing.
    pub async fn snapshot(&self) -> BTreeMap<String, Upload> {
        let uploads = self.uploads.read().await;
        uploads
            .iter()
            .filter_map(|(id, slot)| {
                let state = slot.state();
                (!state.finished).then(|| (id.clone(), state.upload.clone()))
            })
            .collect()
    }

    /// Replace the upload table with records loaded from a snapshot and make
    /// sure each one still has a chunk area.
    pub async fn restore(&self, uploads: BTreeMap<String, Upload>) -> ShareResult<()> {
        let mut table = HashMap::with_capacity(uploads.len());
        for (id, upload) in uploads {
            self.store.create_area(&id).await?;
            table.insert(id, Arc::new(UploadSlot::new(upload)));
        }
        *self.uploads.write().await = table;
        Ok(())
    }
}

fn generate_secret() -> String {
    let bytes: [u8; 16] = rand::random();
    general_purpose::URL_SAFE_NO_PAD.encode(bytes)
}

/// Constant-time comparison so the token cannot be probed byte by byte.
fn secrets_match(expected: &str, provided: &str) -> bool {
    let (a, b) = (expected.as_bytes(), provided.as_bytes());
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
