//! src/services/share_service.rs
//!
//! ShareService: the operations exposed over HTTP, composed from the chunk
//! store, upload tracker, retrieval registry, garbage collector and
//! checkpointer. Every mutating operation ends with a checkpoint; an
//! operation is only reported successful once its effect has been persisted.

use crate::{
    errors::{ShareError, ShareResult},
    models::{
        retrieval::{MAX_RETENTION_HOURS, RetentionPolicy},
        upload::Upload,
    },
    services::{
        chunk_store::ChunkStore,
        gc::GarbageCollector,
        persistence::{Checkpointer, SnapshotBackend},
        registry::{ArtifactView, Download, RetrievalRegistry},
        upload_tracker::{ChunkOutcome, NewUpload, UploadTracker},
    },
};
use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, error};

/// Owner recorded on every retrieval entry; there is no authentication layer.
pub const DEFAULT_OWNER: &str = "anonymous";

/// Size limits applied to uploads.
#[derive(Debug, Clone, Copy)]
pub struct UploadLimits {
    pub chunk_size: u64,
    pub max_file_size: u64,
}

/// Cloneable handle shared by all request handlers.
#[derive(Clone)]
pub struct ShareService {
    pub store: Arc<ChunkStore>,
    pub tracker: Arc<UploadTracker>,
    pub registry: Arc<RetrievalRegistry>,
    pub checkpointer: Arc<Checkpointer>,
    pub gc: Arc<GarbageCollector>,
}

impl ShareService {
    /// Wire up the services over `store` and `backend`. Call `restore` before
    /// serving traffic to load any previous state.
    pub fn new(store: ChunkStore, backend: Arc<dyn SnapshotBackend>, limits: UploadLimits) -> Self {
        let store = Arc::new(store);
        let tracker = Arc::new(UploadTracker::new(
            store.clone(),
            limits.chunk_size,
            limits.max_file_size,
        ));
        let registry = Arc::new(RetrievalRegistry::new());
        let checkpointer = Arc::new(Checkpointer::new(
            backend,
            tracker.clone(),
            registry.clone(),
        ));
        let gc = Arc::new(GarbageCollector::new(
            tracker.clone(),
            registry.clone(),
            store.clone(),
            checkpointer.clone(),
        ));
        Self {
            store,
            tracker,
            registry,
            checkpointer,
            gc,
        }
    }

    /// Create the storage roots and load the last snapshot.
    pub async fn restore(&self) -> ShareResult<()> {
        self.store.init().await?;
        self.checkpointer.restore().await
    }

    pub async fn start_upload(
        &self,
        filename: String,
        declared_size: u64,
        policy: RetentionPolicy,
    ) -> ShareResult<Upload> {
        if filename.trim().is_empty() {
            return Err(ShareError::Malformed("filename must not be empty".into()));
        }
        if policy.max_downloads == 0 || policy.max_retention_hours == 0 {
            return Err(ShareError::Malformed(
                "max_downloads and max_retention must be at least 1".into(),
            ));
        }
        if policy.max_retention_hours > MAX_RETENTION_HOURS {
            return Err(ShareError::Malformed(format!(
                "max_retention must be at most {} hours",
                MAX_RETENTION_HOURS
            )));
        }
        let upload = self
            .tracker
            .start(NewUpload {
                filename,
                declared_size,
                policy,
            })
            .await?;
        self.checkpointer.checkpoint().await?;
        Ok(upload)
    }

    pub async fn write_chunk(
        &self,
        upload_id: &str,
        chunk_index: i64,
        secret: &str,
        payload: &[u8],
    ) -> ShareResult<ChunkOutcome> {
        let outcome = self
            .tracker
            .write_chunk(upload_id, chunk_index, secret, payload)
            .await?;
        if outcome == ChunkOutcome::Stored {
            self.checkpointer.checkpoint().await?;
        }
        Ok(outcome)
    }

    /// Merge a complete upload, publish it and return the new pickup code.
    ///
    /// The upload's finalize lock is held from validation through cleanup, so
    /// concurrent calls for the same upload merge and publish exactly once.
    pub async fn finish_upload(&self, upload_id: &str, secret: &str) -> ShareResult<String> {
        let finishing = self.tracker.begin_finish(upload_id, secret).await?;
        let upload = finishing.upload().clone();

        let artifact = finishing.merge(&self.store).await?;
        let entry = self
            .registry
            .publish(
                artifact,
                DEFAULT_OWNER,
                RetentionPolicy {
                    max_downloads: upload.max_downloads,
                    max_retention_hours: upload.max_retention_hours,
                },
                Utc::now(),
            )
            .await?;
        self.tracker.complete(finishing).await;
        self.checkpoint_committed("finish", upload_id).await;
        Ok(entry.code)
    }

    /// Describe a live code. Spent, expired and unknown codes all come back as
    /// `NotFound`; a dead code also nudges the background sweeper.
    pub async fn info(&self, code: &str) -> ShareResult<ArtifactView> {
        self.registry
            .lookup(code, Utc::now())
            .await
            .map_err(|miss| {
                if miss.is_dead() {
                    debug!(code = %code, ?miss, "lookup hit a dead code");
                    self.gc.request_sweep();
                }
                ShareError::NotFound(format!("code `{}`", code))
            })
    }

    /// Count a download and hand back the artifact bytes.
    pub async fn download(&self, code: &str) -> ShareResult<Download> {
        self.info(code).await?;
        let download = self.registry.consume(code, Utc::now(), &self.store).await?;
        self.checkpoint_committed("download", code).await;
        Ok(download)
    }

    /// Checkpoint after a change that has already been committed in memory
    /// and cannot be handed back. A failure is logged rather than returned;
    /// the next successful checkpoint captures the change.
    async fn checkpoint_committed(&self, operation: &str, key: &str) {
        if let Err(err) = self.checkpointer.checkpoint().await {
            error!(
                operation,
                key = %key,
                error = %err,
                "checkpoint failed after commit; state will be persisted by the next checkpoint"
            );
        }
    }
}
