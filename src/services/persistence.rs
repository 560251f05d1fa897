//! src/services/persistence.rs
//!
//! Snapshot persistence for the in-memory tables. The whole state is three
//! key-value tables (uploads, artifacts, retrieval entries) that are rewritten
//! in full after every mutation and reloaded in full at start-up. Two
//! backends are provided: JSON files in a state directory (each replaced
//! atomically via temp-file + rename) and a SQLite `snapshots` table (all
//! three rows replaced in one transaction).

use crate::{
    errors::ShareResult,
    models::{artifact::Artifact, retrieval::RetrievalEntry, upload::Upload},
    services::{
        chunk_store::sync_dir, registry::RetrievalRegistry, upload_tracker::UploadTracker,
    },
};
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use sqlx::SqlitePool;
use std::{
    collections::BTreeMap,
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::Arc,
};
use tokio::{
    fs::{self, File},
    io::AsyncWriteExt,
    sync::Mutex,
};
use tracing::{debug, info};
use uuid::Uuid;

const MIGRATION_SQL: &str = include_str!("../../migrations/0001_init.sql");

const UPLOADS_TABLE: &str = "uploads";
const ARTIFACTS_TABLE: &str = "artifacts";
const ENTRIES_TABLE: &str = "entries";

/// Full copy of the service state.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct Snapshot {
    pub uploads: BTreeMap<String, Upload>,
    pub artifacts: BTreeMap<String, Artifact>,
    pub entries: BTreeMap<String, RetrievalEntry>,
}

impl Snapshot {
    /// Assemble a snapshot from individually stored tables. A missing table is
    /// empty; all three missing means nothing was ever stored.
    fn from_tables(
        uploads: Option<BTreeMap<String, Upload>>,
        artifacts: Option<BTreeMap<String, Artifact>>,
        entries: Option<BTreeMap<String, RetrievalEntry>>,
    ) -> Option<Self> {
        if uploads.is_none() && artifacts.is_none() && entries.is_none() {
            return None;
        }
        Some(Self {
            uploads: uploads.unwrap_or_default(),
            artifacts: artifacts.unwrap_or_default(),
            entries: entries.unwrap_or_default(),
        })
    }
}

/// Where snapshots are kept.
#[async_trait]
pub trait SnapshotBackend: Send + Sync {
    /// Load the last stored snapshot, or `None` if nothing was ever stored.
    async fn load(&self) -> ShareResult<Option<Snapshot>>;

    /// Replace the stored snapshot.
    async fn store(&self, snapshot: &Snapshot) -> ShareResult<()>;

    /// Cheap round trip used by the readiness probe.
    async fn ping(&self) -> ShareResult<()>;

    fn describe(&self) -> String;
}

// ---------------------------------------------------------------------------
// JSON files
// ---------------------------------------------------------------------------

pub struct JsonSnapshotBackend {
    dir: PathBuf,
}

impl JsonSnapshotBackend {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn table_path(&self, table: &str) -> PathBuf {
        self.dir.join(format!("{}.json", table))
    }

    async fn read_table<T: DeserializeOwned>(&self, table: &str) -> ShareResult<Option<T>> {
        match fs::read(self.table_path(table)).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    async fn write_table<T: Serialize>(&self, table: &str, value: &T) -> ShareResult<()> {
        let body = serde_json::to_vec(value)?;
        replace_file(&self.dir, &self.table_path(table), &body).await
    }
}

#[async_trait]
impl SnapshotBackend for JsonSnapshotBackend {
    async fn load(&self) -> ShareResult<Option<Snapshot>> {
        Ok(Snapshot::from_tables(
            self.read_table(UPLOADS_TABLE).await?,
            self.read_table(ARTIFACTS_TABLE).await?,
            self.read_table(ENTRIES_TABLE).await?,
        ))
    }

    async fn store(&self, snapshot: &Snapshot) -> ShareResult<()> {
        fs::create_dir_all(&self.dir).await?;
        // Artifacts before entries before uploads: an interrupted checkpoint
        // leaves at worst an unreferenced artifact and a still-finishable upload.
        self.write_table(ARTIFACTS_TABLE, &snapshot.artifacts).await?;
        self.write_table(ENTRIES_TABLE, &snapshot.entries).await?;
        self.write_table(UPLOADS_TABLE, &snapshot.uploads).await?;
        Ok(())
    }

    async fn ping(&self) -> ShareResult<()> {
        fs::create_dir_all(&self.dir).await?;
        let probe = self.dir.join(format!(".ping-{}", Uuid::new_v4()));
        fs::write(&probe, b"ping").await?;
        fs::remove_file(&probe).await?;
        Ok(())
    }

    fn describe(&self) -> String {
        format!("json files in {}", self.dir.display())
    }
}

/// Write `body` to a temp file in `dir`, fsync it, then rename over `target`.
async fn replace_file(dir: &Path, target: &Path, body: &[u8]) -> ShareResult<()> {
    let tmp_path = dir.join(format!(".tmp-{}", Uuid::new_v4()));
    let result: std::io::Result<()> = async {
        let mut file = File::create(&tmp_path).await?;
        file.write_all(body).await?;
        file.flush().await?;
        file.sync_all().await?;
        fs::rename(&tmp_path, target).await?;
        sync_dir(dir).await
    }
    .await;
    if let Err(err) = result {
        let _ = fs::remove_file(&tmp_path).await;
        return Err(err.into());
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// SQLite
// ---------------------------------------------------------------------------

pub struct SqliteSnapshotBackend {
    db: Arc<SqlitePool>,
}

impl SqliteSnapshotBackend {
    /// Wrap a pool, creating the `snapshots` table if needed.
    pub async fn new(db: Arc<SqlitePool>) -> ShareResult<Self> {
        run_migrations(&db).await?;
        Ok(Self { db })
    }

    async fn read_table<T: DeserializeOwned>(&self, table: &str) -> ShareResult<Option<T>> {
        let body: Option<String> = sqlx::query_scalar("SELECT body FROM snapshots WHERE name = ?")
            .bind(table)
            .fetch_optional(&*self.db)
            .await?;
        body.map(|body| serde_json::from_str(&body))
            .transpose()
            .map_err(Into::into)
    }
}

/// Apply the embedded schema. Safe to run repeatedly.
pub async fn run_migrations(db: &SqlitePool) -> ShareResult<()> {
    let statements = MIGRATION_SQL
        .split(';')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>();

    debug!("Running {} migration statements...", statements.len());

    for stmt in statements {
        sqlx::query(stmt).execute(db).await?;
    }
    Ok(())
}

#[async_trait]
impl SnapshotBackend for SqliteSnapshotBackend {
    async fn load(&self) -> ShareResult<Option<Snapshot>> {
        Ok(Snapshot::from_tables(
            self.read_table(UPLOADS_TABLE).await?,
            self.read_table(ARTIFACTS_TABLE).await?,
            self.read_table(ENTRIES_TABLE).await?,
        ))
    }

    async fn store(&self, snapshot: &Snapshot) -> ShareResult<()> {
        let rows = [
            (UPLOADS_TABLE, serde_json::to_string(&snapshot.uploads)?),
            (ARTIFACTS_TABLE, serde_json::to_string(&snapshot.artifacts)?),
            (ENTRIES_TABLE, serde_json::to_string(&snapshot.entries)?),
        ];
        let updated_at = Utc::now();

        let mut tx = self.db.begin().await?;
        for (name, body) in rows {
            sqlx::query(
                "INSERT INTO snapshots (name, body, updated_at) VALUES (?, ?, ?)
                 ON CONFLICT(name) DO UPDATE SET
                    body = excluded.body,
                    updated_at = excluded.updated_at",
            )
            .bind(name)
            .bind(body)
            .bind(updated_at)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn ping(&self) -> ShareResult<()> {
        sqlx::query_scalar::<_, i64>("SELECT 1")
            .fetch_one(&*self.db)
            .await?;
        Ok(())
    }

    fn describe(&self) -> String {
        "sqlite snapshots table".into()
    }
}

// ---------------------------------------------------------------------------
// Checkpointing
// ---------------------------------------------------------------------------

/// Writes the live tables to the backend, one checkpoint at a time.
///
/// The snapshot is captured while holding the write lock, so checkpoints land
/// in the order their snapshots were taken and an older state never replaces
/// a newer one.
pub struct Checkpointer {
    backend: Arc<dyn SnapshotBackend>,
    tracker: Arc<UploadTracker>,
    registry: Arc<RetrievalRegistry>,
    write_lock: Mutex<()>,
}

impl Checkpointer {
    pub fn new(
        backend: Arc<dyn SnapshotBackend>,
        tracker: Arc<UploadTracker>,
        registry: Arc<RetrievalRegistry>,
    ) -> Self {
        Self {
            backend,
            tracker,
            registry,
            write_lock: Mutex::new(()),
        }
    }

    pub fn backend(&self) -> &dyn SnapshotBackend {
        self.backend.as_ref()
    }

    pub async fn checkpoint(&self) -> ShareResult<()> {
        let _guard = self.write_lock.lock().await;
        let uploads = self.tracker.snapshot().await;
        let (artifacts, entries) = self.registry.snapshot().await;
        let snapshot = Snapshot {
            uploads,
            artifacts,
            entries,
        };
        self.backend.store(&snapshot).await?;
        debug!(
            uploads = snapshot.uploads.len(),
            artifacts = snapshot.artifacts.len(),
            entries = snapshot.entries.len(),
            "checkpoint written"
        );
        Ok(())
    }

    /// Seed the tracker and registry from the stored snapshot, if any.
    pub async fn restore(&self) -> ShareResult<()> {
        let Some(snapshot) = self.backend.load().await? else {
            info!("no snapshot found in {}, starting empty", self.backend.describe());
            return Ok(());
        };
        info!(
            uploads = snapshot.uploads.len(),
            artifacts = snapshot.artifacts.len(),
            entries = snapshot.entries.len(),
            "restored state from {}",
            self.backend.describe()
        );
        self.tracker.restore(snapshot.uploads).await?;
        self.registry
            .restore(snapshot.artifacts, snapshot.entries)
            .await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::retrieval::RetentionPolicy;
    use sqlx::sqlite::SqlitePoolOptions;
    use tempfile::TempDir;

    fn sample() -> Snapshot {
        let now = Utc::now();
        let upload = Upload {
            upload_id: "u1".into(),
            upload_secret: "s".into(),
            original_name: "movie.mkv".into(),
            declared_size: 10,
            expected_chunk_count: 2,
            chunk_status: vec![true, false],
            max_downloads: 2,
            max_retention_hours: 2,
            created_at: now,
        };
        let artifact = Artifact {
            artifact_id: "a1".into(),
            filename: "notes.txt".into(),
            byte_size: 3,
            etag: "abc".into(),
            created_at: now,
            path: PathBuf::from("/tmp/a1.rst"),
        };
        let entry = RetrievalEntry::new(
            "042042".into(),
            "a1".into(),
            "owner".into(),
            RetentionPolicy {
                max_downloads: 1,
                max_retention_hours: 1,
            },
            now,
        );
        Snapshot {
            uploads: BTreeMap::from([("u1".to_string(), upload)]),
            artifacts: BTreeMap::from([("a1".to_string(), artifact)]),
            entries: BTreeMap::from([("042042".to_string(), entry)]),
        }
    }

    #[tokio::test]
    async fn test_json_backend_replaces_tables_atomically() {
        let dir = TempDir::new().unwrap();
        let backend = JsonSnapshotBackend::new(dir.path().join("state"));
        assert!(backend.load().await.unwrap().is_none());

        let mut snapshot = sample();
        backend.store(&snapshot).await.unwrap();
        snapshot.entries.clear();
        backend.store(&snapshot).await.unwrap();

        assert_eq!(backend.load().await.unwrap(), Some(snapshot));

        let mut names = Vec::new();
        let mut entries = fs::read_dir(dir.path().join("state")).await.unwrap();
        while let Some(entry) = entries.next_entry().await.unwrap() {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        names.sort();
        assert_eq!(names, vec!["artifacts.json", "entries.json", "uploads.json"]);
    }

    #[tokio::test]
    async fn test_json_backend_rejects_corrupt_table() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("entries.json"), b"{not json").await.unwrap();
        let backend = JsonSnapshotBackend::new(dir.path());
        assert!(backend.load().await.is_err());
    }

    #[tokio::test]
    async fn test_sqlite_backend() {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let backend = SqliteSnapshotBackend::new(Arc::new(pool)).await.unwrap();
        backend.ping().await.unwrap();
        assert!(backend.load().await.unwrap().is_none());

        let snapshot = sample();
        backend.store(&snapshot).await.unwrap();
        backend.store(&snapshot).await.unwrap();
        assert_eq!(backend.load().await.unwrap(), Some(snapshot));
    }

    #[tokio::test]
    async fn test_checkpoint_and_restore() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(crate::services::chunk_store::ChunkStore::new(dir.path().join("blobs")));
        let backend: Arc<dyn SnapshotBackend> =
            Arc::new(JsonSnapshotBackend::new(dir.path().join("state")));

        let tracker = Arc::new(UploadTracker::new(store.clone(), 4, 100));
        let registry = Arc::new(RetrievalRegistry::new());
        let upload = tracker
            .start(crate::services::upload_tracker::NewUpload {
                filename: "a.bin".into(),
                declared_size: 6,
                policy: RetentionPolicy {
                    max_downloads: 1,
                    max_retention_hours: 1,
                },
            })
            .await
            .unwrap();
        Checkpointer::new(backend.clone(), tracker, registry)
            .checkpoint()
            .await
            .unwrap();

        let tracker = Arc::new(UploadTracker::new(store, 4, 100));
        let registry = Arc::new(RetrievalRegistry::new());
        Checkpointer::new(backend, tracker.clone(), registry)
            .restore()
            .await
            .unwrap();
        assert_eq!(tracker.get(&upload.upload_id).await, Some(upload));
    }
}
