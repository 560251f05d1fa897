//! Retrieval registry.
//!
//! Maps 6-digit pickup codes to artifacts and enforces each code's download
//! quota and expiry. Artifacts and entries share one lock so that publishing,
//! consuming and sweeping always see a consistent pair of tables.

use crate::{
    errors::{ShareError, ShareResult},
    models::{
        artifact::Artifact,
        retrieval::{RetentionPolicy, RetrievalEntry},
    },
    services::chunk_store::ChunkStore,
};
use chrono::{DateTime, Utc};
use rand::Rng;
use std::collections::{BTreeMap, HashMap, HashSet};
use tokio::{fs::File, sync::Mutex};
use tracing::{debug, info};

pub const CODE_LEN: usize = 6;
const CODE_SPACE: u32 = 1_000_000;
const MAX_CODE_ATTEMPTS: usize = 1_000;

/// Exactly `CODE_LEN` ASCII digits.
pub fn is_wellformed_code(code: &str) -> bool {
    code.len() == CODE_LEN && code.bytes().all(|b| b.is_ascii_digit())
}

/// What a caller may show about a live code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactView {
    pub code: String,
    pub filename: String,
    pub byte_size: u64,
    pub created_at: DateTime<Utc>,
    pub remaining_downloads: u32,
    pub expires_at: DateTime<Utc>,
}

/// Why a lookup produced nothing usable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LookupMiss {
    Unknown,
    Exhausted,
    Expired,
}

impl LookupMiss {
    /// Dead entries are still present and worth sweeping.
    pub fn is_dead(self) -> bool {
        !matches!(self, LookupMiss::Unknown)
    }
}

/// An accepted download: the counted entry plus an open handle on the bytes.
#[derive(Debug)]
pub struct Download {
    pub artifact: Artifact,
    pub entry: RetrievalEntry,
    pub file: File,
}

/// Rows removed by `RetrievalRegistry::evict_dead`.
#[derive(Debug, Default)]
pub struct Eviction {
    pub expired: Vec<RetrievalEntry>,
    pub exhausted: Vec<RetrievalEntry>,
    /// Artifacts no surviving entry references; their files must be deleted.
    pub released: Vec<Artifact>,
}

#[derive(Default)]
struct Tables {
    artifacts: HashMap<String, Artifact>,
    entries: HashMap<String, RetrievalEntry>,
}

impl Tables {
    /// Draw random codes until one is not present in the table.
    ///
    /// Collision is checked against presence rather than liveness: a dead
    /// entry keeps its code reserved until a sweep removes it.
    fn free_code(&self) -> ShareResult<String> {
        let mut rng = rand::thread_rng();
        for _ in 0..MAX_CODE_ATTEMPTS {
            let code = format!("{:0width$}", rng.gen_range(0..CODE_SPACE), width = CODE_LEN);
            if !self.entries.contains_key(&code) {
                return Ok(code);
            }
        }
        Err(ShareError::CodeSpaceExhausted)
    }

    fn issue(
        &mut self,
        artifact_id: &str,
        owner_id: &str,
        policy: RetentionPolicy,
        now: DateTime<Utc>,
    ) -> ShareResult<RetrievalEntry> {
        let code = self.free_code()?;
        let entry = RetrievalEntry::new(
            code.clone(),
            artifact_id.to_string(),
            owner_id.to_string(),
            policy,
            now,
        );
        self.entries.insert(code, entry.clone());
        Ok(entry)
    }

    fn live_entry(&self, code: &str, now: DateTime<Utc>) -> Result<&RetrievalEntry, LookupMiss> {
        let entry = self.entries.get(code).ok_or(LookupMiss::Unknown)?;
        if entry.is_exhausted() {
            return Err(LookupMiss::Exhausted);
        }
        if entry.is_expired(now) {
            return Err(LookupMiss::Expired);
        }
        Ok(entry)
    }
}

#[derive(Default)]
pub struct RetrievalRegistry {
    tables: Mutex<Tables>,
}

impl RetrievalRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a freshly merged artifact and issue its first code in one step.
    pub async fn publish(
        &self,
        artifact: Artifact,
        owner_id: &str,
        policy: RetentionPolicy,
        now: DateTime<Utc>,
    ) -> ShareResult<RetrievalEntry> {
        let mut tables = self.tables.lock().await;
        let artifact_id = artifact.artifact_id.clone();
        let entry = tables.issue(&artifact_id, owner_id, policy, now)?;
        tables.artifacts.insert(artifact_id, artifact);
        info!(
            code = %entry.code,
            artifact_id = %entry.artifact_id,
            quota = entry.download_quota,
            expires_at = %entry.expires_at,
            "retrieval code issued"
        );
        Ok(entry)
    }

    /// Issue an additional code for an artifact that is already registered.
    pub async fn issue_code(
        &self,
        artifact_id: &str,
        owner_id: &str,
        policy: RetentionPolicy,
        now: DateTime<Utc>,
    ) -> ShareResult<RetrievalEntry> {
        let mut tables = self.tables.lock().await;
        if !tables.artifacts.contains_key(artifact_id) {
            return Err(ShareError::NotFound(format!("artifact `{}`", artifact_id)));
        }
        let entry = tables.issue(artifact_id, owner_id, policy, now)?;
        debug!(code = %entry.code, artifact_id = %artifact_id, "additional code issued");
        Ok(entry)
    }

    /// Resolve a code without touching its counters.
    pub async fn lookup(&self, code: &str, now: DateTime<Utc>) -> Result<ArtifactView, LookupMiss> {
        let tables = self.tables.lock().await;
        let entry = tables.live_entry(code, now)?;
        let artifact = tables
            .artifacts
            .get(&entry.artifact_id)
            .ok_or(LookupMiss::Unknown)?;
        Ok(ArtifactView {
            code: entry.code.clone(),
            filename: artifact.filename.clone(),
            byte_size: artifact.byte_size,
            created_at: artifact.created_at,
            remaining_downloads: entry.remaining_downloads(),
            expires_at: entry.expires_at,
        })
    }

    /// Count one download against a code and open its artifact.
    ///
    /// The file is opened without holding the table lock. The quota is then
    /// re-checked under the lock before counting, so of several racing calls
    /// on the last allowed download exactly one succeeds; the rest get
    /// `Forbidden`. Unknown, expired or fileless codes are `NotFound`.
    pub async fn consume(
        &self,
        code: &str,
        now: DateTime<Utc>,
        store: &ChunkStore,
    ) -> ShareResult<Download> {
        let artifact = {
            let tables = self.tables.lock().await;
            let entry = Self::consumable(&tables, code, now)?;
            tables
                .artifacts
                .get(&entry.artifact_id)
                .cloned()
                .ok_or_else(|| ShareError::NotFound(format!("code `{}`", code)))?
        };

        let file = store.open_artifact(&artifact.path).await?;

        let mut tables = self.tables.lock().await;
        let artifact_id = Self::consumable(&tables, code, now)?.artifact_id.clone();
        if artifact_id != artifact.artifact_id {
            return Err(ShareError::NotFound(format!("code `{}`", code)));
        }
        let entry = tables
            .entries
            .get_mut(code)
            .ok_or_else(|| ShareError::NotFound(format!("code `{}`", code)))?;
        entry.download_count += 1;
        let entry = entry.clone();

        info!(
            code = %code,
            downloads = entry.download_count,
            quota = entry.download_quota,
            "download counted"
        );
        Ok(Download {
            artifact,
            entry,
            file,
        })
    }

    fn consumable<'a>(
        tables: &'a Tables,
        code: &str,
        now: DateTime<Utc>,
    ) -> ShareResult<&'a RetrievalEntry> {
        match tables.live_entry(code, now) {
            Ok(entry) => Ok(entry),
            Err(LookupMiss::Exhausted) => {
                Err(ShareError::Forbidden("download limit exceeded".into()))
            }
            Err(_) => Err(ShareError::NotFound(format!("code `{}`", code))),
        }
    }

    /// Remove every expired or exhausted entry, and every artifact no
    /// remaining entry references. Returns what was removed so the caller can
    /// reclaim disk space outside the lock.
    pub async fn evict_dead(&self, now: DateTime<Utc>) -> Eviction {
        let mut tables = self.tables.lock().await;
        let mut eviction = Eviction::default();

        let dead: Vec<String> = tables
            .entries
            .values()
            .filter(|entry| entry.is_dead(now))
            .map(|entry| entry.code.clone())
            .collect();
        for code in dead {
            if let Some(entry) = tables.entries.remove(&code) {
                if entry.is_exhausted() {
                    eviction.exhausted.push(entry);
                } else {
                    eviction.expired.push(entry);
                }
            }
        }

        // Reference counting by scan: O(entries), fine at this scale.
        let referenced: HashSet<&str> = tables
            .entries
            .values()
            .map(|entry| entry.artifact_id.as_str())
            .collect();
        let unreferenced: Vec<String> = tables
            .artifacts
            .keys()
            .filter(|id| !referenced.contains(id.as_str()))
            .cloned()
            .collect();
        for id in unreferenced {
            if let Some(artifact) = tables.artifacts.remove(&id) {
                eviction.released.push(artifact);
            }
        }

        eviction
    }

    pub async fn artifact_ids(&self) -> HashSet<String> {
        self.tables.lock().await.artifacts.keys().cloned().collect()
    }

    pub async fn entry(&self, code: &str) -> Option<RetrievalEntry> {
        self.tables.lock().await.entries.get(code).cloned()
    }

    /// Copies of both tables for checkpointing.
    pub async fn snapshot(
        &self,
    ) -> (
        BTreeMap<String, Artifact>,
        BTreeMap<String, RetrievalEntry>,
    ) {
        let tables = self.tables.lock().await;
        (
            tables
                .artifacts
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            tables
                .entries
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        )
    }

    pub async fn restore(
        &self,
        artifacts: BTreeMap<String, Artifact>,
        entries: BTreeMap<String, RetrievalEntry>,
    ) {
        let mut tables = self.tables.lock().await;
        tables.artifacts = artifacts.into_iter().collect();
        tables.entries = entries.into_iter().collect();
    }
}
