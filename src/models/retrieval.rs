//! Represents a published pickup code.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Longest retention a caller may request: ten years.
pub const MAX_RETENTION_HOURS: u32 = 10 * 365 * 24;

/// Download quota and lifetime requested for a retrieval code.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetentionPolicy {
    pub max_downloads: u32,
    pub max_retention_hours: u32,
}

/// A shareable view of one artifact, addressed by a 6-digit code.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct RetrievalEntry {
    pub code: String,
    pub artifact_id: String,

    /// Passthrough attribute; there is no authentication layer.
    pub owner_id: String,

    /// Successful downloads so far. Never exceeds `download_quota`.
    pub download_count: u32,
    pub download_quota: u32,

    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl RetrievalEntry {
    pub fn new(
        code: String,
        artifact_id: String,
        owner_id: String,
        policy: RetentionPolicy,
        issued_at: DateTime<Utc>,
    ) -> Self {
        Self {
            code,
            artifact_id,
            owner_id,
            download_count: 0,
            download_quota: policy.max_downloads,
            issued_at,
            expires_at: issued_at
                .checked_add_signed(Duration::hours(i64::from(policy.max_retention_hours)))
                .unwrap_or(DateTime::<Utc>::MAX_UTC),
        }
    }

    pub fn is_exhausted(&self) -> bool {
        self.download_count >= self.download_quota
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// Dead entries are unusable even before a sweep removes them.
    pub fn is_dead(&self, now: DateTime<Utc>) -> bool {
        self.is_expired(now) || self.is_exhausted()
    }

    pub fn remaining_downloads(&self) -> u32 {
        self.download_quota.saturating_sub(self.download_count)
    }
}
