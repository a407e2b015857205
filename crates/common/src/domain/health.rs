use crate::domain::result::DomainResult;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Last-seen health hashes of a device, used to skip redundant work
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthHash {
    pub org_id: String,
    pub device_id: String,
    pub snap_list_hash: String,
    pub installed_snaps_hash: String,
    pub last_refresh: DateTime<Utc>,
}

impl HealthHash {
    pub fn same_hashes(&self, other: &HealthHash) -> bool {
        self.snap_list_hash == other.snap_list_hash
            && self.installed_snaps_hash == other.installed_snaps_hash
    }
}

#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait HealthHashRepository: Send + Sync {
    /// Store the hashes when they differ from the stored ones.
    /// Returns `true` when the row was inserted or changed.
    async fn upsert_health_hash(&self, hash: HealthHash) -> DomainResult<bool>;

    async fn get_health_hash(&self, org_id: &str, device_id: &str)
        -> DomainResult<Option<HealthHash>>;
}
