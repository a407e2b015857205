use crate::domain::{DomainError, DomainResult, HealthHash, HealthHashRepository};
use crate::postgres::{repo_err, PostgresClient};
use async_trait::async_trait;
use tracing::{debug, instrument};

/// PostgreSQL implementation of HealthHashRepository
#[derive(Clone)]
pub struct PostgresHealthHashRepository {
    client: PostgresClient,
}

impl PostgresHealthHashRepository {
    pub fn new(client: PostgresClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl HealthHashRepository for PostgresHealthHashRepository {
    #[instrument(skip(self, hash), fields(org_id = %hash.org_id, device_id = %hash.device_id))]
    async fn upsert_health_hash(&self, hash: HealthHash) -> DomainResult<bool> {
        let conn = self
            .client
            .get_connection()
            .await
            .map_err(DomainError::RepositoryError)?;

        // The conditional DO UPDATE leaves the row untouched (and returns no
        // row) when both hashes are already stored.
        let row = conn
            .query_opt(
                "INSERT INTO health_hash (org_id, device_id, snap_list_hash, installed_snaps_hash, last_refresh)
                 VALUES ($1, $2, $3, $4, $5)
                 ON CONFLICT (org_id, device_id) DO UPDATE SET
                     snap_list_hash = EXCLUDED.snap_list_hash,
                     installed_snaps_hash = EXCLUDED.installed_snaps_hash,
                     last_refresh = EXCLUDED.last_refresh
                 WHERE health_hash.snap_list_hash IS DISTINCT FROM EXCLUDED.snap_list_hash
                    OR health_hash.installed_snaps_hash IS DISTINCT FROM EXCLUDED.installed_snaps_hash
                 RETURNING id",
                &[
                    &hash.org_id,
                    &hash.device_id,
                    &hash.snap_list_hash,
                    &hash.installed_snaps_hash,
                    &hash.last_refresh,
                ],
            )
            .await
            .map_err(repo_err)?;

        let changed = row.is_some();
        debug!(changed, "health hash upserted");
        Ok(changed)
    }

    #[instrument(skip(self))]
    async fn get_health_hash(
        &self,
        org_id: &str,
        device_id: &str,
    ) -> DomainResult<Option<HealthHash>> {
        let conn = self
            .client
            .get_connection()
            .await
            .map_err(DomainError::RepositoryError)?;

        let row = conn
            .query_opt(
                "SELECT org_id, device_id, snap_list_hash, installed_snaps_hash, last_refresh
                 FROM health_hash WHERE org_id = $1 AND device_id = $2",
                &[&org_id, &device_id],
            )
            .await
            .map_err(repo_err)?;

        Ok(row.map(|row| HealthHash {
            org_id: row.get("org_id"),
            device_id: row.get("device_id"),
            snap_list_hash: row.get("snap_list_hash"),
            installed_snaps_hash: row.get("installed_snaps_hash"),
            last_refresh: row.get("last_refresh"),
        }))
    }
}
