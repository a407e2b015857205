use crate::domain::{DeviceModel, DeviceModelRepository, DomainError, DomainResult, RequiredSnap};
use crate::postgres::{repo_err, PostgresClient};
use async_trait::async_trait;
use tracing::{info, instrument};

/// PostgreSQL implementation of DeviceModelRepository
#[derive(Clone)]
pub struct PostgresDeviceModelRepository {
    client: PostgresClient,
}

impl PostgresDeviceModelRepository {
    pub fn new(client: PostgresClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl DeviceModelRepository for PostgresDeviceModelRepository {
    #[instrument(skip(self))]
    async fn get_model_required_snaps(&self, model: &str) -> DomainResult<DeviceModel> {
        let conn = self
            .client
            .get_connection()
            .await
            .map_err(DomainError::RepositoryError)?;

        let rows = conn
            .query(
                "SELECT r.name FROM device_model_required_snap r
                 JOIN device_model m ON m.id = r.device_model_id
                 WHERE m.name = $1
                 ORDER BY r.id",
                &[&model],
            )
            .await
            .map_err(repo_err)?;

        Ok(DeviceModel {
            name: model.to_string(),
            required_snaps: rows
                .iter()
                .map(|row| RequiredSnap { name: row.get(0) })
                .collect(),
        })
    }

    #[instrument(skip(self, snaps), fields(count = snaps.len()))]
    async fn set_model_required_snaps(&self, model: &str, snaps: Vec<String>) -> DomainResult<()> {
        let mut conn = self
            .client
            .get_connection()
            .await
            .map_err(DomainError::RepositoryError)?;

        let transaction = conn.transaction().await.map_err(repo_err)?;

        let row = transaction
            .query_one(
                "INSERT INTO device_model (name) VALUES ($1)
                 ON CONFLICT (name) DO UPDATE SET name = EXCLUDED.name
                 RETURNING id",
                &[&model],
            )
            .await
            .map_err(repo_err)?;
        let model_id: i64 = row.get(0);

        transaction
            .execute(
                "DELETE FROM device_model_required_snap WHERE device_model_id = $1",
                &[&model_id],
            )
            .await
            .map_err(repo_err)?;

        for snap in &snaps {
            transaction
                .execute(
                    "INSERT INTO device_model_required_snap (device_model_id, name) VALUES ($1, $2)
                     ON CONFLICT (device_model_id, name) DO NOTHING",
                    &[&model_id, snap],
                )
                .await
                .map_err(repo_err)?;
        }

        transaction.commit().await.map_err(repo_err)?;

        info!(model = %model, "model required snaps replaced");
        Ok(())
    }
}
