use crate::domain::{Device, DomainError, DomainResult, Group, GroupRepository};
use crate::postgres::device_repository::{device_columns, device_from_row};
use crate::postgres::{repo_err, PostgresClient};
use async_trait::async_trait;
use tokio_postgres::error::SqlState;
use tokio_postgres::Row;
use tracing::{debug, instrument};

fn group_from_row(row: &Row) -> Group {
    Group {
        id: row.get("id"),
        org_id: row.get("org_id"),
        name: row.get("name"),
        created_at: Some(row.get("created_at")),
    }
}

/// PostgreSQL implementation of GroupRepository
#[derive(Clone)]
pub struct PostgresGroupRepository {
    client: PostgresClient,
}

impl PostgresGroupRepository {
    pub fn new(client: PostgresClient) -> Self {
        Self { client }
    }

    async fn require_group(
        &self,
        conn: &deadpool_postgres::Client,
        org_id: &str,
        name: &str,
    ) -> DomainResult<i64> {
        let row = conn
            .query_opt(
                "SELECT id FROM device_group WHERE org_id = $1 AND name = $2",
                &[&org_id, &name],
            )
            .await
            .map_err(repo_err)?;

        row.map(|row| row.get::<_, i64>(0))
            .ok_or_else(|| DomainError::GroupNotFound(name.to_string()))
    }
}

#[async_trait]
impl GroupRepository for PostgresGroupRepository {
    #[instrument(skip(self))]
    async fn create_group(&self, org_id: &str, name: &str) -> DomainResult<Group> {
        let conn = self
            .client
            .get_connection()
            .await
            .map_err(DomainError::RepositoryError)?;

        let result = conn
            .query_one(
                "INSERT INTO device_group (org_id, name) VALUES ($1, $2)
                 RETURNING id, org_id, name, created_at",
                &[&org_id, &name],
            )
            .await;

        match result {
            Ok(row) => Ok(group_from_row(&row)),
            Err(e) if e.code() == Some(&SqlState::UNIQUE_VIOLATION) => {
                Err(DomainError::GroupAlreadyExists(name.to_string()))
            }
            Err(e) => Err(repo_err(e)),
        }
    }

    #[instrument(skip(self))]
    async fn list_groups(&self, org_id: &str) -> DomainResult<Vec<Group>> {
        let conn = self
            .client
            .get_connection()
            .await
            .map_err(DomainError::RepositoryError)?;

        let rows = conn
            .query(
                "SELECT id, org_id, name, created_at FROM device_group
                 WHERE org_id = $1 ORDER BY name",
                &[&org_id],
            )
            .await
            .map_err(repo_err)?;

        Ok(rows.iter().map(group_from_row).collect())
    }

    #[instrument(skip(self))]
    async fn get_group(&self, org_id: &str, name: &str) -> DomainResult<Option<Group>> {
        let conn = self
            .client
            .get_connection()
            .await
            .map_err(DomainError::RepositoryError)?;

        let row = conn
            .query_opt(
                "SELECT id, org_id, name, created_at FROM device_group
                 WHERE org_id = $1 AND name = $2",
                &[&org_id, &name],
            )
            .await
            .map_err(repo_err)?;

        Ok(row.as_ref().map(group_from_row))
    }

    #[instrument(skip(self))]
    async fn link_device(&self, org_id: &str, name: &str, device_id: &str) -> DomainResult<()> {
        let conn = self
            .client
            .get_connection()
            .await
            .map_err(DomainError::RepositoryError)?;

        let group_id = self.require_group(&conn, org_id, name).await?;

        conn.execute(
            "INSERT INTO group_device_link (group_id, device_id) VALUES ($1, $2)
             ON CONFLICT (group_id, device_id) DO NOTHING",
            &[&group_id, &device_id],
        )
        .await
        .map_err(|e| {
            if e.code() == Some(&SqlState::FOREIGN_KEY_VIOLATION) {
                DomainError::DeviceNotFound(device_id.to_string())
            } else {
                repo_err(e)
            }
        })?;

        debug!(group_id, "device linked to group");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn unlink_device(&self, org_id: &str, name: &str, device_id: &str) -> DomainResult<()> {
        let conn = self
            .client
            .get_connection()
            .await
            .map_err(DomainError::RepositoryError)?;

        let group_id = self.require_group(&conn, org_id, name).await?;

        conn.execute(
            "DELETE FROM group_device_link WHERE group_id = $1 AND device_id = $2",
            &[&group_id, &device_id],
        )
        .await
        .map_err(repo_err)?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn group_devices(&self, org_id: &str, name: &str) -> DomainResult<Vec<Device>> {
        let conn = self
            .client
            .get_connection()
            .await
            .map_err(DomainError::RepositoryError)?;

        let group_id = self.require_group(&conn, org_id, name).await?;

        let rows = conn
            .query(
                &format!(
                    "SELECT {} FROM device d
                     JOIN group_device_link l ON l.device_id = d.device_id
                     WHERE l.group_id = $1 AND d.deleted_at IS NULL
                     ORDER BY d.id",
                    device_columns("d")
                ),
                &[&group_id],
            )
            .await
            .map_err(repo_err)?;

        Ok(rows.iter().map(device_from_row).collect())
    }

    #[instrument(skip(self))]
    async fn excluded_devices(&self, org_id: &str, name: &str) -> DomainResult<Vec<Device>> {
        let conn = self
            .client
            .get_connection()
            .await
            .map_err(DomainError::RepositoryError)?;

        let group_id = self.require_group(&conn, org_id, name).await?;

        let rows = conn
            .query(
                &format!(
                    "SELECT {} FROM device d
                     WHERE d.org_id = $1 AND d.deleted_at IS NULL
                       AND NOT EXISTS (
                           SELECT 1 FROM group_device_link l
                           WHERE l.group_id = $2 AND l.device_id = d.device_id)
                     ORDER BY d.id",
                    device_columns("d")
                ),
                &[&org_id, &group_id],
            )
            .await
            .map_err(repo_err)?;

        Ok(rows.iter().map(device_from_row).collect())
    }
}
