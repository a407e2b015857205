use crate::domain::{DomainError, DomainResult, SettingRepository};
use crate::postgres::{repo_err, PostgresClient};
use async_trait::async_trait;
use tracing::instrument;

/// PostgreSQL implementation of SettingRepository
#[derive(Clone)]
pub struct PostgresSettingRepository {
    client: PostgresClient,
}

impl PostgresSettingRepository {
    pub fn new(client: PostgresClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl SettingRepository for PostgresSettingRepository {
    #[instrument(skip(self))]
    async fn get_setting(&self, key: &str) -> DomainResult<Option<String>> {
        let conn = self
            .client
            .get_connection()
            .await
            .map_err(DomainError::RepositoryError)?;

        let row = conn
            .query_opt("SELECT value FROM setting WHERE key = $1", &[&key])
            .await
            .map_err(repo_err)?;

        Ok(row.map(|row| row.get(0)))
    }

    #[instrument(skip(self, value))]
    async fn set_setting(&self, key: &str, value: &str) -> DomainResult<()> {
        let conn = self
            .client
            .get_connection()
            .await
            .map_err(DomainError::RepositoryError)?;

        conn.execute(
            "INSERT INTO setting (key, value) VALUES ($1, $2)
             ON CONFLICT (key) DO UPDATE SET value = EXCLUDED.value",
            &[&key, &value],
        )
        .await
        .map_err(repo_err)?;
        Ok(())
    }
}
