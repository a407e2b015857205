use crate::domain::{
    CreateOrganizationInput, DomainError, DomainResult, Organization, OrganizationRepository,
};
use crate::postgres::{repo_err, PostgresClient};
use async_trait::async_trait;
use tokio_postgres::error::SqlState;
use tokio_postgres::Row;
use tracing::{debug, instrument};

fn organization_from_row(row: &Row) -> Organization {
    Organization {
        org_id: row.get("org_id"),
        name: row.get("name"),
        created_at: Some(row.get("created_at")),
    }
}

/// PostgreSQL implementation of OrganizationRepository trait
#[derive(Clone)]
pub struct PostgresOrganizationRepository {
    client: PostgresClient,
}

impl PostgresOrganizationRepository {
    pub fn new(client: PostgresClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl OrganizationRepository for PostgresOrganizationRepository {
    #[instrument(skip(self), fields(org_id = %input.org_id))]
    async fn create_organization(
        &self,
        input: CreateOrganizationInput,
    ) -> DomainResult<Organization> {
        let conn = self
            .client
            .get_connection()
            .await
            .map_err(DomainError::RepositoryError)?;

        let result = conn
            .query_one(
                "INSERT INTO organization (org_id, name) VALUES ($1, $2)
                 RETURNING org_id, name, created_at",
                &[&input.org_id, &input.name],
            )
            .await;

        match result {
            Ok(row) => {
                debug!("organization created in database");
                Ok(organization_from_row(&row))
            }
            // PostgreSQL error code 23505 is unique_violation
            Err(e) if e.code() == Some(&SqlState::UNIQUE_VIOLATION) => {
                Err(DomainError::OrganizationAlreadyExists(input.org_id))
            }
            Err(e) => Err(repo_err(e)),
        }
    }

    #[instrument(skip(self))]
    async fn get_organization(&self, id_or_name: &str) -> DomainResult<Option<Organization>> {
        let conn = self
            .client
            .get_connection()
            .await
            .map_err(DomainError::RepositoryError)?;

        let row = conn
            .query_opt(
                "SELECT org_id, name, created_at FROM organization
                 WHERE org_id = $1 OR name = $1
                 ORDER BY (org_id = $1) DESC
                 LIMIT 1",
                &[&id_or_name],
            )
            .await
            .map_err(repo_err)?;

        Ok(row.as_ref().map(organization_from_row))
    }

    #[instrument(skip(self))]
    async fn list_organizations(&self) -> DomainResult<Vec<Organization>> {
        let conn = self
            .client
            .get_connection()
            .await
            .map_err(DomainError::RepositoryError)?;

        let rows = conn
            .query("SELECT org_id, name, created_at FROM organization ORDER BY id", &[])
            .await
            .map_err(repo_err)?;

        Ok(rows.iter().map(organization_from_row).collect())
    }

    #[instrument(skip(self))]
    async fn link_user(&self, org_id: &str, username: &str) -> DomainResult<()> {
        let conn = self
            .client
            .get_connection()
            .await
            .map_err(DomainError::RepositoryError)?;

        conn.execute(
            "INSERT INTO organization_user (org_id, username) VALUES ($1, $2)
             ON CONFLICT (org_id, username) DO NOTHING",
            &[&org_id, &username],
        )
        .await
        .map_err(|e| {
            if e.code() == Some(&SqlState::FOREIGN_KEY_VIOLATION) {
                DomainError::OrganizationNotFound(org_id.to_string())
            } else {
                repo_err(e)
            }
        })?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn user_has_access(&self, org_id: &str, username: &str) -> DomainResult<bool> {
        let conn = self
            .client
            .get_connection()
            .await
            .map_err(DomainError::RepositoryError)?;

        let row = conn
            .query_opt(
                "SELECT 1 FROM organization_user WHERE org_id = $1 AND username = $2",
                &[&org_id, &username],
            )
            .await
            .map_err(repo_err)?;

        Ok(row.is_some())
    }
}
