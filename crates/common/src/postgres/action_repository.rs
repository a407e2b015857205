use crate::domain::{
    Action, ActionKind, ActionRepository, ActionStatus, CreateActionInput, DomainError,
    DomainResult,
};
use crate::postgres::{repo_err, PostgresClient};
use async_trait::async_trait;
use tokio_postgres::error::SqlState;
use tokio_postgres::Row;
use tracing::{debug, instrument, warn};

fn action_from_row(row: &Row) -> DomainResult<Action> {
    let action: String = row.get("action");
    let status: String = row.get("status");
    Ok(Action {
        action_id: row.get("action_id"),
        org_id: row.get("org_id"),
        device_id: row.get("device_id"),
        action: action.parse::<ActionKind>()?,
        status: status.parse::<ActionStatus>()?,
        message: row.get("message"),
        created: row.get("created"),
        modified: row.get("modified"),
    })
}

/// PostgreSQL implementation of ActionRepository
#[derive(Clone)]
pub struct PostgresActionRepository {
    client: PostgresClient,
}

impl PostgresActionRepository {
    pub fn new(client: PostgresClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ActionRepository for PostgresActionRepository {
    #[instrument(skip(self, input), fields(action_id = %input.action_id, action = %input.action))]
    async fn create_action(&self, input: CreateActionInput) -> DomainResult<Action> {
        let conn = self
            .client
            .get_connection()
            .await
            .map_err(DomainError::RepositoryError)?;

        let result = conn
            .query_one(
                "INSERT INTO action (action_id, org_id, device_id, action, status, message)
                 VALUES ($1, $2, $3, $4, $5, $6)
                 RETURNING action_id, org_id, device_id, action, status, message, created, modified",
                &[
                    &input.action_id,
                    &input.org_id,
                    &input.device_id,
                    &input.action.as_str(),
                    &input.status.as_str(),
                    &input.message,
                ],
            )
            .await;

        match result {
            Ok(row) => {
                debug!("action recorded");
                action_from_row(&row)
            }
            Err(e) if e.code() == Some(&SqlState::UNIQUE_VIOLATION) => {
                Err(DomainError::ActionAlreadyExists(input.action_id))
            }
            Err(e) => Err(repo_err(e)),
        }
    }

    #[instrument(skip(self, message), fields(status = %status.as_str()))]
    async fn update_action(
        &self,
        action_id: &str,
        status: ActionStatus,
        message: &str,
    ) -> DomainResult<()> {
        let conn = self
            .client
            .get_connection()
            .await
            .map_err(DomainError::RepositoryError)?;

        let rows = conn
            .execute(
                "UPDATE action SET status = $2, message = $3, modified = now()
                 WHERE action_id = $1",
                &[&action_id, &status.as_str(), &message],
            )
            .await
            .map_err(repo_err)?;

        if rows == 0 {
            return Err(DomainError::ActionNotFound(action_id.to_string()));
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn list_actions_for_device(
        &self,
        org_id: &str,
        device_id_or_serial: &str,
    ) -> DomainResult<Vec<Action>> {
        let conn = self
            .client
            .get_connection()
            .await
            .map_err(DomainError::RepositoryError)?;

        // actions are keyed by device id; a serial is resolved through the device table
        let rows = conn
            .query(
                "SELECT a.action_id, a.org_id, a.device_id, a.action, a.status, a.message, a.created, a.modified
                 FROM action a
                 WHERE a.org_id = $1
                   AND (a.device_id = $2
                        OR a.device_id IN (SELECT d.device_id FROM device d WHERE d.serial = $2))
                 ORDER BY a.modified ASC, a.id ASC",
                &[&org_id, &device_id_or_serial],
            )
            .await
            .map_err(repo_err)?;

        let mut actions = Vec::with_capacity(rows.len());
        for row in &rows {
            match action_from_row(row) {
                Ok(action) => actions.push(action),
                Err(e) => warn!(error = %e, "skipping unreadable action row"),
            }
        }
        Ok(actions)
    }
}
