use crate::domain::{
    CreateDeviceInput, Device, DeviceRepository, DeviceSnap, DeviceVersion, DomainError,
    DomainResult, Scope, ServiceStatus,
};
use crate::postgres::{repo_err, PostgresClient};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio_postgres::error::SqlState;
use tokio_postgres::Row;
use tracing::{debug, info, instrument};

const DEVICE_COLUMNS: &str = "id, device_id, org_id, brand, model, serial, device_key, store_id, \
     active, last_refresh, deleted_at, created_at, updated_at";

pub(crate) fn device_from_row(row: &Row) -> Device {
    Device {
        id: row.get("id"),
        device_id: row.get("device_id"),
        org_id: row.get("org_id"),
        brand: row.get("brand"),
        model: row.get("model"),
        serial: row.get("serial"),
        device_key: row.get("device_key"),
        store_id: row.get("store_id"),
        active: row.get("active"),
        last_refresh: row.get("last_refresh"),
        deleted_at: row.get("deleted_at"),
        created_at: Some(row.get("created_at")),
        updated_at: Some(row.get("updated_at")),
    }
}

/// Column list of `device` qualified with the given alias, for joins
pub(crate) fn device_columns(alias: &str) -> String {
    DEVICE_COLUMNS
        .split(", ")
        .map(|c| format!("{}.{}", alias, c.trim()))
        .collect::<Vec<_>>()
        .join(", ")
}

/// PostgreSQL implementation of DeviceRepository
#[derive(Clone)]
pub struct PostgresDeviceRepository {
    client: PostgresClient,
}

impl PostgresDeviceRepository {
    pub fn new(client: PostgresClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl DeviceRepository for PostgresDeviceRepository {
    #[instrument(skip(self, input), fields(device_id = %input.device_id, serial = %input.serial))]
    async fn create_device(&self, input: CreateDeviceInput) -> DomainResult<Device> {
        let conn = self
            .client
            .get_connection()
            .await
            .map_err(DomainError::RepositoryError)?;

        let result = conn
            .query_one(
                &format!(
                    "INSERT INTO device (device_id, org_id, brand, model, serial, device_key, store_id, active, last_refresh)
                     VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                     RETURNING {}",
                    DEVICE_COLUMNS
                ),
                &[
                    &input.device_id,
                    &input.org_id,
                    &input.brand,
                    &input.model,
                    &input.serial,
                    &input.device_key,
                    &input.store_id,
                    &input.active,
                    &input.last_refresh,
                ],
            )
            .await;

        match result {
            Ok(row) => {
                info!("device created in database");
                Ok(device_from_row(&row))
            }
            Err(e) if e.code() == Some(&SqlState::UNIQUE_VIOLATION) => {
                Err(DomainError::DeviceAlreadyExists(input.device_id))
            }
            Err(e) => Err(repo_err(e)),
        }
    }

    #[instrument(skip(self))]
    async fn get_device(&self, id_or_serial: &str, scope: Scope) -> DomainResult<Option<Device>> {
        let conn = self
            .client
            .get_connection()
            .await
            .map_err(DomainError::RepositoryError)?;

        let tombstone_filter = match scope {
            Scope::Live => "AND deleted_at IS NULL",
            Scope::Unscoped => "",
        };

        // device id wins over serial when both match different rows
        let row = conn
            .query_opt(
                &format!(
                    "SELECT {} FROM device
                     WHERE (device_id = $1 OR serial = $1) {}
                     ORDER BY (device_id = $1) DESC
                     LIMIT 1",
                    DEVICE_COLUMNS, tombstone_filter
                ),
                &[&id_or_serial],
            )
            .await
            .map_err(repo_err)?;

        Ok(row.as_ref().map(device_from_row))
    }

    #[instrument(skip(self))]
    async fn ping_device(&self, device_id: &str, refresh: DateTime<Utc>) -> DomainResult<()> {
        let conn = self
            .client
            .get_connection()
            .await
            .map_err(DomainError::RepositoryError)?;

        let rows = conn
            .execute(
                "UPDATE device SET last_refresh = $2, updated_at = now()
                 WHERE device_id = $1 AND deleted_at IS NULL",
                &[&device_id, &refresh],
            )
            .await
            .map_err(repo_err)?;

        if rows == 0 {
            return Err(DomainError::DeviceNotFound(device_id.to_string()));
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn delete_device(&self, device_id: &str) -> DomainResult<()> {
        let mut conn = self
            .client
            .get_connection()
            .await
            .map_err(DomainError::RepositoryError)?;

        let transaction = conn.transaction().await.map_err(repo_err)?;

        let rows = transaction
            .execute(
                "UPDATE device SET deleted_at = now(), active = FALSE, updated_at = now()
                 WHERE device_id = $1 AND deleted_at IS NULL",
                &[&device_id],
            )
            .await
            .map_err(repo_err)?;

        if rows == 0 {
            // dropping the transaction rolls it back
            return Err(DomainError::DeviceNotFound(device_id.to_string()));
        }

        transaction
            .execute("DELETE FROM device_version WHERE device_id = $1", &[&device_id])
            .await
            .map_err(repo_err)?;
        // service_status rows follow through ON DELETE CASCADE
        transaction
            .execute("DELETE FROM device_snap WHERE device_id = $1", &[&device_id])
            .await
            .map_err(repo_err)?;
        transaction
            .execute("DELETE FROM group_device_link WHERE device_id = $1", &[&device_id])
            .await
            .map_err(repo_err)?;

        transaction.commit().await.map_err(repo_err)?;

        info!(device_id = %device_id, "device soft deleted");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn list_devices(&self, org_id: &str) -> DomainResult<Vec<Device>> {
        let conn = self
            .client
            .get_connection()
            .await
            .map_err(DomainError::RepositoryError)?;

        let rows = conn
            .query(
                &format!(
                    "SELECT {} FROM device
                     WHERE org_id = $1 AND deleted_at IS NULL
                     ORDER BY id",
                    DEVICE_COLUMNS
                ),
                &[&org_id],
            )
            .await
            .map_err(repo_err)?;

        let devices: Vec<Device> = rows.iter().map(device_from_row).collect();
        debug!(count = devices.len(), "listed devices");
        Ok(devices)
    }

    #[instrument(skip(self, snap), fields(device_id = %snap.device_id, snap = %snap.name))]
    async fn upsert_device_snap(&self, snap: DeviceSnap) -> DomainResult<()> {
        let mut conn = self
            .client
            .get_connection()
            .await
            .map_err(DomainError::RepositoryError)?;

        let transaction = conn.transaction().await.map_err(repo_err)?;

        let row = transaction
            .query_one(
                "INSERT INTO device_snap (device_id, name, installed_size, installed_date, status, channel,
                                          confinement, version, revision, devmode, config)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
                 ON CONFLICT (device_id, name) DO UPDATE SET
                     installed_size = EXCLUDED.installed_size,
                     installed_date = EXCLUDED.installed_date,
                     status = EXCLUDED.status,
                     channel = EXCLUDED.channel,
                     confinement = EXCLUDED.confinement,
                     version = EXCLUDED.version,
                     revision = EXCLUDED.revision,
                     devmode = EXCLUDED.devmode,
                     config = EXCLUDED.config
                 RETURNING id",
                &[
                    &snap.device_id,
                    &snap.name,
                    &snap.installed_size,
                    &snap.installed_date,
                    &snap.status,
                    &snap.channel,
                    &snap.confinement,
                    &snap.version,
                    &snap.revision,
                    &snap.devmode,
                    &snap.config,
                ],
            )
            .await
            .map_err(|e| {
                if e.code() == Some(&SqlState::FOREIGN_KEY_VIOLATION) {
                    DomainError::DeviceNotFound(snap.device_id.clone())
                } else {
                    repo_err(e)
                }
            })?;
        let device_snap_id: i64 = row.get(0);

        for service in &snap.services {
            transaction
                .execute(
                    "INSERT INTO service_status (device_snap_id, name, daemon, enabled, active)
                     VALUES ($1, $2, $3, $4, $5)
                     ON CONFLICT (device_snap_id, name) DO UPDATE SET
                         daemon = EXCLUDED.daemon,
                         enabled = EXCLUDED.enabled,
                         active = EXCLUDED.active",
                    &[
                        &device_snap_id,
                        &service.name,
                        &service.daemon,
                        &service.enabled,
                        &service.active,
                    ],
                )
                .await
                .map_err(repo_err)?;
        }

        transaction.commit().await.map_err(repo_err)?;

        debug!(services = snap.services.len(), "device snap upserted");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn list_device_snaps(&self, device_id: &str) -> DomainResult<Vec<DeviceSnap>> {
        let conn = self
            .client
            .get_connection()
            .await
            .map_err(DomainError::RepositoryError)?;

        let snap_rows = conn
            .query(
                "SELECT id, device_id, name, installed_size, installed_date, status, channel,
                        confinement, version, revision, devmode, config
                 FROM device_snap
                 WHERE device_id = $1
                 ORDER BY name",
                &[&device_id],
            )
            .await
            .map_err(repo_err)?;

        let snap_ids: Vec<i64> = snap_rows.iter().map(|row| row.get("id")).collect();

        let service_rows = conn
            .query(
                "SELECT device_snap_id, name, daemon, enabled, active
                 FROM service_status
                 WHERE device_snap_id = ANY($1)
                 ORDER BY name",
                &[&snap_ids],
            )
            .await
            .map_err(repo_err)?;

        let mut services: HashMap<i64, Vec<ServiceStatus>> = HashMap::new();
        for row in &service_rows {
            services
                .entry(row.get("device_snap_id"))
                .or_default()
                .push(ServiceStatus {
                    name: row.get("name"),
                    daemon: row.get("daemon"),
                    enabled: row.get("enabled"),
                    active: row.get("active"),
                });
        }

        let snaps = snap_rows
            .iter()
            .map(|row| {
                let id: i64 = row.get("id");
                DeviceSnap {
                    device_id: row.get("device_id"),
                    name: row.get("name"),
                    installed_size: row.get("installed_size"),
                    installed_date: row.get("installed_date"),
                    status: row.get("status"),
                    channel: row.get("channel"),
                    confinement: row.get("confinement"),
                    version: row.get("version"),
                    revision: row.get("revision"),
                    devmode: row.get("devmode"),
                    config: row.get("config"),
                    services: services.remove(&id).unwrap_or_default(),
                }
            })
            .collect();

        Ok(snaps)
    }

    #[instrument(skip(self, version), fields(device_id = %version.device_id))]
    async fn upsert_device_version(&self, version: DeviceVersion) -> DomainResult<()> {
        let conn = self
            .client
            .get_connection()
            .await
            .map_err(DomainError::RepositoryError)?;

        conn.execute(
            "INSERT INTO device_version (device_id, version, series, os_id, os_version_id, on_classic, kernel_version)
             VALUES ($1, $2, $3, $4, $5, $6, $7)
             ON CONFLICT (device_id) DO UPDATE SET
                 version = EXCLUDED.version,
                 series = EXCLUDED.series,
                 os_id = EXCLUDED.os_id,
                 os_version_id = EXCLUDED.os_version_id,
                 on_classic = EXCLUDED.on_classic,
                 kernel_version = EXCLUDED.kernel_version",
            &[
                &version.device_id,
                &version.version,
                &version.series,
                &version.os_id,
                &version.os_version_id,
                &version.on_classic,
                &version.kernel_version,
            ],
        )
        .await
        .map_err(|e| {
            if e.code() == Some(&SqlState::FOREIGN_KEY_VIOLATION) {
                DomainError::DeviceNotFound(version.device_id.clone())
            } else {
                repo_err(e)
            }
        })?;

        Ok(())
    }

    #[instrument(skip(self))]
    async fn get_device_version(&self, device_id: &str) -> DomainResult<Option<DeviceVersion>> {
        let conn = self
            .client
            .get_connection()
            .await
            .map_err(DomainError::RepositoryError)?;

        let row = conn
            .query_opt(
                "SELECT device_id, version, series, os_id, os_version_id, on_classic, kernel_version
                 FROM device_version WHERE device_id = $1",
                &[&device_id],
            )
            .await
            .map_err(repo_err)?;

        Ok(row.map(|row| DeviceVersion {
            device_id: row.get("device_id"),
            version: row.get("version"),
            series: row.get("series"),
            os_id: row.get("os_id"),
            os_version_id: row.get("os_version_id"),
            on_classic: row.get("on_classic"),
            kernel_version: row.get("kernel_version"),
        }))
    }

    #[instrument(skip(self))]
    async fn delete_device_version(&self, device_id: &str) -> DomainResult<()> {
        let conn = self
            .client
            .get_connection()
            .await
            .map_err(DomainError::RepositoryError)?;

        conn.execute("DELETE FROM device_version WHERE device_id = $1", &[&device_id])
            .await
            .map_err(repo_err)?;
        Ok(())
    }
}
