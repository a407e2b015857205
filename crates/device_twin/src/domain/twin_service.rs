use crate::domain::{
    parse_result, task_result, Health, OrganizationAccess, PublishDevice, PublishDeviceVersion,
    PublishSnap, PublishSnaps,
};
use chrono::Utc;
use common::domain::{
    Action, ActionKind, ActionRepository, ActionStatus, CreateDeviceInput, Device,
    DeviceRepository, DeviceSnap, DeviceVersion, DomainError, DomainResult, HealthHash,
    HealthHashRepository, Scope,
};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// Result of applying a health beat
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthOutcome {
    /// Stored hashes were created or differ from the beat
    Changed,
    /// Only `last_refresh` moved
    Unchanged,
}

/// Applies device messages to the twin store and exposes the twin read surface
pub struct TwinService {
    devices: Arc<dyn DeviceRepository>,
    actions: Arc<dyn ActionRepository>,
    health: Arc<dyn HealthHashRepository>,
    access: Arc<OrganizationAccess>,
}

impl TwinService {
    pub fn new(
        devices: Arc<dyn DeviceRepository>,
        actions: Arc<dyn ActionRepository>,
        health: Arc<dyn HealthHashRepository>,
        access: Arc<OrganizationAccess>,
    ) -> Self {
        Self {
            devices,
            actions,
            health,
            access,
        }
    }

    /// Record a heartbeat. Fails with `UnknownDevice` when no live device has
    /// the beat's id; beats are keyed by device id, never by serial.
    #[instrument(skip(self, health), fields(device_id = %health.device_id, org_id = %health.org_id))]
    pub async fn health_beat(&self, health: &Health) -> DomainResult<HealthOutcome> {
        let known = self
            .devices
            .get_device(&health.device_id, Scope::Live)
            .await?
            .is_some_and(|device| device.device_id == health.device_id);
        if !known {
            return Err(DomainError::UnknownDevice(health.device_id.clone()));
        }

        let refresh = health.refresh.unwrap_or_else(Utc::now);
        let changed = self
            .health
            .upsert_health_hash(HealthHash {
                org_id: health.org_id.clone(),
                device_id: health.device_id.clone(),
                snap_list_hash: health.snap_list_hash.clone(),
                installed_snaps_hash: health.installed_snaps_hash.clone(),
                last_refresh: refresh,
            })
            .await?;

        self.devices.ping_device(&health.device_id, refresh).await?;

        if changed {
            debug!("health hashes changed");
            Ok(HealthOutcome::Changed)
        } else {
            Ok(HealthOutcome::Unchanged)
        }
    }

    /// Apply a successful action response and complete its action-log row.
    ///
    /// The row is set to `error` when the handler fails. A failing log update
    /// is only logged; the handler result is what the caller gets.
    #[instrument(skip(self, result), fields(device_id = %device_id, action_id = %action_id, action = %action))]
    pub async fn action_response(
        &self,
        device_id: &str,
        action_id: &str,
        action: &str,
        result: Option<Value>,
    ) -> DomainResult<String> {
        let outcome = self.apply_action(device_id, action, result).await;

        let (status, message) = match &outcome {
            Ok(message) => (ActionStatus::Complete, message.clone()),
            Err(e) => (ActionStatus::Error, e.to_string()),
        };
        if let Err(e) = self.actions.update_action(action_id, status, &message).await {
            warn!(error = %e, "failed to update action log");
        }

        outcome
    }

    /// Mark an action as failed with the device's message
    #[instrument(skip(self, message))]
    pub async fn action_failed(&self, action_id: &str, message: &str) -> DomainResult<()> {
        self.actions
            .update_action(action_id, ActionStatus::Error, message)
            .await
    }

    async fn apply_action(
        &self,
        device_id: &str,
        action: &str,
        result: Option<Value>,
    ) -> DomainResult<String> {
        match action.parse::<ActionKind>()? {
            ActionKind::Device => {
                self.register_device(device_id, parse_result(result)?).await?;
                Ok(String::new())
            }
            ActionKind::List => {
                let snaps: PublishSnaps = parse_result(result)?;
                let device = self.require_device(device_id).await?;
                for snap in snaps {
                    self.devices
                        .upsert_device_snap(snap.into_device_snap(&device.device_id))
                        .await?;
                }
                Ok(String::new())
            }
            ActionKind::Conf | ActionKind::Info => {
                let snap: PublishSnap = parse_result(result)?;
                let device = self.require_device(device_id).await?;
                self.devices
                    .upsert_device_snap(snap.into_device_snap(&device.device_id))
                    .await?;
                Ok(String::new())
            }
            ActionKind::Server => {
                let version: PublishDeviceVersion = parse_result(result)?;
                let device = self.require_device(device_id).await?;
                self.devices
                    .upsert_device_version(version.into_device_version(&device.device_id))
                    .await?;
                Ok(String::new())
            }
            ActionKind::Unregister => {
                let published: PublishDevice = parse_result(result)?;
                if !published.device_id.is_empty() && published.device_id != device_id {
                    return Err(DomainError::PayloadError(format!(
                        "unregister for {} received from {}",
                        published.device_id, device_id
                    )));
                }
                self.devices.delete_device(device_id).await?;
                info!("device unregistered");
                Ok(String::new())
            }
            ActionKind::Install
            | ActionKind::Remove
            | ActionKind::Refresh
            | ActionKind::Revert
            | ActionKind::Enable
            | ActionKind::Disable
            | ActionKind::Setconf
            | ActionKind::Start
            | ActionKind::Stop
            | ActionKind::Switch
            | ActionKind::Restart
            | ActionKind::Snapshot
            | ActionKind::Logs
            | ActionKind::User => Ok(task_result(result)),
            ActionKind::Ack => Err(DomainError::UnhandledAction(action.to_string())),
        }
    }

    async fn register_device(&self, device_id: &str, published: PublishDevice) -> DomainResult<()> {
        let device_id = if published.device_id.is_empty() {
            device_id.to_string()
        } else {
            published.device_id
        };

        // a tombstoned device keeps its identifiers
        if self
            .devices
            .get_device(&device_id, Scope::Unscoped)
            .await?
            .is_some()
        {
            return Err(DomainError::DeviceAlreadyExists(device_id));
        }

        let device = self
            .devices
            .create_device(CreateDeviceInput {
                device_id,
                org_id: published.org_id,
                brand: published.brand,
                model: published.model,
                serial: published.serial,
                device_key: published.device_key,
                store_id: published.store_id,
                active: true,
                last_refresh: Utc::now(),
            })
            .await?;

        if let Some(version) = published.version.filter(|v| !v.device_id.is_empty()) {
            self.devices
                .upsert_device_version(version.into_device_version(&device.device_id))
                .await?;
        }

        info!(device_id = %device.device_id, serial = %device.serial, "device registered");
        Ok(())
    }

    async fn require_device(&self, device_id: &str) -> DomainResult<Device> {
        self.devices
            .get_device(device_id, Scope::Live)
            .await?
            .ok_or_else(|| DomainError::DeviceNotFound(device_id.to_string()))
    }

    /// Device of an organization; a tombstoned device is only returned unscoped
    #[instrument(skip(self))]
    pub async fn get_device(
        &self,
        org_id: &str,
        device_id_or_serial: &str,
        scope: Scope,
    ) -> DomainResult<Device> {
        self.access
            .device_in_org(org_id, device_id_or_serial, scope)
            .await
    }

    #[instrument(skip(self))]
    pub async fn list_devices(&self, org_id: &str) -> DomainResult<Vec<Device>> {
        let organization = self.access.organization(org_id).await?;
        self.devices.list_devices(&organization.org_id).await
    }

    #[instrument(skip(self))]
    pub async fn device_snaps(
        &self,
        org_id: &str,
        device_id_or_serial: &str,
    ) -> DomainResult<Vec<DeviceSnap>> {
        let device = self
            .access
            .device_in_org(org_id, device_id_or_serial, Scope::Live)
            .await?;
        self.devices.list_device_snaps(&device.device_id).await
    }

    #[instrument(skip(self))]
    pub async fn device_version(
        &self,
        org_id: &str,
        device_id_or_serial: &str,
    ) -> DomainResult<DeviceVersion> {
        let device = self
            .access
            .device_in_org(org_id, device_id_or_serial, Scope::Live)
            .await?;
        self.devices
            .get_device_version(&device.device_id)
            .await?
            .ok_or_else(|| DomainError::DeviceNotFound(device.device_id))
    }

    #[instrument(skip(self))]
    pub async fn device_actions(
        &self,
        org_id: &str,
        device_id_or_serial: &str,
    ) -> DomainResult<Vec<Action>> {
        let device = self
            .access
            .device_in_org(org_id, device_id_or_serial, Scope::Unscoped)
            .await?;
        self.actions
            .list_actions_for_device(&device.org_id, &device.device_id)
            .await
    }

    /// Soft delete a device of an organization
    #[instrument(skip(self))]
    pub async fn delete_device(&self, org_id: &str, device_id_or_serial: &str) -> DomainResult<()> {
        let device = self
            .access
            .device_in_org(org_id, device_id_or_serial, Scope::Live)
            .await?;
        self.devices.delete_device(&device.device_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::domain::{
        MockActionRepository, MockDeviceRepository, MockHealthHashRepository,
        MockOrganizationRepository,
    };
    use serde_json::json;

    fn device() -> Device {
        Device {
            id: 1,
            device_id: "a111".to_string(),
            org_id: "abc".to_string(),
            brand: "example".to_string(),
            model: "drone-1000".to_string(),
            serial: "DR1000A111".to_string(),
            device_key: String::new(),
            store_id: String::new(),
            active: true,
            last_refresh: Utc::now(),
            deleted_at: None,
            created_at: None,
            updated_at: None,
        }
    }

    fn health() -> Health {
        Health {
            device_id: "a111".to_string(),
            org_id: "abc".to_string(),
            refresh: None,
            snap_list_hash: "h1".to_string(),
            installed_snaps_hash: "i1".to_string(),
        }
    }

    fn service(
        devices: MockDeviceRepository,
        actions: MockActionRepository,
        health: MockHealthHashRepository,
    ) -> TwinService {
        let devices: Arc<dyn DeviceRepository> = Arc::new(devices);
        let access = Arc::new(OrganizationAccess::new(
            Arc::new(MockOrganizationRepository::new()),
            devices.clone(),
        ));
        TwinService::new(devices, Arc::new(actions), Arc::new(health), access)
    }

    #[tokio::test]
    async fn test_health_beat_unknown_device() {
        let mut devices = MockDeviceRepository::new();
        devices.expect_get_device().returning(|_, _| Ok(None));
        let mut health_repo = MockHealthHashRepository::new();
        health_repo.expect_upsert_health_hash().times(0);

        let twin = service(devices, MockActionRepository::new(), health_repo);
        let result = twin.health_beat(&health()).await;
        assert!(matches!(result, Err(DomainError::UnknownDevice(_))));
    }

    #[tokio::test]
    async fn test_health_beat_unchanged_only_pings() {
        let mut devices = MockDeviceRepository::new();
        devices
            .expect_get_device()
            .returning(|_, _| Ok(Some(device())));
        devices.expect_ping_device().times(1).returning(|_, _| Ok(()));
        let mut health_repo = MockHealthHashRepository::new();
        health_repo
            .expect_upsert_health_hash()
            .returning(|_| Ok(false));

        let twin = service(devices, MockActionRepository::new(), health_repo);
        assert_eq!(
            twin.health_beat(&health()).await.unwrap(),
            HealthOutcome::Unchanged
        );
    }

    #[tokio::test]
    async fn test_health_beat_by_serial_is_unknown() {
        let mut devices = MockDeviceRepository::new();
        devices
            .expect_get_device()
            .returning(|_, _| Ok(Some(device())));
        devices.expect_ping_device().times(0);
        let mut health_repo = MockHealthHashRepository::new();
        health_repo.expect_upsert_health_hash().times(0);

        let twin = service(devices, MockActionRepository::new(), health_repo);
        let beat = Health {
            device_id: "DR1000A111".to_string(),
            ..health()
        };
        let result = twin.health_beat(&beat).await;
        assert!(matches!(result, Err(DomainError::UnknownDevice(_))));
    }

    #[tokio::test]
    async fn test_task_action_records_result_as_message() {
        let mut actions = MockActionRepository::new();
        actions
            .expect_update_action()
            .withf(|id: &str, status: &ActionStatus, message: &str| {
                id == "A9" && *status == ActionStatus::Complete && message == "1234"
            })
            .times(1)
            .returning(|_, _, _| Ok(()));

        let twin = service(
            MockDeviceRepository::new(),
            actions,
            MockHealthHashRepository::new(),
        );
        let message = twin
            .action_response("a111", "A9", "install", Some(json!("1234")))
            .await
            .unwrap();
        assert_eq!(message, "1234");
    }

    #[tokio::test]
    async fn test_unhandled_action_marks_row_error() {
        let mut actions = MockActionRepository::new();
        actions
            .expect_update_action()
            .withf(|_: &str, status: &ActionStatus, _: &str| *status == ActionStatus::Error)
            .times(1)
            .returning(|_, _, _| Ok(()));

        let twin = service(
            MockDeviceRepository::new(),
            actions,
            MockHealthHashRepository::new(),
        );
        let result = twin.action_response("a111", "A9", "reboot", None).await;
        assert!(matches!(result, Err(DomainError::UnhandledAction(_))));
    }

    #[tokio::test]
    async fn test_log_update_failure_does_not_mask_result() {
        let mut actions = MockActionRepository::new();
        actions
            .expect_update_action()
            .returning(|id, _, _| Err(DomainError::ActionNotFound(id.to_string())));

        let twin = service(
            MockDeviceRepository::new(),
            actions,
            MockHealthHashRepository::new(),
        );
        let result = twin
            .action_response("a111", "missing", "refresh", Some(json!("7")))
            .await;
        assert_eq!(result.unwrap(), "7");
    }

    #[tokio::test]
    async fn test_device_response_for_existing_device_fails() {
        let mut devices = MockDeviceRepository::new();
        devices
            .expect_get_device()
            .returning(|_, _| Ok(Some(device())));
        devices.expect_create_device().times(0);
        let mut actions = MockActionRepository::new();
        actions.expect_update_action().returning(|_, _, _| Ok(()));

        let twin = service(devices, actions, MockHealthHashRepository::new());
        let result = twin
            .action_response("a111", "A1", "device", Some(json!({"deviceId": "a111"})))
            .await;
        assert!(matches!(result, Err(DomainError::DeviceAlreadyExists(_))));
    }
}
