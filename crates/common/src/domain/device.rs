use crate::domain::result::DomainResult;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Visibility of soft-deleted rows on a read path
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Scope {
    /// Tombstoned rows are hidden
    #[default]
    Live,
    /// Tombstoned rows are returned with `deleted_at` set
    Unscoped,
}

/// Device entity: the identity part of a device twin
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Device {
    pub id: i64,
    pub device_id: String,
    pub org_id: String,
    pub brand: String,
    pub model: String,
    pub serial: String,
    pub device_key: String,
    pub store_id: String,
    pub active: bool,
    pub last_refresh: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl Device {
    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    /// True when `id_or_serial` names this device by either key
    pub fn matches(&self, id_or_serial: &str) -> bool {
        self.device_id == id_or_serial || self.serial == id_or_serial
    }
}

/// Input for registering a new device
#[derive(Debug, Clone, PartialEq)]
pub struct CreateDeviceInput {
    pub device_id: String,
    pub org_id: String,
    pub brand: String,
    pub model: String,
    pub serial: String,
    pub device_key: String,
    pub store_id: String,
    pub active: bool,
    pub last_refresh: DateTime<Utc>,
}

/// OS version details reported by a device (1:1 with Device)
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DeviceVersion {
    pub device_id: String,
    pub version: String,
    pub series: String,
    pub os_id: String,
    pub os_version_id: String,
    pub on_classic: bool,
    pub kernel_version: String,
}

/// Status of a single service exposed by a snap
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ServiceStatus {
    pub name: String,
    pub daemon: String,
    pub enabled: bool,
    pub active: bool,
}

/// A snap installed on a device, keyed by `(device_id, name)`
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DeviceSnap {
    pub device_id: String,
    pub name: String,
    pub installed_size: i64,
    pub installed_date: Option<DateTime<Utc>>,
    pub status: String,
    pub channel: String,
    pub confinement: String,
    pub version: String,
    pub revision: String,
    pub devmode: bool,
    pub config: String,
    pub services: Vec<ServiceStatus>,
}

/// Repository trait for device twin persistence
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait DeviceRepository: Send + Sync {
    /// Create a device. Fails with `DeviceAlreadyExists` when the device id or
    /// serial is taken, including by a soft-deleted row.
    async fn create_device(&self, input: CreateDeviceInput) -> DomainResult<Device>;

    /// Resolve a device by device id or serial
    async fn get_device(&self, id_or_serial: &str, scope: Scope) -> DomainResult<Option<Device>>;

    /// Update `last_refresh` of a live device
    async fn ping_device(&self, device_id: &str, refresh: DateTime<Utc>) -> DomainResult<()>;

    /// Soft delete a device, removing its version, snaps and group links
    async fn delete_device(&self, device_id: &str) -> DomainResult<()>;

    /// List live devices of an organization
    async fn list_devices(&self, org_id: &str) -> DomainResult<Vec<Device>>;

    /// Upsert a snap and its services atomically
    async fn upsert_device_snap(&self, snap: DeviceSnap) -> DomainResult<()>;

    /// List snaps (with services) installed on a device
    async fn list_device_snaps(&self, device_id: &str) -> DomainResult<Vec<DeviceSnap>>;

    async fn upsert_device_version(&self, version: DeviceVersion) -> DomainResult<()>;

    async fn get_device_version(&self, device_id: &str) -> DomainResult<Option<DeviceVersion>>;

    async fn delete_device_version(&self, device_id: &str) -> DomainResult<()>;
}
