use crate::domain::device::Device;
use crate::domain::result::DomainResult;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Named collection of devices within an organization
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Group {
    pub id: i64,
    pub org_id: String,
    pub name: String,
    pub created_at: Option<DateTime<Utc>>,
}

/// Repository trait for device groups. Groups are addressed by `(org_id, name)`.
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait GroupRepository: Send + Sync {
    async fn create_group(&self, org_id: &str, name: &str) -> DomainResult<Group>;

    async fn list_groups(&self, org_id: &str) -> DomainResult<Vec<Group>>;

    async fn get_group(&self, org_id: &str, name: &str) -> DomainResult<Option<Group>>;

    /// Link a device to a group. Linking an already linked device is a no-op.
    async fn link_device(&self, org_id: &str, name: &str, device_id: &str) -> DomainResult<()>;

    async fn unlink_device(&self, org_id: &str, name: &str, device_id: &str) -> DomainResult<()>;

    /// Live devices linked to the group
    async fn group_devices(&self, org_id: &str, name: &str) -> DomainResult<Vec<Device>>;

    /// Live devices of the organization that are not linked to the group
    async fn excluded_devices(&self, org_id: &str, name: &str) -> DomainResult<Vec<Device>>;
}
