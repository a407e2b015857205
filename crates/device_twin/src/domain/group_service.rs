use crate::domain::OrganizationAccess;
use common::domain::{Actor, Device, DomainError, DomainResult, Group, GroupRepository, Scope};
use std::sync::Arc;
use tracing::{debug, instrument};

/// Device groups of an organization
pub struct GroupService {
    groups: Arc<dyn GroupRepository>,
    access: Arc<OrganizationAccess>,
}

impl GroupService {
    pub fn new(groups: Arc<dyn GroupRepository>, access: Arc<OrganizationAccess>) -> Self {
        Self { groups, access }
    }

    #[instrument(skip(self, actor), fields(username = %actor.username))]
    pub async fn create_group(&self, actor: &Actor, org_id: &str, name: &str) -> DomainResult<Group> {
        if name.trim().is_empty() {
            return Err(DomainError::InvalidArgument(
                "group name cannot be empty".to_string(),
            ));
        }
        let organization = self.access.authorize(actor, org_id).await?;
        let group = self.groups.create_group(&organization.org_id, name).await?;
        debug!(group_id = group.id, "created group");
        Ok(group)
    }

    #[instrument(skip(self, actor), fields(username = %actor.username))]
    pub async fn list_groups(&self, actor: &Actor, org_id: &str) -> DomainResult<Vec<Group>> {
        let organization = self.access.authorize(actor, org_id).await?;
        self.groups.list_groups(&organization.org_id).await
    }

    #[instrument(skip(self, actor), fields(username = %actor.username))]
    pub async fn get_group(&self, actor: &Actor, org_id: &str, name: &str) -> DomainResult<Group> {
        let organization = self.access.authorize(actor, org_id).await?;
        self.groups
            .get_group(&organization.org_id, name)
            .await?
            .ok_or_else(|| DomainError::GroupNotFound(name.to_string()))
    }

    /// Link a device, given by id or serial, to a group. Linking twice is a no-op.
    #[instrument(skip(self, actor), fields(username = %actor.username))]
    pub async fn link_device(
        &self,
        actor: &Actor,
        org_id: &str,
        name: &str,
        device_id_or_serial: &str,
    ) -> DomainResult<()> {
        let organization = self.access.authorize(actor, org_id).await?;
        let device = self
            .access
            .device_in_org(&organization.org_id, device_id_or_serial, Scope::Live)
            .await?;
        self.groups
            .link_device(&organization.org_id, name, &device.device_id)
            .await
    }

    #[instrument(skip(self, actor), fields(username = %actor.username))]
    pub async fn unlink_device(
        &self,
        actor: &Actor,
        org_id: &str,
        name: &str,
        device_id_or_serial: &str,
    ) -> DomainResult<()> {
        let organization = self.access.authorize(actor, org_id).await?;
        let device = self
            .access
            .device_in_org(&organization.org_id, device_id_or_serial, Scope::Live)
            .await?;
        self.groups
            .unlink_device(&organization.org_id, name, &device.device_id)
            .await
    }

    #[instrument(skip(self, actor), fields(username = %actor.username))]
    pub async fn group_devices(&self, actor: &Actor, org_id: &str, name: &str) -> DomainResult<Vec<Device>> {
        let organization = self.access.authorize(actor, org_id).await?;
        self.groups.group_devices(&organization.org_id, name).await
    }

    /// Devices of the organization that are not in the group
    #[instrument(skip(self, actor), fields(username = %actor.username))]
    pub async fn excluded_devices(
        &self,
        actor: &Actor,
        org_id: &str,
        name: &str,
    ) -> DomainResult<Vec<Device>> {
        let organization = self.access.authorize(actor, org_id).await?;
        self.groups.excluded_devices(&organization.org_id, name).await
    }
}
