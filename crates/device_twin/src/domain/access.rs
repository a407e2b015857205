use common::domain::{
    Actor, Device, DeviceRepository, DomainError, DomainResult, Organization,
    OrganizationRepository, Scope,
};
use std::sync::Arc;
use tracing::debug;

/// Organization resolution and user access checks shared by the services
pub struct OrganizationAccess {
    organizations: Arc<dyn OrganizationRepository>,
    devices: Arc<dyn DeviceRepository>,
}

impl OrganizationAccess {
    pub fn new(
        organizations: Arc<dyn OrganizationRepository>,
        devices: Arc<dyn DeviceRepository>,
    ) -> Self {
        Self {
            organizations,
            devices,
        }
    }

    /// Resolve an organization by id, then by name
    pub async fn organization(&self, org_id_or_name: &str) -> DomainResult<Organization> {
        self.organizations
            .get_organization(org_id_or_name)
            .await?
            .ok_or_else(|| DomainError::OrganizationNotFound(org_id_or_name.to_string()))
    }

    /// Resolve the organization and require the actor to be linked to it.
    /// Superusers are linked to every organization.
    pub async fn authorize(&self, actor: &Actor, org_id_or_name: &str) -> DomainResult<Organization> {
        let organization = self.organization(org_id_or_name).await?;
        if actor.is_superuser() {
            return Ok(organization);
        }

        if !self
            .organizations
            .user_has_access(&organization.org_id, &actor.username)
            .await?
        {
            debug!(username = %actor.username, org_id = %organization.org_id, "access denied");
            return Err(DomainError::Unauthorized(format!(
                "user {} has no access to organization {}",
                actor.username, organization.org_id
            )));
        }
        Ok(organization)
    }

    /// Resolve a device by id or serial and require it to belong to `org_id_or_name`.
    /// A device of another organization is reported as not found.
    pub async fn device_in_org(
        &self,
        org_id_or_name: &str,
        device_id_or_serial: &str,
        scope: Scope,
    ) -> DomainResult<Device> {
        let not_found = || DomainError::DeviceNotFound(device_id_or_serial.to_string());

        let device = self
            .devices
            .get_device(device_id_or_serial, scope)
            .await?
            .ok_or_else(not_found)?;

        if device.org_id == org_id_or_name {
            return Ok(device);
        }

        match self.organizations.get_organization(org_id_or_name).await? {
            Some(org) if org.org_id == device.org_id || org.name == device.org_id => Ok(device),
            _ => Err(not_found()),
        }
    }
}
