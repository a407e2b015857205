use crate::domain::result::DomainResult;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Organization owning devices, groups and users
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Organization {
    pub org_id: String,
    pub name: String,
    pub created_at: Option<DateTime<Utc>>,
}

impl Organization {
    /// True when `id_or_name` is either the id or the name of this organization
    pub fn matches(&self, id_or_name: &str) -> bool {
        self.org_id == id_or_name || self.name == id_or_name
    }
}

/// Input for creating an organization
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateOrganizationInput {
    pub org_id: String,
    pub name: String,
}

/// Repository trait for organizations and their user links
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait OrganizationRepository: Send + Sync {
    async fn create_organization(&self, input: CreateOrganizationInput) -> DomainResult<Organization>;

    /// Resolve by id first, then by name
    async fn get_organization(&self, id_or_name: &str) -> DomainResult<Option<Organization>>;

    async fn list_organizations(&self) -> DomainResult<Vec<Organization>>;

    /// Link a user to an organization (idempotent)
    async fn link_user(&self, org_id: &str, username: &str) -> DomainResult<()>;

    /// True when the user is linked to the organization
    async fn user_has_access(&self, org_id: &str, username: &str) -> DomainResult<bool>;
}
