use crate::domain::result::DomainResult;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Snap that every device of a model must have installed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequiredSnap {
    pub name: String,
}

/// Device model and its required snaps
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DeviceModel {
    pub name: String,
    pub required_snaps: Vec<RequiredSnap>,
}

#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait DeviceModelRepository: Send + Sync {
    /// Required snaps of a model; an unknown model yields an empty list
    async fn get_model_required_snaps(&self, model: &str) -> DomainResult<DeviceModel>;

    /// Replace the required snaps of a model, creating the model if needed
    async fn set_model_required_snaps(&self, model: &str, snaps: Vec<String>) -> DomainResult<()>;
}
