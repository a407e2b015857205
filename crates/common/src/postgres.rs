mod action_repository;
mod client;
mod config;
mod device_model_repository;
mod device_repository;
mod group_repository;
mod health_hash_repository;
mod organization_repository;
mod setting_repository;

pub use action_repository::*;
pub use client::*;
pub use config::*;
pub use device_model_repository::*;
pub use device_repository::*;
pub use group_repository::*;
pub use health_hash_repository::*;
pub use organization_repository::*;
pub use setting_repository::*;

use crate::domain::DomainError;

pub(crate) fn repo_err(e: tokio_postgres::Error) -> DomainError {
    DomainError::RepositoryError(e.into())
}
