use crate::domain::result::DomainResult;
use async_trait::async_trait;

/// Process-wide string settings persisted with the domain rows
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait SettingRepository: Send + Sync {
    async fn get_setting(&self, key: &str) -> DomainResult<Option<String>>;

    async fn set_setting(&self, key: &str, value: &str) -> DomainResult<()>;
}
