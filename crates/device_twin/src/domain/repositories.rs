use common::domain::{
    ActionRepository, DeviceModelRepository, DeviceRepository, GroupRepository,
    HealthHashRepository, OrganizationRepository, SettingRepository,
};
use common::memory::InMemoryStore;
use common::postgres::{
    PostgresActionRepository, PostgresClient, PostgresDeviceModelRepository,
    PostgresDeviceRepository, PostgresGroupRepository, PostgresHealthHashRepository,
    PostgresOrganizationRepository, PostgresSettingRepository,
};
use std::sync::Arc;

/// Every store seam the device twin needs, behind trait objects
#[derive(Clone)]
pub struct Repositories {
    pub devices: Arc<dyn DeviceRepository>,
    pub actions: Arc<dyn ActionRepository>,
    pub organizations: Arc<dyn OrganizationRepository>,
    pub groups: Arc<dyn GroupRepository>,
    pub health: Arc<dyn HealthHashRepository>,
    pub models: Arc<dyn DeviceModelRepository>,
    pub settings: Arc<dyn SettingRepository>,
}

impl Repositories {
    pub fn in_memory(store: InMemoryStore) -> Self {
        let store = Arc::new(store);
        Self {
            devices: store.clone(),
            actions: store.clone(),
            organizations: store.clone(),
            groups: store.clone(),
            health: store.clone(),
            models: store.clone(),
            settings: store,
        }
    }

    pub fn postgres(client: PostgresClient) -> Self {
        Self {
            devices: Arc::new(PostgresDeviceRepository::new(client.clone())),
            actions: Arc::new(PostgresActionRepository::new(client.clone())),
            organizations: Arc::new(PostgresOrganizationRepository::new(client.clone())),
            groups: Arc::new(PostgresGroupRepository::new(client.clone())),
            health: Arc::new(PostgresHealthHashRepository::new(client.clone())),
            models: Arc::new(PostgresDeviceModelRepository::new(client.clone())),
            settings: Arc::new(PostgresSettingRepository::new(client)),
        }
    }
}
