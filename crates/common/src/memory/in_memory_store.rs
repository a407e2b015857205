use crate::domain::{
    Action, ActionRepository, ActionStatus, CreateActionInput, CreateDeviceInput,
    CreateOrganizationInput, Device, DeviceModel, DeviceModelRepository, DeviceRepository,
    DeviceSnap, DeviceVersion, DomainError, DomainResult, Group, GroupRepository, HealthHash,
    HealthHashRepository, Organization, OrganizationRepository, RequiredSnap, Scope,
    SettingRepository,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, instrument};

#[derive(Default)]
struct MemoryState {
    next_id: i64,
    organizations: Vec<Organization>,
    organization_users: HashSet<(String, String)>,
    devices: Vec<Device>,
    versions: HashMap<String, DeviceVersion>,
    snaps: Vec<DeviceSnap>,
    actions: Vec<Action>,
    health: HashMap<(String, String), HealthHash>,
    groups: Vec<Group>,
    group_links: Vec<(i64, String)>,
    models: HashMap<String, Vec<String>>,
    settings: HashMap<String, String>,
}

impl MemoryState {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }

    /// Device id wins over serial when both match different rows
    fn find_device(&self, id_or_serial: &str, scope: Scope) -> Option<&Device> {
        let visible = |d: &&Device| scope == Scope::Unscoped || !d.is_deleted();
        self.devices
            .iter()
            .filter(visible)
            .find(|d| d.device_id == id_or_serial)
            .or_else(|| {
                self.devices
                    .iter()
                    .filter(visible)
                    .find(|d| d.serial == id_or_serial)
            })
    }

    fn live_device_mut(&mut self, device_id: &str) -> Option<&mut Device> {
        self.devices
            .iter_mut()
            .find(|d| d.device_id == device_id && !d.is_deleted())
    }

    fn group_id(&self, org_id: &str, name: &str) -> DomainResult<i64> {
        self.groups
            .iter()
            .find(|g| g.org_id == org_id && g.name == name)
            .map(|g| g.id)
            .ok_or_else(|| DomainError::GroupNotFound(name.to_string()))
    }
}

/// Store backed by process memory. Every repository trait is implemented on
/// the same shared state, so clones observe each other's writes.
#[derive(Clone, Default)]
pub struct InMemoryStore {
    state: Arc<RwLock<MemoryState>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DeviceRepository for InMemoryStore {
    #[instrument(skip(self, input), fields(device_id = %input.device_id))]
    async fn create_device(&self, input: CreateDeviceInput) -> DomainResult<Device> {
        let mut state = self.state.write().await;

        // tombstoned rows keep both identifiers reserved
        if state
            .devices
            .iter()
            .any(|d| d.device_id == input.device_id || d.serial == input.serial)
        {
            return Err(DomainError::DeviceAlreadyExists(input.device_id));
        }

        let now = Utc::now();
        let device = Device {
            id: state.next_id(),
            device_id: input.device_id,
            org_id: input.org_id,
            brand: input.brand,
            model: input.model,
            serial: input.serial,
            device_key: input.device_key,
            store_id: input.store_id,
            active: input.active,
            last_refresh: input.last_refresh,
            deleted_at: None,
            created_at: Some(now),
            updated_at: Some(now),
        };
        state.devices.push(device.clone());
        Ok(device)
    }

    async fn get_device(&self, id_or_serial: &str, scope: Scope) -> DomainResult<Option<Device>> {
        let state = self.state.read().await;
        Ok(state.find_device(id_or_serial, scope).cloned())
    }

    async fn ping_device(&self, device_id: &str, refresh: DateTime<Utc>) -> DomainResult<()> {
        let mut state = self.state.write().await;
        let device = state
            .live_device_mut(device_id)
            .ok_or_else(|| DomainError::DeviceNotFound(device_id.to_string()))?;
        device.last_refresh = refresh;
        device.updated_at = Some(Utc::now());
        Ok(())
    }

    #[instrument(skip(self))]
    async fn delete_device(&self, device_id: &str) -> DomainResult<()> {
        let mut state = self.state.write().await;
        let now = Utc::now();
        let device = state
            .live_device_mut(device_id)
            .ok_or_else(|| DomainError::DeviceNotFound(device_id.to_string()))?;
        device.deleted_at = Some(now);
        device.active = false;
        device.updated_at = Some(now);

        state.versions.remove(device_id);
        state.snaps.retain(|s| s.device_id != device_id);
        state.group_links.retain(|(_, d)| d != device_id);
        debug!("device soft deleted");
        Ok(())
    }

    async fn list_devices(&self, org_id: &str) -> DomainResult<Vec<Device>> {
        let state = self.state.read().await;
        Ok(state
            .devices
            .iter()
            .filter(|d| d.org_id == org_id && !d.is_deleted())
            .cloned()
            .collect())
    }

    #[instrument(skip(self, snap), fields(device_id = %snap.device_id, snap = %snap.name))]
    async fn upsert_device_snap(&self, snap: DeviceSnap) -> DomainResult<()> {
        // Validate the whole write before touching state so a failed service
        // row leaves the parent snap as it was.
        if snap.name.is_empty() {
            return Err(DomainError::InvalidArgument("snap name is empty".to_string()));
        }
        if snap.services.iter().any(|s| s.name.is_empty()) {
            return Err(DomainError::InvalidArgument(format!(
                "service with empty name in snap {}",
                snap.name
            )));
        }

        let mut state = self.state.write().await;
        if state.find_device(&snap.device_id, Scope::Live).is_none() {
            return Err(DomainError::DeviceNotFound(snap.device_id));
        }

        match state
            .snaps
            .iter_mut()
            .find(|s| s.device_id == snap.device_id && s.name == snap.name)
        {
            Some(existing) => {
                let mut services = std::mem::take(&mut existing.services);
                for service in snap.services {
                    match services.iter_mut().find(|s| s.name == service.name) {
                        Some(current) => *current = service,
                        None => services.push(service),
                    }
                }
                services.sort_by(|a, b| a.name.cmp(&b.name));
                *existing = DeviceSnap { services, ..snap };
            }
            None => {
                let mut snap = snap;
                snap.services.sort_by(|a, b| a.name.cmp(&b.name));
                snap.services.dedup_by(|a, b| a.name == b.name);
                state.snaps.push(snap);
            }
        }
        Ok(())
    }

    async fn list_device_snaps(&self, device_id: &str) -> DomainResult<Vec<DeviceSnap>> {
        let state = self.state.read().await;
        let mut snaps: Vec<DeviceSnap> = state
            .snaps
            .iter()
            .filter(|s| s.device_id == device_id)
            .cloned()
            .collect();
        snaps.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(snaps)
    }

    async fn upsert_device_version(&self, version: DeviceVersion) -> DomainResult<()> {
        let mut state = self.state.write().await;
        if state.find_device(&version.device_id, Scope::Live).is_none() {
            return Err(DomainError::DeviceNotFound(version.device_id));
        }
        state.versions.insert(version.device_id.clone(), version);
        Ok(())
    }

    async fn get_device_version(&self, device_id: &str) -> DomainResult<Option<DeviceVersion>> {
        let state = self.state.read().await;
        Ok(state.versions.get(device_id).cloned())
    }

    async fn delete_device_version(&self, device_id: &str) -> DomainResult<()> {
        let mut state = self.state.write().await;
        state.versions.remove(device_id);
        Ok(())
    }
}

#[async_trait]
impl ActionRepository for InMemoryStore {
    #[instrument(skip(self, input), fields(action_id = %input.action_id, action = %input.action))]
    async fn create_action(&self, input: CreateActionInput) -> DomainResult<Action> {
        let mut state = self.state.write().await;
        if state.actions.iter().any(|a| a.action_id == input.action_id) {
            return Err(DomainError::ActionAlreadyExists(input.action_id));
        }

        let now = Utc::now();
        let action = Action {
            action_id: input.action_id,
            org_id: input.org_id,
            device_id: input.device_id,
            action: input.action,
            status: input.status,
            message: input.message,
            created: now,
            modified: now,
        };
        state.actions.push(action.clone());
        Ok(action)
    }

    async fn update_action(
        &self,
        action_id: &str,
        status: ActionStatus,
        message: &str,
    ) -> DomainResult<()> {
        let mut state = self.state.write().await;
        let action = state
            .actions
            .iter_mut()
            .find(|a| a.action_id == action_id)
            .ok_or_else(|| DomainError::ActionNotFound(action_id.to_string()))?;
        action.status = status;
        action.message = message.to_string();
        action.modified = Utc::now();
        Ok(())
    }

    async fn list_actions_for_device(
        &self,
        org_id: &str,
        device_id_or_serial: &str,
    ) -> DomainResult<Vec<Action>> {
        let state = self.state.read().await;
        let serial_ids: HashSet<&str> = state
            .devices
            .iter()
            .filter(|d| d.serial == device_id_or_serial)
            .map(|d| d.device_id.as_str())
            .collect();

        let mut actions: Vec<Action> = state
            .actions
            .iter()
            .filter(|a| {
                a.org_id == org_id
                    && (a.device_id == device_id_or_serial
                        || serial_ids.contains(a.device_id.as_str()))
            })
            .cloned()
            .collect();
        // stable sort keeps insertion order for equal timestamps
        actions.sort_by_key(|a| a.modified);
        Ok(actions)
    }
}

#[async_trait]
impl OrganizationRepository for InMemoryStore {
    async fn create_organization(
        &self,
        input: CreateOrganizationInput,
    ) -> DomainResult<Organization> {
        let mut state = self.state.write().await;
        if state
            .organizations
            .iter()
            .any(|o| o.org_id == input.org_id || o.name == input.name)
        {
            return Err(DomainError::OrganizationAlreadyExists(input.org_id));
        }
        let organization = Organization {
            org_id: input.org_id,
            name: input.name,
            created_at: Some(Utc::now()),
        };
        state.organizations.push(organization.clone());
        Ok(organization)
    }

    async fn get_organization(&self, id_or_name: &str) -> DomainResult<Option<Organization>> {
        let state = self.state.read().await;
        Ok(state
            .organizations
            .iter()
            .find(|o| o.org_id == id_or_name)
            .or_else(|| state.organizations.iter().find(|o| o.name == id_or_name))
            .cloned())
    }

    async fn list_organizations(&self) -> DomainResult<Vec<Organization>> {
        Ok(self.state.read().await.organizations.clone())
    }

    async fn link_user(&self, org_id: &str, username: &str) -> DomainResult<()> {
        let mut state = self.state.write().await;
        if !state.organizations.iter().any(|o| o.org_id == org_id) {
            return Err(DomainError::OrganizationNotFound(org_id.to_string()));
        }
        state
            .organization_users
            .insert((org_id.to_string(), username.to_string()));
        Ok(())
    }

    async fn user_has_access(&self, org_id: &str, username: &str) -> DomainResult<bool> {
        let state = self.state.read().await;
        Ok(state
            .organization_users
            .contains(&(org_id.to_string(), username.to_string())))
    }
}

#[async_trait]
impl GroupRepository for InMemoryStore {
    async fn create_group(&self, org_id: &str, name: &str) -> DomainResult<Group> {
        let mut state = self.state.write().await;
        if state.group_id(org_id, name).is_ok() {
            return Err(DomainError::GroupAlreadyExists(name.to_string()));
        }
        let group = Group {
            id: state.next_id(),
            org_id: org_id.to_string(),
            name: name.to_string(),
            created_at: Some(Utc::now()),
        };
        state.groups.push(group.clone());
        Ok(group)
    }

    async fn list_groups(&self, org_id: &str) -> DomainResult<Vec<Group>> {
        let state = self.state.read().await;
        let mut groups: Vec<Group> = state
            .groups
            .iter()
            .filter(|g| g.org_id == org_id)
            .cloned()
            .collect();
        groups.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(groups)
    }

    async fn get_group(&self, org_id: &str, name: &str) -> DomainResult<Option<Group>> {
        let state = self.state.read().await;
        Ok(state
            .groups
            .iter()
            .find(|g| g.org_id == org_id && g.name == name)
            .cloned())
    }

    #[instrument(skip(self))]
    async fn link_device(&self, org_id: &str, name: &str, device_id: &str) -> DomainResult<()> {
        let mut state = self.state.write().await;
        let group_id = state.group_id(org_id, name)?;
        if state.find_device(device_id, Scope::Live).is_none() {
            return Err(DomainError::DeviceNotFound(device_id.to_string()));
        }

        // unique on (group_id, device_id)
        if !state
            .group_links
            .iter()
            .any(|(g, d)| *g == group_id && d == device_id)
        {
            state.group_links.push((group_id, device_id.to_string()));
        }
        Ok(())
    }

    async fn unlink_device(&self, org_id: &str, name: &str, device_id: &str) -> DomainResult<()> {
        let mut state = self.state.write().await;
        let group_id = state.group_id(org_id, name)?;
        state
            .group_links
            .retain(|(g, d)| !(*g == group_id && d == device_id));
        Ok(())
    }

    async fn group_devices(&self, org_id: &str, name: &str) -> DomainResult<Vec<Device>> {
        let state = self.state.read().await;
        let group_id = state.group_id(org_id, name)?;
        let linked: HashSet<&str> = state
            .group_links
            .iter()
            .filter(|(g, _)| *g == group_id)
            .map(|(_, d)| d.as_str())
            .collect();
        Ok(state
            .devices
            .iter()
            .filter(|d| !d.is_deleted() && linked.contains(d.device_id.as_str()))
            .cloned()
            .collect())
    }

    async fn excluded_devices(&self, org_id: &str, name: &str) -> DomainResult<Vec<Device>> {
        let state = self.state.read().await;
        let group_id = state.group_id(org_id, name)?;
        let linked: HashSet<&str> = state
            .group_links
            .iter()
            .filter(|(g, _)| *g == group_id)
            .map(|(_, d)| d.as_str())
            .collect();
        Ok(state
            .devices
            .iter()
            .filter(|d| {
                d.org_id == org_id && !d.is_deleted() && !linked.contains(d.device_id.as_str())
            })
            .cloned()
            .collect())
    }
}

#[async_trait]
impl HealthHashRepository for InMemoryStore {
    async fn upsert_health_hash(&self, hash: HealthHash) -> DomainResult<bool> {
        let mut state = self.state.write().await;
        let key = (hash.org_id.clone(), hash.device_id.clone());
        match state.health.get(&key) {
            Some(existing) if existing.same_hashes(&hash) => Ok(false),
            _ => {
                state.health.insert(key, hash);
                Ok(true)
            }
        }
    }

    async fn get_health_hash(
        &self,
        org_id: &str,
        device_id: &str,
    ) -> DomainResult<Option<HealthHash>> {
        let state = self.state.read().await;
        Ok(state
            .health
            .get(&(org_id.to_string(), device_id.to_string()))
            .cloned())
    }
}

#[async_trait]
impl DeviceModelRepository for InMemoryStore {
    async fn get_model_required_snaps(&self, model: &str) -> DomainResult<DeviceModel> {
        let state = self.state.read().await;
        let required_snaps = state
            .models
            .get(model)
            .map(|snaps| {
                snaps
                    .iter()
                    .map(|name| RequiredSnap { name: name.clone() })
                    .collect()
            })
            .unwrap_or_default();
        Ok(DeviceModel {
            name: model.to_string(),
            required_snaps,
        })
    }

    async fn set_model_required_snaps(&self, model: &str, snaps: Vec<String>) -> DomainResult<()> {
        let mut state = self.state.write().await;
        let mut unique = Vec::with_capacity(snaps.len());
        for snap in snaps {
            if !unique.contains(&snap) {
                unique.push(snap);
            }
        }
        state.models.insert(model.to_string(), unique);
        Ok(())
    }
}

#[async_trait]
impl SettingRepository for InMemoryStore {
    async fn get_setting(&self, key: &str) -> DomainResult<Option<String>> {
        Ok(self.state.read().await.settings.get(key).cloned())
    }

    async fn set_setting(&self, key: &str, value: &str) -> DomainResult<()> {
        self.state
            .write()
            .await
            .settings
            .insert(key.to_string(), value.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ActionKind, ServiceStatus};

    fn device_input(device_id: &str, serial: &str) -> CreateDeviceInput {
        CreateDeviceInput {
            device_id: device_id.to_string(),
            org_id: "abc".to_string(),
            brand: "example".to_string(),
            model: "drone-1000".to_string(),
            serial: serial.to_string(),
            device_key: "K".to_string(),
            store_id: "s".to_string(),
            active: true,
            last_refresh: Utc::now(),
        }
    }

    fn service(name: &str, active: bool) -> ServiceStatus {
        ServiceStatus {
            name: name.to_string(),
            daemon: "simple".to_string(),
            enabled: true,
            active,
        }
    }

    fn snap(device_id: &str, name: &str, status: &str, services: Vec<ServiceStatus>) -> DeviceSnap {
        DeviceSnap {
            device_id: device_id.to_string(),
            name: name.to_string(),
            status: status.to_string(),
            services,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_get_device_by_id_or_serial() {
        let store = InMemoryStore::new();
        store.create_device(device_input("a111", "DR1000A111")).await.unwrap();

        let by_id = store.get_device("a111", Scope::Live).await.unwrap().unwrap();
        let by_serial = store
            .get_device("DR1000A111", Scope::Live)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(by_id, by_serial);
        assert!(store.get_device("nope", Scope::Live).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_create_device_rejects_taken_serial() {
        let store = InMemoryStore::new();
        store.create_device(device_input("a111", "S1")).await.unwrap();

        let result = store.create_device(device_input("b222", "S1")).await;
        assert!(matches!(result, Err(DomainError::DeviceAlreadyExists(_))));
    }

    #[tokio::test]
    async fn test_delete_device_cascades_and_keeps_tombstone() {
        let store = InMemoryStore::new();
        store.create_device(device_input("a111", "S1")).await.unwrap();
        store
            .upsert_device_snap(snap("a111", "hello", "active", vec![service("s1", true)]))
            .await
            .unwrap();
        store
            .upsert_device_version(DeviceVersion {
                device_id: "a111".to_string(),
                series: "16".to_string(),
                ..Default::default()
            })
            .await
            .unwrap();

        store.delete_device("a111").await.unwrap();

        assert!(store.get_device("a111", Scope::Live).await.unwrap().is_none());
        let tombstone = store
            .get_device("a111", Scope::Unscoped)
            .await
            .unwrap()
            .unwrap();
        assert!(tombstone.is_deleted());
        assert!(store.list_device_snaps("a111").await.unwrap().is_empty());
        assert!(store.get_device_version("a111").await.unwrap().is_none());

        // identifiers stay reserved
        let again = store.create_device(device_input("a111", "S2")).await;
        assert!(matches!(again, Err(DomainError::DeviceAlreadyExists(_))));
    }

    #[tokio::test]
    async fn test_snap_upsert_merges_services() {
        let store = InMemoryStore::new();
        store.create_device(device_input("a111", "S1")).await.unwrap();

        store
            .upsert_device_snap(snap("a111", "hello", "active", vec![service("s1", true)]))
            .await
            .unwrap();
        store
            .upsert_device_snap(snap(
                "a111",
                "hello",
                "active",
                vec![service("s1", false), service("s2", true)],
            ))
            .await
            .unwrap();

        let snaps = store.list_device_snaps("a111").await.unwrap();
        assert_eq!(snaps.len(), 1);
        assert_eq!(snaps[0].services.len(), 2);
        assert!(!snaps[0].services[0].active);
    }

    #[tokio::test]
    async fn test_failed_service_write_leaves_parent_snap_unchanged() {
        let store = InMemoryStore::new();
        store.create_device(device_input("a111", "S1")).await.unwrap();
        store
            .upsert_device_snap(snap("a111", "hello", "active", vec![service("s1", true)]))
            .await
            .unwrap();

        let result = store
            .upsert_device_snap(snap(
                "a111",
                "hello",
                "disabled",
                vec![service("s1", false), service("", true)],
            ))
            .await;
        assert!(result.is_err());

        let snaps = store.list_device_snaps("a111").await.unwrap();
        assert_eq!(snaps[0].status, "active");
        assert!(snaps[0].services[0].active);
    }

    #[tokio::test]
    async fn test_group_link_is_idempotent() {
        let store = InMemoryStore::new();
        store.create_device(device_input("a111", "S1")).await.unwrap();
        store.create_device(device_input("b222", "S2")).await.unwrap();
        store.create_group("abc", "field").await.unwrap();

        store.link_device("abc", "field", "a111").await.unwrap();
        store.link_device("abc", "field", "a111").await.unwrap();

        let linked = store.group_devices("abc", "field").await.unwrap();
        assert_eq!(linked.len(), 1);
        let excluded = store.excluded_devices("abc", "field").await.unwrap();
        assert_eq!(excluded.len(), 1);
        assert_eq!(excluded[0].device_id, "b222");
    }

    #[tokio::test]
    async fn test_link_unknown_group_fails() {
        let store = InMemoryStore::new();
        store.create_device(device_input("a111", "S1")).await.unwrap();

        let result = store.link_device("abc", "missing", "a111").await;
        assert!(matches!(result, Err(DomainError::GroupNotFound(_))));
    }

    #[tokio::test]
    async fn test_health_hash_reports_change_once() {
        let store = InMemoryStore::new();
        let hash = HealthHash {
            org_id: "abc".to_string(),
            device_id: "a111".to_string(),
            snap_list_hash: "h1".to_string(),
            installed_snaps_hash: "i1".to_string(),
            last_refresh: Utc::now(),
        };

        assert!(store.upsert_health_hash(hash.clone()).await.unwrap());
        assert!(!store.upsert_health_hash(hash.clone()).await.unwrap());

        let changed = HealthHash {
            snap_list_hash: "h2".to_string(),
            ..hash
        };
        assert!(store.upsert_health_hash(changed).await.unwrap());
    }

    #[tokio::test]
    async fn test_actions_listed_by_serial_in_modified_order() {
        let store = InMemoryStore::new();
        store.create_device(device_input("a111", "S1")).await.unwrap();
        for id in ["A1", "A2"] {
            store
                .create_action(CreateActionInput {
                    action_id: id.to_string(),
                    org_id: "abc".to_string(),
                    device_id: "a111".to_string(),
                    action: ActionKind::List,
                    status: ActionStatus::Requested,
                    message: String::new(),
                })
                .await
                .unwrap();
        }
        store
            .update_action("A1", ActionStatus::Complete, "")
            .await
            .unwrap();

        let actions = store.list_actions_for_device("abc", "S1").await.unwrap();
        let ids: Vec<&str> = actions.iter().map(|a| a.action_id.as_str()).collect();
        assert_eq!(ids, vec!["A2", "A1"]);
        assert_eq!(actions[1].status, ActionStatus::Complete);
    }

    #[tokio::test]
    async fn test_organization_prefers_id_over_name() {
        let store = InMemoryStore::new();
        store
            .create_organization(CreateOrganizationInput {
                org_id: "abc".to_string(),
                name: "Example".to_string(),
            })
            .await
            .unwrap();
        store
            .create_organization(CreateOrganizationInput {
                org_id: "def".to_string(),
                name: "abc".to_string(),
            })
            .await
            .unwrap();

        let org = store.get_organization("abc").await.unwrap().unwrap();
        assert_eq!(org.name, "Example");
        let by_name = store.get_organization("Example").await.unwrap().unwrap();
        assert_eq!(by_name.org_id, "abc");
    }

    #[tokio::test]
    async fn test_unknown_model_has_no_required_snaps() {
        let store = InMemoryStore::new();
        let model = store.get_model_required_snaps("unknown").await.unwrap();
        assert!(model.required_snaps.is_empty());
    }
}
