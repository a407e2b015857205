use async_trait::async_trait;
use common::domain::{
    ActionKind, ActionRepository, ActionStatus, Actor, CreateActionInput, CreateOrganizationInput,
    DeviceModelRepository, DeviceRepository, DomainError, DomainResult, ErrorKind,
    HealthHashRepository, OrganizationRepository, Role, Scope,
};
use common::memory::InMemoryStore;
use device_twin::domain::{
    ActionDispatcher, CommandService, DeviceCommandRequest, OrganizationAccess, ReconcilerConfig,
    Repositories, RequiredSnapsReconciler, TwinService,
};
use device_twin::mqtt::{
    egress_channel, InboundMessage, InboundPath, MessageRouter, MqttPublisher, PublishMessage,
    RouteOutcome,
};
use serde_json::Value;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

// Publisher that records every message instead of talking to a broker
#[derive(Clone, Default)]
struct RecordingPublisher {
    published: Arc<Mutex<Vec<PublishMessage>>>,
}

impl RecordingPublisher {
    fn take(&self) -> Vec<(String, Value)> {
        self.published
            .lock()
            .unwrap()
            .drain(..)
            .map(|m| (m.topic, serde_json::from_slice(&m.payload).unwrap()))
            .collect()
    }
}

#[async_trait]
impl MqttPublisher for RecordingPublisher {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> DomainResult<()> {
        self.published.lock().unwrap().push(PublishMessage {
            topic: topic.to_string(),
            payload,
        });
        Ok(())
    }
}

struct Fleet {
    store: InMemoryStore,
    router: MessageRouter,
    twin: Arc<TwinService>,
    commands: CommandService,
    reconciler: RequiredSnapsReconciler,
    publisher: RecordingPublisher,
    ctx: CancellationToken,
}

impl Fleet {
    async fn new() -> Self {
        let store = InMemoryStore::new();
        store
            .create_organization(CreateOrganizationInput {
                org_id: "abc".to_string(),
                name: "Example Org".to_string(),
            })
            .await
            .unwrap();
        store.link_user("abc", "jamesj").await.unwrap();

        let repositories = Repositories::in_memory(store.clone());
        let publisher = RecordingPublisher::default();
        let (egress, worker) = egress_channel(16, Arc::new(publisher.clone()));
        let ctx = CancellationToken::new();
        tokio::spawn(worker.run(ctx.clone()));

        let access = Arc::new(OrganizationAccess::new(
            repositories.organizations.clone(),
            repositories.devices.clone(),
        ));
        let dispatcher = Arc::new(ActionDispatcher::new(
            egress.clone(),
            repositories.actions.clone(),
        ));
        let twin = Arc::new(TwinService::new(
            repositories.devices.clone(),
            repositories.actions.clone(),
            repositories.health.clone(),
            access.clone(),
        ));
        let router = MessageRouter::new(
            repositories.devices.clone(),
            twin.clone(),
            dispatcher.clone(),
            Duration::from_secs(600),
        );
        let commands = CommandService::new(access, dispatcher);
        let reconciler = RequiredSnapsReconciler::new(
            repositories.organizations.clone(),
            repositories.devices.clone(),
            repositories.models.clone(),
            repositories.settings.clone(),
            egress,
            ReconcilerConfig::default(),
        );

        Self {
            store,
            router,
            twin,
            commands,
            reconciler,
            publisher,
            ctx,
        }
    }

    async fn health(&self, topic: &str, payload: &str) -> RouteOutcome {
        self.router
            .route(InboundPath::Health, &inbound(topic, payload))
            .await
    }

    async fn respond(&self, payload: &str) -> RouteOutcome {
        self.router
            .route(InboundPath::Action, &inbound("devices/pub/a111", payload))
            .await
    }

    async fn requested(&self, action_id: &str, action: ActionKind) {
        self.store
            .create_action(CreateActionInput {
                action_id: action_id.to_string(),
                org_id: "abc".to_string(),
                device_id: "a111".to_string(),
                action,
                status: ActionStatus::Requested,
                message: String::new(),
            })
            .await
            .unwrap();
    }

    async fn action_status(&self, action_id: &str) -> ActionStatus {
        self.store
            .list_actions_for_device("abc", "a111")
            .await
            .unwrap()
            .into_iter()
            .find(|a| a.action_id == action_id)
            .map(|a| a.status)
            .unwrap()
    }

    /// S2 response, registering a111
    async fn register_a111(&self) {
        self.requested("A1", ActionKind::Device).await;
        let outcome = self.respond(DEVICE_RESPONSE).await;
        assert_eq!(outcome, RouteOutcome::Applied);
    }
}

impl Drop for Fleet {
    fn drop(&mut self) {
        self.ctx.cancel();
    }
}

fn inbound(topic: &str, payload: &str) -> InboundMessage {
    InboundMessage {
        topic: topic.to_string(),
        payload: payload.as_bytes().to_vec(),
    }
}

const UNKNOWN_BEAT: &str =
    r#"{"device_id":"a111","org_id":"abc","refresh":"2024-01-01T00:00:00Z"}"#;

const DEVICE_RESPONSE: &str = r#"{"action":"device","id":"A1","success":true,"result":{"deviceId":"a111","orgId":"abc","brand":"example","model":"drone-1000","serial":"DR1000A111","deviceKey":"K","store":"s","version":{"deviceId":"a111","version":"1","series":"16"}}}"#;

const LIST_RESPONSE: &str = r#"{"action":"list","id":"A2","success":true,"result":[{"name":"hello","installedSize":2000,"status":"active","services":[{"name":"s1","active":true,"enabled":true,"daemon":"simple"}]}]}"#;

const UNREGISTER_RESPONSE: &str =
    r#"{"action":"unregister","id":"A3","success":true,"result":{"deviceId":"a111"}}"#;

#[tokio::test]
async fn test_unknown_device_discovery() {
    let fleet = Fleet::new().await;

    let outcome = fleet.health("devices/health/a111", UNKNOWN_BEAT).await;
    assert_eq!(outcome, RouteOutcome::Discovered);

    let published = fleet.publisher.take();
    assert_eq!(published.len(), 2);
    assert!(published.iter().all(|(topic, _)| topic == "devices/sub/a111"));
    assert_eq!(published[0].1["action"], "device");
    assert_eq!(published[1].1["action"], "list");
    assert_ne!(published[0].1["id"], published[1].1["id"]);

    let actions = fleet
        .store
        .list_actions_for_device("abc", "a111")
        .await
        .unwrap();
    assert_eq!(actions.len(), 2);
    assert!(actions.iter().all(|a| a.status == ActionStatus::Requested));

    let lookup = fleet.twin.get_device("abc", "a111", Scope::Live).await;
    assert!(matches!(lookup, Err(DomainError::DeviceNotFound(_))));

    // a second beat before the device answered
    fleet.health("devices/health/a111", UNKNOWN_BEAT).await;
    assert!(fleet.publisher.take().is_empty());
}

#[tokio::test]
async fn test_first_device_response_registers_device() {
    let fleet = Fleet::new().await;
    fleet.register_a111().await;

    let device = fleet
        .twin
        .get_device("abc", "a111", Scope::Live)
        .await
        .unwrap();
    assert_eq!(device.brand, "example");
    assert_eq!(device.serial, "DR1000A111");
    assert_eq!(device.store_id, "s");

    let version = fleet.twin.device_version("abc", "a111").await.unwrap();
    assert_eq!(version.series, "16");
    assert_eq!(fleet.action_status("A1").await, ActionStatus::Complete);

    // the same registration again fails and marks its row as error
    fleet.requested("A1b", ActionKind::Device).await;
    let again = DEVICE_RESPONSE.replace("\"A1\"", "\"A1b\"");
    assert_eq!(fleet.respond(&again).await, RouteOutcome::Failed);
    assert_eq!(fleet.action_status("A1b").await, ActionStatus::Error);
}

#[tokio::test]
async fn test_snap_list_upsert_is_idempotent() {
    let fleet = Fleet::new().await;
    fleet.register_a111().await;
    fleet.requested("A2", ActionKind::List).await;

    assert_eq!(fleet.respond(LIST_RESPONSE).await, RouteOutcome::Applied);
    assert_eq!(fleet.respond(LIST_RESPONSE).await, RouteOutcome::Applied);

    let snaps = fleet.twin.device_snaps("abc", "a111").await.unwrap();
    assert_eq!(snaps.len(), 1);
    assert_eq!(snaps[0].name, "hello");
    assert_eq!(snaps[0].installed_size, 2000);
    assert_eq!(snaps[0].services.len(), 1);
    assert_eq!(snaps[0].services[0].name, "s1");
    assert_eq!(fleet.action_status("A2").await, ActionStatus::Complete);
}

#[tokio::test]
async fn test_unregister_cascades_and_isolates_device() {
    let fleet = Fleet::new().await;
    fleet.register_a111().await;
    fleet.requested("A2", ActionKind::List).await;
    fleet.respond(LIST_RESPONSE).await;
    fleet.requested("A3", ActionKind::Unregister).await;

    assert_eq!(fleet.respond(UNREGISTER_RESPONSE).await, RouteOutcome::Applied);

    let scoped = fleet.twin.get_device("abc", "a111", Scope::Live).await;
    assert!(matches!(scoped, Err(DomainError::DeviceNotFound(_))));
    let unscoped = fleet
        .twin
        .get_device("abc", "a111", Scope::Unscoped)
        .await
        .unwrap();
    assert!(unscoped.deleted_at.is_some());
    assert!(fleet.store.list_device_snaps("a111").await.unwrap().is_empty());

    // later traffic from the deleted device changes nothing
    fleet.publisher.take();
    let beat = r#"{"device_id":"a111","org_id":"abc","snap_list_hash":"h1","installed_snaps_hash":"i1"}"#;
    assert_eq!(
        fleet.health("devices/health/a111", beat).await,
        RouteOutcome::Dropped
    );
    fleet.requested("A4", ActionKind::List).await;
    let late_list = LIST_RESPONSE.replace("\"A2\"", "\"A4\"");
    assert_eq!(fleet.respond(&late_list).await, RouteOutcome::Dropped);

    assert!(fleet.publisher.take().is_empty());
    assert!(fleet
        .store
        .get_health_hash("abc", "a111")
        .await
        .unwrap()
        .is_none());
    assert!(fleet.store.list_device_snaps("a111").await.unwrap().is_empty());
    assert_eq!(fleet.action_status("A4").await, ActionStatus::Requested);
}

#[tokio::test]
async fn test_health_topic_body_mismatch_is_dropped() {
    let fleet = Fleet::new().await;
    fleet.register_a111().await;

    let beat = r#"{"device_id":"b222","org_id":"abc","snap_list_hash":"h1"}"#;
    assert_eq!(
        fleet.health("devices/health/a111", beat).await,
        RouteOutcome::Dropped
    );
    assert!(fleet
        .store
        .get_health_hash("abc", "a111")
        .await
        .unwrap()
        .is_none());
    assert!(fleet.publisher.take().is_empty());
}

#[tokio::test]
async fn test_beat_addressed_by_serial_writes_nothing() {
    let fleet = Fleet::new().await;
    fleet.register_a111().await;
    fleet.publisher.take();

    let beat = r#"{"device_id":"DR1000A111","org_id":"abc","snap_list_hash":"h1"}"#;
    let outcome = fleet.health("devices/health/DR1000A111", beat).await;
    assert_eq!(outcome, RouteOutcome::Discovered);

    for id in ["DR1000A111", "a111"] {
        assert!(fleet
            .store
            .get_health_hash("abc", id)
            .await
            .unwrap()
            .is_none());
    }
    let published = fleet.publisher.take();
    assert!(published
        .iter()
        .all(|(topic, _)| topic == "devices/sub/DR1000A111"));
}

#[tokio::test]
async fn test_identical_beats_request_snap_list_once() {
    let fleet = Fleet::new().await;
    fleet.register_a111().await;

    let beat = r#"{"device_id":"a111","org_id":"abc","snap_list_hash":"h1","installed_snaps_hash":"i1"}"#;
    assert_eq!(fleet.health("devices/health/a111", beat).await, RouteOutcome::Applied);
    assert_eq!(fleet.health("devices/health/a111", beat).await, RouteOutcome::Applied);

    let published = fleet.publisher.take();
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].1["action"], "list");
}

#[tokio::test]
async fn test_required_snaps_reconcile() {
    let fleet = Fleet::new().await;
    fleet.register_a111().await;
    fleet.requested("A2", ActionKind::List).await;
    fleet.respond(LIST_RESPONSE).await;
    fleet
        .store
        .set_model_required_snaps("drone-1000", vec!["required-snap".to_string()])
        .await
        .unwrap();
    fleet.publisher.take();

    assert_eq!(fleet.reconciler.run_cycle().await.unwrap(), 1);
    let published = fleet.publisher.take();
    assert_eq!(published.len(), 1);
    let (topic, body) = &published[0];
    assert_eq!(topic, "devices/actions/DR1000A111/required-install");
    assert!(body["id"].as_str().is_some_and(|id| !id.is_empty()));
    assert_eq!(
        body["snaps"],
        serde_json::json!([{"name": "required-snap", "channel": "latest", "track": "stable"}])
    );

    assert_eq!(fleet.reconciler.run_cycle().await.unwrap(), 0);
    assert!(fleet.publisher.take().is_empty());

    // the reconciler never writes the action log
    let actions = fleet
        .store
        .list_actions_for_device("abc", "a111")
        .await
        .unwrap();
    assert!(actions.iter().all(|a| a.action != ActionKind::Install));
}

#[tokio::test]
async fn test_switch_without_body_rejected() {
    let fleet = Fleet::new().await;
    fleet.register_a111().await;
    let before = fleet
        .store
        .list_actions_for_device("abc", "a111")
        .await
        .unwrap()
        .len();

    let request = DeviceCommandRequest::new(Actor::new("jamesj", Role::Admin), "abc", "a111");
    let result = fleet
        .commands
        .snap_update(request, "hello", "switch", None)
        .await;

    assert_eq!(result.unwrap_err().kind(), ErrorKind::InvalidArgument);
    assert!(fleet.publisher.take().is_empty());
    let after = fleet
        .store
        .list_actions_for_device("abc", "a111")
        .await
        .unwrap()
        .len();
    assert_eq!(before, after);
}

#[tokio::test]
async fn test_command_lifecycle_completes_log_row() {
    let fleet = Fleet::new().await;
    fleet.register_a111().await;

    let request = DeviceCommandRequest::new(Actor::new("jamesj", Role::Standard), "Example Org", "DR1000A111");
    let action = fleet
        .commands
        .snap_install(request, "hello")
        .await
        .unwrap();

    let published = fleet.publisher.take();
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].0, "devices/sub/a111");
    assert_eq!(published[0].1["id"], action.action_id.as_str());
    assert_eq!(fleet.action_status(&action.action_id).await, ActionStatus::Requested);

    let response = format!(
        r#"{{"action":"install","id":"{}","success":true,"result":"1234"}}"#,
        action.action_id
    );
    assert_eq!(fleet.respond(&response).await, RouteOutcome::Applied);

    let row = fleet
        .store
        .list_actions_for_device("abc", "a111")
        .await
        .unwrap()
        .into_iter()
        .find(|a| a.action_id == action.action_id)
        .unwrap();
    assert_eq!(row.status, ActionStatus::Complete);
    assert_eq!(row.message, "1234");
}
