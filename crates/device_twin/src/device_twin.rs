use crate::domain::{
    ActionDispatcher, CommandService, GroupService, OrganizationAccess, ReconcilerConfig,
    Repositories, RequiredSnapsReconciler, TwinService,
};
use crate::mqtt::{
    egress_channel, EgressPublisher, EgressWorker, InboundMessage, InboundPath, MessageRouter,
    MqttEventLoop, MqttPublisher, MqttTransport,
};
use dms_runner::AppProcess;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct DeviceTwinConfig {
    /// Filter for health beats, device id in the third segment
    pub health_topic: String,
    /// Filter for action responses, device id in the third segment
    pub pub_topic: String,
    pub inbound_capacity: usize,
    pub egress_capacity: usize,
    /// Discovery is not repeated for a silent unknown device within this window
    pub rediscover_after: Duration,
    /// How long the broker connection waits for queued publishes on shutdown
    pub egress_drain_timeout: Duration,
    pub reconciler: ReconcilerConfig,
}

impl Default for DeviceTwinConfig {
    fn default() -> Self {
        Self {
            health_topic: "devices/health/+".to_string(),
            pub_topic: "devices/pub/+".to_string(),
            inbound_capacity: 100,
            egress_capacity: 100,
            rediscover_after: Duration::from_secs(600),
            egress_drain_timeout: Duration::from_secs(5),
            reconciler: ReconcilerConfig::default(),
        }
    }
}

/// Device twin core: MQTT ingress and egress, the twin engine, the command
/// controller and the required-snaps reconciler
pub struct DeviceTwin {
    event_loop: MqttEventLoop,
    egress_worker: EgressWorker,
    egress: EgressPublisher,
    router: Arc<MessageRouter>,
    health_rx: mpsc::Receiver<InboundMessage>,
    action_rx: mpsc::Receiver<InboundMessage>,
    reconciler: Option<Arc<RequiredSnapsReconciler>>,
    twin: Arc<TwinService>,
    commands: Arc<CommandService>,
    groups: Arc<GroupService>,
    egress_drain_timeout: Duration,
}

impl DeviceTwin {
    pub async fn new(
        repositories: Repositories,
        transport: MqttTransport,
        event_loop: MqttEventLoop,
        config: DeviceTwinConfig,
    ) -> anyhow::Result<Self> {
        info!("initializing device twin");

        let publisher: Arc<dyn MqttPublisher> = Arc::new(transport.clone());
        let (egress, egress_worker) = egress_channel(config.egress_capacity, publisher);

        let access = Arc::new(OrganizationAccess::new(
            Arc::clone(&repositories.organizations),
            Arc::clone(&repositories.devices),
        ));
        let dispatcher = Arc::new(ActionDispatcher::new(
            egress.clone(),
            Arc::clone(&repositories.actions),
        ));
        let twin = Arc::new(TwinService::new(
            Arc::clone(&repositories.devices),
            Arc::clone(&repositories.actions),
            Arc::clone(&repositories.health),
            Arc::clone(&access),
        ));
        let commands = Arc::new(CommandService::new(
            Arc::clone(&access),
            Arc::clone(&dispatcher),
        ));
        let groups = Arc::new(GroupService::new(
            Arc::clone(&repositories.groups),
            Arc::clone(&access),
        ));
        let router = Arc::new(MessageRouter::new(
            Arc::clone(&repositories.devices),
            Arc::clone(&twin),
            dispatcher,
            config.rediscover_after,
        ));

        let reconciler = if config.reconciler.enabled {
            Some(Arc::new(RequiredSnapsReconciler::new(
                Arc::clone(&repositories.organizations),
                Arc::clone(&repositories.devices),
                Arc::clone(&repositories.models),
                Arc::clone(&repositories.settings),
                egress.clone(),
                config.reconciler.clone(),
            )))
        } else {
            info!("required snaps reconciler disabled");
            None
        };

        let (health_tx, health_rx) = mpsc::channel(config.inbound_capacity.max(1));
        let (action_tx, action_rx) = mpsc::channel(config.inbound_capacity.max(1));
        transport.subscribe(&config.health_topic, health_tx).await?;
        transport.subscribe(&config.pub_topic, action_tx).await?;

        info!(
            health_topic = %config.health_topic,
            pub_topic = %config.pub_topic,
            "device twin initialized"
        );

        Ok(Self {
            event_loop,
            egress_worker,
            egress,
            router,
            health_rx,
            action_rx,
            reconciler,
            twin,
            commands,
            groups,
            egress_drain_timeout: config.egress_drain_timeout,
        })
    }

    pub fn twin(&self) -> Arc<TwinService> {
        Arc::clone(&self.twin)
    }

    pub fn commands(&self) -> Arc<CommandService> {
        Arc::clone(&self.commands)
    }

    pub fn groups(&self) -> Arc<GroupService> {
        Arc::clone(&self.groups)
    }

    pub fn egress(&self) -> EgressPublisher {
        self.egress.clone()
    }

    pub fn reconciler(&self) -> Option<Arc<RequiredSnapsReconciler>> {
        self.reconciler.clone()
    }

    /// Named processes for the runner. The broker connection outlives the
    /// egress worker so queued publishes can drain on shutdown.
    pub fn into_runner_processes(self) -> Vec<(String, AppProcess)> {
        let egress_done = CancellationToken::new();
        let mut processes: Vec<(String, AppProcess)> = Vec::new();

        processes.push((
            "mqtt_transport".to_string(),
            Box::new({
                let event_loop = self.event_loop;
                let egress_done = egress_done.clone();
                let drain_timeout = self.egress_drain_timeout;
                move |ctx| {
                    Box::pin(async move {
                        let transport_ctx = CancellationToken::new();
                        let stop = {
                            let transport_ctx = transport_ctx.clone();
                            async move {
                                ctx.cancelled().await;
                                if tokio::time::timeout(drain_timeout, egress_done.cancelled())
                                    .await
                                    .is_err()
                                {
                                    warn!("egress did not drain before the connection closed");
                                }
                                transport_ctx.cancel();
                            }
                        };
                        let (result, ()) = tokio::join!(event_loop.run(transport_ctx), stop);
                        result
                    })
                }
            }),
        ));

        processes.push((
            "egress".to_string(),
            Box::new({
                let worker = self.egress_worker;
                move |ctx| {
                    Box::pin(async move {
                        let result = worker.run(ctx).await;
                        egress_done.cancel();
                        result
                    })
                }
            }),
        ));

        processes.push((
            "health_consumer".to_string(),
            Box::new({
                let router = Arc::clone(&self.router);
                let rx = self.health_rx;
                move |ctx| Box::pin(async move { router.run_consumer(InboundPath::Health, rx, ctx).await })
            }),
        ));

        processes.push((
            "action_consumer".to_string(),
            Box::new({
                let router = self.router;
                let rx = self.action_rx;
                move |ctx| Box::pin(async move { router.run_consumer(InboundPath::Action, rx, ctx).await })
            }),
        ));

        if let Some(reconciler) = self.reconciler {
            processes.push((
                "required_snaps_reconciler".to_string(),
                Box::new(move |ctx| Box::pin(async move { reconciler.run(ctx).await })),
            ));
        }

        processes
    }
}
