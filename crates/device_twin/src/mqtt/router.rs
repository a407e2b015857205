use crate::domain::{
    ActionDispatcher, ActionResponse, Health, HealthOutcome, SubscribeAction, TwinService,
};
use crate::mqtt::{parse_device_topic, InboundMessage};
use common::domain::{ActionKind, DeviceRepository, DomainError, Scope};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, trace, warn, Instrument, Span};

/// Inbound path a consumer drains
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboundPath {
    Health,
    Action,
}

impl InboundPath {
    fn as_str(&self) -> &'static str {
        match self {
            InboundPath::Health => "health",
            InboundPath::Action => "action",
        }
    }
}

/// What the router did with one inbound message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOutcome {
    /// Handed to the twin
    Applied,
    /// Unknown device; discovery commands were sent
    Discovered,
    /// Malformed, mismatched or from a deleted device
    Dropped,
    /// The twin or a publish failed
    Failed,
}

/// Parses device messages and hands them to the twin
pub struct MessageRouter {
    devices: Arc<dyn DeviceRepository>,
    twin: Arc<TwinService>,
    dispatcher: Arc<ActionDispatcher>,
    rediscover_after: Duration,
    discovered: Mutex<HashMap<String, Instant>>,
}

impl MessageRouter {
    pub fn new(
        devices: Arc<dyn DeviceRepository>,
        twin: Arc<TwinService>,
        dispatcher: Arc<ActionDispatcher>,
        rediscover_after: Duration,
    ) -> Self {
        Self {
            devices,
            twin,
            dispatcher,
            rediscover_after,
            discovered: Mutex::new(HashMap::new()),
        }
    }

    pub async fn route(&self, path: InboundPath, message: &InboundMessage) -> RouteOutcome {
        // every message starts its own trace
        let span = info_span!(
            parent: Span::none(),
            "mqtt_message",
            path = path.as_str(),
            topic = %message.topic,
            payload_size = message.payload.len(),
            device_id = tracing::field::Empty,
        );

        async {
            match path {
                InboundPath::Health => self.handle_health(&message.topic, &message.payload).await,
                InboundPath::Action => self.handle_action(&message.topic, &message.payload).await,
            }
        }
        .instrument(span)
        .await
    }

    async fn handle_health(&self, topic: &str, payload: &[u8]) -> RouteOutcome {
        let parsed = match parse_device_topic(topic) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!(error = %e, "failed to parse health topic, skipping message");
                return RouteOutcome::Dropped;
            }
        };
        Span::current().record("device_id", parsed.device_id.as_str());

        let health: Health = match serde_json::from_slice(payload) {
            Ok(health) => health,
            Err(e) => {
                warn!(error = %e, "failed to parse health payload, skipping message");
                return RouteOutcome::Dropped;
            }
        };
        if health.device_id != parsed.device_id {
            warn!(
                body_device_id = %health.device_id,
                "device id mismatch between topic and health payload, skipping message"
            );
            return RouteOutcome::Dropped;
        }

        if let Some(outcome) = self.drop_if_deleted(&parsed.device_id).await {
            return outcome;
        }

        let beat = self.twin.health_beat(&health).await;
        if beat.is_ok() {
            self.discovered.lock().await.remove(&health.device_id);
        }

        match beat {
            Ok(HealthOutcome::Changed) if !health.snap_list_hash.is_empty() => {
                debug!("snap list hash changed, requesting snap list");
                if self.request(&health.org_id, &health.device_id, ActionKind::List).await {
                    RouteOutcome::Applied
                } else {
                    RouteOutcome::Failed
                }
            }
            Ok(_) => RouteOutcome::Applied,
            Err(DomainError::UnknownDevice(_)) => self.discover(&health).await,
            Err(e) => {
                error!(error = %e, "failed to apply health beat");
                RouteOutcome::Failed
            }
        }
    }

    async fn handle_action(&self, topic: &str, payload: &[u8]) -> RouteOutcome {
        let parsed = match parse_device_topic(topic) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!(error = %e, "failed to parse action topic, skipping message");
                return RouteOutcome::Dropped;
            }
        };
        Span::current().record("device_id", parsed.device_id.as_str());

        let response: ActionResponse = match serde_json::from_slice(payload) {
            Ok(response) => response,
            Err(e) => {
                warn!(error = %e, "failed to parse action response, skipping message");
                return RouteOutcome::Dropped;
            }
        };

        if let Some(outcome) = self.drop_if_deleted(&parsed.device_id).await {
            return outcome;
        }

        if !response.success {
            return match self.twin.action_failed(&response.id, &response.message).await {
                Ok(()) => {
                    debug!(action_id = %response.id, "device reported action failure");
                    RouteOutcome::Applied
                }
                Err(e) => {
                    warn!(action_id = %response.id, error = %e, "failed to record action failure");
                    RouteOutcome::Failed
                }
            };
        }

        match self
            .twin
            .action_response(&parsed.device_id, &response.id, &response.action, response.result)
            .await
        {
            Ok(_) => RouteOutcome::Applied,
            Err(e) => {
                warn!(action_id = %response.id, action = %response.action, error = %e, "failed to apply action response");
                RouteOutcome::Failed
            }
        }
    }

    /// Messages from tombstoned devices must not touch the store
    async fn drop_if_deleted(&self, device_id: &str) -> Option<RouteOutcome> {
        match self.devices.get_device(device_id, Scope::Unscoped).await {
            Ok(Some(device)) if device.device_id == device_id && device.is_deleted() => {
                trace!("message from deleted device, skipping");
                Some(RouteOutcome::Dropped)
            }
            Ok(_) => None,
            Err(e) => {
                error!(error = %e, "failed to look up device");
                Some(RouteOutcome::Failed)
            }
        }
    }

    /// Ask an unknown device for its identity and snap list, at most once per
    /// `rediscover_after`
    async fn discover(&self, health: &Health) -> RouteOutcome {
        {
            let mut discovered = self.discovered.lock().await;
            if let Some(at) = discovered.get(&health.device_id) {
                if at.elapsed() < self.rediscover_after {
                    trace!("discovery already requested");
                    return RouteOutcome::Dropped;
                }
            }
            // only ids inside the window are remembered
            discovered.retain(|_, at| at.elapsed() < self.rediscover_after);
            discovered.insert(health.device_id.clone(), Instant::now());
        }

        info!(org_id = %health.org_id, "unknown device, requesting registration");
        let device = self
            .request(&health.org_id, &health.device_id, ActionKind::Device)
            .await;
        let list = self
            .request(&health.org_id, &health.device_id, ActionKind::List)
            .await;

        if device && list {
            RouteOutcome::Discovered
        } else {
            // let the next beat retry
            self.discovered.lock().await.remove(&health.device_id);
            RouteOutcome::Failed
        }
    }

    async fn request(&self, org_id: &str, device_id: &str, kind: ActionKind) -> bool {
        match self
            .dispatcher
            .dispatch(org_id, device_id, SubscribeAction::new(kind))
            .await
        {
            Ok(action) => {
                debug!(action_id = %action.action_id, action = %kind, "requested");
                true
            }
            Err(e) => {
                error!(action = %kind, error = %e, "failed to request action");
                false
            }
        }
    }

    /// Drain one inbound channel until cancelled. A single consumer per path
    /// keeps per-device arrival order.
    pub async fn run_consumer(
        self: Arc<Self>,
        path: InboundPath,
        mut rx: mpsc::Receiver<InboundMessage>,
        ctx: CancellationToken,
    ) -> anyhow::Result<()> {
        info!(path = path.as_str(), "inbound consumer started");

        loop {
            tokio::select! {
                _ = ctx.cancelled() => break,
                next = rx.recv() => match next {
                    Some(message) => {
                        self.route(path, &message).await;
                    }
                    None => break,
                },
            }
        }

        info!(path = path.as_str(), "inbound consumer stopped");
        Ok(())
    }
}
