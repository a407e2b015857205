use crate::domain::SubscribeAction;
use crate::mqtt::{subscribe_topic, EgressPublisher};
use common::domain::{
    Action, ActionRepository, ActionStatus, CreateActionInput, DomainError, DomainResult,
};
use std::sync::Arc;
use tracing::{info, instrument};

/// Sends a command to a device and records it in the action log.
///
/// The log row is written only after the broker accepted the command, so a
/// `requested` row always corresponds to a delivered message.
pub struct ActionDispatcher {
    egress: EgressPublisher,
    actions: Arc<dyn ActionRepository>,
}

impl ActionDispatcher {
    pub fn new(egress: EgressPublisher, actions: Arc<dyn ActionRepository>) -> Self {
        Self { egress, actions }
    }

    #[instrument(skip(self, command), fields(action_id = %command.id, action = %command.action))]
    pub async fn dispatch(
        &self,
        org_id: &str,
        device_id: &str,
        command: SubscribeAction,
    ) -> DomainResult<Action> {
        let payload =
            serde_json::to_vec(&command).map_err(|e| DomainError::PayloadError(e.to_string()))?;

        self.egress.publish(subscribe_topic(device_id), payload).await?;

        let action = self
            .actions
            .create_action(CreateActionInput {
                action_id: command.id,
                org_id: org_id.to_string(),
                device_id: device_id.to_string(),
                action: command.action,
                status: ActionStatus::Requested,
                message: String::new(),
            })
            .await?;

        info!("action requested");
        Ok(action)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mqtt::{egress_channel, MockMqttPublisher};
    use chrono::Utc;
    use common::domain::{ActionKind, MockActionRepository};
    use tokio_util::sync::CancellationToken;

    fn spawn_egress(mock: MockMqttPublisher) -> (EgressPublisher, CancellationToken) {
        let (egress, worker) = egress_channel(4, Arc::new(mock));
        let ctx = CancellationToken::new();
        tokio::spawn(worker.run(ctx.clone()));
        (egress, ctx)
    }

    #[tokio::test]
    async fn test_dispatch_publishes_then_logs() {
        let mut publisher = MockMqttPublisher::new();
        publisher
            .expect_publish()
            .withf(|topic: &str, payload: &Vec<u8>| {
                let body: serde_json::Value = serde_json::from_slice(payload).unwrap();
                topic == "devices/sub/a111" && body["action"] == "install" && body["snap"] == "hello"
            })
            .times(1)
            .returning(|_, _| Ok(()));

        let mut actions = MockActionRepository::new();
        actions
            .expect_create_action()
            .withf(|input: &CreateActionInput| {
                input.device_id == "a111"
                    && input.action == ActionKind::Install
                    && input.status == ActionStatus::Requested
            })
            .times(1)
            .returning(|input| {
                Ok(Action {
                    action_id: input.action_id,
                    org_id: input.org_id,
                    device_id: input.device_id,
                    action: input.action,
                    status: input.status,
                    message: input.message,
                    created: Utc::now(),
                    modified: Utc::now(),
                })
            });

        let (egress, ctx) = spawn_egress(publisher);
        let dispatcher = ActionDispatcher::new(egress, Arc::new(actions));

        let command = SubscribeAction::new(ActionKind::Install).with_snap("hello");
        let action_id = command.id.clone();
        let action = dispatcher.dispatch("abc", "a111", command).await.unwrap();
        assert_eq!(action.action_id, action_id);
        ctx.cancel();
    }

    #[tokio::test]
    async fn test_failed_publish_writes_no_log_row() {
        let mut publisher = MockMqttPublisher::new();
        publisher
            .expect_publish()
            .returning(|_, _| Err(DomainError::TransportError("timeout".to_string())));

        let mut actions = MockActionRepository::new();
        actions.expect_create_action().times(0);

        let (egress, ctx) = spawn_egress(publisher);
        let dispatcher = ActionDispatcher::new(egress, Arc::new(actions));

        let result = dispatcher
            .dispatch("abc", "a111", SubscribeAction::new(ActionKind::List))
            .await;
        assert!(matches!(result, Err(DomainError::TransportError(_))));
        ctx.cancel();
    }
}
