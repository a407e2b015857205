use crate::mqtt::MqttPublisher;
use common::domain::{DomainError, DomainResult};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Outbound message handed to the publish task
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

type Ack = oneshot::Sender<DomainResult<()>>;

/// Producer side of the egress channel. Cheap to clone; every producer
/// (controller, reconciler, router discovery) holds one.
#[derive(Clone)]
pub struct EgressPublisher {
    tx: mpsc::Sender<(PublishMessage, Ack)>,
}

impl EgressPublisher {
    /// Queue a message and wait until the broker acknowledged it. A full
    /// channel suspends the caller.
    pub async fn publish(&self, topic: impl Into<String>, payload: Vec<u8>) -> DomainResult<()> {
        let message = PublishMessage {
            topic: topic.into(),
            payload,
        };
        let (ack_tx, ack_rx) = oneshot::channel();

        self.tx
            .send((message, ack_tx))
            .await
            .map_err(|_| DomainError::TransportError("egress channel closed".to_string()))?;

        ack_rx.await.map_err(|_| {
            DomainError::TransportError("publish task dropped the message".to_string())
        })?
    }
}

/// Consumer side: the single task that calls the transport
pub struct EgressWorker {
    rx: mpsc::Receiver<(PublishMessage, Ack)>,
    publisher: Arc<dyn MqttPublisher>,
}

/// Bounded egress channel in front of `publisher`
pub fn egress_channel(
    capacity: usize,
    publisher: Arc<dyn MqttPublisher>,
) -> (EgressPublisher, EgressWorker) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (EgressPublisher { tx }, EgressWorker { rx, publisher })
}

impl EgressWorker {
    /// Drain the channel until cancelled, then publish whatever is still queued
    pub async fn run(mut self, ctx: CancellationToken) -> anyhow::Result<()> {
        info!("egress publisher started");

        loop {
            tokio::select! {
                _ = ctx.cancelled() => break,
                next = self.rx.recv() => match next {
                    Some((message, ack)) => self.publish_one(message, ack).await,
                    // every producer is gone
                    None => return Ok(()),
                },
            }
        }

        self.rx.close();
        let mut drained = 0usize;
        while let Some((message, ack)) = self.rx.recv().await {
            self.publish_one(message, ack).await;
            drained += 1;
        }
        info!(drained, "egress publisher stopped");
        Ok(())
    }

    async fn publish_one(&self, message: PublishMessage, ack: Ack) {
        let result = self
            .publisher
            .publish(&message.topic, message.payload)
            .await;
        match &result {
            Ok(()) => debug!(topic = %message.topic, "published"),
            Err(e) => warn!(topic = %message.topic, error = %e, "publish failed"),
        }
        // the producer may have given up waiting
        let _ = ack.send(result);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mqtt::MockMqttPublisher;

    #[tokio::test]
    async fn test_publish_waits_for_transport_ack() {
        let mut mock = MockMqttPublisher::new();
        mock.expect_publish()
            .withf(|topic: &str, payload: &Vec<u8>| topic == "devices/sub/a111" && payload == b"{}")
            .times(1)
            .returning(|_, _| Ok(()));

        let (egress, worker) = egress_channel(4, Arc::new(mock));
        let ctx = CancellationToken::new();
        let handle = tokio::spawn(worker.run(ctx.clone()));

        egress.publish("devices/sub/a111", b"{}".to_vec()).await.unwrap();

        ctx.cancel();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_transport_error_reaches_producer() {
        let mut mock = MockMqttPublisher::new();
        mock.expect_publish()
            .returning(|_, _| Err(DomainError::TransportError("broker gone".to_string())));

        let (egress, worker) = egress_channel(4, Arc::new(mock));
        let ctx = CancellationToken::new();
        tokio::spawn(worker.run(ctx.clone()));

        let result = egress.publish("devices/sub/a111", Vec::new()).await;
        assert!(matches!(result, Err(DomainError::TransportError(_))));
        ctx.cancel();
    }

    #[tokio::test]
    async fn test_queued_messages_drain_after_cancellation() {
        let mut mock = MockMqttPublisher::new();
        mock.expect_publish().times(2).returning(|_, _| Ok(()));

        let (egress, worker) = egress_channel(4, Arc::new(mock));
        let first = egress.clone();
        let second = egress.clone();
        let pending_first = tokio::spawn(async move { first.publish("t/1", Vec::new()).await });
        let pending_second = tokio::spawn(async move { second.publish("t/2", Vec::new()).await });
        tokio::task::yield_now().await;

        let ctx = CancellationToken::new();
        ctx.cancel();
        drop(egress);
        worker.run(ctx).await.unwrap();

        assert!(pending_first.await.unwrap().is_ok());
        assert!(pending_second.await.unwrap().is_ok());
    }
}
