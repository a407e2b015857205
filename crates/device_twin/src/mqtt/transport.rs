use crate::mqtt::topic_matches;
use async_trait::async_trait;
use common::domain::{DomainError, DomainResult};
use rumqttc::{
    AsyncClient, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS, TlsConfiguration, Transport,
};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::error::{SendError, TrySendError};
use tokio::sync::mpsc::{self, OwnedPermit};
use tokio::sync::{oneshot, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Publishes a payload at QoS 1 and resolves once the broker acknowledged it
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait MqttPublisher: Send + Sync {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> DomainResult<()>;
}

/// Raw message as delivered by the broker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

/// PEM material for the mutual-TLS session
#[derive(Clone)]
pub struct TlsIdentity {
    pub ca: Vec<u8>,
    pub client_cert: Vec<u8>,
    pub client_key: Vec<u8>,
}

#[derive(Clone)]
pub struct MqttTransportConfig {
    pub host: String,
    pub port: u16,
    pub client_id_prefix: String,
    pub tls: Option<TlsIdentity>,
    pub keep_alive: Duration,
    pub publish_timeout: Duration,
    pub reconnect_delay: Duration,
    /// Capacity of the client request queue
    pub request_capacity: usize,
    /// Messages parked while an inbound consumer is busy; newer ones are dropped once full
    pub inbound_backlog: usize,
    /// How long a disconnect may take on shutdown
    pub quiesce: Duration,
}

impl Default for MqttTransportConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 1883,
            client_id_prefix: "dms".to_string(),
            tls: None,
            keep_alive: Duration::from_secs(30),
            publish_timeout: Duration::from_secs(10),
            reconnect_delay: Duration::from_secs(5),
            request_capacity: 100,
            inbound_backlog: 100,
            quiesce: Duration::from_secs(2),
        }
    }
}

type Ack = oneshot::Sender<DomainResult<()>>;

#[derive(Clone)]
struct Subscription {
    filter: String,
    sink: mpsc::Sender<InboundMessage>,
}

/// Acks of QoS 1 publishes. Requests reach the event loop in the order they
/// were queued, so the n-th `Outgoing::Publish` belongs to the n-th queued ack.
#[derive(Default)]
struct PendingAcks {
    queued: VecDeque<Ack>,
    in_flight: HashMap<u16, Ack>,
}

#[derive(Default)]
struct Shared {
    subscriptions: Mutex<Vec<Subscription>>,
    acks: Mutex<PendingAcks>,
    publish_order: Mutex<()>,
}

/// Handle on the single broker connection of the process
#[derive(Clone)]
pub struct MqttTransport {
    client: AsyncClient,
    shared: Arc<Shared>,
    publish_timeout: Duration,
}

/// Drives the connection; must run for publishes and subscriptions to progress
pub struct MqttEventLoop {
    eventloop: EventLoop,
    client: AsyncClient,
    shared: Arc<Shared>,
    reconnect_delay: Duration,
    inbound_backlog: usize,
    quiesce: Duration,
}

impl MqttTransport {
    pub fn new(config: MqttTransportConfig) -> (Self, MqttEventLoop) {
        let client_id = format!("{}-{}", config.client_id_prefix, xid::new());
        let mut options = MqttOptions::new(&client_id, config.host.clone(), config.port);
        options.set_keep_alive(config.keep_alive);
        // subscriptions are re-issued on every ConnAck
        options.set_clean_session(true);

        if let Some(tls) = config.tls {
            options.set_transport(Transport::tls_with_config(TlsConfiguration::Simple {
                ca: tls.ca,
                alpn: None,
                client_auth: Some((tls.client_cert, tls.client_key)),
            }));
        }

        info!(
            client_id = %client_id,
            host = %config.host,
            port = config.port,
            "mqtt transport configured"
        );

        let (client, eventloop) = AsyncClient::new(options, config.request_capacity.max(1));
        let shared = Arc::new(Shared::default());

        let transport = Self {
            client: client.clone(),
            shared: Arc::clone(&shared),
            publish_timeout: config.publish_timeout,
        };
        let eventloop = MqttEventLoop {
            eventloop,
            client,
            shared,
            reconnect_delay: config.reconnect_delay,
            inbound_backlog: config.inbound_backlog.max(1),
            quiesce: config.quiesce,
        };
        (transport, eventloop)
    }

    /// Subscribe `filter` at QoS 1; matching messages are sent to `sink`.
    /// The subscription is repeated after every reconnect.
    #[instrument(skip(self, sink))]
    pub async fn subscribe(
        &self,
        filter: &str,
        sink: mpsc::Sender<InboundMessage>,
    ) -> DomainResult<()> {
        self.shared.subscriptions.lock().await.push(Subscription {
            filter: filter.to_string(),
            sink,
        });

        self.client
            .subscribe(filter, QoS::AtLeastOnce)
            .await
            .map_err(|e| DomainError::TransportError(format!("failed to subscribe: {}", e)))?;
        debug!("subscription registered");
        Ok(())
    }
}

#[async_trait]
impl MqttPublisher for MqttTransport {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> DomainResult<()> {
        let (ack_tx, ack_rx) = oneshot::channel();
        {
            let _order = self.shared.publish_order.lock().await;
            self.shared.acks.lock().await.queued.push_back(ack_tx);
            if let Err(e) = self
                .client
                .publish(topic, QoS::AtLeastOnce, false, payload)
                .await
            {
                self.shared.acks.lock().await.queued.pop_back();
                return Err(DomainError::TransportError(format!("publish rejected: {}", e)));
            }
        }

        match tokio::time::timeout(self.publish_timeout, ack_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(DomainError::TransportError(
                "connection closed before broker ack".to_string(),
            )),
            Err(_) => Err(DomainError::TransportError(format!(
                "no broker ack within {:?}",
                self.publish_timeout
            ))),
        }
    }
}

impl MqttEventLoop {
    /// Poll the connection until cancelled. Connection errors are logged and
    /// the next poll reconnects.
    pub async fn run(self, ctx: CancellationToken) -> anyhow::Result<()> {
        let MqttEventLoop {
            mut eventloop,
            client,
            shared,
            reconnect_delay,
            inbound_backlog,
            quiesce,
        } = self;

        let mut backlog = Backlog::new(inbound_backlog);

        info!("mqtt event loop started");
        loop {
            let flush_target = backlog.parked.front().map(|(sink, _)| sink.clone());
            let flushing = flush_target.is_some();

            tokio::select! {
                _ = ctx.cancelled() => break,
                permit = reserve(flush_target), if flushing => {
                    if let Some((_, message)) = backlog.parked.pop_front() {
                        match permit {
                            Ok(permit) => {
                                permit.send(message);
                            }
                            Err(_) => warn!(topic = %message.topic, "inbound consumer closed, dropping message"),
                        }
                    }
                }
                // never gated on the backlog: PUBACKs and outgoing publishes
                // must keep flowing while consumers are busy
                event = eventloop.poll() => match event {
                    Ok(event) => handle_event(event, &client, &shared, &mut backlog).await,
                    Err(e) => {
                        error!(error = %e, "mqtt connection error");
                        tokio::select! {
                            _ = ctx.cancelled() => break,
                            _ = tokio::time::sleep(reconnect_delay) => {}
                        }
                    }
                },
            }
        }

        if !backlog.parked.is_empty() {
            warn!(dropped = backlog.parked.len(), "dropping parked inbound messages on shutdown");
        }

        let _ = client.try_disconnect();
        let drained = tokio::time::timeout(quiesce, async {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Outgoing(Outgoing::Disconnect)) | Err(_) => break,
                    Ok(_) => {}
                }
            }
        })
        .await;
        if drained.is_err() {
            warn!(quiesce = ?quiesce, "mqtt disconnect did not complete in time");
        }

        info!("mqtt event loop stopped");
        Ok(())
    }
}

/// Messages parked while their consumer is busy, bounded by `capacity`
struct Backlog {
    parked: VecDeque<(mpsc::Sender<InboundMessage>, InboundMessage)>,
    capacity: usize,
}

impl Backlog {
    fn new(capacity: usize) -> Self {
        Self {
            parked: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    fn park(&mut self, sink: mpsc::Sender<InboundMessage>, message: InboundMessage) {
        if self.parked.len() >= self.capacity {
            warn!(
                topic = %message.topic,
                capacity = self.capacity,
                "inbound backlog full, dropping message"
            );
            return;
        }
        self.parked.push_back((sink, message));
    }
}

async fn reserve(
    sink: Option<mpsc::Sender<InboundMessage>>,
) -> Result<OwnedPermit<InboundMessage>, SendError<()>> {
    match sink {
        Some(sink) => sink.reserve_owned().await,
        None => std::future::pending().await,
    }
}

async fn handle_event(
    event: Event,
    client: &AsyncClient,
    shared: &Shared,
    backlog: &mut Backlog,
) {
    match event {
        Event::Incoming(Packet::Publish(publish)) => {
            let message = InboundMessage {
                topic: publish.topic,
                payload: publish.payload.to_vec(),
            };
            deliver(message, shared, backlog).await;
        }
        Event::Incoming(Packet::ConnAck(_)) => {
            info!("connected to mqtt broker");
            for subscription in shared.subscriptions.lock().await.iter() {
                if let Err(e) = client.try_subscribe(subscription.filter.as_str(), QoS::AtLeastOnce) {
                    error!(filter = %subscription.filter, error = %e, "failed to resubscribe");
                }
            }
        }
        Event::Incoming(Packet::PubAck(ack)) => {
            if let Some(waiter) = shared.acks.lock().await.in_flight.remove(&ack.pkid) {
                let _ = waiter.send(Ok(()));
            }
        }
        Event::Incoming(Packet::SubAck(_)) => {
            debug!("subscription acknowledged");
        }
        Event::Outgoing(Outgoing::Publish(pkid)) => {
            let mut acks = shared.acks.lock().await;
            // a retransmit after reconnect reuses the tracked packet id
            if !acks.in_flight.contains_key(&pkid) {
                if let Some(waiter) = acks.queued.pop_front() {
                    acks.in_flight.insert(pkid, waiter);
                }
            }
        }
        _ => {}
    }
}

async fn deliver(
    message: InboundMessage,
    shared: &Shared,
    backlog: &mut Backlog,
) {
    let sink = shared
        .subscriptions
        .lock()
        .await
        .iter()
        .find(|s| topic_matches(&s.filter, &message.topic))
        .map(|s| s.sink.clone());

    let Some(sink) = sink else {
        debug!(topic = %message.topic, "no subscription for topic");
        return;
    };

    // keep per-consumer order behind already parked messages
    if backlog
        .parked
        .iter()
        .any(|(parked, _)| parked.same_channel(&sink))
    {
        backlog.park(sink, message);
        return;
    }

    match sink.try_send(message) {
        Ok(()) => {}
        Err(TrySendError::Full(message)) => {
            debug!(topic = %message.topic, "inbound consumer busy, parking message");
            backlog.park(sink, message);
        }
        Err(TrySendError::Closed(message)) => {
            warn!(topic = %message.topic, "inbound consumer closed, dropping message");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(topic: &str) -> InboundMessage {
        InboundMessage {
            topic: topic.to_string(),
            payload: b"{}".to_vec(),
        }
    }

    async fn shared_with(filter: &str, sink: mpsc::Sender<InboundMessage>) -> Shared {
        let shared = Shared::default();
        shared.subscriptions.lock().await.push(Subscription {
            filter: filter.to_string(),
            sink,
        });
        shared
    }

    #[tokio::test]
    async fn test_deliver_routes_by_filter() {
        let (tx, mut rx) = mpsc::channel(4);
        let shared = shared_with("devices/health/+", tx).await;
        let mut backlog = Backlog::new(8);

        deliver(message("devices/health/a111"), &shared, &mut backlog).await;
        deliver(message("devices/pub/a111"), &shared, &mut backlog).await;

        assert_eq!(rx.recv().await.unwrap().topic, "devices/health/a111");
        assert!(rx.try_recv().is_err());
        assert!(backlog.parked.is_empty());
    }

    #[tokio::test]
    async fn test_full_consumer_parks_messages_in_order() {
        let (tx, mut rx) = mpsc::channel(1);
        let shared = shared_with("devices/pub/+", tx).await;
        let mut backlog = Backlog::new(8);

        deliver(message("devices/pub/1"), &shared, &mut backlog).await;
        deliver(message("devices/pub/2"), &shared, &mut backlog).await;
        deliver(message("devices/pub/3"), &shared, &mut backlog).await;

        assert_eq!(backlog.parked.len(), 2);
        assert_eq!(rx.recv().await.unwrap().topic, "devices/pub/1");

        // room again, but the parked message must go first
        deliver(message("devices/pub/4"), &shared, &mut backlog).await;
        assert_eq!(backlog.parked.len(), 3);
        assert_eq!(backlog.parked[0].1.topic, "devices/pub/2");
    }

    #[tokio::test]
    async fn test_outgoing_publish_binds_queued_ack() {
        let shared = Shared::default();
        let (tx, rx) = oneshot::channel();
        shared.acks.lock().await.queued.push_back(tx);

        let (client, _eventloop) = AsyncClient::new(MqttOptions::new("test", "localhost", 1883), 4);
        let mut backlog = Backlog::new(8);

        handle_event(Event::Outgoing(Outgoing::Publish(7)), &client, &shared, &mut backlog).await;
        // retransmit of the same packet id must not consume another ack
        handle_event(Event::Outgoing(Outgoing::Publish(7)), &client, &shared, &mut backlog).await;
        handle_event(
            Event::Incoming(Packet::PubAck(rumqttc::PubAck::new(7))),
            &client,
            &shared,
            &mut backlog,
        )
        .await;

        assert!(rx.await.unwrap().is_ok());
        assert!(shared.acks.lock().await.in_flight.is_empty());
    }

    #[tokio::test]
    async fn test_full_backlog_still_resolves_publish_acks() {
        let (tx, _rx) = mpsc::channel(1);
        let shared = shared_with("devices/health/+", tx).await;
        let (ack_tx, ack_rx) = oneshot::channel();
        shared.acks.lock().await.queued.push_back(ack_tx);

        let (client, _eventloop) = AsyncClient::new(MqttOptions::new("test", "localhost", 1883), 4);
        let mut backlog = Backlog::new(2);

        // consumer never reads: one message in the channel, then the backlog fills
        for i in 0..5 {
            let publish = rumqttc::Publish::new(
                format!("devices/health/d{}", i),
                QoS::AtLeastOnce,
                b"{}".to_vec(),
            );
            handle_event(Event::Incoming(Packet::Publish(publish)), &client, &shared, &mut backlog)
                .await;
        }
        assert_eq!(backlog.parked.len(), 2);
        assert_eq!(backlog.parked[0].1.topic, "devices/health/d1");

        // a publish waiting on its broker ack is still completed
        handle_event(Event::Outgoing(Outgoing::Publish(3)), &client, &shared, &mut backlog).await;
        handle_event(
            Event::Incoming(Packet::PubAck(rumqttc::PubAck::new(3))),
            &client,
            &shared,
            &mut backlog,
        )
        .await;

        assert!(ack_rx.await.unwrap().is_ok());
    }
}
