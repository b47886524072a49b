//! Message bus: typed envelopes, direct/broadcast/topic routing,
//! acknowledgement tracking, heartbeat and local subscriptions.
//!
//! Every outbound message is appended to the record log before it is
//! handed to the [`MessageSink`], so a crash between the two leaves a
//! `message` record with no matching `delivery` record. `undelivered()`
//! finds those and `replay_undelivered()` sends them again.

pub mod message;
pub mod subscription;

pub use message::{
    Cancellation, ContextSharing, Endpoint, ErrorNotification, HandoffRequest, HeartbeatPayload,
    Message, MessagePayload, MessageType, RoutingMode, StatusUpdate, TaskRequest,
};
pub use subscription::{Callback, CompareOp, Condition, EventFilter, Subscription};

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use tokio::sync::{Mutex, RwLock, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{BusConfig, DelegatorConfig};
use crate::delegation::task::Priority;
use crate::error::{BusError, TransportError};
use crate::store::{Database, Record, RecordFilter, RecordKind};
use crate::transport::TransportPool;
use crate::workers::WorkerKind;

/// Where outbound messages physically go. Implementations talk to the
/// worker backends; the bus wraps every call in a resilient transport.
#[async_trait]
pub trait MessageSink: Send + Sync {
    async fn deliver(&self, message: &Message) -> Result<(), TransportError>;
}

/// Sink that only logs. Used when no worker backend is attached.
#[derive(Debug, Default)]
pub struct LoggingSink;

#[async_trait]
impl MessageSink for LoggingSink {
    async fn deliver(&self, message: &Message) -> Result<(), TransportError> {
        info!(
            message_id = %message.id,
            message_type = %message.message_type,
            target = %message.target,
            recipient = ?message.recipient,
            "Message delivered"
        );
        Ok(())
    }
}

/// Sink that forwards into an in-process channel, for embedding workers
/// in the same process.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<Message>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Message>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl MessageSink for ChannelSink {
    async fn deliver(&self, message: &Message) -> Result<(), TransportError> {
        self.tx
            .send(message.clone())
            .map_err(|_| TransportError::network("worker channel closed"))
    }
}

/// Extra knobs for [`MessageBus::send`].
#[derive(Debug, Clone, Default)]
pub struct SendOptions {
    pub priority: Priority,
    pub requires_ack: bool,
    pub correlation_id: Option<Uuid>,
    pub recipient: Option<String>,
    pub routing: RoutingMode,
}

/// An outbound message awaiting acknowledgement.
#[derive(Debug, Clone)]
pub struct PendingAck {
    pub message: Message,
    pub sent_at: DateTime<Utc>,
}

pub struct MessageBus {
    config: BusConfig,
    transports: Arc<TransportPool>,
    sink: Arc<dyn MessageSink>,
    store: Arc<dyn Database>,
    subscriptions: RwLock<Vec<Subscription>>,
    pending_acks: RwLock<HashMap<Uuid, PendingAck>>,
    connected: AtomicBool,
    heartbeat: Mutex<Option<JoinHandle<()>>>,
}

impl MessageBus {
    pub fn new(
        config: &DelegatorConfig,
        transports: Arc<TransportPool>,
        sink: Arc<dyn MessageSink>,
        store: Arc<dyn Database>,
    ) -> Self {
        Self {
            config: config.bus.clone(),
            transports,
            sink,
            store,
            subscriptions: RwLock::new(Vec::new()),
            pending_acks: RwLock::new(HashMap::new()),
            connected: AtomicBool::new(true),
            heartbeat: Mutex::new(None),
        }
    }

    /// Build and publish a message from the coordinator.
    pub async fn send(
        &self,
        message_type: MessageType,
        payload: serde_json::Value,
        target: Endpoint,
        options: SendOptions,
    ) -> Result<Uuid, BusError> {
        let mut message = Message::new(message_type, Endpoint::Coordinator, target, payload)
            .with_priority(options.priority)
            .with_routing(options.routing);
        message.requires_ack = options.requires_ack;
        message.correlation_id = options.correlation_id;
        message.recipient = options.recipient;
        self.publish(message).await
    }

    /// Publish a typed payload from the coordinator.
    pub async fn send_payload<P: MessagePayload>(
        &self,
        payload: &P,
        target: Endpoint,
        options: SendOptions,
    ) -> Result<Uuid, BusError> {
        let mut message = Message::from_payload(Endpoint::Coordinator, target, payload)?
            .with_priority(options.priority)
            .with_routing(options.routing);
        message.requires_ack = options.requires_ack;
        message.recipient = options.recipient;
        if options.correlation_id.is_some() {
            message.correlation_id = options.correlation_id;
        }
        self.publish(message).await
    }

    /// Validate, record, deliver and fan out a fully built message.
    pub async fn publish(&self, mut message: Message) -> Result<Uuid, BusError> {
        message.validate()?;
        self.enforce_size(&mut message)?;

        let mut record = Record::new(
            RecordKind::Message,
            message.id.to_string(),
            serde_json::to_value(&message)?,
        );
        if let Some(correlation) = message.correlation_id {
            record = record.with_correlation(correlation);
        }
        self.store.append(&record).await?;

        self.route(&message).await?;

        if message.requires_ack {
            self.pending_acks.write().await.insert(
                message.id,
                PendingAck {
                    message: message.clone(),
                    sent_at: Utc::now(),
                },
            );
        }

        self.notify(&message).await;
        Ok(message.id)
    }

    /// Inbound path for messages arriving from workers.
    ///
    /// Records the message, settles acknowledgements for its task and
    /// runs matching local subscriptions.
    pub async fn receive(&self, message: Message) -> Result<usize, BusError> {
        message.validate()?;
        let mut record = Record::new(
            RecordKind::Message,
            message.id.to_string(),
            serde_json::to_value(&message)?,
        );
        if let Some(correlation) = message.correlation_id {
            record = record.with_correlation(correlation);
        }
        self.store.append(&record).await?;

        let settles_acks = matches!(
            message.message_type,
            MessageType::StatusUpdate
                | MessageType::ProgressUpdate
                | MessageType::TaskResponse
                | MessageType::ErrorNotification
        );
        if let Some(task_id) = message.correlation_id.filter(|_| settles_acks) {
            self.acknowledge_correlated(task_id).await;
        }

        debug!(
            message_id = %message.id,
            message_type = %message.message_type,
            source = %message.source,
            "Message received"
        );
        Ok(self.notify(&message).await)
    }

    /// Compact payloads over the compression threshold, then hold the
    /// result to the size ceiling.
    fn enforce_size(&self, message: &mut Message) -> Result<(), BusError> {
        let mut size = serde_json::to_vec(&message.payload)?.len();
        if size > self.config.compression_threshold_bytes {
            let removed = message::strip_nulls(&mut message.payload);
            if removed > 0 {
                let compacted = serde_json::to_vec(&message.payload)?.len();
                debug!(message_id = %message.id, size, compacted, removed, "Payload compacted");
                size = compacted;
            }
        }
        if size > self.config.max_payload_bytes {
            return Err(BusError::PayloadTooLarge {
                size,
                limit: self.config.max_payload_bytes,
            });
        }
        Ok(())
    }

    async fn route(&self, message: &Message) -> Result<(), BusError> {
        match &message.routing {
            RoutingMode::Direct => {
                self.deliver(message).await?;
                self.record_delivery(message, &[message.target]).await;
                Ok(())
            }
            RoutingMode::Broadcast => {
                let legs = WorkerKind::ALL.into_iter().map(|kind| {
                    let mut copy = message.clone();
                    copy.target = Endpoint::Worker(kind);
                    async move {
                        let outcome = self.deliver(&copy).await;
                        (kind, outcome)
                    }
                });
                let mut delivered = Vec::new();
                let mut last_error = None;
                for (kind, outcome) in join_all(legs).await {
                    match outcome {
                        Ok(()) => delivered.push(Endpoint::Worker(kind)),
                        Err(e) => {
                            warn!(
                                message_id = %message.id,
                                target = %kind,
                                error = %e,
                                "Broadcast leg failed"
                            );
                            last_error = Some(e);
                        }
                    }
                }
                match (delivered.is_empty(), last_error) {
                    (true, Some(e)) => Err(e),
                    _ => {
                        self.record_delivery(message, &delivered).await;
                        Ok(())
                    }
                }
            }
            RoutingMode::Topic { topic } => {
                info!(
                    message_id = %message.id,
                    topic = %topic,
                    "Topic message recorded, not dispatched"
                );
                Ok(())
            }
        }
    }

    /// Heartbeats and non-worker targets use the control transport; worker
    /// traffic uses the transport of its target kind.
    async fn deliver(&self, message: &Message) -> Result<(), BusError> {
        let transport = match (message.message_type, &message.target) {
            (MessageType::Heartbeat, _) => self.transports.control(),
            (_, Endpoint::Worker(kind)) => self.transports.for_kind(*kind),
            _ => self.transports.control(),
        };
        let sink = self.sink.clone();
        transport
            .call(|| {
                let sink = sink.clone();
                let message = message.clone();
                async move { sink.deliver(&message).await }
            })
            .await
            .map_err(|source| BusError::DeliveryFailed {
                target: message.target.to_string(),
                source,
            })
    }

    async fn record_delivery(&self, message: &Message, targets: &[Endpoint]) {
        let targets: Vec<String> = targets.iter().map(ToString::to_string).collect();
        let mut record = Record::new(
            RecordKind::Delivery,
            message.id.to_string(),
            serde_json::json!({ "targets": targets }),
        );
        if let Some(correlation) = message.correlation_id {
            record = record.with_correlation(correlation);
        }
        if let Err(e) = self.store.append(&record).await {
            warn!(message_id = %message.id, error = %e, "Failed to record delivery");
        }
    }

    /// Run matching subscriptions. Returns how many succeeded.
    async fn notify(&self, message: &Message) -> usize {
        let subscriptions: Vec<Subscription> = self
            .subscriptions
            .read()
            .await
            .iter()
            .filter(|s| s.matches(message))
            .cloned()
            .collect();

        let mut ok = 0;
        for sub in subscriptions {
            match sub.invoke(message) {
                Ok(()) => ok += 1,
                Err(e) => warn!(
                    subscription = %sub.id,
                    message_id = %message.id,
                    error = %e,
                    "Subscriber failed"
                ),
            }
        }
        ok
    }

    pub async fn subscribe(&self, subscription: Subscription) -> Uuid {
        let id = subscription.id;
        self.subscriptions.write().await.push(subscription);
        debug!(subscription = %id, "Subscription added");
        id
    }

    /// Subscribe with a condition expression such as `priority >= high`.
    pub async fn subscribe_when(
        &self,
        event: EventFilter,
        condition: &str,
        callback: Callback,
    ) -> Result<Uuid, BusError> {
        let condition: Condition = condition.parse()?;
        Ok(self
            .subscribe(Subscription::new(event, callback).when(condition))
            .await)
    }

    pub async fn unsubscribe(&self, id: Uuid) -> Result<(), BusError> {
        let mut subs = self.subscriptions.write().await;
        let before = subs.len();
        subs.retain(|s| s.id != id);
        if subs.len() == before {
            return Err(BusError::SubscriptionNotFound(id));
        }
        Ok(())
    }

    pub async fn subscription_count(&self) -> usize {
        self.subscriptions.read().await.len()
    }

    // ── Acknowledgements ───────────────────────────────────────────

    /// Settle one message. Returns false if it was not pending.
    pub async fn acknowledge(&self, message_id: Uuid) -> bool {
        let Some(pending) = self.pending_acks.write().await.remove(&message_id) else {
            return false;
        };
        self.record_ack(&pending.message).await;
        true
    }

    /// Settle every pending message for a task. Returns how many.
    pub async fn acknowledge_correlated(&self, task_id: Uuid) -> usize {
        let settled: Vec<PendingAck> = {
            let mut pending = self.pending_acks.write().await;
            let ids: Vec<Uuid> = pending
                .values()
                .filter(|p| p.message.correlation_id == Some(task_id))
                .map(|p| p.message.id)
                .collect();
            ids.iter().filter_map(|id| pending.remove(id)).collect()
        };
        for p in &settled {
            self.record_ack(&p.message).await;
        }
        settled.len()
    }

    async fn record_ack(&self, message: &Message) {
        let mut record = Record::new(
            RecordKind::Ack,
            message.id.to_string(),
            serde_json::json!({ "acknowledged_at": Utc::now() }),
        );
        if let Some(correlation) = message.correlation_id {
            record = record.with_correlation(correlation);
        }
        if let Err(e) = self.store.append(&record).await {
            warn!(message_id = %message.id, error = %e, "Failed to record ack");
        }
    }

    pub async fn pending_acks(&self) -> Vec<PendingAck> {
        let mut all: Vec<_> = self.pending_acks.read().await.values().cloned().collect();
        all.sort_by_key(|p| p.sent_at);
        all
    }

    /// Pending messages older than the ack timeout.
    pub async fn expired_acks(&self, now: DateTime<Utc>) -> Vec<PendingAck> {
        let timeout = chrono::Duration::from_std(self.config.ack_timeout)
            .unwrap_or_else(|_| chrono::Duration::seconds(60));
        self.pending_acks()
            .await
            .into_iter()
            .filter(|p| now - p.sent_at > timeout)
            .collect()
    }

    // ── Replay ─────────────────────────────────────────────────────

    /// Outbound messages that were recorded but never delivered.
    pub async fn undelivered(&self) -> Result<Vec<Message>, BusError> {
        let delivered: HashSet<String> = self
            .store
            .query(&RecordFilter::kind(RecordKind::Delivery))
            .await?
            .into_iter()
            .map(|r| r.key)
            .collect();

        let mut out = Vec::new();
        for record in self
            .store
            .query(&RecordFilter::kind(RecordKind::Message))
            .await?
        {
            if delivered.contains(&record.key) {
                continue;
            }
            let message: Message = serde_json::from_value(record.body)?;
            let outbound = message.source == Endpoint::Coordinator;
            let dispatchable = !matches!(message.routing, RoutingMode::Topic { .. });
            if outbound && dispatchable {
                out.push(message);
            }
        }
        Ok(out)
    }

    /// Deliver every undelivered message again. Returns how many went out.
    pub async fn replay_undelivered(&self) -> Result<usize, BusError> {
        let mut replayed = 0;
        for message in self.undelivered().await? {
            match self.route(&message).await {
                Ok(()) => replayed += 1,
                Err(e) => warn!(message_id = %message.id, error = %e, "Replay failed"),
            }
        }
        if replayed > 0 {
            info!(replayed, "Replayed undelivered messages");
        }
        Ok(replayed)
    }

    // ── Heartbeat ──────────────────────────────────────────────────

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Broadcast one heartbeat carrying the connection state.
    pub async fn send_heartbeat(&self) -> Result<Uuid, BusError> {
        let payload = HeartbeatPayload {
            sender_id: None,
            connected: self.is_connected(),
            pending_acks: self.pending_acks.read().await.len(),
            report: None,
        };
        let result = self
            .send_payload(
                &payload,
                Endpoint::All,
                SendOptions {
                    priority: Priority::Low,
                    routing: RoutingMode::Broadcast,
                    ..Default::default()
                },
            )
            .await;
        self.connected.store(result.is_ok(), Ordering::SeqCst);
        result
    }

    /// Start the periodic heartbeat. Failures are logged, never fatal.
    pub async fn start_heartbeat(self: &Arc<Self>) {
        let mut slot = self.heartbeat.lock().await;
        if slot.is_some() {
            return;
        }
        let bus = Arc::clone(self);
        let period = self.config.heartbeat_interval;
        *slot = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await;
            loop {
                interval.tick().await;
                if let Err(e) = bus.send_heartbeat().await {
                    warn!(error = %e, "Heartbeat failed");
                }
            }
        }));
        debug!(interval = ?period, "Heartbeat started");
    }

    pub async fn stop_heartbeat(&self) {
        if let Some(handle) = self.heartbeat.lock().await.take() {
            handle.abort();
        }
    }

    /// Ask `target` to take over a task.
    pub async fn request_handoff(
        &self,
        request: &HandoffRequest,
        target: WorkerKind,
    ) -> Result<Uuid, BusError> {
        self.send_payload(
            request,
            Endpoint::Worker(target),
            SendOptions {
                priority: Priority::High,
                requires_ack: true,
                recipient: request.to_worker.clone(),
                ..Default::default()
            },
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use super::*;
    use crate::config::{CircuitBreakerConfig, RetryConfig};
    use crate::error::ErrorKind;
    use crate::store::LibSqlBackend;
    use crate::transport::CircuitState;
    use serde_json::json;

    #[derive(Default)]
    struct RecordingSink {
        delivered: std::sync::Mutex<Vec<Message>>,
        fail: AtomicBool,
        /// Fail only deliveries aimed at this endpoint.
        down: std::sync::Mutex<Option<Endpoint>>,
    }

    #[async_trait]
    impl MessageSink for RecordingSink {
        async fn deliver(&self, message: &Message) -> Result<(), TransportError> {
            let down = *self.down.lock().unwrap() == Some(message.target);
            if down || self.fail.load(Ordering::SeqCst) {
                return Err(TransportError::network("backend unreachable"));
            }
            self.delivered.lock().unwrap().push(message.clone());
            Ok(())
        }
    }

    fn config() -> DelegatorConfig {
        DelegatorConfig {
            retry: RetryConfig {
                max_attempts: 2,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(2),
                ..Default::default()
            },
            circuit_breaker: CircuitBreakerConfig {
                failure_threshold: 100,
                recovery_timeout: Duration::from_secs(60),
            },
            ..Default::default()
        }
    }

    async fn bus_with(
        sink: Arc<RecordingSink>,
        config: DelegatorConfig,
    ) -> (MessageBus, Arc<dyn Database>) {
        let store: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let transports = Arc::new(TransportPool::new(&config));
        (
            MessageBus::new(&config, transports, sink, store.clone()),
            store,
        )
    }

    fn cancel(task_id: Uuid) -> Cancellation {
        Cancellation {
            task_id,
            reason: "test".into(),
        }
    }

    #[tokio::test]
    async fn direct_send_records_then_delivers() {
        let sink = Arc::new(RecordingSink::default());
        let (bus, store) = bus_with(sink.clone(), config()).await;
        let task_id = Uuid::new_v4();

        let cloud = Endpoint::Worker(WorkerKind::Cloud);
        let id = bus
            .send_payload(&cancel(task_id), cloud, SendOptions::default())
            .await
            .unwrap();

        assert_eq!(sink.delivered.lock().unwrap().len(), 1);
        let records = store
            .query(&RecordFilter::default().with_correlation(task_id))
            .await
            .unwrap();
        let kinds: Vec<_> = records.iter().map(|r| r.kind).collect();
        assert_eq!(kinds, vec![RecordKind::Message, RecordKind::Delivery]);
        assert_eq!(records[0].key, id.to_string());
        assert!(bus.undelivered().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn broadcast_fans_out_to_every_kind() {
        let sink = Arc::new(RecordingSink::default());
        let (bus, _) = bus_with(sink.clone(), config()).await;
        bus.send_heartbeat().await.unwrap();

        let delivered = sink.delivered.lock().unwrap();
        assert_eq!(delivered.len(), WorkerKind::ALL.len());
        assert!(delivered.iter().all(|m| m.message_type == MessageType::Heartbeat));
        assert!(bus.is_connected());
    }

    #[tokio::test]
    async fn topic_is_recorded_not_dispatched() {
        let sink = Arc::new(RecordingSink::default());
        let (bus, store) = bus_with(sink.clone(), config()).await;
        bus.send(
            MessageType::ContextSharing,
            json!({"task_id": Uuid::new_v4(), "context": {}}),
            Endpoint::Coordinator,
            SendOptions {
                correlation_id: Some(Uuid::new_v4()),
                routing: RoutingMode::Topic {
                    topic: "insights".into(),
                },
                ..Default::default()
            },
        )
        .await
        .unwrap();

        assert!(sink.delivered.lock().unwrap().is_empty());
        let messages = store
            .query(&RecordFilter::kind(RecordKind::Message))
            .await
            .unwrap();
        assert_eq!(messages.len(), 1);
        assert!(bus.undelivered().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn oversized_payload_is_rejected() {
        let mut cfg = config();
        cfg.bus.max_payload_bytes = 64;
        cfg.bus.compression_threshold_bytes = 32;
        let sink = Arc::new(RecordingSink::default());
        let (bus, _) = bus_with(sink, cfg).await;

        let err = bus
            .send(
                MessageType::ContextSharing,
                json!({"blob": "x".repeat(200)}),
                Endpoint::Worker(WorkerKind::Local),
                SendOptions {
                    correlation_id: Some(Uuid::new_v4()),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, BusError::PayloadTooLarge { limit: 64, .. }));
    }

    #[tokio::test]
    async fn large_payload_has_nulls_stripped() {
        let mut cfg = config();
        cfg.bus.compression_threshold_bytes = 16;
        let sink = Arc::new(RecordingSink::default());
        let (bus, _) = bus_with(sink.clone(), cfg).await;

        bus.send(
            MessageType::ContextSharing,
            json!({"keep": "some longer value", "drop": null}),
            Endpoint::Worker(WorkerKind::Local),
            SendOptions {
                correlation_id: Some(Uuid::new_v4()),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        let delivered = sink.delivered.lock().unwrap();
        assert!(delivered[0].payload.get("drop").is_none());
        assert_eq!(delivered[0].payload["keep"], "some longer value");
    }

    #[tokio::test]
    async fn payload_within_limit_once_nulls_are_stripped_is_sent() {
        let mut cfg = config();
        cfg.bus.max_payload_bytes = 48;
        cfg.bus.compression_threshold_bytes = 16;
        let sink = Arc::new(RecordingSink::default());
        let (bus, _) = bus_with(sink.clone(), cfg).await;

        // 80+ bytes raw, under 48 once the nulls are gone
        let payload = json!({
            "keep": "value",
            "a": null, "b": null, "c": null, "d": null,
            "e": null, "f": null, "g": null, "h": null,
        });
        assert!(serde_json::to_vec(&payload).unwrap().len() > 48);

        bus.send(
            MessageType::ContextSharing,
            payload,
            Endpoint::Worker(WorkerKind::Local),
            SendOptions {
                correlation_id: Some(Uuid::new_v4()),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        let delivered = sink.delivered.lock().unwrap();
        assert_eq!(delivered[0].payload, json!({"keep": "value"}));
    }

    #[tokio::test]
    async fn unreachable_kind_does_not_trip_other_kinds() {
        let mut cfg = config();
        cfg.retry.max_attempts = 1;
        cfg.circuit_breaker.failure_threshold = 1;
        let sink = Arc::new(RecordingSink::default());
        *sink.down.lock().unwrap() = Some(Endpoint::Worker(WorkerKind::Gpu));
        let (bus, _) = bus_with(sink.clone(), cfg).await;

        let gpu = Endpoint::Worker(WorkerKind::Gpu);
        let first = bus
            .send_payload(&cancel(Uuid::new_v4()), gpu, SendOptions::default())
            .await;
        assert!(matches!(first, Err(BusError::DeliveryFailed { .. })));
        assert_eq!(
            bus.transports.for_kind(WorkerKind::Gpu).breaker().state().await,
            CircuitState::Open
        );
        let second = bus
            .send_payload(&cancel(Uuid::new_v4()), gpu, SendOptions::default())
            .await;
        assert!(matches!(
            second,
            Err(BusError::DeliveryFailed { source, .. }) if source.kind == ErrorKind::CircuitOpen
        ));

        bus.send_payload(
            &cancel(Uuid::new_v4()),
            Endpoint::Worker(WorkerKind::Local),
            SendOptions::default(),
        )
        .await
        .unwrap();
        assert_eq!(sink.delivered.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn heartbeat_failures_leave_dispatch_breakers_closed() {
        let mut cfg = config();
        cfg.retry.max_attempts = 1;
        cfg.circuit_breaker.failure_threshold = 1;
        let sink = Arc::new(RecordingSink::default());
        *sink.down.lock().unwrap() = Some(Endpoint::Worker(WorkerKind::Gpu));
        let (bus, _) = bus_with(sink.clone(), cfg).await;

        bus.send_heartbeat().await.unwrap();
        for kind in WorkerKind::ALL {
            assert_eq!(
                bus.transports.for_kind(kind).breaker().state().await,
                CircuitState::Closed
            );
        }

        *sink.down.lock().unwrap() = None;
        bus.send_payload(
            &cancel(Uuid::new_v4()),
            Endpoint::Worker(WorkerKind::Gpu),
            SendOptions::default(),
        )
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn failed_delivery_is_replayable() {
        let sink = Arc::new(RecordingSink::default());
        sink.fail.store(true, Ordering::SeqCst);
        let (bus, _) = bus_with(sink.clone(), config()).await;

        let gpu = Endpoint::Worker(WorkerKind::Gpu);
        let err = bus
            .send_payload(&cancel(Uuid::new_v4()), gpu, SendOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, BusError::DeliveryFailed { .. }));
        assert_eq!(bus.undelivered().await.unwrap().len(), 1);

        sink.fail.store(false, Ordering::SeqCst);
        assert_eq!(bus.replay_undelivered().await.unwrap(), 1);
        assert!(bus.undelivered().await.unwrap().is_empty());
        assert_eq!(sink.delivered.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn acks_settle_on_correlated_inbound() {
        let sink = Arc::new(RecordingSink::default());
        let (bus, _) = bus_with(sink, config()).await;
        let task_id = Uuid::new_v4();

        bus.send_payload(
            &cancel(task_id),
            Endpoint::Worker(WorkerKind::Cloud),
            SendOptions {
                requires_ack: true,
                ..Default::default()
            },
        )
        .await
        .unwrap();
        assert_eq!(bus.pending_acks().await.len(), 1);
        assert!(bus.expired_acks(Utc::now()).await.is_empty());
        assert_eq!(
            bus.expired_acks(Utc::now() + chrono::Duration::minutes(5))
                .await
                .len(),
            1
        );

        let update = Message::from_payload(
            Endpoint::Worker(WorkerKind::Cloud),
            Endpoint::Coordinator,
            &StatusUpdate {
                task_id,
                status: crate::delegation::task::TaskStatus::Cancelled,
                message: None,
            },
        )
        .unwrap();
        bus.receive(update).await.unwrap();
        assert!(bus.pending_acks().await.is_empty());
    }

    #[tokio::test]
    async fn failing_subscriber_does_not_block_others() {
        let sink = Arc::new(RecordingSink::default());
        let (bus, _) = bus_with(sink, config()).await;
        let hits = Arc::new(AtomicUsize::new(0));

        bus.subscribe(Subscription::new(
            EventFilter::Any,
            Arc::new(|_: &Message| -> anyhow::Result<()> { Err(anyhow::anyhow!("nope")) }),
        ))
        .await;
        bus.subscribe(Subscription::new(
            EventFilter::Any,
            Arc::new(|_: &Message| -> anyhow::Result<()> { panic!("subscriber bug") }),
        ))
        .await;
        let h = hits.clone();
        bus.subscribe(Subscription::new(
            EventFilter::Only(MessageType::StatusUpdate),
            Arc::new(move |_: &Message| -> anyhow::Result<()> {
                h.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
        ))
        .await;

        let inbound = Message::from_payload(
            Endpoint::Worker(WorkerKind::Edge),
            Endpoint::Coordinator,
            &StatusUpdate {
                task_id: Uuid::new_v4(),
                status: crate::delegation::task::TaskStatus::Processing,
                message: None,
            },
        )
        .unwrap();
        assert_eq!(bus.receive(inbound).await.unwrap(), 1);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn conditional_subscription_and_unsubscribe() {
        let sink = Arc::new(RecordingSink::default());
        let (bus, _) = bus_with(sink, config()).await;
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();

        let id = bus
            .subscribe_when(
                EventFilter::Any,
                "priority >= high",
                Arc::new(move |_: &Message| -> anyhow::Result<()> {
                    h.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }),
            )
            .await
            .unwrap();

        for priority in [Priority::Low, Priority::Urgent] {
            bus.send_payload(
                &cancel(Uuid::new_v4()),
                Endpoint::Worker(WorkerKind::Local),
                SendOptions {
                    priority,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        }
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        bus.unsubscribe(id).await.unwrap();
        assert!(matches!(
            bus.unsubscribe(id).await,
            Err(BusError::SubscriptionNotFound(_))
        ));
        let noop: Callback = Arc::new(|_: &Message| -> anyhow::Result<()> { Ok(()) });
        assert!(
            bus.subscribe_when(EventFilter::Any, "nonsense", noop)
                .await
                .is_err()
        );
    }
}
