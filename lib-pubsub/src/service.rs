//! Pub/sub service
//!
//! Subscriber side: elect or adopt the topic coordinator, replay the log in
//! order, then take pushed updates with a polling fallback. Coordinator
//! side: serialize sequence assignment, store entries and the head marker,
//! push to known subscribers. Publishing coalesces into small batches.
//! Every delivered message is verified against the publisher's published
//! key; failures are counted and dropped.

use crate::coordinator::elect_coordinator;
use crate::error::PubSubError;
use crate::messages::{head_key, message_key, CoordinatorRecord, HeadRecord, TopicMessage};
use crate::PubSubConfig;
use lib_crypto::{NodeId, PublicKey};
use lib_dht::{DhtEngine, Envelope, Payload};
use lib_identity::{public_key_key, IdentityService};
use lru::LruCache;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::sync::{broadcast, mpsc, oneshot, Notify};
use tracing::{debug, info, trace, warn};

/// Verified-key cache size.
const KEY_CACHE_CAPACITY: usize = 256;

/// Delivery channel depth per topic.
const DELIVERY_DEPTH: usize = 1024;

/// How many connected peers hear a new coordinator claim.
const CLAIM_FANOUT: usize = 8;

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Join progress, for callers that want to show it.
#[derive(Debug, Clone, PartialEq)]
pub enum JoinProgress {
    Attempting { attempt: u32 },
    HealthCheck,
    Connecting,
    Validating,
    Retrying { delay: Duration },
    /// Another join for the same topic is already running.
    Concurrent,
}

/// Join tuning; defaults come from the service config.
#[derive(Debug, Clone, Default)]
pub struct JoinOptions {
    pub timeout: Option<Duration>,
    pub max_retries: Option<u32>,
}

struct SubscriptionState {
    last_seen_seq: Option<u64>,
    coordinator: Option<CoordinatorRecord>,
    deliver: broadcast::Sender<TopicMessage>,
}

struct CoordinatorState {
    version: u64,
    next_seq: u64,
    subscribers: HashSet<NodeId>,
}

struct Batch {
    items: Vec<(Value, oneshot::Sender<Result<u64, PubSubError>>)>,
}

pub struct PubSub {
    engine: Arc<DhtEngine>,
    identity: Arc<IdentityService>,
    config: PubSubConfig,
    self_ref: Weak<PubSub>,
    subscriptions: Mutex<HashMap<String, SubscriptionState>>,
    coordinating: Mutex<HashMap<String, CoordinatorState>>,
    batches: Mutex<HashMap<String, Batch>>,
    key_cache: Mutex<LruCache<NodeId, PublicKey>>,
    joins_in_flight: Mutex<HashMap<String, Arc<Notify>>>,
    pub delivered: AtomicU64,
    pub signature_failures: AtomicU64,
}

impl PubSub {
    pub fn new(
        engine: Arc<DhtEngine>,
        identity: Arc<IdentityService>,
        config: PubSubConfig,
    ) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| PubSub {
            engine,
            identity,
            config,
            self_ref: self_ref.clone(),
            subscriptions: Mutex::new(HashMap::new()),
            coordinating: Mutex::new(HashMap::new()),
            batches: Mutex::new(HashMap::new()),
            key_cache: Mutex::new(LruCache::new(
                NonZeroUsize::new(KEY_CACHE_CAPACITY).expect("capacity is nonzero"),
            )),
            joins_in_flight: Mutex::new(HashMap::new()),
            delivered: AtomicU64::new(0),
            signature_failures: AtomicU64::new(0),
        })
    }

    fn validate_topic(topic: &str) -> Result<(), PubSubError> {
        if topic.is_empty() || topic.contains(':') {
            return Err(PubSubError::InvalidTopic(topic.to_string()));
        }
        Ok(())
    }

    // ---- coordinator handling ----

    /// Find or become the coordinator; caches the result per subscription.
    async fn ensure_coordinator(&self, topic: &str) -> Result<CoordinatorRecord, PubSubError> {
        if let Some(cached) = self
            .subscriptions
            .lock()
            .get(topic)
            .and_then(|s| s.coordinator.clone())
        {
            if cached.node_id == self.engine.local_id()
                || self.engine.is_peer_connected(&cached.node_id)
            {
                return Ok(cached);
            }
        }

        let engine = self.engine.clone();
        let record =
            elect_coordinator(&engine, topic, |id| engine.is_peer_connected(id)).await?;

        if record.node_id == self.engine.local_id() {
            self.assume_coordination(topic, &record).await;
        }
        if let Some(state) = self.subscriptions.lock().get_mut(topic) {
            state.coordinator = Some(record.clone());
        }
        Ok(record)
    }

    /// Take on coordinator duties for a topic: seed the sequence counter
    /// from the stored head and announce the claim.
    async fn assume_coordination(&self, topic: &str, record: &CoordinatorRecord) {
        let head = self.read_head(topic).await;
        {
            let mut coordinating = self.coordinating.lock();
            let state = coordinating.entry(topic.to_string()).or_insert(CoordinatorState {
                version: record.version,
                next_seq: 0,
                subscribers: HashSet::new(),
            });
            state.version = record.version;
            state.next_seq = head.map(|h| h.seq + 1).unwrap_or(0);
        }
        info!(topic, version = record.version, "coordinating topic");

        let claim = Payload::CoordinatorClaim {
            topic: topic.to_string(),
            record: serde_json::to_value(record).unwrap_or_default(),
        };
        for peer in self.engine.connected_peers().into_iter().take(CLAIM_FANOUT) {
            let _ = self.engine.notify(peer, claim.clone()).await;
        }
    }

    async fn read_head(&self, topic: &str) -> Option<HeadRecord> {
        match self.engine.get(&head_key(topic)).await {
            Ok(Some(value)) => serde_json::from_value(value).ok(),
            _ => None,
        }
    }

    // ---- subscribe / deliver ----

    /// Subscribe to a topic: election, ordered replay of the whole log,
    /// then pushed updates with polling fallback. A second subscription to
    /// the same topic shares the stream.
    pub async fn subscribe(
        &self,
        topic: &str,
    ) -> Result<broadcast::Receiver<TopicMessage>, PubSubError> {
        Self::validate_topic(topic)?;

        if let Some(state) = self.subscriptions.lock().get(topic) {
            return Ok(state.deliver.subscribe());
        }

        let coordinator = self.ensure_coordinator(topic).await?;
        let (deliver, receiver) = broadcast::channel(DELIVERY_DEPTH);
        self.subscriptions.lock().insert(
            topic.to_string(),
            SubscriptionState {
                last_seen_seq: None,
                coordinator: Some(coordinator.clone()),
                deliver,
            },
        );

        if coordinator.node_id != self.engine.local_id() {
            let request_id = self.engine.next_request_id();
            match self
                .engine
                .request(
                    coordinator.node_id,
                    Payload::Subscribe {
                        request_id,
                        topic: topic.to_string(),
                        last_seen_seq: None,
                    },
                )
                .await
            {
                Ok(Payload::SubscribeAck { success: true, .. }) => {}
                other => debug!(topic, ?other, "subscribe ack missing, relying on polls"),
            }
        }

        // Replay the log before returning; the handler sees history in
        // order, then live traffic.
        let replayed = self.poll(topic).await?;
        debug!(topic, replayed, "subscription established");

        self.spawn_poll_task(topic.to_string());
        Ok(receiver)
    }

    pub fn unsubscribe(&self, topic: &str) {
        self.subscriptions.lock().remove(topic);
    }

    pub fn is_subscribed(&self, topic: &str) -> bool {
        self.subscriptions.lock().contains_key(topic)
    }

    fn spawn_poll_task(&self, topic: String) {
        let weak = self.self_ref.clone();
        let interval = self.config.polling_interval;
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                let Some(this) = weak.upgrade() else { break };
                if !this.is_subscribed(&topic) {
                    break;
                }
                if let Err(err) = this.poll(&topic).await {
                    trace!(topic, %err, "fallback poll failed");
                }
            }
        });
    }

    /// Fetch anything between the local high-water mark and `head:<topic>`,
    /// in order. Idempotent when nothing is new. Head regression is
    /// ignored.
    pub async fn poll(&self, topic: &str) -> Result<usize, PubSubError> {
        let start = {
            let subscriptions = self.subscriptions.lock();
            let state = subscriptions
                .get(topic)
                .ok_or_else(|| PubSubError::NotSubscribed(topic.to_string()))?;
            state.last_seen_seq.map(|s| s + 1).unwrap_or(0)
        };

        let Some(head) = self.read_head(topic).await else {
            return Ok(0);
        };
        if head.seq < start {
            return Ok(0);
        }

        let mut new_messages = 0usize;
        for seq in start..=head.seq {
            let Ok(Some(value)) = self.engine.get(&message_key(topic, seq)).await else {
                // A hole in the log; stop and let the next poll retry.
                break;
            };
            let Ok(message) = serde_json::from_value::<TopicMessage>(value) else {
                warn!(topic, seq, "undecodable log entry skipped");
                break;
            };
            if !self.verify_message(&message).await {
                continue;
            }
            if self.deliver(topic, message) {
                new_messages += 1;
            }
        }
        Ok(new_messages)
    }

    /// Hand a verified message to the topic stream. Returns false when the
    /// subscription vanished.
    fn deliver(&self, topic: &str, message: TopicMessage) -> bool {
        let mut subscriptions = self.subscriptions.lock();
        let Some(state) = subscriptions.get_mut(topic) else {
            return false;
        };
        state.last_seen_seq = Some(message.seq);
        // No live receivers is fine; the subscription stays warm.
        let _ = state.deliver.send(message);
        self.delivered.fetch_add(1, Ordering::Relaxed);
        true
    }

    /// Check a message against the publisher's published key, with a
    /// bounded cache. Unverifiable messages are counted and dropped.
    async fn verify_message(&self, message: &TopicMessage) -> bool {
        let cached_key = self.key_cache.lock().get(&message.publisher_id).copied();
        let key = if message.publisher_id == self.identity.node_id() {
            Some(self.identity.public_key())
        } else if let Some(cached) = cached_key {
            Some(cached)
        } else {
            match self.engine.get(&public_key_key(&message.publisher_id)).await {
                Ok(Some(record)) => record
                    .get("publicKey")
                    .and_then(Value::as_str)
                    .and_then(|hex_key| PublicKey::from_hex(hex_key).ok())
                    .map(|key| {
                        self.key_cache.lock().put(message.publisher_id, key);
                        key
                    }),
                _ => None,
            }
        };

        let valid = key.map(|k| message.verify(&k)).unwrap_or(false);
        if !valid {
            self.signature_failures.fetch_add(1, Ordering::Relaxed);
            warn!(
                publisher = %message.publisher_id.short(),
                seq = message.seq,
                "message signature rejected"
            );
        }
        valid
    }

    // ---- publish ----

    /// Publish to a topic. Calls coalesce for up to `batch_time` or
    /// `batch_size` entries; the coordinator assigns a contiguous range.
    /// Resolves to the assigned sequence number.
    pub async fn publish(&self, topic: &str, data: Value) -> Result<u64, PubSubError> {
        Self::validate_topic(topic)?;

        let (reply_tx, reply_rx) = oneshot::channel();
        let flush_now = {
            let mut batches = self.batches.lock();
            let batch = batches.entry(topic.to_string()).or_insert(Batch { items: Vec::new() });
            batch.items.push((data, reply_tx));
            let first = batch.items.len() == 1;
            let full = batch.items.len() >= self.config.batch_size;
            if first && !full {
                // Arm the timer for this batch.
                let weak = self.self_ref.clone();
                let topic = topic.to_string();
                let delay = self.config.batch_time;
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    if let Some(this) = weak.upgrade() {
                        this.flush_batch(&topic).await;
                    }
                });
            }
            full
        };
        if flush_now {
            self.flush_batch(topic).await;
        }

        reply_rx
            .await
            .map_err(|_| PubSubError::PublishFailed(topic.to_string()))?
    }

    async fn flush_batch(&self, topic: &str) {
        let items = match self.batches.lock().remove(topic) {
            Some(batch) if !batch.items.is_empty() => batch.items,
            _ => return,
        };

        let coordinator = match self.ensure_coordinator(topic).await {
            Ok(record) => record,
            Err(err) => {
                warn!(topic, %err, "publish batch dropped, no coordinator");
                for (_, reply) in items {
                    let _ = reply.send(Err(PubSubError::NoCoordinator(topic.to_string())));
                }
                return;
            }
        };

        if coordinator.node_id == self.engine.local_id() {
            self.assign_and_store(topic, items).await;
        } else {
            self.publish_remote(topic, coordinator.node_id, items).await;
        }
    }

    /// Coordinator path: stamp a contiguous sequence range, store each
    /// entry, advance the head, push to subscribers.
    async fn assign_and_store(
        &self,
        topic: &str,
        items: Vec<(Value, oneshot::Sender<Result<u64, PubSubError>>)>,
    ) {
        let count = items.len() as u64;
        let first_seq = {
            let mut coordinating = self.coordinating.lock();
            let Some(state) = coordinating.get_mut(topic) else {
                for (_, reply) in items {
                    let _ = reply.send(Err(PubSubError::NoCoordinator(topic.to_string())));
                }
                return;
            };
            let first = state.next_seq;
            state.next_seq += count;
            first
        };

        let mut highest = first_seq;
        for (offset, (data, reply)) in items.into_iter().enumerate() {
            let mut message = TopicMessage::signed(
                self.identity.key_pair(),
                self.identity.node_id(),
                data,
                now_ms(),
            );
            message.seq = first_seq + offset as u64;
            highest = message.seq;

            let value = match serde_json::to_value(&message) {
                Ok(value) => value,
                Err(_) => {
                    let _ = reply.send(Err(PubSubError::PublishFailed(topic.to_string())));
                    continue;
                }
            };
            match self.engine.store(&message_key(topic, message.seq), value).await {
                Ok(_) => {
                    self.fan_out(topic, &message).await;
                    self.deliver(topic, message.clone());
                    let _ = reply.send(Ok(message.seq));
                }
                Err(err) => {
                    warn!(topic, seq = message.seq, %err, "log entry store failed");
                    let _ = reply.send(Err(PubSubError::PublishFailed(topic.to_string())));
                }
            }
        }

        let head = HeadRecord {
            seq: highest,
            updated_at: now_ms(),
        };
        if let Ok(value) = serde_json::to_value(head) {
            if let Err(err) = self.engine.store(&head_key(topic), value).await {
                warn!(topic, %err, "head update store failed");
            }
        }
    }

    /// Push a stored entry to every known subscriber.
    async fn fan_out(&self, topic: &str, message: &TopicMessage) {
        let subscribers: Vec<NodeId> = self
            .coordinating
            .lock()
            .get(topic)
            .map(|s| s.subscribers.iter().copied().collect())
            .unwrap_or_default();
        let payload = Payload::HeadUpdate {
            topic: topic.to_string(),
            seq: message.seq,
            message: serde_json::to_value(message).ok(),
        };
        for subscriber in subscribers {
            if subscriber == self.engine.local_id() {
                continue;
            }
            if let Err(err) = self.engine.notify(subscriber, payload.clone()).await {
                trace!(topic, subscriber = %subscriber.short(), %err, "push failed");
            }
        }
    }

    /// Publisher path: sign and hand each entry to the coordinator, one
    /// re-election retry if it went away mid-batch.
    async fn publish_remote(
        &self,
        topic: &str,
        mut coordinator: NodeId,
        items: Vec<(Value, oneshot::Sender<Result<u64, PubSubError>>)>,
    ) {
        for (data, reply) in items {
            let message = TopicMessage::signed(
                self.identity.key_pair(),
                self.identity.node_id(),
                data,
                now_ms(),
            );
            let Ok(message_value) = serde_json::to_value(&message) else {
                let _ = reply.send(Err(PubSubError::PublishFailed(topic.to_string())));
                continue;
            };

            let mut outcome = self
                .send_publish(coordinator, topic, message_value.clone())
                .await;
            if outcome.is_none() {
                // Coordinator may have died; re-elect once and retry.
                if let Some(state) = self.subscriptions.lock().get_mut(topic) {
                    state.coordinator = None;
                }
                if let Ok(record) = self.ensure_coordinator(topic).await {
                    coordinator = record.node_id;
                    if record.node_id == self.engine.local_id() {
                        // We won the re-election; store locally.
                        let data = message.data.clone();
                        let (tx, rx) = oneshot::channel();
                        self.assign_and_store(topic, vec![(data, tx)]).await;
                        let seq = rx.await.ok().and_then(Result::ok);
                        outcome = seq;
                    } else {
                        outcome = self.send_publish(coordinator, topic, message_value).await;
                    }
                }
            }

            match outcome {
                Some(seq) => {
                    let _ = reply.send(Ok(seq));
                }
                None => {
                    let _ = reply.send(Err(PubSubError::PublishFailed(topic.to_string())));
                }
            }
        }
    }

    async fn send_publish(&self, coordinator: NodeId, topic: &str, message: Value) -> Option<u64> {
        let request_id = self.engine.next_request_id();
        match self
            .engine
            .request(
                coordinator,
                Payload::Publish {
                    request_id,
                    topic: topic.to_string(),
                    message,
                },
            )
            .await
        {
            Ok(Payload::PublishAck {
                success: true,
                seq: Some(seq),
                ..
            }) => Some(seq),
            other => {
                debug!(topic, ?other, "publish not acknowledged");
                None
            }
        }
    }

    // ---- inbound pub/sub traffic (from the fabric) ----

    /// Handle a pub/sub message surfaced by the fabric. Returns a response
    /// payload when one is owed.
    pub async fn handle_message(&self, from: NodeId, envelope: &Envelope) -> Option<Payload> {
        match &envelope.payload {
            Payload::Publish {
                request_id,
                topic,
                message,
            } => Some(
                self.handle_publish(envelope.sender_peer, request_id, topic, message)
                    .await,
            ),
            Payload::Subscribe {
                request_id, topic, ..
            } => Some(self.handle_subscribe(envelope.sender_peer, request_id, topic)),
            Payload::CoordinatorClaim { topic, record } => {
                self.handle_claim(topic, record);
                None
            }
            Payload::HeadUpdate {
                topic,
                seq,
                message,
            } => {
                self.handle_head_update(topic, *seq, message.as_ref()).await;
                None
            }
            other => {
                trace!(from = %from.short(), kind = other.type_name(), "not a pub/sub message");
                None
            }
        }
    }

    async fn handle_publish(
        &self,
        publisher: NodeId,
        request_id: &str,
        topic: &str,
        message: &Value,
    ) -> Payload {
        let nack = Payload::PublishAck {
            request_id: request_id.to_string(),
            success: false,
            seq: None,
        };

        if !self.coordinating.lock().contains_key(topic) {
            debug!(topic, publisher = %publisher.short(), "publish to a non-coordinator");
            return nack;
        }
        let Ok(mut message) = serde_json::from_value::<TopicMessage>(message.clone()) else {
            return nack;
        };
        if message.publisher_id != publisher || !self.verify_message(&message).await {
            return nack;
        }

        let seq = {
            let mut coordinating = self.coordinating.lock();
            let Some(state) = coordinating.get_mut(topic) else {
                return nack;
            };
            let seq = state.next_seq;
            state.next_seq += 1;
            seq
        };
        message.seq = seq;

        let Ok(value) = serde_json::to_value(&message) else {
            return nack;
        };
        if let Err(err) = self.engine.store(&message_key(topic, seq), value).await {
            warn!(topic, seq, %err, "log entry store failed");
            return nack;
        }
        let head = HeadRecord {
            seq,
            updated_at: now_ms(),
        };
        if let Ok(head_value) = serde_json::to_value(head) {
            let _ = self.engine.store(&head_key(topic), head_value).await;
        }

        self.fan_out(topic, &message).await;
        self.deliver(topic, message);

        Payload::PublishAck {
            request_id: request_id.to_string(),
            success: true,
            seq: Some(seq),
        }
    }

    fn handle_subscribe(&self, subscriber: NodeId, request_id: &str, topic: &str) -> Payload {
        let mut coordinating = self.coordinating.lock();
        match coordinating.get_mut(topic) {
            Some(state) => {
                state.subscribers.insert(subscriber);
                let head = state.next_seq.checked_sub(1);
                Payload::SubscribeAck {
                    request_id: request_id.to_string(),
                    topic: topic.to_string(),
                    success: true,
                    head,
                }
            }
            None => Payload::SubscribeAck {
                request_id: request_id.to_string(),
                topic: topic.to_string(),
                success: false,
                head: None,
            },
        }
    }

    /// A newer coordinator claim replaces the cached one; an older claim is
    /// ignored. If we were coordinating at a lower version, step down.
    fn handle_claim(&self, topic: &str, record: &Value) {
        let Ok(claim) = serde_json::from_value::<CoordinatorRecord>(record.clone()) else {
            return;
        };
        {
            let mut coordinating = self.coordinating.lock();
            if let Some(state) = coordinating.get(topic) {
                if claim.version > state.version && claim.node_id != self.engine.local_id() {
                    info!(topic, version = claim.version, "stepping down as coordinator");
                    coordinating.remove(topic);
                }
            }
        }
        let mut subscriptions = self.subscriptions.lock();
        if let Some(state) = subscriptions.get_mut(topic) {
            let stale = state
                .coordinator
                .as_ref()
                .map(|c| c.version < claim.version)
                .unwrap_or(true);
            if stale {
                state.coordinator = Some(claim);
            }
        }
    }

    /// Pushed delivery: apply in-order messages directly, poll on any gap.
    async fn handle_head_update(&self, topic: &str, seq: u64, message: Option<&Value>) {
        if !self.is_subscribed(topic) {
            return;
        }
        let expected = self
            .subscriptions
            .lock()
            .get(topic)
            .map(|s| s.last_seen_seq.map(|l| l + 1).unwrap_or(0));
        let Some(expected) = expected else { return };

        if seq < expected {
            // Already seen; a late duplicate push.
            return;
        }
        if seq == expected {
            if let Some(value) = message {
                if let Ok(parsed) = serde_json::from_value::<TopicMessage>(value.clone()) {
                    if self.verify_message(&parsed).await {
                        self.deliver(topic, parsed);
                        return;
                    }
                }
            }
        }
        // Gap, missing body, or rejected signature: fall back to the log.
        if let Err(err) = self.poll(topic).await {
            trace!(topic, %err, "gap poll failed");
        }
    }

    // ---- join with progress ----

    /// Subscribe with retries, backoff, and progress reporting. Concurrent
    /// joins of one topic collapse into a single attempt.
    pub async fn join_channel(
        &self,
        topic: &str,
        options: JoinOptions,
        progress: Option<mpsc::Sender<JoinProgress>>,
    ) -> Result<broadcast::Receiver<TopicMessage>, PubSubError> {
        Self::validate_topic(topic)?;
        let timeout = options.timeout.unwrap_or(self.config.join_timeout);
        let max_retries = options.max_retries.unwrap_or(self.config.join_max_retries);

        let emit = |event: JoinProgress| {
            if let Some(tx) = &progress {
                let _ = tx.try_send(event);
            }
        };

        // Deduplicate concurrent joins: the first caller runs the flow, the
        // rest wait and share the subscription.
        let waiter = {
            let mut joins = self.joins_in_flight.lock();
            match joins.get(topic) {
                Some(notify) => Some(notify.clone()),
                None => {
                    joins.insert(topic.to_string(), Arc::new(Notify::new()));
                    None
                }
            }
        };
        if let Some(notify) = waiter {
            emit(JoinProgress::Concurrent);
            // The other join may already have finished.
            if let Some(state) = self.subscriptions.lock().get(topic) {
                return Ok(state.deliver.subscribe());
            }
            let _ = tokio::time::timeout(timeout, notify.notified()).await;
            if let Some(state) = self.subscriptions.lock().get(topic) {
                return Ok(state.deliver.subscribe());
            }
            return Err(PubSubError::JoinTimeout {
                topic: topic.to_string(),
                attempts: 0,
                hint: "a concurrent join failed; retry once connectivity recovers",
            });
        }

        let started = Instant::now();
        let mut delay = Duration::from_millis(500);
        let mut attempts = 0u32;
        let result = loop {
            attempts += 1;
            emit(JoinProgress::Attempting { attempt: attempts });

            emit(JoinProgress::HealthCheck);
            if self.engine.connected_peers().is_empty() && attempts > 1 {
                debug!(topic, "no connected peers during join");
            }

            emit(JoinProgress::Connecting);
            match self.subscribe(topic).await {
                Ok(receiver) => {
                    emit(JoinProgress::Validating);
                    break Ok(receiver);
                }
                Err(err) => {
                    debug!(topic, attempt = attempts, %err, "join attempt failed");
                    if attempts >= max_retries || started.elapsed() + delay >= timeout {
                        break Err(PubSubError::JoinTimeout {
                            topic: topic.to_string(),
                            attempts,
                            hint: "check peer connectivity and that the coordinator is reachable",
                        });
                    }
                    emit(JoinProgress::Retrying { delay });
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(timeout);
                }
            }
        };

        if let Some(notify) = self.joins_in_flight.lock().remove(topic) {
            notify.notify_waiters();
        }
        result
    }
}
