//! Kademlia engine
//!
//! Iterative lookups, replicated storage, CAS for coordinator records, and
//! the RPC answering side. The engine owns the routing table, the local
//! store, and the pending-request registry; everything it sends goes through
//! the [`PeerSender`] contract implemented by the connection fabric.

use crate::contact::{ConnectionState, Contact, ContactInfo};
use crate::error::DhtError;
use crate::pending::PendingRequests;
use crate::routing_table::{RoutingStats, RoutingTable};
use crate::store::LocalStore;
use crate::wire::{Envelope, Payload};
use crate::DhtConfig;
use async_trait::async_trait;
use lib_crypto::{Distance, NodeId};
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

/// Outbound half of the connection fabric, as the engine sees it.
#[async_trait]
pub trait PeerSender: Send + Sync {
    /// Deliver an envelope to a connected peer.
    async fn send(&self, to: &NodeId, envelope: Envelope) -> anyhow::Result<()>;

    /// Ask the fabric to open a connection toward a known contact.
    async fn connect(&self, contact: &ContactInfo) -> anyhow::Result<()>;

    fn is_connected(&self, peer: &NodeId) -> bool;

    fn connected_peers(&self) -> Vec<NodeId>;
}

/// Result of a compare-and-swap against a replicated record.
#[derive(Debug, Clone, PartialEq)]
pub enum CasOutcome {
    Accepted,
    /// The expectation was stale; here is the record that won.
    Conflict(Value),
}

pub struct DhtEngine {
    local: ContactInfo,
    config: DhtConfig,
    table: RwLock<RoutingTable>,
    store: Mutex<LocalStore>,
    pending: PendingRequests,
    sender: Arc<dyn PeerSender>,
    find_node_last: Mutex<HashMap<NodeId, Instant>>,
}

impl DhtEngine {
    pub fn new(
        local: ContactInfo,
        config: DhtConfig,
        sender: Arc<dyn PeerSender>,
    ) -> Result<Arc<Self>, DhtError> {
        config.validate()?;
        let table = RoutingTable::new(local.id, config.k);
        let store = LocalStore::new(config.expire_interval, config.republish_interval);
        let pending = PendingRequests::new(local.id.short());
        Ok(Arc::new(DhtEngine {
            local,
            config,
            table: RwLock::new(table),
            store: Mutex::new(store),
            pending,
            sender,
            find_node_last: Mutex::new(HashMap::new()),
        }))
    }

    pub fn local_id(&self) -> NodeId {
        self.local.id
    }

    pub fn local_info(&self) -> &ContactInfo {
        &self.local
    }

    pub fn config(&self) -> &DhtConfig {
        &self.config
    }

    // ---- routing-table surface used by the fabric ----

    /// Learn about a peer without any connection-state claim.
    pub fn observe_contact(&self, info: ContactInfo) {
        if info.id == self.local.id {
            return;
        }
        let mut table = self.table.write();
        if table.contains(&info.id) {
            table.touch(&info.id);
        } else {
            table.insert_info(info);
        }
    }

    /// Insert a temporary entry so a signaling reply has a route back.
    pub fn observe_temporary_contact(&self, info: ContactInfo) {
        if info.id == self.local.id {
            return;
        }
        let mut table = self.table.write();
        if !table.contains(&info.id) {
            table.insert(Contact::temporary(info));
        }
    }

    pub fn on_peer_connected(&self, info: ContactInfo) {
        let mut table = self.table.write();
        match table.get_mut(&info.id) {
            Some(contact) => {
                contact.info = info;
                contact.state = ConnectionState::Connected;
                contact.promote();
                contact.touch();
            }
            None => {
                let mut contact = Contact::new(info);
                contact.state = ConnectionState::Connected;
                table.insert(contact);
            }
        }
    }

    pub fn on_peer_disconnected(&self, id: &NodeId) {
        if let Some(contact) = self.table.write().get_mut(id) {
            contact.state = ConnectionState::Failed;
        }
    }

    /// Closest connected peer to `target`, for greedy overlay forwarding.
    pub fn closest_connected(&self, target: &NodeId, exclude: &[NodeId]) -> Option<NodeId> {
        let table = self.table.read();
        table
            .closest(target, table.k())
            .into_iter()
            .map(|c| c.id)
            .filter(|id| !exclude.contains(id))
            .find(|id| self.sender.is_connected(id))
    }

    pub fn routing_stats(&self) -> RoutingStats {
        self.table.read().stats()
    }

    pub fn known_contacts(&self) -> Vec<ContactInfo> {
        self.table.read().all_contacts()
    }

    pub fn store_len(&self) -> usize {
        self.store.lock().len()
    }

    pub fn store_save(&self, path: &Path) -> anyhow::Result<()> {
        self.store.lock().save(path)
    }

    pub fn store_load(&self, path: &Path) -> anyhow::Result<()> {
        self.store.lock().load(path)
    }

    // ---- request plumbing ----

    pub fn next_request_id(&self) -> String {
        self.pending.next_request_id()
    }

    pub fn sweep_pending(&self) -> usize {
        self.pending.sweep_expired()
    }

    /// Fewer than two live links: relax rate limits and widen refresh.
    pub fn emergency_mode(&self) -> bool {
        self.sender.connected_peers().len() < 2
    }

    pub fn is_peer_connected(&self, peer: &NodeId) -> bool {
        self.sender.is_connected(peer)
    }

    pub fn connected_peers(&self) -> Vec<NodeId> {
        self.sender.connected_peers()
    }

    /// Fire-and-forget envelope to a peer, outside the correlator. Used by
    /// upper layers for pushes that carry no reply.
    pub async fn notify(&self, to: NodeId, payload: Payload) -> Result<(), DhtError> {
        if to == self.local.id {
            return Err(DhtError::SelfRequest);
        }
        let envelope = Envelope::new(self.local.id, Some(to), payload);
        self.sender.send(&to, envelope).await.map_err(DhtError::Send)
    }

    /// Correlated request/response exchange. Every RPC in the system runs
    /// through here; the payload must carry a request id from
    /// [`DhtEngine::next_request_id`].
    pub async fn request(&self, to: NodeId, payload: Payload) -> Result<Payload, DhtError> {
        if to == self.local.id {
            return Err(DhtError::SelfRequest);
        }
        let request_id = payload
            .request_id()
            .unwrap_or_default()
            .to_string();
        let rx = self.pending.register(&request_id, self.config.request_timeout);
        let envelope = Envelope::new(self.local.id, Some(to), payload);
        if let Err(err) = self.sender.send(&to, envelope).await {
            self.pending.cancel(&request_id);
            return Err(DhtError::Send(err));
        }
        match tokio::time::timeout(self.config.request_timeout, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) | Err(_) => {
                self.pending.cancel(&request_id);
                Err(DhtError::Timeout { request_id })
            }
        }
    }

    fn note_failure(&self, peer: &NodeId) {
        let evicted = self.table.write().record_failure(
            peer,
            self.config.peer_failure_threshold,
            self.config.peer_backoff_duration,
        );
        if evicted {
            debug!(peer = %peer.short(), "peer evicted after repeated failures");
        }
    }

    fn touch_peer(&self, peer: &NodeId) {
        let mut table = self.table.write();
        table.touch(peer);
        table.record_activity(peer);
    }

    fn find_node_allowed(&self, peer: &NodeId) -> bool {
        if self.emergency_mode() {
            return true;
        }
        self.find_node_last
            .lock()
            .get(peer)
            .map_or(true, |last| last.elapsed() >= self.config.find_node_min_interval)
    }

    // ---- Kademlia operations ----

    /// Liveness probe; records the round trip on success.
    pub async fn ping(&self, peer: NodeId) -> Result<Duration, DhtError> {
        let request_id = self.pending.next_request_id();
        let started = Instant::now();
        match self.request(peer, Payload::Ping { request_id }).await {
            Ok(Payload::Pong { .. }) => {
                let rtt = started.elapsed();
                if let Some(contact) = self.table.write().get_mut(&peer) {
                    contact.record_rtt(rtt);
                }
                Ok(rtt)
            }
            Ok(other) => Err(DhtError::UnexpectedResponse {
                request_id: other.request_id().unwrap_or_default().to_string(),
            }),
            Err(err) => {
                self.note_failure(&peer);
                Err(err)
            }
        }
    }

    async fn find_node_rpc(
        &self,
        peer: NodeId,
        target: NodeId,
    ) -> Result<Vec<ContactInfo>, DhtError> {
        self.find_node_last.lock().insert(peer, Instant::now());
        let request_id = self.pending.next_request_id();
        match self
            .request(peer, Payload::FindNode { request_id, target })
            .await
        {
            Ok(Payload::FindNodeResponse { nodes, .. }) => Ok(nodes),
            Ok(other) => Err(DhtError::UnexpectedResponse {
                request_id: other.request_id().unwrap_or_default().to_string(),
            }),
            Err(err) => Err(err),
        }
    }

    /// Iterative node lookup: up to `alpha` concurrent queries to the
    /// closest connected, uncontacted candidates until no closer candidate
    /// remains. Returns at most `k` contacts sorted by distance to `target`.
    ///
    /// Disconnected candidates are skipped but stay in the table. A response
    /// listing the queried target itself as a contact is discarded.
    pub async fn iterative_find_node(&self, target: NodeId) -> Vec<ContactInfo> {
        let k = self.config.k;
        let mut shortlist: BTreeMap<Distance, ContactInfo> = self
            .table
            .read()
            .closest(&target, k)
            .into_iter()
            .map(|c| (c.id.distance(&target), c))
            .collect();
        let mut contacted: HashSet<NodeId> = HashSet::new();

        loop {
            let candidates: Vec<ContactInfo> = shortlist
                .values()
                .take(k)
                .filter(|c| !contacted.contains(&c.id))
                .filter(|c| self.sender.is_connected(&c.id))
                .filter(|c| self.find_node_allowed(&c.id))
                .take(self.config.alpha)
                .cloned()
                .collect();
            if candidates.is_empty() {
                break;
            }

            let queries = candidates.iter().map(|c| self.find_node_rpc(c.id, target));
            let results = futures::future::join_all(queries).await;

            for (candidate, result) in candidates.iter().zip(results) {
                contacted.insert(candidate.id);
                match result {
                    Ok(nodes) => {
                        self.touch_peer(&candidate.id);
                        for node in nodes {
                            if node.id == self.local.id || node.id == target {
                                continue;
                            }
                            let distance = node.id.distance(&target);
                            shortlist.entry(distance).or_insert_with(|| {
                                self.observe_contact(node.clone());
                                node
                            });
                        }
                    }
                    Err(err) => {
                        trace!(peer = %candidate.id.short(), %err, "lookup query failed");
                        self.note_failure(&candidate.id);
                    }
                }
            }
        }

        self.table.write().record_activity(&target);
        shortlist.into_values().take(k).collect()
    }

    /// Replicated store: hash the key, find its home set, store locally when
    /// this node belongs there, and push to up to `replicate_k` connected
    /// peers. Succeeds when any replica (local included) accepted the value.
    pub async fn store(&self, key: &str, value: Value) -> Result<bool, DhtError> {
        let key_id = NodeId::from_key(key);
        let closest = self.iterative_find_node(key_id).await;
        let local_distance = self.local.id.distance(&key_id);

        let connected: Vec<&ContactInfo> = closest
            .iter()
            .filter(|c| self.sender.is_connected(&c.id))
            .collect();
        let closer_connected = connected
            .iter()
            .filter(|c| c.id.distance(&key_id) < local_distance)
            .count();
        let local_among_k = closest.len() < self.config.k
            || closest
                .iter()
                .any(|c| c.id.distance(&key_id) > local_distance);

        let mut stored = false;
        if local_among_k || closer_connected < self.config.replicate_k {
            stored = self
                .store
                .lock()
                .put_checked(key, value.clone(), self.local.id);
        }

        let targets: Vec<NodeId> = connected
            .iter()
            .take(self.config.replicate_k)
            .map(|c| c.id)
            .collect();
        let stores = targets.iter().map(|peer| {
            let request_id = self.pending.next_request_id();
            self.request(
                *peer,
                Payload::Store {
                    request_id,
                    key: key.to_string(),
                    value: value.clone(),
                },
            )
        });
        for (peer, result) in targets.iter().zip(futures::future::join_all(stores).await) {
            match result {
                Ok(Payload::StoreResponse { success: true, .. }) => stored = true,
                Ok(_) => {}
                Err(err) => {
                    debug!(peer = %peer.short(), %err, "replica store failed");
                    self.note_failure(peer);
                }
            }
        }

        if stored {
            Ok(true)
        } else {
            Err(DhtError::StoreFailed {
                key: key.to_string(),
            })
        }
    }

    /// Locate a value: local store first, then the key's neighborhood via
    /// `find_value`. Returns `None` when nobody has it.
    pub async fn get(&self, key: &str) -> Result<Option<Value>, DhtError> {
        if let Some(entry) = self.store.lock().get(key) {
            return Ok(Some(entry.value.clone()));
        }

        let key_id = NodeId::from_key(key);
        let contacts = self.iterative_find_node(key_id).await;
        for contact in contacts {
            if !self.sender.is_connected(&contact.id) {
                continue;
            }
            let request_id = self.pending.next_request_id();
            match self
                .request(
                    contact.id,
                    Payload::FindValue {
                        request_id,
                        key: key.to_string(),
                    },
                )
                .await
            {
                Ok(Payload::FindValueResponse {
                    found: true,
                    value: Some(value),
                    ..
                }) => return Ok(Some(value)),
                Ok(_) => continue,
                Err(err) => {
                    trace!(peer = %contact.id.short(), %err, "find_value query failed");
                    self.note_failure(&contact.id);
                }
            }
        }
        Ok(None)
    }

    /// Compare-and-swap on the `version` field of a replicated record.
    /// The local replica decides first when this node is in the home set;
    /// any replica reporting a conflict settles the outcome.
    pub async fn cas(
        &self,
        key: &str,
        expected_version: Option<u64>,
        value: Value,
    ) -> Result<CasOutcome, DhtError> {
        let key_id = NodeId::from_key(key);
        let closest = self.iterative_find_node(key_id).await;
        let local_distance = self.local.id.distance(&key_id);

        let connected: Vec<NodeId> = closest
            .iter()
            .filter(|c| self.sender.is_connected(&c.id))
            .take(self.config.replicate_k)
            .map(|c| c.id)
            .collect();
        let closer_connected = closest
            .iter()
            .filter(|c| self.sender.is_connected(&c.id))
            .filter(|c| c.id.distance(&key_id) < local_distance)
            .count();

        let mut accepted = false;
        if closer_connected < self.config.replicate_k {
            match self
                .store
                .lock()
                .cas(key, expected_version, value.clone(), self.local.id)
            {
                Ok(()) => accepted = true,
                Err(current) => return Ok(CasOutcome::Conflict(current)),
            }
        }

        for peer in connected {
            let request_id = self.pending.next_request_id();
            match self
                .request(
                    peer,
                    Payload::CasStore {
                        request_id,
                        key: key.to_string(),
                        expected_version,
                        value: value.clone(),
                    },
                )
                .await
            {
                Ok(Payload::CasStoreResponse { success: true, .. }) => accepted = true,
                Ok(Payload::CasStoreResponse {
                    success: false,
                    current,
                    ..
                }) => {
                    return Ok(CasOutcome::Conflict(current.unwrap_or(Value::Null)));
                }
                Ok(_) => {}
                Err(err) => {
                    debug!(peer = %peer.short(), %err, "cas replica unreachable");
                    self.note_failure(&peer);
                }
            }
        }

        if accepted {
            Ok(CasOutcome::Accepted)
        } else {
            Err(DhtError::StoreFailed {
                key: key.to_string(),
            })
        }
    }

    // ---- RPC answering side ----

    /// Handle an inbound envelope. Responses resolve their waiter and yield
    /// nothing; requests yield the response payload for the fabric to send
    /// back. Signaling and pub/sub types are not the engine's to answer.
    pub fn handle_envelope(&self, from: NodeId, envelope: &Envelope) -> Option<Payload> {
        self.touch_peer(&from);

        if envelope.payload.is_response() {
            if let Some(request_id) = envelope.payload.request_id() {
                self.pending.resolve(request_id, envelope.payload.clone());
            }
            return None;
        }

        match &envelope.payload {
            Payload::Ping { request_id } => Some(Payload::Pong {
                request_id: request_id.clone(),
            }),
            Payload::FindNode { request_id, target } => {
                let mut nodes = self.table.read().closest(target, self.config.k);
                nodes.retain(|c| c.id != from && c.id != *target);
                self.table.write().record_activity(target);
                Some(Payload::FindNodeResponse {
                    request_id: request_id.clone(),
                    nodes,
                })
            }
            Payload::FindValue { request_id, key } => {
                let local = self.store.lock().get(key).map(|e| e.value.clone());
                match local {
                    Some(value) => Some(Payload::FindValueResponse {
                        request_id: request_id.clone(),
                        found: true,
                        value: Some(value),
                        nodes: None,
                    }),
                    None => {
                        let key_id = NodeId::from_key(key);
                        let mut nodes = self.table.read().closest(&key_id, self.config.k);
                        nodes.retain(|c| c.id != from);
                        Some(Payload::FindValueResponse {
                            request_id: request_id.clone(),
                            found: false,
                            value: None,
                            nodes: Some(nodes),
                        })
                    }
                }
            }
            Payload::Store {
                request_id,
                key,
                value,
            } => {
                let success = self.store.lock().put_checked(key, value.clone(), from);
                Some(Payload::StoreResponse {
                    request_id: request_id.clone(),
                    success,
                })
            }
            Payload::CasStore {
                request_id,
                key,
                expected_version,
                value,
            } => match self
                .store
                .lock()
                .cas(key, *expected_version, value.clone(), from)
            {
                Ok(()) => Some(Payload::CasStoreResponse {
                    request_id: request_id.clone(),
                    success: true,
                    current: None,
                }),
                Err(current) => Some(Payload::CasStoreResponse {
                    request_id: request_id.clone(),
                    success: false,
                    current: Some(current),
                }),
            },
            // Signaling and pub/sub kinds belong to the layers above.
            other => {
                trace!(kind = other.type_name(), "not an engine message");
                None
            }
        }
    }

    // ---- maintenance hooks ----

    /// Pick the refresh cadence from the connectivity regime.
    pub fn current_refresh_interval(&self) -> Duration {
        let connected = self.sender.connected_peers().len();
        let routed = self.table.read().len();
        if connected < 2 || routed < 3 {
            // Scale within the aggressive band as connectivity recovers.
            let scale = 1 + connected.min(7) as u32;
            (self.config.aggressive_refresh_interval * scale)
                .min(Duration::from_secs(120))
        } else if connected < 5 || routed < 8 {
            self.config.refresh_interval * 2
        } else {
            self.config.standard_refresh_interval
        }
    }

    pub(crate) fn sender(&self) -> &Arc<dyn PeerSender> {
        &self.sender
    }

    pub(crate) fn stale_buckets(&self, window: Duration) -> Vec<usize> {
        self.table.read().stale_buckets(window)
    }

    pub(crate) fn random_id_in_bucket(&self, index: usize) -> NodeId {
        self.table.read().random_id_in_bucket(index)
    }

    pub(crate) fn disconnected_contacts(&self, limit: usize) -> Vec<ContactInfo> {
        self.table.read().disconnected_contacts(limit)
    }

    pub(crate) fn purge_temporaries(&self) -> Vec<NodeId> {
        self.table
            .write()
            .purge_temporaries(self.config.temporary_contact_ttl)
    }

    pub(crate) fn due_for_republish(&self) -> Vec<(String, Value)> {
        self.store.lock().due_for_republish()
    }

    pub(crate) fn purge_expired_values(&self) -> Vec<String> {
        self.store.lock().purge_expired()
    }

    /// Contacts not heard from within the ping window.
    pub(crate) fn quiet_contacts(&self, window: Duration) -> Vec<NodeId> {
        let table = self.table.read();
        table
            .all_contacts()
            .into_iter()
            .map(|c| c.id)
            .filter(|id| {
                table
                    .get(id)
                    .map(|c| !c.heard_within(window))
                    .unwrap_or(false)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contact::PeerMetadata;
    use serde_json::json;

    /// Routes envelopes directly between registered engines, loop-back
    /// delivering any synchronous response.
    #[derive(Default)]
    struct LoopbackNet {
        engines: RwLock<HashMap<NodeId, Arc<DhtEngine>>>,
    }

    impl LoopbackNet {
        fn register(&self, engine: Arc<DhtEngine>) {
            self.engines.write().insert(engine.local_id(), engine);
        }
    }

    #[async_trait]
    impl PeerSender for LoopbackNet {
        async fn send(&self, to: &NodeId, envelope: Envelope) -> anyhow::Result<()> {
            let (target, origin) = {
                let engines = self.engines.read();
                (
                    engines.get(to).cloned(),
                    engines.get(&envelope.sender_peer).cloned(),
                )
            };
            let target = target.ok_or_else(|| anyhow::anyhow!("peer not reachable"))?;
            let from = envelope.sender_peer;
            if let Some(response) = target.handle_envelope(from, &envelope) {
                if let Some(origin) = origin {
                    let reply = Envelope::new(*to, Some(from), response);
                    origin.handle_envelope(*to, &reply);
                }
            }
            Ok(())
        }

        async fn connect(&self, _contact: &ContactInfo) -> anyhow::Result<()> {
            Ok(())
        }

        fn is_connected(&self, peer: &NodeId) -> bool {
            self.engines.read().contains_key(peer)
        }

        fn connected_peers(&self) -> Vec<NodeId> {
            self.engines.read().keys().copied().collect()
        }
    }

    fn info(id: NodeId) -> ContactInfo {
        ContactInfo {
            id,
            endpoint: format!("mem://{}", id.short()),
            metadata: PeerMetadata::nodejs(None),
        }
    }

    fn engine(net: &Arc<LoopbackNet>) -> Arc<DhtEngine> {
        let id = NodeId::random();
        let engine = DhtEngine::new(
            info(id),
            DhtConfig::default(),
            net.clone() as Arc<dyn PeerSender>,
        )
        .unwrap();
        net.register(engine.clone());
        engine
    }

    /// A fully meshed loopback cluster with populated routing tables.
    fn cluster(n: usize) -> (Arc<LoopbackNet>, Vec<Arc<DhtEngine>>) {
        let net = Arc::new(LoopbackNet::default());
        let engines: Vec<Arc<DhtEngine>> = (0..n).map(|_| engine(&net)).collect();
        for a in &engines {
            for b in &engines {
                if a.local_id() != b.local_id() {
                    a.on_peer_connected(b.local_info().clone());
                }
            }
        }
        (net, engines)
    }

    #[tokio::test]
    async fn ping_round_trip_records_rtt() {
        let (_net, engines) = cluster(2);
        let rtt = engines[0].ping(engines[1].local_id()).await.unwrap();
        assert!(rtt < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn requests_to_self_are_programming_errors() {
        let (_net, engines) = cluster(1);
        let err = engines[0].ping(engines[0].local_id()).await.unwrap_err();
        assert!(matches!(err, DhtError::SelfRequest));
    }

    #[tokio::test]
    async fn lookup_returns_sorted_contacts_without_local_or_target() {
        let (_net, engines) = cluster(5);
        let target = NodeId::random();
        let found = engines[0].iterative_find_node(target).await;

        assert!(!found.is_empty());
        assert!(found.len() <= engines[0].config().k);
        assert!(found.iter().all(|c| c.id != engines[0].local_id()));
        assert!(found.iter().all(|c| c.id != target));
        for pair in found.windows(2) {
            assert!(pair[0].id.distance(&target) < pair[1].id.distance(&target));
        }
    }

    #[tokio::test]
    async fn store_then_get_from_another_peer() {
        let (_net, engines) = cluster(4);

        assert!(engines[0].store("hello", json!("world")).await.unwrap());
        let fetched = engines[2].get("hello").await.unwrap();
        assert_eq!(fetched, Some(json!("world")));

        let absent = engines[3].get("no-such-key").await.unwrap();
        assert_eq!(absent, None);
    }

    #[tokio::test]
    async fn cas_conflict_returns_the_winner() {
        let (_net, engines) = cluster(3);
        let record_v1 = json!({"nodeID": engines[0].local_id(), "version": 1});

        let outcome = engines[0]
            .cas("coordinator:chat", None, record_v1.clone())
            .await
            .unwrap();
        assert_eq!(outcome, CasOutcome::Accepted);

        // A second claim with the same stale expectation loses.
        let rival = json!({"nodeID": engines[1].local_id(), "version": 1});
        let outcome = engines[1].cas("coordinator:chat", None, rival).await.unwrap();
        match outcome {
            CasOutcome::Conflict(current) => assert_eq!(current["version"], 1),
            other => panic!("expected conflict, got {other:?}"),
        }

        // Correct expectation advances the record.
        let next = json!({"nodeID": engines[1].local_id(), "version": 2});
        let outcome = engines[1]
            .cas("coordinator:chat", Some(1), next)
            .await
            .unwrap();
        assert_eq!(outcome, CasOutcome::Accepted);
    }

    #[tokio::test]
    async fn find_node_handler_never_returns_requester_or_target() {
        let (_net, engines) = cluster(4);
        let asker = engines[1].local_id();
        let target = engines[2].local_id();

        let request = Envelope::new(
            asker,
            Some(engines[0].local_id()),
            Payload::FindNode {
                request_id: "x_1".to_string(),
                target,
            },
        );
        let response = engines[0].handle_envelope(asker, &request).unwrap();
        let Payload::FindNodeResponse { nodes, .. } = response else {
            panic!("wrong response type");
        };
        assert!(nodes.iter().all(|c| c.id != asker && c.id != target));
    }

    #[tokio::test]
    async fn unanswered_requests_time_out() {
        let net = Arc::new(LoopbackNet::default());
        let lonely = engine(&net);
        let ghost = NodeId::random();

        // Nothing registered under the ghost id: the send itself fails.
        let err = lonely.ping(ghost).await.unwrap_err();
        assert!(matches!(err, DhtError::Send(_)));
    }
}
