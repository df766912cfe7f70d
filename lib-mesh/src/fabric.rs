//! Connection manager
//!
//! One surface for "send a message to a peer": owns every live link, keyed
//! by peer id, with an ordered inbox and a single drain task per peer.
//! Inbound frames are parsed here; Kademlia RPC is answered by the engine,
//! routed signaling is forwarded greedily toward its target with duplicate
//! suppression, reverse-dial coordination is handled in place, and pub/sub
//! traffic is surfaced as events for the layer above.

use crate::dedup::DedupCache;
use crate::error::MeshError;
use crate::inbox::PeerInbox;
use crate::matrix::{choose_transport, TransportChoice};
use crate::transport::{ws, TransportLink};
use crate::MeshConfig;
use async_trait::async_trait;
use lib_crypto::NodeId;
use lib_dht::{ContactInfo, DhtEngine, Envelope, Payload, PeerMetadata, PeerSender};
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

/// Connection lifecycle and application traffic, surfaced upward.
#[derive(Debug)]
pub enum FabricEvent {
    PeerConnected(ContactInfo),
    PeerDisconnected(NodeId),
    /// A message for the layers above the engine (pub/sub and the node
    /// facade), already deduplicated and addressed to this node.
    Message { from: NodeId, envelope: Envelope },
}

struct PeerLink {
    info: ContactInfo,
    tx: mpsc::Sender<String>,
    inbox: Arc<PeerInbox>,
    serial: u64,
    /// Dropping this stops the drain task.
    _guard: mpsc::Sender<()>,
}

/// Fabric counters for the stats surface.
#[derive(Debug, Default)]
pub struct FabricCounters {
    pub forwarded: AtomicU64,
    pub duplicates_dropped: AtomicU64,
    pub malformed_dropped: AtomicU64,
}

pub struct ConnectionFabric {
    local: ContactInfo,
    config: MeshConfig,
    self_ref: Weak<ConnectionFabric>,
    engine: OnceLock<Arc<DhtEngine>>,
    peers: RwLock<HashMap<NodeId, PeerLink>>,
    /// Reverse-dial requests in flight, to throttle duplicates.
    pending_dials: Mutex<HashMap<NodeId, Instant>>,
    /// Contact details learned before an inbound link identifies itself.
    expected_inbound: Mutex<HashMap<NodeId, ContactInfo>>,
    dedup: DedupCache,
    events_tx: mpsc::Sender<FabricEvent>,
    link_serial: AtomicU64,
    pub counters: FabricCounters,
}

impl ConnectionFabric {
    pub fn new(local: ContactInfo, config: MeshConfig) -> (Arc<Self>, mpsc::Receiver<FabricEvent>) {
        let (events_tx, events_rx) = mpsc::channel(256);
        let dedup = DedupCache::new(config.message_deduplication_timeout);
        (
            Arc::new_cyclic(|self_ref| ConnectionFabric {
                local,
                config,
                self_ref: self_ref.clone(),
                engine: OnceLock::new(),
                peers: RwLock::new(HashMap::new()),
                pending_dials: Mutex::new(HashMap::new()),
                expected_inbound: Mutex::new(HashMap::new()),
                dedup,
                events_tx,
                link_serial: AtomicU64::new(0),
                counters: FabricCounters::default(),
            }),
            events_rx,
        )
    }

    /// Wire in the engine after construction (the engine needs the fabric
    /// as its sender, so the two meet here).
    pub fn set_engine(&self, engine: Arc<DhtEngine>) {
        let _ = self.engine.set(engine);
    }

    fn engine(&self) -> Option<&Arc<DhtEngine>> {
        self.engine.get()
    }

    pub fn local_info(&self) -> &ContactInfo {
        &self.local
    }

    pub fn connection_count(&self) -> usize {
        self.peers.read().len()
    }

    pub fn connected_contacts(&self) -> Vec<ContactInfo> {
        self.peers.read().values().map(|l| l.info.clone()).collect()
    }

    /// Adopt a live link. `expected` carries the remote's identity when the
    /// local side initiated; inbound links identify themselves with their
    /// first envelope.
    pub fn attach(self: &Arc<Self>, link: TransportLink, expected: Option<ContactInfo>) {
        let TransportLink {
            tx, mut rx, remote_addr, ..
        } = link;
        let serial = self.link_serial.fetch_add(1, Ordering::Relaxed);

        let fabric = self.clone();
        tokio::spawn(async move {
            // The registered link owns the only outbound sender; once it is
            // handed over, dropping the link closes the connection.
            let mut tx_slot = Some(tx);
            let mut peer: Option<NodeId> = None;
            if let Some(info) = expected {
                peer = Some(info.id);
                if let Some(tx) = tx_slot.take() {
                    fabric.register_peer(info, tx, serial).await;
                }
            }

            while let Some(frame) = rx.recv().await {
                if frame.len() > fabric.config.max_message_bytes {
                    warn!(
                        remote = %remote_addr,
                        size = frame.len(),
                        "oversized frame dropped"
                    );
                    fabric.counters.malformed_dropped.fetch_add(1, Ordering::Relaxed);
                    continue;
                }
                let envelope = match fabric.parse_frame(&frame, &remote_addr) {
                    Some(envelope) => envelope,
                    None => continue,
                };

                let sender = envelope.sender_peer;
                if sender == fabric.local.id {
                    warn!(remote = %remote_addr, "frame claiming our own identity dropped");
                    continue;
                }
                if peer.is_none() {
                    // First envelope identifies an inbound link.
                    let info = fabric
                        .expected_inbound
                        .lock()
                        .remove(&sender)
                        .unwrap_or_else(|| ContactInfo {
                            id: sender,
                            endpoint: remote_addr.clone(),
                            metadata: PeerMetadata::nodejs(None),
                        });
                    peer = Some(sender);
                    if let Some(tx) = tx_slot.take() {
                        fabric.register_peer(info, tx, serial).await;
                    }
                }

                if let Some(id) = peer {
                    let inbox = fabric.peers.read().get(&id).map(|l| l.inbox.clone());
                    if let Some(inbox) = inbox {
                        inbox.push(envelope);
                    }
                }
            }

            if let Some(id) = peer {
                fabric.unregister_peer(&id, serial).await;
            }
        });
    }

    fn parse_frame(&self, frame: &str, remote_addr: &str) -> Option<Envelope> {
        match serde_json::from_str::<Envelope>(frame) {
            Ok(envelope) => Some(envelope),
            Err(err) => {
                self.counters.malformed_dropped.fetch_add(1, Ordering::Relaxed);
                // Unknown types are ignored for forward compatibility;
                // actual garbage is a transport-level concern.
                match serde_json::from_str::<Value>(frame) {
                    Ok(value) => {
                        let kind = value
                            .get("type")
                            .and_then(Value::as_str)
                            .unwrap_or("<untyped>");
                        debug!(remote = %remote_addr, kind, "ignoring unrecognized message type");
                    }
                    Err(_) => warn!(remote = %remote_addr, %err, "malformed frame dropped"),
                }
                None
            }
        }
    }

    async fn register_peer(self: &Arc<Self>, info: ContactInfo, tx: mpsc::Sender<String>, serial: u64) {
        let inbox = Arc::new(PeerInbox::new(
            self.config.message_timeout,
            self.config.max_queue_size,
        ));
        let (guard_tx, mut guard_rx) = mpsc::channel::<()>(1);
        let id = info.id;

        let link = PeerLink {
            info: info.clone(),
            tx,
            inbox: inbox.clone(),
            serial,
            _guard: guard_tx,
        };
        self.peers.write().insert(id, link);
        self.pending_dials.lock().remove(&id);

        if let Some(engine) = self.engine() {
            engine.on_peer_connected(info.clone());
        }
        let _ = self
            .events_tx
            .send(FabricEvent::PeerConnected(info.clone()))
            .await;
        info!(peer = %id.short(), "peer connected");

        // One drain task per peer keeps delivery strictly ordered.
        let fabric = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    envelope = inbox.pop() => fabric.dispatch(id, envelope).await,
                    _ = guard_rx.recv() => break,
                }
            }
            trace!(peer = %id.short(), "drain task stopped");
        });

        // Greet with a discovery request; the response seeds routing tables
        // on both sides.
        if let Some(engine) = self.engine() {
            let request_id = engine.next_request_id();
            let hello = Envelope::new(
                self.local.id,
                Some(id),
                Payload::PeerDiscoveryRequest {
                    request_id,
                    count: engine.config().k,
                },
            );
            let _ = self.send_frame(&id, &hello).await;
        }
    }

    async fn unregister_peer(&self, id: &NodeId, serial: u64) {
        let removed = {
            let mut peers = self.peers.write();
            match peers.get(id) {
                // A newer link owns this peer now; leave it alone.
                Some(link) if link.serial != serial => false,
                Some(_) => {
                    peers.remove(id);
                    true
                }
                None => false,
            }
        };
        if removed {
            if let Some(engine) = self.engine() {
                engine.on_peer_disconnected(id);
            }
            let _ = self.events_tx.send(FabricEvent::PeerDisconnected(*id)).await;
            info!(peer = %id.short(), "peer disconnected");
        }
    }

    async fn send_frame(&self, to: &NodeId, envelope: &Envelope) -> Result<(), MeshError> {
        let text = serde_json::to_string(envelope)
            .map_err(|err| MeshError::MalformedJson(err.to_string()))?;
        if text.len() > self.config.max_message_bytes {
            return Err(MeshError::MessageTooLarge {
                size: text.len(),
                limit: self.config.max_message_bytes,
            });
        }
        let tx = self
            .peers
            .read()
            .get(to)
            .map(|link| link.tx.clone())
            .ok_or(MeshError::NotConnected(*to))?;
        tx.send(text)
            .await
            .map_err(|_| MeshError::PeerDisconnected(*to))
    }

    /// Deliver an envelope: direct when the target is connected, greedy
    /// overlay forwarding for routable traffic otherwise.
    pub async fn send_routed(&self, envelope: Envelope) -> Result<(), MeshError> {
        let Some(target) = envelope.target_peer else {
            return Err(MeshError::Transport("routed send without a target".to_string()));
        };
        if self.peers.read().contains_key(&target) {
            return self.send_frame(&target, &envelope).await;
        }
        if envelope.payload.is_routable() {
            let local_id = self.local.id;
            return self.forward(envelope, &local_id).await;
        }
        Err(MeshError::NotConnected(target))
    }

    async fn forward(&self, envelope: Envelope, came_from: &NodeId) -> Result<(), MeshError> {
        let Some(engine) = self.engine() else {
            return Err(MeshError::Transport("no engine attached".to_string()));
        };
        let Some(target) = envelope.target_peer else {
            return Err(MeshError::Transport("forward without a target".to_string()));
        };
        let exclude = [*came_from, envelope.sender_peer, self.local.id];
        match engine.closest_connected(&target, &exclude) {
            Some(next_hop) => {
                self.counters.forwarded.fetch_add(1, Ordering::Relaxed);
                trace!(
                    target = %target.short(),
                    via = %next_hop.short(),
                    kind = envelope.payload.type_name(),
                    "forwarding signaling message"
                );
                self.send_frame(&next_hop, &envelope).await
            }
            None => {
                debug!(target = %target.short(), "no route for signaling message");
                Err(MeshError::NoRoute(target))
            }
        }
    }

    async fn dispatch(self: &Arc<Self>, from: NodeId, envelope: Envelope) {
        // Routed message for someone else: forward and stop.
        if let Some(target) = envelope.target_peer {
            if target != self.local.id {
                if envelope.payload.is_routable() {
                    if !self.dedup.observe(&envelope) {
                        self.counters.duplicates_dropped.fetch_add(1, Ordering::Relaxed);
                        return;
                    }
                    let _ = self.forward(envelope, &from).await;
                } else {
                    trace!(kind = envelope.payload.type_name(), "unroutable stray dropped");
                }
                return;
            }
        }

        // Direct and forwarded copies of the same message both land here.
        if envelope.payload.is_routable() && !self.dedup.observe(&envelope) {
            self.counters.duplicates_dropped.fetch_add(1, Ordering::Relaxed);
            return;
        }

        let Some(engine) = self.engine().cloned() else {
            return;
        };

        // A relayed sender we cannot route back to yet gets a temporary
        // table entry so the reply has somewhere to go.
        if envelope.payload.is_routable() && envelope.sender_peer != from {
            engine.observe_temporary_contact(ContactInfo {
                id: envelope.sender_peer,
                endpoint: String::new(),
                metadata: PeerMetadata::nodejs(None),
            });
        }

        if let Some(response) = engine.handle_envelope(from, &envelope) {
            let reply = Envelope::new(self.local.id, Some(envelope.sender_peer), response);
            if let Err(err) = self.send_routed(reply).await {
                debug!(%err, "failed to answer rpc");
            }
            return;
        }

        match &envelope.payload {
            Payload::PeerDiscoveryRequest { request_id, count } => {
                let mut peers = engine
                    .known_contacts()
                    .into_iter()
                    .filter(|c| c.id != envelope.sender_peer)
                    .collect::<Vec<_>>();
                peers.truncate(*count);
                let reply = Envelope::new(
                    self.local.id,
                    Some(envelope.sender_peer),
                    Payload::PeerDiscoveryResponse {
                        request_id: request_id.clone(),
                        peers,
                    },
                );
                let _ = self.send_routed(reply).await;
            }
            Payload::PeerDiscoveryResponse { peers, .. } => {
                for contact in peers {
                    engine.observe_contact(contact.clone());
                }
            }
            Payload::WebsocketConnectionRequest {
                listening_address, ..
            } => {
                self.handle_reverse_dial_request(&envelope, listening_address.clone())
                    .await;
            }
            Payload::WebsocketConnectionResponse { success, error, .. } => {
                self.pending_dials.lock().remove(&envelope.sender_peer);
                if !success {
                    debug!(
                        peer = %envelope.sender_peer.short(),
                        error = error.as_deref().unwrap_or("unspecified"),
                        "reverse dial refused"
                    );
                }
            }
            Payload::WebrtcOffer { .. } | Payload::WebrtcAnswer { .. } | Payload::WebrtcIce { .. } => {
                // Browser pairs negotiate through us, never with us.
                warn!(
                    peer = %envelope.sender_peer.short(),
                    kind = envelope.payload.type_name(),
                    "webrtc signal addressed to a server node dropped"
                );
            }
            Payload::Publish { .. }
            | Payload::Subscribe { .. }
            | Payload::CoordinatorClaim { .. }
            | Payload::HeadUpdate { .. } => {
                let _ = self
                    .events_tx
                    .send(FabricEvent::Message { from, envelope })
                    .await;
            }
            // Responses were resolved by the engine's correlator.
            _ => {}
        }
    }

    /// Someone asked us to dial their listener.
    async fn handle_reverse_dial_request(
        self: &Arc<Self>,
        envelope: &Envelope,
        listening_address: Option<String>,
    ) {
        let requester = envelope.sender_peer;
        let (node_type, capabilities, can_relay) = match &envelope.payload {
            Payload::WebsocketConnectionRequest {
                node_type,
                capabilities,
                can_relay,
                ..
            } => (*node_type, capabilities.clone(), *can_relay),
            _ => return,
        };

        let result = match listening_address.as_deref() {
            Some(address) => ws::connect(address).await.map(|link| {
                let info = ContactInfo {
                    id: requester,
                    endpoint: address.to_string(),
                    metadata: PeerMetadata {
                        node_type,
                        listening_address: listening_address.clone(),
                        capabilities,
                        can_relay,
                    },
                };
                self.attach(link, Some(info));
            }),
            None => Err(MeshError::Transport(
                "reverse dial request without a listening address".to_string(),
            )),
        };

        let (success, error) = match &result {
            Ok(()) => (true, None),
            Err(err) => {
                debug!(peer = %requester.short(), %err, "reverse dial failed");
                (false, Some(err.to_string()))
            }
        };
        let response = Envelope::new(
            self.local.id,
            Some(requester),
            Payload::WebsocketConnectionResponse {
                success,
                error,
                node_type: self.local.metadata.node_type,
                capabilities: self.local.metadata.capabilities.clone(),
                listening_address: self.local.metadata.listening_address.clone(),
            },
        );
        let _ = self.send_routed(response).await;
    }

    /// Inject a signaling envelope that arrived out-of-band, e.g. relayed
    /// by the bootstrap before any mesh link exists.
    pub async fn inject_signal(self: &Arc<Self>, envelope: Envelope) {
        let from = envelope.sender_peer;
        self.dispatch(from, envelope).await;
    }

    /// Open a connection toward a known contact, following the transport
    /// matrix. Reverse-dial requests are throttled per target.
    pub async fn connect_to(self: &Arc<Self>, contact: &ContactInfo) -> Result<(), MeshError> {
        if contact.id == self.local.id {
            return Ok(());
        }
        if self.peers.read().contains_key(&contact.id) {
            return Ok(());
        }

        match choose_transport(
            self.local.metadata.node_type,
            &self.local.id,
            contact.metadata.node_type,
            &contact.id,
        ) {
            TransportChoice::WsDial => {
                let address = contact
                    .metadata
                    .listening_address
                    .clone()
                    .unwrap_or_else(|| contact.endpoint.clone());
                if address.is_empty() {
                    return Err(MeshError::Transport(format!(
                        "no listening address known for {}",
                        contact.id.short()
                    )));
                }
                let link = ws::connect(&address).await?;
                self.attach(link, Some(contact.clone()));
                Ok(())
            }
            TransportChoice::WsAwaitDial => self.request_reverse_dial(contact).await,
            TransportChoice::WebRtc { .. } => Err(MeshError::Transport(
                "webrtc pairs are browser-to-browser; server nodes only relay their signaling"
                    .to_string(),
            )),
        }
    }

    async fn request_reverse_dial(self: &Arc<Self>, contact: &ContactInfo) -> Result<(), MeshError> {
        {
            let mut pending = self.pending_dials.lock();
            let now = Instant::now();
            pending.retain(|_, at| now.duration_since(*at) < self.config.pending_dial_timeout);
            if pending.contains_key(&contact.id) {
                trace!(peer = %contact.id.short(), "reverse dial already pending");
                return Ok(());
            }
            pending.insert(contact.id, now);
        }
        self.expected_inbound
            .lock()
            .insert(contact.id, contact.clone());

        let request = Envelope::new(
            self.local.id,
            Some(contact.id),
            Payload::WebsocketConnectionRequest {
                node_type: self.local.metadata.node_type,
                listening_address: self.local.metadata.listening_address.clone(),
                capabilities: self.local.metadata.capabilities.clone(),
                can_relay: self.local.metadata.can_relay,
            },
        );
        self.send_routed(request).await
    }

    /// Drop every link. Pump and drain tasks unwind as their channels close.
    pub async fn close_all(&self) {
        let ids: Vec<NodeId> = {
            let mut peers = self.peers.write();
            let ids = peers.keys().copied().collect();
            peers.clear();
            ids
        };
        for id in ids {
            if let Some(engine) = self.engine() {
                engine.on_peer_disconnected(&id);
            }
            let _ = self.events_tx.send(FabricEvent::PeerDisconnected(id)).await;
        }
    }
}

#[async_trait]
impl PeerSender for ConnectionFabric {
    async fn send(&self, to: &NodeId, envelope: Envelope) -> anyhow::Result<()> {
        if envelope.target_peer.is_some() {
            self.send_routed(envelope).await.map_err(Into::into)
        } else {
            self.send_frame(to, &envelope).await.map_err(Into::into)
        }
    }

    async fn connect(&self, contact: &ContactInfo) -> anyhow::Result<()> {
        let this = self
            .self_ref
            .upgrade()
            .ok_or_else(|| anyhow::anyhow!("fabric is shutting down"))?;
        this.connect_to(contact).await.map_err(Into::into)
    }

    fn is_connected(&self, peer: &NodeId) -> bool {
        self.peers.read().contains_key(peer)
    }

    fn connected_peers(&self) -> Vec<NodeId> {
        self.peers.read().keys().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::memory_pair;
    use lib_dht::DhtConfig;
    use serde_json::json;
    use std::time::Duration;

    struct TestNode {
        fabric: Arc<ConnectionFabric>,
        engine: Arc<DhtEngine>,
        events: mpsc::Receiver<FabricEvent>,
    }

    fn node(name: &str) -> TestNode {
        let local = ContactInfo {
            id: NodeId::random(),
            endpoint: format!("mem://{name}"),
            metadata: PeerMetadata::nodejs(None),
        };
        let (fabric, events) = ConnectionFabric::new(local.clone(), MeshConfig::default());
        let engine = DhtEngine::new(
            local,
            DhtConfig::default(),
            fabric.clone() as Arc<dyn PeerSender>,
        )
        .unwrap();
        fabric.set_engine(engine.clone());
        TestNode {
            fabric,
            engine,
            events,
        }
    }

    fn wire(a: &TestNode, b: &TestNode) {
        let (link_a, link_b) = memory_pair(
            &a.fabric.local_info().endpoint,
            &b.fabric.local_info().endpoint,
        );
        a.fabric.attach(link_a, Some(b.fabric.local_info().clone()));
        b.fabric.attach(link_b, Some(a.fabric.local_info().clone()));
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    #[tokio::test]
    async fn wired_peers_see_each_other() {
        let mut a = node("a");
        let b = node("b");
        wire(&a, &b);
        settle().await;

        assert!(a.fabric.is_connected(&b.engine.local_id()));
        assert!(b.fabric.is_connected(&a.engine.local_id()));
        assert!(matches!(
            a.events.recv().await.unwrap(),
            FabricEvent::PeerConnected(_)
        ));
    }

    #[tokio::test]
    async fn engine_rpc_travels_the_fabric() {
        let a = node("a");
        let b = node("b");
        wire(&a, &b);
        settle().await;

        let rtt = a.engine.ping(b.engine.local_id()).await.unwrap();
        assert!(rtt < Duration::from_secs(1));

        assert!(a.engine.store("hello", json!("world")).await.unwrap());
        let got = b.engine.get("hello").await.unwrap();
        assert_eq!(got, Some(json!("world")));
    }

    #[tokio::test]
    async fn discovery_hello_seeds_routing_tables() {
        let a = node("a");
        let b = node("b");
        let c = node("c");
        wire(&a, &b);
        wire(&b, &c);
        settle().await;

        // B knows both ends; the hello exchange teaches A about C.
        let known: Vec<NodeId> = a
            .engine
            .known_contacts()
            .into_iter()
            .map(|i| i.id)
            .collect();
        assert!(known.contains(&b.engine.local_id()));
        assert!(known.contains(&c.engine.local_id()));
    }

    #[tokio::test]
    async fn signaling_forwards_toward_its_target() {
        let a = node("a");
        let b = node("b");
        let c = node("c");
        wire(&a, &b);
        wire(&b, &c);
        settle().await;

        // A requests discovery from C with no direct link; B relays both
        // directions.
        let request = Envelope::new(
            a.engine.local_id(),
            Some(c.engine.local_id()),
            Payload::PeerDiscoveryRequest {
                request_id: a.engine.next_request_id(),
                count: 8,
            },
        );
        a.fabric.send_routed(request).await.unwrap();
        settle().await;

        assert!(a.fabric.counters.forwarded.load(Ordering::Relaxed) >= 1);
        assert!(b.fabric.counters.forwarded.load(Ordering::Relaxed) >= 1);
        // C learned of A through the relayed request.
        let c_known: Vec<NodeId> = c
            .engine
            .known_contacts()
            .into_iter()
            .map(|i| i.id)
            .collect();
        assert!(c_known.contains(&a.engine.local_id()));
    }

    #[tokio::test]
    async fn duplicate_signals_are_absorbed() {
        let b = node("b");
        let ghost = NodeId::random();

        let (outside, inside) = memory_pair("mem://ghost", &b.fabric.local_info().endpoint);
        b.fabric.attach(
            inside,
            Some(ContactInfo {
                id: ghost,
                endpoint: "mem://ghost".to_string(),
                metadata: PeerMetadata::browser(),
            }),
        );
        settle().await;

        let mut envelope = Envelope::new(
            ghost,
            Some(b.engine.local_id()),
            Payload::WebrtcOffer {
                sdp: "v=0".to_string(),
            },
        );
        envelope.timestamp = 1_700_000_000_000;
        let frame = serde_json::to_string(&envelope).unwrap();

        outside.tx.send(frame.clone()).await.unwrap();
        outside.tx.send(frame).await.unwrap();
        settle().await;

        assert_eq!(
            b.fabric.counters.duplicates_dropped.load(Ordering::Relaxed),
            1
        );
    }

    #[tokio::test]
    async fn disconnect_surfaces_an_event() {
        let a = node("a");
        let mut b = node("b");
        wire(&a, &b);
        settle().await;

        // Consume the connect event first.
        assert!(matches!(
            b.events.recv().await.unwrap(),
            FabricEvent::PeerConnected(_)
        ));

        a.fabric.close_all().await;
        settle().await;

        assert!(!a.fabric.is_connected(&b.engine.local_id()));
        let event = tokio::time::timeout(Duration::from_secs(1), b.events.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(event, FabricEvent::PeerDisconnected(_)));
    }
}

