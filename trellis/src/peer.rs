//! Peer orchestrator
//!
//! Ties the stack together: identity and membership, the Kademlia engine,
//! the connection fabric with its WebSocket listener, the pub/sub layer,
//! and the bootstrap session. Start-up follows the join ladder: register,
//! genesis designation or invitation, first mesh link, then independence
//! from the bootstrap after a grace period.

use crate::config::NodeConfig;
use anyhow::{Context, Result};
use async_trait::async_trait;
use lib_crypto::{IdentityKeyPair, NodeId};
use lib_dht::{
    spawn_maintenance, ContactInfo, DhtEngine, Envelope, Payload, PeerMetadata, PeerSender,
};
use lib_identity::{IdentityService, InvitationToken, MembershipToken, TrustStore};
use lib_mesh::{
    version::new_build_id, BootstrapClient, BootstrapEvent, BootstrapPeer, ConnectionFabric,
    FabricEvent, RegisterMetadata, TransportLink, PROTOCOL_VERSION,
};
use lib_pubsub::{JoinOptions, JoinProgress, PubSub, TopicMessage};
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Invitation lifetime.
const INVITATION_TTL_MS: u64 = 5 * 60 * 1000;

/// How many bootstrap-announced peers to approach at once.
const BOOTSTRAP_CONNECT_FANOUT: usize = 5;

/// The engine as a trust store for tokens and published keys.
struct DhtTrust(Arc<DhtEngine>);

#[async_trait]
impl TrustStore for DhtTrust {
    async fn get(&self, key: &str) -> Result<Option<Value>> {
        self.0.get(key).await.map_err(Into::into)
    }

    async fn put(&self, key: &str, value: Value) -> Result<bool> {
        self.0.store(key, value).await.map_err(Into::into)
    }
}

pub struct Peer {
    identity: Arc<IdentityService>,
    engine: Arc<DhtEngine>,
    fabric: Arc<ConnectionFabric>,
    pubsub: Arc<PubSub>,
    bootstrap: RwLock<Option<Arc<BootstrapClient>>>,
    pending_invitation: Mutex<Option<InvitationToken>>,
    store_path: Option<PathBuf>,
    bootstrap_grace: Duration,
    independent: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Peer {
    /// Bring the node up: identity, listener, engine, maintenance, and the
    /// bootstrap session when one is configured.
    pub async fn start(config: NodeConfig) -> Result<Arc<Peer>> {
        config.validate()?;
        let (node_id, keys) = load_or_create_identity(config.node.identity_path.as_deref())?;
        let identity = Arc::new(IdentityService::new(node_id, keys, PROTOCOL_VERSION));
        info!(node = %node_id.short(), "starting peer");

        // Bind the listener first so the advertised address is real.
        let mut listener = None;
        let mut advertise = config.node.advertise_addr.clone();
        if let Some(listen_addr) = &config.node.listen_addr {
            let bound = lib_mesh::transport::ws::bind(listen_addr)
                .await
                .with_context(|| format!("binding listener on {listen_addr}"))?;
            if advertise.is_none() {
                let local = bound.local_addr()?;
                advertise = Some(format!("ws://{local}"));
            }
            listener = Some(bound);
        }

        let local = ContactInfo {
            id: node_id,
            endpoint: advertise.clone().unwrap_or_default(),
            metadata: PeerMetadata::nodejs(advertise),
        };
        let mesh_config = config.mesh.to_config();
        let bootstrap_grace = mesh_config.bootstrap_grace;
        let (fabric, fabric_events) = ConnectionFabric::new(local.clone(), mesh_config);
        let engine = DhtEngine::new(
            local,
            config.dht.to_config(),
            fabric.clone() as Arc<dyn lib_dht::PeerSender>,
        )?;
        fabric.set_engine(engine.clone());
        let pubsub = PubSub::new(engine.clone(), identity.clone(), config.pubsub.to_config());

        if let Some(path) = &config.node.store_path {
            engine.store_load(path)?;
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let peer = Arc::new(Peer {
            identity,
            engine: engine.clone(),
            fabric: fabric.clone(),
            pubsub,
            bootstrap: RwLock::new(None),
            pending_invitation: Mutex::new(None),
            store_path: config.node.store_path.clone(),
            bootstrap_grace,
            independent: AtomicBool::new(false),
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
        });

        if let Some(listener) = listener {
            let (links_tx, links_rx) = mpsc::channel::<TransportLink>(16);
            peer.spawn(tokio::spawn(lib_mesh::transport::ws::serve(
                listener, links_tx,
            )));
            peer.spawn(tokio::spawn(accept_links(fabric.clone(), links_rx)));
        }

        for handle in spawn_maintenance(engine, shutdown_rx.clone()) {
            peer.spawn(handle);
        }
        peer.spawn(tokio::spawn(run_fabric_events(
            peer.clone(),
            fabric_events,
            shutdown_rx.clone(),
        )));

        if let Some(url) = &config.node.bootstrap_url {
            peer.connect_bootstrap(url, shutdown_rx).await?;
        }
        Ok(peer)
    }

    fn spawn(&self, handle: JoinHandle<()>) {
        self.tasks.lock().push(handle);
    }

    fn trust(&self) -> DhtTrust {
        DhtTrust(self.engine.clone())
    }

    // ---- bootstrap session ----

    async fn connect_bootstrap(
        self: &Arc<Self>,
        url: &str,
        shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        let (client, events) = BootstrapClient::connect(url)
            .await
            .with_context(|| format!("connecting bootstrap {url}"))?;
        let client = Arc::new(client);

        let metadata = RegisterMetadata {
            node_type: self.fabric.local_info().metadata.node_type,
            listening_address: self.fabric.local_info().metadata.listening_address.clone(),
            capabilities: self.fabric.local_info().metadata.capabilities.clone(),
            can_accept_connections: self.fabric.local_info().metadata.listening_address.is_some(),
            can_initiate_connections: true,
        };
        client
            .register(
                self.identity.node_id(),
                self.identity.public_key().to_hex(),
                PROTOCOL_VERSION.to_string(),
                new_build_id(),
                metadata,
            )
            .await?;

        *self.bootstrap.write() = Some(client);
        self.spawn(tokio::spawn(run_bootstrap_events(
            self.clone(),
            events,
            shutdown,
        )));
        Ok(())
    }

    fn bootstrap_client(&self) -> Option<Arc<BootstrapClient>> {
        self.bootstrap.read().clone()
    }

    async fn on_bootstrap_event(self: &Arc<Self>, event: BootstrapEvent) {
        match event {
            BootstrapEvent::Registered { build_id } => {
                debug!(%build_id, "registered with bootstrap");
                if let Some(client) = self.bootstrap_client() {
                    let _ = client.request_peers(self.engine.config().k).await;
                }
            }
            BootstrapEvent::GenesisDesignation => {
                if let Err(err) = self.become_genesis().await {
                    error!(%err, "genesis designation could not be honored");
                }
            }
            BootstrapEvent::PeerList(peers) => {
                for peer in peers.into_iter().take(BOOTSTRAP_CONNECT_FANOUT) {
                    self.approach_bootstrap_peer(peer).await;
                }
            }
            BootstrapEvent::Signal { from_peer, signal } => {
                match serde_json::from_value::<Envelope>(signal) {
                    Ok(envelope) => self.fabric.inject_signal(envelope).await,
                    Err(err) => {
                        warn!(from = %from_peer.short(), %err, "undecodable relayed signal")
                    }
                }
            }
            BootstrapEvent::InvitationReceived {
                from_peer,
                invitation_token,
                websocket_coordination,
            } => {
                self.on_invitation(from_peer, invitation_token, websocket_coordination)
                    .await;
            }
            BootstrapEvent::PeerAvailable(peer) => {
                debug!(peer = %peer.short(), "peer available at bootstrap");
            }
            BootstrapEvent::VersionMismatch {
                server_version,
                message,
            } => {
                error!(
                    %server_version,
                    %message,
                    "protocol version rejected; refresh required"
                );
                *self.bootstrap.write() = None;
            }
            BootstrapEvent::Closed => {
                debug!("bootstrap session closed");
                *self.bootstrap.write() = None;
            }
        }
    }

    /// Try to reach a peer the bootstrap told us about: direct dial when
    /// the matrix allows, otherwise ship the reverse-dial request through
    /// the bootstrap's signal relay.
    async fn approach_bootstrap_peer(self: &Arc<Self>, peer: BootstrapPeer) {
        if peer.node_id == self.identity.node_id() {
            return;
        }
        let contact = ContactInfo {
            id: peer.node_id,
            endpoint: peer
                .metadata
                .listening_address
                .clone()
                .unwrap_or_default(),
            metadata: peer.metadata,
        };
        self.engine.observe_contact(contact.clone());

        if let Err(err) = self.fabric.connect_to(&contact).await {
            debug!(peer = %contact.id.short(), %err, "direct approach failed, using bootstrap relay");
            let request = Envelope::new(
                self.identity.node_id(),
                Some(contact.id),
                Payload::WebsocketConnectionRequest {
                    node_type: self.fabric.local_info().metadata.node_type,
                    listening_address: self
                        .fabric
                        .local_info()
                        .metadata
                        .listening_address
                        .clone(),
                    capabilities: self.fabric.local_info().metadata.capabilities.clone(),
                    can_relay: self.fabric.local_info().metadata.can_relay,
                },
            );
            if let (Some(client), Ok(signal)) =
                (self.bootstrap_client(), serde_json::to_value(&request))
            {
                let _ = client.forward_signal(contact.id, signal).await;
            }
        }
    }

    // ---- membership flows ----

    /// Honor a genesis designation: self-issue membership and publish the
    /// verifying key.
    pub async fn become_genesis(&self) -> Result<MembershipToken> {
        self.identity.authorize_genesis();
        let token = self.identity.become_genesis()?;
        self.identity.publish_public_key(&self.trust()).await?;
        Ok(token)
    }

    /// Issue an invitation for `invitee` and hand it to the bootstrap for
    /// delivery.
    pub async fn invite_new_client(&self, invitee: NodeId) -> Result<InvitationToken> {
        let token = self.identity.create_invitation(invitee, INVITATION_TTL_MS)?;
        if let Some(client) = self.bootstrap_client() {
            client
                .send_invitation(invitee, serde_json::to_value(&token)?)
                .await?;
        }
        Ok(token)
    }

    async fn on_invitation(
        self: &Arc<Self>,
        from_peer: NodeId,
        invitation_token: Value,
        websocket_coordination: Option<Value>,
    ) {
        let token: InvitationToken = match serde_json::from_value(invitation_token) {
            Ok(token) => token,
            Err(err) => {
                warn!(%err, "undecodable invitation dropped");
                return;
            }
        };
        if token.inviter != from_peer || token.invitee != self.identity.node_id() {
            warn!(from = %from_peer.short(), "invitation with mismatched parties dropped");
            return;
        }
        info!(inviter = %from_peer.short(), "invitation received");
        *self.pending_invitation.lock() = Some(token);

        // Reach the inviter: coordination hint first, then anything the
        // routing table knows, then a bootstrap lookup.
        let hinted_address = websocket_coordination
            .as_ref()
            .and_then(|c| c.get("listeningAddress"))
            .and_then(Value::as_str)
            .map(str::to_string);
        if let Some(address) = hinted_address {
            let contact = ContactInfo {
                id: from_peer,
                endpoint: address.clone(),
                metadata: PeerMetadata::nodejs(Some(address)),
            };
            if let Err(err) = self.fabric.connect_to(&contact).await {
                debug!(%err, "coordination hint dial failed");
            }
        } else if let Some(client) = self.bootstrap_client() {
            let _ = client.peer_lookup(from_peer).await;
        }

        self.try_complete_invitation().await;
    }

    /// Accept a pending invitation once its inviter is reachable: verify,
    /// burn the nonce, mint membership, publish our key.
    async fn try_complete_invitation(&self) {
        let Some(token) = self.pending_invitation.lock().clone() else {
            return;
        };
        if !self.fabric.is_connected(&token.inviter) {
            return;
        }
        let trust = self.trust();
        let inviter_key = match IdentityService::get_public_key(&trust, &token.inviter).await {
            Ok(Some(key)) => key,
            Ok(None) => {
                debug!(inviter = %token.inviter.short(), "inviter key not yet resolvable");
                return;
            }
            Err(err) => {
                warn!(%err, "inviter key lookup failed");
                return;
            }
        };
        match self
            .identity
            .accept_invitation(&token, &inviter_key, &trust)
            .await
        {
            Ok(_) => {
                *self.pending_invitation.lock() = None;
                if let Err(err) = self.identity.publish_public_key(&trust).await {
                    warn!(%err, "publishing our key after join failed");
                }
                info!("membership established via invitation");
            }
            Err(err) => {
                warn!(%err, "invitation was rejected");
                *self.pending_invitation.lock() = None;
            }
        }
    }

    /// Used by embedding code and tests when the token arrives out of band.
    pub async fn accept_invitation_token(&self, token: InvitationToken) {
        *self.pending_invitation.lock() = Some(token);
        self.try_complete_invitation().await;
    }

    // ---- fabric events ----

    async fn on_fabric_event(self: &Arc<Self>, event: FabricEvent) {
        match event {
            FabricEvent::PeerConnected(info) => {
                debug!(peer = %info.id.short(), "mesh link up");
                self.try_complete_invitation().await;
                self.maybe_go_independent();
            }
            FabricEvent::PeerDisconnected(id) => {
                debug!(peer = %id.short(), "mesh link down");
            }
            FabricEvent::Message { from, envelope } => {
                if let Some(response) = self.pubsub.handle_message(from, &envelope).await {
                    let reply = Envelope::new(
                        self.identity.node_id(),
                        Some(envelope.sender_peer),
                        response,
                    );
                    if let Err(err) = self.fabric.send_routed(reply).await {
                        debug!(%err, "pub/sub reply undeliverable");
                    }
                }
            }
        }
    }

    /// First mesh link: after a grace period, tell the bootstrap we can
    /// stand alone and drop the session.
    fn maybe_go_independent(self: &Arc<Self>) {
        if self.independent.swap(true, Ordering::SeqCst) {
            return;
        }
        let peer = self.clone();
        let grace = self.bootstrap_grace;
        self.spawn(tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            if let Some(client) = peer.bootstrap_client() {
                let _ = client.announce_independent().await;
                *peer.bootstrap.write() = None;
                info!("independent of bootstrap");
            }
        }));
    }

    // ---- public surface ----

    pub fn node_id(&self) -> NodeId {
        self.identity.node_id()
    }

    pub fn contact_info(&self) -> ContactInfo {
        self.fabric.local_info().clone()
    }

    pub fn identity(&self) -> &Arc<IdentityService> {
        &self.identity
    }

    pub fn engine(&self) -> &Arc<DhtEngine> {
        &self.engine
    }

    pub async fn connect_to(&self, contact: &ContactInfo) -> Result<()> {
        self.fabric.connect_to(contact).await.map_err(Into::into)
    }

    pub fn connected_peers(&self) -> Vec<NodeId> {
        self.engine.connected_peers()
    }

    pub async fn store(&self, key: &str, value: Value) -> Result<bool> {
        self.engine.store(key, value).await.map_err(Into::into)
    }

    pub async fn get(&self, key: &str) -> Result<Option<Value>> {
        self.engine.get(key).await.map_err(Into::into)
    }

    pub async fn subscribe(&self, topic: &str) -> Result<broadcast::Receiver<TopicMessage>> {
        self.pubsub.subscribe(topic).await.map_err(Into::into)
    }

    pub async fn publish(&self, topic: &str, data: Value) -> Result<u64> {
        self.pubsub.publish(topic, data).await.map_err(Into::into)
    }

    pub async fn poll(&self, topic: &str) -> Result<usize> {
        self.pubsub.poll(topic).await.map_err(Into::into)
    }

    pub async fn join_channel(
        &self,
        topic: &str,
        options: JoinOptions,
        progress: Option<mpsc::Sender<JoinProgress>>,
    ) -> Result<broadcast::Receiver<TopicMessage>> {
        self.pubsub
            .join_channel(topic, options, progress)
            .await
            .map_err(Into::into)
    }

    /// Orderly teardown: stop the loops, leave the bootstrap politely,
    /// close every link, snapshot the store.
    pub async fn shutdown(&self) {
        info!("shutting down");
        let _ = self.shutdown_tx.send(true);

        if let Some(client) = self.bootstrap_client() {
            let _ = client.announce_independent().await;
        }
        *self.bootstrap.write() = None;

        self.fabric.close_all().await;

        if let Some(path) = &self.store_path {
            if let Err(err) = self.engine.store_save(path) {
                warn!(%err, "store snapshot on shutdown failed");
            }
        }
        for handle in self.tasks.lock().drain(..) {
            handle.abort();
        }
    }
}

async fn accept_links(fabric: Arc<ConnectionFabric>, mut links: mpsc::Receiver<TransportLink>) {
    while let Some(link) = links.recv().await {
        fabric.attach(link, None);
    }
}

async fn run_fabric_events(
    peer: Arc<Peer>,
    mut events: mpsc::Receiver<FabricEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(event) => peer.on_fabric_event(event).await,
                None => break,
            },
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}

async fn run_bootstrap_events(
    peer: Arc<Peer>,
    mut events: mpsc::Receiver<BootstrapEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(event) => peer.on_bootstrap_event(event).await,
                None => break,
            },
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}

/// Stable per-device identity: a JSON file with the node id and the Ed25519
/// seed, created on first start.
fn load_or_create_identity(path: Option<&Path>) -> Result<(NodeId, IdentityKeyPair)> {
    let Some(path) = path else {
        return Ok((NodeId::random(), IdentityKeyPair::generate()));
    };

    if path.exists() {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading identity {}", path.display()))?;
        let value: Value = serde_json::from_str(&text)?;
        let node_id = value
            .get("nodeId")
            .and_then(Value::as_str)
            .context("identity file missing nodeId")
            .and_then(|s| NodeId::from_hex(s).map_err(Into::into))?;
        let seed_hex = value
            .get("seed")
            .and_then(Value::as_str)
            .context("identity file missing seed")?;
        let seed = hex::decode(seed_hex).context("identity seed is not hex")?;
        let keys = IdentityKeyPair::from_secret_bytes(&seed)?;
        return Ok((node_id, keys));
    }

    let node_id = NodeId::random();
    let keys = IdentityKeyPair::generate();
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)?;
    }
    let record = serde_json::json!({
        "nodeId": node_id.to_hex(),
        "seed": hex::encode(keys.secret_bytes().as_ref()),
    });
    std::fs::write(path, serde_json::to_string_pretty(&record)?)
        .with_context(|| format!("writing identity {}", path.display()))?;
    info!(path = %path.display(), "new identity persisted");
    Ok((node_id, keys))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("identity.json");

        let (id_a, keys_a) = load_or_create_identity(Some(&path)).unwrap();
        let (id_b, keys_b) = load_or_create_identity(Some(&path)).unwrap();

        assert_eq!(id_a, id_b);
        assert_eq!(keys_a.public_key(), keys_b.public_key());
    }

    #[test]
    fn missing_path_generates_ephemeral_identity() {
        let (a, _) = load_or_create_identity(None).unwrap();
        let (b, _) = load_or_create_identity(None).unwrap();
        assert_ne!(a, b);
    }
}
