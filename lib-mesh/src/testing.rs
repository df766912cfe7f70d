//! In-process bootstrap hub
//!
//! A minimal bootstrap service speaking the full rendezvous contract, for
//! integration tests and local development clusters: registration with
//! version negotiation, genesis designation for the first lonely peer,
//! peer lists, opaque signal relay, and invitation delivery.

use crate::messages::{BootstrapClientMessage, BootstrapPeer, BootstrapServerMessage};
use crate::transport::{ws, TransportLink};
use crate::version::{ProtocolVersion, MIN_COMPATIBLE_VERSION, PROTOCOL_VERSION};
use lib_crypto::NodeId;
use lib_dht::PeerMetadata;
use parking_lot::RwLock;
use serde_json::json;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

struct Session {
    tx: mpsc::Sender<String>,
    metadata: PeerMetadata,
}

/// A bootstrap service bound to a local port.
pub struct BootstrapHub {
    sessions: RwLock<HashMap<NodeId, Session>>,
    genesis_assigned: AtomicBool,
    addr: SocketAddr,
}

impl BootstrapHub {
    /// Bind and serve. Returns the hub handle; the accept loop runs until
    /// the process ends.
    pub async fn spawn(bind: &str) -> anyhow::Result<Arc<BootstrapHub>> {
        let listener = ws::bind(bind).await?;
        let addr = listener.local_addr()?;
        let hub = Arc::new(BootstrapHub {
            sessions: RwLock::new(HashMap::new()),
            genesis_assigned: AtomicBool::new(false),
            addr,
        });

        let (links_tx, mut links_rx) = mpsc::channel::<TransportLink>(16);
        tokio::spawn(ws::serve(listener, links_tx));
        let accept_hub = hub.clone();
        tokio::spawn(async move {
            while let Some(link) = links_rx.recv().await {
                let hub = accept_hub.clone();
                tokio::spawn(async move { hub.run_session(link).await });
            }
        });

        info!(%addr, "bootstrap hub up");
        Ok(hub)
    }

    pub fn url(&self) -> String {
        format!("ws://{}", self.addr)
    }

    pub fn registered_count(&self) -> usize {
        self.sessions.read().len()
    }

    async fn run_session(self: Arc<Self>, link: TransportLink) {
        let TransportLink { tx, mut rx, .. } = link;
        let mut node: Option<NodeId> = None;

        while let Some(frame) = rx.recv().await {
            let message: BootstrapClientMessage = match serde_json::from_str(&frame) {
                Ok(message) => message,
                Err(err) => {
                    debug!(%err, "hub ignoring unrecognized client frame");
                    continue;
                }
            };
            match message {
                BootstrapClientMessage::Register {
                    node_id,
                    protocol_version,
                    metadata,
                    ..
                } => {
                    if !version_accepted(&protocol_version) {
                        warn!(%node_id, %protocol_version, "registration refused");
                        let _ = send(
                            &tx,
                            &BootstrapServerMessage::VersionMismatch {
                                server_version: PROTOCOL_VERSION.to_string(),
                                message: "refresh required".to_string(),
                            },
                        )
                        .await;
                        return;
                    }
                    node = Some(node_id);
                    self.sessions.write().insert(
                        node_id,
                        Session {
                            tx: tx.clone(),
                            metadata: PeerMetadata {
                                node_type: metadata.node_type,
                                listening_address: metadata.listening_address,
                                capabilities: metadata.capabilities,
                                can_relay: metadata.can_accept_connections,
                            },
                        },
                    );
                    let _ = send(
                        &tx,
                        &BootstrapServerMessage::Registered {
                            build_id: "node_hub".to_string(),
                        },
                    )
                    .await;
                }
                BootstrapClientMessage::RequestPeers { k } => {
                    let Some(me) = node else { continue };
                    let peers: Vec<BootstrapPeer> = {
                        let sessions = self.sessions.read();
                        sessions
                            .iter()
                            .filter(|(id, _)| **id != me)
                            .take(k)
                            .map(|(id, session)| BootstrapPeer {
                                node_id: *id,
                                metadata: session.metadata.clone(),
                            })
                            .collect()
                    };
                    if peers.is_empty()
                        && self
                            .genesis_assigned
                            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                            .is_ok()
                    {
                        info!(node = %me.short(), "designating genesis");
                        let _ = send(&tx, &BootstrapServerMessage::GenesisDesignation).await;
                    } else {
                        let _ = send(&tx, &BootstrapServerMessage::PeerList { peers }).await;
                    }
                }
                BootstrapClientMessage::ForwardSignal {
                    target_peer,
                    signal,
                } => {
                    let Some(me) = node else { continue };
                    self.relay(
                        target_peer,
                        BootstrapServerMessage::Signal {
                            from_peer: me,
                            signal,
                        },
                    )
                    .await;
                }
                BootstrapClientMessage::SendInvitation {
                    target_peer,
                    invitation_token,
                } => {
                    let Some(me) = node else { continue };
                    // Attach the inviter's listener so the invitee can dial
                    // straight back.
                    let coordination = self
                        .sessions
                        .read()
                        .get(&me)
                        .and_then(|s| s.metadata.listening_address.clone())
                        .map(|address| json!({ "listeningAddress": address }));
                    self.relay(
                        target_peer,
                        BootstrapServerMessage::InvitationReceived {
                            from_peer: me,
                            invitation_token,
                            websocket_coordination: coordination,
                        },
                    )
                    .await;
                }
                BootstrapClientMessage::PeerLookup { target_peer }
                | BootstrapClientMessage::JoinPeer { target_peer } => {
                    if self.sessions.read().contains_key(&target_peer) {
                        let _ = send(
                            &tx,
                            &BootstrapServerMessage::PeerAvailable {
                                target_peer_id: target_peer,
                            },
                        )
                        .await;
                    }
                }
                BootstrapClientMessage::AnnounceIndependent => {
                    if let Some(me) = node {
                        debug!(node = %me.short(), "peer announced independence");
                    }
                }
            }
        }

        if let Some(me) = node {
            self.sessions.write().remove(&me);
            debug!(node = %me.short(), "hub session ended");
        }
    }

    async fn relay(&self, target: NodeId, message: BootstrapServerMessage) {
        let tx = self.sessions.read().get(&target).map(|s| s.tx.clone());
        match tx {
            Some(tx) => {
                let _ = send(&tx, &message).await;
            }
            None => debug!(target = %target.short(), "relay target not registered"),
        }
    }
}

fn version_accepted(client: &str) -> bool {
    let Ok(client) = client.parse::<ProtocolVersion>() else {
        return false;
    };
    let server = ProtocolVersion::current();
    let Ok(minimum) = MIN_COMPATIBLE_VERSION.parse::<ProtocolVersion>() else {
        return false;
    };
    client.compatible_with(&server, &minimum)
}

async fn send(tx: &mpsc::Sender<String>, message: &BootstrapServerMessage) -> anyhow::Result<()> {
    let text = serde_json::to_string(message)?;
    tx.send(text).await?;
    Ok(())
}
