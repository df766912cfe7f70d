//! Bootstrap client session
//!
//! The rendezvous link: register with version negotiation, receive peer
//! lists or the genesis designation, relay signals, receive invitations,
//! and announce independence once the mesh carries itself. Unknown message
//! types are logged and ignored for forward compatibility; a version
//! mismatch is fatal and surfaced as an event.

use crate::error::MeshError;
use crate::messages::{BootstrapClientMessage, BootstrapPeer, BootstrapServerMessage, RegisterMetadata};
use crate::transport::{ws, TransportLink};
use lib_crypto::NodeId;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Events surfaced from the bootstrap session.
#[derive(Debug, Clone, PartialEq)]
pub enum BootstrapEvent {
    Registered {
        build_id: String,
    },
    PeerList(Vec<BootstrapPeer>),
    /// This node is authorized to self-issue genesis membership.
    GenesisDesignation,
    Signal {
        from_peer: NodeId,
        signal: Value,
    },
    InvitationReceived {
        from_peer: NodeId,
        invitation_token: Value,
        websocket_coordination: Option<Value>,
    },
    PeerAvailable(NodeId),
    /// Fatal: surface "refresh required" and stay out of the mesh.
    VersionMismatch {
        server_version: String,
        message: String,
    },
    Closed,
}

pub struct BootstrapClient {
    tx: mpsc::Sender<String>,
}

impl BootstrapClient {
    /// Dial the bootstrap service and start the event pump.
    pub async fn connect(url: &str) -> Result<(Self, mpsc::Receiver<BootstrapEvent>), MeshError> {
        let link = ws::connect(url).await?;
        Ok(Self::from_link(link))
    }

    /// Wrap an already-open link (in-process bootstrap in tests).
    pub fn from_link(link: TransportLink) -> (Self, mpsc::Receiver<BootstrapEvent>) {
        let TransportLink { tx, mut rx, .. } = link;
        let (events_tx, events_rx) = mpsc::channel(32);

        tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                match parse_server_frame(&frame) {
                    Some(event) => {
                        let fatal = matches!(event, BootstrapEvent::VersionMismatch { .. });
                        if events_tx.send(event).await.is_err() {
                            break;
                        }
                        if fatal {
                            break;
                        }
                    }
                    None => continue,
                }
            }
            let _ = events_tx.send(BootstrapEvent::Closed).await;
            info!("bootstrap session ended");
        });

        (BootstrapClient { tx }, events_rx)
    }

    async fn send(&self, message: &BootstrapClientMessage) -> Result<(), MeshError> {
        let text = serde_json::to_string(message)
            .map_err(|err| MeshError::MalformedJson(err.to_string()))?;
        self.tx
            .send(text)
            .await
            .map_err(|_| MeshError::Transport("bootstrap link closed".to_string()))
    }

    /// Register this peer; the server answers `registered` or
    /// `version_mismatch`.
    pub async fn register(
        &self,
        node_id: NodeId,
        public_key: String,
        protocol_version: String,
        build_id: String,
        metadata: RegisterMetadata,
    ) -> Result<(), MeshError> {
        self.send(&BootstrapClientMessage::Register {
            node_id,
            public_key,
            protocol_version,
            build_id,
            metadata,
        })
        .await
    }

    /// Ask for up to `k` peers. A fresh network answers with a genesis
    /// designation instead of a list.
    pub async fn request_peers(&self, k: usize) -> Result<(), MeshError> {
        self.send(&BootstrapClientMessage::RequestPeers { k }).await
    }

    /// Relay an opaque signal blob toward another registered peer.
    pub async fn forward_signal(&self, target_peer: NodeId, signal: Value) -> Result<(), MeshError> {
        self.send(&BootstrapClientMessage::ForwardSignal {
            target_peer,
            signal,
        })
        .await
    }

    /// Deliver an invitation token to a waiting peer.
    pub async fn send_invitation(
        &self,
        target_peer: NodeId,
        invitation_token: Value,
    ) -> Result<(), MeshError> {
        self.send(&BootstrapClientMessage::SendInvitation {
            target_peer,
            invitation_token,
        })
        .await
    }

    pub async fn peer_lookup(&self, target_peer: NodeId) -> Result<(), MeshError> {
        self.send(&BootstrapClientMessage::PeerLookup { target_peer })
            .await
    }

    pub async fn join_peer(&self, target_peer: NodeId) -> Result<(), MeshError> {
        self.send(&BootstrapClientMessage::JoinPeer { target_peer })
            .await
    }

    /// Tell the bootstrap this peer no longer needs rendezvous.
    pub async fn announce_independent(&self) -> Result<(), MeshError> {
        self.send(&BootstrapClientMessage::AnnounceIndependent).await
    }
}

fn parse_server_frame(frame: &str) -> Option<BootstrapEvent> {
    match serde_json::from_str::<BootstrapServerMessage>(frame) {
        Ok(message) => Some(match message {
            BootstrapServerMessage::Registered { build_id } => {
                BootstrapEvent::Registered { build_id }
            }
            BootstrapServerMessage::PeerList { peers } => BootstrapEvent::PeerList(peers),
            BootstrapServerMessage::GenesisDesignation => BootstrapEvent::GenesisDesignation,
            BootstrapServerMessage::Signal { from_peer, signal } => {
                BootstrapEvent::Signal { from_peer, signal }
            }
            BootstrapServerMessage::InvitationReceived {
                from_peer,
                invitation_token,
                websocket_coordination,
            } => BootstrapEvent::InvitationReceived {
                from_peer,
                invitation_token,
                websocket_coordination,
            },
            BootstrapServerMessage::PeerAvailable { target_peer_id } => {
                BootstrapEvent::PeerAvailable(target_peer_id)
            }
            BootstrapServerMessage::VersionMismatch {
                server_version,
                message,
            } => BootstrapEvent::VersionMismatch {
                server_version,
                message,
            },
        }),
        Err(err) => {
            // Unknown types are ignored; garbage is worth a warning.
            match serde_json::from_str::<Value>(frame) {
                Ok(value) => {
                    let kind = value
                        .get("type")
                        .and_then(Value::as_str)
                        .unwrap_or("<untyped>");
                    debug!(kind, "ignoring unrecognized bootstrap message");
                }
                Err(_) => warn!(%err, "malformed bootstrap frame dropped"),
            }
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::memory_pair;
    use serde_json::json;

    async fn pair() -> (BootstrapClient, mpsc::Receiver<BootstrapEvent>, TransportLink) {
        let (client_link, server_link) = memory_pair("mem://client", "mem://bootstrap");
        let (client, events) = BootstrapClient::from_link(client_link);
        (client, events, server_link)
    }

    #[tokio::test]
    async fn register_produces_the_wire_message() {
        let (client, _events, mut server) = pair().await;
        client
            .register(
                NodeId::from_key("me"),
                "aabb".to_string(),
                "1.0.0".to_string(),
                "node_01".to_string(),
                RegisterMetadata {
                    node_type: lib_dht::NodeType::Nodejs,
                    listening_address: None,
                    capabilities: vec![],
                    can_accept_connections: true,
                    can_initiate_connections: true,
                },
            )
            .await
            .unwrap();

        let frame = server.rx.recv().await.unwrap();
        let value: Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(value["type"], "register");
        assert_eq!(value["buildId"], "node_01");
    }

    #[tokio::test]
    async fn server_frames_become_events() {
        let (_client, mut events, server) = pair().await;

        server
            .tx
            .send(r#"{"type":"genesis_designation"}"#.to_string())
            .await
            .unwrap();
        assert_eq!(events.recv().await.unwrap(), BootstrapEvent::GenesisDesignation);

        let signal = json!({
            "type": "signal",
            "fromPeer": NodeId::from_key("p"),
            "signal": {"blob": 1},
        });
        server.tx.send(signal.to_string()).await.unwrap();
        assert!(matches!(
            events.recv().await.unwrap(),
            BootstrapEvent::Signal { .. }
        ));
    }

    #[tokio::test]
    async fn unknown_types_are_skipped() {
        let (_client, mut events, server) = pair().await;
        server
            .tx
            .send(r#"{"type":"future_feature","x":1}"#.to_string())
            .await
            .unwrap();
        server
            .tx
            .send(r#"{"type":"registered","buildId":"node_9"}"#.to_string())
            .await
            .unwrap();

        // The unknown frame is silently skipped; the next real one arrives.
        assert_eq!(
            events.recv().await.unwrap(),
            BootstrapEvent::Registered {
                build_id: "node_9".to_string()
            }
        );
    }

    #[tokio::test]
    async fn version_mismatch_ends_the_session() {
        let (_client, mut events, server) = pair().await;
        let frame = json!({
            "type": "version_mismatch",
            "serverVersion": "1.0.0",
            "message": "refresh required",
        });
        server.tx.send(frame.to_string()).await.unwrap();

        assert!(matches!(
            events.recv().await.unwrap(),
            BootstrapEvent::VersionMismatch { .. }
        ));
        assert_eq!(events.recv().await.unwrap(), BootstrapEvent::Closed);
    }

    #[tokio::test]
    async fn dropping_the_server_closes_the_session() {
        let (_client, mut events, server) = pair().await;
        drop(server);
        assert_eq!(events.recv().await.unwrap(), BootstrapEvent::Closed);
    }
}
