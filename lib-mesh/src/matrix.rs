//! Transport decision matrix
//!
//! Exactly one rule per ordered pair of peer types. Browsers never operate
//! WebSocket listeners, so every WebSocket link terminates at a `nodejs`
//! peer; browser pairs negotiate a WebRTC data channel instead.

use lib_crypto::NodeId;
use lib_dht::NodeType;

/// How the local peer should reach a remote, and who moves first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportChoice {
    /// Browser pair: WebRTC data channel under perfect negotiation.
    /// `polite` is the local role from the id tie-break.
    WebRtc { polite: bool },
    /// Dial the remote's WebSocket listener ourselves.
    WsDial,
    /// Ask the remote to dial our listener (`websocket_connection_request`).
    WsAwaitDial,
}

/// Pick the transport and initiator for `local` reaching `remote`.
pub fn choose_transport(
    local_type: NodeType,
    local_id: &NodeId,
    remote_type: NodeType,
    remote_id: &NodeId,
) -> TransportChoice {
    match (local_type, remote_type) {
        (NodeType::Browser, NodeType::Browser) => TransportChoice::WebRtc {
            polite: local_id < remote_id,
        },
        // The browser always dials across a browser/server pair.
        (NodeType::Browser, NodeType::Nodejs) => TransportChoice::WsDial,
        (NodeType::Nodejs, NodeType::Browser) => TransportChoice::WsAwaitDial,
        // Server pair: the lexicographically smaller id dials.
        (NodeType::Nodejs, NodeType::Nodejs) => {
            if local_id < remote_id {
                TransportChoice::WsDial
            } else {
                TransportChoice::WsAwaitDial
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lib_crypto::NODE_ID_BYTES;

    fn id(first: u8) -> NodeId {
        let mut bytes = [0u8; NODE_ID_BYTES];
        bytes[0] = first;
        NodeId::from_bytes(bytes)
    }

    #[test]
    fn browser_pair_uses_webrtc_with_id_tie_break() {
        let lo = id(1);
        let hi = id(2);

        assert_eq!(
            choose_transport(NodeType::Browser, &lo, NodeType::Browser, &hi),
            TransportChoice::WebRtc { polite: true }
        );
        assert_eq!(
            choose_transport(NodeType::Browser, &hi, NodeType::Browser, &lo),
            TransportChoice::WebRtc { polite: false }
        );
    }

    #[test]
    fn browser_always_dials_servers() {
        let a = id(1);
        let b = id(2);
        assert_eq!(
            choose_transport(NodeType::Browser, &a, NodeType::Nodejs, &b),
            TransportChoice::WsDial
        );
        // Even when the browser has the larger id.
        assert_eq!(
            choose_transport(NodeType::Browser, &b, NodeType::Nodejs, &a),
            TransportChoice::WsDial
        );
    }

    #[test]
    fn server_asks_browsers_to_dial_back() {
        let a = id(1);
        let b = id(2);
        assert_eq!(
            choose_transport(NodeType::Nodejs, &a, NodeType::Browser, &b),
            TransportChoice::WsAwaitDial
        );
    }

    #[test]
    fn server_pair_smaller_id_dials() {
        let lo = id(1);
        let hi = id(2);
        assert_eq!(
            choose_transport(NodeType::Nodejs, &lo, NodeType::Nodejs, &hi),
            TransportChoice::WsDial
        );
        assert_eq!(
            choose_transport(NodeType::Nodejs, &hi, NodeType::Nodejs, &lo),
            TransportChoice::WsAwaitDial
        );
    }

    #[test]
    fn no_rule_ever_makes_a_browser_listen() {
        // Every choice that ends in a WebSocket dial targets a nodejs
        // listener; a browser remote only appears on the WebRTC or
        // reverse-dial arms.
        let a = id(1);
        let b = id(2);
        for (local, remote) in [
            (NodeType::Browser, NodeType::Browser),
            (NodeType::Browser, NodeType::Nodejs),
            (NodeType::Nodejs, NodeType::Browser),
            (NodeType::Nodejs, NodeType::Nodejs),
        ] {
            let choice = choose_transport(local, &a, remote, &b);
            if choice == TransportChoice::WsDial {
                assert_eq!(remote, NodeType::Nodejs);
            }
            if choice == TransportChoice::WsAwaitDial {
                // A reverse dial lands on the local listener.
                assert_eq!(local, NodeType::Nodejs);
            }
        }
    }
}
