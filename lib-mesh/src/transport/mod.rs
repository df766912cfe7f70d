//! Transport capability
//!
//! A link is a pair of framed text channels plus metadata: the fabric writes
//! outbound frames into `tx` and reads inbound frames from `rx`; pump tasks
//! behind the link own the actual socket. Closing either side tears the
//! link down. Three concrete sources produce links: an outbound WebSocket
//! dial, an accepted WebSocket connection, and an in-process pipe used for
//! tests and loopback wiring.

pub mod ws;

use tokio::sync::mpsc;

/// Frame channel depth per link.
pub(crate) const LINK_CHANNEL_DEPTH: usize = 64;

/// Which concrete transport produced a link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkKind {
    /// We dialed the remote listener.
    WsOutbound,
    /// The remote dialed our listener.
    WsInbound,
    /// In-process pipe.
    Memory,
}

/// A live framed connection to one remote endpoint.
#[derive(Debug)]
pub struct TransportLink {
    pub kind: LinkKind,
    /// Remote address for logs; opaque.
    pub remote_addr: String,
    /// Outbound frames. Dropping this closes the write half.
    pub tx: mpsc::Sender<String>,
    /// Inbound frames. `None` from the channel means the link closed.
    pub rx: mpsc::Receiver<String>,
}

/// Build a crossed in-process pair: frames written to one side arrive at
/// the other.
pub fn memory_pair(addr_a: &str, addr_b: &str) -> (TransportLink, TransportLink) {
    let (a_tx, b_rx) = mpsc::channel(LINK_CHANNEL_DEPTH);
    let (b_tx, a_rx) = mpsc::channel(LINK_CHANNEL_DEPTH);
    (
        TransportLink {
            kind: LinkKind::Memory,
            remote_addr: addr_b.to_string(),
            tx: a_tx,
            rx: a_rx,
        },
        TransportLink {
            kind: LinkKind::Memory,
            remote_addr: addr_a.to_string(),
            tx: b_tx,
            rx: b_rx,
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_pair_crosses_frames() {
        let (a, mut b) = memory_pair("mem://a", "mem://b");
        a.tx.send("hello".to_string()).await.unwrap();
        assert_eq!(b.rx.recv().await.unwrap(), "hello");

        b.tx.send("back".to_string()).await.unwrap();
        let mut a = a;
        assert_eq!(a.rx.recv().await.unwrap(), "back");
    }

    #[tokio::test]
    async fn dropping_one_side_closes_the_other() {
        let (a, b) = memory_pair("mem://a", "mem://b");
        drop(b);
        let mut a = a;
        assert!(a.rx.recv().await.is_none());
    }
}
