//! Signaling message deduplication
//!
//! The overlay's forwarding chain and the direct path can both deliver the
//! same signaling message. A short-TTL fingerprint set over (sender,
//! target, type, identifying fields, timestamp) silently absorbs the
//! duplicate.

use lib_dht::Envelope;
use lru::LruCache;
use parking_lot::Mutex;
use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

/// Bounded size backstop under the TTL.
const DEDUP_CAPACITY: usize = 4096;

pub struct DedupCache {
    seen: Mutex<LruCache<String, Instant>>,
    ttl: Duration,
}

impl DedupCache {
    pub fn new(ttl: Duration) -> Self {
        DedupCache {
            seen: Mutex::new(LruCache::new(
                NonZeroUsize::new(DEDUP_CAPACITY).expect("capacity is nonzero"),
            )),
            ttl,
        }
    }

    /// Fingerprint of a signaling envelope.
    pub fn fingerprint(envelope: &Envelope) -> String {
        format!(
            "{}|{}|{}|{}|{}",
            envelope.sender_peer.to_hex(),
            envelope
                .target_peer
                .map(|id| id.to_hex())
                .unwrap_or_default(),
            envelope.payload.type_name(),
            envelope.payload.dedup_discriminator(),
            envelope.timestamp,
        )
    }

    /// Record an envelope; returns false when it was already seen within the
    /// TTL (a duplicate to drop).
    pub fn observe(&self, envelope: &Envelope) -> bool {
        let fingerprint = Self::fingerprint(envelope);
        let now = Instant::now();
        let mut seen = self.seen.lock();
        if let Some(at) = seen.get(&fingerprint) {
            if now.duration_since(*at) < self.ttl {
                return false;
            }
        }
        seen.put(fingerprint, now);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lib_crypto::NodeId;
    use lib_dht::Payload;

    fn offer(sdp: &str) -> Envelope {
        let mut envelope = Envelope::new(
            NodeId::from_key("a"),
            Some(NodeId::from_key("b")),
            Payload::WebrtcOffer {
                sdp: sdp.to_string(),
            },
        );
        // Pin the timestamp so repeat construction fingerprints identically.
        envelope.timestamp = 1_700_000_000_000;
        envelope
    }

    #[test]
    fn duplicates_are_dropped_within_ttl() {
        let cache = DedupCache::new(Duration::from_secs(60));
        let envelope = offer("v=0");

        assert!(cache.observe(&envelope));
        assert!(!cache.observe(&envelope));
    }

    #[test]
    fn distinct_payloads_pass() {
        let cache = DedupCache::new(Duration::from_secs(60));
        assert!(cache.observe(&offer("v=0 one")));
        assert!(cache.observe(&offer("v=0 two")));
    }

    #[test]
    fn entries_age_out() {
        let cache = DedupCache::new(Duration::ZERO);
        let envelope = offer("v=0");
        assert!(cache.observe(&envelope));
        std::thread::sleep(Duration::from_millis(2));
        assert!(cache.observe(&envelope));
    }
}
