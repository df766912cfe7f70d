//! Background maintenance
//!
//! Three supervised loops keep the overlay healthy:
//!
//! * **Adaptive refresh**: cadence follows the connectivity regime
//!   (aggressive under starvation, steady-state otherwise). Each tick
//!   refreshes stale buckets with random-target lookups, retries known but
//!   disconnected contacts, and in emergency mode sweeps the id space.
//! * **Republish / expiration**: re-announces owned values on schedule and
//!   deletes entries past their TTL.
//! * **Liveness pings**: probes contacts that have gone quiet; failures
//!   feed the eviction counter.
//!
//! All loops stop when the shutdown signal flips.

use crate::engine::DhtEngine;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

/// Random-target lookups issued per refresh tick, at most.
const MAX_BUCKET_REFRESHES_PER_TICK: usize = 4;

/// Reconnection attempts per refresh tick, at most.
const MAX_RECONNECTS_PER_TICK: usize = 3;

/// Emergency-mode sweep width across the id space.
const EMERGENCY_SWEEP_LOOKUPS: usize = 3;

/// Spawn the maintenance loops. They terminate when `shutdown` turns true.
pub fn spawn_maintenance(
    engine: Arc<DhtEngine>,
    shutdown: watch::Receiver<bool>,
) -> Vec<JoinHandle<()>> {
    vec![
        tokio::spawn(refresh_loop(engine.clone(), shutdown.clone())),
        tokio::spawn(republish_loop(engine.clone(), shutdown.clone())),
        tokio::spawn(ping_loop(engine, shutdown)),
    ]
}

async fn wait_or_shutdown(shutdown: &mut watch::Receiver<bool>, interval: Duration) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(interval) => false,
        changed = shutdown.changed() => changed.is_err() || *shutdown.borrow(),
    }
}

async fn refresh_loop(engine: Arc<DhtEngine>, mut shutdown: watch::Receiver<bool>) {
    info!("refresh loop started");
    loop {
        let interval = engine.current_refresh_interval();
        if wait_or_shutdown(&mut shutdown, interval).await {
            break;
        }
        refresh_tick(&engine, interval).await;
    }
    info!("refresh loop stopped");
}

async fn refresh_tick(engine: &Arc<DhtEngine>, interval: Duration) {
    // Stale means no lookup touched the bucket for two full intervals.
    let stale = engine.stale_buckets(interval * 2);
    for index in stale.into_iter().take(MAX_BUCKET_REFRESHES_PER_TICK) {
        let target = engine.random_id_in_bucket(index);
        trace!(bucket = index, "refreshing stale bucket");
        // The random target is a lookup goal, never a peer to contact.
        let _ = engine.iterative_find_node(target).await;
    }

    // Retry peers we know about but lost; backoff peers are already
    // filtered out of this list.
    for contact in engine.disconnected_contacts(MAX_RECONNECTS_PER_TICK) {
        debug!(peer = %contact.id.short(), "attempting reconnect to known contact");
        if let Err(err) = engine.sender().connect(&contact).await {
            debug!(peer = %contact.id.short(), %err, "reconnect attempt failed");
        }
    }

    if engine.emergency_mode() {
        for _ in 0..EMERGENCY_SWEEP_LOOKUPS {
            let target = lib_crypto::NodeId::random();
            let _ = engine.iterative_find_node(target).await;
        }
    }

    let dropped = engine.purge_temporaries();
    if !dropped.is_empty() {
        debug!(count = dropped.len(), "dropped stale temporary contacts");
    }
    engine.sweep_pending();
}

async fn republish_loop(engine: Arc<DhtEngine>, mut shutdown: watch::Receiver<bool>) {
    // Walk the queue well inside the republish interval so nothing slips a
    // full period.
    let interval = engine.config().republish_interval / 10;
    info!("republish loop started");
    loop {
        if wait_or_shutdown(&mut shutdown, interval).await {
            break;
        }

        for (key, value) in engine.due_for_republish() {
            match engine.store(&key, value).await {
                Ok(_) => trace!(%key, "value republished"),
                Err(err) => warn!(%key, %err, "republish failed"),
            }
        }

        let expired = engine.purge_expired_values();
        if !expired.is_empty() {
            debug!(count = expired.len(), "expired values deleted");
        }
    }
    info!("republish loop stopped");
}

async fn ping_loop(engine: Arc<DhtEngine>, mut shutdown: watch::Receiver<bool>) {
    let interval = engine.config().ping_interval;
    info!("ping loop started");
    loop {
        if wait_or_shutdown(&mut shutdown, interval).await {
            break;
        }

        for peer in engine.quiet_contacts(interval) {
            match engine.ping(peer).await {
                Ok(rtt) => trace!(peer = %peer.short(), ?rtt, "liveness ping ok"),
                Err(err) => debug!(peer = %peer.short(), %err, "liveness ping failed"),
            }
        }
    }
    info!("ping loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contact::{ContactInfo, PeerMetadata};
    use crate::engine::PeerSender;
    use crate::wire::Envelope;
    use crate::DhtConfig;
    use async_trait::async_trait;
    use lib_crypto::NodeId;

    struct NullSender;

    #[async_trait]
    impl PeerSender for NullSender {
        async fn send(&self, _to: &NodeId, _envelope: Envelope) -> anyhow::Result<()> {
            anyhow::bail!("no links")
        }

        async fn connect(&self, _contact: &ContactInfo) -> anyhow::Result<()> {
            Ok(())
        }

        fn is_connected(&self, _peer: &NodeId) -> bool {
            false
        }

        fn connected_peers(&self) -> Vec<NodeId> {
            Vec::new()
        }
    }

    #[tokio::test]
    async fn loops_stop_on_shutdown() {
        let engine = DhtEngine::new(
            ContactInfo {
                id: NodeId::random(),
                endpoint: String::new(),
                metadata: PeerMetadata::nodejs(None),
            },
            DhtConfig::default(),
            Arc::new(NullSender),
        )
        .unwrap();

        let (tx, rx) = watch::channel(false);
        let handles = spawn_maintenance(engine, rx);
        tx.send(true).unwrap();

        for handle in handles {
            tokio::time::timeout(Duration::from_secs(2), handle)
                .await
                .expect("loop did not stop")
                .unwrap();
        }
    }

    #[tokio::test]
    async fn refresh_tick_survives_an_empty_table() {
        let engine = DhtEngine::new(
            ContactInfo {
                id: NodeId::random(),
                endpoint: String::new(),
                metadata: PeerMetadata::nodejs(None),
            },
            DhtConfig::default(),
            Arc::new(NullSender),
        )
        .unwrap();

        refresh_tick(&engine, Duration::from_secs(15)).await;
        assert_eq!(engine.routing_stats().total_contacts, 0);
    }
}
