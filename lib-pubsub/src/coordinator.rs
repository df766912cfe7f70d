//! Coordinator election
//!
//! The coordinator of a topic is whatever `coordinator:<topic>` says it is.
//! Claiming the role is a compare-and-swap against the record's version: a
//! live incumbent is adopted as-is, a dead or absent one is replaced with a
//! claim at `version + 1`. When two claimants race, exactly one CAS
//! succeeds; the loser reads back the winner and adopts it. Versions are
//! strictly non-decreasing over the life of a topic.

use crate::error::PubSubError;
use crate::messages::{coordinator_key, CoordinatorRecord};
use lib_crypto::NodeId;
use lib_dht::{CasOutcome, DhtEngine};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info};

/// Bounded retries for the read-claim-read cycle.
const MAX_ELECTION_ROUNDS: u32 = 3;

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

fn parse_record(value: &serde_json::Value) -> Option<CoordinatorRecord> {
    serde_json::from_value(value.clone()).ok()
}

/// Find or become the coordinator of `topic`.
///
/// `is_alive` decides whether an incumbent still counts; connection state is
/// the usual oracle, with the local node always alive.
pub async fn elect_coordinator(
    engine: &DhtEngine,
    topic: &str,
    is_alive: impl Fn(&NodeId) -> bool,
) -> Result<CoordinatorRecord, PubSubError> {
    let key = coordinator_key(topic);

    for round in 0..MAX_ELECTION_ROUNDS {
        let current = engine
            .get(&key)
            .await?
            .as_ref()
            .and_then(parse_record);

        if let Some(record) = &current {
            if record.node_id == engine.local_id() || is_alive(&record.node_id) {
                debug!(
                    topic,
                    coordinator = %record.node_id.short(),
                    version = record.version,
                    "adopting incumbent coordinator"
                );
                return Ok(record.clone());
            }
        }

        let claim = CoordinatorRecord {
            node_id: engine.local_id(),
            version: current.as_ref().map(|r| r.version + 1).unwrap_or(1),
            issued_at: now_ms(),
        };
        let expected = current.as_ref().map(|r| r.version);
        let claim_value =
            serde_json::to_value(&claim).map_err(|_| PubSubError::NoCoordinator(topic.into()))?;

        match engine.cas(&key, expected, claim_value).await? {
            CasOutcome::Accepted => {
                info!(topic, version = claim.version, "claimed topic coordination");
                return Ok(claim);
            }
            CasOutcome::Conflict(winner_value) => {
                if let Some(winner) = parse_record(&winner_value) {
                    debug!(
                        topic,
                        winner = %winner.node_id.short(),
                        version = winner.version,
                        round,
                        "coordinator claim lost, adopting winner"
                    );
                    if winner.node_id == engine.local_id() || is_alive(&winner.node_id) {
                        return Ok(winner);
                    }
                    // Winner already dead; go around again.
                }
            }
        }
    }

    Err(PubSubError::NoCoordinator(topic.to_string()))
}
