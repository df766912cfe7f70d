//! XOR routing table
//!
//! 160 k-buckets keyed by the length of the shared prefix with the local
//! identifier (the leading-zero count of the XOR distance). Every remote
//! identifier maps to exactly one bucket; the local node is never stored.
//! Evicted peers sit out a backoff window before they can be re-added.

use crate::contact::{Contact, ContactInfo};
use crate::kbucket::{InsertOutcome, KBucket};
use lib_crypto::{NodeId, NODE_ID_BITS, NODE_ID_BYTES};
use rand::RngCore;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::debug;

pub const BUCKET_COUNT: usize = NODE_ID_BITS as usize;

/// Snapshot of table occupancy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutingStats {
    pub total_contacts: usize,
    pub non_empty_buckets: usize,
    pub full_buckets: usize,
    pub k: usize,
}

#[derive(Debug)]
pub struct RoutingTable {
    local: NodeId,
    buckets: Vec<KBucket>,
    k: usize,
    /// Evicted peers and when they may return.
    backoff: HashMap<NodeId, Instant>,
}

impl RoutingTable {
    pub fn new(local: NodeId, k: usize) -> Self {
        RoutingTable {
            local,
            buckets: (0..BUCKET_COUNT).map(|_| KBucket::new(k)).collect(),
            k,
            backoff: HashMap::new(),
        }
    }

    pub fn local_id(&self) -> NodeId {
        self.local
    }

    pub fn k(&self) -> usize {
        self.k
    }

    /// Bucket index for a remote identifier: shared-prefix length, capped at
    /// the last bucket. Only the local id itself would exceed the cap, and
    /// it is never inserted.
    pub fn bucket_index(&self, id: &NodeId) -> usize {
        let zeros = self.local.distance(id).leading_zero_bits() as usize;
        zeros.min(BUCKET_COUNT - 1)
    }

    pub fn len(&self) -> usize {
        self.buckets.iter().map(KBucket::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.buckets[self.bucket_index(id)].contains(id)
    }

    pub fn get(&self, id: &NodeId) -> Option<&Contact> {
        self.buckets[self.bucket_index(id)].get(id)
    }

    pub fn get_mut(&mut self, id: &NodeId) -> Option<&mut Contact> {
        let index = self.bucket_index(id);
        self.buckets[index].get_mut(id)
    }

    /// Insert a contact. The local node, peers in backoff, and entries that
    /// would overflow a full bucket are all rejected.
    pub fn insert(&mut self, contact: Contact) -> InsertOutcome {
        let id = contact.id();
        if id == self.local {
            return InsertOutcome::Full;
        }
        if let Some(until) = self.backoff.get(&id) {
            if Instant::now() < *until {
                debug!(peer = %id.short(), "insert refused, peer in backoff");
                return InsertOutcome::Full;
            }
            self.backoff.remove(&id);
        }
        let index = self.bucket_index(&id);
        self.buckets[index].insert(contact)
    }

    pub fn insert_info(&mut self, info: ContactInfo) -> InsertOutcome {
        self.insert(Contact::new(info))
    }

    pub fn touch(&mut self, id: &NodeId) -> bool {
        let index = self.bucket_index(id);
        self.buckets[index].touch(id)
    }

    pub fn remove(&mut self, id: &NodeId) -> Option<Contact> {
        let index = self.bucket_index(id);
        self.buckets[index].remove(id)
    }

    /// Record a failed interaction. At `threshold` consecutive failures the
    /// contact is evicted and barred for `backoff`.
    ///
    /// Returns true when the contact was evicted.
    pub fn record_failure(&mut self, id: &NodeId, threshold: u32, backoff: Duration) -> bool {
        let index = self.bucket_index(id);
        let Some(contact) = self.buckets[index].get_mut(id) else {
            return false;
        };
        let failures = contact.record_failure();
        if failures >= threshold {
            self.buckets[index].remove(id);
            self.backoff.insert(*id, Instant::now() + backoff);
            debug!(peer = %id.short(), failures, "contact evicted into backoff");
            true
        } else {
            false
        }
    }

    pub fn in_backoff(&self, id: &NodeId) -> bool {
        self.backoff
            .get(id)
            .is_some_and(|until| Instant::now() < *until)
    }

    /// The `count` closest known contacts to `target`, sorted by XOR
    /// distance with byte-order tie-break via the distance itself.
    pub fn closest(&self, target: &NodeId, count: usize) -> Vec<ContactInfo> {
        let mut all: Vec<&Contact> = self.buckets.iter().flat_map(KBucket::iter).collect();
        all.sort_by_key(|c| c.id().distance(target));
        all.into_iter().take(count).map(|c| c.info.clone()).collect()
    }

    /// Mark the bucket covering `id` as active. Lookups touching a region
    /// keep it from being refreshed needlessly.
    pub fn record_activity(&mut self, id: &NodeId) {
        let index = self.bucket_index(id);
        self.buckets[index].record_activity();
    }

    /// Indices of buckets with entries but no recent activity.
    pub fn stale_buckets(&self, window: Duration) -> Vec<usize> {
        self.buckets
            .iter()
            .enumerate()
            .filter(|(_, b)| b.is_stale(window))
            .map(|(i, _)| i)
            .collect()
    }

    /// Synthesize a random identifier that falls in bucket `index`: share
    /// exactly `index` prefix bits with the local id, then diverge.
    pub fn random_id_in_bucket(&self, index: usize) -> NodeId {
        let index = index.min(BUCKET_COUNT - 1) as u32;
        let mut bytes = *self.local.as_bytes();

        let mut noise = [0u8; NODE_ID_BYTES];
        rand::rngs::OsRng.fill_bytes(&mut noise);

        // Diverge at `index`, randomize everything below it.
        for bit in index..NODE_ID_BITS {
            let byte = (bit / 8) as usize;
            let mask = 1u8 << (7 - (bit % 8));
            if bit == index {
                bytes[byte] ^= mask;
            } else if noise[byte] & mask != 0 {
                bytes[byte] ^= mask;
            }
        }
        NodeId::from_bytes(bytes)
    }

    /// Contacts known but not currently connected, for reconnection sweeps.
    pub fn disconnected_contacts(&self, limit: usize) -> Vec<ContactInfo> {
        self.buckets
            .iter()
            .flat_map(KBucket::iter)
            .filter(|c| !c.is_connected() && !self.in_backoff(&c.id()))
            .take(limit)
            .map(|c| c.info.clone())
            .collect()
    }

    /// Drop temporary signaling contacts that never upgraded to a real
    /// connection within `ttl`.
    pub fn purge_temporaries(&mut self, ttl: Duration) -> Vec<NodeId> {
        let mut removed = Vec::new();
        for bucket in &mut self.buckets {
            let expired: Vec<NodeId> = bucket
                .iter()
                .filter(|c| c.temporary && c.inserted_at.elapsed() > ttl)
                .map(Contact::id)
                .collect();
            for id in expired {
                bucket.remove(&id);
                removed.push(id);
            }
        }
        removed
    }

    pub fn stats(&self) -> RoutingStats {
        RoutingStats {
            total_contacts: self.len(),
            non_empty_buckets: self.buckets.iter().filter(|b| !b.is_empty()).count(),
            full_buckets: self.buckets.iter().filter(|b| b.is_full()).count(),
            k: self.k,
        }
    }

    pub fn all_contacts(&self) -> Vec<ContactInfo> {
        self.buckets
            .iter()
            .flat_map(KBucket::iter)
            .map(|c| c.info.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contact::PeerMetadata;

    fn info(id: NodeId) -> ContactInfo {
        ContactInfo {
            id,
            endpoint: String::new(),
            metadata: PeerMetadata::nodejs(None),
        }
    }

    fn table() -> RoutingTable {
        RoutingTable::new(NodeId::from_bytes([0u8; NODE_ID_BYTES]), 20)
    }

    fn id_with_first_byte(b: u8) -> NodeId {
        let mut bytes = [0u8; NODE_ID_BYTES];
        bytes[0] = b;
        // Keep ids distinct even with an equal first byte.
        let tail = NodeId::random();
        bytes[1..].copy_from_slice(&tail.as_bytes()[1..]);
        NodeId::from_bytes(bytes)
    }

    #[test]
    fn local_node_is_never_inserted() {
        let mut table = table();
        let local = table.local_id();
        assert_eq!(table.insert_info(info(local)), InsertOutcome::Full);
        assert!(table.is_empty());
    }

    #[test]
    fn each_id_maps_to_one_bucket() {
        let mut table = table();
        let id = id_with_first_byte(0x80);
        table.insert_info(info(id));
        table.insert_info(info(id));

        assert_eq!(table.len(), 1);
        assert_eq!(table.bucket_index(&id), 0);
    }

    #[test]
    fn closest_sorts_by_xor_distance() {
        let mut table = table();
        let near = id_with_first_byte(0x01);
        let mid = id_with_first_byte(0x0f);
        let far = id_with_first_byte(0xf0);
        for id in [far, near, mid] {
            table.insert_info(info(id));
        }

        let target = NodeId::from_bytes([0u8; NODE_ID_BYTES]);
        let closest = table.closest(&target, 3);
        assert_eq!(closest[0].id, near);
        assert_eq!(closest[1].id, mid);
        assert_eq!(closest[2].id, far);

        assert_eq!(table.closest(&target, 2).len(), 2);
    }

    #[test]
    fn failure_threshold_evicts_into_backoff() {
        let mut table = table();
        let id = id_with_first_byte(0x40);
        table.insert_info(info(id));

        assert!(!table.record_failure(&id, 3, Duration::from_secs(300)));
        assert!(!table.record_failure(&id, 3, Duration::from_secs(300)));
        assert!(table.record_failure(&id, 3, Duration::from_secs(300)));

        assert!(!table.contains(&id));
        assert!(table.in_backoff(&id));
        // Re-insertion during backoff is refused.
        assert_eq!(table.insert_info(info(id)), InsertOutcome::Full);
    }

    #[test]
    fn random_bucket_ids_land_in_their_bucket() {
        let table = table();
        for index in [0usize, 7, 42, 159] {
            let id = table.random_id_in_bucket(index);
            assert_eq!(table.bucket_index(&id), index, "bucket {index}");
        }
    }

    #[test]
    fn temporaries_are_purged_after_ttl() {
        let mut table = table();
        let keep = id_with_first_byte(0x20);
        let gone = id_with_first_byte(0x21);

        table.insert(Contact::new(info(keep)));
        table.insert(Contact::temporary(info(gone)));

        let removed = table.purge_temporaries(Duration::ZERO);
        assert_eq!(removed, vec![gone]);
        assert!(table.contains(&keep));
        assert!(!table.contains(&gone));
    }

    #[test]
    fn stats_count_occupancy() {
        let mut table = table();
        table.insert_info(info(id_with_first_byte(0x80)));
        table.insert_info(info(id_with_first_byte(0x40)));

        let stats = table.stats();
        assert_eq!(stats.total_contacts, 2);
        assert_eq!(stats.non_empty_buckets, 2);
        assert_eq!(stats.full_buckets, 0);
        assert_eq!(stats.k, 20);
    }
}
