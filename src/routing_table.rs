//! The k-bucket routing table: a binary trie over XOR distance to the
//! local ID, flattened into one bucket per possible trie depth. Because
//! the local ID never changes, the trie never needs to be rebalanced at
//! run time — the bucket a peer belongs in is exactly
//! `leading_zero_bits(distance(local, peer))`, so pre-allocating one
//! bucket per depth realizes the same structure the teacher's
//! `networking::kad` module builds with a fixed-size `Vec<KBucket>`.

use std::collections::VecDeque;

use crate::id::{Distance, Id, ID_LEN};
use crate::peer::Peer;

const NUM_BUCKETS: usize = ID_LEN * 8;

/// Result of observing a peer.
#[derive(Debug)]
pub enum Observed {
    /// Peer was new and inserted, or already present and moved to the
    /// tail of its bucket.
    Inserted,
    /// The peer's bucket is full. The caller must ping `stale_head`
    /// (least-recently-seen) and report back via
    /// [`RoutingTable::resolve_eviction`].
    BucketFull { bucket: usize, stale_head: Peer },
}

struct Bucket {
    peers: VecDeque<Peer>,
}

impl Bucket {
    fn new() -> Self {
        Bucket {
            peers: VecDeque::new(),
        }
    }

    fn position(&self, id: &Id) -> Option<usize> {
        self.peers.iter().position(|p| &p.id == id)
    }
}

pub struct RoutingTable {
    local_id: Id,
    k: usize,
    buckets: Vec<Bucket>,
}

impl RoutingTable {
    pub fn new(local_id: Id, k: usize) -> Self {
        RoutingTable {
            local_id,
            k,
            buckets: (0..NUM_BUCKETS).map(|_| Bucket::new()).collect(),
        }
    }

    fn bucket_index(&self, id: &Id) -> Option<usize> {
        self.local_id
            .distance(id)
            .leading_zero_bits()
            .map(|bits| bits as usize)
    }

    /// Records an interaction with `peer`. The local ID itself is
    /// silently ignored (distance zero has no bucket).
    pub fn observe(&mut self, peer: Peer) -> Option<Observed> {
        let index = self.bucket_index(&peer.id)?;
        let bucket = &mut self.buckets[index];
        if let Some(pos) = bucket.position(&peer.id) {
            bucket.peers.remove(pos);
            bucket.peers.push_back(peer);
            return Some(Observed::Inserted);
        }
        if bucket.peers.len() < self.k {
            bucket.peers.push_back(peer);
            return Some(Observed::Inserted);
        }
        let stale_head = *bucket.peers.front().expect("bucket full implies non-empty");
        Some(Observed::BucketFull {
            bucket: index,
            stale_head,
        })
    }

    /// Resolves a previously reported [`Observed::BucketFull`]: if the
    /// stale head answered a ping, it is kept (and moved to the tail) and
    /// the new peer is dropped. If it did not answer, it is evicted and
    /// the new peer is inserted at the tail.
    pub fn resolve_eviction(&mut self, bucket: usize, stale_head_responded: bool, candidate: Peer) {
        let b = &mut self.buckets[bucket];
        if stale_head_responded {
            if let Some(head) = b.peers.pop_front() {
                b.peers.push_back(head);
            }
        } else {
            b.peers.pop_front();
            b.peers.push_back(candidate);
        }
    }

    pub fn remove(&mut self, id: &Id) {
        if let Some(index) = self.bucket_index(id) {
            let bucket = &mut self.buckets[index];
            if let Some(pos) = bucket.position(id) {
                bucket.peers.remove(pos);
            }
        }
    }

    /// Up to `n` peers with smallest XOR distance to `target`, scanning
    /// buckets outward from the one that would hold `target` itself.
    pub fn find_closest(&self, target: &Id, n: usize) -> Vec<Peer> {
        let mut all: Vec<(Distance, Peer)> = self
            .buckets
            .iter()
            .flat_map(|b| b.peers.iter())
            .map(|p| (target.distance(&p.id), *p))
            .collect();
        all.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.addr.cmp(&b.1.addr)));
        all.truncate(n);
        all.into_iter().map(|(_, p)| p).collect()
    }

    pub fn len(&self) -> usize {
        self.buckets.iter().map(|b| b.peers.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;

    fn peer_with_bucket(table: &RoutingTable, bucket: usize) -> Peer {
        // Search for an id whose distance to local_id has exactly `bucket`
        // leading zero bits, by flipping the bit at that position.
        let mut bytes = *table.local_id.as_bytes();
        let byte_index = bucket / 8;
        let bit_index = 7 - (bucket % 8);
        bytes[byte_index] ^= 1 << bit_index;
        let addr: SocketAddr = "127.0.0.1:1".parse().unwrap();
        Peer::new(Id::from_bytes(bytes), addr)
    }

    #[test]
    fn observe_inserts_new_peer() {
        let local = Id::random();
        let mut table = RoutingTable::new(local, 20);
        let peer = peer_with_bucket(&table, 100);
        assert!(matches!(table.observe(peer), Some(Observed::Inserted)));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn observe_local_id_is_ignored() {
        let local = Id::random();
        let mut table = RoutingTable::new(local, 20);
        let peer = Peer::new(local, "127.0.0.1:1".parse().unwrap());
        assert!(table.observe(peer).is_none());
        assert_eq!(table.len(), 0);
    }

    #[test]
    fn bucket_has_bounded_size() {
        let local = Id::random();
        let mut table = RoutingTable::new(local, 2);
        let bucket = 150;
        for i in 0..2 {
            let mut peer = peer_with_bucket(&table, bucket);
            peer.addr = format!("127.0.0.1:{}", 2000 + i).parse().unwrap();
            // distinct ids landing in the same bucket
            let mut bytes = *peer.id.as_bytes();
            bytes[19] ^= i as u8;
            peer.id = Id::from_bytes(bytes);
            assert!(matches!(table.observe(peer), Some(Observed::Inserted)));
        }
        let extra = peer_with_bucket(&table, bucket);
        match table.observe(extra) {
            Some(Observed::BucketFull { bucket: b, .. }) => assert_eq!(b, bucket),
            other => panic!("expected BucketFull, got {other:?}"),
        }
    }

    #[test]
    fn find_closest_orders_by_distance() {
        let local = Id::random();
        let mut table = RoutingTable::new(local, 20);
        for depth in [10, 50, 159] {
            table.observe(peer_with_bucket(&table, depth));
        }
        let target = local;
        let closest = table.find_closest(&target, 3);
        assert_eq!(closest.len(), 3);
        // the peer at depth 159 differs only in the last bit, so it must
        // be closest to `local`.
        assert_eq!(
            closest[0].id.distance(&target).leading_zero_bits(),
            Some(159)
        );
    }

    #[test]
    fn eviction_keeps_responsive_head_and_drops_candidate() {
        let local = Id::random();
        let mut table = RoutingTable::new(local, 1);
        let bucket = 80;
        let head = peer_with_bucket(&table, bucket);
        table.observe(head);
        let mut candidate = peer_with_bucket(&table, bucket);
        candidate.id = {
            let mut bytes = *candidate.id.as_bytes();
            bytes[19] ^= 1;
            Id::from_bytes(bytes)
        };
        table.resolve_eviction(bucket, true, candidate);
        assert_eq!(table.len(), 1);
        assert!(table.buckets[bucket].position(&head.id).is_some());
    }

    #[test]
    fn eviction_replaces_unresponsive_head_with_candidate() {
        let local = Id::random();
        let mut table = RoutingTable::new(local, 1);
        let bucket = 80;
        let head = peer_with_bucket(&table, bucket);
        table.observe(head);
        let mut candidate = peer_with_bucket(&table, bucket);
        candidate.id = {
            let mut bytes = *candidate.id.as_bytes();
            bytes[19] ^= 1;
            Id::from_bytes(bytes)
        };
        table.resolve_eviction(bucket, false, candidate);
        assert_eq!(table.len(), 1);
        assert!(table.buckets[bucket].position(&candidate.id).is_some());
    }

    #[test]
    fn remove_drops_peer() {
        let local = Id::random();
        let mut table = RoutingTable::new(local, 20);
        let peer = peer_with_bucket(&table, 42);
        table.observe(peer);
        table.remove(&peer.id);
        assert_eq!(table.len(), 0);
    }
}
