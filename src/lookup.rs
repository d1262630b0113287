//! Pure candidate-set bookkeeping for an iterative lookup. Holds no
//! reference to a transport or dispatcher: [`crate::session`] drives the
//! network side and feeds results back in through `on_*` methods, which
//! keeps this module unit-testable without sockets.

use std::collections::HashSet;

use crate::id::{Distance, Id};
use crate::peer::Peer;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum CandidateStatus {
    Fresh,
    InFlight,
    Responded,
    Failed,
}

#[derive(Clone, Debug)]
struct Candidate {
    peer: Peer,
    distance: Distance,
    status: CandidateStatus,
}

/// State of one iterative `find_closest_peers` or `find_value` search.
pub struct Lookup {
    target: Id,
    alpha: usize,
    k: usize,
    candidates: Vec<Candidate>,
    seen: HashSet<Id>,
    found_value: Option<Vec<u8>>,
}

impl Lookup {
    pub fn new(target: Id, seeds: Vec<Peer>, alpha: usize, k: usize) -> Self {
        let mut lookup = Lookup {
            target,
            alpha,
            k,
            candidates: Vec::new(),
            seen: HashSet::new(),
            found_value: None,
        };
        lookup.add_candidates(seeds);
        lookup
    }

    fn add_candidates(&mut self, peers: Vec<Peer>) {
        let mut inserted_closer = false;
        for peer in peers {
            if self.seen.insert(peer.id) {
                let distance = self.target.distance(&peer.id);
                inserted_closer = true;
                self.candidates.push(Candidate {
                    peer,
                    distance,
                    status: CandidateStatus::Fresh,
                });
            }
        }
        if inserted_closer {
            self.candidates
                .sort_by(|a, b| a.distance.cmp(&b.distance).then_with(|| a.peer.addr.cmp(&b.peer.addr)));
        }
    }

    /// Selects up to `alpha` fresh candidates to query, marking them
    /// in-flight. Always drawn from the closest end of the candidate set.
    pub fn next_batch(&mut self) -> Vec<Peer> {
        let in_flight = self
            .candidates
            .iter()
            .filter(|c| c.status == CandidateStatus::InFlight)
            .count();
        let mut budget = self.alpha.saturating_sub(in_flight);
        let mut batch = Vec::new();
        for candidate in self.candidates.iter_mut() {
            if budget == 0 {
                break;
            }
            if candidate.status == CandidateStatus::Fresh {
                candidate.status = CandidateStatus::InFlight;
                batch.push(candidate.peer);
                budget -= 1;
            }
        }
        batch
    }

    pub fn on_peers_response(&mut self, from: Id, discovered: Vec<Peer>) {
        self.mark(from, CandidateStatus::Responded);
        self.add_candidates(discovered);
    }

    pub fn on_value_response(&mut self, from: Id, value: Vec<u8>) {
        self.mark(from, CandidateStatus::Responded);
        self.found_value = Some(value);
    }

    pub fn on_failure(&mut self, from: Id) {
        self.mark(from, CandidateStatus::Failed);
    }

    fn mark(&mut self, id: Id, status: CandidateStatus) {
        if let Some(candidate) = self.candidates.iter_mut().find(|c| c.peer.id == id) {
            candidate.status = status;
        }
    }

    pub fn target(&self) -> Id {
        self.target
    }

    pub fn found_value(self) -> Option<Vec<u8>> {
        self.found_value
    }

    pub fn has_outstanding(&self) -> bool {
        self.candidates
            .iter()
            .any(|c| c.status == CandidateStatus::InFlight)
    }

    /// The search has converged once the `k` closest known candidates are
    /// all resolved (responded or failed) and none remain fresh, or a
    /// value has already been found.
    pub fn is_converged(&self) -> bool {
        if self.found_value.is_some() {
            return true;
        }
        self.candidates
            .iter()
            .take(self.k)
            .all(|c| matches!(c.status, CandidateStatus::Responded | CandidateStatus::Failed))
    }

    pub fn closest_responded(&self, n: usize) -> Vec<Peer> {
        self.candidates
            .iter()
            .filter(|c| c.status == CandidateStatus::Responded)
            .take(n)
            .map(|c| c.peer)
            .collect()
    }

    /// The smallest distance among candidates that have actually
    /// responded so far; used to assert lookup monotonicity.
    pub fn min_responded_distance(&self) -> Option<Distance> {
        self.candidates
            .iter()
            .filter(|c| c.status == CandidateStatus::Responded)
            .map(|c| c.distance)
            .min()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;

    fn peer(byte: u8) -> Peer {
        let mut bytes = [0u8; crate::id::ID_LEN];
        bytes[0] = byte;
        let addr: SocketAddr = format!("127.0.0.1:{}", 1000 + byte as u16).parse().unwrap();
        Peer::new(Id::from_bytes(bytes), addr)
    }

    #[test]
    fn next_batch_respects_alpha() {
        let target = Id::from_bytes([0xFFu8; crate::id::ID_LEN]);
        let seeds = vec![peer(1), peer(2), peer(3), peer(4)];
        let mut lookup = Lookup::new(target, seeds, 2, 20);
        let batch = lookup.next_batch();
        assert_eq!(batch.len(), 2);
        // nothing further should be offered until a slot frees up.
        assert!(lookup.next_batch().is_empty());
    }

    #[test]
    fn responding_frees_a_slot_for_more_candidates() {
        let target = Id::from_bytes([0xFFu8; crate::id::ID_LEN]);
        let seeds = vec![peer(1), peer(2)];
        let mut lookup = Lookup::new(target, seeds, 1, 20);
        let batch = lookup.next_batch();
        assert_eq!(batch.len(), 1);
        lookup.on_peers_response(batch[0].id, vec![]);
        let next = lookup.next_batch();
        assert_eq!(next.len(), 1);
    }

    #[test]
    fn converges_when_all_top_k_resolved() {
        let target = Id::from_bytes([0xFFu8; crate::id::ID_LEN]);
        let seeds = vec![peer(1), peer(2)];
        let mut lookup = Lookup::new(target, seeds, 2, 2);
        let batch = lookup.next_batch();
        assert!(!lookup.is_converged());
        for p in batch {
            lookup.on_peers_response(p.id, vec![]);
        }
        assert!(lookup.is_converged());
    }

    #[test]
    fn value_response_converges_immediately() {
        let target = Id::from_bytes([0xFFu8; crate::id::ID_LEN]);
        let seeds = vec![peer(1), peer(2), peer(3)];
        let mut lookup = Lookup::new(target, seeds, 3, 20);
        let batch = lookup.next_batch();
        lookup.on_value_response(batch[0].id, b"found".to_vec());
        assert!(lookup.is_converged());
        assert_eq!(lookup.found_value(), Some(b"found".to_vec()));
    }

    #[test]
    fn discovered_peers_are_deduplicated() {
        let target = Id::from_bytes([0xFFu8; crate::id::ID_LEN]);
        let seeds = vec![peer(1)];
        let mut lookup = Lookup::new(target, seeds, 1, 20);
        let batch = lookup.next_batch();
        lookup.on_peers_response(batch[0].id, vec![peer(1), peer(2)]);
        // peer(1) is already seen (it was the seed itself); only peer(2) is new.
        assert_eq!(lookup.candidates.len(), 2);
    }

    #[test]
    fn failed_candidate_is_never_requeried() {
        let target = Id::from_bytes([0xFFu8; crate::id::ID_LEN]);
        let seeds = vec![peer(1)];
        let mut lookup = Lookup::new(target, seeds, 1, 20);
        let batch = lookup.next_batch();
        lookup.on_failure(batch[0].id);
        assert!(lookup.next_batch().is_empty());
    }

    #[test]
    fn monotonic_minimum_distance_never_increases() {
        let target = Id::from_bytes([0xFFu8; crate::id::ID_LEN]);
        let seeds = vec![peer(1), peer(200)];
        let mut lookup = Lookup::new(target, seeds, 2, 20);
        let batch = lookup.next_batch();
        let mut last_min = None;
        for p in batch {
            lookup.on_peers_response(p.id, vec![]);
            let current = lookup.min_responded_distance();
            if let (Some(prev), Some(cur)) = (last_min, current) {
                assert!(cur <= prev);
            }
            last_min = current;
        }
    }
}
