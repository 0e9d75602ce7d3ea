use crate::commitlog::Index;
use crate::replica::ServerId;
use std::collections::BTreeMap;

/// Volatile per-peer replication progress. Rebuilt from scratch every time we become leader.
pub(crate) struct LeaderStateTracker {
    peer_state: BTreeMap<ServerId, PeerState>,
}

impl LeaderStateTracker {
    pub(super) fn new(peer_ids: Vec<ServerId>, my_last_index: Index) -> Self {
        let peer_state = peer_ids
            .into_iter()
            .map(|peer_id| (peer_id, PeerState::new(my_last_index)))
            .collect();

        LeaderStateTracker { peer_state }
    }

    pub(crate) fn peer_state(&self, peer_id: ServerId) -> Option<&PeerState> {
        self.peer_state.get(&peer_id)
    }

    pub(crate) fn peer_state_mut(&mut self, peer_id: ServerId) -> Option<&mut PeerState> {
        self.peer_state.get_mut(&peer_id)
    }

    /// Highest index replicated on a majority, counting me as having everything up to
    /// `my_last_index`. Says nothing about whether that index is safe to commit; the caller must
    /// still check the entry's term.
    pub(crate) fn cluster_commit_index(&self, my_last_index: Index) -> Index {
        let peers_matched = self.peer_state.values().map(|ps| ps.matched()).collect();
        Self::cluster_commit_index_impl(peers_matched).unwrap_or(my_last_index)
    }

    // Returns None only when there are no peers.
    fn cluster_commit_index_impl(mut peers_matched_indexes: Vec<Index>) -> Option<Index> {
        if peers_matched_indexes.is_empty() {
            return None;
        }
        peers_matched_indexes.sort();

        // Overview of why algo is correct:
        // We are always at the tail of the array, because our log is same/longest.
        // 1. add "me"
        //let cluster_size = peers_matched_indexes.len() + 1;
        // 2. calculate majority
        //let majority = (cluster_size / 2) + 1;
        // 3. subtract "me"
        //let num_peers_to_achieve_majority = majority - 1;
        // 4. take `i`th index from the right
        //let quorum_idx = peers_matched_indexes.len() - num_peers_to_achieve_majority;
        //
        // Which simplifies to this. When in doubt, read the unit tests.
        let quorum_idx = peers_matched_indexes.len() / 2;

        Some(peers_matched_indexes.swap_remove(quorum_idx))
    }
}

pub(crate) struct PeerState {
    // > index of the next log entry to send to that server
    // > (initialized to leader last log index + 1)
    next: Index,
    // > index of highest log entry known to be replicated on server
    // > (initialized to 0, increases monotonically)
    matched: Index,
}

impl PeerState {
    fn new(my_last_index: Index) -> Self {
        PeerState {
            next: my_last_index.plus(1),
            matched: Index::start_index(),
        }
    }

    /// The index to send next, and the index of the entry just before it.
    pub(crate) fn next_and_previous_log_index(&self) -> (Index, Index) {
        // `next` never drops below 1, because index 0 is the placeholder every log agrees on.
        let previous = self.next.checked_minus(1).unwrap_or_else(Index::start_index);
        (self.next, previous)
    }

    pub(crate) fn next(&self) -> Index {
        self.next
    }

    pub(crate) fn matched(&self) -> Index {
        self.matched
    }

    /// Peer acknowledged everything up to `appended_index`. Returns true if `matched` moved.
    ///
    /// Responses can arrive out of order or duplicated, so an older acknowledgement is ignored.
    pub(crate) fn handle_success(&mut self, appended_index: Index) -> bool {
        if appended_index <= self.matched {
            return false;
        }

        self.matched = appended_index;
        if self.next <= appended_index {
            self.next = appended_index.plus(1);
        }
        true
    }

    /// Peer rejected the AppendEntries whose first new entry would have been `rejected_index`.
    /// Returns true if `next` moved back.
    pub(crate) fn handle_rejection(&mut self, rejected_index: Index) -> bool {
        // Only step back once per rejection of what we currently consider `next`. A rejection
        // for anything else is a stale reply we already acted on.
        if rejected_index != self.next {
            return false;
        }
        // The peer can't be missing what it already acknowledged.
        if self.next <= self.matched.plus(1) {
            return false;
        }

        match self.next.checked_minus(1) {
            Some(new_next) => {
                self.next = new_next;
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_commit_checker_logic() {
        fn run(expected: u64, matches: Vec<u64>) {
            let matches = matches.into_iter().map(Index::new).collect();
            let expected = Some(Index::new(expected));

            assert_eq!(expected, LeaderStateTracker::cluster_commit_index_impl(matches));
        }

        // 3-cluster
        run(0, vec![0, 0]);
        run(9, vec![0, 9]);
        run(9, vec![8, 9]);

        // 4-cluster
        run(0, vec![0, 0, 0]);
        run(0, vec![0, 0, 9]);
        run(8, vec![0, 8, 9]);
        run(8, vec![7, 8, 9]);

        // 5-cluster
        run(0, vec![0, 0, 0, 0]);
        run(0, vec![0, 0, 0, 9]);
        run(8, vec![0, 0, 8, 9]);
        run(8, vec![0, 7, 8, 9]);
        run(8, vec![6, 7, 8, 9]);

        // 6-cluster
        run(0, vec![0, 0, 0, 0, 0]);
        run(0, vec![0, 0, 0, 0, 9]);
        run(0, vec![0, 0, 0, 8, 9]);
        run(7, vec![0, 0, 7, 8, 9]);
        run(7, vec![0, 6, 7, 8, 9]);
        run(7, vec![5, 6, 7, 8, 9]);

        // 7-cluster
        run(0, vec![0, 0, 0, 0, 0, 0]);
        run(0, vec![0, 0, 0, 0, 0, 9]);
        run(0, vec![0, 0, 0, 0, 8, 9]);
        run(7, vec![0, 0, 0, 7, 8, 9]);
        run(7, vec![0, 0, 6, 7, 8, 9]);
        run(7, vec![0, 5, 6, 7, 8, 9]);
        run(7, vec![4, 5, 6, 7, 8, 9]);

        // Ordering doesn't matter
        run(9, vec![9, 8]);
        run(8, vec![7, 9, 8]);
        run(8, vec![6, 0, 8, 9]);
        run(7, vec![9, 8, 0, 0, 7]);
    }

    #[test]
    fn single_node_commits_own_log() {
        let tracker = LeaderStateTracker::new(vec![], Index::new(4));
        assert_eq!(tracker.cluster_commit_index(Index::new(4)), Index::new(4));
    }

    #[test]
    fn new_peer_state_points_past_my_log() {
        let tracker = LeaderStateTracker::new(vec![ServerId(1)], Index::new(5));
        let peer = tracker.peer_state(ServerId(1)).unwrap();

        assert_eq!(peer.next_and_previous_log_index(), (Index::new(6), Index::new(5)));
        assert_eq!(peer.matched(), Index::new(0));
    }

    #[test]
    fn success_only_ratchets_forward() {
        let mut peer = PeerState::new(Index::new(3));

        assert!(peer.handle_success(Index::new(4)));
        assert_eq!((peer.next(), peer.matched()), (Index::new(5), Index::new(4)));

        // Duplicate or reordered replies.
        assert!(!peer.handle_success(Index::new(4)));
        assert!(!peer.handle_success(Index::new(2)));
        assert_eq!((peer.next(), peer.matched()), (Index::new(5), Index::new(4)));
    }

    #[test]
    fn heartbeat_success_sets_matched_without_moving_next_backwards() {
        let mut peer = PeerState::new(Index::new(3));

        // Heartbeat with prev=3 and no entries acknowledges up to 3.
        assert!(peer.handle_success(Index::new(3)));
        assert_eq!((peer.next(), peer.matched()), (Index::new(4), Index::new(3)));
    }

    #[test]
    fn rejection_steps_back_once() {
        let mut peer = PeerState::new(Index::new(5));
        assert_eq!(peer.next(), Index::new(6));

        assert!(peer.handle_rejection(Index::new(6)));
        assert_eq!(peer.next(), Index::new(5));

        // Same rejection delivered twice.
        assert!(!peer.handle_rejection(Index::new(6)));
        assert_eq!(peer.next(), Index::new(5));

        assert!(peer.handle_rejection(Index::new(5)));
        assert_eq!(peer.next(), Index::new(4));
    }

    #[test]
    fn rejection_never_goes_below_matched() {
        let mut peer = PeerState::new(Index::new(3));
        peer.handle_success(Index::new(3));
        assert_eq!(peer.next(), Index::new(4));

        assert!(!peer.handle_rejection(Index::new(4)));
        assert_eq!(peer.next(), Index::new(4));
    }

    #[test]
    fn rejection_never_goes_below_first_entry() {
        let mut peer = PeerState::new(Index::new(0));
        assert_eq!(peer.next(), Index::new(1));

        assert!(!peer.handle_rejection(Index::new(1)));
        assert_eq!(peer.next_and_previous_log_index(), (Index::new(1), Index::new(0)));
    }
}
