use crate::actor::WeakActorClient;
use crate::commitlog::{Index, Log};
use crate::replica::client_gateway::ClientGateway;
use crate::replica::election::{ElectionConfig, ElectionState};
use crate::replica::local_state::{PersistentLocalState, Term};
use crate::replica::messages::{MessageKind, PeerMessage, WireLogEntry};
use crate::replica::peers::{ClusterTracker, Peer, ServerId};
use crate::replica::raft_log::RaftLog;
use crate::replica::replica_api::{ClientCommandError, ClientCommandInput, ClientCommandOutput, LeaderTimerTick};
use crate::replica::state_machine::StateMachine;
use crate::replica::{ElectionStateChangeListener, ElectionStateSnapshot, LeaderRedirectInfo, RaftLogEntry};
use bytes::Bytes;
use prost::Message;
use std::{cmp, io};
use tokio::time::Duration;

pub struct ReplicaConfig<L, S>
where
    L: Log<RaftLogEntry>,
    S: PersistentLocalState,
{
    pub logger: slog::Logger,
    pub my_id: ServerId,
    pub peers: Vec<Peer>,
    pub log: L,
    pub local_state: S,
    pub state_machine: Box<dyn StateMachine + Send>,
    pub client_gateway: Box<dyn ClientGateway>,
    pub actor_client: WeakActorClient,
    pub leader_heartbeat_duration: Duration,
    pub election_min_timeout: Duration,
    pub election_max_timeout: Duration,
}

/// Replica is the raft state machine for a single server. Every method runs to completion on the
/// actor's event loop, one at a time, so nothing in here needs locking.
pub struct Replica<L, S>
where
    L: Log<RaftLogEntry>,
    S: PersistentLocalState,
{
    logger: slog::Logger,
    cluster: ClusterTracker,
    local_state: S,
    election_state: ElectionState,
    raft_log: RaftLog<L>,
    state_machine: Box<dyn StateMachine + Send>,
    client_gateway: Box<dyn ClientGateway>,
}

impl<L, S> Replica<L, S>
where
    L: Log<RaftLogEntry>,
    S: PersistentLocalState,
{
    pub fn new(config: ReplicaConfig<L, S>) -> Result<(Self, ElectionStateChangeListener), io::Error> {
        let raft_log = RaftLog::new(config.logger.clone(), config.log, config.local_state.last_applied())?;
        let (election_state, listener) = ElectionState::new_follower(
            ElectionConfig {
                my_id: config.my_id,
                leader_heartbeat_duration: config.leader_heartbeat_duration,
                election_min_timeout: config.election_min_timeout,
                election_max_timeout: config.election_max_timeout,
            },
            config.actor_client,
            config.local_state.current_term(),
        );

        slog::info!(
            config.logger,
            "Starting as follower. Term: {:?}, latest log entry: {:?}, last applied: {:?}",
            config.local_state.current_term(),
            raft_log.latest_entry(),
            raft_log.last_applied_index(),
        );

        let replica = Replica {
            logger: config.logger,
            cluster: ClusterTracker::new(config.my_id, config.peers),
            local_state: config.local_state,
            election_state,
            raft_log,
            state_machine: config.state_machine,
            client_gateway: config.client_gateway,
        };

        Ok((replica, listener))
    }

    // ---------------------------------------------------------------------------------------------
    // Peer messages
    // ---------------------------------------------------------------------------------------------

    pub fn handle_peer_message(&mut self, from: ServerId, payload: Bytes) {
        let message = match PeerMessage::decode(payload) {
            Ok(message) => message,
            Err(e) => {
                slog::warn!(self.logger, "Dropping undecodable message from {:?}: {:?}", from, e);
                return;
            }
        };
        if !self.cluster.contains_peer(from) || message.sender_id != from.as_u32() {
            slog::warn!(
                self.logger,
                "Dropping message from {:?} claiming to be from {}",
                from,
                message.sender_id
            );
            return;
        }
        let kind = match message.message_kind() {
            Some(kind) => kind,
            None => {
                slog::warn!(self.logger, "Dropping message of unknown kind {} from {:?}", message.kind, from);
                return;
            }
        };

        // > If RPC request or response contains term T > currentTerm:
        // > set currentTerm = T, convert to follower (§5.1)
        let message_term = Term::new(message.term);
        if message_term > self.local_state.current_term() {
            if let Err(e) = self.local_state.set_term_and_vote(message_term, None) {
                slog::error!(self.logger, "Failed to persist term {:?}, dropping message: {:?}", message_term, e);
                return;
            }
            // Only a leader sends AppendEntries, so we know who the leader is.
            let leader = if kind == MessageKind::AppendEntriesRequest {
                Some(from)
            } else {
                None
            };
            self.election_state.transition_to_follower(message_term, leader);
            // The sender is plausibly the new leader, or about to become it.
            self.client_gateway
                .start_redirecting(self.cluster.leader_redirect_info(from));
            slog::info!(
                self.logger,
                "Observed increased term in {:?} from {:?}. Election state: {:?}",
                kind,
                from,
                self.election_state
            );
        }

        match kind {
            MessageKind::AppendEntriesRequest => self.handle_append_entries_request(from, message),
            MessageKind::AppendEntriesResponse => self.handle_append_entries_response(from, message),
            MessageKind::RequestVoteRequest => self.handle_request_vote_request(from, message),
            MessageKind::RequestVoteResponse => self.handle_request_vote_response(from, message),
        }
    }

    fn handle_append_entries_request(&mut self, leader_id: ServerId, request: PeerMessage) {
        let current_term = self.local_state.current_term();
        let prev_log_index = Index::new(request.prev_log_index);
        let rejected_index = prev_log_index.plus(1);

        // 1. Reply false if term < currentTerm (§5.1)
        if Term::new(request.term) < current_term {
            slog::debug!(self.logger, "Rejecting AppendEntries from {:?}, stale term {}", leader_id, request.term);
            self.reply_append_entries(leader_id, false, rejected_index);
            return;
        }

        // Same term from here on.
        if self.election_state.is_leader() {
            slog::error!(
                self.logger,
                "Received AppendEntries from {:?} while I'm leader of the same term {:?}",
                leader_id,
                current_term
            );
            self.reply_append_entries(leader_id, false, rejected_index);
            return;
        }
        if self.election_state.is_candidate() {
            // Someone else won this term's election.
            self.election_state.transition_to_follower(current_term, Some(leader_id));
            self.client_gateway
                .start_redirecting(self.cluster.leader_redirect_info(leader_id));
            slog::info!(self.logger, "Lost election. Election state: {:?}", self.election_state);
        } else if self.election_state.set_leader_if_unknown(leader_id) {
            self.client_gateway
                .start_redirecting(self.cluster.leader_redirect_info(leader_id));
            slog::info!(self.logger, "Discovered leader. Election state: {:?}", self.election_state);
        }

        self.election_state.reset_timeout_if_follower();

        // 2. Reply false if [my] log doesn't contain an entry at [leader's]
        // prevLogIndex whose term matches [leader's] prevLogTerm (§5.3)
        match self.raft_log.term_at(prev_log_index) {
            Ok(Some(term)) if term == Term::new(request.prev_log_term) => {}
            Ok(opt_term) => {
                slog::debug!(
                    self.logger,
                    "Log mismatch at {:?}: mine {:?}, leader's {}",
                    prev_log_index,
                    opt_term,
                    request.prev_log_term
                );
                self.reply_append_entries(leader_id, false, rejected_index);
                return;
            }
            Err(e) => {
                slog::error!(self.logger, "Failed to read log at {:?}: {:?}", prev_log_index, e);
                self.reply_append_entries(leader_id, false, rejected_index);
                return;
            }
        }

        let num_entries = request.entries.len() as u64;
        if let Err(e) = self.append_new_entries(prev_log_index, request.entries) {
            slog::error!(self.logger, "Failed to write AppendEntries to log: {:?}", e);
            self.reply_append_entries(leader_id, false, rejected_index);
            return;
        }
        let last_new_index = prev_log_index.plus(num_entries);

        // 5. If leaderCommit > commitIndex, set commitIndex =
        // min(leaderCommit, index of last new entry)
        let new_commit_index = cmp::min(Index::new(request.leader_commit), last_new_index);
        if self.raft_log.ratchet_fwd_commit_index_if_increased(new_commit_index) {
            self.apply_committed_entries();
        }

        self.reply_append_entries(leader_id, true, last_new_index);
    }

    fn append_new_entries(&mut self, prev_log_index: Index, entries: Vec<WireLogEntry>) -> Result<(), io::Error> {
        let mut next_entry_index = prev_log_index.plus(1);
        for new_entry in entries {
            let new_entry_term = Term::new(new_entry.term);

            // 3. If [my] existing entry conflicts with [leader's new entries]
            // (same index but different terms), delete [my] existing entry and
            // all that follow it (§5.3)
            // 4. Append any new entries not already in the log
            match self.raft_log.term_at(next_entry_index)? {
                Some(existing_term) if existing_term == new_entry_term => {
                    next_entry_index = next_entry_index.plus(1);
                    continue;
                }
                Some(_) => self.raft_log.truncate(next_entry_index)?,
                None => {}
            }

            let appended_index = self.raft_log.append(RaftLogEntry {
                term: new_entry_term,
                data: new_entry.command,
            })?;
            assert_eq!(
                appended_index, next_entry_index,
                "Appended log entry to unexpected index."
            );

            next_entry_index = next_entry_index.plus(1);
        }

        Ok(())
    }

    fn reply_append_entries(&self, to: ServerId, success: bool, appended_log_index: Index) {
        let mut reply = PeerMessage::new(
            MessageKind::AppendEntriesResponse,
            self.local_state.current_term().as_u64(),
            self.cluster.my_id().as_u32(),
        );
        reply.success = success;
        reply.appended_log_index = appended_log_index.as_u64();

        self.cluster.send(to, &reply);
    }

    fn handle_append_entries_response(&mut self, peer_id: ServerId, reply: PeerMessage) {
        let logger = self.logger.new(slog::o!("Peer" => peer_id.as_u32()));
        if Term::new(reply.term) < self.local_state.current_term() {
            slog::debug!(logger, "Ignoring AppendEntries reply from old term {}", reply.term);
            return;
        }

        let my_last_index = self.raft_log.last_index();
        let appended_index = Index::new(reply.appended_log_index);

        let (progressed, peer_next) = {
            let peer_state = match self.election_state.leader_state_mut() {
                None => {
                    slog::debug!(logger, "No longer leader");
                    return;
                }
                Some(leader_state) => match leader_state.peer_state_mut(peer_id) {
                    Some(peer_state) => peer_state,
                    None => {
                        slog::warn!(logger, "Peer not found while handling AppendEntries reply");
                        return;
                    }
                },
            };

            let progressed = if reply.success {
                // Don't panic here, because peer could return garbage data.
                if appended_index > my_last_index {
                    slog::warn!(
                        logger,
                        "Peer claims to have {:?} but my log ends at {:?}",
                        appended_index,
                        my_last_index
                    );
                    return;
                }
                peer_state.handle_success(appended_index)
            } else {
                slog::debug!(logger, "Peer rejected entry {:?}", appended_index);
                peer_state.handle_rejection(appended_index)
            };

            (progressed, peer_state.next())
        };

        if progressed && reply.success {
            // > If there exists an N such that N > commitIndex, a majority
            // > of matchIndex[i] ≥ N, and log[N].term == currentTerm:
            // > set commitIndex = N (§5.3, §5.4).
            self.check_for_committed_entries();
        }

        // > If last log index ≥ nextIndex for a follower: send
        // > AppendEntries RPC with log entries starting at nextIndex
        if progressed && peer_next <= my_last_index {
            self.send_append_entries(peer_id);
        }
    }

    fn handle_request_vote_request(&mut self, candidate_id: ServerId, request: PeerMessage) {
        let current_term = self.local_state.current_term();

        // 1. Reply false if term < currentTerm (§5.1)
        let vote_granted = if Term::new(request.term) < current_term {
            slog::info!(self.logger, "Not granting vote to {:?}. Candidate term is out of date.", candidate_id);
            false
        } else {
            self.decide_vote(candidate_id, &request)
        };

        let mut reply = PeerMessage::new(
            MessageKind::RequestVoteResponse,
            current_term.as_u64(),
            self.cluster.my_id().as_u32(),
        );
        reply.vote_granted = vote_granted;
        self.cluster.send(candidate_id, &reply);
    }

    fn decide_vote(&mut self, candidate_id: ServerId, request: &PeerMessage) -> bool {
        // 2. If votedFor is null or candidateId, and candidate’s log is at
        // least as up-to-date as receiver’s log, grant vote (§5.2, §5.4).
        let voted_for = self.local_state.voted_for();
        if let Some(voted_for) = voted_for {
            if voted_for != candidate_id {
                slog::info!(self.logger, "Not granting vote to {:?}. Already voted for {:?}.", candidate_id, voted_for);
                return false;
            }
        }

        // > Raft determines which of two logs is more up-to-date
        // > by comparing the index and term of the last entries in the
        // > logs. If the logs have last entries with different terms, then
        // > the log with the later term is more up-to-date. If the logs
        // > end with the same term, then whichever log is longer is
        // > more up-to-date.
        let candidate_last_entry = (Term::new(request.last_log_term), Index::new(request.last_log_index));
        if candidate_last_entry < self.raft_log.latest_entry() {
            slog::info!(self.logger, "Not granting vote to {:?}. Candidate log is out of date.", candidate_id);
            return false;
        }

        if voted_for.is_none() {
            let current_term = self.local_state.current_term();
            if let Err(e) = self.local_state.set_term_and_vote(current_term, Some(candidate_id)) {
                slog::error!(self.logger, "Failed to persist vote for {:?}: {:?}", candidate_id, e);
                return false;
            }
        }

        self.election_state.reset_timeout_if_follower();
        slog::info!(self.logger, "Voting for {:?}.", candidate_id);
        true
    }

    fn handle_request_vote_response(&mut self, peer_id: ServerId, reply: PeerMessage) {
        let current_term = self.local_state.current_term();
        if Term::new(reply.term) != current_term {
            slog::debug!(self.logger, "Ignoring vote reply from term {}", reply.term);
            return;
        }
        if !reply.vote_granted {
            slog::info!(self.logger, "Vote not granted from {:?} for term {:?}", peer_id, current_term);
            return;
        }

        let num_votes_received = match self.election_state.add_vote_if_candidate(peer_id) {
            Some(v) => v,
            None => {
                slog::debug!(
                    self.logger,
                    "Received vote after election concluded. Election state: {:?}",
                    self.election_state
                );
                return;
            }
        };

        slog::info!(
            self.logger,
            "Received {}/{} votes for term {:?}",
            num_votes_received,
            self.cluster.num_voting_members(),
            current_term,
        );
        if num_votes_received >= self.cluster.majority() {
            self.become_leader();
        }
    }

    // ---------------------------------------------------------------------------------------------
    // Timers
    // ---------------------------------------------------------------------------------------------

    pub fn handle_election_timeout(&mut self) {
        if !self.election_state.election_timer_expired() {
            slog::debug!(self.logger, "Ignoring stale election timeout");
            return;
        }

        self.start_election();
    }

    pub(crate) fn start_election(&mut self) {
        // Write-ahead: persist our vote before acting as a candidate.
        let new_term = match self
            .local_state
            .increment_term_and_vote_for_self(self.cluster.my_id())
        {
            Ok(term) => term,
            Err(e) => {
                slog::error!(self.logger, "Failed to persist new term, not starting election: {:?}", e);
                return;
            }
        };
        self.election_state.transition_to_candidate_and_vote_for_self(new_term);
        self.client_gateway.start_redirecting(None);
        slog::info!(
            self.logger,
            "Election timeout. Became candidate. Election state: {:?}",
            self.election_state
        );

        if self.cluster.majority() <= 1 {
            self.become_leader();
            return;
        }

        let (last_log_term, last_log_index) = self.raft_log.latest_entry();
        let mut request = PeerMessage::new(
            MessageKind::RequestVoteRequest,
            new_term.as_u64(),
            self.cluster.my_id().as_u32(),
        );
        request.last_log_index = last_log_index.as_u64();
        request.last_log_term = last_log_term.as_u64();

        for peer_id in self.cluster.peer_ids() {
            self.cluster.send(peer_id, &request);
        }
    }

    fn become_leader(&mut self) {
        let term = self.local_state.current_term();
        self.election_state
            .transition_to_leader(term, self.cluster.peer_ids(), self.raft_log.last_index());
        self.client_gateway.start_serving();
        slog::info!(self.logger, "Won election. Election state: {:?}", self.election_state);

        self.broadcast_append_entries();
        self.check_for_committed_entries();
    }

    pub(crate) fn handle_leader_timer(&mut self, tick: LeaderTimerTick) {
        let current_term = self.local_state.current_term();
        if tick.term != current_term || !self.election_state.is_leader() {
            slog::debug!(self.logger, "Ignoring leader timer for term {:?}", tick.term);
            return;
        }

        self.broadcast_append_entries();
        self.check_for_committed_entries();
    }

    fn broadcast_append_entries(&mut self) {
        for peer_id in self.cluster.peer_ids() {
            self.send_append_entries(peer_id);
        }
        self.election_state.reset_heartbeat_timer_if_leader();
    }

    /// Send the entry at the peer's `next` index, or a heartbeat if it's caught up.
    fn send_append_entries(&mut self, peer_id: ServerId) {
        let (next_index, prev_index) = match self
            .election_state
            .leader_state()
            .and_then(|leader_state| leader_state.peer_state(peer_id))
        {
            Some(peer_state) => peer_state.next_and_previous_log_index(),
            None => return,
        };

        let prev_term = match self.raft_log.term_at(prev_index) {
            Ok(Some(term)) => term,
            Ok(None) => {
                slog::error!(
                    self.logger,
                    "Tracking {:?} for peer {:?}, but entry is missing from log.",
                    prev_index,
                    peer_id
                );
                return;
            }
            Err(e) => {
                slog::error!(self.logger, "Failed to read log entry at index {:?}: {:?}", prev_index, e);
                return;
            }
        };

        // Just send 1 entry at a time.
        let entries = match self.raft_log.read(next_index) {
            Ok(Some(entry)) => vec![WireLogEntry {
                term: entry.term.as_u64(),
                command: entry.data,
            }],
            Ok(None) => Vec::new(),
            Err(e) => {
                slog::error!(self.logger, "Failed to read log entry at index {:?}: {:?}", next_index, e);
                return;
            }
        };

        let mut request = PeerMessage::new(
            MessageKind::AppendEntriesRequest,
            self.local_state.current_term().as_u64(),
            self.cluster.my_id().as_u32(),
        );
        request.prev_log_index = prev_index.as_u64();
        request.prev_log_term = prev_term.as_u64();
        request.leader_commit = self.raft_log.commit_index().as_u64();
        request.entries = entries;

        self.cluster.send(peer_id, &request);
    }

    // ---------------------------------------------------------------------------------------------
    // Commit and apply
    // ---------------------------------------------------------------------------------------------

    fn check_for_committed_entries(&mut self) {
        let tentative_commit_index = match self.election_state.leader_state() {
            Some(leader_state) => leader_state.cluster_commit_index(self.raft_log.last_index()),
            None => return,
        };

        // See also:
        // > Figure 8: A time sequence showing why a leader cannot determine
        // > commitment using log entries from older terms.
        match self
            .raft_log
            .ratchet_fwd_commit_index_if_valid(tentative_commit_index, self.local_state.current_term())
        {
            Ok(true) => self.apply_committed_entries(),
            Ok(false) => {}
            Err(e) => slog::warn!(
                self.logger,
                "IO failure while confirming new commit index {:?}: {:?}",
                tentative_commit_index,
                e
            ),
        }
    }

    // > If commitIndex > lastApplied: increment lastApplied, apply
    // > log[lastApplied] to state machine (§5.3)
    fn apply_committed_entries(&mut self) {
        loop {
            let (index, entry) = match self.raft_log.next_entry_to_apply() {
                Ok(Some(next)) => next,
                Ok(None) => return,
                Err(e) => {
                    slog::error!(self.logger, "Failed to read committed entry: {:?}", e);
                    return;
                }
            };

            let output = self.state_machine.apply_committed_entry(entry.data);
            self.raft_log.mark_applied(index);
            if let Err(e) = self.local_state.set_last_applied(index) {
                // Only costs a re-apply after a restart.
                slog::warn!(self.logger, "Failed to persist last applied index {:?}: {:?}", index, e);
            }
            slog::debug!(self.logger, "Applied entry {:?}", index);

            // Only the leader that appended the entry has a client waiting on it.
            if self.election_state.is_leader() && entry.term == self.local_state.current_term() {
                self.client_gateway.respond_to_client(entry.term, index, output.into_bytes());
            }
        }
    }

    // ---------------------------------------------------------------------------------------------
    // Clients
    // ---------------------------------------------------------------------------------------------

    pub fn handle_client_command(
        &mut self,
        input: ClientCommandInput,
    ) -> Result<ClientCommandOutput, ClientCommandError> {
        if !self.election_state.is_leader() {
            return Err(ClientCommandError::NotLeader(self.leader_redirect_info()));
        }

        // > If command received from client: append entry to local log,
        // > respond after entry applied to state machine (§5.3)
        let term = self.local_state.current_term();
        let index = self
            .raft_log
            .append(RaftLogEntry {
                term,
                data: input.command,
            })
            .map_err(ClientCommandError::LocalIoError)?;

        self.broadcast_append_entries();
        self.check_for_committed_entries();

        Ok(ClientCommandOutput { term, index })
    }

    fn leader_redirect_info(&self) -> Option<LeaderRedirectInfo> {
        self.election_state
            .leader_id()
            .and_then(|leader_id| self.cluster.leader_redirect_info(leader_id))
    }

    pub fn election_state(&self) -> ElectionStateSnapshot {
        self.election_state.current_state()
    }
}

#[cfg(test)]
impl<L, S> Replica<L, S>
where
    L: Log<RaftLogEntry>,
    S: PersistentLocalState,
{
    pub(super) fn current_term(&self) -> Term {
        self.local_state.current_term()
    }

    pub(super) fn voted_for(&self) -> Option<ServerId> {
        self.local_state.voted_for()
    }

    pub(super) fn commit_index(&self) -> Index {
        self.raft_log.commit_index()
    }

    pub(super) fn latest_entry(&self) -> (Term, Index) {
        self.raft_log.latest_entry()
    }

    /// Every entry after the placeholder.
    pub(super) fn log_entries(&mut self) -> Vec<RaftLogEntry> {
        let last_index = self.raft_log.last_index().as_u64();
        (1..=last_index)
            .map(|i| {
                self.raft_log
                    .read(Index::new(i))
                    .unwrap()
                    .expect("entry below last index")
            })
            .collect()
    }

    pub(super) fn append_to_log(&mut self, entry: RaftLogEntry) {
        self.raft_log.append(entry).unwrap();
    }
}
