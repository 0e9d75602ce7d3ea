use crate::actor::WeakActorClient;
use crate::commitlog::Index;
use crate::replica::election::state_change_listener::{self, ElectionStateChangeNotifier};
use crate::replica::election::timers::{ElectionTimerHandle, LeaderTimerHandle};
use crate::replica::election::LeaderStateTracker;
use crate::replica::{ElectionStateChangeListener, ElectionStateSnapshot, ServerId, Term};
use std::collections::HashSet;
use std::fmt;
use std::time::Duration;

#[derive(Clone)]
pub(crate) struct ElectionConfig {
    pub my_id: ServerId,
    pub leader_heartbeat_duration: Duration,
    pub election_min_timeout: Duration,
    pub election_max_timeout: Duration,
}

/// ElectionState is responsible for holding state specific to the stage in an election. Its
/// methods are responsible for "what" to do. It is NOT responsible for validating anything
/// specific to logs, terms, peers, etc. or knowing "when" to do something.
///
/// Every state owns its timer. Replacing the state drops the old timer, which stops its task.
pub(crate) struct ElectionState {
    state: State,
    // Only used for reporting. Durable local state is the source of truth for the term.
    term: Term,
    config: ElectionConfig,
    actor_client: WeakActorClient,
    state_change_notifier: ElectionStateChangeNotifier,
}

impl ElectionState {
    /// Every replica starts out as a follower that doesn't know the leader.
    pub(crate) fn new_follower(
        config: ElectionConfig,
        actor_client: WeakActorClient,
        term: Term,
    ) -> (Self, ElectionStateChangeListener) {
        let initial_state = State::Follower(FollowerState::new(None, &config, actor_client.clone()));
        let (notifier, listener) = state_change_listener::new(Self::snapshot(&initial_state, term));

        let election_state = Self {
            state: initial_state,
            term,
            config,
            actor_client,
            state_change_notifier: notifier,
        };

        (election_state, listener)
    }

    pub(crate) fn transition_to_follower(&mut self, term: Term, leader: Option<ServerId>) {
        self.term = term;
        self.state = State::Follower(FollowerState::new(leader, &self.config, self.actor_client.clone()));
        self.notify_new_state();
    }

    pub(crate) fn transition_to_candidate_and_vote_for_self(&mut self, term: Term) {
        let mut cs = CandidateState::new(&self.config, self.actor_client.clone());
        cs.add_received_vote(self.config.my_id);

        self.term = term;
        self.state = State::Candidate(cs);
        self.notify_new_state();
    }

    pub(crate) fn transition_to_leader(&mut self, term: Term, peer_ids: Vec<ServerId>, my_last_index: Index) {
        self.term = term;
        self.state = State::Leader(LeaderState {
            tracker: LeaderStateTracker::new(peer_ids, my_last_index),
            leader_timer: LeaderTimerHandle::spawn_timer_task(
                self.config.leader_heartbeat_duration,
                self.actor_client.clone(),
                term,
            ),
        });
        self.notify_new_state();
    }

    pub(crate) fn current_state(&self) -> ElectionStateSnapshot {
        Self::snapshot(&self.state, self.term)
    }

    fn snapshot(state: &State, term: Term) -> ElectionStateSnapshot {
        match state {
            State::Leader(_) => ElectionStateSnapshot::Leader { term },
            State::Candidate(_) => ElectionStateSnapshot::Candidate { term },
            State::Follower(FollowerState { leader: None, .. }) => ElectionStateSnapshot::FollowerNoLeader { term },
            State::Follower(FollowerState {
                leader: Some(leader), ..
            }) => ElectionStateSnapshot::Follower { term, leader: *leader },
        }
    }

    fn notify_new_state(&self) {
        self.state_change_notifier.notify_new_state(self.current_state());
    }

    pub(crate) fn is_leader(&self) -> bool {
        matches!(self.state, State::Leader(_))
    }

    pub(crate) fn is_candidate(&self) -> bool {
        matches!(self.state, State::Candidate(_))
    }

    /// Only a follower knows who the leader is. A leader should ask itself.
    pub(crate) fn leader_id(&self) -> Option<ServerId> {
        match &self.state {
            State::Follower(fs) => fs.leader,
            _ => None,
        }
    }

    pub(crate) fn reset_timeout_if_follower(&mut self) {
        if let State::Follower(fs) = &mut self.state {
            fs.election_timer.reset_timeout();
        }
    }

    /// True if an election timeout event should be acted upon. Timer events can be queued behind
    /// the heartbeat that reset them.
    pub(crate) fn election_timer_expired(&self) -> bool {
        match &self.state {
            State::Leader(_) => false,
            State::Candidate(cs) => cs.election_timer.is_expired(),
            State::Follower(fs) => fs.election_timer.is_expired(),
        }
    }

    /// Returns true if we learned who the leader is.
    pub(crate) fn set_leader_if_unknown(&mut self, leader: ServerId) -> bool {
        if let State::Follower(fs) = &mut self.state {
            if fs.leader.is_none() {
                fs.leader.replace(leader);
                self.notify_new_state();
                return true;
            }
        }
        false
    }

    /// Return number of votes received if candidate, or None if no longer Candidate.
    pub(crate) fn add_vote_if_candidate(&mut self, vote_from: ServerId) -> Option<usize> {
        if let State::Candidate(cs) = &mut self.state {
            Some(cs.add_received_vote(vote_from))
        } else {
            None
        }
    }

    pub(crate) fn leader_state(&self) -> Option<&LeaderStateTracker> {
        if let State::Leader(ls) = &self.state {
            Some(&ls.tracker)
        } else {
            None
        }
    }

    pub(crate) fn leader_state_mut(&mut self) -> Option<&mut LeaderStateTracker> {
        if let State::Leader(ls) = &mut self.state {
            Some(&mut ls.tracker)
        } else {
            None
        }
    }

    pub(crate) fn reset_heartbeat_timer_if_leader(&self) {
        if let State::Leader(ls) = &self.state {
            ls.leader_timer.reset_heartbeat_timer();
        }
    }
}

impl fmt::Debug for ElectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.state {
            State::Leader(_) => write!(f, "Leader(Term={:?})", self.term),
            State::Candidate(cs) => write!(
                f,
                "Candidate(Term={:?}, Votes={})",
                self.term,
                cs.received_votes_from.len()
            ),
            State::Follower(FollowerState { leader: Some(leader), .. }) => {
                write!(f, "Follower(Term={:?}, Leader={:?})", self.term, leader)
            }
            State::Follower(FollowerState { leader: None, .. }) => {
                write!(f, "Follower(Term={:?}, Leader=None)", self.term)
            }
        }
    }
}

enum State {
    Leader(LeaderState),
    Candidate(CandidateState),
    Follower(FollowerState),
}

struct LeaderState {
    tracker: LeaderStateTracker,
    leader_timer: LeaderTimerHandle,
}

struct CandidateState {
    received_votes_from: HashSet<ServerId>,
    election_timer: ElectionTimerHandle,
}

struct FollowerState {
    leader: Option<ServerId>,
    election_timer: ElectionTimerHandle,
}

impl CandidateState {
    fn new(config: &ElectionConfig, actor_client: WeakActorClient) -> Self {
        Self {
            received_votes_from: HashSet::with_capacity(3),
            election_timer: ElectionTimerHandle::spawn_timer_task(
                config.election_min_timeout,
                config.election_max_timeout,
                actor_client,
            ),
        }
    }

    /// `add_received_vote()` returns the number of unique votes we've received after adding the
    /// provided `vote_from`
    fn add_received_vote(&mut self, vote_from: ServerId) -> usize {
        self.received_votes_from.insert(vote_from);
        self.received_votes_from.len()
    }
}

impl FollowerState {
    fn new(leader: Option<ServerId>, config: &ElectionConfig, actor_client: WeakActorClient) -> Self {
        Self {
            leader,
            election_timer: ElectionTimerHandle::spawn_timer_task(
                config.election_min_timeout,
                config.election_max_timeout,
                actor_client,
            ),
        }
    }
}
