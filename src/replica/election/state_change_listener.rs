use crate::replica::{ServerId, Term};
use tokio::sync::watch;

/// A point-in-time view of a replica's election state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ElectionStateSnapshot {
    Leader { term: Term },
    Candidate { term: Term },
    Follower { term: Term, leader: ServerId },
    FollowerNoLeader { term: Term },
}

impl ElectionStateSnapshot {
    pub fn term(&self) -> Term {
        match self {
            ElectionStateSnapshot::Leader { term }
            | ElectionStateSnapshot::Candidate { term }
            | ElectionStateSnapshot::Follower { term, .. }
            | ElectionStateSnapshot::FollowerNoLeader { term } => *term,
        }
    }

    pub fn is_leader(&self) -> bool {
        matches!(self, ElectionStateSnapshot::Leader { .. })
    }
}

pub(super) fn new(initial_state: ElectionStateSnapshot) -> (ElectionStateChangeNotifier, ElectionStateChangeListener) {
    let (snd, rcv) = watch::channel(initial_state);

    (ElectionStateChangeNotifier { snd }, ElectionStateChangeListener { rcv })
}

pub(super) struct ElectionStateChangeNotifier {
    snd: watch::Sender<ElectionStateSnapshot>,
}

impl ElectionStateChangeNotifier {
    pub(super) fn notify_new_state(&self, new_state: ElectionStateSnapshot) {
        // Only wake listeners on an actual change.
        self.snd.send_if_modified(|current| {
            if *current == new_state {
                false
            } else {
                *current = new_state;
                true
            }
        });
    }
}

/// Observes a replica's election state. Only the latest state is kept; a slow listener skips
/// intermediate states.
#[derive(Clone)]
pub struct ElectionStateChangeListener {
    rcv: watch::Receiver<ElectionStateSnapshot>,
}

impl ElectionStateChangeListener {
    /// Waits for the next change. `None` once the replica is gone.
    pub async fn next(&mut self) -> Option<ElectionStateSnapshot> {
        match self.rcv.changed().await {
            Ok(_) => Some(*self.rcv.borrow()),
            Err(_) => None,
        }
    }

    pub fn current(&self) -> ElectionStateSnapshot {
        *self.rcv.borrow()
    }
}
