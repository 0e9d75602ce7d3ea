use crate::commitlog::Index;
use crate::replica::local_state::Term;
use crate::replica::peers::ServerId;
use bytes::Bytes;
use std::io;
use std::net::SocketAddrV4;

#[derive(Debug)]
pub struct ClientCommandInput {
    pub command: Bytes,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClientCommandOutput {
    pub term: Term,
    /// The gateway uses this to match the eventual state machine output to the waiting client.
    pub index: Index,
}

#[derive(Debug, thiserror::Error)]
pub enum ClientCommandError {
    // `None` means we don't know who the leader is. Likely an election is in progress.
    #[error("I'm not leader")]
    NotLeader(Option<LeaderRedirectInfo>),

    #[error("Failed to persist log")]
    LocalIoError(io::Error),

    #[error("Replica actor is dead RIP")]
    ActorExited,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LeaderRedirectInfo {
    pub server_id: ServerId,
    pub client_address: SocketAddrV4,
}

/// LeaderTimerTick is a single tick of a leader's heartbeat timer.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct LeaderTimerTick {
    pub(crate) term: Term,
}
