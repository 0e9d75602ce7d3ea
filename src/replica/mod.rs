mod client_gateway;
mod election;
mod local_state;
mod log_entry;
mod messages;
mod peers;
mod raft_log;
mod replica;
mod replica_api;
mod state_machine;

#[cfg(test)]
mod simulation;

pub use client_gateway::ClientGateway;
pub use election::ElectionStateChangeListener;
pub use election::ElectionStateSnapshot;
pub use local_state::FileLocalState;
pub use local_state::PersistentLocalState;
pub use local_state::Term;
pub use local_state::VolatileLocalState;
pub use log_entry::RaftLogEntry;
pub use peers::Peer;
pub use peers::PeerSender;
pub use peers::ServerId;
pub use replica::Replica;
pub use replica::ReplicaConfig;
pub use replica_api::ClientCommandError;
pub use replica_api::ClientCommandInput;
pub use replica_api::ClientCommandOutput;
pub use replica_api::LeaderRedirectInfo;
pub use state_machine::NoOpStateMachine;
pub use state_machine::StateMachine;
pub use state_machine::StateMachineOutput;

pub(crate) use replica_api::LeaderTimerTick;
