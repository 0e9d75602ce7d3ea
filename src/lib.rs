mod actor;
mod api;
mod commitlog;
mod config;
mod gateway;
mod replica;
mod transport;

pub use api::create_root_logger_for_file;
pub use api::create_root_logger_for_stdout;
pub use api::try_create_server;
pub use api::RaftOptions;
pub use api::RaftServerConfig;
pub use api::RaftServerHandle;
pub use api::ServerCreationError;
pub use api::ShellStateMachine;
pub use commitlog::Index;
pub use config::ClusterConfig;
pub use config::ConfigError;
pub use config::PeerInfo;
pub use config::ServerInfo;
pub use gateway::ClientError;
pub use gateway::RaftClient;
pub use gateway::RaftClientConfig;
pub use gateway::CLIENT_RETRY_DELAY;
pub use gateway::MAX_CLIENT_RETRIES;
pub use replica::ElectionStateChangeListener;
pub use replica::ElectionStateSnapshot;
pub use replica::NoOpStateMachine;
pub use replica::ServerId;
pub use replica::StateMachine;
pub use replica::StateMachineOutput;
pub use replica::Term;

// Learning 1: `create::{root_mod}` should not have any code. Just `mod` and `pub use` statements.
// Learning 2: All `mod` statements, anywhere, should not be `pub`. Only export `pub` via individual
//             use statements.
//
// This keeps the `crate::{root_mod}` root_mod only responsible for exporting types to the rest of
// crate, and allows me to organize my root_mod impl however I want.
