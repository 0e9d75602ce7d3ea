//! This mod is meant to hold most of the code for the library's server-facing API.
mod logging;
mod options;
mod shell_state_machine;
mod wiring;

pub use logging::create_root_logger_for_file;
pub use logging::create_root_logger_for_stdout;
pub use options::RaftOptions;
pub use shell_state_machine::ShellStateMachine;
pub use wiring::try_create_server;
pub use wiring::RaftServerConfig;
pub use wiring::RaftServerHandle;
pub use wiring::ServerCreationError;
