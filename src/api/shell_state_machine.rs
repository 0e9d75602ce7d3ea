use crate::replica::{StateMachine, StateMachineOutput};
use bytes::Bytes;
use std::process::{Command, Stdio};

/// ShellStateMachine runs every committed command as a process and returns what it printed.
///
/// The command line is split on whitespace, with no shell in between: no quoting, pipes, or
/// globbing. The process runs on the replica's event loop, so a slow command stalls the replica.
pub struct ShellStateMachine {
    logger: slog::Logger,
}

impl ShellStateMachine {
    pub fn new(logger: slog::Logger) -> Self {
        ShellStateMachine { logger }
    }
}

impl StateMachine for ShellStateMachine {
    fn apply_committed_entry(&mut self, entry: Bytes) -> StateMachineOutput {
        let command_line = String::from_utf8_lossy(&entry);
        let mut tokens = command_line.split_whitespace();
        let program = match tokens.next() {
            Some(program) => program,
            None => return StateMachineOutput::NoData,
        };

        let output = Command::new(program)
            .args(tokens)
            .stdin(Stdio::null())
            .stderr(Stdio::inherit())
            .output();

        match output {
            Ok(output) => {
                slog::debug!(self.logger, "Ran {:?}: {}", command_line, output.status);
                StateMachineOutput::Data(Bytes::from(output.stdout))
            }
            Err(e) => {
                slog::info!(self.logger, "Failed to run {:?}: {:?}", command_line, e);
                StateMachineOutput::Data(Bytes::from(format!("Command not found: {}\n", program)))
            }
        }
    }
}
