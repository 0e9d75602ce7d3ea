//! Runs one server of a raft cluster that executes replicated shell commands.
//!
//! ```bash
//! raft --id 0 --config config --data-dir /tmp/raft
//! ```
use clap::Parser;
use raft::{ClusterConfig, RaftOptions, RaftServerConfig, ServerId, ShellStateMachine};
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Parser, Debug)]
#[command(author, version, about = "Run a raft server")]
struct Args {
    /// This server's id: its line in the config file, counting from 0
    #[arg(long)]
    id: u32,

    /// Cluster config file, one line per server: <ip> <client_port> <peer_port>...
    #[arg(long, default_value = "config")]
    config: PathBuf,

    /// Directory for the log, cursor, and term/vote files
    #[arg(long, default_value = ".")]
    data_dir: PathBuf,

    /// Delete this server's storage before starting
    #[arg(long)]
    reset: bool,

    /// Write logs to a timestamped file under this directory instead of the terminal
    #[arg(long)]
    log_dir: Option<PathBuf>,

    /// Log at debug level
    #[arg(long, conflicts_with = "quiet")]
    debug: bool,

    /// Only log warnings and errors
    #[arg(long)]
    quiet: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let level = if args.debug {
        slog::Level::Debug
    } else if args.quiet {
        slog::Level::Warning
    } else {
        slog::Level::Info
    };
    let logger = match &args.log_dir {
        Some(log_dir) => match raft::create_root_logger_for_file(log_dir, args.id, level) {
            Ok(logger) => logger,
            Err(e) => {
                eprintln!("Failed to create log file in {:?}: {}", log_dir, e);
                return ExitCode::FAILURE;
            }
        },
        None => raft::create_root_logger_for_stdout(level),
    };

    let cluster_config = match ClusterConfig::load(&args.config) {
        Ok(cluster_config) => cluster_config,
        Err(e) => {
            slog::crit!(logger, "{}", error_chain(&e));
            return ExitCode::FAILURE;
        }
    };

    let server = raft::try_create_server(RaftServerConfig {
        logger: logger.clone(),
        my_id: ServerId(args.id),
        cluster_config,
        data_directory: args.data_dir,
        reset_storage: args.reset,
        state_machine: Box::new(ShellStateMachine::new(logger.new(slog::o!("ServerId" => args.id)))),
        options: RaftOptions::default(),
    })
    .await;
    let server = match server {
        Ok(server) => server,
        Err(e) => {
            slog::crit!(logger, "Failed to start server: {}", error_chain(&e));
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = tokio::signal::ctrl_c().await {
        slog::error!(logger, "Failed to listen for Ctrl-C: {:?}", e);
    }
    slog::info!(logger, "Shutting down");
    server.shutdown().await;

    ExitCode::SUCCESS
}

fn error_chain(e: &dyn std::error::Error) -> String {
    let mut message = e.to_string();
    let mut source = e.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }

    message
}
