//! Interactive client. Every line typed is sent to the cluster as one command, and the leader's
//! output is printed once the command has been applied.
use bytes::Bytes;
use clap::Parser;
use raft::{ClientError, ClusterConfig, RaftClient, RaftClientConfig};
use std::path::PathBuf;
use std::process::ExitCode;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

#[derive(Parser, Debug)]
#[command(author, version, about = "Send commands to a raft cluster")]
struct Args {
    /// Cluster config file, same one the servers use
    #[arg(long, default_value = "config")]
    config: PathBuf,

    /// Log at debug level
    #[arg(long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let level = if args.debug {
        slog::Level::Debug
    } else {
        slog::Level::Warning
    };
    let logger = raft::create_root_logger_for_stdout(level);

    let cluster_config = match ClusterConfig::load(&args.config) {
        Ok(cluster_config) => cluster_config,
        Err(e) => {
            eprintln!("{}", e);
            return ExitCode::FAILURE;
        }
    };
    let mut client = RaftClient::new(logger, RaftClientConfig::new(cluster_config.client_addresses()));

    let mut stdout = tokio::io::stdout();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        if prompt(&mut stdout).await.is_err() {
            return ExitCode::FAILURE;
        }
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                eprintln!("Failed to read stdin: {}", e);
                return ExitCode::FAILURE;
            }
        };
        let command = line.trim();
        if command.is_empty() {
            continue;
        }

        match client.send_command(Bytes::from(command.to_string())).await {
            Ok(response) => {
                if stdout.write_all(&response).await.is_err() || stdout.flush().await.is_err() {
                    return ExitCode::FAILURE;
                }
            }
            Err(ClientError::TooManyRetries) => eprintln!("too many retries"),
            Err(e) => {
                eprintln!("{}", e);
                return ExitCode::FAILURE;
            }
        }
    }

    ExitCode::SUCCESS
}

async fn prompt(stdout: &mut tokio::io::Stdout) -> std::io::Result<()> {
    stdout.write_all(b"> ").await?;
    stdout.flush().await
}
