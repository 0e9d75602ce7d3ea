use crate::gateway::protocol::{self, ServerReply};
use bytes::Bytes;
use rand::seq::SliceRandom;
use std::io;
use std::net::SocketAddrV4;
use std::time::Duration;
use tokio::net::TcpStream;

pub const MAX_CLIENT_RETRIES: usize = 30;
pub const CLIENT_RETRY_DELAY: Duration = Duration::from_secs(3);

// A server holds connections while it figures out who the leader is. Don't wait on it forever.
const DEFAULT_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("Too many retries")]
    TooManyRetries,
    #[error("Cluster config lists no servers")]
    NoServers,
}

#[derive(Clone, Debug)]
pub struct RaftClientConfig {
    /// Client address of every server in the cluster.
    pub servers: Vec<SocketAddrV4>,
    pub max_retries: usize,
    pub retry_delay: Duration,
    pub attempt_timeout: Duration,
}

impl RaftClientConfig {
    pub fn new(servers: Vec<SocketAddrV4>) -> Self {
        RaftClientConfig {
            servers,
            max_retries: MAX_CLIENT_RETRIES,
            retry_delay: CLIENT_RETRY_DELAY,
            attempt_timeout: DEFAULT_ATTEMPT_TIMEOUT,
        }
    }
}

/// RaftClient finds the leader by following redirects, and submits one command per connection.
///
/// Commands are executed at least once. A command whose connection breaks may have been applied
/// anyway, and will be applied again by the retry.
pub struct RaftClient {
    logger: slog::Logger,
    config: RaftClientConfig,
    // Last server that gave us an answer, or that we were redirected to.
    leader: Option<SocketAddrV4>,
}

enum Attempt {
    Done(Bytes),
    Redirect(Option<SocketAddrV4>),
    Failed(io::Error),
}

impl RaftClient {
    pub fn new(logger: slog::Logger, config: RaftClientConfig) -> Self {
        RaftClient {
            logger,
            config,
            leader: None,
        }
    }

    pub async fn send_command(&mut self, command: Bytes) -> Result<Bytes, ClientError> {
        let mut target = match self.leader {
            Some(leader) => leader,
            None => self.random_server()?,
        };

        for attempt in 1..=self.config.max_retries {
            slog::debug!(self.logger, "Attempt {} against {}", attempt, target);

            match self.try_once(target, &command).await {
                Attempt::Done(response) => {
                    self.leader = Some(target);
                    return Ok(response);
                }
                // Redirects are free, no need to wait.
                Attempt::Redirect(Some(leader)) if leader != target => {
                    slog::debug!(self.logger, "Redirected from {} to {}", target, leader);
                    target = leader;
                }
                Attempt::Redirect(hint) => {
                    slog::debug!(self.logger, "{} doesn't know the leader ({:?})", target, hint);
                    target = self.random_server()?;
                    tokio::time::sleep(self.config.retry_delay).await;
                }
                Attempt::Failed(e) => {
                    slog::debug!(self.logger, "Request to {} failed: {:?}", target, e);
                    target = self.random_server()?;
                    tokio::time::sleep(self.config.retry_delay).await;
                }
            }
        }

        self.leader = None;
        Err(ClientError::TooManyRetries)
    }

    async fn try_once(&self, target: SocketAddrV4, command: &[u8]) -> Attempt {
        let attempt = async {
            let mut stream = TcpStream::connect(target).await?;
            stream.set_nodelay(true)?;
            protocol::write_message(&mut stream, command).await?;
            protocol::read_reply(&mut stream).await
        };

        match tokio::time::timeout(self.config.attempt_timeout, attempt).await {
            Ok(Ok(ServerReply::Response(response))) => Attempt::Done(response),
            Ok(Ok(ServerReply::Redirect(leader))) => Attempt::Redirect(leader),
            Ok(Err(e)) => Attempt::Failed(e),
            Err(_) => Attempt::Failed(io::Error::new(io::ErrorKind::TimedOut, "no reply from server")),
        }
    }

    fn random_server(&self) -> Result<SocketAddrV4, ClientError> {
        self.config
            .servers
            .choose(&mut rand::thread_rng())
            .copied()
            .ok_or(ClientError::NoServers)
    }
}
