mod client;
mod protocol;
mod tcp_gateway;

pub use client::ClientError;
pub use client::RaftClient;
pub use client::RaftClientConfig;
pub use client::CLIENT_RETRY_DELAY;
pub use client::MAX_CLIENT_RETRIES;

pub(crate) use tcp_gateway::TcpClientGateway;
