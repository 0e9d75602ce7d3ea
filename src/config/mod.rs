mod cluster_config;

pub use cluster_config::ClusterConfig;
pub use cluster_config::ConfigError;
pub use cluster_config::PeerInfo;
pub use cluster_config::ServerInfo;
