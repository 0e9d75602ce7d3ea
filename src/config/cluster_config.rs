use crate::replica::ServerId;
use std::fs;
use std::io;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::path::{Path, PathBuf};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path:?}")]
    Unreadable {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Line {line}: invalid IPv4 address {value:?}")]
    BadIp { line: usize, value: String },
    #[error("Line {line}: invalid port {value:?}")]
    BadPort { line: usize, value: String },
    #[error("Line {line}: missing client port")]
    MissingClientPort { line: usize },
    #[error("Line {line}: expected {expected} peer ports, found {found}")]
    WrongPeerPortCount { line: usize, expected: usize, found: usize },
    #[error("Config does not list any servers")]
    NoServers,
    #[error("Server {0} is not in the cluster config")]
    UnknownServerId(u32),
}

/// One line of the config file.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServerInfo {
    pub ip: Ipv4Addr,
    pub client_port: u16,
    /// One listen port per other server, in id order with this server left out.
    pub peer_ports: Vec<u16>,
}

/// Everything one server needs to set up its link to one peer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PeerInfo {
    pub id: ServerId,
    pub client_address: SocketAddrV4,
    /// We accept the peer's connection here.
    pub my_listen_port: u16,
    pub dest_ip: Ipv4Addr,
    /// The peer accepts our connection here.
    pub dest_port: u16,
}

/// ClusterConfig is the static membership of the cluster. A server's id is its line position,
/// counting only lines that describe a server.
///
/// ```text
/// # <ip> <client_port> <peer_listen_port> ...
/// 127.0.0.1 5000 5010 5011
/// 127.0.0.1 5001 5012 5013
/// 127.0.0.1 5002 5014 5015
/// ```
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClusterConfig {
    servers: Vec<ServerInfo>,
}

impl ClusterConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path.as_ref()).map_err(|source| ConfigError::Unreadable {
            path: path.as_ref().to_path_buf(),
            source,
        })?;

        Self::parse(&contents)
    }

    pub fn parse(contents: &str) -> Result<Self, ConfigError> {
        let mut servers = vec![];
        let mut line_numbers = vec![];
        for (i, line) in contents.lines().enumerate() {
            let line_number = i + 1;
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            servers.push(Self::parse_line(line_number, line)?);
            line_numbers.push(line_number);
        }

        if servers.is_empty() {
            return Err(ConfigError::NoServers);
        }

        let expected = servers.len() - 1;
        for (server, line) in servers.iter().zip(line_numbers) {
            if server.peer_ports.len() != expected {
                return Err(ConfigError::WrongPeerPortCount {
                    line,
                    expected,
                    found: server.peer_ports.len(),
                });
            }
        }

        Ok(ClusterConfig { servers })
    }

    fn parse_line(line: usize, contents: &str) -> Result<ServerInfo, ConfigError> {
        let mut tokens = contents.split_whitespace();

        // Never empty, we skip blank lines.
        let ip_token = tokens.next().unwrap_or_default();
        let ip = ip_token.parse().map_err(|_| ConfigError::BadIp {
            line,
            value: ip_token.to_string(),
        })?;
        let client_port = match tokens.next() {
            Some(token) => parse_port(line, token)?,
            None => return Err(ConfigError::MissingClientPort { line }),
        };
        let peer_ports = tokens
            .map(|token| parse_port(line, token))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(ServerInfo {
            ip,
            client_port,
            peer_ports,
        })
    }

    pub fn num_servers(&self) -> usize {
        self.servers.len()
    }

    pub fn server_ids(&self) -> impl Iterator<Item = ServerId> {
        (0..self.servers.len() as u32).map(ServerId)
    }

    pub fn server(&self, id: ServerId) -> Result<&ServerInfo, ConfigError> {
        self.servers
            .get(id.as_u32() as usize)
            .ok_or(ConfigError::UnknownServerId(id.as_u32()))
    }

    pub fn client_address(&self, id: ServerId) -> Result<SocketAddrV4, ConfigError> {
        let server = self.server(id)?;
        Ok(SocketAddrV4::new(server.ip, server.client_port))
    }

    pub fn client_addresses(&self) -> Vec<SocketAddrV4> {
        self.servers
            .iter()
            .map(|server| SocketAddrV4::new(server.ip, server.client_port))
            .collect()
    }

    /// Peer links for server `my_id`, ordered by peer id.
    pub fn peers_of(&self, my_id: ServerId) -> Result<Vec<PeerInfo>, ConfigError> {
        let me = self.server(my_id)?;

        let mut peers = vec![];
        for peer_id in self.server_ids().filter(|id| *id != my_id) {
            let peer = self.server(peer_id)?;
            peers.push(PeerInfo {
                id: peer_id,
                client_address: SocketAddrV4::new(peer.ip, peer.client_port),
                my_listen_port: me.peer_ports[position_among_peers(my_id, peer_id)],
                dest_ip: peer.ip,
                dest_port: peer.peer_ports[position_among_peers(peer_id, my_id)],
            });
        }

        Ok(peers)
    }
}

fn parse_port(line: usize, token: &str) -> Result<u16, ConfigError> {
    token.parse().map_err(|_| ConfigError::BadPort {
        line,
        value: token.to_string(),
    })
}

/// Where `peer` sits in `owner`'s list of peers, which is every id except `owner`'s own.
fn position_among_peers(owner: ServerId, peer: ServerId) -> usize {
    if peer < owner {
        peer.as_u32() as usize
    } else {
        peer.as_u32() as usize - 1
    }
}
