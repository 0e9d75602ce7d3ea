use crate::actor::{ActorClient, PeerInbox, ReplicaActor};
use crate::api::options::RaftOptionsValidated;
use crate::commitlog::PersistentLog;
use crate::config::{ClusterConfig, ConfigError};
use crate::gateway::TcpClientGateway;
use crate::replica::{
    ElectionStateChangeListener, FileLocalState, Peer, Replica, ReplicaConfig, ServerId, StateMachine,
};
use crate::transport::{self, PeerLink, PeerLinkConfig, ShutdownHandle};
use crate::RaftOptions;
use std::convert::TryFrom;
use std::fs;
use std::io;
use std::net::SocketAddrV4;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::task::JoinHandle;

pub struct RaftServerConfig {
    pub logger: slog::Logger,
    pub my_id: ServerId,
    pub cluster_config: ClusterConfig,
    /// Directory for this server's log, cursor, and state files. Created if missing.
    pub data_directory: PathBuf,
    /// Delete any existing storage files before starting.
    pub reset_storage: bool,
    pub state_machine: Box<dyn StateMachine + Send>,
    pub options: RaftOptions,
}

#[derive(Debug, thiserror::Error)]
pub enum ServerCreationError {
    #[error("Invalid cluster config")]
    InvalidClusterConfig(#[from] ConfigError),
    #[error("Illegal options for configuring server: {0}")]
    IllegalOptions(String),
    #[error("Storage initialization failure")]
    StorageInitialization(#[source] io::Error),
    #[error("Failed to listen for clients on port {port}")]
    ClientPortUnavailable {
        port: u16,
        #[source]
        source: io::Error,
    },
}

/// RaftServerHandle keeps a running server alive. Dropping it stops the server without waiting;
/// use [`RaftServerHandle::shutdown`] to wait for everything to wind down.
pub struct RaftServerHandle {
    logger: slog::Logger,
    my_id: ServerId,
    client_address: SocketAddrV4,
    election_state_listener: ElectionStateChangeListener,
    actor_client: Option<ActorClient>,
    actor_task: Option<JoinHandle<()>>,
    gateway_shutdown_handle: Option<ShutdownHandle>,
    gateway_task: Option<JoinHandle<()>>,
    peer_links: Vec<Arc<PeerLink>>,
}

pub async fn try_create_server(config: RaftServerConfig) -> Result<RaftServerHandle, ServerCreationError> {
    let logger = config.logger.new(slog::o!("ServerId" => config.my_id.as_u32()));

    let options = RaftOptionsValidated::try_from(config.options)
        .map_err(|e| ServerCreationError::IllegalOptions(e.to_string()))?;

    let cluster_config = config.cluster_config;
    let my_info = cluster_config.server(config.my_id)?.clone();
    let client_address = cluster_config.client_address(config.my_id)?;
    let peer_infos = cluster_config.peers_of(config.my_id)?;

    let storage_prefix = storage_prefix(&config.data_directory, config.my_id);
    if config.reset_storage {
        slog::info!(logger, "Resetting storage at {:?}", storage_prefix);
        reset_storage(&storage_prefix).map_err(ServerCreationError::StorageInitialization)?;
    }
    fs::create_dir_all(&config.data_directory).map_err(ServerCreationError::StorageInitialization)?;
    let log = PersistentLog::open_or_create(logger.clone(), &storage_prefix)
        .map_err(ServerCreationError::StorageInitialization)?;
    let local_state =
        FileLocalState::open_or_create(&storage_prefix).map_err(ServerCreationError::StorageInitialization)?;

    let client_listener =
        TcpClientGateway::bind(my_info.client_port).map_err(|source| ServerCreationError::ClientPortUnavailable {
            port: my_info.client_port,
            source,
        })?;

    let (actor_client, actor_queue_rx) = ActorClient::new(options.actor_queue_size);

    let mut peers = Vec::with_capacity(peer_infos.len());
    let mut peer_links = Vec::with_capacity(peer_infos.len());
    for peer_info in peer_infos {
        let link = Arc::new(PeerLink::spawn(
            logger.clone(),
            PeerLinkConfig {
                my_listen_port: peer_info.my_listen_port,
                dest_ip: peer_info.dest_ip,
                dest_port: peer_info.dest_port,
                connect_timeout: options.peer_connect_timeout,
                rebind_delay: options.peer_rebind_delay,
            },
            PeerInbox::new(peer_info.id, actor_client.weak()),
        ));
        peers.push(Peer {
            id: peer_info.id,
            client_address: peer_info.client_address,
            sender: Box::new(link.clone()),
        });
        peer_links.push(link);
    }

    let (gateway, gateway_control) = TcpClientGateway::new(logger.clone(), actor_client.clone());

    let (replica, election_state_listener) = Replica::new(ReplicaConfig {
        logger: logger.clone(),
        my_id: config.my_id,
        peers,
        log,
        local_state,
        state_machine: config.state_machine,
        client_gateway: Box::new(gateway_control),
        actor_client: actor_client.weak(),
        leader_heartbeat_duration: options.leader_heartbeat_duration,
        election_min_timeout: options.election_min_timeout,
        election_max_timeout: options.election_max_timeout,
    })
    .map_err(ServerCreationError::StorageInitialization)?;

    let actor_task = tokio::spawn(ReplicaActor::new(actor_queue_rx, replica).run_event_loop());

    let (gateway_shutdown_handle, gateway_shutdown_signal) = transport::shutdown_signal();
    let gateway_task = tokio::spawn(gateway.run(client_listener, gateway_shutdown_signal));

    slog::info!(logger, "Server started. Serving clients on {}", client_address);

    Ok(RaftServerHandle {
        logger,
        my_id: config.my_id,
        client_address,
        election_state_listener,
        actor_client: Some(actor_client),
        actor_task: Some(actor_task),
        gateway_shutdown_handle: Some(gateway_shutdown_handle),
        gateway_task: Some(gateway_task),
        peer_links,
    })
}

impl RaftServerHandle {
    pub fn my_id(&self) -> ServerId {
        self.my_id
    }

    pub fn client_address(&self) -> SocketAddrV4 {
        self.client_address
    }

    pub fn election_state_listener(&self) -> ElectionStateChangeListener {
        self.election_state_listener.clone()
    }

    /// Stop accepting clients, stop the replica, then close every peer link.
    pub async fn shutdown(mut self) {
        self.gateway_shutdown_handle.take();
        if let Some(task) = self.gateway_task.take() {
            let _ = task.await;
        }

        // The event loop ends once the last strong client is gone. Connection handlers drop theirs
        // as soon as they see the shutdown signal.
        self.actor_client.take();
        if let Some(task) = self.actor_task.take() {
            let _ = task.await;
        }

        // The replica held the other reference to each link.
        for link in self.peer_links.drain(..) {
            match Arc::try_unwrap(link) {
                Ok(link) => link.shutdown().await,
                Err(_) => slog::warn!(self.logger, "Peer link still in use, dropping without waiting"),
            }
        }

        slog::info!(self.logger, "Server shut down");
    }
}

/// Every storage file of server `id` starts with this.
fn storage_prefix(data_directory: &Path, id: ServerId) -> PathBuf {
    data_directory.join(format!("server_{}", id.as_u32()))
}

pub(crate) fn reset_storage(storage_prefix: &Path) -> io::Result<()> {
    PersistentLog::<crate::replica::RaftLogEntry>::remove_files(storage_prefix)?;
    FileLocalState::remove_file(storage_prefix)
}
