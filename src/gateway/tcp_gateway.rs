use crate::actor::ActorClient;
use crate::commitlog::Index;
use crate::gateway::protocol;
use crate::replica::{ClientCommandError, ClientCommandInput, ClientGateway, LeaderRedirectInfo, Term};
use crate::transport::ShutdownSignal;
use bytes::Bytes;
use std::collections::{BTreeMap, HashMap};
use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::{oneshot, watch};

// Responses nobody has claimed yet. Only grows if a connection handler dies between submitting a
// command and registering for its response.
const MAX_STASHED_RESPONSES: usize = 1024;

/// What the client port does with a new connection.
#[derive(Clone, Debug, PartialEq)]
pub(crate) enum GatewayMode {
    /// Hold the connection until we know whether we're leader.
    Waiting,
    Serving,
    Redirecting(Option<LeaderRedirectInfo>),
}

/// The replica's side of the client gateway. Cheap to hand out, it only flips the mode and
/// completes pending responses.
pub(crate) struct GatewayControl {
    logger: slog::Logger,
    mode: watch::Sender<GatewayMode>,
    pending: Arc<Mutex<PendingResponses>>,
}

impl ClientGateway for GatewayControl {
    fn start_serving(&self) {
        slog::info!(self.logger, "Serving clients");
        self.mode.send_replace(GatewayMode::Serving);
    }

    fn start_redirecting(&self, leader: Option<LeaderRedirectInfo>) {
        slog::info!(self.logger, "Redirecting clients to {:?}", leader);
        self.mode.send_replace(GatewayMode::Redirecting(leader));
        // Whoever was waiting on us will find the new leader themselves.
        lock(&self.pending).clear();
    }

    fn respond_to_client(&self, term: Term, index: Index, response: Bytes) {
        lock(&self.pending).complete((term, index), response);
    }
}

/// TcpClientGateway accepts client connections on the server's client port and runs one task per
/// connection.
pub(crate) struct TcpClientGateway {
    logger: slog::Logger,
    actor_client: ActorClient,
    mode: watch::Receiver<GatewayMode>,
    pending: Arc<Mutex<PendingResponses>>,
}

impl TcpClientGateway {
    pub(crate) fn new(logger: slog::Logger, actor_client: ActorClient) -> (Self, GatewayControl) {
        let logger = logger.new(slog::o!("Gateway" => "client"));
        let (mode_tx, mode_rx) = watch::channel(GatewayMode::Waiting);
        let pending = Arc::new(Mutex::new(PendingResponses::default()));

        let control = GatewayControl {
            logger: logger.clone(),
            mode: mode_tx,
            pending: pending.clone(),
        };
        let gateway = TcpClientGateway {
            logger,
            actor_client,
            mode: mode_rx,
            pending,
        };

        (gateway, control)
    }

    pub(crate) fn bind(port: u16) -> io::Result<TcpListener> {
        let socket = TcpSocket::new_v4()?;
        socket.set_reuseaddr(true)?;
        socket.bind(SocketAddr::from((Ipv4Addr::UNSPECIFIED, port)))?;
        socket.listen(128)
    }

    pub(crate) async fn run(self, listener: TcpListener, mut shutdown_signal: ShutdownSignal) {
        loop {
            let accepted = tokio::select! {
                _ = shutdown_signal.wait() => break,
                accepted = listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, remote_addr)) => {
                    slog::debug!(self.logger, "Client connection from {}", remote_addr);
                    let handler = ConnectionHandler {
                        logger: self.logger.new(slog::o!("Client" => remote_addr.to_string())),
                        actor_client: self.actor_client.clone(),
                        mode: self.mode.clone(),
                        pending: self.pending.clone(),
                    };
                    let mut shutdown_signal = shutdown_signal.clone();
                    tokio::spawn(async move {
                        tokio::select! {
                            _ = shutdown_signal.wait() => {}
                            _ = handler.handle(stream) => {}
                        }
                    });
                }
                Err(e) => slog::warn!(self.logger, "Failed to accept client connection: {:?}", e),
            }
        }

        slog::debug!(self.logger, "Client gateway exited");
    }
}

struct ConnectionHandler {
    logger: slog::Logger,
    actor_client: ActorClient,
    mode: watch::Receiver<GatewayMode>,
    pending: Arc<Mutex<PendingResponses>>,
}

impl ConnectionHandler {
    async fn handle(mut self, mut stream: TcpStream) {
        let mode = match self.mode.wait_for(|mode| *mode != GatewayMode::Waiting).await {
            Ok(mode) => mode.clone(),
            Err(_) => return,
        };

        let result = match mode {
            GatewayMode::Redirecting(leader) => self.redirect(&mut stream, leader).await,
            _ => self.serve(&mut stream).await,
        };
        if let Err(e) = result {
            slog::debug!(self.logger, "Client connection failed: {:?}", e);
        }

        let _ = stream.shutdown().await;
    }

    async fn redirect(&self, stream: &mut TcpStream, leader: Option<LeaderRedirectInfo>) -> io::Result<()> {
        protocol::write_redirect(stream, leader.map(|info| info.client_address)).await
    }

    async fn serve(&self, stream: &mut TcpStream) -> io::Result<()> {
        let command = protocol::read_message(stream).await?;

        // Taken before submitting, so a step-down while the command is in flight is noticed.
        let epoch = lock(&self.pending).epoch();
        let output = match self.actor_client.client_command(ClientCommandInput { command }).await {
            Ok(output) => output,
            // Lost leadership since we checked the mode.
            Err(ClientCommandError::NotLeader(leader)) => return self.redirect(stream, leader).await,
            Err(e) => {
                slog::warn!(self.logger, "Failed to submit client command: {}", e);
                return Ok(());
            }
        };
        slog::debug!(self.logger, "Waiting for entry {:?} to be applied", output.index);

        let registered = lock(&self.pending).register(epoch, (output.term, output.index));
        let response = match registered {
            Some(response) => response,
            None => {
                slog::debug!(self.logger, "Stepped down before entry {:?} was registered", output.index);
                return Ok(());
            }
        };
        match response.await {
            Ok(response) => protocol::write_message(stream, &response).await,
            // Dropped: we stepped down. The client will retry somewhere else.
            Err(_) => Ok(()),
        }
    }
}

/// A log entry as the leader that appended it saw it. The same index can be reused by a later
/// leader for a different command, the term tells them apart.
type EntryId = (Term, Index);

/// Responders waiting on a log entry, plus responses that showed up before their responder.
#[derive(Default)]
struct PendingResponses {
    // Bumped every time we stop serving.
    epoch: u64,
    waiting: HashMap<EntryId, oneshot::Sender<Bytes>>,
    stashed: BTreeMap<EntryId, Bytes>,
}

impl PendingResponses {
    fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Returns `None` if we stopped serving since `epoch` was read. Nothing would ever answer.
    fn register(&mut self, epoch: u64, entry: EntryId) -> Option<oneshot::Receiver<Bytes>> {
        if epoch != self.epoch {
            return None;
        }

        let (tx, rx) = oneshot::channel();
        match self.stashed.remove(&entry) {
            Some(response) => {
                let _ = tx.send(response);
            }
            None => {
                self.waiting.insert(entry, tx);
            }
        }

        Some(rx)
    }

    fn complete(&mut self, entry: EntryId, response: Bytes) {
        match self.waiting.remove(&entry) {
            Some(tx) => {
                let _ = tx.send(response);
            }
            None => {
                self.stashed.insert(entry, response);
                while self.stashed.len() > MAX_STASHED_RESPONSES {
                    self.stashed.pop_first();
                }
            }
        }
    }

    fn clear(&mut self) {
        self.epoch += 1;
        self.waiting.clear();
        self.stashed.clear();
    }
}

fn lock(pending: &Mutex<PendingResponses>) -> std::sync::MutexGuard<'_, PendingResponses> {
    pending.lock().unwrap_or_else(PoisonError::into_inner)
}
