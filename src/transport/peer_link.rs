use crate::transport::framer::{self, Framer};
use crate::transport::shutdown::{self, ShutdownHandle, ShutdownSignal};
use bytes::Bytes;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpSocket, TcpStream};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;

const RECEIVE_BUFFER_SIZE: usize = 100_000;
// Messages waiting on the outbound socket. Anything past this is dropped.
const OUTBOUND_QUEUE_SIZE: usize = 64;

/// FrameSink receives every complete frame that arrives on a peer link's inbound socket.
#[async_trait::async_trait]
pub trait FrameSink: Send + Sync + 'static {
    async fn deliver(&self, frame: Bytes);
}

#[derive(Clone, Debug)]
pub struct PeerLinkConfig {
    /// Port we accept the peer's outbound connection on.
    pub my_listen_port: u16,
    pub dest_ip: Ipv4Addr,
    /// Port the peer accepts our outbound connection on.
    pub dest_port: u16,
    pub connect_timeout: Duration,
    pub rebind_delay: Duration,
}

/// PeerLink is one logical connection to one other cluster member, built from two independent
/// directional sockets:
///
/// * Inbound: we listen on `my_listen_port`, accept the peer's connection, and feed what it sends
///   through a [`Framer`] into the [`FrameSink`]. When the connection drops, we listen again.
/// * Outbound: we lazily dial `dest_ip:dest_port` on `send()`. Delivery is best-effort and
///   at-most-once. Failures are logged and the message is dropped.
///
/// Dropping the PeerLink stops both tasks. Use [`PeerLink::shutdown`] to also wait for them.
pub struct PeerLink {
    logger: slog::Logger,
    outbound_queue: mpsc::Sender<Bytes>,
    shutdown_handle: Option<ShutdownHandle>,
    inbound_task: Option<JoinHandle<()>>,
    outbound_task: Option<JoinHandle<()>>,
}

impl PeerLink {
    pub fn spawn<S: FrameSink>(logger: slog::Logger, config: PeerLinkConfig, sink: S) -> Self {
        let logger = logger.new(slog::o!("Peer" => format!("{}:{}", config.dest_ip, config.dest_port)));
        let (shutdown_handle, shutdown_signal) = shutdown::shutdown_signal();
        let (outbound_queue, outbound_queue_rx) = mpsc::channel(OUTBOUND_QUEUE_SIZE);

        let inbound = InboundLoop {
            logger: logger.clone(),
            config: config.clone(),
            framer: Framer::new(),
            sink,
        };
        let outbound = OutboundLoop {
            logger: logger.clone(),
            config,
            queue: outbound_queue_rx,
            state: ConnectionState::Disconnected,
        };

        let inbound_task = tokio::spawn(inbound.run(shutdown_signal.clone()));
        let outbound_task = tokio::spawn(outbound.run(shutdown_signal));

        PeerLink {
            logger,
            outbound_queue,
            shutdown_handle: Some(shutdown_handle),
            inbound_task: Some(inbound_task),
            outbound_task: Some(outbound_task),
        }
    }

    /// Fire-and-forget. Never blocks and never reports failure to the caller. The message is
    /// dropped if the outbound queue is full.
    pub fn send(&self, payload: Bytes) {
        match self.outbound_queue.try_send(payload) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                slog::debug!(self.logger, "Outbound queue is full, dropping message");
            }
            Err(TrySendError::Closed(_)) => {
                slog::debug!(self.logger, "Outbound loop has exited, dropping message");
            }
        }
    }

    #[cfg(test)]
    fn queued_messages(&self) -> usize {
        self.outbound_queue.max_capacity() - self.outbound_queue.capacity()
    }

    /// Stop both directions and wait for their tasks to exit.
    pub async fn shutdown(mut self) {
        // Outbound first: it shuts down its socket before joining the close watcher.
        self.shutdown_handle.take();
        if let Some(task) = self.outbound_task.take() {
            let _ = task.await;
        }
        if let Some(task) = self.inbound_task.take() {
            let _ = task.await;
        }
        slog::debug!(self.logger, "Peer link shut down");
    }
}

// ------- Inbound --------

struct InboundLoop<S: FrameSink> {
    logger: slog::Logger,
    config: PeerLinkConfig,
    framer: Framer,
    sink: S,
}

impl<S: FrameSink> InboundLoop<S> {
    async fn run(mut self, mut shutdown_signal: ShutdownSignal) {
        tokio::select! {
            _ = shutdown_signal.wait() => {}
            _ = self.serve_forever() => {}
        }
        slog::debug!(self.logger, "Inbound loop exited");
    }

    async fn serve_forever(&mut self) {
        loop {
            match self.accept_one().await {
                Ok(stream) => {
                    self.read_until_closed(stream).await;
                    // A partial frame can never be completed by a new connection.
                    self.framer.reset();
                }
                Err(e) => {
                    slog::warn!(
                        self.logger,
                        "Failed to accept on port {}: {:?}. Retrying in {:?}",
                        self.config.my_listen_port,
                        e,
                        self.config.rebind_delay
                    );
                    tokio::time::sleep(self.config.rebind_delay).await;
                }
            }
        }
    }

    /// Opens a fresh listening socket and accepts exactly one connection from the peer's address.
    /// The listening socket is closed again once this returns.
    async fn accept_one(&self) -> io::Result<TcpStream> {
        let socket = TcpSocket::new_v4()?;
        socket.set_reuseaddr(true)?;
        socket.bind(SocketAddr::from((Ipv4Addr::UNSPECIFIED, self.config.my_listen_port)))?;
        let listener = socket.listen(1)?;

        loop {
            let (stream, remote_addr) = listener.accept().await?;
            if remote_addr.ip() == IpAddr::V4(self.config.dest_ip) {
                slog::info!(self.logger, "Accepted inbound connection from {}", remote_addr);
                return Ok(stream);
            }

            slog::warn!(
                self.logger,
                "Rejected inbound connection from unexpected address {}",
                remote_addr
            );
        }
    }

    async fn read_until_closed(&mut self, mut stream: TcpStream) {
        let mut buffer = vec![0u8; RECEIVE_BUFFER_SIZE];
        loop {
            let n = match stream.read(&mut buffer).await {
                Ok(0) => {
                    slog::info!(self.logger, "Inbound connection closed by peer");
                    return;
                }
                Ok(n) => n,
                Err(e) => {
                    slog::warn!(self.logger, "Inbound connection read error: {:?}", e);
                    return;
                }
            };

            let mut frames = Vec::new();
            if let Err(e) = self.framer.feed(&buffer[..n], |frame| frames.push(frame)) {
                slog::warn!(self.logger, "Dropping inbound connection: {}", e);
                return;
            }

            for frame in frames {
                self.sink.deliver(frame).await;
            }
        }
    }
}

// ------- Outbound --------

enum ConnectionState {
    Disconnected,
    Connecting,
    Connected(LiveConnection),
}

struct LiveConnection {
    writer: OwnedWriteHalf,
    // Peers never write on this socket, so the watcher only returns once it is closed.
    close_watcher: JoinHandle<()>,
}

impl LiveConnection {
    fn is_closed(&self) -> bool {
        self.close_watcher.is_finished()
    }
}

struct OutboundLoop {
    logger: slog::Logger,
    config: PeerLinkConfig,
    queue: mpsc::Receiver<Bytes>,
    state: ConnectionState,
}

impl OutboundLoop {
    async fn run(mut self, mut shutdown_signal: ShutdownSignal) {
        loop {
            let next = tokio::select! {
                _ = shutdown_signal.wait() => None,
                next = self.queue.recv() => next,
            };

            match next {
                Some(payload) => self.send(payload).await,
                None => break,
            }
        }

        self.disconnect().await;
        slog::debug!(self.logger, "Outbound loop exited");
    }

    async fn send(&mut self, payload: Bytes) {
        if matches!(&self.state, ConnectionState::Connected(connection) if connection.is_closed()) {
            slog::info!(self.logger, "Outbound connection was closed by peer");
            self.disconnect().await;
        }

        if let ConnectionState::Disconnected = self.state {
            self.connect().await;
        }

        let connection = match &mut self.state {
            ConnectionState::Connected(connection) => connection,
            _ => {
                // Whatever queued up while we were dialing would have been sent to a dead peer
                // anyway, and is stale by now.
                let mut dropped = 1;
                while self.queue.try_recv().is_ok() {
                    dropped += 1;
                }
                slog::debug!(self.logger, "No outbound connection, dropped {} messages", dropped);
                return;
            }
        };

        let frame = framer::frame(&payload);
        if let Err(e) = connection.writer.write_all(&frame).await {
            slog::warn!(self.logger, "Failed to send message: {:?}", e);
            self.disconnect().await;
        }
    }

    async fn connect(&mut self) {
        self.state = ConnectionState::Connecting;

        let addr = SocketAddrV4::new(self.config.dest_ip, self.config.dest_port);
        self.state = match tokio::time::timeout(self.config.connect_timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => {
                if let Err(e) = stream.set_nodelay(true) {
                    slog::debug!(self.logger, "Failed to set TCP_NODELAY: {:?}", e);
                }
                let (reader, writer) = stream.into_split();
                slog::info!(self.logger, "Outbound connection established");

                ConnectionState::Connected(LiveConnection {
                    writer,
                    close_watcher: tokio::spawn(watch_for_close(reader)),
                })
            }
            Ok(Err(e)) => {
                slog::debug!(self.logger, "Failed to connect: {:?}", e);
                ConnectionState::Disconnected
            }
            Err(_) => {
                slog::debug!(self.logger, "Timed out connecting after {:?}", self.config.connect_timeout);
                ConnectionState::Disconnected
            }
        };
    }

    async fn disconnect(&mut self) {
        let state = std::mem::replace(&mut self.state, ConnectionState::Disconnected);
        if let ConnectionState::Connected(mut connection) = state {
            // Shut the socket down before joining the watcher, which may be parked on a read.
            let _ = connection.writer.shutdown().await;
            connection.close_watcher.abort();
            let _ = connection.close_watcher.await;
        }
    }
}

async fn watch_for_close(mut reader: OwnedReadHalf) {
    let mut buffer = [0u8; 64];
    loop {
        match reader.read(&mut buffer).await {
            Ok(0) | Err(_) => return,
            Ok(_) => continue,
        }
    }
}
