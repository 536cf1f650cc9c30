//! TFTP Server Implementation
//!
//! The server listens on a rendezvous endpoint for write requests. Each new
//! peer gets its own worker task with a dedicated endpoint, bound to the
//! address the client sent its request to, on a fresh port, and connected to
//! the peer, so a worker only ever sees its own client's datagrams.
//!
//! The supervisor loop owns a [`Registry`] of active peers. Datagrams that
//! still reach the rendezvous from a registered peer (a retransmitted
//! request, typically) are dropped; the worker's own retransmission
//! recovers the transfer. Worker outcomes are collected from a `JoinSet`,
//! logged and broadcast as [`TransferEvent`]s.

use std::io;
use std::net::{IpAddr, Ipv6Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use tokio::net::UdpSocket;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinSet;

use crate::error::TransferError;
use crate::protocol::{MAX_PACKET_SIZE, Message, Packet, TftpErrorCode, decode, encode};
use crate::receiver::receive_file;
use crate::registry::{Registry, Tid};
use crate::storage::DirectoryStorage;
use crate::transfer::{RECV_BUFFER_SIZE, TransferConfig, TransferSummary, cancelled, isolate};
use crate::transport::{Arrival, PeerSocket, enable_destination_info, open_endpoint, recv_with_destination};

/// Non-privileged default port
pub const DEFAULT_PORT: u16 = 6969;

const EVENT_CAPACITY: usize = 64;

/// TFTP Server configuration
#[derive(Debug, Clone)]
pub struct TftpServerConfig {
    pub bind_address: SocketAddr,
    pub root_directory: PathBuf,
    /// Restrict an IPv6 rendezvous to IPv6 peers
    pub v6only: bool,
    pub transfer: TransferConfig,
}

impl Default for TftpServerConfig {
    fn default() -> Self {
        Self {
            bind_address: SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), DEFAULT_PORT),
            root_directory: PathBuf::from("."),
            v6only: false,
            transfer: TransferConfig::default(),
        }
    }
}

/// Lifecycle of transfers handled by the server
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferEvent {
    Started {
        peer: Tid,
        filename: String,
    },
    Completed {
        peer: Tid,
        filename: String,
        blocks: u64,
        bytes: u64,
    },
    Failed {
        peer: Tid,
        filename: String,
        code: TftpErrorCode,
        message: String,
    },
}

/// Bookkeeping for a peer with a running worker
#[derive(Debug)]
struct ActiveTransfer {
    filename: String,
    started: Instant,
    /// Datagrams from this peer that reached the rendezvous instead of the worker
    strays: u64,
}

type WorkerResult = (Tid, Result<TransferSummary, TransferError>);

/// Main TFTP server
pub struct TftpServer {
    config: TftpServerConfig,
    socket: Option<UdpSocket>,
    events: broadcast::Sender<TransferEvent>,
}

impl TftpServer {
    /// Create a new TFTP server with the given configuration
    pub fn new(config: TftpServerConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            config,
            socket: None,
            events,
        }
    }

    /// Create a new TFTP server with default configuration
    pub fn with_defaults() -> Self {
        Self::new(TftpServerConfig::default())
    }

    /// Create a new TFTP server with custom bind address and root directory
    pub fn with_config(bind_address: SocketAddr, root_directory: PathBuf) -> Self {
        Self::new(TftpServerConfig {
            bind_address,
            root_directory,
            ..Default::default()
        })
    }

    /// Get the server's configuration
    pub fn config(&self) -> &TftpServerConfig {
        &self.config
    }

    /// Get a mutable reference to the server's configuration
    pub fn config_mut(&mut self) -> &mut TftpServerConfig {
        &mut self.config
    }

    /// Receive transfer lifecycle events
    pub fn subscribe(&self) -> broadcast::Receiver<TransferEvent> {
        self.events.subscribe()
    }

    /// Get the local address the server is bound to (if bound)
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.socket.as_ref().and_then(|s| s.local_addr().ok())
    }

    /// Bind the rendezvous endpoint without serving yet
    pub fn bind(&mut self) -> io::Result<SocketAddr> {
        let socket = open_endpoint(self.config.bind_address, self.config.v6only)?;
        enable_destination_info(&socket)?;
        let local_addr = socket.local_addr()?;
        self.socket = Some(socket);
        Ok(local_addr)
    }

    /// Serve until `shutdown` is signalled, then wait for running transfers to wind down
    pub async fn run(&mut self, shutdown: watch::Receiver<bool>) -> io::Result<()> {
        if self.socket.is_none() {
            self.bind()?;
        }
        let Some(socket) = self.socket.take() else {
            return Err(io::Error::from(io::ErrorKind::NotConnected));
        };

        let storage = Arc::new(DirectoryStorage::new(&self.config.root_directory));
        tracing::info!(
            "TFTP server listening on {}, storing files in {}",
            socket.local_addr()?,
            storage.root().display()
        );

        let result = self.serve(&socket, storage, shutdown).await;
        self.socket = Some(socket);
        result
    }

    /// Main server loop
    async fn serve(
        &self,
        socket: &UdpSocket,
        storage: Arc<DirectoryStorage>,
        mut shutdown: watch::Receiver<bool>,
    ) -> io::Result<()> {
        let mut registry: Registry<ActiveTransfer> = Registry::new();
        let mut workers: JoinSet<WorkerResult> = JoinSet::new();
        let mut buffer = [0u8; RECV_BUFFER_SIZE];

        loop {
            tokio::select! {
                _ = cancelled(&mut shutdown) => break,
                Some(joined) = workers.join_next(), if !workers.is_empty() => {
                    self.finish(&mut registry, joined);
                }
                received = recv_with_destination(socket, &mut buffer) => {
                    let Arrival { len, source: peer, destination } = received?;
                    let datagram = &buffer[..len];

                    if let Some(active) = registry.find_mut(&peer) {
                        active.strays += 1;
                        tracing::debug!("Dropping datagram from {} (transfer in progress)", peer);
                        continue;
                    }

                    match decode(datagram) {
                        Ok(Message::WriteRequest { filename, .. }) => {
                            let local = match destination {
                                Some(destination) => destination,
                                None => SocketAddr::new(socket.local_addr()?.ip(), 0),
                            };
                            self.spawn_worker(
                                &mut registry,
                                &mut workers,
                                &storage,
                                datagram,
                                local,
                                peer,
                                filename,
                                &shutdown,
                            );
                        }
                        Ok(Message::ReadRequest { filename, .. }) => {
                            tracing::info!("Refusing RRQ for '{}' from {}", filename, peer);
                            reject(socket, peer, "read requests are not supported").await;
                        }
                        Ok(Message::Error { code, message }) => {
                            // Never answer an error with an error
                            tracing::debug!("Ignoring ERROR {} ({}) from {}", code, message, peer);
                        }
                        Ok(other) => {
                            tracing::debug!("Unexpected {} from {} without a transfer", other.opcode(), peer);
                            reject(socket, peer, &format!("unexpected {}", other.opcode())).await;
                        }
                        Err(e) => {
                            tracing::debug!("Malformed packet from {}: {}", peer, e);
                            reject(socket, peer, &e.to_string()).await;
                        }
                    }
                }
            }
        }

        if !workers.is_empty() {
            tracing::info!("Shutting down, waiting for {} transfer(s)", workers.len());
            for peer in registry.tids() {
                tracing::debug!("Cancelling transfer from {}", peer);
            }
        }
        while let Some(joined) = workers.join_next().await {
            self.finish(&mut registry, joined);
        }

        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn spawn_worker(
        &self,
        registry: &mut Registry<ActiveTransfer>,
        workers: &mut JoinSet<WorkerResult>,
        storage: &Arc<DirectoryStorage>,
        request: &[u8],
        local: SocketAddr,
        peer: Tid,
        filename: String,
        shutdown: &watch::Receiver<bool>,
    ) {
        let active = ActiveTransfer {
            filename: filename.clone(),
            started: Instant::now(),
            strays: 0,
        };
        if let Err(e) = registry.create(peer, active) {
            tracing::warn!("Not starting transfer: {}", e);
            return;
        }

        let request = request.to_vec();
        let storage = Arc::clone(storage);
        let config = self.config.transfer.clone();
        let v6only = self.config.v6only;
        let mut shutdown = shutdown.clone();

        workers.spawn(async move {
            let result = isolate(async move {
                let mut transport = PeerSocket::accept(local, peer, v6only)
                    .await
                    .map_err(TransferError::Transport)?;
                receive_file(
                    &mut transport,
                    &request,
                    storage.as_ref(),
                    &config,
                    |progress| tracing::debug!("Block {} from {}", progress.block, peer),
                    &mut shutdown,
                )
                .await
            })
            .await;
            (peer, result)
        });

        let _ = self.events.send(TransferEvent::Started { peer, filename });
    }

    /// Record the outcome of a finished worker
    fn finish(&self, registry: &mut Registry<ActiveTransfer>, joined: Result<WorkerResult, tokio::task::JoinError>) {
        let (peer, result) = match joined {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::error!("Transfer supervisor task failed: {}", e);
                return;
            }
        };

        let Some(active) = registry.remove(&peer) else {
            tracing::warn!("Finished transfer from {} was not registered", peer);
            return;
        };
        if active.strays > 0 {
            tracing::debug!("Dropped {} stray datagram(s) from {} at the rendezvous", active.strays, peer);
        }

        let event = match result {
            Ok(summary) => {
                tracing::info!(
                    "Received '{}' from {} ({} blocks, {} bytes) in {:.2?}",
                    summary.filename,
                    peer,
                    summary.blocks,
                    summary.bytes,
                    active.started.elapsed()
                );
                TransferEvent::Completed {
                    peer,
                    filename: summary.filename,
                    blocks: summary.blocks,
                    bytes: summary.bytes,
                }
            }
            Err(e) => {
                tracing::warn!("Failed to receive '{}' from {}: {}", active.filename, peer, e);
                TransferEvent::Failed {
                    peer,
                    filename: active.filename,
                    code: e.code(),
                    message: e.to_string(),
                }
            }
        };

        let _ = self.events.send(event);
    }
}

/// Answer a datagram that cannot start a transfer
async fn reject(socket: &UdpSocket, peer: SocketAddr, message: &str) {
    let mut packet: Packet = [0; MAX_PACKET_SIZE];
    let reply = Message::error(TftpErrorCode::IllegalOperation, message);
    match encode(&reply, &mut packet) {
        Ok(len) => {
            if let Err(e) = socket.send_to(&packet[..len], peer).await {
                tracing::debug!("Failed to send error to {}: {}", peer, e);
            }
        }
        Err(e) => tracing::debug!("Failed to encode error for {}: {}", peer, e),
    }
}
