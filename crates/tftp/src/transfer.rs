//! Shared Transfer Plumbing
//!
//! Configuration, progress records and the receive/transmit helpers used by
//! both the sending and the receiving driver.

use std::any::Any;
use std::future::Future;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::timeout;

use crate::error::TransferError;
use crate::protocol::{DEFAULT_MODE, DecodeError, MAX_PACKET_SIZE, Message, Packet, decode, encode};
use crate::transport::Transport;

/// Default retransmission timeout in seconds
pub const TIMEOUT_SECS: u64 = 5;
/// Default number of transmissions of one packet
pub const MAX_RETRIES: usize = 8;

/// Receive buffer size. One byte larger than any legal packet so oversized
/// datagrams are detected instead of silently cut.
pub(crate) const RECV_BUFFER_SIZE: usize = MAX_PACKET_SIZE + 1;

/// Transfer session configuration
#[derive(Debug, Clone)]
pub struct TransferConfig {
    /// How long to wait for the peer before retransmitting
    pub timeout: Duration,
    /// Transmissions of one packet before the transfer is abandoned
    pub max_retries: usize,
    /// Mode string sent in write requests
    pub mode: String,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(TIMEOUT_SECS),
            max_retries: MAX_RETRIES,
            mode: DEFAULT_MODE.to_string(),
        }
    }
}

/// Progress of one transfer, reported after every data block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    pub block: u16,
    /// Expected number of the final block, or 0 while unknown
    pub block_count_hint: u16,
}

/// Result of a completed transfer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferSummary {
    pub filename: String,
    /// Data blocks transferred, including a trailing empty block
    pub blocks: u64,
    pub bytes: u64,
}

/// What a wait on the transport produced
#[derive(Debug)]
pub(crate) enum Incoming {
    Message(Message),
    Malformed(DecodeError),
    Timeout,
}

/// Wait up to `wait` for the next datagram from the peer.
///
/// Returns [`TransferError::Cancelled`] as soon as shutdown is signalled.
pub(crate) async fn next_message<T: Transport + ?Sized>(
    transport: &mut T,
    buf: &mut [u8; RECV_BUFFER_SIZE],
    wait: Duration,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<Incoming, TransferError> {
    tokio::select! {
        biased;
        _ = cancelled(shutdown) => Err(TransferError::Cancelled),
        received = timeout(wait, transport.recv(buf)) => match received {
            Err(_) => Ok(Incoming::Timeout),
            Ok(Err(e)) => Err(TransferError::Transport(e)),
            Ok(Ok(len)) => Ok(match decode(&buf[..len]) {
                Ok(message) => Incoming::Message(message),
                Err(e) => Incoming::Malformed(e),
            }),
        },
    }
}

/// Encode and send one message
pub(crate) async fn transmit<T: Transport + ?Sized>(transport: &mut T, message: &Message) -> Result<(), TransferError> {
    let mut packet: Packet = [0; MAX_PACKET_SIZE];
    let len = encode(message, &mut packet)?;
    transport.send(&packet[..len]).await.map_err(TransferError::Transport)
}

/// Tell the peer why the transfer is being torn down, if there is anything to tell
pub(crate) async fn notify_peer<T: Transport + ?Sized>(transport: &mut T, err: &TransferError) {
    if let Some(reply) = err.reply() {
        tracing::debug!("Sending {} before closing transfer", reply);
        if let Err(e) = transmit(transport, &reply).await {
            tracing::debug!("Failed to send error packet: {}", e);
        }
    }
}

/// Resolves once shutdown is signalled. Never resolves if the signal's
/// sender is gone without having signalled.
pub(crate) async fn cancelled(shutdown: &mut watch::Receiver<bool>) {
    if shutdown.wait_for(|&stop| stop).await.is_err() {
        std::future::pending::<()>().await;
    }
}

/// Run a transfer on its own task, turning a panic into an error value
pub(crate) async fn isolate<F, T>(transfer: F) -> Result<T, TransferError>
where
    F: Future<Output = Result<T, TransferError>> + Send + 'static,
    T: Send + 'static,
{
    match tokio::spawn(transfer).await {
        Ok(result) => result,
        Err(e) if e.is_panic() => Err(TransferError::Panicked(panic_message(e.into_panic()))),
        Err(_) => Err(TransferError::Cancelled),
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
