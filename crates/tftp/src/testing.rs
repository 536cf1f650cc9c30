//! In-memory transport for exercising the transfer drivers without sockets

use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::protocol::{Message, decode};
use crate::transport::Transport;

/// One end of an in-memory datagram link.
///
/// Every datagram handed to `send` is recorded, decoded where possible, in a
/// log shared with the test. A message registered with `drop_once` is lost
/// the first time it is sent.
pub(crate) struct MemoryTransport {
    tx: mpsc::UnboundedSender<Vec<u8>>,
    rx: mpsc::UnboundedReceiver<Vec<u8>>,
    peer: SocketAddr,
    drops: Vec<Message>,
    sent: Arc<Mutex<Vec<Message>>>,
}

impl MemoryTransport {
    pub(crate) fn pair() -> (Self, Self) {
        let (left_tx, right_rx) = mpsc::unbounded_channel();
        let (right_tx, left_rx) = mpsc::unbounded_channel();

        let left = Self {
            tx: left_tx,
            rx: left_rx,
            peer: SocketAddr::from(([192, 0, 2, 2], 6969)),
            drops: Vec::new(),
            sent: Arc::default(),
        };
        let right = Self {
            tx: right_tx,
            rx: right_rx,
            peer: SocketAddr::from(([192, 0, 2, 1], 50000)),
            drops: Vec::new(),
            sent: Arc::default(),
        };
        (left, right)
    }

    /// Lose the first transmission of `message`
    pub(crate) fn drop_once(mut self, message: Message) -> Self {
        self.drops.push(message);
        self
    }

    /// Handle on everything this end has sent, lost datagrams included
    pub(crate) fn sent(&self) -> Arc<Mutex<Vec<Message>>> {
        Arc::clone(&self.sent)
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn send(&mut self, datagram: &[u8]) -> io::Result<()> {
        if let Ok(message) = decode(datagram) {
            if let Ok(mut sent) = self.sent.lock() {
                sent.push(message.clone());
            }
            if let Some(index) = self.drops.iter().position(|lost| *lost == message) {
                self.drops.remove(index);
                return Ok(());
            }
        }
        // A closed peer behaves like a host that went away: the datagram is lost
        let _ = self.tx.send(datagram.to_vec());
        Ok(())
    }

    async fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let datagram = self
            .rx
            .recv()
            .await
            .ok_or_else(|| io::Error::new(io::ErrorKind::ConnectionAborted, "peer closed"))?;
        let len = datagram.len().min(buf.len());
        buf[..len].copy_from_slice(&datagram[..len]);
        Ok(len)
    }

    fn peer(&self) -> Option<SocketAddr> {
        Some(self.peer)
    }
}

/// Messages recorded by [`MemoryTransport::sent`]
pub(crate) fn snapshot(sent: &Arc<Mutex<Vec<Message>>>) -> Vec<Message> {
    sent.lock().map(|sent| sent.clone()).unwrap_or_default()
}
