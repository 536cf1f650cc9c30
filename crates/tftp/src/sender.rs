//! Sending Side of a Write Transfer
//!
//! [`Sender`] is the pure state machine: it decides what to transmit next
//! given the last packet received or a timeout. [`send_file`] drives it over a
//! [`Transport`], reading the source one block at a time.
//!
//! ```text
//! Start -> AwaitHandshakeAck -> SendBlock(1) -> AwaitAck(1) -> SendBlock(2) -> ... -> Done
//! ```
//!
//! The transfer ends once a block shorter than [`BLOCK_SIZE`] is
//! acknowledged. A source whose length is a multiple of the block size is
//! therefore followed by an empty block.

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::watch;

use crate::error::TransferError;
use crate::protocol::{BLOCK_SIZE, Message};
use crate::transfer::{
    Incoming, Progress, RECV_BUFFER_SIZE, TransferConfig, TransferSummary, next_message, notify_peer, transmit,
};
use crate::transport::Transport;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SenderState {
    Start,
    AwaitHandshakeAck,
    /// Block `n` may be read and sent
    SendBlock(u16),
    AwaitAck(u16),
    Done,
    Failed,
}

/// What the driver should do next
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SenderStep {
    /// Read the next chunk of the source and pass it to [`Sender::block`]
    ReadBlock,
    /// Transmit this packet again
    Resend(Message),
    /// Keep waiting
    Wait,
    /// The final block was acknowledged
    Done,
    /// The retry ceiling was reached without an answer
    GiveUp { attempts: usize },
}

#[derive(Debug)]
pub struct Sender {
    state: SenderState,
    next_block: u16,
    last_sent: Option<Message>,
    attempts: usize,
    max_retries: usize,
    blocks: u64,
    bytes: u64,
}

impl Sender {
    /// `max_retries` is the number of times one packet is transmitted before giving up
    pub fn new(max_retries: usize) -> Self {
        Self {
            state: SenderState::Start,
            next_block: 1,
            last_sent: None,
            attempts: 0,
            max_retries: max_retries.max(1),
            blocks: 0,
            bytes: 0,
        }
    }

    pub fn state(&self) -> SenderState {
        self.state
    }

    /// Data blocks acknowledged so far
    pub fn blocks(&self) -> u64 {
        self.blocks
    }

    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    /// Number the next call to [`Sender::block`] will use
    pub fn next_block(&self) -> u16 {
        self.next_block
    }

    /// Open the transfer. Returns the write request to transmit.
    pub fn request(&mut self, filename: &str, mode: &str) -> Message {
        let request = Message::write_request(filename, mode);
        self.remember(request.clone());
        self.state = SenderState::AwaitHandshakeAck;
        request
    }

    /// Wrap the next chunk of the source in a DATA packet.
    ///
    /// Called after [`SenderStep::ReadBlock`]; the chunk must not exceed
    /// [`BLOCK_SIZE`], and a shorter one marks the end of the source.
    pub fn block(&mut self, payload: Vec<u8>) -> Message {
        debug_assert!(payload.len() <= BLOCK_SIZE);
        let block = self.next_block;
        let data = Message::data(block, payload);
        self.remember(data.clone());
        self.state = SenderState::AwaitAck(block);
        data
    }

    /// Feed a packet received from the peer
    pub fn on_message(&mut self, message: Message) -> Result<SenderStep, TransferError> {
        match (self.state, message) {
            (_, Message::Error { code, message }) => {
                self.state = SenderState::Failed;
                Err(TransferError::Remote { code, message })
            }
            (SenderState::AwaitHandshakeAck, Message::Ack { block: 0 }) => {
                self.advance(1);
                Ok(SenderStep::ReadBlock)
            }
            (SenderState::AwaitHandshakeAck, Message::Ack { block }) => {
                tracing::debug!("Ignoring ACK #{} while waiting for the handshake", block);
                Ok(SenderStep::Wait)
            }
            (SenderState::AwaitAck(expected), Message::Ack { block }) if block == expected => {
                self.blocks += 1;
                let finished = self.last_sent.as_ref().is_some_and(Message::is_terminal);
                if finished {
                    self.state = SenderState::Done;
                    Ok(SenderStep::Done)
                } else {
                    self.advance(expected.wrapping_add(1));
                    Ok(SenderStep::ReadBlock)
                }
            }
            (SenderState::AwaitAck(expected), Message::Ack { block }) => {
                tracing::debug!("Stale ACK #{} while waiting for #{}", block, expected);
                Ok(self.retransmit())
            }
            (state, other) => {
                self.state = SenderState::Failed;
                Err(TransferError::Protocol(format!(
                    "unexpected {} in state {:?}",
                    other.opcode(),
                    state
                )))
            }
        }
    }

    /// The peer stayed silent for a full interval
    pub fn on_timeout(&mut self) -> SenderStep {
        match self.state {
            SenderState::AwaitHandshakeAck | SenderState::AwaitAck(_) => self.retransmit(),
            _ => SenderStep::Wait,
        }
    }

    /// Send the last packet again, unless it has been sent `max_retries` times.
    /// Timeouts and stale ACKs both count.
    fn retransmit(&mut self) -> SenderStep {
        let Some(last) = &self.last_sent else {
            return SenderStep::Wait;
        };
        if self.attempts >= self.max_retries {
            self.state = SenderState::Failed;
            SenderStep::GiveUp {
                attempts: self.attempts,
            }
        } else {
            self.attempts += 1;
            SenderStep::Resend(last.clone())
        }
    }

    fn remember(&mut self, message: Message) {
        if let Message::Data { payload, .. } = &message {
            self.bytes += payload.len() as u64;
        }
        self.last_sent = Some(message);
        self.attempts = 1;
    }

    fn advance(&mut self, next_block: u16) {
        self.next_block = next_block;
        self.state = SenderState::SendBlock(next_block);
    }
}

/// Read up to one block from `source`, filling it unless the source ends first
async fn read_chunk<R: AsyncRead + Unpin + ?Sized>(source: &mut R) -> std::io::Result<Vec<u8>> {
    let mut chunk = vec![0u8; BLOCK_SIZE];
    let mut filled = 0;
    while filled < BLOCK_SIZE {
        let n = source.read(&mut chunk[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    chunk.truncate(filled);
    Ok(chunk)
}

/// Expected number of the final block for a source of `size` bytes
fn block_count_hint(size: Option<u64>) -> u16 {
    size.and_then(|size| u16::try_from(size / BLOCK_SIZE as u64 + 1).ok())
        .unwrap_or(0)
}

/// Upload `source` to the peer as `filename`.
///
/// `size` is the source length if known; it only feeds the progress hint.
/// `progress` is called once per data block sent for the first time.
pub async fn send_file<T, R, P>(
    transport: &mut T,
    filename: &str,
    source: &mut R,
    size: Option<u64>,
    config: &TransferConfig,
    mut progress: P,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<TransferSummary, TransferError>
where
    T: Transport + ?Sized,
    R: AsyncRead + Unpin + ?Sized,
    P: FnMut(Progress),
{
    let mut sender = Sender::new(config.max_retries);
    let mut hint = block_count_hint(size);
    let mut buf = [0u8; RECV_BUFFER_SIZE];

    let request = sender.request(filename, &config.mode);
    tracing::debug!("Sending {}", request);
    transmit(transport, &request).await?;

    let result = loop {
        let step = match next_message(transport, &mut buf, config.timeout, shutdown).await {
            Ok(Incoming::Message(message)) => sender.on_message(message),
            Ok(Incoming::Malformed(e)) => Err(TransferError::Decode(e)),
            Ok(Incoming::Timeout) => Ok(sender.on_timeout()),
            Err(e) => Err(e),
        };

        match step {
            Ok(SenderStep::ReadBlock) => {
                let chunk = match read_chunk(source).await {
                    Ok(chunk) => chunk,
                    Err(e) => break Err(TransferError::Storage(e)),
                };
                let block = sender.next_block();
                if chunk.len() < BLOCK_SIZE {
                    hint = block;
                }
                let data = sender.block(chunk);
                tracing::debug!("Sending {}", data);
                if let Err(e) = transmit(transport, &data).await {
                    break Err(e);
                }
                progress(Progress {
                    block,
                    block_count_hint: hint,
                });
            }
            Ok(SenderStep::Resend(message)) => {
                tracing::debug!("Retransmitting {}", message);
                if let Err(e) = transmit(transport, &message).await {
                    break Err(e);
                }
            }
            Ok(SenderStep::Wait) => {}
            Ok(SenderStep::Done) => {
                break Ok(TransferSummary {
                    filename: filename.to_string(),
                    blocks: sender.blocks(),
                    bytes: sender.bytes(),
                });
            }
            Ok(SenderStep::GiveUp { attempts }) => break Err(TransferError::Timeout { attempts }),
            Err(e) => break Err(e),
        }
    };

    if let Err(e) = &result {
        notify_peer(transport, e).await;
    }
    result
}
