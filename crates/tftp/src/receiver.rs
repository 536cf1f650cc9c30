//! Receiving Side of a Write Transfer
//!
//! A [`Session`] is created per transfer ID and fed every packet from that
//! peer. It owns the destination file while the transfer is running.
//!
//! ```text
//! New -> Open -> Receiving(0) -> Receiving(1) -> ... -> Complete
//! ```
//!
//! Rules while receiving, with `last` the most recently acknowledged block:
//!
//! - `DATA last` is a retransmission; it is acknowledged again and not written.
//! - `DATA last+1` is written and acknowledged. A payload shorter than
//!   [`BLOCK_SIZE`] completes the transfer.
//! - Any other block number is a protocol violation that ends the session.
//! - A repeated write request before the first data block means the
//!   handshake ACK was lost and is answered with `ACK 0` again.
//! - An ERROR packet from the peer aborts the session without a reply.

use std::io;

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::watch;

use crate::error::TransferError;
use crate::protocol::{BLOCK_SIZE, Message, TftpErrorCode, decode};
use crate::registry::Tid;
use crate::storage::Storage;
use crate::transfer::{
    Incoming, Progress, RECV_BUFFER_SIZE, TransferConfig, TransferSummary, next_message, notify_peer, transmit,
};
use crate::transport::Transport;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiverState {
    New,
    /// The destination is being created
    Open,
    Receiving {
        last: u16,
    },
    Complete {
        last: u16,
    },
    Failed,
}

/// Packet to send in answer to the one just processed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReceiverStep {
    Reply(Message),
    /// The final acknowledgement. The destination has been flushed and closed.
    Complete(Message),
}

/// Server-side state of one inbound transfer
#[derive(Debug)]
pub struct Session<W> {
    tid: Tid,
    state: ReceiverState,
    destination: Option<W>,
    filename: Option<String>,
    last_acked: u16,
    blocks: u64,
    bytes: u64,
}

fn disk_full(e: io::Error) -> TransferError {
    TransferError::Rejected {
        code: TftpErrorCode::DiskFull,
        message: e.to_string(),
    }
}

impl<W: AsyncWrite + Unpin + Send> Session<W> {
    pub fn new(tid: Tid) -> Self {
        Self {
            tid,
            state: ReceiverState::New,
            destination: None,
            filename: None,
            last_acked: 0,
            blocks: 0,
            bytes: 0,
        }
    }

    pub fn tid(&self) -> Tid {
        self.tid
    }

    pub fn state(&self) -> ReceiverState {
        self.state
    }

    pub fn last_acked(&self) -> u16 {
        self.last_acked
    }

    /// Name of the destination, once it has been created
    pub fn filename(&self) -> Option<&str> {
        self.filename.as_deref()
    }

    /// Data blocks written so far
    pub fn blocks(&self) -> u64 {
        self.blocks
    }

    pub fn summary(&self) -> TransferSummary {
        TransferSummary {
            filename: self.filename.clone().unwrap_or_default(),
            blocks: self.blocks,
            bytes: self.bytes,
        }
    }

    /// Process one packet from the peer.
    ///
    /// On error the session is failed and the destination closed; the caller
    /// sends [`TransferError::reply`] and discards the partial file.
    pub async fn step<S>(&mut self, message: Message, storage: &S) -> Result<ReceiverStep, TransferError>
    where
        S: Storage<Sink = W> + ?Sized,
    {
        let result = self.advance(message, storage).await;
        if result.is_err() && !matches!(self.state, ReceiverState::Complete { .. }) {
            self.state = ReceiverState::Failed;
            self.destination = None;
        }
        result
    }

    /// The packet to repeat after a silent interval
    pub fn on_timeout(&self) -> Message {
        Message::ack(self.last_acked)
    }

    async fn advance<S>(&mut self, message: Message, storage: &S) -> Result<ReceiverStep, TransferError>
    where
        S: Storage<Sink = W> + ?Sized,
    {
        match (self.state, message) {
            (_, Message::Error { code, message }) => Err(TransferError::Remote { code, message }),
            (ReceiverState::New, Message::WriteRequest { filename, mode }) => {
                tracing::info!("WRQ for '{}' in {} mode from {}", filename, mode, self.tid);
                self.state = ReceiverState::Open;
                let destination = storage.create(&filename).await.map_err(|e| TransferError::Rejected {
                    code: e.code(),
                    message: e.to_string(),
                })?;
                self.destination = Some(destination);
                self.filename = Some(filename);
                self.state = ReceiverState::Receiving { last: 0 };
                Ok(ReceiverStep::Reply(Message::ack(0)))
            }
            (ReceiverState::Receiving { last: 0 }, Message::WriteRequest { .. }) => {
                tracing::debug!("Repeated WRQ from {}, handshake ACK was lost", self.tid);
                Ok(ReceiverStep::Reply(Message::ack(0)))
            }
            (ReceiverState::Receiving { last }, Message::Data { block, payload }) => {
                if block == last {
                    tracing::debug!("Duplicate DATA #{} from {}", block, self.tid);
                    Ok(ReceiverStep::Reply(Message::ack(last)))
                } else if block == last.wrapping_add(1) {
                    self.write(block, payload).await
                } else {
                    Err(TransferError::Protocol(format!(
                        "expected block {}, got {}",
                        last.wrapping_add(1),
                        block
                    )))
                }
            }
            (ReceiverState::Complete { last }, Message::Data { block, .. }) if block == last => {
                Ok(ReceiverStep::Reply(Message::ack(last)))
            }
            (state, other) => Err(TransferError::Protocol(format!(
                "unexpected {} in state {:?}",
                other.opcode(),
                state
            ))),
        }
    }

    async fn write(&mut self, block: u16, payload: Vec<u8>) -> Result<ReceiverStep, TransferError> {
        let Some(destination) = self.destination.as_mut() else {
            return Err(TransferError::Protocol("destination is closed".to_string()));
        };
        destination.write_all(&payload).await.map_err(disk_full)?;

        self.last_acked = block;
        self.blocks += 1;
        self.bytes += payload.len() as u64;

        if payload.len() < BLOCK_SIZE {
            destination.flush().await.map_err(disk_full)?;
            self.destination = None;
            self.state = ReceiverState::Complete { last: block };
            Ok(ReceiverStep::Complete(Message::ack(block)))
        } else {
            self.state = ReceiverState::Receiving { last: block };
            Ok(ReceiverStep::Reply(Message::ack(block)))
        }
    }
}

/// Receive one upload whose opening datagram is `request`.
///
/// Replies go out through `transport`, which must already be bound to the
/// peer. `progress` is called for every block written. After the final
/// acknowledgement the driver lingers for one timeout interval so a lost
/// final ACK can be repeated.
pub async fn receive_file<T, S, P>(
    transport: &mut T,
    request: &[u8],
    storage: &S,
    config: &TransferConfig,
    mut progress: P,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<TransferSummary, TransferError>
where
    T: Transport + ?Sized,
    S: Storage + ?Sized,
    P: FnMut(Progress),
{
    let tid = transport
        .peer()
        .ok_or_else(|| TransferError::Transport(io::Error::from(io::ErrorKind::NotConnected)))?;
    let mut session = Session::<S::Sink>::new(tid);

    let result = run_session(&mut session, transport, request, storage, config, &mut progress, shutdown).await;

    match &result {
        Ok(_) => dally(&mut session, transport, storage, config, shutdown).await,
        Err(e) => {
            notify_peer(transport, e).await;
            if let Some(filename) = session.filename()
                && let Err(discard_err) = storage.discard(filename).await
            {
                tracing::warn!("Failed to remove partial file '{}': {}", filename, discard_err);
            }
        }
    }

    result
}

async fn run_session<T, S, P>(
    session: &mut Session<S::Sink>,
    transport: &mut T,
    request: &[u8],
    storage: &S,
    config: &TransferConfig,
    progress: &mut P,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<TransferSummary, TransferError>
where
    T: Transport + ?Sized,
    S: Storage + ?Sized,
    P: FnMut(Progress),
{
    let mut buf = [0u8; RECV_BUFFER_SIZE];
    let mut step = session.step(decode(request)?, storage).await?;

    loop {
        match step {
            ReceiverStep::Reply(reply) => transmit(transport, &reply).await?,
            ReceiverStep::Complete(ack) => {
                transmit(transport, &ack).await?;
                progress(Progress {
                    block: ack_block(&ack),
                    block_count_hint: ack_block(&ack),
                });
                return Ok(session.summary());
            }
        }

        let mut silent = 0;
        step = loop {
            match next_message(transport, &mut buf, config.timeout, shutdown).await? {
                Incoming::Message(message) => {
                    let written = session.blocks();
                    let step = session.step(message, storage).await?;
                    if session.blocks() != written && matches!(step, ReceiverStep::Reply(_)) {
                        progress(Progress {
                            block: session.last_acked(),
                            block_count_hint: 0,
                        });
                    }
                    break step;
                }
                Incoming::Malformed(e) => return Err(e.into()),
                Incoming::Timeout => {
                    silent += 1;
                    if silent >= config.max_retries {
                        return Err(TransferError::Timeout { attempts: silent });
                    }
                    let ack = session.on_timeout();
                    tracing::debug!("No packet from {}, re-sending {}", session.tid(), ack);
                    transmit(transport, &ack).await?;
                }
            }
        };
    }
}

fn ack_block(message: &Message) -> u16 {
    match message {
        Message::Ack { block } => *block,
        _ => 0,
    }
}

/// Repeat the final acknowledgement for as long as the peer keeps resending
/// its last block
async fn dally<T, S>(
    session: &mut Session<S::Sink>,
    transport: &mut T,
    storage: &S,
    config: &TransferConfig,
    shutdown: &mut watch::Receiver<bool>,
) where
    T: Transport + ?Sized,
    S: Storage + ?Sized,
{
    let mut buf = [0u8; RECV_BUFFER_SIZE];
    while let Ok(Incoming::Message(message)) = next_message(transport, &mut buf, config.timeout, shutdown).await {
        match session.step(message, storage).await {
            Ok(ReceiverStep::Reply(ack)) => {
                tracing::debug!("Final ACK to {} was lost, re-sending {}", session.tid(), ack);
                if transmit(transport, &ack).await.is_err() {
                    break;
                }
            }
            _ => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tempfile::{TempDir, tempdir};
    use tokio::fs::File;

    use super::*;
    use crate::protocol::{MAX_PACKET_SIZE, Packet, encode};
    use crate::storage::DirectoryStorage;
    use crate::testing::{MemoryTransport, snapshot};

    fn tid() -> Tid {
        "192.0.2.1:50000".parse().unwrap()
    }

    fn setup() -> (TempDir, DirectoryStorage, Session<File>) {
        let temp_dir = tempdir().unwrap();
        let storage = DirectoryStorage::new(temp_dir.path());
        (temp_dir, storage, Session::new(tid()))
    }

    fn packet(message: &Message) -> Vec<u8> {
        let mut buf: Packet = [0; MAX_PACKET_SIZE];
        let len = encode(message, &mut buf).unwrap();
        buf[..len].to_vec()
    }

    #[tokio::test]
    async fn test_write_transfer_sequence() {
        let (temp_dir, storage, mut session) = setup();

        let step = session
            .step(Message::write_request("a.bin", "netascii"), &storage)
            .await
            .unwrap();
        assert_eq!(step, ReceiverStep::Reply(Message::ack(0)));
        assert_eq!(session.state(), ReceiverState::Receiving { last: 0 });
        assert!(temp_dir.path().join("a.bin").exists());

        let step = session.step(Message::data(1, vec![1; 512]), &storage).await.unwrap();
        assert_eq!(step, ReceiverStep::Reply(Message::ack(1)));

        let step = session.step(Message::data(2, vec![2; 488]), &storage).await.unwrap();
        assert_eq!(step, ReceiverStep::Complete(Message::ack(2)));
        assert_eq!(session.state(), ReceiverState::Complete { last: 2 });
        assert_eq!(session.last_acked(), 2);

        let contents = std::fs::read(temp_dir.path().join("a.bin")).unwrap();
        assert_eq!(contents.len(), 1000);
        assert_eq!(&contents[..512], &[1; 512][..]);
        assert_eq!(&contents[512..], &[2; 488][..]);

        let summary = session.summary();
        assert_eq!(summary.filename, "a.bin");
        assert_eq!((summary.blocks, summary.bytes), (2, 1000));
    }

    #[tokio::test]
    async fn test_duplicate_data_is_acked_but_not_written() {
        let (temp_dir, storage, mut session) = setup();
        session
            .step(Message::write_request("dup.bin", "netascii"), &storage)
            .await
            .unwrap();

        for _ in 0..3 {
            let step = session.step(Message::data(1, vec![7; 512]), &storage).await.unwrap();
            assert_eq!(step, ReceiverStep::Reply(Message::ack(1)));
        }
        session.step(Message::data(2, Vec::new()), &storage).await.unwrap();

        let contents = std::fs::read(temp_dir.path().join("dup.bin")).unwrap();
        assert_eq!(contents.len(), 512);
    }

    #[tokio::test]
    async fn test_repeated_request_before_first_block() {
        let (_temp_dir, storage, mut session) = setup();
        let request = Message::write_request("a.bin", "netascii");

        session.step(request.clone(), &storage).await.unwrap();
        let step = session.step(request.clone(), &storage).await.unwrap();
        assert_eq!(step, ReceiverStep::Reply(Message::ack(0)));

        session.step(Message::data(1, vec![0; 512]), &storage).await.unwrap();
        let err = session.step(request, &storage).await.unwrap_err();
        assert_eq!(err.code(), TftpErrorCode::IllegalOperation);
        assert_eq!(session.state(), ReceiverState::Failed);
    }

    #[tokio::test]
    async fn test_block_gap_is_a_protocol_error() {
        let (_temp_dir, storage, mut session) = setup();
        session
            .step(Message::write_request("a.bin", "netascii"), &storage)
            .await
            .unwrap();
        session.step(Message::data(1, vec![0; 512]), &storage).await.unwrap();

        let err = session.step(Message::data(3, vec![0; 512]), &storage).await.unwrap_err();
        assert!(matches!(err, TransferError::Protocol(_)));
        assert_eq!(
            err.reply(),
            Some(Message::error(TftpErrorCode::IllegalOperation, "expected block 2, got 3"))
        );
        assert_eq!(session.state(), ReceiverState::Failed);
    }

    #[tokio::test]
    async fn test_first_message_must_be_write_request() {
        let (_temp_dir, storage, mut session) = setup();
        let err = session.step(Message::data(1, vec![0; 10]), &storage).await.unwrap_err();
        assert_eq!(err.code(), TftpErrorCode::IllegalOperation);

        let (_temp_dir, storage, mut session) = setup();
        let read = Message::ReadRequest {
            filename: "a.bin".to_string(),
            mode: "octet".to_string(),
        };
        assert!(session.step(read, &storage).await.is_err());
    }

    #[tokio::test]
    async fn test_uncreatable_destination() {
        let (_temp_dir, storage, mut session) = setup();
        let err = session
            .step(Message::write_request("missing/dir/c.bin", "netascii"), &storage)
            .await
            .unwrap_err();
        assert_eq!(err.code(), TftpErrorCode::DiskFull);
        assert!(matches!(
            err.reply(),
            Some(Message::Error {
                code: TftpErrorCode::DiskFull,
                ..
            })
        ));
        assert_eq!(session.filename(), None);

        let (_temp_dir, storage, mut session) = setup();
        let err = session
            .step(Message::write_request("../escape.bin", "netascii"), &storage)
            .await
            .unwrap_err();
        assert_eq!(err.code(), TftpErrorCode::AccessViolation);
    }

    #[tokio::test]
    async fn test_peer_error_aborts_without_reply() {
        let (_temp_dir, storage, mut session) = setup();
        session
            .step(Message::write_request("a.bin", "netascii"), &storage)
            .await
            .unwrap();

        let err = session
            .step(Message::error(TftpErrorCode::NotDefined, "user abort"), &storage)
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::Remote { .. }));
        assert_eq!(err.reply(), None);
        assert_eq!(session.state(), ReceiverState::Failed);
    }

    #[tokio::test]
    async fn test_timeout_repeats_last_ack_and_final_data_is_reacked() {
        let (_temp_dir, storage, mut session) = setup();
        session
            .step(Message::write_request("a.bin", "netascii"), &storage)
            .await
            .unwrap();
        assert_eq!(session.on_timeout(), Message::ack(0));

        session.step(Message::data(1, vec![0; 512]), &storage).await.unwrap();
        assert_eq!(session.on_timeout(), Message::ack(1));

        session.step(Message::data(2, vec![0; 5]), &storage).await.unwrap();
        let step = session.step(Message::data(2, vec![0; 5]), &storage).await.unwrap();
        assert_eq!(step, ReceiverStep::Reply(Message::ack(2)));
        assert_eq!(session.state(), ReceiverState::Complete { last: 2 });
    }

    #[tokio::test]
    async fn test_block_counter_wraps() {
        let (_temp_dir, storage, mut session) = setup();
        session
            .step(Message::write_request("big.bin", "netascii"), &storage)
            .await
            .unwrap();
        session.state = ReceiverState::Receiving { last: u16::MAX };

        let step = session.step(Message::data(0, vec![0; 512]), &storage).await.unwrap();
        assert_eq!(step, ReceiverStep::Reply(Message::ack(0)));
        assert_eq!(session.state(), ReceiverState::Receiving { last: 0 });
    }

    fn fast_config() -> TransferConfig {
        TransferConfig {
            timeout: Duration::from_millis(30),
            max_retries: 3,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_receive_file_resends_ack_then_gives_up() {
        let temp_dir = tempdir().unwrap();
        let storage = DirectoryStorage::new(temp_dir.path());
        let (mut server, _client) = MemoryTransport::pair();
        let sent = server.sent();
        let (_stop, mut shutdown) = watch::channel(false);

        let request = packet(&Message::write_request("silent.bin", "netascii"));
        let result = receive_file(&mut server, &request, &storage, &fast_config(), |_| {}, &mut shutdown).await;

        assert!(matches!(result, Err(TransferError::Timeout { attempts: 3 })));
        assert_eq!(snapshot(&sent), vec![Message::ack(0); 3]);
        assert!(!temp_dir.path().join("silent.bin").exists());
    }

    #[tokio::test]
    async fn test_receive_file_discards_partial_file_on_gap() {
        let temp_dir = tempdir().unwrap();
        let storage = DirectoryStorage::new(temp_dir.path());
        let (mut server, mut client) = MemoryTransport::pair();
        let sent = server.sent();
        let (_stop, mut shutdown) = watch::channel(false);

        client.send(&packet(&Message::data(1, vec![1; 512]))).await.unwrap();
        client.send(&packet(&Message::data(5, vec![1; 512]))).await.unwrap();

        let request = packet(&Message::write_request("gap.bin", "netascii"));
        let mut reports = Vec::new();
        let result = receive_file(
            &mut server,
            &request,
            &storage,
            &fast_config(),
            |progress| reports.push(progress),
            &mut shutdown,
        )
        .await;

        assert!(matches!(result, Err(TransferError::Protocol(_))));
        assert_eq!(
            snapshot(&sent),
            vec![
                Message::ack(0),
                Message::ack(1),
                Message::error(TftpErrorCode::IllegalOperation, "expected block 2, got 5"),
            ]
        );
        assert_eq!(
            reports,
            vec![Progress {
                block: 1,
                block_count_hint: 0
            }]
        );
        assert!(!temp_dir.path().join("gap.bin").exists());
    }

    #[tokio::test]
    async fn test_receive_file_rejects_garbage_request() {
        let temp_dir = tempdir().unwrap();
        let storage = DirectoryStorage::new(temp_dir.path());
        let (mut server, _client) = MemoryTransport::pair();
        let sent = server.sent();
        let (_stop, mut shutdown) = watch::channel(false);

        let result = receive_file(&mut server, b"\x00\x02a.bin", &storage, &fast_config(), |_| {}, &mut shutdown).await;

        assert!(matches!(result, Err(TransferError::Decode(_))));
        assert!(matches!(
            snapshot(&sent).as_slice(),
            [Message::Error {
                code: TftpErrorCode::IllegalOperation,
                ..
            }]
        ));
    }
}
