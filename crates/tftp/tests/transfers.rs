use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use tempfile::tempdir;
use tftp::{
    ClientConfig, MAX_PACKET_SIZE, Message, Packet, Progress, TftpErrorCode, TftpServer, TransferConfig,
    TransferError, TransferEvent, Upload, UploadEvent, decode, encode, upload_all,
};
use tokio::net::UdpSocket;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(5);

fn loopback() -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0)
}

fn quick_transfers() -> TransferConfig {
    TransferConfig {
        timeout: Duration::from_millis(200),
        max_retries: 5,
        ..Default::default()
    }
}

struct RunningServer {
    addr: SocketAddr,
    events: broadcast::Receiver<TransferEvent>,
    stop: watch::Sender<bool>,
    task: JoinHandle<std::io::Result<()>>,
}

impl RunningServer {
    fn start(root: &Path) -> Self {
        Self::start_on(loopback(), root)
    }

    fn start_on(bind: SocketAddr, root: &Path) -> Self {
        let mut server = TftpServer::with_config(bind, root.to_path_buf());
        server.config_mut().transfer = quick_transfers();
        let addr = server.bind().unwrap();
        let events = server.subscribe();
        let (stop, shutdown) = watch::channel(false);
        let task = tokio::spawn(async move { server.run(shutdown).await });
        Self {
            addr,
            events,
            stop,
            task,
        }
    }

    async fn next_event(&mut self) -> TransferEvent {
        timeout(WAIT, self.events.recv()).await.unwrap().unwrap()
    }

    /// Wait for the next completion or failure, skipping start notifications
    async fn next_outcome(&mut self) -> TransferEvent {
        loop {
            match self.next_event().await {
                TransferEvent::Started { .. } => continue,
                outcome => return outcome,
            }
        }
    }

    async fn stop(self) {
        self.stop.send(true).unwrap();
        timeout(WAIT, self.task).await.unwrap().unwrap().unwrap();
    }
}

fn client_config(server: SocketAddr) -> ClientConfig {
    ClientConfig {
        server,
        transfer: quick_transfers(),
        ..Default::default()
    }
}

/// A hand-driven client for checking the server's exact replies
struct RawClient {
    socket: UdpSocket,
    server: SocketAddr,
}

impl RawClient {
    async fn new(server: SocketAddr) -> Self {
        Self {
            socket: UdpSocket::bind(loopback()).await.unwrap(),
            server,
        }
    }

    async fn send(&self, message: &Message, to: SocketAddr) {
        let mut packet: Packet = [0; MAX_PACKET_SIZE];
        let len = encode(message, &mut packet).unwrap();
        self.socket.send_to(&packet[..len], to).await.unwrap();
    }

    async fn recv(&self) -> (Message, SocketAddr) {
        let mut buf = [0u8; MAX_PACKET_SIZE + 1];
        let (len, from) = timeout(WAIT, self.socket.recv_from(&mut buf)).await.unwrap().unwrap();
        (decode(&buf[..len]).unwrap(), from)
    }

    /// Send a write request and return the worker's address
    async fn open(&self, filename: &str) -> SocketAddr {
        self.send(&Message::write_request(filename, "netascii"), self.server).await;
        let (reply, worker) = self.recv().await;
        assert_eq!(reply, Message::ack(0));
        worker
    }
}

/// A server on the wildcard address answers from the address the client used
#[cfg(target_os = "linux")]
#[tokio::test]
async fn test_wildcard_server_answers_from_addressed_ip() {
    let server_root = tempdir().unwrap();
    let local = tempdir().unwrap();
    let wildcard = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0);
    let mut server = RunningServer::start_on(wildcard, server_root.path());
    let secondary = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 2)), server.addr.port());

    let client = RawClient::new(secondary).await;
    let worker = client.open("raw.bin").await;
    assert_eq!(worker.ip(), secondary.ip());
    client.send(&Message::data(1, b"hi".to_vec()), worker).await;
    assert_eq!(client.recv().await, (Message::ack(1), worker));
    assert!(matches!(server.next_outcome().await, TransferEvent::Completed { .. }));

    let source = local.path().join("a.bin");
    std::fs::write(&source, vec![7u8; 1000]).unwrap();
    let (_stop, shutdown) = watch::channel(false);
    let outcomes = upload_all(&client_config(secondary), vec![Upload::from_path(&source)], shutdown, |_| {}).await;
    assert_eq!(outcomes[0].result.as_ref().unwrap().bytes, 1000);
    assert!(matches!(server.next_outcome().await, TransferEvent::Completed { .. }));
    assert_eq!(std::fs::read(server_root.path().join("a.bin")).unwrap(), vec![7u8; 1000]);

    server.stop().await;
}

#[tokio::test]
async fn test_upload_end_to_end() {
    let server_root = tempdir().unwrap();
    let local = tempdir().unwrap();
    let mut server = RunningServer::start(server_root.path());

    let contents: Vec<u8> = (0..1000u32).map(|i| (i % 251) as u8).collect();
    let source = local.path().join("a.bin");
    std::fs::write(&source, &contents).unwrap();

    let (_stop, shutdown) = watch::channel(false);
    let mut events = Vec::new();
    let outcomes = upload_all(
        &client_config(server.addr),
        vec![Upload::from_path(&source)],
        shutdown,
        |event| events.push(event),
    )
    .await;

    assert_eq!(outcomes.len(), 1);
    let summary = outcomes[0].result.as_ref().unwrap();
    assert_eq!((summary.blocks, summary.bytes), (2, 1000));

    let progress: Vec<Progress> = events
        .iter()
        .filter_map(|event| match event {
            UploadEvent::Progress { progress, .. } => Some(*progress),
            _ => None,
        })
        .collect();
    assert_eq!(
        progress,
        vec![
            Progress {
                block: 1,
                block_count_hint: 2
            },
            Progress {
                block: 2,
                block_count_hint: 2
            },
        ]
    );
    assert!(matches!(events.last(), Some(UploadEvent::Finished { result: Ok(_), .. })));

    match server.next_outcome().await {
        TransferEvent::Completed {
            filename, blocks, bytes, ..
        } => {
            assert_eq!(filename, "a.bin");
            assert_eq!((blocks, bytes), (2, 1000));
        }
        other => panic!("unexpected event {other:?}"),
    }
    assert_eq!(std::fs::read(server_root.path().join("a.bin")).unwrap(), contents);

    server.stop().await;
}

#[tokio::test]
async fn test_server_acks_each_block_in_order() {
    let server_root = tempdir().unwrap();
    let server = RunningServer::start(server_root.path());
    let client = RawClient::new(server.addr).await;

    let worker = client.open("a.bin").await;
    assert_ne!(worker, server.addr);

    client.send(&Message::data(1, vec![b'x'; 512]), worker).await;
    assert_eq!(client.recv().await, (Message::ack(1), worker));

    client.send(&Message::data(2, vec![b'y'; 488]), worker).await;
    assert_eq!(client.recv().await, (Message::ack(2), worker));

    server.stop().await;

    let contents = std::fs::read(server_root.path().join("a.bin")).unwrap();
    assert_eq!(contents.len(), 1000);
}

#[tokio::test]
async fn test_full_final_block_needs_empty_block() {
    let server_root = tempdir().unwrap();
    let mut server = RunningServer::start(server_root.path());
    let client = RawClient::new(server.addr).await;

    let worker = client.open("exact.bin").await;
    for block in 1..=3 {
        client.send(&Message::data(block, vec![0; 512]), worker).await;
        assert_eq!(client.recv().await.0, Message::ack(block));
    }

    // Three full blocks are not a complete file yet
    assert!(timeout(Duration::from_millis(100), server.events.recv()).await.is_ok()); // Started
    assert!(timeout(Duration::from_millis(100), server.events.recv()).await.is_err());

    client.send(&Message::data(4, Vec::new()), worker).await;
    assert_eq!(client.recv().await.0, Message::ack(4));
    assert!(matches!(
        server.next_outcome().await,
        TransferEvent::Completed { blocks: 4, bytes: 1536, .. }
    ));

    server.stop().await;
}

#[tokio::test]
async fn test_duplicate_data_does_not_grow_file() {
    let server_root = tempdir().unwrap();
    let server = RunningServer::start(server_root.path());
    let client = RawClient::new(server.addr).await;

    let worker = client.open("dup.bin").await;
    client.send(&Message::data(1, vec![1; 512]), worker).await;
    assert_eq!(client.recv().await.0, Message::ack(1));
    client.send(&Message::data(1, vec![1; 512]), worker).await;
    assert_eq!(client.recv().await.0, Message::ack(1));
    client.send(&Message::data(2, vec![2; 10]), worker).await;
    assert_eq!(client.recv().await.0, Message::ack(2));

    // The final ACK is repeated while the server lingers
    client.send(&Message::data(2, vec![2; 10]), worker).await;
    assert_eq!(client.recv().await.0, Message::ack(2));

    server.stop().await;
    assert_eq!(std::fs::read(server_root.path().join("dup.bin")).unwrap().len(), 522);
}

#[tokio::test]
async fn test_server_retransmits_ack_after_silence() {
    let server_root = tempdir().unwrap();
    let mut server = RunningServer::start(server_root.path());
    let client = RawClient::new(server.addr).await;

    let worker = client.open("slow.bin").await;
    let (repeat, from) = client.recv().await;
    assert_eq!((repeat, from), (Message::ack(0), worker));

    // A retransmitted request reaching the rendezvous is ignored; the worker keeps going
    client.send(&Message::write_request("slow.bin", "netascii"), server.addr).await;
    client.send(&Message::data(1, b"late".to_vec()), worker).await;
    loop {
        let (message, _) = client.recv().await;
        if message == Message::ack(1) {
            break;
        }
        assert_eq!(message, Message::ack(0));
    }

    assert!(matches!(
        server.next_outcome().await,
        TransferEvent::Completed { bytes: 4, .. }
    ));
    server.stop().await;
}

#[tokio::test]
async fn test_silent_client_times_out_and_partial_file_is_removed() {
    let server_root = tempdir().unwrap();
    let mut server = RunningServer::start(server_root.path());
    let client = RawClient::new(server.addr).await;

    let worker = client.open("gone.bin").await;
    client.send(&Message::data(1, vec![0; 512]), worker).await;
    assert_eq!(client.recv().await.0, Message::ack(1));

    match server.next_outcome().await {
        TransferEvent::Failed { filename, message, .. } => {
            assert_eq!(filename, "gone.bin");
            assert!(message.contains("no response"), "{message}");
        }
        other => panic!("unexpected event {other:?}"),
    }
    assert!(!server_root.path().join("gone.bin").exists());

    server.stop().await;
}

#[tokio::test]
async fn test_concurrent_uploads_are_isolated() {
    let server_root = tempdir().unwrap();
    let local = tempdir().unwrap();
    let mut server = RunningServer::start(server_root.path());

    // A directory in the way makes c.bin impossible to create
    std::fs::create_dir(server_root.path().join("c.bin")).unwrap();

    let mut uploads = Vec::new();
    for (name, size) in [("a.bin", 3000), ("b.bin", 700), ("c.bin", 1500)] {
        let path = local.path().join(name);
        std::fs::write(&path, vec![name.as_bytes()[0]; size]).unwrap();
        uploads.push(Upload::from_path(path));
    }

    let (_stop, shutdown) = watch::channel(false);
    let outcomes = upload_all(&client_config(server.addr), uploads, shutdown, |_| {}).await;

    assert_eq!(outcomes.len(), 3);
    assert_eq!(outcomes[0].result.as_ref().unwrap().bytes, 3000);
    assert_eq!(outcomes[1].result.as_ref().unwrap().bytes, 700);
    match &outcomes[2].result {
        Err(TransferError::Remote { code, .. }) => assert_eq!(*code, TftpErrorCode::DiskFull),
        other => panic!("unexpected result {other:?}"),
    }

    assert_eq!(std::fs::read(server_root.path().join("a.bin")).unwrap(), vec![b'a'; 3000]);
    assert_eq!(std::fs::read(server_root.path().join("b.bin")).unwrap(), vec![b'b'; 700]);

    let mut failed = 0;
    let mut completed = 0;
    while failed + completed < 3 {
        match server.next_outcome().await {
            TransferEvent::Completed { .. } => completed += 1,
            TransferEvent::Failed { code, .. } => {
                assert_eq!(code, TftpErrorCode::DiskFull);
                failed += 1;
            }
            TransferEvent::Started { .. } => unreachable!(),
        }
    }
    assert_eq!((completed, failed), (2, 1));

    server.stop().await;
}

#[tokio::test]
async fn test_garbage_does_not_disturb_server() {
    let server_root = tempdir().unwrap();
    let server = RunningServer::start(server_root.path());
    let client = RawClient::new(server.addr).await;

    for garbage in [&[][..], &[0][..], &[0, 2, b'a'][..], &[0, 9, 9, 9][..], &[0, 5, 0, 1][..]] {
        client.socket.send_to(garbage, server.addr).await.unwrap();
    }
    for _ in 0..5 {
        let (reply, from) = client.recv().await;
        assert_eq!(from, server.addr);
        assert!(matches!(
            reply,
            Message::Error {
                code: TftpErrorCode::IllegalOperation,
                ..
            }
        ));
    }

    // Still serving
    let worker = client.open("after.bin").await;
    client.send(&Message::data(1, b"ok".to_vec()), worker).await;
    assert_eq!(client.recv().await.0, Message::ack(1));

    server.stop().await;
}

#[tokio::test]
async fn test_shutdown_cancels_running_transfers() {
    let server_root = tempdir().unwrap();
    let mut server = RunningServer::start(server_root.path());
    let client = RawClient::new(server.addr).await;

    let worker = client.open("interrupted.bin").await;
    client.send(&Message::data(1, vec![0; 512]), worker).await;
    assert_eq!(client.recv().await.0, Message::ack(1));

    server.stop.send(true).unwrap();

    let reply = loop {
        let (message, from) = client.recv().await;
        assert_eq!(from, worker);
        if message != Message::ack(1) {
            break message;
        }
    };
    assert_eq!(reply, Message::error(TftpErrorCode::NotDefined, "transfer cancelled"));
    assert!(matches!(
        server.next_outcome().await,
        TransferEvent::Failed { code: TftpErrorCode::NotDefined, .. }
    ));

    timeout(WAIT, server.task).await.unwrap().unwrap().unwrap();
    assert!(!server_root.path().join("interrupted.bin").exists());
}
