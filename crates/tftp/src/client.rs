//! Upload Supervisor
//!
//! [`upload_all`] uploads any number of files in parallel. Every file gets a
//! worker task with its own endpoint and file handle. Workers report
//! progress over a channel tagged with their worker id; the supervisor
//! multiplexes that channel and worker completion and hands everything to
//! the caller as [`UploadEvent`]s. A failing or panicking worker only
//! affects its own file.

use std::net::{IpAddr, Ipv6Addr, SocketAddr};
use std::path::{Path, PathBuf};

use tokio::fs::File;
use tokio::io::AsyncRead;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;

use crate::error::TransferError;
use crate::sender::send_file;
use crate::server::DEFAULT_PORT;
use crate::transfer::{Progress, TransferConfig, TransferSummary, isolate};
use crate::transport::ClientSocket;

/// Position of an upload in the list given to [`upload_all`]
pub type WorkerId = usize;

/// Remote name used for uploads read from standard input
pub const STDIN_NAME: &str = "stdin";

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// The server's well-known address
    pub server: SocketAddr,
    pub v6only: bool,
    pub transfer: TransferConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server: SocketAddr::new(IpAddr::V6(Ipv6Addr::LOCALHOST), DEFAULT_PORT),
            v6only: false,
            transfer: TransferConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadSource {
    Path(PathBuf),
    Stdin,
}

/// One file to upload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Upload {
    /// Name the server stores the file under
    pub remote_name: String,
    pub source: UploadSource,
}

impl Upload {
    /// Upload a local file under its base name
    pub fn from_path(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let remote_name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        Self {
            remote_name,
            source: UploadSource::Path(path),
        }
    }

    pub fn stdin() -> Self {
        Self {
            remote_name: STDIN_NAME.to_string(),
            source: UploadSource::Stdin,
        }
    }

    /// `-` means standard input, anything else a local path
    pub fn from_arg(arg: &str) -> Self {
        if arg == "-" {
            Self::stdin()
        } else {
            Self::from_path(arg)
        }
    }
}

/// Emitted by [`upload_all`] as uploads advance
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadEvent {
    Started {
        worker: WorkerId,
        filename: String,
    },
    Progress {
        worker: WorkerId,
        progress: Progress,
    },
    Finished {
        worker: WorkerId,
        result: Result<TransferSummary, String>,
    },
}

/// Final result of one upload
#[derive(Debug)]
pub struct UploadOutcome {
    pub worker: WorkerId,
    pub filename: String,
    pub result: Result<TransferSummary, TransferError>,
}

impl UploadOutcome {
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }
}

type SourceReader = Box<dyn AsyncRead + Unpin + Send>;

async fn open_source(source: &UploadSource) -> Result<(SourceReader, Option<u64>), TransferError> {
    match source {
        UploadSource::Path(path) => open_file(path).await,
        UploadSource::Stdin => Ok((Box::new(tokio::io::stdin()), None)),
    }
}

async fn open_file(path: &Path) -> Result<(SourceReader, Option<u64>), TransferError> {
    let file = File::open(path).await.map_err(TransferError::Storage)?;
    let size = file.metadata().await.ok().map(|metadata| metadata.len());
    Ok((Box::new(file), size))
}

async fn upload_one(
    worker: WorkerId,
    upload: Upload,
    config: ClientConfig,
    progress: mpsc::UnboundedSender<(WorkerId, Progress)>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<TransferSummary, TransferError> {
    let (mut source, size) = open_source(&upload.source).await?;
    let mut transport = ClientSocket::open(config.server, config.v6only).map_err(TransferError::Transport)?;

    send_file(
        &mut transport,
        &upload.remote_name,
        &mut source,
        size,
        &config.transfer,
        |update| {
            // The supervisor may have stopped listening; the upload carries on regardless
            let _ = progress.send((worker, update));
        },
        &mut shutdown,
    )
    .await
}

/// Upload every file in `uploads` concurrently.
///
/// Returns one outcome per upload, in input order. `on_event` sees every
/// start, progress report and completion as it happens.
pub async fn upload_all<F>(
    config: &ClientConfig,
    uploads: Vec<Upload>,
    shutdown: watch::Receiver<bool>,
    mut on_event: F,
) -> Vec<UploadOutcome>
where
    F: FnMut(UploadEvent),
{
    let (progress_tx, mut progress_rx) = mpsc::unbounded_channel();
    let mut workers: JoinSet<(WorkerId, Result<TransferSummary, TransferError>)> = JoinSet::new();
    let mut outcomes: Vec<Option<UploadOutcome>> = Vec::with_capacity(uploads.len());

    for (worker, upload) in uploads.into_iter().enumerate() {
        tracing::info!("Uploading '{}' to {} as '{}'", describe(&upload.source), config.server, upload.remote_name);
        on_event(UploadEvent::Started {
            worker,
            filename: upload.remote_name.clone(),
        });
        outcomes.push(Some(UploadOutcome {
            worker,
            filename: upload.remote_name.clone(),
            result: Err(TransferError::Cancelled),
        }));

        let transfer = upload_one(worker, upload, config.clone(), progress_tx.clone(), shutdown.clone());
        workers.spawn(async move { (worker, isolate(transfer).await) });
    }
    drop(progress_tx);

    loop {
        tokio::select! {
            biased;
            Some((worker, progress)) = progress_rx.recv() => {
                on_event(UploadEvent::Progress { worker, progress });
            }
            joined = workers.join_next() => match joined {
                None => break,
                Some(Ok((worker, result))) => {
                    match &result {
                        Ok(summary) => tracing::info!(
                            "Uploaded '{}' ({} blocks, {} bytes)",
                            summary.filename,
                            summary.blocks,
                            summary.bytes
                        ),
                        Err(e) => tracing::warn!("Upload #{} failed: {}", worker, e),
                    }
                    on_event(UploadEvent::Finished {
                        worker,
                        result: result.as_ref().cloned().map_err(ToString::to_string),
                    });
                    if let Some(Some(outcome)) = outcomes.get_mut(worker) {
                        outcome.result = result;
                    }
                }
                Some(Err(e)) => tracing::error!("Upload supervisor task failed: {}", e),
            },
        }
    }

    outcomes.into_iter().flatten().collect()
}

fn describe(source: &UploadSource) -> String {
    match source {
        UploadSource::Path(path) => path.display().to_string(),
        UploadSource::Stdin => "standard input".to_string(),
    }
}
