//! TFTP Write Transfers over UDP
//!
//! This crate implements the upload half of TFTP (RFC 1350):
//! - A bounds-checked wire codec for RRQ, WRQ, DATA, ACK and ERROR packets
//! - Sender and receiver state machines with bounded retransmission
//! - A server that runs every transfer on its own task and endpoint
//! - A client that uploads many files in parallel and reports progress
//! - Path confinement for received files
//!
//! Options negotiation (RFC 2347) and read transfers are not supported.
//!
//! # Protocol Organization
//!
//! - [`Message`], [`decode`], [`encode`] - the wire format
//! - [`Sender`], [`Session`] - the per-transfer state machines
//! - [`send_file`], [`receive_file`] - drivers running them over a [`Transport`]
//! - [`TftpServer`], [`upload_all`] - the supervisors
//!
//! # Basic Server Usage
//!
//! ```rust,no_run
//! use tftp::{TftpServer, TftpServerConfig};
//! use tokio::sync::watch;
//!
//! #[tokio::main]
//! async fn main() -> std::io::Result<()> {
//!     let config = TftpServerConfig {
//!         root_directory: "./incoming".into(),
//!         ..Default::default()
//!     };
//!     let (_stop, shutdown) = watch::channel(false);
//!
//!     TftpServer::new(config).run(shutdown).await
//! }
//! ```
//!
//! # Uploading Files
//!
//! ```rust,no_run
//! use tftp::{ClientConfig, Upload, upload_all};
//! use tokio::sync::watch;
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = ClientConfig {
//!         server: "127.0.0.1:6969".parse().unwrap(),
//!         ..Default::default()
//!     };
//!     let (_stop, shutdown) = watch::channel(false);
//!
//!     let uploads = vec![Upload::from_path("a.bin"), Upload::from_path("b.bin")];
//!     for outcome in upload_all(&config, uploads, shutdown, |_| {}).await {
//!         println!("{}: {:?}", outcome.filename, outcome.result);
//!     }
//! }
//! ```

mod client;
mod error;
mod protocol;
mod receiver;
mod registry;
mod sender;
mod server;
mod storage;
mod transfer;
mod transport;

#[cfg(test)]
mod testing;

pub use client::*;
pub use error::*;
pub use protocol::*;
pub use receiver::*;
pub use registry::*;
pub use sender::*;
pub use server::*;
pub use storage::*;
pub use transfer::{MAX_RETRIES, Progress, TIMEOUT_SECS, TransferConfig, TransferSummary};
pub use transport::*;
