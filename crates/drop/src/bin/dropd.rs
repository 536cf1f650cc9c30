//! dropd - receive uploads into a directory

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use argh::FromArgs;
use drop::config::from_env_with_config;
use drop::init_logging;
use drop::net::split_host_port;
use tftp::{DEFAULT_PORT, TftpServer, TftpServerConfig, TransferConfig, TransferEvent, resolve};
use tokio::sync::{broadcast, watch};

const PROGRAM: &str = "dropd";
const ALIASES: &[(char, &str)] = &[('r', "root"), ('v', "verbose")];
const DEFAULT_BIND: &str = "[::]:6969";

#[derive(FromArgs, Debug)]
#[argh(
    description = "Drop box server - stores files uploaded with drop",
    example = "Receive into /srv/inbox on the default port:\n  {command_name} --root /srv/inbox",
    example = "IPv4 only, port 69 (requires privileges):\n  {command_name} 0.0.0.0:69",
    note = "Defaults are read from $XDG_CONFIG_HOME/dropd.conf, one long option name and value per line."
)]
struct Cli {
    #[argh(
        option,
        short = 'r',
        description = "directory uploads are stored in",
        default = "PathBuf::from(\".\")"
    )]
    root: PathBuf,

    #[argh(switch, description = "do not accept IPv4 on IPv6 sockets")]
    v6only: bool,

    #[argh(option, description = "seconds to wait before retransmitting", default = "tftp::TIMEOUT_SECS")]
    timeout: u64,

    #[argh(option, description = "silent intervals before a transfer is abandoned", default = "tftp::MAX_RETRIES")]
    retries: usize,

    #[argh(switch, short = 'v', description = "enable debug logging")]
    verbose: bool,

    #[argh(positional, description = "address to listen on", default = "DEFAULT_BIND.to_string()")]
    bind: String,
}

impl Cli {
    async fn server_config(&self) -> Result<TftpServerConfig> {
        if self.timeout == 0 {
            bail!("Timeout must be at least one second");
        }
        if self.retries == 0 {
            bail!("Retries must be at least one");
        }
        if !self.root.is_dir() {
            bail!("Root directory '{}' does not exist", self.root.display());
        }

        let (host, port) = split_host_port(&self.bind, DEFAULT_PORT)?;
        let bind_address = resolve(&host, port, true)
            .await
            .with_context(|| format!("Failed to resolve bind address '{}'", self.bind))?;

        Ok(TftpServerConfig {
            bind_address,
            root_directory: self.root.clone(),
            v6only: self.v6only,
            transfer: TransferConfig {
                timeout: Duration::from_secs(self.timeout),
                max_retries: self.retries,
                ..TransferConfig::default()
            },
        })
    }
}

/// Print completed transfers to stdout as they happen
async fn report(mut events: broadcast::Receiver<TransferEvent>) {
    loop {
        match events.recv().await {
            Ok(TransferEvent::Completed {
                peer, filename, bytes, ..
            }) => println!("{} from {} ({} bytes)", filename, peer, bytes),
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                tracing::warn!("Transfer report skipped {} events", missed);
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli: Cli = from_env_with_config(PROGRAM, ALIASES)?;
    init_logging(cli.verbose);

    let config = cli.server_config().await?;
    let mut server = TftpServer::new(config);
    let local = server.bind().context("Failed to bind server socket")?;

    let reporter = tokio::spawn(report(server.subscribe()));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Interrupted, shutting down");
            let _ = shutdown_tx.send(true);
        }
    });

    server
        .run(shutdown_rx)
        .await
        .with_context(|| format!("Server on {} failed", local))?;

    drop(server);
    let _ = reporter.await;
    Ok(())
}
