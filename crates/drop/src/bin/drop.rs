//! drop - upload files to a TFTP-style drop box

use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use argh::FromArgs;
use drop::config::from_env_with_config;
use drop::init_logging;
use drop::net::{split_host_port, with_interface_scope};
use drop::progress::{UploadProgress, format_bytes};
use tftp::{ClientConfig, DEFAULT_PORT, TransferConfig, Upload, UploadOutcome, resolve, upload_all};
use tokio::sync::watch;

const PROGRAM: &str = "drop";
const ALIASES: &[(char, &str)] = &[('p', "port"), ('i', "interface"), ('v', "verbose")];

#[derive(FromArgs, Debug)]
#[argh(
    description = "Upload files to a drop box server",
    example = "Upload two files:\n  {command_name} 10.0.1.50 boot.img notes.txt",
    example = "Upload standard input as 'stdin' over a link-local address:\n  tar c dir | {command_name} -i eth0 fe80::1 -",
    note = "Defaults are read from $XDG_CONFIG_HOME/drop.conf, one long option name and value per line."
)]
struct Cli {
    #[argh(option, short = 'p', description = "server port", default = "DEFAULT_PORT")]
    port: u16,

    #[argh(option, short = 'i', description = "network interface for link-local IPv6 servers")]
    interface: Option<String>,

    #[argh(switch, description = "do not accept IPv4 on IPv6 sockets")]
    v6only: bool,

    #[argh(option, description = "seconds to wait before retransmitting", default = "tftp::TIMEOUT_SECS")]
    timeout: u64,

    #[argh(option, description = "transmissions of one packet before giving up", default = "tftp::MAX_RETRIES")]
    retries: usize,

    #[argh(switch, short = 'v', description = "enable debug logging")]
    verbose: bool,

    #[argh(positional, description = "server host name or address")]
    host: String,

    #[argh(positional, description = "files to upload, '-' for standard input")]
    files: Vec<String>,
}

impl Cli {
    async fn client_config(&self) -> Result<ClientConfig> {
        if self.files.is_empty() {
            bail!("No files to upload");
        }
        if self.timeout == 0 {
            bail!("Timeout must be at least one second");
        }
        if self.retries == 0 {
            bail!("Retries must be at least one");
        }
        if self.files.iter().filter(|file| *file == "-").count() > 1 {
            bail!("Standard input can only be uploaded once");
        }

        let (host, port) = split_host_port(&self.host, self.port)?;
        let mut server = resolve(&host, port, false)
            .await
            .with_context(|| format!("Failed to resolve '{}'", self.host))?;
        if let Some(interface) = &self.interface {
            server = with_interface_scope(server, interface)?;
        }

        Ok(ClientConfig {
            server,
            v6only: self.v6only,
            transfer: TransferConfig {
                timeout: Duration::from_secs(self.timeout),
                max_retries: self.retries,
                ..TransferConfig::default()
            },
        })
    }
}

fn print_summary(outcomes: &[UploadOutcome]) {
    for outcome in outcomes {
        match &outcome.result {
            Ok(summary) => println!(
                "{}: sent {} in {} blocks",
                outcome.filename,
                format_bytes(summary.bytes),
                summary.blocks
            ),
            Err(e) => println!("{}: failed: {}", outcome.filename, e),
        }
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli: Cli = from_env_with_config(PROGRAM, ALIASES)?;
    init_logging(cli.verbose);

    let config = cli.client_config().await?;
    let uploads: Vec<Upload> = cli.files.iter().map(|file| Upload::from_arg(file)).collect();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Interrupted, cancelling uploads");
            let _ = shutdown_tx.send(true);
        }
    });

    let mut progress = UploadProgress::new();
    let outcomes = upload_all(&config, uploads, shutdown_rx, |event| progress.handle(&event)).await;
    print_summary(&outcomes);

    let failed = outcomes.iter().filter(|outcome| !outcome.is_success()).count();
    if failed > 0 {
        tracing::error!("{} of {} uploads failed", failed, outcomes.len());
        return Ok(ExitCode::FAILURE);
    }
    Ok(ExitCode::SUCCESS)
}
