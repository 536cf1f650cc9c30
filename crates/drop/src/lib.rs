//! Command-line front ends for the `tftp` upload engine.
//!
//! - `drop` uploads one or more files (or standard input) to a server.
//! - `dropd` receives uploads into a directory.
//!
//! Both read defaults from a configuration file, see [`config`].

pub mod config;
pub mod net;
pub mod progress;

use tracing_subscriber::EnvFilter;

/// Install the tracing subscriber. `RUST_LOG` wins over `verbose`.
pub fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).init();
}
