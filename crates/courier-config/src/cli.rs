//! Command-line argument parsing for Courier binaries.

use std::path::PathBuf;

use clap::Parser;

use crate::Config;

/// Courier command-line arguments.
///
/// CLI values override settings loaded from `config.ron`.
#[derive(Parser, Debug, Default)]
#[command(name = "courier", about = "Courier item relay")]
pub struct CliArgs {
    /// Relay host for clients.
    #[arg(long)]
    pub host: Option<String>,

    /// Port (used for both the client target and the server listener).
    #[arg(long)]
    pub port: Option<u16>,

    /// Server bind address.
    #[arg(long)]
    pub bind: Option<String>,

    /// Log level (error, warn, info, debug, trace).
    #[arg(long)]
    pub log_level: Option<String>,

    /// Directory for JSON log output.
    #[arg(long)]
    pub log_dir: Option<PathBuf>,

    /// Path to config directory (overrides default location).
    #[arg(long)]
    pub config: Option<PathBuf>,
}

impl Config {
    /// Apply CLI overrides to a loaded config.
    pub fn apply_cli_overrides(&mut self, args: &CliArgs) {
        if let Some(ref host) = args.host {
            self.network.server_address = host.clone();
        }
        if let Some(port) = args.port {
            self.network.server_port = port;
            self.server.port = port;
        }
        if let Some(ref bind) = args.bind {
            self.server.bind_address = bind.clone();
        }
        if let Some(ref level) = args.log_level {
            self.log.log_level = level.clone();
        }
        if let Some(ref dir) = args.log_dir {
            self.log.log_dir = Some(dir.clone());
        }
    }
}
