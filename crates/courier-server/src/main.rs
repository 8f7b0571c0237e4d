//! Courier relay server binary.
//!
//! Run with: `cargo run -p courier-server -- --port 38281`

use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use courier_config::{CliArgs, Config, default_config_dir};
use courier_server::{RelayServer, ServerError, ServerOptions};
use tracing::{error, info};

fn load_config(args: &CliArgs) -> Result<Config, ServerError> {
    let dir = match &args.config {
        Some(dir) => dir.clone(),
        None => default_config_dir()?,
    };
    let mut config = Config::load_or_create(&dir)?;
    config.apply_cli_overrides(args);
    Ok(config)
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = CliArgs::parse();

    let config = match load_config(&args) {
        Ok(config) => config,
        Err(e) => {
            // Logging is not up yet; fall back to defaults plus CLI overrides.
            eprintln!("courier-server: {e}; using defaults");
            let mut config = Config::default();
            config.apply_cli_overrides(&args);
            config
        }
    };

    courier_log::init_logging(Some(&config.log));

    let options = match ServerOptions::from_config(&config.server) {
        Ok(options) => options,
        Err(e) => {
            error!(error = %e, "invalid server configuration");
            return ExitCode::FAILURE;
        }
    };
    info!(
        bind = %options.bind_addr,
        max_connections = options.max_connections,
        "Courier relay starting"
    );

    let server = Arc::new(RelayServer::new(options));
    let signal_server = Arc::clone(&server);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Ctrl+C received");
            signal_server.shutdown();
        }
    });

    match server.run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "relay stopped");
            ExitCode::FAILURE
        }
    }
}
