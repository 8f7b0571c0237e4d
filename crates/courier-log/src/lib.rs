//! Structured logging for Courier.
//!
//! Sets up the `tracing` subscriber used by the relay server and by host
//! applications embedding the client: console output with uptime timestamps
//! and module paths, an optional JSON log file, and `RUST_LOG`-style filtering
//! that falls back to the configured level.

use std::path::Path;

use courier_config::LogConfig;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Filter used when neither `RUST_LOG` nor the config supplies one.
const DEFAULT_FILTER: &str = "info";

/// Name of the JSON log file written inside the configured log directory.
pub const LOG_FILE_NAME: &str = "courier.log";

/// Resolve the filter directive: config level if non-empty, else the default.
fn filter_directive(config: Option<&LogConfig>) -> String {
    match config {
        Some(config) if !config.log_level.trim().is_empty() => config.log_level.clone(),
        _ => DEFAULT_FILTER.to_string(),
    }
}

/// Initialize the global tracing subscriber.
///
/// `RUST_LOG` takes precedence over `config.log_level`. When `config.log_dir`
/// is set and the directory can be created, a JSON file layer is added next
/// to the console layer.
///
/// ```no_run
/// use courier_config::LogConfig;
///
/// courier_log::init_logging(Some(&LogConfig::default()));
/// ```
pub fn init_logging(config: Option<&LogConfig>) {
    let filter_str = filter_directive(config);
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&filter_str));

    let console_layer = fmt::layer()
        .with_target(true)
        .with_thread_names(true)
        .with_level(true)
        .with_timer(fmt::time::uptime());

    let subscriber = tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer);

    if let Some(log_file) = config
        .and_then(|c| c.log_dir.as_deref())
        .and_then(open_log_file)
    {
        let file_layer = fmt::layer()
            .with_writer(log_file)
            .with_ansi(false)
            .with_target(true)
            .with_timer(fmt::time::uptime())
            .json();

        subscriber.with(file_layer).init();
        return;
    }

    subscriber.init();
}

/// Create the log directory and open the log file inside it.
fn open_log_file(log_dir: &Path) -> Option<std::fs::File> {
    std::fs::create_dir_all(log_dir).ok()?;
    std::fs::File::create(log_dir.join(LOG_FILE_NAME)).ok()
}

/// Create an `EnvFilter` with the default filter string.
pub fn default_env_filter() -> EnvFilter {
    EnvFilter::new(DEFAULT_FILTER)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_log_level() {
        let filter = default_env_filter();
        assert!(format!("{filter}").contains("info"));
    }

    #[test]
    fn test_config_level_wins_over_default() {
        let config = LogConfig {
            log_level: "debug,courier_net=trace".to_string(),
            log_dir: None,
        };
        assert_eq!(filter_directive(Some(&config)), "debug,courier_net=trace");
    }

    #[test]
    fn test_blank_config_level_falls_back() {
        let config = LogConfig {
            log_level: "  ".to_string(),
            log_dir: None,
        };
        assert_eq!(filter_directive(Some(&config)), DEFAULT_FILTER);
        assert_eq!(filter_directive(None), DEFAULT_FILTER);
    }

    #[test]
    fn test_env_filter_parsing() {
        let valid_filters = [
            "info",
            "debug,courier_server=trace",
            "warn,courier_net=debug",
            "error",
        ];
        for filter_str in &valid_filters {
            assert!(
                EnvFilter::try_from(*filter_str).is_ok(),
                "Failed to parse filter: {filter_str}"
            );
        }
    }

    #[test]
    fn test_log_file_created_in_missing_dir() {
        let temp_dir = tempfile::tempdir().unwrap();
        let nested = temp_dir.path().join("nested").join("logs");

        let file = open_log_file(&nested);
        assert!(file.is_some());
        assert!(nested.join(LOG_FILE_NAME).exists());
    }
}
