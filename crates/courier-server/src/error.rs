//! Server error types.

use std::net::SocketAddr;

use courier_config::ConfigError;

/// Errors that stop the relay server from starting or running.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// `bind_address` in the config is not an IP literal.
    #[error("invalid bind address: {0:?}")]
    InvalidBindAddress(String),

    /// The listener could not be bound.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        /// Address that was requested.
        addr: SocketAddr,
        /// Underlying socket error.
        #[source]
        source: std::io::Error,
    },

    /// Loading the configuration failed.
    #[error(transparent)]
    Config(#[from] ConfigError),
}
