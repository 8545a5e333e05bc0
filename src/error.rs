use std::net::SocketAddr;

use thiserror::Error;

/// Relay-wide error type
#[derive(Error, Debug)]
pub enum RelayError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Poll error: {0}")]
    Poll(#[from] nix::Error),

    #[error("Capacity exhausted: no free {resource}")]
    CapacityExhausted { resource: &'static str },

    #[error("Internal endpoint {0} is already free")]
    EndpointAlreadyFree(usize),

    #[error("Display slot {0} is already free")]
    SlotAlreadyFree(usize),
}

/// Result type alias for relay operations
pub type Result<T> = std::result::Result<T, RelayError>;
