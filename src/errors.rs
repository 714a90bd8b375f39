//! Top-level error type for gateway startup and supervision.
//!
//! Per-subsystem errors live next to the code that produces them
//! (`PacketError`, `CodecError`, `SignalingError`, ...). This type is what
//! reaches the process boundary in `main`.

use thiserror::Error;

use crate::config::ConfigError;
use crate::signaling::SignalingError;

/// Errors surfaced to the process boundary.
#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Signaling channel error: {0}")]
    Signaling(#[from] SignalingError),
}

/// Convenience result alias for gateway operations.
pub type GatewayResult<T> = Result<T, GatewayError>;
