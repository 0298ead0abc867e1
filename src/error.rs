//! Error types for cntdns.

use std::time::Duration;

use hickory_server::proto::error::ProtoError;
use thiserror::Error;

/// Errors that can occur while discovering, reconciling or serving.
#[derive(Debug, Error)]
pub enum Error {
    /// Docker Engine API error
    #[error("Docker API error: {0}")]
    Docker(#[from] bollard::errors::Error),

    /// The Docker inventory did not arrive in time
    #[error("Docker inventory fetch timed out after {0:?}")]
    InventoryTimeout(Duration),

    /// IO error (sockets, files)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration could not be loaded or is inconsistent
    #[error("Invalid configuration: {0}")]
    Config(#[from] figment::Error),

    /// A manual declaration failed validation
    #[error("Invalid manual declaration `{name}`: {reason}")]
    InvalidDeclaration { name: String, reason: String },

    /// A blocking helper task panicked or was cancelled
    #[error("Background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    /// DNS protocol error
    #[error("DNS protocol error: {0}")]
    Proto(#[from] ProtoError),
}

pub type Result<T> = std::result::Result<T, Error>;
