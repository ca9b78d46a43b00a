//! Error types for flash orchestration

use thiserror::Error;
use uf2b_core::{ImageError, SnapshotError, StatusCode};

/// Result type alias for flash operations
pub type Result<T> = std::result::Result<T, FlashError>;

/// Errors that can occur while talking to the controller or flashing devices
#[derive(Debug, Error)]
pub enum FlashError {
    /// HTTP request failed
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Invalid URL
    #[error("URL parse error: {0}")]
    Url(#[from] url::ParseError),

    /// Local I/O failure
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Controller answered with a non-success status
    #[error("Server error ({status}): {message}")]
    Server { status: u16, message: String },

    /// Response body could not be decoded
    #[error("Parse error: {0}")]
    Parse(String),

    /// Status array did not match the configured board
    #[error("Invalid status snapshot: {0}")]
    Snapshot(#[from] SnapshotError),

    /// The awaited device raised its error flag
    #[error("Unexpected status code on device {device}: 0x{code:02x}")]
    Protocol { device: usize, code: StatusCode },

    /// A wait condition was not met before its deadline
    #[error("{message} (device {device})")]
    TimedOut { device: usize, message: String },

    /// A flash run is already active
    #[error("A flash run is already in progress")]
    Busy,

    /// Device index outside the board
    #[error("Device {device} out of range (capacity {capacity})")]
    InvalidDevice { device: usize, capacity: usize },

    /// Firmware image unusable
    #[error("Invalid firmware image: {0}")]
    Image(#[from] ImageError),

    /// Configuration rejected
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// A wait was abandoned before it resolved
    #[error("Wait on device {device} abandoned")]
    Abandoned { device: usize },
}

impl FlashError {
    /// Create a server error from status code and message
    pub fn server_error(status: u16, message: impl Into<String>) -> Self {
        Self::Server {
            status,
            message: message.into(),
        }
    }

    /// Whether the failure happened at the network boundary
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            Self::Http(_)
                | Self::Url(_)
                | Self::Io(_)
                | Self::Server { .. }
                | Self::Parse(_)
                | Self::Snapshot(_)
        )
    }

    /// Status code carried by a protocol error
    pub fn status_code(&self) -> Option<StatusCode> {
        match self {
            Self::Protocol { code, .. } => Some(*code),
            _ => None,
        }
    }
}
