use thiserror::Error;

use crate::constants::MAX_ATTACHMENT_SIZE;

/// Errors surfaced by the chat core.
///
/// The variants follow the failure taxonomy consumed by the UI: validation
/// failures never reach the network, transport failures are non-fatal
/// (the pipeline falls back to REST), request failures carry whatever the
/// server said, and cancellation is silent.
#[derive(Error, Debug)]
pub enum ChatError {
    /// Rejected locally before any network call.
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    /// Socket-level failure (not connected, connect error, send failure).
    #[error("Transport error: {0}")]
    Transport(String),

    /// A REST call was rejected by the server or failed on the network.
    #[error("Request failed: {message}")]
    Request {
        /// HTTP status, when a response was received at all.
        status: Option<u16>,
        message: String,
    },

    /// Caller-initiated cancellation; treated as a non-error by consumers.
    #[error("Request cancelled")]
    Cancelled,

    /// A pending send exceeded the send timeout.
    #[error("Send timed out")]
    Timeout,

    /// Wire payload could not be encoded or decoded.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Conversation/message bookkeeping failure.
    #[error("Store error: {0}")]
    Store(String),
}

impl ChatError {
    /// Whether this error should be silently dropped rather than surfaced.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, ChatError::Cancelled)
    }
}

/// Local input rejections, mirroring the server's own checks.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Message is empty")]
    EmptyMessage,

    #[error("File is {size} bytes, maximum is {} bytes", MAX_ATTACHMENT_SIZE)]
    FileTooLarge { size: usize },

    #[error("Unsupported file type: {mime}")]
    UnsupportedFileType { mime: String },
}

/// Convenience alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, ChatError>;
