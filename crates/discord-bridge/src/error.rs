//! Bridge error types.

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

use crate::gateway::GatewayError;

/// Which outbound operation failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOperation {
    Text,
    File,
    Embed,
}

impl fmt::Display for SendOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Text => "text",
            Self::File => "file",
            Self::Embed => "embed",
        })
    }
}

/// A single delivery operation failed after its local retries.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MessageSendError {
    /// The gateway rejected a send. `chunk` is 1-based.
    #[error(
        "failed to send {operation} (chunk {chunk}/{chunks}) after {attempts} attempt(s): {source}"
    )]
    Delivery {
        operation: SendOperation,
        chunk: usize,
        chunks: usize,
        attempts: u32,
        #[source]
        source: GatewayError,
    },

    /// A local file could not be read for upload.
    #[error("failed to read attachment {}: {message}", path.display())]
    Attachment { path: PathBuf, message: String },
}

impl MessageSendError {
    /// The gateway error behind a failed delivery, if any.
    pub fn gateway_error(&self) -> Option<&GatewayError> {
        match self {
            Self::Delivery { source, .. } => Some(source),
            Self::Attachment { .. } => None,
        }
    }
}

/// Errors surfaced by the bridge runtime.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BridgeError {
    /// Login or handshake failed permanently.
    #[error("failed to connect: {0}")]
    Connection(GatewayError),

    /// The reconnection ceiling was reached.
    #[error("reconnection failed after {attempts} attempt(s): {last_error}")]
    ReconnectExhausted {
        attempts: u32,
        last_error: GatewayError,
    },

    #[error(transparent)]
    MessageSend(#[from] MessageSendError),

    /// The bridge was stopped before the awaited condition was reached.
    #[error("bridge stopped")]
    Stopped,
}
