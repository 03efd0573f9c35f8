//! The opaque platform boundary.
//!
//! A [`Gateway`] is whatever actually talks to the chat platform. The core only
//! ever needs to connect, disconnect, consume the event stream handed back by a
//! successful connect, and push three kinds of outbound payloads.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tokio::sync::mpsc;

use discord_bridge_protocol::{BotIdentity, ChannelId, EmbedPayload, GatewayEvent};

/// Errors reported by a gateway for connect and send calls.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GatewayError {
    /// Credentials rejected. Retrying cannot succeed.
    #[error("authentication rejected: {0}")]
    Auth(String),

    /// Transport-level failure (DNS, reset, timeout).
    #[error("network error: {0}")]
    Network(String),

    /// Platform rate limit hit.
    #[error("rate limited (retry after {retry_after:?})")]
    RateLimited { retry_after: Option<Duration> },

    /// Missing permission for the target channel.
    #[error("permission denied: {0}")]
    Permission(String),

    /// Anything else the platform rejected.
    #[error("gateway error: {0}")]
    Other(String),
}

impl GatewayError {
    /// Whether the same call may succeed if retried.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Network(_) | Self::RateLimited { .. })
    }
}

/// A live subscription returned by [`Gateway::connect`].
///
/// The event receiver closing is treated the same as
/// [`GatewayEvent::ConnectionLost`].
#[derive(Debug)]
pub struct GatewaySession {
    pub identity: BotIdentity,
    pub events: mpsc::Receiver<GatewayEvent>,
}

/// A file to upload, optionally with accompanying text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileAttachment {
    pub filename: String,
    pub data: Bytes,
    pub content: Option<String>,
}

impl FileAttachment {
    pub fn new(filename: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self {
            filename: filename.into(),
            data: data.into(),
            content: None,
        }
    }

    pub fn with_content(mut self, content: impl Into<String>) -> Self {
        self.content = Some(content.into());
        self
    }

    /// Read a file from disk. The upload name defaults to the file's basename.
    pub async fn from_path(path: &Path, filename: Option<&str>) -> std::io::Result<Self> {
        let data = tokio::fs::read(path).await?;
        let filename = match filename {
            Some(name) => name.to_string(),
            None => path
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or("file")
                .to_string(),
        };
        Ok(Self::new(filename, data))
    }
}

/// Connection to a chat platform.
#[async_trait]
pub trait Gateway: Send + Sync {
    /// Log in and subscribe to inbound events.
    ///
    /// Returns once the handshake has completed and the bot identity is known.
    async fn connect(&self, token: &str) -> Result<GatewaySession, GatewayError>;

    /// Close the current connection, if any.
    async fn disconnect(&self);

    /// Send one plain-text message. `text` is already within platform limits.
    async fn send_text(&self, channel: ChannelId, text: &str) -> Result<(), GatewayError>;

    /// Upload one file.
    async fn send_file(&self, channel: ChannelId, file: &FileAttachment) -> Result<(), GatewayError>;

    /// Send one embed.
    async fn send_embed(&self, channel: ChannelId, embed: &EmbedPayload)
    -> Result<(), GatewayError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn transient_classification() {
        assert!(GatewayError::Network("reset".into()).is_transient());
        assert!(GatewayError::RateLimited { retry_after: None }.is_transient());
        assert!(!GatewayError::Permission("missing send".into()).is_transient());
        assert!(!GatewayError::Auth("bad token".into()).is_transient());
        assert!(!GatewayError::Other("bad request".into()).is_transient());
    }

    #[tokio::test]
    async fn attachment_from_path_uses_basename() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "report body").unwrap();

        let attachment = FileAttachment::from_path(file.path(), None).await.unwrap();
        let expected = file.path().file_name().unwrap().to_str().unwrap();
        assert_eq!(attachment.filename, expected);
        assert_eq!(&attachment.data[..], b"report body");

        let renamed = FileAttachment::from_path(file.path(), Some("report.txt"))
            .await
            .unwrap();
        assert_eq!(renamed.filename, "report.txt");
    }

    #[tokio::test]
    async fn attachment_from_missing_path_fails() {
        let result = FileAttachment::from_path(Path::new("/definitely/not/here.bin"), None).await;
        assert!(result.is_err());
    }
}
