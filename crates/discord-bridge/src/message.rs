//! Normalized inbound messages and their reply operations.

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::debug;

use discord_bridge_protocol::{ChannelId, EmbedPayload, MessageId, RawMessage, UserId};

use crate::delivery::OutboundDelivery;
use crate::error::MessageSendError;
use crate::gateway::FileAttachment;

/// Where replies to a message go.
#[derive(Clone)]
pub struct ReplyTarget {
    channel: ChannelId,
    delivery: Arc<OutboundDelivery>,
}

impl ReplyTarget {
    pub fn new(channel: ChannelId, delivery: Arc<OutboundDelivery>) -> Self {
        Self { channel, delivery }
    }

    pub fn channel(&self) -> ChannelId {
        self.channel
    }
}

impl fmt::Debug for ReplyTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReplyTarget")
            .field("channel", &self.channel)
            .finish_non_exhaustive()
    }
}

/// A received chat message, prefix-stripped, with a handle for replying.
///
/// Immutable once built. Replies always go back to the originating channel.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    id: MessageId,
    content: String,
    author_id: UserId,
    author_name: String,
    channel_id: ChannelId,
    is_dm: bool,
    received_at: DateTime<Utc>,
    reply_to: ReplyTarget,
}

impl InboundMessage {
    /// Build from a raw gateway message and its already-normalized content.
    pub fn from_raw(raw: RawMessage, content: impl Into<String>, delivery: Arc<OutboundDelivery>) -> Self {
        let author_name = raw.author.display_name().to_string();
        Self {
            id: raw.id,
            content: content.into(),
            author_id: raw.author.id,
            author_name,
            channel_id: raw.channel_id,
            is_dm: raw.is_dm,
            received_at: raw.timestamp,
            reply_to: ReplyTarget::new(raw.channel_id, delivery),
        }
    }

    pub fn id(&self) -> MessageId {
        self.id
    }

    /// Message text without the command prefix and surrounding whitespace.
    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn author_id(&self) -> UserId {
        self.author_id
    }

    /// Display name, falling back to the account name.
    pub fn author_name(&self) -> &str {
        &self.author_name
    }

    pub fn channel_id(&self) -> ChannelId {
        self.channel_id
    }

    pub fn is_dm(&self) -> bool {
        self.is_dm
    }

    pub fn received_at(&self) -> DateTime<Utc> {
        self.received_at
    }

    pub fn reply_target(&self) -> &ReplyTarget {
        &self.reply_to
    }

    /// Reply with plain text. Long text is split and paced automatically.
    pub async fn reply(&self, text: &str) -> Result<(), MessageSendError> {
        self.reply_to
            .delivery
            .send_text(self.reply_to.channel, text)
            .await
            .map(|_| ())
    }

    /// Reply with a file read from disk.
    ///
    /// The upload name is the file's basename. A missing or unreadable file
    /// fails before anything is sent.
    pub async fn reply_with_file(
        &self,
        path: impl AsRef<Path>,
        content: Option<&str>,
    ) -> Result<(), MessageSendError> {
        let path = path.as_ref();
        let mut file = FileAttachment::from_path(path, None).await.map_err(|e| {
            MessageSendError::Attachment {
                path: path.to_path_buf(),
                message: e.to_string(),
            }
        })?;
        if let Some(content) = content {
            file = file.with_content(content);
        }
        self.reply_with_attachment(&file).await
    }

    /// Reply with an in-memory file.
    pub async fn reply_with_attachment(&self, file: &FileAttachment) -> Result<(), MessageSendError> {
        self.reply_to
            .delivery
            .send_file(self.reply_to.channel, file)
            .await
    }

    /// Reply with a rich embed.
    pub async fn reply_with_embed(&self, embed: &EmbedPayload) -> Result<(), MessageSendError> {
        debug!(channel = %self.reply_to.channel, "Sending embed reply");
        self.reply_to
            .delivery
            .send_embed(self.reply_to.channel, embed)
            .await
    }
}
