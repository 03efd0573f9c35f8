//! Gateway boundary types for discord-bridge.
//!
//! These are the plain values that cross between a platform gateway
//! (serenity, a test double, a subprocess) and the bridge core:
//!
//! - [`GatewayEvent`]: pushed by the gateway after a successful connect
//! - [`RawMessage`]: an unfiltered chat message as the platform delivered it
//! - [`BotIdentity`]: who the bridge is logged in as
//! - [`EmbedPayload`]: a rich embed reply
//!
//! Nothing here performs I/O. Gateways translate their platform's models into
//! these types so the core never depends on a specific client library.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ============================================================================
// Identifiers
// ============================================================================

macro_rules! snowflake {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub u64);

        impl $name {
            pub const fn get(self) -> u64 {
                self.0
            }
        }

        impl From<u64> for $name {
            fn from(id: u64) -> Self {
                Self(id)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

snowflake!(
    /// A text channel or DM channel. Replies are addressed with this.
    ChannelId
);
snowflake!(
    /// A user or bot account.
    UserId
);
snowflake!(
    /// A single platform message.
    MessageId
);

// ============================================================================
// Inbound
// ============================================================================

/// The account that authored a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Author {
    pub id: UserId,
    /// Account (user) name.
    pub name: String,
    /// Per-user display name, when the user has set one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default)]
    pub bot: bool,
}

impl Author {
    /// Display name, falling back to the account name.
    pub fn display_name(&self) -> &str {
        self.display_name
            .as_deref()
            .filter(|name| !name.is_empty())
            .unwrap_or(&self.name)
    }
}

/// A chat message exactly as the gateway received it (no prefix handling).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawMessage {
    pub id: MessageId,
    pub channel_id: ChannelId,
    pub author: Author,
    pub content: String,
    /// True for private (direct) conversations.
    #[serde(default)]
    pub is_dm: bool,
    pub timestamp: DateTime<Utc>,
}

/// Identity of the connected bot account, known once the handshake completes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BotIdentity {
    pub user_id: UserId,
    pub name: String,
}

/// Events pushed by a connected gateway.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum GatewayEvent {
    /// A chat message arrived.
    MessageReceived(RawMessage),
    /// The connection dropped (network error, server-initiated close).
    ConnectionLost { reason: String },
}

// ============================================================================
// Outbound
// ============================================================================

/// Default embed color (blue).
pub const DEFAULT_EMBED_COLOR: u32 = 0x3498db;

/// One name/value row of an embed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmbedField {
    pub name: String,
    pub value: String,
    #[serde(default)]
    pub inline: bool,
}

/// Rich embed reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmbedPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default = "default_color")]
    pub color: u32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fields: Vec<EmbedField>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub footer: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thumbnail_url: Option<String>,
}

fn default_color() -> u32 {
    DEFAULT_EMBED_COLOR
}

impl Default for EmbedPayload {
    fn default() -> Self {
        Self {
            title: None,
            description: None,
            color: DEFAULT_EMBED_COLOR,
            fields: Vec::new(),
            footer: None,
            image_url: None,
            thumbnail_url: None,
        }
    }
}

impl EmbedPayload {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn color(mut self, color: u32) -> Self {
        self.color = color;
        self
    }

    pub fn field(mut self, name: impl Into<String>, value: impl Into<String>, inline: bool) -> Self {
        self.fields.push(EmbedField {
            name: name.into(),
            value: value.into(),
            inline,
        });
        self
    }

    pub fn footer(mut self, footer: impl Into<String>) -> Self {
        self.footer = Some(footer.into());
        self
    }

    pub fn image_url(mut self, url: impl Into<String>) -> Self {
        self.image_url = Some(url.into());
        self
    }

    pub fn thumbnail_url(mut self, url: impl Into<String>) -> Self {
        self.thumbnail_url = Some(url.into());
        self
    }
}

// ============================================================================
// Tests
// ============================================================================
