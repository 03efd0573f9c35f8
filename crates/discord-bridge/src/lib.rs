//! Runtime bridge between a chat gateway and application command handlers.
//!
//! Inbound chat events are filtered, normalized and queued; consumers pull them
//! through a [`Listener`] and reply through paced, chunked, retried delivery.
//! A reconnection controller keeps the gateway session alive in the
//! background.

pub mod adapter;
pub mod config;
pub mod delivery;
pub mod error;
pub mod gateway;
pub mod listener;
pub mod logging;
pub mod message;
pub mod middleware;
pub mod queue;
pub mod reconnect;
pub mod router;
pub mod runtime;
pub mod sync;
pub mod testing;

pub use adapter::PrefixPolicy;
pub use config::{BridgeConfig, ConfigError, QueueConfig};
pub use delivery::{DeliveryConfig, OutboundDelivery};
pub use error::{BridgeError, MessageSendError};
pub use gateway::{FileAttachment, Gateway, GatewayError, GatewaySession};
pub use listener::Listener;
pub use message::InboundMessage;
pub use middleware::{MessageHandler, Middleware, MiddlewareChain, MiddlewareContext, Next};
pub use queue::OverflowPolicy;
pub use reconnect::{ConnectionState, ConnectionStatus};
pub use router::CommandRouter;
pub use runtime::{Bridge, ShutdownReport};

pub use discord_bridge_protocol as protocol;
pub use discord_bridge_protocol::{BotIdentity, ChannelId, EmbedPayload, MessageId, UserId};
