//! Discord gateway built on serenity.
//!
//! Each [`Gateway::connect`] builds a fresh serenity client, runs it on a
//! background task, and resolves once the `ready` event arrives. Incoming
//! messages are forwarded into the session's event channel; when the client
//! task ends, a `ConnectionLost` event closes the session.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serenity::all::{
    ChannelId as DiscordChannelId, Client, Context, CreateAttachment, CreateEmbed,
    CreateEmbedFooter, CreateMessage, EventHandler, GatewayIntents, Http, Message, Ready,
    ShardManager,
};
use serenity::http::HttpError;
use tokio::sync::oneshot::error::TryRecvError;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use discord_bridge::gateway::{FileAttachment, Gateway, GatewayError, GatewaySession};
use discord_bridge_protocol::{
    Author, BotIdentity, ChannelId, EmbedPayload, GatewayEvent, MessageId, RawMessage, UserId,
};

/// Buffer between serenity's dispatch and the bridge's event pump.
const EVENT_BUFFER: usize = 256;

/// How long to wait for `ready` after starting the client.
pub const DEFAULT_READY_TIMEOUT: Duration = Duration::from_secs(30);

/// Bound on each step of tearing a client down. serenity re-queues shards
/// that cannot reach Discord indefinitely, so the client task is aborted once
/// this elapses.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

// ============================================================================
// Event handler
// ============================================================================

struct Handler {
    events: mpsc::Sender<GatewayEvent>,
    ready: Mutex<Option<oneshot::Sender<BotIdentity>>>,
}

#[async_trait]
impl EventHandler for Handler {
    async fn ready(&self, _ctx: Context, ready: Ready) {
        let identity = BotIdentity {
            user_id: UserId(ready.user.id.get()),
            name: ready.user.name.clone(),
        };
        let waiter = self
            .ready
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match waiter {
            Some(tx) => {
                let _ = tx.send(identity);
            }
            // Session resumed after a transparent reconnect inside serenity.
            None => debug!(bot = %identity.name, "Received ready again"),
        }
    }

    async fn message(&self, _ctx: Context, msg: Message) {
        let raw = to_raw_message(&msg);
        if self
            .events
            .send(GatewayEvent::MessageReceived(raw))
            .await
            .is_err()
        {
            debug!("Event receiver gone, dropping message");
        }
    }
}

fn to_raw_message(msg: &Message) -> RawMessage {
    let display_name = msg
        .member
        .as_ref()
        .and_then(|m| m.nick.clone())
        .or_else(|| msg.author.global_name.clone());
    RawMessage {
        id: MessageId(msg.id.get()),
        channel_id: ChannelId(msg.channel_id.get()),
        author: Author {
            id: UserId(msg.author.id.get()),
            name: msg.author.name.clone(),
            display_name,
            bot: msg.author.bot,
        },
        content: msg.content.clone(),
        is_dm: msg.guild_id.is_none(),
        timestamp: DateTime::from_timestamp(msg.timestamp.unix_timestamp(), 0)
            .unwrap_or_else(Utc::now),
    }
}

// ============================================================================
// Gateway
// ============================================================================

/// A running serenity client. Dropping it aborts the client task.
struct LiveClient {
    shard_manager: Arc<ShardManager>,
    task: JoinHandle<()>,
}

impl Drop for LiveClient {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// [`Gateway`] backed by a serenity client.
///
/// The REST client outlives gateway sessions: sends keep working while a
/// reconnect is in progress and after [`Gateway::disconnect`].
pub struct SerenityGateway {
    http: Mutex<Option<Arc<Http>>>,
    live: Mutex<Option<LiveClient>>,
    ready_timeout: Duration,
}

impl Default for SerenityGateway {
    fn default() -> Self {
        Self {
            http: Mutex::new(None),
            live: Mutex::new(None),
            ready_timeout: DEFAULT_READY_TIMEOUT,
        }
    }
}

impl SerenityGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Override how long `connect` waits for the `ready` event.
    pub fn with_ready_timeout(mut self, timeout: Duration) -> Self {
        self.ready_timeout = timeout;
        self
    }

    pub fn intents() -> GatewayIntents {
        GatewayIntents::GUILD_MESSAGES
            | GatewayIntents::DIRECT_MESSAGES
            | GatewayIntents::MESSAGE_CONTENT
    }

    fn take_live(&self) -> Option<LiveClient> {
        self.live
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    fn has_live_client(&self) -> bool {
        self.live
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    fn http(&self) -> Result<Arc<Http>, GatewayError> {
        self.http
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or_else(|| GatewayError::Network("not connected".to_string()))
    }

    fn set_http(&self, http: Arc<Http>) {
        *self.http.lock().unwrap_or_else(PoisonError::into_inner) = Some(http);
    }

    /// Keep the existing REST client, or build one from `token`.
    fn ensure_http(&self, token: &str) {
        self.http
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get_or_insert_with(|| Arc::new(Http::new(token)));
    }

    async fn shutdown_client(mut live: LiveClient) {
        if tokio::time::timeout(SHUTDOWN_TIMEOUT, live.shard_manager.shutdown_all())
            .await
            .is_err()
        {
            warn!("Timed out shutting down Discord shards");
        }
        match tokio::time::timeout(SHUTDOWN_TIMEOUT, &mut live.task).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) if e.is_cancelled() => {}
            Ok(Err(e)) => warn!(error = %e, "Discord client task ended abnormally"),
            Err(_) => warn!("Discord client did not stop in time, aborting it"),
        }
        // Dropping `live` aborts the task if it is still running.
    }
}

/// Error for a handshake that ended without `ready`, given what the client
/// task reported on exit.
fn handshake_error(exit: Result<Option<GatewayError>, TryRecvError>) -> GatewayError {
    match exit {
        Ok(Some(err)) => err,
        Ok(None) => GatewayError::Network("client stopped before ready".to_string()),
        Err(_) => GatewayError::Network("timed out waiting for ready".to_string()),
    }
}

fn discord_channel(channel: ChannelId) -> Result<DiscordChannelId, GatewayError> {
    if channel.get() == 0 {
        return Err(GatewayError::Other(format!("invalid channel id: {channel}")));
    }
    Ok(DiscordChannelId::new(channel.get()))
}

fn build_embed(embed: &EmbedPayload) -> CreateEmbed {
    let mut builder = CreateEmbed::new().colour(embed.color);
    if let Some(title) = &embed.title {
        builder = builder.title(title);
    }
    if let Some(description) = &embed.description {
        builder = builder.description(description);
    }
    for field in &embed.fields {
        builder = builder.field(&field.name, &field.value, field.inline);
    }
    if let Some(footer) = &embed.footer {
        builder = builder.footer(CreateEmbedFooter::new(footer));
    }
    if let Some(url) = &embed.image_url {
        builder = builder.image(url);
    }
    if let Some(url) = &embed.thumbnail_url {
        builder = builder.thumbnail(url);
    }
    builder
}

#[async_trait]
impl Gateway for SerenityGateway {
    async fn connect(&self, token: &str) -> Result<GatewaySession, GatewayError> {
        if let Some(previous) = self.take_live() {
            Self::shutdown_client(previous).await;
        }
        self.ensure_http(token);

        let (events_tx, events_rx) = mpsc::channel(EVENT_BUFFER);
        let (ready_tx, ready_rx) = oneshot::channel();
        let handler = Handler {
            events: events_tx.clone(),
            ready: Mutex::new(Some(ready_tx)),
        };

        let mut client = Client::builder(token, Self::intents())
            .event_handler(handler)
            .await
            .map_err(map_error)?;
        let http = client.http.clone();
        let shard_manager = client.shard_manager.clone();

        let (exit_tx, mut exit_rx) = oneshot::channel();
        let task = tokio::spawn(async move {
            let result = client.start().await;
            let reason = match &result {
                Ok(()) => "client stopped".to_string(),
                Err(e) => e.to_string(),
            };
            let _ = exit_tx.send(result.err().map(map_error));
            let _ = events_tx.send(GatewayEvent::ConnectionLost { reason }).await;
        });
        // Registered before waiting so that `disconnect` can reach the client
        // even if this future is dropped mid-handshake.
        *self.live.lock().unwrap_or_else(PoisonError::into_inner) = Some(LiveClient {
            shard_manager,
            task,
        });

        let ready = tokio::select! {
            identity = ready_rx => identity.ok(),
            _ = tokio::time::sleep(self.ready_timeout) => None,
        };
        match ready {
            Some(identity) => {
                info!(bot = %identity.name, "Discord session ready");
                self.set_http(http);
                Ok(GatewaySession {
                    identity,
                    events: events_rx,
                })
            }
            None => {
                // The client task reports its exit before dropping the
                // handler, so a failed start is visible once `ready_rx` closed.
                let err = handshake_error(exit_rx.try_recv());
                warn!(error = %err, "Discord handshake failed");
                if let Some(live) = self.take_live() {
                    Self::shutdown_client(live).await;
                }
                Err(err)
            }
        }
    }

    async fn disconnect(&self) {
        if let Some(live) = self.take_live() {
            info!("Disconnecting from Discord");
            Self::shutdown_client(live).await;
        }
    }

    async fn send_text(&self, channel: ChannelId, text: &str) -> Result<(), GatewayError> {
        let http = self.http()?;
        discord_channel(channel)?
            .say(&*http, text)
            .await
            .map(|_| ())
            .map_err(map_error)
    }

    async fn send_file(&self, channel: ChannelId, file: &FileAttachment) -> Result<(), GatewayError> {
        let http = self.http()?;
        let attachment = CreateAttachment::bytes(file.data.to_vec(), file.filename.clone());
        let mut message = CreateMessage::new().add_file(attachment);
        if let Some(content) = &file.content {
            message = message.content(content);
        }
        discord_channel(channel)?
            .send_message(&*http, message)
            .await
            .map(|_| ())
            .map_err(map_error)
    }

    async fn send_embed(&self, channel: ChannelId, embed: &EmbedPayload) -> Result<(), GatewayError> {
        let http = self.http()?;
        let message = CreateMessage::new().embed(build_embed(embed));
        discord_channel(channel)?
            .send_message(&*http, message)
            .await
            .map(|_| ())
            .map_err(map_error)
    }
}

// ============================================================================
// Error mapping
// ============================================================================

fn map_error(err: serenity::Error) -> GatewayError {
    use serenity::gateway::GatewayError as ShardError;

    match err {
        serenity::Error::Gateway(ShardError::InvalidAuthentication) => {
            GatewayError::Auth("invalid bot token".to_string())
        }
        serenity::Error::Gateway(ShardError::DisallowedGatewayIntents) => {
            GatewayError::Auth("privileged intents are not enabled for this bot".to_string())
        }
        serenity::Error::Gateway(other) => GatewayError::Network(other.to_string()),
        serenity::Error::Http(http) => map_http_error(&http),
        serenity::Error::Io(e) => GatewayError::Network(e.to_string()),
        other => GatewayError::Other(other.to_string()),
    }
}

fn map_http_error(err: &HttpError) -> GatewayError {
    match err {
        HttpError::UnsuccessfulRequest(response) => {
            let message = response.error.message.clone();
            match response.status_code.as_u16() {
                429 => GatewayError::RateLimited { retry_after: None },
                401 | 403 => GatewayError::Permission(message),
                500..=599 => GatewayError::Network(message),
                _ => GatewayError::Other(message),
            }
        }
        HttpError::Request(e) => GatewayError::Network(e.to_string()),
        other => GatewayError::Other(other.to_string()),
    }
}
