//! In-memory gateway for tests and local experiments.
//!
//! [`MockGateway`] replays scripted connect and send results, records every
//! call, and lets the caller inject events into the live session.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{Notify, mpsc};
use tokio::time::Instant;

use discord_bridge_protocol::{
    Author, BotIdentity, ChannelId, EmbedPayload, GatewayEvent, MessageId, RawMessage, UserId,
};

use crate::gateway::{FileAttachment, Gateway, GatewayError, GatewaySession};

/// Buffer size of the event channel handed out on connect.
const EVENT_BUFFER: usize = 64;

/// What a recorded send carried.
#[derive(Debug, Clone, PartialEq)]
pub enum SentPayload {
    Text(String),
    File(FileAttachment),
    Embed(EmbedPayload),
}

/// One successful send, in call order.
#[derive(Debug, Clone)]
pub struct SentRecord {
    pub channel: ChannelId,
    pub payload: SentPayload,
    pub at: Instant,
}

#[derive(Default)]
struct MockState {
    connect_script: VecDeque<Result<(), GatewayError>>,
    connect_fallback: Option<GatewayError>,
    send_script: VecDeque<Result<(), GatewayError>>,
    send_latency: Duration,
    connect_times: Vec<Instant>,
    successful_connects: usize,
    send_attempts: u32,
    disconnects: u32,
    sent: Vec<SentRecord>,
    events: Option<mpsc::Sender<GatewayEvent>>,
}

/// Scripted [`Gateway`] double.
pub struct MockGateway {
    identity: BotIdentity,
    state: Mutex<MockState>,
    connected: Notify,
}

impl Default for MockGateway {
    fn default() -> Self {
        Self::new()
    }
}

impl MockGateway {
    /// Bot identity used by [`MockGateway::new`].
    pub const BOT_USER_ID: u64 = 999;

    pub fn new() -> Self {
        Self::with_identity(BotIdentity {
            user_id: UserId(Self::BOT_USER_ID),
            name: "bridge-bot".to_string(),
        })
    }

    pub fn with_identity(identity: BotIdentity) -> Self {
        Self {
            identity,
            state: Mutex::new(MockState::default()),
            connected: Notify::new(),
        }
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn identity(&self) -> &BotIdentity {
        &self.identity
    }

    /// Queue the result of the next connect call. Unscripted connects succeed.
    pub fn script_connect(&self, result: Result<(), GatewayError>) {
        self.state().connect_script.push_back(result);
    }

    /// Make every unscripted connect fail with `error`.
    pub fn fail_all_connects(&self, error: GatewayError) {
        self.state().connect_fallback = Some(error);
    }

    /// Queue the result of the next send attempt (any kind). Unscripted sends succeed.
    pub fn script_send(&self, result: Result<(), GatewayError>) {
        self.state().send_script.push_back(result);
    }

    /// Delay every send by `latency`.
    pub fn set_send_latency(&self, latency: Duration) {
        self.state().send_latency = latency;
    }

    pub fn connect_count(&self) -> usize {
        self.state().connect_times.len()
    }

    /// When each connect call happened.
    pub fn connect_times(&self) -> Vec<Instant> {
        self.state().connect_times.clone()
    }

    pub fn disconnect_count(&self) -> u32 {
        self.state().disconnects
    }

    /// Number of send calls, including failed ones.
    pub fn send_attempts(&self) -> u32 {
        self.state().send_attempts
    }

    pub fn sent(&self) -> Vec<SentRecord> {
        self.state().sent.clone()
    }

    /// Text bodies delivered to `channel`, in order.
    pub fn sent_texts(&self, channel: ChannelId) -> Vec<String> {
        self.state()
            .sent
            .iter()
            .filter(|r| r.channel == channel)
            .filter_map(|r| match &r.payload {
                SentPayload::Text(text) => Some(text.clone()),
                _ => None,
            })
            .collect()
    }

    /// Wait until at least `count` successful connects have happened.
    pub async fn wait_for_connects(&self, count: usize) {
        loop {
            let notified = self.connected.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let live = {
                let state = self.state();
                state.events.is_some() && state.successful_connects >= count
            };
            if live {
                return;
            }
            notified.await;
        }
    }

    /// Push an event into the live session. Returns false when not connected.
    pub async fn emit(&self, event: GatewayEvent) -> bool {
        let tx = self.state().events.clone();
        match tx {
            Some(tx) => tx.send(event).await.is_ok(),
            None => false,
        }
    }

    /// Push a chat message into the live session.
    pub async fn emit_message(&self, message: RawMessage) -> bool {
        self.emit(GatewayEvent::MessageReceived(message)).await
    }

    /// Simulate a server-side close of the live session.
    pub async fn drop_connection(&self, reason: &str) {
        let tx = self.state().events.take();
        if let Some(tx) = tx {
            let _ = tx
                .send(GatewayEvent::ConnectionLost {
                    reason: reason.to_string(),
                })
                .await;
        }
    }
}

#[async_trait]
impl Gateway for MockGateway {
    async fn connect(&self, _token: &str) -> Result<GatewaySession, GatewayError> {
        let result = {
            let mut state = self.state();
            state.connect_times.push(Instant::now());
            let scripted = state.connect_script.pop_front();
            let result = match scripted {
                Some(result) => result,
                None => match state.connect_fallback.clone() {
                    Some(err) => Err(err),
                    None => Ok(()),
                },
            };
            result.map(|()| {
                let (tx, rx) = mpsc::channel(EVENT_BUFFER);
                state.events = Some(tx);
                state.successful_connects += 1;
                rx
            })
        };

        match result {
            Ok(events) => {
                self.connected.notify_waiters();
                Ok(GatewaySession {
                    identity: self.identity.clone(),
                    events,
                })
            }
            Err(err) => Err(err),
        }
    }

    async fn disconnect(&self) {
        let mut state = self.state();
        state.disconnects += 1;
        state.events = None;
    }

    async fn send_text(&self, channel: ChannelId, text: &str) -> Result<(), GatewayError> {
        self.record_send(channel, SentPayload::Text(text.to_string()))
            .await
    }

    async fn send_file(&self, channel: ChannelId, file: &FileAttachment) -> Result<(), GatewayError> {
        self.record_send(channel, SentPayload::File(file.clone()))
            .await
    }

    async fn send_embed(
        &self,
        channel: ChannelId,
        embed: &EmbedPayload,
    ) -> Result<(), GatewayError> {
        self.record_send(channel, SentPayload::Embed(embed.clone()))
            .await
    }
}

impl MockGateway {
    async fn record_send(&self, channel: ChannelId, payload: SentPayload) -> Result<(), GatewayError> {
        let latency = self.state().send_latency;
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let mut state = self.state();
        state.send_attempts += 1;
        if let Some(Err(err)) = state.send_script.pop_front() {
            return Err(err);
        }
        state.sent.push(SentRecord {
            channel,
            payload,
            at: Instant::now(),
        });
        Ok(())
    }
}

/// Build a guild-channel message from `author`.
pub fn raw_message(channel: u64, author: u64, content: &str) -> RawMessage {
    RawMessage {
        id: MessageId(1),
        channel_id: ChannelId(channel),
        author: Author {
            id: UserId(author),
            name: format!("user{author}"),
            display_name: None,
            bot: false,
        },
        content: content.to_string(),
        is_dm: false,
        timestamp: Utc::now(),
    }
}

/// Build a direct message from `author`.
pub fn raw_dm(channel: u64, author: u64, content: &str) -> RawMessage {
    RawMessage {
        is_dm: true,
        ..raw_message(channel, author, content)
    }
}
