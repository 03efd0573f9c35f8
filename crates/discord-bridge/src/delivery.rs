//! Outbound delivery: chunking, pacing, and retry of replies.
//!
//! Long text is split into platform-sized chunks and sent strictly in order to
//! one channel, with a fixed pause between chunks to stay under the platform's
//! per-channel rate limit. Transient failures (network, rate limit) are retried
//! a bounded number of times per chunk; permanent failures (permission, bad
//! request) abort the whole send and skip the remaining chunks.
//!
//! Sends to one channel are serialized through a per-channel lock so two
//! concurrent replies never interleave their chunks. Different channels proceed
//! concurrently.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use discord_bridge_protocol::{ChannelId, EmbedPayload};

use crate::error::{MessageSendError, SendOperation};
use crate::gateway::{FileAttachment, Gateway, GatewayError};
use crate::sync::KeyedLocks;

/// Discord's maximum message length, in characters.
pub const DISCORD_MAX_MESSAGE_CHARS: usize = 2000;

// ============================================================================
// DeliveryConfig
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryConfig {
    /// Maximum characters per chunk.
    #[serde(default = "default_max_chunk_chars")]
    pub max_chunk_chars: usize,
    /// Pause between consecutive chunks of one reply.
    #[serde(default = "default_chunk_delay")]
    pub chunk_delay_seconds: f64,
    /// Attempts per chunk (or per file/embed) before giving up.
    #[serde(default = "default_max_send_attempts")]
    pub max_send_attempts: u32,
    /// Base wait before retrying a transient failure; doubles per attempt.
    #[serde(default = "default_retry_delay")]
    pub retry_delay_seconds: f64,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            max_chunk_chars: default_max_chunk_chars(),
            chunk_delay_seconds: default_chunk_delay(),
            max_send_attempts: default_max_send_attempts(),
            retry_delay_seconds: default_retry_delay(),
        }
    }
}

impl DeliveryConfig {
    pub fn chunk_delay(&self) -> Duration {
        seconds(self.chunk_delay_seconds)
    }

    pub fn retry_delay(&self) -> Duration {
        seconds(self.retry_delay_seconds)
    }
}

fn default_max_chunk_chars() -> usize {
    DISCORD_MAX_MESSAGE_CHARS
}

fn default_chunk_delay() -> f64 {
    1.2
}

fn default_max_send_attempts() -> u32 {
    3
}

fn default_retry_delay() -> f64 {
    0.5
}

pub(crate) fn seconds(value: f64) -> Duration {
    if value.is_finite() && value > 0.0 {
        Duration::from_secs_f64(value)
    } else {
        Duration::ZERO
    }
}

// ============================================================================
// Chunking
// ============================================================================

/// Split `text` into chunks of at most `max_chars` characters.
///
/// Splits only on `char` boundaries and never drops or adds characters, so the
/// chunks concatenate back to `text` and there are exactly
/// `ceil(chars / max_chars)` of them. Empty text yields no chunks.
pub fn chunk_text(text: &str, max_chars: usize) -> Vec<&str> {
    let max_chars = max_chars.max(1);
    let mut chunks = Vec::new();
    let mut start = 0;
    let mut count = 0;

    for (idx, _) in text.char_indices() {
        if count == max_chars {
            chunks.push(&text[start..idx]);
            start = idx;
            count = 0;
        }
        count += 1;
    }
    if start < text.len() {
        chunks.push(&text[start..]);
    }
    chunks
}

// ============================================================================
// OutboundDelivery
// ============================================================================

/// Sends replies through a [`Gateway`] under the chunking, pacing and retry rules.
pub struct OutboundDelivery {
    gateway: Arc<dyn Gateway>,
    config: DeliveryConfig,
    channel_locks: KeyedLocks<ChannelId>,
}

impl OutboundDelivery {
    pub fn new(gateway: Arc<dyn Gateway>, config: DeliveryConfig) -> Self {
        Self {
            gateway,
            config,
            channel_locks: KeyedLocks::new(),
        }
    }

    pub fn config(&self) -> &DeliveryConfig {
        &self.config
    }

    /// Send `text` to `channel`, chunked. Returns the number of chunks sent.
    pub async fn send_text(&self, channel: ChannelId, text: &str) -> Result<usize, MessageSendError> {
        let max_chars = self.config.max_chunk_chars.clamp(1, DISCORD_MAX_MESSAGE_CHARS);
        let chunks = chunk_text(text, max_chars);
        let count = chunks.len();
        if count == 0 {
            debug!(channel = %channel, "Skipping empty reply");
            return Ok(0);
        }
        if count > 1 {
            info!(
                channel = %channel,
                chars = text.chars().count(),
                chunks = count,
                "Message too long, splitting into chunks"
            );
        }

        let _guard = self.channel_locks.lock(&channel).await;
        for (index, chunk) in chunks.iter().enumerate() {
            if index > 0 {
                tokio::time::sleep(self.config.chunk_delay()).await;
            }
            self.with_retry(SendOperation::Text, index + 1, count, || {
                self.gateway.send_text(channel, chunk)
            })
            .await?;
            debug!(
                channel = %channel,
                chunk = index + 1,
                chunks = count,
                chars = chunk.chars().count(),
                "Sent chunk"
            );
        }
        Ok(count)
    }

    /// Upload a file to `channel`.
    pub async fn send_file(
        &self,
        channel: ChannelId,
        file: &FileAttachment,
    ) -> Result<(), MessageSendError> {
        let _guard = self.channel_locks.lock(&channel).await;
        self.with_retry(SendOperation::File, 1, 1, || {
            self.gateway.send_file(channel, file)
        })
        .await?;
        debug!(channel = %channel, filename = %file.filename, "Sent file reply");
        Ok(())
    }

    /// Send an embed to `channel`.
    pub async fn send_embed(
        &self,
        channel: ChannelId,
        embed: &EmbedPayload,
    ) -> Result<(), MessageSendError> {
        let _guard = self.channel_locks.lock(&channel).await;
        self.with_retry(SendOperation::Embed, 1, 1, || {
            self.gateway.send_embed(channel, embed)
        })
        .await?;
        debug!(channel = %channel, title = ?embed.title, "Sent embed reply");
        Ok(())
    }

    async fn with_retry<F, Fut>(
        &self,
        operation: SendOperation,
        chunk: usize,
        chunks: usize,
        mut send: F,
    ) -> Result<(), MessageSendError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<(), GatewayError>>,
    {
        let max_attempts = self.config.max_send_attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            match send().await {
                Ok(()) => return Ok(()),
                Err(err) if err.is_transient() && attempt < max_attempts => {
                    let delay = self.retry_delay(&err, attempt);
                    warn!(
                        %operation,
                        chunk,
                        chunks,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Transient send failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => {
                    error!(%operation, chunk, chunks, attempt, error = %err, "Failed to send message");
                    return Err(MessageSendError::Delivery {
                        operation,
                        chunk,
                        chunks,
                        attempts: attempt,
                        source: err,
                    });
                }
            }
        }
    }

    /// Wait before retry `attempt + 1`. Honors a platform `retry_after` hint.
    fn retry_delay(&self, err: &GatewayError, attempt: u32) -> Duration {
        let backoff = self
            .config
            .retry_delay()
            .saturating_mul(1u32 << (attempt - 1).min(16));
        match err {
            GatewayError::RateLimited {
                retry_after: Some(hint),
            } => backoff.max(*hint),
            _ => backoff,
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
