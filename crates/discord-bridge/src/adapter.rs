//! Event-to-queue adapter.
//!
//! Consumes the push-style event stream of one gateway session, filters and
//! normalizes chat messages, and feeds them into the bounded queue. When the
//! queue is full under the blocking policy the adapter stops reading events,
//! which pushes backpressure onto the gateway's event delivery.

use std::collections::HashSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use discord_bridge_protocol::{BotIdentity, ChannelId, GatewayEvent, RawMessage};

use crate::delivery::OutboundDelivery;
use crate::message::InboundMessage;
use crate::queue::{BoundedQueue, PushOutcome, QueueClosed};

/// What to do with messages that don't start with the command prefix.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrefixPolicy {
    /// Drop them.
    #[default]
    RequirePrefix,
    /// Forward everything; strip the prefix only when present.
    PassAll,
}

#[derive(Debug, Clone)]
pub struct AdapterConfig {
    pub prefix: String,
    /// Empty means every channel is allowed.
    pub allowed_channels: HashSet<ChannelId>,
    pub prefix_policy: PrefixPolicy,
}

/// Why [`EventAdapter::pump`] returned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PumpExit {
    /// The session ended; the controller should reconnect.
    ConnectionLost(String),
    /// Shutdown was requested or the queue was closed.
    Stopped,
}

pub struct EventAdapter {
    config: AdapterConfig,
    queue: Arc<BoundedQueue<InboundMessage>>,
    delivery: Arc<OutboundDelivery>,
}

impl EventAdapter {
    pub fn new(
        config: AdapterConfig,
        queue: Arc<BoundedQueue<InboundMessage>>,
        delivery: Arc<OutboundDelivery>,
    ) -> Self {
        Self {
            config,
            queue,
            delivery,
        }
    }

    /// Apply the self, channel and prefix filters. `None` means drop.
    pub fn normalize(&self, raw: RawMessage, own: &BotIdentity) -> Option<InboundMessage> {
        if raw.author.id == own.user_id {
            return None;
        }
        if !self.config.allowed_channels.is_empty()
            && !self.config.allowed_channels.contains(&raw.channel_id)
        {
            debug!(channel = %raw.channel_id, "Ignoring message from non-whitelisted channel");
            return None;
        }

        let prefix = self.config.prefix.as_str();
        let content = match (raw.content.strip_prefix(prefix), self.config.prefix_policy) {
            (Some(rest), _) => rest.trim().to_string(),
            (None, PrefixPolicy::PassAll) => raw.content.trim().to_string(),
            (None, PrefixPolicy::RequirePrefix) => return None,
        };

        Some(InboundMessage::from_raw(raw, content, self.delivery.clone()))
    }

    /// Forward events from one session into the queue until the session ends
    /// or `stop` fires.
    pub async fn pump(
        &self,
        events: &mut mpsc::Receiver<GatewayEvent>,
        own: &BotIdentity,
        stop: &CancellationToken,
    ) -> PumpExit {
        loop {
            let event = tokio::select! {
                biased;
                _ = stop.cancelled() => return PumpExit::Stopped,
                event = events.recv() => event,
            };

            let raw = match event {
                Some(GatewayEvent::MessageReceived(raw)) => raw,
                Some(GatewayEvent::ConnectionLost { reason }) => {
                    return PumpExit::ConnectionLost(reason);
                }
                None => return PumpExit::ConnectionLost("event stream closed".to_string()),
            };

            let Some(message) = self.normalize(raw, own) else {
                continue;
            };
            debug!(
                author = %message.author_name(),
                channel = %message.channel_id(),
                is_dm = message.is_dm(),
                "Queueing message"
            );

            let outcome = tokio::select! {
                biased;
                _ = stop.cancelled() => {
                    debug!("Shutdown while queue was full, message not accepted");
                    return PumpExit::Stopped;
                }
                outcome = self.queue.push(message) => outcome,
            };
            match outcome {
                Ok(PushOutcome::Enqueued) => {}
                Ok(PushOutcome::DroppedOldest(old)) => {
                    warn!(channel = %old.channel_id(), "Queue full, dropped oldest message");
                }
                Ok(PushOutcome::DroppedNewest(new)) => {
                    warn!(channel = %new.channel_id(), "Queue full, dropped incoming message");
                }
                Err(QueueClosed(_)) => return PumpExit::Stopped,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delivery::DeliveryConfig;
    use crate::queue::OverflowPolicy;
    use crate::testing::{MockGateway, raw_dm, raw_message};
    use discord_bridge_protocol::UserId;
    use std::time::Duration;

    fn adapter_with(
        config: AdapterConfig,
        capacity: usize,
        policy: OverflowPolicy,
    ) -> (EventAdapter, Arc<BoundedQueue<InboundMessage>>) {
        let gateway = Arc::new(MockGateway::new());
        let delivery = Arc::new(OutboundDelivery::new(gateway, DeliveryConfig::default()));
        let queue = Arc::new(BoundedQueue::new(capacity, policy));
        (EventAdapter::new(config, queue.clone(), delivery), queue)
    }

    fn config(prefix: &str) -> AdapterConfig {
        AdapterConfig {
            prefix: prefix.to_string(),
            allowed_channels: HashSet::new(),
            prefix_policy: PrefixPolicy::RequirePrefix,
        }
    }

    fn me() -> BotIdentity {
        BotIdentity {
            user_id: UserId(MockGateway::BOT_USER_ID),
            name: "bridge-bot".to_string(),
        }
    }

    #[test]
    fn strips_prefix_and_whitespace() {
        let (adapter, _) = adapter_with(config("!"), 4, OverflowPolicy::Block);
        let msg = adapter
            .normalize(raw_message(1, 42, "!echo hi there"), &me())
            .unwrap();
        assert_eq!(msg.content(), "echo hi there");

        let msg = adapter
            .normalize(raw_message(1, 42, "!  padded  "), &me())
            .unwrap();
        assert_eq!(msg.content(), "padded");
    }

    #[test]
    fn ignores_own_messages() {
        let (adapter, _) = adapter_with(config("!"), 4, OverflowPolicy::Block);
        let raw = raw_message(1, MockGateway::BOT_USER_ID, "!echo loop");
        assert!(adapter.normalize(raw, &me()).is_none());
    }

    #[test]
    fn require_prefix_drops_plain_messages() {
        let (adapter, _) = adapter_with(config("!"), 4, OverflowPolicy::Block);
        assert!(adapter.normalize(raw_message(1, 42, "hello"), &me()).is_none());
    }

    #[test]
    fn pass_all_forwards_plain_messages() {
        let mut cfg = config("!");
        cfg.prefix_policy = PrefixPolicy::PassAll;
        let (adapter, _) = adapter_with(cfg, 4, OverflowPolicy::Block);

        let plain = adapter.normalize(raw_dm(1, 42, "  hello "), &me()).unwrap();
        assert_eq!(plain.content(), "hello");
        assert!(plain.is_dm());

        let prefixed = adapter.normalize(raw_message(1, 42, "!help"), &me()).unwrap();
        assert_eq!(prefixed.content(), "help");
    }

    #[test]
    fn channel_whitelist_drops_other_channels() {
        let mut cfg = config("!");
        cfg.allowed_channels = HashSet::from([ChannelId(100)]);
        let (adapter, _) = adapter_with(cfg, 4, OverflowPolicy::Block);

        assert!(adapter.normalize(raw_message(200, 42, "!echo"), &me()).is_none());
        assert!(adapter.normalize(raw_message(100, 42, "!echo"), &me()).is_some());
    }

    #[tokio::test]
    async fn pump_enqueues_until_connection_lost() {
        let (adapter, queue) = adapter_with(config("!"), 8, OverflowPolicy::Block);
        let (tx, mut rx) = mpsc::channel(8);
        tx.send(GatewayEvent::MessageReceived(raw_message(1, 42, "!one")))
            .await
            .unwrap();
        tx.send(GatewayEvent::MessageReceived(raw_message(1, 42, "skip")))
            .await
            .unwrap();
        tx.send(GatewayEvent::MessageReceived(raw_message(1, 43, "!two")))
            .await
            .unwrap();
        tx.send(GatewayEvent::ConnectionLost {
            reason: "server closed".to_string(),
        })
        .await
        .unwrap();

        let exit = adapter.pump(&mut rx, &me(), &CancellationToken::new()).await;
        assert_eq!(exit, PumpExit::ConnectionLost("server closed".to_string()));
        assert_eq!(queue.try_pop().unwrap().content(), "one");
        assert_eq!(queue.try_pop().unwrap().content(), "two");
        assert!(queue.try_pop().is_none());
    }

    #[tokio::test]
    async fn closed_event_stream_counts_as_connection_lost() {
        let (adapter, _) = adapter_with(config("!"), 8, OverflowPolicy::Block);
        let (tx, mut rx) = mpsc::channel::<GatewayEvent>(1);
        drop(tx);
        let exit = adapter.pump(&mut rx, &me(), &CancellationToken::new()).await;
        assert!(matches!(exit, PumpExit::ConnectionLost(_)));
    }

    #[tokio::test]
    async fn full_queue_applies_backpressure_without_loss() {
        let (adapter, queue) = adapter_with(config("!"), 2, OverflowPolicy::Block);
        let adapter = Arc::new(adapter);
        let (tx, mut rx) = mpsc::channel(8);
        for i in 0..3 {
            tx.send(GatewayEvent::MessageReceived(raw_message(
                1,
                42,
                &format!("!m{i}"),
            )))
            .await
            .unwrap();
        }

        let stop = CancellationToken::new();
        let pump = {
            let adapter = adapter.clone();
            let stop = stop.clone();
            tokio::spawn(async move { adapter.pump(&mut rx, &me(), &stop).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(queue.len(), 2);
        assert!(!pump.is_finished());

        assert_eq!(queue.pop().await.unwrap().content(), "m0");
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(queue.len(), 2);

        stop.cancel();
        assert_eq!(pump.await.unwrap(), PumpExit::Stopped);
        assert_eq!(queue.try_pop().unwrap().content(), "m1");
        assert_eq!(queue.try_pop().unwrap().content(), "m2");
    }

    #[tokio::test]
    async fn stop_releases_pump_blocked_on_full_queue() {
        let (adapter, queue) = adapter_with(config("!"), 1, OverflowPolicy::Block);
        let (tx, mut rx) = mpsc::channel(8);
        tx.send(GatewayEvent::MessageReceived(raw_message(1, 42, "!a")))
            .await
            .unwrap();
        tx.send(GatewayEvent::MessageReceived(raw_message(1, 42, "!b")))
            .await
            .unwrap();

        let stop = CancellationToken::new();
        let canceller = {
            let stop = stop.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                stop.cancel();
            })
        };
        let exit = adapter.pump(&mut rx, &me(), &stop).await;
        canceller.await.unwrap();

        assert_eq!(exit, PumpExit::Stopped);
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test]
    async fn drop_oldest_policy_keeps_newest() {
        let (adapter, queue) = adapter_with(config("!"), 1, OverflowPolicy::DropOldest);
        let (tx, mut rx) = mpsc::channel(8);
        for content in ["!a", "!b"] {
            tx.send(GatewayEvent::MessageReceived(raw_message(1, 42, content)))
                .await
                .unwrap();
        }
        drop(tx);

        adapter.pump(&mut rx, &me(), &CancellationToken::new()).await;
        assert_eq!(queue.try_pop().unwrap().content(), "b");
        assert!(queue.try_pop().is_none());
    }
}
