//! Bridge runtime: lifecycle of one bot connection.
//!
//! `start` launches the reconnection controller in the background,
//! `wait_until_ready` resolves once the bot is connected, and `stop` shuts
//! down in a fixed order:
//!
//! 1. stop accepting new messages (the controller ends its event pump)
//! 2. close the queue so consumers drain what is buffered
//! 3. wait up to the grace period for the queue to empty
//! 4. disconnect from the gateway
//!
//! `stop` is idempotent; concurrent and repeated calls share one shutdown and
//! the same [`ShutdownReport`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::{OnceCell, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use discord_bridge_protocol::BotIdentity;

use crate::adapter::EventAdapter;
use crate::config::BridgeConfig;
use crate::delivery::OutboundDelivery;
use crate::error::BridgeError;
use crate::gateway::Gateway;
use crate::listener::Listener;
use crate::message::InboundMessage;
use crate::queue::BoundedQueue;
use crate::reconnect::{ConnectionState, ConnectionStatus, ReconnectController};

/// Outcome of [`Bridge::stop`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Messages still queued when the grace period ended. They are dropped.
    pub undelivered: usize,
    /// Whether the grace period elapsed before the queue drained.
    pub timed_out: bool,
}

/// Handle to a running bridge. Cheap to clone.
#[derive(Clone)]
pub struct Bridge {
    inner: Arc<BridgeInner>,
}

struct BridgeInner {
    config: BridgeConfig,
    gateway: Arc<dyn Gateway>,
    queue: Arc<BoundedQueue<InboundMessage>>,
    delivery: Arc<OutboundDelivery>,
    status: Arc<watch::Sender<ConnectionStatus>>,
    /// Fires when shutdown begins; ends the controller.
    accepting: CancellationToken,
    /// Fires on hard cancel; ends every listener without draining.
    listeners: CancellationToken,
    started: AtomicBool,
    controller: Mutex<Option<JoinHandle<()>>>,
    shutdown: OnceCell<ShutdownReport>,
}

impl Bridge {
    pub fn new(config: BridgeConfig, gateway: Arc<dyn Gateway>) -> Self {
        let queue = Arc::new(BoundedQueue::new(
            config.queue.capacity,
            config.queue.overflow,
        ));
        let delivery = Arc::new(OutboundDelivery::new(
            gateway.clone(),
            config.delivery.clone(),
        ));
        let (status, _) = watch::channel(ConnectionStatus::default());

        Self {
            inner: Arc::new(BridgeInner {
                config,
                gateway,
                queue,
                delivery,
                status: Arc::new(status),
                accepting: CancellationToken::new(),
                listeners: CancellationToken::new(),
                started: AtomicBool::new(false),
                controller: Mutex::new(None),
                shutdown: OnceCell::new(),
            }),
        }
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.inner.config
    }

    /// Outbound path, for sending to channels other than a message's origin.
    pub fn delivery(&self) -> Arc<OutboundDelivery> {
        self.inner.delivery.clone()
    }

    /// Launch the connection in the background. Returns immediately.
    ///
    /// Must be called within a Tokio runtime. Later calls, and calls after
    /// `stop`, do nothing.
    pub fn start(&self) {
        let inner = &self.inner;
        if inner.accepting.is_cancelled() {
            warn!("Bridge already stopped, ignoring start");
            return;
        }
        if inner.started.swap(true, Ordering::SeqCst) {
            debug!("Bridge already started");
            return;
        }

        info!(
            prefix = %inner.config.command_prefix,
            channels = inner.config.allowed_channel_ids.len(),
            "Starting bridge"
        );
        let adapter = EventAdapter::new(
            inner.config.adapter_config(),
            inner.queue.clone(),
            inner.delivery.clone(),
        );
        let controller = ReconnectController::new(
            inner.gateway.clone(),
            inner.config.discord_token.clone(),
            inner.config.reconnect_policy(),
            adapter,
            inner.status.clone(),
            inner.accepting.clone(),
        );
        let handle = tokio::spawn(controller.run());
        *inner
            .controller
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(handle);
    }

    /// Resolve once connected for the first time.
    ///
    /// Fails with the controller's error if it gives up first, or with
    /// [`BridgeError::Stopped`] if the bridge stops first.
    pub async fn wait_until_ready(&self) -> Result<BotIdentity, BridgeError> {
        let mut status = self.inner.status.subscribe();
        let reached = async {
            status
                .wait_for(|s| s.identity.is_some() || s.state == ConnectionState::Failed)
                .await
                .map(|s| (*s).clone())
        };

        let outcome = tokio::select! {
            biased;
            _ = self.inner.accepting.cancelled() => return Err(BridgeError::Stopped),
            outcome = reached => outcome,
        };
        match outcome {
            Ok(ConnectionStatus {
                identity: Some(identity),
                ..
            }) => Ok(identity),
            Ok(status) => Err(status.failure.unwrap_or(BridgeError::Stopped)),
            Err(_) => Err(BridgeError::Stopped),
        }
    }

    /// Current controller state.
    pub fn state(&self) -> ConnectionState {
        self.inner.status.borrow().state
    }

    pub fn status(&self) -> ConnectionStatus {
        self.inner.status.borrow().clone()
    }

    /// Observe state changes.
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionStatus> {
        self.inner.status.subscribe()
    }

    /// A consumer of queued messages.
    ///
    /// Listeners share one queue; each message goes to exactly one of them.
    pub fn listen(&self) -> Listener {
        Listener::new(
            self.inner.queue.clone(),
            self.inner.status.subscribe(),
            self.inner.listeners.child_token(),
        )
    }

    /// End every listener now, discarding queued messages.
    ///
    /// Does not disconnect; call [`Bridge::stop`] for that.
    pub fn cancel(&self) {
        debug!("Cancelling listeners");
        self.inner.listeners.cancel();
    }

    /// Shut down gracefully. Safe to call more than once.
    pub async fn stop(&self) -> ShutdownReport {
        let inner = &self.inner;
        *inner
            .shutdown
            .get_or_init(|| inner.shutdown_sequence())
            .await
    }
}

impl BridgeInner {
    async fn shutdown_sequence(&self) -> ShutdownReport {
        info!("Stopping bridge");

        self.accepting.cancel();
        let controller = self
            .controller
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = controller
            && let Err(e) = handle.await
        {
            warn!(error = %e, "Reconnection controller ended abnormally");
        }

        self.queue.close();
        let grace = self.config.shutdown_grace();
        let timed_out = tokio::time::timeout(grace, self.queue.wait_empty())
            .await
            .is_err();
        let undelivered = self.queue.clear();
        if timed_out && undelivered > 0 {
            warn!(
                undelivered,
                grace_ms = grace.as_millis() as u64,
                "Shutdown grace period elapsed, dropping undelivered messages"
            );
        }

        self.gateway.disconnect().await;
        self.status.send_modify(|s| s.state = ConnectionState::Disconnected);
        info!("Bridge stopped");

        ShutdownReport {
            undelivered,
            timed_out,
        }
    }
}

impl Drop for BridgeInner {
    fn drop(&mut self) {
        self.accepting.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::GatewayError;
    use crate::testing::MockGateway;
    use std::time::Duration;

    fn bridge(gateway: &Arc<MockGateway>) -> Bridge {
        let mut config = BridgeConfig::new("token");
        config.shutdown_grace_seconds = 1.0;
        Bridge::new(config, gateway.clone())
    }

    #[tokio::test]
    async fn start_is_idempotent() {
        let gateway = Arc::new(MockGateway::new());
        let bridge = bridge(&gateway);
        bridge.start();
        bridge.start();
        bridge.wait_until_ready().await.unwrap();
        assert_eq!(gateway.connect_count(), 1);
        bridge.stop().await;
    }

    #[tokio::test]
    async fn ready_returns_bot_identity() {
        let gateway = Arc::new(MockGateway::new());
        let bridge = bridge(&gateway);
        bridge.start();
        let identity = bridge.wait_until_ready().await.unwrap();
        assert_eq!(identity, *gateway.identity());
        assert_eq!(bridge.state(), ConnectionState::Connected);
        bridge.stop().await;
        assert_eq!(bridge.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn stop_before_start_still_disconnects_once() {
        let gateway = Arc::new(MockGateway::new());
        let bridge = bridge(&gateway);
        let report = bridge.stop().await;
        assert_eq!(report, ShutdownReport::default());
        bridge.stop().await;
        assert_eq!(gateway.disconnect_count(), 1);
        assert_eq!(gateway.connect_count(), 0);

        bridge.start();
        assert_eq!(gateway.connect_count(), 0);
    }

    #[tokio::test]
    async fn ready_after_stop_reports_stopped() {
        let gateway = Arc::new(MockGateway::new());
        gateway.fail_all_connects(GatewayError::Network("down".into()));
        let bridge = bridge(&gateway);
        bridge.stop().await;
        assert_eq!(
            bridge.wait_until_ready().await.unwrap_err(),
            BridgeError::Stopped
        );
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_stops_share_one_shutdown() {
        let gateway = Arc::new(MockGateway::new());
        let bridge = bridge(&gateway);
        bridge.start();
        bridge.wait_until_ready().await.unwrap();

        let (a, b) = tokio::join!(bridge.stop(), bridge.stop());
        assert_eq!(a, b);
        assert_eq!(gateway.disconnect_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_ends_listener_without_stopping() {
        let gateway = Arc::new(MockGateway::new());
        let bridge = bridge(&gateway);
        bridge.start();
        bridge.wait_until_ready().await.unwrap();

        let mut listener = bridge.listen();
        let waiter = tokio::spawn(async move { listener.next().await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        bridge.cancel();
        assert!(waiter.await.unwrap().is_none());
        assert_eq!(bridge.state(), ConnectionState::Connected);

        bridge.stop().await;
    }
}
