//! Reconnection controller.
//!
//! Owns the connect/disconnect/retry cycle of one gateway connection:
//!
//! ```text
//!  Disconnected ──start──▶ Connecting ──ok──▶ Connected
//!                              ▲  │                │ connection lost
//!                              │  │ network error  ▼
//!                              └──┴────────── Reconnecting (sleep backoff)
//!                                 │
//!                 auth error /    ▼
//!                 ceiling hit   Failed (terminal)
//! ```
//!
//! While connected, the controller drives the [`EventAdapter`] over the
//! session's event stream; each successful connect yields a fresh stream, so
//! the adapter re-subscribes on every reconnect. Backoff sleeps only suspend
//! this task. A stop request cancels any wait and ends in `Disconnected`.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use discord_bridge_protocol::BotIdentity;

use crate::adapter::{EventAdapter, PumpExit};
use crate::error::BridgeError;
use crate::gateway::{Gateway, GatewayError};

// ============================================================================
// State
// ============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Failed,
}

impl ConnectionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Failed)
    }
}

/// Snapshot published on every state change.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConnectionStatus {
    pub state: ConnectionState,
    /// Set while connected (and kept after a drop for reference).
    pub identity: Option<BotIdentity>,
    /// Consecutive failed connection attempts.
    pub attempts: u32,
    /// Why the controller entered `Failed`.
    pub failure: Option<BridgeError>,
}

// ============================================================================
// Backoff
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Connection attempts allowed before giving up. At least 1.
    pub max_attempts: u32,
    pub base_delay: Duration,
    /// Ceiling for any single wait.
    pub max_delay: Duration,
}

impl ReconnectPolicy {
    /// `min(base * 2^attempt, max_delay)`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        2u32.checked_pow(attempt)
            .and_then(|factor| self.base_delay.checked_mul(factor))
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }
}

/// Consecutive failed connection attempts since the last success.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BackoffState {
    attempts: u32,
}

impl BackoffState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Count a failed attempt. Returns the new count.
    pub fn record_failure(&mut self) -> u32 {
        self.attempts = self.attempts.saturating_add(1);
        self.attempts
    }

    pub fn reset(&mut self) {
        self.attempts = 0;
    }

    pub fn is_exhausted(&self, policy: &ReconnectPolicy) -> bool {
        self.attempts >= policy.max_attempts.max(1)
    }

    /// Wait before the next attempt.
    pub fn next_delay(&self, policy: &ReconnectPolicy) -> Duration {
        policy.delay_for(self.attempts)
    }
}

// ============================================================================
// Controller
// ============================================================================

pub struct ReconnectController {
    gateway: Arc<dyn Gateway>,
    token: String,
    policy: ReconnectPolicy,
    adapter: EventAdapter,
    status: Arc<watch::Sender<ConnectionStatus>>,
    stop: CancellationToken,
}

impl ReconnectController {
    pub fn new(
        gateway: Arc<dyn Gateway>,
        token: String,
        policy: ReconnectPolicy,
        adapter: EventAdapter,
        status: Arc<watch::Sender<ConnectionStatus>>,
        stop: CancellationToken,
    ) -> Self {
        Self {
            gateway,
            token,
            policy,
            adapter,
            status,
            stop,
        }
    }

    fn set_state(&self, state: ConnectionState, attempts: u32) {
        self.status.send_modify(|status| {
            status.state = state;
            status.attempts = attempts;
        });
    }

    fn fail(&self, failure: BridgeError, attempts: u32) {
        error!(error = %failure, "Giving up on gateway connection");
        self.status.send_modify(|status| {
            status.state = ConnectionState::Failed;
            status.attempts = attempts;
            status.failure = Some(failure);
        });
    }

    /// Run until stopped or failed.
    pub async fn run(self) {
        let mut backoff = BackoffState::new();
        let mut retrying = false;

        loop {
            if retrying {
                let delay = backoff.next_delay(&self.policy);
                self.set_state(ConnectionState::Reconnecting, backoff.attempts());
                info!(
                    attempt = backoff.attempts() + 1,
                    max_attempts = self.policy.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    "Reconnecting after backoff"
                );
                tokio::select! {
                    biased;
                    _ = self.stop.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
            }

            self.set_state(ConnectionState::Connecting, backoff.attempts());
            let result = tokio::select! {
                biased;
                _ = self.stop.cancelled() => break,
                result = self.gateway.connect(&self.token) => result,
            };

            match result {
                Ok(mut session) => {
                    backoff.reset();
                    info!(bot = %session.identity.name, "Connected to gateway");
                    let identity = session.identity.clone();
                    self.status.send_modify(|status| {
                        status.state = ConnectionState::Connected;
                        status.attempts = 0;
                        status.identity = Some(identity);
                    });

                    match self
                        .adapter
                        .pump(&mut session.events, &session.identity, &self.stop)
                        .await
                    {
                        PumpExit::Stopped => break,
                        PumpExit::ConnectionLost(reason) => {
                            warn!(%reason, "Gateway connection lost");
                            retrying = true;
                        }
                    }
                }
                Err(err @ GatewayError::Auth(_)) => {
                    self.fail(BridgeError::Connection(err), backoff.attempts());
                    return;
                }
                Err(err) => {
                    let attempts = backoff.record_failure();
                    warn!(
                        attempt = attempts,
                        max_attempts = self.policy.max_attempts,
                        error = %err,
                        "Connection attempt failed"
                    );
                    if backoff.is_exhausted(&self.policy) {
                        self.fail(
                            BridgeError::ReconnectExhausted {
                                attempts,
                                last_error: err,
                            },
                            attempts,
                        );
                        return;
                    }
                    retrying = true;
                }
            }
        }

        debug!("Reconnection controller stopped");
        self.set_state(ConnectionState::Disconnected, 0);
    }
}

// ============================================================================
// Tests
// ============================================================================
