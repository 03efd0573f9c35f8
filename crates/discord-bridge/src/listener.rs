//! Pull-based consumption of queued messages.
//!
//! A [`Listener`] yields each queued [`InboundMessage`] once, suspending while
//! the queue is empty. It ends in one of three ways:
//!
//! - graceful stop: everything already buffered is delivered, then `None`
//! - cancellation: buffered messages are discarded, then `None`
//! - controller failure: buffered messages are delivered, then one `Err`,
//!   then `None`

use std::sync::Arc;

use futures::Stream;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::BridgeError;
use crate::message::InboundMessage;
use crate::queue::BoundedQueue;
use crate::reconnect::{ConnectionState, ConnectionStatus};

pub struct Listener {
    queue: Arc<BoundedQueue<InboundMessage>>,
    status: watch::Receiver<ConnectionStatus>,
    status_closed: bool,
    cancel: CancellationToken,
    failure_reported: bool,
}

impl Listener {
    pub(crate) fn new(
        queue: Arc<BoundedQueue<InboundMessage>>,
        status: watch::Receiver<ConnectionStatus>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            queue,
            status,
            status_closed: false,
            cancel,
            failure_reported: false,
        }
    }

    /// Token that ends this listener promptly, discarding anything queued.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Next message, a terminal error, or `None` when the sequence has ended.
    pub async fn next(&mut self) -> Option<Result<InboundMessage, BridgeError>> {
        loop {
            if self.cancel.is_cancelled() {
                let discarded = self.queue.clear();
                if discarded > 0 {
                    debug!(discarded, "Listener cancelled, discarding queued messages");
                }
                return None;
            }

            if let Some(message) = self.queue.try_pop() {
                return Some(Ok(message));
            }
            if self.queue.is_closed() {
                debug!("Queue drained, ending listener");
                return None;
            }

            let failure = {
                let status = self.status.borrow_and_update();
                (status.state == ConnectionState::Failed)
                    .then(|| status.failure.clone().unwrap_or(BridgeError::Stopped))
            };
            if let Some(failure) = failure {
                if self.failure_reported {
                    return None;
                }
                self.failure_reported = true;
                return Some(Err(failure));
            }

            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {}
                message = self.queue.pop() => match message {
                    Some(message) => return Some(Ok(message)),
                    None => return None,
                },
                changed = self.status.changed(), if !self.status_closed => {
                    if changed.is_err() {
                        self.status_closed = true;
                    }
                }
            }
        }
    }

    /// Adapt into a [`Stream`].
    pub fn into_stream(self) -> impl Stream<Item = Result<InboundMessage, BridgeError>> {
        futures::stream::unfold(self, |mut listener| async move {
            listener.next().await.map(|item| (item, listener))
        })
    }
}
