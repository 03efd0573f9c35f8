//! Middleware chain run in front of a message handler.
//!
//! Each middleware receives a [`MiddlewareContext`] and a [`Next`]
//! continuation. Calling `next.run(ctx)` passes control down the chain; not
//! calling it, or calling [`MiddlewareContext::cancel`], stops processing.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use discord_bridge_protocol::UserId;

use crate::message::InboundMessage;

// ============================================================================
// Traits
// ============================================================================

/// Final consumer of a message after the middleware chain.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: &InboundMessage) -> anyhow::Result<()>;
}

#[async_trait]
pub trait Middleware: Send + Sync {
    /// Name used for [`MiddlewareChain::remove`] and logging.
    fn name(&self) -> &str;

    async fn handle(&self, ctx: &mut MiddlewareContext<'_>, next: Next<'_>) -> anyhow::Result<()>;
}

// ============================================================================
// Context and continuation
// ============================================================================

pub struct MiddlewareContext<'m> {
    pub message: &'m InboundMessage,
    /// Free-form data shared along the chain.
    pub metadata: HashMap<String, serde_json::Value>,
    cancelled: bool,
}

impl<'m> MiddlewareContext<'m> {
    pub fn new(message: &'m InboundMessage) -> Self {
        Self {
            message,
            metadata: HashMap::new(),
            cancelled: false,
        }
    }

    /// Stop processing; the handler will not run.
    pub fn cancel(&mut self) {
        self.cancelled = true;
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled
    }
}

/// The rest of the chain, ending in the handler.
pub struct Next<'c> {
    remaining: &'c [Arc<dyn Middleware>],
    handler: &'c dyn MessageHandler,
}

impl Next<'_> {
    pub async fn run(self, ctx: &mut MiddlewareContext<'_>) -> anyhow::Result<()> {
        if ctx.is_cancelled() {
            debug!("Message processing cancelled by middleware");
            return Ok(());
        }
        match self.remaining.split_first() {
            Some((middleware, rest)) => {
                debug!(middleware = middleware.name(), "Executing middleware");
                let next = Next {
                    remaining: rest,
                    handler: self.handler,
                };
                middleware.handle(ctx, next).await
            }
            None => self.handler.handle(ctx.message).await,
        }
    }
}

// ============================================================================
// Chain
// ============================================================================

#[derive(Default, Clone)]
pub struct MiddlewareChain {
    middlewares: Vec<Arc<dyn Middleware>>,
}

impl MiddlewareChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append to the end of the chain.
    pub fn add(&mut self, middleware: impl Middleware + 'static) -> &mut Self {
        debug!(middleware = middleware.name(), "Registered middleware");
        self.middlewares.push(Arc::new(middleware));
        self
    }

    /// Remove every middleware called `name`. Returns whether any was removed.
    pub fn remove(&mut self, name: &str) -> bool {
        let before = self.middlewares.len();
        self.middlewares.retain(|m| m.name() != name);
        before != self.middlewares.len()
    }

    pub fn clear(&mut self) {
        self.middlewares.clear();
    }

    pub fn len(&self) -> usize {
        self.middlewares.len()
    }

    pub fn is_empty(&self) -> bool {
        self.middlewares.is_empty()
    }

    pub fn names(&self) -> Vec<&str> {
        self.middlewares.iter().map(|m| m.name()).collect()
    }

    /// Run the chain, then `handler`. Returns false if a middleware cancelled.
    pub async fn execute(
        &self,
        message: &InboundMessage,
        handler: &dyn MessageHandler,
    ) -> anyhow::Result<bool> {
        let mut ctx = MiddlewareContext::new(message);
        Next {
            remaining: &self.middlewares,
            handler,
        }
        .run(&mut ctx)
        .await?;
        Ok(!ctx.is_cancelled())
    }
}

// ============================================================================
// Built-ins
// ============================================================================

/// Logs start and end of processing at info level.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingMiddleware;

#[async_trait]
impl Middleware for LoggingMiddleware {
    fn name(&self) -> &str {
        "logging"
    }

    async fn handle(&self, ctx: &mut MiddlewareContext<'_>, next: Next<'_>) -> anyhow::Result<()> {
        let author = ctx.message.author_name().to_string();
        info!(%author, content = %ctx.message.content(), "Processing command");
        let result = next.run(ctx).await;
        info!(%author, "Finished processing command");
        result
    }
}

/// Sliding-window limit on messages per user.
pub struct RateLimitMiddleware {
    max_requests: usize,
    window: Duration,
    requests: Mutex<HashMap<UserId, VecDeque<Instant>>>,
}

impl RateLimitMiddleware {
    pub fn new(max_requests: usize, window: Duration) -> Self {
        Self {
            max_requests,
            window,
            requests: Mutex::new(HashMap::new()),
        }
    }

    /// Record a request now. Returns false if the user is over the limit.
    fn admit(&self, user: UserId) -> bool {
        let now = Instant::now();
        let mut requests = self.requests.lock().unwrap_or_else(PoisonError::into_inner);
        requests.retain(|_, history| {
            while history
                .front()
                .is_some_and(|t| now.duration_since(*t) >= self.window)
            {
                history.pop_front();
            }
            !history.is_empty()
        });
        let history = requests.entry(user).or_default();
        if history.len() >= self.max_requests {
            return false;
        }
        history.push_back(now);
        true
    }

    /// Users with requests still inside the window.
    pub fn tracked_users(&self) -> usize {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl Default for RateLimitMiddleware {
    /// Five requests per minute.
    fn default() -> Self {
        Self::new(5, Duration::from_secs(60))
    }
}

#[async_trait]
impl Middleware for RateLimitMiddleware {
    fn name(&self) -> &str {
        "rate_limit"
    }

    async fn handle(&self, ctx: &mut MiddlewareContext<'_>, next: Next<'_>) -> anyhow::Result<()> {
        let user = ctx.message.author_id();
        if !self.admit(user) {
            warn!(user = %user, "Rate limit exceeded");
            ctx.cancel();
            let notice = format!(
                "You're sending commands too fast! Please wait {} seconds.",
                self.window.as_secs()
            );
            ctx.message.reply(&notice).await?;
            return Ok(());
        }
        next.run(ctx).await
    }
}

/// Only lets direct messages through.
#[derive(Debug, Default, Clone, Copy)]
pub struct DmOnlyMiddleware;

#[async_trait]
impl Middleware for DmOnlyMiddleware {
    fn name(&self) -> &str {
        "dm_only"
    }

    async fn handle(&self, ctx: &mut MiddlewareContext<'_>, next: Next<'_>) -> anyhow::Result<()> {
        if !ctx.message.is_dm() {
            debug!(author = %ctx.message.author_name(), "Ignoring non-DM message");
            ctx.cancel();
            ctx.message
                .reply("This command only works in direct messages!")
                .await?;
            return Ok(());
        }
        next.run(ctx).await
    }
}

/// Only lets listed users through.
#[derive(Debug, Clone)]
pub struct AdminOnlyMiddleware {
    admins: HashSet<UserId>,
}

impl AdminOnlyMiddleware {
    pub fn new(admins: impl IntoIterator<Item = UserId>) -> Self {
        Self {
            admins: admins.into_iter().collect(),
        }
    }
}

#[async_trait]
impl Middleware for AdminOnlyMiddleware {
    fn name(&self) -> &str {
        "admin_only"
    }

    async fn handle(&self, ctx: &mut MiddlewareContext<'_>, next: Next<'_>) -> anyhow::Result<()> {
        let user = ctx.message.author_id();
        if !self.admins.contains(&user) {
            warn!(user = %user, "Non-admin user tried admin command");
            ctx.cancel();
            ctx.message
                .reply("You don't have permission to use this command.")
                .await?;
            return Ok(());
        }
        next.run(ctx).await
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delivery::{DeliveryConfig, OutboundDelivery};
    use crate::testing::{MockGateway, raw_dm, raw_message};
    use discord_bridge_protocol::{ChannelId, RawMessage};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingHandler {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl MessageHandler for CountingHandler {
        async fn handle(&self, _message: &InboundMessage) -> anyhow::Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    /// Appends its name to the `trace` metadata entry on the way down.
    struct Tracer(&'static str);

    #[async_trait]
    impl Middleware for Tracer {
        fn name(&self) -> &str {
            self.0
        }

        async fn handle(
            &self,
            ctx: &mut MiddlewareContext<'_>,
            next: Next<'_>,
        ) -> anyhow::Result<()> {
            let trace = ctx
                .metadata
                .entry("trace".to_string())
                .or_insert_with(|| serde_json::json!([]));
            if let Some(items) = trace.as_array_mut() {
                items.push(serde_json::json!(self.0));
            }
            assert!(!ctx.is_cancelled());
            next.run(ctx).await
        }
    }

    /// Cancels without calling next.
    struct Blocker;

    #[async_trait]
    impl Middleware for Blocker {
        fn name(&self) -> &str {
            "blocker"
        }

        async fn handle(
            &self,
            ctx: &mut MiddlewareContext<'_>,
            _next: Next<'_>,
        ) -> anyhow::Result<()> {
            ctx.cancel();
            Ok(())
        }
    }

    fn message(gateway: &Arc<MockGateway>, raw: RawMessage) -> InboundMessage {
        let delivery = Arc::new(OutboundDelivery::new(
            gateway.clone(),
            DeliveryConfig::default(),
        ));
        let content = raw.content.clone();
        InboundMessage::from_raw(raw, content, delivery)
    }

    #[tokio::test]
    async fn empty_chain_runs_handler() {
        let gateway = Arc::new(MockGateway::new());
        let handler = CountingHandler::default();
        let chain = MiddlewareChain::new();

        let msg = message(&gateway, raw_message(1, 42, "ping"));
        assert!(chain.execute(&msg, &handler).await.unwrap());
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn runs_in_registration_order() {
        let gateway = Arc::new(MockGateway::new());
        let handler = CountingHandler::default();
        let mut chain = MiddlewareChain::new();
        chain.add(Tracer("first")).add(Tracer("second"));
        assert_eq!(chain.names(), vec!["first", "second"]);

        let msg = message(&gateway, raw_message(1, 42, "ping"));
        assert!(chain.execute(&msg, &handler).await.unwrap());
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancellation_skips_rest_of_chain() {
        let gateway = Arc::new(MockGateway::new());
        let handler = CountingHandler::default();
        let mut chain = MiddlewareChain::new();
        chain.add(Blocker).add(Tracer("after"));

        let msg = message(&gateway, raw_message(1, 42, "ping"));
        assert!(!chain.execute(&msg, &handler).await.unwrap());
        assert_eq!(handler.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn remove_and_clear() {
        let mut chain = MiddlewareChain::new();
        chain.add(LoggingMiddleware).add(DmOnlyMiddleware);
        assert!(chain.remove("logging"));
        assert!(!chain.remove("logging"));
        assert_eq!(chain.names(), vec!["dm_only"]);
        chain.clear();
        assert!(chain.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limit_blocks_excess_per_user() {
        let gateway = Arc::new(MockGateway::new());
        let handler = CountingHandler::default();
        let mut chain = MiddlewareChain::new();
        chain.add(RateLimitMiddleware::new(2, Duration::from_secs(10)));

        let alice = message(&gateway, raw_message(1, 42, "ping"));
        let bob = message(&gateway, raw_message(1, 43, "ping"));

        assert!(chain.execute(&alice, &handler).await.unwrap());
        assert!(chain.execute(&alice, &handler).await.unwrap());
        assert!(!chain.execute(&alice, &handler).await.unwrap());
        assert!(chain.execute(&bob, &handler).await.unwrap());
        assert_eq!(handler.calls.load(Ordering::SeqCst), 3);
        assert_eq!(
            gateway.sent_texts(ChannelId(1)),
            vec!["You're sending commands too fast! Please wait 10 seconds.".to_string()]
        );

        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(chain.execute(&alice, &handler).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limit_forgets_idle_users() {
        let limiter = RateLimitMiddleware::new(2, Duration::from_secs(10));
        for user in 100..150 {
            assert!(limiter.admit(UserId(user)));
        }
        assert_eq!(limiter.tracked_users(), 50);

        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(limiter.admit(UserId(42)));
        assert_eq!(limiter.tracked_users(), 1);
    }

    #[tokio::test]
    async fn dm_only_rejects_guild_messages() {
        let gateway = Arc::new(MockGateway::new());
        let handler = CountingHandler::default();
        let mut chain = MiddlewareChain::new();
        chain.add(DmOnlyMiddleware);

        let guild = message(&gateway, raw_message(1, 42, "secret"));
        assert!(!chain.execute(&guild, &handler).await.unwrap());
        assert_eq!(
            gateway.sent_texts(ChannelId(1)),
            vec!["This command only works in direct messages!".to_string()]
        );

        let dm = message(&gateway, raw_dm(2, 42, "secret"));
        assert!(chain.execute(&dm, &handler).await.unwrap());
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn admin_only_checks_user_id() {
        let gateway = Arc::new(MockGateway::new());
        let handler = CountingHandler::default();
        let mut chain = MiddlewareChain::new();
        chain.add(AdminOnlyMiddleware::new([UserId(1)]));

        let admin = message(&gateway, raw_message(5, 1, "shutdown"));
        let other = message(&gateway, raw_message(5, 2, "shutdown"));
        assert!(chain.execute(&admin, &handler).await.unwrap());
        assert!(!chain.execute(&other, &handler).await.unwrap());
        assert_eq!(
            gateway.sent_texts(ChannelId(5)),
            vec!["You don't have permission to use this command.".to_string()]
        );
    }

    #[tokio::test]
    async fn router_is_a_message_handler() {
        use crate::router::CommandRouter;

        let gateway = Arc::new(MockGateway::new());
        let mut router = CommandRouter::new("!");
        router.command("ping", "", "", |msg, _| {
            Box::pin(async move {
                msg.reply("pong").await?;
                Ok(())
            })
        });
        let mut chain = MiddlewareChain::new();
        chain.add(LoggingMiddleware);

        let msg = message(&gateway, raw_message(3, 42, "ping"));
        assert!(chain.execute(&msg, &router).await.unwrap());
        assert_eq!(gateway.sent_texts(ChannelId(3)), vec!["pong".to_string()]);
    }
}
