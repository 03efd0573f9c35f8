use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info, warn};

use discord_bridge::logging::init_logging;
use discord_bridge::middleware::{LoggingMiddleware, RateLimitMiddleware};
use discord_bridge::{Bridge, BridgeConfig, CommandRouter, MiddlewareChain};
use discord_bridge_serenity::SerenityGateway;

#[derive(Parser)]
#[command(name = "discord-bridge", version, about = "Run a Discord command bot")]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long, default_value = "config.yaml")]
    config: PathBuf,

    /// Log level used when RUST_LOG is not set.
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn build_router(prefix: &str) -> CommandRouter {
    let mut router = CommandRouter::new(prefix);
    router
        .command("echo", "Echo back your message", "<text>", |msg, args| {
            Box::pin(async move {
                let text = if args.is_empty() { "Nothing to echo" } else { args };
                msg.reply(text).await?;
                Ok(())
            })
        })
        .command("ping", "Check that the bot is responsive", "", |msg, _| {
            Box::pin(async move {
                let started = Instant::now();
                msg.reply("Pong!").await?;
                info!(elapsed_ms = started.elapsed().as_millis() as u64, "Ping answered");
                Ok(())
            })
        });
    router
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log_level)?;

    let config = BridgeConfig::load(&cli.config)
        .await
        .with_context(|| format!("loading {}", cli.config.display()))?;
    let router = build_router(&config.command_prefix);
    let mut middleware = MiddlewareChain::new();
    middleware
        .add(LoggingMiddleware)
        .add(RateLimitMiddleware::default());

    let bridge = Bridge::new(config, Arc::new(SerenityGateway::new()));
    bridge.start();
    let identity = bridge.wait_until_ready().await?;
    info!(bot = %identity.name, "Bot is ready");

    // Ctrl-C starts a graceful stop; the loop below keeps draining until the
    // listener ends.
    {
        let bridge = bridge.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Interrupt received, shutting down");
                bridge.stop().await;
            }
        });
    }

    let mut listener = bridge.listen();
    let mut failure = None;
    while let Some(item) = listener.next().await {
        match item {
            Ok(message) => {
                if let Err(e) = middleware.execute(&message, &router).await {
                    warn!(error = %e, "Message processing failed");
                }
            }
            Err(e) => {
                error!(error = %e, "Bridge failed");
                failure = Some(e);
            }
        }
    }

    let report = bridge.stop().await;
    info!(
        undelivered = report.undelivered,
        timed_out = report.timed_out,
        "Shutdown complete"
    );
    match failure {
        Some(e) => Err(e.into()),
        None => Ok(()),
    }
}
