//! End-to-end behavior of the bridge runtime against the in-memory gateway.

use std::sync::Arc;
use std::time::Duration;

use discord_bridge::testing::{MockGateway, raw_dm, raw_message};
use discord_bridge::{
    Bridge, BridgeConfig, BridgeError, ChannelId, CommandRouter, ConnectionState, GatewayError,
    ShutdownReport, UserId,
};
use tokio::time::Instant;

fn config() -> BridgeConfig {
    let mut config = BridgeConfig::new("test-token");
    config.shutdown_grace_seconds = 1.0;
    config
}

async fn running_bridge(config: BridgeConfig) -> (Bridge, Arc<MockGateway>) {
    let gateway = Arc::new(MockGateway::new());
    let bridge = Bridge::new(config, gateway.clone());
    bridge.start();
    bridge.wait_until_ready().await.unwrap();
    (bridge, gateway)
}

/// Let the event pump catch up with emitted events.
async fn settle() {
    tokio::time::sleep(Duration::from_millis(10)).await;
}

#[tokio::test(start_paused = true)]
async fn message_round_trip_through_listener_and_reply() {
    let (bridge, gateway) = running_bridge(config()).await;

    let mut raw = raw_message(100, 42, "!echo hi there");
    raw.author.display_name = Some("Alice".to_string());
    assert!(gateway.emit_message(raw).await);

    let mut listener = bridge.listen();
    let msg = listener.next().await.unwrap().unwrap();
    assert_eq!(msg.content(), "echo hi there");
    assert_eq!(msg.author_id(), UserId(42));
    assert_eq!(msg.author_name(), "Alice");
    assert_eq!(msg.channel_id(), ChannelId(100));
    assert!(!msg.is_dm());

    msg.reply("hi there").await.unwrap();
    assert_eq!(gateway.sent_texts(ChannelId(100)), vec!["hi there".to_string()]);

    bridge.stop().await;
}

#[tokio::test(start_paused = true)]
async fn filters_apply_before_queueing() {
    let mut config = config();
    config.allowed_channel_ids = vec![ChannelId(100)];
    let (bridge, gateway) = running_bridge(config).await;

    gateway.emit_message(raw_message(200, 42, "!echo elsewhere")).await;
    gateway
        .emit_message(raw_message(100, MockGateway::BOT_USER_ID, "!echo self"))
        .await;
    gateway.emit_message(raw_message(100, 42, "no prefix")).await;
    gateway.emit_message(raw_message(100, 42, "!echo kept")).await;

    let mut listener = bridge.listen();
    let msg = listener.next().await.unwrap().unwrap();
    assert_eq!(msg.content(), "echo kept");

    settle().await;
    let report = bridge.stop().await;
    assert_eq!(report.undelivered, 0);
    assert!(listener.next().await.is_none());
}

#[tokio::test(start_paused = true)]
async fn stop_is_idempotent_and_disconnects_once() {
    let (bridge, gateway) = running_bridge(config()).await;

    let first = bridge.stop().await;
    let second = bridge.stop().await;
    assert_eq!(first, second);
    assert_eq!(gateway.disconnect_count(), 1);
    assert_eq!(bridge.state(), ConnectionState::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn stop_lets_listener_drain_buffered_messages() {
    let (bridge, gateway) = running_bridge(config()).await;
    for i in 0..3 {
        gateway
            .emit_message(raw_message(1, 42, &format!("!m{i}")))
            .await;
    }
    settle().await;

    let stopper = {
        let bridge = bridge.clone();
        tokio::spawn(async move { bridge.stop().await })
    };

    let mut listener = bridge.listen();
    let mut seen = Vec::new();
    while let Some(item) = listener.next().await {
        seen.push(item.unwrap().content().to_string());
    }
    assert_eq!(seen, vec!["m0", "m1", "m2"]);

    let report = stopper.await.unwrap();
    assert_eq!(
        report,
        ShutdownReport {
            undelivered: 0,
            timed_out: false
        }
    );
    assert_eq!(gateway.disconnect_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn stop_without_consumer_times_out_and_reports_undelivered() {
    let (bridge, gateway) = running_bridge(config()).await;
    gateway.emit_message(raw_message(1, 42, "!a")).await;
    gateway.emit_message(raw_message(1, 42, "!b")).await;
    settle().await;

    let started = Instant::now();
    let report = bridge.stop().await;
    assert!(started.elapsed() >= Duration::from_secs(1));
    assert!(report.timed_out);
    assert_eq!(report.undelivered, 2);

    // Anything left over is gone once shutdown completes.
    assert!(bridge.listen().next().await.is_none());
}

#[tokio::test(start_paused = true)]
async fn messages_after_stop_are_not_accepted() {
    let (bridge, gateway) = running_bridge(config()).await;
    bridge.stop().await;

    assert!(!gateway.emit_message(raw_message(1, 42, "!late")).await);
    assert!(bridge.listen().next().await.is_none());
}

#[tokio::test(start_paused = true)]
async fn cancel_discards_buffered_messages() {
    let (bridge, gateway) = running_bridge(config()).await;
    gateway.emit_message(raw_message(1, 42, "!a")).await;
    gateway.emit_message(raw_message(1, 42, "!b")).await;
    settle().await;

    let mut listener = bridge.listen();
    bridge.cancel();
    assert!(listener.next().await.is_none());

    let report = bridge.stop().await;
    assert_eq!(report.undelivered, 0);
    assert!(!report.timed_out);
}

#[tokio::test(start_paused = true)]
async fn auth_failure_fails_readiness_without_retry() {
    let gateway = Arc::new(MockGateway::new());
    gateway.fail_all_connects(GatewayError::Auth("invalid token".into()));
    let bridge = Bridge::new(config(), gateway.clone());
    bridge.start();

    let err = bridge.wait_until_ready().await.unwrap_err();
    assert_eq!(
        err,
        BridgeError::Connection(GatewayError::Auth("invalid token".into()))
    );
    assert_eq!(gateway.connect_count(), 1);
    assert_eq!(bridge.state(), ConnectionState::Failed);
}

#[tokio::test(start_paused = true)]
async fn exhausted_reconnects_fail_readiness() {
    let gateway = Arc::new(MockGateway::new());
    gateway.fail_all_connects(GatewayError::Network("unreachable".into()));
    let mut config = config();
    config.max_reconnect_attempts = 3;
    config.reconnect_base_delay = 0.1;
    let bridge = Bridge::new(config, gateway.clone());
    bridge.start();

    let err = bridge.wait_until_ready().await.unwrap_err();
    assert_eq!(
        err,
        BridgeError::ReconnectExhausted {
            attempts: 3,
            last_error: GatewayError::Network("unreachable".into()),
        }
    );
    assert_eq!(gateway.connect_count(), 3);
}

#[tokio::test(start_paused = true)]
async fn listener_survives_reconnect() {
    let (bridge, gateway) = running_bridge(config()).await;
    let mut listener = bridge.listen();

    gateway.emit_message(raw_message(1, 42, "!before")).await;
    gateway.drop_connection("gateway restart").await;
    gateway.wait_for_connects(2).await;
    gateway.emit_message(raw_message(1, 42, "!after")).await;

    assert_eq!(listener.next().await.unwrap().unwrap().content(), "before");
    assert_eq!(listener.next().await.unwrap().unwrap().content(), "after");
    assert_eq!(bridge.state(), ConnectionState::Connected);

    bridge.stop().await;
}

#[tokio::test(start_paused = true)]
async fn listener_reports_failure_after_buffered_messages() {
    let mut config = config();
    config.max_reconnect_attempts = 2;
    config.reconnect_base_delay = 0.1;
    let (bridge, gateway) = running_bridge(config).await;
    let mut listener = bridge.listen();

    gateway.emit_message(raw_dm(9, 42, "!last words")).await;
    settle().await;
    gateway.fail_all_connects(GatewayError::Network("unreachable".into()));
    gateway.drop_connection("gateway gone").await;

    let msg = listener.next().await.unwrap().unwrap();
    assert_eq!(msg.content(), "last words");
    assert!(msg.is_dm());

    let err = listener.next().await.unwrap().unwrap_err();
    assert!(matches!(
        err,
        BridgeError::ReconnectExhausted { attempts: 2, .. }
    ));
    assert!(listener.next().await.is_none());
}

#[tokio::test(start_paused = true)]
async fn handler_failure_does_not_end_iteration() {
    let (bridge, gateway) = running_bridge(config()).await;

    let mut router = CommandRouter::new("!");
    router
        .command("boom", "Always fails", "", |_, _| {
            Box::pin(async { Err::<(), _>(anyhow::anyhow!("kaboom")) })
        })
        .command("ping", "Replies with pong", "", |msg, _| {
            Box::pin(async move {
                msg.reply("pong").await?;
                Ok(())
            })
        });

    gateway.emit_message(raw_message(5, 42, "!boom")).await;
    gateway.emit_message(raw_message(5, 42, "!ping")).await;

    let mut listener = bridge.listen();
    for _ in 0..2 {
        let msg = listener.next().await.unwrap().unwrap();
        assert!(router.handle(&msg).await);
    }
    assert_eq!(
        gateway.sent_texts(ChannelId(5)),
        vec![
            "Error executing command: kaboom".to_string(),
            "pong".to_string()
        ]
    );

    bridge.stop().await;
}

#[tokio::test(start_paused = true)]
async fn long_reply_is_chunked_and_paced() {
    let (bridge, gateway) = running_bridge(config()).await;
    gateway.emit_message(raw_message(3, 42, "!essay")).await;

    let msg = bridge.listen().next().await.unwrap().unwrap();
    let text = "x".repeat(4500);
    msg.reply(&text).await.unwrap();

    let sent = gateway.sent();
    assert_eq!(sent.len(), 3);
    let lengths: Vec<usize> = gateway
        .sent_texts(ChannelId(3))
        .iter()
        .map(|t| t.chars().count())
        .collect();
    assert_eq!(lengths, vec![2000, 2000, 500]);
    for pair in sent.windows(2) {
        assert!(pair[1].at - pair[0].at >= Duration::from_millis(1200));
    }

    bridge.stop().await;
}
