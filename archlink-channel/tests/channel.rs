//! End-to-end channel behaviour against the loopback host.

use archlink_channel::{
    AutonomousAction, AutonomousOutcome, Category, Channel, ChannelConfig, ChannelEvent,
    ConnectionState, ErrorClass, ErrorKind, HostEnd, LoopbackConnector, LoopbackHost, Message,
};
use serde_json::json;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_test::assert_err;

fn config() -> ChannelConfig {
    ChannelConfig::new("loopback://engine", "secret")
}

fn open(config: ChannelConfig) -> (Channel<LoopbackConnector>, LoopbackHost) {
    let (connector, host) = LoopbackConnector::pair();
    let channel = Channel::builder(config).connector(connector).build().unwrap();
    (channel, host)
}

async fn serve(host: &mut LoopbackHost) -> HostEnd {
    let mut end = host.accept().await.expect("no link opened");
    end.accept_handshake().await.expect("no handshake");
    end
}

async fn connected(config: ChannelConfig) -> (Channel<LoopbackConnector>, LoopbackHost, HostEnd) {
    let (channel, mut host) = open(config);
    let (result, end) = tokio::join!(channel.connect(), serve(&mut host));
    result.unwrap();
    (channel, host, end)
}

fn request(text: &str) -> Message {
    Message::architect_request(text, json!({"source": "test"}))
}

async fn next_unsolicited(events: &mut broadcast::Receiver<ChannelEvent>) -> Message {
    loop {
        if let ChannelEvent::Unsolicited(message) = events.recv().await.unwrap() {
            return message;
        }
    }
}

#[tokio::test(start_paused = true)]
async fn test_unreachable_then_recovers_without_caller() {
    let (channel, mut host) = open(config());
    host.set_reachable(false);

    let err = assert_err!(channel.connect().await);
    assert_eq!(err.kind(), ErrorKind::ConnectionFailed);
    assert_eq!(err.class(), ErrorClass::Connection);
    assert_eq!(channel.state(), ConnectionState::Faulted);

    host.set_reachable(true);
    let _end = serve(&mut host).await;

    let mut state = channel.watch_state();
    state.wait_for(|s| s.is_connected()).await.unwrap();
    assert!(channel.is_connected());
    assert_eq!(host.attempts(), 2);
}

#[tokio::test]
async fn test_commands_wait_for_connection_in_order() {
    let (channel, mut host) = open(config());

    let mut waits = Vec::new();
    for (n, text) in ["A", "B", "C"].into_iter().enumerate() {
        let ch = channel.clone();
        waits.push(tokio::spawn(async move { ch.send_command(request(text)).await }));
        while channel.queued() < n + 1 {
            tokio::task::yield_now().await;
        }
    }
    assert_eq!(channel.outstanding(), 3);

    let (result, mut end) = tokio::join!(channel.connect(), serve(&mut host));
    result.unwrap();

    let mut seen = Vec::new();
    for _ in 0..3 {
        let command = end.recv().await.unwrap();
        seen.push(command.field("message").unwrap().as_str().unwrap().to_string());
        end.respond(&command, "ok");
    }
    assert_eq!(seen, vec!["A", "B", "C"]);

    for wait in waits {
        assert_eq!(wait.await.unwrap().unwrap().status(), Some("ok"));
    }
    assert_eq!(channel.outstanding(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_timeout_removes_pending_request() {
    let (channel, _host, mut end) = connected(config()).await;
    let mut events = channel.subscribe();

    let (result, command) = tokio::join!(
        channel.send_command_with_timeout(request("slow"), Duration::from_secs(2)),
        end.recv()
    );
    let err = assert_err!(result);
    assert_eq!(err.kind(), ErrorKind::ResponseTimeout);
    assert_eq!(channel.outstanding(), 0);

    let command = command.unwrap();
    end.respond(&command, "too late");
    let late = next_unsolicited(&mut events).await;
    assert_eq!(late.correlation_id, command.correlation_id);
}

#[tokio::test]
async fn test_critical_action_never_transmitted() {
    let (channel, _host, mut end) = connected(config()).await;

    let outcome = channel
        .submit_autonomous(AutonomousAction::new("delete_environment").with_parameter("id", "world-1"))
        .unwrap();
    assert!(matches!(outcome, AutonomousOutcome::NeedsApproval(_)));

    let outcome = channel
        .submit_autonomous(AutonomousAction::new("place_model").with_parameter("model", "oak"))
        .unwrap();
    assert!(matches!(outcome, AutonomousOutcome::Dispatched(_)));

    // the first frame after the handshake is the ordinary action
    let sent = end.recv().await.unwrap();
    assert!(sent.is(Category::Architect, "place_model"));
    assert!(end.try_recv().is_none());
}

#[tokio::test]
async fn test_custom_critical_set() {
    let (channel, _host, _end) =
        connected(config().with_critical_actions(["spawn_storm"])).await;

    let held = channel.submit_autonomous(AutonomousAction::new("spawn_storm")).unwrap();
    assert!(matches!(held, AutonomousOutcome::NeedsApproval(_)));
    let sent = channel.submit_autonomous(AutonomousAction::new("reset_scene")).unwrap();
    assert!(matches!(sent, AutonomousOutcome::Dispatched(_)));
}

#[tokio::test]
async fn test_cancelled_wait_turns_reply_unsolicited() {
    let (channel, _host, mut end) = connected(config()).await;
    let mut events = channel.subscribe();

    let ch = channel.clone();
    let wait = tokio::spawn(async move { ch.send_command(request("abandon me")).await });
    let command = end.recv().await.unwrap();

    wait.abort();
    assert!(wait.await.unwrap_err().is_cancelled());
    assert_eq!(channel.outstanding(), 0);

    end.respond(&command, "done anyway");
    let late = next_unsolicited(&mut events).await;
    assert_eq!(late.correlation_id, command.correlation_id);
}

#[tokio::test]
async fn test_duplicate_reply_ignored() {
    let (channel, _host, mut end) = connected(config()).await;
    let mut events = channel.subscribe();

    let (reply, command) = tokio::join!(channel.send_command(request("once")), async {
        let command = end.recv().await.unwrap();
        end.respond(&command, "first");
        command
    });
    assert_eq!(reply.unwrap().status(), Some("first"));

    end.respond(&command, "second");
    end.send(&Message::environment("state_update", "weather", json!({"rain": true})));

    // the duplicate produced nothing; the push is the first unsolicited message
    let pushed = next_unsolicited(&mut events).await;
    assert!(pushed.is(Category::Environment, "state_update"));
}

#[tokio::test]
async fn test_reply_without_id_matches_oldest_request() {
    let (channel, _host, mut end) = connected(config()).await;

    let (reply, _) = tokio::join!(channel.send_command(request("legacy")), async {
        end.recv().await.unwrap();
        end.send(&Message::new(Category::Architect, "response").with_field("status", "legacy-ok"));
    });
    assert_eq!(reply.unwrap().status(), Some("legacy-ok"));
}

#[tokio::test]
async fn test_id_less_reply_to_autonomous_command_not_given_to_user() {
    let (channel, _host, mut end) = connected(config()).await;
    let mut events = channel.subscribe();

    let outcome = channel
        .submit_autonomous(AutonomousAction::new("place_model").with_parameter("model", "oak"))
        .unwrap();
    assert!(matches!(outcome, AutonomousOutcome::Dispatched(_)));
    assert!(end.recv().await.unwrap().is(Category::Architect, "place_model"));

    let (reply, _) = tokio::join!(channel.send_command(request("user A")), async {
        end.recv().await.unwrap();
        end.send(&Message::new(Category::Architect, "response").with_field("status", "for-place_model"));
        end.send(&Message::new(Category::Architect, "response").with_field("status", "for-user-A"));
    });
    assert_eq!(reply.unwrap().status(), Some("for-user-A"));
    assert_eq!(next_unsolicited(&mut events).await.status(), Some("for-place_model"));
}

#[tokio::test]
async fn test_error_reply_fails_command() {
    let (channel, _host, mut end) = connected(config()).await;

    let (reply, _) = tokio::join!(channel.send_command(request("impossible")), async {
        let command = end.recv().await.unwrap();
        let mut refusal = Message::new(Category::System, "error")
            .stamped()
            .with_field("message", "no such model");
        refusal.correlation_id = command.correlation_id;
        end.send(&refusal);
    });
    let err = assert_err!(reply);
    assert_eq!(err.kind(), ErrorKind::CommandRejected);
    assert!(err.message().contains("no such model"));
}

#[tokio::test(start_paused = true)]
async fn test_reply_without_id_ignored_when_legacy_disabled() {
    let (channel, _host, mut end) = connected(config().with_legacy_correlation(false)).await;
    let mut events = channel.subscribe();

    let (reply, _) = tokio::join!(
        channel.send_command_with_timeout(request("strict"), Duration::from_secs(1)),
        async {
            end.recv().await.unwrap();
            end.send(&Message::new(Category::Architect, "response").with_field("status", "??"));
        }
    );
    assert_eq!(assert_err!(reply).kind(), ErrorKind::ResponseTimeout);
    assert_eq!(next_unsolicited(&mut events).await.status(), Some("??"));
}

#[tokio::test]
async fn test_invalid_reply_fails_its_request() {
    let (channel, _host, mut end) = connected(config()).await;

    let (reply, _) = tokio::join!(channel.send_command(request("bad reply")), async {
        let command = end.recv().await.unwrap();
        let mut reply = Message::new(Category::Architect, "response");
        reply.correlation_id = command.correlation_id;
        end.send(&reply);
    });
    let err = assert_err!(reply);
    assert_eq!(err.kind(), ErrorKind::ValidationFailed);
    assert!(err.message().contains("status"));
}

#[tokio::test]
async fn test_malformed_inbound_is_rejected() {
    let (channel, _host, end) = connected(config()).await;
    let mut events = channel.subscribe();

    end.send_frame(b"not json".to_vec());
    loop {
        if let ChannelEvent::Rejected { reason } = events.recv().await.unwrap() {
            assert!(reason.contains("malformed"));
            break;
        }
    }
    assert!(channel.is_connected());
}

#[tokio::test(start_paused = true)]
async fn test_delivery_exhausted_after_attempt_cap() {
    let (channel, mut host) = open(config().with_max_delivery_attempts(2).with_response_timeout(120));
    let mut events = channel.subscribe();

    let host_side = async {
        let mut ends = Vec::new();
        for _ in 0..2 {
            let end = serve(&mut host).await;
            end.refuse_writes();
            ends.push(end);
        }
        ends
    };
    let client_side = async {
        channel.connect().await.unwrap();
        channel.send_command(request("doomed")).await
    };

    let (result, _ends) = tokio::join!(client_side, host_side);
    let err = assert_err!(result);
    assert_eq!(err.kind(), ErrorKind::DeliveryExhausted);
    assert_eq!(err.class(), ErrorClass::DeliveryExhausted);
    assert_eq!(channel.outstanding(), 0);

    loop {
        if let ChannelEvent::DeliveryFailed { attempts, .. } = events.recv().await.unwrap() {
            assert_eq!(attempts, 2);
            break;
        }
    }
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_is_terminal_until_connect() {
    let (channel, mut host, mut end) = connected(config()).await;

    channel.disconnect().await;
    assert_eq!(channel.state(), ConnectionState::Disconnected);
    assert!(end.recv().await.unwrap().is(Category::System, "disconnect"));

    let ch = channel.clone();
    let wait = tokio::spawn(async move { ch.send_command(request("after goodbye")).await });

    // several monitor ticks pass without a reconnect
    tokio::time::sleep(Duration::from_secs(20)).await;
    assert_eq!(host.attempts(), 1);
    assert_eq!(channel.state(), ConnectionState::Disconnected);

    let (result, mut end) = tokio::join!(channel.connect(), serve(&mut host));
    result.unwrap();
    let command = end.recv().await.unwrap();
    assert_eq!(command.field("message").unwrap(), "after goodbye");
    end.respond(&command, "welcome back");
    assert_eq!(wait.await.unwrap().unwrap().status(), Some("welcome back"));
}

#[tokio::test]
async fn test_link_loss_faults_then_events_report_it() {
    let (channel, _host, mut end) = connected(config()).await;
    let mut events = channel.subscribe();

    end.close();
    loop {
        if let ChannelEvent::StateChanged { from, to } = events.recv().await.unwrap() {
            assert_eq!(from, ConnectionState::Connected);
            assert_eq!(to, ConnectionState::Faulted);
            break;
        }
    }
    assert!(!channel.is_connected());
}

#[tokio::test]
async fn test_autonomous_processor_routes_through_gate() {
    let mut cfg = config();
    cfg.autonomous_mode = true;
    let (channel, _host, mut end) = connected(cfg).await;
    let mut events = channel.subscribe();

    let (tx, rx) = tokio::sync::mpsc::channel(8);
    let processor = channel.spawn_autonomous(rx).unwrap();
    tx.send(AutonomousAction::new("reset_scene")).await.unwrap();
    tx.send(AutonomousAction::new("paint_sky").with_parameter("color", "teal")).await.unwrap();
    drop(tx);
    processor.await.unwrap();

    let sent = end.recv().await.unwrap();
    assert!(sent.is(Category::Architect, "paint_sky"));
    assert_eq!(sent.field("parameters").unwrap()["color"], "teal");

    loop {
        if let ChannelEvent::ApprovalRequired(action) = events.recv().await.unwrap() {
            assert_eq!(action.kind, "reset_scene");
            break;
        }
    }
}
