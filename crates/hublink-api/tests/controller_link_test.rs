#![allow(clippy::unwrap_used)]
// Integration tests for `ControllerLink` against an in-process controller
// speaking the WebSocket protocol on loopback.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{WebSocketStream, accept_async};
use url::Url;

use hublink_api::{
    ControllerCommand, ControllerLink, ControllerLinkConfig, ControllerState, Error,
    ReconnectConfig,
};

type ServerSocket = WebSocketStream<TcpStream>;

// ── Helpers ─────────────────────────────────────────────────────────

async fn bind() -> (TcpListener, Url) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let url = Url::parse(&format!("ws://{addr}/api/websocket")).unwrap();
    (listener, url)
}

fn link_for(url: Url) -> ControllerLink {
    link_with(
        url,
        ReconnectConfig {
            initial_delay: Duration::from_secs(30),
            max_delay: Duration::from_secs(30),
            max_retries: Some(1),
            ..ReconnectConfig::default()
        },
    )
}

fn link_with(url: Url, reconnect: ReconnectConfig) -> ControllerLink {
    let mut config = ControllerLinkConfig::new(url, "test-token".to_string().into());
    config.request_timeout = Duration::from_secs(5);
    config.handshake_timeout = Duration::from_secs(5);
    config.reconnect = reconnect;
    ControllerLink::new(config).unwrap()
}

/// Fast retries, giving up after two failed sessions.
fn quick_retries() -> ReconnectConfig {
    ReconnectConfig {
        initial_delay: Duration::from_millis(50),
        max_delay: Duration::from_millis(100),
        max_retries: Some(2),
        ..ReconnectConfig::default()
    }
}

async fn wait_for_state(link: &ControllerLink, wanted: ControllerState) {
    let mut states = link.state_watch();
    tokio::time::timeout(Duration::from_secs(5), states.wait_for(|s| *s == wanted))
        .await
        .unwrap()
        .unwrap();
}

async fn send_json(socket: &mut ServerSocket, value: Value) {
    socket.send(Message::text(value.to_string())).await.unwrap();
}

async fn next_json(socket: &mut ServerSocket) -> Option<Value> {
    while let Some(frame) = socket.next().await {
        match frame.ok()? {
            Message::Text(text) => return serde_json::from_str(text.as_str()).ok(),
            Message::Close(_) => return None,
            _ => {}
        }
    }
    None
}

/// Accept one socket and run the auth exchange. Returns the token the
/// client presented.
async fn accept_and_auth(listener: &TcpListener, accept: bool) -> (ServerSocket, String) {
    let (tcp, _) = listener.accept().await.unwrap();
    let mut socket = accept_async(tcp).await.unwrap();

    send_json(&mut socket, json!({ "type": "auth_required", "ha_version": "2026.3.0" })).await;
    let auth = next_json(&mut socket).await.unwrap();
    assert_eq!(auth["type"], "auth");
    let token = auth["access_token"].as_str().unwrap().to_owned();

    if accept {
        send_json(&mut socket, json!({ "type": "auth_ok", "ha_version": "2026.3.0" })).await;
    } else {
        send_json(&mut socket, json!({ "type": "auth_invalid", "message": "Invalid access token" }))
            .await;
    }
    (socket, token)
}

fn ok_result(id: &Value, result: Value) -> Value {
    json!({ "id": id, "type": "result", "success": true, "result": result })
}

// ── Handshake ───────────────────────────────────────────────────────

#[tokio::test]
async fn test_connect_authenticates_with_token() {
    let (listener, url) = bind().await;
    let server = tokio::spawn(async move {
        let (mut socket, token) = accept_and_auth(&listener, true).await;
        // Answer the automatic state_changed subscription, then idle.
        while let Some(frame) = next_json(&mut socket).await {
            send_json(&mut socket, ok_result(&frame["id"], Value::Null)).await;
        }
        token
    });

    let link = link_for(url);
    link.connect().await.unwrap();
    assert_eq!(link.connection_state(), ControllerState::Connected);

    // Second call is a no-op.
    link.connect().await.unwrap();

    link.disconnect().await;
    assert_eq!(link.connection_state(), ControllerState::Disconnected);
    assert_eq!(server.await.unwrap(), "test-token");
}

#[tokio::test]
async fn test_auth_rejection_is_fatal() {
    let (listener, url) = bind().await;
    tokio::spawn(async move {
        let (_socket, _) = accept_and_auth(&listener, false).await;
        tokio::time::sleep(Duration::from_secs(1)).await;
    });

    let link = link_for(url);
    let result = link.connect().await;

    assert!(
        matches!(result, Err(Error::Authentication { ref message }) if message == "Invalid access token"),
        "expected Authentication error, got: {result:?}"
    );
    assert_eq!(link.connection_state(), ControllerState::Error);
    assert!(matches!(link.last_error(), Some(Error::Authentication { .. })));
}

// ── Reconnection ────────────────────────────────────────────────────

#[tokio::test]
async fn test_clean_close_after_auth_backs_off_then_fails() {
    let (listener, url) = bind().await;
    let sessions = Arc::new(AtomicUsize::new(0));
    {
        let sessions = Arc::clone(&sessions);
        tokio::spawn(async move {
            loop {
                let (mut socket, _) = accept_and_auth(&listener, true).await;
                sessions.fetch_add(1, Ordering::SeqCst);
                let _ = socket.close(None).await;
            }
        });
    }

    let link = link_with(url, quick_retries());
    link.connect().await.unwrap();
    wait_for_state(&link, ControllerState::Error).await;

    assert!(
        matches!(link.last_error(), Some(Error::RetriesExhausted { attempts: 2 })),
        "got: {:?}",
        link.last_error()
    );
    // First session plus two retries, then nothing more.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(sessions.load(Ordering::SeqCst), 3);
    assert_eq!(link.connection_state(), ControllerState::Error);
}

#[tokio::test]
async fn test_connect_fails_once_retries_run_out() {
    let (listener, url) = bind().await;
    let attempts = Arc::new(AtomicUsize::new(0));
    {
        let attempts = Arc::clone(&attempts);
        tokio::spawn(async move {
            loop {
                // Drop the TCP stream before the upgrade.
                let (tcp, _) = listener.accept().await.unwrap();
                attempts.fetch_add(1, Ordering::SeqCst);
                drop(tcp);
            }
        });
    }

    let link = link_with(url, quick_retries());
    let err = link.connect().await.unwrap_err();

    assert!(matches!(err, Error::RetriesExhausted { attempts: 2 }), "got: {err:?}");
    assert_eq!(link.connection_state(), ControllerState::Error);
    assert!(matches!(link.last_error(), Some(Error::RetriesExhausted { .. })));
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_subscriptions_are_reissued_after_reconnect() {
    let (listener, url) = bind().await;
    let (resubscribed_tx, mut resubscribed_rx) = tokio::sync::mpsc::unbounded_channel();
    tokio::spawn(async move {
        // First session: answer everything, drop once "x" is subscribed.
        let (mut socket, _) = accept_and_auth(&listener, true).await;
        while let Some(frame) = next_json(&mut socket).await {
            send_json(&mut socket, ok_result(&frame["id"], Value::Null)).await;
            if frame["event_type"] == "x" {
                break;
            }
        }
        drop(socket);

        // Second session: confirm the re-issued subscription and fire on it.
        let (mut socket, _) = accept_and_auth(&listener, true).await;
        while let Some(frame) = next_json(&mut socket).await {
            send_json(&mut socket, ok_result(&frame["id"], Value::Null)).await;
            if frame["type"] == "subscribe_events" {
                let _ = resubscribed_tx.send(frame["event_type"].clone());
            }
            if frame["event_type"] == "x" {
                let event = json!({
                    "id": frame["id"],
                    "type": "event",
                    "event": { "event_type": "x", "data": { "n": 1 } }
                });
                send_json(&mut socket, event).await;
            }
        }
    });

    let link = link_with(
        url,
        ReconnectConfig {
            max_retries: Some(5),
            ..quick_retries()
        },
    );
    let mut events = link.events();
    link.connect().await.unwrap();
    let subscription = link.subscribe("x").await.unwrap();

    let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event.subscription, subscription);
    assert_eq!(event.event_type, "x");
    assert_eq!(event.data["n"], 1);

    let mut reissued = Vec::new();
    while let Ok(event_type) = resubscribed_rx.try_recv() {
        reissued.push(event_type);
    }
    assert!(reissued.contains(&json!("state_changed")), "{reissued:?}");
    assert!(reissued.contains(&json!("x")), "{reissued:?}");
    link.disconnect().await;
}

// ── Requests ────────────────────────────────────────────────────────

#[tokio::test]
async fn test_pending_requests_rejected_when_socket_drops() {
    let (listener, url) = bind().await;
    tokio::spawn(async move {
        let (mut socket, _) = accept_and_auth(&listener, true).await;
        let mut unanswered = 0;
        while let Some(frame) = next_json(&mut socket).await {
            if frame["type"] == "get_states" {
                unanswered += 1;
                if unanswered == 3 {
                    break;
                }
            } else {
                send_json(&mut socket, ok_result(&frame["id"], Value::Null)).await;
            }
        }
        // Drop without a close frame.
        drop(socket);
        tokio::time::sleep(Duration::from_secs(1)).await;
    });

    let link = link_for(url);
    link.connect().await.unwrap();

    let (a, b, c) = tokio::join!(
        link.send_request(ControllerCommand::GetStates),
        link.send_request(ControllerCommand::GetStates),
        link.send_request(ControllerCommand::GetStates),
    );

    for outcome in [a, b, c] {
        let err = outcome.unwrap_err();
        assert!(matches!(err, Error::ConnectionClosed), "got: {err:?}");
        assert_eq!(err.to_string(), "connection closed");
    }
    link.disconnect().await;
}

#[tokio::test]
async fn test_failed_result_carries_remote_code() {
    let (listener, url) = bind().await;
    tokio::spawn(async move {
        let (mut socket, _) = accept_and_auth(&listener, true).await;
        while let Some(frame) = next_json(&mut socket).await {
            let reply = if frame["type"] == "call_service" {
                json!({
                    "id": frame["id"],
                    "type": "result",
                    "success": false,
                    "error": { "code": "not_found", "message": "Service light.explode not found." }
                })
            } else {
                ok_result(&frame["id"], Value::Null)
            };
            send_json(&mut socket, reply).await;
        }
    });

    let link = link_for(url);
    link.connect().await.unwrap();

    let err = link
        .call_service("light", "explode", None, Some("light.kitchen"))
        .await
        .unwrap_err();

    assert_eq!(err.remote_code(), Some("not_found"));
    assert!(!err.is_timeout());
    link.disconnect().await;
}

// ── Events and cache ────────────────────────────────────────────────

#[tokio::test]
async fn test_state_changes_pair_with_cached_state() {
    let (listener, url) = bind().await;
    tokio::spawn(async move {
        let (mut socket, _) = accept_and_auth(&listener, true).await;
        let mut state_sub: Option<Value> = None;
        while let Some(frame) = next_json(&mut socket).await {
            match frame["type"].as_str().unwrap() {
                "subscribe_events" => {
                    state_sub = Some(frame["id"].clone());
                    send_json(&mut socket, ok_result(&frame["id"], Value::Null)).await;
                }
                "get_states" => {
                    let states = json!([{
                        "entity_id": "light.kitchen",
                        "state": "off",
                        "attributes": { "friendly_name": "Kitchen" }
                    }]);
                    send_json(&mut socket, ok_result(&frame["id"], states)).await;

                    let event = json!({
                        "id": state_sub.clone().unwrap(),
                        "type": "event",
                        "event": {
                            "event_type": "state_changed",
                            "data": {
                                "entity_id": "light.kitchen",
                                "old_state": null,
                                "new_state": {
                                    "entity_id": "light.kitchen",
                                    "state": "on",
                                    "attributes": { "brightness": 191 }
                                }
                            }
                        }
                    });
                    send_json(&mut socket, event).await;
                }
                _ => send_json(&mut socket, ok_result(&frame["id"], Value::Null)).await,
            }
        }
    });

    let link = link_for(url);
    let mut changes = link.state_changes();
    link.connect().await.unwrap();

    // Let the automatic subscription land before asking for states.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let states = link.get_states().await.unwrap();
    assert_eq!(states.len(), 1);

    let change = tokio::time::timeout(Duration::from_secs(2), changes.recv())
        .await
        .unwrap()
        .unwrap();

    assert_eq!(change.entity_id, "light.kitchen");
    assert_eq!(change.old_state.as_ref().unwrap().state, "off");
    assert_eq!(change.new_state.as_ref().unwrap().state, "on");
    assert_eq!(link.cached_state("light.kitchen").unwrap().state, "on");
    link.disconnect().await;
}

#[tokio::test]
async fn test_ping_round_trip() {
    let (listener, url) = bind().await;
    tokio::spawn(async move {
        let (mut socket, _) = accept_and_auth(&listener, true).await;
        while let Some(frame) = next_json(&mut socket).await {
            let reply = if frame["type"] == "ping" {
                json!({ "id": frame["id"], "type": "pong" })
            } else {
                ok_result(&frame["id"], Value::Null)
            };
            send_json(&mut socket, reply).await;
        }
    });

    let link = link_for(url);
    link.connect().await.unwrap();
    let latency = link.ping().await.unwrap();
    assert!(latency < Duration::from_secs(5));
    link.disconnect().await;
}
