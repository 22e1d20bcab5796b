#![allow(clippy::unwrap_used)]
// Integration tests for `PusherSocket` against an in-process WebSocket server.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

use bmsbridge_api::{Error, Frame, PusherEndpoint, PusherEvent, PusherSocket};

// ── Helpers ─────────────────────────────────────────────────────────

fn established() -> Message {
    let data = json!({ "socket_id": "123.456", "activity_timeout": 120 }).to_string();
    Message::Text(json!({ "event": "pusher:connection_established", "data": data }).to_string().into())
}

fn endpoint_for(listener: &TcpListener) -> PusherEndpoint {
    let addr = listener.local_addr().unwrap();
    PusherEndpoint {
        host: Some(addr.to_string()),
        encrypted: false,
        ..PusherEndpoint::new("test-key", "local")
    }
}

async fn recv_event(events: &mut tokio::sync::mpsc::Receiver<PusherEvent>) -> PusherEvent {
    tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("timed out waiting for event")
        .expect("event channel closed")
}

// ── Tests ───────────────────────────────────────────────────────────

#[tokio::test]
async fn test_handshake_subscribe_and_receive() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let endpoint = endpoint_for(&listener);
    let (seen_tx, seen_rx) = oneshot::channel::<Value>();

    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
        ws.send(established()).await.unwrap();

        let subscribe = ws.next().await.unwrap().unwrap();
        let frame: Value = serde_json::from_str(subscribe.to_text().unwrap()).unwrap();
        let channel = frame["data"]["channel"].as_str().unwrap().to_owned();
        seen_tx.send(frame).unwrap();

        let ack = json!({
            "event": "pusher_internal:subscription_succeeded",
            "channel": channel,
            "data": "{}"
        });
        ws.send(Message::Text(ack.to_string().into())).await.unwrap();

        let event = json!({
            "event": "notification.created",
            "channel": channel,
            "data": "H4sIAAAAAAAA"
        });
        ws.send(Message::Text(event.to_string().into())).await.unwrap();

        // Hold the connection until the client closes it.
        while let Some(Ok(msg)) = ws.next().await {
            if msg.is_close() {
                break;
            }
        }
    });

    let cancel = CancellationToken::new();
    let (socket, mut events) = PusherSocket::connect(&endpoint, cancel.clone()).await.unwrap();
    assert_eq!(socket.socket_id(), "123.456");

    socket.send(Frame::subscribe("notifications", None)).await.unwrap();

    let seen = seen_rx.await.unwrap();
    assert_eq!(seen["event"], "pusher:subscribe");

    assert_eq!(
        recv_event(&mut events).await,
        PusherEvent::SubscriptionSucceeded {
            channel: "notifications".into()
        }
    );
    assert_eq!(
        recv_event(&mut events).await,
        PusherEvent::Message {
            channel: "notifications".into(),
            event: "notification.created".into(),
            data: Some("H4sIAAAAAAAA".into()),
        }
    );

    socket.close();
    assert!(matches!(recv_event(&mut events).await, PusherEvent::Closed { .. }));
}

#[tokio::test]
async fn test_server_ping_is_answered() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let endpoint = endpoint_for(&listener);
    let (pong_tx, pong_rx) = oneshot::channel::<String>();

    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
        ws.send(established()).await.unwrap();
        ws.send(Message::Text(json!({ "event": "pusher:ping", "data": "{}" }).to_string().into()))
            .await
            .unwrap();

        let reply = ws.next().await.unwrap().unwrap();
        let frame: Value = serde_json::from_str(reply.to_text().unwrap()).unwrap();
        pong_tx.send(frame["event"].as_str().unwrap().to_owned()).unwrap();
    });

    let (_socket, _events) = PusherSocket::connect(&endpoint, CancellationToken::new())
        .await
        .unwrap();

    let reply = tokio::time::timeout(Duration::from_secs(5), pong_rx)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reply, "pusher:pong");
}

#[tokio::test]
async fn test_handshake_error_is_reported() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let endpoint = endpoint_for(&listener);

    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
        let err = json!({
            "event": "pusher:error",
            "data": { "code": 4001, "message": "Application does not exist" }
        });
        ws.send(Message::Text(err.to_string().into())).await.unwrap();
    });

    let result = PusherSocket::connect(&endpoint, CancellationToken::new()).await;
    assert!(
        matches!(result, Err(Error::Protocol { code: Some(4001), .. })),
        "expected protocol error, got: {:?}",
        result.err()
    );
}

#[tokio::test]
async fn test_server_close_emits_closed() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let endpoint = endpoint_for(&listener);

    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
        ws.send(established()).await.unwrap();
        ws.close(None).await.unwrap();
    });

    let (_socket, mut events) = PusherSocket::connect(&endpoint, CancellationToken::new())
        .await
        .unwrap();
    assert!(matches!(recv_event(&mut events).await, PusherEvent::Closed { .. }));
}

#[tokio::test]
async fn test_connection_refused() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let endpoint = endpoint_for(&listener);
    drop(listener);

    let result = PusherSocket::connect(&endpoint, CancellationToken::new()).await;
    assert!(matches!(result, Err(Error::WebSocketConnect(_))));
}
