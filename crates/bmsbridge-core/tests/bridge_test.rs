#![allow(clippy::unwrap_used)]
// Event path tests: transport message -> decode -> sink.

mod common;

use std::sync::atomic::Ordering;
use std::time::Duration;

use pretty_assertions::assert_eq;
use serde_json::json;

use bmsbridge_core::codec::encode;
use bmsbridge_core::{Bridge, BridgeSignal, ConnectionState, InboundEvent, SinkKind, TransportEvent};

use common::{
    FailingSink, FakeAuth, FakeTransport, RecordingSink, bearer, config, is_subscribed, policy,
    two_locations, wait_for_signal,
};

fn sensor_event(channel: &str, payload: Option<String>) -> TransportEvent {
    TransportEvent::Message {
        channel: channel.into(),
        event: "sensor.state_changed".into(),
        data: payload,
    }
}

#[tokio::test(start_paused = true)]
async fn bound_events_reach_the_sink_decoded() {
    let transport = FakeTransport::accepting();
    let (sink, mut delivered) = RecordingSink::new();
    let bridge = Bridge::new(
        &config(two_locations(), policy(100, 3), bearer()),
        FakeAuth::new(Duration::from_secs(3600)),
        transport.clone(),
        sink,
    )
    .unwrap();
    let mut signals = bridge.signals();

    bridge.connect().await;
    wait_for_signal(&mut signals, is_subscribed).await;

    let payload = json!({ "sensorId": "s-1", "state": "alarm", "value": 41.5 });
    transport
        .connection(0)
        .emit(sensor_event("private-location-11", Some(encode(&payload).unwrap())))
        .await;

    let event = delivered.recv().await.unwrap();
    assert_eq!(event.event_type, "sensor.state_changed");
    assert_eq!(event.channel, "private-location-11");
    assert_eq!(event.data, payload);

    let metrics = bridge.metrics();
    assert_eq!(metrics.events_received, 1);
    assert_eq!(metrics.events_delivered, 1);
}

#[tokio::test(start_paused = true)]
async fn unbound_events_are_ignored() {
    let transport = FakeTransport::accepting();
    let (sink, mut delivered) = RecordingSink::new();
    let bridge = Bridge::new(
        &config(two_locations(), policy(100, 3), bearer()),
        FakeAuth::new(Duration::from_secs(3600)),
        transport.clone(),
        sink,
    )
    .unwrap();
    let mut signals = bridge.signals();

    bridge.connect().await;
    wait_for_signal(&mut signals, is_subscribed).await;

    let connection = transport.connection(0);
    connection
        .emit(TransportEvent::Message {
            channel: "private-location-10".into(),
            event: "user.created".into(),
            data: Some(encode(&json!({ "ignored": true })).unwrap()),
        })
        .await;
    connection
        .emit(sensor_event(
            "private-location-10",
            Some(encode(&json!({ "kept": true })).unwrap()),
        ))
        .await;

    let event = delivered.recv().await.unwrap();
    assert_eq!(event.data, json!({ "kept": true }));
    assert_eq!(bridge.metrics().events_ignored, 1);
}

#[tokio::test(start_paused = true)]
async fn failing_sink_does_not_disturb_the_connection() {
    let transport = FakeTransport::accepting();
    let sink = FailingSink::new();
    let bridge = Bridge::new(
        &config(two_locations(), policy(100, 3), bearer()),
        FakeAuth::new(Duration::from_secs(3600)),
        transport.clone(),
        sink.clone(),
    )
    .unwrap();
    let mut signals = bridge.signals();

    bridge.connect().await;
    wait_for_signal(&mut signals, is_subscribed).await;

    transport
        .connection(0)
        .emit(sensor_event(
            "private-location-10",
            Some(encode(&json!({ "n": 1 })).unwrap()),
        ))
        .await;

    tokio::time::timeout(Duration::from_secs(5), async {
        while bridge.metrics().delivery_failures == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    assert_eq!(sink.attempts.load(Ordering::SeqCst), 1);
    assert_eq!(bridge.state(), ConnectionState::Subscribed);
    assert_eq!(transport.opens(), 1);
    assert!(signals.try_recv().is_err(), "no lifecycle signal after a sink failure");
}

#[tokio::test]
async fn malformed_payload_never_reaches_the_sink() {
    let (sink, mut delivered) = RecordingSink::new();
    let bridge = Bridge::new(
        &config(two_locations(), policy(100, 3), bearer()),
        FakeAuth::new(Duration::from_secs(3600)),
        FakeTransport::accepting(),
        sink,
    )
    .unwrap();

    let accepted = bridge
        .process_event(InboundEvent {
            channel: "private-location-10".into(),
            event: "sensor.state_changed".into(),
            payload: Some("%%% definitely not base64 %%%".into()),
        })
        .await;

    assert!(!accepted);
    assert!(delivered.try_recv().is_err());
    let metrics = bridge.metrics();
    assert_eq!(metrics.decode_failures, 1);
    assert_eq!(metrics.events_delivered, 0);
}

#[tokio::test]
async fn missing_payload_is_a_decode_failure() {
    let (sink, mut delivered) = RecordingSink::new();
    let bridge = Bridge::new(
        &config(two_locations(), policy(100, 3), bearer()),
        FakeAuth::new(Duration::from_secs(3600)),
        FakeTransport::accepting(),
        sink,
    )
    .unwrap();

    let accepted = bridge
        .process_event(InboundEvent {
            channel: "private-location-10".into(),
            event: "sensor.state_changed".into(),
            payload: None,
        })
        .await;

    assert!(!accepted);
    assert!(delivered.try_recv().is_err());
    assert_eq!(bridge.metrics().decode_failures, 1);
}

#[tokio::test(start_paused = true)]
async fn shutdown_disconnects_and_flushes() {
    let transport = FakeTransport::accepting();
    let (sink, _delivered) = RecordingSink::new();
    let bridge = Bridge::new(
        &config(two_locations(), policy(100, 3), bearer()),
        FakeAuth::new(Duration::from_secs(3600)),
        transport.clone(),
        sink.clone(),
    )
    .unwrap();
    let mut signals = bridge.signals();

    bridge.connect().await;
    wait_for_signal(&mut signals, is_subscribed).await;

    bridge.shutdown().await;

    assert!(sink.flushed.load(Ordering::SeqCst));
    assert_eq!(bridge.state(), ConnectionState::Disconnected);
    assert!(transport.connection(0).log().contains(&"close".to_string()));
    let signal = wait_for_signal(&mut signals, |s| matches!(s, BridgeSignal::Disconnected { .. })).await;
    assert_eq!(
        signal,
        BridgeSignal::Disconnected {
            reason: "disconnect requested".into()
        }
    );
}

#[tokio::test]
async fn status_lists_planned_channels() {
    let (sink, _delivered) = RecordingSink::new();
    let bridge = Bridge::new(
        &config(two_locations(), policy(100, 3), bearer()),
        FakeAuth::new(Duration::from_secs(3600)),
        FakeTransport::accepting(),
        sink,
    )
    .unwrap();

    let status = bridge.status();
    assert_eq!(status.state, ConnectionState::Disconnected);
    assert_eq!(status.sink, SinkKind::Console);
    assert!(!status.is_healthy());
    let names: Vec<_> = status.channels.iter().map(|c| c.name.as_str()).collect();
    assert_eq!(names, vec!["private-location-10", "private-location-11"]);
}
