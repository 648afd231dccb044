//! Connection Lifecycle Integration Tests
//!
//! Drives a `ConnectionDriver` against the in-memory broker with paused
//! time: connect idempotence, manual disconnect, backoff exhaustion,
//! buffered publish ordering across dropped links, topic registration and
//! dead-link detection.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use vitals_stream::domain::topic;
use vitals_stream::infrastructure::connection::ReconnectConfig;
use vitals_stream::{
    ConnectionDriver, ConnectionHandle, ConnectionOptions, ConnectionState, ConnectionStatus,
    Credential, InboundMessage, MemoryBroker, MemoryTransport, OutboundFrame, PeerLink,
};

const WAIT: Duration = Duration::from_secs(600);

fn options() -> ConnectionOptions {
    let mut options = ConnectionOptions::new("memory://broker");
    options.reconnect = ReconnectConfig {
        jitter_max: Duration::ZERO,
        ..ReconnectConfig::default()
    };
    options
}

fn start(options: ConnectionOptions) -> (ConnectionHandle, MemoryBroker, CancellationToken) {
    let cancel = CancellationToken::new();
    let (transport, broker) = MemoryTransport::new();
    let (driver, handle) = ConnectionDriver::new(Arc::new(transport), options, cancel.clone());
    tokio::spawn(driver.run());
    (handle, broker, cancel)
}

/// Let every ready task run without moving the clock meaningfully.
async fn settle() {
    tokio::time::sleep(Duration::from_millis(1)).await;
}

async fn wait_status<F>(handle: &ConnectionHandle, predicate: F) -> ConnectionStatus
where
    F: FnMut(&ConnectionStatus) -> bool,
{
    let mut status = handle.watch_status();
    let result = timeout(WAIT, status.wait_for(predicate)).await;
    result.expect("status not reached").unwrap().clone()
}

async fn connect_and_accept(handle: &ConnectionHandle, broker: &mut MemoryBroker) -> PeerLink {
    handle.connect(None);
    let peer = timeout(WAIT, broker.accept()).await.unwrap().unwrap();
    wait_status(handle, ConnectionStatus::is_connected).await;
    peer
}

async fn next_message(rx: &mut mpsc::UnboundedReceiver<InboundMessage>) -> InboundMessage {
    timeout(WAIT, rx.recv()).await.unwrap().unwrap()
}

#[tokio::test(start_paused = true)]
async fn connect_while_connecting_or_connected_is_a_noop() {
    let (handle, mut broker, cancel) = start(options());

    handle.connect(Some(Credential::new("token")));
    handle.connect(None);
    let peer = timeout(WAIT, broker.accept()).await.unwrap().unwrap();
    assert_eq!(peer.credential, Some(Credential::new("token")));
    let before = wait_status(&handle, ConnectionStatus::is_connected).await;

    handle.connect(None);
    handle.connect(Some(Credential::new("other")));
    settle().await;

    assert_eq!(broker.connect_calls(), 1);
    assert!(broker.try_accept().is_none());
    assert_eq!(handle.status(), before);
    assert_eq!(handle.status().reconnect_attempts, 0);

    cancel.cancel();
}

#[tokio::test(start_paused = true)]
async fn manual_disconnect_tears_down_without_retry() {
    let (handle, mut broker, cancel) = start(options());
    let (_vitals, _vitals_rx) = handle.subscribe_channel("/topic/classroom/c1/vitals");
    let (_events, mut events) = handle.subscribe_channel(topic::SYSTEM_DISCONNECTED);

    let mut peer = connect_and_accept(&handle, &mut broker).await;
    assert_eq!(
        peer.next_frame().await,
        Some(OutboundFrame::Subscribe {
            topic: "/topic/classroom/c1/vitals".to_string()
        })
    );

    handle.disconnect();
    assert_eq!(
        peer.next_frame().await,
        Some(OutboundFrame::Unsubscribe {
            topic: "/topic/classroom/c1/vitals".to_string()
        })
    );
    assert!(matches!(
        peer.next_frame().await,
        Some(OutboundFrame::Close { code: 1000, .. })
    ));
    assert_eq!(peer.next_frame().await, None);

    let event = next_message(&mut events).await;
    assert_eq!(event.payload["code"], 1000);

    // The broker-side close arrives after teardown and goes nowhere.
    assert!(!peer.close(1006, "late"));
    tokio::time::sleep(Duration::from_secs(300)).await;

    let status = handle.status();
    assert_eq!(status.state, ConnectionState::Disconnected);
    assert!(status.manual_disconnect);
    assert!(!status.retry_pending);
    assert_eq!(broker.connect_calls(), 1);

    cancel.cancel();
}

#[tokio::test(start_paused = true)]
async fn unexpected_close_retries_with_backoff() {
    let (handle, mut broker, cancel) = start(options());
    let (_events, mut events) = handle.subscribe_channel(topic::SYSTEM_DISCONNECTED);

    let peer = connect_and_accept(&handle, &mut broker).await;
    let closed_at = tokio::time::Instant::now();
    assert!(peer.close(1006, "network"));

    let event = next_message(&mut events).await;
    assert_eq!(event.payload["code"], 1006);
    assert_eq!(event.payload["reason"], "network");

    let status = wait_status(&handle, |s| s.retry_pending).await;
    assert_eq!(status.reconnect_attempts, 1);
    assert_eq!(status.state, ConnectionState::Disconnected);

    let _second = timeout(WAIT, broker.accept()).await.unwrap().unwrap();
    assert!(closed_at.elapsed() >= Duration::from_secs(2));
    let status = wait_status(&handle, ConnectionStatus::is_connected).await;
    assert_eq!(status.reconnect_attempts, 0);
    assert_eq!(broker.connect_calls(), 2);

    cancel.cancel();
}

#[tokio::test(start_paused = true)]
async fn normal_close_from_broker_does_not_retry() {
    let (handle, mut broker, cancel) = start(options());

    let peer = connect_and_accept(&handle, &mut broker).await;
    assert!(peer.close(1000, "server shutdown"));
    wait_status(&handle, |s| s.state == ConnectionState::Disconnected).await;

    tokio::time::sleep(Duration::from_secs(300)).await;
    assert!(!handle.status().retry_pending);
    assert_eq!(broker.connect_calls(), 1);

    cancel.cancel();
}

#[tokio::test(start_paused = true)]
async fn gives_up_after_max_attempts_until_explicit_connect() {
    let (handle, mut broker, cancel) = start(options());
    let (_errors, mut errors) = handle.subscribe_channel(topic::SYSTEM_ERROR);
    broker.refuse_next(usize::MAX);

    handle.connect(None);
    let status = wait_status(&handle, |s| s.exhausted).await;

    assert_eq!(status.state, ConnectionState::Disconnected);
    assert!(!status.retry_pending);
    assert_eq!(status.reconnect_attempts, 5);
    assert_eq!(broker.connect_calls(), 6);

    let error = next_message(&mut errors).await;
    assert_eq!(error.payload["connectionState"], "disconnected");

    // Terminal: nothing happens on its own.
    tokio::time::sleep(Duration::from_secs(600)).await;
    assert_eq!(broker.connect_calls(), 6);

    broker.refuse_next(0);
    handle.connect(None);
    let _peer = timeout(WAIT, broker.accept()).await.unwrap().unwrap();
    let status = wait_status(&handle, ConnectionStatus::is_connected).await;
    assert!(!status.exhausted);
    assert_eq!(status.reconnect_attempts, 0);

    cancel.cancel();
}

#[tokio::test(start_paused = true)]
async fn buffered_publishes_flush_in_order() {
    let (handle, mut broker, cancel) = start(options());

    for n in 1..=3 {
        handle.publish("/app/vitals", json!({ "seq": n }));
    }
    wait_status(&handle, |s| s.buffered == 3).await;

    let mut peer = connect_and_accept(&handle, &mut broker).await;
    for n in 1..=3 {
        assert_eq!(
            timeout(WAIT, peer.next_frame()).await.unwrap(),
            Some(OutboundFrame::Publish {
                topic: "/app/vitals".to_string(),
                payload: json!({ "seq": n }),
            })
        );
    }

    settle().await;
    assert!(peer.drain_frames().is_empty());
    assert_eq!(handle.status().buffered, 0);

    cancel.cancel();
}

fn seq_publish(n: u64) -> OutboundFrame {
    OutboundFrame::Publish {
        topic: "/app/vitals".to_string(),
        payload: json!({ "seq": n }),
    }
}

#[tokio::test(start_paused = true)]
async fn link_lost_mid_flush_keeps_the_rest_for_the_next_link() {
    let (handle, mut broker, cancel) = start(options());

    for n in 1..=5 {
        handle.publish("/app/vitals", json!({ "seq": n }));
    }
    wait_status(&handle, |s| s.buffered == 5).await;

    let mut peer = connect_and_accept(&handle, &mut broker).await;
    assert_eq!(peer.next_frame().await, Some(seq_publish(1)));
    assert!(peer.close(1006, "network"));

    let status = wait_status(&handle, |s| s.retry_pending).await;
    assert_eq!(status.buffered, 4);

    let mut second = timeout(WAIT, broker.accept()).await.unwrap().unwrap();
    for n in 2..=5 {
        assert_eq!(
            timeout(WAIT, second.next_frame()).await.unwrap(),
            Some(seq_publish(n))
        );
    }
    settle().await;
    assert_eq!(handle.status().buffered, 0);

    cancel.cancel();
}

#[tokio::test(start_paused = true)]
async fn unwritten_publishes_are_resent_after_reconnect() {
    let (handle, mut broker, cancel) = start(options());
    let mut peer = connect_and_accept(&handle, &mut broker).await;

    // Accepted by the link but never read by the broker.
    for n in 1..=3 {
        handle.publish("/app/vitals", json!({ "seq": n }));
    }
    settle().await;
    assert_eq!(handle.status().buffered, 0);

    assert!(peer.abort(1006, "connection reset"));
    let status = wait_status(&handle, |s| s.retry_pending).await;
    assert_eq!(status.buffered, 3);

    handle.publish("/app/vitals", json!({ "seq": 4 }));
    let mut second = timeout(WAIT, broker.accept()).await.unwrap().unwrap();
    for n in 1..=4 {
        assert_eq!(
            timeout(WAIT, second.next_frame()).await.unwrap(),
            Some(seq_publish(n))
        );
    }

    cancel.cancel();
}

#[tokio::test(start_paused = true)]
async fn disconnect_cancels_a_pending_retry() {
    let (handle, mut broker, cancel) = start(options());

    let peer = connect_and_accept(&handle, &mut broker).await;
    assert!(peer.close(1006, "network"));
    wait_status(&handle, |s| s.retry_pending).await;

    handle.disconnect();
    let status = wait_status(&handle, |s| s.manual_disconnect).await;
    assert!(!status.retry_pending);

    tokio::time::sleep(Duration::from_secs(600)).await;
    assert_eq!(broker.connect_calls(), 1);
    assert!(broker.try_accept().is_none());
    assert_eq!(handle.status().state, ConnectionState::Disconnected);

    cancel.cancel();
}

#[tokio::test(start_paused = true)]
async fn publish_while_connected_goes_straight_out() {
    let (handle, mut broker, cancel) = start(options());
    let mut peer = connect_and_accept(&handle, &mut broker).await;

    handle.publish("/app/vitals", json!({ "heartRate": 72 }));
    assert_eq!(
        peer.next_frame().await,
        Some(OutboundFrame::Publish {
            topic: "/app/vitals".to_string(),
            payload: json!({ "heartRate": 72 }),
        })
    );
    assert_eq!(handle.status().buffered, 0);

    cancel.cancel();
}

#[tokio::test(start_paused = true)]
async fn literal_topics_are_registered_once_and_reregistered_on_reconnect() {
    let (handle, mut broker, cancel) = start(options());
    let vitals = "/topic/classroom/c1/vitals";

    let (first, mut first_rx) = handle.subscribe_channel(vitals);
    let (second, mut second_rx) = handle.subscribe_channel(vitals);
    let (_any, mut any_rx) = handle.subscribe_channel(topic::ANY_CLASSROOM_VITALS);
    let (_system, _system_rx) = handle.subscribe_channel(topic::SYSTEM_CONNECTED);

    let mut peer = connect_and_accept(&handle, &mut broker).await;
    settle().await;
    assert_eq!(
        peer.drain_frames(),
        vec![OutboundFrame::Subscribe {
            topic: vitals.to_string()
        }]
    );

    assert!(peer.send_message(vitals, &json!({ "studentId": "s1", "heartRate": 80 })));
    assert_eq!(next_message(&mut first_rx).await.payload["studentId"], "s1");
    assert_eq!(next_message(&mut second_rx).await.payload["studentId"], "s1");
    assert_eq!(next_message(&mut any_rx).await.topic, vitals);

    // The link drops and comes back: the topic is registered again.
    assert!(peer.close(1006, "network"));
    let mut peer = timeout(WAIT, broker.accept()).await.unwrap().unwrap();
    wait_status(&handle, ConnectionStatus::is_connected).await;
    settle().await;
    assert_eq!(
        peer.drain_frames(),
        vec![OutboundFrame::Subscribe {
            topic: vitals.to_string()
        }]
    );

    first.unsubscribe();
    settle().await;
    assert!(peer.drain_frames().is_empty());

    drop(second);
    settle().await;
    assert_eq!(
        peer.drain_frames(),
        vec![OutboundFrame::Unsubscribe {
            topic: vitals.to_string()
        }]
    );

    cancel.cancel();
}

#[tokio::test(start_paused = true)]
async fn malformed_and_system_frames_are_dropped() {
    let (handle, mut broker, cancel) = start(options());
    let (_alerts, mut alerts_rx) = handle.subscribe_channel(topic::GLOBAL_ALERTS_TOPIC);
    let (_system, mut system_rx) = handle.subscribe_channel(topic::SYSTEM_CONNECTED);

    let peer = connect_and_accept(&handle, &mut broker).await;
    assert_eq!(next_message(&mut system_rx).await.topic, topic::SYSTEM_CONNECTED);

    assert!(peer.send_text("{ not json"));
    assert!(peer.send_text(r#"{"destination": "/topic/alerts", "body": "{broken"}"#));
    assert!(peer.send_message(topic::SYSTEM_CONNECTED, &json!({ "forged": true })));
    assert!(peer.send_message(topic::GLOBAL_ALERTS_TOPIC, &json!({ "studentId": "s9" })));

    assert_eq!(next_message(&mut alerts_rx).await.payload["studentId"], "s9");
    settle().await;
    assert!(system_rx.try_recv().is_err());
    assert!(handle.status().is_connected());

    cancel.cancel();
}

#[tokio::test(start_paused = true)]
async fn explicit_reconnect_settles_then_connects_fresh() {
    let (handle, mut broker, cancel) = start(options());
    let mut peer = connect_and_accept(&handle, &mut broker).await;

    handle.reconnect();
    assert!(matches!(
        peer.next_frame().await,
        Some(OutboundFrame::Close { code: 1000, .. })
    ));
    let status = wait_status(&handle, |s| s.retry_pending).await;
    assert_eq!(status.reconnect_attempts, 0);
    assert!(!status.manual_disconnect);

    let started = tokio::time::Instant::now();
    let _fresh = timeout(WAIT, broker.accept()).await.unwrap().unwrap();
    assert!(started.elapsed() >= Duration::from_millis(400));
    wait_status(&handle, ConnectionStatus::is_connected).await;
    assert_eq!(broker.connect_calls(), 2);

    cancel.cancel();
}

#[tokio::test(start_paused = true)]
async fn silent_link_is_declared_dead_and_retried() {
    let (handle, mut broker, cancel) = start(options());
    let (_events, mut events) = handle.subscribe_channel(topic::SYSTEM_DISCONNECTED);

    let mut peer = connect_and_accept(&handle, &mut broker).await;
    let connected_at = tokio::time::Instant::now();

    assert_eq!(
        timeout(WAIT, peer.next_frame()).await.unwrap(),
        Some(OutboundFrame::Ping)
    );

    let event = next_message(&mut events).await;
    assert_eq!(event.payload["code"], 1006);
    assert_eq!(event.payload["reason"], "heartbeat timeout");
    assert!(connected_at.elapsed() > Duration::from_secs(60));

    let _retry = timeout(WAIT, broker.accept()).await.unwrap().unwrap();
    assert_eq!(broker.connect_calls(), 2);

    cancel.cancel();
}

#[tokio::test(start_paused = true)]
async fn pongs_keep_the_link_alive() {
    let (handle, mut broker, cancel) = start(options());
    let mut peer = connect_and_accept(&handle, &mut broker).await;

    for _ in 0..5 {
        assert_eq!(
            timeout(WAIT, peer.next_frame()).await.unwrap(),
            Some(OutboundFrame::Ping)
        );
        assert!(peer.send_pong());
    }

    assert!(handle.status().is_connected());
    assert_eq!(broker.connect_calls(), 1);

    cancel.cancel();
}
