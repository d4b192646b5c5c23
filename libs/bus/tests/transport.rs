//! Integration tests for point transport over the memory bus.

use std::time::Duration;

use bytes::Bytes;
use nodemesh_bus::{
    send_edge_point, send_node_point, send_points, subject, subscribe_edge_points,
    subscribe_points, Bus, MemoryBus, Message, TransportError, ACK_TIMEOUT,
};
use nodemesh_data::{pb, point_type, Point, Points};
use tokio::sync::mpsc;

/// Answers every request on `pattern` with `reply`.
async fn spawn_responder(bus: &MemoryBus, pattern: &str, reply: &'static [u8]) {
    let mut sub = bus.subscribe(pattern).await.unwrap();
    let server = bus.clone();
    tokio::spawn(async move {
        while let Some(msg) = sub.next().await {
            if let Some(resp) = msg.response(Bytes::from_static(reply)) {
                let _ = server.publish(resp).await;
            }
        }
    });
}

#[tokio::test]
async fn test_ack_send_accepted() {
    let bus = MemoryBus::new();
    spawn_responder(&bus, "node.*.points", b"").await;

    send_node_point(&bus, "n1", Point::new(point_type::VALUE, 3.14), true)
        .await
        .unwrap();
}

#[tokio::test]
async fn test_ack_send_rejected_with_message() {
    let bus = MemoryBus::new();
    spawn_responder(&bus, "node.*.points", b"node not found").await;

    let err = send_node_point(&bus, "n1", Point::new(point_type::VALUE, 3.14), true)
        .await
        .unwrap_err();
    match err {
        TransportError::Rejected(msg) => assert_eq!(msg, "node not found"),
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn test_ack_send_on_closed_bus_fails_fast() {
    let bus = MemoryBus::new();
    bus.close();

    let started = tokio::time::Instant::now();
    let err = send_node_point(&bus, "n1", Point::new(point_type::VALUE, 3.14), true)
        .await
        .unwrap_err();

    assert!(matches!(err, TransportError::Closed));
    assert!(started.elapsed() <= ACK_TIMEOUT);
}

#[tokio::test(start_paused = true)]
async fn test_ack_send_times_out_when_store_is_silent() {
    let bus = MemoryBus::new();
    let _silent = bus.subscribe("node.n1.points").await.unwrap();

    let started = tokio::time::Instant::now();
    let err = send_node_point(&bus, "n1", Point::new(point_type::VALUE, 3.14), true)
        .await
        .unwrap_err();

    assert!(matches!(err, TransportError::Timeout { .. }));
    assert!(err.is_transient());
    assert!(started.elapsed() >= ACK_TIMEOUT);
    assert!(started.elapsed() < ACK_TIMEOUT + Duration::from_millis(100));
}

#[tokio::test]
async fn test_send_stamps_zero_times() {
    let bus = MemoryBus::new();
    let mut sub = bus.subscribe("node.n1.points").await.unwrap();

    send_points(
        &bus,
        &subject::node_points("n1"),
        Points::from(vec![Point::new(point_type::VALUE, 1.0)]),
        false,
    )
    .await
    .unwrap();

    let msg = sub.next().await.unwrap();
    let points = pb::decode_points(&msg.payload).unwrap();
    assert!(!points.0[0].is_zero_time());
}

#[tokio::test]
async fn test_edge_send_without_parent_uses_none() {
    let bus = MemoryBus::new();
    let mut sub = bus.subscribe("node.n1.none.points").await.unwrap();

    send_edge_point(&bus, "n1", "", Point::new(point_type::TOMBSTONE, 1.0), false)
        .await
        .unwrap();

    assert_eq!(sub.next().await.unwrap().subject, "node.n1.none.points");
}

#[tokio::test]
async fn test_subscribe_points_drops_malformed_batches() {
    let bus = MemoryBus::new();
    let (tx, mut rx) = mpsc::channel(8);
    let handle = subscribe_points(&bus, "n1", move |points| {
        let _ = tx.try_send(points);
    })
    .await
    .unwrap();
    assert_eq!(handle.subject(), "node.n1.points");

    bus.publish(Message::new("node.n1.points", Bytes::from_static(&[0xff, 0xff])))
        .await
        .unwrap();
    send_node_point(&bus, "n1", Point::text(point_type::DESCRIPTION, "pump"), false)
        .await
        .unwrap();

    let points = rx.recv().await.unwrap();
    assert_eq!(points.text(point_type::DESCRIPTION, ""), Some("pump"));
}

#[tokio::test]
async fn test_subscription_stop_is_idempotent() {
    let bus = MemoryBus::new();
    let handle = subscribe_edge_points(&bus, "n1", "root", |_| {}).await.unwrap();
    assert_eq!(handle.subject(), "node.n1.root.points");

    handle.stop();
    handle.stop();
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(bus.subscriber_count("node.n1.root.points"), 0);
}
