//! Broker relaying between two endpoints while a traffic tap watches the
//! mirror.

#![allow(clippy::panic)]

mod common;

use std::time::Duration;

use serde_json::json;
use zerobot::Context;
use zerobot::broker::{TrafficRecord, TrafficTap};
use zerobot::service::Worker;
use zerobot::transport::Identity;

use common::{PATIENCE, backend, broker, calculator, client, wait_for_service};

/// Collects whatever the tap sees within `window`.
async fn drain(tap: &mut TrafficTap, window: Duration) -> Vec<TrafficRecord> {
    let mut seen = Vec::new();
    let deadline = tokio::time::Instant::now() + window;
    while let Ok(Some(record)) = tokio::time::timeout_at(deadline, tap.recv()).await {
        seen.push(record);
    }
    seen
}

#[tokio::test]
async fn mirror_sees_each_envelope_exactly_once() {
    let ctx = Context::new();
    let broker = broker(&ctx).await;
    let mirror = broker.addresses().mirror.to_string();
    let Ok(mut tap) = TrafficTap::connect(&ctx, Identity::new("tap"), &mirror, &[]).await else {
        panic!("tap");
    };
    let Ok(_b) = Worker::start(&ctx, "B", &backend(&broker), calculator()).await else {
        panic!("worker B");
    };
    let a = client(&ctx, &broker, "A", "B").await;
    wait_for_service(&a).await;

    // Warm up until the tap's filter has reached the broker.
    let deadline = tokio::time::Instant::now() + PATIENCE;
    loop {
        let _ = a.call("help").invoke().await;
        if !drain(&mut tap, Duration::from_millis(100)).await.is_empty() {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "tap never saw traffic");
    }
    let _ = drain(&mut tap, Duration::from_millis(200)).await;

    let Ok(call) = a.call("ping").arg(42) else {
        panic!("arg");
    };
    let Ok(value) = call.uid("scenario-d").invoke().await else {
        panic!("ping");
    };
    assert_eq!(value, json!(84));

    let seen = drain(&mut tap, Duration::from_millis(300)).await;
    let mentions = |from: &str, to: &str| {
        seen.iter()
            .filter(|r| r.from == from && r.to == to)
            .filter(|r| String::from_utf8_lossy(&r.payload).contains("scenario-d"))
            .count()
    };
    assert_eq!(mentions("A", "B"), 1, "{seen:?}");
    assert_eq!(mentions("B", "A"), 1, "{seen:?}");

    let stats = broker.stats();
    assert!(stats.routed_to_workers >= 1);
    assert!(stats.routed_to_clients >= 1);
    assert_eq!(stats.malformed, 0);

    tap.close();
    broker.shutdown().await;
    ctx.shutdown().await;
}

#[tokio::test]
async fn tap_filters_by_sender_prefix() {
    let ctx = Context::new();
    let broker = broker(&ctx).await;
    let mirror = broker.addresses().mirror.to_string();
    let Ok(mut tap) = TrafficTap::connect(&ctx, Identity::new("tap"), &mirror, &["svc"]).await else {
        panic!("tap");
    };
    let Ok(_worker) = Worker::start(&ctx, "svc-calc", &backend(&broker), calculator()).await else {
        panic!("worker");
    };
    let console = client(&ctx, &broker, "console", "svc-calc").await;
    wait_for_service(&console).await;

    let deadline = tokio::time::Instant::now() + PATIENCE;
    let seen = loop {
        let _ = console.call("help").invoke().await;
        let seen = drain(&mut tap, Duration::from_millis(100)).await;
        if !seen.is_empty() {
            break seen;
        }
        assert!(tokio::time::Instant::now() < deadline, "tap never saw traffic");
    };
    assert!(seen.iter().all(|r| r.from.starts_with("svc")), "{seen:?}");

    broker.shutdown().await;
    ctx.shutdown().await;
}
