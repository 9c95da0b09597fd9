//! Events relayed from a publisher to topic subscribers by the broker.

#![allow(clippy::panic)]

mod common;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use zerobot::Context;
use zerobot::events::{Event, EventPublisher, EventSubscriber};

use common::{PATIENCE, broker};

#[tokio::test]
async fn subscribers_get_exact_topics_only() {
    let ctx = Context::new();
    let broker = broker(&ctx).await;
    let (Some(intake), Some(publish)) = (
        broker.addresses().event_intake.clone(),
        broker.addresses().event_publish.clone(),
    ) else {
        panic!("ephemeral broker has event endpoints");
    };

    let Ok(subscriber) = EventSubscriber::connect(&ctx, "dashboard", &publish.to_string()).await else {
        panic!("subscriber");
    };
    let (tx, mut rx) = mpsc::unbounded_channel::<Event>();
    let Ok(()) = subscriber
        .subscribe("temp", Arc::new(move |event: Event| {
            let _ = tx.send(event);
        }))
        .await
    else {
        panic!("subscribe");
    };
    assert_eq!(subscriber.topics(), vec!["temp".to_string()]);

    let Ok(publisher) = EventPublisher::connect(&ctx, "sensor", &intake.to_string()).await else {
        panic!("publisher");
    };

    // Publish until the subscription has reached the broker.
    let deadline = tokio::time::Instant::now() + PATIENCE;
    let first = loop {
        let Ok(()) = publisher.publish("temperature", &99).await else {
            panic!("publish");
        };
        let Ok(()) = publisher.publish("temp", &21.5).await else {
            panic!("publish");
        };
        if let Ok(Some(event)) = tokio::time::timeout(Duration::from_millis(100), rx.recv()).await {
            break event;
        }
        assert!(tokio::time::Instant::now() < deadline, "no event delivered");
    };
    assert_eq!(first.topic, "temp");
    assert_eq!(first.sender, "sensor");
    let Ok(value) = first.payload_as::<f64>() else {
        panic!("payload");
    };
    assert!((value - 21.5).abs() < f64::EPSILON);

    // "temperature" passes the prefix filter on the wire but never reaches
    // the "temp" callback.
    while let Ok(Some(event)) = tokio::time::timeout(Duration::from_millis(200), rx.recv()).await {
        assert_eq!(event.topic, "temp");
    }
    assert!(broker.stats().events_relayed >= 2);

    let Ok(()) = subscriber.unsubscribe("temp").await else {
        panic!("unsubscribe");
    };
    assert!(subscriber.topics().is_empty());
    tokio::time::sleep(Duration::from_millis(100)).await;
    let Ok(()) = publisher.publish("temp", &0).await else {
        panic!("publish");
    };
    let late = tokio::time::timeout(Duration::from_millis(300), rx.recv()).await;
    assert!(!matches!(late, Ok(Some(_))), "event delivered after unsubscribe");

    subscriber.close();
    publisher.close();
    broker.shutdown().await;
    ctx.shutdown().await;
}
