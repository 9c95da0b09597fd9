//! Worker pool behind a broker: saturation growth, idle shrink and remote
//! stop.

#![allow(clippy::panic)]

mod common;

use std::time::Duration;

use serde_json::json;
use zerobot::Context;
use zerobot::service::{PoolConfig, PoolSize, WorkerPool};

use common::{PATIENCE, backend, broker, calculator, client, eventually, wait_for_service};

fn dynamic(cooldown: Duration) -> PoolConfig {
    PoolConfig {
        init_workers: 5,
        min_workers: Some(5),
        max_workers: 50,
        dynamic_workers: true,
        cooldown,
        ..PoolConfig::default()
    }
}

#[tokio::test]
async fn pool_grows_under_load_then_shrinks_back() {
    let ctx = Context::new();
    let broker = broker(&ctx).await;
    let Ok(pool) = WorkerPool::start(
        &ctx,
        "calc",
        &backend(&broker),
        calculator(),
        dynamic(Duration::from_millis(300)),
    )
    .await
    else {
        panic!("pool");
    };
    eventually("initial workers ready", || pool.size() == PoolSize { members: 5, free: 5 }).await;
    let console = client(&ctx, &broker, "console", "calc").await;
    wait_for_service(&console).await;

    let mut pending = Vec::new();
    for _ in 0..25 {
        let Ok(call) = console.call("sleep").arg(400) else {
            panic!("arg");
        };
        let Ok(handle) = call.timeout(PATIENCE * 2).send().await else {
            panic!("send");
        };
        pending.push(handle);
    }
    eventually("pool growth", || pool.size().members >= 20).await;
    assert!(pool.size().members <= 50);

    for handle in pending {
        let Ok(value) = handle.result().await else {
            panic!("slow call failed");
        };
        assert_eq!(value, json!(400));
    }

    // Idle ticks halve the pool once per cooldown until it is back at min.
    eventually("shrink to min", || pool.size().members == 5).await;
    tokio::time::sleep(Duration::from_millis(700)).await;
    assert_eq!(pool.size().members, 5);

    let Ok(call) = console.call("ping").arg(21) else {
        panic!("arg");
    };
    assert!(matches!(call.invoke().await, Ok(v) if v == json!(63)));

    pool.shutdown().await;
    broker.shutdown().await;
    ctx.shutdown().await;
}

#[tokio::test]
async fn static_pool_keeps_its_size_and_queues() {
    let ctx = Context::new();
    let broker = broker(&ctx).await;
    let config = PoolConfig {
        init_workers: 2,
        ..PoolConfig::default()
    };
    let Ok(pool) = WorkerPool::start(&ctx, "calc", &backend(&broker), calculator(), config).await else {
        panic!("pool");
    };
    let console = client(&ctx, &broker, "console", "calc").await;
    wait_for_service(&console).await;

    let mut pending = Vec::new();
    for i in 0..6 {
        let Ok(call) = console.call("sleep").arg(50 + i) else {
            panic!("arg");
        };
        let Ok(handle) = call.timeout(PATIENCE).send().await else {
            panic!("send");
        };
        pending.push((i, handle));
    }
    for (i, handle) in pending {
        let Ok(value) = handle.result().await else {
            panic!("call {i} failed");
        };
        assert_eq!(value, json!(50 + i));
        assert_eq!(pool.size().members, 2);
    }

    pool.shutdown().await;
    broker.shutdown().await;
    ctx.shutdown().await;
}

#[tokio::test]
async fn remote_stop_stops_the_whole_pool() {
    for round in 0..10 {
        let ctx = Context::new();
        let broker = broker(&ctx).await;
        let config = PoolConfig {
            init_workers: 3,
            ..PoolConfig::default()
        };
        let Ok(pool) = WorkerPool::start(&ctx, "calc", &backend(&broker), calculator(), config).await else {
            panic!("pool");
        };
        let console = client(&ctx, &broker, "console", "calc").await;
        wait_for_service(&console).await;

        let acknowledged = console.call("stop").timeout(Duration::from_secs(2)).invoke().await;
        let Ok(_) = acknowledged else {
            panic!("stop was not acknowledged in round {round}: {acknowledged:?}");
        };
        let Ok(()) = tokio::time::timeout(PATIENCE, pool.stopped()).await else {
            panic!("pool kept running");
        };
        let Ok(()) = tokio::time::timeout(PATIENCE, pool.shutdown()).await else {
            panic!("pool teardown hung");
        };

        broker.shutdown().await;
        ctx.shutdown().await;
    }
}
