//! Shared fixtures: an ephemeral broker, a calculator service and polling
//! helpers.

#![allow(dead_code, clippy::panic)]

use std::time::Duration;

use serde_json::json;
use zerobot::Context;
use zerobot::broker::Broker;
use zerobot::client::RpcClient;
use zerobot::config::BrokerConfig;
use zerobot::service::MethodTable;

/// Generous bound for anything that should happen "soon".
pub const PATIENCE: Duration = Duration::from_secs(10);

pub async fn broker(ctx: &Context) -> Broker {
    let Ok(broker) = Broker::bind(ctx, BrokerConfig::ephemeral()).await else {
        panic!("broker bind");
    };
    broker
}

pub fn frontend(broker: &Broker) -> String {
    broker.addresses().frontend.to_string()
}

pub fn backend(broker: &Broker) -> String {
    broker.addresses().backend.to_string()
}

pub fn calculator() -> MethodTable {
    let Ok(table) = MethodTable::builder("calc")
        .method("ping", Some("Adds 42 to its argument."), |args| {
            let n: i64 = args.get(0, "n")?;
            Ok(json!(n + 42))
        })
        .method("echo", None, |args| Ok(args.get(0, "value")?))
        .method("sleep", Some("Sleeps for `ms` milliseconds."), |args| {
            let ms: u64 = args.get(0, "ms")?;
            std::thread::sleep(Duration::from_millis(ms));
            Ok(json!(ms))
        })
        .build()
    else {
        panic!("calculator table");
    };
    table
}

pub async fn client(ctx: &Context, broker: &Broker, identity: &str, remote: &str) -> RpcClient {
    let Ok(client) = RpcClient::connect(ctx, identity, &frontend(broker), remote).await else {
        panic!("client connect");
    };
    client
}

/// Calls `help` until the remote answers, so the service is known to be
/// attached to the broker.
pub async fn wait_for_service(client: &RpcClient) {
    let deadline = tokio::time::Instant::now() + PATIENCE;
    loop {
        let answered = client
            .call("help")
            .timeout(Duration::from_millis(200))
            .invoke()
            .await
            .is_ok();
        if answered {
            return;
        }
        if tokio::time::Instant::now() > deadline {
            panic!("{} never answered", client.remote());
        }
    }
}

/// Polls `condition` every 20 ms until it holds.
pub async fn eventually(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + PATIENCE;
    while !condition() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
