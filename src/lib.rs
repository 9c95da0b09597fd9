//! # zerobot
//!
//! Brokered RPC and publish/subscribe over identity-addressed TCP channels.
//!
//! Services expose named methods through a [`Worker`](service::Worker) or a
//! dynamically sized [`WorkerPool`](service::WorkerPool); clients call them
//! by identity through a [`Broker`](broker::Broker), which also mirrors all
//! traffic and relays topic events.
//!
//! ## Architecture
//!
//! ```text
//! RpcClient ──► Broker frontend ──► Broker backend ──► Worker / WorkerPool / IoAdapter
//!     ▲              │                   │                      │
//!     └──── response ┴───── mirror ──────┴──────────────────────┘
//!                     (TrafficTap)
//!
//! EventPublisher ──► event intake ──► event publish ──► EventSubscriber
//! ```
//!
//! | Module        | Role                                                    |
//! |---------------|---------------------------------------------------------|
//! | [`transport`] | framed TCP channels: bind/connect, addressable/broadcast |
//! | [`protocol`]  | request/response payloads and call correlation          |
//! | [`client`]    | the caller side                                         |
//! | [`service`]   | method tables, workers and pools                        |
//! | [`broker`]    | routing, mirroring and event relay                      |
//! | [`events`]    | publisher and subscriber endpoints                      |
//! | [`ioadapter`] | bridging a byte-stream component onto the broker        |
//! | [`status`]    | HTTP health and counters                                |
//! | [`config`]    | environment configuration                               |
//! | [`context`]   | shared cancellation, task tracking, callback executor   |
//!
//! Every component is a single reactor task spawned on a shared
//! [`Context`]; [`Context::shutdown`] stops and awaits them all.

pub mod broker;
pub mod client;
pub mod config;
pub mod context;
pub mod error;
pub mod events;
pub mod ioadapter;
pub mod protocol;
pub mod service;
pub mod status;
pub mod transport;

pub use context::{Context, ContextSettings};
pub use error::{Result, ZerobotError};
