//! Message broker.
//!
//! The [`Broker`] binds five channels and relays between them:
//!
//! ```text
//!  clients ──► frontend ─┐           ┌─ backend ◄── workers / pools
//!                        └─ reactor ─┘
//!                             │  └──────► mirror   (every envelope)
//!  publishers ─► event intake ┘ ─────────► event publish (by topic)
//! ```
//!
//! Envelopes are forwarded between frontend and backend as
//! `[to, from, payload]`; the payload is never inspected. Delivery is
//! best-effort: an unknown recipient is dropped and logged by the receiving
//! channel, and the sender is never told.

pub mod routing;
pub mod tap;

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::BrokerConfig;
use crate::context::Context;
use crate::error::{Result, ZerobotError};
use crate::transport::{
    Address, Channel, ChannelReceiver, ChannelSender, ChannelStats, ChannelStatsSnapshot, Frames,
    Identity, Mode, Role,
};

pub use routing::{EventEnvelope, Route, parse_envelope, parse_event};
pub use tap::{TrafficRecord, TrafficTap};

/// Broker-level counters.
#[derive(Debug, Default)]
struct Counters {
    to_workers: AtomicU64,
    to_clients: AtomicU64,
    events: AtomicU64,
    malformed: AtomicU64,
}

/// Serializable snapshot of the broker counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BrokerStats {
    /// Envelopes forwarded from clients to workers.
    pub routed_to_workers: u64,
    /// Envelopes forwarded from workers to clients.
    pub routed_to_clients: u64,
    /// Events republished to subscribers.
    pub events_relayed: u64,
    /// Envelopes dropped as malformed.
    pub malformed: u64,
    /// Client-facing channel counters.
    pub frontend: ChannelStatsSnapshot,
    /// Worker-facing channel counters.
    pub backend: ChannelStatsSnapshot,
    /// Mirror channel counters.
    pub mirror: ChannelStatsSnapshot,
    /// Event intake counters, if enabled.
    pub event_intake: Option<ChannelStatsSnapshot>,
    /// Event publish counters, if enabled.
    pub event_publish: Option<ChannelStatsSnapshot>,
}

/// Liveness of a broker, as reported by the status endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BrokerHealth {
    /// Broker identity.
    pub identity: String,
    /// Whether the relay reactor is still running.
    pub running: bool,
    /// When the broker bound its channels.
    pub started_at: DateTime<Utc>,
    /// Seconds since `started_at`.
    pub uptime_secs: u64,
    /// Crate version.
    pub version: &'static str,
}

/// Read-only view of a running broker's counters. Cheap to clone.
#[derive(Debug, Clone)]
pub struct BrokerMonitor {
    identity: String,
    started_at: DateTime<Utc>,
    token: CancellationToken,
    counters: Arc<Counters>,
    frontend: Arc<ChannelStats>,
    backend: Arc<ChannelStats>,
    mirror: Arc<ChannelStats>,
    event_intake: Option<Arc<ChannelStats>>,
    event_publish: Option<Arc<ChannelStats>>,
}

impl BrokerMonitor {
    /// Current counters.
    #[must_use]
    pub fn snapshot(&self) -> BrokerStats {
        BrokerStats {
            routed_to_workers: self.counters.to_workers.load(Ordering::Relaxed),
            routed_to_clients: self.counters.to_clients.load(Ordering::Relaxed),
            events_relayed: self.counters.events.load(Ordering::Relaxed),
            malformed: self.counters.malformed.load(Ordering::Relaxed),
            frontend: self.frontend.snapshot(),
            backend: self.backend.snapshot(),
            mirror: self.mirror.snapshot(),
            event_intake: self.event_intake.as_ref().map(|s| s.snapshot()),
            event_publish: self.event_publish.as_ref().map(|s| s.snapshot()),
        }
    }

    /// Whether the reactor runs, and for how long.
    #[must_use]
    pub fn health(&self) -> BrokerHealth {
        let uptime = Utc::now().signed_duration_since(self.started_at);
        BrokerHealth {
            identity: self.identity.clone(),
            running: !self.token.is_cancelled(),
            started_at: self.started_at,
            uptime_secs: u64::try_from(uptime.num_seconds()).unwrap_or(0),
            version: env!("CARGO_PKG_VERSION"),
        }
    }
}

/// Dialable addresses of a bound broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerAddresses {
    /// Where clients connect.
    pub frontend: Address,
    /// Where workers and pools connect.
    pub backend: Address,
    /// Where traffic observers subscribe.
    pub mirror: Address,
    /// Where event publishers connect.
    pub event_intake: Option<Address>,
    /// Where event subscribers subscribe.
    pub event_publish: Option<Address>,
}

/// Handle of a running broker.
#[derive(Debug)]
pub struct Broker {
    identity: String,
    addresses: BrokerAddresses,
    monitor: BrokerMonitor,
    token: CancellationToken,
    task: JoinHandle<()>,
}

impl Broker {
    /// Binds every configured channel and starts relaying.
    ///
    /// # Errors
    ///
    /// Returns [`ZerobotError::InvalidAddress`] or [`ZerobotError::Io`] if a
    /// channel cannot bind.
    pub async fn bind(ctx: &Context, config: BrokerConfig) -> Result<Self> {
        let name = |part: &str| Identity::new(format!("{}-{part}", config.identity));
        let frontend = Channel::open(ctx, name("frontend"), &config.frontend_addr, Mode::Bind, Role::Addressable).await?;
        let backend = Channel::open(ctx, name("backend"), &config.backend_addr, Mode::Bind, Role::Addressable).await?;
        let mirror = Channel::open(ctx, name("mirror"), &config.mirror_addr, Mode::Bind, Role::Broadcast).await?;
        let event_intake = match &config.event_intake_addr {
            Some(addr) => Some(Channel::open(ctx, name("events-in"), addr, Mode::Bind, Role::Addressable).await?),
            None => None,
        };
        let event_publish = match &config.event_publish_addr {
            Some(addr) => Some(Channel::open(ctx, name("events-out"), addr, Mode::Bind, Role::Broadcast).await?),
            None => None,
        };

        let missing = || ZerobotError::Closed;
        let addresses = BrokerAddresses {
            frontend: frontend.endpoint().ok_or_else(missing)?,
            backend: backend.endpoint().ok_or_else(missing)?,
            mirror: mirror.endpoint().ok_or_else(missing)?,
            event_intake: event_intake.as_ref().and_then(Channel::endpoint),
            event_publish: event_publish.as_ref().and_then(Channel::endpoint),
        };
        let counters = Arc::new(Counters::default());
        let token = ctx.child_token();
        let monitor = BrokerMonitor {
            identity: config.identity.clone(),
            started_at: Utc::now(),
            token: token.clone(),
            counters: Arc::clone(&counters),
            frontend: frontend.stats(),
            backend: backend.stats(),
            mirror: mirror.stats(),
            event_intake: event_intake.as_ref().map(Channel::stats),
            event_publish: event_publish.as_ref().map(Channel::stats),
        };

        let (frontend, frontend_rx) = frontend.split();
        let (backend, backend_rx) = backend.split();
        let (event_intake, intake_rx) = match event_intake {
            Some(channel) => {
                let (tx, rx) = channel.split();
                (Some(tx), Some(rx))
            }
            None => (None, None),
        };
        let reactor = Reactor {
            identity: config.identity.clone(),
            legacy_suffix: config.legacy_suffix_routing,
            frontend,
            backend,
            mirror: mirror.sender(),
            event_intake,
            event_publish: event_publish.as_ref().map(Channel::sender),
            counters,
            token: token.clone(),
        };
        let task = ctx.spawn(reactor.run(frontend_rx, backend_rx, intake_rx));

        tracing::info!(
            broker = %config.identity,
            frontend = %addresses.frontend,
            backend = %addresses.backend,
            mirror = %addresses.mirror,
            event_intake = ?addresses.event_intake.as_ref().map(ToString::to_string),
            event_publish = ?addresses.event_publish.as_ref().map(ToString::to_string),
            legacy_suffix_routing = config.legacy_suffix_routing,
            "broker started"
        );

        Ok(Self {
            identity: config.identity,
            addresses,
            monitor,
            token,
            task,
        })
    }

    /// Dialable addresses of the bound channels.
    #[must_use]
    pub fn addresses(&self) -> &BrokerAddresses {
        &self.addresses
    }

    /// Counter view, for status reporting.
    #[must_use]
    pub fn monitor(&self) -> BrokerMonitor {
        self.monitor.clone()
    }

    /// Current counters.
    #[must_use]
    pub fn stats(&self) -> BrokerStats {
        self.monitor.snapshot()
    }

    /// Asks the broker to stop. Returns immediately.
    pub fn stop(&self) {
        self.token.cancel();
    }

    /// Stops the broker and waits for its reactor.
    pub async fn shutdown(self) {
        self.token.cancel();
        if let Err(err) = self.task.await {
            tracing::warn!(broker = %self.identity, error = %err, "broker reactor failed");
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Side {
    Clients,
    Workers,
}

struct Reactor {
    identity: String,
    legacy_suffix: bool,
    frontend: ChannelSender,
    backend: ChannelSender,
    mirror: ChannelSender,
    event_intake: Option<ChannelSender>,
    event_publish: Option<ChannelSender>,
    counters: Arc<Counters>,
    token: CancellationToken,
}

impl Reactor {
    async fn run(
        self,
        mut frontend_rx: ChannelReceiver,
        mut backend_rx: ChannelReceiver,
        mut intake_rx: Option<ChannelReceiver>,
    ) {
        loop {
            tokio::select! {
                () = self.token.cancelled() => break,
                inbound = frontend_rx.recv() => match inbound {
                    Some(frames) => self.forward(Side::Clients, frames).await,
                    None => break,
                },
                inbound = backend_rx.recv() => match inbound {
                    Some(frames) => self.forward(Side::Workers, frames).await,
                    None => break,
                },
                inbound = recv_optional(&mut intake_rx) => match inbound {
                    Some(frames) => self.relay_event(frames).await,
                    None => {
                        tracing::warn!(broker = %self.identity, "event intake closed");
                        intake_rx = None;
                    }
                },
            }
        }

        self.token.cancel();
        self.frontend.close();
        self.backend.close();
        self.mirror.close();
        for channel in [&self.event_intake, &self.event_publish].into_iter().flatten() {
            channel.close();
        }
        tracing::info!(broker = %self.identity, "broker stopped");
    }

    async fn forward(&self, side: Side, frames: Frames) {
        let route = match parse_envelope(frames, self.legacy_suffix) {
            Ok(route) => route,
            Err(err) => {
                self.counters.malformed.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(broker = %self.identity, ?side, error = %err, "dropping malformed envelope");
                return;
            }
        };
        tracing::debug!(
            broker = %self.identity,
            ?side,
            from = %String::from_utf8_lossy(&route.from),
            to = %String::from_utf8_lossy(&route.to),
            bytes = route.payload.len(),
            "routing envelope"
        );
        let _ = self.mirror.send(route.mirror_frames()).await;
        let (target, counter) = match side {
            Side::Clients => (&self.backend, &self.counters.to_workers),
            Side::Workers => (&self.frontend, &self.counters.to_clients),
        };
        if target.send(route.forward_frames()).await.is_ok() {
            counter.fetch_add(1, Ordering::Relaxed);
        }
    }

    async fn relay_event(&self, frames: Frames) {
        let event = match parse_event(frames) {
            Ok(event) => event,
            Err(err) => {
                self.counters.malformed.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(broker = %self.identity, error = %err, "dropping malformed event");
                return;
            }
        };
        let _ = self.mirror.send(event.mirror_frames()).await;
        if let Some(publish) = &self.event_publish
            && publish.send(event.publish_frames()).await.is_ok()
        {
            self.counters.events.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// Receives from an optional channel; pends forever when there is none.
async fn recv_optional(rx: &mut Option<ChannelReceiver>) -> Option<Frames> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}
