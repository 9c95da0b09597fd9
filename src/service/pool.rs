//! Worker pool executor.
//!
//! A [`WorkerPool`] joins the broker's worker side under one identity and
//! spreads the requests it receives over private [`Worker`]s:
//!
//! ```text
//!  broker ──► frontend (connect) ─► pool reactor ─► backend (bind) ──► workers
//! ```
//!
//! The reactor owns the member table and the free-list. A request goes to a
//! free worker with the worker id prepended; the reply comes back through the
//! backend with that id, which returns the worker to the free-list. When no
//! worker is free the reactor takes at most one request into its backlog and
//! stops reading the frontend until a worker frees up; in dynamic mode it
//! also grows the pool. Shrinking happens only here, on the reactor, so a
//! worker that has just been handed a request can never be removed.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use bytes::Bytes;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::config::{Lookup, env_lookup, parse_var, parse_var_bool};
use crate::context::Context;
use crate::error::{Result, ZerobotError};
use crate::transport::{Channel, ChannelReceiver, ChannelSender, Frames, Identity, Mode, Role};

use super::registry::MethodTable;
use super::sizing::PoolSizer;
use super::worker::{READY, STOP_REQUESTED, Worker};

/// Default number of workers started with the pool.
pub const DEFAULT_INIT_WORKERS: usize = 5;

/// Default upper bound on pool members.
pub const DEFAULT_MAX_WORKERS: usize = 50;

/// Default shrink cooldown.
pub const DEFAULT_COOLDOWN: Duration = Duration::from_secs(10);

/// Default private backend address: loopback, ephemeral port.
pub const DEFAULT_BACKEND_ADDR: &str = "tcp://127.0.0.1:0";

/// Sizing and wiring of a [`WorkerPool`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    /// Workers started with the pool.
    pub init_workers: usize,
    /// Lower bound when shrinking; `None` means `init_workers`.
    pub min_workers: Option<usize>,
    /// Upper bound when growing.
    pub max_workers: usize,
    /// Grow when saturated and shrink when idle.
    pub dynamic_workers: bool,
    /// Minimum time between a grow or shrink and the next shrink.
    pub cooldown: Duration,
    /// Bind address of the private worker channel.
    pub backend_address: String,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            init_workers: DEFAULT_INIT_WORKERS,
            min_workers: None,
            max_workers: DEFAULT_MAX_WORKERS,
            dynamic_workers: false,
            cooldown: DEFAULT_COOLDOWN,
            backend_address: DEFAULT_BACKEND_ADDR.to_string(),
        }
    }
}

impl PoolConfig {
    /// Effective lower bound.
    #[must_use]
    pub fn min(&self) -> usize {
        self.min_workers.unwrap_or(self.init_workers)
    }

    /// Checks `1 <= max` and `min <= init <= max`.
    ///
    /// # Errors
    ///
    /// Returns [`ZerobotError::InvalidConfig`] naming the violated bound.
    pub fn validate(&self) -> Result<()> {
        if self.max_workers == 0 {
            return Err(ZerobotError::InvalidConfig(
                "max_workers must be at least 1".to_string(),
            ));
        }
        if self.min() > self.init_workers {
            return Err(ZerobotError::InvalidConfig(format!(
                "min_workers ({}) exceeds init_workers ({})",
                self.min(),
                self.init_workers
            )));
        }
        if self.init_workers > self.max_workers {
            return Err(ZerobotError::InvalidConfig(format!(
                "init_workers ({}) exceeds max_workers ({})",
                self.init_workers, self.max_workers
            )));
        }
        Ok(())
    }

    /// Reads `ZEROBOT_INIT_WORKERS`, `ZEROBOT_MIN_WORKERS`,
    /// `ZEROBOT_MAX_WORKERS`, `ZEROBOT_DYNAMIC_WORKERS` and
    /// `ZEROBOT_POOL_COOLDOWN_MS` from the process environment (and `.env`).
    ///
    /// # Errors
    ///
    /// Returns [`ZerobotError::InvalidConfig`] if the bounds are inconsistent.
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(&env_lookup)
    }

    /// Like [`PoolConfig::from_env`], reading variables through `lookup`.
    ///
    /// # Errors
    ///
    /// Returns [`ZerobotError::InvalidConfig`] if the bounds are inconsistent.
    pub fn from_lookup(lookup: Lookup<'_>) -> Result<Self> {
        let init_workers = parse_var(lookup, "ZEROBOT_INIT_WORKERS", DEFAULT_INIT_WORKERS);
        let config = Self {
            init_workers,
            min_workers: lookup("ZEROBOT_MIN_WORKERS").and_then(|v| v.trim().parse().ok()),
            max_workers: parse_var(lookup, "ZEROBOT_MAX_WORKERS", DEFAULT_MAX_WORKERS),
            dynamic_workers: parse_var_bool(lookup, "ZEROBOT_DYNAMIC_WORKERS", false),
            cooldown: Duration::from_millis(parse_var(
                lookup,
                "ZEROBOT_POOL_COOLDOWN_MS",
                10_000,
            )),
            backend_address: DEFAULT_BACKEND_ADDR.to_string(),
        };
        config.validate()?;
        Ok(config)
    }
}

/// Member and free-list sizes of a pool at one instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolSize {
    /// Live workers.
    pub members: usize,
    /// Workers ready and idle.
    pub free: usize,
}

/// Mirror of the reactor-owned sizes, for observers.
#[derive(Debug, Default)]
struct SizeGauge {
    members: AtomicUsize,
    free: AtomicUsize,
}

impl SizeGauge {
    fn set(&self, members: usize, free: usize) {
        self.members.store(members, Ordering::Relaxed);
        self.free.store(free, Ordering::Relaxed);
    }

    fn get(&self) -> PoolSize {
        PoolSize {
            members: self.members.load(Ordering::Relaxed),
            free: self.free.load(Ordering::Relaxed),
        }
    }
}

/// Handle of a running worker pool.
#[derive(Debug)]
pub struct WorkerPool {
    identity: Identity,
    token: CancellationToken,
    gauge: Arc<SizeGauge>,
    task: JoinHandle<()>,
}

impl WorkerPool {
    /// Starts a pool serving `table` as `identity`, connected to the
    /// broker's worker side at `address`.
    ///
    /// # Errors
    ///
    /// Returns [`ZerobotError::InvalidConfig`] for inconsistent bounds,
    /// [`ZerobotError::InvalidAddress`] for a bad address and
    /// [`ZerobotError::Io`] if the backend cannot bind.
    pub async fn start(
        ctx: &Context,
        identity: impl Into<Identity>,
        address: &str,
        table: MethodTable,
        config: PoolConfig,
    ) -> Result<Self> {
        config.validate()?;
        let identity = identity.into();

        let backend = Channel::open(
            ctx,
            Identity::new(format!("{identity}-backend")),
            &config.backend_address,
            Mode::Bind,
            Role::Addressable,
        )
        .await?;
        let backend_endpoint = backend
            .endpoint()
            .map(|addr| addr.to_string())
            .ok_or_else(|| ZerobotError::InvalidConfig("backend has no endpoint".to_string()))?;
        let frontend = Channel::open(ctx, identity.clone(), address, Mode::Connect, Role::Addressable).await?;

        let token = ctx.child_token();
        let gauge = Arc::new(SizeGauge::default());
        let (frontend, frontend_rx) = frontend.split();
        let (backend, backend_rx) = backend.split();
        let mut reactor = Reactor {
            ctx: ctx.clone(),
            identity: identity.clone(),
            table,
            sizer: PoolSizer::new(config.min(), config.max_workers, config.cooldown),
            config,
            backend_endpoint,
            frontend,
            backend,
            members: HashMap::new(),
            starting: HashSet::new(),
            free: Vec::new(),
            backlog: None,
            token: token.clone(),
            gauge: Arc::clone(&gauge),
        };
        let initial = reactor.config.init_workers;
        reactor.add_workers(initial).await;
        tracing::info!(
            pool = %identity,
            %address,
            init = initial,
            min = reactor.config.min(),
            max = reactor.config.max_workers,
            dynamic = reactor.config.dynamic_workers,
            "worker pool started"
        );
        let task = ctx.spawn(reactor.run(frontend_rx, backend_rx));

        Ok(Self {
            identity,
            token,
            gauge,
            task,
        })
    }

    /// Identity the pool is reachable under.
    #[must_use]
    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// Current member and free counts.
    #[must_use]
    pub fn size(&self) -> PoolSize {
        self.gauge.get()
    }

    /// Asks the pool to stop. Returns immediately.
    pub fn stop(&self) {
        self.token.cancel();
    }

    /// Resolves once the pool was asked to stop, locally or by a remote
    /// `stop` call.
    pub async fn stopped(&self) {
        self.token.cancelled().await;
    }

    /// Stops the pool and waits for its reactor to finish tearing down.
    pub async fn shutdown(self) {
        self.token.cancel();
        if let Err(err) = self.task.await {
            tracing::warn!(pool = %self.identity, error = %err, "pool reactor failed");
        }
    }
}

struct Reactor {
    ctx: Context,
    identity: Identity,
    table: MethodTable,
    config: PoolConfig,
    sizer: PoolSizer,
    backend_endpoint: String,
    frontend: ChannelSender,
    backend: ChannelSender,
    members: HashMap<Bytes, Worker>,
    /// Members started but not yet `READY`.
    starting: HashSet<Bytes>,
    free: Vec<Bytes>,
    backlog: Option<Frames>,
    token: CancellationToken,
    gauge: Arc<SizeGauge>,
}

impl Reactor {
    async fn run(mut self, mut frontend_rx: ChannelReceiver, mut backend_rx: ChannelReceiver) {
        let period = self.config.cooldown.max(Duration::from_millis(1));
        let mut idle = tokio::time::interval_at(Instant::now() + period, period);
        idle.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let dynamic = self.config.dynamic_workers;

        loop {
            tokio::select! {
                () = self.token.cancelled() => break,
                inbound = backend_rx.recv() => match inbound {
                    Some(frames) => {
                        if self.on_backend(frames).await {
                            break;
                        }
                    }
                    None => break,
                },
                inbound = frontend_rx.recv(), if self.backlog.is_none() => match inbound {
                    Some(frames) => self.on_request(frames).await,
                    None => break,
                },
                _ = idle.tick(), if dynamic => self.ungrow(),
            }
        }

        // Reactor first, then channels, then workers.
        self.token.cancel();
        self.frontend.close();
        self.backend.close();
        let members = self.members.len();
        for (_, worker) in self.members.drain() {
            worker.stop();
        }
        self.free.clear();
        self.starting.clear();
        self.publish_size();
        tracing::info!(pool = %self.identity, stopped_workers = members, "worker pool stopped");
    }

    /// A request from the broker: `[caller, payload]`.
    async fn on_request(&mut self, frames: Frames) {
        match self.free.pop() {
            Some(worker) => self.dispatch(worker, frames).await,
            None => {
                // Members still starting are capacity on its way.
                if self.config.dynamic_workers && self.starting.is_empty() {
                    self.grow().await;
                }
                tracing::debug!(pool = %self.identity, members = self.members.len(), "no free worker, holding request");
                self.backlog = Some(frames);
            }
        }
        self.publish_size();
    }

    /// A message from a worker: `[worker, READY]`, `[worker, STOP]` or
    /// `[worker, caller, response]`. Returns `true` when the pool must stop.
    async fn on_backend(&mut self, mut frames: Frames) -> bool {
        if frames.is_empty() {
            return false;
        }
        let worker = frames.remove(0);
        let known = self.members.contains_key(&worker);
        match frames.as_slice() {
            [signal] if signal.as_ref() == READY => {
                self.starting.remove(&worker);
                if known && !self.free.contains(&worker) {
                    tracing::debug!(pool = %self.identity, worker = %String::from_utf8_lossy(&worker), "worker ready");
                    self.free.push(worker);
                }
            }
            [signal] if signal.as_ref() == STOP_REQUESTED => {
                tracing::info!(pool = %self.identity, "stop requested remotely");
                return true;
            }
            _ => {
                if let Err(err) = self.frontend.send(frames).await {
                    tracing::warn!(pool = %self.identity, error = %err, "reply not forwarded");
                }
                if known {
                    self.free.push(worker);
                }
            }
        }

        if let Some(waiting) = self.backlog.take() {
            match self.free.pop() {
                Some(worker) => self.dispatch(worker, waiting).await,
                None => self.backlog = Some(waiting),
            }
        }
        if self.config.dynamic_workers && !self.free.is_empty() {
            self.ungrow();
        }
        self.publish_size();
        false
    }

    async fn dispatch(&mut self, worker: Bytes, frames: Frames) {
        let mut envelope = Vec::with_capacity(frames.len() + 1);
        envelope.push(worker);
        envelope.extend(frames);
        if let Err(err) = self.backend.send(envelope).await {
            tracing::warn!(pool = %self.identity, error = %err, "dispatch failed");
        }
    }

    async fn grow(&mut self) {
        let added = self.sizer.grow(self.members.len(), Instant::now());
        if added == 0 {
            return;
        }
        self.add_workers(added).await;
        tracing::info!(pool = %self.identity, added, members = self.members.len(), "pool grows");
    }

    fn ungrow(&mut self) {
        let remove = self
            .sizer
            .shrink(self.members.len(), self.free.len(), Instant::now());
        if remove == 0 {
            return;
        }
        for _ in 0..remove {
            let Some(id) = self.free.pop() else {
                break;
            };
            if let Some(worker) = self.members.remove(&id) {
                worker.stop();
            }
        }
        tracing::info!(pool = %self.identity, removed = remove, members = self.members.len(), "pool shrinks");
        self.publish_size();
    }

    async fn add_workers(&mut self, count: usize) {
        for _ in 0..count {
            let id = Identity::unique(&format!("{}-worker", self.identity));
            match Worker::start_member(&self.ctx, id.clone(), &self.backend_endpoint, self.table.clone()).await {
                Ok(worker) => {
                    self.starting.insert(id.to_frame());
                    self.members.insert(id.to_frame(), worker);
                }
                Err(err) => {
                    tracing::warn!(pool = %self.identity, error = %err, "could not start worker");
                    break;
                }
            }
        }
        self.publish_size();
    }

    fn publish_size(&self) {
        self.gauge.set(self.members.len(), self.free.len());
    }
}
