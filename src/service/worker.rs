//! Single-worker executor.
//!
//! A [`Worker`] connects to an addressable bind channel (the broker's worker
//! side, or a pool backend) and serves requests one at a time. Inbound
//! messages are `[route..., request]`; the reply goes out as
//! `[route..., response]` so it retraces the path the request came from.

use std::any::Any;
use std::fmt;
use std::time::Instant;

use bytes::Bytes;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::context::Context;
use crate::error::{Result, ZerobotError};
use crate::protocol::{RemoteError, Request, Response};
use crate::transport::{Channel, ChannelReceiver, ChannelSender, Frames, Identity, Mode, Role};

use super::registry::{Arguments, Dispatch, Handler, MethodTable};

/// One-frame message a pool member sends once it can take requests.
pub(crate) const READY: &[u8] = b"READY";

/// One-frame message a pool member sends after acknowledging `stop`.
pub(crate) const STOP_REQUESTED: &[u8] = b"STOP";

/// What the builtin `stop` does once its reply is queued.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StopScope {
    /// Stop this worker.
    Own,
    /// Tell the owning pool, which stops every member.
    Pool,
}

/// Handle of a running worker.
pub struct Worker {
    identity: Identity,
    token: CancellationToken,
    task: JoinHandle<()>,
}

impl fmt::Debug for Worker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Worker")
            .field("identity", &self.identity)
            .field("stopped", &self.token.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl Worker {
    /// Starts a standalone worker serving `table` as `identity`.
    ///
    /// A remote `stop` stops this worker only.
    ///
    /// # Errors
    ///
    /// Returns [`ZerobotError::InvalidAddress`] for an unparsable address.
    pub async fn start(
        ctx: &Context,
        identity: impl Into<Identity>,
        address: &str,
        table: MethodTable,
    ) -> Result<Self> {
        Self::launch(ctx, identity.into(), address, table, StopScope::Own).await
    }

    /// Starts a pool member. It announces itself with `READY` and forwards a
    /// remote `stop` to the pool.
    pub(crate) async fn start_member(
        ctx: &Context,
        identity: Identity,
        address: &str,
        table: MethodTable,
    ) -> Result<Self> {
        Self::launch(ctx, identity, address, table, StopScope::Pool).await
    }

    async fn launch(
        ctx: &Context,
        identity: Identity,
        address: &str,
        table: MethodTable,
        scope: StopScope,
    ) -> Result<Self> {
        let channel = Channel::open(ctx, identity.clone(), address, Mode::Connect, Role::Addressable).await?;
        let (sender, receiver) = channel.split();
        if scope == StopScope::Pool {
            sender.send(vec![Bytes::from_static(READY)]).await?;
        }
        let token = ctx.child_token();
        let reactor = Reactor {
            identity: identity.clone(),
            table,
            scope,
            sender,
            token: token.clone(),
        };
        let task = ctx.spawn(reactor.run(receiver));
        tracing::debug!(worker = %identity, %address, "worker started");
        Ok(Self {
            identity,
            token,
            task,
        })
    }

    /// Identity the worker is reachable under.
    #[must_use]
    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// Asks the worker to stop. A request in progress is abandoned.
    pub fn stop(&self) {
        self.token.cancel();
    }

    /// Returns `true` once the worker was asked to stop.
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Waits until the worker has stopped, either through [`Worker::stop`]
    /// or a remote `stop`.
    pub async fn join(self) {
        if let Err(err) = self.task.await {
            tracing::warn!(worker = %self.identity, error = %err, "worker task failed");
        }
    }
}

struct Reactor {
    identity: Identity,
    table: MethodTable,
    scope: StopScope,
    sender: ChannelSender,
    token: CancellationToken,
}

impl Reactor {
    async fn run(self, mut receiver: ChannelReceiver) {
        loop {
            let frames = tokio::select! {
                () = self.token.cancelled() => break,
                inbound = receiver.recv() => match inbound {
                    Some(frames) => frames,
                    None => break,
                },
            };
            match self.serve(frames).await {
                Served::Continue => {}
                Served::Stop => {
                    self.stop_requested().await;
                    break;
                }
                Served::Abandoned => break,
            }
        }
        self.token.cancel();
        tracing::debug!(worker = %self.identity, "worker stopped");
    }

    async fn stop_requested(&self) {
        match self.scope {
            StopScope::Own => {
                tracing::info!(worker = %self.identity, "stop requested remotely");
            }
            StopScope::Pool => {
                if let Err(err) = self.sender.send(vec![Bytes::from_static(STOP_REQUESTED)]).await {
                    tracing::warn!(worker = %self.identity, error = %err, "could not forward stop to pool");
                }
            }
        }
    }

    async fn serve(&self, mut frames: Frames) -> Served {
        let Some(payload) = frames.pop() else {
            return Served::Continue;
        };
        let route = frames;
        let request = match Request::decode(&payload) {
            Ok(request) => request,
            Err(err) => {
                tracing::warn!(worker = %self.identity, error = %err, "undecodable request");
                // Still answer so a pool gets its worker back.
                self.reply(route, Response::failed("", to_remote(&err))).await;
                return Served::Continue;
            }
        };

        let started = Instant::now();
        let args = Arguments::new(request.args, request.kwargs);
        let (response, stop) = match self.table.dispatch(&request.fct, args) {
            Dispatch::Reply(Ok(data)) => (Response::ok(request.uid.as_str(), data), false),
            Dispatch::Reply(Err(err)) => (Response::failed(request.uid.as_str(), to_remote(&err)), false),
            Dispatch::Stop => (Response::ok(request.uid.as_str(), serde_json::Value::Null), true),
            Dispatch::Invoke(handler, args) => {
                let outcome = tokio::select! {
                    outcome = invoke(handler, args) => outcome,
                    () = self.token.cancelled() => return Served::Abandoned,
                };
                match outcome {
                    Ok(data) => (Response::ok(request.uid.as_str(), data), false),
                    Err(err) => (Response::failed(request.uid.as_str(), err), false),
                }
            }
        };
        tracing::debug!(
            worker = %self.identity,
            uid = %request.uid,
            fct = %request.fct,
            ok = !response.is_error(),
            elapsed_us = started.elapsed().as_micros() as u64,
            "request served"
        );
        self.reply(route, response).await;
        if stop { Served::Stop } else { Served::Continue }
    }

    async fn reply(&self, mut route: Frames, response: Response) {
        match response.encode() {
            Ok(payload) => {
                route.push(payload);
                if let Err(err) = self.sender.send(route).await {
                    tracing::warn!(worker = %self.identity, error = %err, "reply not sent");
                }
            }
            Err(err) => {
                // Unencodable handler output; send the failure instead.
                tracing::warn!(worker = %self.identity, error = %err, "response not encodable");
                let fallback = Response::failed(response.uid, to_remote(&err));
                if let Ok(payload) = fallback.encode() {
                    route.push(payload);
                    let _ = self.sender.send(route).await;
                }
            }
        }
    }
}

enum Served {
    Continue,
    Stop,
    Abandoned,
}

/// Runs a handler on the blocking pool. Errors and panics both come back as
/// a [`RemoteError`].
async fn invoke(handler: Handler, args: Arguments) -> std::result::Result<serde_json::Value, RemoteError> {
    match tokio::task::spawn_blocking(move || handler(args)).await {
        Ok(Ok(data)) => Ok(data),
        Ok(Err(err)) => Err(RemoteError::new(err.to_string(), format!("{err:?}"))),
        Err(join) if join.is_panic() => {
            let message = panic_message(join.into_panic());
            Err(RemoteError::new(
                format!("method panicked: {message}"),
                message,
            ))
        }
        Err(join) => Err(RemoteError::new(join.to_string(), String::new())),
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

pub(crate) fn to_remote(err: &ZerobotError) -> RemoteError {
    RemoteError::new(err.to_string(), format!("{}: {err:?}", err.kind()))
}
