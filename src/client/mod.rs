//! RPC client.
//!
//! An [`RpcClient`] connects to the broker's client-facing address and calls
//! the methods of one remote service identity. Calls are built with
//! [`RpcClient::call`]:
//!
//! ```no_run
//! # async fn demo(ctx: &zerobot::Context) -> zerobot::Result<()> {
//! use std::time::Duration;
//! use zerobot::client::RpcClient;
//!
//! let client = RpcClient::connect(ctx, "console", "tcp://127.0.0.1:5000", "calc").await?;
//! let sum: i64 = client.call("add").arg(2)?.arg(40)?.invoke_as().await?;
//! let pending = client
//!     .call("slow")
//!     .timeout(Duration::from_secs(1))
//!     .callback(|response| println!("{:?}", response.data))
//!     .send()
//!     .await?;
//! # let _ = (sum, pending);
//! # Ok(())
//! # }
//! ```
//!
//! Responses are matched to their calls through a [`CorrelationTable`], so
//! any number of calls may be outstanding on one client.

use std::fmt;
use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;

use crate::context::Context;
use crate::error::Result;
use crate::protocol::{
    CorrelationTable, PendingCall, Request, Resolution, Response, ResponseCallback,
};
use crate::transport::{Channel, ChannelReceiver, ChannelSender, Identity, Mode, Role};

/// Caller side of the RPC protocol, bound to one remote identity.
#[derive(Debug)]
pub struct RpcClient {
    remote: Identity,
    sender: ChannelSender,
    table: CorrelationTable,
    default_timeout: Option<Duration>,
    token: CancellationToken,
}

impl RpcClient {
    /// Connects to `address` as `identity` and targets `remote`.
    ///
    /// The connection is established in the background; calls issued before
    /// it is up are queued.
    ///
    /// # Errors
    ///
    /// Returns [`ZerobotError::InvalidAddress`](crate::ZerobotError::InvalidAddress) for an unparsable address.
    pub async fn connect(
        ctx: &Context,
        identity: impl Into<Identity>,
        address: &str,
        remote: impl Into<Identity>,
    ) -> Result<Self> {
        let identity = identity.into();
        let channel = Channel::open(ctx, identity.clone(), address, Mode::Connect, Role::Addressable).await?;
        let (sender, receiver) = channel.split();
        let table = CorrelationTable::new(ctx);
        let token = ctx.child_token();
        ctx.spawn(run(identity, receiver, table.clone(), token.clone()));
        Ok(Self {
            remote: remote.into(),
            sender,
            table,
            default_timeout: None,
            token,
        })
    }

    /// Applies `timeout` to every call that does not set its own.
    #[must_use]
    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = Some(timeout);
        self
    }

    /// Identity of this client.
    #[must_use]
    pub fn identity(&self) -> &Identity {
        self.sender.identity()
    }

    /// Identity calls are addressed to.
    #[must_use]
    pub fn remote(&self) -> &Identity {
        &self.remote
    }

    /// Number of calls awaiting a response.
    #[must_use]
    pub fn outstanding(&self) -> usize {
        self.table.len()
    }

    /// Starts building a call to `method`.
    #[must_use]
    pub fn call(&self, method: impl Into<String>) -> CallBuilder<'_> {
        CallBuilder {
            client: self,
            request: Request::new(method),
            timeout: self.default_timeout,
            callback: None,
        }
    }

    /// Sends `request` without waiting for its response.
    ///
    /// With a `timeout`, a detached timer resolves the call locally as
    /// timed out if no response arrives in time. The `callback`, if any,
    /// fires exactly once with the final response, off the client reactor.
    ///
    /// # Errors
    ///
    /// Returns [`ZerobotError::DuplicateUid`](crate::ZerobotError::DuplicateUid) if the uid is already
    /// outstanding, [`ZerobotError::Serialization`](crate::ZerobotError::Serialization) if the request cannot be
    /// encoded and [`ZerobotError::Closed`](crate::ZerobotError::Closed) if the client is closed.
    pub async fn send_request(
        &self,
        request: Request,
        timeout: Option<Duration>,
        callback: Option<ResponseCallback>,
    ) -> Result<PendingResponse> {
        let payload = request.encode()?;
        let pending = self.table.register(request.uid.clone(), callback)?;
        if let Err(err) = self.sender.send(vec![self.remote.to_frame(), payload]).await {
            self.table.cancel(&request.uid);
            return Err(err);
        }
        if let Some(timeout) = timeout {
            self.table.arm_timeout(request.uid.clone(), timeout);
        }
        tracing::debug!(client = %self.identity(), uid = %request.uid, fct = %request.fct, "request sent");
        Ok(PendingResponse { call: pending })
    }

    /// Asks the service for its method list, or for one method's
    /// documentation.
    ///
    /// # Errors
    ///
    /// Same as [`CallBuilder::invoke`].
    pub async fn help(&self, method: Option<&str>) -> Result<Value> {
        let mut call = self.call("help");
        if let Some(method) = method {
            call = call.arg(method)?;
        }
        call.invoke().await
    }

    /// Asks the remote service to stop. Returns once it acknowledged.
    ///
    /// # Errors
    ///
    /// Same as [`CallBuilder::invoke`].
    pub async fn stop_remote(&self) -> Result<()> {
        self.call("stop").invoke().await.map(|_| ())
    }

    /// Stops the client. Outstanding calls observe [`ZerobotError::Closed`](crate::ZerobotError::Closed).
    pub fn close(&self) {
        self.token.cancel();
        self.sender.close();
    }
}

impl Drop for RpcClient {
    fn drop(&mut self) {
        self.close();
    }
}

/// Handle of a call sent with [`CallBuilder::send`].
///
/// Dropping it does not cancel the call: the entry stays outstanding until
/// its response or timeout, and its callback still fires.
#[derive(Debug)]
pub struct PendingResponse {
    call: PendingCall,
}

impl PendingResponse {
    /// Correlation id of the call.
    #[must_use]
    pub fn uid(&self) -> &str {
        self.call.uid()
    }

    /// Waits for the final response. Timeouts are returned as the
    /// synthesized `timeout` error response.
    ///
    /// # Errors
    ///
    /// Returns [`ZerobotError::Closed`](crate::ZerobotError::Closed) if the client closed first.
    pub async fn response(self) -> Result<Response> {
        self.call.wait().await.map(Resolution::into_response)
    }

    /// Waits for the call and returns its data.
    ///
    /// # Errors
    ///
    /// Returns [`ZerobotError::Timeout`](crate::ZerobotError::Timeout), [`ZerobotError::RemoteExecution`](crate::ZerobotError::RemoteExecution)
    /// or [`ZerobotError::Closed`](crate::ZerobotError::Closed).
    pub async fn result(self) -> Result<Value> {
        self.call.wait().await?.into_result()
    }

    /// Returns the response if it already arrived.
    ///
    /// # Errors
    ///
    /// Returns [`ZerobotError::Closed`](crate::ZerobotError::Closed) if the client closed, or the
    /// response was already taken.
    pub fn try_response(&mut self) -> Result<Option<Response>> {
        Ok(self.call.try_take()?.map(Resolution::into_response))
    }
}

/// Builder for one call. See [`RpcClient::call`].
pub struct CallBuilder<'a> {
    client: &'a RpcClient,
    request: Request,
    timeout: Option<Duration>,
    callback: Option<ResponseCallback>,
}

impl fmt::Debug for CallBuilder<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallBuilder")
            .field("request", &self.request)
            .field("timeout", &self.timeout)
            .field("callback", &self.callback.is_some())
            .finish_non_exhaustive()
    }
}

impl CallBuilder<'_> {
    /// Appends a positional argument.
    ///
    /// # Errors
    ///
    /// Returns [`ZerobotError::Serialization`](crate::ZerobotError::Serialization) if `value` cannot be
    /// represented as JSON.
    pub fn arg(mut self, value: impl Serialize) -> Result<Self> {
        self.request.args.push(serde_json::to_value(value)?);
        Ok(self)
    }

    /// Replaces the positional arguments.
    #[must_use]
    pub fn args(mut self, args: Vec<Value>) -> Self {
        self.request.args = args;
        self
    }

    /// Sets a keyword argument.
    ///
    /// # Errors
    ///
    /// Returns [`ZerobotError::Serialization`](crate::ZerobotError::Serialization) if `value` cannot be
    /// represented as JSON.
    pub fn kwarg(mut self, name: impl Into<String>, value: impl Serialize) -> Result<Self> {
        self.request
            .kwargs
            .insert(name.into(), serde_json::to_value(value)?);
        Ok(self)
    }

    /// Replaces the keyword arguments.
    #[must_use]
    pub fn kwargs(mut self, kwargs: Map<String, Value>) -> Self {
        self.request.kwargs = kwargs;
        self
    }

    /// Overrides the generated uid.
    #[must_use]
    pub fn uid(mut self, uid: impl Into<String>) -> Self {
        self.request.uid = uid.into();
        self
    }

    /// Sets the deadline of this call.
    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Removes any deadline, including the client default.
    #[must_use]
    pub fn no_timeout(mut self) -> Self {
        self.timeout = None;
        self
    }

    /// Fires `callback` with the final response, off the client reactor.
    #[must_use]
    pub fn callback(mut self, callback: impl FnOnce(Response) + Send + 'static) -> Self {
        self.callback = Some(Box::new(callback));
        self
    }

    /// Sends the call and returns immediately.
    ///
    /// # Errors
    ///
    /// Same as [`RpcClient::send_request`].
    pub async fn send(self) -> Result<PendingResponse> {
        self.client
            .send_request(self.request, self.timeout, self.callback)
            .await
    }

    /// Sends the call and waits for its data.
    ///
    /// Without a timeout this waits until the response arrives or the
    /// client closes.
    ///
    /// # Errors
    ///
    /// Returns [`ZerobotError::Timeout`](crate::ZerobotError::Timeout) if the deadline fired first and
    /// [`ZerobotError::RemoteExecution`](crate::ZerobotError::RemoteExecution) if the method failed remotely.
    pub async fn invoke(self) -> Result<Value> {
        self.send().await?.result().await
    }

    /// Like [`CallBuilder::invoke`], deserializing the data into `T`.
    ///
    /// # Errors
    ///
    /// As [`CallBuilder::invoke`], plus [`ZerobotError::Serialization`](crate::ZerobotError::Serialization) if
    /// the data does not fit `T`.
    pub async fn invoke_as<T: DeserializeOwned>(self) -> Result<T> {
        let value = self.invoke().await?;
        Ok(serde_json::from_value(value)?)
    }
}

/// Client reactor: feeds inbound responses to the correlation table.
async fn run(
    identity: Identity,
    mut receiver: ChannelReceiver,
    table: CorrelationTable,
    token: CancellationToken,
) {
    loop {
        tokio::select! {
            () = token.cancelled() => break,
            inbound = receiver.recv() => match inbound {
                Some(frames) => {
                    // [sender, response]; the response is always last.
                    let Some(payload) = frames.last() else {
                        continue;
                    };
                    match Response::decode(payload) {
                        Ok(response) => {
                            table.resolve(response);
                        }
                        Err(err) => {
                            tracing::warn!(client = %identity, error = %err, "dropping malformed response");
                        }
                    }
                }
                None => break,
            },
        }
    }
    table.close();
    tracing::debug!(client = %identity, "client stopped");
}
