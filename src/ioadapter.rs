//! Bridge between the broker and a component reached over a byte stream.
//!
//! An [`IoAdapter`] joins the broker's worker side like any [`Worker`]
//! would, but instead of running handlers it writes each request to a
//! [`ByteStream`] and reads responses (and events) back. The stream format is
//! chosen by a [`BridgeCodec`]; [`JsonLinesCodec`] speaks newline-delimited
//! JSON, which pairs with [`ChildProcessStream`] to expose a subprocess:
//!
//! ```no_run
//! # async fn demo(ctx: &zerobot::Context) -> zerobot::Result<()> {
//! use zerobot::ioadapter::{ChildProcessStream, IoAdapter, JsonLinesCodec};
//!
//! let mut command = tokio::process::Command::new("./sensor-driver");
//! let stream = ChildProcessStream::spawn(&mut command)?;
//! let adapter = IoAdapter::start(ctx, "sensor", "tcp://127.0.0.1:5001", stream, JsonLinesCodec, None).await?;
//! adapter.join().await;
//! # Ok(())
//! # }
//! ```
//!
//! Requests are forwarded as soon as they arrive, so the component may have
//! several in flight; responses are routed back by uid.
//!
//! [`Worker`]: crate::service::Worker

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::process::Stdio;

use bytes::Bytes;
use serde::Deserialize;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::context::Context;
use crate::error::{Result, ZerobotError};
use crate::events::EventPublisher;
use crate::protocol::{Request, Response};
use crate::service::worker::to_remote;
use crate::transport::{Channel, ChannelReceiver, ChannelSender, Frames, Identity, Mode, Role};

/// Duplex byte stream to the bridged component.
pub trait ByteStream: Send + 'static {
    /// Reads the next output unit. `None` means the stream ended.
    ///
    /// Must be cancel-safe: the adapter polls it inside `select!`.
    fn read(&mut self) -> impl Future<Output = io::Result<Option<Bytes>>> + Send;

    /// Writes one encoded request.
    fn write(&mut self, data: Bytes) -> impl Future<Output = io::Result<()>> + Send;
}

/// Something the bridged component produced.
#[derive(Debug, Clone, PartialEq)]
pub enum BridgeOutput {
    /// Answer to a forwarded request.
    Response(Response),
    /// Unsolicited event to publish.
    Event {
        /// Topic key.
        topic: String,
        /// Event body.
        payload: Value,
    },
}

/// Wire format spoken over the [`ByteStream`].
pub trait BridgeCodec: Send + 'static {
    /// Encodes a request for the component.
    ///
    /// # Errors
    ///
    /// Returns [`ZerobotError::Serialization`] if the request cannot be
    /// encoded.
    fn encode_request(&self, request: &Request) -> Result<Bytes>;

    /// Decodes one unit of component output.
    ///
    /// # Errors
    ///
    /// Returns [`ZerobotError::Protocol`] for output it does not understand.
    fn decode_output(&self, output: Bytes) -> Result<BridgeOutput>;
}

/// Newline-delimited JSON.
///
/// Requests are written as one JSON object per line. Each output line is
/// either a response (`{"uid": ..., "data": ..., "error": ...}`) or an event
/// (`{"topic": ..., "payload": ...}`).
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonLinesCodec;

#[derive(Deserialize)]
struct EventLine {
    topic: String,
    #[serde(default)]
    payload: Value,
}

impl BridgeCodec for JsonLinesCodec {
    fn encode_request(&self, request: &Request) -> Result<Bytes> {
        let mut line = serde_json::to_vec(request)?;
        line.push(b'\n');
        Ok(Bytes::from(line))
    }

    fn decode_output(&self, output: Bytes) -> Result<BridgeOutput> {
        let value: Value = serde_json::from_slice(output.trim_ascii())
            .map_err(|err| ZerobotError::Protocol(format!("bad output line: {err}")))?;
        if value.get("uid").is_some() {
            let response = serde_json::from_value(value)
                .map_err(|err| ZerobotError::Protocol(format!("bad response line: {err}")))?;
            return Ok(BridgeOutput::Response(response));
        }
        let event: EventLine = serde_json::from_value(value)
            .map_err(|err| ZerobotError::Protocol(format!("line is neither response nor event: {err}")))?;
        Ok(BridgeOutput::Event {
            topic: event.topic,
            payload: event.payload,
        })
    }
}

/// Stdin/stdout of a spawned subprocess, one line per unit.
#[derive(Debug)]
pub struct ChildProcessStream {
    child: Child,
    stdin: ChildStdin,
    stdout: Lines<BufReader<ChildStdout>>,
}

impl ChildProcessStream {
    /// Spawns `command` with piped stdin and stdout. The process is killed
    /// when the stream is dropped.
    ///
    /// # Errors
    ///
    /// Returns [`ZerobotError::Io`] if the process cannot be spawned.
    pub fn spawn(command: &mut Command) -> Result<Self> {
        let mut child = command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;
        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            return Err(io::Error::other("child pipes unavailable").into());
        };
        tracing::debug!(pid = ?child.id(), "bridged process spawned");
        Ok(Self {
            child,
            stdin,
            stdout: BufReader::new(stdout).lines(),
        })
    }

    /// OS process id, while the process runs.
    #[must_use]
    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }
}

impl ByteStream for ChildProcessStream {
    async fn read(&mut self) -> io::Result<Option<Bytes>> {
        Ok(self.stdout.next_line().await?.map(Bytes::from))
    }

    async fn write(&mut self, data: Bytes) -> io::Result<()> {
        self.stdin.write_all(&data).await?;
        self.stdin.flush().await
    }
}

/// Handle of a running adapter.
pub struct IoAdapter {
    identity: Identity,
    token: CancellationToken,
    task: JoinHandle<()>,
}

impl fmt::Debug for IoAdapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IoAdapter")
            .field("identity", &self.identity)
            .field("stopped", &self.token.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl IoAdapter {
    /// Connects to the worker-side `address` as `identity` and starts
    /// bridging to `stream`. Events are published through `events` when
    /// given, and dropped otherwise.
    ///
    /// The adapter stops when the stream ends or fails.
    ///
    /// # Errors
    ///
    /// Returns [`ZerobotError::InvalidAddress`] for an unparsable address.
    pub async fn start<S, C>(
        ctx: &Context,
        identity: impl Into<Identity>,
        address: &str,
        stream: S,
        codec: C,
        events: Option<EventPublisher>,
    ) -> Result<Self>
    where
        S: ByteStream,
        C: BridgeCodec,
    {
        let identity = identity.into();
        let channel = Channel::open(ctx, identity.clone(), address, Mode::Connect, Role::Addressable).await?;
        let (sender, receiver) = channel.split();
        let token = ctx.child_token();
        let reactor = Reactor {
            identity: identity.clone(),
            sender,
            stream,
            codec,
            events,
            routes: HashMap::new(),
        };
        let task = ctx.spawn(reactor.run(receiver, token.clone()));
        tracing::info!(adapter = %identity, %address, "io adapter started");
        Ok(Self {
            identity,
            token,
            task,
        })
    }

    /// Identity the adapter is reachable under.
    #[must_use]
    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// Asks the adapter to stop.
    pub fn stop(&self) {
        self.token.cancel();
    }

    /// Waits until the adapter has stopped.
    pub async fn join(self) {
        if let Err(err) = self.task.await {
            tracing::warn!(adapter = %self.identity, error = %err, "adapter task failed");
        }
    }
}

struct Reactor<S, C> {
    identity: Identity,
    sender: ChannelSender,
    stream: S,
    codec: C,
    events: Option<EventPublisher>,
    /// Return route of every forwarded request, by uid.
    routes: HashMap<String, Frames>,
}

impl<S: ByteStream, C: BridgeCodec> Reactor<S, C> {
    async fn run(mut self, mut receiver: ChannelReceiver, token: CancellationToken) {
        loop {
            tokio::select! {
                () = token.cancelled() => break,
                inbound = receiver.recv() => match inbound {
                    Some(frames) => {
                        if let Err(err) = self.on_request(frames).await {
                            tracing::warn!(adapter = %self.identity, error = %err, "stream write failed");
                            break;
                        }
                    }
                    None => break,
                },
                output = self.stream.read() => match output {
                    Ok(Some(output)) => self.on_output(output).await,
                    Ok(None) => {
                        tracing::info!(adapter = %self.identity, "stream ended");
                        break;
                    }
                    Err(err) => {
                        tracing::warn!(adapter = %self.identity, error = %err, "stream read failed");
                        break;
                    }
                },
            }
        }
        token.cancel();
        self.sender.close();
        if !self.routes.is_empty() {
            tracing::warn!(adapter = %self.identity, unanswered = self.routes.len(), "adapter stopped with requests in flight");
        }
        tracing::info!(adapter = %self.identity, "io adapter stopped");
    }

    async fn on_request(&mut self, mut frames: Frames) -> io::Result<()> {
        let Some(payload) = frames.pop() else {
            return Ok(());
        };
        let route = frames;
        let request = match Request::decode(&payload) {
            Ok(request) => request,
            Err(err) => {
                tracing::warn!(adapter = %self.identity, error = %err, "undecodable request");
                send_reply(&self.sender, &self.identity, route, Response::failed("", to_remote(&err))).await;
                return Ok(());
            }
        };
        let encoded = match self.codec.encode_request(&request) {
            Ok(encoded) => encoded,
            Err(err) => {
                send_reply(&self.sender, &self.identity, route, Response::failed(request.uid, to_remote(&err))).await;
                return Ok(());
            }
        };
        tracing::debug!(adapter = %self.identity, uid = %request.uid, fct = %request.fct, "forwarding request");
        if self.routes.insert(request.uid.clone(), route).is_some() {
            tracing::warn!(adapter = %self.identity, uid = %request.uid, "uid reused while in flight");
        }
        if let Err(err) = self.stream.write(encoded).await {
            if let Some(route) = self.routes.remove(&request.uid) {
                let failure = ZerobotError::Io(io::Error::new(err.kind(), err.to_string()));
                send_reply(&self.sender, &self.identity, route, Response::failed(request.uid, to_remote(&failure))).await;
            }
            return Err(err);
        }
        Ok(())
    }

    async fn on_output(&mut self, output: Bytes) {
        match self.codec.decode_output(output) {
            Ok(BridgeOutput::Response(response)) => match self.routes.remove(&response.uid) {
                Some(route) => send_reply(&self.sender, &self.identity, route, response).await,
                None => {
                    tracing::debug!(adapter = %self.identity, uid = %response.uid, "response for unknown uid dropped");
                }
            },
            Ok(BridgeOutput::Event { topic, payload }) => match &self.events {
                Some(publisher) => {
                    if let Err(err) = publisher.publish(&topic, &payload).await {
                        tracing::warn!(adapter = %self.identity, %topic, error = %err, "event not published");
                    }
                }
                None => tracing::debug!(adapter = %self.identity, %topic, "no publisher, event dropped"),
            },
            Err(err) => tracing::warn!(adapter = %self.identity, error = %err, "undecodable output"),
        }
    }
}

async fn send_reply(sender: &ChannelSender, identity: &Identity, mut route: Frames, response: Response) {
    match response.encode() {
        Ok(payload) => {
            route.push(payload);
            if let Err(err) = sender.send(route).await {
                tracing::warn!(adapter = %identity, error = %err, "reply not sent");
            }
        }
        Err(err) => tracing::warn!(adapter = %identity, error = %err, "response not encodable"),
    }
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use std::time::Duration;

    use serde_json::json;
    use tokio::sync::mpsc;

    use super::*;

    /// In-memory stream; the test plays the bridged component.
    struct Pipe {
        output: mpsc::Receiver<Bytes>,
        input: mpsc::Sender<Bytes>,
    }

    impl ByteStream for Pipe {
        async fn read(&mut self) -> io::Result<Option<Bytes>> {
            Ok(self.output.recv().await)
        }

        async fn write(&mut self, data: Bytes) -> io::Result<()> {
            self.input
                .send(data)
                .await
                .map_err(|_| io::Error::from(io::ErrorKind::BrokenPipe))
        }
    }

    struct Harness {
        router: Channel,
        adapter: IoAdapter,
        to_adapter: mpsc::Sender<Bytes>,
        from_adapter: mpsc::Receiver<Bytes>,
    }

    async fn harness(ctx: &Context) -> Harness {
        let Ok(router) = Channel::open(ctx, Identity::new("backend"), "tcp://127.0.0.1:0", Mode::Bind, Role::Addressable).await
        else {
            panic!("bind");
        };
        let Some(endpoint) = router.endpoint() else {
            panic!("endpoint");
        };
        let (to_adapter, output) = mpsc::channel(8);
        let (input, from_adapter) = mpsc::channel(8);
        let pipe = Pipe { output, input };
        let Ok(adapter) = IoAdapter::start(ctx, "device", &endpoint.to_string(), pipe, JsonLinesCodec, None).await
        else {
            panic!("adapter");
        };
        Harness {
            router,
            adapter,
            to_adapter,
            from_adapter,
        }
    }

    async fn next<T>(rx: impl Future<Output = Option<T>>) -> T {
        let Ok(Some(value)) = tokio::time::timeout(Duration::from_secs(5), rx).await else {
            panic!("nothing received");
        };
        value
    }

    #[test]
    fn json_lines_tell_responses_from_events() {
        let codec = JsonLinesCodec;
        let Ok(BridgeOutput::Response(response)) =
            codec.decode_output(Bytes::from_static(br#"{"uid":"u1","data":7}"#))
        else {
            panic!("response line");
        };
        assert_eq!(response, Response::ok("u1", json!(7)));

        let Ok(BridgeOutput::Event { topic, payload }) =
            codec.decode_output(Bytes::from_static(b"{\"topic\":\"temp\",\"payload\":21}\n"))
        else {
            panic!("event line");
        };
        assert_eq!(topic, "temp");
        assert_eq!(payload, json!(21));

        assert!(codec.decode_output(Bytes::from_static(b"[1,2]")).is_err());
        assert!(codec.decode_output(Bytes::from_static(b"not json")).is_err());
    }

    #[test]
    fn requests_are_one_line_each() {
        let Ok(line) = JsonLinesCodec.encode_request(&Request::new("ping").with_uid("u1")) else {
            panic!("encode");
        };
        assert_eq!(line.last(), Some(&b'\n'));
        assert_eq!(line.iter().filter(|b| **b == b'\n').count(), 1);
    }

    #[tokio::test]
    async fn responses_retrace_the_request_route() {
        let ctx = Context::new();
        let mut h = harness(&ctx).await;
        let Ok(payload) = Request::new("ping").with_uid("u1").with_args(vec![json!(1)]).encode() else {
            panic!("encode");
        };
        // The router is up before the dealer connects, so retry until the
        // adapter is registered.
        let line = loop {
            let Ok(()) = h
                .router
                .send(vec![Bytes::from_static(b"device"), Bytes::from_static(b"client"), payload.clone()])
                .await
            else {
                panic!("send");
            };
            if let Ok(Some(line)) = tokio::time::timeout(Duration::from_millis(200), h.from_adapter.recv()).await {
                break line;
            }
        };
        let Ok(request) = serde_json::from_slice::<Request>(&line) else {
            panic!("request line");
        };
        assert_eq!(request.fct, "ping");

        let Ok(()) = h.to_adapter.send(Bytes::from_static(br#"{"uid":"u1","data":2}"#)).await else {
            panic!("component reply");
        };
        let reply = next(h.router.recv()).await;
        let [from, to, body] = reply.as_slice() else {
            panic!("unexpected reply shape");
        };
        assert_eq!(from.as_ref(), b"device");
        assert_eq!(to.as_ref(), b"client");
        let Ok(response) = Response::decode(body) else {
            panic!("response");
        };
        assert_eq!(response, Response::ok("u1", json!(2)));

        // Unknown uids are dropped, end of stream stops the adapter.
        let Ok(()) = h.to_adapter.send(Bytes::from_static(br#"{"uid":"zz","data":0}"#)).await else {
            panic!("stray reply");
        };
        drop(h.to_adapter);
        let Ok(()) = tokio::time::timeout(Duration::from_secs(5), h.adapter.join()).await else {
            panic!("adapter did not stop at end of stream");
        };
        ctx.shutdown().await;
    }

    #[tokio::test]
    async fn reply_written_just_before_end_of_stream_is_delivered() {
        for round in 0..20 {
            let ctx = Context::new();
            let mut h = harness(&ctx).await;
            let uid = format!("last-{round}");
            let Ok(payload) = Request::new("ping").with_uid(uid.clone()).encode() else {
                panic!("encode");
            };
            loop {
                let Ok(()) = h
                    .router
                    .send(vec![Bytes::from_static(b"device"), Bytes::from_static(b"client"), payload.clone()])
                    .await
                else {
                    panic!("send");
                };
                if let Ok(Some(_)) = tokio::time::timeout(Duration::from_millis(200), h.from_adapter.recv()).await {
                    break;
                }
            }

            // Answer and hang up at once.
            let line = format!(r#"{{"uid":"{uid}","data":{round}}}"#);
            let Ok(()) = h.to_adapter.send(Bytes::from(line)).await else {
                panic!("component reply");
            };
            drop(h.to_adapter);

            let reply = next(h.router.recv()).await;
            let Some(body) = reply.last() else {
                panic!("empty reply in round {round}");
            };
            let Ok(response) = Response::decode(body) else {
                panic!("response");
            };
            assert_eq!(response, Response::ok(uid, json!(round)));
            h.adapter.join().await;
            ctx.shutdown().await;
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn child_process_stream_round_trips_lines() {
        let Ok(mut stream) = ChildProcessStream::spawn(&mut Command::new("cat")) else {
            panic!("spawn cat");
        };
        assert!(stream.id().is_some());
        let Ok(()) = stream.write(Bytes::from_static(b"hello\n")).await else {
            panic!("write");
        };
        let Ok(Ok(Some(line))) = tokio::time::timeout(Duration::from_secs(5), stream.read()).await else {
            panic!("read");
        };
        assert_eq!(line.as_ref(), b"hello");
    }
}
