//! Identity-addressed duplex channels over TCP.
//!
//! A [`Channel`] is opened with an identity, an address, a [`Mode`]
//! (bind or connect) and a [`Role`] (addressable or broadcast):
//!
//! | Mode    | Role        | Behaves like          | Module          |
//! |---------|-------------|-----------------------|-----------------|
//! | Bind    | Addressable | identity router       | [`router`]      |
//! | Connect | Addressable | identity dealer       | [`dealer`]      |
//! | Bind    | Broadcast   | topic publisher       | [`broadcast`]   |
//! | Connect | Broadcast   | topic subscriber      | [`dealer`]      |
//!
//! Each channel is driven by exactly one task, its reactor, which owns the
//! connection table. Per-connection tasks only move frames between the socket
//! and the reactor, so frames from one sender are delivered in FIFO order.

pub mod broadcast;
pub mod codec;
pub mod dealer;
pub mod router;

use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;

use crate::context::Context;
use crate::error::{Result, ZerobotError};

pub use codec::{MultipartCodec, frames};

/// One message: an ordered sequence of byte frames.
pub type Frames = Vec<Bytes>;

/// Framed TCP connection carrying [`Frames`].
pub(crate) type FramedStream = Framed<TcpStream, MultipartCodec>;

/// Greeting marker sent as the first frame of every connection.
const GREETING: &[u8] = b"ZB/1";

/// Control frame asking a publisher to add a topic filter.
pub(crate) const CTRL_SUBSCRIBE: &[u8] = b"SUB";

/// Control frame asking a publisher to remove a topic filter.
pub(crate) const CTRL_UNSUBSCRIBE: &[u8] = b"UNSUB";

/// How long a freshly accepted connection may take to greet.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Delay between reconnect attempts of a connecting channel.
pub(crate) const RECONNECT_DELAY: Duration = Duration::from_millis(100);

/// How long a closing dealer keeps writing messages queued before the close.
pub(crate) const FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

/// Unique name of a live endpoint, used for addressing.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct Identity(String);

impl Identity {
    /// Creates an identity from any string.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Creates a unique identity of the form `<prefix>-<uuid>`.
    #[must_use]
    pub fn unique(prefix: &str) -> Self {
        Self(format!("{prefix}-{}", uuid::Uuid::new_v4()))
    }

    /// Returns the identity as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns the identity as a routing frame.
    #[must_use]
    pub fn to_frame(&self) -> Bytes {
        Bytes::copy_from_slice(self.0.as_bytes())
    }

    /// Parses a routing frame back into an identity.
    ///
    /// # Errors
    ///
    /// Returns [`ZerobotError::Protocol`] if the frame is not UTF-8.
    pub fn from_frame(frame: &[u8]) -> Result<Self> {
        std::str::from_utf8(frame)
            .map(|s| Self(s.to_string()))
            .map_err(|_| ZerobotError::Protocol("identity frame is not utf-8".to_string()))
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Identity {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for Identity {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Whether a channel listens or dials.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Dial the address; reconnects in the background.
    Connect,
    /// Listen on the address.
    Bind,
}

/// Addressing semantics of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Point-to-point frames tagged with the peer identity (reply routing).
    Addressable,
    /// Topic-filtered fan-out with no reply path.
    Broadcast,
}

impl Role {
    const fn as_bytes(self) -> &'static [u8] {
        match self {
            Self::Addressable => b"addressable",
            Self::Broadcast => b"broadcast",
        }
    }
}

/// A `tcp://host:port` endpoint address.
///
/// `*` as the host binds every interface; port `0` binds an ephemeral port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Address {
    host: String,
    port: u16,
}

impl Address {
    /// Host part, with `*` already expanded to `0.0.0.0`.
    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Port part.
    #[must_use]
    pub const fn port(&self) -> u16 {
        self.port
    }

    /// Host to dial when connecting; wildcard hosts dial loopback.
    fn dial_host(&self) -> &str {
        match self.host.as_str() {
            "0.0.0.0" => "127.0.0.1",
            "::" => "::1",
            other => other,
        }
    }
}

impl From<SocketAddr> for Address {
    fn from(addr: SocketAddr) -> Self {
        Self {
            host: addr.ip().to_string(),
            port: addr.port(),
        }
    }
}

impl FromStr for Address {
    type Err = ZerobotError;

    fn from_str(s: &str) -> Result<Self> {
        let rest = s
            .strip_prefix("tcp://")
            .ok_or_else(|| ZerobotError::InvalidAddress(format!("{s}: only tcp:// is supported")))?;
        let (host, port) = rest
            .rsplit_once(':')
            .ok_or_else(|| ZerobotError::InvalidAddress(format!("{s}: missing port")))?;
        let port = port
            .parse()
            .map_err(|_| ZerobotError::InvalidAddress(format!("{s}: bad port")))?;
        let host = match host.trim_start_matches('[').trim_end_matches(']') {
            "" => return Err(ZerobotError::InvalidAddress(format!("{s}: missing host"))),
            "*" => "0.0.0.0".to_string(),
            h => h.to_string(),
        };
        Ok(Self { host, port })
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "tcp://[{}]:{}", self.host, self.port)
        } else {
            write!(f, "tcp://{}:{}", self.host, self.port)
        }
    }
}

/// Message counters of one channel.
#[derive(Debug, Default)]
pub struct ChannelStats {
    sent: AtomicU64,
    received: AtomicU64,
    dropped: AtomicU64,
}

impl ChannelStats {
    pub(crate) fn record_sent(&self) {
        self.sent.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_received(&self) {
        self.received.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_dropped(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns a point-in-time copy of the counters.
    #[must_use]
    pub fn snapshot(&self) -> ChannelStatsSnapshot {
        ChannelStatsSnapshot {
            sent: self.sent.load(Ordering::Relaxed),
            received: self.received.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}

/// Serializable copy of [`ChannelStats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ChannelStatsSnapshot {
    /// Messages handed to a socket or peer queue.
    pub sent: u64,
    /// Messages received from peers.
    pub received: u64,
    /// Messages dropped (unknown recipient, full queue, no connection).
    pub dropped: u64,
}

/// Commands from channel handles to the channel reactor.
#[derive(Debug)]
pub(crate) enum Command {
    Send(Frames),
    Subscribe(Bytes),
    Unsubscribe(Bytes),
}

/// Connection table updates from per-connection tasks to a bind reactor.
#[derive(Debug)]
pub(crate) enum PeerEvent {
    /// `registered` fires once the reactor can route to the peer; inbound
    /// frames are held back until then.
    Joined {
        conn: u64,
        identity: Bytes,
        tx: mpsc::Sender<Frames>,
        registered: oneshot::Sender<()>,
    },
    Subscribe {
        conn: u64,
        topic: Bytes,
    },
    Unsubscribe {
        conn: u64,
        topic: Bytes,
    },
    Left {
        conn: u64,
        identity: Bytes,
    },
}

/// State shared by a channel's reactor and its connection tasks.
#[derive(Debug, Clone)]
pub(crate) struct Shared {
    pub(crate) identity: Identity,
    pub(crate) ctx: Context,
    pub(crate) token: CancellationToken,
    pub(crate) stats: Arc<ChannelStats>,
    pub(crate) capacity: usize,
}

/// Sending half of a [`Channel`]. Cheap to clone.
#[derive(Debug, Clone)]
pub struct ChannelSender {
    identity: Identity,
    mode: Mode,
    role: Role,
    local_addr: Option<SocketAddr>,
    commands: mpsc::Sender<Command>,
    stats: Arc<ChannelStats>,
    token: CancellationToken,
}

impl ChannelSender {
    /// Queues a message for sending.
    ///
    /// On addressable bind channels the first frame names the recipient.
    ///
    /// # Errors
    ///
    /// Returns [`ZerobotError::Protocol`] on a broadcast subscriber (which
    /// has no send path) and [`ZerobotError::Closed`] once the channel is
    /// closed.
    pub async fn send(&self, frames: Frames) -> Result<()> {
        if self.role == Role::Broadcast && self.mode == Mode::Connect {
            return Err(ZerobotError::Protocol(
                "broadcast subscribers cannot send".to_string(),
            ));
        }
        self.commands
            .send(Command::Send(frames))
            .await
            .map_err(|_| ZerobotError::Closed)
    }

    /// Adds a topic filter on a broadcast subscriber. See
    /// [`Channel::subscribe`].
    ///
    /// # Errors
    ///
    /// Returns [`ZerobotError::Closed`] once the channel is closed.
    pub async fn subscribe(&self, topic: impl Into<Bytes>) -> Result<()> {
        self.commands
            .send(Command::Subscribe(topic.into()))
            .await
            .map_err(|_| ZerobotError::Closed)
    }

    /// Removes a topic filter on a broadcast subscriber.
    ///
    /// # Errors
    ///
    /// Returns [`ZerobotError::Closed`] once the channel is closed.
    pub async fn unsubscribe(&self, topic: impl Into<Bytes>) -> Result<()> {
        self.commands
            .send(Command::Unsubscribe(topic.into()))
            .await
            .map_err(|_| ZerobotError::Closed)
    }

    /// Identity this channel was opened with.
    #[must_use]
    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// Bound socket address, for bind channels.
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Address peers should dial to reach a bind channel.
    #[must_use]
    pub fn endpoint(&self) -> Option<Address> {
        self.local_addr.map(|local| {
            let addr = Address::from(local);
            Address {
                host: addr.dial_host().to_string(),
                port: addr.port,
            }
        })
    }

    /// Counters of this channel.
    #[must_use]
    pub fn stats(&self) -> Arc<ChannelStats> {
        Arc::clone(&self.stats)
    }

    /// Stops the channel reactor and its connections. A connected dealer
    /// first writes the messages already queued.
    pub fn close(&self) {
        self.token.cancel();
    }

    /// Returns `true` once the channel has been closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.token.is_cancelled() || self.commands.is_closed()
    }
}

/// Receiving half of a [`Channel`].
#[derive(Debug)]
pub struct ChannelReceiver {
    inbound: mpsc::Receiver<Frames>,
}

impl ChannelReceiver {
    /// Waits for the next inbound message.
    ///
    /// Addressable bind channels prefix each message with the sender's
    /// identity frame. Returns `None` once the channel is closed.
    pub async fn recv(&mut self) -> Option<Frames> {
        self.inbound.recv().await
    }
}

/// Identity-addressed duplex channel bound to its own reactor task.
#[derive(Debug)]
pub struct Channel {
    sender: ChannelSender,
    receiver: ChannelReceiver,
}

impl Channel {
    /// Opens a channel and starts its reactor.
    ///
    /// Bind channels are listening when this returns. Connect channels dial
    /// in the background and keep redialing if the peer goes away; messages
    /// sent meanwhile wait in the channel queue.
    ///
    /// # Errors
    ///
    /// Returns [`ZerobotError::InvalidAddress`] for an unparsable address
    /// and [`ZerobotError::Io`] if binding fails.
    pub async fn open(
        ctx: &Context,
        identity: Identity,
        address: &str,
        mode: Mode,
        role: Role,
    ) -> Result<Self> {
        let address: Address = address.parse()?;
        let capacity = ctx.channel_capacity();
        let (commands_tx, commands_rx) = mpsc::channel(capacity);
        let (inbound_tx, inbound_rx) = mpsc::channel(capacity);
        let shared = Shared {
            identity: identity.clone(),
            ctx: ctx.clone(),
            token: ctx.child_token(),
            stats: Arc::new(ChannelStats::default()),
            capacity,
        };

        let local_addr = match mode {
            Mode::Bind => {
                let listener = TcpListener::bind((address.host(), address.port())).await?;
                let local = listener.local_addr()?;
                tracing::info!(%identity, addr = %local, ?role, "channel bound");
                match role {
                    Role::Addressable => {
                        ctx.spawn(router::run(listener, shared.clone(), commands_rx, inbound_tx));
                    }
                    Role::Broadcast => {
                        drop(inbound_tx);
                        ctx.spawn(broadcast::run(listener, shared.clone(), commands_rx));
                    }
                }
                Some(local)
            }
            Mode::Connect => {
                tracing::debug!(%identity, %address, ?role, "channel connecting");
                ctx.spawn(dealer::run(address, role, shared.clone(), commands_rx, inbound_tx));
                None
            }
        };

        Ok(Self {
            sender: ChannelSender {
                identity,
                mode,
                role,
                local_addr,
                commands: commands_tx,
                stats: shared.stats,
                token: shared.token,
            },
            receiver: ChannelReceiver {
                inbound: inbound_rx,
            },
        })
    }

    /// Queues a message for sending. See [`ChannelSender::send`].
    ///
    /// # Errors
    ///
    /// Same as [`ChannelSender::send`].
    pub async fn send(&self, frames: Frames) -> Result<()> {
        self.sender.send(frames).await
    }

    /// Waits for the next inbound message. See [`ChannelReceiver::recv`].
    pub async fn recv(&mut self) -> Option<Frames> {
        self.receiver.recv().await
    }

    /// Adds a topic filter on a broadcast subscriber. The empty topic
    /// matches everything.
    ///
    /// # Errors
    ///
    /// Returns [`ZerobotError::Closed`] once the channel is closed.
    pub async fn subscribe(&self, topic: impl Into<Bytes>) -> Result<()> {
        self.sender.subscribe(topic).await
    }

    /// Removes a topic filter on a broadcast subscriber.
    ///
    /// # Errors
    ///
    /// Returns [`ZerobotError::Closed`] once the channel is closed.
    pub async fn unsubscribe(&self, topic: impl Into<Bytes>) -> Result<()> {
        self.sender.unsubscribe(topic).await
    }

    /// Identity this channel was opened with.
    #[must_use]
    pub fn identity(&self) -> &Identity {
        self.sender.identity()
    }

    /// Bound socket address, for bind channels.
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.sender.local_addr()
    }

    /// Address peers should dial to reach a bind channel.
    #[must_use]
    pub fn endpoint(&self) -> Option<Address> {
        self.sender.endpoint()
    }

    /// Counters of this channel.
    #[must_use]
    pub fn stats(&self) -> Arc<ChannelStats> {
        self.sender.stats()
    }

    /// Returns a clone of the sending half.
    #[must_use]
    pub fn sender(&self) -> ChannelSender {
        self.sender.clone()
    }

    /// Splits the channel so sending and receiving can live in different
    /// places.
    #[must_use]
    pub fn split(self) -> (ChannelSender, ChannelReceiver) {
        (self.sender, self.receiver)
    }

    /// Stops the channel reactor and its connections.
    pub fn close(&self) {
        self.sender.close();
    }
}

/// Sends the greeting on a freshly dialed connection.
pub(crate) async fn greet(framed: &mut FramedStream, identity: &Identity, role: Role) -> Result<()> {
    framed
        .send(vec![
            Bytes::from_static(GREETING),
            identity.to_frame(),
            Bytes::from_static(role.as_bytes()),
        ])
        .await?;
    Ok(())
}

/// Waits for and validates the greeting of an accepted connection.
///
/// Returns the peer identity frame.
pub(crate) async fn accept_greeting(framed: &mut FramedStream, role: Role) -> Result<Bytes> {
    let first = tokio::time::timeout(HANDSHAKE_TIMEOUT, framed.next())
        .await
        .map_err(|_| ZerobotError::Protocol("greeting timed out".to_string()))?;
    let frames = match first {
        Some(Ok(frames)) => frames,
        Some(Err(err)) => return Err(err.into()),
        None => return Err(ZerobotError::Closed),
    };
    match frames.as_slice() {
        [marker, identity, peer_role]
            if marker.as_ref() == GREETING && peer_role.as_ref() == role.as_bytes() =>
        {
            if identity.is_empty() {
                return Err(ZerobotError::Protocol("empty peer identity".to_string()));
            }
            Ok(identity.clone())
        }
        _ => Err(ZerobotError::Protocol(format!(
            "bad greeting for {role:?} channel"
        ))),
    }
}
