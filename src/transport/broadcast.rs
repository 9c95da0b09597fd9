//! Broadcast bind channel: topic-filtered fan-out.
//!
//! Subscribers register byte-prefix filters with control messages. A message
//! is delivered to every subscriber holding a filter that prefixes its first
//! frame. Delivery never blocks the publisher: a subscriber whose queue is
//! full misses the message.

use std::collections::HashMap;

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio_util::codec::Framed;

use super::{
    CTRL_SUBSCRIBE, CTRL_UNSUBSCRIBE, Command, Frames, FramedStream, MultipartCodec, PeerEvent,
    Role, Shared, accept_greeting,
};

/// Topic filters of one subscriber connection.
#[derive(Debug, Default)]
pub struct TopicFilter {
    prefixes: Vec<Bytes>,
}

impl TopicFilter {
    /// Creates a filter that matches nothing.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a prefix. The empty prefix matches every topic.
    pub fn add(&mut self, prefix: Bytes) {
        if !self.prefixes.contains(&prefix) {
            self.prefixes.push(prefix);
        }
    }

    /// Removes a prefix previously added.
    pub fn remove(&mut self, prefix: &[u8]) {
        self.prefixes.retain(|p| p.as_ref() != prefix);
    }

    /// Returns `true` if any prefix matches `topic`.
    #[must_use]
    pub fn matches(&self, topic: &[u8]) -> bool {
        self.prefixes.iter().any(|p| topic.starts_with(p))
    }

    /// Number of registered prefixes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.prefixes.len()
    }

    /// Returns `true` if no prefix is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.prefixes.is_empty()
    }
}

#[derive(Debug)]
struct Subscriber {
    filter: TopicFilter,
    tx: mpsc::Sender<Frames>,
}

/// Reactor of a broadcast bind channel. Owns the subscriber table.
pub(crate) async fn run(
    listener: TcpListener,
    shared: Shared,
    mut commands: mpsc::Receiver<Command>,
) {
    let (events_tx, mut events) = mpsc::channel::<PeerEvent>(shared.capacity);
    let mut subscribers: HashMap<u64, Subscriber> = HashMap::new();
    let mut next_conn: u64 = 0;

    loop {
        tokio::select! {
            () = shared.token.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, remote)) => {
                    next_conn += 1;
                    tracing::debug!(channel = %shared.identity, %remote, conn = next_conn, "subscriber connected");
                    shared.ctx.spawn(serve_subscriber(stream, next_conn, shared.clone(), events_tx.clone()));
                }
                Err(err) => tracing::warn!(channel = %shared.identity, error = %err, "accept failed"),
            },
            Some(event) = events.recv() => match event {
                PeerEvent::Joined { conn, tx, registered, .. } => {
                    subscribers.insert(conn, Subscriber { filter: TopicFilter::new(), tx });
                    let _ = registered.send(());
                }
                PeerEvent::Subscribe { conn, topic } => {
                    if let Some(sub) = subscribers.get_mut(&conn) {
                        sub.filter.add(topic);
                    }
                }
                PeerEvent::Unsubscribe { conn, topic } => {
                    if let Some(sub) = subscribers.get_mut(&conn) {
                        sub.filter.remove(&topic);
                    }
                }
                PeerEvent::Left { conn, .. } => {
                    subscribers.remove(&conn);
                }
            },
            command = commands.recv() => match command {
                Some(Command::Send(frames)) => fan_out(&shared, &subscribers, &frames),
                Some(Command::Subscribe(_) | Command::Unsubscribe(_)) => {
                    tracing::debug!(channel = %shared.identity, "publishers do not take topic filters");
                }
                None => break,
            },
        }
    }

    shared.token.cancel();
    tracing::debug!(channel = %shared.identity, "publisher stopped");
}

fn fan_out(shared: &Shared, subscribers: &HashMap<u64, Subscriber>, frames: &Frames) {
    let Some(topic) = frames.first() else {
        return;
    };
    for sub in subscribers.values().filter(|s| s.filter.matches(topic)) {
        match sub.tx.try_send(frames.clone()) {
            Ok(()) => shared.stats.record_sent(),
            Err(_) => shared.stats.record_dropped(),
        }
    }
}

async fn serve_subscriber(
    stream: TcpStream,
    conn: u64,
    shared: Shared,
    events: mpsc::Sender<PeerEvent>,
) {
    let _ = stream.set_nodelay(true);
    let mut framed: FramedStream = Framed::new(stream, MultipartCodec::new());
    let identity = match accept_greeting(&mut framed, Role::Broadcast).await {
        Ok(identity) => identity,
        Err(err) => {
            tracing::warn!(channel = %shared.identity, conn, error = %err, "rejecting subscriber");
            return;
        }
    };

    let (tx, mut outbound) = mpsc::channel::<Frames>(shared.capacity);
    let (registered, ack) = oneshot::channel();
    let joined = PeerEvent::Joined {
        conn,
        identity: identity.clone(),
        tx,
        registered,
    };
    if events.send(joined).await.is_err() || ack.await.is_err() {
        return;
    }

    let (mut sink, mut stream) = framed.split();
    loop {
        tokio::select! {
            () = shared.token.cancelled() => break,
            out = outbound.recv() => match out {
                Some(frames) => {
                    if sink.send(frames).await.is_err() {
                        break;
                    }
                }
                None => break,
            },
            incoming = stream.next() => match incoming {
                Some(Ok(frames)) => {
                    let event = match frames.as_slice() {
                        [ctrl, topic] if ctrl.as_ref() == CTRL_SUBSCRIBE => {
                            PeerEvent::Subscribe { conn, topic: topic.clone() }
                        }
                        [ctrl, topic] if ctrl.as_ref() == CTRL_UNSUBSCRIBE => {
                            PeerEvent::Unsubscribe { conn, topic: topic.clone() }
                        }
                        _ => {
                            tracing::debug!(channel = %shared.identity, conn, "ignoring data frames from subscriber");
                            continue;
                        }
                    };
                    if events.send(event).await.is_err() {
                        break;
                    }
                }
                Some(Err(_)) | None => break,
            },
        }
    }

    let _ = events.send(PeerEvent::Left { conn, identity }).await;
}
