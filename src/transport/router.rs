//! Addressable bind channel: routes frames by peer identity.
//!
//! Inbound messages are delivered as `[peer_id, frames...]`. Outbound
//! messages name the recipient in their first frame, which is stripped
//! before the rest is written to that peer.

use std::collections::HashMap;

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio_util::codec::Framed;

use super::{
    Command, Frames, FramedStream, MultipartCodec, PeerEvent, Role, Shared, accept_greeting,
};
use crate::error::{Result, ZerobotError};

#[derive(Debug)]
struct Peer {
    conn: u64,
    tx: mpsc::Sender<Frames>,
}

/// Reactor of an addressable bind channel. Owns the peer table.
pub(crate) async fn run(
    listener: TcpListener,
    shared: Shared,
    mut commands: mpsc::Receiver<Command>,
    inbound: mpsc::Sender<Frames>,
) {
    let (events_tx, mut events) = mpsc::channel::<PeerEvent>(shared.capacity);
    let mut peers: HashMap<Bytes, Peer> = HashMap::new();
    let mut next_conn: u64 = 0;

    loop {
        tokio::select! {
            () = shared.token.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, remote)) => {
                    next_conn += 1;
                    tracing::debug!(channel = %shared.identity, %remote, conn = next_conn, "accepted connection");
                    shared.ctx.spawn(serve_peer(
                        stream,
                        next_conn,
                        shared.clone(),
                        events_tx.clone(),
                        inbound.clone(),
                    ));
                }
                Err(err) => tracing::warn!(channel = %shared.identity, error = %err, "accept failed"),
            },
            Some(event) = events.recv() => match event {
                PeerEvent::Joined { conn, identity, tx, registered } => {
                    tracing::debug!(channel = %shared.identity, peer = %String::from_utf8_lossy(&identity), "peer joined");
                    if peers.insert(identity.clone(), Peer { conn, tx }).is_some() {
                        tracing::info!(channel = %shared.identity, peer = %String::from_utf8_lossy(&identity), "peer reconnected, replacing previous connection");
                    }
                    let _ = registered.send(());
                }
                PeerEvent::Left { conn, identity } => {
                    if peers.get(&identity).is_some_and(|peer| peer.conn == conn) {
                        peers.remove(&identity);
                        tracing::debug!(channel = %shared.identity, peer = %String::from_utf8_lossy(&identity), "peer left");
                    }
                }
                PeerEvent::Subscribe { .. } | PeerEvent::Unsubscribe { .. } => {}
            },
            command = commands.recv() => match command {
                Some(Command::Send(frames)) => match route(&peers, frames) {
                    Ok(()) => shared.stats.record_sent(),
                    Err(err) => {
                        shared.stats.record_dropped();
                        tracing::warn!(channel = %shared.identity, error = %err, "dropping outbound message");
                    }
                },
                Some(Command::Subscribe(_) | Command::Unsubscribe(_)) => {
                    tracing::debug!(channel = %shared.identity, "topic filters do not apply to addressable channels");
                }
                None => break,
            },
        }
    }

    shared.token.cancel();
    tracing::debug!(channel = %shared.identity, "router stopped");
}

/// Hands `[recipient, frames...]` to the recipient's connection.
fn route(peers: &HashMap<Bytes, Peer>, frames: Frames) -> Result<()> {
    let mut frames = frames.into_iter();
    let Some(recipient) = frames.next() else {
        return Err(ZerobotError::Protocol("empty outbound message".to_string()));
    };
    let rest: Frames = frames.collect();
    if rest.is_empty() {
        return Err(ZerobotError::Protocol("outbound message without payload".to_string()));
    }
    let name = || String::from_utf8_lossy(&recipient).into_owned();
    let peer = peers.get(&recipient).ok_or_else(|| ZerobotError::Routing(name()))?;
    peer.tx
        .try_send(rest)
        .map_err(|err| ZerobotError::Routing(format!("{} ({err})", name())))
}

/// Moves frames between one accepted connection and the reactor.
async fn serve_peer(
    stream: TcpStream,
    conn: u64,
    shared: Shared,
    events: mpsc::Sender<PeerEvent>,
    inbound: mpsc::Sender<Frames>,
) {
    let _ = stream.set_nodelay(true);
    let mut framed: FramedStream = Framed::new(stream, MultipartCodec::new());
    let identity = match accept_greeting(&mut framed, Role::Addressable).await {
        Ok(identity) => identity,
        Err(err) => {
            tracing::warn!(channel = %shared.identity, conn, error = %err, "rejecting connection");
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
                    if let Err(err) = sink.send(frames).await {
                        tracing::debug!(channel = %shared.identity, conn, error = %err, "write failed");
                        break;
                    }
                }
                None => break,
            },
            incoming = stream.next() => match incoming {
                Some(Ok(frames)) => {
                    shared.stats.record_received();
                    let mut message = Vec::with_capacity(frames.len() + 1);
                    message.push(identity.clone());
                    message.extend(frames);
                    if inbound.send(message).await.is_err() {
                        break;
                    }
                }
                Some(Err(err)) => {
                    tracing::warn!(channel = %shared.identity, conn, error = %err, "malformed frames, closing connection");
                    break;
                }
                None => break,
            },
        }
    }

    let _ = events.send(PeerEvent::Left { conn, identity }).await;
}
