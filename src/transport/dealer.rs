//! Connecting channels: addressable dealers and broadcast subscribers.
//!
//! The reactor dials the address, greets, then pumps frames until the
//! connection drops, after which it redials. Commands are only pulled from
//! the queue while connected, so messages sent during an outage wait there
//! (bounded by the channel capacity). Closing a connected dealer writes
//! whatever is still queued before the connection is dropped.

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use futures_util::stream::SplitSink;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::codec::Framed;

use super::{
    Address, CTRL_SUBSCRIBE, CTRL_UNSUBSCRIBE, Command, FLUSH_TIMEOUT, FramedStream, Frames, MultipartCodec,
    RECONNECT_DELAY, Role, Shared, greet,
};

type Sink = SplitSink<FramedStream, Frames>;

/// Why the inner connection loop ended.
enum Exit {
    Stop,
    Reconnect,
}

/// Reactor of a connecting channel.
pub(crate) async fn run(
    address: Address,
    role: Role,
    shared: Shared,
    mut commands: mpsc::Receiver<Command>,
    inbound: mpsc::Sender<Frames>,
) {
    // Replayed after every reconnect.
    let mut topics: Vec<Bytes> = Vec::new();

    loop {
        let stream = tokio::select! {
            () = shared.token.cancelled() => break,
            stream = dial(&address, &shared) => stream,
        };
        match pump(stream, role, &shared, &mut commands, &inbound, &mut topics).await {
            Exit::Stop => break,
            Exit::Reconnect => {
                tracing::debug!(channel = %shared.identity, %address, "connection lost, redialing");
                tokio::select! {
                    () = shared.token.cancelled() => break,
                    () = tokio::time::sleep(RECONNECT_DELAY) => {}
                }
            }
        }
    }

    shared.token.cancel();
    tracing::debug!(channel = %shared.identity, "connecting channel stopped");
}

async fn dial(address: &Address, shared: &Shared) -> TcpStream {
    loop {
        match TcpStream::connect((address.dial_host(), address.port())).await {
            Ok(stream) => {
                let _ = stream.set_nodelay(true);
                tracing::debug!(channel = %shared.identity, %address, "connected");
                return stream;
            }
            Err(err) => {
                tracing::trace!(channel = %shared.identity, %address, error = %err, "dial failed");
                tokio::time::sleep(RECONNECT_DELAY).await;
            }
        }
    }
}

fn control(kind: &'static [u8], topic: Bytes) -> Frames {
    vec![Bytes::from_static(kind), topic]
}

async fn pump(
    stream: TcpStream,
    role: Role,
    shared: &Shared,
    commands: &mut mpsc::Receiver<Command>,
    inbound: &mpsc::Sender<Frames>,
    topics: &mut Vec<Bytes>,
) -> Exit {
    let mut framed = Framed::new(stream, MultipartCodec::new());
    if let Err(err) = greet(&mut framed, &shared.identity, role).await {
        tracing::debug!(channel = %shared.identity, error = %err, "greeting failed");
        return Exit::Reconnect;
    }
    for topic in topics.iter() {
        if framed.send(control(CTRL_SUBSCRIBE, topic.clone())).await.is_err() {
            return Exit::Reconnect;
        }
    }

    let (mut sink, mut stream) = framed.split();
    loop {
        tokio::select! {
            () = shared.token.cancelled() => {
                flush(&mut sink, role, shared, commands).await;
                return Exit::Stop;
            }
            command = commands.recv() => {
                let frames = match command {
                    None => return Exit::Stop,
                    Some(Command::Send(frames)) => {
                        if role == Role::Broadcast {
                            shared.stats.record_dropped();
                            continue;
                        }
                        frames
                    }
                    Some(Command::Subscribe(topic)) => {
                        if !topics.contains(&topic) {
                            topics.push(topic.clone());
                        }
                        control(CTRL_SUBSCRIBE, topic)
                    }
                    Some(Command::Unsubscribe(topic)) => {
                        topics.retain(|t| t != &topic);
                        control(CTRL_UNSUBSCRIBE, topic)
                    }
                };
                if let Err(err) = sink.send(frames).await {
                    shared.stats.record_dropped();
                    tracing::debug!(channel = %shared.identity, error = %err, "write failed");
                    return Exit::Reconnect;
                }
                shared.stats.record_sent();
            },
            incoming = stream.next() => match incoming {
                Some(Ok(frames)) => {
                    shared.stats.record_received();
                    if inbound.send(frames).await.is_err() {
                        return Exit::Stop;
                    }
                }
                Some(Err(err)) => {
                    tracing::warn!(channel = %shared.identity, error = %err, "malformed frames from peer");
                    return Exit::Reconnect;
                }
                None => return Exit::Reconnect,
            },
        }
    }
}

/// Writes messages queued before the channel was closed, giving up after
/// [`FLUSH_TIMEOUT`].
async fn flush(sink: &mut Sink, role: Role, shared: &Shared, commands: &mut mpsc::Receiver<Command>) {
    if role == Role::Broadcast {
        return;
    }
    let drain = async {
        let mut flushed = 0_usize;
        while let Ok(command) = commands.try_recv() {
            let Command::Send(frames) = command else {
                continue;
            };
            if sink.send(frames).await.is_err() {
                shared.stats.record_dropped();
                break;
            }
            shared.stats.record_sent();
            flushed += 1;
        }
        flushed
    };
    match tokio::time::timeout(FLUSH_TIMEOUT, drain).await {
        Ok(0) => {}
        Ok(flushed) => tracing::debug!(channel = %shared.identity, flushed, "flushed queued messages on close"),
        Err(_) => tracing::warn!(channel = %shared.identity, "peer too slow, queued messages dropped on close"),
    }
}
