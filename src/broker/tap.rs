//! Read-only observer of the broker mirror channel.

use bytes::Bytes;

use crate::context::Context;
use crate::error::Result;
use crate::transport::{Channel, Frames, Identity, Mode, Role};

/// One envelope seen on the mirror.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrafficRecord {
    /// Sender identity (or publisher, for events).
    pub from: String,
    /// Recipient identity (or topic, for events).
    pub to: String,
    /// Opaque payload.
    pub payload: Bytes,
}

impl TrafficRecord {
    fn from_frames(frames: Frames) -> Option<Self> {
        let mut frames = frames.into_iter();
        match (frames.next(), frames.next(), frames.next(), frames.next()) {
            (Some(from), Some(to), Some(payload), None) => Some(Self {
                from: String::from_utf8_lossy(&from).into_owned(),
                to: String::from_utf8_lossy(&to).into_owned(),
                payload,
            }),
            _ => None,
        }
    }
}

/// Subscriber on a broker mirror address.
///
/// Filters are prefixes of the sender identity; with none, every envelope
/// is observed. Like any broadcast subscriber, a tap only sees traffic sent
/// after its filters reached the broker.
#[derive(Debug)]
pub struct TrafficTap {
    channel: Channel,
}

impl TrafficTap {
    /// Connects to `mirror_addr`, observing senders whose identity starts
    /// with one of `prefixes`.
    ///
    /// # Errors
    ///
    /// Returns [`ZerobotError::InvalidAddress`](crate::ZerobotError::InvalidAddress)
    /// if the address cannot be parsed.
    pub async fn connect(
        ctx: &Context,
        identity: Identity,
        mirror_addr: &str,
        prefixes: &[&str],
    ) -> Result<Self> {
        let channel = Channel::open(ctx, identity, mirror_addr, Mode::Connect, Role::Broadcast).await?;
        if prefixes.is_empty() {
            channel.subscribe(Bytes::new()).await?;
        }
        for prefix in prefixes {
            channel.subscribe(Bytes::copy_from_slice(prefix.as_bytes())).await?;
        }
        Ok(Self { channel })
    }

    /// Waits for the next observed envelope. Returns `None` once closed.
    pub async fn recv(&mut self) -> Option<TrafficRecord> {
        loop {
            let frames = self.channel.recv().await?;
            match TrafficRecord::from_frames(frames) {
                Some(record) => return Some(record),
                None => tracing::debug!(tap = %self.channel.identity(), "ignoring malformed mirror frames"),
            }
        }
    }

    /// Disconnects from the mirror.
    pub fn close(&self) {
        self.channel.close();
    }
}
