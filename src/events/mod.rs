//! Publish/subscribe overlay relayed by the broker.
//!
//! Publishers send `[topic, payload]` to the broker's event intake; the
//! broker republishes `[topic, publisher, payload]` on its event publish
//! channel, where subscribers filter by topic prefix. Payloads are JSON.
//!
//! ```no_run
//! # async fn demo(ctx: &zerobot::Context) -> zerobot::Result<()> {
//! use std::sync::Arc;
//! use zerobot::events::{Event, EventPublisher, EventSubscriber};
//!
//! let subscriber = EventSubscriber::connect(ctx, "dashboard", "tcp://127.0.0.1:5004").await?;
//! subscriber
//!     .subscribe("temp", Arc::new(|event: Event| println!("{} says {}", event.sender, event.payload)))
//!     .await?;
//!
//! let publisher = EventPublisher::connect(ctx, "sensor", "tcp://127.0.0.1:5003").await?;
//! publisher.publish("temp", &21.5).await?;
//! # Ok(())
//! # }
//! ```

pub mod subscription;

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::context::Context;
use crate::error::Result;
use crate::transport::{Channel, ChannelReceiver, ChannelSender, Frames, Identity, Mode, Role};

pub use subscription::{EventCallback, SubscriptionRegistry};

/// An event as delivered to subscribers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Event {
    /// Topic it was published under.
    pub topic: String,
    /// Identity of the publisher.
    pub sender: String,
    /// Decoded payload. Payloads that are not JSON arrive as a string.
    pub payload: Value,
    /// When this subscriber received it.
    pub received_at: DateTime<Utc>,
}

impl Event {
    /// Deserializes the payload.
    ///
    /// # Errors
    ///
    /// Returns [`ZerobotError::Serialization`](crate::ZerobotError::Serialization)
    /// if the payload does not match `T`.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_value(self.payload.clone())?)
    }

    fn from_frames(frames: Frames) -> Option<Self> {
        let mut frames = frames.into_iter();
        let (Some(topic), Some(sender), Some(payload), None) =
            (frames.next(), frames.next(), frames.next(), frames.next())
        else {
            return None;
        };
        let payload = serde_json::from_slice(&payload)
            .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&payload).into_owned()));
        Some(Self {
            topic: String::from_utf8_lossy(&topic).into_owned(),
            sender: String::from_utf8_lossy(&sender).into_owned(),
            payload,
            received_at: Utc::now(),
        })
    }
}

/// Sends events to a broker's event intake.
#[derive(Debug)]
pub struct EventPublisher {
    sender: ChannelSender,
}

impl EventPublisher {
    /// Connects to `intake_addr` as `identity`. Events published before the
    /// connection is up are queued.
    ///
    /// # Errors
    ///
    /// Returns [`ZerobotError::InvalidAddress`](crate::ZerobotError::InvalidAddress)
    /// if the address cannot be parsed.
    pub async fn connect(ctx: &Context, identity: impl Into<Identity>, intake_addr: &str) -> Result<Self> {
        let channel = Channel::open(ctx, identity.into(), intake_addr, Mode::Connect, Role::Addressable).await?;
        let (sender, _) = channel.split();
        Ok(Self { sender })
    }

    /// Publishes `event` as JSON under `topic`.
    ///
    /// # Errors
    ///
    /// Returns [`ZerobotError::Serialization`](crate::ZerobotError::Serialization)
    /// if `event` cannot be encoded and
    /// [`ZerobotError::Closed`](crate::ZerobotError::Closed) once closed.
    pub async fn publish<T: Serialize + ?Sized>(&self, topic: &str, event: &T) -> Result<()> {
        let payload = serde_json::to_vec(event)?;
        self.publish_raw(topic, Bytes::from(payload)).await
    }

    /// Publishes an already encoded payload under `topic`.
    ///
    /// # Errors
    ///
    /// Returns [`ZerobotError::Closed`](crate::ZerobotError::Closed) once
    /// closed.
    pub async fn publish_raw(&self, topic: &str, payload: Bytes) -> Result<()> {
        tracing::debug!(publisher = %self.sender.identity(), topic, bytes = payload.len(), "publishing event");
        self.sender
            .send(vec![Bytes::copy_from_slice(topic.as_bytes()), payload])
            .await
    }

    /// Identity of this publisher.
    #[must_use]
    pub fn identity(&self) -> &Identity {
        self.sender.identity()
    }

    /// Disconnects from the broker.
    pub fn close(&self) {
        self.sender.close();
    }
}

/// Receives events from a broker's event publish channel and dispatches
/// them to per-topic callbacks on the context's callback executor.
#[derive(Debug)]
pub struct EventSubscriber {
    sender: ChannelSender,
    registry: Arc<Mutex<SubscriptionRegistry>>,
    token: CancellationToken,
}

impl EventSubscriber {
    /// Connects to `publish_addr` as `identity`. Nothing is delivered until
    /// the first [`EventSubscriber::subscribe`].
    ///
    /// # Errors
    ///
    /// Returns [`ZerobotError::InvalidAddress`](crate::ZerobotError::InvalidAddress)
    /// if the address cannot be parsed.
    pub async fn connect(ctx: &Context, identity: impl Into<Identity>, publish_addr: &str) -> Result<Self> {
        let channel = Channel::open(ctx, identity.into(), publish_addr, Mode::Connect, Role::Broadcast).await?;
        let (sender, receiver) = channel.split();
        let registry = Arc::new(Mutex::new(SubscriptionRegistry::new()));
        let token = ctx.child_token();
        ctx.spawn(dispatch_loop(
            ctx.clone(),
            sender.identity().clone(),
            receiver,
            Arc::clone(&registry),
            token.clone(),
        ));
        Ok(Self {
            sender,
            registry,
            token,
        })
    }

    /// Calls `callback` with every event published under exactly `topic`.
    ///
    /// # Errors
    ///
    /// Returns [`ZerobotError::Closed`](crate::ZerobotError::Closed) once
    /// closed.
    pub async fn subscribe(&self, topic: &str, callback: EventCallback) -> Result<()> {
        let first = lock(&self.registry).add(topic, callback);
        if first {
            self.sender.subscribe(Bytes::copy_from_slice(topic.as_bytes())).await?;
            tracing::debug!(subscriber = %self.sender.identity(), topic, "subscribed");
        }
        Ok(())
    }

    /// Drops every callback of `topic` and its wire filter.
    ///
    /// # Errors
    ///
    /// Returns [`ZerobotError::Closed`](crate::ZerobotError::Closed) once
    /// closed.
    pub async fn unsubscribe(&self, topic: &str) -> Result<()> {
        let removed = lock(&self.registry).remove(topic);
        if removed {
            self.sender.unsubscribe(Bytes::copy_from_slice(topic.as_bytes())).await?;
            tracing::debug!(subscriber = %self.sender.identity(), topic, "unsubscribed");
        }
        Ok(())
    }

    /// Currently subscribed topics.
    #[must_use]
    pub fn topics(&self) -> Vec<String> {
        lock(&self.registry).topics()
    }

    /// Identity of this subscriber.
    #[must_use]
    pub fn identity(&self) -> &Identity {
        self.sender.identity()
    }

    /// Stops receiving events.
    pub fn close(&self) {
        self.token.cancel();
        self.sender.close();
    }
}

impl Drop for EventSubscriber {
    fn drop(&mut self) {
        self.close();
    }
}

fn lock(registry: &Mutex<SubscriptionRegistry>) -> MutexGuard<'_, SubscriptionRegistry> {
    registry.lock().unwrap_or_else(PoisonError::into_inner)
}

async fn dispatch_loop(
    ctx: Context,
    identity: Identity,
    mut receiver: ChannelReceiver,
    registry: Arc<Mutex<SubscriptionRegistry>>,
    token: CancellationToken,
) {
    loop {
        let frames = tokio::select! {
            () = token.cancelled() => break,
            frames = receiver.recv() => match frames {
                Some(frames) => frames,
                None => break,
            },
        };
        let Some(event) = Event::from_frames(frames) else {
            tracing::warn!(subscriber = %identity, "dropping malformed event");
            continue;
        };
        let callbacks = lock(&registry).callbacks(&event.topic);
        tracing::debug!(subscriber = %identity, topic = %event.topic, callbacks = callbacks.len(), "event received");
        for callback in callbacks {
            let event = event.clone();
            ctx.spawn_callback(move || callback(event));
        }
    }
    tracing::debug!(subscriber = %identity, "subscriber stopped");
}
