//! Envelope parsing for the broker.
//!
//! An addressable bind channel delivers `[from, frames...]`. The broker
//! accepts these shapes:
//!
//! | Frames | Layout                      | Recipient                       |
//! |--------|-----------------------------|---------------------------------|
//! | 2      | `[from, payload]`           | suffix of `from` (legacy, opt-in) |
//! | 3      | `[from, to, payload]`       | `to`                            |
//! | 4      | `[from, _, to, payload]`    | `to`                            |
//!
//! Anything else is a protocol error.

use bytes::Bytes;

use crate::error::{Result, ZerobotError};
use crate::transport::Frames;

/// Separator of the legacy identity suffix convention.
const LEGACY_SEPARATOR: u8 = b'-';

/// A routable envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    /// Identity of the sender.
    pub from: Bytes,
    /// Identity of the recipient.
    pub to: Bytes,
    /// Opaque payload.
    pub payload: Bytes,
}

impl Route {
    /// Frames handed to the opposite group's channel: `[to, from, payload]`.
    #[must_use]
    pub fn forward_frames(&self) -> Frames {
        vec![self.to.clone(), self.from.clone(), self.payload.clone()]
    }

    /// Frames published for observers: `[from, to, payload]`.
    #[must_use]
    pub fn mirror_frames(&self) -> Frames {
        vec![self.from.clone(), self.to.clone(), self.payload.clone()]
    }
}

/// Parses an inbound envelope.
///
/// # Errors
///
/// Returns [`ZerobotError::Protocol`] for unsupported shapes, including the
/// 2-frame form when `legacy_suffix` is off.
pub fn parse_envelope(frames: Frames, legacy_suffix: bool) -> Result<Route> {
    let count = frames.len();
    let mut frames = frames.into_iter();
    let (from, to, payload) = match (count, frames.next(), frames.next(), frames.next(), frames.next()) {
        (2, Some(from), Some(payload), None, None) => {
            if !legacy_suffix {
                return Err(ZerobotError::Protocol(
                    "2-frame envelope without recipient (legacy suffix routing is off)".to_string(),
                ));
            }
            let to = legacy_recipient(&from)?;
            (from, to, payload)
        }
        (3, Some(from), Some(to), Some(payload), None) => (from, to, payload),
        (4, Some(from), Some(_), Some(to), Some(payload)) => (from, to, payload),
        _ => {
            return Err(ZerobotError::Protocol(format!(
                "unsupported envelope of {count} frames"
            )));
        }
    };
    if to.is_empty() {
        return Err(ZerobotError::Protocol("empty recipient".to_string()));
    }
    Ok(Route { from, to, payload })
}

/// Recipient under the legacy convention: the text after the last `-` of
/// the sender identity, or the whole identity if it has none.
///
/// # Errors
///
/// Returns [`ZerobotError::Protocol`] if the suffix is empty.
pub fn legacy_recipient(from: &Bytes) -> Result<Bytes> {
    let start = from
        .iter()
        .rposition(|b| *b == LEGACY_SEPARATOR)
        .map_or(0, |pos| pos + 1);
    let to = from.slice(start..);
    if to.is_empty() {
        return Err(ZerobotError::Protocol(
            "sender identity has an empty suffix".to_string(),
        ));
    }
    Ok(to)
}

/// An event taken from the intake channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventEnvelope {
    /// Identity of the publisher.
    pub from: Bytes,
    /// Topic key.
    pub topic: Bytes,
    /// Serialized event.
    pub payload: Bytes,
}

impl EventEnvelope {
    /// Frames republished to subscribers: `[topic, from, payload]`.
    #[must_use]
    pub fn publish_frames(&self) -> Frames {
        vec![self.topic.clone(), self.from.clone(), self.payload.clone()]
    }

    /// Frames mirrored for observers: `[from, topic, payload]`.
    #[must_use]
    pub fn mirror_frames(&self) -> Frames {
        vec![self.from.clone(), self.topic.clone(), self.payload.clone()]
    }
}

/// Parses `[from, topic, payload]` from the event intake.
///
/// # Errors
///
/// Returns [`ZerobotError::Protocol`] for any other shape.
pub fn parse_event(frames: Frames) -> Result<EventEnvelope> {
    let count = frames.len();
    let mut frames = frames.into_iter();
    match (frames.next(), frames.next(), frames.next(), frames.next()) {
        (Some(from), Some(topic), Some(payload), None) => Ok(EventEnvelope {
            from,
            topic,
            payload,
        }),
        _ => Err(ZerobotError::Protocol(format!(
            "event envelope must have 3 frames, got {count}"
        ))),
    }
}
