//! Multipart frame codec.
//!
//! Wire format of one message:
//! ```text
//! [u32 BE: frame_count] ( [u32 BE: frame_len] [frame bytes] ) * frame_count
//! ```
//!
//! Decoding is zero-copy: every returned frame is a slice of the receive
//! buffer.

use std::io;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use super::Frames;

/// Maximum number of frames in one message.
pub const MAX_FRAMES: usize = 64;

/// Maximum size of a single frame (16 MiB).
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

const LEN_PREFIX: usize = 4;

/// Length-prefixed multipart codec used on every channel connection.
#[derive(Debug, Clone, Copy, Default)]
pub struct MultipartCodec;

impl MultipartCodec {
    /// Creates a new codec.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

fn read_len(src: &[u8], at: usize) -> Option<usize> {
    let raw = src.get(at..at.checked_add(LEN_PREFIX)?)?;
    let raw: [u8; LEN_PREFIX] = raw.try_into().ok()?;
    usize::try_from(u32::from_be_bytes(raw)).ok()
}

fn invalid(msg: String) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg)
}

impl Decoder for MultipartCodec {
    type Item = Frames;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let Some(count) = read_len(src, 0) else {
            return Ok(None);
        };
        if count == 0 || count > MAX_FRAMES {
            return Err(invalid(format!("bad frame count: {count}")));
        }

        // Walk the length prefixes first so nothing is consumed until the
        // whole message is buffered.
        let mut end = LEN_PREFIX;
        for _ in 0..count {
            let Some(len) = read_len(src, end) else {
                src.reserve(LEN_PREFIX);
                return Ok(None);
            };
            if len > MAX_FRAME_LEN {
                return Err(invalid(format!("frame too large: {len} bytes")));
            }
            end += LEN_PREFIX + len;
            if src.len() < end {
                src.reserve(end - src.len());
                return Ok(None);
            }
        }

        let mut message = src.split_to(end);
        message.advance(LEN_PREFIX);
        let mut frames = Vec::with_capacity(count);
        for _ in 0..count {
            let len = message.get_u32() as usize;
            frames.push(message.split_to(len).freeze());
        }
        Ok(Some(frames))
    }
}

impl Encoder<Frames> for MultipartCodec {
    type Error = io::Error;

    fn encode(&mut self, frames: Frames, dst: &mut BytesMut) -> Result<(), Self::Error> {
        if frames.is_empty() || frames.len() > MAX_FRAMES {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("bad frame count: {}", frames.len()),
            ));
        }
        let mut total = LEN_PREFIX;
        for frame in &frames {
            if frame.len() > MAX_FRAME_LEN {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("frame too large: {} bytes", frame.len()),
                ));
            }
            total += LEN_PREFIX + frame.len();
        }
        dst.reserve(total);
        // Bounds checked above, both fit in u32.
        dst.put_u32(frames.len() as u32);
        for frame in frames {
            dst.put_u32(frame.len() as u32);
            dst.put_slice(&frame);
        }
        Ok(())
    }
}

/// Builds a frame list from anything convertible to [`Bytes`].
pub fn frames<I, B>(parts: I) -> Frames
where
    I: IntoIterator<Item = B>,
    B: Into<Bytes>,
{
    parts.into_iter().map(Into::into).collect()
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use super::*;

    fn msg(parts: &[&'static [u8]]) -> Frames {
        parts.iter().copied().map(Bytes::from_static).collect()
    }

    fn encoded(parts: Frames) -> BytesMut {
        let mut buf = BytesMut::new();
        let Ok(()) = MultipartCodec.encode(parts, &mut buf) else {
            panic!("encode failed");
        };
        buf
    }

    #[test]
    fn decodes_complete_message() {
        let mut buf = encoded(msg(&[b"to", b"from", b"{}"]));
        let Ok(Some(decoded)) = MultipartCodec.decode(&mut buf) else {
            panic!("expected a message");
        };
        assert_eq!(decoded, msg(&[b"to", b"from", b"{}"]));
        assert!(buf.is_empty());
    }

    #[test]
    fn waits_for_partial_message() {
        let full = encoded(msg(&[b"alpha", b"beta"]));
        let mut partial = BytesMut::from(full.get(..full.len() - 2).unwrap_or_default());
        let Ok(None) = MultipartCodec.decode(&mut partial) else {
            panic!("partial input must not yield a message");
        };
        // nothing consumed yet
        assert_eq!(partial.len(), full.len() - 2);
        partial.extend_from_slice(full.get(full.len() - 2..).unwrap_or_default());
        let Ok(Some(decoded)) = MultipartCodec.decode(&mut partial) else {
            panic!("expected a message once complete");
        };
        assert_eq!(decoded.len(), 2);
    }

    #[test]
    fn decodes_back_to_back_messages() {
        let mut buf = encoded(msg(&[b"a"]));
        buf.extend_from_slice(&encoded(msg(&[b"b", b""])));
        let Ok(Some(first)) = MultipartCodec.decode(&mut buf) else {
            panic!("first message");
        };
        let Ok(Some(second)) = MultipartCodec.decode(&mut buf) else {
            panic!("second message");
        };
        assert_eq!(first, msg(&[b"a"]));
        assert_eq!(second, msg(&[b"b", b""]));
    }

    #[test]
    fn rejects_zero_and_excess_frame_counts() {
        let mut buf = BytesMut::new();
        buf.put_u32(0);
        assert!(MultipartCodec.decode(&mut buf).is_err());

        let mut buf = BytesMut::new();
        buf.put_u32((MAX_FRAMES + 1) as u32);
        assert!(MultipartCodec.decode(&mut buf).is_err());

        assert!(MultipartCodec.encode(Vec::new(), &mut BytesMut::new()).is_err());
    }

    #[test]
    fn rejects_oversized_frame_header() {
        let mut buf = BytesMut::new();
        buf.put_u32(1);
        buf.put_u32((MAX_FRAME_LEN + 1) as u32);
        assert!(MultipartCodec.decode(&mut buf).is_err());
    }
}
