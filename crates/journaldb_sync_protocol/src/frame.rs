//! Length-prefixed frames and the fixed responses built on them.
//!
//! A frame is a big-endian `u32` length followed by that many bytes. String
//! responses are frames of UTF-8 text; int responses are a bare big-endian
//! `i32`.

use crate::channel::{ChannelConsumer, ChannelProducer, InBuffer, OutBuffer};
use crate::error::{ProtocolError, ProtocolResult};
use bytes::{BufMut, Bytes, BytesMut};
use std::io::{Read, Write};

/// Largest payload a frame may carry.
pub const MAX_FRAME_LENGTH: u32 = 16 * 1024 * 1024;

const LENGTH_LEN: usize = 4;

/// The string response accepting a request.
pub const OK: &str = "OK";

/// Writes one frame.
#[derive(Debug)]
pub struct FrameProducer {
    out: OutBuffer,
    empty: bool,
}

impl FrameProducer {
    /// Creates a producer for `payload`.
    ///
    /// # Errors
    ///
    /// Returns `FrameTooLong` if the payload exceeds [`MAX_FRAME_LENGTH`].
    pub fn new(payload: &[u8]) -> ProtocolResult<Self> {
        let len = u32::try_from(payload.len())
            .ok()
            .filter(|len| *len <= MAX_FRAME_LENGTH)
            .ok_or(ProtocolError::FrameTooLong {
                found: payload.len() as u64,
                max: MAX_FRAME_LENGTH,
            })?;
        let mut buf = BytesMut::with_capacity(LENGTH_LEN + payload.len());
        buf.put_u32(len);
        buf.put_slice(payload);
        Ok(Self {
            out: OutBuffer::new(buf.freeze()),
            empty: payload.is_empty(),
        })
    }
}

impl ChannelProducer for FrameProducer {
    fn has_content(&self) -> bool {
        !self.empty
    }

    fn write(&mut self, channel: &mut dyn Write) -> ProtocolResult<bool> {
        self.out.drain(channel)
    }
}

/// Reads one frame.
#[derive(Debug)]
pub struct FrameConsumer {
    length: InBuffer,
    payload: Option<InBuffer>,
    complete: bool,
}

impl Default for FrameConsumer {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameConsumer {
    /// Creates a consumer.
    #[must_use]
    pub fn new() -> Self {
        Self {
            length: InBuffer::new(LENGTH_LEN),
            payload: None,
            complete: false,
        }
    }

    /// Returns the payload once complete.
    #[must_use]
    pub fn payload(&self) -> Option<&[u8]> {
        if self.complete {
            self.payload.as_ref().map(InBuffer::bytes)
        } else {
            None
        }
    }

    /// Takes the payload once complete.
    pub fn take_payload(&mut self) -> Option<Bytes> {
        if self.complete {
            self.payload.as_mut().map(InBuffer::take)
        } else {
            None
        }
    }
}

impl ChannelConsumer for FrameConsumer {
    fn reset(&mut self) {
        self.length.expect(LENGTH_LEN);
        self.payload = None;
        self.complete = false;
    }

    fn read(&mut self, channel: &mut dyn Read) -> ProtocolResult<()> {
        if self.complete {
            return Ok(());
        }
        if self.payload.is_none() {
            if !self.length.fill(channel)? {
                return Ok(());
            }
            let b = self.length.bytes();
            let len = u32::from_be_bytes([b[0], b[1], b[2], b[3]]);
            if len > MAX_FRAME_LENGTH {
                return Err(ProtocolError::FrameTooLong {
                    found: u64::from(len),
                    max: MAX_FRAME_LENGTH,
                });
            }
            self.payload = Some(InBuffer::new(len as usize));
        }
        if let Some(payload) = self.payload.as_mut() {
            self.complete = payload.fill(channel)?;
        }
        Ok(())
    }

    fn is_complete(&self) -> bool {
        self.complete
    }
}

/// Writes a string response frame.
#[derive(Debug)]
pub struct StringResponseProducer {
    frame: FrameProducer,
}

impl StringResponseProducer {
    /// Creates a producer for `text`.
    ///
    /// # Errors
    ///
    /// Returns `FrameTooLong` if the text is too long for one frame.
    pub fn new(text: &str) -> ProtocolResult<Self> {
        Ok(Self {
            frame: FrameProducer::new(text.as_bytes())?,
        })
    }
}

impl ChannelProducer for StringResponseProducer {
    fn has_content(&self) -> bool {
        self.frame.has_content()
    }

    fn write(&mut self, channel: &mut dyn Write) -> ProtocolResult<bool> {
        self.frame.write(channel)
    }
}

/// Reads a string response frame.
#[derive(Debug, Default)]
pub struct StringResponseConsumer {
    frame: FrameConsumer,
}

impl StringResponseConsumer {
    /// Creates a consumer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the text once complete.
    ///
    /// # Errors
    ///
    /// Returns `Malformed` if the payload is not UTF-8.
    pub fn value(&self) -> ProtocolResult<Option<String>> {
        self.frame
            .payload()
            .map(|p| {
                String::from_utf8(p.to_vec())
                    .map_err(|_| ProtocolError::malformed("string response is not UTF-8"))
            })
            .transpose()
    }
}

impl ChannelConsumer for StringResponseConsumer {
    fn reset(&mut self) {
        self.frame.reset();
    }

    fn read(&mut self, channel: &mut dyn Read) -> ProtocolResult<()> {
        self.frame.read(channel)
    }

    fn is_complete(&self) -> bool {
        self.frame.is_complete()
    }
}

/// Writes a four-byte int response.
#[derive(Debug)]
pub struct IntResponseProducer {
    out: OutBuffer,
}

impl IntResponseProducer {
    /// Creates a producer for `value`.
    #[must_use]
    pub fn new(value: i32) -> Self {
        Self {
            out: OutBuffer::new(value.to_be_bytes().to_vec()),
        }
    }
}

impl ChannelProducer for IntResponseProducer {
    fn has_content(&self) -> bool {
        true
    }

    fn write(&mut self, channel: &mut dyn Write) -> ProtocolResult<bool> {
        self.out.drain(channel)
    }
}

/// Reads a four-byte int response.
#[derive(Debug)]
pub struct IntResponseConsumer {
    buf: InBuffer,
}

impl Default for IntResponseConsumer {
    fn default() -> Self {
        Self::new()
    }
}

impl IntResponseConsumer {
    /// Creates a consumer.
    #[must_use]
    pub fn new() -> Self {
        Self {
            buf: InBuffer::new(4),
        }
    }

    /// Returns the value once complete.
    #[must_use]
    pub fn value(&self) -> Option<i32> {
        self.buf.is_full().then(|| {
            let b = self.buf.bytes();
            i32::from_be_bytes([b[0], b[1], b[2], b[3]])
        })
    }
}

impl ChannelConsumer for IntResponseConsumer {
    fn reset(&mut self) {
        self.buf.expect(4);
    }

    fn read(&mut self, channel: &mut dyn Read) -> ProtocolResult<()> {
        self.buf.fill(channel)?;
        Ok(())
    }

    fn is_complete(&self) -> bool {
        self.buf.is_full()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use journaldb_testkit::MockChannel;

    #[test]
    fn string_response_survives_tiny_reads() {
        let mut channel = MockChannel::new().with_max_read(1).with_max_write(3);
        StringResponseProducer::new("Not Exported")
            .unwrap()
            .write(&mut channel)
            .unwrap();
        channel.loopback();

        let mut consumer = StringResponseConsumer::new();
        consumer.read(&mut channel).unwrap();
        assert!(consumer.is_complete());
        assert_eq!(consumer.value().unwrap().as_deref(), Some("Not Exported"));
    }

    #[test]
    fn int_response_is_big_endian() {
        let mut channel = MockChannel::new();
        IntResponseProducer::new(258).write(&mut channel).unwrap();
        assert_eq!(channel.written(), vec![0, 0, 1, 2]);

        channel.loopback();
        let mut consumer = IntResponseConsumer::new();
        assert_eq!(consumer.value(), None);
        consumer.read(&mut channel).unwrap();
        assert_eq!(consumer.value(), Some(258));
    }

    #[test]
    fn oversized_length_rejected() {
        let mut channel = MockChannel::new();
        channel.feed(&(MAX_FRAME_LENGTH + 1).to_be_bytes());

        let err = FrameConsumer::new().read(&mut channel).unwrap_err();
        assert!(matches!(err, ProtocolError::FrameTooLong { .. }));
    }

    #[test]
    fn empty_frame_completes() {
        let mut channel = MockChannel::new();
        let mut producer = FrameProducer::new(&[]).unwrap();
        assert!(!producer.has_content());
        producer.write(&mut channel).unwrap();
        channel.loopback();

        let mut consumer = FrameConsumer::new();
        consumer.read(&mut channel).unwrap();
        assert_eq!(consumer.payload(), Some(&[][..]));
        consumer.reset();
        assert!(!consumer.is_complete());
    }
}
