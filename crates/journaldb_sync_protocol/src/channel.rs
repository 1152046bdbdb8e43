//! Resumable producers and consumers over byte channels.
//!
//! Every piece of the protocol is written by a [`ChannelProducer`] and read
//! by a [`ChannelConsumer`]. Channels may be non-blocking: a `WouldBlock` or
//! `TimedOut` error means "not ready yet" and the call returns early with
//! its position saved, to be invoked again later. `Ok(0)` from a read means
//! the peer closed the channel. Any other error, `Interrupted` included, is
//! fatal.

use crate::error::{ProtocolError, ProtocolResult};
use bytes::{Buf, Bytes, BytesMut};
use std::io::{self, Read, Write};

/// Writes one protocol element, resumably.
pub trait ChannelProducer {
    /// Returns true if there is payload beyond compulsory headers.
    fn has_content(&self) -> bool;

    /// Writes as much as the channel accepts.
    ///
    /// Returns `Ok(true)` once everything has been written, `Ok(false)` if
    /// the channel stopped accepting bytes before that. Calling again after
    /// `Ok(true)` writes nothing.
    fn write(&mut self, channel: &mut dyn Write) -> ProtocolResult<bool>;
}

/// Reads one protocol element, resumably.
pub trait ChannelConsumer {
    /// Discards in-flight state so the consumer can read a new element.
    ///
    /// Data already applied to storage is kept.
    fn reset(&mut self);

    /// Reads as much as is available, up to the end of the element.
    fn read(&mut self, channel: &mut dyn Read) -> ProtocolResult<()>;

    /// Returns true once the whole element has been read.
    fn is_complete(&self) -> bool;
}

/// Returns true for errors that mean "try again later".
#[must_use]
pub fn is_not_ready(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
    )
}

/// Outgoing bytes not yet accepted by the channel.
#[derive(Debug, Default)]
pub struct OutBuffer {
    pending: Bytes,
}

impl OutBuffer {
    /// Creates a buffer holding `bytes`.
    pub fn new(bytes: impl Into<Bytes>) -> Self {
        Self {
            pending: bytes.into(),
        }
    }

    /// Replaces the pending bytes. The buffer must be drained first.
    pub fn set(&mut self, bytes: impl Into<Bytes>) {
        debug_assert!(self.pending.is_empty());
        self.pending = bytes.into();
    }

    /// Returns true if nothing is pending.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Writes pending bytes. Returns `Ok(true)` once drained.
    pub fn drain(&mut self, channel: &mut dyn Write) -> ProtocolResult<bool> {
        while !self.pending.is_empty() {
            match channel.write(&self.pending) {
                Ok(0) => return Err(ProtocolError::ChannelClosed),
                Ok(n) => self.pending.advance(n),
                Err(e) if is_not_ready(&e) => return Ok(false),
                Err(e) => return Err(e.into()),
            }
        }
        Ok(true)
    }
}

/// Collects exactly `len` incoming bytes across any number of reads.
#[derive(Debug, Default)]
pub struct InBuffer {
    filled: BytesMut,
    want: usize,
}

impl InBuffer {
    /// Creates a buffer expecting `len` bytes.
    #[must_use]
    pub fn new(len: usize) -> Self {
        Self {
            filled: BytesMut::with_capacity(len),
            want: len,
        }
    }

    /// Discards collected bytes and expects `len` new ones.
    pub fn expect(&mut self, len: usize) {
        self.filled.clear();
        self.want = len;
    }

    /// Number of bytes collected so far.
    #[must_use]
    pub fn len(&self) -> usize {
        self.filled.len()
    }

    /// Returns true if nothing has been collected.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.filled.is_empty()
    }

    /// Returns true once all expected bytes are collected.
    #[must_use]
    pub fn is_full(&self) -> bool {
        self.filled.len() >= self.want
    }

    /// Reads until full. Returns `Ok(true)` once full.
    pub fn fill(&mut self, channel: &mut dyn Read) -> ProtocolResult<bool> {
        while self.filled.len() < self.want {
            let start = self.filled.len();
            self.filled.resize(self.want, 0);
            match channel.read(&mut self.filled[start..]) {
                Ok(0) => {
                    self.filled.truncate(start);
                    return Err(ProtocolError::ChannelClosed);
                }
                Ok(n) => self.filled.truncate(start + n),
                Err(e) => {
                    self.filled.truncate(start);
                    if is_not_ready(&e) {
                        return Ok(false);
                    }
                    return Err(e.into());
                }
            }
        }
        Ok(true)
    }

    /// Returns the collected bytes.
    #[must_use]
    pub fn bytes(&self) -> &[u8] {
        &self.filled
    }

    /// Takes the collected bytes, leaving the buffer empty.
    pub fn take(&mut self) -> Bytes {
        self.filled.split().freeze()
    }
}

/// Reads whatever is available, at most `max` bytes, in a single call.
///
/// Returns `Ok(None)` if the channel is not ready.
pub fn read_some(channel: &mut dyn Read, max: usize) -> ProtocolResult<Option<Vec<u8>>> {
    let mut buf = vec![0u8; max];
    match channel.read(&mut buf) {
        Ok(0) if max > 0 => Err(ProtocolError::ChannelClosed),
        Ok(n) => {
            buf.truncate(n);
            Ok(Some(buf))
        }
        Err(e) if is_not_ready(&e) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Runs a producer to completion on a blocking channel.
///
/// # Errors
///
/// Returns an error if the producer fails or the channel reports "not
/// ready" even though it is blocking.
pub fn write_fully<P: ChannelProducer + ?Sized>(
    producer: &mut P,
    channel: &mut dyn Write,
) -> ProtocolResult<()> {
    if producer.write(channel)? {
        channel.flush()?;
        Ok(())
    } else {
        Err(io::Error::new(io::ErrorKind::TimedOut, "channel stopped accepting data").into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use journaldb_testkit::MockChannel;

    #[test]
    fn out_buffer_resumes_after_partial_writes() {
        let mut channel = MockChannel::new().with_max_write(3);
        let mut out = OutBuffer::new(b"hello world".to_vec());

        assert!(out.drain(&mut channel).unwrap());
        assert_eq!(channel.written(), b"hello world");
        assert!(out.is_empty());
    }

    #[test]
    fn out_buffer_stops_when_not_ready() {
        let mut channel = MockChannel::new().with_max_write(4).with_blocking_writes(false);
        let mut out = OutBuffer::new(b"abcdefgh".to_vec());

        assert!(!out.drain(&mut channel).unwrap());
        assert_eq!(channel.written(), b"abcd");
        assert!(out.drain(&mut channel).unwrap());
        assert_eq!(channel.written(), b"abcdefgh");
    }

    #[test]
    fn in_buffer_collects_across_reads() {
        let mut channel = MockChannel::new().with_max_read(2).with_blocking_reads(false);
        channel.feed(b"12345");

        let mut buf = InBuffer::new(5);
        let mut calls = 0;
        while !buf.fill(&mut channel).unwrap() {
            calls += 1;
            assert!(calls < 20);
        }
        assert_eq!(buf.take().as_ref(), b"12345");
        assert!(buf.is_empty());
    }

    #[test]
    fn in_buffer_reports_closed_channel() {
        let mut channel = MockChannel::new();
        channel.feed(b"12");
        channel.close();

        let mut buf = InBuffer::new(4);
        assert!(matches!(
            buf.fill(&mut channel),
            Err(ProtocolError::ChannelClosed)
        ));
        assert_eq!(buf.len(), 2);
    }

    #[test]
    fn interrupted_is_fatal() {
        let mut channel = MockChannel::new().with_read_error(io::ErrorKind::Interrupted);
        let mut buf = InBuffer::new(1);
        assert!(matches!(buf.fill(&mut channel), Err(ProtocolError::Io(_))));
    }
}
