//! In-memory byte channels with configurable readiness.
//!
//! A [`MockChannel`] reads from an incoming pipe and writes to an outgoing
//! one. Reads and writes can be capped in size and made to report
//! `WouldBlock` on every other call, which exercises the resume paths of
//! non-blocking protocol code.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::sync::Arc;

#[derive(Debug, Default)]
struct Pipe {
    data: VecDeque<u8>,
    closed: bool,
}

type SharedPipe = Arc<Mutex<Pipe>>;

/// A byte channel backed by in-memory pipes.
#[derive(Debug)]
pub struct MockChannel {
    incoming: SharedPipe,
    outgoing: SharedPipe,
    max_read: usize,
    max_write: usize,
    blocking_reads: bool,
    blocking_writes: bool,
    read_ready: bool,
    write_ready: bool,
    read_error: Option<io::ErrorKind>,
}

impl Default for MockChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl MockChannel {
    /// Creates a channel with separate, empty pipes.
    #[must_use]
    pub fn new() -> Self {
        Self::with_pipes(SharedPipe::default(), SharedPipe::default())
    }

    /// Creates two connected ends: what one writes the other reads.
    #[must_use]
    pub fn pair() -> (Self, Self) {
        let a_to_b = SharedPipe::default();
        let b_to_a = SharedPipe::default();
        (
            Self::with_pipes(b_to_a.clone(), a_to_b.clone()),
            Self::with_pipes(a_to_b, b_to_a),
        )
    }

    fn with_pipes(incoming: SharedPipe, outgoing: SharedPipe) -> Self {
        Self {
            incoming,
            outgoing,
            max_read: usize::MAX,
            max_write: usize::MAX,
            blocking_reads: true,
            blocking_writes: true,
            read_ready: false,
            write_ready: false,
            read_error: None,
        }
    }

    /// Caps each read at `max` bytes.
    #[must_use]
    pub fn with_max_read(mut self, max: usize) -> Self {
        self.max_read = max.max(1);
        self
    }

    /// Caps each write at `max` bytes.
    #[must_use]
    pub fn with_max_write(mut self, max: usize) -> Self {
        self.max_write = max.max(1);
        self
    }

    /// When false, every other read reports `WouldBlock`.
    #[must_use]
    pub fn with_blocking_reads(mut self, blocking: bool) -> Self {
        self.blocking_reads = blocking;
        self
    }

    /// When false, every other write reports `WouldBlock`.
    #[must_use]
    pub fn with_blocking_writes(mut self, blocking: bool) -> Self {
        self.blocking_writes = blocking;
        self
    }

    /// Makes the next read fail with `kind`.
    #[must_use]
    pub fn with_read_error(mut self, kind: io::ErrorKind) -> Self {
        self.read_error = Some(kind);
        self
    }

    /// Appends bytes to the incoming pipe.
    pub fn feed(&mut self, bytes: &[u8]) {
        self.incoming.lock().data.extend(bytes);
    }

    /// Closes both pipes. Reads drain what is left, then return `Ok(0)`.
    pub fn close(&mut self) {
        self.incoming.lock().closed = true;
        self.outgoing.lock().closed = true;
    }

    /// Returns a copy of the bytes written and not yet taken.
    #[must_use]
    pub fn written(&self) -> Vec<u8> {
        self.outgoing.lock().data.iter().copied().collect()
    }

    /// Takes the bytes written so far.
    pub fn take_written(&mut self) -> Vec<u8> {
        self.outgoing.lock().data.drain(..).collect()
    }

    /// Moves written bytes to the incoming pipe, so the channel reads back
    /// what it wrote.
    pub fn loopback(&mut self) {
        let written = self.take_written();
        self.feed(&written);
    }
}

impl Read for MockChannel {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if let Some(kind) = self.read_error.take() {
            return Err(io::Error::new(kind, "injected read error"));
        }
        if buf.is_empty() {
            return Ok(0);
        }
        if !self.blocking_reads {
            self.read_ready = !self.read_ready;
            if !self.read_ready {
                return Err(io::ErrorKind::WouldBlock.into());
            }
        }

        let mut pipe = self.incoming.lock();
        if pipe.data.is_empty() {
            return if pipe.closed {
                Ok(0)
            } else {
                Err(io::ErrorKind::WouldBlock.into())
            };
        }
        let n = buf.len().min(self.max_read).min(pipe.data.len());
        for (slot, byte) in buf.iter_mut().zip(pipe.data.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }
}

impl Write for MockChannel {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if !self.blocking_writes {
            self.write_ready = !self.write_ready;
            if !self.write_ready {
                return Err(io::ErrorKind::WouldBlock.into());
            }
        }

        let mut pipe = self.outgoing.lock();
        if pipe.closed {
            return Err(io::ErrorKind::BrokenPipe.into());
        }
        let n = buf.len().min(self.max_write);
        pipe.data.extend(&buf[..n]);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pair_connects_both_directions() {
        let (mut a, mut b) = MockChannel::pair();
        a.write_all(b"ping").unwrap();
        let mut buf = [0u8; 4];
        b.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"ping");

        b.write_all(b"pong").unwrap();
        a.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"pong");
    }

    #[test]
    fn empty_pipe_would_block_until_closed() {
        let mut channel = MockChannel::new();
        let mut buf = [0u8; 8];
        let err = channel.read(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);

        channel.feed(b"x");
        channel.close();
        assert_eq!(channel.read(&mut buf).unwrap(), 1);
        assert_eq!(channel.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn non_blocking_reads_alternate() {
        let mut channel = MockChannel::new()
            .with_max_read(2)
            .with_blocking_reads(false);
        channel.feed(b"abcd");
        let mut buf = [0u8; 8];
        assert_eq!(channel.read(&mut buf).unwrap(), 2);
        assert!(channel.read(&mut buf).is_err());
        assert_eq!(channel.read(&mut buf).unwrap(), 2);
    }

    #[test]
    fn injected_error_fires_once() {
        let mut channel = MockChannel::new().with_read_error(io::ErrorKind::Interrupted);
        channel.feed(b"a");
        let mut buf = [0u8; 1];
        assert_eq!(
            channel.read(&mut buf).unwrap_err().kind(),
            io::ErrorKind::Interrupted
        );
        assert_eq!(channel.read(&mut buf).unwrap(), 1);
    }
}
