//! Column deltas: the rows of one column a receiver is missing.
//!
//! Wire layout, all integers big-endian:
//!
//! ```text
//! [u64 rows][u64 data_len][data_len bytes of column data][rows x u64 value length]
//! ```
//!
//! The trailing lengths are only present for variable-width columns. The
//! header is always written, so an empty delta costs sixteen bytes.

use crate::channel::{read_some, ChannelConsumer, ChannelProducer, InBuffer, OutBuffer};
use crate::error::{ProtocolError, ProtocolResult};
use bytes::{Buf, BufMut, BytesMut};
use journaldb_storage::{SharedColumn, StorageError};
use std::io::{Read, Write};

const HEADER_LEN: usize = 16;
const LENGTH_LEN: usize = 8;

/// Default size of the chunks a producer reads from storage at a time.
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

fn storage(source: StorageError) -> ProtocolError {
    ProtocolError::storage("column delta", source)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Header,
    Data,
    Lengths,
    Done,
}

/// Streams rows `[receiver_rows, sender_rows)` of a column.
pub struct ColumnDeltaProducer {
    column: SharedColumn,
    variable: bool,
    chunk_size: usize,
    from_row: u64,
    to_row: u64,
    data_end: u64,
    data_cursor: u64,
    length_cursor: u64,
    out: OutBuffer,
    stage: Stage,
}

impl ColumnDeltaProducer {
    /// Creates a producer reading `column` in chunks of `chunk_size` bytes.
    pub fn new(column: SharedColumn, chunk_size: usize) -> Self {
        let variable = column.read().width().is_none();
        Self {
            column,
            variable,
            chunk_size: chunk_size.max(LENGTH_LEN),
            from_row: 0,
            to_row: 0,
            data_end: 0,
            data_cursor: 0,
            length_cursor: 0,
            out: OutBuffer::default(),
            stage: Stage::Done,
        }
    }

    /// Sets up the delta for a receiver holding `receiver_rows` rows while
    /// the sender holds `sender_rows` committed rows.
    ///
    /// When the receiver is not behind, the delta is empty but still has a
    /// header.
    pub fn configure(&mut self, receiver_rows: u64, sender_rows: u64) -> ProtocolResult<()> {
        let (from_row, to_row, data_start, data_end) = if sender_rows > receiver_rows {
            let column = self.column.read();
            (
                receiver_rows,
                sender_rows,
                column.data_offset(receiver_rows).map_err(storage)?,
                column.data_offset(sender_rows).map_err(storage)?,
            )
        } else {
            (0, 0, 0, 0)
        };

        let mut header = BytesMut::with_capacity(HEADER_LEN);
        header.put_u64(to_row - from_row);
        header.put_u64(data_end - data_start);

        self.from_row = from_row;
        self.to_row = to_row;
        self.data_end = data_end;
        self.data_cursor = data_start;
        self.length_cursor = from_row;
        self.out = OutBuffer::new(header.freeze());
        self.stage = Stage::Data;
        Ok(())
    }

    /// A column delta always writes its header.
    #[must_use]
    pub fn has_frame(&self) -> bool {
        true
    }

    /// Rows the delta carries.
    #[must_use]
    pub fn rows(&self) -> u64 {
        self.to_row - self.from_row
    }

    fn next_chunk(&mut self) -> ProtocolResult<bool> {
        match self.stage {
            Stage::Header | Stage::Done => Ok(false),
            Stage::Data => {
                if self.data_cursor < self.data_end {
                    let len = (self.data_end - self.data_cursor).min(self.chunk_size as u64);
                    let bytes = self
                        .column
                        .read()
                        .read_range(self.data_cursor, len as usize)
                        .map_err(storage)?;
                    self.data_cursor += len;
                    self.out.set(bytes);
                } else {
                    self.stage = if self.variable {
                        Stage::Lengths
                    } else {
                        Stage::Done
                    };
                }
                Ok(true)
            }
            Stage::Lengths => {
                if self.length_cursor < self.to_row {
                    let per_chunk = (self.chunk_size / LENGTH_LEN) as u64;
                    let end = (self.length_cursor + per_chunk).min(self.to_row);
                    let lengths = self
                        .column
                        .read()
                        .value_lengths(self.length_cursor, end)
                        .map_err(storage)?;
                    let mut buf = BytesMut::with_capacity(lengths.len() * LENGTH_LEN);
                    for len in lengths {
                        buf.put_u64(len);
                    }
                    self.length_cursor = end;
                    self.out.set(buf.freeze());
                } else {
                    self.stage = Stage::Done;
                }
                Ok(true)
            }
        }
    }
}

impl ChannelProducer for ColumnDeltaProducer {
    fn has_content(&self) -> bool {
        self.to_row > self.from_row
    }

    fn write(&mut self, channel: &mut dyn Write) -> ProtocolResult<bool> {
        loop {
            if !self.out.drain(channel)? {
                return Ok(false);
            }
            if !self.next_chunk()? {
                return Ok(true);
            }
        }
    }
}

/// Applies a column delta to a local column.
///
/// Fixed-width data is appended in whole elements only; a partial element
/// waits for the rest of its bytes. Variable-width data is appended raw and
/// becomes visible only when its lengths arrive and are indexed.
pub struct ColumnDeltaConsumer {
    column: SharedColumn,
    width: Option<usize>,
    buffer_size: usize,
    discard: bool,
    header: InBuffer,
    rows: u64,
    data_len: u64,
    data_read: u64,
    lengths_read: u64,
    tail: BytesMut,
    stage: Stage,
}

impl ColumnDeltaConsumer {
    /// Creates a consumer writing into `column`, reading at most
    /// `buffer_size` bytes from the channel at a time.
    pub fn new(column: SharedColumn, buffer_size: usize) -> Self {
        let width = column.read().width();
        Self {
            column,
            width,
            buffer_size: buffer_size.max(LENGTH_LEN),
            discard: false,
            header: InBuffer::new(HEADER_LEN),
            rows: 0,
            data_len: 0,
            data_read: 0,
            lengths_read: 0,
            tail: BytesMut::new(),
            stage: Stage::Header,
        }
    }

    /// Reads the delta without applying it. Used for deltas the receiver
    /// already holds.
    pub fn set_discard(&mut self, discard: bool) {
        self.discard = discard;
    }

    /// Rows announced by the delta header, once read.
    #[must_use]
    pub fn rows(&self) -> u64 {
        self.rows
    }

    fn read_header(&mut self, channel: &mut dyn Read) -> ProtocolResult<bool> {
        if !self.header.fill(channel)? {
            return Ok(false);
        }
        let mut header = self.header.take();
        self.rows = header.get_u64();
        self.data_len = header.get_u64();
        if let Some(width) = self.width {
            if self.rows.checked_mul(width as u64) != Some(self.data_len) {
                return Err(ProtocolError::malformed(format!(
                    "{} rows of width {width} cannot span {} bytes",
                    self.rows, self.data_len
                )));
            }
        } else if self.rows.checked_mul(LENGTH_LEN as u64).is_none() {
            return Err(ProtocolError::malformed(format!(
                "{} rows overflow the length section",
                self.rows
            )));
        }
        if !self.discard {
            let mut column = self.column.write();
            let size = column.size().map_err(storage)?;
            column.truncate(size).map_err(storage)?;
        }
        self.stage = Stage::Data;
        Ok(true)
    }

    fn read_data(&mut self, channel: &mut dyn Read) -> ProtocolResult<bool> {
        while self.data_read < self.data_len {
            let want = (self.data_len - self.data_read).min(self.buffer_size as u64) as usize;
            let Some(bytes) = read_some(channel, want)? else {
                return Ok(false);
            };
            self.data_read += bytes.len() as u64;
            if self.discard {
                continue;
            }
            match self.width {
                Some(width) => {
                    self.tail.extend_from_slice(&bytes);
                    let whole = self.tail.len() - self.tail.len() % width;
                    if whole > 0 {
                        let chunk = self.tail.split_to(whole);
                        self.column.write().append_range(&chunk).map_err(storage)?;
                    }
                }
                None => self.column.write().append_range(&bytes).map_err(storage)?,
            }
        }
        self.stage = if self.width.is_none() {
            Stage::Lengths
        } else {
            Stage::Done
        };
        Ok(true)
    }

    fn read_lengths(&mut self, channel: &mut dyn Read) -> ProtocolResult<bool> {
        while self.lengths_read < self.rows {
            let remaining = (self.rows - self.lengths_read) * LENGTH_LEN as u64
                - self.tail.len() as u64;
            let want = remaining.min(self.buffer_size as u64) as usize;
            let Some(bytes) = read_some(channel, want)? else {
                return Ok(false);
            };
            self.tail.extend_from_slice(&bytes);

            let whole = self.tail.len() / LENGTH_LEN;
            if whole == 0 {
                continue;
            }
            let mut chunk = self.tail.split_to(whole * LENGTH_LEN);
            self.lengths_read += whole as u64;
            if self.discard {
                continue;
            }
            let mut lengths = Vec::with_capacity(whole);
            while chunk.has_remaining() {
                lengths.push(chunk.get_u64());
            }
            self.column
                .write()
                .append_lengths(&lengths)
                .map_err(storage)?;
        }
        self.stage = Stage::Done;
        Ok(true)
    }
}

impl ChannelConsumer for ColumnDeltaConsumer {
    fn reset(&mut self) {
        self.header.expect(HEADER_LEN);
        self.rows = 0;
        self.data_len = 0;
        self.data_read = 0;
        self.lengths_read = 0;
        self.tail.clear();
        self.stage = Stage::Header;
    }

    fn read(&mut self, channel: &mut dyn Read) -> ProtocolResult<()> {
        loop {
            let advanced = match self.stage {
                Stage::Header => self.read_header(channel)?,
                Stage::Data => self.read_data(channel)?,
                Stage::Lengths => self.read_lengths(channel)?,
                Stage::Done => return Ok(()),
            };
            if !advanced {
                return Ok(());
            }
        }
    }

    fn is_complete(&self) -> bool {
        self.stage == Stage::Done
    }
}
