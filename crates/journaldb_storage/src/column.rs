//! Append-only columns over byte stores.
//!
//! A fixed-width column is a flat array of `width`-byte elements. A
//! variable-width column keeps its values back to back in a data store and
//! an index of little-endian `u64` end offsets, one per row, in a second
//! store. Row `n` of a variable column occupies
//! `[end(n - 1), end(n))` of the data store.
//!
//! The replication codecs move raw data bytes between peers, so the
//! interface here speaks in byte offsets for data and in rows for
//! everything else.

use crate::backend::StorageBackend;
use crate::error::{StorageError, StorageResult};
use crate::memory::InMemoryBackend;
use crate::schema::ColumnType;
use parking_lot::RwLock;
use std::sync::Arc;

/// Width of one entry in a variable column's index.
pub const INDEX_ENTRY_WIDTH: usize = 8;

/// A column shared between the writer and replication readers.
pub type SharedColumn = Arc<RwLock<Column>>;

/// A column of fixed-width elements.
pub struct FixedColumn {
    backend: Box<dyn StorageBackend>,
    width: usize,
}

impl FixedColumn {
    /// Wraps `backend` as a column of `width`-byte elements.
    ///
    /// A trailing partial element, left by an interrupted write, is cut off.
    ///
    /// # Errors
    ///
    /// Returns an error if `width` is zero or the backend fails.
    pub fn new(mut backend: Box<dyn StorageBackend>, width: usize) -> StorageResult<Self> {
        if width == 0 {
            return Err(StorageError::schema("column width must be positive"));
        }
        let size = backend.size()?;
        let whole = size - size % width as u64;
        if whole != size {
            backend.truncate(whole)?;
        }
        Ok(Self { backend, width })
    }

    /// Element width in bytes.
    #[must_use]
    pub fn width(&self) -> usize {
        self.width
    }

    /// Number of elements.
    pub fn size(&self) -> StorageResult<u64> {
        Ok(self.backend.size()? / self.width as u64)
    }

    /// Reads element `row`.
    pub fn element(&self, row: u64) -> StorageResult<Vec<u8>> {
        self.backend.read_at(row * self.width as u64, self.width)
    }

    /// Reads raw bytes.
    pub fn read_bytes(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>> {
        self.backend.read_at(offset, len)
    }

    /// Appends whole elements.
    pub fn append_bytes(&mut self, bytes: &[u8]) -> StorageResult<()> {
        if bytes.len() % self.width != 0 {
            return Err(StorageError::corrupted(format!(
                "{} bytes is not a whole number of {}-byte elements",
                bytes.len(),
                self.width
            )));
        }
        self.backend.append(bytes)?;
        Ok(())
    }

    /// Reads element `row` as a little-endian `u64`.
    fn read_u64(&self, row: u64) -> StorageResult<u64> {
        let bytes = self.element(row)?;
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&bytes[..8]);
        Ok(u64::from_le_bytes(buf))
    }

    /// Cuts the column back to `rows` elements.
    pub fn truncate(&mut self, rows: u64) -> StorageResult<()> {
        self.backend.truncate(rows * self.width as u64)
    }

    fn flush(&mut self) -> StorageResult<()> {
        self.backend.flush()
    }

    fn sync(&mut self) -> StorageResult<()> {
        self.backend.sync()
    }
}

/// A column of variable-length values.
pub struct VarColumn {
    data: Box<dyn StorageBackend>,
    index: FixedColumn,
}

impl VarColumn {
    /// Creates a column from its data and index stores.
    ///
    /// # Errors
    ///
    /// Returns an error if the stores cannot be read.
    pub fn new(
        data: Box<dyn StorageBackend>,
        index: Box<dyn StorageBackend>,
    ) -> StorageResult<Self> {
        let mut column = Self {
            data,
            index: FixedColumn::new(index, INDEX_ENTRY_WIDTH)?,
        };
        let data_size = column.data.size()?;
        let mut rows = column.index.size()?;
        while rows > 0 && column.data_offset(rows)? > data_size {
            rows -= 1;
        }
        column.index.truncate(rows)?;
        column.trim_orphans()?;
        Ok(column)
    }

    /// Number of values.
    pub fn size(&self) -> StorageResult<u64> {
        self.index.size()
    }

    /// Byte offset in the data store where row `rows` starts.
    pub fn data_offset(&self, rows: u64) -> StorageResult<u64> {
        if rows == 0 {
            Ok(0)
        } else {
            self.index.read_u64(rows - 1)
        }
    }

    /// Reads value `row`.
    pub fn value(&self, row: u64) -> StorageResult<Vec<u8>> {
        let start = self.data_offset(row)?;
        let end = self.index.read_u64(row)?;
        let len = end
            .checked_sub(start)
            .ok_or_else(|| StorageError::corrupted(format!("index of row {row} goes backwards")))?;
        self.data.read_at(start, len as usize)
    }

    /// Appends one value.
    pub fn append_value(&mut self, value: &[u8]) -> StorageResult<()> {
        self.trim_orphans()?;
        let offset = self.data.append(value)?;
        self.index
            .append_bytes(&(offset + value.len() as u64).to_le_bytes())
    }

    /// Lengths of values `[from, to)`.
    pub fn value_lengths(&self, from: u64, to: u64) -> StorageResult<Vec<u64>> {
        let mut lengths = Vec::with_capacity(to.saturating_sub(from) as usize);
        let mut start = self.data_offset(from)?;
        for row in from..to {
            let end = self.index.read_u64(row)?;
            lengths.push(end.saturating_sub(start));
            start = end;
        }
        Ok(lengths)
    }

    /// Appends index entries for values whose bytes are already in the
    /// data store.
    pub fn append_lengths(&mut self, lengths: &[u64]) -> StorageResult<()> {
        if lengths.is_empty() {
            return Ok(());
        }
        let start = self.data_offset(self.size()?)?;
        let data_size = self.data.size()?;
        let mut end = start;
        let mut entries = Vec::with_capacity(lengths.len() * INDEX_ENTRY_WIDTH);
        for len in lengths {
            end += len;
            entries.extend_from_slice(&end.to_le_bytes());
        }
        if end > data_size {
            return Err(StorageError::corrupted(format!(
                "index end {end} beyond data size {data_size}"
            )));
        }
        self.index.append_bytes(&entries)
    }

    /// Drops data bytes not covered by the index.
    pub fn trim_orphans(&mut self) -> StorageResult<()> {
        let end = self.data_offset(self.size()?)?;
        let size = self.data.size()?;
        if size > end {
            self.data.truncate(end)?;
        }
        Ok(())
    }

    /// Cuts the column back to `rows` values.
    pub fn truncate(&mut self, rows: u64) -> StorageResult<()> {
        let end = self.data_offset(rows)?;
        self.index.truncate(rows)?;
        self.data.truncate(end)
    }

    /// Flushes both stores.
    pub fn flush(&mut self) -> StorageResult<()> {
        self.data.flush()?;
        self.index.flush()
    }

    fn sync(&mut self) -> StorageResult<()> {
        self.data.sync()?;
        self.index.sync()
    }
}

/// A column of either kind.
pub enum Column {
    /// Fixed-width elements.
    Fixed(FixedColumn),
    /// Variable-width values.
    Variable(VarColumn),
}

impl Column {
    /// Creates an in-memory column for `column_type`.
    #[must_use]
    pub fn in_memory(column_type: ColumnType) -> Self {
        match column_type.fixed_width() {
            Some(width) => Self::Fixed(FixedColumn {
                backend: Box::new(InMemoryBackend::new()),
                width,
            }),
            None => Self::Variable(VarColumn {
                data: Box::new(InMemoryBackend::new()),
                index: FixedColumn {
                    backend: Box::new(InMemoryBackend::new()),
                    width: INDEX_ENTRY_WIDTH,
                },
            }),
        }
    }

    /// Wraps the column in a lock for sharing.
    #[must_use]
    pub fn shared(self) -> SharedColumn {
        Arc::new(RwLock::new(self))
    }

    /// Element width, or `None` for variable columns.
    #[must_use]
    pub fn width(&self) -> Option<usize> {
        match self {
            Self::Fixed(c) => Some(c.width()),
            Self::Variable(_) => None,
        }
    }

    /// Number of rows.
    pub fn size(&self) -> StorageResult<u64> {
        match self {
            Self::Fixed(c) => c.size(),
            Self::Variable(c) => c.size(),
        }
    }

    /// Byte offset in the data store where row `rows` starts.
    pub fn data_offset(&self, rows: u64) -> StorageResult<u64> {
        match self {
            Self::Fixed(c) => Ok(rows * c.width() as u64),
            Self::Variable(c) => c.data_offset(rows),
        }
    }

    /// Reads raw data bytes.
    pub fn read_range(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>> {
        match self {
            Self::Fixed(c) => c.read_bytes(offset, len),
            Self::Variable(c) => c.data.read_at(offset, len),
        }
    }

    /// Appends raw data bytes.
    ///
    /// Fixed columns take whole elements only. Bytes appended to a variable
    /// column stay invisible until [`Column::append_lengths`] indexes them.
    pub fn append_range(&mut self, bytes: &[u8]) -> StorageResult<()> {
        match self {
            Self::Fixed(c) => c.append_bytes(bytes),
            Self::Variable(c) => {
                c.data.append(bytes)?;
                Ok(())
            }
        }
    }

    /// Lengths of values `[from, to)` of a variable column.
    pub fn value_lengths(&self, from: u64, to: u64) -> StorageResult<Vec<u64>> {
        match self {
            Self::Fixed(_) => Err(StorageError::schema("fixed column has no value lengths")),
            Self::Variable(c) => c.value_lengths(from, to),
        }
    }

    /// Indexes previously appended data bytes of a variable column.
    pub fn append_lengths(&mut self, lengths: &[u64]) -> StorageResult<()> {
        match self {
            Self::Fixed(_) => Err(StorageError::schema("fixed column has no value lengths")),
            Self::Variable(c) => c.append_lengths(lengths),
        }
    }

    /// Appends one encoded value.
    pub fn append_value(&mut self, value: &[u8]) -> StorageResult<()> {
        match self {
            Self::Fixed(c) if value.len() != c.width() => Err(StorageError::schema(format!(
                "value of {} bytes in {}-byte column",
                value.len(),
                c.width()
            ))),
            Self::Fixed(c) => c.append_bytes(value),
            Self::Variable(c) => c.append_value(value),
        }
    }

    /// Reads the encoded value at `row`.
    pub fn value(&self, row: u64) -> StorageResult<Vec<u8>> {
        match self {
            Self::Fixed(c) => c.element(row),
            Self::Variable(c) => c.value(row),
        }
    }

    /// Cuts the column back to `rows` rows, dropping unindexed data too.
    pub fn truncate(&mut self, rows: u64) -> StorageResult<()> {
        match self {
            Self::Fixed(c) => c.truncate(rows),
            Self::Variable(c) => c.truncate(rows),
        }
    }

    /// Flushes the backing stores.
    pub fn flush(&mut self) -> StorageResult<()> {
        match self {
            Self::Fixed(c) => c.flush(),
            Self::Variable(c) => c.flush(),
        }
    }

    /// Syncs the backing stores.
    pub fn sync(&mut self) -> StorageResult<()> {
        match self {
            Self::Fixed(c) => c.sync(),
            Self::Variable(c) => c.sync(),
        }
    }
}

impl std::fmt::Debug for Column {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Fixed(c) => f
                .debug_struct("FixedColumn")
                .field("width", &c.width)
                .field("size", &c.size().ok())
                .finish(),
            Self::Variable(c) => f
                .debug_struct("VarColumn")
                .field("size", &c.size().ok())
                .finish(),
        }
    }
}
