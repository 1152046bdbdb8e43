//! Time partitions: one column per field, sharing a committed row count.

use crate::column::SharedColumn;
use crate::error::{StorageError, StorageResult};
use std::sync::atomic::{AtomicU64, Ordering};

/// One time bucket of a journal.
///
/// Columns may hold more rows than [`Partition::row_count`] while a writer
/// (or a replication consumer) is part way through a transaction. Readers
/// only ever look at `[0, row_count)`.
#[derive(Debug)]
pub struct Partition {
    index: usize,
    bucket: i64,
    label: String,
    columns: Vec<SharedColumn>,
    committed: AtomicU64,
}

impl Partition {
    pub(crate) fn new(
        index: usize,
        bucket: i64,
        label: String,
        columns: Vec<SharedColumn>,
        committed: u64,
    ) -> Self {
        Self {
            index,
            bucket,
            label,
            columns,
            committed: AtomicU64::new(committed),
        }
    }

    /// Position of this partition in the journal.
    #[must_use]
    pub fn index(&self) -> usize {
        self.index
    }

    /// Start of the partition's period in epoch milliseconds.
    #[must_use]
    pub fn bucket(&self) -> i64 {
        self.bucket
    }

    /// Directory name of the partition.
    #[must_use]
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Number of committed rows.
    #[must_use]
    pub fn row_count(&self) -> u64 {
        self.committed.load(Ordering::Acquire)
    }

    /// Returns column `index`.
    #[must_use]
    pub fn column(&self, index: usize) -> Option<SharedColumn> {
        self.columns.get(index).cloned()
    }

    /// Number of columns.
    #[must_use]
    pub fn column_count(&self) -> usize {
        self.columns.len()
    }

    /// Rows present in every column, committed or not.
    pub fn appended_rows(&self) -> StorageResult<u64> {
        let mut rows = u64::MAX;
        for column in &self.columns {
            rows = rows.min(column.read().size()?);
        }
        Ok(if rows == u64::MAX { 0 } else { rows })
    }

    /// Drops every row beyond the committed count, including partially
    /// received variable-width data.
    pub fn truncate_to_committed(&self) -> StorageResult<()> {
        let committed = self.row_count();
        for column in &self.columns {
            column.write().truncate(committed)?;
        }
        Ok(())
    }

    /// Makes the first `rows` rows visible to readers.
    ///
    /// # Errors
    ///
    /// Returns an error if any column holds fewer than `rows` rows, or if
    /// `rows` is below the current committed count.
    pub fn publish_rows(&self, rows: u64) -> StorageResult<()> {
        let committed = self.row_count();
        if rows < committed {
            return Err(StorageError::corrupted(format!(
                "partition {} cannot shrink from {committed} to {rows} rows",
                self.label
            )));
        }
        let available = self.appended_rows()?;
        if available < rows {
            return Err(StorageError::corrupted(format!(
                "partition {} has {available} complete rows, cannot publish {rows}",
                self.label
            )));
        }
        self.committed.store(rows, Ordering::Release);
        Ok(())
    }

    /// Appends one encoded row. On failure every column is cut back to the
    /// row count it had before the call.
    pub(crate) fn append_row(&self, cells: &[Vec<u8>]) -> StorageResult<()> {
        let before = self.appended_rows()?;
        for (column, cell) in self.columns.iter().zip(cells) {
            if let Err(err) = column.write().append_value(cell) {
                for column in &self.columns {
                    let mut column = column.write();
                    if column.size()? > before {
                        column.truncate(before)?;
                    }
                }
                return Err(err);
            }
        }
        Ok(())
    }

    pub(crate) fn flush(&self, sync: bool) -> StorageResult<()> {
        for column in &self.columns {
            let mut column = column.write();
            if sync {
                column.sync()?;
            } else {
                column.flush()?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::column::Column;
    use crate::schema::ColumnType;

    fn partition() -> Partition {
        let columns = vec![
            Column::in_memory(ColumnType::Int).shared(),
            Column::in_memory(ColumnType::String).shared(),
        ];
        Partition::new(0, 0, "default".into(), columns, 0)
    }

    fn row(i: i32, s: &str) -> Vec<Vec<u8>> {
        vec![i.to_le_bytes().to_vec(), s.as_bytes().to_vec()]
    }

    #[test]
    fn rows_invisible_until_published() {
        let p = partition();
        p.append_row(&row(1, "a")).unwrap();
        p.append_row(&row(2, "bb")).unwrap();
        assert_eq!(p.row_count(), 0);
        assert_eq!(p.appended_rows().unwrap(), 2);

        p.publish_rows(2).unwrap();
        assert_eq!(p.row_count(), 2);
        assert!(p.publish_rows(3).is_err());
        assert!(p.publish_rows(1).is_err());
    }

    #[test]
    fn truncate_to_committed_drops_pending() {
        let p = partition();
        p.append_row(&row(1, "a")).unwrap();
        p.publish_rows(1).unwrap();
        p.append_row(&row(2, "pending")).unwrap();
        p.column(1)
            .unwrap()
            .write()
            .append_range(b"orphan")
            .unwrap();

        p.truncate_to_committed().unwrap();
        assert_eq!(p.appended_rows().unwrap(), 1);
        assert_eq!(p.column(1).unwrap().read().data_offset(1).unwrap(), 1);
    }

    #[test]
    fn failed_append_rolls_back_row() {
        let p = partition();
        p.append_row(&row(1, "a")).unwrap();
        // Wrong width for the Int column.
        let bad = vec![vec![0u8; 3], b"x".to_vec()];
        assert!(p.append_row(&bad).is_err());
        assert_eq!(p.appended_rows().unwrap(), 1);
        assert_eq!(p.column(1).unwrap().read().size().unwrap(), 1);
    }
}
