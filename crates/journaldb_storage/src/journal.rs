//! Journals: partitioned, append-only record stores.

use crate::column::{Column, FixedColumn, SharedColumn, VarColumn};
use crate::config::JournalConfig;
use crate::dir::JournalDir;
use crate::error::{StorageError, StorageResult};
use crate::file::FileBackend;
use crate::partition::Partition;
use crate::schema::{ColumnDef, ColumnType, JournalKey, PartitionType, Schema};
use crate::symbol::SymbolTable;
use crate::value::Value;
use parking_lot::{Mutex, RwLock};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// An append-only collection of records split into time partitions.
///
/// A single writer appends rows and commits them; any number of readers
/// (replication agents among them) observe only committed rows. All
/// methods take `&self`, so a journal is shared as `Arc<Journal>`.
///
/// # Example
///
/// ```rust
/// use journaldb_storage::{ColumnDef, ColumnType, Journal, JournalKey, PartitionType, Schema, Value};
///
/// let schema = Schema::new(vec![
///     ColumnDef::new("sym", ColumnType::Symbol),
///     ColumnDef::new("price", ColumnType::Double),
/// ])
/// .unwrap();
/// let journal = Journal::in_memory(JournalKey::new("quote", PartitionType::None), schema).unwrap();
///
/// journal
///     .append(&[Value::Symbol("BP.L".into()), Value::Double(101.5)])
///     .unwrap();
/// assert_eq!(journal.size(), 0);
/// journal.commit().unwrap();
/// assert_eq!(journal.size(), 1);
/// ```
pub struct Journal {
    key: JournalKey,
    schema: Schema,
    config: JournalConfig,
    dir: Option<JournalDir>,
    partitions: RwLock<Vec<Arc<Partition>>>,
    symbols: Vec<Option<Arc<SymbolTable>>>,
    writer: Mutex<()>,
}

impl Journal {
    /// Creates an empty journal held in memory.
    ///
    /// # Errors
    ///
    /// Returns an error if the key is partitioned but the schema has no
    /// timestamp column.
    pub fn in_memory(key: JournalKey, schema: Schema) -> StorageResult<Self> {
        check_partitioning(&key, &schema)?;
        let symbols = schema
            .columns()
            .iter()
            .map(|c| {
                (c.column_type == ColumnType::Symbol)
                    .then(|| Arc::new(SymbolTable::in_memory(c.name.clone())))
            })
            .collect();

        Ok(Self {
            key,
            schema,
            config: JournalConfig::default(),
            dir: None,
            partitions: RwLock::new(Vec::new()),
            symbols,
            writer: Mutex::new(()),
        })
    }

    /// Opens or creates a journal stored under `path`.
    ///
    /// Existing partitions are discovered from their directory names. Each
    /// partition is cut back to its last complete row, so a crash between
    /// column writes never leaves a half-written row behind.
    ///
    /// # Errors
    ///
    /// Returns `JournalLocked` if another process has the journal open, or
    /// an error if the files cannot be read.
    pub fn open(
        path: &Path,
        key: JournalKey,
        schema: Schema,
        config: JournalConfig,
    ) -> StorageResult<Self> {
        check_partitioning(&key, &schema)?;
        let dir = JournalDir::open(path, config.create_if_missing)?;

        let mut symbols = Vec::with_capacity(schema.len());
        for column in schema.columns() {
            if column.column_type == ColumnType::Symbol {
                let (data, index) = dir.symbol_paths(&column.name);
                let store = VarColumn::new(
                    Box::new(FileBackend::open(&data)?),
                    Box::new(FileBackend::open(&index)?),
                )?;
                symbols.push(Some(Arc::new(SymbolTable::open(column.name.clone(), store)?)));
            } else {
                symbols.push(None);
            }
        }

        let mut found: Vec<(i64, String)> = dir
            .partition_labels()?
            .into_iter()
            .filter_map(|label| {
                key.partition_type
                    .parse_label(&label)
                    .map(|bucket| (bucket, label))
            })
            .collect();
        found.sort();

        let mut partitions = Vec::with_capacity(found.len());
        for (bucket, label) in found {
            let columns = file_columns(&dir, &label, schema.columns())?;
            let partition = Partition::new(partitions.len(), bucket, label, columns, 0);
            let rows = partition.appended_rows()?;
            if rows == 0 {
                warn!(partition = %partition.label(), "removing empty partition");
                dir.remove_partition(partition.label())?;
                continue;
            }
            partition.publish_rows(rows)?;
            partition.truncate_to_committed()?;
            partitions.push(Arc::new(partition));
        }

        info!(
            journal = %key,
            path = %dir.path().display(),
            partitions = partitions.len(),
            "opened journal"
        );

        Ok(Self {
            key,
            schema,
            config,
            dir: Some(dir),
            partitions: RwLock::new(partitions),
            symbols,
            writer: Mutex::new(()),
        })
    }

    /// The journal's identity.
    #[must_use]
    pub fn key(&self) -> &JournalKey {
        &self.key
    }

    /// The journal's schema.
    #[must_use]
    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    /// Total committed rows over all partitions.
    #[must_use]
    pub fn size(&self) -> u64 {
        self.partitions.read().iter().map(|p| p.row_count()).sum()
    }

    /// Number of partitions visible to readers.
    #[must_use]
    pub fn partition_count(&self) -> usize {
        self.partitions
            .read()
            .iter()
            .take_while(|p| p.row_count() > 0)
            .count()
    }

    /// Returns visible partition `index`.
    #[must_use]
    pub fn partition(&self, index: usize) -> Option<Arc<Partition>> {
        let partitions = self.partitions.read();
        let visible = partitions.iter().take_while(|p| p.row_count() > 0).count();
        (index < visible).then(|| Arc::clone(&partitions[index]))
    }

    /// Returns all visible partitions in order.
    #[must_use]
    pub fn partitions(&self) -> Vec<Arc<Partition>> {
        self.partitions
            .read()
            .iter()
            .take_while(|p| p.row_count() > 0)
            .cloned()
            .collect()
    }

    /// Returns the symbol table of column `column`.
    #[must_use]
    pub fn symbol_table(&self, column: usize) -> Option<Arc<SymbolTable>> {
        self.symbols.get(column).cloned().flatten()
    }

    /// Returns the symbol tables in symbol column order.
    #[must_use]
    pub fn symbol_tables(&self) -> Vec<Arc<SymbolTable>> {
        self.symbols.iter().flatten().cloned().collect()
    }

    /// Appends one record. The row stays invisible until [`Journal::commit`].
    ///
    /// # Errors
    ///
    /// Returns `SchemaMismatch` if the record doesn't fit the schema, or
    /// `OutOfOrder` if its timestamp falls before the newest partition.
    pub fn append(&self, row: &[Value]) -> StorageResult<()> {
        if row.len() != self.schema.len() {
            return Err(StorageError::schema(format!(
                "record has {} values, schema has {} columns",
                row.len(),
                self.schema.len()
            )));
        }
        for (def, value) in self.schema.columns().iter().zip(row) {
            if value.column_type() != def.column_type {
                return Err(StorageError::schema(format!(
                    "column {} expects {:?}, got {:?}",
                    def.name,
                    def.column_type,
                    value.column_type()
                )));
            }
        }

        let bucket = match self.schema.timestamp_column() {
            Some(ts) => {
                let millis = row[ts].as_timestamp().unwrap_or_default();
                self.key.partition_type.bucket_of(millis)?
            }
            None => 0,
        };

        let _writer = self.writer.lock();
        let partition = self.partition_for_append(bucket)?;
        let mut cells = Vec::with_capacity(row.len());
        for (column, value) in row.iter().enumerate() {
            cells.push(self.encode(column, value)?);
        }
        partition.append_row(&cells)
    }

    /// Publishes every appended row and returns the new journal size.
    ///
    /// # Errors
    ///
    /// Returns an error if flushing to disk fails.
    pub fn commit(&self) -> StorageResult<u64> {
        let _writer = self.writer.lock();
        let partitions = self.partitions.read().clone();

        for table in self.symbols.iter().flatten() {
            table.flush()?;
        }

        for partition in &partitions {
            let rows = partition.appended_rows()?;
            if rows == partition.row_count() {
                continue;
            }
            if self.dir.is_some() {
                partition.flush(self.config.sync_on_commit)?;
            }
            partition.publish_rows(rows)?;
            debug!(
                journal = %self.key.name,
                partition = %partition.label(),
                rows,
                "committed"
            );
        }

        Ok(self.size())
    }

    /// Discards every row appended since the last commit.
    ///
    /// # Errors
    ///
    /// Returns an error if truncating column files fails.
    pub fn rollback(&self) -> StorageResult<()> {
        let _writer = self.writer.lock();
        let mut partitions = self.partitions.write();

        for partition in partitions.iter() {
            partition.truncate_to_committed()?;
        }
        while let Some(last) = partitions.last() {
            if last.row_count() > 0 {
                break;
            }
            if let Some(dir) = &self.dir {
                dir.remove_partition(last.label())?;
            }
            partitions.pop();
        }

        debug!(journal = %self.key.name, "rolled back");
        Ok(())
    }

    /// Reads committed row `row` of visible partition `partition`.
    ///
    /// # Errors
    ///
    /// Returns an error if the row is not committed or cannot be decoded.
    pub fn read_row(&self, partition: usize, row: u64) -> StorageResult<Vec<Value>> {
        let count = self.partition_count();
        let part = self
            .partition(partition)
            .ok_or(StorageError::InvalidPartition {
                index: partition,
                count,
            })?;
        if row >= part.row_count() {
            return Err(StorageError::ReadPastEnd {
                offset: row,
                len: 1,
                size: part.row_count(),
            });
        }

        let mut values = Vec::with_capacity(self.schema.len());
        for (index, def) in self.schema.columns().iter().enumerate() {
            let column = part
                .column(index)
                .ok_or_else(|| StorageError::corrupted("partition is missing a column"))?;
            let bytes = column.read().value(row)?;
            values.push(self.decode(index, def, bytes)?);
        }
        Ok(values)
    }

    /// Returns partition `index` for a replication consumer, creating it if
    /// it is the next one.
    ///
    /// A newly created partition stays invisible until rows are published
    /// into it.
    ///
    /// # Errors
    ///
    /// Returns an error if `index` skips ahead of the journal, or if an
    /// existing partition at `index` covers a different bucket.
    pub fn partition_for_replication(
        &self,
        index: usize,
        bucket: i64,
    ) -> StorageResult<Arc<Partition>> {
        let _writer = self.writer.lock();
        let mut partitions = self.partitions.write();

        if let Some(existing) = partitions.get(index) {
            if existing.bucket() != bucket {
                return Err(StorageError::corrupted(format!(
                    "partition {index} covers bucket {}, not {bucket}",
                    existing.bucket()
                )));
            }
            return Ok(Arc::clone(existing));
        }

        if index != partitions.len() {
            return Err(StorageError::InvalidPartition {
                index,
                count: partitions.len(),
            });
        }
        if let Some(last) = partitions.last() {
            if last.bucket() >= bucket {
                return Err(StorageError::OutOfOrder {
                    bucket,
                    newest: last.bucket(),
                });
            }
        }

        let partition = Arc::new(self.create_partition(index, bucket)?);
        partitions.push(Arc::clone(&partition));
        debug!(journal = %self.key.name, partition = %partition.label(), "created replica partition");
        Ok(partition)
    }

    fn partition_for_append(&self, bucket: i64) -> StorageResult<Arc<Partition>> {
        let mut partitions = self.partitions.write();
        match partitions.last() {
            Some(last) if last.bucket() == bucket => return Ok(Arc::clone(last)),
            Some(last) if last.bucket() > bucket => {
                return Err(StorageError::OutOfOrder {
                    bucket,
                    newest: last.bucket(),
                })
            }
            _ => {}
        }

        let partition = Arc::new(self.create_partition(partitions.len(), bucket)?);
        partitions.push(Arc::clone(&partition));
        debug!(journal = %self.key.name, partition = %partition.label(), "created partition");
        Ok(partition)
    }

    fn create_partition(&self, index: usize, bucket: i64) -> StorageResult<Partition> {
        let label = self.key.partition_type.label(bucket)?;
        let columns = match &self.dir {
            Some(dir) => file_columns(dir, &label, self.schema.columns())?,
            None => self
                .schema
                .columns()
                .iter()
                .map(|c| Column::in_memory(c.column_type).shared())
                .collect(),
        };
        Ok(Partition::new(index, bucket, label, columns, 0))
    }

    fn encode(&self, column: usize, value: &Value) -> StorageResult<Vec<u8>> {
        Ok(match value {
            Value::Bool(v) => vec![u8::from(*v)],
            Value::Int(v) => v.to_le_bytes().to_vec(),
            Value::Long(v) | Value::Timestamp(v) => v.to_le_bytes().to_vec(),
            Value::Double(v) => v.to_le_bytes().to_vec(),
            Value::Symbol(s) => {
                let table = self
                    .symbol_table(column)
                    .ok_or_else(|| StorageError::schema("symbol value in non-symbol column"))?;
                table.put(s)?.to_le_bytes().to_vec()
            }
            Value::String(s) => s.as_bytes().to_vec(),
            Value::Binary(b) => b.clone(),
        })
    }

    fn decode(&self, column: usize, def: &ColumnDef, bytes: Vec<u8>) -> StorageResult<Value> {
        let fixed = |n: usize| -> StorageResult<[u8; 8]> {
            if bytes.len() != n {
                return Err(StorageError::corrupted(format!(
                    "column {} holds {} bytes, expected {n}",
                    def.name,
                    bytes.len()
                )));
            }
            let mut buf = [0u8; 8];
            buf[..n].copy_from_slice(&bytes);
            Ok(buf)
        };

        Ok(match def.column_type {
            ColumnType::Bool => Value::Bool(fixed(1)?[0] != 0),
            ColumnType::Int => {
                let b = fixed(4)?;
                Value::Int(i32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            }
            ColumnType::Long => Value::Long(i64::from_le_bytes(fixed(8)?)),
            ColumnType::Timestamp => Value::Timestamp(i64::from_le_bytes(fixed(8)?)),
            ColumnType::Double => Value::Double(f64::from_le_bytes(fixed(8)?)),
            ColumnType::Symbol => {
                let b = fixed(4)?;
                let id = i32::from_le_bytes([b[0], b[1], b[2], b[3]]);
                let value = self
                    .symbol_table(column)
                    .and_then(|t| t.value(id))
                    .ok_or_else(|| StorageError::UnknownSymbol {
                        column: def.name.clone(),
                        id,
                    })?;
                Value::Symbol(value)
            }
            ColumnType::String => Value::String(String::from_utf8(bytes).map_err(|_| {
                StorageError::corrupted(format!("column {} holds invalid UTF-8", def.name))
            })?),
            ColumnType::Binary => Value::Binary(bytes),
        })
    }
}

impl std::fmt::Debug for Journal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Journal")
            .field("key", &self.key)
            .field("partitions", &self.partition_count())
            .field("size", &self.size())
            .finish()
    }
}

fn check_partitioning(key: &JournalKey, schema: &Schema) -> StorageResult<()> {
    if key.partition_type != PartitionType::None && schema.timestamp_column().is_none() {
        return Err(StorageError::schema(format!(
            "journal {} is partitioned by {:?} but has no timestamp column",
            key.name, key.partition_type
        )));
    }
    Ok(())
}

fn file_columns(
    dir: &JournalDir,
    label: &str,
    defs: &[ColumnDef],
) -> StorageResult<Vec<SharedColumn>> {
    let mut columns = Vec::with_capacity(defs.len());
    for def in defs {
        let (data, index) = dir.column_paths(label, &def.name);
        let data = Box::new(FileBackend::open_with_create_dirs(&data)?);
        let column = match def.column_type.fixed_width() {
            Some(width) => Column::Fixed(FixedColumn::new(data, width)?),
            None => Column::Variable(VarColumn::new(
                data,
                Box::new(FileBackend::open_with_create_dirs(&index)?),
            )?),
        };
        columns.push(column.shared());
    }
    Ok(columns)
}
