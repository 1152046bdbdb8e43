//! Column types, schemas and time partitioning.

use crate::error::{StorageError, StorageResult};
use chrono::{DateTime, Datelike, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

const DAY_MILLIS: i64 = 24 * 60 * 60 * 1000;

/// Storage type of a column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ColumnType {
    /// One byte, 0 or 1.
    Bool,
    /// 32-bit signed integer.
    Int,
    /// 64-bit signed integer.
    Long,
    /// 64-bit float.
    Double,
    /// Milliseconds since the Unix epoch.
    Timestamp,
    /// 32-bit id into the column's symbol table.
    Symbol,
    /// UTF-8 text of any length.
    String,
    /// Opaque bytes of any length.
    Binary,
}

impl ColumnType {
    /// Returns the element width in bytes, or `None` for variable-width types.
    #[must_use]
    pub const fn fixed_width(self) -> Option<usize> {
        match self {
            Self::Bool => Some(1),
            Self::Int | Self::Symbol => Some(4),
            Self::Long | Self::Double | Self::Timestamp => Some(8),
            Self::String | Self::Binary => None,
        }
    }

    /// Returns true if values of this type have variable length.
    #[must_use]
    pub const fn is_variable(self) -> bool {
        self.fixed_width().is_none()
    }
}

/// Name and type of one column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDef {
    /// Column name, unique within a schema.
    pub name: String,
    /// Storage type.
    pub column_type: ColumnType,
}

impl ColumnDef {
    /// Creates a column definition.
    pub fn new(name: impl Into<String>, column_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            column_type,
        }
    }
}

/// Ordered column definitions of a journal plus its timestamp column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Schema {
    columns: Vec<ColumnDef>,
    timestamp: Option<usize>,
}

impl Schema {
    /// Creates a schema without a timestamp column.
    ///
    /// # Errors
    ///
    /// Returns an error if the schema is empty or a name repeats.
    pub fn new(columns: Vec<ColumnDef>) -> StorageResult<Self> {
        if columns.is_empty() {
            return Err(StorageError::schema("schema has no columns"));
        }
        for (i, column) in columns.iter().enumerate() {
            if columns[..i].iter().any(|c| c.name == column.name) {
                return Err(StorageError::schema(format!(
                    "duplicate column {}",
                    column.name
                )));
            }
        }
        Ok(Self {
            columns,
            timestamp: None,
        })
    }

    /// Designates the named column as the partitioning timestamp.
    ///
    /// # Errors
    ///
    /// Returns an error if the column is missing or not a `Timestamp`.
    pub fn with_timestamp(mut self, name: &str) -> StorageResult<Self> {
        let index = self
            .index_of(name)
            .ok_or_else(|| StorageError::schema(format!("unknown column {name}")))?;
        if self.columns[index].column_type != ColumnType::Timestamp {
            return Err(StorageError::schema(format!(
                "column {name} is not a timestamp"
            )));
        }
        self.timestamp = Some(index);
        Ok(self)
    }

    /// Returns the columns in order.
    #[must_use]
    pub fn columns(&self) -> &[ColumnDef] {
        &self.columns
    }

    /// Returns the column at `index`.
    #[must_use]
    pub fn column(&self, index: usize) -> Option<&ColumnDef> {
        self.columns.get(index)
    }

    /// Returns the number of columns.
    #[must_use]
    pub fn len(&self) -> usize {
        self.columns.len()
    }

    /// Always false; a schema has at least one column.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// Returns the position of the named column.
    #[must_use]
    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    /// Returns the index of the timestamp column.
    #[must_use]
    pub fn timestamp_column(&self) -> Option<usize> {
        self.timestamp
    }

    /// Returns the indexes of symbol columns in column order.
    #[must_use]
    pub fn symbol_columns(&self) -> Vec<usize> {
        self.columns
            .iter()
            .enumerate()
            .filter(|(_, c)| c.column_type == ColumnType::Symbol)
            .map(|(i, _)| i)
            .collect()
    }
}

/// How records are split into partitions by timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum PartitionType {
    /// A single partition named `default`.
    #[default]
    None,
    /// One partition per UTC day.
    Day,
    /// One partition per UTC calendar month.
    Month,
    /// One partition per UTC calendar year.
    Year,
}

impl PartitionType {
    /// Returns the bucket (period start, epoch millis) containing `timestamp`.
    ///
    /// # Errors
    ///
    /// Returns an error if the timestamp is outside the calendar range.
    pub fn bucket_of(self, timestamp: i64) -> StorageResult<i64> {
        match self {
            Self::None => Ok(0),
            Self::Day => Ok(timestamp.div_euclid(DAY_MILLIS) * DAY_MILLIS),
            Self::Month | Self::Year => {
                let date = DateTime::<Utc>::from_timestamp_millis(timestamp)
                    .ok_or_else(|| out_of_range(timestamp))?
                    .date_naive();
                let month = if self == Self::Month { date.month() } else { 1 };
                let start = NaiveDate::from_ymd_opt(date.year(), month, 1)
                    .and_then(|d| d.and_hms_opt(0, 0, 0))
                    .ok_or_else(|| out_of_range(timestamp))?;
                Ok(start.and_utc().timestamp_millis())
            }
        }
    }

    /// Returns the directory name of the partition starting at `bucket`.
    ///
    /// # Errors
    ///
    /// Returns an error if the bucket is outside the calendar range.
    pub fn label(self, bucket: i64) -> StorageResult<String> {
        let format = match self {
            Self::None => return Ok("default".to_string()),
            Self::Day => "%Y-%m-%d",
            Self::Month => "%Y-%m",
            Self::Year => "%Y",
        };
        let at: DateTime<Utc> =
            DateTime::<Utc>::from_timestamp_millis(bucket).ok_or_else(|| out_of_range(bucket))?;
        Ok(at.format(format).to_string())
    }

    /// Parses a partition directory name back into its bucket.
    #[must_use]
    pub fn parse_label(self, label: &str) -> Option<i64> {
        let date = match self {
            Self::None => return (label == "default").then_some(0),
            Self::Day => NaiveDate::parse_from_str(label, "%Y-%m-%d").ok()?,
            Self::Month => NaiveDate::parse_from_str(&format!("{label}-01"), "%Y-%m-%d").ok()?,
            Self::Year => NaiveDate::parse_from_str(&format!("{label}-01-01"), "%Y-%m-%d").ok()?,
        };
        Some(date.and_hms_opt(0, 0, 0)?.and_utc().timestamp_millis())
    }
}

fn out_of_range(millis: i64) -> StorageError {
    StorageError::schema(format!("timestamp {millis} out of calendar range"))
}

/// Identity of a journal: record type, location and partitioning.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JournalKey {
    /// Name of the record type stored in the journal.
    pub name: String,
    /// Location (directory name) of the journal.
    pub location: String,
    /// Partitioning of the journal.
    pub partition_type: PartitionType,
}

impl JournalKey {
    /// Creates a key whose location equals its name.
    pub fn new(name: impl Into<String>, partition_type: PartitionType) -> Self {
        let name = name.into();
        Self {
            location: name.clone(),
            name,
            partition_type,
        }
    }

    /// Sets the location.
    #[must_use]
    pub fn with_location(mut self, location: impl Into<String>) -> Self {
        self.location = location.into();
        self
    }
}

impl fmt::Display for JournalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{} ({:?})", self.name, self.location, self.partition_type)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // 2024-03-15T13:45:00Z
    const TS: i64 = 1_710_510_300_000;

    #[test]
    fn widths() {
        assert_eq!(ColumnType::Bool.fixed_width(), Some(1));
        assert_eq!(ColumnType::Symbol.fixed_width(), Some(4));
        assert_eq!(ColumnType::Timestamp.fixed_width(), Some(8));
        assert!(ColumnType::String.is_variable());
        assert!(ColumnType::Binary.is_variable());
    }

    #[test]
    fn schema_rejects_duplicates_and_bad_timestamp() {
        let dup = Schema::new(vec![
            ColumnDef::new("a", ColumnType::Int),
            ColumnDef::new("a", ColumnType::Long),
        ]);
        assert!(matches!(dup, Err(StorageError::SchemaMismatch(_))));

        let schema = Schema::new(vec![
            ColumnDef::new("sym", ColumnType::Symbol),
            ColumnDef::new("ts", ColumnType::Timestamp),
        ])
        .unwrap();
        assert!(schema.clone().with_timestamp("sym").is_err());
        assert!(schema.clone().with_timestamp("missing").is_err());

        let schema = schema.with_timestamp("ts").unwrap();
        assert_eq!(schema.timestamp_column(), Some(1));
        assert_eq!(schema.symbol_columns(), vec![0]);
    }

    #[test]
    fn buckets_and_labels() {
        let day = PartitionType::Day.bucket_of(TS).unwrap();
        assert_eq!(PartitionType::Day.label(day).unwrap(), "2024-03-15");

        let month = PartitionType::Month.bucket_of(TS).unwrap();
        assert_eq!(PartitionType::Month.label(month).unwrap(), "2024-03");
        assert_eq!(PartitionType::Month.parse_label("2024-03"), Some(month));

        let year = PartitionType::Year.bucket_of(TS).unwrap();
        assert_eq!(PartitionType::Year.label(year).unwrap(), "2024");
        assert_eq!(PartitionType::Year.parse_label("2024"), Some(year));

        assert_eq!(PartitionType::None.bucket_of(TS).unwrap(), 0);
        assert_eq!(PartitionType::None.label(0).unwrap(), "default");
        assert_eq!(PartitionType::None.parse_label("default"), Some(0));
        assert_eq!(PartitionType::Day.parse_label("LOCK"), None);
    }

    #[test]
    fn day_bucket_before_epoch() {
        let bucket = PartitionType::Day.bucket_of(-1).unwrap();
        assert_eq!(bucket, -DAY_MILLIS);
        assert_eq!(PartitionType::Day.label(bucket).unwrap(), "1969-12-31");
    }
}
