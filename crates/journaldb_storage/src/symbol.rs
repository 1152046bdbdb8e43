//! Symbol tables: append-only string dictionaries.

use crate::column::VarColumn;
use crate::error::{StorageError, StorageResult};
use parking_lot::RwLock;
use std::collections::HashMap;

/// Bidirectional mapping between strings and sequential ids.
///
/// Ids start at zero and are never reused or reassigned, so a replica that
/// appends the same entries in the same order resolves every id to the same
/// string. File-backed tables persist each new entry as it is interned.
pub struct SymbolTable {
    column: String,
    inner: RwLock<Entries>,
}

struct Entries {
    values: Vec<String>,
    ids: HashMap<String, i32>,
    store: Option<VarColumn>,
}

impl Entries {
    fn push(&mut self, value: String) -> StorageResult<i32> {
        let id = i32::try_from(self.values.len())
            .map_err(|_| StorageError::corrupted("symbol table is full"))?;
        if let Some(store) = self.store.as_mut() {
            store.append_value(value.as_bytes())?;
        }
        self.ids.insert(value.clone(), id);
        self.values.push(value);
        Ok(id)
    }
}

impl SymbolTable {
    /// Creates an empty in-memory table for `column`.
    pub fn in_memory(column: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            inner: RwLock::new(Entries {
                values: Vec::new(),
                ids: HashMap::new(),
                store: None,
            }),
        }
    }

    /// Loads a table persisted in `store`.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read, holds invalid UTF-8 or
    /// repeats an entry.
    pub fn open(column: impl Into<String>, store: VarColumn) -> StorageResult<Self> {
        let column = column.into();
        let count = store.size()?;
        let mut values = Vec::with_capacity(count as usize);
        let mut ids = HashMap::with_capacity(count as usize);
        for row in 0..count {
            let value = String::from_utf8(store.value(row)?).map_err(|_| {
                StorageError::corrupted(format!("symbol {row} of {column} is not UTF-8"))
            })?;
            if ids.insert(value.clone(), row as i32).is_some() {
                return Err(StorageError::corrupted(format!(
                    "duplicate symbol {value:?} in {column}"
                )));
            }
            values.push(value);
        }
        Ok(Self {
            column,
            inner: RwLock::new(Entries {
                values,
                ids,
                store: Some(store),
            }),
        })
    }

    /// Name of the column this table serves.
    #[must_use]
    pub fn column(&self) -> &str {
        &self.column
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> u64 {
        self.inner.read().values.len() as u64
    }

    /// Returns true if the table has no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.read().values.is_empty()
    }

    /// Returns the id of `value`, interning it if new.
    pub fn put(&self, value: &str) -> StorageResult<i32> {
        if let Some(id) = self.id_of(value) {
            return Ok(id);
        }
        let mut inner = self.inner.write();
        if let Some(id) = inner.ids.get(value) {
            return Ok(*id);
        }
        inner.push(value.to_string())
    }

    /// Appends an entry received from a replication peer.
    ///
    /// # Errors
    ///
    /// Returns an error if the entry already exists, since ids on both sides
    /// would no longer agree.
    pub fn append(&self, value: String) -> StorageResult<i32> {
        let mut inner = self.inner.write();
        if inner.ids.contains_key(&value) {
            return Err(StorageError::corrupted(format!(
                "symbol {value:?} already present in {}",
                self.column
            )));
        }
        inner.push(value)
    }

    /// Returns the string for `id`.
    #[must_use]
    pub fn value(&self, id: i32) -> Option<String> {
        let index = usize::try_from(id).ok()?;
        self.inner.read().values.get(index).cloned()
    }

    /// Returns the id of `value` if present.
    #[must_use]
    pub fn id_of(&self, value: &str) -> Option<i32> {
        self.inner.read().ids.get(value).copied()
    }

    /// Returns entries `[from, to)`, clamped to the table size.
    #[must_use]
    pub fn values_range(&self, from: u64, to: u64) -> Vec<String> {
        let inner = self.inner.read();
        let end = (to as usize).min(inner.values.len());
        let start = (from as usize).min(end);
        inner.values[start..end].to_vec()
    }

    /// Flushes the backing store, if any.
    pub fn flush(&self) -> StorageResult<()> {
        if let Some(store) = self.inner.write().store.as_mut() {
            store.flush()?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for SymbolTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SymbolTable")
            .field("column", &self.column)
            .field("len", &self.len())
            .finish()
    }
}
