//! Journal directory layout and locking.
//!
//! ```text
//! <journal>/
//! ├─ LOCK                # Advisory lock for the single writer
//! ├─ <col>.sym.d         # Symbol table values, one pair per symbol column
//! ├─ <col>.sym.i
//! └─ <partition label>/  # default | YYYY-MM-DD | YYYY-MM | YYYY
//!    ├─ <col>.d          # Column data
//!    └─ <col>.i          # End offsets of variable-width columns
//! ```

use crate::error::{StorageError, StorageResult};
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

const LOCK_FILE: &str = "LOCK";

/// Holds the exclusive lock on a journal directory.
#[derive(Debug)]
pub(crate) struct JournalDir {
    path: PathBuf,
    _lock_file: File,
}

impl JournalDir {
    /// Opens or creates the directory and takes its lock.
    ///
    /// # Errors
    ///
    /// Returns `JournalLocked` if another process holds the lock.
    pub(crate) fn open(path: &Path, create_if_missing: bool) -> StorageResult<Self> {
        if !path.exists() {
            if create_if_missing {
                fs::create_dir_all(path)?;
            } else {
                return Err(StorageError::corrupted(format!(
                    "journal directory does not exist: {}",
                    path.display()
                )));
            }
        }

        if !path.is_dir() {
            return Err(StorageError::corrupted(format!(
                "path is not a directory: {}",
                path.display()
            )));
        }

        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path.join(LOCK_FILE))?;

        if lock_file.try_lock_exclusive().is_err() {
            return Err(StorageError::JournalLocked(path.to_path_buf()));
        }

        Ok(Self {
            path: path.to_path_buf(),
            _lock_file: lock_file,
        })
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    pub(crate) fn partition_path(&self, label: &str) -> PathBuf {
        self.path.join(label)
    }

    pub(crate) fn column_paths(&self, label: &str, column: &str) -> (PathBuf, PathBuf) {
        let dir = self.partition_path(label);
        (dir.join(format!("{column}.d")), dir.join(format!("{column}.i")))
    }

    pub(crate) fn symbol_paths(&self, column: &str) -> (PathBuf, PathBuf) {
        (
            self.path.join(format!("{column}.sym.d")),
            self.path.join(format!("{column}.sym.i")),
        )
    }

    /// Names of all subdirectories, which are candidate partitions.
    pub(crate) fn partition_labels(&self) -> StorageResult<Vec<String>> {
        let mut labels = Vec::new();
        for entry in fs::read_dir(&self.path)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                if let Some(name) = entry.file_name().to_str() {
                    labels.push(name.to_string());
                }
            }
        }
        Ok(labels)
    }

    pub(crate) fn remove_partition(&self, label: &str) -> StorageResult<()> {
        let path = self.partition_path(label);
        if path.exists() {
            fs::remove_dir_all(path)?;
        }
        Ok(())
    }
}
