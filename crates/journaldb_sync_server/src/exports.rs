//! Registry of journals the server replicates.

use crate::error::{ServerError, ServerResult};
use journaldb_storage::{Journal, JournalKey};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

/// Journals exported by a server, looked up by key.
///
/// Journals are registered before agents start and only read afterwards.
#[derive(Default)]
pub struct ExportRegistry {
    journals: RwLock<HashMap<JournalKey, Arc<Journal>>>,
}

impl ExportRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Exports `journal` under its own key.
    pub fn export(&self, journal: Arc<Journal>) -> ServerResult<()> {
        let key = journal.key().clone();
        let mut journals = self.journals.write();
        if journals.contains_key(&key) {
            return Err(ServerError::AlreadyExported(key.to_string()));
        }
        info!(journal = %key, rows = journal.size(), "exported journal");
        journals.insert(key, journal);
        Ok(())
    }

    /// Returns the journal exported under `key`.
    pub fn get(&self, key: &JournalKey) -> Option<Arc<Journal>> {
        self.journals.read().get(key).cloned()
    }

    /// Keys of all exported journals.
    pub fn keys(&self) -> Vec<JournalKey> {
        self.journals.read().keys().cloned().collect()
    }

    /// Number of exported journals.
    pub fn len(&self) -> usize {
        self.journals.read().len()
    }

    /// Returns true if nothing is exported.
    pub fn is_empty(&self) -> bool {
        self.journals.read().is_empty()
    }
}
