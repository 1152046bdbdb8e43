//! Journal configuration.

/// Configuration for opening a file-backed journal.
#[derive(Debug, Clone)]
pub struct JournalConfig {
    /// Whether to create the journal directory if it doesn't exist.
    pub create_if_missing: bool,

    /// Whether to fsync column files on every commit (safer but slower).
    /// When false, commits only flush to the operating system.
    pub sync_on_commit: bool,
}

impl Default for JournalConfig {
    fn default() -> Self {
        Self {
            create_if_missing: true,
            sync_on_commit: false,
        }
    }
}

impl JournalConfig {
    /// Creates a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets whether to create the journal directory if missing.
    #[must_use]
    pub const fn create_if_missing(mut self, value: bool) -> Self {
        self.create_if_missing = value;
        self
    }

    /// Sets whether to fsync on every commit.
    #[must_use]
    pub const fn sync_on_commit(mut self, value: bool) -> Self {
        self.sync_on_commit = value;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = JournalConfig::default();
        assert!(config.create_if_missing);
        assert!(!config.sync_on_commit);
    }

    #[test]
    fn builder_pattern() {
        let config = JournalConfig::new()
            .create_if_missing(false)
            .sync_on_commit(true);
        assert!(!config.create_if_missing);
        assert!(config.sync_on_commit);
    }
}
