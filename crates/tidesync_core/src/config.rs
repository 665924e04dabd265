//! Local store configuration.

/// Configuration for opening a [`LocalStore`](crate::LocalStore).
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Whether to create the store directory if it doesn't exist.
    pub create_if_missing: bool,

    /// Whether to sync both files after every write.
    ///
    /// Turning this off trades durability of the most recent writes for
    /// throughput; a crash can then lose writes that returned success.
    pub sync_on_write: bool,

    /// Whether to trim the change log when it is opened empty.
    pub trim_on_open: bool,

    /// Size the record table must reach before it is compacted.
    ///
    /// A table at least this large whose frames are at least half dead is
    /// rewritten on the next [`trim`](crate::LocalStore::trim).
    pub compact_min_bytes: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            create_if_missing: true,
            sync_on_write: true,
            trim_on_open: true,
            compact_min_bytes: 64 * 1024,
        }
    }
}

impl StoreConfig {
    /// Creates a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets whether to create the store directory if missing.
    #[must_use]
    pub const fn create_if_missing(mut self, value: bool) -> Self {
        self.create_if_missing = value;
        self
    }

    /// Sets whether to sync after every write.
    #[must_use]
    pub const fn sync_on_write(mut self, value: bool) -> Self {
        self.sync_on_write = value;
        self
    }

    /// Sets whether an empty change log is trimmed on open.
    #[must_use]
    pub const fn trim_on_open(mut self, value: bool) -> Self {
        self.trim_on_open = value;
        self
    }

    /// Sets the table size that makes compaction worth it.
    #[must_use]
    pub const fn compact_min_bytes(mut self, bytes: u64) -> Self {
        self.compact_min_bytes = bytes;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = StoreConfig::default();
        assert!(config.create_if_missing);
        assert!(config.sync_on_write);
        assert!(config.trim_on_open);
        assert_eq!(config.compact_min_bytes, 64 * 1024);
    }

    #[test]
    fn builder_pattern() {
        let config = StoreConfig::new()
            .create_if_missing(false)
            .sync_on_write(false)
            .compact_min_bytes(4096);

        assert!(!config.create_if_missing);
        assert!(!config.sync_on_write);
        assert!(config.trim_on_open);
        assert_eq!(config.compact_min_bytes, 4096);
    }
}
