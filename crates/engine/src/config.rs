//! Engine configuration.

use otterbrix_core::CollectionName;
use otterbrix_durability::WalConfig;
use std::path::{Path, PathBuf};

/// Configuration for an engine instance.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Root directory holding the WAL and collection data
    pub root: PathBuf,
    /// WAL tunables
    pub wal: WalConfig,
}

impl EngineConfig {
    /// Defaults rooted at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        EngineConfig {
            root: root.into(),
            wal: WalConfig::new(),
        }
    }

    /// Small segments and strict fsync, for tests.
    pub fn for_testing(root: impl Into<PathBuf>) -> Self {
        EngineConfig {
            root: root.into(),
            wal: WalConfig::for_testing(),
        }
    }

    /// Replace the WAL config.
    pub fn with_wal(mut self, wal: WalConfig) -> Self {
        self.wal = wal;
        self
    }

    /// Directory holding the WAL segments.
    pub fn wal_dir(&self) -> PathBuf {
        self.root.join("wal")
    }

    /// Directory holding one collection's files.
    pub fn collection_dir(&self, name: &CollectionName) -> PathBuf {
        self.root.join(&name.database).join(&name.collection)
    }

    /// The root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_paths() {
        let config = EngineConfig::new("/data/otterbrix");
        assert_eq!(config.wal_dir(), PathBuf::from("/data/otterbrix/wal"));
        assert_eq!(
            config.collection_dir(&CollectionName::new("db", "t")),
            PathBuf::from("/data/otterbrix/db/t")
        );
    }
}
