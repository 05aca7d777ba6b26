mod memory;
mod sqlite;
mod storage_trait;

pub use memory::MemoryBetStore;
pub use sqlite::SqliteBetStore;
pub use storage_trait::{BetStore, StorageError};

use crate::config::{StorageBackend, StorageConfig};
use std::sync::Arc;
use tracing::info;

/// Open the bet store selected by `config.backend`.
pub fn open(config: &StorageConfig) -> Result<Arc<dyn BetStore>, StorageError> {
    match config.backend {
        StorageBackend::Memory => {
            info!("Using in-memory bet store");
            Ok(Arc::new(MemoryBetStore::new()))
        }
        StorageBackend::Sqlite => {
            // Ensure data directory exists
            if let Some(parent) = config.db_path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            info!("Opening bet database at: {:?}", config.db_path);
            Ok(Arc::new(SqliteBetStore::open(&config.db_path, config)?))
        }
    }
}
