use crate::types::Bet;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("connection pool error: {0}")]
    Pool(#[from] r2d2::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("stored bet {row} is corrupt: {reason}")]
    Corrupt { row: i64, reason: String },
    #[error("bet store lock poisoned")]
    Poisoned,
}

/// Append-only persistence for accepted bets.
///
/// Key design principles:
/// - Storage does NOT serialize writers (the Coordinator does)
/// - Batches are appended atomically: all bets or none
/// - `load_all` returns bets in the order they were appended
pub trait BetStore: Send + Sync {
    /// Append a batch of bets
    fn append(&self, bets: &[Bet]) -> Result<(), StorageError>;

    /// Read every stored bet
    fn load_all(&self) -> Result<Vec<Bet>, StorageError>;

    /// Number of stored bets
    fn count(&self) -> Result<u64, StorageError>;
}
