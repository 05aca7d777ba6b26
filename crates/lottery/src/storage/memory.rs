use crate::storage::{BetStore, StorageError};
use crate::types::Bet;
use std::sync::RwLock;

/// Volatile bet store, for tests and throwaway runs.
#[derive(Debug, Default)]
pub struct MemoryBetStore {
    bets: RwLock<Vec<Bet>>,
}

impl MemoryBetStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl BetStore for MemoryBetStore {
    fn append(&self, bets: &[Bet]) -> Result<(), StorageError> {
        let mut stored = self.bets.write().map_err(|_| StorageError::Poisoned)?;
        stored.extend_from_slice(bets);
        Ok(())
    }

    fn load_all(&self) -> Result<Vec<Bet>, StorageError> {
        let stored = self.bets.read().map_err(|_| StorageError::Poisoned)?;
        Ok(stored.clone())
    }

    fn count(&self) -> Result<u64, StorageError> {
        let stored = self.bets.read().map_err(|_| StorageError::Poisoned)?;
        Ok(stored.len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_preserves_order() {
        let store = MemoryBetStore::new();
        let first = crate::types::parse_batch("1;Ana;Diaz;10;1985-01-30;7;").unwrap();
        let second = crate::types::parse_batch("2;Luis;Paz;20;1970-06-01;8;").unwrap();

        store.append(&first).unwrap();
        store.append(&second).unwrap();
        store.append(&[]).unwrap();

        let all = store.load_all().unwrap();
        assert_eq!(store.count().unwrap(), 2);
        assert_eq!(all[0].document, "10");
        assert_eq!(all[1].document, "20");
    }
}
