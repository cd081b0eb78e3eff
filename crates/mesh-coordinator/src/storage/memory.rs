//! In-memory storage backend
//!
//! Default backend. Suitable for development and tests; the sealed record
//! is lost when the process exits. Cloning an `Arc<MemoryStore>` lets
//! several coordinators in one process share a record, which is how
//! restarts are exercised in tests.

use parking_lot::RwLock;
use tracing::debug;

use super::{SealedRecord, SealedStateStore, StorageError};

/// In-memory sealed state store
#[derive(Debug, Default)]
pub struct MemoryStore {
    record: RwLock<Option<SealedRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SealedStateStore for MemoryStore {
    fn load(&self) -> Result<Option<SealedRecord>, StorageError> {
        Ok(self.record.read().clone())
    }

    fn store(&self, record: &SealedRecord) -> Result<(), StorageError> {
        debug!(fingerprint = %record.manifest_fingerprint, "Storing sealed record in memory");
        *self.record.write() = Some(record.clone());
        Ok(())
    }

    fn clear(&self) -> Result<(), StorageError> {
        *self.record.write() = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{SealedBlob, SEALED_RECORD_VERSION};
    use std::collections::BTreeMap;

    fn record(fp: &str) -> SealedRecord {
        SealedRecord {
            version: SEALED_RECORD_VERSION,
            state: SealedBlob {
                nonce: [0; 12],
                ciphertext: vec![1, 2, 3],
            },
            wrapped_key: None,
            recovery_keys: BTreeMap::new(),
            manifest_fingerprint: fp.into(),
            sealed_at: chrono::Utc::now(),
        }
    }

    #[test]
    fn test_store_load_clear() {
        let store = MemoryStore::new();
        assert!(store.load().unwrap().is_none());

        store.store(&record("a")).unwrap();
        store.store(&record("b")).unwrap();
        assert_eq!(store.load().unwrap().unwrap().manifest_fingerprint, "b");

        store.clear().unwrap();
        assert!(store.load().unwrap().is_none());
    }
}
