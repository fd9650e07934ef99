use std::sync::Arc;

use parking_lot::RwLock;

use super::Storage;
use crate::error::Result;
use crate::experiment::TrialRecord;

/// In-memory record storage.
///
/// A thin wrapper around `Arc<RwLock<Vec<TrialRecord>>>`; nothing survives
/// the process.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    records: Arc<RwLock<Vec<TrialRecord>>>,
}

impl MemoryStorage {
    /// Creates a new, empty in-memory store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an in-memory store pre-populated with `records`.
    #[must_use]
    pub fn with_records(records: Vec<TrialRecord>) -> Self {
        Self {
            records: Arc::new(RwLock::new(records)),
        }
    }
}

impl Storage for MemoryStorage {
    fn push(&self, record: TrialRecord) -> Result<()> {
        self.records.write().push(record);
        Ok(())
    }

    fn records_arc(&self) -> &Arc<RwLock<Vec<TrialRecord>>> {
        &self.records
    }
}
