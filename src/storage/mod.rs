//! Trial record storage backends.
//!
//! The [`Storage`] trait defines how the [`TrialRecord`]s of one replicate
//! are persisted and retrieved. Every [`Experiment`](crate::Experiment)
//! owns an `Arc<dyn Storage>`; replaying the stored records rebuilds the
//! comparison dataset exactly, which is what makes an interrupted run
//! resumable.
//!
//! # Available backends
//!
//! | Backend | Description |
//! |---------|-------------|
//! | [`MemoryStorage`] | In-memory `Vec` behind a read-write lock |
//! | [`JournalStorage`] | JSONL file with `fs2` file locking, one file per replicate |
//!
//! Floats are written with `serde_json`'s round-trip formatting, so a
//! replayed journal reproduces every coordinate bit for bit.
//!
//! # Implementing a custom backend
//!
//! Implement [`push`](Storage::push) and
//! [`records_arc`](Storage::records_arc), and optionally
//! [`refresh`](Storage::refresh) for stores written by other processes:
//!
//! ```
//! use std::sync::Arc;
//!
//! use parking_lot::RwLock;
//! use prefopt::storage::Storage;
//! use prefopt::{Result, TrialRecord};
//!
//! #[derive(Default)]
//! struct Counting {
//!     records: Arc<RwLock<Vec<TrialRecord>>>,
//! }
//!
//! impl Storage for Counting {
//!     fn push(&self, record: TrialRecord) -> Result<()> {
//!         self.records.write().push(record);
//!         Ok(())
//!     }
//!
//!     fn records_arc(&self) -> &Arc<RwLock<Vec<TrialRecord>>> {
//!         &self.records
//!     }
//! }
//! ```

mod journal;
mod memory;

use std::sync::Arc;

pub use journal::JournalStorage;
pub use memory::MemoryStorage;
use parking_lot::RwLock;

use crate::error::Result;
use crate::experiment::TrialRecord;

/// Append-only store of one replicate's trial records.
///
/// Implementations must be `Send + Sync` so replicates can run on worker
/// threads.
pub trait Storage: Send + Sync {
    /// Append a record. The record must be durable when this returns `Ok`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Storage`](crate::Error::Storage) if the record
    /// cannot be persisted; it is then not added to the in-memory buffer
    /// either.
    fn push(&self, record: TrialRecord) -> Result<()>;

    /// The in-memory record buffer, in append order.
    fn records_arc(&self) -> &Arc<RwLock<Vec<TrialRecord>>>;

    /// Reload from an external source. Returns `true` if the in-memory
    /// buffer changed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Storage`](crate::Error::Storage) if the source
    /// cannot be read.
    fn refresh(&self) -> Result<bool> {
        Ok(false)
    }

    /// Snapshot of every stored record.
    fn records(&self) -> Vec<TrialRecord> {
        self.records_arc().read().clone()
    }

    /// Number of stored records.
    fn len(&self) -> usize {
        self.records_arc().read().len()
    }

    /// Whether nothing has been stored.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
