//! JSONL-based journal storage backend.

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use fs2::FileExt;
use parking_lot::{Mutex, RwLock};

use super::{MemoryStorage, Storage};
use crate::error::{Error, Result};
use crate::experiment::TrialRecord;

/// A storage backend that appends trial records as JSON lines to a file.
///
/// Records are kept in memory for fast read access and written through to
/// the JSONL file before [`push`](Storage::push) returns. Writes hold an
/// exclusive file lock, reads a shared one, so another process can follow
/// the journal while a replicate is running.
///
/// # Examples
///
/// ```no_run
/// use prefopt::storage::{JournalStorage, Storage};
///
/// // Resume whatever an earlier run left behind.
/// let storage = JournalStorage::open("results/rosenbrock/NEI/trial_3.jsonl").unwrap();
/// println!("{} records so far", storage.len());
/// ```
#[derive(Debug)]
pub struct JournalStorage {
    memory: MemoryStorage,
    path: PathBuf,
    /// Serialise in-process writes so we only hold the file lock briefly.
    write_lock: Mutex<()>,
}

impl JournalStorage {
    /// Start a fresh journal at `path`, replacing any existing file.
    ///
    /// Parent directories are created as needed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Storage`] if the directory or file cannot be created.
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        create_parent(&path)?;
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&path)?;
        file.lock_exclusive()?;
        file.set_len(0)?;
        file.unlock()?;
        Ok(Self {
            memory: MemoryStorage::new(),
            path,
            write_lock: Mutex::new(()),
        })
    }

    /// Open the journal at `path` and load every stored record.
    ///
    /// A missing file yields an empty storage (no error); it is created on
    /// the first write.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Storage`] if the file exists but cannot be read or
    /// a line does not parse.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let records = load_records_from_file(&path)?;
        Ok(Self {
            memory: MemoryStorage::with_records(records),
            path,
            write_lock: Mutex::new(()),
        })
    }

    /// Location of the journal file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write_to_file(&self, record: &TrialRecord) -> Result<()> {
        let _guard = self.write_lock.lock();
        create_parent(&self.path)?;

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.lock_exclusive()?;

        let line = serde_json::to_string(record)?;
        writeln!(file, "{line}")?;
        file.flush()?;

        file.unlock()?;
        Ok(())
    }
}

impl Storage for JournalStorage {
    fn push(&self, record: TrialRecord) -> Result<()> {
        self.write_to_file(&record)?;
        self.memory.push(record)
    }

    fn records_arc(&self) -> &Arc<RwLock<Vec<TrialRecord>>> {
        self.memory.records_arc()
    }

    fn refresh(&self) -> Result<bool> {
        let loaded = load_records_from_file(&self.path)?;
        let mut guard = self.memory.records_arc().write();
        if loaded.len() > guard.len() {
            *guard = loaded;
            Ok(true)
        } else {
            Ok(false)
        }
    }
}

fn create_parent(path: &Path) -> Result<()> {
    if let Some(dir) = path.parent()
        && !dir.as_os_str().is_empty()
    {
        fs::create_dir_all(dir)?;
    }
    Ok(())
}

/// Read all records from a JSONL file. Returns an empty vec if the file
/// does not exist.
fn load_records_from_file(path: &Path) -> Result<Vec<TrialRecord>> {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    file.lock_shared()?;

    let reader = BufReader::new(&file);
    let mut records = Vec::new();

    for (n, line) in reader.lines().enumerate() {
        let line = line?;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let record: TrialRecord = serde_json::from_str(line).map_err(|e| {
            Error::Storage(format!("{}:{}: {e}", path.display(), n + 1))
        })?;
        records.push(record);
    }

    file.unlock()?;

    Ok(records)
}
