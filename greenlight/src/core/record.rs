//! Versioned records and the conditional-update contract
//!
//! Every mutable record carries a `version` that starts at 1 and grows by
//! exactly one per successful write. A writer sends back the version it read;
//! the store applies the write only if that version is still current.
//!
//! The check and the write must be one indivisible step inside the store.
//! Reading the version first and writing afterwards from the caller would
//! reopen the lost-update race.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::error::Error;
use std::fmt;

/// A record together with the version it was read at
#[derive(Debug, Clone, PartialEq)]
pub struct VersionedRecord<P> {
    pub id: i64,
    pub version: i64,
    pub payload: P,
}

impl<P> VersionedRecord<P> {
    /// Reject records whose version could never have been written
    ///
    /// # Errors
    ///
    /// [`RecordError::Corrupt`] when `version < 1`.
    pub fn check_version(&self) -> Result<(), RecordError> {
        if self.version < 1 {
            return Err(RecordError::Corrupt(format!(
                "record {} has version {}",
                self.id, self.version
            )));
        }
        Ok(())
    }
}

/// Failures reported by a [`Repository`]
///
/// `NotFound` and `Conflict` are ordinary outcomes under concurrent use and
/// must stay distinct: callers map them to different responses.
#[derive(Debug, Clone, PartialEq)]
pub enum RecordError {
    /// No record with this id exists
    NotFound,
    /// The record exists but its version moved on since it was read
    Conflict,
    /// Stored data breaks a record invariant
    Corrupt(String),
    /// The backing store failed
    Backend(String),
}

impl fmt::Display for RecordError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordError::NotFound => write!(f, "record not found"),
            RecordError::Conflict => write!(f, "edit conflict"),
            RecordError::Corrupt(msg) => write!(f, "corrupt record: {msg}"),
            RecordError::Backend(msg) => write!(f, "store error: {msg}"),
        }
    }
}

impl Error for RecordError {}

/// Storage contract for versioned records
///
/// Implementations are called from blocking worker threads and must be
/// shareable across them.
pub trait Repository<P>: Send + Sync {
    /// Store a new record at version 1 and return it with its assigned id
    fn insert(&self, payload: P) -> Result<VersionedRecord<P>, RecordError>;

    /// Read the current state of a record
    fn fetch(&self, id: i64) -> Result<VersionedRecord<P>, RecordError>;

    /// Write `record.payload` if the stored version still equals `record.version`
    ///
    /// On success the stored version becomes `record.version + 1` and that new
    /// version is returned. On a version mismatch nothing is written and
    /// [`RecordError::Conflict`] is returned; if the id is gone,
    /// [`RecordError::NotFound`].
    fn update_if_version(&self, record: &VersionedRecord<P>) -> Result<i64, RecordError>;

    /// Remove a record
    fn delete(&self, id: i64) -> Result<(), RecordError>;
}

struct Table<P> {
    records: HashMap<i64, VersionedRecord<P>>,
    next_id: i64,
}

/// [`Repository`] held in process memory
///
/// One mutex covers the whole table, which makes the version check and the
/// write a single step.
pub struct InMemoryRepository<P> {
    table: Mutex<Table<P>>,
}

impl<P> InMemoryRepository<P> {
    pub fn new() -> Self {
        InMemoryRepository {
            table: Mutex::new(Table {
                records: HashMap::new(),
                next_id: 1,
            }),
        }
    }

    pub fn len(&self) -> usize {
        self.table.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<P> Default for InMemoryRepository<P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P: Clone + Send> Repository<P> for InMemoryRepository<P> {
    fn insert(&self, payload: P) -> Result<VersionedRecord<P>, RecordError> {
        let mut table = self.table.lock();
        let id = table.next_id;
        table.next_id += 1;

        let record = VersionedRecord {
            id,
            version: 1,
            payload,
        };
        table.records.insert(id, record.clone());
        Ok(record)
    }

    fn fetch(&self, id: i64) -> Result<VersionedRecord<P>, RecordError> {
        self.table
            .lock()
            .records
            .get(&id)
            .cloned()
            .ok_or(RecordError::NotFound)
    }

    fn update_if_version(&self, record: &VersionedRecord<P>) -> Result<i64, RecordError> {
        let mut table = self.table.lock();
        let stored = table
            .records
            .get_mut(&record.id)
            .ok_or(RecordError::NotFound)?;

        if stored.version != record.version {
            return Err(RecordError::Conflict);
        }

        stored.payload = record.payload.clone();
        stored.version += 1;
        Ok(stored.version)
    }

    fn delete(&self, id: i64) -> Result<(), RecordError> {
        self.table
            .lock()
            .records
            .remove(&id)
            .map(|_| ())
            .ok_or(RecordError::NotFound)
    }
}
