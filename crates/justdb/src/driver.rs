//! Storage contracts.
//!
//! A [`Driver`] translates abstract [`Change`]s for one storage engine and
//! reports the live schema back. A [`RecordStore`] holds records and applies
//! batches of [`Mutation`]s atomically. Both are synchronous and take `&self`:
//! implementations hold their own connection state, like a database client.

use crate::history::HistoryEntry;
use crate::record::{Mutation, Record};
use crate::{Change, DriverError, StorageError};
use justdb_schema::{Schema, Value};

/// What a backend can do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    /// Structural changes can run inside a transaction and be rolled back.
    pub transactional_ddl: bool,
}

/// Outcome of [`Driver::try_lock`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockState {
    Acquired,
    /// Someone else holds the lock.
    HeldBy(String),
}

pub trait Driver {
    fn capabilities(&self) -> Capabilities;

    /// Read the live schema.
    fn introspect(&self) -> Result<Schema, DriverError>;

    /// Apply one structural change.
    fn execute(&self, change: &Change) -> Result<(), DriverError>;

    fn begin(&self) -> Result<(), DriverError> {
        Ok(())
    }

    fn commit(&self) -> Result<(), DriverError> {
        Ok(())
    }

    fn rollback(&self) -> Result<(), DriverError> {
        Err(DriverError::Unsupported("rollback".to_string()))
    }

    /// Take the advisory schema lock without waiting.
    fn try_lock(&self, owner: &str) -> Result<LockState, DriverError>;

    fn unlock(&self, owner: &str) -> Result<(), DriverError>;

    /// Recorded migration runs, oldest first.
    fn history(&self) -> Result<Vec<HistoryEntry>, DriverError>;

    fn append_history(&self, entry: HistoryEntry) -> Result<(), DriverError>;
}

impl<D: Driver + ?Sized> Driver for &D {
    fn capabilities(&self) -> Capabilities {
        (**self).capabilities()
    }

    fn introspect(&self) -> Result<Schema, DriverError> {
        (**self).introspect()
    }

    fn execute(&self, change: &Change) -> Result<(), DriverError> {
        (**self).execute(change)
    }

    fn begin(&self) -> Result<(), DriverError> {
        (**self).begin()
    }

    fn commit(&self) -> Result<(), DriverError> {
        (**self).commit()
    }

    fn rollback(&self) -> Result<(), DriverError> {
        (**self).rollback()
    }

    fn try_lock(&self, owner: &str) -> Result<LockState, DriverError> {
        (**self).try_lock(owner)
    }

    fn unlock(&self, owner: &str) -> Result<(), DriverError> {
        (**self).unlock(owner)
    }

    fn history(&self) -> Result<Vec<HistoryEntry>, DriverError> {
        (**self).history()
    }

    fn append_history(&self, entry: HistoryEntry) -> Result<(), DriverError> {
        (**self).append_history(entry)
    }
}

/// Record storage used by the integrity runtime.
///
/// Records are keyed by their primary key value. Soft-deleted records are
/// stored like live ones; filtering by state is the runtime's job.
///
/// The runtime reads, checks, then commits in separate calls, so two writers
/// can both pass a uniqueness or reference check against the same snapshot.
/// A store shared between writers must close that window itself, either by
/// serializing commits or by enforcing unique fields and unique indexes in
/// [`RecordStore::commit`]. [`MemoryDriver`](crate::MemoryDriver) re-checks
/// uniqueness on commit but not references.
pub trait RecordStore {
    /// Fetch one record by primary key, in any state.
    fn get(&self, entity: &str, key: &Value) -> Result<Option<Record>, StorageError>;

    /// Records in key order, starting after `after`, at most `limit` of them.
    fn scan_page(
        &self,
        entity: &str,
        after: Option<&Value>,
        limit: usize,
    ) -> Result<Vec<Record>, StorageError>;

    /// Apply all mutations or none. A batch that leaves duplicate values in
    /// a unique field or index fails with [`StorageError::Duplicate`].
    fn commit(&self, batch: Vec<Mutation>) -> Result<(), StorageError>;
}

impl<S: RecordStore + ?Sized> RecordStore for &S {
    fn get(&self, entity: &str, key: &Value) -> Result<Option<Record>, StorageError> {
        (**self).get(entity, key)
    }

    fn scan_page(
        &self,
        entity: &str,
        after: Option<&Value>,
        limit: usize,
    ) -> Result<Vec<Record>, StorageError> {
        (**self).scan_page(entity, after, limit)
    }

    fn commit(&self, batch: Vec<Mutation>) -> Result<(), StorageError> {
        (**self).commit(batch)
    }
}
