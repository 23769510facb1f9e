//! Traced driver wrapper.
//!
//! Wraps a [`Driver`] or [`RecordStore`] and logs every operation via
//! tracing.
//!
//! # Example
//!
//! ```
//! use justdb::{MemoryDriver, Migrator, TracedDriver};
//!
//! let driver = TracedDriver::new(MemoryDriver::new());
//! let migrator = Migrator::new(&driver);
//! // All structural changes are now traced
//! # let _ = migrator;
//! ```

use crate::history::HistoryEntry;
use crate::record::{Mutation, Record};
use crate::{Capabilities, Change, Driver, DriverError, LockState, RecordStore, StorageError};
use justdb_schema::{Schema, Value};

/// A driver whose operations are logged.
#[derive(Debug, Clone)]
pub struct TracedDriver<D> {
    inner: D,
}

impl<D> TracedDriver<D> {
    pub fn new(inner: D) -> Self {
        Self { inner }
    }

    /// Get the wrapped driver.
    pub fn inner(&self) -> &D {
        &self.inner
    }
}

impl<D: Driver> Driver for TracedDriver<D> {
    fn capabilities(&self) -> Capabilities {
        self.inner.capabilities()
    }

    fn introspect(&self) -> Result<Schema, DriverError> {
        let span = tracing::debug_span!("driver.introspect", entities = tracing::field::Empty);
        let _enter = span.enter();
        let schema = self.inner.introspect()?;
        span.record("entities", schema.len());
        Ok(schema)
    }

    fn execute(&self, change: &Change) -> Result<(), DriverError> {
        let span = tracing::debug_span!(
            "driver.execute",
            change = %change,
            destructive = change.is_destructive(),
        );
        let _enter = span.enter();
        match self.inner.execute(change) {
            Ok(()) => {
                tracing::debug!("applied");
                Ok(())
            }
            Err(e) => {
                tracing::debug!(error = %e, "rejected");
                Err(e)
            }
        }
    }

    fn begin(&self) -> Result<(), DriverError> {
        tracing::debug!("driver.begin");
        self.inner.begin()
    }

    fn commit(&self) -> Result<(), DriverError> {
        tracing::debug!("driver.commit");
        self.inner.commit()
    }

    fn rollback(&self) -> Result<(), DriverError> {
        tracing::debug!("driver.rollback");
        self.inner.rollback()
    }

    fn try_lock(&self, owner: &str) -> Result<LockState, DriverError> {
        let span = tracing::debug_span!(
            "driver.try_lock",
            owner = %owner,
            acquired = tracing::field::Empty,
        );
        let _enter = span.enter();
        let state = self.inner.try_lock(owner)?;
        span.record("acquired", state == LockState::Acquired);
        Ok(state)
    }

    fn unlock(&self, owner: &str) -> Result<(), DriverError> {
        tracing::debug!(owner = %owner, "driver.unlock");
        self.inner.unlock(owner)
    }

    fn history(&self) -> Result<Vec<HistoryEntry>, DriverError> {
        let span = tracing::debug_span!("driver.history", entries = tracing::field::Empty);
        let _enter = span.enter();
        let history = self.inner.history()?;
        span.record("entries", history.len());
        Ok(history)
    }

    fn append_history(&self, entry: HistoryEntry) -> Result<(), DriverError> {
        let _span = tracing::debug_span!(
            "driver.append_history",
            schema = %entry.schema_hash.short(),
            operations = entry.operations.len(),
        )
        .entered();
        self.inner.append_history(entry)
    }
}

impl<D: RecordStore> RecordStore for TracedDriver<D> {
    fn get(&self, entity: &str, key: &Value) -> Result<Option<Record>, StorageError> {
        let span = tracing::debug_span!(
            "store.get",
            entity = %entity,
            key = %key,
            found = tracing::field::Empty,
        );
        let _enter = span.enter();
        let record = self.inner.get(entity, key)?;
        span.record("found", record.is_some());
        Ok(record)
    }

    fn scan_page(
        &self,
        entity: &str,
        after: Option<&Value>,
        limit: usize,
    ) -> Result<Vec<Record>, StorageError> {
        let span = tracing::debug_span!(
            "store.scan_page",
            entity = %entity,
            limit,
            rows = tracing::field::Empty,
        );
        let _enter = span.enter();
        let rows = self.inner.scan_page(entity, after, limit)?;
        span.record("rows", rows.len());
        Ok(rows)
    }

    fn commit(&self, batch: Vec<Mutation>) -> Result<(), StorageError> {
        let _span = tracing::debug_span!("store.commit", mutations = batch.len()).entered();
        self.inner.commit(batch)
    }
}
