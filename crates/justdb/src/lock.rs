//! Serializing migrations against each other and against record operations.
//!
//! Two layers:
//!
//! - [`SchemaLock`] holds the driver's advisory schema lock for one migration
//!   cycle. It is external to the process, so it also keeps migrations in
//!   other processes out.
//! - [`SchemaGate`] is the in-process gate between a running migration and
//!   the integrity runtime. While a migration alters a set of entities, new
//!   record operations touching those entities wait (bounded), and the
//!   migration first waits for operations already in flight to drain.

use crate::{Driver, DriverError, LockState, MigrationError, MigrationInProgress};
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// The driver's advisory schema lock. Released on drop.
pub struct SchemaLock<'d, D: Driver + ?Sized> {
    driver: &'d D,
    owner: Option<String>,
}

impl<'d, D: Driver + ?Sized> SchemaLock<'d, D> {
    /// Take the lock or fail fast with [`MigrationError::InProgress`].
    pub fn acquire(driver: &'d D, owner: &str) -> Result<Self, MigrationError> {
        match driver.try_lock(owner)? {
            LockState::Acquired => {
                tracing::debug!(owner = %owner, "schema lock acquired");
                Ok(Self {
                    driver,
                    owner: Some(owner.to_string()),
                })
            }
            LockState::HeldBy(holder) => Err(MigrationInProgress {
                detail: format!("schema lock held by {}", holder),
            }
            .into()),
        }
    }

    /// Release now, reporting failures instead of logging them.
    pub fn release(mut self) -> Result<(), DriverError> {
        match self.owner.take() {
            Some(owner) => self.driver.unlock(&owner),
            None => Ok(()),
        }
    }
}

impl<D: Driver + ?Sized> Drop for SchemaLock<'_, D> {
    fn drop(&mut self) {
        if let Some(owner) = self.owner.take() {
            if let Err(e) = self.driver.unlock(&owner) {
                tracing::warn!(owner = %owner, error = %e, "failed to release schema lock");
            }
        }
    }
}

/// Cooperative cancellation for a running migration. Checked between
/// operations.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Clear a previous cancellation so the token can be reused.
    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

#[derive(Debug, Default)]
struct GateState {
    /// Entities being altered by the running migration, if any
    migrating: Option<BTreeSet<String>>,
    /// In-flight record operations per entity
    active: HashMap<String, usize>,
}

impl GateState {
    fn blocks(&self, entities: &BTreeSet<String>) -> bool {
        self.migrating
            .as_ref()
            .is_some_and(|m| !m.is_disjoint(entities))
    }

    fn busy(&self, entities: &BTreeSet<String>) -> bool {
        entities
            .iter()
            .any(|e| self.active.get(e).copied().unwrap_or(0) > 0)
    }
}

/// In-process gate between migrations and record operations.
#[derive(Debug, Default)]
pub struct SchemaGate {
    state: Mutex<GateState>,
    changed: Condvar,
}

impl SchemaGate {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn lock(&self) -> MutexGuard<'_, GateState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Mark `entities` as being altered. Fails fast if another migration is
    /// running; waits up to `drain` for in-flight record operations on those
    /// entities to finish.
    pub fn begin_migration(
        &self,
        entities: BTreeSet<String>,
        drain: Duration,
    ) -> Result<MigrationTicket<'_>, MigrationError> {
        let mut state = self.lock();
        if state.migrating.is_some() {
            return Err(MigrationInProgress {
                detail: "another migration is running in this process".to_string(),
            }
            .into());
        }
        state.migrating = Some(entities.clone());

        let (mut state, timeout) = self
            .changed
            .wait_timeout_while(state, drain, |s| s.busy(&entities))
            .unwrap_or_else(PoisonError::into_inner);
        if timeout.timed_out() && state.busy(&entities) {
            state.migrating = None;
            self.changed.notify_all();
            return Err(MigrationError::Busy {
                entities: entities.into_iter().collect(),
            });
        }

        tracing::debug!(entities = ?entities, "schema gate closed");
        Ok(MigrationTicket { gate: self })
    }

    /// Register a record operation on `entities`. Waits up to `wait` while a
    /// migration alters any of them.
    pub fn enter(
        &self,
        entities: BTreeSet<String>,
        wait: Duration,
    ) -> Result<OperationTicket<'_>, MigrationInProgress> {
        let state = self.lock();
        let (mut state, _) = self
            .changed
            .wait_timeout_while(state, wait, |s| s.blocks(&entities))
            .unwrap_or_else(PoisonError::into_inner);
        if state.blocks(&entities) {
            let altered: Vec<&str> = state
                .migrating
                .iter()
                .flatten()
                .filter(|e| entities.contains(*e))
                .map(String::as_str)
                .collect();
            return Err(MigrationInProgress {
                detail: format!("altering {}", altered.join(", ")),
            });
        }
        for entity in &entities {
            *state.active.entry(entity.clone()).or_default() += 1;
        }
        Ok(OperationTicket {
            gate: self,
            entities,
        })
    }

    /// Whether a migration currently holds the gate.
    pub fn is_migrating(&self) -> bool {
        self.lock().migrating.is_some()
    }
}

/// Held by a running migration. Reopens the gate on drop.
#[must_use]
pub struct MigrationTicket<'g> {
    gate: &'g SchemaGate,
}

impl Drop for MigrationTicket<'_> {
    fn drop(&mut self) {
        self.gate.lock().migrating = None;
        self.gate.changed.notify_all();
        tracing::debug!("schema gate opened");
    }
}

/// Held by an in-flight record operation.
#[must_use]
pub struct OperationTicket<'g> {
    gate: &'g SchemaGate,
    entities: BTreeSet<String>,
}

impl Drop for OperationTicket<'_> {
    fn drop(&mut self) {
        let mut state = self.gate.lock();
        for entity in &self.entities {
            if let Some(count) = state.active.get_mut(entity) {
                *count = count.saturating_sub(1);
            }
        }
        drop(state);
        self.gate.changed.notify_all();
    }
}
