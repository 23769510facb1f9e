//! Migration execution.
//!
//! A [`Migrator`] brings the live schema behind a [`Driver`] into agreement
//! with a declared [`Schema`]:
//!
//! ```text
//! validate -> history check -> lock -> introspect -> diff -> apply -> record
//! ```
//!
//! Changes are applied strictly in change set order. On backends with
//! transactional DDL a failure rolls the whole run back. Elsewhere the applied
//! prefix stays, a partial history entry records it, and the next run resumes
//! by diffing against the partially migrated schema.
//!
//! # Example
//!
//! ```
//! use justdb::{MemoryDriver, Migrator};
//! use justdb_schema::{Entity, Field, ScalarType, Schema};
//!
//! let driver = MemoryDriver::new();
//! let schema = Schema::new([Entity::builder("users")
//!     .field(Field::new("id", ScalarType::Integer).primary_key())
//!     .build()?])?;
//!
//! let report = Migrator::new(&driver).migrate(&schema)?;
//! assert_eq!(report.applied.len(), 1);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

use crate::history::{self, HistoryEntry};
use crate::lock::{CancelToken, SchemaGate, SchemaLock};
use crate::{Change, ChangeSet, Driver, DriverError, Error, MigrationError, diff, validate};
use justdb_config::MigrationConfig;
use justdb_schema::{Schema, SchemaHash};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Outcome of a migration run.
#[derive(Debug, Clone, PartialEq)]
pub struct AppliedReport {
    /// Fingerprint of the declared schema
    pub schema_hash: SchemaHash,
    /// Changes that were applied, in order
    pub applied: Vec<Change>,
    /// The change that failed, if the run halted on a failure
    pub failed: Option<Change>,
    /// Changes that were never attempted
    pub pending: Vec<Change>,
    /// Whether the applied changes were rolled back
    pub reverted: bool,
    /// Whether the run was skipped because history shows the schema is
    /// already current
    pub up_to_date: bool,
    /// Set when a halted run could neither roll back nor record its
    /// checkpoint. The live schema and history may then disagree.
    pub cleanup_error: Option<DriverError>,
}

impl AppliedReport {
    fn new(schema_hash: SchemaHash) -> Self {
        Self {
            schema_hash,
            applied: Vec::new(),
            failed: None,
            pending: Vec::new(),
            reverted: false,
            up_to_date: false,
            cleanup_error: None,
        }
    }

    /// Whether the run changed nothing.
    pub fn is_noop(&self) -> bool {
        self.applied.is_empty() || self.reverted
    }
}

static NEXT_OWNER: AtomicU64 = AtomicU64::new(0);

fn default_owner() -> String {
    format!(
        "justdb-{}-{}",
        std::process::id(),
        NEXT_OWNER.fetch_add(1, Ordering::Relaxed)
    )
}

/// Applies change sets through a driver.
pub struct Migrator<D> {
    driver: D,
    gate: Option<Arc<SchemaGate>>,
    cancel: CancelToken,
    confirm_destructive: bool,
    trust_history: bool,
    drain_timeout: Duration,
    owner: String,
}

impl<D: Driver> Migrator<D> {
    pub fn new(driver: D) -> Self {
        Self::from_config(driver, &MigrationConfig::default())
    }

    pub fn from_config(driver: D, config: &MigrationConfig) -> Self {
        Self {
            driver,
            gate: None,
            cancel: CancelToken::new(),
            confirm_destructive: config.confirm_destructive,
            trust_history: config.trust_history,
            drain_timeout: config.drain_timeout(),
            owner: config.lock_owner.clone().unwrap_or_else(default_owner),
        }
    }

    /// Close `gate` to record operations on altered entities while applying.
    pub fn with_gate(mut self, gate: Arc<SchemaGate>) -> Self {
        self.gate = Some(gate);
        self
    }

    /// Allow change sets that drop fields or entities.
    pub fn confirm_destructive(mut self, confirm: bool) -> Self {
        self.confirm_destructive = confirm;
        self
    }

    /// Skip runs whose declared schema matches the latest complete history
    /// entry.
    pub fn trust_history(mut self, trust: bool) -> Self {
        self.trust_history = trust;
        self
    }

    /// A handle that cancels the running (or next) migration between
    /// operations.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn driver(&self) -> &D {
        &self.driver
    }

    /// Validate `declared` and compute the changes the next run would apply.
    pub fn plan(&self, declared: &Schema) -> Result<ChangeSet, Error> {
        validate(declared)?;
        let live = self.driver.introspect().map_err(MigrationError::from)?;
        Ok(diff(declared, &live)?)
    }

    /// Bring the live schema in line with `declared`.
    pub fn migrate(&self, declared: &Schema) -> Result<AppliedReport, Error> {
        let hash = declared.fingerprint();
        let _span = tracing::info_span!("migrate", schema = %hash.short()).entered();

        validate(declared)?;

        let recorded = self.driver.history().map_err(MigrationError::from)?;
        if self.trust_history && history::is_up_to_date(&recorded, hash) {
            tracing::info!("schema is up to date, skipping");
            return Ok(AppliedReport {
                up_to_date: true,
                ..AppliedReport::new(hash)
            });
        }
        if let Some(checkpoint) = history::checkpoint(&recorded) {
            tracing::info!(
                applied = checkpoint.operations.len(),
                "resuming after a halted migration"
            );
        }

        let lock = SchemaLock::acquire(&self.driver, &self.owner)?;
        let live = self.driver.introspect().map_err(MigrationError::from)?;
        let changes = diff(declared, &live)?;
        let report = self.apply_locked(&changes)?;
        lock.release().map_err(MigrationError::from)?;
        Ok(report)
    }

    /// Apply a change set computed by [`diff`].
    pub fn apply(&self, changes: &ChangeSet) -> Result<AppliedReport, MigrationError> {
        let _span = tracing::info_span!("apply", schema = %changes.target().short()).entered();
        let lock = SchemaLock::acquire(&self.driver, &self.owner)?;
        let report = self.apply_locked(changes)?;
        lock.release()?;
        Ok(report)
    }

    pub fn history(&self) -> Result<Vec<HistoryEntry>, MigrationError> {
        Ok(self.driver.history()?)
    }

    /// The checkpoint left by a halted run, if the last run halted.
    pub fn checkpoint(&self) -> Result<Option<HistoryEntry>, MigrationError> {
        Ok(history::checkpoint(&self.driver.history()?).cloned())
    }

    fn apply_locked(&self, changes: &ChangeSet) -> Result<AppliedReport, MigrationError> {
        let mut report = AppliedReport::new(changes.target());
        if changes.is_empty() {
            tracing::info!("no changes");
            return Ok(report);
        }

        let destructive: Vec<String> = changes.destructive().map(ToString::to_string).collect();
        if !destructive.is_empty() && !self.confirm_destructive {
            return Err(MigrationError::ConfirmationRequired {
                changes: destructive,
            });
        }

        let _ticket = match &self.gate {
            Some(gate) => Some(gate.begin_migration(changes.entities(), self.drain_timeout)?),
            None => None,
        };

        let transactional = self.driver.capabilities().transactional_ddl;
        if transactional {
            self.driver.begin()?;
        }

        tracing::info!(changes = changes.len(), transactional, "applying changes");
        for (index, change) in changes.iter().enumerate() {
            if self.cancel.is_cancelled() {
                tracing::warn!(index, "migration cancelled");
                self.halt(changes, &mut report, index, transactional);
                return Err(MigrationError::Cancelled {
                    report: Box::new(report),
                });
            }

            if let Err(source) = self.driver.execute(change) {
                tracing::warn!(index, change = %change, error = %source, "change failed");
                report.failed = Some(change.clone());
                self.halt(changes, &mut report, index, transactional);
                return Err(MigrationError::Failed {
                    change: change.to_string(),
                    source,
                    report: Box::new(report),
                });
            }
            report.applied.push(change.clone());
        }

        let entry = HistoryEntry::complete(changes.target(), report.applied.clone());
        let finished = self
            .driver
            .append_history(entry)
            .and_then(|()| if transactional { self.driver.commit() } else { Ok(()) });
        if let Err(e) = finished {
            if transactional {
                if let Err(rollback) = self.driver.rollback() {
                    tracing::warn!(error = %rollback, "rollback failed");
                }
            }
            return Err(e.into());
        }

        tracing::info!(applied = report.applied.len(), "migration complete");
        Ok(report)
    }

    /// Stop at `index`: revert where possible, otherwise record the applied
    /// prefix as a checkpoint.
    fn halt(
        &self,
        changes: &ChangeSet,
        report: &mut AppliedReport,
        index: usize,
        transactional: bool,
    ) {
        let resume_at = if report.failed.is_some() { index + 1 } else { index };
        report.pending = changes.changes()[resume_at..].to_vec();

        if transactional {
            match self.driver.rollback() {
                Ok(()) => report.reverted = true,
                Err(e) => {
                    tracing::warn!(error = %e, "rollback failed");
                    report.cleanup_error = Some(e);
                }
            }
            return;
        }

        let checkpoint = HistoryEntry::partial(changes.target(), report.applied.clone(), index);
        if let Err(e) = self.driver.append_history(checkpoint) {
            tracing::warn!(error = %e, "failed to record migration checkpoint");
            report.cleanup_error = Some(e);
        }
    }
}
