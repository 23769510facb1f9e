//! Declarative schemas with migrations and referential integrity.
//!
//! This crate provides:
//! - Validation of declared schemas ([`validate`])
//! - Diffing a declared schema against a live one into an ordered,
//!   dependency-safe [`ChangeSet`] ([`diff`])
//! - Applying change sets through a storage [`Driver`] with locking,
//!   history and partial-failure reporting ([`Migrator`])
//! - Record operations that enforce uniqueness, foreign keys and delete
//!   policies across relationships ([`IntegrityRuntime`])
//!
//! # Migrations
//!
//! A migration cycle introspects the live schema, diffs the declared one
//! against it and applies the result under the driver's schema lock:
//!
//! ```
//! use justdb::schema::{Entity, Field, ScalarType, Schema};
//! use justdb::{MemoryDriver, Migrator};
//!
//! let declared = Schema::new([Entity::builder("users")
//!     .field(Field::new("id", ScalarType::Integer).primary_key())
//!     .field(Field::new("email", ScalarType::Text).unique())
//!     .build()?])?;
//!
//! let driver = MemoryDriver::new();
//! let migrator = Migrator::new(&driver);
//! assert!(!migrator.migrate(&declared)?.is_noop());
//!
//! // Converged: a second run has nothing to do.
//! assert!(migrator.plan(&declared)?.is_empty());
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! # Deletes
//!
//! Records of entities that support soft delete are first soft-deleted,
//! then purged. Each relationship's [`OnDelete`](schema::OnDelete) policy
//! decides what happens to the records that reference a deleted one:
//! cascade, set the foreign key to null, or refuse.

mod diff;
mod driver;
mod error;
mod history;
mod lock;
mod memory;
mod migrate;
mod record;
pub mod runtime;
pub mod solver;
mod traced;
mod validate;

pub use diff::{Change, ChangeSet, diff};
pub use driver::{Capabilities, Driver, LockState, RecordStore};
pub use error::{
    ConstraintError, DriverError, Error, MigrationError, MigrationInProgress, StorageError,
};
pub use history::{HistoryEntry, HistoryStatus, checkpoint, is_up_to_date};
pub use lock::{CancelToken, MigrationTicket, OperationTicket, SchemaGate, SchemaLock};
pub use memory::MemoryDriver;
pub use migrate::{AppliedReport, Migrator};
pub use record::{Mutation, Record, RecordState, values};
pub use runtime::{DeleteEffects, IntegrityRuntime, Query, ReadOptions, RecordRef, Related};
pub use traced::TracedDriver;
pub use validate::validate;

// Re-export the model and configuration crates
pub use justdb_config as config;
pub use justdb_schema as schema;

pub type Result<T, E = Error> = std::result::Result<T, E>;
