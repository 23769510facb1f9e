use crate::migrate::AppliedReport;
use justdb_schema::{FieldType, SchemaError, Value};
use thiserror::Error;

/// Any error produced by a justdb operation.
#[derive(Debug, Error)]
pub enum Error {
    #[error("schema error: {0}")]
    Schema(#[from] SchemaError),

    #[error("migration error: {0}")]
    Migration(#[from] MigrationError),

    #[error("constraint violation: {0}")]
    Constraint(#[from] ConstraintError),

    #[error(transparent)]
    InProgress(#[from] MigrationInProgress),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

/// A migration holds the schema. Retry later.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("migration in progress: {detail}")]
pub struct MigrationInProgress {
    pub detail: String,
}

/// A change set could not be applied.
#[derive(Debug, Error)]
pub enum MigrationError {
    #[error(transparent)]
    InProgress(#[from] MigrationInProgress),

    #[error("destructive changes need confirmation: {}", .changes.join("; "))]
    ConfirmationRequired { changes: Vec<String> },

    #[error("'{change}' failed after {} applied change(s): {source}", .report.applied.len())]
    Failed {
        change: String,
        source: DriverError,
        report: Box<AppliedReport>,
    },

    #[error("migration cancelled after {} applied change(s)", .report.applied.len())]
    Cancelled { report: Box<AppliedReport> },

    #[error("operations on {} did not finish in time", .entities.join(", "))]
    Busy { entities: Vec<String> },

    #[error("driver error: {0}")]
    Driver(#[from] DriverError),
}

impl MigrationError {
    /// The report of a halted run, if the migration got as far as applying.
    pub fn report(&self) -> Option<&AppliedReport> {
        match self {
            MigrationError::Failed { report, .. } | MigrationError::Cancelled { report } => {
                Some(report)
            }
            _ => None,
        }
    }
}

/// A storage driver refused or failed a structural operation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DriverError {
    #[error("{change}: {reason}")]
    Rejected { change: String, reason: String },

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("backend: {0}")]
    Backend(String),
}

/// Record storage failed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StorageError {
    #[error("no storage for entity '{0}'")]
    UnknownEntity(String),

    #[error("record {entity}[{key}] already exists")]
    Conflict { entity: String, key: Value },

    #[error("record {entity}[{key}] does not exist")]
    Missing { entity: String, key: Value },

    #[error("duplicate unique values ({values}) in '{entity}'")]
    Duplicate { entity: String, values: String },

    #[error("backend: {0}")]
    Backend(String),
}

/// A record mutation would violate a schema invariant. Nothing was changed.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConstraintError {
    #[error("unknown entity '{entity}'")]
    UnknownEntity { entity: String },

    #[error("unknown field '{entity}.{field}'")]
    UnknownField { entity: String, field: String },

    #[error("unknown relationship '{entity}.{relationship}'")]
    UnknownRelationship { entity: String, relationship: String },

    #[error("{entity}[{key}] does not exist")]
    NotFound { entity: String, key: Value },

    #[error("'{entity}.{field}' is {expected}, got {found}")]
    TypeMismatch {
        entity: String,
        field: String,
        expected: FieldType,
        found: Value,
    },

    #[error("required field '{entity}.{field}' is missing")]
    MissingField { entity: String, field: String },

    #[error("'{entity}.{field}' cannot be null")]
    NullViolation { entity: String, field: String },

    #[error("{entity}[{key}] already exists")]
    DuplicateKey { entity: String, key: Value },

    #[error("'{entity}.{field}' has no key left to generate")]
    KeysExhausted { entity: String, field: String },

    #[error("{entity}({}) = {value} is already taken by a live record", .fields.join(", "))]
    UniqueViolation {
        entity: String,
        fields: Vec<String>,
        value: String,
    },

    #[error("'{entity}.{field}' = {value} does not match a live {references} record")]
    ForeignKeyViolation {
        entity: String,
        field: String,
        references: String,
        value: Value,
    },

    #[error("primary key '{entity}.{field}' cannot be changed")]
    PrimaryKeyImmutable { entity: String, field: String },

    #[error("{entity}[{key}] is not live")]
    NotLive { entity: String, key: Value },

    #[error("{entity}[{key}] must be soft-deleted before it can be purged")]
    NotSoftDeleted { entity: String, key: Value },

    #[error("entity '{entity}' does not support soft delete")]
    SoftDeleteUnsupported { entity: String },

    #[error("{entity}[{key}] is still referenced by {count} {dependent} record(s) through restrict relationship '{relationship}'")]
    Restricted {
        entity: String,
        key: Value,
        relationship: String,
        dependent: String,
        count: usize,
    },

    #[error("{entity}[{key}] is still referenced by {dependent} through '{relationship}'")]
    Referenced {
        entity: String,
        key: Value,
        relationship: String,
        dependent: String,
    },
}
