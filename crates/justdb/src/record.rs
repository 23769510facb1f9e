//! Runtime records.

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use justdb_schema::Value;

/// Lifecycle state of a record. Purged records no longer exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordState {
    Live,
    SoftDeleted { at: DateTime<Utc> },
}

/// A stored record: field values plus lifecycle state.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    /// Entity the record belongs to
    pub entity: String,
    pub values: IndexMap<String, Value>,
    pub state: RecordState,
}

impl Record {
    pub fn new(entity: impl Into<String>, values: IndexMap<String, Value>) -> Self {
        Self {
            entity: entity.into(),
            values,
            state: RecordState::Live,
        }
    }

    /// Value of a field. Missing fields read as `Null`.
    pub fn get(&self, field: &str) -> &Value {
        const NULL: &Value = &Value::Null;
        self.values.get(field).unwrap_or(NULL)
    }

    pub fn set(&mut self, field: impl Into<String>, value: impl Into<Value>) {
        self.values.insert(field.into(), value.into());
    }

    pub fn is_live(&self) -> bool {
        self.state == RecordState::Live
    }

    pub fn deleted_at(&self) -> Option<DateTime<Utc>> {
        match self.state {
            RecordState::Live => None,
            RecordState::SoftDeleted { at } => Some(at),
        }
    }
}

/// One write in an atomic batch handed to [`RecordStore::commit`](crate::RecordStore::commit).
#[derive(Debug, Clone, PartialEq)]
pub enum Mutation {
    /// Store a new record. Fails if the key exists.
    Insert { key: Value, record: Record },
    /// Overwrite an existing record. Fails if the key does not exist.
    Replace { key: Value, record: Record },
    /// Remove a record for good. Fails if the key does not exist.
    Remove { entity: String, key: Value },
}

impl Mutation {
    pub fn entity(&self) -> &str {
        match self {
            Mutation::Insert { record, .. } | Mutation::Replace { record, .. } => &record.entity,
            Mutation::Remove { entity, .. } => entity,
        }
    }
}

/// Build a record value map from `(field, value)` pairs.
///
/// ```
/// use justdb::values;
///
/// let v = values([("name", "Widget".into()), ("price", 10.into())]);
/// assert_eq!(v.len(), 2);
/// ```
pub fn values<I, K>(pairs: I) -> IndexMap<String, Value>
where
    I: IntoIterator<Item = (K, Value)>,
    K: Into<String>,
{
    pairs.into_iter().map(|(k, v)| (k.into(), v)).collect()
}
