//! Record operations that enforce the schema's invariants.
//!
//! Every write goes through [`IntegrityRuntime`], which checks field types,
//! uniqueness and referential integrity, and applies delete policies across
//! relationships. A call's effects are staged in memory and handed to the
//! store as one atomic batch, so a rejected call leaves no trace.

mod query;
mod stage;


pub use query::{Cursor, Query, ReadOptions, Related};

use crate::lock::{OperationTicket, SchemaGate};
use crate::record::{Mutation, Record, RecordState};
use crate::{ConstraintError, Error, RecordStore};
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use justdb_config::RuntimeConfig;
use justdb_schema::{
    AutoNow, Cardinality, Entity, Field, OnDelete, Relationship, ScalarType, Schema, Value,
};
use stage::Stage;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Identifies one record.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RecordRef {
    pub entity: String,
    pub key: Value,
}

impl RecordRef {
    fn new(entity: &str, key: &Value) -> Self {
        Self {
            entity: entity.to_string(),
            key: key.clone(),
        }
    }
}

impl fmt::Display for RecordRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.entity, self.key)
    }
}

/// Everything a delete call touched, in the order it was staged.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeleteEffects {
    pub soft_deleted: Vec<RecordRef>,
    /// Records whose foreign key was set to null
    pub nullified: Vec<RecordRef>,
    /// Records removed from the store
    pub purged: Vec<RecordRef>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Removal {
    /// Mark soft-deleted; records of entities without soft delete are
    /// removed instead.
    Soft(DateTime<Utc>),
    /// Remove outright, cascade children in any state with it.
    Hard,
    /// Remove a soft-deleted record and its soft-deleted cascade children.
    Purge,
}

/// A restrict relationship reached while staging, checked once the whole
/// call is staged.
struct Guard<'s> {
    rel: &'s Relationship,
    parent: RecordRef,
}

/// Enforces schema invariants on record operations against a store.
///
/// The schema is expected to have passed [`validate`](crate::validate).
///
/// ```
/// use justdb::schema::{Entity, Field, ScalarType, Schema, Value};
/// use justdb::{IntegrityRuntime, MemoryDriver, Migrator, ReadOptions, values};
///
/// let schema = Schema::new([Entity::builder("tags")
///     .field(Field::new("id", ScalarType::Integer).primary_key().auto_generated())
///     .field(Field::new("label", ScalarType::Text).unique())
///     .build()?])?;
///
/// let driver = MemoryDriver::new();
/// Migrator::new(&driver).migrate(&schema)?;
///
/// let runtime = IntegrityRuntime::new(&schema, &driver);
/// let tag = runtime.create("tags", values([("label", "rust".into())]))?;
/// assert_eq!(tag.get("id"), &Value::Integer(1));
/// assert!(runtime.create("tags", values([("label", "rust".into())])).is_err());
/// assert_eq!(runtime.list("tags", ReadOptions::live())?.count()?, 1);
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// ```
pub struct IntegrityRuntime<'a, S: ?Sized> {
    schema: &'a Schema,
    store: &'a S,
    gate: Option<Arc<SchemaGate>>,
    page_size: usize,
    gate_wait: Duration,
}

impl<'a, S: RecordStore + ?Sized> IntegrityRuntime<'a, S> {
    pub fn new(schema: &'a Schema, store: &'a S) -> Self {
        Self::with_config(schema, store, &RuntimeConfig::default())
    }

    pub fn with_config(schema: &'a Schema, store: &'a S, config: &RuntimeConfig) -> Self {
        Self {
            schema,
            store,
            gate: None,
            page_size: config.page_size.max(1),
            gate_wait: config.gate_wait(),
        }
    }

    /// Coordinate with migrations sharing `gate`.
    pub fn with_gate(mut self, gate: Arc<SchemaGate>) -> Self {
        self.gate = Some(gate);
        self
    }

    pub fn schema(&self) -> &'a Schema {
        self.schema
    }

    /// Insert a new live record.
    ///
    /// Omitted fields take their default; an omitted or null auto-generated
    /// integer key gets the next free value, and an omitted or null
    /// auto-now timestamp gets the current time.
    pub fn create(&self, entity: &str, values: IndexMap<String, Value>) -> Result<Record, Error> {
        let _ticket = self.enter(entity)?;
        let def = self.entity_def(entity)?;
        for name in values.keys() {
            self.field_def(def, name)?;
        }
        let now = Utc::now();

        let mut record = Record::new(entity, IndexMap::new());
        for field in &def.fields {
            let provided = values.get(&field.name);
            let mut value = match (provided, &field.default) {
                (Some(v), _) => v.clone(),
                (None, Some(default)) => default.clone(),
                (None, None) => Value::Null,
            };
            if value.is_null() && field.auto_generated {
                value = self.next_key(def, field)?;
            }
            if value.is_null() && field.auto_now.is_some() {
                value = Value::Timestamp(now);
            }
            check_value(def, field, &value, provided.is_some())?;
            record.set(field.name.clone(), value);
        }

        let key = key_of(def, &record);
        if self.store.get(entity, &key)?.is_some() {
            return Err(ConstraintError::DuplicateKey {
                entity: entity.to_string(),
                key,
            }
            .into());
        }
        self.check_unique(def, &record, None, None)?;
        self.check_foreign_keys(def, &record, None)?;

        self.store.commit(vec![Mutation::Insert {
            key: key.clone(),
            record: record.clone(),
        }])?;
        debug!(entity = %entity, key = %key, "record created");
        Ok(record)
    }

    /// Change fields of a live record. The primary key cannot change.
    ///
    /// Fields stamped on update get the current time unless `changes` sets
    /// them.
    pub fn update(
        &self,
        entity: &str,
        key: &Value,
        changes: IndexMap<String, Value>,
    ) -> Result<Record, Error> {
        let _ticket = self.enter(entity)?;
        let def = self.entity_def(entity)?;
        let current = self.require_live(entity, key)?;

        let mut record = current.clone();
        for (name, value) in &changes {
            let field = self.field_def(def, name)?;
            if field.primary_key && value != current.get(name) {
                return Err(ConstraintError::PrimaryKeyImmutable {
                    entity: entity.to_string(),
                    field: name.clone(),
                }
                .into());
            }
            check_value(def, field, value, true)?;
            record.set(name.clone(), value.clone());
        }
        let now = Value::Timestamp(Utc::now());
        for field in &def.fields {
            if field.auto_now == Some(AutoNow::OnUpdate) && !changes.contains_key(&field.name) {
                record.set(field.name.clone(), now.clone());
            }
        }

        self.check_unique(def, &record, Some(key), Some(&changes))?;
        self.check_foreign_keys(def, &record, Some(&changes))?;

        self.store.commit(vec![Mutation::Replace {
            key: key.clone(),
            record: record.clone(),
        }])?;
        debug!(entity = %entity, key = %key, fields = changes.len(), "record updated");
        Ok(record)
    }

    /// Delete a live record the way its entity allows: soft-delete it when
    /// the entity supports soft delete, otherwise remove it outright.
    pub fn delete(&self, entity: &str, key: &Value) -> Result<DeleteEffects, Error> {
        let _ticket = self.enter(entity)?;
        let def = self.entity_def(entity)?;
        let record = self.require_live(entity, key)?;
        let removal = if def.soft_delete {
            Removal::Soft(Utc::now())
        } else {
            Removal::Hard
        };
        self.remove_tree(record, removal)
    }

    /// Soft-delete a live record, applying each dependent relationship's
    /// delete policy to its live children. Cascades into entities without
    /// soft delete remove those children outright.
    ///
    /// A restrict relationship that still has a live child once the whole
    /// cascade is staged rejects the call.
    pub fn soft_delete(&self, entity: &str, key: &Value) -> Result<DeleteEffects, Error> {
        let _ticket = self.enter(entity)?;
        let def = self.entity_def(entity)?;
        if !def.soft_delete {
            return Err(ConstraintError::SoftDeleteUnsupported {
                entity: entity.to_string(),
            }
            .into());
        }
        let record = self.require_live(entity, key)?;
        self.remove_tree(record, Removal::Soft(Utc::now()))
    }

    /// Remove a soft-deleted record for good.
    ///
    /// Restrict children in any state, and live cascade children, block the
    /// purge. Soft-deleted cascade children are purged with it.
    pub fn purge(&self, entity: &str, key: &Value) -> Result<DeleteEffects, Error> {
        let _ticket = self.enter(entity)?;
        self.entity_def(entity)?;
        let record = self.require(entity, key)?;
        if record.is_live() {
            return Err(ConstraintError::NotSoftDeleted {
                entity: entity.to_string(),
                key: key.clone(),
            }
            .into());
        }
        self.remove_tree(record, Removal::Purge)
    }

    pub fn get(
        &self,
        entity: &str,
        key: &Value,
        options: ReadOptions,
    ) -> Result<Option<Record>, Error> {
        let _ticket = self.enter(entity)?;
        self.entity_def(entity)?;
        let record = self.store.get(entity, key)?;
        Ok(record.filter(|r| options.admits(r)))
    }

    /// All records of an entity, lazily paged in primary-key order.
    pub fn list(&self, entity: &str, options: ReadOptions) -> Result<Query<'a, S>, Error> {
        let _ticket = self.enter(entity)?;
        let def = self.entity_def(entity)?;
        Ok(Query::all(
            self.store,
            entity,
            &key_name(def),
            options,
            self.page_size,
        ))
    }

    /// Records reached from `record` through one of its entity's
    /// relationships: the parent for many-to-one, the children for
    /// one-to-many. Nothing is read until the result is iterated.
    pub fn load_related(
        &self,
        record: &Record,
        relationship: &str,
        options: ReadOptions,
    ) -> Result<Related<'a, S>, Error> {
        let _ticket = self.enter(&record.entity)?;
        let def = self.entity_def(&record.entity)?;
        let rel = def.relationship(relationship).ok_or_else(|| {
            ConstraintError::UnknownRelationship {
                entity: record.entity.clone(),
                relationship: relationship.to_string(),
            }
        })?;
        let target = self.entity_def(&rel.references)?;

        let query = match rel.cardinality {
            Cardinality::ManyToOne => Query::by_key(
                self.store,
                &target.name,
                &key_name(target),
                record.get(&rel.foreign_key).clone(),
                options,
            ),
            Cardinality::OneToMany => Query::matching(
                self.store,
                &target.name,
                &key_name(target),
                &rel.foreign_key,
                key_of(def, record),
                options,
                self.page_size,
            ),
        };
        Ok(query)
    }

    /// Stage a delete and everything its policies imply, check restrict
    /// relationships against the staged outcome, then commit it as one batch.
    fn remove_tree(&self, record: Record, removal: Removal) -> Result<DeleteEffects, Error> {
        let def = self.entity_def(&record.entity)?;
        let root = RecordRef::new(&record.entity, &key_of(def, &record));
        let mut stage = Stage::default();
        let mut effects = DeleteEffects::default();
        let mut guards = Vec::new();
        self.stage_delete(&mut stage, &mut effects, &mut guards, record, removal)?;
        self.check_restrict(&stage, &guards, removal)?;
        self.store.commit(stage.into_mutations())?;

        debug!(
            record = %root,
            soft_deleted = effects.soft_deleted.len(),
            nullified = effects.nullified.len(),
            purged = effects.purged.len(),
            "record deleted"
        );
        Ok(effects)
    }

    fn stage_delete(
        &self,
        stage: &mut Stage,
        effects: &mut DeleteEffects,
        guards: &mut Vec<Guard<'a>>,
        mut record: Record,
        removal: Removal,
    ) -> Result<(), Error> {
        let def = self.entity_def(&record.entity)?;
        let key = key_of(def, &record);
        let entity = record.entity.clone();

        // Staged before recursing, so cycles through this record stop here.
        let removed = match removal {
            Removal::Soft(at) if def.soft_delete => {
                record.state = RecordState::SoftDeleted { at };
                stage.put(key.clone(), record);
                effects.soft_deleted.push(RecordRef::new(&entity, &key));
                false
            }
            _ => {
                stage.remove(&entity, key.clone());
                effects.purged.push(RecordRef::new(&entity, &key));
                true
            }
        };
        // Once a record is gone, nothing may keep pointing at it.
        let next = match removal {
            Removal::Soft(_) if removed => Removal::Hard,
            other => other,
        };

        for rel in self.schema.dependents(&entity) {
            let children: Vec<Record> = self
                .referencing(stage, rel, &key)?
                .into_iter()
                .filter(|child| removed || child.is_live())
                .collect();
            if children.is_empty() {
                continue;
            }
            let child_def = self.entity_def(rel.child())?;

            match rel.on_delete {
                OnDelete::Restrict => guards.push(Guard {
                    rel,
                    parent: RecordRef::new(&entity, &key),
                }),
                OnDelete::Cascade => {
                    if next == Removal::Purge && children.iter().any(Record::is_live) {
                        return Err(ConstraintError::Referenced {
                            entity,
                            key,
                            relationship: qualified(rel),
                            dependent: rel.child().to_string(),
                        }
                        .into());
                    }
                    for child in children {
                        let child_key = key_of(child_def, &child);
                        // An earlier branch may already have reached it.
                        match self.current(stage, rel.child(), &child_key)? {
                            Some(child) if removed || child.is_live() => {
                                debug!(
                                    parent = %RecordRef::new(&entity, &key),
                                    child = %RecordRef::new(rel.child(), &child_key),
                                    "cascading delete"
                                );
                                self.stage_delete(stage, effects, guards, child, next)?;
                            }
                            _ => {}
                        }
                    }
                }
                OnDelete::SetNull => {
                    for mut child in children {
                        let child_key = key_of(child_def, &child);
                        child.set(rel.foreign_key.clone(), Value::Null);
                        stage.put(child_key.clone(), child);
                        effects
                            .nullified
                            .push(RecordRef::new(rel.child(), &child_key));
                    }
                }
            }
        }
        Ok(())
    }

    /// A restrict child blocks its parent if it still exists once the parent
    /// is removed, or is still live once the parent is soft-deleted.
    fn check_restrict(
        &self,
        stage: &Stage,
        guards: &[Guard<'a>],
        removal: Removal,
    ) -> Result<(), Error> {
        for guard in guards {
            let parent = &guard.parent;
            let removed = matches!(stage.get(&parent.entity, &parent.key), Some(None));
            let count = self
                .referencing(stage, guard.rel, &parent.key)?
                .iter()
                .filter(|child| removed || child.is_live())
                .count();
            if count == 0 {
                continue;
            }
            let relationship = qualified(guard.rel);
            let dependent = guard.rel.child().to_string();
            return Err(match removal {
                Removal::Purge => ConstraintError::Referenced {
                    entity: parent.entity.clone(),
                    key: parent.key.clone(),
                    relationship,
                    dependent,
                },
                _ => ConstraintError::Restricted {
                    entity: parent.entity.clone(),
                    key: parent.key.clone(),
                    relationship,
                    dependent,
                    count,
                },
            }
            .into());
        }
        Ok(())
    }

    /// Children holding `key` in the relationship's foreign key, as seen
    /// through the stage. Removed records are skipped.
    fn referencing(
        &self,
        stage: &Stage,
        rel: &Relationship,
        key: &Value,
    ) -> Result<Vec<Record>, Error> {
        let child_def = self.entity_def(rel.child())?;
        let all = Query::all(
            self.store,
            rel.child(),
            &key_name(child_def),
            ReadOptions::include_deleted(),
            self.page_size,
        );

        let mut children = Vec::new();
        for stored in all.iter() {
            let stored = stored?;
            let child_key = key_of(child_def, &stored);
            let record = match stage.get(rel.child(), &child_key) {
                None => stored,
                Some(Some(staged)) => staged.clone(),
                Some(None) => continue,
            };
            if record.get(&rel.foreign_key) == key {
                children.push(record);
            }
        }
        Ok(children)
    }

    /// A record as seen through the stage.
    fn current(&self, stage: &Stage, entity: &str, key: &Value) -> Result<Option<Record>, Error> {
        match stage.get(entity, key) {
            Some(staged) => Ok(staged.cloned()),
            None => Ok(self.store.get(entity, key)?),
        }
    }

    fn require_live(&self, entity: &str, key: &Value) -> Result<Record, Error> {
        let record = self.require(entity, key)?;
        if !record.is_live() {
            return Err(ConstraintError::NotLive {
                entity: entity.to_string(),
                key: key.clone(),
            }
            .into());
        }
        Ok(record)
    }

    fn require(&self, entity: &str, key: &Value) -> Result<Record, Error> {
        self.store.get(entity, key)?.ok_or_else(|| {
            ConstraintError::NotFound {
                entity: entity.to_string(),
                key: key.clone(),
            }
            .into()
        })
    }

    /// Next value for an auto-generated integer field: one past the highest
    /// in use, counting soft-deleted records.
    fn next_key(&self, def: &Entity, field: &Field) -> Result<Value, Error> {
        if field.ty.scalar != ScalarType::Integer {
            return Ok(Value::Null);
        }
        let all = Query::all(
            self.store,
            &def.name,
            &key_name(def),
            ReadOptions::include_deleted(),
            self.page_size,
        );
        let mut highest = 0;
        for record in all.iter() {
            if let Some(n) = record?.get(&field.name).as_integer() {
                highest = highest.max(n);
            }
        }
        highest.checked_add(1).map(Value::Integer).ok_or_else(|| {
            ConstraintError::KeysExhausted {
                entity: def.name.clone(),
                field: field.name.clone(),
            }
            .into()
        })
    }

    /// Unique fields and unique indexes hold among live records. Null
    /// values never collide. With `changed`, only constraints covering a
    /// changed field are checked.
    fn check_unique(
        &self,
        def: &Entity,
        record: &Record,
        exclude: Option<&Value>,
        changed: Option<&IndexMap<String, Value>>,
    ) -> Result<(), Error> {
        let groups: Vec<Vec<&str>> = def
            .fields
            .iter()
            .filter(|f| f.unique && !f.primary_key)
            .map(|f| vec![f.name.as_str()])
            .chain(
                def.indexes
                    .iter()
                    .filter(|i| i.unique)
                    .map(|i| i.fields.iter().map(String::as_str).collect()),
            )
            .filter(|group| changed.is_none_or(|c| group.iter().any(|f| c.contains_key(*f))))
            .filter(|group| group.iter().all(|f| !record.get(f).is_null()))
            .collect();
        if groups.is_empty() {
            return Ok(());
        }

        let live = Query::all(
            self.store,
            &def.name,
            &key_name(def),
            ReadOptions::live(),
            self.page_size,
        );
        for other in live.iter() {
            let other = other?;
            if exclude.is_some_and(|k| other.get(&key_name(def)) == k) {
                continue;
            }
            for group in &groups {
                if group.iter().all(|f| other.get(f) == record.get(f)) {
                    let value = group
                        .iter()
                        .map(|f| record.get(f).to_string())
                        .collect::<Vec<_>>()
                        .join(", ");
                    return Err(ConstraintError::UniqueViolation {
                        entity: def.name.clone(),
                        fields: group.iter().map(|f| f.to_string()).collect(),
                        value,
                    }
                    .into());
                }
            }
        }
        Ok(())
    }

    /// Non-null foreign keys must name a live parent.
    fn check_foreign_keys(
        &self,
        def: &Entity,
        record: &Record,
        changed: Option<&IndexMap<String, Value>>,
    ) -> Result<(), Error> {
        for rel in self.schema.foreign_keys(&def.name) {
            if changed.is_some_and(|c| !c.contains_key(&rel.foreign_key)) {
                continue;
            }
            let value = record.get(&rel.foreign_key);
            if value.is_null() {
                continue;
            }
            let parent = self.store.get(rel.parent(), value)?;
            if !parent.as_ref().is_some_and(Record::is_live) {
                return Err(ConstraintError::ForeignKeyViolation {
                    entity: def.name.clone(),
                    field: rel.foreign_key.clone(),
                    references: rel.parent().to_string(),
                    value: value.clone(),
                }
                .into());
            }
        }
        Ok(())
    }

    fn entity_def(&self, entity: &str) -> Result<&'a Entity, ConstraintError> {
        self.schema
            .entity(entity)
            .ok_or_else(|| ConstraintError::UnknownEntity {
                entity: entity.to_string(),
            })
    }

    fn field_def<'e>(&self, def: &'e Entity, name: &str) -> Result<&'e Field, ConstraintError> {
        def.field(name).ok_or_else(|| ConstraintError::UnknownField {
            entity: def.name.clone(),
            field: name.to_string(),
        })
    }

    /// Wait out migrations touching anything `entity` can reach.
    fn enter(&self, entity: &str) -> Result<Option<OperationTicket<'_>>, Error> {
        let Some(gate) = &self.gate else {
            return Ok(None);
        };
        let ticket = gate.enter(self.schema.connected(entity), self.gate_wait)?;
        Ok(Some(ticket))
    }
}

fn check_value(
    def: &Entity,
    field: &Field,
    value: &Value,
    provided: bool,
) -> Result<(), ConstraintError> {
    if value.is_null() && !field.ty.nullable {
        return Err(if provided {
            ConstraintError::NullViolation {
                entity: def.name.clone(),
                field: field.name.clone(),
            }
        } else {
            ConstraintError::MissingField {
                entity: def.name.clone(),
                field: field.name.clone(),
            }
        });
    }
    if !value.conforms_to(&field.ty) {
        return Err(ConstraintError::TypeMismatch {
            entity: def.name.clone(),
            field: field.name.clone(),
            expected: field.ty,
            found: value.clone(),
        });
    }
    Ok(())
}

fn key_name(def: &Entity) -> String {
    def.primary_key()
        .map(|f| f.name.clone())
        .unwrap_or_default()
}

fn key_of(def: &Entity, record: &Record) -> Value {
    record.get(&key_name(def)).clone()
}

fn qualified(rel: &Relationship) -> String {
    format!("{}.{}", rel.entity, rel.name)
}
