//! In-memory storage backend.
//!
//! [`MemoryDriver`] implements both [`Driver`] and [`RecordStore`] over
//! shared in-process state. It enforces the same data rules a relational
//! backend would (a required field cannot be added to a non-empty entity
//! without a default, type changes must convert every stored value, new
//! unique indexes and relationships must hold for existing records), so it
//! serves as the reference backend for tests and embedded use.
//!
//! Transactions keep an undo log of structural changes. Rolling back restores
//! only the entities those changes touched, so records written meanwhile to
//! other entities survive.

use crate::history::HistoryEntry;
use crate::record::{Mutation, Record};
use crate::{Capabilities, Change, Driver, DriverError, LockState, RecordStore, StorageError};
use indexmap::IndexMap;
use justdb_schema::{Entity, Field, Schema, Value};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::ops::Bound;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

type Hook = Arc<dyn Fn(&Change) -> Result<(), DriverError> + Send + Sync>;

#[derive(Debug, Clone, Default)]
struct Tables {
    entities: IndexMap<String, Entity>,
    records: HashMap<String, BTreeMap<Value, Record>>,
    history: Vec<HistoryEntry>,
}

/// Prior state of the entity a structural change touched.
#[derive(Debug)]
struct Undo {
    name: String,
    /// Definition and position before the change; `None` if it did not exist.
    entity: Option<(usize, Entity)>,
    /// Records before the change, kept only when the change rewrites them.
    records: Option<BTreeMap<Value, Record>>,
}

#[derive(Debug, Default)]
struct Transaction {
    undo: Vec<Undo>,
    history_len: usize,
}

#[derive(Default)]
struct State {
    tables: Tables,
    transaction: Option<Transaction>,
    lock_holder: Option<String>,
    hook: Option<Hook>,
}

/// Shared in-memory storage. Clones share state.
#[derive(Clone)]
pub struct MemoryDriver {
    state: Arc<Mutex<State>>,
    transactional_ddl: bool,
}

impl std::fmt::Debug for MemoryDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryDriver")
            .field("transactional_ddl", &self.transactional_ddl)
            .finish_non_exhaustive()
    }
}

impl Default for MemoryDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryDriver {
    /// A driver with transactional DDL.
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(State::default())),
            transactional_ddl: true,
        }
    }

    /// A driver that applies structural changes immediately and cannot roll
    /// them back.
    pub fn non_transactional() -> Self {
        Self {
            transactional_ddl: false,
            ..Self::new()
        }
    }

    /// Run `hook` before every structural change. An error from the hook
    /// fails the change.
    pub fn set_hook(&self, hook: impl Fn(&Change) -> Result<(), DriverError> + Send + Sync + 'static) {
        self.state().hook = Some(Arc::new(hook));
    }

    pub fn clear_hook(&self) {
        self.state().hook = None;
    }

    /// All stored records of an entity in key order, soft-deleted included.
    pub fn records(&self, entity: &str) -> Vec<Record> {
        self.state()
            .tables
            .records
            .get(entity)
            .map(|rows| rows.values().cloned().collect())
            .unwrap_or_default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn reject(change: &Change, reason: impl Into<String>) -> DriverError {
    DriverError::Rejected {
        change: change.to_string(),
        reason: reason.into(),
    }
}

/// First duplicated value combination among live records, skipping
/// combinations that contain a null.
fn duplicate<'a>(rows: impl Iterator<Item = &'a Record>, fields: &[String]) -> Option<String> {
    let mut seen = HashSet::new();
    for record in rows.filter(|r| r.is_live()) {
        let combo: Vec<Value> = fields.iter().map(|f| record.get(f).clone()).collect();
        if combo.iter().any(Value::is_null) {
            continue;
        }
        if !seen.insert(combo.clone()) {
            let shown: Vec<String> = combo.iter().map(ToString::to_string).collect();
            return Some(shown.join(", "));
        }
    }
    None
}

impl Tables {
    fn undo_for(&self, change: &Change) -> Undo {
        let name = change.entity().to_string();
        let entity = self
            .entities
            .get_full(&name)
            .map(|(position, _, entity)| (position, entity.clone()));
        let rewrites_records = matches!(
            change,
            Change::DropEntity(_)
                | Change::AddField { .. }
                | Change::DropField { .. }
                | Change::AlterField { .. }
        );
        let records = if rewrites_records {
            self.records.get(&name).cloned()
        } else {
            None
        };
        Undo {
            name,
            entity,
            records,
        }
    }

    fn undo(&mut self, undo: Undo) {
        match undo.entity {
            Some((position, entity)) => match self.entities.get_mut(&undo.name) {
                Some(slot) => *slot = entity,
                None => {
                    let position = position.min(self.entities.len());
                    self.entities.shift_insert(position, undo.name.clone(), entity);
                }
            },
            None => {
                self.entities.shift_remove(&undo.name);
                self.records.remove(&undo.name);
            }
        }
        if let Some(records) = undo.records {
            self.records.insert(undo.name, records);
        }
    }

    fn entity_mut(&mut self, change: &Change, name: &str) -> Result<&mut Entity, DriverError> {
        self.entities
            .get_mut(name)
            .ok_or_else(|| reject(change, format!("entity '{}' does not exist", name)))
    }

    fn rows(&self, name: &str) -> impl Iterator<Item = &Record> {
        self.records.get(name).into_iter().flat_map(|r| r.values())
    }

    fn apply(&mut self, change: &Change) -> Result<(), DriverError> {
        match change {
            Change::CreateEntity(entity) => {
                if self.entities.contains_key(&entity.name) {
                    return Err(reject(change, "entity already exists"));
                }
                self.entities.insert(entity.name.clone(), entity.clone());
                self.records.insert(entity.name.clone(), BTreeMap::new());
            }

            Change::DropEntity(name) => {
                if self.entities.shift_remove(name).is_none() {
                    return Err(reject(change, "entity does not exist"));
                }
                self.records.remove(name);
            }

            Change::AddField { entity, field } => self.add_field(change, entity, field)?,

            Change::DropField { entity, field } => {
                let e = self.entity_mut(change, entity)?;
                let before = e.fields.len();
                e.fields.retain(|f| f.name != *field);
                if e.fields.len() == before {
                    return Err(reject(change, "field does not exist"));
                }
                for record in self.records.entry(entity.clone()).or_default().values_mut() {
                    record.values.shift_remove(field);
                }
            }

            Change::AlterField { entity, from, to } => self.alter_field(change, entity, from, to)?,

            Change::AddIndex { entity, index } => {
                if index.unique {
                    if let Some(dup) = duplicate(self.rows(entity), &index.fields) {
                        return Err(reject(change, format!("duplicate values ({})", dup)));
                    }
                }
                let e = self.entity_mut(change, entity)?;
                if e.index(&index.key()).is_some() {
                    return Err(reject(change, "index already exists"));
                }
                e.indexes.push(index.clone());
            }

            Change::DropIndex { entity, index } => {
                let e = self.entity_mut(change, entity)?;
                let before = e.indexes.len();
                e.indexes.retain(|i| i.key() != index.key());
                if e.indexes.len() == before {
                    return Err(reject(change, "index does not exist"));
                }
            }

            Change::AddRelationship(rel) => {
                if !self.entities.contains_key(&rel.references) {
                    let reason = format!("entity '{}' does not exist", rel.references);
                    return Err(reject(change, reason));
                }
                let has_fk = self
                    .entities
                    .get(rel.child())
                    .is_some_and(|e| e.field(&rel.foreign_key).is_some());
                if !has_fk {
                    return Err(reject(change, "foreign key field does not exist"));
                }
                let parents = self.records.get(rel.parent());
                let orphan = self
                    .rows(rel.child())
                    .map(|r| r.get(&rel.foreign_key))
                    .find(|v| !v.is_null() && !parents.is_some_and(|p| p.contains_key(*v)));
                if let Some(value) = orphan {
                    let reason = format!(
                        "{} = {} has no matching {} record",
                        rel.foreign_key,
                        value,
                        rel.parent()
                    );
                    return Err(reject(change, reason));
                }
                let key = rel.key();
                let e = self.entity_mut(change, &rel.entity)?;
                if e.relationships.iter().any(|r| r.key() == key) {
                    return Err(reject(change, "relationship already exists"));
                }
                e.relationships.push(rel.clone());
            }

            Change::DropRelationship(rel) => {
                let key = rel.key();
                let e = self.entity_mut(change, &rel.entity)?;
                let before = e.relationships.len();
                e.relationships.retain(|r| r.key() != key);
                if e.relationships.len() == before {
                    return Err(reject(change, "relationship does not exist"));
                }
            }

            Change::SetSoftDelete { entity, enabled } => {
                if !enabled && self.rows(entity).any(|r| !r.is_live()) {
                    return Err(reject(change, "soft-deleted records must be purged first"));
                }
                self.entity_mut(change, entity)?.soft_delete = *enabled;
            }
        }
        Ok(())
    }

    fn add_field(&mut self, change: &Change, entity: &str, field: &Field) -> Result<(), DriverError> {
        let e = self.entity_mut(change, entity)?;
        if e.field(&field.name).is_some() {
            return Err(reject(change, "field already exists"));
        }
        e.fields.push(field.clone());

        let fill = field.default.clone().unwrap_or_default();
        let rows = self.records.entry(entity.to_string()).or_default();
        if !rows.is_empty() {
            if !fill.conforms_to(&field.ty) {
                let reason = format!("existing records cannot be filled with {}", fill);
                return Err(reject(change, reason));
            }
            if field.unique && !fill.is_null() && rows.values().filter(|r| r.is_live()).count() > 1 {
                return Err(reject(change, format!("default {} would not be unique", fill)));
            }
        }
        for record in rows.values_mut() {
            record.values.insert(field.name.clone(), fill.clone());
        }
        Ok(())
    }

    fn alter_field(
        &mut self,
        change: &Change,
        entity: &str,
        from: &Field,
        to: &Field,
    ) -> Result<(), DriverError> {
        let rows = self.records.entry(entity.to_string()).or_default();
        if from.primary_key != to.primary_key && !rows.is_empty() {
            return Err(reject(change, "cannot change the primary key of a non-empty entity"));
        }

        let mut converted = Vec::with_capacity(rows.len());
        for (key, record) in rows.iter() {
            let value = record.get(&from.name);
            let Some(new) = value.coerce_to(to.ty.scalar) else {
                return Err(reject(change, format!("cannot convert {} to {}", value, to.ty.scalar)));
            };
            if new.is_null() && !to.ty.nullable {
                return Err(reject(change, format!("{} key {} holds null", to.name, key)));
            }
            converted.push((key.clone(), new));
        }

        let mut staged: Vec<Record> = rows.values().cloned().collect();
        for (record, (_, value)) in staged.iter_mut().zip(&converted) {
            record.values.insert(to.name.clone(), value.clone());
        }
        if to.unique {
            if let Some(dup) = duplicate(staged.iter(), std::slice::from_ref(&to.name)) {
                return Err(reject(change, format!("duplicate values ({})", dup)));
            }
        }

        for (key, value) in converted {
            if let Some(record) = rows.get_mut(&key) {
                record.values.insert(to.name.clone(), value);
            }
        }
        let e = self.entity_mut(change, entity)?;
        match e.fields.iter_mut().find(|f| f.name == from.name) {
            Some(slot) => *slot = to.clone(),
            None => return Err(reject(change, "field does not exist")),
        }
        Ok(())
    }
}

impl Driver for MemoryDriver {
    fn capabilities(&self) -> Capabilities {
        Capabilities {
            transactional_ddl: self.transactional_ddl,
        }
    }

    fn introspect(&self) -> Result<Schema, DriverError> {
        let entities: Vec<Entity> = self.state().tables.entities.values().cloned().collect();
        Schema::new(entities).map_err(|e| DriverError::Backend(e.to_string()))
    }

    fn execute(&self, change: &Change) -> Result<(), DriverError> {
        let hook = self.state().hook.clone();
        if let Some(hook) = hook {
            hook(change)?;
        }

        let mut state = self.state();
        // Apply to a copy so a rejected change leaves nothing behind.
        let mut tables = state.tables.clone();
        tables.apply(change)?;
        if state.transaction.is_some() {
            let undo = state.tables.undo_for(change);
            if let Some(transaction) = state.transaction.as_mut() {
                transaction.undo.push(undo);
            }
        }
        state.tables = tables;
        Ok(())
    }

    fn begin(&self) -> Result<(), DriverError> {
        if !self.transactional_ddl {
            return Err(DriverError::Unsupported("transactional DDL".to_string()));
        }
        let mut state = self.state();
        if state.transaction.is_some() {
            return Err(DriverError::Backend("transaction already open".to_string()));
        }
        state.transaction = Some(Transaction {
            undo: Vec::new(),
            history_len: state.tables.history.len(),
        });
        Ok(())
    }

    fn commit(&self) -> Result<(), DriverError> {
        self.state().transaction = None;
        Ok(())
    }

    fn rollback(&self) -> Result<(), DriverError> {
        let mut state = self.state();
        let Some(transaction) = state.transaction.take() else {
            return Err(DriverError::Backend("no open transaction".to_string()));
        };
        for undo in transaction.undo.into_iter().rev() {
            state.tables.undo(undo);
        }
        state.tables.history.truncate(transaction.history_len);
        Ok(())
    }

    fn try_lock(&self, owner: &str) -> Result<LockState, DriverError> {
        let mut state = self.state();
        if let Some(holder) = state.lock_holder.as_ref().filter(|h| *h != owner) {
            return Ok(LockState::HeldBy(holder.clone()));
        }
        state.lock_holder = Some(owner.to_string());
        Ok(LockState::Acquired)
    }

    fn unlock(&self, owner: &str) -> Result<(), DriverError> {
        let mut state = self.state();
        if let Some(holder) = state.lock_holder.as_ref().filter(|h| *h != owner) {
            return Err(DriverError::Backend(format!(
                "lock is held by {}, not {}",
                holder, owner
            )));
        }
        state.lock_holder = None;
        Ok(())
    }

    fn history(&self) -> Result<Vec<HistoryEntry>, DriverError> {
        Ok(self.state().tables.history.clone())
    }

    fn append_history(&self, entry: HistoryEntry) -> Result<(), DriverError> {
        self.state().tables.history.push(entry);
        Ok(())
    }
}

impl RecordStore for MemoryDriver {
    fn get(&self, entity: &str, key: &Value) -> Result<Option<Record>, StorageError> {
        let state = self.state();
        let rows = state
            .tables
            .records
            .get(entity)
            .ok_or_else(|| StorageError::UnknownEntity(entity.to_string()))?;
        Ok(rows.get(key).cloned())
    }

    fn scan_page(
        &self,
        entity: &str,
        after: Option<&Value>,
        limit: usize,
    ) -> Result<Vec<Record>, StorageError> {
        let state = self.state();
        let rows = state
            .tables
            .records
            .get(entity)
            .ok_or_else(|| StorageError::UnknownEntity(entity.to_string()))?;
        let lower = match after {
            Some(key) => Bound::Excluded(key),
            None => Bound::Unbounded,
        };
        Ok(rows
            .range::<Value, _>((lower, Bound::Unbounded))
            .take(limit)
            .map(|(_, r)| r.clone())
            .collect())
    }

    fn commit(&self, batch: Vec<Mutation>) -> Result<(), StorageError> {
        let mut state = self.state();

        let mut staged: HashMap<String, BTreeMap<Value, Record>> = HashMap::new();
        for mutation in &batch {
            let entity = mutation.entity();
            if !staged.contains_key(entity) {
                let rows = state
                    .tables
                    .records
                    .get(entity)
                    .ok_or_else(|| StorageError::UnknownEntity(entity.to_string()))?;
                staged.insert(entity.to_string(), rows.clone());
            }
        }

        for mutation in batch {
            let rows = staged
                .get_mut(mutation.entity())
                .ok_or_else(|| StorageError::UnknownEntity(mutation.entity().to_string()))?;
            match mutation {
                Mutation::Insert { key, record } => {
                    if rows.contains_key(&key) {
                        return Err(StorageError::Conflict {
                            entity: record.entity,
                            key,
                        });
                    }
                    rows.insert(key, record);
                }
                Mutation::Replace { key, record } => {
                    if !rows.contains_key(&key) {
                        return Err(StorageError::Missing {
                            entity: record.entity,
                            key,
                        });
                    }
                    rows.insert(key, record);
                }
                Mutation::Remove { entity, key } => {
                    if rows.remove(&key).is_none() {
                        return Err(StorageError::Missing { entity, key });
                    }
                }
            }
        }

        for (entity, rows) in &staged {
            let Some(def) = state.tables.entities.get(entity) else {
                continue;
            };
            if let Some(values) = unique_groups(def).find_map(|g| duplicate(rows.values(), &g)) {
                return Err(StorageError::Duplicate {
                    entity: entity.clone(),
                    values,
                });
            }
        }

        state.tables.records.extend(staged);
        Ok(())
    }
}

/// Field sets that must be unique among live records of `entity`.
fn unique_groups(entity: &Entity) -> impl Iterator<Item = Vec<String>> + '_ {
    let fields = entity
        .fields
        .iter()
        .filter(|f| f.unique && !f.primary_key)
        .map(|f| vec![f.name.clone()]);
    let indexes = entity
        .indexes
        .iter()
        .filter(|i| i.unique)
        .map(|i| i.fields.clone());
    fields.chain(indexes)
}
