//! Schema diffing: compare the declared schema against the live one.
//!
//! [`diff`] produces a [`ChangeSet`], the ordered list of structural
//! operations that turns the live schema into the declared one. Entities are
//! matched by name, fields by name, indexes by their field set and
//! relationships by (owning entity, referenced entity, foreign key). A changed
//! index or relationship under the same identity becomes a drop followed by an
//! add.
//!
//! Operations are ordered by the [`solver`](crate::solver), which simulates
//! them against a virtual copy of the live schema.
//!
//! ```text
//! + entity reviews
//! + products.discount: decimal?
//! ~ products.price: integer -> decimal
//! + relationship reviews.product: reviews.product_id -> products (cascade-delete)
//! ```

use crate::solver;
use justdb_schema::{
    AutoNow, Entity, Field, Index, IndexKey, Relationship, RelationshipKey, Schema, SchemaError,
    SchemaHash,
};
use std::collections::BTreeSet;
use std::fmt;

/// A single structural operation.
#[derive(Debug, Clone, PartialEq)]
pub enum Change {
    /// Create an entity with its fields, indexes and self-referencing
    /// relationships.
    CreateEntity(Entity),
    /// Drop an entity and all of its records.
    DropEntity(String),
    /// Add a field. Existing records get the default, or null.
    AddField { entity: String, field: Field },
    /// Drop a field and its data.
    DropField { entity: String, field: String },
    /// Change a field's type, nullability, default or flags.
    AlterField {
        entity: String,
        from: Field,
        to: Field,
    },
    AddIndex { entity: String, index: Index },
    DropIndex { entity: String, index: Index },
    AddRelationship(Relationship),
    DropRelationship(Relationship),
    /// Turn soft delete on or off for an existing entity.
    SetSoftDelete { entity: String, enabled: bool },
}

impl Change {
    /// The entity this change is applied to. For relationships, the owning
    /// entity.
    pub fn entity(&self) -> &str {
        match self {
            Change::CreateEntity(e) => &e.name,
            Change::DropEntity(name) => name,
            Change::AddField { entity, .. }
            | Change::DropField { entity, .. }
            | Change::AlterField { entity, .. }
            | Change::AddIndex { entity, .. }
            | Change::DropIndex { entity, .. }
            | Change::SetSoftDelete { entity, .. } => entity,
            Change::AddRelationship(r) | Change::DropRelationship(r) => &r.entity,
        }
    }

    /// Every entity whose shape this change affects.
    pub fn entities(&self) -> Vec<&str> {
        match self {
            Change::AddRelationship(r) | Change::DropRelationship(r) => {
                if r.is_self_referencing() {
                    vec![r.entity.as_str()]
                } else {
                    vec![r.entity.as_str(), r.references.as_str()]
                }
            }
            other => vec![other.entity()],
        }
    }

    /// Whether applying this change loses data.
    pub fn is_destructive(&self) -> bool {
        matches!(self, Change::DropEntity(_) | Change::DropField { .. })
    }

    /// Position in the initial ordering handed to the solver: drops first,
    /// then creates, then the operations that depend on created things.
    fn phase(&self) -> u8 {
        match self {
            Change::DropRelationship(_) => 0,
            Change::DropIndex { .. } => 1,
            Change::DropField { .. } => 2,
            Change::DropEntity(_) => 3,
            Change::CreateEntity(_) => 4,
            Change::AddField { .. } => 5,
            Change::AlterField { .. } => 6,
            Change::SetSoftDelete { .. } => 7,
            Change::AddIndex { .. } => 8,
            Change::AddRelationship(_) => 9,
        }
    }
}

fn on_off(flag: bool) -> &'static str {
    if flag { "on" } else { "off" }
}

fn describe_alter(from: &Field, to: &Field) -> String {
    let mut parts = Vec::new();
    if from.ty != to.ty {
        parts.push(format!("{} -> {}", from.ty, to.ty));
    }
    if from.default != to.default {
        let show = |v: &Option<justdb_schema::Value>| {
            v.as_ref().map(ToString::to_string).unwrap_or_else(|| "(none)".to_string())
        };
        parts.push(format!("default {} -> {}", show(&from.default), show(&to.default)));
    }
    if from.unique != to.unique {
        parts.push(format!("unique {}", on_off(to.unique)));
    }
    if from.indexed != to.indexed {
        parts.push(format!("indexed {}", on_off(to.indexed)));
    }
    if from.primary_key != to.primary_key {
        parts.push(format!("primary key {}", on_off(to.primary_key)));
    }
    if from.auto_generated != to.auto_generated {
        parts.push(format!("auto-generated {}", on_off(to.auto_generated)));
    }
    if from.auto_now != to.auto_now {
        let show = |a: Option<AutoNow>| a.map(|a| a.as_str()).unwrap_or("off");
        parts.push(format!("auto-now {} -> {}", show(from.auto_now), show(to.auto_now)));
    }
    parts.join(", ")
}

fn describe_relationship(r: &Relationship) -> String {
    format!(
        "{}.{}: {}.{} -> {} ({})",
        r.entity,
        r.name,
        r.child(),
        r.foreign_key,
        r.parent(),
        r.on_delete
    )
}

impl fmt::Display for Change {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Change::CreateEntity(e) => write!(f, "+ entity {}", e.name),
            Change::DropEntity(name) => write!(f, "- entity {}", name),
            Change::AddField { entity, field } => {
                let unique = if field.unique && !field.primary_key { " unique" } else { "" };
                write!(f, "+ {}.{}: {}{}", entity, field.name, field.ty, unique)
            }
            Change::DropField { entity, field } => write!(f, "- {}.{}", entity, field),
            Change::AlterField { entity, from, to } => {
                write!(f, "~ {}.{}: {}", entity, to.name, describe_alter(from, to))
            }
            Change::AddIndex { entity, index } => {
                let unique = if index.unique { "unique " } else { "" };
                write!(f, "+ {}index {} on {} {}", unique, index.name, entity, index.key())
            }
            Change::DropIndex { entity, index } => {
                write!(f, "- index {} on {} {}", index.name, entity, index.key())
            }
            Change::AddRelationship(r) => write!(f, "+ relationship {}", describe_relationship(r)),
            Change::DropRelationship(r) => write!(f, "- relationship {}", describe_relationship(r)),
            Change::SetSoftDelete { entity, enabled } => {
                write!(f, "~ {}: soft delete {}", entity, on_off(*enabled))
            }
        }
    }
}

/// An ordered, immutable list of changes, produced by [`diff`].
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeSet {
    target: SchemaHash,
    changes: Vec<Change>,
}

impl ChangeSet {
    pub(crate) fn new(target: SchemaHash, changes: Vec<Change>) -> Self {
        Self { target, changes }
    }

    /// Fingerprint of the declared schema this change set converges to.
    pub fn target(&self) -> SchemaHash {
        self.target
    }

    pub fn changes(&self) -> &[Change] {
        &self.changes
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Change> {
        self.changes.iter()
    }

    pub fn len(&self) -> usize {
        self.changes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    /// Changes that lose data and need explicit confirmation.
    pub fn destructive(&self) -> impl Iterator<Item = &Change> {
        self.changes.iter().filter(|c| c.is_destructive())
    }

    /// Names of all entities touched by this change set.
    pub fn entities(&self) -> BTreeSet<String> {
        self.changes
            .iter()
            .flat_map(|c| c.entities())
            .map(str::to_string)
            .collect()
    }
}

impl<'a> IntoIterator for &'a ChangeSet {
    type Item = &'a Change;
    type IntoIter = std::slice::Iter<'a, Change>;

    fn into_iter(self) -> Self::IntoIter {
        self.changes.iter()
    }
}

impl fmt::Display for ChangeSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return writeln!(f, "No changes.");
        }
        for change in &self.changes {
            writeln!(f, "{}", change)?;
        }
        Ok(())
    }
}

/// Compute the changes that turn `live` into `declared`.
///
/// Fails with [`SchemaError::Unorderable`] when the changes cannot be put in
/// an order where each one's preconditions hold.
pub fn diff(declared: &Schema, live: &Schema) -> Result<ChangeSet, SchemaError> {
    let mut changes = Vec::new();

    for live_entity in live.entities() {
        if declared.contains(&live_entity.name) {
            continue;
        }
        for rel in &live_entity.relationships {
            if !rel.is_self_referencing() {
                changes.push(Change::DropRelationship(rel.clone()));
            }
        }
        changes.push(Change::DropEntity(live_entity.name.clone()));
    }

    for entity in declared.entities() {
        match live.entity(&entity.name) {
            Some(live_entity) => diff_entity(entity, live_entity, &mut changes),
            None => {
                let (own, other): (Vec<_>, Vec<_>) = entity
                    .relationships
                    .iter()
                    .cloned()
                    .partition(Relationship::is_self_referencing);
                changes.push(Change::CreateEntity(Entity {
                    relationships: own,
                    ..entity.clone()
                }));
                changes.extend(other.into_iter().map(Change::AddRelationship));
            }
        }
    }

    changes.sort_by_key(Change::phase);

    let ordered = solver::order_changes(changes, live).map_err(|e| SchemaError::Unorderable {
        reason: e.to_string(),
    })?;
    Ok(ChangeSet::new(declared.fingerprint(), ordered))
}

fn diff_entity(declared: &Entity, live: &Entity, changes: &mut Vec<Change>) {
    let name = &declared.name;

    for field in &declared.fields {
        match live.field(&field.name) {
            None => changes.push(Change::AddField {
                entity: name.clone(),
                field: field.clone(),
            }),
            Some(existing) if existing != field => changes.push(Change::AlterField {
                entity: name.clone(),
                from: existing.clone(),
                to: field.clone(),
            }),
            Some(_) => {}
        }
    }
    for field in &live.fields {
        if declared.field(&field.name).is_none() {
            changes.push(Change::DropField {
                entity: name.clone(),
                field: field.name.clone(),
            });
        }
    }

    if declared.soft_delete != live.soft_delete {
        changes.push(Change::SetSoftDelete {
            entity: name.clone(),
            enabled: declared.soft_delete,
        });
    }

    diff_indexes(declared, live, changes);
    diff_relationships(declared, live, changes);
}

fn diff_indexes(declared: &Entity, live: &Entity, changes: &mut Vec<Change>) {
    let declared_keys: Vec<IndexKey> = declared.indexes.iter().map(Index::key).collect();

    for index in &live.indexes {
        let replaced = declared
            .index(&index.key())
            .is_some_and(|d| d.unique != index.unique);
        if !declared_keys.contains(&index.key()) || replaced {
            changes.push(Change::DropIndex {
                entity: live.name.clone(),
                index: index.clone(),
            });
        }
    }
    for index in &declared.indexes {
        let current = live.index(&index.key());
        if current.is_none_or(|c| c.unique != index.unique) {
            changes.push(Change::AddIndex {
                entity: declared.name.clone(),
                index: index.clone(),
            });
        }
    }
}

fn diff_relationships(declared: &Entity, live: &Entity, changes: &mut Vec<Change>) {
    let find = |rels: &[Relationship], key: &RelationshipKey| -> Option<Relationship> {
        rels.iter().find(|r| &r.key() == key).cloned()
    };

    for rel in &live.relationships {
        match find(&declared.relationships, &rel.key()) {
            Some(wanted) if wanted == *rel => {}
            _ => changes.push(Change::DropRelationship(rel.clone())),
        }
    }
    for rel in &declared.relationships {
        match find(&live.relationships, &rel.key()) {
            Some(current) if current == *rel => {}
            _ => changes.push(Change::AddRelationship(rel.clone())),
        }
    }
}
