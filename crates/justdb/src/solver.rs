//! Change ordering.
//!
//! Every change has preconditions on the schema it is applied to: a
//! relationship needs both entities and the foreign key field, an entity can
//! only be dropped once nothing references it, a field can only be dropped
//! once no index or relationship uses it. The solver simulates changes
//! against a [`VirtualSchema`] built from the live schema and schedules each
//! change as soon as its preconditions hold.
//!
//! ```text
//! -- This fails:
//! + relationship reviews.product: reviews.product_id -> products
//! + entity reviews
//!
//! -- This works:
//! + entity reviews
//! + relationship reviews.product: reviews.product_id -> products
//! ```

use crate::Change;
use justdb_schema::{Entity, IndexKey, Relationship, RelationshipKey, Schema};
use std::collections::{HashMap, HashSet};

/// Error when changes cannot be ordered.
#[derive(Debug, Clone, PartialEq)]
pub enum SolverError {
    /// A change requires an entity that doesn't exist.
    EntityNotFound { change: String, entity: String },
    /// A change requires an entity to NOT exist, but it does.
    EntityAlreadyExists { change: String, entity: String },
    /// A change requires a field that doesn't exist.
    FieldNotFound {
        change: String,
        entity: String,
        field: String,
    },
    /// A change requires a field to NOT exist, but it does.
    FieldAlreadyExists {
        change: String,
        entity: String,
        field: String,
    },
    /// A field is still used by an index or relationship.
    FieldInUse {
        change: String,
        entity: String,
        field: String,
        by: String,
    },
    /// An entity is still part of a relationship.
    EntityStillReferenced {
        change: String,
        entity: String,
        by: String,
    },
    /// A relationship references an entity that doesn't exist.
    RelationshipTargetNotFound { change: String, target: String },
    /// An index or relationship already exists, or doesn't exist when dropped.
    Conflict { change: String, reason: String },
    /// Changes form a dependency cycle that cannot be resolved.
    CycleDetected { changes: Vec<String> },
}

impl std::fmt::Display for SolverError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SolverError::EntityNotFound { change, entity } => {
                write!(f, "{}: entity '{}' does not exist", change, entity)
            }
            SolverError::EntityAlreadyExists { change, entity } => {
                write!(f, "{}: entity '{}' already exists", change, entity)
            }
            SolverError::FieldNotFound {
                change,
                entity,
                field,
            } => {
                write!(f, "{}: field '{}.{}' does not exist", change, entity, field)
            }
            SolverError::FieldAlreadyExists {
                change,
                entity,
                field,
            } => {
                write!(f, "{}: field '{}.{}' already exists", change, entity, field)
            }
            SolverError::FieldInUse {
                change,
                entity,
                field,
                by,
            } => {
                write!(f, "{}: field '{}.{}' is used by {}", change, entity, field, by)
            }
            SolverError::EntityStillReferenced { change, entity, by } => {
                write!(f, "{}: entity '{}' is still used by {}", change, entity, by)
            }
            SolverError::RelationshipTargetNotFound { change, target } => {
                write!(f, "{}: references non-existent entity '{}'", change, target)
            }
            SolverError::Conflict { change, reason } => write!(f, "{}: {}", change, reason),
            SolverError::CycleDetected { changes } => {
                write!(
                    f,
                    "dependency cycle detected, cannot order: {}",
                    changes.join(", ")
                )
            }
        }
    }
}

impl std::error::Error for SolverError {}

/// Virtual representation of an entity for simulation.
#[derive(Debug, Clone, Default)]
struct VirtualEntity {
    fields: HashSet<String>,
    primary_key: Option<String>,
    indexes: HashSet<IndexKey>,
    relationships: Vec<Relationship>,
}

impl VirtualEntity {
    fn from_entity(entity: &Entity) -> Self {
        Self {
            fields: entity.fields.iter().map(|f| f.name.clone()).collect(),
            primary_key: entity.primary_key().map(|f| f.name.clone()),
            indexes: entity.indexes.iter().map(|i| i.key()).collect(),
            relationships: entity.relationships.clone(),
        }
    }
}

/// Virtual schema state for simulating changes.
#[derive(Debug, Clone, Default)]
pub struct VirtualSchema {
    entities: HashMap<String, VirtualEntity>,
}

impl VirtualSchema {
    pub fn new() -> Self {
        Self::default()
    }

    /// Initialize from the live schema.
    pub fn from_schema(schema: &Schema) -> Self {
        let mut virt = Self::new();
        for entity in schema.entities() {
            virt.entities
                .insert(entity.name.clone(), VirtualEntity::from_entity(entity));
        }
        virt
    }

    pub fn entity_exists(&self, name: &str) -> bool {
        self.entities.contains_key(name)
    }

    pub fn field_exists(&self, entity: &str, field: &str) -> bool {
        self.entities
            .get(entity)
            .is_some_and(|e| e.fields.contains(field))
    }

    fn relationships(&self) -> impl Iterator<Item = &Relationship> {
        self.entities.values().flat_map(|e| e.relationships.iter())
    }

    fn entity_mut(&mut self, change: &str, name: &str) -> Result<&mut VirtualEntity, SolverError> {
        self.entities
            .get_mut(name)
            .ok_or_else(|| SolverError::EntityNotFound {
                change: change.to_string(),
                entity: name.to_string(),
            })
    }

    /// Apply a change, validating its preconditions.
    pub fn apply(&mut self, change: &Change) -> Result<(), SolverError> {
        let desc = change.to_string();

        match change {
            Change::CreateEntity(entity) => {
                if self.entity_exists(&entity.name) {
                    return Err(SolverError::EntityAlreadyExists {
                        change: desc,
                        entity: entity.name.clone(),
                    });
                }
                self.entities
                    .insert(entity.name.clone(), VirtualEntity::from_entity(entity));
            }

            Change::DropEntity(name) => {
                if !self.entity_exists(name) {
                    return Err(SolverError::EntityNotFound {
                        change: desc,
                        entity: name.clone(),
                    });
                }
                let blocking = self.relationships().find(|r| {
                    (r.entity == *name || r.references == *name) && !r.is_self_referencing()
                });
                if let Some(rel) = blocking {
                    return Err(SolverError::EntityStillReferenced {
                        change: desc,
                        entity: name.clone(),
                        by: format!("relationship {}", rel.key()),
                    });
                }
                self.entities.remove(name);
            }

            Change::AddField { entity, field } => {
                let e = self.entity_mut(&desc, entity)?;
                if !e.fields.insert(field.name.clone()) {
                    return Err(SolverError::FieldAlreadyExists {
                        change: desc,
                        entity: entity.clone(),
                        field: field.name.clone(),
                    });
                }
                if field.primary_key {
                    e.primary_key = Some(field.name.clone());
                }
            }

            Change::DropField { entity, field } => {
                if !self.field_exists(entity, field) {
                    return Err(SolverError::FieldNotFound {
                        change: desc,
                        entity: entity.clone(),
                        field: field.clone(),
                    });
                }
                if let Some(by) = self.field_user(entity, field) {
                    return Err(SolverError::FieldInUse {
                        change: desc,
                        entity: entity.clone(),
                        field: field.clone(),
                        by,
                    });
                }
                let e = self.entity_mut(&desc, entity)?;
                e.fields.remove(field);
                if e.primary_key.as_deref() == Some(field.as_str()) {
                    e.primary_key = None;
                }
            }

            Change::AlterField { entity, from, to } => {
                if !self.field_exists(entity, &from.name) {
                    return Err(SolverError::FieldNotFound {
                        change: desc,
                        entity: entity.clone(),
                        field: from.name.clone(),
                    });
                }
                let e = self.entity_mut(&desc, entity)?;
                if to.primary_key {
                    e.primary_key = Some(to.name.clone());
                } else if e.primary_key.as_deref() == Some(to.name.as_str()) {
                    e.primary_key = None;
                }
            }

            Change::AddIndex { entity, index } => {
                if let Some(missing) = index.fields.iter().find(|f| !self.field_exists(entity, f)) {
                    return Err(SolverError::FieldNotFound {
                        change: desc,
                        entity: entity.clone(),
                        field: missing.clone(),
                    });
                }
                let e = self.entity_mut(&desc, entity)?;
                if !e.indexes.insert(index.key()) {
                    return Err(SolverError::Conflict {
                        change: desc,
                        reason: format!("an index on {} already exists", index.key()),
                    });
                }
            }

            Change::DropIndex { entity, index } => {
                let e = self.entity_mut(&desc, entity)?;
                if !e.indexes.remove(&index.key()) {
                    return Err(SolverError::Conflict {
                        change: desc,
                        reason: format!("no index on {}", index.key()),
                    });
                }
            }

            Change::AddRelationship(rel) => {
                if !self.entity_exists(&rel.entity) {
                    return Err(SolverError::EntityNotFound {
                        change: desc,
                        entity: rel.entity.clone(),
                    });
                }
                if !self.entity_exists(&rel.references) {
                    return Err(SolverError::RelationshipTargetNotFound {
                        change: desc,
                        target: rel.references.clone(),
                    });
                }
                if !self.field_exists(rel.child(), &rel.foreign_key) {
                    return Err(SolverError::FieldNotFound {
                        change: desc,
                        entity: rel.child().to_string(),
                        field: rel.foreign_key.clone(),
                    });
                }
                let key = rel.key();
                let e = self.entity_mut(&desc, &rel.entity)?;
                if e.relationships.iter().any(|r| r.key() == key) {
                    return Err(SolverError::Conflict {
                        change: desc,
                        reason: format!("relationship {} already exists", key),
                    });
                }
                e.relationships.push(rel.clone());
            }

            Change::DropRelationship(rel) => {
                let key: RelationshipKey = rel.key();
                let e = self.entity_mut(&desc, &rel.entity)?;
                let before = e.relationships.len();
                e.relationships.retain(|r| r.key() != key);
                if e.relationships.len() == before {
                    return Err(SolverError::Conflict {
                        change: desc,
                        reason: format!("relationship {} does not exist", key),
                    });
                }
            }

            Change::SetSoftDelete { entity, .. } => {
                self.entity_mut(&desc, entity)?;
            }
        }

        Ok(())
    }

    /// The index or relationship that still uses a field, if any.
    fn field_user(&self, entity: &str, field: &str) -> Option<String> {
        let e = self.entities.get(entity)?;
        if let Some(index) = e.indexes.iter().find(|k| k.0.contains(field)) {
            return Some(format!("index {}", index));
        }
        if let Some(rel) = self
            .relationships()
            .find(|r| r.child() == entity && r.foreign_key == field)
        {
            return Some(format!("relationship {}", rel.key()));
        }
        if e.primary_key.as_deref() == Some(field) {
            if let Some(rel) = self.relationships().find(|r| r.parent() == entity) {
                return Some(format!("relationship {}", rel.key()));
            }
        }
        None
    }

    /// Check if a change can be applied (without actually applying it).
    pub fn can_apply(&self, change: &Change) -> bool {
        let mut clone = self.clone();
        clone.apply(change).is_ok()
    }
}

/// Order changes to satisfy dependencies, validating against a virtual copy
/// of `live`.
///
/// Changes are scheduled in passes: each pass schedules, in their current
/// order, all changes whose preconditions hold. A pass that schedules nothing
/// means the remaining changes can never apply.
pub fn order_changes(changes: Vec<Change>, live: &Schema) -> Result<Vec<Change>, SolverError> {
    let mut schema = VirtualSchema::from_schema(live);
    let mut pending: Vec<Change> = changes;
    let mut ordered: Vec<Change> = Vec::with_capacity(pending.len());

    while !pending.is_empty() {
        let scheduled_before = ordered.len();
        let mut remaining = Vec::new();
        for change in pending {
            if schema.can_apply(&change) {
                schema.apply(&change)?;
                ordered.push(change);
            } else {
                remaining.push(change);
            }
        }

        if !remaining.is_empty() && ordered.len() == scheduled_before {
            // Report why the first stuck change can't be applied
            let mut test_schema = schema.clone();
            for change in &remaining {
                test_schema.apply(change)?;
            }
            return Err(SolverError::CycleDetected {
                changes: remaining.iter().map(|c| c.to_string()).collect(),
            });
        }
        pending = remaining;
    }

    Ok(ordered)
}

#[cfg(test)]
mod tests {
    use super::*;
    use justdb_schema::{Field, Index, OnDelete, ScalarType};

    fn make_entity(name: &str, fields: &[&str]) -> Entity {
        let mut builder =
            Entity::builder(name).field(Field::new("id", ScalarType::Integer).primary_key());
        for field in fields {
            builder = builder.field(Field::new(*field, ScalarType::Integer).nullable());
        }
        builder.soft_delete().build().unwrap()
    }

    fn reviews_product() -> Relationship {
        Relationship {
            entity: "reviews".to_string(),
            ..Relationship::many_to_one("product", "products", "product_id")
                .on_delete(OnDelete::Cascade)
        }
    }

    #[test]
    fn test_virtual_schema_create_entity() {
        let mut schema = VirtualSchema::new();
        let result = schema.apply(&Change::CreateEntity(make_entity("products", &[])));
        assert!(result.is_ok());
        assert!(schema.entity_exists("products"));

        let again = schema.apply(&Change::CreateEntity(make_entity("products", &[])));
        assert!(matches!(again, Err(SolverError::EntityAlreadyExists { .. })));
    }

    #[test]
    fn test_virtual_schema_drop_missing_entity() {
        let mut schema = VirtualSchema::new();
        let result = schema.apply(&Change::DropEntity("products".to_string()));
        assert!(matches!(result, Err(SolverError::EntityNotFound { .. })));
    }

    #[test]
    fn test_virtual_schema_relationship_needs_target() {
        let live = Schema::new([make_entity("reviews", &["product_id"])]).unwrap();
        let mut schema = VirtualSchema::from_schema(&live);
        let result = schema.apply(&Change::AddRelationship(reviews_product()));
        assert!(matches!(
            result,
            Err(SolverError::RelationshipTargetNotFound { .. })
        ));
    }

    #[test]
    fn test_virtual_schema_relationship_needs_field() {
        let live = Schema::new([make_entity("reviews", &[]), make_entity("products", &[])]).unwrap();
        let mut schema = VirtualSchema::from_schema(&live);
        let result = schema.apply(&Change::AddRelationship(reviews_product()));
        assert!(matches!(result, Err(SolverError::FieldNotFound { .. })));
    }

    #[test]
    fn test_virtual_schema_field_in_use() {
        let mut products = make_entity("products", &["sku"]);
        products.indexes.push(Index::new("products_sku_idx", ["sku"]));
        let live = Schema::new([products]).unwrap();
        let mut schema = VirtualSchema::from_schema(&live);

        let drop = Change::DropField {
            entity: "products".to_string(),
            field: "sku".to_string(),
        };
        assert!(matches!(
            schema.apply(&drop),
            Err(SolverError::FieldInUse { .. })
        ));
        assert!(schema.field_exists("products", "sku"));
    }

    #[test]
    fn test_create_before_relationship() {
        let live = Schema::new([make_entity("products", &[])]).unwrap();
        let changes = vec![
            Change::AddRelationship(reviews_product()),
            Change::CreateEntity(make_entity("reviews", &["product_id"])),
        ];
        let ordered = order_changes(changes, &live).unwrap();
        assert!(matches!(ordered[0], Change::CreateEntity(_)));
        assert!(matches!(ordered[1], Change::AddRelationship(_)));
    }

    #[test]
    fn test_drop_relationship_before_entity() {
        let mut reviews = make_entity("reviews", &["product_id"]);
        reviews.relationships.push(reviews_product());
        let live = Schema::new([make_entity("products", &[]), reviews.clone()]).unwrap();

        let changes = vec![
            Change::DropEntity("products".to_string()),
            Change::DropRelationship(reviews_product()),
        ];
        let ordered = order_changes(changes, &live).unwrap();
        assert!(matches!(ordered[0], Change::DropRelationship(_)));
        assert!(matches!(ordered[1], Change::DropEntity(_)));
    }

    #[test]
    fn test_unsatisfiable_reports_reason() {
        let live = Schema::new([make_entity("reviews", &["product_id"])]).unwrap();
        let changes = vec![Change::AddRelationship(reviews_product())];
        let err = order_changes(changes, &live).unwrap_err();
        assert!(matches!(
            err,
            SolverError::RelationshipTargetNotFound { ref target, .. } if target == "products"
        ));
    }
}
