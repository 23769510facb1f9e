//! Schema model types for justdb.
//!
//! A [`Schema`] is an ordered set of [`Entity`] values keyed by name. Each
//! entity owns its [`Field`]s, [`Index`]es and [`Relationship`]s. Schemas are
//! built wholesale (from code or from a declaration file, see [`declare`]),
//! checked for the structural invariants that can be verified locally, and are
//! immutable afterwards: evolving a schema produces a new value.
//!
//! Cross-entity consistency (foreign key types, cascade cycles, ...) is checked
//! by the validator in the `justdb` crate.

use indexmap::IndexMap;
use std::collections::{BTreeSet, HashSet};
use std::fmt;

pub mod declare;
mod value;

pub use value::Value;

#[cfg(test)]
mod tests;

/// Scalar column types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ScalarType {
    Integer,
    Text,
    Decimal,
    Boolean,
    Timestamp,
}

impl ScalarType {
    /// Lowercase name, as used in declaration files.
    pub fn as_str(&self) -> &'static str {
        match self {
            ScalarType::Integer => "integer",
            ScalarType::Text => "text",
            ScalarType::Decimal => "decimal",
            ScalarType::Boolean => "boolean",
            ScalarType::Timestamp => "timestamp",
        }
    }
}

impl fmt::Display for ScalarType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A scalar type, optionally wrapped as nullable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FieldType {
    pub scalar: ScalarType,
    pub nullable: bool,
}

impl FieldType {
    pub fn required(scalar: ScalarType) -> Self {
        Self {
            scalar,
            nullable: false,
        }
    }

    pub fn nullable(scalar: ScalarType) -> Self {
        Self {
            scalar,
            nullable: true,
        }
    }
}

impl From<ScalarType> for FieldType {
    fn from(scalar: ScalarType) -> Self {
        FieldType::required(scalar)
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.nullable {
            write!(f, "{}?", self.scalar)
        } else {
            write!(f, "{}", self.scalar)
        }
    }
}

/// When a timestamp field is stamped with the current time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AutoNow {
    /// On create only, when the record leaves the field empty.
    OnCreate,
    /// On create and again on every update.
    OnUpdate,
}

impl AutoNow {
    pub fn as_str(&self) -> &'static str {
        match self {
            AutoNow::OnCreate => "on-create",
            AutoNow::OnUpdate => "on-update",
        }
    }
}

impl fmt::Display for AutoNow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An entity field (column).
#[derive(Debug, Clone, PartialEq)]
pub struct Field {
    /// Field name
    pub name: String,
    /// Scalar type and nullability
    pub ty: FieldType,
    /// Default value used when a record omits the field
    pub default: Option<Value>,
    /// Whether values must be unique among live records
    pub unique: bool,
    /// Whether the field carries a single-column index
    pub indexed: bool,
    /// Whether this is the entity's primary key
    pub primary_key: bool,
    /// Whether the value is assigned by storage on create (integer keys only)
    pub auto_generated: bool,
    /// Timestamp maintained by the runtime
    pub auto_now: Option<AutoNow>,
}

impl Field {
    pub fn new(name: impl Into<String>, ty: impl Into<FieldType>) -> Self {
        Self {
            name: name.into(),
            ty: ty.into(),
            default: None,
            unique: false,
            indexed: false,
            primary_key: false,
            auto_generated: false,
            auto_now: None,
        }
    }

    pub fn nullable(mut self) -> Self {
        self.ty.nullable = true;
        self
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    pub fn indexed(mut self) -> Self {
        self.indexed = true;
        self
    }

    pub fn default_value(mut self, value: impl Into<Value>) -> Self {
        self.default = Some(value.into());
        self
    }

    /// Mark as primary key. Primary keys are implicitly unique.
    pub fn primary_key(mut self) -> Self {
        self.primary_key = true;
        self.unique = true;
        self
    }

    pub fn auto_generated(mut self) -> Self {
        self.auto_generated = true;
        self
    }

    /// Stamp with the current time on create, or on create and update.
    pub fn auto_now(mut self, when: AutoNow) -> Self {
        self.auto_now = Some(when);
        self
    }

    /// Whether a record must supply this field on create.
    pub fn is_required(&self) -> bool {
        !self.ty.nullable
            && self.default.is_none()
            && !self.auto_generated
            && self.auto_now.is_none()
    }
}

/// A (possibly composite) index over fields of one entity.
#[derive(Debug, Clone)]
pub struct Index {
    /// Index name
    pub name: String,
    /// Indexed field names, in declaration order
    pub fields: Vec<String>,
    /// Whether the field combination must be unique among live records
    pub unique: bool,
}

impl Index {
    pub fn new<I, S>(name: impl Into<String>, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            fields: fields.into_iter().map(Into::into).collect(),
            unique: false,
        }
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    /// Identity of an index: its field set. Names are not significant.
    pub fn key(&self) -> IndexKey {
        IndexKey(self.fields.iter().cloned().collect())
    }
}

impl PartialEq for Index {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key() && self.unique == other.unique
    }
}

/// Identity key of an index (sorted field set).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IndexKey(pub BTreeSet<String>);

impl fmt::Display for IndexKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let fields: Vec<&str> = self.0.iter().map(String::as_str).collect();
        write!(f, "({})", fields.join(", "))
    }
}

/// Relationship cardinality, seen from the owning entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Cardinality {
    /// Many owning records reference one record of the referenced entity.
    /// The foreign key lives on the owning entity.
    ManyToOne,
    /// One owning record is referenced by many records of the referenced
    /// entity. The foreign key lives on the referenced entity.
    OneToMany,
}

impl Cardinality {
    pub fn as_str(&self) -> &'static str {
        match self {
            Cardinality::ManyToOne => "many-to-one",
            Cardinality::OneToMany => "one-to-many",
        }
    }
}

/// What happens to referencing records when a referenced record is deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum OnDelete {
    /// Delete referencing records too.
    Cascade,
    /// Null the foreign key on referencing records.
    SetNull,
    /// Reject the delete while live referencing records exist.
    #[default]
    Restrict,
}

impl OnDelete {
    pub fn as_str(&self) -> &'static str {
        match self {
            OnDelete::Cascade => "cascade-delete",
            OnDelete::SetNull => "set-null",
            OnDelete::Restrict => "restrict",
        }
    }
}

impl fmt::Display for OnDelete {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A foreign-key relationship declared by an entity.
///
/// Whatever the cardinality, the relationship resolves to one foreign-key edge:
/// the [`child`](Self::child) entity holds [`foreign_key`](Self::foreign_key),
/// which references the primary key of the [`parent`](Self::parent) entity.
/// Delete policies apply when a parent record is deleted.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Relationship {
    /// Accessor name, unique within the owning entity
    pub name: String,
    /// Owning (declaring) entity
    pub entity: String,
    /// Referenced entity
    pub references: String,
    /// Foreign key field name (on the child entity)
    pub foreign_key: String,
    pub cardinality: Cardinality,
    pub on_delete: OnDelete,
}

impl Relationship {
    /// A relationship whose foreign key lives on the owning entity.
    pub fn many_to_one(
        name: impl Into<String>,
        references: impl Into<String>,
        foreign_key: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            entity: String::new(),
            references: references.into(),
            foreign_key: foreign_key.into(),
            cardinality: Cardinality::ManyToOne,
            on_delete: OnDelete::default(),
        }
    }

    /// A relationship whose foreign key lives on the referenced entity.
    pub fn one_to_many(
        name: impl Into<String>,
        references: impl Into<String>,
        foreign_key: impl Into<String>,
    ) -> Self {
        Self {
            cardinality: Cardinality::OneToMany,
            ..Self::many_to_one(name, references, foreign_key)
        }
    }

    pub fn on_delete(mut self, policy: OnDelete) -> Self {
        self.on_delete = policy;
        self
    }

    /// Entity holding the foreign key.
    pub fn child(&self) -> &str {
        match self.cardinality {
            Cardinality::ManyToOne => &self.entity,
            Cardinality::OneToMany => &self.references,
        }
    }

    /// Entity whose primary key is referenced.
    pub fn parent(&self) -> &str {
        match self.cardinality {
            Cardinality::ManyToOne => &self.references,
            Cardinality::OneToMany => &self.entity,
        }
    }

    pub fn is_self_referencing(&self) -> bool {
        self.entity == self.references
    }

    /// Identity of a relationship: owning entity, referenced entity and
    /// foreign key.
    pub fn key(&self) -> RelationshipKey {
        RelationshipKey {
            entity: self.entity.clone(),
            references: self.references.clone(),
            foreign_key: self.foreign_key.clone(),
        }
    }
}

/// Identity key of a relationship.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RelationshipKey {
    pub entity: String,
    pub references: String,
    pub foreign_key: String,
}

impl fmt::Display for RelationshipKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{} -> {}", self.entity, self.foreign_key, self.references)
    }
}

/// An entity definition.
///
/// Equality is structural: fields, indexes and relationships compare as sets,
/// so two entities that only differ in declaration order are equal.
#[derive(Debug, Clone)]
pub struct Entity {
    /// Entity name
    pub name: String,
    /// Fields, in declaration order
    pub fields: Vec<Field>,
    /// Indexes
    pub indexes: Vec<Index>,
    /// Relationships declared by this entity
    pub relationships: Vec<Relationship>,
    /// Whether records go through a soft-deleted state before being purged
    pub soft_delete: bool,
}

impl Entity {
    pub fn builder(name: impl Into<String>) -> EntityBuilder {
        EntityBuilder {
            entity: Entity {
                name: name.into(),
                fields: Vec::new(),
                indexes: Vec::new(),
                relationships: Vec::new(),
                soft_delete: false,
            },
        }
    }

    /// Check the invariants local to one entity.
    pub fn check(&self) -> Result<(), SchemaError> {
        let mut seen = HashSet::new();
        for field in &self.fields {
            if !seen.insert(field.name.as_str()) {
                return Err(SchemaError::DuplicateField {
                    entity: self.name.clone(),
                    field: field.name.clone(),
                });
            }
        }

        if let Some(field) = self
            .fields
            .iter()
            .find(|f| f.auto_now.is_some() && f.ty.scalar != ScalarType::Timestamp)
        {
            return Err(SchemaError::AutoNowRequiresTimestamp {
                entity: self.name.clone(),
                field: field.name.clone(),
                found: field.ty.scalar,
            });
        }

        let pks: Vec<&Field> = self.fields.iter().filter(|f| f.primary_key).collect();
        match pks.as_slice() {
            [] => Err(SchemaError::MissingPrimaryKey {
                entity: self.name.clone(),
            }),
            [pk] if pk.ty.nullable => Err(SchemaError::NullablePrimaryKey {
                entity: self.name.clone(),
                field: pk.name.clone(),
            }),
            [_] => Ok(()),
            many => Err(SchemaError::MultiplePrimaryKeys {
                entity: self.name.clone(),
                fields: many.iter().map(|f| f.name.clone()).collect(),
            }),
        }
    }

    pub fn field(&self, name: &str) -> Option<&Field> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// The primary key field.
    ///
    /// Every entity that passed [`Entity::check`] has exactly one.
    pub fn primary_key(&self) -> Option<&Field> {
        self.fields.iter().find(|f| f.primary_key)
    }

    pub fn relationship(&self, name: &str) -> Option<&Relationship> {
        self.relationships.iter().find(|r| r.name == name)
    }

    pub fn index(&self, key: &IndexKey) -> Option<&Index> {
        self.indexes.iter().find(|i| &i.key() == key)
    }
}

impl PartialEq for Entity {
    fn eq(&self, other: &Self) -> bool {
        fn same_set<T: PartialEq>(a: &[T], b: &[T]) -> bool {
            a.len() == b.len() && a.iter().all(|x| b.contains(x))
        }
        self.name == other.name
            && self.soft_delete == other.soft_delete
            && same_set(&self.fields, &other.fields)
            && same_set(&self.indexes, &other.indexes)
            && same_set(&self.relationships, &other.relationships)
    }
}

/// Builder for [`Entity`].
#[derive(Debug, Clone)]
pub struct EntityBuilder {
    entity: Entity,
}

impl EntityBuilder {
    pub fn field(mut self, field: Field) -> Self {
        self.entity.fields.push(field);
        self
    }

    pub fn index(mut self, index: Index) -> Self {
        self.entity.indexes.push(index);
        self
    }

    pub fn relationship(mut self, mut relationship: Relationship) -> Self {
        relationship.entity = self.entity.name.clone();
        self.entity.relationships.push(relationship);
        self
    }

    pub fn soft_delete(mut self) -> Self {
        self.entity.soft_delete = true;
        self
    }

    pub fn build(self) -> Result<Entity, SchemaError> {
        self.entity.check()?;
        Ok(self.entity)
    }
}

/// A complete schema.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Schema {
    entities: IndexMap<String, Entity>,
}

impl Schema {
    /// An empty schema.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Build a schema from entities, rejecting duplicate names and entities
    /// that violate their local invariants.
    pub fn new(entities: impl IntoIterator<Item = Entity>) -> Result<Self, SchemaError> {
        let mut map = IndexMap::new();
        for mut entity in entities {
            entity.check()?;
            for rel in &mut entity.relationships {
                rel.entity = entity.name.clone();
            }
            if map.contains_key(&entity.name) {
                return Err(SchemaError::DuplicateEntity {
                    entity: entity.name,
                });
            }
            map.insert(entity.name.clone(), entity);
        }
        Ok(Self { entities: map })
    }

    /// A new schema with `entity` added, or replacing the entity of the same
    /// name in place.
    pub fn with_entity(&self, entity: Entity) -> Result<Self, SchemaError> {
        let mut entities: Vec<Entity> = self.entities.values().cloned().collect();
        match entities.iter_mut().find(|e| e.name == entity.name) {
            Some(slot) => *slot = entity,
            None => entities.push(entity),
        }
        Self::new(entities)
    }

    /// A new schema without the named entity.
    pub fn without_entity(&self, name: &str) -> Self {
        let mut entities = self.entities.clone();
        entities.shift_remove(name);
        Self { entities }
    }

    pub fn entity(&self, name: &str) -> Option<&Entity> {
        self.entities.get(name)
    }

    pub fn entities(&self) -> impl Iterator<Item = &Entity> {
        self.entities.values()
    }

    pub fn entity_names(&self) -> impl Iterator<Item = &str> {
        self.entities.keys().map(String::as_str)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entities.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    /// All relationships of all entities.
    pub fn relationships(&self) -> impl Iterator<Item = &Relationship> {
        self.entities.values().flat_map(|e| e.relationships.iter())
    }

    /// Relationships declared by `entity`.
    pub fn outgoing<'a>(&'a self, entity: &str) -> impl Iterator<Item = &'a Relationship> + 'a {
        self.entities
            .get(entity)
            .into_iter()
            .flat_map(|e| e.relationships.iter())
    }

    /// Relationships declared by other entities that reference `entity`.
    pub fn incoming<'a>(&'a self, entity: &'a str) -> impl Iterator<Item = &'a Relationship> + 'a {
        self.relationships()
            .filter(move |r| r.references == entity && r.entity != entity)
    }

    /// Relationships (declared anywhere) whose parent is `entity`, i.e. the
    /// foreign keys that point at `entity`'s primary key. Delete policies
    /// follow these edges.
    ///
    /// A foreign key declared from both sides (a one-to-many on the parent and
    /// a many-to-one on the child) is returned once.
    pub fn dependents(&self, entity: &str) -> Vec<&Relationship> {
        let mut seen = HashSet::new();
        self.relationships()
            .filter(|r| r.parent() == entity)
            .filter(|r| seen.insert((r.child().to_string(), r.foreign_key.clone())))
            .collect()
    }

    /// Relationships (declared anywhere) whose child is `entity`: the foreign
    /// keys `entity` holds. Deduplicated like [`Schema::dependents`].
    pub fn foreign_keys(&self, entity: &str) -> Vec<&Relationship> {
        let mut seen = HashSet::new();
        self.relationships()
            .filter(|r| r.child() == entity)
            .filter(|r| seen.insert(r.foreign_key.clone()))
            .collect()
    }

    /// Resolve the entity a relationship points at.
    pub fn target(&self, relationship: &Relationship) -> Option<&Entity> {
        self.entity(&relationship.references)
    }

    /// Entities reachable from `entity` by following relationships in either
    /// direction, including `entity` itself.
    pub fn connected(&self, entity: &str) -> BTreeSet<String> {
        let mut seen = BTreeSet::new();
        let mut stack = vec![entity.to_string()];
        while let Some(name) = stack.pop() {
            if !seen.insert(name.clone()) {
                continue;
            }
            for rel in self.relationships() {
                if rel.entity == name && !seen.contains(&rel.references) {
                    stack.push(rel.references.clone());
                }
                if rel.references == name && !seen.contains(&rel.entity) {
                    stack.push(rel.entity.clone());
                }
            }
        }
        seen
    }

    /// Content fingerprint, stable under reordering of entities, fields,
    /// indexes and relationships.
    pub fn fingerprint(&self) -> SchemaHash {
        let mut lines: Vec<String> = Vec::new();
        for entity in self.entities.values() {
            lines.push(format!("entity {} soft_delete={}", entity.name, entity.soft_delete));
            for f in &entity.fields {
                lines.push(format!(
                    "field {}.{} {} default={} unique={} indexed={} pk={} auto={} now={}",
                    entity.name,
                    f.name,
                    f.ty,
                    f.default.as_ref().map(ToString::to_string).unwrap_or_default(),
                    f.unique,
                    f.indexed,
                    f.primary_key,
                    f.auto_generated,
                    f.auto_now.map(|a| a.as_str()).unwrap_or_default()
                ));
            }
            for i in &entity.indexes {
                lines.push(format!("index {} {} unique={}", entity.name, i.key(), i.unique));
            }
            for r in &entity.relationships {
                lines.push(format!(
                    "rel {} {} {} {}",
                    r.key(),
                    r.name,
                    r.cardinality.as_str(),
                    r.on_delete
                ));
            }
        }
        lines.sort();

        let mut hasher = blake3::Hasher::new();
        for line in &lines {
            hasher.update(line.as_bytes());
            hasher.update(b"\n");
        }
        SchemaHash(*hasher.finalize().as_bytes())
    }
}

/// blake3 fingerprint of a schema, used as the schema version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SchemaHash(pub [u8; 32]);

impl SchemaHash {
    /// First 12 hex digits, for log lines.
    pub fn short(&self) -> String {
        self.to_string()[..12].to_string()
    }
}

impl fmt::Display for SchemaHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

/// An invalid schema. Fixing it requires changing the declaration.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SchemaError {
    #[error("entity '{entity}' is declared more than once")]
    DuplicateEntity { entity: String },

    #[error("field '{entity}.{field}' is declared more than once")]
    DuplicateField { entity: String, field: String },

    #[error("entity '{entity}' has no primary key")]
    MissingPrimaryKey { entity: String },

    #[error("entity '{entity}' has more than one primary key: {}", .fields.join(", "))]
    MultiplePrimaryKeys { entity: String, fields: Vec<String> },

    #[error("primary key '{entity}.{field}' must not be nullable")]
    NullablePrimaryKey { entity: String, field: String },

    #[error("relationship '{entity}.{relationship}' references unknown entity '{target}'")]
    UnknownEntity {
        entity: String,
        relationship: String,
        target: String,
    },

    #[error("relationship '{relationship}' uses foreign key '{entity}.{field}', which does not exist")]
    UnknownForeignKey {
        relationship: String,
        entity: String,
        field: String,
    },

    #[error(
        "foreign key '{entity}.{field}' is {found} but the primary key of '{referenced}' is {expected}"
    )]
    ForeignKeyTypeMismatch {
        entity: String,
        field: String,
        found: ScalarType,
        referenced: String,
        expected: ScalarType,
    },

    #[error("relationship '{relationship}' is set-null but foreign key '{entity}.{field}' is not nullable")]
    SetNullRequiresNullable {
        relationship: String,
        entity: String,
        field: String,
    },

    #[error("cascade-delete cycle: {}", .path.join(" -> "))]
    CascadeCycle { path: Vec<String> },

    #[error("index '{entity}.{index}' references unknown field '{field}'")]
    UnknownIndexField {
        entity: String,
        index: String,
        field: String,
    },

    #[error("relationship '{entity}.{relationship}' is declared more than once")]
    DuplicateRelationship { entity: String, relationship: String },

    #[error("relationships '{first}' and '{second}' both use foreign key '{entity}.{field}'")]
    ConflictingRelationships {
        entity: String,
        field: String,
        first: String,
        second: String,
    },

    #[error("'{entity}.{field}' is stamped automatically but is {found}, not timestamp")]
    AutoNowRequiresTimestamp {
        entity: String,
        field: String,
        found: ScalarType,
    },

    #[error("changes cannot be ordered: {reason}")]
    Unorderable { reason: String },

    #[error("invalid declaration: {message}")]
    Declaration { message: String },
}
