//! Schema declarations loaded from TOML or JSON.
//!
//! ```toml
//! [[entity]]
//! name = "users"
//! soft_delete = true
//!
//! [[entity.field]]
//! name = "id"
//! type = "integer"
//! primary_key = true
//! auto_generated = true
//!
//! [[entity.field]]
//! name = "email"
//! type = "text"
//! nullable = true
//! unique = true
//!
//! [[entity.field]]
//! name = "updated_at"
//! type = "timestamp"
//! auto_now = "on-update"
//!
//! [[entity.relationship]]
//! name = "orders"
//! references = "orders"
//! foreign_key = "user_id"
//! cardinality = "one-to-many"
//! on_delete = "cascade-delete"
//! ```
//!
//! Declarations map one-to-one onto [`Schema`] values; loading applies the
//! same construction checks as building a schema in code.

use crate::{
    AutoNow, Cardinality, Entity, Field, FieldType, Index, OnDelete, Relationship, ScalarType,
    Schema, SchemaError, Value,
};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::str::FromStr;

/// Root of a declaration file.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SchemaDeclaration {
    #[serde(default, rename = "entity")]
    pub entities: Vec<EntityDeclaration>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EntityDeclaration {
    pub name: String,
    #[serde(default)]
    pub soft_delete: bool,
    #[serde(default, rename = "field")]
    pub fields: Vec<FieldDeclaration>,
    #[serde(default, rename = "index")]
    pub indexes: Vec<IndexDeclaration>,
    #[serde(default, rename = "relationship")]
    pub relationships: Vec<RelationshipDeclaration>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FieldDeclaration {
    pub name: String,
    #[serde(rename = "type")]
    pub ty: ScalarTypeDeclaration,
    #[serde(default)]
    pub nullable: bool,
    #[serde(default)]
    pub default: Option<LiteralDeclaration>,
    #[serde(default)]
    pub unique: bool,
    #[serde(default)]
    pub indexed: bool,
    #[serde(default)]
    pub primary_key: bool,
    #[serde(default)]
    pub auto_generated: bool,
    #[serde(default)]
    pub auto_now: Option<AutoNowDeclaration>,
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AutoNowDeclaration {
    OnCreate,
    OnUpdate,
}

impl From<AutoNowDeclaration> for AutoNow {
    fn from(when: AutoNowDeclaration) -> Self {
        match when {
            AutoNowDeclaration::OnCreate => AutoNow::OnCreate,
            AutoNowDeclaration::OnUpdate => AutoNow::OnUpdate,
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScalarTypeDeclaration {
    Integer,
    Text,
    Decimal,
    Boolean,
    Timestamp,
}

impl From<ScalarTypeDeclaration> for ScalarType {
    fn from(ty: ScalarTypeDeclaration) -> Self {
        match ty {
            ScalarTypeDeclaration::Integer => ScalarType::Integer,
            ScalarTypeDeclaration::Text => ScalarType::Text,
            ScalarTypeDeclaration::Decimal => ScalarType::Decimal,
            ScalarTypeDeclaration::Boolean => ScalarType::Boolean,
            ScalarTypeDeclaration::Timestamp => ScalarType::Timestamp,
        }
    }
}

/// An untyped literal; interpreted against the field's scalar type.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum LiteralDeclaration {
    Boolean(bool),
    Integer(i64),
    Float(f64),
    Text(String),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IndexDeclaration {
    pub name: String,
    pub fields: Vec<String>,
    #[serde(default)]
    pub unique: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RelationshipDeclaration {
    pub name: String,
    pub references: String,
    pub foreign_key: String,
    #[serde(default = "default_cardinality")]
    pub cardinality: CardinalityDeclaration,
    #[serde(default = "default_on_delete")]
    pub on_delete: OnDeleteDeclaration,
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CardinalityDeclaration {
    ManyToOne,
    OneToMany,
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OnDeleteDeclaration {
    #[serde(alias = "cascade")]
    CascadeDelete,
    SetNull,
    Restrict,
}

fn default_cardinality() -> CardinalityDeclaration {
    CardinalityDeclaration::ManyToOne
}

fn default_on_delete() -> OnDeleteDeclaration {
    OnDeleteDeclaration::Restrict
}

/// Load a schema from TOML source.
pub fn from_toml_str(source: &str) -> Result<Schema, SchemaError> {
    let decl: SchemaDeclaration = toml::from_str(source).map_err(|e| SchemaError::Declaration {
        message: e.to_string(),
    })?;
    decl.into_schema()
}

/// Load a schema from JSON source.
pub fn from_json_str(source: &str) -> Result<Schema, SchemaError> {
    let decl: SchemaDeclaration =
        serde_json::from_str(source).map_err(|e| SchemaError::Declaration {
            message: e.to_string(),
        })?;
    decl.into_schema()
}

impl SchemaDeclaration {
    pub fn into_schema(self) -> Result<Schema, SchemaError> {
        let entities = self
            .entities
            .into_iter()
            .map(EntityDeclaration::into_entity)
            .collect::<Result<Vec<_>, _>>()?;
        Schema::new(entities)
    }
}

impl EntityDeclaration {
    fn into_entity(self) -> Result<Entity, SchemaError> {
        let mut builder = Entity::builder(&self.name);
        if self.soft_delete {
            builder = builder.soft_delete();
        }
        for field in self.fields {
            builder = builder.field(field.into_field(&self.name)?);
        }
        for index in self.indexes {
            let mut idx = Index::new(index.name, index.fields);
            if index.unique {
                idx = idx.unique();
            }
            builder = builder.index(idx);
        }
        for rel in self.relationships {
            let relationship = match rel.cardinality {
                CardinalityDeclaration::ManyToOne => {
                    Relationship::many_to_one(rel.name, rel.references, rel.foreign_key)
                }
                CardinalityDeclaration::OneToMany => {
                    Relationship::one_to_many(rel.name, rel.references, rel.foreign_key)
                }
            };
            let on_delete = match rel.on_delete {
                OnDeleteDeclaration::CascadeDelete => OnDelete::Cascade,
                OnDeleteDeclaration::SetNull => OnDelete::SetNull,
                OnDeleteDeclaration::Restrict => OnDelete::Restrict,
            };
            builder = builder.relationship(relationship.on_delete(on_delete));
        }
        builder.build()
    }
}

impl FieldDeclaration {
    fn into_field(self, entity: &str) -> Result<Field, SchemaError> {
        let scalar = ScalarType::from(self.ty);
        let ty = FieldType {
            scalar,
            nullable: self.nullable,
        };
        let default = match self.default {
            None => None,
            Some(literal) => Some(literal.to_value(scalar).ok_or_else(|| {
                SchemaError::Declaration {
                    message: format!(
                        "default of '{}.{}' is not a valid {}",
                        entity, self.name, scalar
                    ),
                }
            })?),
        };
        Ok(Field {
            name: self.name,
            ty,
            default,
            unique: self.unique || self.primary_key,
            indexed: self.indexed,
            primary_key: self.primary_key,
            auto_generated: self.auto_generated,
            auto_now: self.auto_now.map(AutoNow::from),
        })
    }
}

impl LiteralDeclaration {
    fn to_value(&self, scalar: ScalarType) -> Option<Value> {
        match (self, scalar) {
            (LiteralDeclaration::Boolean(b), ScalarType::Boolean) => Some(Value::Boolean(*b)),
            (LiteralDeclaration::Integer(i), ScalarType::Integer) => Some(Value::Integer(*i)),
            (LiteralDeclaration::Integer(i), ScalarType::Decimal) => {
                Some(Value::Decimal(Decimal::from(*i)))
            }
            (LiteralDeclaration::Float(f), ScalarType::Decimal) => {
                Decimal::try_from(*f).ok().map(Value::Decimal)
            }
            (LiteralDeclaration::Text(s), ScalarType::Decimal) => {
                Decimal::from_str(s).ok().map(Value::Decimal)
            }
            (LiteralDeclaration::Text(s), ScalarType::Text) => Some(Value::Text(s.clone())),
            (LiteralDeclaration::Text(s), ScalarType::Timestamp) => {
                DateTime::parse_from_rfc3339(s)
                    .ok()
                    .map(|t| Value::Timestamp(t.with_timezone(&Utc)))
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SHOP: &str = r#"
[[entity]]
name = "categories"
soft_delete = true

[[entity.field]]
name = "id"
type = "integer"
primary_key = true
auto_generated = true

[[entity.field]]
name = "name"
type = "text"
unique = true

[[entity]]
name = "products"
soft_delete = true

[[entity.field]]
name = "id"
type = "integer"
primary_key = true
auto_generated = true

[[entity.field]]
name = "category_id"
type = "integer"
nullable = true
indexed = true

[[entity.field]]
name = "price"
type = "decimal"
default = "0.00"

[[entity.field]]
name = "stock"
type = "integer"
default = 0

[[entity.index]]
name = "products_category_price"
fields = ["category_id", "price"]

[[entity.relationship]]
name = "category"
references = "categories"
foreign_key = "category_id"
on_delete = "set-null"
"#;

    #[test]
    fn test_load_toml() {
        let schema = from_toml_str(SHOP).unwrap();
        assert_eq!(schema.len(), 2);

        let products = schema.entity("products").unwrap();
        assert!(products.soft_delete);
        assert_eq!(products.fields.len(), 4);
        assert_eq!(
            products.field("stock").unwrap().default,
            Some(Value::Integer(0))
        );
        assert_eq!(
            products.field("price").unwrap().default,
            Some(Value::Decimal(Decimal::new(0, 2)))
        );

        let rel = products.relationship("category").unwrap();
        assert_eq!(rel.entity, "products");
        assert_eq!(rel.parent(), "categories");
        assert_eq!(rel.on_delete, OnDelete::SetNull);
        assert_eq!(rel.cardinality, Cardinality::ManyToOne);
    }

    #[test]
    fn test_load_json_one_to_many() {
        let json = r#"{
            "entity": [
                {
                    "name": "users",
                    "field": [{ "name": "id", "type": "integer", "primary_key": true }],
                    "relationship": [{
                        "name": "orders",
                        "references": "orders",
                        "foreign_key": "user_id",
                        "cardinality": "one-to-many",
                        "on_delete": "cascade"
                    }]
                },
                {
                    "name": "orders",
                    "soft_delete": true,
                    "field": [
                        { "name": "id", "type": "integer", "primary_key": true },
                        { "name": "user_id", "type": "integer" }
                    ]
                }
            ]
        }"#;
        let schema = from_json_str(json).unwrap();
        let rel = schema.entity("users").unwrap().relationship("orders").unwrap();
        assert_eq!(rel.child(), "orders");
        assert_eq!(rel.parent(), "users");
        assert_eq!(rel.on_delete, OnDelete::Cascade);
    }

    #[test]
    fn test_bad_default_is_rejected() {
        let source = r#"
[[entity]]
name = "flags"

[[entity.field]]
name = "id"
type = "integer"
primary_key = true

[[entity.field]]
name = "enabled"
type = "boolean"
default = "yes"
"#;
        let err = from_toml_str(source).unwrap_err();
        assert!(matches!(err, SchemaError::Declaration { message } if message.contains("flags.enabled")));
    }

    #[test]
    fn test_unknown_key_is_rejected() {
        let source = r#"
[[entity]]
name = "flags"
colour = "blue"
"#;
        assert!(matches!(
            from_toml_str(source),
            Err(SchemaError::Declaration { .. })
        ));
    }

    #[test]
    fn test_construction_checks_apply() {
        let source = r#"
[[entity]]
name = "orphans"

[[entity.field]]
name = "label"
type = "text"
"#;
        assert_eq!(
            from_toml_str(source),
            Err(SchemaError::MissingPrimaryKey {
                entity: "orphans".to_string()
            })
        );
    }

    #[test]
    fn test_auto_now_fields() {
        let source = r#"
[[entity]]
name = "posts"

[[entity.field]]
name = "id"
type = "integer"
primary_key = true

[[entity.field]]
name = "created_at"
type = "timestamp"
auto_now = "on-create"

[[entity.field]]
name = "updated_at"
type = "timestamp"
auto_now = "on-update"
"#;
        let schema = from_toml_str(source).unwrap();
        let posts = schema.entity("posts").unwrap();
        assert_eq!(posts.field("created_at").unwrap().auto_now, Some(AutoNow::OnCreate));
        assert_eq!(posts.field("updated_at").unwrap().auto_now, Some(AutoNow::OnUpdate));
        assert!(!posts.field("created_at").unwrap().is_required());

        let wrong = source.replace(
            "name = \"updated_at\"\ntype = \"timestamp\"",
            "name = \"updated_at\"\ntype = \"text\"",
        );
        assert_eq!(
            from_toml_str(&wrong),
            Err(SchemaError::AutoNowRequiresTimestamp {
                entity: "posts".to_string(),
                field: "updated_at".to_string(),
                found: ScalarType::Text,
            })
        );
    }
}
