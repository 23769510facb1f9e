//! Cross-entity consistency checks.
//!
//! [`Schema::new`] already rejects problems local to one entity (duplicate
//! fields, primary key count). [`validate`] checks everything that needs the
//! whole schema. Checks run in a fixed order and the first failure wins:
//!
//! 1. relationships resolve: the referenced entity exists, the foreign key
//!    field exists on the child, and its type matches the parent primary key
//! 2. `set-null` foreign keys are nullable
//! 3. the cascade-delete graph has no cycle
//! 4. indexes only use existing fields
//! 5. relationship names are unique per entity, and no two relationships
//!    disagree about the same foreign key
//!
//! Cascades may reach entities without soft delete; the runtime removes
//! those records outright.

use justdb_schema::{OnDelete, Relationship, Schema, SchemaError};
use std::collections::{HashMap, HashSet};

/// Validate a schema. Returns the first problem found.
pub fn validate(schema: &Schema) -> Result<(), SchemaError> {
    check_references(schema)?;
    check_set_null(schema)?;
    check_cascade_cycles(schema)?;
    check_indexes(schema)?;
    check_relationship_names(schema)?;
    check_conflicts(schema)?;
    Ok(())
}

fn check_references(schema: &Schema) -> Result<(), SchemaError> {
    for rel in schema.relationships() {
        if schema.target(rel).is_none() {
            return Err(SchemaError::UnknownEntity {
                entity: rel.entity.clone(),
                relationship: rel.name.clone(),
                target: rel.references.clone(),
            });
        }

        let child = schema.entity(rel.child());
        let parent = schema.entity(rel.parent());
        let (Some(child), Some(parent)) = (child, parent) else {
            continue;
        };

        let Some(fk) = child.field(&rel.foreign_key) else {
            return Err(SchemaError::UnknownForeignKey {
                relationship: qualified(rel),
                entity: child.name.clone(),
                field: rel.foreign_key.clone(),
            });
        };

        if let Some(pk) = parent.primary_key() {
            if fk.ty.scalar != pk.ty.scalar {
                return Err(SchemaError::ForeignKeyTypeMismatch {
                    entity: child.name.clone(),
                    field: fk.name.clone(),
                    found: fk.ty.scalar,
                    referenced: parent.name.clone(),
                    expected: pk.ty.scalar,
                });
            }
        }
    }
    Ok(())
}

fn check_set_null(schema: &Schema) -> Result<(), SchemaError> {
    for rel in schema.relationships() {
        if rel.on_delete != OnDelete::SetNull {
            continue;
        }
        let nullable = schema
            .entity(rel.child())
            .and_then(|e| e.field(&rel.foreign_key))
            .is_some_and(|f| f.ty.nullable);
        if !nullable {
            return Err(SchemaError::SetNullRequiresNullable {
                relationship: qualified(rel),
                entity: rel.child().to_string(),
                field: rel.foreign_key.clone(),
            });
        }
    }
    Ok(())
}

#[derive(Clone, Copy, PartialEq)]
enum Mark {
    Unvisited,
    OnStack,
    Done,
}

/// Depth-first search over parent -> child cascade edges. A back edge to a
/// node still on the stack is a cycle. A self-referencing cascade is a cycle
/// of length one.
fn check_cascade_cycles(schema: &Schema) -> Result<(), SchemaError> {
    let mut edges: HashMap<&str, Vec<&str>> = HashMap::new();
    for rel in schema.relationships() {
        if rel.on_delete == OnDelete::Cascade {
            let children = edges.entry(rel.parent()).or_default();
            if !children.contains(&rel.child()) {
                children.push(rel.child());
            }
        }
    }

    let mut marks: HashMap<&str, Mark> = schema
        .entity_names()
        .map(|n| (n, Mark::Unvisited))
        .collect();
    let mut stack: Vec<&str> = Vec::new();

    fn visit<'a>(
        node: &'a str,
        edges: &HashMap<&'a str, Vec<&'a str>>,
        marks: &mut HashMap<&'a str, Mark>,
        stack: &mut Vec<&'a str>,
    ) -> Result<(), SchemaError> {
        marks.insert(node, Mark::OnStack);
        stack.push(node);

        for &child in edges.get(node).into_iter().flatten() {
            match marks.get(child).copied().unwrap_or(Mark::Unvisited) {
                Mark::OnStack => {
                    let start = stack.iter().position(|n| *n == child).unwrap_or(0);
                    let mut path: Vec<String> =
                        stack[start..].iter().map(|n| n.to_string()).collect();
                    path.push(child.to_string());
                    return Err(SchemaError::CascadeCycle { path });
                }
                Mark::Unvisited => visit(child, edges, marks, stack)?,
                Mark::Done => {}
            }
        }

        stack.pop();
        marks.insert(node, Mark::Done);
        Ok(())
    }

    for name in schema.entity_names() {
        if marks.get(name) == Some(&Mark::Unvisited) {
            visit(name, &edges, &mut marks, &mut stack)?;
        }
    }
    Ok(())
}

fn check_indexes(schema: &Schema) -> Result<(), SchemaError> {
    for entity in schema.entities() {
        for index in &entity.indexes {
            if let Some(missing) = index.fields.iter().find(|f| entity.field(f).is_none()) {
                return Err(SchemaError::UnknownIndexField {
                    entity: entity.name.clone(),
                    index: index.name.clone(),
                    field: missing.clone(),
                });
            }
        }
    }
    Ok(())
}

fn check_relationship_names(schema: &Schema) -> Result<(), SchemaError> {
    for entity in schema.entities() {
        let mut seen = HashSet::new();
        for rel in &entity.relationships {
            if !seen.insert(rel.name.as_str()) {
                return Err(SchemaError::DuplicateRelationship {
                    entity: entity.name.clone(),
                    relationship: rel.name.clone(),
                });
            }
        }
    }
    Ok(())
}

/// A foreign key may be declared from both sides, but both declarations must
/// agree on the parent and the delete policy.
fn check_conflicts(schema: &Schema) -> Result<(), SchemaError> {
    let mut edges: HashMap<(&str, &str), &Relationship> = HashMap::new();
    for rel in schema.relationships() {
        match edges.get(&(rel.child(), rel.foreign_key.as_str())) {
            Some(first) if first.parent() != rel.parent() || first.on_delete != rel.on_delete => {
                return Err(SchemaError::ConflictingRelationships {
                    entity: rel.child().to_string(),
                    field: rel.foreign_key.clone(),
                    first: qualified(first),
                    second: qualified(rel),
                });
            }
            Some(_) => {}
            None => {
                edges.insert((rel.child(), rel.foreign_key.as_str()), rel);
            }
        }
    }
    Ok(())
}

fn qualified(rel: &Relationship) -> String {
    format!("{}.{}", rel.entity, rel.name)
}
