use super::*;

fn id() -> Field {
    Field::new("id", ScalarType::Integer).primary_key()
}

fn users() -> Entity {
    Entity::builder("users")
        .field(id().auto_generated())
        .field(Field::new("username", ScalarType::Text).unique())
        .field(Field::new("email", ScalarType::Text).nullable().unique())
        .relationship(
            Relationship::one_to_many("orders", "orders", "user_id").on_delete(OnDelete::Cascade),
        )
        .soft_delete()
        .build()
        .unwrap()
}

fn orders() -> Entity {
    Entity::builder("orders")
        .field(id())
        .field(Field::new("user_id", ScalarType::Integer).indexed())
        .field(Field::new("status", ScalarType::Text).default_value("pending"))
        .relationship(
            Relationship::many_to_one("user", "users", "user_id").on_delete(OnDelete::Cascade),
        )
        .soft_delete()
        .build()
        .unwrap()
}

#[test]
fn test_duplicate_entity() {
    let err = Schema::new([users(), users()]).unwrap_err();
    assert_eq!(
        err,
        SchemaError::DuplicateEntity {
            entity: "users".to_string()
        }
    );
}

#[test]
fn test_duplicate_field() {
    let err = Entity::builder("tags")
        .field(id())
        .field(Field::new("label", ScalarType::Text))
        .field(Field::new("label", ScalarType::Text))
        .build()
        .unwrap_err();
    assert_eq!(
        err,
        SchemaError::DuplicateField {
            entity: "tags".to_string(),
            field: "label".to_string()
        }
    );
}

#[test]
fn test_primary_key_count() {
    let none = Entity::builder("tags")
        .field(Field::new("label", ScalarType::Text))
        .build();
    assert!(matches!(none, Err(SchemaError::MissingPrimaryKey { .. })));

    let two = Entity::builder("tags")
        .field(id())
        .field(Field::new("slug", ScalarType::Text).primary_key())
        .build();
    match two {
        Err(SchemaError::MultiplePrimaryKeys { entity, fields }) => {
            assert_eq!(entity, "tags");
            assert_eq!(fields, vec!["id", "slug"]);
        }
        other => panic!("expected MultiplePrimaryKeys, got {other:?}"),
    }
}

#[test]
fn test_nullable_primary_key() {
    let err = Entity::builder("tags")
        .field(id().nullable())
        .build()
        .unwrap_err();
    assert!(matches!(err, SchemaError::NullablePrimaryKey { .. }));
}

#[test]
fn test_relationship_sides() {
    let users = users();
    let rel = users.relationship("orders").unwrap();
    assert_eq!(rel.entity, "users");
    assert_eq!(rel.child(), "orders");
    assert_eq!(rel.parent(), "users");

    let orders = orders();
    let rel = orders.relationship("user").unwrap();
    assert_eq!(rel.child(), "orders");
    assert_eq!(rel.parent(), "users");
}

#[test]
fn test_traversal() {
    let schema = Schema::new([users(), orders()]).unwrap();

    let outgoing: Vec<&str> = schema.outgoing("orders").map(|r| r.name.as_str()).collect();
    assert_eq!(outgoing, vec!["user"]);

    let incoming: Vec<&str> = schema.incoming("orders").map(|r| r.name.as_str()).collect();
    assert_eq!(incoming, vec!["orders"]);

    // Both relationships describe the same foreign key pointing at users.
    assert_eq!(schema.dependents("users").len(), 1);
    assert!(schema.dependents("orders").is_empty());
    assert_eq!(schema.foreign_keys("orders").len(), 1);
    assert!(schema.foreign_keys("users").is_empty());

    let rel = schema.entity("orders").unwrap().relationship("user").unwrap();
    assert_eq!(schema.target(rel).map(|e| e.name.as_str()), Some("users"));
}

#[test]
fn test_connected() {
    let tags = Entity::builder("tags").field(id()).build().unwrap();
    let schema = Schema::new([users(), orders(), tags]).unwrap();
    let connected: Vec<String> = schema.connected("orders").into_iter().collect();
    assert_eq!(connected, vec!["orders", "users"]);
}

#[test]
fn test_with_entity_replaces() {
    let schema = Schema::new([users(), orders()]).unwrap();
    let archived = Entity::builder("orders")
        .field(id())
        .field(Field::new("user_id", ScalarType::Integer))
        .build()
        .unwrap();

    let evolved = schema.with_entity(archived).unwrap();
    assert_eq!(evolved.len(), 2);
    assert!(!evolved.entity("orders").unwrap().soft_delete);
    // The original value is untouched.
    assert!(schema.entity("orders").unwrap().soft_delete);

    let shrunk = evolved.without_entity("orders");
    assert_eq!(shrunk.entity_names().collect::<Vec<_>>(), vec!["users"]);
}

#[test]
fn test_structural_equality_ignores_order() {
    let a = Entity::builder("t")
        .field(id())
        .field(Field::new("a", ScalarType::Text))
        .field(Field::new("b", ScalarType::Boolean))
        .index(Index::new("ab", ["a", "b"]))
        .build()
        .unwrap();
    let b = Entity::builder("t")
        .field(Field::new("b", ScalarType::Boolean))
        .field(id())
        .field(Field::new("a", ScalarType::Text))
        .index(Index::new("t_b_a_idx", ["b", "a"]))
        .build()
        .unwrap();
    assert_eq!(a, b);
    assert_eq!(
        Schema::new([a.clone()]).unwrap().fingerprint(),
        Schema::new([b]).unwrap().fingerprint()
    );

    let c = Entity::builder("t")
        .field(id())
        .field(Field::new("a", ScalarType::Text).nullable())
        .field(Field::new("b", ScalarType::Boolean))
        .index(Index::new("ab", ["a", "b"]))
        .build()
        .unwrap();
    assert_ne!(a, c);
    assert_ne!(
        Schema::new([a]).unwrap().fingerprint(),
        Schema::new([c]).unwrap().fingerprint()
    );
}

#[test]
fn test_auto_now_is_structural() {
    let stamped = |when: Option<AutoNow>| {
        let mut field = Field::new("updated_at", ScalarType::Timestamp);
        field.auto_now = when;
        Schema::new([Entity::builder("t").field(id()).field(field).build().unwrap()]).unwrap()
    };
    let plain = stamped(None);
    let on_update = stamped(Some(AutoNow::OnUpdate));
    assert_ne!(plain, on_update);
    assert_ne!(plain.fingerprint(), on_update.fingerprint());
    assert_ne!(
        on_update.fingerprint(),
        stamped(Some(AutoNow::OnCreate)).fingerprint()
    );

    let err = Entity::builder("t")
        .field(id())
        .field(Field::new("touched", ScalarType::Integer).auto_now(AutoNow::OnCreate))
        .build()
        .unwrap_err();
    assert!(matches!(err, SchemaError::AutoNowRequiresTimestamp { .. }));
}

#[test]
fn test_fingerprint_display() {
    let hash = Schema::empty().fingerprint();
    assert_eq!(hash.to_string().len(), 64);
    assert_eq!(hash.short().len(), 12);
}

#[test]
fn test_value_conformance() {
    let nullable_text = FieldType::nullable(ScalarType::Text);
    assert!(Value::Null.conforms_to(&nullable_text));
    assert!(Value::from("x").conforms_to(&nullable_text));
    assert!(!Value::from(1).conforms_to(&nullable_text));
    assert!(!Value::Null.conforms_to(&FieldType::required(ScalarType::Text)));
}

#[test]
fn test_value_coercion() {
    use rust_decimal::Decimal;

    assert_eq!(
        Value::from(3).coerce_to(ScalarType::Decimal),
        Some(Value::Decimal(Decimal::from(3)))
    );
    assert_eq!(
        Value::from("42").coerce_to(ScalarType::Integer),
        Some(Value::Integer(42))
    );
    assert_eq!(Value::from("forty").coerce_to(ScalarType::Integer), None);
    assert_eq!(
        Value::Decimal(Decimal::new(250, 2)).coerce_to(ScalarType::Integer),
        None
    );
    assert_eq!(Value::Null.coerce_to(ScalarType::Boolean), Some(Value::Null));
}

mod properties {
    use super::*;
    use proptest::prelude::*;
    use rust_decimal::Decimal;

    fn arb_scalar() -> impl Strategy<Value = ScalarType> {
        prop_oneof![
            Just(ScalarType::Integer),
            Just(ScalarType::Text),
            Just(ScalarType::Decimal),
            Just(ScalarType::Boolean),
            Just(ScalarType::Timestamp),
        ]
    }

    fn arb_value() -> impl Strategy<Value = Value> {
        prop_oneof![
            Just(Value::Null),
            any::<bool>().prop_map(Value::Boolean),
            any::<i64>().prop_map(Value::Integer),
            (any::<i64>(), 0u32..6).prop_map(|(m, s)| Value::Decimal(Decimal::new(m, s))),
            "[ -~]{0,12}".prop_map(Value::Text),
        ]
    }

    fn arb_fields() -> impl Strategy<Value = Vec<Field>> {
        prop::collection::btree_map("f_[a-z]{1,4}", (arb_scalar(), any::<bool>()), 0..6).prop_map(
            |columns| {
                columns
                    .into_iter()
                    .map(|(name, (scalar, nullable))| {
                        let field = Field::new(name, scalar);
                        if nullable { field.nullable() } else { field }
                    })
                    .collect()
            },
        )
    }

    fn entity(fields: Vec<Field>) -> Entity {
        fields
            .into_iter()
            .fold(Entity::builder("t").field(id()), |b, f| b.field(f))
            .build()
            .unwrap()
    }

    proptest! {
        #[test]
        fn field_order_never_changes_fingerprint(
            (fields, shuffled) in arb_fields()
                .prop_flat_map(|f| (Just(f.clone()), Just(f).prop_shuffle()))
        ) {
            let a = Schema::new([entity(fields)]).unwrap();
            let b = Schema::new([entity(shuffled)]).unwrap();
            prop_assert_eq!(a.fingerprint(), b.fingerprint());
        }

        #[test]
        fn coerced_values_conform(value in arb_value(), target in arb_scalar()) {
            if let Some(coerced) = value.coerce_to(target) {
                prop_assert!(coerced.conforms_to(&FieldType::nullable(target)));
                prop_assert_eq!(coerced.is_null(), value.is_null());
            }
        }
    }
}
