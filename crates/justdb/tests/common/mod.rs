#![allow(dead_code)]

use justdb::schema::{Entity, Field, Index, OnDelete, Relationship, ScalarType, Schema};
use std::sync::Once;

pub fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
            )
            .with_test_writer()
            .try_init();
    });
}

pub fn id() -> Field {
    Field::new("id", ScalarType::Integer)
        .primary_key()
        .auto_generated()
}

pub fn users() -> Entity {
    Entity::builder("users")
        .field(id())
        .field(Field::new("email", ScalarType::Text).unique())
        .field(Field::new("name", ScalarType::Text).nullable())
        .relationship(
            Relationship::one_to_many("orders", "orders", "user_id").on_delete(OnDelete::Cascade),
        )
        .soft_delete()
        .build()
        .unwrap()
}

pub fn orders() -> Entity {
    Entity::builder("orders")
        .field(id())
        .field(Field::new("user_id", ScalarType::Integer).indexed())
        .field(Field::new("placed_at", ScalarType::Timestamp).nullable())
        .relationship(
            Relationship::many_to_one("user", "users", "user_id").on_delete(OnDelete::Cascade),
        )
        .soft_delete()
        .build()
        .unwrap()
}

pub fn order_items() -> Entity {
    Entity::builder("order_items")
        .field(id())
        .field(Field::new("order_id", ScalarType::Integer))
        .field(Field::new("product_id", ScalarType::Integer))
        .field(Field::new("quantity", ScalarType::Integer).default_value(1))
        .relationship(
            Relationship::many_to_one("order", "orders", "order_id").on_delete(OnDelete::Cascade),
        )
        .relationship(Relationship::many_to_one("product", "products", "product_id"))
        .index(Index::new("order_product", ["order_id", "product_id"]).unique())
        .soft_delete()
        .build()
        .unwrap()
}

pub fn categories() -> Entity {
    Entity::builder("categories")
        .field(id())
        .field(Field::new("name", ScalarType::Text).unique())
        .soft_delete()
        .build()
        .unwrap()
}

pub fn products() -> Entity {
    Entity::builder("products")
        .field(id())
        .field(Field::new("name", ScalarType::Text))
        .field(Field::new("price", ScalarType::Decimal))
        .field(Field::new("category_id", ScalarType::Integer).nullable())
        .relationship(
            Relationship::many_to_one("category", "categories", "category_id")
                .on_delete(OnDelete::SetNull),
        )
        .soft_delete()
        .build()
        .unwrap()
}

/// Users own orders, orders own items (cascade); items restrict product
/// deletes; products lose their category on delete (set-null).
pub fn shop() -> Schema {
    Schema::new([users(), orders(), order_items(), categories(), products()]).unwrap()
}

/// [`shop`] with a nullable `discount` on products.
pub fn shop_with_discount() -> Schema {
    let products = Entity {
        fields: products()
            .fields
            .into_iter()
            .chain([Field::new("discount", ScalarType::Decimal).nullable()])
            .collect(),
        ..products()
    };
    Schema::new([users(), orders(), order_items(), categories(), products]).unwrap()
}
