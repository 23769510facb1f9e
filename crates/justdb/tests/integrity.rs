mod common;

use common::init_tracing;
use justdb::schema::{Schema, Value, declare};
use justdb::{
    ConstraintError, Error, IntegrityRuntime, MemoryDriver, Migrator, ReadOptions, RecordRef,
    TracedDriver, values,
};

const BLOG: &str = r#"
[[entity]]
name = "authors"
soft_delete = true

[[entity.field]]
name = "id"
type = "integer"
primary_key = true
auto_generated = true

[[entity.field]]
name = "handle"
type = "text"
unique = true

[[entity.relationship]]
name = "posts"
references = "posts"
foreign_key = "author_id"
cardinality = "one-to-many"
on_delete = "cascade-delete"

[[entity]]
name = "posts"
soft_delete = true

[[entity.field]]
name = "id"
type = "integer"
primary_key = true
auto_generated = true

[[entity.field]]
name = "author_id"
type = "integer"

[[entity.field]]
name = "editor_id"
type = "integer"
nullable = true

[[entity.field]]
name = "title"
type = "text"

[[entity.relationship]]
name = "author"
references = "authors"
foreign_key = "author_id"
on_delete = "cascade-delete"

[[entity.relationship]]
name = "editor"
references = "authors"
foreign_key = "editor_id"
on_delete = "set-null"

[[entity]]
name = "comments"
soft_delete = true

[[entity.field]]
name = "id"
type = "integer"
primary_key = true
auto_generated = true

[[entity.field]]
name = "post_id"
type = "integer"

[[entity.field]]
name = "pinned"
type = "boolean"
default = false

[[entity.relationship]]
name = "post"
references = "posts"
foreign_key = "post_id"
on_delete = "cascade-delete"

[[entity]]
name = "citations"

[[entity.field]]
name = "id"
type = "integer"
primary_key = true
auto_generated = true

[[entity.field]]
name = "post_id"
type = "integer"

[[entity.relationship]]
name = "post"
references = "posts"
foreign_key = "post_id"
"#;

fn blog() -> Schema {
    declare::from_toml_str(BLOG).unwrap()
}

fn seeded(driver: &TracedDriver<MemoryDriver>, schema: &Schema) {
    Migrator::new(driver).migrate(schema).unwrap();
    let rt = IntegrityRuntime::new(schema, driver);
    for handle in ["ada", "grace"] {
        rt.create("authors", values([("handle", handle.into())]))
            .unwrap();
    }
    // Ada writes two posts, Grace edits the first.
    rt.create(
        "posts",
        values([
            ("author_id", 1.into()),
            ("editor_id", 2.into()),
            ("title", "Engines".into()),
        ]),
    )
    .unwrap();
    rt.create(
        "posts",
        values([("author_id", 1.into()), ("title", "Notes".into())]),
    )
    .unwrap();
    rt.create("posts", values([("author_id", 2.into()), ("title", "Bugs".into())]))
        .unwrap();
    for post in [1, 1, 2] {
        rt.create("comments", values([("post_id", post.into())]))
            .unwrap();
    }
}

fn key(n: i64) -> Value {
    Value::Integer(n)
}

#[test]
fn test_declared_schema_is_valid() {
    justdb::validate(&blog()).unwrap();
}

#[test]
fn test_cascade_and_set_null_in_one_call() {
    init_tracing();
    let schema = blog();
    let driver = TracedDriver::new(MemoryDriver::new());
    seeded(&driver, &schema);
    let rt = IntegrityRuntime::new(&schema, &driver);

    let effects = rt.soft_delete("authors", &key(2)).unwrap();
    assert_eq!(
        effects.soft_deleted,
        vec![
            RecordRef {
                entity: "authors".into(),
                key: key(2)
            },
            RecordRef {
                entity: "posts".into(),
                key: key(3)
            },
        ]
    );
    assert_eq!(
        effects.nullified,
        vec![RecordRef {
            entity: "posts".into(),
            key: key(1)
        }]
    );

    let post = rt.get("posts", &key(1), ReadOptions::live()).unwrap().unwrap();
    assert!(post.get("editor_id").is_null());
    assert_eq!(post.get("author_id"), &key(1));

    let live_posts = rt.list("posts", ReadOptions::live()).unwrap();
    assert_eq!(live_posts.count().unwrap(), 2);
    let all_posts = rt.list("posts", ReadOptions::include_deleted()).unwrap();
    assert_eq!(all_posts.count().unwrap(), 3);
}

#[test]
fn test_deep_cascade() {
    init_tracing();
    let schema = blog();
    let driver = TracedDriver::new(MemoryDriver::new());
    seeded(&driver, &schema);
    let rt = IntegrityRuntime::new(&schema, &driver);

    let effects = rt.soft_delete("authors", &key(1)).unwrap();
    // Ada, her two posts, and their three comments.
    assert_eq!(effects.soft_deleted.len(), 6);
    assert!(effects.nullified.is_empty());

    let comments = rt.list("comments", ReadOptions::live()).unwrap();
    assert_eq!(comments.count().unwrap(), 0);

    // All share one timestamp.
    let stamps: Vec<_> = rt
        .list("comments", ReadOptions::include_deleted())
        .unwrap()
        .to_vec()
        .unwrap()
        .iter()
        .map(|c| c.deleted_at())
        .collect();
    assert!(stamps.windows(2).all(|w| w[0] == w[1]));
    assert!(stamps[0].is_some());
}

#[test]
fn test_restrict_leaves_store_untouched() {
    init_tracing();
    let schema = blog();
    let driver = TracedDriver::new(MemoryDriver::new());
    seeded(&driver, &schema);
    let rt = IntegrityRuntime::new(&schema, &driver);
    rt.create("citations", values([("post_id", 2.into())]))
        .unwrap();

    let snapshot: Vec<_> = ["authors", "posts", "comments", "citations"]
        .iter()
        .map(|e| driver.inner().records(e))
        .collect();

    // Ada's delete cascades into post 2, which a citation restricts.
    let err = rt.soft_delete("authors", &key(1)).unwrap_err();
    assert!(matches!(
        err,
        Error::Constraint(ConstraintError::Restricted { ref entity, ref relationship, .. })
            if entity == "posts" && relationship == "citations.post"
    ));

    let after: Vec<_> = ["authors", "posts", "comments", "citations"]
        .iter()
        .map(|e| driver.inner().records(e))
        .collect();
    assert_eq!(snapshot, after);
}

#[test]
fn test_purge_lifecycle() {
    init_tracing();
    let schema = blog();
    let driver = TracedDriver::new(MemoryDriver::new());
    seeded(&driver, &schema);
    let rt = IntegrityRuntime::new(&schema, &driver);

    rt.soft_delete("authors", &key(1)).unwrap();

    // Grace still has a live post; Ada's subtree is fully soft-deleted.
    let effects = rt.purge("authors", &key(1)).unwrap();
    assert_eq!(effects.purged.len(), 6);
    assert_eq!(
        rt.get("authors", &key(1), ReadOptions::include_deleted())
            .unwrap(),
        None
    );
    assert!(driver.inner().records("comments").is_empty());

    // Purged means gone: not found, not merely hidden.
    let err = rt.purge("authors", &key(1)).unwrap_err();
    assert!(matches!(
        err,
        Error::Constraint(ConstraintError::NotFound { .. })
    ));
}

#[test]
fn test_purge_nulls_editor_references() {
    init_tracing();
    let schema = blog();
    let driver = TracedDriver::new(MemoryDriver::new());
    seeded(&driver, &schema);
    let rt = IntegrityRuntime::new(&schema, &driver);

    // Grace's post goes first, so only her editor link remains.
    rt.soft_delete("posts", &key(3)).unwrap();
    rt.purge("posts", &key(3)).unwrap();

    // Soft-deleting Grace nulls post 1's editor, so the purge has nothing
    // left to clear.
    rt.soft_delete("authors", &key(2)).unwrap();
    let post = rt.get("posts", &key(1), ReadOptions::live()).unwrap().unwrap();
    assert!(post.get("editor_id").is_null());

    let effects = rt.purge("authors", &key(2)).unwrap();
    assert_eq!(effects.purged.len(), 1);
    assert!(effects.nullified.is_empty());
}

#[test]
fn test_load_related_both_directions() {
    init_tracing();
    let schema = blog();
    let driver = TracedDriver::new(MemoryDriver::new());
    seeded(&driver, &schema);
    let rt = IntegrityRuntime::new(&schema, &driver);

    let ada = rt.get("authors", &key(1), ReadOptions::live()).unwrap().unwrap();
    let posts = rt.load_related(&ada, "posts", ReadOptions::live()).unwrap();
    let titles: Vec<Value> = posts
        .to_vec()
        .unwrap()
        .iter()
        .map(|p| p.get("title").clone())
        .collect();
    assert_eq!(titles, vec![Value::from("Engines"), Value::from("Notes")]);

    let first = posts.first().unwrap().unwrap();
    let editor = rt
        .load_related(&first, "editor", ReadOptions::live())
        .unwrap()
        .first()
        .unwrap()
        .unwrap();
    assert_eq!(editor.get("handle"), &Value::from("grace"));

    // Deleted parents are hidden unless asked for.
    rt.soft_delete("authors", &key(2)).unwrap();
    let third = rt
        .get("posts", &key(3), ReadOptions::include_deleted())
        .unwrap()
        .unwrap();
    let author = rt.load_related(&third, "author", ReadOptions::live()).unwrap();
    assert_eq!(author.count().unwrap(), 0);
    let author = rt
        .load_related(&third, "author", ReadOptions::include_deleted())
        .unwrap();
    assert_eq!(author.count().unwrap(), 1);
}

#[test]
fn test_defaults_and_unique_handles() {
    init_tracing();
    let schema = blog();
    let driver = TracedDriver::new(MemoryDriver::new());
    seeded(&driver, &schema);
    let rt = IntegrityRuntime::new(&schema, &driver);

    let comment = rt.get("comments", &key(1), ReadOptions::live()).unwrap().unwrap();
    assert_eq!(comment.get("pinned"), &Value::Boolean(false));

    let err = rt
        .create("authors", values([("handle", "ada".into())]))
        .unwrap_err();
    assert!(matches!(
        err,
        Error::Constraint(ConstraintError::UniqueViolation { .. })
    ));

    let err = rt
        .create("posts", values([("author_id", 99.into()), ("title", "x".into())]))
        .unwrap_err();
    assert!(matches!(
        err,
        Error::Constraint(ConstraintError::ForeignKeyViolation { ref field, .. }) if field == "author_id"
    ));
}
