use asupersync::runtime::RuntimeBuilder;
use asupersync::{Cx, Outcome};

use relmodel::prelude::*;
use relmodel::{FlushResult, OperationKind, Predicate};

fn unwrap_outcome<T>(outcome: Outcome<T, Error>) -> T {
    match outcome {
        Outcome::Ok(v) => v,
        Outcome::Err(e) => panic!("unexpected error: {e}"),
        Outcome::Cancelled(r) => panic!("cancelled: {r:?}"),
        Outcome::Panicked(p) => panic!("panicked: {p:?}"),
    }
}

fn flush(orm: &mut Orm, storage: &MemoryStorage) -> FlushResult {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    rt.block_on(async { unwrap_outcome(orm.flush(&cx, storage).await) })
}

fn setup() -> (Orm, MemoryStorage) {
    let schema = Schema::new()
        .define(
            EntitySchema::new("user", "users", "id")
                .relation(RelationSchema::has_many("posts", "post", "id", "user_id")),
        )
        .define(EntitySchema::new("post", "posts", "id"));
    let (orm, storage) = relmodel::in_memory(schema).unwrap();
    storage.seed(
        "users",
        [
            Row::new().with("id", 1_i64).with("name", "ann"),
            Row::new().with("id", 2_i64).with("name", "bob"),
        ],
    );
    storage.seed(
        "posts",
        ["a", "b", "c"].into_iter().zip(10_i64..).map(|(title, id)| {
            Row::new()
                .with("id", id)
                .with("user_id", 1_i64)
                .with("title", title)
        }),
    );
    (orm, storage)
}

fn load(orm: &mut Orm, role: &str, id: i64) -> EntityRef {
    orm.repository(role)
        .find_by_pk(id)
        .unwrap()
        .unwrap_or_else(|| panic!("{role} {id} is seeded"))
}

fn posts(orm: &mut Orm, user: EntityRef) -> Collection {
    orm.relation(user, "posts")
        .unwrap()
        .as_many()
        .cloned()
        .expect("collection")
}

#[test]
fn removed_element_is_the_only_delete_candidate() {
    let (mut orm, storage) = setup();
    let user = load(&mut orm, "user", 1);
    let mut collection = posts(&mut orm, user);
    let a = load(&mut orm, "post", 10);
    let b = load(&mut orm, "post", 11);
    let c = load(&mut orm, "post", 12);
    assert_eq!(collection.entities().collect::<Vec<_>>(), vec![a, b, c]);

    let d = orm.create("post", Row::new().with("title", "d")).unwrap();
    collection.remove(b);
    collection.push(d);
    orm.entity_mut(user)
        .unwrap()
        .set_relation("posts", RelationValue::Many(collection));

    let command = orm.store(user).unwrap();
    let operations = command.operations();
    for item in [a, c, d] {
        let producer = orm.pending().producer(item).expect("stored");
        assert!(operations.contains(&producer));
    }
    let conditions = command.conditions();
    assert_eq!(conditions.len(), 1);
    assert_eq!(*conditions[0].0, Predicate::NoClaims(b));
    assert_eq!(
        conditions[0].1.operations(),
        vec![orm.pending().deletion(b).expect("delete queued")]
    );

    storage.clear_log();
    let result = flush(&mut orm, &storage);
    assert_eq!(result.inserted, 1);
    assert_eq!(result.deleted, 1);
    assert_eq!(result.updated, 0);

    let deletes: Vec<_> = storage
        .log()
        .into_iter()
        .filter(|s| s.kind == OperationKind::Delete)
        .collect();
    assert_eq!(deletes.len(), 1);
    assert_eq!(deletes[0].scope, Row::new().with("id", 11_i64));

    let rows = storage.rows("posts");
    assert_eq!(rows.len(), 3);
    let inserted = rows
        .iter()
        .find(|row| row.get("title") == Some(&Value::from("d")))
        .expect("d stored");
    assert_eq!(inserted.get("user_id"), Some(&Value::BigInt(1)));

    assert!(orm.heap().get(b).is_none());
    for item in [a, c, d] {
        assert_eq!(orm.heap().get(item).unwrap().claim_count(), 1);
    }
}

#[test]
fn element_moved_between_collections_survives() {
    let (mut orm, storage) = setup();
    let ann = load(&mut orm, "user", 1);
    let bob = load(&mut orm, "user", 2);
    let mut from = posts(&mut orm, ann);
    let mut to = posts(&mut orm, bob);
    let a = load(&mut orm, "post", 10);

    from.remove(a);
    to.push(a);
    orm.entity_mut(ann)
        .unwrap()
        .set_relation("posts", RelationValue::Many(from));
    orm.entity_mut(bob)
        .unwrap()
        .set_relation("posts", RelationValue::Many(to));

    // Removal is queued before the new owner claims the post.
    orm.store(ann).unwrap();
    orm.store(bob).unwrap();
    let result = flush(&mut orm, &storage);

    assert_eq!(result.deleted, 0);
    assert_eq!(result.updated, 1);
    let moved = storage
        .rows("posts")
        .into_iter()
        .find(|row| row.get("id") == Some(&Value::BigInt(10)))
        .expect("post a kept");
    assert_eq!(moved.get("user_id"), Some(&Value::BigInt(2)));

    let node = orm.heap().get(a).expect("still tracked");
    assert_eq!(node.claim_count(), 1);
    assert_eq!(node.status(), NodeStatus::Loaded);
    assert_eq!(orm.entity(a).unwrap().get("user_id"), Some(&Value::BigInt(2)));
}

#[test]
fn new_parent_key_reaches_new_children() {
    let (mut orm, storage) = setup();
    let user = orm.create("user", Row::new().with("name", "cid")).unwrap();
    let first = orm.create("post", Row::new().with("title", "x")).unwrap();
    let second = orm.create("post", Row::new().with("title", "y")).unwrap();
    orm.entity_mut(user)
        .unwrap()
        .set_relation("posts", RelationValue::many([first, second]));

    orm.store(user).unwrap();
    storage.clear_log();
    let result = flush(&mut orm, &storage);
    assert_eq!(result.inserted, 3);

    let log = storage.log();
    assert_eq!(log[0].table, "users");
    let user_id = orm.entity(user).unwrap().get("id").cloned().expect("key");
    assert_eq!(user_id, Value::BigInt(3));
    for post in [first, second] {
        assert_eq!(orm.entity(post).unwrap().get("user_id"), Some(&user_id));
        assert_eq!(orm.heap().get(post).unwrap().claim_count(), 1);
    }
}

#[test]
fn unchanged_collection_writes_nothing() {
    let (mut orm, storage) = setup();
    let user = load(&mut orm, "user", 1);
    posts(&mut orm, user);

    let command = orm.store(user).unwrap();
    assert_eq!(orm.pending().graph().write_count(&command), 0);
    storage.clear_log();
    let result = flush(&mut orm, &storage);
    assert_eq!(result.total(), 0);
    assert!(storage.log().is_empty());
}
