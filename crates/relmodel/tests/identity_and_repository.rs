use std::collections::BTreeMap;

use relmodel::RelationData;
use relmodel::prelude::*;

fn schema() -> Schema {
    Schema::new()
        .define(
            EntitySchema::new("user", "users", "id")
                .relation(RelationSchema::has_many("posts", "post", "id", "user_id")),
        )
        .define(EntitySchema::new("post", "posts", "id"))
}

fn seeded() -> (Orm, MemoryStorage) {
    let (orm, storage) = relmodel::in_memory(schema()).expect("valid schema");
    storage.seed(
        "users",
        [
            Row::new().with("id", 1_i64).with("name", "ann"),
            Row::new().with("id", 2_i64).with("name", "bob"),
        ],
    );
    storage.seed(
        "posts",
        [
            Row::new()
                .with("id", 10_i64)
                .with("user_id", 1_i64)
                .with("title", "first"),
            Row::new()
                .with("id", 11_i64)
                .with("user_id", 1_i64)
                .with("title", "second"),
            Row::new()
                .with("id", 12_i64)
                .with("user_id", 2_i64)
                .with("title", "third"),
        ],
    );
    (orm, storage)
}

#[test]
fn loading_the_same_key_twice_yields_the_same_entity() {
    let (mut orm, _storage) = seeded();

    let by_pk = orm
        .repository("user")
        .find_by_pk(1_i64)
        .unwrap()
        .expect("user 1");
    let by_name = orm
        .repository("user")
        .find_one(Criteria::eq("name", "ann"))
        .unwrap()
        .expect("user 1");
    let again = orm
        .repository("user")
        .find_by_pk(1_i64)
        .unwrap()
        .expect("user 1");

    assert_eq!(by_pk, by_name);
    assert_eq!(by_pk, again);
    assert_eq!(orm.heap().len(), 1);
    assert!(orm.repository("user").find_by_pk(99_i64).unwrap().is_none());
}

#[test]
fn lazy_collection_resolves_once_into_tracked_entities() {
    let (mut orm, _storage) = seeded();
    let user = orm
        .repository("user")
        .find_by_pk(1_i64)
        .unwrap()
        .expect("user 1");
    assert!(
        orm.entity(user)
            .unwrap()
            .relation("posts")
            .is_some_and(RelationValue::is_unloaded)
    );

    let posts = orm.relation(user, "posts").unwrap();
    let posts = posts.as_many().expect("collection").clone();
    assert_eq!(posts.len(), 2);

    let again = orm.relation(user, "posts").unwrap();
    assert_eq!(again.as_many(), Some(&posts));

    let first = orm
        .repository("post")
        .find_by_pk(10_i64)
        .unwrap()
        .expect("post 10");
    assert!(posts.contains(first));
    assert_eq!(orm.heap().get(first).unwrap().claim_count(), 1);
}

#[test]
fn scoped_repository_keeps_the_original_scope() {
    let (mut orm, _storage) = seeded();
    let repository = orm.repository("post");
    assert!(repository.scope().filters().is_empty());

    let mut scoped = repository.with_scope(|scope| scope.where_eq("user_id", 1_i64));
    assert_eq!(scoped.scope().filters().len(), 1);

    let narrowed = scoped.select(&Criteria::eq("title", "second"));
    assert_eq!(narrowed.filters().len(), 2);
    assert_eq!(scoped.scope().filters().len(), 1);

    assert_eq!(scoped.find_all(Criteria::new()).unwrap().len(), 2);
    let second = scoped
        .find_one(Criteria::eq("title", "second"))
        .unwrap()
        .expect("post 11");
    assert!(
        scoped
            .find_one(Criteria::eq("title", "third"))
            .unwrap()
            .is_none()
    );

    assert_eq!(
        orm.entity(second).unwrap().get("id"),
        Some(&Value::BigInt(11))
    );
}

#[test]
fn scoped_lookup_by_key_ignores_tracked_rows_outside_the_scope() {
    let (mut orm, _storage) = seeded();
    let ann = orm
        .repository("user")
        .find_by_pk(1_i64)
        .unwrap()
        .expect("user 1");

    let outside = orm
        .repository("user")
        .with_scope(|scope| scope.where_eq("name", "bob"))
        .find_by_pk(1_i64)
        .unwrap();
    assert!(outside.is_none());

    let inside = orm
        .repository("user")
        .with_scope(|scope| scope.where_eq("name", "ann"))
        .find_by_pk(1_i64)
        .unwrap();
    assert_eq!(inside, Some(ann));

    // Untracked keys still go through the scoped query.
    let bob = orm
        .repository("user")
        .with_scope(|scope| scope.where_eq("name", "bob"))
        .find_by_pk(2_i64)
        .unwrap();
    assert!(bob.is_some());
    assert_eq!(orm.heap().len(), 2);
}

#[test]
fn eager_rows_need_no_selector() {
    let mut orm = Orm::new(schema(), DefaultFactory::new());
    let mut eager = BTreeMap::new();
    eager.insert(
        "posts".to_string(),
        RelationData::Many(vec![
            Row::new().with("id", 10_i64).with("user_id", 1_i64),
            Row::new().with("id", 11_i64).with("user_id", 1_i64),
        ]),
    );

    let user = orm
        .make_with(
            "user",
            Row::new().with("id", 1_i64).with("name", "ann"),
            NodeStatus::Loaded,
            eager,
        )
        .unwrap();

    let posts = orm.relation(user, "posts").unwrap();
    assert_eq!(posts.as_many().map(Collection::len), Some(2));
    assert_eq!(orm.heap().len(), 3);
    assert!(orm.repository("post").find_all(Criteria::new()).is_err());
}
