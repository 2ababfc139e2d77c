use asupersync::runtime::RuntimeBuilder;
use asupersync::{Cx, Outcome};

use relmodel::prelude::*;
use relmodel::{FlushResult, OperationKind, PivotTable, Statement};

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

fn schema() -> Schema {
    Schema::new()
        .define(
            EntitySchema::new("user", "users", "id").relation(RelationSchema::many_to_many(
                "tags",
                "tag",
                "id",
                "id",
                PivotTable::new("user_tags", "user_id", "tag_id"),
            )),
        )
        .define(EntitySchema::new("tag", "tags", "id"))
}

/// User 1 linked to tag 7 since 2020; tag 8 exists unlinked.
fn seeded() -> (Orm, MemoryStorage, EntityRef) {
    let (mut orm, storage) = relmodel::in_memory(schema()).unwrap();
    storage.seed("users", [Row::new().with("id", 1_i64).with("name", "ann")]);
    storage.seed(
        "tags",
        [
            Row::new().with("id", 7_i64).with("name", "rust"),
            Row::new().with("id", 8_i64).with("name", "go"),
        ],
    );
    storage.seed(
        "user_tags",
        [Row::new()
            .with("user_id", 1_i64)
            .with("tag_id", 7_i64)
            .with("since", 2020_i64)],
    );
    let user = orm
        .repository("user")
        .find_by_pk(1_i64)
        .unwrap()
        .expect("user 1");
    (orm, storage, user)
}

fn tags(orm: &mut Orm, user: EntityRef) -> Collection {
    orm.relation(user, "tags")
        .unwrap()
        .as_many()
        .cloned()
        .expect("collection")
}

fn links(storage: &MemoryStorage) -> Vec<Statement> {
    storage
        .log()
        .into_iter()
        .filter(|s| s.table == "user_tags")
        .collect()
}

#[test]
fn new_pair_links_once_with_forwarded_keys() {
    let (mut orm, storage) = relmodel::in_memory(schema()).unwrap();
    storage.seed("users", [Row::new().with("id", 4_i64)]);
    storage.seed("tags", [Row::new().with("id", 40_i64)]);

    let user = orm.create("user", Row::new().with("name", "ann")).unwrap();
    let tag = orm.create("tag", Row::new().with("name", "rust")).unwrap();
    orm.entity_mut(user)
        .unwrap()
        .set_relation("tags", RelationValue::many([tag]));
    orm.store(user).unwrap();

    storage.clear_log();
    let result = flush(&mut orm, &storage);
    assert_eq!(result.inserted, 3);

    let log = storage.log();
    let link = log
        .iter()
        .position(|s| s.table == "user_tags")
        .expect("join row inserted");
    assert_eq!(link, 2);
    assert_eq!(
        log[link].context,
        Row::new().with("user_id", 5_i64).with("tag_id", 41_i64)
    );
    assert_eq!(storage.rows("user_tags").len(), 1);

    // Saving the same pair again touches nothing.
    storage.clear_log();
    let command = orm.store(user).unwrap();
    assert_eq!(orm.pending().graph().write_count(&command), 0);
    let result = flush(&mut orm, &storage);
    assert_eq!(result.total(), 0);
    assert!(storage.log().is_empty());
    assert_eq!(storage.rows("user_tags").len(), 1);
}

#[test]
fn loaded_links_carry_pivot_data() {
    let (mut orm, _storage, user) = seeded();
    let collection = tags(&mut orm, user);
    assert_eq!(collection.len(), 1);

    let rust = orm
        .repository("tag")
        .find_by_pk(7_i64)
        .unwrap()
        .expect("tag 7");
    assert_eq!(
        collection.pivot(rust),
        Some(&Row::new().with("since", 2020_i64))
    );
}

#[test]
fn changed_pivot_data_updates_the_join_row() {
    let (mut orm, storage, user) = seeded();
    let mut collection = tags(&mut orm, user);
    let rust = orm
        .repository("tag")
        .find_by_pk(7_i64)
        .unwrap()
        .expect("tag 7");
    assert!(collection.set_pivot(rust, "since", 2021_i64));
    orm.entity_mut(user)
        .unwrap()
        .set_relation("tags", RelationValue::Many(collection));

    orm.store(user).unwrap();
    storage.clear_log();
    let result = flush(&mut orm, &storage);
    assert_eq!(result.updated, 1);

    let statements = links(&storage);
    assert_eq!(statements.len(), 1);
    assert_eq!(statements[0].kind, OperationKind::Update);
    assert_eq!(
        statements[0].scope,
        Row::new().with("user_id", 1_i64).with("tag_id", 7_i64)
    );
    assert_eq!(statements[0].context, Row::new().with("since", 2021_i64));
    assert_eq!(
        storage.rows("user_tags")[0].get("since"),
        Some(&Value::BigInt(2021))
    );
}

#[test]
fn unlinking_deletes_only_the_join_row() {
    let (mut orm, storage, user) = seeded();
    let mut collection = tags(&mut orm, user);
    let rust = orm
        .repository("tag")
        .find_by_pk(7_i64)
        .unwrap()
        .expect("tag 7");
    let go = orm
        .repository("tag")
        .find_by_pk(8_i64)
        .unwrap()
        .expect("tag 8");
    collection.remove(rust);
    collection.push_with(go, Row::new().with("since", 2024_i64));
    orm.entity_mut(user)
        .unwrap()
        .set_relation("tags", RelationValue::Many(collection));

    orm.store(user).unwrap();
    storage.clear_log();
    let result = flush(&mut orm, &storage);
    assert_eq!(result.inserted, 1);
    assert_eq!(result.deleted, 1);

    let statements = links(&storage);
    let delete = statements
        .iter()
        .find(|s| s.kind == OperationKind::Delete)
        .expect("join row delete");
    assert_eq!(
        delete.scope,
        Row::new().with("user_id", 1_i64).with("tag_id", 7_i64)
    );

    assert_eq!(storage.rows("tags").len(), 2);
    assert!(orm.heap().get(rust).is_some());
    assert_eq!(
        storage.rows("user_tags"),
        vec![
            Row::new()
                .with("since", 2024_i64)
                .with("user_id", 1_i64)
                .with("tag_id", 8_i64)
        ]
    );
}
