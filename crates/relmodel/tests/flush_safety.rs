use asupersync::runtime::RuntimeBuilder;
use asupersync::{Cx, Outcome};

use relmodel::prelude::*;
use relmodel::{DependencyError, DependencyErrorKind, FlushResult, OperationKind, PivotTable};

fn unwrap_outcome<T>(outcome: Outcome<T, Error>) -> T {
    match outcome {
        Outcome::Ok(v) => v,
        Outcome::Err(e) => panic!("unexpected error: {e}"),
        Outcome::Cancelled(r) => panic!("cancelled: {r:?}"),
        Outcome::Panicked(p) => panic!("panicked: {p:?}"),
    }
}

fn run_flush(orm: &mut Orm, storage: &MemoryStorage) -> Outcome<FlushResult, Error> {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    rt.block_on(async { orm.flush(&cx, storage).await })
}

fn expect_error(outcome: Outcome<FlushResult, Error>) -> Error {
    match outcome {
        Outcome::Err(e) => e,
        other => std::panic::panic_any(format!("expected a failed flush, got {other:?}")),
    }
}

fn schema() -> Schema {
    Schema::new()
        .define(
            EntitySchema::new("user", "users", "id")
                .relation(RelationSchema::has_one("profile", "profile", "profile_id", "id"))
                .relation(RelationSchema::has_many("posts", "post", "id", "user_id"))
                .relation(RelationSchema::many_to_many(
                    "tags",
                    "tag",
                    "id",
                    "id",
                    PivotTable::new("user_tags", "user_id", "tag_id"),
                )),
        )
        .define(
            EntitySchema::new("profile", "profiles", "id")
                .relation(RelationSchema::has_one("owner", "user", "owner_id", "id")),
        )
        .define(EntitySchema::new("post", "posts", "id"))
        .define(EntitySchema::new("tag", "tags", "id"))
}

fn seeded() -> (Orm, MemoryStorage, EntityRef) {
    let (mut orm, storage) = relmodel::in_memory(schema()).unwrap();
    storage.seed("profiles", [Row::new().with("id", 5_i64).with("bio", "hi")]);
    storage.seed(
        "users",
        [Row::new()
            .with("id", 1_i64)
            .with("name", "ann")
            .with("profile_id", 5_i64)],
    );
    storage.seed(
        "posts",
        [Row::new()
            .with("id", 10_i64)
            .with("user_id", 1_i64)
            .with("title", "a")],
    );
    storage.seed("tags", [Row::new().with("id", 7_i64)]);
    storage.seed(
        "user_tags",
        [Row::new().with("user_id", 1_i64).with("tag_id", 7_i64)],
    );
    let user = orm
        .repository("user")
        .find_by_pk(1_i64)
        .unwrap()
        .expect("user 1");
    (orm, storage, user)
}

#[test]
fn unchanged_graph_emits_no_writes() {
    let (mut orm, storage, user) = seeded();
    for relation in ["profile", "posts", "tags"] {
        orm.relation(user, relation).unwrap();
    }

    let command = orm.store(user).unwrap();
    assert!(!command.is_nil());
    assert_eq!(orm.pending().graph().write_count(&command), 0);

    let result = unwrap_outcome(run_flush(&mut orm, &storage));
    assert_eq!(result.total(), 0);
    assert!(result.skipped > 0);
    assert!(storage.log().is_empty());
}

#[test]
fn untouched_promises_are_not_loaded() {
    let (mut orm, storage, user) = seeded();
    orm.entity_mut(user).unwrap().set("name", "bea");

    orm.store(user).unwrap();
    let result = unwrap_outcome(run_flush(&mut orm, &storage));
    assert_eq!(result.updated, 1);
    assert_eq!(orm.heap().len(), 1);
    for relation in ["profile", "posts", "tags"] {
        assert!(
            orm.entity(user)
                .unwrap()
                .relation(relation)
                .is_some_and(RelationValue::is_unloaded)
        );
    }
}

#[test]
fn forwarding_cycle_is_rejected_before_io() {
    let (mut orm, storage) = relmodel::in_memory(schema()).unwrap();
    let user = orm.create("user", Row::new().with("name", "ann")).unwrap();
    let profile = orm.create("profile", Row::new().with("bio", "hi")).unwrap();
    orm.entity_mut(user)
        .unwrap()
        .set_one("profile", Some(profile));
    orm.entity_mut(profile)
        .unwrap()
        .set_one("owner", Some(user));
    orm.store(user).unwrap();

    let error = expect_error(run_flush(&mut orm, &storage));
    assert!(matches!(
        error,
        Error::Dependency(DependencyError {
            kind: DependencyErrorKind::Cycle,
            ..
        })
    ));
    assert!(storage.log().is_empty());
    assert_eq!(storage.commits(), 0);
    assert!(orm.pending().is_empty());
    assert!(orm.heap().get(user).is_none());
}

#[test]
fn failed_flush_leaves_nodes_untouched() {
    let (mut orm, storage, user) = seeded();
    let profile = orm
        .relation(user, "profile")
        .unwrap()
        .as_single()
        .flatten()
        .expect("profile 5");
    assert_eq!(orm.heap().get(profile).unwrap().ref_count(), 1);

    orm.entity_mut(user).unwrap().set("name", "bea");
    orm.entity_mut(user).unwrap().set_one("profile", None);
    orm.store(user).unwrap();
    assert_eq!(orm.node(profile).unwrap().ref_count(), 0);

    storage.fail_on("users");
    let error = expect_error(run_flush(&mut orm, &storage));
    assert!(error.is_storage_error());
    assert_eq!(storage.rollbacks(), 1);
    assert!(orm.pending().is_empty());

    let node = orm.heap().get(user).unwrap();
    assert_eq!(node.status(), NodeStatus::Loaded);
    assert_eq!(node.data().get("name"), Some(&Value::from("ann")));
    let target = orm.heap().get(profile).unwrap();
    assert_eq!(target.ref_count(), 1);
    assert_eq!(target.status(), NodeStatus::Loaded);
    assert_eq!(storage.rows("profiles").len(), 1);
    assert_eq!(
        orm.entity(user).unwrap().get("name"),
        Some(&Value::from("bea"))
    );

    // The same change goes through once storage accepts it.
    storage.clear_failures();
    orm.store(user).unwrap();
    let result = unwrap_outcome(run_flush(&mut orm, &storage));
    assert_eq!(result.updated, 1);
    assert_eq!(result.deleted, 1);
    assert!(storage.rows("profiles").is_empty());
    assert_eq!(
        orm.heap().get(user).unwrap().data().get("name"),
        Some(&Value::from("bea"))
    );
}

#[test]
fn edits_after_store_stay_pending() {
    let (mut orm, storage, user) = seeded();
    orm.entity_mut(user).unwrap().set("name", "a");
    orm.store(user).unwrap();
    orm.entity_mut(user).unwrap().set("name", "b");
    assert!(orm.store(user).unwrap().is_nil());

    let result = unwrap_outcome(run_flush(&mut orm, &storage));
    assert_eq!(result.updated, 1);
    assert_eq!(storage.rows("users")[0].get("name"), Some(&Value::from("a")));
    assert_eq!(orm.entity(user).unwrap().get("name"), Some(&Value::from("b")));
    assert_eq!(
        orm.heap().get(user).unwrap().data().get("name"),
        Some(&Value::from("a"))
    );

    orm.store(user).unwrap();
    let result = unwrap_outcome(run_flush(&mut orm, &storage));
    assert_eq!(result.updated, 1);
    assert_eq!(storage.rows("users")[0].get("name"), Some(&Value::from("b")));
}

#[test]
fn inserted_entity_keeps_later_edits_and_receives_its_key() {
    let (mut orm, storage) = relmodel::in_memory(schema()).unwrap();
    let tag = orm.create("tag", Row::new().with("name", "rust")).unwrap();
    orm.store(tag).unwrap();
    orm.entity_mut(tag).unwrap().set("name", "go");

    let result = unwrap_outcome(run_flush(&mut orm, &storage));
    assert_eq!(result.inserted, 1);
    let entity = orm.entity(tag).unwrap();
    assert_eq!(entity.get("id"), Some(&Value::BigInt(1)));
    assert_eq!(entity.get("name"), Some(&Value::from("go")));
    assert_eq!(storage.rows("tags")[0].get("name"), Some(&Value::from("rust")));
}

#[test]
fn heap_refusal_after_commit_still_reports_success() {
    let (mut orm, storage) = relmodel::in_memory(schema()).unwrap();
    // Tracked without a stored row, so storage hands out the same key.
    let ghost = orm
        .make("tag", Row::new().with("id", 1_i64), NodeStatus::Loaded)
        .unwrap();
    let tag = orm.create("tag", Row::new().with("name", "rust")).unwrap();
    orm.store(tag).unwrap();

    let result = unwrap_outcome(run_flush(&mut orm, &storage));
    assert_eq!(result.inserted, 1);
    assert_eq!(storage.commits(), 1);
    assert_eq!(storage.rows("tags").len(), 1);
    assert!(orm.heap().get(tag).is_none());
    assert_eq!(orm.heap().get_path("tag", &Value::BigInt(1)), Some(ghost));
}

#[test]
fn configuration_controls_noop_updates() {
    let config =
        OrmConfig::from_json(r#"{"skip_noop_updates": false, "ref_link_threshold": 3}"#).unwrap();
    assert_eq!(config.ref_link_threshold, 3);
    assert!(config.rollback_on_error);
    assert!(OrmConfig::from_json(r#"{"ref_link_threshold": "many"}"#).is_err());

    let (orm, storage, user) = seeded();
    let mut orm = orm.with_config(config);
    orm.store(user).unwrap();
    let result = unwrap_outcome(run_flush(&mut orm, &storage));
    assert_eq!(result.updated, 1);
    assert_eq!(storage.log()[0].kind, OperationKind::Update);
}

#[test]
fn deleting_a_loaded_entity_detaches_it() {
    let (mut orm, storage, user) = seeded();
    let post = orm
        .repository("post")
        .find_by_pk(10_i64)
        .unwrap()
        .expect("post 10");

    orm.delete(post).unwrap();
    assert!(orm.delete(post).unwrap().is_nil());
    let result = unwrap_outcome(run_flush(&mut orm, &storage));

    assert_eq!(result.deleted, 1);
    assert!(orm.heap().get(post).is_none());
    assert!(orm.heap().get(user).is_some());
    assert!(storage.rows("posts").is_empty());
}
