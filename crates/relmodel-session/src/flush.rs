//! Plan execution against a storage backend.
//!
//! The executor walks an `ExecutionPlan` in order:
//! - guards are evaluated right before their leaf, against staged counters
//! - each leaf waits until every slot it depends on has been filled
//! - the result row of each leaf is pushed into the slots of its consumers
//!
//! All writes happen between `Storage::begin` and `Storage::commit`. The
//! first failure stops execution, asks the backend to roll back and is
//! returned unchanged.

use crate::OrmConfig;
use crate::command::{CommandId, Operation, OperationKind, Predicate};
use crate::heap::Heap;
use crate::unit_of_work::{ExecutionPlan, UnitOfWork};
use asupersync::{Cx, Outcome};
use relmodel_core::{
    DependencyError, DependencyErrorKind, Error, OrphanReferenceError, Row, Value,
};
use std::collections::{HashMap, HashSet};
use std::future::Future;

/// Outcome of one storage write.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StorageResult {
    /// Number of rows touched.
    pub affected: u64,
    /// Key generated by the backend on insert, if any.
    pub generated_key: Option<Value>,
}

impl StorageResult {
    pub fn affected(affected: u64) -> Self {
        Self {
            affected,
            generated_key: None,
        }
    }

    #[must_use]
    pub fn with_generated_key(mut self, key: impl Into<Value>) -> Self {
        self.generated_key = Some(key.into());
        self
    }
}

/// Backend executing leaf operations.
///
/// One flush calls `begin` once, `execute` for every leaf in plan order,
/// then either `commit` or `rollback`.
pub trait Storage: Send + Sync {
    fn begin(&self, cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send;

    fn execute(
        &self,
        cx: &Cx,
        operation: &Operation,
    ) -> impl Future<Output = Outcome<StorageResult, Error>> + Send;

    fn commit(&self, cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send;

    fn rollback(&self, cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send;
}

/// Counts of a flush.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FlushResult {
    /// Number of rows inserted.
    pub inserted: usize,
    /// Number of rows updated.
    pub updated: usize,
    /// Number of rows deleted.
    pub deleted: usize,
    /// Leaves not sent to storage: failed guards and updates with no change.
    pub skipped: usize,
}

impl FlushResult {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of writes sent to storage.
    pub fn total(&self) -> usize {
        self.inserted + self.updated + self.deleted
    }
}

/// Detailed outcome of an executed plan.
#[derive(Debug, Default, Clone)]
pub struct FlushReport {
    pub result: FlushResult,
    /// Result row of every leaf that ran (or was an unchanged update).
    pub executed: HashMap<CommandId, Row>,
    /// Leaves whose guard did not hold.
    pub skipped: HashSet<CommandId>,
}

/// Execute a compiled plan inside a storage transaction.
#[tracing::instrument(level = "debug", skip_all, fields(steps = plan.len()))]
pub async fn execute_plan<S: Storage>(
    cx: &Cx,
    storage: &S,
    uow: &UnitOfWork,
    plan: &ExecutionPlan,
    heap: &Heap,
    config: &OrmConfig,
) -> Outcome<FlushReport, Error> {
    let mut report = FlushReport::default();
    if plan.is_empty() {
        return Outcome::Ok(report);
    }

    match storage.begin(cx).await {
        Outcome::Ok(()) => {}
        Outcome::Err(e) => return Outcome::Err(e),
        Outcome::Cancelled(r) => return Outcome::Cancelled(r),
        Outcome::Panicked(p) => return Outcome::Panicked(p),
    }

    // Working copies; forwarded values are written into these.
    let mut operations: HashMap<CommandId, Operation> = plan
        .steps()
        .iter()
        .filter_map(|step| uow.graph().get(step.id).map(|op| (step.id, op.clone())))
        .collect();

    for step in plan.steps() {
        match guards_hold(&step.guards, uow, heap) {
            Ok(true) => {}
            Ok(false) => {
                tracing::debug!(command = %uow.graph().label(step.id), "Guard failed, skipping");
                report.skipped.insert(step.id);
                report.result.skipped += 1;
                continue;
            }
            Err(e) => return abort(cx, storage, config, Outcome::Err(e)).await,
        }

        let Some(op) = operations.get(&step.id).cloned() else {
            let e = missing_value(uow.graph().label(step.id), None);
            return abort(cx, storage, config, Outcome::Err(e)).await;
        };
        if let Some(slot) = op.waiting().iter().next() {
            let e = missing_value(op.label(), Some(slot.to_string()));
            return abort(cx, storage, config, Outcome::Err(e)).await;
        }

        let row = if config.skip_noop_updates && op.is_noop() {
            tracing::trace!(command = %op.label(), "Update has no changes");
            report.result.skipped += 1;
            op.result_row(None)
        } else {
            let prepared = match op.kind() {
                OperationKind::Update => op.clone().with_context(op.changes()),
                _ => op.clone(),
            };
            tracing::debug!(
                command = %op.label(),
                table = op.table(),
                columns = prepared.context().len(),
                "Executing command"
            );
            let result = match storage.execute(cx, &prepared).await {
                Outcome::Ok(result) => result,
                Outcome::Err(e) => return abort(cx, storage, config, Outcome::Err(e)).await,
                Outcome::Cancelled(r) => {
                    return abort(cx, storage, config, Outcome::Cancelled(r)).await;
                }
                Outcome::Panicked(p) => {
                    return abort(cx, storage, config, Outcome::Panicked(p)).await;
                }
            };
            match op.kind() {
                OperationKind::Insert => report.result.inserted += 1,
                OperationKind::Update => report.result.updated += 1,
                OperationKind::Delete => report.result.deleted += 1,
            }
            op.result_row(result.generated_key.as_ref())
        };

        for forward in op.forwards() {
            let Some(value) = row.get_present(&forward.column) else {
                tracing::trace!(
                    command = %op.label(),
                    column = %forward.column,
                    "Result has no value to forward"
                );
                continue;
            };
            if let Some(consumer) = operations.get_mut(&forward.consumer) {
                consumer.accept(&forward.slot, value.clone());
            }
        }
        report.executed.insert(step.id, row);
    }

    match storage.commit(cx).await {
        Outcome::Ok(()) => {}
        other => return abort(cx, storage, config, other).await,
    }

    tracing::info!(
        inserted = report.result.inserted,
        updated = report.result.updated,
        deleted = report.result.deleted,
        skipped = report.result.skipped,
        "Plan executed"
    );
    Outcome::Ok(report)
}

/// Evaluate every guard of a leaf.
fn guards_hold(guards: &[Predicate], uow: &UnitOfWork, heap: &Heap) -> Result<bool, Error> {
    for predicate in guards {
        let entity = predicate.entity();
        let Some(node) = uow.staged(entity).or_else(|| heap.get(entity)) else {
            return Err(Error::Orphan(OrphanReferenceError {
                entity,
                message: format!("cannot evaluate \"{predicate}\": entity is not tracked"),
            }));
        };
        if !predicate.evaluate(node) {
            return Ok(false);
        }
    }
    Ok(true)
}

fn missing_value(label: String, slot: Option<String>) -> Error {
    Error::Dependency(DependencyError {
        kind: DependencyErrorKind::Unresolved,
        message: match &slot {
            Some(slot) => format!("{label} still waits for {slot}"),
            None => format!("{label} is not part of the plan"),
        },
        commands: vec![label],
        slot,
    })
}

/// Roll back after a failure and hand the failure back.
async fn abort<S: Storage, T>(
    cx: &Cx,
    storage: &S,
    config: &OrmConfig,
    failure: Outcome<(), Error>,
) -> Outcome<T, Error> {
    if config.rollback_on_error {
        match storage.rollback(cx).await {
            Outcome::Ok(()) => {}
            Outcome::Err(e) => tracing::warn!(error = %e, "Rollback after failed flush failed"),
            Outcome::Cancelled(_) => tracing::warn!("Rollback after failed flush was cancelled"),
            Outcome::Panicked(_) => tracing::warn!("Rollback after failed flush panicked"),
        }
    }
    match failure {
        Outcome::Ok(()) => Outcome::Err(Error::Custom(
            "flush aborted without a failure".to_string(),
        )),
        Outcome::Err(e) => Outcome::Err(e),
        Outcome::Cancelled(r) => Outcome::Cancelled(r),
        Outcome::Panicked(p) => Outcome::Panicked(p),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{Command, Slot};
    use crate::entity::Entity;
    use crate::memory::MemoryStorage;
    use crate::node::Node;
    use asupersync::runtime::RuntimeBuilder;
    use relmodel_core::StorageErrorKind;

    fn unwrap_outcome<T: std::fmt::Debug>(outcome: Outcome<T, Error>) -> T {
        match outcome {
            Outcome::Ok(v) => v,
            other => std::panic::panic_any(format!("unexpected outcome: {other:?}")),
        }
    }

    fn user_and_post(uow: &mut UnitOfWork) -> (CommandId, CommandId) {
        let user = uow.graph_mut().add(
            Operation::insert("users")
                .with_primary_key("id")
                .with_context(Row::new().with("name", "ann")),
        );
        let post = uow.graph_mut().add(
            Operation::insert("posts")
                .with_primary_key("id")
                .with_context(Row::new().with("title", "hi")),
        );
        uow.graph_mut()
            .forward(user, "id", post, Slot::context("user_id"))
            .unwrap();
        uow.push(Command::sequence([
            Command::Operation(post),
            Command::Operation(user),
        ]));
        (user, post)
    }

    #[test]
    fn test_generated_key_is_forwarded() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let storage = MemoryStorage::new();
        let mut uow = UnitOfWork::new();
        let (user, post) = user_and_post(&mut uow);
        let plan = uow.compile().unwrap();

        rt.block_on(async {
            let report = unwrap_outcome(
                execute_plan(&cx, &storage, &uow, &plan, &Heap::new(), &OrmConfig::default())
                    .await,
            );
            assert_eq!(report.result.inserted, 2);
            let user_id = report.executed[&user].get("id").cloned().unwrap();
            assert_eq!(report.executed[&post].get("user_id"), Some(&user_id));
        });

        let posts = storage.rows("posts");
        assert_eq!(posts.len(), 1);
        assert!(posts[0].get_present("user_id").is_some());
    }

    #[test]
    fn test_failed_guard_skips_leaf() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let storage = MemoryStorage::new();

        let mut heap = Heap::new();
        let tag = heap.insert(Entity::new("tag"));
        let mut node = Node::loaded("tag", Value::BigInt(1), Row::new().with("id", 1_i64));
        node.add_ref();
        heap.attach(tag, node).unwrap();

        let mut uow = UnitOfWork::new();
        let delete = uow.graph_mut().add(
            Operation::delete("tags").with_scope(Row::new().with("id", 1_i64)),
        );
        uow.push(Command::condition(
            Predicate::NoReferences(tag),
            Command::Operation(delete),
        ));
        let plan = uow.compile().unwrap();

        rt.block_on(async {
            let report = unwrap_outcome(
                execute_plan(&cx, &storage, &uow, &plan, &heap, &OrmConfig::default()).await,
            );
            assert!(report.skipped.contains(&delete));
            assert_eq!(report.result.total(), 0);
        });
        assert!(storage.log().is_empty());
    }

    #[test]
    fn test_guard_without_node_is_orphan() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let storage = MemoryStorage::new();

        let mut uow = UnitOfWork::new();
        let delete = uow.graph_mut().add(Operation::delete("tags"));
        uow.push(Command::condition(
            Predicate::NoClaims(relmodel_core::EntityRef::from_raw(42)),
            Command::Operation(delete),
        ));
        let plan = uow.compile().unwrap();

        rt.block_on(async {
            let outcome =
                execute_plan(&cx, &storage, &uow, &plan, &Heap::new(), &OrmConfig::default())
                    .await;
            assert!(matches!(outcome, Outcome::Err(Error::Orphan(_))));
        });
        assert_eq!(storage.rollbacks(), 1);
    }

    #[test]
    fn test_storage_failure_rolls_back() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let storage = MemoryStorage::new();
        storage.fail_on("posts");

        let mut uow = UnitOfWork::new();
        user_and_post(&mut uow);
        let plan = uow.compile().unwrap();

        rt.block_on(async {
            let outcome =
                execute_plan(&cx, &storage, &uow, &plan, &Heap::new(), &OrmConfig::default())
                    .await;
            match outcome {
                Outcome::Err(Error::Storage(e)) => assert_eq!(e.kind, StorageErrorKind::Constraint),
                other => std::panic::panic_any(format!("unexpected outcome: {other:?}")),
            }
        });
        assert!(storage.rows("users").is_empty());
        assert_eq!(storage.rollbacks(), 1);
    }

    #[test]
    fn test_noop_update_is_not_sent() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let storage = MemoryStorage::new();

        let mut uow = UnitOfWork::new();
        let baseline = Row::new().with("id", 1_i64).with("name", "ann");
        let update = uow.graph_mut().add(
            Operation::update("users")
                .with_scope(Row::new().with("id", 1_i64))
                .with_baseline(baseline)
                .with_context(Row::new().with("name", "ann")),
        );
        uow.push(Command::Operation(update));
        let plan = uow.compile().unwrap();

        rt.block_on(async {
            let report = unwrap_outcome(
                execute_plan(&cx, &storage, &uow, &plan, &Heap::new(), &OrmConfig::default())
                    .await,
            );
            assert_eq!(report.result.updated, 0);
            assert_eq!(report.result.skipped, 1);
            assert!(report.executed.contains_key(&update));
        });
        assert!(storage.log().is_empty());
    }
}
