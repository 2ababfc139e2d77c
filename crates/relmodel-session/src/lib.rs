//! Entity tracking and flush orchestration for relmodel.
//!
//! `relmodel-session` turns changes to an in-memory entity graph into an
//! ordered, dependency-correct set of storage writes.
//!
//! # Role In The Architecture
//!
//! - **Heap**: identity map guaranteeing one entity per (role, primary key).
//! - **Nodes**: per-entity status plus reference and claim counters.
//! - **Commands**: insert/update/delete leaves combined into sequences,
//!   conditions and deferred groups, with value forwarding between leaves.
//! - **Relations**: resolvers diffing relation values into commands.
//! - **Orm**: explicit context object tying schema, factory, heap and the
//!   pending unit of work together.
//!
//! # Design Philosophy
//!
//! - **Staged mutation**: every counter and status change made while a flush
//!   is built lands on a staged node copy. Tracked nodes only change after
//!   the storage backend reports success.
//! - **Validate before I/O**: unresolvable waits and forwarding cycles are
//!   rejected before the first write.
//! - **Cancel-correct**: storage calls use `Cx` + `Outcome`.
//!
//! # Example
//!
//! ```ignore
//! let storage = MemoryStorage::new();
//! let factory = DefaultFactory::new().with_selector(Arc::new(storage.clone()));
//! let mut orm = Orm::new(schema, factory);
//!
//! let user = orm.create("user", Row::new().with("name", "ann"))?;
//! let tag = orm.create("tag", Row::new().with("name", "rust"))?;
//! orm.entity_mut(user)?.set_relation("tags", RelationValue::many([tag]));
//!
//! orm.store(user)?;
//! orm.flush(&cx, &storage).await;
//! ```

pub mod command;
pub mod entity;
pub mod flush;
pub mod heap;
pub mod mapper;
pub mod memory;
pub mod node;
pub mod relation;
pub mod repository;
pub mod unit_of_work;

pub use command::{
    Command, CommandGraph, CommandId, Forward, Operation, OperationKind, Predicate, Slot, Target,
};
pub use entity::{Collection, Entity, RelationValue};
pub use flush::{FlushReport, FlushResult, Storage, StorageResult, execute_plan};
pub use heap::Heap;
pub use mapper::{DefaultFactory, DefaultMapper, Factory, Mapper};
pub use memory::{MemoryStorage, Statement};
pub use node::{Node, NodeStatus};
pub use relation::{HasMany, HasOne, ManyToMany, Relation, RelationData, RelationMap};
pub use repository::{Repository, Selector};
pub use unit_of_work::{ExecutionPlan, Step, UnitOfWork};

use asupersync::{Cx, Outcome};
use relmodel_core::value::hash_values;
use relmodel_core::{
    ConfigError, EntityRef, Error, Promise, RelationKind, Result, Row, Schema, Value,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

// ============================================================================
// Configuration
// ============================================================================

/// Configuration for `Orm` behavior.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrmConfig {
    /// A to-one link raising the related entity's reference count above
    /// this value does not store the related entity again.
    pub ref_link_threshold: usize,
    /// Whether updates with no changed column are kept away from storage.
    pub skip_noop_updates: bool,
    /// Whether the backend is asked to roll back after a failed write.
    pub rollback_on_error: bool,
}

impl Default for OrmConfig {
    fn default() -> Self {
        Self {
            ref_link_threshold: 2,
            skip_noop_updates: true,
            rollback_on_error: true,
        }
    }
}

impl OrmConfig {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_ref_link_threshold(mut self, threshold: usize) -> Self {
        self.ref_link_threshold = threshold;
        self
    }

    #[must_use]
    pub fn with_skip_noop_updates(mut self, value: bool) -> Self {
        self.skip_noop_updates = value;
        self
    }

    #[must_use]
    pub fn with_rollback_on_error(mut self, value: bool) -> Self {
        self.rollback_on_error = value;
        self
    }

    /// Parse a configuration; missing fields keep their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| {
            Error::Config(ConfigError {
                message: format!("invalid orm configuration: {e}"),
                source: Some(Box::new(e)),
            })
        })
    }
}

// ============================================================================
// Orm
// ============================================================================

/// Explicit context passed to every mapper and relation resolver.
///
/// Owns the heap and the pending unit of work. `store` and `delete` only
/// build commands; nothing reaches storage before `flush`.
pub struct Orm {
    schema: Arc<Schema>,
    factory: Arc<dyn Factory>,
    config: OrmConfig,
    heap: Heap,
    mappers: HashMap<String, Arc<dyn Mapper>>,
    relations: HashMap<String, Arc<RelationMap>>,
    /// To-one promises of tracked owners, keyed by the (role, key hash) of
    /// a target that is not tracked yet.
    awaiting: HashMap<(String, u64), Vec<AwaitingOwner>>,
    pending: UnitOfWork,
}

/// A tracked owner whose to-one relation addresses an untracked target.
#[derive(Debug, Clone)]
struct AwaitingOwner {
    owner: EntityRef,
    relation: String,
    key: Value,
    promise: Arc<Promise<RelationValue>>,
}

impl fmt::Debug for Orm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Orm")
            .field("roles", &self.schema.roles().collect::<Vec<_>>())
            .field("config", &self.config)
            .field("tracked", &self.heap.len())
            .field("pending", &self.pending.graph().len())
            .finish()
    }
}

impl Orm {
    pub fn new(schema: Schema, factory: impl Factory + 'static) -> Self {
        let mut orm = Self {
            schema: Arc::new(schema),
            factory: Arc::new(factory),
            config: OrmConfig::default(),
            heap: Heap::new(),
            mappers: HashMap::new(),
            relations: HashMap::new(),
            awaiting: HashMap::new(),
            pending: UnitOfWork::new(),
        };
        orm.rebuild();
        orm
    }

    #[must_use]
    pub fn with_config(mut self, config: OrmConfig) -> Self {
        self.config = config;
        self
    }

    /// Same heap, different schema.
    #[must_use]
    pub fn with_schema(mut self, schema: Schema) -> Self {
        self.schema = Arc::new(schema);
        self.rebuild();
        self
    }

    #[must_use]
    pub fn with_factory(mut self, factory: impl Factory + 'static) -> Self {
        self.factory = Arc::new(factory);
        self.rebuild();
        self
    }

    /// Same schema and factory, tracking `heap` instead.
    ///
    /// Pending commands refer to the previous heap and are dropped.
    #[must_use]
    pub fn with_heap(mut self, heap: Heap) -> Self {
        self.heap = heap;
        self.pending = UnitOfWork::new();
        self.reindex_awaiting();
        self
    }

    fn rebuild(&mut self) {
        self.mappers.clear();
        self.relations.clear();
        let schema = Arc::clone(&self.schema);
        for role in schema.roles() {
            if let Ok(entity) = schema.entity(role) {
                self.mappers
                    .insert(role.to_string(), self.factory.mapper(entity));
                self.relations
                    .insert(role.to_string(), Arc::new(RelationMap::build(entity)));
            }
        }
        self.reindex_awaiting();
    }

    fn reindex_awaiting(&mut self) {
        self.awaiting.clear();
        let mut found = Vec::new();
        for (owner, node) in self.heap.tracked() {
            let Some(relations) = self.relations.get(node.role()) else {
                continue;
            };
            for relation in relations.iter() {
                if let Some(value) = node.relation(relation.name()) {
                    found.push((owner, Arc::clone(relation), value.clone()));
                }
            }
        }
        for (owner, relation, value) in found {
            self.await_target(owner, relation.as_ref(), &value);
        }
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn config(&self) -> &OrmConfig {
        &self.config
    }

    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    pub fn heap_mut(&mut self) -> &mut Heap {
        &mut self.heap
    }

    pub fn mapper(&self, role: &str) -> Result<Arc<dyn Mapper>> {
        self.mappers
            .get(role)
            .map(Arc::clone)
            .ok_or_else(|| Error::unknown_role(role))
    }

    pub fn relation_map(&self, role: &str) -> Result<Arc<RelationMap>> {
        self.relations
            .get(role)
            .map(Arc::clone)
            .ok_or_else(|| Error::unknown_role(role))
    }

    /// Row source for loading `role`.
    pub fn selector(&self, role: &str) -> Result<Arc<dyn Selector>> {
        self.factory
            .selector(role)
            .ok_or_else(|| Error::Custom(format!("no selector configured for {role}")))
    }

    /// Materialize an entity from a row.
    ///
    /// A `Loaded` row whose key is already tracked returns the tracked
    /// entity unchanged. A `New` entity stays untracked until a flush
    /// persists it.
    pub fn make(&mut self, role: &str, data: Row, status: NodeStatus) -> Result<EntityRef> {
        self.make_with(role, data, status, BTreeMap::new())
    }

    /// Like `make`, with rows of some relations fetched alongside.
    pub fn make_with(
        &mut self,
        role: &str,
        data: Row,
        status: NodeStatus,
        eager: BTreeMap<String, RelationData>,
    ) -> Result<EntityRef> {
        let mapper = self.mapper(role)?;
        match status {
            NodeStatus::New if eager.is_empty() => {
                let mut entity = mapper.init();
                mapper.hydrate(&mut entity, &data);
                return Ok(self.heap.insert(entity));
            }
            NodeStatus::Loaded => {}
            other => {
                return Err(Error::Custom(format!(
                    "cannot materialize {role} as {other:?}"
                )));
            }
        }

        let key = mapper.primary_key(&data).ok_or_else(|| {
            Error::Custom(format!(
                "{role} row has no value for {}",
                mapper.schema().primary_key
            ))
        })?;
        if let Some(existing) = self.heap.get_path(role, &key) {
            return Ok(existing);
        }

        let mut entity = mapper.init();
        mapper.hydrate(&mut entity, &data);
        let token = self.heap.insert(entity);
        if let Err(e) = self.heap.attach(token, Node::loaded(role, key.clone(), data.clone())) {
            self.heap.remove(token);
            return Err(e);
        }

        if let Err(e) = self.init_relations(token, role, &data, eager) {
            self.heap.detach(token);
            self.heap.remove(token);
            return Err(e);
        }
        self.link_awaiting_owners(role, &key, token);
        tracing::trace!(role = role, entity = %token, "Materialized entity");
        Ok(token)
    }

    fn init_relations(
        &mut self,
        token: EntityRef,
        role: &str,
        data: &Row,
        mut eager: BTreeMap<String, RelationData>,
    ) -> Result<()> {
        let relations = self.relation_map(role)?;
        for relation in relations.iter() {
            let value = relation.init(self, data, eager.remove(relation.name()))?;
            self.await_target(token, relation.as_ref(), &value);
            if let Some(node) = self.heap.get_mut(token) {
                node.set_relation(relation.name(), value.clone());
            }
            if let Some(entity) = self.heap.entity_mut(token) {
                entity.set_relation(relation.name(), value);
            }
        }
        Ok(())
    }

    /// Remember a to-one promise addressing its target by primary key.
    fn await_target(&mut self, owner: EntityRef, relation: &dyn Relation, value: &RelationValue) {
        let schema = relation.schema();
        let RelationValue::Unloaded(promise) = value else {
            return;
        };
        let by_key = self
            .schema
            .entity(&schema.target)
            .is_ok_and(|target| target.primary_key == schema.outer_key);
        if schema.kind != RelationKind::HasOne || !by_key || promise.is_resolved() {
            return;
        }
        let Some(key) = promise.scope().value_of(&schema.outer_key) else {
            return;
        };
        self.awaiting
            .entry((schema.target.clone(), key_hash(key)))
            .or_default()
            .push(AwaitingOwner {
                owner,
                relation: schema.name.clone(),
                key: key.clone(),
                promise: Arc::clone(promise),
            });
    }

    /// Resolve the promises of owners that addressed `target` before it was
    /// tracked, counting one reference per owner.
    ///
    /// A promise whose own resolution is loading `target` is skipped; that
    /// load counts its owner.
    fn link_awaiting_owners(&mut self, role: &str, key: &Value, target: EntityRef) {
        let Some(waiting) = self.awaiting.remove(&(role.to_string(), key_hash(key))) else {
            return;
        };
        let mut unmatched = Vec::new();
        for entry in waiting {
            if !entry.key.key_eq(key) {
                unmatched.push(entry);
                continue;
            }
            let current = self.heap.get(entry.owner).is_some_and(|node| {
                matches!(
                    node.relation(&entry.relation),
                    Some(RelationValue::Unloaded(p)) if Arc::ptr_eq(p, &entry.promise)
                )
            });
            if current && entry.promise.fulfill(RelationValue::single(target)) {
                self.add_load_ref(target);
                tracing::trace!(
                    owner = %entry.owner,
                    relation = %entry.relation,
                    target = %target,
                    "Linked waiting owner"
                );
            }
        }
        if !unmatched.is_empty() {
            self.awaiting
                .insert((role.to_string(), key_hash(key)), unmatched);
        }
    }

    /// A new, untracked entity of `role`.
    pub fn create(&mut self, role: &str, data: Row) -> Result<EntityRef> {
        self.make(role, data, NodeStatus::New)
    }

    pub fn entity(&self, entity: EntityRef) -> Result<&Entity> {
        self.heap
            .entity(entity)
            .ok_or_else(|| Error::unknown_entity(entity))
    }

    pub fn entity_mut(&mut self, entity: EntityRef) -> Result<&mut Entity> {
        self.heap
            .entity_mut(entity)
            .ok_or_else(|| Error::unknown_entity(entity))
    }

    /// Node of an entity as the pending flush sees it.
    pub fn node(&self, entity: EntityRef) -> Option<&Node> {
        self.pending
            .staged(entity)
            .or_else(|| self.heap.get(entity))
    }

    /// Current value of a relation, resolving its promise if needed.
    pub fn relation(&mut self, entity: EntityRef, name: &str) -> Result<RelationValue> {
        let current = self.entity(entity)?;
        let role = current.role().to_string();
        let value = current.relation(name).cloned();
        let relations = self.relation_map(&role)?;
        let relation = relations
            .get(name)
            .map(Arc::clone)
            .ok_or_else(|| Error::unknown_relation(&role, name))?;

        let Some(value) = value else {
            return Ok(if relation.is_collection() {
                RelationValue::Many(Collection::new())
            } else {
                RelationValue::none()
            });
        };
        let RelationValue::Unloaded(promise) = &value else {
            return Ok(value);
        };
        if let Some(resolved) = promise.get() {
            return Ok(resolved.clone());
        }

        let promise = Arc::clone(promise);
        let resolved = promise
            .resolve_with(|scope| relation.load(self, scope))?
            .clone();
        tracing::debug!(entity = %entity, relation = name, "Resolved relation");

        if let Some(current) = self.heap.entity_mut(entity) {
            if current.relation(name).is_some_and(|v| v.same_promise(&value)) {
                current.set_relation(name, resolved.clone());
            }
        }
        for node in [self.heap.get_mut(entity), self.pending.staged_mut(entity)]
            .into_iter()
            .flatten()
        {
            if node.relation(name).is_some_and(|v| v.same_promise(&value)) {
                node.set_relation(name, resolved.clone());
            }
        }
        Ok(resolved)
    }

    /// Queue the entity and its relations for storage.
    ///
    /// The returned command is also appended to the pending flush. On error
    /// the pending flush is left as it was before the call.
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn store(&mut self, entity: EntityRef) -> Result<Command> {
        let snapshot = self.pending.clone();
        match self.queue_store(entity) {
            Ok(command) => {
                self.pending.push(command.clone());
                Ok(command)
            }
            Err(e) => {
                tracing::debug!(error = %e, "Store rejected, pending flush restored");
                self.pending = snapshot;
                Err(e)
            }
        }
    }

    /// Queue the entity for deletion. Relations are not cascaded.
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn delete(&mut self, entity: EntityRef) -> Result<Command> {
        let snapshot = self.pending.clone();
        match self.queue_delete(entity) {
            Ok(command) => {
                self.pending.push(command.clone());
                Ok(command)
            }
            Err(e) => {
                self.pending = snapshot;
                Err(e)
            }
        }
    }

    pub fn pending(&self) -> &UnitOfWork {
        &self.pending
    }

    /// Drop everything queued since the last flush.
    pub fn discard(&mut self) {
        self.pending = UnitOfWork::new();
    }

    /// Execute the pending commands and commit the staged nodes.
    ///
    /// The pending flush is consumed either way. On failure or cancellation
    /// tracked nodes and entity data are left exactly as they were.
    #[tracing::instrument(level = "info", skip(self, cx, storage))]
    pub async fn flush<S: Storage>(&mut self, cx: &Cx, storage: &S) -> Outcome<FlushResult, Error> {
        let uow = std::mem::take(&mut self.pending);
        if uow.is_empty() {
            return Outcome::Ok(FlushResult::new());
        }

        let plan = match uow.compile() {
            Ok(plan) => plan,
            Err(e) => {
                tracing::warn!(error = %e, "Flush rejected before execution");
                return Outcome::Err(e);
            }
        };

        let report = match execute_plan(cx, storage, &uow, &plan, &self.heap, &self.config).await
        {
            Outcome::Ok(report) => report,
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        };

        self.commit(&uow, &report);
        Outcome::Ok(report.result)
    }

    pub fn repository(&mut self, role: &str) -> Repository<'_> {
        Repository::new(self, role)
    }

    // ------------------------------------------------------------------------
    // Graph construction, used by relation resolvers
    // ------------------------------------------------------------------------

    /// Count a to-one owner materialized by loading.
    pub(crate) fn add_load_ref(&mut self, entity: EntityRef) {
        if let Some(node) = self.heap.get_mut(entity) {
            node.add_ref();
        }
        if let Some(node) = self.pending.staged_mut(entity) {
            node.add_ref();
        }
    }

    /// Count a collection membership materialized by loading.
    pub(crate) fn add_load_claim(&mut self, entity: EntityRef) {
        if let Some(node) = self.heap.get_mut(entity) {
            node.add_claim();
        }
        if let Some(node) = self.pending.staged_mut(entity) {
            node.add_claim();
        }
    }

    /// Staged copy of an entity's node, created on first use.
    pub(crate) fn stage(&mut self, entity: EntityRef) -> Result<&mut Node> {
        if self.pending.staged(entity).is_none() {
            let node = match self.heap.get(entity) {
                Some(node) => node.clone(),
                None => Node::new(self.entity(entity)?.role()),
            };
            self.pending.stage(entity, node);
        }
        self.pending
            .staged_mut(entity)
            .ok_or_else(|| Error::unknown_entity(entity))
    }

    pub(crate) fn producer(&self, entity: EntityRef) -> Option<CommandId> {
        self.pending.producer(entity)
    }

    pub(crate) fn add_operation(&mut self, operation: Operation) -> CommandId {
        self.pending.graph_mut().add(operation)
    }

    pub(crate) fn operation(&self, id: CommandId) -> Option<&Operation> {
        self.pending.graph().get(id)
    }

    pub(crate) fn operation_mut(&mut self, id: CommandId) -> Option<&mut Operation> {
        self.pending.graph_mut().get_mut(id)
    }

    pub(crate) fn defer(
        &mut self,
        command: Command,
        waits: Vec<String>,
        label: impl Into<String>,
    ) -> Command {
        Command::defer(self.pending.graph_mut(), command, waits, label)
    }

    /// Build the store command of an entity and of its changed relations.
    ///
    /// Each entity is stored at most once per flush; later calls return
    /// `Nil` and reuse the first write as producer.
    pub(crate) fn queue_store(&mut self, entity: EntityRef) -> Result<Command> {
        if !self.pending.mark_stored(entity) {
            return Ok(Command::Nil);
        }
        let current = self.entity(entity)?.clone();
        let mapper = self.mapper(current.role())?;
        let node = self.stage(entity)?;
        let operation = mapper.queue_store(entity, &current, node)?;
        let id = self.pending.graph_mut().add(operation);
        self.pending.set_producer(entity, id);
        tracing::debug!(
            entity = %entity,
            role = current.role(),
            command = %self.pending.graph().label(id),
            "Queued store"
        );

        let relations = self.relation_map(current.role())?;
        let mut leading = Vec::new();
        let mut trailing = Vec::new();
        for relation in relations.iter() {
            let name = relation.name();
            let Some(related) = current.relation(name) else {
                continue;
            };
            let original = self
                .pending
                .staged(entity)
                .and_then(|node| node.relation(name))
                .cloned();
            if original.as_ref().is_some_and(|o| related.same_promise(o)) {
                continue;
            }
            let Some(related) = related.loaded().cloned() else {
                tracing::trace!(relation = name, "Relation holds an unresolved promise");
                continue;
            };
            let original = match original {
                Some(value) => Some(self.resolve(relation, value)?),
                None => None,
            };

            let command = relation.queue(self, id, entity, &related, original.as_ref())?;
            if let Some(node) = self.pending.staged_mut(entity) {
                node.set_relation(name, related);
            }
            if relation.is_leading() {
                leading.push(command);
            } else {
                trailing.push(command);
            }
        }

        Ok(Command::sequence(
            leading
                .into_iter()
                .chain(std::iter::once(Command::Operation(id)))
                .chain(trailing),
        ))
    }

    /// Build the delete command of an entity, at most once per flush.
    pub(crate) fn queue_delete(&mut self, entity: EntityRef) -> Result<Command> {
        if !self.pending.mark_deleted(entity) {
            return Ok(Command::Nil);
        }
        let role = self.entity(entity)?.role().to_string();
        let mapper = self.mapper(&role)?;
        let node = self.stage(entity)?;
        let Some(operation) = mapper.queue_delete(entity, node)? else {
            tracing::trace!(entity = %entity, "Never persisted, nothing to delete");
            return Ok(Command::Nil);
        };

        let key = operation.primary_key().map(ToString::to_string);
        let scoped = key
            .as_deref()
            .is_some_and(|column| operation.scope().get_present(column).is_some());
        let id = self.pending.graph_mut().add(operation);
        self.pending.set_deletion(entity, id);

        if let (false, Some(column)) = (scoped, key) {
            match self.pending.producer(entity) {
                Some(producer) => {
                    self.pending.graph_mut().forward(
                        producer,
                        column.clone(),
                        id,
                        Slot::scope(column),
                    )?;
                }
                None => {
                    if let Some(op) = self.pending.graph_mut().get_mut(id) {
                        op.wait(Slot::scope(column));
                    }
                }
            }
        }
        tracing::debug!(entity = %entity, role = %role, "Queued delete");
        Ok(Command::Operation(id))
    }

    /// Make `column` of `source`'s row fill `slot` of `consumer`.
    ///
    /// A value written by `source`'s pending insert or update is forwarded
    /// at execution time. A value already persisted is copied right away.
    /// Otherwise the consumer waits; with no producer the flush is rejected
    /// when it compiles.
    pub(crate) fn forward(
        &mut self,
        source: EntityRef,
        column: &str,
        consumer: CommandId,
        slot: Slot,
    ) -> Result<()> {
        let producer = self.pending.producer(source);
        if let Some(producer) = producer {
            let written = self.pending.graph().get(producer).is_some_and(|op| {
                op.kind() == OperationKind::Insert || op.changes().contains(column)
            });
            if written {
                tracing::trace!(source = %source, column, slot = %slot, "Forwarding at execution");
                return self
                    .pending
                    .graph_mut()
                    .forward(producer, column, consumer, slot);
            }
        }

        let known = self.known_value(source, column);
        if let (None, Some(producer)) = (&known, producer) {
            return self
                .pending
                .graph_mut()
                .forward(producer, column, consumer, slot);
        }

        let op = self
            .pending
            .graph_mut()
            .get_mut(consumer)
            .ok_or_else(|| Error::Custom(format!("command {consumer} is not part of this flush")))?;
        match known {
            Some(value) => {
                tracing::trace!(source = %source, column, slot = %slot, "Value already known");
                op.accept(&slot, value);
            }
            None => op.wait(slot),
        }
        Ok(())
    }

    fn known_value(&self, entity: EntityRef, column: &str) -> Option<Value> {
        self.node(entity)
            .and_then(|node| node.data().get_present(column))
            .or_else(|| {
                self.heap
                    .entity(entity)
                    .and_then(|e| e.data().get_present(column))
            })
            .cloned()
    }

    fn resolve(&mut self, relation: &Arc<dyn Relation>, value: RelationValue) -> Result<RelationValue> {
        match value {
            RelationValue::Unloaded(promise) => Ok(promise
                .resolve_with(|scope| relation.load(self, scope))?
                .clone()),
            other => Ok(other),
        }
    }

    /// Apply a successful flush to the heap.
    ///
    /// Storage has already committed, so a node the heap refuses is logged
    /// and left untracked rather than failing the flush.
    fn commit(&mut self, uow: &UnitOfWork, report: &FlushReport) {
        for (entity, staged) in uow.staged_nodes() {
            if let Some(delete) = uow.deletion(entity) {
                if report.executed.contains_key(&delete) {
                    self.heap.detach(entity);
                    tracing::trace!(entity = %entity, "Detached deleted entity");
                    continue;
                }
            }

            let mut node = staged.clone();
            let written = uow
                .producer(entity)
                .and_then(|id| report.executed.get(&id).map(|row| (id, row)));
            match written {
                Some((id, row)) => {
                    let key_column = uow.graph().get(id).and_then(Operation::primary_key);
                    if let Some(key) = key_column.and_then(|column| row.get_present(column)) {
                        node.set_primary_key(key.clone());
                    }
                    node.data_mut().merge(row);
                    node.set_status(NodeStatus::Loaded);
                    // Extracted columns stay as the entity holds them now;
                    // edits made after `store` remain pending changes.
                    let written = written_back(uow.graph().get(id), row);
                    if let Some(current) = self.heap.entity_mut(entity) {
                        current.data_mut().merge(&written);
                    }
                }
                None => node.set_status(settled(node.status())),
            }

            if node.status() == NodeStatus::New && self.heap.get(entity).is_none() {
                continue;
            }
            if let Err(e) = self.heap.replace(entity, node) {
                tracing::error!(entity = %entity, error = %e, "Flushed entity left untracked");
            }
        }
    }
}

/// Columns of an executed row the entity did not supply itself: the key and
/// values linked in from related entities.
fn written_back(operation: Option<&Operation>, row: &Row) -> Row {
    let mut written = Row::new();
    let Some(operation) = operation else {
        return written;
    };
    for (column, value) in row.iter() {
        if operation.primary_key() == Some(column) || operation.linked().contains(column) {
            written.set(column, value.clone());
        }
    }
    written
}

fn key_hash(key: &Value) -> u64 {
    hash_values(std::slice::from_ref(key))
}

/// Status of a node whose scheduled write did not run.
fn settled(status: NodeStatus) -> NodeStatus {
    match status {
        NodeStatus::ScheduledForInsert => NodeStatus::New,
        NodeStatus::ScheduledForUpdate | NodeStatus::ScheduledForDelete => NodeStatus::Loaded,
        other => other,
    }
}
