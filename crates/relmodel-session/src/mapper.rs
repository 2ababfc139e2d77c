//! Entity mappers and the factory that builds them.
//!
//! A mapper owns the translation between an `Entity` and storage for one
//! role: creating blank instances, hydrating them from rows, extracting the
//! persisted columns and turning a tracked entity into the leaf operation
//! that stores or deletes it.

use crate::command::Operation;
use crate::entity::Entity;
use crate::node::{Node, NodeStatus};
use crate::repository::Selector;
use relmodel_core::{EntityRef, EntitySchema, Error, Result, Row, Value};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Per-role translation between entities and storage operations.
pub trait Mapper: Send + Sync + fmt::Debug {
    fn schema(&self) -> &EntitySchema;

    fn role(&self) -> &str {
        &self.schema().role
    }

    /// Blank instance of the role.
    fn init(&self) -> Entity {
        Entity::new(self.role())
    }

    /// Copy row values into an entity.
    fn hydrate(&self, entity: &mut Entity, data: &Row) {
        entity.data_mut().merge(data);
    }

    /// Persisted columns of an entity.
    fn extract(&self, entity: &Entity) -> Row;

    /// Primary key value carried by `data`, if set.
    fn primary_key(&self, data: &Row) -> Option<Value> {
        data.get_present(&self.schema().primary_key).cloned()
    }

    /// Build the write storing `entity` and advance the node's status.
    fn queue_store(&self, entity: EntityRef, current: &Entity, node: &mut Node)
    -> Result<Operation>;

    /// Build the delete for `entity`; `None` if it was never persisted.
    fn queue_delete(&self, entity: EntityRef, node: &mut Node) -> Result<Option<Operation>>;
}

/// Schema-driven mapper used for every role unless a factory says otherwise.
#[derive(Debug, Clone)]
pub struct DefaultMapper {
    schema: Arc<EntitySchema>,
}

impl DefaultMapper {
    pub fn new(schema: EntitySchema) -> Self {
        Self {
            schema: Arc::new(schema),
        }
    }

    fn key_scope(&self, entity: EntityRef, node: &Node) -> Result<Row> {
        let key = node.primary_key().cloned().ok_or_else(|| {
            Error::Custom(format!(
                "{}{} has no primary key to address its row",
                self.schema.role, entity
            ))
        })?;
        Ok(Row::new().with(self.schema.primary_key.clone(), key))
    }
}

impl Mapper for DefaultMapper {
    fn schema(&self) -> &EntitySchema {
        &self.schema
    }

    fn extract(&self, entity: &Entity) -> Row {
        if self.schema.columns.is_empty() {
            entity.data().clone()
        } else {
            entity.data().project(&self.schema.columns)
        }
    }

    fn queue_store(
        &self,
        entity: EntityRef,
        current: &Entity,
        node: &mut Node,
    ) -> Result<Operation> {
        let mut data = self.extract(current);
        let pk = &self.schema.primary_key;

        match node.status() {
            NodeStatus::New | NodeStatus::ScheduledForInsert => {
                if data.get_present(pk).is_none() {
                    data.remove(pk);
                }
                node.set_status(NodeStatus::ScheduledForInsert);
                Ok(Operation::insert(self.schema.table.clone())
                    .with_database(self.schema.database.clone())
                    .with_entity(entity)
                    .with_primary_key(pk.clone())
                    .with_context(data))
            }
            // A pending delete may still be skipped by its guard; the row is
            // written as it stands.
            NodeStatus::Loaded | NodeStatus::ScheduledForUpdate | NodeStatus::ScheduledForDelete => {
                let scope = self.key_scope(entity, node)?;
                data.remove(pk);
                node.set_status(NodeStatus::ScheduledForUpdate);
                Ok(Operation::update(self.schema.table.clone())
                    .with_database(self.schema.database.clone())
                    .with_entity(entity)
                    .with_primary_key(pk.clone())
                    .with_scope(scope)
                    .with_baseline(node.data().clone())
                    .with_context(data))
            }
        }
    }

    fn queue_delete(&self, entity: EntityRef, node: &mut Node) -> Result<Option<Operation>> {
        let scope = match node.status() {
            NodeStatus::New => return Ok(None),
            // Key arrives from the pending insert.
            NodeStatus::ScheduledForInsert => Row::new(),
            _ => self.key_scope(entity, node)?,
        };
        node.set_status(NodeStatus::ScheduledForDelete);
        Ok(Some(
            Operation::delete(self.schema.table.clone())
                .with_database(self.schema.database.clone())
                .with_entity(entity)
                .with_primary_key(self.schema.primary_key.clone())
                .with_scope(scope),
        ))
    }
}

/// Builds mappers and selectors for roles.
pub trait Factory: Send + Sync {
    fn mapper(&self, schema: &EntitySchema) -> Arc<dyn Mapper>;

    /// Source of rows for loading `role`; `None` disables lazy loading.
    fn selector(&self, role: &str) -> Option<Arc<dyn Selector>>;
}

/// Factory producing `DefaultMapper`s and configured selectors.
#[derive(Default, Clone)]
pub struct DefaultFactory {
    selector: Option<Arc<dyn Selector>>,
    by_role: HashMap<String, Arc<dyn Selector>>,
}

impl DefaultFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Selector used for every role without an override.
    #[must_use]
    pub fn with_selector(mut self, selector: Arc<dyn Selector>) -> Self {
        self.selector = Some(selector);
        self
    }

    #[must_use]
    pub fn with_role_selector(
        mut self,
        role: impl Into<String>,
        selector: Arc<dyn Selector>,
    ) -> Self {
        self.by_role.insert(role.into(), selector);
        self
    }
}

impl fmt::Debug for DefaultFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DefaultFactory")
            .field("selector", &self.selector.is_some())
            .field("roles", &self.by_role.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Factory for DefaultFactory {
    fn mapper(&self, schema: &EntitySchema) -> Arc<dyn Mapper> {
        Arc::new(DefaultMapper::new(schema.clone()))
    }

    fn selector(&self, role: &str) -> Option<Arc<dyn Selector>> {
        self.by_role
            .get(role)
            .or(self.selector.as_ref())
            .map(Arc::clone)
    }
}
