//! Relation resolvers.
//!
//! A resolver knows one relation of one role. It creates the initial value
//! of the relation for a freshly materialized entity, loads the value of an
//! unresolved promise, and turns the difference between the relation's
//! original and new value into commands.
//!
//! Resolvers never execute commands. They only add operations to the flush
//! graph, wire forwarding between them and adjust ref/claim counters on the
//! staged nodes.

mod has_many;
mod has_one;
mod many_to_many;

pub use has_many::HasMany;
pub use has_one::HasOne;
pub use many_to_many::ManyToMany;

use crate::Orm;
use crate::command::{Command, CommandId};
use crate::entity::RelationValue;
use relmodel_core::{Criteria, EntityRef, EntitySchema, RelationKind, RelationSchema, Result, Row};
use std::fmt;
use std::sync::Arc;

/// Rows fetched together with the parent, used instead of a promise.
#[derive(Debug, Clone, PartialEq)]
pub enum RelationData {
    /// Row of the related entity for a to-one relation.
    One(Option<Row>),
    /// Rows of the related entities.
    Many(Vec<Row>),
    /// `(pivot_row, row)` pairs for a join-table relation.
    Pivoted(Vec<(Row, Row)>),
}

/// Resolver for one relation of a role.
pub trait Relation: Send + Sync + fmt::Debug {
    fn schema(&self) -> &RelationSchema;

    fn name(&self) -> &str {
        &self.schema().name
    }

    fn target(&self) -> &str {
        &self.schema().target
    }

    /// Must the related entity be written before the parent?
    fn is_leading(&self) -> bool {
        false
    }

    fn is_collection(&self) -> bool {
        self.schema().kind.is_collection()
    }

    /// Initial value for an entity materialized from `data`.
    fn init(
        &self,
        orm: &mut Orm,
        data: &Row,
        eager: Option<RelationData>,
    ) -> Result<RelationValue>;

    /// Load the value described by a promise scope.
    fn load(&self, orm: &mut Orm, scope: &Criteria) -> Result<RelationValue>;

    /// Commands reconciling `original` with `related`.
    ///
    /// `store` is the parent's own pending write; `original` is `None` for
    /// an entity that was never persisted.
    fn queue(
        &self,
        orm: &mut Orm,
        store: CommandId,
        parent: EntityRef,
        related: &RelationValue,
        original: Option<&RelationValue>,
    ) -> Result<Command>;
}

/// Resolvers of every relation of one role, in schema order.
#[derive(Debug, Clone, Default)]
pub struct RelationMap {
    relations: Vec<Arc<dyn Relation>>,
}

impl RelationMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolvers for every relation declared by `schema`.
    pub fn build(schema: &EntitySchema) -> Self {
        let relations = schema
            .relations
            .iter()
            .map(|relation| -> Arc<dyn Relation> {
                match relation.kind {
                    RelationKind::HasOne => Arc::new(HasOne::new(relation.clone())),
                    RelationKind::HasMany => Arc::new(HasMany::new(relation.clone())),
                    RelationKind::ManyToMany => Arc::new(ManyToMany::new(
                        relation.clone(),
                        schema.database.clone(),
                    )),
                }
            })
            .collect();
        Self { relations }
    }

    #[must_use]
    pub fn with(mut self, relation: Arc<dyn Relation>) -> Self {
        self.relations.retain(|r| r.name() != relation.name());
        self.relations.push(relation);
        self
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Relation>> {
        self.relations.iter().find(|r| r.name() == name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn Relation>> {
        self.relations.iter()
    }

    pub fn len(&self) -> usize {
        self.relations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.relations.is_empty()
    }
}
