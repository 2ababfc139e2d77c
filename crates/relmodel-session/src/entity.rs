//! Live entities and their relation values.
//!
//! An `Entity` is the application-facing record of one row: its role, the
//! current column values and the current value of every relation. Entities
//! never own each other; relations point at other entities through
//! `EntityRef` tokens issued by the heap.

use relmodel_core::{EntityRef, Promise, Row, Value};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Value of a relation on an entity or in a node snapshot.
#[derive(Debug, Clone)]
pub enum RelationValue {
    /// Not loaded yet; resolving the promise yields `Single` or `Many`.
    Unloaded(Arc<Promise<RelationValue>>),
    /// To-one value, `None` when the relation is empty.
    Single(Option<EntityRef>),
    /// To-many value with optional pivot data per element.
    Many(Collection),
}

impl RelationValue {
    /// An empty to-one value.
    pub const fn none() -> Self {
        RelationValue::Single(None)
    }

    pub fn single(entity: EntityRef) -> Self {
        RelationValue::Single(Some(entity))
    }

    pub fn many<I: IntoIterator<Item = EntityRef>>(entities: I) -> Self {
        RelationValue::Many(entities.into_iter().collect())
    }

    pub fn is_unloaded(&self) -> bool {
        matches!(self, RelationValue::Unloaded(_))
    }

    /// The value itself, or the cached value of an already resolved promise.
    pub fn loaded(&self) -> Option<&RelationValue> {
        match self {
            RelationValue::Unloaded(promise) => promise.get(),
            other => Some(other),
        }
    }

    /// Do both values share the same unresolved promise token?
    pub fn same_promise(&self, other: &RelationValue) -> bool {
        match (self, other) {
            (RelationValue::Unloaded(a), RelationValue::Unloaded(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }

    pub fn as_single(&self) -> Option<Option<EntityRef>> {
        match self.loaded()? {
            RelationValue::Single(entity) => Some(*entity),
            _ => None,
        }
    }

    pub fn as_many(&self) -> Option<&Collection> {
        match self.loaded()? {
            RelationValue::Many(collection) => Some(collection),
            _ => None,
        }
    }

    pub fn as_many_mut(&mut self) -> Option<&mut Collection> {
        match self {
            RelationValue::Many(collection) => Some(collection),
            _ => None,
        }
    }
}

/// Ordered set of related entities with optional pivot data per element.
///
/// Membership is decided by entity identity only; two distinct entities
/// with equal data are two elements.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Collection {
    items: Vec<(EntityRef, Option<Row>)>,
}

impl Collection {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn contains(&self, entity: EntityRef) -> bool {
        self.items.iter().any(|(e, _)| *e == entity)
    }

    /// Add an element without pivot data. Returns false if already present.
    pub fn push(&mut self, entity: EntityRef) -> bool {
        if self.contains(entity) {
            return false;
        }
        self.items.push((entity, None));
        true
    }

    /// Add an element with pivot data, replacing the pivot data of an
    /// element that is already present.
    pub fn push_with(&mut self, entity: EntityRef, pivot: Row) {
        match self.items.iter_mut().find(|(e, _)| *e == entity) {
            Some((_, slot)) => *slot = Some(pivot),
            None => self.items.push((entity, Some(pivot))),
        }
    }

    pub fn remove(&mut self, entity: EntityRef) -> bool {
        let before = self.items.len();
        self.items.retain(|(e, _)| *e != entity);
        self.items.len() != before
    }

    /// Pivot data of an element; `None` if absent or without pivot data.
    pub fn pivot(&self, entity: EntityRef) -> Option<&Row> {
        self.items
            .iter()
            .find(|(e, _)| *e == entity)
            .and_then(|(_, pivot)| pivot.as_ref())
    }

    /// Set one pivot column of an existing element.
    pub fn set_pivot(
        &mut self,
        entity: EntityRef,
        column: impl Into<String>,
        value: impl Into<Value>,
    ) -> bool {
        match self.items.iter_mut().find(|(e, _)| *e == entity) {
            Some((_, pivot)) => {
                pivot.get_or_insert_with(Row::new).set(column, value);
                true
            }
            None => false,
        }
    }

    pub fn entities(&self) -> impl Iterator<Item = EntityRef> + '_ {
        self.items.iter().map(|(e, _)| *e)
    }

    pub fn iter(&self) -> impl Iterator<Item = (EntityRef, Option<&Row>)> {
        self.items.iter().map(|(e, pivot)| (*e, pivot.as_ref()))
    }

    /// Elements of `self` that are absent from `other`, in order.
    pub fn difference(&self, other: &Collection) -> Vec<EntityRef> {
        self.entities().filter(|e| !other.contains(*e)).collect()
    }
}

impl FromIterator<EntityRef> for Collection {
    fn from_iter<I: IntoIterator<Item = EntityRef>>(iter: I) -> Self {
        let mut collection = Collection::new();
        for entity in iter {
            collection.push(entity);
        }
        collection
    }
}

/// Application-facing record of one entity instance.
#[derive(Debug, Clone)]
pub struct Entity {
    role: String,
    data: Row,
    relations: BTreeMap<String, RelationValue>,
}

impl Entity {
    pub fn new(role: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            data: Row::new(),
            relations: BTreeMap::new(),
        }
    }

    pub fn role(&self) -> &str {
        &self.role
    }

    pub fn data(&self) -> &Row {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut Row {
        &mut self.data
    }

    pub fn get(&self, column: &str) -> Option<&Value> {
        self.data.get(column)
    }

    pub fn set(&mut self, column: impl Into<String>, value: impl Into<Value>) {
        self.data.set(column, value);
    }

    pub fn relation(&self, name: &str) -> Option<&RelationValue> {
        self.relations.get(name)
    }

    pub fn relation_mut(&mut self, name: &str) -> Option<&mut RelationValue> {
        self.relations.get_mut(name)
    }

    /// Replace the whole value of a relation.
    pub fn set_relation(&mut self, name: impl Into<String>, value: RelationValue) {
        self.relations.insert(name.into(), value);
    }

    /// Point a to-one relation at `entity`, or clear it with `None`.
    pub fn set_one(&mut self, name: impl Into<String>, entity: Option<EntityRef>) {
        self.relations
            .insert(name.into(), RelationValue::Single(entity));
    }

    pub fn relations(&self) -> impl Iterator<Item = (&str, &RelationValue)> {
        self.relations.iter().map(|(k, v)| (k.as_str(), v))
    }
}
