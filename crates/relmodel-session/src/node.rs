//! Per-entity tracking records.

use crate::entity::RelationValue;
use relmodel_core::{Row, Value};
use std::collections::BTreeMap;

/// Lifecycle status of a tracked entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeStatus {
    /// Registered for storage but never persisted.
    New,
    /// Persisted and in sync with the last successful flush or load.
    Loaded,
    /// An insert is pending in the current flush.
    ScheduledForInsert,
    /// An update is pending in the current flush.
    ScheduledForUpdate,
    /// A (possibly conditional) delete is pending in the current flush.
    ScheduledForDelete,
}

impl NodeStatus {
    pub const fn is_scheduled(self) -> bool {
        matches!(
            self,
            NodeStatus::ScheduledForInsert
                | NodeStatus::ScheduledForUpdate
                | NodeStatus::ScheduledForDelete
        )
    }

    /// Does a row for this entity exist in storage?
    pub const fn is_persisted(self) -> bool {
        matches!(
            self,
            NodeStatus::Loaded | NodeStatus::ScheduledForUpdate | NodeStatus::ScheduledForDelete
        )
    }
}

/// Tracking record of one entity.
///
/// Holds the persisted column snapshot, the relation values as they were
/// last loaded or flushed, and two ownership counters:
///
/// - `ref_count`: to-one owners pointing at the entity
/// - `claim_count`: to-many collections holding the entity
///
/// Counters grow when a relation is materialized and change while a flush
/// graph is built, on a staged copy. A decrement never goes below zero.
#[derive(Debug, Clone)]
pub struct Node {
    role: String,
    status: NodeStatus,
    primary_key: Option<Value>,
    data: Row,
    relations: BTreeMap<String, RelationValue>,
    ref_count: usize,
    claim_count: usize,
}

impl Node {
    /// Node for an entity that has never been persisted.
    pub fn new(role: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            status: NodeStatus::New,
            primary_key: None,
            data: Row::new(),
            relations: BTreeMap::new(),
            ref_count: 0,
            claim_count: 0,
        }
    }

    /// Node for an entity loaded from storage.
    pub fn loaded(role: impl Into<String>, primary_key: Value, data: Row) -> Self {
        Self {
            role: role.into(),
            status: NodeStatus::Loaded,
            primary_key: Some(primary_key),
            data,
            relations: BTreeMap::new(),
            ref_count: 0,
            claim_count: 0,
        }
    }

    pub fn role(&self) -> &str {
        &self.role
    }

    pub fn status(&self) -> NodeStatus {
        self.status
    }

    pub fn set_status(&mut self, status: NodeStatus) {
        self.status = status;
    }

    pub fn primary_key(&self) -> Option<&Value> {
        self.primary_key.as_ref()
    }

    pub fn set_primary_key(&mut self, key: Value) {
        self.primary_key = Some(key);
    }

    /// Persisted column snapshot.
    pub fn data(&self) -> &Row {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut Row {
        &mut self.data
    }

    /// Relation value as last loaded or flushed.
    pub fn relation(&self, name: &str) -> Option<&RelationValue> {
        self.relations.get(name)
    }

    pub fn set_relation(&mut self, name: impl Into<String>, value: RelationValue) {
        self.relations.insert(name.into(), value);
    }

    pub fn ref_count(&self) -> usize {
        self.ref_count
    }

    /// Increment the to-one owner count and return the new value.
    pub fn add_ref(&mut self) -> usize {
        self.ref_count += 1;
        self.ref_count
    }

    /// Decrement the to-one owner count (saturating) and return the new value.
    pub fn del_ref(&mut self) -> usize {
        self.ref_count = self.ref_count.saturating_sub(1);
        self.ref_count
    }

    pub fn claim_count(&self) -> usize {
        self.claim_count
    }

    pub fn add_claim(&mut self) -> usize {
        self.claim_count += 1;
        self.claim_count
    }

    pub fn dec_claim(&mut self) -> usize {
        self.claim_count = self.claim_count.saturating_sub(1);
        self.claim_count
    }

    pub fn has_claims(&self) -> bool {
        self.claim_count > 0
    }
}
