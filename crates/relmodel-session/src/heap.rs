//! Identity map of tracked entities.
//!
//! The heap is the single owner of every entity instance and every tracking
//! node. It guarantees that a given (role, primary key) pair maps to exactly
//! one entity within an `Orm`:
//!
//! - **Uniqueness**: loading the same row twice yields the same `EntityRef`
//! - **Ownership**: entities and nodes live in one arena keyed by token, so
//!   relations between entities never form reference cycles
//! - **Isolation**: NEW entities are held but not indexed by key until a
//!   flush assigns one
//!
//! # Example
//!
//! ```ignore
//! let mut heap = Heap::new();
//! let user = heap.insert(Entity::new("user"));
//! heap.attach(user, Node::loaded("user", Value::BigInt(1), data))?;
//!
//! assert_eq!(heap.get_path("user", &Value::BigInt(1)), Some(user));
//! ```

use crate::entity::Entity;
use crate::node::Node;
use relmodel_core::value::hash_values;
use relmodel_core::{EntityRef, Error, IdentityError, IdentityErrorKind, Result, Value};
use std::collections::HashMap;

fn path_hash(key: &Value) -> u64 {
    hash_values(std::slice::from_ref(key))
}

/// Identity map holding entities, their nodes and the (role, key) index.
#[derive(Debug, Default)]
pub struct Heap {
    next_id: u64,
    entities: HashMap<EntityRef, Entity>,
    nodes: HashMap<EntityRef, Node>,
    /// Map from (role, pk_hash) to the entity holding that key.
    paths: HashMap<(String, u64), EntityRef>,
}

impl Heap {
    /// Create a new empty heap.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Take ownership of an entity and issue its identity token.
    ///
    /// The entity is not tracked (it has no node) until `attach` is called.
    pub fn insert(&mut self, entity: Entity) -> EntityRef {
        self.next_id += 1;
        let token = EntityRef::from_raw(self.next_id);
        self.entities.insert(token, entity);
        token
    }

    pub fn contains(&self, entity: EntityRef) -> bool {
        self.entities.contains_key(&entity)
    }

    pub fn entity(&self, entity: EntityRef) -> Option<&Entity> {
        self.entities.get(&entity)
    }

    pub fn entity_mut(&mut self, entity: EntityRef) -> Option<&mut Entity> {
        self.entities.get_mut(&entity)
    }

    /// Node of a tracked entity.
    pub fn get(&self, entity: EntityRef) -> Option<&Node> {
        self.nodes.get(&entity)
    }

    pub fn get_mut(&mut self, entity: EntityRef) -> Option<&mut Node> {
        self.nodes.get_mut(&entity)
    }

    /// Start tracking an entity.
    ///
    /// Fails if the entity already has a node, or if another entity is
    /// already tracked under the node's primary key.
    pub fn attach(&mut self, entity: EntityRef, node: Node) -> Result<()> {
        if !self.entities.contains_key(&entity) {
            return Err(Error::unknown_entity(entity));
        }
        if self.nodes.contains_key(&entity) {
            return Err(Error::Identity(IdentityError {
                kind: IdentityErrorKind::AlreadyAttached,
                role: Some(node.role().to_string()),
                entity: Some(entity),
                message: format!("entity {entity} is already attached"),
            }));
        }
        self.check_path(entity, &node)?;
        self.index(entity, &node);
        self.nodes.insert(entity, node);
        Ok(())
    }

    /// Attach or overwrite the node of an entity, re-indexing its key.
    pub fn replace(&mut self, entity: EntityRef, node: Node) -> Result<()> {
        if !self.entities.contains_key(&entity) {
            return Err(Error::unknown_entity(entity));
        }
        self.check_path(entity, &node)?;
        if let Some(previous) = self.nodes.remove(&entity) {
            self.unindex(entity, &previous);
        }
        self.index(entity, &node);
        self.nodes.insert(entity, node);
        Ok(())
    }

    /// Stop tracking an entity; the entity itself stays readable.
    pub fn detach(&mut self, entity: EntityRef) -> Option<Node> {
        let node = self.nodes.remove(&entity)?;
        self.unindex(entity, &node);
        Some(node)
    }

    /// Drop an entity and its node entirely.
    pub fn remove(&mut self, entity: EntityRef) -> Option<Entity> {
        self.detach(entity);
        self.entities.remove(&entity)
    }

    /// Is an entity of `role` tracked under `key`?
    pub fn has_path(&self, role: &str, key: &Value) -> bool {
        self.get_path(role, key).is_some()
    }

    /// Entity of `role` tracked under `key`.
    pub fn get_path(&self, role: &str, key: &Value) -> Option<EntityRef> {
        self.paths
            .get(&(role.to_string(), path_hash(key)))
            .copied()
    }

    /// Number of tracked entities (those with a node).
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Number of entities held, tracked or not.
    pub fn entity_count(&self) -> usize {
        self.entities.len()
    }

    pub fn tracked(&self) -> impl Iterator<Item = (EntityRef, &Node)> {
        self.nodes.iter().map(|(e, n)| (*e, n))
    }

    /// Drop every entity and node. Issued tokens are never reused.
    pub fn clear(&mut self) {
        self.entities.clear();
        self.nodes.clear();
        self.paths.clear();
    }

    fn check_path(&self, entity: EntityRef, node: &Node) -> Result<()> {
        let Some(key) = node.primary_key() else {
            return Ok(());
        };
        match self.get_path(node.role(), key) {
            Some(existing) if existing != entity => Err(Error::Identity(IdentityError {
                kind: IdentityErrorKind::DuplicateKey,
                role: Some(node.role().to_string()),
                entity: Some(entity),
                message: format!(
                    "{}({}) is already tracked as {}",
                    node.role(),
                    key,
                    existing
                ),
            })),
            _ => Ok(()),
        }
    }

    fn index(&mut self, entity: EntityRef, node: &Node) {
        if let Some(key) = node.primary_key() {
            self.paths
                .insert((node.role().to_string(), path_hash(key)), entity);
        }
    }

    fn unindex(&mut self, entity: EntityRef, node: &Node) {
        if let Some(key) = node.primary_key() {
            let path = (node.role().to_string(), path_hash(key));
            if self.paths.get(&path) == Some(&entity) {
                self.paths.remove(&path);
            }
        }
    }
}
