use super::{Relation, RelationData};
use crate::Orm;
use crate::command::{Command, CommandId, Predicate, Slot};
use crate::entity::{Collection, RelationValue};
use crate::node::NodeStatus;
use relmodel_core::{Criteria, EntityRef, Error, Promise, RelationSchema, Result, Row};
use std::sync::Arc;

/// Unshared to-many relation with the foreign key on the child rows.
///
/// Children are claimed by the collection holding them. A child removed
/// from its collection is deleted once no collection claims it, so a child
/// moved to another parent in the same flush survives.
#[derive(Debug, Clone)]
pub struct HasMany {
    schema: RelationSchema,
}

impl HasMany {
    pub fn new(schema: RelationSchema) -> Self {
        Self { schema }
    }

    fn materialize(&self, orm: &mut Orm, rows: Vec<Row>) -> Result<RelationValue> {
        let mut collection = Collection::new();
        for row in rows {
            let entity = orm.make(&self.schema.target, row, NodeStatus::Loaded)?;
            if collection.push(entity) {
                orm.add_load_claim(entity);
            }
        }
        Ok(RelationValue::Many(collection))
    }
}

impl Relation for HasMany {
    fn schema(&self) -> &RelationSchema {
        &self.schema
    }

    fn init(
        &self,
        orm: &mut Orm,
        data: &Row,
        eager: Option<RelationData>,
    ) -> Result<RelationValue> {
        match eager {
            Some(RelationData::Many(rows)) => return self.materialize(orm, rows),
            Some(_) => {
                return Err(Error::Custom(format!(
                    "relation {} expects a list of rows",
                    self.schema.name
                )));
            }
            None => {}
        }

        match data.get_present(&self.schema.inner_key) {
            Some(key) => Ok(RelationValue::Unloaded(Arc::new(Promise::new(
                Criteria::eq(self.schema.outer_key.clone(), key.clone()),
            )))),
            None => Ok(RelationValue::Many(Collection::new())),
        }
    }

    fn load(&self, orm: &mut Orm, scope: &Criteria) -> Result<RelationValue> {
        let table = orm.schema().entity(&self.schema.target)?.table.clone();
        let rows = orm.selector(&self.schema.target)?.fetch(&table, scope)?;
        self.materialize(orm, rows)
    }

    fn queue(
        &self,
        orm: &mut Orm,
        _store: CommandId,
        parent: EntityRef,
        related: &RelationValue,
        original: Option<&RelationValue>,
    ) -> Result<Command> {
        let Some(related) = related.as_many() else {
            return Ok(Command::Nil);
        };
        let original = original
            .and_then(RelationValue::as_many)
            .cloned()
            .unwrap_or_default();

        let mut sequence = Vec::new();
        for item in related.entities() {
            sequence.push(orm.queue_store(item)?);
            if !original.contains(item) {
                orm.stage(item)?.add_claim();
            }
            if let Some(child) = orm.producer(item) {
                orm.forward(
                    parent,
                    &self.schema.inner_key,
                    child,
                    Slot::context(self.schema.outer_key.clone()),
                )?;
            }
        }

        let removed = original.difference(related);
        if !removed.is_empty() {
            tracing::debug!(
                relation = %self.schema.name,
                parent = %parent,
                removed = removed.len(),
                "Collection lost elements"
            );
        }
        for item in removed {
            orm.stage(item)?.dec_claim();
            let delete = orm.queue_delete(item)?;
            sequence.push(Command::condition(Predicate::NoClaims(item), delete));
        }

        Ok(Command::sequence(sequence))
    }
}
