use super::{Relation, RelationData};
use crate::Orm;
use crate::command::{Command, CommandId, Predicate, Slot};
use crate::entity::RelationValue;
use crate::node::NodeStatus;
use relmodel_core::{Criteria, EntityRef, Error, Promise, RelationSchema, Result, Row, Value};
use std::sync::Arc;

/// To-one relation with the foreign key on the parent row.
///
/// The related entity is written before the parent so its key can be
/// forwarded into the parent's `inner_key` column. Every parent pointing
/// at an entity holds one reference on it; an entity losing its last
/// reference is deleted.
#[derive(Debug, Clone)]
pub struct HasOne {
    schema: RelationSchema,
}

impl HasOne {
    pub fn new(schema: RelationSchema) -> Self {
        Self { schema }
    }

    /// Tracked target addressed by `key`, when `outer_key` is its primary key.
    fn tracked(&self, orm: &Orm, key: &Value) -> Result<Option<EntityRef>> {
        let target = orm.schema().entity(&self.schema.target)?;
        if target.primary_key != self.schema.outer_key {
            return Ok(None);
        }
        Ok(orm.heap().get_path(&self.schema.target, key))
    }

    fn materialize(&self, orm: &mut Orm, row: Row) -> Result<RelationValue> {
        let entity = orm.make(&self.schema.target, row, NodeStatus::Loaded)?;
        orm.add_load_ref(entity);
        Ok(RelationValue::single(entity))
    }
}

impl Relation for HasOne {
    fn schema(&self) -> &RelationSchema {
        &self.schema
    }

    fn is_leading(&self) -> bool {
        true
    }

    fn init(
        &self,
        orm: &mut Orm,
        data: &Row,
        eager: Option<RelationData>,
    ) -> Result<RelationValue> {
        match eager {
            Some(RelationData::One(Some(row))) => return self.materialize(orm, row),
            Some(RelationData::One(None)) => return Ok(RelationValue::none()),
            Some(_) => {
                return Err(Error::Custom(format!(
                    "relation {} expects a single row",
                    self.schema.name
                )));
            }
            None => {}
        }

        let Some(key) = data.get_present(&self.schema.inner_key).cloned() else {
            return Ok(RelationValue::none());
        };
        if let Some(entity) = self.tracked(orm, &key)? {
            orm.add_load_ref(entity);
            return Ok(RelationValue::single(entity));
        }
        Ok(RelationValue::Unloaded(Arc::new(Promise::new(
            Criteria::eq(self.schema.outer_key.clone(), key),
        ))))
    }

    fn load(&self, orm: &mut Orm, scope: &Criteria) -> Result<RelationValue> {
        if let Some(key) = scope.value_of(&self.schema.outer_key) {
            if let Some(entity) = self.tracked(orm, key)? {
                orm.add_load_ref(entity);
                return Ok(RelationValue::single(entity));
            }
        }

        let table = orm.schema().entity(&self.schema.target)?.table.clone();
        let selector = orm.selector(&self.schema.target)?;
        let row = selector
            .fetch(&table, &scope.clone().limit(1))?
            .into_iter()
            .next();
        match row {
            Some(row) => self.materialize(orm, row),
            None => Ok(RelationValue::none()),
        }
    }

    fn queue(
        &self,
        orm: &mut Orm,
        store: CommandId,
        parent: EntityRef,
        related: &RelationValue,
        original: Option<&RelationValue>,
    ) -> Result<Command> {
        let Some(related) = related.as_single() else {
            return Ok(Command::Nil);
        };
        let original = original.and_then(RelationValue::as_single).flatten();
        let mut chain = Vec::new();

        if let Some(previous) = original {
            if related != Some(previous) {
                orm.stage(previous)?.del_ref();
                let delete = orm.queue_delete(previous)?;
                // The parent must release the row before it goes away.
                for id in delete.operations() {
                    if let Some(op) = orm.operation_mut(id) {
                        op.run_after(store);
                    }
                }
                chain.push(Command::condition(Predicate::NoReferences(previous), delete));
            }
        }

        let Some(entity) = related else {
            if original.is_some() {
                if !self.schema.nullable {
                    return Err(Error::Custom(format!(
                        "relation {} of {} cannot be cleared",
                        self.schema.name, parent
                    )));
                }
                if let Some(op) = orm.operation_mut(store) {
                    op.accept(&Slot::context(self.schema.inner_key.clone()), Value::Null);
                }
            }
            return Ok(Command::sequence(chain));
        };

        if original == Some(entity) {
            chain.push(orm.queue_store(entity)?);
        } else {
            let refs = orm.stage(entity)?.add_ref();
            let threshold = orm.config().ref_link_threshold;
            if refs > threshold {
                tracing::warn!(
                    relation = %self.schema.name,
                    entity = %entity,
                    refs,
                    threshold,
                    "Entity already linked, skipping store"
                );
            } else {
                chain.push(orm.queue_store(entity)?);
            }
        }

        orm.forward(
            entity,
            &self.schema.outer_key,
            store,
            Slot::context(self.schema.inner_key.clone()),
        )?;
        Ok(Command::sequence(chain))
    }
}
