use super::{Relation, RelationData};
use crate::Orm;
use crate::command::{Command, CommandId, Operation, Slot, Target};
use crate::entity::{Collection, RelationValue};
use crate::node::NodeStatus;
use relmodel_core::{Criteria, EntityRef, Error, Promise, RelationSchema, Result, Row};
use std::sync::Arc;

/// Shared to-many relation stored in a join table.
///
/// Links are owned by the join rows only: unlinking deletes the join row
/// and leaves the related entity alone. Extra join-row columns travel as
/// the pivot data of each collection element.
#[derive(Debug, Clone)]
pub struct ManyToMany {
    schema: RelationSchema,
    database: Option<String>,
}

impl ManyToMany {
    pub fn new(schema: RelationSchema, database: Option<String>) -> Self {
        Self { schema, database }
    }

    fn materialize(&self, orm: &mut Orm, pairs: Vec<(Row, Row)>) -> Result<RelationValue> {
        let pivot = self.schema.pivot_table()?;
        let mut collection = Collection::new();
        for (mut link, row) in pairs {
            let entity = orm.make(&self.schema.target, row, NodeStatus::Loaded)?;
            link.remove(&pivot.inner_key);
            link.remove(&pivot.outer_key);
            collection.push_with(entity, link);
        }
        Ok(RelationValue::Many(collection))
    }

    fn link_operation(&self, operation: Operation, parent: EntityRef) -> Operation {
        operation
            .with_database(self.database.clone())
            .with_entity(parent)
    }

    /// Fill both join columns of `id` from the parent and the related entity.
    fn forward_keys(
        &self,
        orm: &mut Orm,
        id: CommandId,
        parent: EntityRef,
        entity: EntityRef,
        target: Target,
    ) -> Result<()> {
        let pivot = self.schema.pivot_table()?;
        let inner = Slot {
            target,
            column: pivot.inner_key.clone(),
        };
        let outer = Slot {
            target,
            column: pivot.outer_key.clone(),
        };
        orm.forward(parent, &self.schema.inner_key, id, inner)?;
        orm.forward(entity, &self.schema.outer_key, id, outer)
    }
}

impl Relation for ManyToMany {
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
            Some(RelationData::Pivoted(pairs)) => return self.materialize(orm, pairs),
            Some(RelationData::Many(rows)) => {
                let pairs = rows.into_iter().map(|row| (Row::new(), row)).collect();
                return self.materialize(orm, pairs);
            }
            Some(RelationData::One(_)) => {
                return Err(Error::Custom(format!(
                    "relation {} expects a list of rows",
                    self.schema.name
                )));
            }
            None => {}
        }

        let pivot = self.schema.pivot_table()?;
        match data.get_present(&self.schema.inner_key) {
            Some(key) => Ok(RelationValue::Unloaded(Arc::new(Promise::new(
                Criteria::eq(pivot.inner_key.clone(), key.clone()),
            )))),
            None => Ok(RelationValue::Many(Collection::new())),
        }
    }

    fn load(&self, orm: &mut Orm, scope: &Criteria) -> Result<RelationValue> {
        let pivot = self.schema.pivot_table()?;
        let table = orm.schema().entity(&self.schema.target)?.table.clone();
        let pairs = orm.selector(&self.schema.target)?.fetch_pivoted(
            &table,
            pivot,
            &self.schema.outer_key,
            scope,
        )?;
        self.materialize(orm, pairs)
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
        let pivot = self.schema.pivot_table()?.clone();

        let mut sequence = Vec::new();
        for (entity, data) in related.iter() {
            sequence.push(orm.queue_store(entity)?);

            if original.contains(entity) {
                let Some(data) = data else {
                    continue;
                };
                let baseline = original.pivot(entity).cloned().unwrap_or_default();
                let changes = data.changes_from(&baseline);
                if changes.is_empty() {
                    continue;
                }
                let update = self.link_operation(
                    Operation::update(pivot.table.clone())
                        .with_baseline(baseline)
                        .with_context(changes),
                    parent,
                );
                let id = orm.add_operation(update);
                self.forward_keys(orm, id, parent, entity, Target::Scope)?;
                sequence.push(Command::Operation(id));
                continue;
            }

            let insert = self.link_operation(
                Operation::insert(pivot.table.clone())
                    .with_context(data.cloned().unwrap_or_default()),
                parent,
            );
            let id = orm.add_operation(insert);
            self.forward_keys(orm, id, parent, entity, Target::Context)?;
            let link = Command::Operation(id);
            if orm.operation(id).is_some_and(|op| !op.is_ready()) {
                sequence.push(orm.defer(
                    link,
                    vec![pivot.inner_key.clone(), pivot.outer_key.clone()],
                    format!("{}.{}", parent, self.schema.name),
                ));
            } else {
                sequence.push(link);
            }
        }

        for entity in original.difference(related) {
            let delete = self.link_operation(Operation::delete(pivot.table.clone()), parent);
            let id = orm.add_operation(delete);
            self.forward_keys(orm, id, parent, entity, Target::Scope)?;
            sequence.push(Command::Operation(id));
        }

        Ok(Command::sequence(sequence))
    }
}
