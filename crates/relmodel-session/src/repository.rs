//! Row sources and the per-role repository facade.

use crate::Orm;
use crate::node::NodeStatus;
use relmodel_core::{Criteria, EntityRef, Error, PivotTable, Result, Row, Value};

/// Source of raw rows for loading entities.
///
/// Implementations return rows of `table` matching `criteria`; the caller
/// turns them into tracked entities.
pub trait Selector: Send + Sync {
    fn fetch(&self, table: &str, criteria: &Criteria) -> Result<Vec<Row>>;

    /// Rows of `table` joined through `pivot`.
    ///
    /// `criteria` applies to the pivot rows; each matching pivot row is
    /// joined to the rows of `table` whose `outer_key` equals the pivot's
    /// `outer_key` column. Returns `(pivot_row, row)` pairs.
    fn fetch_pivoted(
        &self,
        table: &str,
        pivot: &PivotTable,
        outer_key: &str,
        criteria: &Criteria,
    ) -> Result<Vec<(Row, Row)>> {
        let _ = (table, outer_key, criteria);
        Err(Error::Custom(format!(
            "selector cannot join through {}",
            pivot.table
        )))
    }
}

/// Lookup facade for one role, bound to an `Orm`.
///
/// The scope is immutable: `with_scope` returns a new repository and leaves
/// the current scope as it was.
#[derive(Debug)]
pub struct Repository<'a> {
    orm: &'a mut Orm,
    role: String,
    scope: Criteria,
}

impl<'a> Repository<'a> {
    pub(crate) fn new(orm: &'a mut Orm, role: impl Into<String>) -> Self {
        Self {
            orm,
            role: role.into(),
            scope: Criteria::new(),
        }
    }

    pub fn role(&self) -> &str {
        &self.role
    }

    pub fn scope(&self) -> &Criteria {
        &self.scope
    }

    /// Entity with the given primary key.
    ///
    /// A key already tracked by the heap is served without I/O, provided
    /// its persisted row lies within the scope.
    pub fn find_by_pk(&mut self, key: impl Into<Value>) -> Result<Option<EntityRef>> {
        let key = key.into();
        let tracked = match self.scope.offset_value() {
            Some(offset) if offset > 0 => None,
            _ => self.orm.heap().get_path(&self.role, &key),
        };
        if let Some(entity) = tracked {
            let in_scope = self
                .orm
                .heap()
                .get(entity)
                .is_some_and(|node| self.scope.matches(node.data()));
            tracing::trace!(role = %self.role, key = %key, in_scope, "Found in heap");
            return Ok(in_scope.then_some(entity));
        }
        let pk = self.orm.schema().entity(&self.role)?.primary_key.clone();
        self.find_one(Criteria::eq(pk, key))
    }

    /// First entity matching the scope and `criteria`.
    pub fn find_one(&mut self, criteria: Criteria) -> Result<Option<EntityRef>> {
        let query = self.select(&criteria).limit(1);
        Ok(self.load(&query)?.into_iter().next())
    }

    /// Every entity matching the scope and `criteria`.
    pub fn find_all(&mut self, criteria: Criteria) -> Result<Vec<EntityRef>> {
        let query = self.select(&criteria);
        self.load(&query)
    }

    /// Query combining the scope with `criteria`.
    pub fn select(&self, criteria: &Criteria) -> Criteria {
        self.scope.clone().merge(criteria)
    }

    /// Repository with a narrowed scope.
    #[must_use]
    pub fn with_scope<F>(self, scope: F) -> Repository<'a>
    where
        F: FnOnce(Criteria) -> Criteria,
    {
        Repository {
            scope: scope(self.scope.clone()),
            orm: self.orm,
            role: self.role,
        }
    }

    fn load(&mut self, query: &Criteria) -> Result<Vec<EntityRef>> {
        let table = self.orm.schema().entity(&self.role)?.table.clone();
        let selector = self.orm.selector(&self.role)?;
        let rows = selector.fetch(&table, query)?;
        tracing::debug!(role = %self.role, rows = rows.len(), "Fetched rows");
        rows.into_iter()
            .map(|row| self.orm.make(&self.role, row, NodeStatus::Loaded))
            .collect()
    }
}
