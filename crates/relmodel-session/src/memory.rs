//! In-memory storage backend.
//!
//! `MemoryStorage` keeps every table as a list of rows behind a mutex and
//! implements both `Storage` and `Selector`, so one instance can be written
//! by flushes and read by repositories and lazy relations. It supports:
//!
//! - generated integer keys per table
//! - snapshot transactions (`begin` copies, `rollback` restores)
//! - a log of executed statements
//! - failure injection per table
//!
//! Clones share the same state.

use crate::command::{Operation, OperationKind};
use crate::flush::{Storage, StorageResult};
use crate::repository::Selector;
use asupersync::{Cx, Outcome};
use relmodel_core::{
    Criteria, Error, PivotTable, Result, Row, StorageError, StorageErrorKind, Value,
};
use std::collections::{BTreeMap, HashSet};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// A write as it reached the backend.
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    pub kind: OperationKind,
    pub table: String,
    pub context: Row,
    pub scope: Row,
}

#[derive(Debug, Clone, Default)]
struct Tables {
    rows: BTreeMap<String, Vec<Row>>,
    sequences: BTreeMap<String, i64>,
}

#[derive(Debug, Default)]
struct State {
    tables: Tables,
    snapshot: Option<Tables>,
    log: Vec<Statement>,
    failures: HashSet<String>,
    commits: usize,
    rollbacks: usize,
}

/// Shared in-memory tables.
#[derive(Debug, Clone, Default)]
pub struct MemoryStorage {
    state: Arc<Mutex<State>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Insert rows directly, bypassing transactions and the log.
    pub fn seed<I: IntoIterator<Item = Row>>(&self, table: &str, rows: I) {
        let mut state = self.lock();
        for row in rows {
            if let Some(id) = row.get("id").and_then(Value::as_i64) {
                let sequence = state.tables.sequences.entry(table.to_string()).or_default();
                *sequence = (*sequence).max(id);
            }
            state
                .tables
                .rows
                .entry(table.to_string())
                .or_default()
                .push(row);
        }
    }

    /// Current rows of a table.
    pub fn rows(&self, table: &str) -> Vec<Row> {
        self.lock()
            .tables
            .rows
            .get(table)
            .cloned()
            .unwrap_or_default()
    }

    /// Every statement executed so far, rolled back or not.
    pub fn log(&self) -> Vec<Statement> {
        self.lock().log.clone()
    }

    pub fn clear_log(&self) {
        self.lock().log.clear();
    }

    /// Make every write to `table` fail with a constraint violation.
    pub fn fail_on(&self, table: impl Into<String>) {
        self.lock().failures.insert(table.into());
    }

    pub fn clear_failures(&self) {
        self.lock().failures.clear();
    }

    pub fn commits(&self) -> usize {
        self.lock().commits
    }

    pub fn rollbacks(&self) -> usize {
        self.lock().rollbacks
    }

    fn apply(&self, operation: &Operation) -> Result<StorageResult> {
        let mut state = self.lock();
        let table = operation.table().to_string();
        if state.failures.contains(&table) {
            return Err(StorageError::new(
                StorageErrorKind::Constraint,
                format!("{} rejected by {}", operation.kind(), table),
            )
            .with_table(table)
            .into());
        }

        state.log.push(Statement {
            kind: operation.kind(),
            table: table.clone(),
            context: operation.context().clone(),
            scope: operation.scope().clone(),
        });

        if operation.kind() != OperationKind::Insert && operation.scope().is_empty() {
            return Err(StorageError::new(
                StorageErrorKind::Other,
                format!("refusing unscoped {} on {}", operation.kind(), table),
            )
            .with_table(table)
            .into());
        }

        let Tables { rows, sequences } = &mut state.tables;
        let rows = rows.entry(table.clone()).or_default();
        match operation.kind() {
            OperationKind::Insert => {
                let mut row = operation.context().clone();
                let sequence = sequences.entry(table).or_default();
                let mut result = StorageResult::affected(1);
                if let Some(column) = operation.primary_key() {
                    match row.get_present(column).and_then(Value::as_i64) {
                        Some(id) => *sequence = (*sequence).max(id),
                        None if row.get_present(column).is_none() => {
                            *sequence += 1;
                            row.set(column, *sequence);
                            result = result.with_generated_key(*sequence);
                        }
                        None => {}
                    }
                }
                rows.push(row);
                Ok(result)
            }
            OperationKind::Update => {
                let scope = Criteria::new().where_row(operation.scope());
                let mut affected = 0;
                for row in rows.iter_mut().filter(|row| scope.matches(row)) {
                    row.merge(operation.context());
                    affected += 1;
                }
                Ok(StorageResult::affected(affected))
            }
            OperationKind::Delete => {
                let scope = Criteria::new().where_row(operation.scope());
                let before = rows.len();
                rows.retain(|row| !scope.matches(row));
                Ok(StorageResult::affected((before - rows.len()) as u64))
            }
        }
    }
}

fn ready<T>(result: Result<T>) -> impl Future<Output = Outcome<T, Error>> + Send
where
    T: Send,
{
    async move {
        match result {
            Ok(value) => Outcome::Ok(value),
            Err(e) => Outcome::Err(e),
        }
    }
}

impl Storage for MemoryStorage {
    fn begin(&self, _cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send {
        let mut state = self.lock();
        state.snapshot = Some(state.tables.clone());
        drop(state);
        ready(Ok(()))
    }

    fn execute(
        &self,
        _cx: &Cx,
        operation: &Operation,
    ) -> impl Future<Output = Outcome<StorageResult, Error>> + Send {
        ready(self.apply(operation))
    }

    fn commit(&self, _cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send {
        let mut state = self.lock();
        state.snapshot = None;
        state.commits += 1;
        drop(state);
        ready(Ok(()))
    }

    fn rollback(&self, _cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send {
        let mut state = self.lock();
        if let Some(snapshot) = state.snapshot.take() {
            state.tables = snapshot;
        }
        state.rollbacks += 1;
        drop(state);
        ready(Ok(()))
    }
}

impl Selector for MemoryStorage {
    fn fetch(&self, table: &str, criteria: &Criteria) -> Result<Vec<Row>> {
        Ok(criteria.apply(self.rows(table)))
    }

    fn fetch_pivoted(
        &self,
        table: &str,
        pivot: &PivotTable,
        outer_key: &str,
        criteria: &Criteria,
    ) -> Result<Vec<(Row, Row)>> {
        let rows = self.rows(table);
        let links = criteria.apply(self.rows(&pivot.table));
        Ok(links
            .into_iter()
            .filter_map(|link| {
                let key = link.get_present(&pivot.outer_key)?;
                let row = rows
                    .iter()
                    .find(|row| row.get(outer_key).is_some_and(|v| v.key_eq(key)))?
                    .clone();
                Some((link, row))
            })
            .collect())
    }
}
