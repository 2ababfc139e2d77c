//! Storage commands and the value-forwarding graph between them.
//!
//! A flush is described by two structures:
//!
//! - a `CommandGraph` arena holding every leaf `Operation` (insert, update,
//!   delete) together with its parameters, the parameter slots it still
//!   waits for, and the slots its own result feeds into other operations;
//! - a `Command` tree combining leaves with `Sequence`, `Condition` and
//!   `Defer` nodes.
//!
//! Leaves reference each other by `CommandId`, never by ownership, so an
//! operation created early in the flush can gain consumers later.

use crate::node::Node;
use relmodel_core::{
    DependencyError, DependencyErrorKind, EntityRef, Error, Result, Row, Value,
};
use std::collections::BTreeSet;
use std::fmt;

/// Index of an operation in its `CommandGraph`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CommandId(usize);

impl CommandId {
    pub const fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for CommandId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "c{}", self.0)
    }
}

/// Kind of storage side effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    Insert,
    Update,
    Delete,
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperationKind::Insert => write!(f, "insert"),
            OperationKind::Update => write!(f, "update"),
            OperationKind::Delete => write!(f, "delete"),
        }
    }
}

/// Which parameter row of an operation a slot refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Target {
    /// Columns written by the operation.
    Context,
    /// Columns identifying the affected rows.
    Scope,
}

/// A named parameter of an operation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Slot {
    pub target: Target,
    pub column: String,
}

impl Slot {
    pub fn context(column: impl Into<String>) -> Self {
        Self {
            target: Target::Context,
            column: column.into(),
        }
    }

    pub fn scope(column: impl Into<String>) -> Self {
        Self {
            target: Target::Scope,
            column: column.into(),
        }
    }
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.target {
            Target::Context => write!(f, "context.{}", self.column),
            Target::Scope => write!(f, "scope.{}", self.column),
        }
    }
}

/// Declaration that a column of the producer's result must be copied into
/// a slot of another operation before that operation runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Forward {
    pub column: String,
    pub consumer: CommandId,
    pub slot: Slot,
}

/// A single storage write.
#[derive(Debug, Clone)]
pub struct Operation {
    id: CommandId,
    kind: OperationKind,
    database: Option<String>,
    table: String,
    entity: Option<EntityRef>,
    primary_key: Option<String>,
    context: Row,
    scope: Row,
    baseline: Row,
    waiting: BTreeSet<Slot>,
    forwards: Vec<Forward>,
    /// Context columns filled from other entities rather than extracted.
    linked: BTreeSet<String>,
    /// Operations that must run first without passing a value.
    after: Vec<CommandId>,
}

impl Operation {
    fn new(kind: OperationKind, table: impl Into<String>) -> Self {
        Self {
            id: CommandId(0),
            kind,
            database: None,
            table: table.into(),
            entity: None,
            primary_key: None,
            context: Row::new(),
            scope: Row::new(),
            baseline: Row::new(),
            waiting: BTreeSet::new(),
            forwards: Vec::new(),
            linked: BTreeSet::new(),
            after: Vec::new(),
        }
    }

    pub fn insert(table: impl Into<String>) -> Self {
        Self::new(OperationKind::Insert, table)
    }

    pub fn update(table: impl Into<String>) -> Self {
        Self::new(OperationKind::Update, table)
    }

    pub fn delete(table: impl Into<String>) -> Self {
        Self::new(OperationKind::Delete, table)
    }

    #[must_use]
    pub fn with_database(mut self, database: Option<String>) -> Self {
        self.database = database;
        self
    }

    /// Entity whose row this operation writes.
    #[must_use]
    pub fn with_entity(mut self, entity: EntityRef) -> Self {
        self.entity = Some(entity);
        self
    }

    /// Column that receives a storage-generated key on insert.
    #[must_use]
    pub fn with_primary_key(mut self, column: impl Into<String>) -> Self {
        self.primary_key = Some(column.into());
        self
    }

    #[must_use]
    pub fn with_context(mut self, context: Row) -> Self {
        self.context = context;
        self
    }

    #[must_use]
    pub fn with_scope(mut self, scope: Row) -> Self {
        self.scope = scope;
        self
    }

    /// Persisted values an update is compared against.
    #[must_use]
    pub fn with_baseline(mut self, baseline: Row) -> Self {
        self.baseline = baseline;
        self
    }

    pub fn id(&self) -> CommandId {
        self.id
    }

    pub fn kind(&self) -> OperationKind {
        self.kind
    }

    pub fn database(&self) -> Option<&str> {
        self.database.as_deref()
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn entity(&self) -> Option<EntityRef> {
        self.entity
    }

    pub fn primary_key(&self) -> Option<&str> {
        self.primary_key.as_deref()
    }

    pub fn context(&self) -> &Row {
        &self.context
    }

    pub fn scope(&self) -> &Row {
        &self.scope
    }

    pub fn baseline(&self) -> &Row {
        &self.baseline
    }

    pub fn waiting(&self) -> &BTreeSet<Slot> {
        &self.waiting
    }

    pub fn forwards(&self) -> &[Forward] {
        &self.forwards
    }

    /// Context columns set by `wait` or `accept`.
    pub fn linked(&self) -> &BTreeSet<String> {
        &self.linked
    }

    pub fn depends_on(&self) -> &[CommandId] {
        &self.after
    }

    /// Order this operation after `other` without forwarding a value.
    pub fn run_after(&mut self, other: CommandId) {
        if other != self.id && !self.after.contains(&other) {
            self.after.push(other);
        }
    }

    pub fn is_ready(&self) -> bool {
        self.waiting.is_empty()
    }

    /// Current value of a slot.
    pub fn get(&self, slot: &Slot) -> Option<&Value> {
        match slot.target {
            Target::Context => self.context.get(&slot.column),
            Target::Scope => self.scope.get(&slot.column),
        }
    }

    /// Assign a slot without touching the wait set.
    pub fn set(&mut self, slot: &Slot, value: Value) {
        match slot.target {
            Target::Context => self.context.set(slot.column.clone(), value),
            Target::Scope => self.scope.set(slot.column.clone(), value),
        };
    }

    /// Declare that the operation may not run before `slot` is filled.
    pub fn wait(&mut self, slot: Slot) {
        self.link(&slot);
        self.waiting.insert(slot);
    }

    /// Fill a slot and stop waiting for it.
    pub fn accept(&mut self, slot: &Slot, value: Value) {
        self.link(slot);
        self.set(slot, value);
        self.waiting.remove(slot);
    }

    fn link(&mut self, slot: &Slot) {
        if slot.target == Target::Context {
            self.linked.insert(slot.column.clone());
        }
    }

    /// Declare that `column` of this operation's result feeds `slot` of `consumer`.
    pub fn forward(&mut self, column: impl Into<String>, consumer: CommandId, slot: Slot) {
        let forward = Forward {
            column: column.into(),
            consumer,
            slot,
        };
        if !self.forwards.contains(&forward) {
            self.forwards.push(forward);
        }
    }

    /// Columns the operation actually writes.
    ///
    /// Updates drop columns equal to the persisted baseline.
    pub fn changes(&self) -> Row {
        match self.kind {
            OperationKind::Update => self.context.changes_from(&self.baseline),
            _ => self.context.clone(),
        }
    }

    /// True for an update with nothing left to write and nothing to wait for.
    pub fn is_noop(&self) -> bool {
        self.kind == OperationKind::Update && self.waiting.is_empty() && self.changes().is_empty()
    }

    /// Row describing the entity after this operation ran.
    ///
    /// Starts from the baseline, applies scope and context, then the
    /// generated key (if any) under the primary key column.
    pub fn result_row(&self, generated_key: Option<&Value>) -> Row {
        let mut row = self.baseline.clone();
        row.merge(&self.scope);
        row.merge(&self.context);
        if let (Some(column), Some(key)) = (&self.primary_key, generated_key) {
            if row.get_present(column).is_none() {
                row.set(column.clone(), key.clone());
            }
        }
        row
    }

    /// Human readable label used in logs and errors.
    pub fn label(&self) -> String {
        match self.entity {
            Some(entity) => format!("{} {}{} ({})", self.kind, self.table, entity, self.id),
            None => format!("{} {} ({})", self.kind, self.table, self.id),
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.label())
    }
}

/// Execution-time guard of a conditional command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Predicate {
    /// The entity has no to-one owner left.
    NoReferences(EntityRef),
    /// No collection claims the entity in this flush.
    NoClaims(EntityRef),
}

impl Predicate {
    pub fn entity(&self) -> EntityRef {
        match self {
            Predicate::NoReferences(e) | Predicate::NoClaims(e) => *e,
        }
    }

    /// Evaluate against the entity's counters.
    pub fn evaluate(&self, node: &Node) -> bool {
        match self {
            Predicate::NoReferences(_) => node.ref_count() == 0,
            Predicate::NoClaims(_) => !node.has_claims(),
        }
    }
}

impl fmt::Display for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Predicate::NoReferences(e) => write!(f, "no references to {e}"),
            Predicate::NoClaims(e) => write!(f, "no claims on {e}"),
        }
    }
}

/// Structure of a flush: leaves combined into sequences, conditions and
/// deferred groups.
#[derive(Debug, Clone, Default)]
pub enum Command {
    /// Nothing to do.
    #[default]
    Nil,
    /// A single storage write.
    Operation(CommandId),
    /// Ordered sub-commands; all must succeed.
    Sequence(Vec<Command>),
    /// Runs `command` only when `predicate` holds right before execution.
    Condition {
        predicate: Predicate,
        command: Box<Command>,
    },
    /// Holds `command` back until the named context values arrive.
    Defer {
        command: Box<Command>,
        waits: Vec<String>,
        label: String,
    },
}

impl Command {
    /// Combine commands, dropping `Nil` entries.
    pub fn sequence<I: IntoIterator<Item = Command>>(commands: I) -> Command {
        let mut items: Vec<Command> = commands.into_iter().filter(|c| !c.is_nil()).collect();
        match items.len() {
            0 => Command::Nil,
            1 => items.remove(0),
            _ => Command::Sequence(items),
        }
    }

    pub fn condition(predicate: Predicate, command: Command) -> Command {
        if command.is_nil() {
            return Command::Nil;
        }
        Command::Condition {
            predicate,
            command: Box::new(command),
        }
    }

    /// Wrap `command` so each of its operations waits for the named context
    /// columns that do not hold a value yet.
    pub fn defer(
        graph: &mut CommandGraph,
        command: Command,
        waits: Vec<String>,
        label: impl Into<String>,
    ) -> Command {
        if command.is_nil() {
            return Command::Nil;
        }
        for id in command.operations() {
            if let Some(op) = graph.get_mut(id) {
                for column in &waits {
                    if op.context().get_present(column).is_none() {
                        op.wait(Slot::context(column.clone()));
                    }
                }
            }
        }
        Command::Defer {
            command: Box::new(command),
            waits,
            label: label.into(),
        }
    }

    pub fn is_nil(&self) -> bool {
        matches!(self, Command::Nil)
    }

    /// Leaf operations in tree order.
    pub fn operations(&self) -> Vec<CommandId> {
        let mut out = Vec::new();
        self.collect_operations(&mut out);
        out
    }

    fn collect_operations(&self, out: &mut Vec<CommandId>) {
        match self {
            Command::Nil => {}
            Command::Operation(id) => out.push(*id),
            Command::Sequence(items) => {
                for item in items {
                    item.collect_operations(out);
                }
            }
            Command::Condition { command, .. } | Command::Defer { command, .. } => {
                command.collect_operations(out);
            }
        }
    }

    /// Leaf operations in tree order with the predicates guarding each.
    pub fn guarded_operations(&self) -> Vec<(CommandId, Vec<Predicate>)> {
        let mut out = Vec::new();
        self.collect_guarded(&mut Vec::new(), &mut out);
        out
    }

    fn collect_guarded(
        &self,
        guards: &mut Vec<Predicate>,
        out: &mut Vec<(CommandId, Vec<Predicate>)>,
    ) {
        match self {
            Command::Nil => {}
            Command::Operation(id) => out.push((*id, guards.clone())),
            Command::Sequence(items) => {
                for item in items {
                    item.collect_guarded(guards, out);
                }
            }
            Command::Condition { predicate, command } => {
                guards.push(*predicate);
                command.collect_guarded(guards, out);
                guards.pop();
            }
            Command::Defer { command, .. } => command.collect_guarded(guards, out),
        }
    }

    /// Conditional sub-commands in tree order.
    pub fn conditions(&self) -> Vec<(&Predicate, &Command)> {
        let mut out = Vec::new();
        self.collect_conditions(&mut out);
        out
    }

    fn collect_conditions<'a>(&'a self, out: &mut Vec<(&'a Predicate, &'a Command)>) {
        match self {
            Command::Nil | Command::Operation(_) => {}
            Command::Sequence(items) => {
                for item in items {
                    item.collect_conditions(out);
                }
            }
            Command::Condition { predicate, command } => {
                out.push((predicate, command));
                command.collect_conditions(out);
            }
            Command::Defer { command, .. } => command.collect_conditions(out),
        }
    }
}

/// Arena of the operations built for one flush.
#[derive(Debug, Clone, Default)]
pub struct CommandGraph {
    operations: Vec<Operation>,
}

impl CommandGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store an operation and return its id.
    pub fn add(&mut self, mut operation: Operation) -> CommandId {
        let id = CommandId(self.operations.len());
        operation.id = id;
        self.operations.push(operation);
        id
    }

    pub fn get(&self, id: CommandId) -> Option<&Operation> {
        self.operations.get(id.0)
    }

    pub fn get_mut(&mut self, id: CommandId) -> Option<&mut Operation> {
        self.operations.get_mut(id.0)
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Operation> {
        self.operations.iter()
    }

    /// Declare that `column` of `producer`'s result fills `slot` of
    /// `consumer`, and make `consumer` wait for it.
    pub fn forward(
        &mut self,
        producer: CommandId,
        column: impl Into<String>,
        consumer: CommandId,
        slot: Slot,
    ) -> Result<()> {
        if self.get(consumer).is_none() {
            return Err(unknown_command(consumer));
        }
        self.get_mut(producer)
            .ok_or_else(|| unknown_command(producer))?
            .forward(column, consumer, slot.clone());
        if let Some(op) = self.get_mut(consumer) {
            op.wait(slot);
        }
        Ok(())
    }

    /// Label of an operation, or its bare id if unknown.
    pub fn label(&self, id: CommandId) -> String {
        self.get(id).map_or_else(|| id.to_string(), Operation::label)
    }

    /// Would executing `command` leave storage untouched?
    pub fn is_noop(&self, command: &Command) -> bool {
        command
            .operations()
            .into_iter()
            .all(|id| self.get(id).is_some_and(Operation::is_noop))
    }

    /// Number of operations in `command` that would write something.
    pub fn write_count(&self, command: &Command) -> usize {
        command
            .operations()
            .into_iter()
            .filter(|id| self.get(*id).is_some_and(|op| !op.is_noop()))
            .count()
    }
}

fn unknown_command(id: CommandId) -> Error {
    Error::Dependency(DependencyError {
        kind: DependencyErrorKind::Unresolved,
        commands: vec![id.to_string()],
        slot: None,
        message: format!("command {id} is not part of this graph"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn e(raw: u64) -> EntityRef {
        EntityRef::from_raw(raw)
    }

    #[test]
    fn sequence_drops_nil_and_collapses() {
        assert!(Command::sequence([Command::Nil, Command::Nil]).is_nil());
        let one = Command::sequence([Command::Nil, Command::Operation(CommandId(3))]);
        assert!(matches!(one, Command::Operation(CommandId(3))));
        let many = Command::sequence([
            Command::Operation(CommandId(0)),
            Command::Operation(CommandId(1)),
        ]);
        assert_eq!(many.operations(), vec![CommandId(0), CommandId(1)]);
    }

    #[test]
    fn forward_registers_wait_and_accept_clears_it() {
        let mut graph = CommandGraph::new();
        let user = graph.add(Operation::insert("users").with_primary_key("id"));
        let post = graph.add(Operation::insert("posts"));

        graph
            .forward(user, "id", post, Slot::context("user_id"))
            .unwrap();
        assert!(!graph.get(post).unwrap().is_ready());
        assert_eq!(graph.get(user).unwrap().forwards().len(), 1);

        let post_op = graph.get_mut(post).unwrap();
        post_op.accept(&Slot::context("user_id"), Value::BigInt(7));
        assert!(post_op.is_ready());
        assert_eq!(post_op.context().get("user_id"), Some(&Value::BigInt(7)));
    }

    #[test]
    fn linked_columns_cover_context_slots_only() {
        let mut op = Operation::update("posts").with_context(Row::new().with("title", "a"));
        op.accept(&Slot::context("user_id"), Value::BigInt(2));
        op.wait(Slot::context("editor_id"));
        op.wait(Slot::scope("id"));

        let linked: Vec<_> = op.linked().iter().map(String::as_str).collect();
        assert_eq!(linked, vec!["editor_id", "user_id"]);
    }

    #[test]
    fn forward_to_unknown_command_fails() {
        let mut graph = CommandGraph::new();
        let user = graph.add(Operation::insert("users"));
        assert!(
            graph
                .forward(user, "id", CommandId(9), Slot::context("user_id"))
                .is_err()
        );
    }

    #[test]
    fn update_without_changes_is_noop() {
        let baseline = Row::new().with("id", 1_i64).with("name", "a");
        let update = Operation::update("users")
            .with_baseline(baseline.clone())
            .with_context(Row::new().with("name", "a"));
        assert!(update.is_noop());

        let changed = Operation::update("users")
            .with_baseline(baseline)
            .with_context(Row::new().with("name", "b"));
        assert!(!changed.is_noop());
        assert_eq!(changed.changes().len(), 1);
        assert!(!Operation::insert("users").is_noop());
    }

    #[test]
    fn result_row_fills_generated_key() {
        let insert = Operation::insert("users")
            .with_primary_key("id")
            .with_context(Row::new().with("name", "a"));
        let row = insert.result_row(Some(&Value::BigInt(11)));
        assert_eq!(row.get("id"), Some(&Value::BigInt(11)));
        assert_eq!(row.get("name"), Some(&Value::from("a")));
    }

    #[test]
    fn defer_waits_only_for_missing_values() {
        let mut graph = CommandGraph::new();
        let link = graph.add(
            Operation::insert("user_tags").with_context(Row::new().with("user_id", 1_i64)),
        );
        let deferred = Command::defer(
            &mut graph,
            Command::Operation(link),
            vec!["user_id".to_string(), "tag_id".to_string()],
            "user.tags",
        );
        let waiting: Vec<_> = graph.get(link).unwrap().waiting().iter().cloned().collect();
        assert_eq!(waiting, vec![Slot::context("tag_id")]);
        assert!(matches!(deferred, Command::Defer { .. }));
    }

    #[test]
    fn guarded_operations_carry_predicates() {
        let command = Command::sequence([
            Command::Operation(CommandId(0)),
            Command::condition(
                Predicate::NoClaims(e(4)),
                Command::Operation(CommandId(1)),
            ),
        ]);
        let guarded = command.guarded_operations();
        assert!(guarded[0].1.is_empty());
        assert_eq!(guarded[1].1, vec![Predicate::NoClaims(e(4))]);
        assert_eq!(command.conditions().len(), 1);
    }

    #[test]
    fn predicate_reads_counters() {
        let mut node = Node::new("tag");
        assert!(Predicate::NoReferences(e(1)).evaluate(&node));
        node.add_ref();
        assert!(!Predicate::NoReferences(e(1)).evaluate(&node));
        node.add_claim();
        assert!(!Predicate::NoClaims(e(1)).evaluate(&node));
    }
}
