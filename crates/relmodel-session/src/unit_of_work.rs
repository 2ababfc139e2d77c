//! Flush staging and execution planning.
//!
//! The unit of work collects everything one flush builds before any of it
//! touches the heap:
//!
//! - the command arena and the pending top-level sequence
//! - staged copies of every node the flush mutates (status, counters,
//!   relation snapshots)
//! - the store command producing each entity's row, used to wire forwarding
//! - the set of entities already stored or deleted in this flush
//!
//! A successful flush commits the staged nodes; a failed or discarded one
//! simply drops the unit of work, leaving tracked nodes untouched.
//!
//! # Example
//!
//! ```ignore
//! let mut uow = UnitOfWork::new();
//! let user = uow.graph_mut().add(Operation::insert("users").with_primary_key("id"));
//! let post = uow.graph_mut().add(Operation::insert("posts"));
//! uow.graph_mut().forward(user, "id", post, Slot::context("user_id"))?;
//! uow.push(Command::sequence([Command::Operation(post), Command::Operation(user)]));
//!
//! // The user insert is planned first because the post waits on its key.
//! let plan = uow.compile()?;
//! ```

use crate::command::{Command, CommandGraph, CommandId, Predicate, Slot};
use crate::node::Node;
use relmodel_core::{DependencyError, DependencyErrorKind, EntityRef, Error, Result};
use std::collections::{HashMap, HashSet};

/// Staged state of one flush.
#[derive(Debug, Clone, Default)]
pub struct UnitOfWork {
    graph: CommandGraph,
    root: Vec<Command>,
    /// Node copies mutated by this flush.
    nodes: HashMap<EntityRef, Node>,
    /// Entity -> the operation writing its row.
    producers: HashMap<EntityRef, CommandId>,
    /// Entity -> the operation deleting its row.
    deletes: HashMap<EntityRef, CommandId>,
    stored: HashSet<EntityRef>,
    deleted: HashSet<EntityRef>,
}

/// One leaf of an execution plan.
#[derive(Debug, Clone, PartialEq)]
pub struct Step {
    pub id: CommandId,
    /// Predicates that must all hold right before the leaf runs.
    pub guards: Vec<Predicate>,
}

/// Dependency-ordered list of leaves to execute.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecutionPlan {
    steps: Vec<Step>,
}

impl ExecutionPlan {
    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// Position of a leaf in the plan.
    pub fn position(&self, id: CommandId) -> Option<usize> {
        self.steps.iter().position(|s| s.id == id)
    }
}

impl UnitOfWork {
    pub fn new() -> Self {
        Self::default()
    }

    /// True when nothing has been queued.
    pub fn is_empty(&self) -> bool {
        self.root.iter().all(Command::is_nil)
    }

    pub fn graph(&self) -> &CommandGraph {
        &self.graph
    }

    pub fn graph_mut(&mut self) -> &mut CommandGraph {
        &mut self.graph
    }

    /// Append a command to the top-level sequence.
    pub fn push(&mut self, command: Command) {
        if !command.is_nil() {
            self.root.push(command);
        }
    }

    /// The top-level sequence built so far.
    pub fn command(&self) -> Command {
        Command::sequence(self.root.iter().cloned())
    }

    pub fn staged(&self, entity: EntityRef) -> Option<&Node> {
        self.nodes.get(&entity)
    }

    pub fn staged_mut(&mut self, entity: EntityRef) -> Option<&mut Node> {
        self.nodes.get_mut(&entity)
    }

    pub(crate) fn stage(&mut self, entity: EntityRef, node: Node) -> &mut Node {
        self.nodes.entry(entity).or_insert(node)
    }

    pub fn staged_nodes(&self) -> impl Iterator<Item = (EntityRef, &Node)> {
        self.nodes.iter().map(|(e, n)| (*e, n))
    }

    pub fn producer(&self, entity: EntityRef) -> Option<CommandId> {
        self.producers.get(&entity).copied()
    }

    pub(crate) fn set_producer(&mut self, entity: EntityRef, id: CommandId) {
        self.producers.insert(entity, id);
    }

    pub fn deletion(&self, entity: EntityRef) -> Option<CommandId> {
        self.deletes.get(&entity).copied()
    }

    pub(crate) fn set_deletion(&mut self, entity: EntityRef, id: CommandId) {
        self.deletes.insert(entity, id);
    }

    /// Record that `entity` is stored by this flush. False if it already was.
    pub(crate) fn mark_stored(&mut self, entity: EntityRef) -> bool {
        self.stored.insert(entity)
    }

    pub(crate) fn mark_deleted(&mut self, entity: EntityRef) -> bool {
        self.deleted.insert(entity)
    }

    pub fn is_stored(&self, entity: EntityRef) -> bool {
        self.stored.contains(&entity)
    }

    pub fn is_deleted(&self, entity: EntityRef) -> bool {
        self.deleted.contains(&entity)
    }

    /// Validate the reachable graph and order its leaves.
    ///
    /// Rejects, before any I/O:
    /// - a leaf waiting for a slot that no reachable operation forwards into
    /// - producers and consumers forming a cycle
    ///
    /// The returned order runs every producer before its consumers and
    /// otherwise keeps the order of the command tree.
    pub fn compile(&self) -> Result<ExecutionPlan> {
        let mut steps = Vec::new();
        let mut reachable = HashSet::new();
        for (id, guards) in self.command().guarded_operations() {
            if reachable.insert(id) {
                steps.push(Step { id, guards });
            }
        }

        let mut edges: HashMap<CommandId, Vec<CommandId>> = HashMap::new();
        let mut covered: HashSet<(CommandId, Slot)> = HashSet::new();
        for step in &steps {
            let op = self
                .graph
                .get(step.id)
                .ok_or_else(|| self.unresolved(step.id, None, "command is missing"))?;
            for forward in op.forwards() {
                if reachable.contains(&forward.consumer) {
                    edges.entry(step.id).or_default().push(forward.consumer);
                    covered.insert((forward.consumer, forward.slot.clone()));
                }
            }
            for before in op.depends_on() {
                if reachable.contains(before) {
                    edges.entry(*before).or_default().push(step.id);
                }
            }
        }

        for step in &steps {
            if let Some(op) = self.graph.get(step.id) {
                for slot in op.waiting() {
                    if !covered.contains(&(step.id, slot.clone())) {
                        return Err(self.unresolved(
                            step.id,
                            Some(slot),
                            "no command in this flush produces the value",
                        ));
                    }
                }
            }
        }

        self.check_cycles(&steps, &edges)?;

        let mut indegree: HashMap<CommandId, usize> = steps.iter().map(|s| (s.id, 0)).collect();
        for consumers in edges.values() {
            for consumer in consumers {
                if let Some(count) = indegree.get_mut(consumer) {
                    *count += 1;
                }
            }
        }

        let mut remaining = steps;
        let mut ordered = Vec::with_capacity(remaining.len());
        while !remaining.is_empty() {
            let Some(index) = remaining
                .iter()
                .position(|s| indegree.get(&s.id).copied().unwrap_or(0) == 0)
            else {
                // check_cycles guarantees progress; keep the error path anyway.
                let labels = remaining.iter().map(|s| self.graph.label(s.id)).collect();
                return Err(cycle_error(labels));
            };
            let step = remaining.remove(index);
            for consumer in edges.get(&step.id).into_iter().flatten() {
                if let Some(count) = indegree.get_mut(consumer) {
                    *count = count.saturating_sub(1);
                }
            }
            ordered.push(step);
        }

        tracing::debug!(steps = ordered.len(), "Compiled execution plan");
        Ok(ExecutionPlan { steps: ordered })
    }

    fn check_cycles(
        &self,
        steps: &[Step],
        edges: &HashMap<CommandId, Vec<CommandId>>,
    ) -> Result<()> {
        let mut visited = HashSet::new();
        let mut rec_stack = HashSet::new();
        let mut path = Vec::new();

        for step in steps {
            if !visited.contains(&step.id)
                && Self::detect_cycle_dfs(step.id, edges, &mut visited, &mut rec_stack, &mut path)
            {
                let labels = path.iter().map(|id| self.graph.label(*id)).collect();
                return Err(cycle_error(labels));
            }
        }
        Ok(())
    }

    /// DFS helper for cycle detection.
    fn detect_cycle_dfs(
        id: CommandId,
        edges: &HashMap<CommandId, Vec<CommandId>>,
        visited: &mut HashSet<CommandId>,
        rec_stack: &mut HashSet<CommandId>,
        path: &mut Vec<CommandId>,
    ) -> bool {
        visited.insert(id);
        rec_stack.insert(id);
        path.push(id);

        for next in edges.get(&id).into_iter().flatten() {
            if !visited.contains(next) {
                if Self::detect_cycle_dfs(*next, edges, visited, rec_stack, path) {
                    return true;
                }
            } else if rec_stack.contains(next) {
                // Close the loop for the report.
                path.push(*next);
                return true;
            }
        }

        rec_stack.remove(&id);
        path.pop();
        false
    }

    fn unresolved(&self, id: CommandId, slot: Option<&Slot>, reason: &str) -> Error {
        let label = self.graph.label(id);
        Error::Dependency(DependencyError {
            kind: DependencyErrorKind::Unresolved,
            message: match slot {
                Some(slot) => format!("{label} waits for {slot}: {reason}"),
                None => format!("{label}: {reason}"),
            },
            commands: vec![label],
            slot: slot.map(ToString::to_string),
        })
    }
}

fn cycle_error(commands: Vec<String>) -> Error {
    Error::Dependency(DependencyError {
        kind: DependencyErrorKind::Cycle,
        commands,
        slot: None,
        message: "commands wait on each other".to_string(),
    })
}
