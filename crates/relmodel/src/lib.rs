//! relmodel - unit-of-work persistence for entity graphs.
//!
//! relmodel maps graphs of in-memory entities onto relational storage:
//!
//! - An identity map guaranteeing one instance per stored row
//! - Lazy relations resolved on first access
//! - To-one, one-to-many and many-to-many relation resolvers
//! - A command graph ordering writes so generated keys flow where needed
//! - Cancel-correct flushes built on asupersync
//!
//! # Quick Start
//!
//! ```ignore
//! use relmodel::prelude::*;
//!
//! let schema = Schema::from_json(SCHEMA)?;
//! let (mut orm, storage) = relmodel::in_memory(schema)?;
//!
//! let post = orm.create("post", Row::new().with("title", "hello"))?;
//! let comment = orm.create("comment", Row::new().with("body", "first"))?;
//! orm.entity_mut(post)?
//!     .set_relation("comments", RelationValue::many([comment]));
//!
//! orm.store(post)?;
//! let result = orm.flush(&cx, &storage).await;
//! ```
//!
//! # Features
//!
//! - **Staged flushes**: counters and statuses only change after storage succeeds
//! - **Validated ordering**: cycles and missing producers are rejected before I/O
//! - **Pluggable backends**: implement `Storage` and `Selector` for any store

pub use relmodel_core::{
    // asupersync re-exports
    Cx,
    Outcome,
    // Core types
    ConfigError,
    Criteria,
    DependencyError,
    DependencyErrorKind,
    EntityRef,
    EntitySchema,
    Error,
    Filter,
    IdentityError,
    IdentityErrorKind,
    OrderBy,
    OrderDirection,
    OrphanReferenceError,
    PivotTable,
    Promise,
    RelationKind,
    RelationSchema,
    Result,
    Row,
    Schema,
    SchemaError,
    SchemaErrorKind,
    StorageError,
    StorageErrorKind,
    Value,
};

pub use relmodel_session::{
    Collection, Command, CommandGraph, CommandId, DefaultFactory, DefaultMapper, Entity,
    ExecutionPlan, Factory, FlushReport, FlushResult, Forward, HasMany, HasOne, Heap, ManyToMany,
    Mapper, MemoryStorage, Node, NodeStatus, Operation, OperationKind, Orm, OrmConfig, Predicate,
    Relation, RelationData, RelationMap, RelationValue, Repository, Selector, Slot, Statement,
    Step, Storage, StorageResult, Target, UnitOfWork, execute_plan,
};

use std::sync::Arc;

/// An `Orm` wired to a fresh `MemoryStorage` for reads and writes.
///
/// The schema is validated first.
pub fn in_memory(schema: Schema) -> Result<(Orm, MemoryStorage)> {
    schema.validate()?;
    let storage = MemoryStorage::new();
    let factory = DefaultFactory::new().with_selector(Arc::new(storage.clone()));
    tracing::debug!(roles = schema.roles().count(), "Created in-memory orm");
    Ok((Orm::new(schema, factory), storage))
}

/// Prelude for convenient imports.
///
/// ```ignore
/// use relmodel::prelude::*;
/// ```
pub mod prelude {
    pub use crate::{
        // asupersync
        Cx,
        Outcome,
        // Schema
        EntitySchema,
        RelationSchema,
        Schema,
        // Data
        Criteria,
        EntityRef,
        Error,
        Result,
        Row,
        Value,
        // Session
        Collection,
        DefaultFactory,
        MemoryStorage,
        NodeStatus,
        Orm,
        OrmConfig,
        RelationValue,
        Repository,
        Selector,
        Storage,
    };
}
