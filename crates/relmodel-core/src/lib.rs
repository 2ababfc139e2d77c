//! Core types for relmodel.
//!
//! This crate provides the foundational pieces shared by the session layer:
//!
//! - `Value` and `Row` for entity data and command parameters
//! - `EntityRef` identity tokens
//! - `Schema` metadata describing roles, tables and relations
//! - `Criteria` immutable selection scopes
//! - `Promise` single-assignment lazy values
//! - `Outcome` re-export from asupersync for cancel-correct operations
//! - `Cx` context for structured concurrency

// Re-export asupersync primitives for structured concurrency
pub use asupersync::{Cx, Outcome};

pub mod criteria;
pub mod error;
pub mod identity;
pub mod promise;
pub mod row;
pub mod schema;
pub mod value;

pub use criteria::{Criteria, Filter, OrderBy, OrderDirection};
pub use error::{
    ConfigError, DependencyError, DependencyErrorKind, Error, IdentityError, IdentityErrorKind,
    OrphanReferenceError, Result, SchemaError, SchemaErrorKind, StorageError, StorageErrorKind,
};
pub use identity::EntityRef;
pub use promise::Promise;
pub use row::Row;
pub use schema::{EntitySchema, PivotTable, RelationKind, RelationSchema, Schema};
pub use value::Value;
