//! Error types for relmodel operations.

use std::fmt;

use crate::identity::EntityRef;

/// The primary error type for all relmodel operations.
#[derive(Debug)]
pub enum Error {
    /// Identity map conflicts (double attach, duplicate key, unknown entity)
    Identity(IdentityError),
    /// Command graph dependencies that can never be satisfied
    Dependency(DependencyError),
    /// Conditional command referencing an entity with no tracked counters
    Orphan(OrphanReferenceError),
    /// Failures reported by the storage collaborator
    Storage(StorageError),
    /// Schema lookup or definition errors
    Schema(SchemaError),
    /// Configuration errors
    Config(ConfigError),
    /// Operation was cancelled via asupersync
    Cancelled,
    /// Serialization/deserialization errors
    Serde(String),
    /// Custom error with message
    Custom(String),
}

#[derive(Debug)]
pub struct IdentityError {
    pub kind: IdentityErrorKind,
    pub role: Option<String>,
    pub entity: Option<EntityRef>,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentityErrorKind {
    /// Entity already has a node in the heap
    AlreadyAttached,
    /// Another entity is already tracked under the same (role, key)
    DuplicateKey,
    /// Token was never issued by this heap
    UnknownEntity,
}

#[derive(Debug)]
pub struct DependencyError {
    pub kind: DependencyErrorKind,
    /// Labels of the commands involved, in discovery order
    pub commands: Vec<String>,
    /// Parameter slot that could not be satisfied, if any
    pub slot: Option<String>,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DependencyErrorKind {
    /// A waited parameter has no producer in the graph
    Unresolved,
    /// Producers and consumers form a cycle
    Cycle,
}

#[derive(Debug)]
pub struct OrphanReferenceError {
    pub entity: EntityRef,
    pub message: String,
}

#[derive(Debug)]
pub struct StorageError {
    pub kind: StorageErrorKind,
    pub table: Option<String>,
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageErrorKind {
    /// Constraint violation (unique, foreign key, etc.)
    Constraint,
    /// Deadlock detected
    Deadlock,
    /// Serialization failure (retry may succeed)
    Serialization,
    /// Connection lost or unavailable
    Connection,
    /// Table or row not found
    NotFound,
    /// Other storage error
    Other,
}

#[derive(Debug)]
pub struct SchemaError {
    pub kind: SchemaErrorKind,
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaErrorKind {
    /// No entity registered under the role
    UnknownRole,
    /// No relation registered under the name
    UnknownRelation,
    /// Invalid schema definition
    Invalid,
}

#[derive(Debug)]
pub struct ConfigError {
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl Error {
    /// Is this a storage error a caller may reasonably retry?
    ///
    /// The core never retries on its own.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Storage(e) => matches!(
                e.kind,
                StorageErrorKind::Deadlock | StorageErrorKind::Serialization
            ),
            _ => false,
        }
    }

    /// True for failures raised before any storage I/O happened.
    pub fn is_construction_error(&self) -> bool {
        matches!(
            self,
            Error::Identity(_) | Error::Dependency(_) | Error::Schema(_) | Error::Config(_)
        )
    }

    pub fn is_storage_error(&self) -> bool {
        matches!(self, Error::Storage(_))
    }

    pub fn unknown_role(role: &str) -> Self {
        Error::Schema(SchemaError {
            kind: SchemaErrorKind::UnknownRole,
            message: format!("no entity registered for role '{role}'"),
            source: None,
        })
    }

    pub fn unknown_relation(role: &str, name: &str) -> Self {
        Error::Schema(SchemaError {
            kind: SchemaErrorKind::UnknownRelation,
            message: format!("role '{role}' has no relation '{name}'"),
            source: None,
        })
    }

    pub fn unknown_entity(entity: EntityRef) -> Self {
        Error::Identity(IdentityError {
            kind: IdentityErrorKind::UnknownEntity,
            role: None,
            entity: Some(entity),
            message: format!("entity {entity} is not known to the heap"),
        })
    }
}

impl StorageError {
    pub fn new(kind: StorageErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            table: None,
            message: message.into(),
            source: None,
        }
    }

    #[must_use]
    pub fn with_table(mut self, table: impl Into<String>) -> Self {
        self.table = Some(table.into());
        self
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Identity(e) => write!(f, "Identity conflict: {}", e.message),
            Error::Dependency(e) => {
                if e.commands.is_empty() {
                    write!(f, "Unresolved dependency: {}", e.message)
                } else {
                    write!(
                        f,
                        "Unresolved dependency: {} [{}]",
                        e.message,
                        e.commands.join(" -> ")
                    )
                }
            }
            Error::Orphan(e) => write!(f, "Orphan reference: {}", e.message),
            Error::Storage(e) => {
                if let Some(table) = &e.table {
                    write!(f, "Storage error on '{}': {}", table, e.message)
                } else {
                    write!(f, "Storage error: {}", e.message)
                }
            }
            Error::Schema(e) => write!(f, "Schema error: {}", e.message),
            Error::Config(e) => write!(f, "Configuration error: {}", e.message),
            Error::Cancelled => write!(f, "Operation cancelled"),
            Error::Serde(msg) => write!(f, "Serialization error: {}", msg),
            Error::Custom(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Storage(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Schema(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Config(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            _ => None,
        }
    }
}

impl From<IdentityError> for Error {
    fn from(err: IdentityError) -> Self {
        Error::Identity(err)
    }
}

impl From<DependencyError> for Error {
    fn from(err: DependencyError) -> Self {
        Error::Dependency(err)
    }
}

impl From<OrphanReferenceError> for Error {
    fn from(err: OrphanReferenceError) -> Self {
        Error::Orphan(err)
    }
}

impl From<StorageError> for Error {
    fn from(err: StorageError) -> Self {
        Error::Storage(err)
    }
}

impl From<SchemaError> for Error {
    fn from(err: SchemaError) -> Self {
        Error::Schema(err)
    }
}

impl From<ConfigError> for Error {
    fn from(err: ConfigError) -> Self {
        Error::Config(err)
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serde(err.to_string())
    }
}

/// Result type alias for relmodel operations.
pub type Result<T> = std::result::Result<T, Error>;
