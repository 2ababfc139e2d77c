//! Entity and relation metadata.
//!
//! The schema is supplied from outside (usually loaded once at startup) and
//! is only ever read by the session layer. It names, per entity role, the
//! table the role lives in, its primary key column and the relations the
//! resolvers reconcile on every store.

use crate::error::{Error, Result, SchemaError, SchemaErrorKind};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::OnceLock;

/// The type of relation between two entity roles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationKind {
    /// To-one relation whose foreign key lives on the parent row.
    ///
    /// The related entity may be shared by several parents; it is deleted
    /// once no parent references it anymore.
    HasOne,
    /// To-many relation whose foreign key lives on the child rows.
    HasMany,
    /// To-many relation stored in a join table, optionally carrying
    /// per-link attributes (pivot data).
    ManyToMany,
}

impl RelationKind {
    pub const fn is_collection(self) -> bool {
        matches!(self, RelationKind::HasMany | RelationKind::ManyToMany)
    }
}

/// Join table of a many-to-many relation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PivotTable {
    /// The join table name (e.g., `"user_tags"`).
    pub table: String,

    /// Join column receiving the parent's inner key (e.g., `"user_id"`).
    pub inner_key: String,

    /// Join column receiving the related entity's outer key (e.g., `"tag_id"`).
    pub outer_key: String,
}

impl PivotTable {
    #[must_use]
    pub fn new(
        table: impl Into<String>,
        inner_key: impl Into<String>,
        outer_key: impl Into<String>,
    ) -> Self {
        Self {
            table: table.into(),
            inner_key: inner_key.into(),
            outer_key: outer_key.into(),
        }
    }
}

/// Definition of a single relation of an entity role.
///
/// Key naming follows the parent's point of view: `inner_key` is a column
/// of the parent row and `outer_key` a column of the related row.
///
/// | kind         | inner_key           | outer_key             |
/// |--------------|---------------------|-----------------------|
/// | `HasOne`     | parent foreign key  | related primary key   |
/// | `HasMany`    | parent primary key  | child foreign key     |
/// | `ManyToMany` | parent primary key  | related primary key   |
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationSchema {
    /// Name of the relation on the parent.
    pub name: String,

    /// Kind of relation.
    pub kind: RelationKind,

    /// Role of the related entity.
    pub target: String,

    pub inner_key: String,

    pub outer_key: String,

    /// Join table for `ManyToMany` relations.
    #[serde(default)]
    pub pivot: Option<PivotTable>,

    /// Whether the parent's foreign key may be cleared (`HasOne` only).
    #[serde(default = "default_nullable")]
    pub nullable: bool,
}

fn default_nullable() -> bool {
    true
}

impl RelationSchema {
    /// Create a to-one relation with the foreign key on the parent.
    #[must_use]
    pub fn has_one(
        name: impl Into<String>,
        target: impl Into<String>,
        inner_key: impl Into<String>,
        outer_key: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            kind: RelationKind::HasOne,
            target: target.into(),
            inner_key: inner_key.into(),
            outer_key: outer_key.into(),
            pivot: None,
            nullable: true,
        }
    }

    /// Create a to-many relation with the foreign key on the children.
    #[must_use]
    pub fn has_many(
        name: impl Into<String>,
        target: impl Into<String>,
        inner_key: impl Into<String>,
        outer_key: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            kind: RelationKind::HasMany,
            target: target.into(),
            inner_key: inner_key.into(),
            outer_key: outer_key.into(),
            pivot: None,
            nullable: true,
        }
    }

    /// Create a many-to-many relation through a join table.
    #[must_use]
    pub fn many_to_many(
        name: impl Into<String>,
        target: impl Into<String>,
        inner_key: impl Into<String>,
        outer_key: impl Into<String>,
        pivot: PivotTable,
    ) -> Self {
        Self {
            name: name.into(),
            kind: RelationKind::ManyToMany,
            target: target.into(),
            inner_key: inner_key.into(),
            outer_key: outer_key.into(),
            pivot: Some(pivot),
            nullable: true,
        }
    }

    /// Set whether the parent's foreign key may be nulled.
    #[must_use]
    pub fn nullable(mut self, value: bool) -> Self {
        self.nullable = value;
        self
    }

    /// Join table, or a schema error for relations without one.
    pub fn pivot_table(&self) -> Result<&PivotTable> {
        self.pivot.as_ref().ok_or_else(|| {
            Error::Schema(SchemaError {
                kind: SchemaErrorKind::Invalid,
                message: format!("relation '{}' has no pivot table", self.name),
                source: None,
            })
        })
    }
}

/// Metadata of one entity role.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntitySchema {
    /// Role name; filled from the registry key when loaded from JSON.
    #[serde(default)]
    pub role: String,

    /// Database the table lives in; `None` for the default database.
    #[serde(default)]
    pub database: Option<String>,

    pub table: String,

    pub primary_key: String,

    /// Persisted columns. Empty means "every column the entity carries".
    #[serde(default)]
    pub columns: Vec<String>,

    #[serde(default)]
    pub relations: Vec<RelationSchema>,
}

impl EntitySchema {
    #[must_use]
    pub fn new(
        role: impl Into<String>,
        table: impl Into<String>,
        primary_key: impl Into<String>,
    ) -> Self {
        Self {
            role: role.into(),
            database: None,
            table: table.into(),
            primary_key: primary_key.into(),
            columns: Vec::new(),
            relations: Vec::new(),
        }
    }

    #[must_use]
    pub fn database(mut self, database: impl Into<String>) -> Self {
        self.database = Some(database.into());
        self
    }

    #[must_use]
    pub fn columns<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.columns = columns.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn relation(mut self, relation: RelationSchema) -> Self {
        self.relations.push(relation);
        self
    }

    /// Find a relation by name.
    pub fn find_relation(&self, name: &str) -> Option<&RelationSchema> {
        self.relations.iter().find(|r| r.name == name)
    }
}

/// Read-only registry of entity roles.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Schema {
    entities: BTreeMap<String, EntitySchema>,
}

fn identifier_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| match Regex::new(r"^[A-Za-z_][A-Za-z0-9_.]*$") {
            Ok(regex) => Some(regex),
            Err(e) => {
                tracing::warn!(error = %e, "Identifier pattern failed to compile");
                None
            }
        })
        .as_ref()
}

/// Check that a table or column name is a plain identifier.
pub fn is_identifier(name: &str) -> bool {
    identifier_pattern().is_some_and(|pattern| pattern.is_match(name))
}

fn invalid(message: String) -> Error {
    Error::Schema(SchemaError {
        kind: SchemaErrorKind::Invalid,
        message,
        source: None,
    })
}

impl Schema {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) an entity role.
    #[must_use]
    pub fn define(mut self, entity: EntitySchema) -> Self {
        self.entities.insert(entity.role.clone(), entity);
        self
    }

    /// Parse a schema from JSON keyed by role.
    pub fn from_json(json: &str) -> Result<Self> {
        let mut entities: BTreeMap<String, EntitySchema> = serde_json::from_str(json)?;
        for (role, entity) in &mut entities {
            if entity.role.is_empty() {
                entity.role.clone_from(role);
            }
        }
        Ok(Self { entities })
    }

    pub fn entity(&self, role: &str) -> Result<&EntitySchema> {
        self.entities
            .get(role)
            .ok_or_else(|| Error::unknown_role(role))
    }

    pub fn relation(&self, role: &str, name: &str) -> Result<&RelationSchema> {
        self.entity(role)?
            .find_relation(name)
            .ok_or_else(|| Error::unknown_relation(role, name))
    }

    pub fn contains(&self, role: &str) -> bool {
        self.entities.contains_key(role)
    }

    pub fn roles(&self) -> impl Iterator<Item = &str> {
        self.entities.keys().map(String::as_str)
    }

    /// Check that identifiers are well formed, relation targets exist and
    /// only many-to-many relations declare a join table.
    pub fn validate(&self) -> Result<()> {
        let check = |what: &str, name: &str| -> Result<()> {
            if is_identifier(name) {
                Ok(())
            } else {
                Err(invalid(format!("invalid {what} identifier '{name}'")))
            }
        };

        for (role, entity) in &self.entities {
            if role != &entity.role {
                return Err(invalid(format!(
                    "entity registered as '{role}' declares role '{}'",
                    entity.role
                )));
            }
            check("table", &entity.table)?;
            check("column", &entity.primary_key)?;
            for relation in &entity.relations {
                check("column", &relation.inner_key)?;
                check("column", &relation.outer_key)?;
                if !self.entities.contains_key(&relation.target) {
                    return Err(invalid(format!(
                        "relation '{role}.{}' targets unknown role '{}'",
                        relation.name, relation.target
                    )));
                }
                match (relation.kind, &relation.pivot) {
                    (RelationKind::ManyToMany, None) => {
                        return Err(invalid(format!(
                            "many-to-many relation '{role}.{}' needs a pivot table",
                            relation.name
                        )));
                    }
                    (RelationKind::ManyToMany, Some(pivot)) => {
                        check("table", &pivot.table)?;
                        check("column", &pivot.inner_key)?;
                        check("column", &pivot.outer_key)?;
                    }
                    (_, Some(_)) => {
                        return Err(invalid(format!(
                            "relation '{role}.{}' is not many-to-many but declares a pivot table",
                            relation.name
                        )));
                    }
                    (_, None) => {}
                }
            }
        }
        Ok(())
    }
}
