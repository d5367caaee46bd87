//! Declared table structure.
//!
//! A [`TableDefinition`] is the schema descriptor a model type hands to the
//! storage layer: ordered columns, the primary key, secondary indexes and an
//! optional full-text index. It can only be obtained through
//! [`TableDefinitionBuilder::build`], which rejects structurally invalid
//! declarations, so every definition in circulation is consistent.
//!
//! # Examples
//!
//! ```
//! use roost_core::{Column, TableDefinition};
//!
//! let posts = TableDefinition::builder("posts")
//!     .column(Column::integer("id"))
//!     .column(Column::text("title"))
//!     .column(Column::text("body").nullable())
//!     .index(["title"])
//!     .full_text("title", 10.0)
//!     .full_text("body", 1.0)
//!     .build()
//!     .unwrap();
//!
//! assert_eq!(posts.primary_key(), ["id"]);
//! assert_eq!(posts.indexes().len(), 1);
//! ```

use std::collections::{BTreeMap, HashSet};

use serde::Serialize;
use thiserror::Error;

use crate::value::Value;

/// Storage type of a declared column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ColumnType {
    /// `INTEGER`
    Integer,
    /// `TEXT`
    Text,
    /// `REAL`
    Real,
    /// `BLOB`
    Blob,
}

impl ColumnType {
    /// The SQL type name used in DDL.
    pub fn sql_name(self) -> &'static str {
        match self {
            ColumnType::Integer => "INTEGER",
            ColumnType::Text => "TEXT",
            ColumnType::Real => "REAL",
            ColumnType::Blob => "BLOB",
        }
    }

    /// Parses a live declared type name (case-insensitive).
    pub fn from_sql_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_uppercase().as_str() {
            "INTEGER" | "INT" => Some(ColumnType::Integer),
            "TEXT" => Some(ColumnType::Text),
            "REAL" | "DOUBLE" | "FLOAT" => Some(ColumnType::Real),
            "BLOB" => Some(ColumnType::Blob),
            _ => None,
        }
    }

    /// The zero value used when a non-null column needs a default.
    pub fn zero_value(self) -> Value {
        match self {
            ColumnType::Integer => Value::Integer(0),
            ColumnType::Text => Value::Text(String::new()),
            ColumnType::Real => Value::Real(0.0),
            ColumnType::Blob => Value::Blob(Vec::new()),
        }
    }
}

/// How a column's default is determined when existing rows need a value.
#[derive(Debug, Clone, PartialEq, Serialize, Default)]
pub enum ColumnDefault {
    /// The type's zero value for non-null columns, `NULL` otherwise.
    #[default]
    Derived,
    /// A fixed value.
    Explicit(Value),
    /// No default. A non-null column without default cannot be added to a
    /// table that already exists.
    None,
}

/// A declared column.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Column {
    name: String,
    column_type: ColumnType,
    nullable: bool,
    default: ColumnDefault,
}

impl Column {
    /// A non-null column of the given type.
    pub fn new(name: impl Into<String>, column_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            column_type,
            nullable: false,
            default: ColumnDefault::Derived,
        }
    }

    pub fn integer(name: impl Into<String>) -> Self {
        Self::new(name, ColumnType::Integer)
    }

    pub fn text(name: impl Into<String>) -> Self {
        Self::new(name, ColumnType::Text)
    }

    pub fn real(name: impl Into<String>) -> Self {
        Self::new(name, ColumnType::Real)
    }

    pub fn blob(name: impl Into<String>) -> Self {
        Self::new(name, ColumnType::Blob)
    }

    /// Allows `NULL` in this column.
    pub fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }

    /// Sets an explicit default value.
    pub fn default_value(mut self, value: impl Into<Value>) -> Self {
        self.default = ColumnDefault::Explicit(value.into());
        self
    }

    /// Removes the derived default.
    pub fn without_default(mut self) -> Self {
        self.default = ColumnDefault::None;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn column_type(&self) -> ColumnType {
        self.column_type
    }

    pub fn is_nullable(&self) -> bool {
        self.nullable
    }

    pub fn default_policy(&self) -> &ColumnDefault {
        &self.default
    }

    /// The value existing rows receive when this column appears, if any.
    ///
    /// Nullable columns without an explicit default resolve to `NULL`.
    pub fn resolved_default(&self) -> Option<Value> {
        match &self.default {
            ColumnDefault::Explicit(v) => Some(v.clone()),
            ColumnDefault::Derived if self.nullable => Some(Value::Null),
            ColumnDefault::Derived => Some(self.column_type.zero_value()),
            ColumnDefault::None if self.nullable => Some(Value::Null),
            ColumnDefault::None => None,
        }
    }
}

/// A secondary index over one or more columns.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct Index {
    columns: Vec<String>,
    unique: bool,
}

impl Index {
    pub fn new<I, S>(columns: I, unique: bool) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            columns: columns.into_iter().map(Into::into).collect(),
            unique,
        }
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn is_unique(&self) -> bool {
        self.unique
    }

    /// Deterministic index name derived from the table, columns and
    /// uniqueness, so a uniqueness change yields a different name.
    pub fn name(&self, table: &str) -> String {
        let kind = if self.unique { "unique" } else { "index" };
        format!("{table}+{kind}+{}", self.columns.join("+"))
    }
}

/// Full-text search configuration: indexed text columns and their rank
/// weights.
#[derive(Debug, Clone, PartialEq, Serialize, Default)]
pub struct FullTextIndex {
    weights: BTreeMap<String, f64>,
}

impl FullTextIndex {
    pub fn columns(&self) -> impl Iterator<Item = &str> {
        self.weights.keys().map(String::as_str)
    }

    pub fn weights(&self) -> &BTreeMap<String, f64> {
        &self.weights
    }

    pub fn is_empty(&self) -> bool {
        self.weights.is_empty()
    }
}

/// Structural errors in a table declaration. These are programming errors:
/// fix the declaration rather than handling them at runtime.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DefinitionError {
    #[error("table name cannot be empty")]
    EmptyTableName,
    #[error("table '{0}' declares no columns")]
    NoColumns(String),
    #[error("table '{table}' declares column '{column}' more than once")]
    DuplicateColumn { table: String, column: String },
    #[error("table '{table}': primary key column '{column}' is not declared")]
    UnknownPrimaryKeyColumn { table: String, column: String },
    #[error("table '{table}': index column '{column}' is not declared")]
    UnknownIndexColumn { table: String, column: String },
    #[error("table '{table}': index on ({columns}) is declared more than once")]
    DuplicateIndex { table: String, columns: String },
    #[error("table '{table}': full-text column '{column}' must be a declared text column")]
    InvalidFullTextColumn { table: String, column: String },
}

/// A validated table declaration.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TableDefinition {
    name: String,
    columns: Vec<Column>,
    primary_key: Vec<String>,
    indexes: Vec<Index>,
    full_text: Option<FullTextIndex>,
}

impl TableDefinition {
    /// Starts a declaration for `name`.
    pub fn builder(name: impl Into<String>) -> TableDefinitionBuilder {
        TableDefinitionBuilder {
            name: name.into(),
            columns: Vec::new(),
            primary_key: None,
            indexes: Vec::new(),
            full_text: BTreeMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|c| c.name.as_str())
    }

    pub fn primary_key(&self) -> &[String] {
        &self.primary_key
    }

    pub fn is_primary_key_column(&self, name: &str) -> bool {
        self.primary_key.iter().any(|c| c == name)
    }

    pub fn indexes(&self) -> &[Index] {
        &self.indexes
    }

    pub fn full_text(&self) -> Option<&FullTextIndex> {
        self.full_text.as_ref()
    }
}

/// Builder for [`TableDefinition`].
#[derive(Debug, Clone)]
pub struct TableDefinitionBuilder {
    name: String,
    columns: Vec<Column>,
    primary_key: Option<Vec<String>>,
    indexes: Vec<Index>,
    full_text: BTreeMap<String, f64>,
}

impl TableDefinitionBuilder {
    pub fn column(mut self, column: Column) -> Self {
        self.columns.push(column);
        self
    }

    /// Sets the primary-key columns. Defaults to `["id"]`.
    pub fn primary_key<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.primary_key = Some(columns.into_iter().map(Into::into).collect());
        self
    }

    /// Adds a non-unique index.
    pub fn index<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.indexes.push(Index::new(columns, false));
        self
    }

    /// Adds a unique index.
    pub fn unique_index<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.indexes.push(Index::new(columns, true));
        self
    }

    /// Adds a text column to the full-text index with a rank weight.
    pub fn full_text(mut self, column: impl Into<String>, weight: f64) -> Self {
        self.full_text.insert(column.into(), weight);
        self
    }

    /// Validates and freezes the declaration.
    ///
    /// # Errors
    ///
    /// Returns a [`DefinitionError`] describing the first structural problem.
    pub fn build(self) -> Result<TableDefinition, DefinitionError> {
        let table = self.name;
        if table.trim().is_empty() {
            return Err(DefinitionError::EmptyTableName);
        }
        if self.columns.is_empty() {
            return Err(DefinitionError::NoColumns(table));
        }

        let mut seen = HashSet::new();
        for column in &self.columns {
            if !seen.insert(column.name.as_str()) {
                return Err(DefinitionError::DuplicateColumn {
                    table,
                    column: column.name.clone(),
                });
            }
        }

        let primary_key = self.primary_key.unwrap_or_else(|| vec!["id".to_string()]);
        if let Some(missing) = primary_key.iter().find(|c| !seen.contains(c.as_str())) {
            return Err(DefinitionError::UnknownPrimaryKeyColumn {
                column: missing.clone(),
                table,
            });
        }

        let mut index_sets = HashSet::new();
        for index in &self.indexes {
            if let Some(missing) = index.columns.iter().find(|c| !seen.contains(c.as_str())) {
                return Err(DefinitionError::UnknownIndexColumn {
                    column: missing.clone(),
                    table,
                });
            }
            if !index_sets.insert(index.columns.clone()) {
                return Err(DefinitionError::DuplicateIndex {
                    columns: index.columns.join(", "),
                    table,
                });
            }
        }

        for column in self.full_text.keys() {
            let is_text = self
                .columns
                .iter()
                .any(|c| &c.name == column && c.column_type == ColumnType::Text);
            if !is_text {
                return Err(DefinitionError::InvalidFullTextColumn {
                    column: column.clone(),
                    table,
                });
            }
        }

        let full_text = (!self.full_text.is_empty()).then_some(FullTextIndex {
            weights: self.full_text,
        });

        Ok(TableDefinition {
            name: table,
            columns: self.columns,
            primary_key,
            indexes: self.indexes,
            full_text,
        })
    }
}
