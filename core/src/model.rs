//! The typed row codec contract.
//!
//! A model type binds a [`TableDefinition`] to a Rust struct with a pair of
//! pure functions, [`Model::encode`] and [`Model::decode`]. Column tokens
//! ([`ColumnRef`]) are declared next to the codec as associated constants
//! and are the only way to name columns in structured queries, so a
//! predicate for one model cannot reference another model's columns.
//!
//! ```
//! use std::sync::LazyLock;
//! use roost_core::{Column, ColumnRef, DecodeError, Model, PrimaryKey, Row, TableDefinition};
//!
//! #[derive(Debug, Clone, PartialEq)]
//! struct Post {
//!     id: i64,
//!     title: String,
//! }
//!
//! impl Post {
//!     const ID: ColumnRef<Post> = ColumnRef::new("id");
//!     const TITLE: ColumnRef<Post> = ColumnRef::new("title");
//! }
//!
//! static POSTS: LazyLock<TableDefinition> = LazyLock::new(|| {
//!     TableDefinition::builder("posts")
//!         .column(Column::integer("id"))
//!         .column(Column::text("title"))
//!         .build()
//!         .expect("valid posts table")
//! });
//!
//! impl Model for Post {
//!     fn table() -> &'static TableDefinition {
//!         &POSTS
//!     }
//!
//!     fn encode(&self) -> Row {
//!         Row::new().with("id", self.id).with("title", self.title.as_str())
//!     }
//!
//!     fn decode(row: &Row) -> Result<Self, DecodeError> {
//!         Ok(Self { id: row.decode("id")?, title: row.decode("title")? })
//!     }
//! }
//!
//! let post = Post { id: 1, title: "a".into() };
//! assert_eq!(Post::decode(&post.encode()).unwrap(), post);
//! assert_eq!(post.primary_key(), PrimaryKey::from(1_i64));
//! let _predicate = Post::TITLE.eq("a").and(Post::ID.gt(0));
//! ```

use std::fmt;
use std::marker::PhantomData;

use thiserror::Error;

use crate::row::{PrimaryKey, Row};
use crate::table::TableDefinition;

/// Failure converting a [`Row`] into a typed instance.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    /// The row lacks a column the model needs.
    #[error("missing column: {0}")]
    MissingColumn(String),
    /// A value cannot be represented as the requested type.
    #[error("expected {expected}, found {found}")]
    TypeMismatch { expected: &'static str, found: String },
    /// A conversion failed for a specific column.
    #[error("column '{column}': {message}")]
    InColumn { column: String, message: String },
    /// Model-specific validation failure.
    #[error("{0}")]
    Custom(String),
}

impl DecodeError {
    /// Attaches the column name to a conversion error.
    pub fn in_column(self, column: &str) -> Self {
        match self {
            DecodeError::InColumn { .. } | DecodeError::MissingColumn(_) => self,
            other => DecodeError::InColumn {
                column: column.to_string(),
                message: other.to_string(),
            },
        }
    }
}

/// A Rust type stored as rows of one table.
pub trait Model: Sized + Send + Sync + 'static {
    /// The table this model lives in. Built once and shared.
    fn table() -> &'static TableDefinition;

    /// Converts the instance into a row containing every declared column.
    fn encode(&self) -> Row;

    /// Rebuilds an instance from a row.
    fn decode(row: &Row) -> Result<Self, DecodeError>;

    /// The primary key of this instance.
    fn primary_key(&self) -> PrimaryKey {
        self.encode().primary_key(Self::table().primary_key())
    }
}

/// A typed reference to a column of model `M`.
pub struct ColumnRef<M> {
    name: &'static str,
    _model: PhantomData<fn() -> M>,
}

impl<M> ColumnRef<M> {
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            _model: PhantomData,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl<M> Clone for ColumnRef<M> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<M> Copy for ColumnRef<M> {}

impl<M> fmt::Debug for ColumnRef<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ColumnRef").field(&self.name).finish()
    }
}
