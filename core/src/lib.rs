//! Core types for the roost object-relational layer.
//!
//! This crate is storage-agnostic. It defines:
//!
//! - [`Value`]: a scalar database cell with lossy cross-type reads and SQL
//!   literal encoding.
//! - [`FromValue`] and the `From<T> for Value` conversions, plus the
//!   [`value_enum!`] macro for enums with a raw representation.
//! - [`Row`] and [`PrimaryKey`]: generic materialized rows and key tuples.
//! - [`TableDefinition`]: the validated schema descriptor a model declares.
//! - [`Model`] and [`ColumnRef`]: the typed row codec and column tokens.
//! - [`Predicate`], [`Query`], [`Assignments`]: structured queries compiled
//!   to parameterized SQL.
//! - [`ChangeRecord`]: the merged description of one table's changes in one
//!   commit.
//!
//! The SQLite-backed database lives in the `roost-sqlite` crate.

mod change;
mod convert;
mod model;
mod query;
mod row;
mod table;
mod value;

pub use change::{ChangeRecord, ColumnSet, KeySet};
pub use convert::FromValue;
pub use model::{ColumnRef, DecodeError, Model};
pub use query::{
    Assignments, OrderBy, Predicate, Query, UpdateTarget, placeholders, quote_identifier,
};
pub use row::{PrimaryKey, Row};
pub use table::{
    Column, ColumnDefault, ColumnType, DefinitionError, FullTextIndex, Index, TableDefinition,
    TableDefinitionBuilder,
};
pub use value::{Value, ValueError};
