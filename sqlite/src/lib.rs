//! SQLite-backed object store for [`roost_core`] models.
//!
//! A [`Database`] owns one connection, driven by a dedicated executor thread
//! that runs every operation in submission order. On top of that it keeps
//! declared tables in sync with their [`TableDefinition`]s, caches rows and
//! query results per table, and tells subscribers exactly which keys and
//! columns each commit changed.
//!
//! # Architecture
//!
//! - **`executor`** / **`session`**: the serial executor and the
//!   connection state it owns (transactions, pending changes, resolution
//!   memo)
//! - **`schema`**: DDL generation and catalog introspection
//! - **`migration`**: the reconciler that plans and applies schema changes
//! - **`tracker`**: change accumulation and listener delivery
//! - **`cache`**: per-table LRU of rows and query results
//! - **`model`**: typed model operations
//! - **`convert`**: argument binding and row materialization
//!
//! # Quick start
//!
//! ```no_run
//! # use std::sync::LazyLock;
//! # use roost_core::{Column, ColumnRef, DecodeError, Model, Row, TableDefinition};
//! # #[derive(Debug, Clone)]
//! # struct Post { id: i64, title: String }
//! # impl Post { const TITLE: ColumnRef<Post> = ColumnRef::new("title"); }
//! # static POSTS: LazyLock<TableDefinition> = LazyLock::new(|| {
//! #     TableDefinition::builder("posts")
//! #         .column(Column::integer("id"))
//! #         .column(Column::text("title"))
//! #         .build()
//! #         .expect("valid posts table")
//! # });
//! # impl Model for Post {
//! #     fn table() -> &'static TableDefinition { &POSTS }
//! #     fn encode(&self) -> Row { Row::new().with("id", self.id).with("title", self.title.as_str()) }
//! #     fn decode(row: &Row) -> Result<Self, DecodeError> {
//! #         Ok(Self { id: row.decode("id")?, title: row.decode("title")? })
//! #     }
//! # }
//! # async fn demo() -> roost_sqlite::Result<()> {
//! use roost_core::{Assignments, UpdateTarget};
//! use roost_sqlite::Database;
//!
//! let db = Database::open("blog.db")?;
//! let mut changes = db.subscribe("posts");
//!
//! db.write(&Post { id: 1, title: "a".into() }).await?;
//! db.update(
//!     Assignments::new().set(Post::TITLE, "b"),
//!     UpdateTarget::Matching(Post::TITLE.eq("a")),
//! )
//! .await?;
//!
//! let post: Option<Post> = db.read(1).await?;
//! while let Some(change) = changes.try_recv() {
//!     println!("{} changed: {:?}", change.table, change.columns);
//! }
//! # let _ = post;
//! db.close().await
//! # }
//! ```
//!
//! [`TableDefinition`]: roost_core::TableDefinition

mod cache;
mod config;
mod convert;
mod database;
mod error;
mod executor;
mod migration;
mod model;
mod schema;
mod session;
mod tracker;
mod transaction;

pub use cache::CacheStats;
pub use config::{DatabaseOptions, DebugLogging, JournalMode};
pub use convert::Arguments;
pub use database::Database;
pub use error::{Result, SchemaError, SqliteError};
pub use migration::{MigrationPlan, MigrationStep};
pub use schema::{LiveColumn, LiveIndex, LiveSchema};
pub use tracker::ChangeSubscription;
pub use transaction::{Completion, Transaction, TransactionResult};
