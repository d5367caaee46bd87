//! Schema reconciliation.
//!
//! [`plan`] diffs a [`TableDefinition`] against the live catalog and returns
//! the least destructive [`MigrationPlan`] that makes them match; [`apply`]
//! runs it. [`reconcile`] does both inside one savepoint so a failing step
//! leaves the table exactly as it was.
//!
//! Additive changes (new nullable or defaulted columns, new indexes) are
//! applied in place. Anything the engine cannot alter in place (a removed
//! column, a changed type or nullability, a different primary key) forces a
//! rebuild: create the declared table under a temporary name, copy the
//! columns both schemas share, drop the old table and rename the new one.

use std::collections::BTreeSet;

use roost_core::{Column, ColumnType, Index, TableDefinition};
use rusqlite::Connection;
use tracing::{debug, info};

use crate::error::{Result, SchemaError, SqliteError};
use crate::schema::{
    self, LiveSchema, add_column_sql, copy_rows_sql, create_full_text_sql, create_index_sql,
    create_table_sql, drop_full_text_sql, drop_index_sql, rebuild_table_name,
};

const SAVEPOINT: &str = "roost_migration";

/// One DDL-level step of a migration.
#[derive(Debug, Clone, PartialEq)]
pub enum MigrationStep {
    /// The table does not exist yet.
    CreateTable,
    /// Add a declared column missing from the live table.
    AddColumn(Column),
    /// Drop a live index that is not declared (or whose definition changed).
    DropIndex(String),
    /// Create a declared index.
    CreateIndex(Index),
    /// Recreate the table with the declared schema, copying these columns.
    RebuildTable { copied_columns: Vec<String> },
    /// Recreate (or remove) the full-text table and its triggers.
    SyncFullText,
}

/// The ordered steps that reconcile one table.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct MigrationPlan {
    table: String,
    steps: Vec<MigrationStep>,
}

impl MigrationPlan {
    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn steps(&self) -> &[MigrationStep] {
        &self.steps
    }

    /// `true` when the live table already matches.
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// `true` when applying the plan rewrites every row.
    pub fn rebuilds_table(&self) -> bool {
        self.steps
            .iter()
            .any(|s| matches!(s, MigrationStep::RebuildTable { .. }))
    }
}

/// Computes the plan that makes the live table match `definition`.
///
/// # Errors
///
/// [`SchemaError::ColumnRequiresDefault`] when a non-null column without a
/// default would have to be added to an existing table; engine errors from
/// introspection.
pub fn plan(conn: &Connection, definition: &TableDefinition) -> Result<MigrationPlan> {
    let table = definition.name();
    let mut steps = Vec::new();

    let Some(live) = schema::introspect(conn, table)? else {
        steps.push(MigrationStep::CreateTable);
        steps.extend(definition.indexes().iter().cloned().map(MigrationStep::CreateIndex));
        if definition.full_text().is_some() {
            steps.push(MigrationStep::SyncFullText);
        }
        return Ok(MigrationPlan {
            table: table.to_string(),
            steps,
        });
    };

    let mut missing = Vec::new();
    for column in definition.columns() {
        if live.column(column.name()).is_none() {
            if column.resolved_default().is_none() {
                return Err(SchemaError::ColumnRequiresDefault {
                    table: table.to_string(),
                    column: column.name().to_string(),
                }
                .into());
            }
            missing.push(column.clone());
        }
    }

    let rebuild = needs_rebuild(definition, &live);
    if rebuild {
        let copied_columns = definition
            .column_names()
            .filter(|name| live.column(name).is_some())
            .map(String::from)
            .collect();
        steps.push(MigrationStep::RebuildTable { copied_columns });
        steps.extend(definition.indexes().iter().cloned().map(MigrationStep::CreateIndex));
    } else {
        steps.extend(missing.into_iter().map(MigrationStep::AddColumn));
        index_steps(definition, &live, &mut steps);
    }

    let declared_full_text: Option<Vec<String>> = definition
        .full_text()
        .map(|f| f.columns().map(String::from).collect());
    let live_full_text = schema::live_full_text_columns(conn, table)?;
    let full_text_changed = declared_full_text != live_full_text;
    if full_text_changed || (rebuild && declared_full_text.is_some()) {
        steps.push(MigrationStep::SyncFullText);
    }

    Ok(MigrationPlan {
        table: table.to_string(),
        steps,
    })
}

fn needs_rebuild(definition: &TableDefinition, live: &LiveSchema) -> bool {
    if live.primary_key() != definition.primary_key() {
        return true;
    }
    live.columns.iter().any(|live_column| match definition.column(&live_column.name) {
        None => true,
        Some(declared) => {
            ColumnType::from_sql_name(&live_column.declared_type) != Some(declared.column_type())
                || live_column.not_null == declared.is_nullable()
        }
    })
}

fn index_steps(definition: &TableDefinition, live: &LiveSchema, steps: &mut Vec<MigrationStep>) {
    let table = definition.name();
    let declared: Vec<(String, &Index)> = definition
        .indexes()
        .iter()
        .map(|index| (index.name(table), index))
        .collect();
    let matches = |name: &str, unique: bool, columns: &[String]| {
        declared
            .iter()
            .any(|(n, i)| n == name && i.is_unique() == unique && i.columns() == columns)
    };

    let mut kept = BTreeSet::new();
    for index in &live.indexes {
        if matches(&index.name, index.unique, &index.columns) {
            kept.insert(index.name.clone());
        } else {
            steps.push(MigrationStep::DropIndex(index.name.clone()));
        }
    }
    for (name, index) in &declared {
        if !kept.contains(name) {
            steps.push(MigrationStep::CreateIndex((*index).clone()));
        }
    }
}

/// Applies `plan` step by step. Callers wrap this in a savepoint; see
/// [`reconcile`].
pub fn apply(conn: &Connection, definition: &TableDefinition, plan: &MigrationPlan) -> Result<()> {
    let table = definition.name();
    let migration_error = |e: SqliteError| match e {
        SqliteError::Schema(schema) => SqliteError::Schema(schema),
        other => SchemaError::Migration {
            table: table.to_string(),
            message: other.to_string(),
        }
        .into(),
    };

    for step in &plan.steps {
        match step {
            MigrationStep::CreateTable => {
                conn.execute_batch(&create_table_sql(definition, table))
                    .map_err(|e| migration_error(e.into()))?;
            }
            MigrationStep::AddColumn(column) => {
                conn.execute_batch(&add_column_sql(table, column))
                    .map_err(|e| migration_error(e.into()))?;
            }
            MigrationStep::DropIndex(name) => {
                conn.execute_batch(&drop_index_sql(name))
                    .map_err(|e| migration_error(e.into()))?;
            }
            MigrationStep::CreateIndex(index) => {
                conn.execute_batch(&create_index_sql(table, index))
                    .map_err(|e| migration_error(e.into()))?;
            }
            MigrationStep::RebuildTable { copied_columns } => {
                rebuild(conn, definition, copied_columns).map_err(migration_error)?;
            }
            MigrationStep::SyncFullText => {
                sync_full_text(conn, definition).map_err(|e| {
                    SqliteError::from(SchemaError::FullText {
                        table: table.to_string(),
                        message: e.to_string(),
                    })
                })?;
            }
        }
        info!(table, step = ?step, "Applied migration step");
    }
    Ok(())
}

fn rebuild(conn: &Connection, definition: &TableDefinition, copied_columns: &[String]) -> Result<()> {
    let table = definition.name();
    let temporary = rebuild_table_name(table);

    // The old full-text triggers reference the table being replaced.
    for sql in drop_full_text_sql(table) {
        conn.execute_batch(&sql)?;
    }
    conn.execute_batch(&format!(
        "DROP TABLE IF EXISTS {}",
        roost_core::quote_identifier(&temporary)
    ))?;
    conn.execute_batch(&create_table_sql(definition, &temporary))?;
    if !copied_columns.is_empty() {
        let copied = conn.execute(&copy_rows_sql(definition, copied_columns), [])?;
        debug!(table, rows = copied, "Copied rows into rebuilt table");
    }
    conn.execute_batch(&format!(
        "DROP TABLE {}; ALTER TABLE {} RENAME TO {};",
        roost_core::quote_identifier(table),
        roost_core::quote_identifier(&temporary),
        roost_core::quote_identifier(table)
    ))?;
    Ok(())
}

fn sync_full_text(conn: &Connection, definition: &TableDefinition) -> Result<()> {
    let table = definition.name();
    for sql in drop_full_text_sql(table) {
        conn.execute_batch(&sql)?;
    }
    if let Some(full_text) = definition.full_text() {
        let columns: Vec<&str> = full_text.columns().collect();
        for sql in create_full_text_sql(table, &columns) {
            conn.execute_batch(&sql)?;
        }
    }
    Ok(())
}

/// Plans and applies the migration for `definition` inside a savepoint.
///
/// On failure the savepoint is rolled back, so no step of the plan is
/// visible, and the error names the table.
pub fn reconcile(conn: &Connection, definition: &TableDefinition) -> Result<MigrationPlan> {
    let plan = plan(conn, definition)?;
    if plan.is_empty() {
        debug!(table = definition.name(), "Table schema is current");
        return Ok(plan);
    }

    conn.execute_batch(&format!("SAVEPOINT {SAVEPOINT}"))?;
    match apply(conn, definition, &plan) {
        Ok(()) => {
            conn.execute_batch(&format!("RELEASE {SAVEPOINT}"))?;
            Ok(plan)
        }
        Err(err) => {
            conn.execute_batch(&format!("ROLLBACK TO {SAVEPOINT}; RELEASE {SAVEPOINT};"))?;
            Err(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use roost_core::Value;

    fn v1() -> TableDefinition {
        TableDefinition::builder("posts")
            .column(Column::integer("id"))
            .column(Column::text("title"))
            .index(["title"])
            .build()
            .unwrap()
    }

    fn count(conn: &Connection, sql: &str) -> i64 {
        conn.query_row(sql, [], |r| r.get(0)).unwrap()
    }

    #[test]
    fn test_create_plan() {
        let conn = Connection::open_in_memory().unwrap();
        let plan = plan(&conn, &v1()).unwrap();
        assert_eq!(plan.steps()[0], MigrationStep::CreateTable);
        assert!(matches!(plan.steps()[1], MigrationStep::CreateIndex(_)));

        reconcile(&conn, &v1()).unwrap();
        assert!(super::plan(&conn, &v1()).unwrap().is_empty());
    }

    #[test]
    fn test_add_nullable_column_preserves_rows() {
        let conn = Connection::open_in_memory().unwrap();
        reconcile(&conn, &v1()).unwrap();
        conn.execute_batch("INSERT INTO posts VALUES (1, 'a'), (2, 'b')").unwrap();

        let v2 = TableDefinition::builder("posts")
            .column(Column::integer("id"))
            .column(Column::text("title"))
            .column(Column::text("body").nullable())
            .index(["title"])
            .build()
            .unwrap();
        let plan = reconcile(&conn, &v2).unwrap();
        assert_eq!(plan.steps().len(), 1);
        assert!(matches!(&plan.steps()[0], MigrationStep::AddColumn(c) if c.name() == "body"));
        assert_eq!(count(&conn, "SELECT COUNT(*) FROM posts WHERE body IS NULL"), 2);
        let title: String = conn
            .query_row("SELECT title FROM posts WHERE id = 2", [], |r| r.get(0))
            .unwrap();
        assert_eq!(title, "b");
    }

    #[test]
    fn test_non_null_column_without_default_is_rejected() {
        let conn = Connection::open_in_memory().unwrap();
        reconcile(&conn, &v1()).unwrap();
        let v2 = TableDefinition::builder("posts")
            .column(Column::integer("id"))
            .column(Column::text("title"))
            .column(Column::integer("rank").without_default())
            .build()
            .unwrap();
        let err = reconcile(&conn, &v2).unwrap_err();
        assert!(matches!(
            err,
            SqliteError::Schema(SchemaError::ColumnRequiresDefault { ref column, .. }) if column == "rank"
        ));
    }

    #[test]
    fn test_uniqueness_change_drops_and_recreates() {
        let conn = Connection::open_in_memory().unwrap();
        reconcile(&conn, &v1()).unwrap();
        let v2 = TableDefinition::builder("posts")
            .column(Column::integer("id"))
            .column(Column::text("title"))
            .unique_index(["title"])
            .build()
            .unwrap();
        let plan = reconcile(&conn, &v2).unwrap();
        assert_eq!(
            plan.steps(),
            [
                MigrationStep::DropIndex("posts+index+title".into()),
                MigrationStep::CreateIndex(Index::new(["title"], true)),
            ]
        );
    }

    #[test]
    fn test_primary_key_change_rebuilds_and_keeps_rows() {
        let conn = Connection::open_in_memory().unwrap();
        reconcile(&conn, &v1()).unwrap();
        conn.execute_batch("INSERT INTO posts VALUES (1, 'a'), (2, 'b')").unwrap();

        let v2 = TableDefinition::builder("posts")
            .column(Column::integer("id"))
            .column(Column::text("title"))
            .primary_key(["title"])
            .build()
            .unwrap();
        let plan = reconcile(&conn, &v2).unwrap();
        assert!(plan.rebuilds_table());
        assert_eq!(count(&conn, "SELECT COUNT(*) FROM posts"), 2);
        let live = schema::introspect(&conn, "posts").unwrap().unwrap();
        assert_eq!(live.primary_key(), ["title"]);
        assert!(live.indexes.is_empty());
        assert!(!schema::table_exists(&conn, &rebuild_table_name("posts")).unwrap());
    }

    #[test]
    fn test_removed_column_and_nullability_change_rebuild() {
        let conn = Connection::open_in_memory().unwrap();
        let wide = TableDefinition::builder("t")
            .column(Column::integer("id"))
            .column(Column::text("keep").nullable())
            .column(Column::real("gone"))
            .build()
            .unwrap();
        reconcile(&conn, &wide).unwrap();
        conn.execute_batch("INSERT INTO t VALUES (1, NULL, 1.5)").unwrap();

        let narrow = TableDefinition::builder("t")
            .column(Column::integer("id"))
            .column(Column::text("keep").default_value("dflt"))
            .build()
            .unwrap();
        let plan = reconcile(&conn, &narrow).unwrap();
        assert_eq!(
            plan.steps()[0],
            MigrationStep::RebuildTable {
                copied_columns: vec!["id".into(), "keep".into()]
            }
        );
        let keep: String = conn.query_row("SELECT keep FROM t", [], |r| r.get(0)).unwrap();
        assert_eq!(keep, "dflt");
        assert!(schema::introspect(&conn, "t").unwrap().unwrap().column("gone").is_none());
    }

    #[test]
    fn test_type_change_copies_through_affinity() {
        let conn = Connection::open_in_memory().unwrap();
        let text = TableDefinition::builder("t")
            .column(Column::integer("id"))
            .column(Column::text("n"))
            .build()
            .unwrap();
        reconcile(&conn, &text).unwrap();
        conn.execute_batch("INSERT INTO t VALUES (1, '42'), (2, 'x')").unwrap();

        let int = TableDefinition::builder("t")
            .column(Column::integer("id"))
            .column(Column::integer("n"))
            .build()
            .unwrap();
        reconcile(&conn, &int).unwrap();
        let kinds: Vec<String> = conn
            .prepare("SELECT typeof(n) FROM t ORDER BY id")
            .unwrap()
            .query_map([], |r| r.get(0))
            .unwrap()
            .collect::<std::result::Result<_, _>>()
            .unwrap();
        assert_eq!(kinds, ["integer", "text"]);
    }

    #[test]
    fn test_failed_rebuild_rolls_back() {
        let conn = Connection::open_in_memory().unwrap();
        reconcile(&conn, &v1()).unwrap();
        conn.execute_batch("INSERT INTO posts VALUES (1, 'same'), (2, 'same')").unwrap();

        let keyed_by_title = TableDefinition::builder("posts")
            .column(Column::integer("id"))
            .column(Column::text("title"))
            .primary_key(["title"])
            .build()
            .unwrap();
        let err = reconcile(&conn, &keyed_by_title).unwrap_err();
        assert!(matches!(err, SqliteError::Schema(SchemaError::Migration { ref table, .. }) if table == "posts"));

        let live = schema::introspect(&conn, "posts").unwrap().unwrap();
        assert_eq!(live.primary_key(), ["id"]);
        assert_eq!(live.indexes.len(), 1);
        assert_eq!(count(&conn, "SELECT COUNT(*) FROM posts"), 2);
    }

    #[test]
    fn test_full_text_sync() {
        let conn = Connection::open_in_memory().unwrap();
        reconcile(&conn, &v1()).unwrap();
        conn.execute_batch("INSERT INTO posts VALUES (1, 'hello world')").unwrap();

        let searchable = TableDefinition::builder("posts")
            .column(Column::integer("id"))
            .column(Column::text("title"))
            .index(["title"])
            .full_text("title", 1.0)
            .build()
            .unwrap();
        let plan = reconcile(&conn, &searchable).unwrap();
        assert_eq!(plan.steps(), [MigrationStep::SyncFullText]);
        assert_eq!(
            count(&conn, "SELECT COUNT(*) FROM posts__fts WHERE posts__fts MATCH 'hello'"),
            1
        );
        assert!(super::plan(&conn, &searchable).unwrap().is_empty());

        let plan = reconcile(&conn, &v1()).unwrap();
        assert_eq!(plan.steps(), [MigrationStep::SyncFullText]);
        assert!(schema::live_full_text_columns(&conn, "posts").unwrap().is_none());
    }

    #[test]
    fn test_defaults_fill_added_columns() {
        let conn = Connection::open_in_memory().unwrap();
        reconcile(&conn, &v1()).unwrap();
        conn.execute_batch("INSERT INTO posts VALUES (1, 'a')").unwrap();
        let v2 = TableDefinition::builder("posts")
            .column(Column::integer("id"))
            .column(Column::text("title"))
            .column(Column::integer("views"))
            .column(Column::real("score").default_value(Value::Real(2.5)))
            .index(["title"])
            .build()
            .unwrap();
        reconcile(&conn, &v2).unwrap();
        let (views, score): (i64, f64) = conn
            .query_row("SELECT views, score FROM posts", [], |r| Ok((r.get(0)?, r.get(1)?)))
            .unwrap();
        assert_eq!(views, 0);
        assert_eq!(score, 2.5);
    }
}
