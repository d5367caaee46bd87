//! DDL generation and live schema introspection.
//!
//! Everything here is a pure function of a [`TableDefinition`] or a single
//! read of the engine's catalog. Deciding what to change is the job of
//! [`migration`](crate::migration).

use roost_core::{Column, Index, TableDefinition, Value, quote_identifier};
use rusqlite::Connection;

use crate::error::Result;

/// Suffix of the full-text virtual table that shadows a model table.
pub(crate) const FULL_TEXT_SUFFIX: &str = "__fts";

/// Name of the temporary table a rebuild copies into.
pub(crate) fn rebuild_table_name(table: &str) -> String {
    format!("{table}__roost_rebuild")
}

pub(crate) fn full_text_table_name(table: &str) -> String {
    format!("{table}{FULL_TEXT_SUFFIX}")
}

/// Tables managed by the engine or by roost itself, hidden from listings
/// and from change tracking.
pub(crate) fn is_internal_table(name: &str) -> bool {
    const SHADOW_SUFFIXES: [&str; 6] = ["", "_data", "_idx", "_content", "_docsize", "_config"];
    let full_text = SHADOW_SUFFIXES.iter().any(|shadow| {
        name.strip_suffix(shadow)
            .is_some_and(|rest| rest.ends_with(FULL_TEXT_SUFFIX))
    });
    name.starts_with("sqlite_") || full_text || name.ends_with("__roost_rebuild")
}

fn column_sql(column: &Column) -> String {
    let mut sql = format!(
        "{} {}",
        quote_identifier(column.name()),
        column.column_type().sql_name()
    );
    if !column.is_nullable() {
        sql.push_str(" NOT NULL");
    }
    match column.resolved_default() {
        Some(Value::Null) | None => {}
        Some(value) => {
            sql.push_str(" DEFAULT ");
            sql.push_str(&value.to_literal());
        }
    }
    sql
}

/// `CREATE TABLE` for the declared schema under `name`.
pub(crate) fn create_table_sql(definition: &TableDefinition, name: &str) -> String {
    let mut parts: Vec<String> = definition.columns().iter().map(column_sql).collect();
    let key: Vec<String> = definition
        .primary_key()
        .iter()
        .map(|c| quote_identifier(c))
        .collect();
    parts.push(format!("PRIMARY KEY ({})", key.join(", ")));
    format!("CREATE TABLE {} ({})", quote_identifier(name), parts.join(", "))
}

pub(crate) fn add_column_sql(table: &str, column: &Column) -> String {
    format!(
        "ALTER TABLE {} ADD COLUMN {}",
        quote_identifier(table),
        column_sql(column)
    )
}

pub(crate) fn create_index_sql(table: &str, index: &Index) -> String {
    let columns: Vec<String> = index.columns().iter().map(|c| quote_identifier(c)).collect();
    format!(
        "CREATE {}INDEX {} ON {} ({})",
        if index.is_unique() { "UNIQUE " } else { "" },
        quote_identifier(&index.name(table)),
        quote_identifier(table),
        columns.join(", ")
    )
}

pub(crate) fn drop_index_sql(name: &str) -> String {
    format!("DROP INDEX IF EXISTS {}", quote_identifier(name))
}

/// Copies `columns` from `table` into the rebuild table. Non-null targets
/// coalesce `NULL` to their default. Values keep whatever storage class the
/// target column's affinity gives them.
pub(crate) fn copy_rows_sql(definition: &TableDefinition, columns: &[String]) -> String {
    let targets: Vec<String> = columns.iter().map(|c| quote_identifier(c)).collect();
    let sources: Vec<String> = columns
        .iter()
        .map(|name| {
            let quoted = quote_identifier(name);
            match definition.column(name) {
                Some(column) if !column.is_nullable() => match column.resolved_default() {
                    Some(default) if !default.is_null() => {
                        format!("COALESCE({quoted}, {})", default.to_literal())
                    }
                    _ => quoted,
                },
                _ => quoted,
            }
        })
        .collect();
    format!(
        "INSERT INTO {} ({}) SELECT {} FROM {}",
        quote_identifier(&rebuild_table_name(definition.name())),
        targets.join(", "),
        sources.join(", "),
        quote_identifier(definition.name())
    )
}

/// Statements creating the full-text table, its sync triggers, and the
/// initial index build.
pub(crate) fn create_full_text_sql(table: &str, columns: &[&str]) -> Vec<String> {
    let fts = full_text_table_name(table);
    let q_fts = quote_identifier(&fts);
    let q_table = quote_identifier(table);
    let cols: Vec<String> = columns.iter().map(|c| quote_identifier(c)).collect();
    let cols = cols.join(", ");
    let new_values: Vec<String> = columns.iter().map(|c| format!("new.{}", quote_identifier(c))).collect();
    let new_values = new_values.join(", ");
    let old_values: Vec<String> = columns.iter().map(|c| format!("old.{}", quote_identifier(c))).collect();
    let old_values = old_values.join(", ");
    let trigger = |suffix: &str| quote_identifier(&format!("{fts}_{suffix}"));

    vec![
        format!(
            "CREATE VIRTUAL TABLE {q_fts} USING fts5({cols}, content={}, content_rowid='rowid')",
            Value::Text(table.to_string()).to_literal()
        ),
        format!(
            "CREATE TRIGGER {} AFTER INSERT ON {q_table} BEGIN \
             INSERT INTO {q_fts} (rowid, {cols}) VALUES (new.rowid, {new_values}); END",
            trigger("ai")
        ),
        format!(
            "CREATE TRIGGER {} AFTER DELETE ON {q_table} BEGIN \
             INSERT INTO {q_fts} ({q_fts}, rowid, {cols}) VALUES ('delete', old.rowid, {old_values}); END",
            trigger("ad")
        ),
        format!(
            "CREATE TRIGGER {} AFTER UPDATE ON {q_table} BEGIN \
             INSERT INTO {q_fts} ({q_fts}, rowid, {cols}) VALUES ('delete', old.rowid, {old_values}); \
             INSERT INTO {q_fts} (rowid, {cols}) VALUES (new.rowid, {new_values}); END",
            trigger("au")
        ),
        format!("INSERT INTO {q_fts} ({q_fts}) VALUES ('rebuild')"),
    ]
}

pub(crate) fn drop_full_text_sql(table: &str) -> Vec<String> {
    let fts = full_text_table_name(table);
    let mut sql: Vec<String> = ["ai", "ad", "au"]
        .iter()
        .map(|suffix| format!("DROP TRIGGER IF EXISTS {}", quote_identifier(&format!("{fts}_{suffix}"))))
        .collect();
    sql.push(format!("DROP TABLE IF EXISTS {}", quote_identifier(&fts)));
    sql
}

/// A column as the engine reports it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveColumn {
    pub name: String,
    pub declared_type: String,
    pub not_null: bool,
    pub default: Option<String>,
    /// 1-based position in the primary key, 0 if not part of it.
    pub primary_key_ordinal: i64,
}

/// An explicitly created index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveIndex {
    pub name: String,
    pub unique: bool,
    pub columns: Vec<String>,
}

/// The on-disk structure of one table, read for a single reconciliation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveSchema {
    pub columns: Vec<LiveColumn>,
    pub indexes: Vec<LiveIndex>,
}

impl LiveSchema {
    pub fn column(&self, name: &str) -> Option<&LiveColumn> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// Primary-key columns in key order.
    pub fn primary_key(&self) -> Vec<String> {
        let mut key: Vec<&LiveColumn> = self
            .columns
            .iter()
            .filter(|c| c.primary_key_ordinal > 0)
            .collect();
        key.sort_by_key(|c| c.primary_key_ordinal);
        key.into_iter().map(|c| c.name.clone()).collect()
    }
}

pub(crate) fn table_exists(conn: &Connection, name: &str) -> Result<bool> {
    let mut stmt =
        conn.prepare_cached("SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1")?;
    let count: i64 = stmt.query_row([name], |row| row.get(0))?;
    Ok(count > 0)
}

/// Names of user tables, excluding engine and roost internals.
pub(crate) fn list_tables(conn: &Connection) -> Result<Vec<String>> {
    let mut stmt =
        conn.prepare("SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name")?;
    let names = stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(names.into_iter().filter(|n| !is_internal_table(n)).collect())
}

fn live_columns(conn: &Connection, table: &str) -> Result<Vec<LiveColumn>> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", quote_identifier(table)))?;
    let columns = stmt
        .query_map([], |row| {
            Ok(LiveColumn {
                name: row.get(1)?,
                declared_type: row.get(2)?,
                not_null: row.get::<_, i64>(3)? != 0,
                default: row.get(4)?,
                primary_key_ordinal: row.get(5)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(columns)
}

fn live_indexes(conn: &Connection, table: &str) -> Result<Vec<LiveIndex>> {
    let mut stmt = conn.prepare(&format!("PRAGMA index_list({})", quote_identifier(table)))?;
    let listed = stmt
        .query_map([], |row| {
            Ok((
                row.get::<_, String>(1)?,
                row.get::<_, i64>(2)? != 0,
                row.get::<_, String>(3)?,
            ))
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    let mut indexes = Vec::new();
    for (name, unique, origin) in listed {
        // Only indexes created with CREATE INDEX; constraint indexes belong
        // to the table definition itself.
        if origin != "c" {
            continue;
        }
        let mut info = conn.prepare(&format!("PRAGMA index_info({})", quote_identifier(&name)))?;
        let mut columns = info
            .query_map([], |row| Ok((row.get::<_, i64>(0)?, row.get::<_, Option<String>>(2)?)))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        columns.sort_by_key(|(seq, _)| *seq);
        indexes.push(LiveIndex {
            name,
            unique,
            columns: columns.into_iter().filter_map(|(_, c)| c).collect(),
        });
    }
    indexes.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(indexes)
}

/// Reads the live structure of `table`, or `None` if it does not exist.
pub(crate) fn introspect(conn: &Connection, table: &str) -> Result<Option<LiveSchema>> {
    if !table_exists(conn, table)? {
        return Ok(None);
    }
    Ok(Some(LiveSchema {
        columns: live_columns(conn, table)?,
        indexes: live_indexes(conn, table)?,
    }))
}

/// Columns of the live full-text table for `table`, if one exists.
pub(crate) fn live_full_text_columns(conn: &Connection, table: &str) -> Result<Option<Vec<String>>> {
    let fts = full_text_table_name(table);
    if !table_exists(conn, &fts)? {
        return Ok(None);
    }
    Ok(Some(live_columns(conn, &fts)?.into_iter().map(|c| c.name).collect()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn posts() -> TableDefinition {
        TableDefinition::builder("posts")
            .column(Column::integer("id"))
            .column(Column::text("title"))
            .column(Column::text("body").nullable())
            .unique_index(["title"])
            .index(["body", "title"])
            .build()
            .unwrap()
    }

    #[test]
    fn test_create_table_sql() {
        let sql = create_table_sql(&posts(), "posts");
        assert_eq!(
            sql,
            "CREATE TABLE \"posts\" (\"id\" INTEGER NOT NULL DEFAULT 0, \"title\" TEXT NOT NULL DEFAULT '', \
             \"body\" TEXT, PRIMARY KEY (\"id\"))"
        );
    }

    #[test]
    fn test_index_sql() {
        let def = posts();
        assert_eq!(
            create_index_sql("posts", &def.indexes()[0]),
            "CREATE UNIQUE INDEX \"posts+unique+title\" ON \"posts\" (\"title\")"
        );
        assert_eq!(drop_index_sql("a+b"), "DROP INDEX IF EXISTS \"a+b\"");
    }

    #[test]
    fn test_introspection_reads_columns_and_indexes() {
        let conn = Connection::open_in_memory().unwrap();
        let def = posts();
        conn.execute_batch(&create_table_sql(&def, "posts")).unwrap();
        for index in def.indexes() {
            conn.execute_batch(&create_index_sql("posts", index)).unwrap();
        }

        let live = introspect(&conn, "posts").unwrap().unwrap();
        assert_eq!(live.columns.len(), 3);
        assert_eq!(live.primary_key(), ["id"]);
        let title = live.column("title").unwrap();
        assert_eq!(title.declared_type, "TEXT");
        assert!(title.not_null);
        assert!(!live.column("body").unwrap().not_null);

        assert_eq!(live.indexes.len(), 2);
        let composite = live.indexes.iter().find(|i| !i.unique).unwrap();
        assert_eq!(composite.columns, ["body", "title"]);

        assert!(introspect(&conn, "missing").unwrap().is_none());
    }

    #[test]
    fn test_constraint_indexes_are_ignored() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("CREATE TABLE t (a TEXT PRIMARY KEY, b TEXT UNIQUE)").unwrap();
        let live = introspect(&conn, "t").unwrap().unwrap();
        assert!(live.indexes.is_empty());
    }

    #[test]
    fn test_internal_table_names() {
        for name in ["sqlite_sequence", "posts__fts", "posts__fts_data", "posts__fts_config", "posts__roost_rebuild"] {
            assert!(is_internal_table(name), "{name}");
        }
        for name in ["posts", "notes__fts_log", "fts_data", "posts__ftsx"] {
            assert!(!is_internal_table(name), "{name}");
        }

        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("CREATE TABLE \"notes__fts_log\" (x); CREATE TABLE notes (y)").unwrap();
        assert_eq!(list_tables(&conn).unwrap(), ["notes", "notes__fts_log"]);
    }

    #[test]
    fn test_full_text_table_and_listing() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(&create_table_sql(&posts(), "posts")).unwrap();
        for sql in create_full_text_sql("posts", &["body", "title"]) {
            conn.execute_batch(&sql).unwrap();
        }
        conn.execute_batch("INSERT INTO posts (id, title, body) VALUES (1, 'hello', 'world')")
            .unwrap();
        let hits: i64 = conn
            .query_row("SELECT COUNT(*) FROM \"posts__fts\" WHERE \"posts__fts\" MATCH 'world'", [], |r| r.get(0))
            .unwrap();
        assert_eq!(hits, 1);

        assert_eq!(
            live_full_text_columns(&conn, "posts").unwrap(),
            Some(vec!["body".to_string(), "title".to_string()])
        );
        assert_eq!(list_tables(&conn).unwrap(), ["posts"]);

        for sql in drop_full_text_sql("posts") {
            conn.execute_batch(&sql).unwrap();
        }
        assert_eq!(live_full_text_columns(&conn, "posts").unwrap(), None);
    }
}
