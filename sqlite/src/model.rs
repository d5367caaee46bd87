//! Model operations, run on the executor.
//!
//! Every function here resolves the model's table before touching it, so the
//! first use of a model on a connection reconciles its schema. Writes run
//! atomically (inside the caller's transaction or a fresh one) and report
//! exactly which keys and columns they touched.

use std::collections::{BTreeMap, BTreeSet};

use roost_core::{
    Assignments, ColumnRef, ColumnSet, KeySet, Model, Predicate, PrimaryKey, Query, Row,
    TableDefinition, UpdateTarget, Value, placeholders, quote_identifier,
};

use crate::cache::{self, Cache};
use crate::convert::Arguments;
use crate::error::{Result, SchemaError, SqliteError};
use crate::schema;
use crate::session::Session;

fn table_sql(definition: &TableDefinition) -> String {
    quote_identifier(definition.name())
}

/// Every declared column, optionally qualified with the table name.
fn select_list(definition: &TableDefinition, qualified: bool) -> String {
    let table = table_sql(definition);
    definition
        .column_names()
        .map(|c| match qualified {
            true => format!("{table}.{}", quote_identifier(c)),
            false => quote_identifier(c),
        })
        .collect::<Vec<_>>()
        .join(", ")
}

/// How many keys fit in one statement next to `reserved` other parameters.
pub(crate) fn keys_per_statement(key_len: usize, reserved: usize, max_variables: usize) -> usize {
    (max_variables.saturating_sub(reserved) / key_len.max(1)).max(1)
}

/// `"id" IN (?, ?)`, or `("a", "b") IN (VALUES (?, ?), (?, ?))` for
/// composite keys.
fn key_filter(definition: &TableDefinition, keys: &[PrimaryKey]) -> Result<(String, Vec<Value>)> {
    let key_columns = definition.primary_key();
    let mut args = Vec::with_capacity(keys.len() * key_columns.len());
    for key in keys {
        if key.len() != key_columns.len() {
            return Err(SqliteError::ArgumentBinding(format!(
                "table '{}' has a {}-column primary key, got {key}",
                definition.name(),
                key_columns.len()
            )));
        }
        args.extend(key.values().iter().cloned());
    }

    let sql = if let [column] = key_columns {
        format!("{} IN ({})", quote_identifier(column), placeholders(keys.len()))
    } else {
        let columns: Vec<String> = key_columns.iter().map(|c| quote_identifier(c)).collect();
        let tuple = format!("({})", placeholders(key_columns.len()));
        let tuples = vec![tuple; keys.len()].join(", ");
        format!("({}) IN (VALUES {tuples})", columns.join(", "))
    };
    Ok((sql, args))
}

fn returning_keys(definition: &TableDefinition) -> String {
    definition
        .primary_key()
        .iter()
        .map(|c| quote_identifier(c))
        .collect::<Vec<_>>()
        .join(", ")
}

fn key_set(definition: &TableDefinition, rows: &[Row]) -> KeySet {
    rows.iter().map(|r| r.primary_key(definition.primary_key())).collect()
}

pub(crate) fn decode_all<M: Model>(rows: &[Row]) -> Result<Vec<M>> {
    rows.iter().map(|r| M::decode(r).map_err(Into::into)).collect()
}

// -- reads --------------------------------------------------------------------

/// Reads the rows for `keys`, in chunks that respect the bound-variable
/// limit. Keys with no row are absent from the result.
pub(crate) fn fetch_by_keys(
    session: &mut Session,
    definition: &'static TableDefinition,
    keys: &[PrimaryKey],
) -> Result<BTreeMap<PrimaryKey, Row>> {
    session.resolve(definition, false)?;
    let unique: Vec<PrimaryKey> = keys.iter().cloned().collect::<BTreeSet<_>>().into_iter().collect();
    let per_statement = keys_per_statement(
        definition.primary_key().len(),
        0,
        session.options().max_bound_variables,
    );
    let caching = !session.in_transaction();

    let mut found = BTreeMap::new();
    for chunk in unique.chunks(per_statement) {
        let (filter, args) = key_filter(definition, chunk)?;
        let sql = format!(
            "SELECT {} FROM {} WHERE {filter}",
            select_list(definition, false),
            table_sql(definition)
        );
        for row in session.run_query(&sql, &Arguments::Positional(args))? {
            let key = row.primary_key(definition.primary_key());
            if caching {
                session.shared().cache.store_row(definition.name(), key.clone(), row.clone());
            }
            found.insert(key, row);
        }
    }
    Ok(found)
}

/// Orders fetched rows: in the order of `keys` (one entry per requested key
/// that has a row) or in key order.
pub(crate) fn order_rows(keys: &[PrimaryKey], found: BTreeMap<PrimaryKey, Row>, preserve_order: bool) -> Vec<Row> {
    if !preserve_order {
        return found.into_values().collect();
    }
    keys.iter().filter_map(|key| found.get(key).cloned()).collect()
}

/// Which keys a cached result depends on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ResultKeys {
    /// The primary keys of the returned rows.
    FromRows,
    /// Not derivable from the result; any change to the table matters.
    Unknown,
    /// The result is an aggregate; only column changes matter.
    Empty,
}

/// A read whose result may be served from and stored in the query cache.
#[derive(Debug)]
pub(crate) struct CachedRead {
    definition: &'static TableDefinition,
    sql: String,
    args: Arguments,
    depends_on: ColumnSet,
    keys: ResultKeys,
}

fn depends_on(columns: Option<BTreeSet<String>>) -> ColumnSet {
    columns.map_or(ColumnSet::All, ColumnSet::Columns)
}

impl CachedRead {
    /// Every column of the rows matching `query`.
    pub(crate) fn matching<M: Model>(query: &Query<M>) -> Self {
        let definition = M::table();
        let (clauses, args) = query.clauses();
        Self {
            definition,
            sql: format!(
                "SELECT {} FROM {}{clauses}",
                select_list(definition, false),
                table_sql(definition)
            ),
            args: Arguments::Positional(args),
            depends_on: depends_on(query.dependent_columns()),
            keys: ResultKeys::FromRows,
        }
    }

    /// A projection of the rows matching `query`.
    pub(crate) fn selecting<M: Model>(columns: &[ColumnRef<M>], query: &Query<M>) -> Self {
        let definition = M::table();
        let (clauses, args) = query.clauses();
        let names: Vec<&str> = columns.iter().map(ColumnRef::name).collect();
        let has_key = definition.primary_key().iter().all(|k| names.contains(&k.as_str()));
        let projection = match names.is_empty() {
            true => select_list(definition, false),
            false => names.iter().map(|c| quote_identifier(c)).collect::<Vec<_>>().join(", "),
        };
        Self {
            definition,
            sql: format!("SELECT {projection} FROM {}{clauses}", table_sql(definition)),
            args: Arguments::Positional(args),
            depends_on: depends_on(query.dependent_columns()),
            keys: match has_key || names.is_empty() {
                true => ResultKeys::FromRows,
                false => ResultKeys::Unknown,
            },
        }
    }

    /// Rows matching a raw `WHERE` expression.
    pub(crate) fn filtered<M: Model>(where_sql: &str, args: Arguments) -> Self {
        let definition = M::table();
        Self {
            definition,
            sql: format!(
                "SELECT {} FROM {} WHERE {where_sql}",
                select_list(definition, false),
                table_sql(definition)
            ),
            args,
            depends_on: ColumnSet::All,
            keys: ResultKeys::FromRows,
        }
    }

    /// `COUNT(*)` of the rows matching `predicate`.
    pub(crate) fn counting<M: Model>(predicate: Option<&Predicate<M>>) -> Self {
        let definition = M::table();
        let (filter, args) = match predicate {
            Some(p) => {
                let (expr, args) = p.to_sql();
                (format!(" WHERE {expr}"), args)
            }
            None => (String::new(), Vec::new()),
        };
        Self {
            definition,
            sql: format!("SELECT COUNT(*) AS count FROM {}{filter}", table_sql(definition)),
            args: Arguments::Positional(args),
            depends_on: depends_on(predicate.map(Predicate::columns)),
            keys: ResultKeys::Empty,
        }
    }

    pub(crate) fn table(&self) -> &str {
        self.definition.name()
    }

    pub(crate) fn fingerprint(&self) -> String {
        cache::fingerprint(&self.sql, &self.args)
    }

    pub(crate) fn lookup(&self, cache: &Cache) -> Option<Vec<Row>> {
        cache.lookup_query(self.table(), &self.fingerprint())
    }

    /// Runs the read, storing the result unless a transaction is open.
    pub(crate) fn run(self, session: &mut Session) -> Result<Vec<Row>> {
        session.resolve(self.definition, false)?;
        let rows = session.run_query(&self.sql, &self.args)?;
        if !session.in_transaction() {
            let table = self.definition.name();
            let fingerprint = self.fingerprint();
            let keys = match self.keys {
                ResultKeys::FromRows => key_set(self.definition, &rows),
                ResultKeys::Unknown => KeySet::All,
                ResultKeys::Empty => KeySet::empty(),
            };
            session.shared().cache.store_query(
                table,
                fingerprint,
                rows.clone(),
                keys,
                self.depends_on,
            );
        }
        Ok(rows)
    }
}

pub(crate) fn count_from_rows(rows: &[Row]) -> Result<u64> {
    match rows.first() {
        Some(row) => Ok(row.decode::<u64>("count")?),
        None => Ok(0),
    }
}

/// Full-text search ranked best first. `text` is split on whitespace into
/// terms that must all appear.
pub(crate) fn search(
    session: &mut Session,
    definition: &'static TableDefinition,
    text: &str,
    limit: usize,
) -> Result<Vec<Row>> {
    let Some(full_text) = definition.full_text() else {
        return Err(SchemaError::FullText {
            table: definition.name().to_string(),
            message: "no full-text index is declared".to_string(),
        }
        .into());
    };
    session.resolve(definition, false)?;

    let terms: Vec<String> = text
        .split_whitespace()
        .map(|t| format!("\"{}\"", t.replace('"', "\"\"")))
        .collect();
    if terms.is_empty() || limit == 0 {
        return Ok(Vec::new());
    }

    let fts = quote_identifier(&schema::full_text_table_name(definition.name()));
    let weights: Vec<String> = full_text.weights().values().map(f64::to_string).collect();
    let sql = format!(
        "SELECT {columns} FROM {fts} JOIN {table} ON {table}.rowid = {fts}.rowid \
         WHERE {fts} MATCH ? ORDER BY bm25({fts}, {weights}) LIMIT ?",
        columns = select_list(definition, true),
        table = table_sql(definition),
        weights = weights.join(", "),
    );
    let limit = i64::try_from(limit).unwrap_or(i64::MAX);
    session.run_query(
        &sql,
        &Arguments::positional([Value::from(terms.join(" ")), Value::from(limit)]),
    )
}

// -- writes -------------------------------------------------------------------

fn upsert_sql(definition: &TableDefinition, columns: &[&str]) -> String {
    let names: Vec<String> = columns.iter().map(|c| quote_identifier(c)).collect();
    let conflict = returning_keys(definition);
    let updates: Vec<String> = columns
        .iter()
        .filter(|c| !definition.is_primary_key_column(c))
        .map(|c| {
            let c = quote_identifier(c);
            format!("{c} = excluded.{c}")
        })
        .collect();
    let action = match updates.is_empty() {
        true => "NOTHING".to_string(),
        false => format!("UPDATE SET {}", updates.join(", ")),
    };
    format!(
        "INSERT INTO {} ({}) VALUES ({}) ON CONFLICT ({conflict}) DO {action}",
        table_sql(definition),
        names.join(", "),
        placeholders(columns.len()),
    )
}

/// Inserts or replaces encoded rows.
pub(crate) fn write_rows(session: &mut Session, definition: &'static TableDefinition, rows: &[Row]) -> Result<()> {
    if rows.is_empty() {
        return Ok(());
    }
    session.atomically(|session| {
        session.resolve(definition, false)?;
        let mut keys = BTreeSet::new();
        let mut written = BTreeSet::new();
        for row in rows {
            if let Some(missing) = definition.primary_key().iter().find(|k| row.get(k).is_none()) {
                return Err(SqliteError::ArgumentBinding(format!(
                    "row for '{}' has no value for primary key column '{missing}'",
                    definition.name()
                )));
            }
            let columns: Vec<&str> = row
                .columns()
                .filter(|c| definition.column(c).is_some())
                .collect();
            let values = columns
                .iter()
                .map(|c| row.get(c).cloned().unwrap_or(Value::Null))
                .collect();
            session.run_execute(&upsert_sql(definition, &columns), &Arguments::Positional(values))?;
            keys.insert(row.primary_key(definition.primary_key()));
            written.extend(columns.iter().map(|c| c.to_string()));
        }
        session.record_mutation(definition.name(), KeySet::Keys(keys), ColumnSet::Columns(written));
        Ok(())
    })
}

/// Deletes rows by primary key. Returns the number of rows deleted.
pub(crate) fn delete_keys(
    session: &mut Session,
    definition: &'static TableDefinition,
    keys: &[PrimaryKey],
) -> Result<usize> {
    if keys.is_empty() {
        return Ok(0);
    }
    session.atomically(|session| {
        session.resolve(definition, false)?;
        let per_statement = keys_per_statement(
            definition.primary_key().len(),
            0,
            session.options().max_bound_variables,
        );
        let mut deleted = Vec::new();
        for chunk in keys.chunks(per_statement) {
            let (filter, args) = key_filter(definition, chunk)?;
            let sql = format!(
                "DELETE FROM {} WHERE {filter} RETURNING {}",
                table_sql(definition),
                returning_keys(definition)
            );
            deleted.extend(session.run_query(&sql, &Arguments::Positional(args))?);
        }
        if !deleted.is_empty() {
            session.record_mutation(definition.name(), key_set(definition, &deleted), ColumnSet::All);
        }
        Ok(deleted.len())
    })
}

/// Deletes the rows matching `predicate`.
pub(crate) fn delete_matching<M: Model>(session: &mut Session, predicate: &Predicate<M>) -> Result<usize> {
    let definition = M::table();
    session.atomically(|session| {
        session.resolve(definition, false)?;
        let (expr, args) = predicate.to_sql();
        let sql = format!(
            "DELETE FROM {} WHERE {expr} RETURNING {}",
            table_sql(definition),
            returning_keys(definition)
        );
        let deleted = session.run_query(&sql, &Arguments::Positional(args))?;
        if !deleted.is_empty() {
            session.record_mutation(definition.name(), key_set(definition, &deleted), ColumnSet::All);
        }
        Ok(deleted.len())
    })
}

/// Deletes every row. Recorded as a whole-table change.
pub(crate) fn delete_all(session: &mut Session, definition: &'static TableDefinition) -> Result<usize> {
    session.atomically(|session| {
        session.resolve(definition, false)?;
        let deleted = session.run_execute(
            &format!("DELETE FROM {}", table_sql(definition)),
            &Arguments::none(),
        )?;
        // Recorded whatever count the engine reports.
        session.record_mutation(definition.name(), KeySet::All, ColumnSet::All);
        Ok(deleted)
    })
}

/// Applies `assignments` to the targeted rows. Returns the number of rows
/// updated.
///
/// Assigning a primary-key column moves rows to keys that cannot be listed
/// up front, so such an update is recorded as touching every key.
pub(crate) fn update<M: Model>(
    session: &mut Session,
    assignments: &Assignments<M>,
    target: &UpdateTarget<M>,
) -> Result<usize> {
    let definition = M::table();
    if assignments.is_empty() {
        return Ok(0);
    }
    session.atomically(|session| {
        session.resolve(definition, false)?;
        let (set_sql, set_args) = assignments.to_sql();
        let prefix = format!("UPDATE {} SET {set_sql} WHERE", table_sql(definition));
        let returning = format!("RETURNING {}", returning_keys(definition));

        let mut updated = Vec::new();
        match target {
            UpdateTarget::Matching(predicate) => {
                let (expr, args) = predicate.to_sql();
                let sql = format!("{prefix} {expr} {returning}");
                let all_args = set_args.iter().cloned().chain(args).collect();
                updated.extend(session.run_query(&sql, &Arguments::Positional(all_args))?);
            }
            UpdateTarget::PrimaryKeys(keys) => {
                let per_statement = keys_per_statement(
                    definition.primary_key().len(),
                    set_args.len(),
                    session.options().max_bound_variables,
                );
                for chunk in keys.chunks(per_statement) {
                    let (filter, args) = key_filter(definition, chunk)?;
                    let sql = format!("{prefix} {filter} {returning}");
                    let all_args = set_args.iter().cloned().chain(args).collect();
                    updated.extend(session.run_query(&sql, &Arguments::Positional(all_args))?);
                }
            }
        }

        if updated.is_empty() {
            return Ok(0);
        }
        let moves_keys = definition.primary_key().iter().any(|k| assignments.contains(k));
        let keys = match moves_keys {
            true => KeySet::All,
            false => key_set(definition, &updated),
        };
        session.record_mutation(definition.name(), keys, ColumnSet::Columns(assignments.columns()));
        Ok(updated.len())
    })
}
