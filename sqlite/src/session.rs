//! State owned by the executor thread.
//!
//! A [`Session`] wraps the connection together with everything that must only
//! be touched by one operation at a time: the open-transaction state, the
//! pending change records, and the per-table resolution memo. Callers never
//! see a session directly; they reach it through jobs sent to the
//! [`Executor`](crate::executor::Executor).

use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use roost_core::{ChangeRecord, ColumnSet, KeySet, Row, TableDefinition};
use rusqlite::hooks::Action;
use rusqlite::limits::Limit;
use rusqlite::{Connection, OpenFlags};
use tracing::{debug, warn};

use crate::cache::Cache;
use crate::config::{DatabaseOptions, DebugLogging};
use crate::convert::{self, Arguments};
use crate::error::Result;
use crate::migration::{self, MigrationPlan};
use crate::schema;
use crate::tracker::{ChangeAccumulator, ListenerRegistry};

/// Runtime diagnostics toggles, readable from any thread.
#[derive(Debug, Default)]
pub(crate) struct DebugFlags {
    queries: AtomicBool,
    query_parameters: AtomicBool,
    changes: AtomicBool,
}

impl DebugFlags {
    pub(crate) fn new(initial: DebugLogging) -> Self {
        let flags = Self::default();
        flags.set(initial);
        flags
    }

    pub(crate) fn get(&self) -> DebugLogging {
        DebugLogging {
            queries: self.queries.load(Ordering::Relaxed),
            query_parameters: self.query_parameters.load(Ordering::Relaxed),
            changes: self.changes.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn set(&self, logging: DebugLogging) {
        self.queries.store(logging.queries, Ordering::Relaxed);
        self.query_parameters.store(logging.query_parameters, Ordering::Relaxed);
        self.changes.store(logging.changes, Ordering::Relaxed);
    }
}

/// State shared between the database handle and its executor.
#[derive(Debug)]
pub(crate) struct Shared {
    pub(crate) cache: Cache,
    pub(crate) listeners: Arc<ListenerRegistry>,
    pub(crate) debug: DebugFlags,
    pub(crate) options: DatabaseOptions,
}

impl Shared {
    pub(crate) fn new(options: DatabaseOptions) -> Self {
        Self {
            cache: Cache::new(options.default_cache_limit),
            listeners: Arc::new(ListenerRegistry::default()),
            debug: DebugFlags::new(options.debug),
            options,
        }
    }
}

#[derive(Debug)]
struct OpenTransaction {
    watermark: u64,
    resolved: Vec<String>,
}

/// The connection and its single-writer state.
pub(crate) struct Session {
    conn: Connection,
    shared: Arc<Shared>,
    accumulator: ChangeAccumulator,
    resolved: HashMap<String, MigrationPlan>,
    transaction: Option<OpenTransaction>,
    hooked_tables: Arc<Mutex<BTreeSet<String>>>,
}

impl Session {
    /// Opens the connection described by `path` (in-memory when `None`).
    pub(crate) fn open(path: Option<&Path>, shared: Arc<Shared>) -> Result<Self> {
        let options = &shared.options;
        let conn = match path {
            Some(path) if options.read_only => Connection::open_with_flags(
                path,
                OpenFlags::SQLITE_OPEN_READ_ONLY
                    | OpenFlags::SQLITE_OPEN_URI
                    | OpenFlags::SQLITE_OPEN_NO_MUTEX,
            )?,
            Some(path) => Connection::open(path)?,
            None => Connection::open_in_memory()?,
        };
        conn.busy_timeout(Duration::from_millis(options.busy_timeout_ms))?;
        if path.is_some() && !options.read_only {
            let mode: String = conn.query_row(
                &format!("PRAGMA journal_mode = {}", options.journal_mode.as_str()),
                [],
                |row| row.get(0),
            )?;
            debug!(journal_mode = %mode, "Opened database file");
        }
        conn.set_prepared_statement_cache_capacity(64);
        let max_variables = i32::try_from(options.max_bound_variables).unwrap_or(i32::MAX);
        let _ = conn.set_limit(Limit::SQLITE_LIMIT_VARIABLE_NUMBER, max_variables);

        let hooked_tables = Arc::new(Mutex::new(BTreeSet::new()));
        let sink = Arc::clone(&hooked_tables);
        let _ = conn.update_hook(Some(
            move |_action: Action, _db: &str, table: &str, _rowid: i64| {
                sink.lock().insert(table.to_string());
            },
        ));

        Ok(Self {
            conn,
            shared,
            accumulator: ChangeAccumulator::default(),
            resolved: HashMap::new(),
            transaction: None,
            hooked_tables,
        })
    }

    pub(crate) fn shared(&self) -> &Shared {
        &self.shared
    }

    pub(crate) fn options(&self) -> &DatabaseOptions {
        &self.shared.options
    }

    pub(crate) fn connection(&self) -> &Connection {
        &self.conn
    }

    pub(crate) fn in_transaction(&self) -> bool {
        self.transaction.is_some()
    }

    // -- transactions -------------------------------------------------------

    pub(crate) fn begin(&mut self) -> Result<()> {
        let statement = if self.options().read_only {
            "BEGIN DEFERRED"
        } else {
            "BEGIN IMMEDIATE"
        };
        self.conn.execute_batch(statement)?;
        self.accumulator.clear();
        self.transaction = Some(OpenTransaction {
            watermark: self.shared.listeners.watermark(),
            resolved: Vec::new(),
        });
        Ok(())
    }

    /// Commits, then invalidates the cache and notifies listeners. A failed
    /// commit rolls back.
    pub(crate) fn commit(&mut self) -> Result<()> {
        if let Err(err) = self.conn.execute_batch("COMMIT") {
            self.rollback();
            return Err(err.into());
        }
        let watermark = self
            .transaction
            .take()
            .map_or_else(|| self.shared.listeners.watermark(), |t| t.watermark);
        let records = self.accumulator.take();
        self.publish(&records, watermark);
        Ok(())
    }

    /// Rolls back and discards pending changes. Tables first resolved inside
    /// the transaction go back to unresolved since their migration is undone.
    pub(crate) fn rollback(&mut self) {
        if !self.conn.is_autocommit() {
            if let Err(err) = self.conn.execute_batch("ROLLBACK") {
                warn!(error = %err, "Rollback failed");
            }
        }
        self.accumulator.clear();
        if let Some(transaction) = self.transaction.take() {
            for table in transaction.resolved {
                self.resolved.remove(&table);
            }
        }
    }

    /// Runs `f` inside the open transaction, or inside a new one that is
    /// committed on success and rolled back on error.
    pub(crate) fn atomically<R>(&mut self, f: impl FnOnce(&mut Session) -> Result<R>) -> Result<R> {
        if self.in_transaction() {
            return f(self);
        }
        self.begin()?;
        match f(self) {
            Ok(value) => {
                self.commit()?;
                Ok(value)
            }
            Err(err) => {
                self.rollback();
                Err(err)
            }
        }
    }

    fn publish(&self, records: &[ChangeRecord], watermark: u64) {
        for record in records {
            self.shared.cache.invalidate(record);
        }
        self.shared
            .listeners
            .deliver(records, watermark, self.shared.debug.get().changes);
    }

    // -- change tracking ----------------------------------------------------

    /// Reports a mutation of the open transaction.
    pub(crate) fn record_mutation(&mut self, table: &str, keys: KeySet, columns: ColumnSet) {
        self.accumulator.record(table, keys, columns);
    }

    // -- statements ---------------------------------------------------------

    fn log_statement(&self, sql: &str, args: &Arguments) {
        let flags = self.shared.debug.get();
        if !flags.queries {
            return;
        }
        if flags.query_parameters {
            debug!(sql, args = %args.describe(), "Running statement");
        } else {
            debug!(sql, "Running statement");
        }
    }

    /// Runs one statement without change tracking.
    pub(crate) fn run_execute(&self, sql: &str, args: &Arguments) -> Result<usize> {
        self.log_statement(sql, args);
        let mut stmt = self.conn.prepare_cached(sql)?;
        convert::bind(&mut stmt, args)?;
        Ok(stmt.raw_execute()?)
    }

    /// Runs one query and materializes every row.
    pub(crate) fn run_query(&self, sql: &str, args: &Arguments) -> Result<Vec<Row>> {
        self.log_statement(sql, args);
        let mut stmt = self.conn.prepare_cached(sql)?;
        convert::bind(&mut stmt, args)?;
        convert::collect_rows(&mut stmt)
    }

    fn total_changes(&self) -> Result<i64> {
        Ok(self
            .conn
            .query_row("SELECT total_changes()", [], |row| row.get(0))?)
    }

    fn schema_version(&self) -> Result<i64> {
        Ok(self
            .conn
            .query_row("PRAGMA schema_version", [], |row| row.get(0))?)
    }

    /// Runs arbitrary SQL and records a whole-table change for every table
    /// the engine reports as modified.
    pub(crate) fn execute_tracked(&mut self, sql: &str, args: &Arguments) -> Result<usize> {
        self.tracked(|session| session.run_execute(sql, args))
    }

    /// Runs an arbitrary query. Read-only statements run as they are; a
    /// statement that writes (`UPDATE ... RETURNING` and the like) is
    /// tracked the same way as [`Session::execute_tracked`].
    pub(crate) fn query_tracked(&mut self, sql: &str, args: &Arguments) -> Result<Vec<Row>> {
        if self.conn.prepare_cached(sql)?.readonly() {
            return self.run_query(sql, args);
        }
        self.tracked(|session| session.run_query(sql, args))
    }

    /// Runs `run` atomically and records every table it modified. A
    /// statement that changed rows without any hook report (the engine's
    /// truncate fast path) marks every table.
    fn tracked<R>(&mut self, run: impl FnOnce(&Session) -> Result<R>) -> Result<R> {
        self.atomically(|session| {
            session.hooked_tables.lock().clear();
            let changes_before = session.total_changes()?;
            let schema_before = session.schema_version()?;

            let output = run(session)?;

            let changed = session.total_changes()? > changes_before;
            let touched = std::mem::take(&mut *session.hooked_tables.lock());
            let mut tables: BTreeSet<String> = touched
                .into_iter()
                .filter(|t| !schema::is_internal_table(t))
                .collect();
            if changed && tables.is_empty() {
                tables.extend(schema::list_tables(&session.conn)?);
            }

            if session.schema_version()? != schema_before {
                // DDL outside the reconciler: resolutions may be stale.
                debug!("Schema changed by raw SQL; clearing resolutions");
                tables.extend(session.resolved.drain().map(|(table, _)| table));
            }

            for table in &tables {
                session.accumulator.record_all(table);
            }
            Ok(output)
        })
    }

    // -- schema resolution --------------------------------------------------

    /// Reconciles `definition` with the live table unless that already
    /// happened on this connection. With `force`, reconciles again.
    ///
    /// A rebuild counts as a whole-table change.
    pub(crate) fn resolve(&mut self, definition: &TableDefinition, force: bool) -> Result<MigrationPlan> {
        let table = definition.name();
        if !force && self.resolved.contains_key(table) {
            return Ok(MigrationPlan::default());
        }

        let plan = migration::reconcile(&self.conn, definition)?;
        if !plan.is_empty() {
            let whole_table = ChangeRecord::whole_table(table);
            self.shared.cache.invalidate(&whole_table);
            if plan.rebuilds_table() {
                if self.in_transaction() {
                    self.accumulator.record_all(table);
                } else {
                    self.publish(&[whole_table], self.shared.listeners.watermark());
                }
            }
        }

        if let Some(transaction) = self.transaction.as_mut() {
            transaction.resolved.push(table.to_string());
        }
        self.resolved.insert(table.to_string(), plan.clone());
        Ok(plan)
    }

    pub(crate) fn is_resolved(&self, table: &str) -> bool {
        self.resolved.contains_key(table)
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if self.in_transaction() {
            self.rollback();
        }
        debug!("Closing database connection");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use roost_core::Column;

    fn session() -> Session {
        Session::open(None, Arc::new(Shared::new(DatabaseOptions::default()))).unwrap()
    }

    fn posts() -> TableDefinition {
        TableDefinition::builder("posts")
            .column(Column::integer("id"))
            .column(Column::text("title"))
            .build()
            .unwrap()
    }

    #[test]
    fn test_atomically_rolls_back_on_error() {
        let mut s = session();
        s.resolve(&posts(), false).unwrap();
        let result: Result<()> = s.atomically(|s| {
            s.run_execute("INSERT INTO posts VALUES (1, 'a')", &Arguments::none())?;
            s.run_execute("INSERT INTO posts VALUES (1, 'dup')", &Arguments::none())?;
            Ok(())
        });
        assert!(result.is_err());
        assert!(!s.in_transaction());
        let rows = s.run_query("SELECT * FROM posts", &Arguments::none()).unwrap();
        assert!(rows.is_empty());
    }

    #[test]
    fn test_raw_execute_records_hooked_tables() {
        let mut s = session();
        s.resolve(&posts(), false).unwrap();
        let mut sub = s.shared.listeners.subscribe_all();
        s.execute_tracked("INSERT INTO posts VALUES (1, 'a')", &Arguments::none()).unwrap();
        assert_eq!(sub.drain(), [ChangeRecord::whole_table("posts")]);
    }

    #[test]
    fn test_raw_query_records_writes_only() {
        let mut s = session();
        s.resolve(&posts(), false).unwrap();
        s.run_execute("INSERT INTO posts VALUES (1, 'a')", &Arguments::none()).unwrap();
        let mut sub = s.shared.listeners.subscribe_all();

        let rows = s.query_tracked("SELECT * FROM posts", &Arguments::none()).unwrap();
        assert_eq!(rows.len(), 1);
        assert!(sub.drain().is_empty());
        assert!(!s.in_transaction());

        let rows = s
            .query_tracked("UPDATE posts SET title = 'b' RETURNING id", &Arguments::none())
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(sub.drain(), [ChangeRecord::whole_table("posts")]);
    }

    #[test]
    fn test_variable_limit_follows_options() {
        let options = DatabaseOptions {
            max_bound_variables: 4,
            ..DatabaseOptions::default()
        };
        let s = Session::open(None, Arc::new(Shared::new(options))).unwrap();
        let four = s.run_query("SELECT ?, ?, ?, ?", &Arguments::positional([1, 2, 3, 4]));
        assert!(four.is_ok());
        let five = s.run_query("SELECT ?, ?, ?, ?, ?", &Arguments::positional([1, 2, 3, 4, 5]));
        assert!(five.is_err());
    }

    #[test]
    fn test_truncate_marks_every_table() {
        let mut s = session();
        s.resolve(&posts(), false).unwrap();
        s.execute_tracked("CREATE TABLE other (x)", &Arguments::none()).unwrap();
        s.run_execute("INSERT INTO posts VALUES (1, 'a')", &Arguments::none()).unwrap();

        let mut sub = s.shared.listeners.subscribe_all();
        let affected = s.execute_tracked("DELETE FROM posts", &Arguments::none()).unwrap();
        assert_eq!(affected, 1);
        let tables: Vec<String> = sub.drain().into_iter().map(|r| r.table).collect();
        assert!(tables.contains(&"posts".to_string()));
    }

    #[test]
    fn test_rollback_forgets_resolution() {
        let mut s = session();
        s.begin().unwrap();
        s.resolve(&posts(), false).unwrap();
        assert!(s.is_resolved("posts"));
        s.rollback();
        assert!(!s.is_resolved("posts"));
        assert!(!schema::table_exists(&s.conn, "posts").unwrap());
    }

    #[test]
    fn test_raw_ddl_clears_resolutions() {
        let mut s = session();
        s.resolve(&posts(), false).unwrap();
        s.execute_tracked("DROP TABLE posts", &Arguments::none()).unwrap();
        assert!(!s.is_resolved("posts"));
        assert!(!s.resolve(&posts(), false).unwrap().is_empty());
    }

    #[test]
    fn test_debug_flags_round_trip() {
        let flags = DebugFlags::new(DebugLogging {
            queries: true,
            query_parameters: false,
            changes: true,
        });
        assert!(flags.get().queries);
        flags.set(DebugLogging::default());
        assert_eq!(flags.get(), DebugLogging::default());
    }
}
