//! The database handle.

use std::collections::{BTreeMap, HashSet};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock};

use parking_lot::Mutex;
use roost_core::{Assignments, ColumnRef, Model, Predicate, PrimaryKey, Query, Row, UpdateTarget};
use tracing::{debug, info};

use crate::cache::CacheStats;
use crate::config::{DatabaseOptions, DebugLogging};
use crate::convert::Arguments;
use crate::error::{Result, SqliteError};
use crate::executor::Executor;
use crate::migration::MigrationPlan;
use crate::model::{self, CachedRead};
use crate::schema::{self, LiveSchema};
use crate::session::{Session, Shared};
use crate::tracker::ChangeSubscription;
use crate::transaction::{Completion, Transaction, TransactionResult};

/// Canonical paths of every file-backed database open in this process.
static OPEN_FILES: LazyLock<Mutex<HashSet<PathBuf>>> = LazyLock::new(|| Mutex::new(HashSet::new()));

/// Resolves `path` to an absolute, symlink-free path. The file itself may not
/// exist yet; its directory must.
fn canonical_path(path: &Path) -> Result<PathBuf> {
    if path.exists() {
        return Ok(std::fs::canonicalize(path)?);
    }
    let file_name = path.file_name().ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("not a database file path: {}", path.display()),
        )
    })?;
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    Ok(std::fs::canonicalize(parent)?.join(file_name))
}

/// Exclusive claim on a database file, released on drop.
#[derive(Debug)]
struct FileClaim(PathBuf);

impl FileClaim {
    fn acquire(path: &Path) -> Result<Self> {
        let canonical = canonical_path(path)?;
        if !OPEN_FILES.lock().insert(canonical.clone()) {
            return Err(SqliteError::FileAlreadyOpen(canonical));
        }
        Ok(Self(canonical))
    }
}

impl Drop for FileClaim {
    fn drop(&mut self) {
        OPEN_FILES.lock().remove(&self.0);
    }
}

struct Inner {
    // Field order matters: the executor closes the connection before the
    // file claim is released.
    executor: Executor,
    shared: Arc<Shared>,
    claim: Mutex<Option<FileClaim>>,
    path: Option<PathBuf>,
}

/// A connection to one SQLite database.
///
/// Cloning is cheap; clones share the connection, cache and listeners. All
/// work is serialized on one executor thread, so operations from concurrent
/// tasks run one at a time in submission order.
///
/// ```no_run
/// # async fn demo() -> roost_sqlite::Result<()> {
/// use roost_sqlite::Database;
///
/// let db = Database::open("app.db")?;
/// db.execute("CREATE TABLE IF NOT EXISTS kv (k TEXT PRIMARY KEY, v)", ()).await?;
/// let rows = db.query("SELECT * FROM kv", ()).await?;
/// println!("{} rows", rows.len());
/// db.close().await
/// # }
/// ```
#[derive(Clone)]
pub struct Database {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("path", &self.inner.path)
            .field("closed", &self.inner.executor.is_closed())
            .finish()
    }
}

impl Database {
    /// Opens (creating if needed) the database file at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`SqliteError::FileAlreadyOpen`] if another `Database` in this
    /// process has the same file open.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with_options(path, DatabaseOptions::default())
    }

    pub fn open_with_options(path: impl AsRef<Path>, options: DatabaseOptions) -> Result<Self> {
        let claim = FileClaim::acquire(path.as_ref())?;
        let path = claim.0.clone();
        Self::start(Some(claim), Some(path), options)
    }

    /// Opens a private in-memory database.
    pub fn open_in_memory() -> Result<Self> {
        Self::open_in_memory_with_options(DatabaseOptions::default())
    }

    pub fn open_in_memory_with_options(options: DatabaseOptions) -> Result<Self> {
        Self::start(None, None, options)
    }

    fn start(claim: Option<FileClaim>, path: Option<PathBuf>, options: DatabaseOptions) -> Result<Self> {
        let shared = Arc::new(Shared::new(options));
        let session = Session::open(path.as_deref(), Arc::clone(&shared))?;
        let executor = Executor::spawn(session, "roost-executor")?;
        info!(path = ?path, "Opened database");
        Ok(Self {
            inner: Arc::new(Inner {
                executor,
                shared,
                claim: Mutex::new(claim),
                path,
            }),
        })
    }

    /// Closes the connection after queued operations finish. Every clone of
    /// this handle is closed; later operations fail with
    /// [`SqliteError::ConnectionClosed`] and change subscriptions end.
    /// Closing twice is a no-op.
    pub async fn close(&self) -> Result<()> {
        if !self.inner.executor.close().await {
            return Ok(());
        }
        self.inner.claim.lock().take();
        self.inner.shared.listeners.close();
        info!(path = ?self.inner.path, "Closed database");
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.inner.executor.is_closed()
    }

    /// The canonical database path, or `None` for in-memory databases.
    pub fn path(&self) -> Option<&Path> {
        self.inner.path.as_deref()
    }

    /// The options the database was opened with.
    pub fn options(&self) -> &DatabaseOptions {
        &self.inner.shared.options
    }

    /// Every file the database may use on disk: the main file and its
    /// `-wal`, `-shm` and `-journal` companions. Empty when in memory.
    pub fn file_paths(&self) -> Vec<PathBuf> {
        let Some(path) = &self.inner.path else {
            return Vec::new();
        };
        let mut paths = vec![path.clone()];
        for suffix in ["-wal", "-shm", "-journal"] {
            let mut companion = path.clone().into_os_string();
            companion.push(suffix);
            paths.push(PathBuf::from(companion));
        }
        paths
    }

    async fn call<R, F>(&self, job: F) -> Result<R>
    where
        F: FnOnce(&mut Session) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        self.inner.executor.call(job).await
    }

    // -- raw SQL --------------------------------------------------------------

    /// Runs one SQL statement and returns the number of affected rows. Every
    /// table the statement modifies is reported to listeners as a
    /// whole-table change.
    pub async fn execute(&self, sql: &str, args: impl Into<Arguments>) -> Result<usize> {
        let sql = sql.to_string();
        let args = args.into();
        self.call(move |session| session.execute_tracked(&sql, &args)).await
    }

    /// Runs one query and returns every row. A query that writes, such as
    /// `UPDATE ... RETURNING`, is tracked like [`Database::execute`].
    pub async fn query(&self, sql: &str, args: impl Into<Arguments>) -> Result<Vec<Row>> {
        let sql = sql.to_string();
        let args = args.into();
        self.call(move |session| session.query_tracked(&sql, &args)).await
    }

    // -- transactions ---------------------------------------------------------

    /// Runs `body` in a transaction. Commits when the body returns `Ok`;
    /// rolls back and returns the error otherwise.
    ///
    /// The body runs on the executor thread and blocks every other
    /// operation until it returns, so keep it short.
    pub async fn transaction<R, F>(&self, body: F) -> Result<R>
    where
        F: FnOnce(&mut Transaction<'_>) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        self.call(move |session| Transaction::run(session, body)).await
    }

    /// Runs `body` in a transaction that it may cancel by returning
    /// [`Completion::Cancel`]. A cancelled transaction changes nothing and
    /// notifies no one.
    pub async fn cancellable_transaction<R, F>(&self, body: F) -> Result<TransactionResult<R>>
    where
        F: FnOnce(&mut Transaction<'_>) -> Result<Completion<R>> + Send + 'static,
        R: Send + 'static,
    {
        self.call(move |session| Transaction::run_cancellable(session, body))
            .await
    }

    // -- model reads ----------------------------------------------------------

    async fn cached(&self, read: CachedRead) -> Result<Vec<Row>> {
        if let Some(rows) = read.lookup(&self.inner.shared.cache) {
            return Ok(rows);
        }
        self.call(move |session| read.run(session)).await
    }

    /// Reads one instance by primary key.
    pub async fn read<M: Model>(&self, key: impl Into<PrimaryKey>) -> Result<Option<M>> {
        let key = key.into();
        if let Some(row) = self.inner.shared.cache.lookup_row(M::table().name(), &key) {
            return Ok(Some(M::decode(&row)?));
        }
        self.call(move |session| {
            let mut found = model::fetch_by_keys(session, M::table(), std::slice::from_ref(&key))?;
            found.remove(&key).map(|row| M::decode(&row)).transpose().map_err(Into::into)
        })
        .await
    }

    /// Reads every instance whose key is in `keys`. Missing keys are
    /// skipped. With `preserve_order` the result follows the order of
    /// `keys`; otherwise it is in key order.
    pub async fn read_many<M, I, K>(&self, keys: I, preserve_order: bool) -> Result<Vec<M>>
    where
        M: Model,
        I: IntoIterator<Item = K>,
        K: Into<PrimaryKey>,
    {
        let keys: Vec<PrimaryKey> = keys.into_iter().map(Into::into).collect();
        let cache = &self.inner.shared.cache;
        let table = M::table().name();

        let mut found = BTreeMap::new();
        let mut missing = Vec::new();
        for key in &keys {
            match cache.lookup_row(table, key) {
                Some(row) => {
                    found.insert(key.clone(), row);
                }
                None => missing.push(key.clone()),
            }
        }
        if !missing.is_empty() {
            debug!(table, requested = keys.len(), missing = missing.len(), "Batch read");
            let fetched = self
                .call(move |session| model::fetch_by_keys(session, M::table(), &missing))
                .await?;
            found.extend(fetched);
        }
        model::decode_all(&model::order_rows(&keys, found, preserve_order))
    }

    /// Reads every instance matching `query`.
    pub async fn read_matching<M: Model>(&self, query: impl Into<Query<M>>) -> Result<Vec<M>> {
        let rows = self.cached(CachedRead::matching(&query.into())).await?;
        model::decode_all(&rows)
    }

    /// Reads every instance matching a raw SQL `WHERE` expression.
    pub async fn read_where<M: Model>(&self, where_sql: &str, args: impl Into<Arguments>) -> Result<Vec<M>> {
        let rows = self
            .cached(CachedRead::filtered::<M>(where_sql, args.into()))
            .await?;
        model::decode_all(&rows)
    }

    /// Reads only `columns` of the rows matching `query`. An empty column
    /// list selects every declared column.
    pub async fn select<M: Model>(&self, columns: &[ColumnRef<M>], query: impl Into<Query<M>>) -> Result<Vec<Row>> {
        self.cached(CachedRead::selecting(columns, &query.into())).await
    }

    /// Counts the rows matching `predicate`, or every row.
    pub async fn count<M: Model>(&self, predicate: Option<Predicate<M>>) -> Result<u64> {
        let rows = self.cached(CachedRead::counting(predicate.as_ref())).await?;
        model::count_from_rows(&rows)
    }

    /// Full-text search over the model's declared full-text columns, best
    /// match first.
    pub async fn search<M: Model>(&self, text: &str, limit: usize) -> Result<Vec<M>> {
        let text = text.to_string();
        let rows = self
            .call(move |session| model::search(session, M::table(), &text, limit))
            .await?;
        model::decode_all(&rows)
    }

    // -- model writes ---------------------------------------------------------

    /// Inserts `instance`, replacing any row with the same primary key.
    pub async fn write<M: Model>(&self, instance: &M) -> Result<()> {
        let row = instance.encode();
        self.call(move |session| model::write_rows(session, M::table(), &[row]))
            .await
    }

    /// Writes every instance in one transaction.
    pub async fn write_all<M: Model>(&self, instances: &[M]) -> Result<()> {
        let rows: Vec<Row> = instances.iter().map(Model::encode).collect();
        self.call(move |session| model::write_rows(session, M::table(), &rows))
            .await
    }

    /// Deletes `instance` by primary key. Returns `true` if a row was deleted.
    pub async fn delete<M: Model>(&self, instance: &M) -> Result<bool> {
        let key = instance.primary_key();
        let deleted = self
            .call(move |session| model::delete_keys(session, M::table(), &[key]))
            .await?;
        Ok(deleted > 0)
    }

    /// Deletes the rows with the given primary keys.
    pub async fn delete_keys<M: Model>(&self, keys: Vec<PrimaryKey>) -> Result<usize> {
        self.call(move |session| model::delete_keys(session, M::table(), &keys))
            .await
    }

    pub async fn delete_matching<M: Model>(&self, predicate: Predicate<M>) -> Result<usize> {
        self.call(move |session| model::delete_matching(session, &predicate))
            .await
    }

    pub async fn delete_all<M: Model>(&self) -> Result<usize> {
        self.call(|session| model::delete_all(session, M::table())).await
    }

    /// Applies `assignments` to the rows selected by `target`. Returns the
    /// number of rows updated.
    pub async fn update<M: Model>(&self, assignments: Assignments<M>, target: UpdateTarget<M>) -> Result<usize> {
        self.call(move |session| model::update(session, &assignments, &target))
            .await
    }

    // -- schema ---------------------------------------------------------------

    /// Reconciles the model's table with its declaration unless this
    /// connection already did. Every model operation does this implicitly.
    pub async fn resolve<M: Model>(&self) -> Result<MigrationPlan> {
        self.call(|session| session.resolve(M::table(), false)).await
    }

    /// Reconciles the model's table again.
    pub async fn resolve_forced<M: Model>(&self) -> Result<MigrationPlan> {
        self.call(|session| session.resolve(M::table(), true)).await
    }

    /// Names of the user tables in the database.
    pub async fn list_tables(&self) -> Result<Vec<String>> {
        self.call(|session| schema::list_tables(session.connection()))
            .await
    }

    /// The live structure of `table`, or `None` if it does not exist.
    pub async fn live_schema(&self, table: &str) -> Result<Option<LiveSchema>> {
        let table = table.to_string();
        self.call(move |session| schema::introspect(session.connection(), &table))
            .await
    }

    // -- notifications --------------------------------------------------------

    /// Receives one record per commit that changes `table`. Only commits of
    /// transactions that begin after this call are delivered.
    pub fn subscribe(&self, table: &str) -> ChangeSubscription {
        self.inner.shared.listeners.subscribe(table)
    }

    /// Receives the records of every table.
    pub fn subscribe_all(&self) -> ChangeSubscription {
        self.inner.shared.listeners.subscribe_all()
    }

    // -- cache and diagnostics ------------------------------------------------

    /// Sets how many entries `table` may cache. Zero disables caching for
    /// the table and drops what it holds.
    pub fn set_cache_limit(&self, table: &str, limit: usize) {
        self.inner.shared.cache.set_limit(table, limit);
    }

    pub fn cache_limit(&self, table: &str) -> usize {
        self.inner.shared.cache.limit(table)
    }

    pub fn cache_stats(&self, table: &str) -> CacheStats {
        self.inner.shared.cache.stats(table)
    }

    pub fn reset_cache_stats(&self, table: &str) {
        self.inner.shared.cache.reset_stats(table);
    }

    /// Toggles query, parameter and change logging at runtime.
    pub fn set_debug_logging(&self, logging: DebugLogging) {
        self.inner.shared.debug.set(logging);
    }

    pub fn debug_logging(&self) -> DebugLogging {
        self.inner.shared.debug.get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_canonical_path_of_missing_file() {
        let dir = TempDir::new().unwrap();
        let path = canonical_path(&dir.path().join("new.db")).unwrap();
        assert!(path.is_absolute());
        assert_eq!(path.file_name().unwrap(), "new.db");
    }

    #[test]
    fn test_file_claim_is_exclusive_until_dropped() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("claimed.db");
        let claim = FileClaim::acquire(&path).unwrap();
        assert!(matches!(
            FileClaim::acquire(&path),
            Err(SqliteError::FileAlreadyOpen(_))
        ));
        drop(claim);
        assert!(FileClaim::acquire(&path).is_ok());
    }

    #[tokio::test]
    async fn test_in_memory_has_no_files() {
        let db = Database::open_in_memory().unwrap();
        assert!(db.file_paths().is_empty());
        assert!(db.path().is_none());
    }
}
