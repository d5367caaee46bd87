//! Explicit transactions.
//!
//! A transaction body runs on the executor thread as a single job, so every
//! operation inside it is synchronous and nothing else touches the
//! connection until the body returns. Reads inside a transaction bypass the
//! cache; changes are published only when the outermost transaction commits.

use roost_core::{Assignments, ColumnRef, Model, Predicate, PrimaryKey, Query, Row, UpdateTarget};

use crate::convert::Arguments;
use crate::error::Result;
use crate::migration::MigrationPlan;
use crate::model::{self, CachedRead};
use crate::session::Session;

/// How a cancellable transaction body ends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Completion<R> {
    /// Commit and return the value.
    Commit(R),
    /// Roll back every change made by the body.
    Cancel,
}

/// Outcome of a cancellable transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransactionResult<R> {
    Committed(R),
    RolledBack,
}

impl<R> TransactionResult<R> {
    pub fn is_committed(&self) -> bool {
        matches!(self, Self::Committed(_))
    }

    /// The committed value, if any.
    pub fn into_committed(self) -> Option<R> {
        match self {
            Self::Committed(value) => Some(value),
            Self::RolledBack => None,
        }
    }
}

/// An open transaction. Obtained from
/// [`Database::transaction`](crate::Database::transaction).
pub struct Transaction<'a> {
    session: &'a mut Session,
}

impl<'a> Transaction<'a> {
    pub(crate) fn new(session: &'a mut Session) -> Self {
        Self { session }
    }

    /// Runs `body` in a new transaction: commits when it returns `Ok`, rolls
    /// back when it returns `Err`.
    pub(crate) fn run<R>(session: &mut Session, body: impl FnOnce(&mut Transaction<'_>) -> Result<R>) -> Result<R> {
        session.begin()?;
        match body(&mut Transaction::new(session)) {
            Ok(value) => {
                session.commit()?;
                Ok(value)
            }
            Err(err) => {
                session.rollback();
                Err(err)
            }
        }
    }

    /// Like [`run`](Self::run), but the body may also cancel.
    pub(crate) fn run_cancellable<R>(
        session: &mut Session,
        body: impl FnOnce(&mut Transaction<'_>) -> Result<Completion<R>>,
    ) -> Result<TransactionResult<R>> {
        session.begin()?;
        match body(&mut Transaction::new(session)) {
            Ok(Completion::Commit(value)) => {
                session.commit()?;
                Ok(TransactionResult::Committed(value))
            }
            Ok(Completion::Cancel) => {
                session.rollback();
                Ok(TransactionResult::RolledBack)
            }
            Err(err) => {
                session.rollback();
                Err(err)
            }
        }
    }

    /// Runs `body` as part of this transaction. Its changes commit or roll
    /// back with the outermost transaction.
    pub fn transaction<R>(&mut self, body: impl FnOnce(&mut Transaction<'_>) -> Result<R>) -> Result<R> {
        body(&mut Transaction::new(self.session))
    }

    /// Runs raw SQL. Every table it modifies is recorded as a whole-table
    /// change.
    pub fn execute(&mut self, sql: &str, args: impl Into<Arguments>) -> Result<usize> {
        self.session.execute_tracked(sql, &args.into())
    }

    /// Runs a raw query. Tables it modifies are recorded the same way as
    /// [`Transaction::execute`].
    pub fn query(&mut self, sql: &str, args: impl Into<Arguments>) -> Result<Vec<Row>> {
        self.session.query_tracked(sql, &args.into())
    }

    pub fn read<M: Model>(&mut self, key: impl Into<PrimaryKey>) -> Result<Option<M>> {
        let key = key.into();
        let mut found = model::fetch_by_keys(self.session, M::table(), std::slice::from_ref(&key))?;
        found.remove(&key).map(|row| M::decode(&row)).transpose().map_err(Into::into)
    }

    pub fn read_many<M: Model>(&mut self, keys: &[PrimaryKey], preserve_order: bool) -> Result<Vec<M>> {
        let found = model::fetch_by_keys(self.session, M::table(), keys)?;
        model::decode_all(&model::order_rows(keys, found, preserve_order))
    }

    pub fn read_matching<M: Model>(&mut self, query: impl Into<Query<M>>) -> Result<Vec<M>> {
        let rows = CachedRead::matching(&query.into()).run(self.session)?;
        model::decode_all(&rows)
    }

    /// Rows matching a raw SQL `WHERE` expression.
    pub fn read_where<M: Model>(&mut self, where_sql: &str, args: impl Into<Arguments>) -> Result<Vec<M>> {
        let rows = CachedRead::filtered::<M>(where_sql, args.into()).run(self.session)?;
        model::decode_all(&rows)
    }

    pub fn select<M: Model>(&mut self, columns: &[ColumnRef<M>], query: impl Into<Query<M>>) -> Result<Vec<Row>> {
        CachedRead::selecting(columns, &query.into()).run(self.session)
    }

    pub fn count<M: Model>(&mut self, predicate: Option<Predicate<M>>) -> Result<u64> {
        let rows = CachedRead::counting(predicate.as_ref()).run(self.session)?;
        model::count_from_rows(&rows)
    }

    pub fn search<M: Model>(&mut self, text: &str, limit: usize) -> Result<Vec<M>> {
        let rows = model::search(self.session, M::table(), text, limit)?;
        model::decode_all(&rows)
    }

    pub fn write<M: Model>(&mut self, instance: &M) -> Result<()> {
        model::write_rows(self.session, M::table(), &[instance.encode()])
    }

    pub fn write_all<M: Model>(&mut self, instances: &[M]) -> Result<()> {
        let rows: Vec<Row> = instances.iter().map(Model::encode).collect();
        model::write_rows(self.session, M::table(), &rows)
    }

    /// Deletes `instance` by primary key. Returns `true` if a row was deleted.
    pub fn delete<M: Model>(&mut self, instance: &M) -> Result<bool> {
        let deleted = model::delete_keys(self.session, M::table(), &[instance.primary_key()])?;
        Ok(deleted > 0)
    }

    pub fn delete_keys<M: Model>(&mut self, keys: &[PrimaryKey]) -> Result<usize> {
        model::delete_keys(self.session, M::table(), keys)
    }

    pub fn delete_matching<M: Model>(&mut self, predicate: Predicate<M>) -> Result<usize> {
        model::delete_matching(self.session, &predicate)
    }

    pub fn delete_all<M: Model>(&mut self) -> Result<usize> {
        model::delete_all(self.session, M::table())
    }

    pub fn update<M: Model>(&mut self, assignments: Assignments<M>, target: UpdateTarget<M>) -> Result<usize> {
        model::update(self.session, &assignments, &target)
    }

    /// Reconciles the model's table if this connection has not yet.
    pub fn resolve<M: Model>(&mut self) -> Result<MigrationPlan> {
        self.session.resolve(M::table(), false)
    }

    /// Reconciles the model's table again, even if already resolved.
    pub fn resolve_forced<M: Model>(&mut self) -> Result<MigrationPlan> {
        self.session.resolve(M::table(), true)
    }
}
