//! The serial executor.
//!
//! One dedicated thread owns the [`Session`] and runs submitted jobs strictly
//! in submission order, one at a time. Async callers hand a closure over a
//! channel and await its result on a oneshot. Once the executor is closed,
//! submission fails with [`SqliteError::ConnectionClosed`].

use std::panic::{self, AssertUnwindSafe};
use std::thread::{self, JoinHandle};

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error};

use crate::error::{Result, SqliteError};
use crate::session::Session;

type Job = Box<dyn FnOnce(&mut Session) + Send>;

/// Handle to the executor thread.
pub(crate) struct Executor {
    sender: Mutex<Option<mpsc::UnboundedSender<Job>>>,
    finished: Mutex<Option<oneshot::Receiver<()>>>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Executor {
    /// Moves `session` onto a new thread named `name`.
    pub(crate) fn spawn(session: Session, name: &str) -> Result<Self> {
        let (sender, receiver) = mpsc::unbounded_channel();
        let (finished_tx, finished_rx) = oneshot::channel();

        let thread = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || run(session, receiver, finished_tx))?;

        Ok(Self {
            sender: Mutex::new(Some(sender)),
            finished: Mutex::new(Some(finished_rx)),
            thread: Mutex::new(Some(thread)),
        })
    }

    /// Runs `job` on the executor thread and waits for its result.
    ///
    /// A panic inside `job` rolls back any open transaction and is resumed
    /// on the calling task.
    pub(crate) async fn call<R, F>(&self, job: F) -> Result<R>
    where
        F: FnOnce(&mut Session) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let (reply_tx, reply_rx) = oneshot::channel();
        let boxed: Job = Box::new(move |session: &mut Session| {
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| job(session)));
            if outcome.is_err() && session.in_transaction() {
                error!("Job panicked inside a transaction; rolling back");
                session.rollback();
            }
            let _ = reply_tx.send(outcome);
        });

        let sender = self.sender.lock().clone().ok_or(SqliteError::ConnectionClosed)?;
        sender.send(boxed).map_err(|_| SqliteError::ConnectionClosed)?;

        match reply_rx.await {
            Ok(Ok(result)) => result,
            Ok(Err(payload)) => panic::resume_unwind(payload),
            Err(_) => Err(SqliteError::ConnectionClosed),
        }
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.sender.lock().is_none()
    }

    /// Stops accepting jobs, lets queued jobs finish, and waits until the
    /// connection is closed. Returns `false` if already closed.
    pub(crate) async fn close(&self) -> bool {
        let Some(sender) = self.sender.lock().take() else {
            return false;
        };
        drop(sender);
        let finished = self.finished.lock().take();
        if let Some(finished) = finished {
            let _ = finished.await;
        }
        if let Some(thread) = self.thread.lock().take() {
            let _ = thread.join();
        }
        true
    }
}

impl Drop for Executor {
    fn drop(&mut self) {
        self.sender.lock().take();
        if let Some(handle) = self.thread.lock().take() {
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }
}

fn run(mut session: Session, mut receiver: mpsc::UnboundedReceiver<Job>, finished: oneshot::Sender<()>) {
    debug!("Executor started");
    while let Some(job) = receiver.blocking_recv() {
        job(&mut session);
    }
    drop(session);
    debug!("Executor stopped");
    let _ = finished.send(());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DatabaseOptions;
    use crate::convert::Arguments;
    use crate::session::Shared;
    use std::sync::Arc;

    fn executor() -> Executor {
        let shared = Arc::new(Shared::new(DatabaseOptions::default()));
        Executor::spawn(Session::open(None, shared).unwrap(), "roost-test").unwrap()
    }

    #[tokio::test]
    async fn test_jobs_run_in_submission_order() {
        let executor = executor();
        executor
            .call(|s| s.run_execute("CREATE TABLE log (n INTEGER)", &Arguments::none()))
            .await
            .unwrap();

        let calls: Vec<_> = (0..20)
            .map(|n| executor.call(move |s| s.run_execute("INSERT INTO log VALUES (?)", &Arguments::positional([n]))))
            .collect();
        for call in calls {
            call.await.unwrap();
        }

        let rows = executor
            .call(|s| s.run_query("SELECT n FROM log ORDER BY rowid", &Arguments::none()))
            .await
            .unwrap();
        let order: Vec<i64> = rows.iter().map(|r| r.decode::<i64>("n").unwrap()).collect();
        assert_eq!(order, (0..20).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_calls_after_close_fail() {
        let executor = executor();
        assert!(executor.close().await);
        assert!(executor.is_closed());
        let result = executor.call(|_| Ok(())).await;
        assert!(matches!(result, Err(SqliteError::ConnectionClosed)));
        assert!(!executor.close().await);
    }

    #[tokio::test]
    async fn test_panicking_job_rolls_back() {
        let executor = Arc::new(executor());
        executor
            .call(|s| s.run_execute("CREATE TABLE t (x)", &Arguments::none()))
            .await
            .unwrap();

        let handle = {
            let executor = Arc::clone(&executor);
            tokio::spawn(async move {
                executor
                    .call(|s| -> Result<()> {
                        s.begin()?;
                        s.run_execute("INSERT INTO t VALUES (1)", &Arguments::none())?;
                        panic!("boom");
                    })
                    .await
            })
        };
        assert!(handle.await.is_err());

        let rows = executor
            .call(|s| s.run_query("SELECT * FROM t", &Arguments::none()))
            .await
            .unwrap();
        assert!(rows.is_empty());
    }
}
