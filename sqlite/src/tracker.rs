//! Change tracking and notification.
//!
//! While a transaction is open, every write path reports what it touched to
//! the [`ChangeAccumulator`]. Reports for the same table merge into a single
//! [`ChangeRecord`]. On commit the merged records are handed to the
//! [`ListenerRegistry`], which sends exactly one record per table to every
//! listener that was registered before the transaction began. On rollback
//! the accumulator is simply cleared.

use std::collections::BTreeMap;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use roost_core::{ChangeRecord, ColumnSet, KeySet};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Pending changes of the open transaction, keyed by table.
#[derive(Debug, Default)]
pub(crate) struct ChangeAccumulator {
    pending: BTreeMap<String, ChangeRecord>,
}

impl ChangeAccumulator {
    pub(crate) fn record(&mut self, table: &str, keys: KeySet, columns: ColumnSet) {
        if let KeySet::Keys(k) = &keys {
            if k.is_empty() && !columns.is_all() {
                return;
            }
        }
        let record = ChangeRecord::new(table, keys, columns);
        match self.pending.get_mut(table) {
            Some(existing) => existing.merge(record),
            None => {
                self.pending.insert(table.to_string(), record);
            }
        }
    }

    /// Records a whole-table change of unknown scope.
    pub(crate) fn record_all(&mut self, table: &str) {
        self.record(table, KeySet::All, ColumnSet::All);
    }

    /// Removes and returns every pending record, in table-name order.
    pub(crate) fn take(&mut self) -> Vec<ChangeRecord> {
        std::mem::take(&mut self.pending).into_values().collect()
    }

    pub(crate) fn clear(&mut self) {
        self.pending.clear();
    }

    #[cfg(test)]
    pub(crate) fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

/// Which tables a listener observes.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Scope {
    Table(String),
    Everything,
}

#[derive(Debug)]
struct Listener {
    id: u64,
    scope: Scope,
    sender: mpsc::UnboundedSender<ChangeRecord>,
}

#[derive(Debug, Default)]
struct Listeners {
    last_id: u64,
    entries: Vec<Listener>,
}

/// Registered change listeners. Registration and removal may happen from any
/// thread, concurrently with delivery.
#[derive(Debug, Default)]
pub(crate) struct ListenerRegistry {
    inner: Mutex<Listeners>,
}

impl ListenerRegistry {
    fn register(self: &Arc<Self>, scope: Scope) -> ChangeSubscription {
        let (sender, receiver) = mpsc::unbounded_channel();
        let mut inner = self.inner.lock();
        inner.last_id += 1;
        let id = inner.last_id;
        inner.entries.push(Listener { id, scope, sender });
        debug!(listener = id, "Registered change listener");
        ChangeSubscription {
            id,
            receiver,
            registry: Arc::downgrade(self),
        }
    }

    /// Listens to commits touching `table`.
    pub(crate) fn subscribe(self: &Arc<Self>, table: &str) -> ChangeSubscription {
        self.register(Scope::Table(table.to_string()))
    }

    /// Listens to commits touching any table.
    pub(crate) fn subscribe_all(self: &Arc<Self>) -> ChangeSubscription {
        self.register(Scope::Everything)
    }

    /// The id of the most recently registered listener. A transaction takes
    /// this when it begins; later listeners do not see its commit.
    pub(crate) fn watermark(&self) -> u64 {
        self.inner.lock().last_id
    }

    fn unregister(&self, id: u64) {
        self.inner.lock().entries.retain(|l| l.id != id);
    }

    pub(crate) fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    /// Drops every listener so their streams end.
    pub(crate) fn close(&self) {
        self.inner.lock().entries.clear();
    }

    /// Sends each record to the eligible listeners, dropping listeners whose
    /// receiver is gone.
    pub(crate) fn deliver(&self, records: &[ChangeRecord], watermark: u64, log_changes: bool) {
        if records.is_empty() {
            return;
        }
        let mut inner = self.inner.lock();
        for record in records {
            if log_changes {
                debug!(
                    table = %record.table,
                    keys = ?record.keys,
                    columns = ?record.columns,
                    "Committed change"
                );
            }
            if record.keys.is_all() {
                warn!(table = %record.table, "Change precision degraded to whole table");
            }
            inner.entries.retain(|listener| {
                if listener.id > watermark {
                    return true;
                }
                let wanted = match &listener.scope {
                    Scope::Everything => true,
                    Scope::Table(table) => *table == record.table,
                };
                !wanted || listener.sender.send(record.clone()).is_ok()
            });
        }
    }
}

/// A stream of committed [`ChangeRecord`]s. Dropping it unregisters the
/// listener.
#[derive(Debug)]
pub struct ChangeSubscription {
    id: u64,
    receiver: mpsc::UnboundedReceiver<ChangeRecord>,
    registry: Weak<ListenerRegistry>,
}

impl ChangeSubscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Waits for the next record. Returns `None` once the database is
    /// closed and every pending record has been received.
    pub async fn recv(&mut self) -> Option<ChangeRecord> {
        self.receiver.recv().await
    }

    /// The next record if one is already queued.
    pub fn try_recv(&mut self) -> Option<ChangeRecord> {
        self.receiver.try_recv().ok()
    }

    /// Every record already queued.
    pub fn drain(&mut self) -> Vec<ChangeRecord> {
        std::iter::from_fn(|| self.try_recv()).collect()
    }
}

impl Drop for ChangeSubscription {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.unregister(self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use roost_core::PrimaryKey;

    fn keys(ids: &[i64]) -> KeySet {
        ids.iter().copied().collect()
    }

    fn columns(names: &[&str]) -> ColumnSet {
        names.iter().copied().collect()
    }

    #[test]
    fn test_accumulator_merges_per_table() {
        let mut acc = ChangeAccumulator::default();
        acc.record("posts", keys(&[1]), columns(&["id", "title"]));
        acc.record("posts", keys(&[2]), columns(&["title"]));
        acc.record("tags", keys(&[9]), columns(&["name"]));
        let records = acc.take();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].table, "posts");
        assert_eq!(records[0].keys, keys(&[1, 2]));
        assert!(acc.is_empty());
    }

    #[test]
    fn test_empty_exact_changes_are_ignored() {
        let mut acc = ChangeAccumulator::default();
        acc.record("posts", KeySet::empty(), columns(&["title"]));
        assert!(acc.is_empty());
        acc.record_all("posts");
        assert_eq!(acc.take(), [ChangeRecord::whole_table("posts")]);
    }

    #[test]
    fn test_delivery_respects_scope_and_watermark() {
        let registry = Arc::new(ListenerRegistry::default());
        let mut posts = registry.subscribe("posts");
        let mut everything = registry.subscribe_all();
        let watermark = registry.watermark();
        let mut late = registry.subscribe("posts");

        let record = ChangeRecord::new("posts", keys(&[1]), columns(&["title"]));
        let other = ChangeRecord::whole_table("tags");
        registry.deliver(&[record.clone(), other.clone()], watermark, false);

        assert_eq!(posts.drain(), [record.clone()]);
        assert_eq!(everything.drain(), [record, other]);
        assert!(late.try_recv().is_none());
    }

    #[test]
    fn test_dropping_subscription_unregisters() {
        let registry = Arc::new(ListenerRegistry::default());
        let sub = registry.subscribe("posts");
        assert_eq!(registry.len(), 1);
        drop(sub);
        assert_eq!(registry.len(), 0);
    }

    #[test]
    fn test_closed_receivers_are_pruned() {
        let registry = Arc::new(ListenerRegistry::default());
        let (sender, receiver) = mpsc::unbounded_channel();
        drop(receiver);
        registry.inner.lock().entries.push(Listener {
            id: 1,
            scope: Scope::Everything,
            sender,
        });
        let key: KeySet = [PrimaryKey::from(1)].into_iter().collect();
        registry.deliver(&[ChangeRecord::new("posts", key, ColumnSet::All)], 1, false);
        assert_eq!(registry.len(), 0);
    }
}
