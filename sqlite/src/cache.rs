//! Per-table read-through cache.
//!
//! Each table has one LRU holding two kinds of entries: row snapshots keyed
//! by primary key, and query results keyed by a fingerprint of the
//! normalized SQL and its arguments. Query entries remember which keys they
//! returned and which columns their result depends on, so a
//! [`ChangeRecord`] can drop exactly the entries it may have made stale.
//! Anything uncertain is dropped.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::LazyLock;

use lru::LruCache;
use parking_lot::Mutex;
use regex::Regex;
use roost_core::{ChangeRecord, ColumnSet, KeySet, PrimaryKey, Row};
use serde::Serialize;
use tracing::debug;

use crate::convert::Arguments;

/// Canonical cache key for a statement and its arguments.
///
/// Runs of whitespace collapse to one space, except inside string literals
/// and quoted identifiers, which are kept byte for byte.
pub(crate) fn fingerprint(sql: &str, args: &Arguments) -> String {
    static TOKENS: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r#"'(?:[^']|'')*'|"(?:[^"]|"")*"|`[^`]*`|\[[^\]]*\]|\s+"#)
            .expect("static regex must compile")
    });
    let normalized = TOKENS.replace_all(sql.trim(), |caps: &regex::Captures<'_>| {
        let token = &caps[0];
        if token.starts_with(char::is_whitespace) {
            " ".to_string()
        } else {
            token.to_string()
        }
    });
    format!("{normalized}|{}", args.describe())
}

/// Per-table cache counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub writes: u64,
    pub row_invalidations: u64,
    pub table_invalidations: u64,
    pub query_invalidations: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum CacheKey {
    Row(PrimaryKey),
    Query(String),
}

#[derive(Debug, Clone)]
enum CacheEntry {
    Row(Row),
    Query {
        rows: Vec<Row>,
        keys: KeySet,
        columns: ColumnSet,
    },
}

#[derive(Debug)]
struct TableCache {
    limit: usize,
    entries: Option<LruCache<CacheKey, CacheEntry>>,
    stats: CacheStats,
}

impl TableCache {
    fn new(limit: usize) -> Self {
        Self {
            limit,
            entries: NonZeroUsize::new(limit).map(LruCache::new),
            stats: CacheStats::default(),
        }
    }

    fn set_limit(&mut self, limit: usize) {
        self.limit = limit;
        match (NonZeroUsize::new(limit), self.entries.as_mut()) {
            (None, _) => self.entries = None,
            (Some(cap), Some(entries)) => entries.resize(cap),
            (Some(cap), None) => self.entries = Some(LruCache::new(cap)),
        }
    }

    fn lookup(&mut self, key: &CacheKey) -> Option<CacheEntry> {
        let found = self.entries.as_mut().and_then(|e| e.get(key)).cloned();
        if found.is_some() {
            self.stats.hits += 1;
        } else {
            self.stats.misses += 1;
        }
        found
    }

    fn store(&mut self, key: CacheKey, entry: CacheEntry) {
        if let Some(entries) = self.entries.as_mut() {
            entries.put(key, entry);
            self.stats.writes += 1;
        }
    }

    fn invalidate(&mut self, record: &ChangeRecord) {
        let Some(entries) = self.entries.as_mut() else {
            return;
        };
        if entries.is_empty() {
            return;
        }
        if record.keys.is_all() {
            entries.clear();
            self.stats.table_invalidations += 1;
            return;
        }

        let stale: Vec<CacheKey> = entries
            .iter()
            .filter(|(key, entry)| match (key, entry) {
                (CacheKey::Row(pk), _) => record.keys.contains(pk),
                (_, CacheEntry::Query { keys, columns, .. }) => {
                    keys.is_all() || keys.intersects(&record.keys) || columns.intersects(&record.columns)
                }
                _ => true,
            })
            .map(|(key, _)| key.clone())
            .collect();
        for key in stale {
            entries.pop(&key);
            match key {
                CacheKey::Row(_) => self.stats.row_invalidations += 1,
                CacheKey::Query(_) => self.stats.query_invalidations += 1,
            }
        }
    }
}

/// The cache of one database. Shared between callers (for lookups) and the
/// executor (for stores and invalidation).
#[derive(Debug)]
pub(crate) struct Cache {
    default_limit: usize,
    tables: Mutex<HashMap<String, TableCache>>,
}

impl Cache {
    pub(crate) fn new(default_limit: usize) -> Self {
        Self {
            default_limit,
            tables: Mutex::new(HashMap::new()),
        }
    }

    fn with_table<R>(&self, table: &str, f: impl FnOnce(&mut TableCache) -> R) -> R {
        let mut tables = self.tables.lock();
        let cache = tables
            .entry(table.to_string())
            .or_insert_with(|| TableCache::new(self.default_limit));
        f(cache)
    }

    pub(crate) fn lookup_row(&self, table: &str, key: &PrimaryKey) -> Option<Row> {
        let found = self.with_table(table, |c| c.lookup(&CacheKey::Row(key.clone())));
        match found {
            Some(CacheEntry::Row(row)) => {
                debug!(table, key = %key, "Row cache hit");
                Some(row)
            }
            _ => None,
        }
    }

    pub(crate) fn lookup_query(&self, table: &str, fingerprint: &str) -> Option<Vec<Row>> {
        let found = self.with_table(table, |c| c.lookup(&CacheKey::Query(fingerprint.to_string())));
        match found {
            Some(CacheEntry::Query { rows, .. }) => {
                debug!(table, fingerprint, "Query cache hit");
                Some(rows)
            }
            _ => None,
        }
    }

    pub(crate) fn store_row(&self, table: &str, key: PrimaryKey, row: Row) {
        self.with_table(table, |c| c.store(CacheKey::Row(key), CacheEntry::Row(row)));
    }

    pub(crate) fn store_query(
        &self,
        table: &str,
        fingerprint: String,
        rows: Vec<Row>,
        keys: KeySet,
        columns: ColumnSet,
    ) {
        self.with_table(table, |c| {
            c.store(
                CacheKey::Query(fingerprint),
                CacheEntry::Query { rows, keys, columns },
            )
        });
    }

    /// Drops every entry `record` may have made stale.
    pub(crate) fn invalidate(&self, record: &ChangeRecord) {
        let mut tables = self.tables.lock();
        if let Some(cache) = tables.get_mut(&record.table) {
            cache.invalidate(record);
        }
    }

    /// Whether `table` caches anything at all.
    pub(crate) fn is_enabled(&self, table: &str) -> bool {
        self.limit(table) > 0
    }

    pub(crate) fn set_limit(&self, table: &str, limit: usize) {
        self.with_table(table, |c| c.set_limit(limit));
    }

    pub(crate) fn limit(&self, table: &str) -> usize {
        self.tables
            .lock()
            .get(table)
            .map_or(self.default_limit, |c| c.limit)
    }

    pub(crate) fn stats(&self, table: &str) -> CacheStats {
        self.tables
            .lock()
            .get(table)
            .map(|c| c.stats)
            .unwrap_or_default()
    }

    pub(crate) fn reset_stats(&self, table: &str) {
        if let Some(cache) = self.tables.lock().get_mut(table) {
            cache.stats = CacheStats::default();
        }
    }

    #[cfg(test)]
    fn len(&self, table: &str) -> usize {
        self.tables
            .lock()
            .get(table)
            .and_then(|c| c.entries.as_ref().map(LruCache::len))
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use roost_core::Value;

    fn row(id: i64, title: &str) -> Row {
        Row::new().with("id", id).with("title", title)
    }

    fn pk(id: i64) -> PrimaryKey {
        PrimaryKey::from(id)
    }

    fn keys(ids: &[i64]) -> KeySet {
        ids.iter().copied().collect()
    }

    fn columns(names: &[&str]) -> ColumnSet {
        names.iter().copied().collect()
    }

    #[test]
    fn test_row_hit_and_miss_counters() {
        let cache = Cache::new(10);
        assert!(cache.lookup_row("posts", &pk(1)).is_none());
        cache.store_row("posts", pk(1), row(1, "a"));
        assert_eq!(cache.lookup_row("posts", &pk(1)), Some(row(1, "a")));

        let stats = cache.stats("posts");
        assert_eq!((stats.hits, stats.misses, stats.writes), (1, 1, 1));
        cache.reset_stats("posts");
        assert_eq!(cache.stats("posts"), CacheStats::default());
    }

    #[test]
    fn test_exact_invalidation_keeps_unrelated_entries() {
        let cache = Cache::new(10);
        cache.store_row("posts", pk(1), row(1, "a"));
        cache.store_row("posts", pk(2), row(2, "b"));
        cache.store_query("posts", "q-title".into(), vec![row(2, "b")], keys(&[2]), columns(&["title"]));
        cache.store_query("posts", "q-body".into(), vec![], keys(&[]), columns(&["body"]));

        cache.invalidate(&ChangeRecord::new("posts", keys(&[1]), columns(&["title"])));

        assert!(cache.lookup_row("posts", &pk(1)).is_none());
        assert!(cache.lookup_row("posts", &pk(2)).is_some());
        assert!(cache.lookup_query("posts", "q-title").is_none());
        assert!(cache.lookup_query("posts", "q-body").is_some());
        let stats = cache.stats("posts");
        assert_eq!(stats.row_invalidations, 1);
        assert_eq!(stats.query_invalidations, 1);
    }

    #[test]
    fn test_query_with_unknown_keys_is_always_dropped() {
        let cache = Cache::new(10);
        cache.store_query("posts", "q".into(), vec![], KeySet::All, columns(&["x"]));
        cache.invalidate(&ChangeRecord::new("posts", keys(&[7]), columns(&["y"])));
        assert_eq!(cache.len("posts"), 0);
    }

    #[test]
    fn test_whole_table_invalidation() {
        let cache = Cache::new(10);
        cache.store_row("posts", pk(1), row(1, "a"));
        cache.store_query("posts", "q".into(), vec![], keys(&[]), columns(&["title"]));
        cache.invalidate(&ChangeRecord::whole_table("posts"));
        assert_eq!(cache.len("posts"), 0);
        assert_eq!(cache.stats("posts").table_invalidations, 1);

        // Nothing left to drop; not counted again.
        cache.invalidate(&ChangeRecord::whole_table("posts"));
        assert_eq!(cache.stats("posts").table_invalidations, 1);
    }

    #[test]
    fn test_lru_eviction_and_zero_limit() {
        let cache = Cache::new(2);
        cache.store_row("posts", pk(1), row(1, "a"));
        cache.store_row("posts", pk(2), row(2, "b"));
        cache.lookup_row("posts", &pk(1));
        cache.store_row("posts", pk(3), row(3, "c"));
        assert!(cache.lookup_row("posts", &pk(2)).is_none());
        assert!(cache.lookup_row("posts", &pk(1)).is_some());

        cache.set_limit("posts", 0);
        assert!(!cache.is_enabled("posts"));
        cache.store_row("posts", pk(4), row(4, "d"));
        assert!(cache.lookup_row("posts", &pk(4)).is_none());
        assert_eq!(cache.limit("tags"), 2);
    }

    #[test]
    fn test_fingerprint_normalizes_whitespace_and_includes_arguments() {
        let a = fingerprint("SELECT *\n  FROM t WHERE a = ?", &Arguments::positional([1]));
        let b = fingerprint(" SELECT * FROM t   WHERE a = ? ", &Arguments::positional([1]));
        let c = fingerprint("SELECT * FROM t WHERE a = ?", &Arguments::positional([Value::from("1")]));
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_fingerprint_keeps_quoted_whitespace() {
        let none = Arguments::none();
        assert_ne!(
            fingerprint("SELECT * FROM t WHERE title = 'a  b'", &none),
            fingerprint("SELECT * FROM t WHERE title = 'a b'", &none)
        );
        assert_ne!(
            fingerprint("SELECT \"a  b\" FROM t", &none),
            fingerprint("SELECT \"a b\" FROM t", &none)
        );
        assert_ne!(fingerprint("SELECT [a  b] FROM t", &none), fingerprint("SELECT [a b] FROM t", &none));
        assert_ne!(fingerprint("SELECT `a  b` FROM t", &none), fingerprint("SELECT `a b` FROM t", &none));
        assert_eq!(
            fingerprint("SELECT *  FROM t WHERE title = 'it''s  here'\n AND b = 1", &none),
            fingerprint("SELECT * FROM t WHERE title = 'it''s  here' AND b = 1", &none)
        );
    }
}
