//! Change records: which keys and columns of one table changed in a commit.
//!
//! Both dimensions are either an exact set or the `All` sentinel. Merging is
//! a per-dimension union in which `All` absorbs everything, so precision can
//! only be lost, never invented.

use std::collections::BTreeSet;

use serde::Serialize;

use crate::row::PrimaryKey;

/// Affected primary keys.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum KeySet {
    /// Unknown or whole-table.
    All,
    Keys(BTreeSet<PrimaryKey>),
}

/// Affected column names.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum ColumnSet {
    /// Unknown or every column.
    All,
    Columns(BTreeSet<String>),
}

impl KeySet {
    pub fn empty() -> Self {
        KeySet::Keys(BTreeSet::new())
    }

    pub fn is_all(&self) -> bool {
        matches!(self, KeySet::All)
    }

    pub fn contains(&self, key: &PrimaryKey) -> bool {
        match self {
            KeySet::All => true,
            KeySet::Keys(keys) => keys.contains(key),
        }
    }

    /// Whether the two sets may share a key. `All` intersects anything.
    pub fn intersects(&self, other: &KeySet) -> bool {
        match (self, other) {
            (KeySet::All, _) | (_, KeySet::All) => true,
            (KeySet::Keys(a), KeySet::Keys(b)) => !a.is_disjoint(b),
        }
    }

    pub fn merge(&mut self, other: KeySet) {
        match other {
            KeySet::All => *self = KeySet::All,
            KeySet::Keys(b) => {
                if let KeySet::Keys(a) = self {
                    a.extend(b);
                }
            }
        }
    }
}

impl ColumnSet {
    pub fn empty() -> Self {
        ColumnSet::Columns(BTreeSet::new())
    }

    pub fn is_all(&self) -> bool {
        matches!(self, ColumnSet::All)
    }

    pub fn contains(&self, column: &str) -> bool {
        match self {
            ColumnSet::All => true,
            ColumnSet::Columns(columns) => columns.contains(column),
        }
    }

    pub fn intersects(&self, other: &ColumnSet) -> bool {
        match (self, other) {
            (ColumnSet::All, _) | (_, ColumnSet::All) => true,
            (ColumnSet::Columns(a), ColumnSet::Columns(b)) => !a.is_disjoint(b),
        }
    }

    pub fn merge(&mut self, other: ColumnSet) {
        match other {
            ColumnSet::All => *self = ColumnSet::All,
            ColumnSet::Columns(b) => {
                if let ColumnSet::Columns(a) = self {
                    a.extend(b);
                }
            }
        }
    }
}

impl<K: Into<PrimaryKey>> FromIterator<K> for KeySet {
    fn from_iter<T: IntoIterator<Item = K>>(iter: T) -> Self {
        KeySet::Keys(iter.into_iter().map(Into::into).collect())
    }
}

impl<S: Into<String>> FromIterator<S> for ColumnSet {
    fn from_iter<T: IntoIterator<Item = S>>(iter: T) -> Self {
        ColumnSet::Columns(iter.into_iter().map(Into::into).collect())
    }
}

/// The merged changes to one table in one committed transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChangeRecord {
    pub table: String,
    pub keys: KeySet,
    pub columns: ColumnSet,
}

impl ChangeRecord {
    pub fn new(table: impl Into<String>, keys: KeySet, columns: ColumnSet) -> Self {
        Self {
            table: table.into(),
            keys,
            columns,
        }
    }

    /// A whole-table change of unknown scope.
    pub fn whole_table(table: impl Into<String>) -> Self {
        Self::new(table, KeySet::All, ColumnSet::All)
    }

    /// Folds `other` into this record. Both must describe the same table.
    pub fn merge(&mut self, other: ChangeRecord) {
        debug_assert_eq!(self.table, other.table);
        self.keys.merge(other.keys);
        self.columns.merge(other.columns);
    }
}
