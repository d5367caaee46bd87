//! Generic rows and primary keys.

use std::collections::BTreeMap;
use std::fmt;

use serde::Serialize;

use crate::convert::FromValue;
use crate::model::DecodeError;
use crate::value::Value;

/// A materialized row: column name → value.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct Row {
    values: BTreeMap<String, Value>,
}

impl Row {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    pub fn with(mut self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(column, value);
        self
    }

    pub fn insert(&mut self, column: impl Into<String>, value: impl Into<Value>) {
        self.values.insert(column.into(), value.into());
    }

    /// The raw value of `column`, if present.
    pub fn get(&self, column: &str) -> Option<&Value> {
        self.values.get(column)
    }

    /// Decodes `column` into `T`.
    ///
    /// # Errors
    ///
    /// [`DecodeError::MissingColumn`] if the row has no such column, or the
    /// conversion error from [`FromValue`].
    pub fn decode<T: FromValue>(&self, column: &str) -> Result<T, DecodeError> {
        let value = self
            .values
            .get(column)
            .ok_or_else(|| DecodeError::MissingColumn(column.to_string()))?;
        T::from_value(value).map_err(|e| e.in_column(column))
    }

    pub fn columns(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Extracts the primary key for the given key columns. Missing columns
    /// read as `NULL`.
    pub fn primary_key(&self, key_columns: &[String]) -> PrimaryKey {
        PrimaryKey(
            key_columns
                .iter()
                .map(|c| self.values.get(c).cloned().unwrap_or(Value::Null))
                .collect(),
        )
    }

    /// Returns `true` if every key column is present in the row.
    pub fn has_columns(&self, columns: &[String]) -> bool {
        columns.iter().all(|c| self.values.contains_key(c))
    }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for Row {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        Self {
            values: iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect(),
        }
    }
}

impl IntoIterator for Row {
    type Item = (String, Value);
    type IntoIter = std::collections::btree_map::IntoIter<String, Value>;

    fn into_iter(self) -> Self::IntoIter {
        self.values.into_iter()
    }
}

/// Primary-key tuple, one value per key column in declaration order.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct PrimaryKey(Vec<Value>);

impl PrimaryKey {
    pub fn new(values: Vec<Value>) -> Self {
        Self(values)
    }

    pub fn values(&self) -> &[Value] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Vec<Value>> for PrimaryKey {
    fn from(values: Vec<Value>) -> Self {
        Self(values)
    }
}

macro_rules! single_column_key {
    ($($ty:ty),*) => {$(
        impl From<$ty> for PrimaryKey {
            fn from(v: $ty) -> Self {
                Self(vec![Value::from(v)])
            }
        }
    )*};
}

single_column_key!(i32, i64, u32, u64, String, &str, Value);

impl<A: Into<Value>, B: Into<Value>> From<(A, B)> for PrimaryKey {
    fn from((a, b): (A, B)) -> Self {
        Self(vec![a.into(), b.into()])
    }
}

impl fmt::Display for PrimaryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[")?;
        for (i, v) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{v}")?;
        }
        f.write_str("]")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_reports_column() {
        let row = Row::new().with("id", 1_i64).with("title", Value::Null);
        assert_eq!(row.decode::<i64>("id").unwrap(), 1);
        assert!(matches!(row.decode::<i64>("nope"), Err(DecodeError::MissingColumn(c)) if c == "nope"));
        let err = row.decode::<String>("title").unwrap_err();
        assert!(err.to_string().contains("title"));
    }

    #[test]
    fn test_primary_key_extraction() {
        let row: Row = [("a", Value::Integer(1)), ("b", Value::Text("x".into()))]
            .into_iter()
            .collect();
        let key = row.primary_key(&["b".to_string(), "a".to_string()]);
        assert_eq!(key, PrimaryKey::from(("x", 1_i64)));
        assert_eq!(key.to_string(), "['x', 1]");
    }
}
