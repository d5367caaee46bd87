//! Conversion between [`Value`] and the engine's cell types, and statement
//! argument binding.

use roost_core::{Row, Value};
use rusqlite::Statement;
use rusqlite::types::{Value as SqlValue, ValueRef};

use crate::error::{Result, SqliteError};

/// Statement arguments.
///
/// Positional arguments bind to `?` placeholders in order. Named arguments
/// bind to `:name`, `@name` or `$name` placeholders; a name without a prefix
/// binds to `:name`.
#[derive(Debug, Clone, PartialEq)]
pub enum Arguments {
    Positional(Vec<Value>),
    Named(Vec<(String, Value)>),
}

impl Default for Arguments {
    fn default() -> Self {
        Arguments::Positional(Vec::new())
    }
}

impl Arguments {
    /// No arguments.
    pub fn none() -> Self {
        Self::default()
    }

    pub fn positional<I, V>(values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        Arguments::Positional(values.into_iter().map(Into::into).collect())
    }

    pub fn named<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<Value>,
    {
        Arguments::Named(pairs.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }

    pub fn len(&self) -> usize {
        match self {
            Arguments::Positional(values) => values.len(),
            Arguments::Named(pairs) => pairs.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The values in binding order, for fingerprints and logs.
    pub fn values(&self) -> Vec<&Value> {
        match self {
            Arguments::Positional(values) => values.iter().collect(),
            Arguments::Named(pairs) => pairs.iter().map(|(_, v)| v).collect(),
        }
    }

    /// A compact rendering used by query logs and cache fingerprints.
    pub fn describe(&self) -> String {
        match self {
            Arguments::Positional(values) => values
                .iter()
                .map(Value::to_literal)
                .collect::<Vec<_>>()
                .join(", "),
            Arguments::Named(pairs) => pairs
                .iter()
                .map(|(k, v)| format!("{k}={}", v.to_literal()))
                .collect::<Vec<_>>()
                .join(", "),
        }
    }
}

impl From<Vec<Value>> for Arguments {
    fn from(values: Vec<Value>) -> Self {
        Arguments::Positional(values)
    }
}

impl From<()> for Arguments {
    fn from(_: ()) -> Self {
        Arguments::default()
    }
}

pub(crate) fn to_sql_value(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Integer(i) => SqlValue::Integer(*i),
        Value::Real(r) => SqlValue::Real(*r),
        Value::Text(s) => SqlValue::Text(s.clone()),
        Value::Blob(b) => SqlValue::Blob(b.clone()),
    }
}

pub(crate) fn from_value_ref(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::Integer(i),
        ValueRef::Real(r) => Value::Real(r),
        ValueRef::Text(t) => Value::Text(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => Value::Blob(b.to_vec()),
    }
}

/// Binds `args` to a prepared statement, rejecting count mismatches and
/// unknown names.
pub(crate) fn bind(stmt: &mut Statement<'_>, args: &Arguments) -> Result<()> {
    let expected = stmt.parameter_count();
    if args.len() != expected {
        return Err(SqliteError::ArgumentBinding(format!(
            "statement expects {expected} arguments, {} given",
            args.len()
        )));
    }
    match args {
        Arguments::Positional(values) => {
            for (i, value) in values.iter().enumerate() {
                stmt.raw_bind_parameter(i + 1, to_sql_value(value))?;
            }
        }
        Arguments::Named(pairs) => {
            for (name, value) in pairs {
                let key = if name.starts_with([':', '@', '$']) {
                    name.clone()
                } else {
                    format!(":{name}")
                };
                let index = stmt.parameter_index(&key)?.ok_or_else(|| {
                    SqliteError::ArgumentBinding(format!("unknown parameter '{name}'"))
                })?;
                stmt.raw_bind_parameter(index, to_sql_value(value))?;
            }
        }
    }
    Ok(())
}

/// Runs a bound statement and materializes every row.
pub(crate) fn collect_rows(stmt: &mut Statement<'_>) -> Result<Vec<Row>> {
    let names: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
    let mut rows = stmt.raw_query();
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        let mut materialized = Row::new();
        for (i, name) in names.iter().enumerate() {
            materialized.insert(name.as_str(), from_value_ref(row.get_ref(i)?));
        }
        out.push(materialized);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::Connection;

    fn conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("CREATE TABLE t (a, b)").unwrap();
        conn
    }

    #[test]
    fn test_positional_binding() {
        let conn = conn();
        let mut stmt = conn.prepare("INSERT INTO t VALUES (?, ?)").unwrap();
        bind(&mut stmt, &Arguments::positional([Value::Integer(1), Value::Blob(vec![7])])).unwrap();
        assert_eq!(stmt.raw_execute().unwrap(), 1);

        let mut stmt = conn.prepare("SELECT a, b FROM t").unwrap();
        bind(&mut stmt, &Arguments::none()).unwrap();
        let rows = collect_rows(&mut stmt).unwrap();
        assert_eq!(rows[0].get("a"), Some(&Value::Integer(1)));
        assert_eq!(rows[0].get("b"), Some(&Value::Blob(vec![7])));
    }

    #[test]
    fn test_named_binding_accepts_bare_names() {
        let conn = conn();
        let mut stmt = conn.prepare("INSERT INTO t VALUES (:a, @b)").unwrap();
        bind(&mut stmt, &Arguments::named([("a", Value::from("x")), ("@b", Value::Real(0.5))])).unwrap();
        assert_eq!(stmt.raw_execute().unwrap(), 1);
    }

    #[test]
    fn test_count_mismatch_is_rejected() {
        let conn = conn();
        let mut stmt = conn.prepare("SELECT * FROM t WHERE a = ?").unwrap();
        let err = bind(&mut stmt, &Arguments::none()).unwrap_err();
        assert!(matches!(err, SqliteError::ArgumentBinding(_)));
    }

    #[test]
    fn test_unknown_name_is_rejected() {
        let conn = conn();
        let mut stmt = conn.prepare("SELECT * FROM t WHERE a = :a").unwrap();
        let err = bind(&mut stmt, &Arguments::named([("z", 1)])).unwrap_err();
        assert!(matches!(err, SqliteError::ArgumentBinding(msg) if msg.contains("'z'")));
    }

    #[test]
    fn test_describe() {
        assert_eq!(Arguments::positional([1, 2]).describe(), "1, 2");
        assert_eq!(Arguments::named([("a", "x")]).describe(), "a='x'");
    }
}
