//! Scalar database cell values.
//!
//! [`Value`] mirrors the five storage classes of the embedded engine. Values
//! compare and hash by their tagged representation: `Integer(1)` and
//! `Real(1.0)` are different values, and reals compare by bit pattern so a
//! value can be used as a map key.
//!
//! Cross-type reads (`as_integer`, `as_text`, ...) are lossy coercions in
//! the spirit of the engine's own type affinity rules.
//!
//! # Literals
//!
//! ```
//! use roost_core::Value;
//!
//! let v = Value::from("it's");
//! assert_eq!(v.to_literal(), "'it''s'");
//! assert_eq!(Value::from_literal("'it''s'").unwrap(), v);
//!
//! let blob = Value::from(vec![0xde_u8, 0xad]);
//! assert_eq!(blob.to_literal(), "X'dead'");
//! assert_eq!(Value::from_literal("NULL").unwrap(), Value::Null);
//! ```

use std::borrow::Cow;
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::table::ColumnType;

/// Errors produced while parsing a SQL literal.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValueError {
    /// The input is not a recognizable literal.
    #[error("invalid literal: {0}")]
    InvalidLiteral(String),
    /// A blob literal contains a non-hex digit or an odd number of digits.
    #[error("invalid blob literal: {0}")]
    InvalidBlob(String),
}

/// A single database cell.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub enum Value {
    /// SQL `NULL`.
    #[default]
    Null,
    /// 64-bit signed integer.
    Integer(i64),
    /// 64-bit float.
    Real(f64),
    /// UTF-8 text.
    Text(String),
    /// Raw bytes.
    Blob(Vec<u8>),
}

impl Value {
    /// Returns `true` for [`Value::Null`].
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// The storage class of this value, or `None` for null.
    pub fn column_type(&self) -> Option<ColumnType> {
        match self {
            Value::Null => None,
            Value::Integer(_) => Some(ColumnType::Integer),
            Value::Real(_) => Some(ColumnType::Real),
            Value::Text(_) => Some(ColumnType::Text),
            Value::Blob(_) => Some(ColumnType::Blob),
        }
    }

    /// Reads the value as an integer, coercing reals (truncated) and
    /// numeric text.
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Value::Null => None,
            Value::Integer(i) => Some(*i),
            Value::Real(r) if r.is_finite() => Some(*r as i64),
            Value::Real(_) => None,
            Value::Text(s) => parse_integer_lossy(s),
            Value::Blob(b) => parse_integer_lossy(&String::from_utf8_lossy(b)),
        }
    }

    /// Reads the value as a real, coercing integers and numeric text.
    pub fn as_real(&self) -> Option<f64> {
        match self {
            Value::Null => None,
            Value::Integer(i) => Some(*i as f64),
            Value::Real(r) => Some(*r),
            Value::Text(s) => s.trim().parse().ok(),
            Value::Blob(b) => String::from_utf8_lossy(b).trim().parse().ok(),
        }
    }

    /// Reads the value as text. Numbers are formatted, blobs decoded as
    /// UTF-8 with replacement characters.
    pub fn as_text(&self) -> Option<Cow<'_, str>> {
        match self {
            Value::Null => None,
            Value::Integer(i) => Some(Cow::Owned(i.to_string())),
            Value::Real(r) => Some(Cow::Owned(format_real(*r))),
            Value::Text(s) => Some(Cow::Borrowed(s)),
            Value::Blob(b) => Some(String::from_utf8_lossy(b)),
        }
    }

    /// Reads the value as bytes. Text and numbers use their UTF-8 form.
    pub fn as_blob(&self) -> Option<Cow<'_, [u8]>> {
        match self {
            Value::Null => None,
            Value::Blob(b) => Some(Cow::Borrowed(b)),
            Value::Text(s) => Some(Cow::Borrowed(s.as_bytes())),
            other => other.as_text().map(|s| Cow::Owned(s.into_owned().into_bytes())),
        }
    }

    /// Reads the value as a boolean (non-zero integer coercion).
    pub fn as_bool(&self) -> Option<bool> {
        self.as_integer().map(|i| i != 0)
    }

    /// Encodes the value as a SQL literal.
    ///
    /// NaN has no literal form and encodes as `NULL`; infinities encode as
    /// out-of-range exponents that parse back to infinity.
    pub fn to_literal(&self) -> String {
        match self {
            Value::Null => "NULL".to_string(),
            Value::Integer(i) => i.to_string(),
            Value::Real(r) if r.is_nan() => "NULL".to_string(),
            Value::Real(r) if r.is_infinite() => {
                if *r > 0.0 { "9e999".to_string() } else { "-9e999".to_string() }
            }
            Value::Real(r) => format_real(*r),
            Value::Text(s) => format!("'{}'", s.replace('\'', "''")),
            Value::Blob(b) => {
                let mut out = String::with_capacity(b.len() * 2 + 3);
                out.push_str("X'");
                for byte in b {
                    out.push_str(&format!("{byte:02x}"));
                }
                out.push('\'');
                out
            }
        }
    }

    /// Parses a SQL literal produced by [`to_literal`](Self::to_literal)
    /// (or written by hand in the same syntax).
    ///
    /// # Errors
    ///
    /// Returns [`ValueError::InvalidLiteral`] for unrecognized input and
    /// [`ValueError::InvalidBlob`] for malformed hex.
    pub fn from_literal(literal: &str) -> Result<Self, ValueError> {
        let s = literal.trim();
        if s.eq_ignore_ascii_case("null") {
            return Ok(Value::Null);
        }

        if let Some(hex) = s
            .strip_prefix("X'")
            .or_else(|| s.strip_prefix("x'"))
            .and_then(|rest| rest.strip_suffix('\''))
        {
            return parse_hex(hex).map(Value::Blob);
        }

        if s.len() >= 2 && s.starts_with('\'') && s.ends_with('\'') {
            let inner = &s[1..s.len() - 1];
            if inner.replace("''", "").contains('\'') {
                return Err(ValueError::InvalidLiteral(literal.to_string()));
            }
            return Ok(Value::Text(inner.replace("''", "'")));
        }

        let numeric_start = s
            .chars()
            .next()
            .is_some_and(|c| c.is_ascii_digit() || matches!(c, '-' | '+' | '.'));
        if !numeric_start {
            return Err(ValueError::InvalidLiteral(literal.to_string()));
        }
        if let Ok(i) = s.parse::<i64>() {
            return Ok(Value::Integer(i));
        }
        s.parse::<f64>()
            .map(Value::Real)
            .map_err(|_| ValueError::InvalidLiteral(literal.to_string()))
    }

    /// Converts to a JSON value for display. Blobs become their literal form.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Null => serde_json::Value::Null,
            Value::Integer(i) => serde_json::Value::from(*i),
            Value::Real(r) => serde_json::Number::from_f64(*r)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Value::Text(s) => serde_json::Value::String(s.clone()),
            Value::Blob(_) => serde_json::Value::String(self.to_literal()),
        }
    }

    fn rank(&self) -> u8 {
        match self {
            Value::Null => 0,
            Value::Integer(_) | Value::Real(_) => 1,
            Value::Text(_) => 2,
            Value::Blob(_) => 3,
        }
    }
}

/// Shortest round-trip formatting that always reads back as a real.
fn format_real(r: f64) -> String {
    let s = format!("{r:?}");
    if s.contains(['.', 'e', 'E']) || !r.is_finite() {
        s
    } else {
        format!("{s}.0")
    }
}

fn parse_integer_lossy(s: &str) -> Option<i64> {
    let s = s.trim();
    s.parse::<i64>()
        .ok()
        .or_else(|| s.parse::<f64>().ok().filter(|r| r.is_finite()).map(|r| r as i64))
}

fn parse_hex(hex: &str) -> Result<Vec<u8>, ValueError> {
    if hex.len() % 2 != 0 || !hex.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(ValueError::InvalidBlob(hex.to_string()));
    }
    (0..hex.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&hex[i..i + 2], 16).map_err(|_| ValueError::InvalidBlob(hex.to_string())))
        .collect()
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Integer(a), Value::Integer(b)) => a == b,
            (Value::Real(a), Value::Real(b)) => a.to_bits() == b.to_bits(),
            (Value::Text(a), Value::Text(b)) => a == b,
            (Value::Blob(a), Value::Blob(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for Value {}

impl Hash for Value {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::mem::discriminant(self).hash(state);
        match self {
            Value::Null => {}
            Value::Integer(i) => i.hash(state),
            Value::Real(r) => r.to_bits().hash(state),
            Value::Text(s) => s.hash(state),
            Value::Blob(b) => b.hash(state),
        }
    }
}

impl Ord for Value {
    /// Engine sort order: null, numbers, text, blobs. Numbers compare
    /// numerically; an integer sorts before an equal real.
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Value::Integer(a), Value::Integer(b)) => a.cmp(b),
            (Value::Real(a), Value::Real(b)) => a.total_cmp(b),
            (Value::Integer(a), Value::Real(b)) => (*a as f64).total_cmp(b).then(Ordering::Less),
            (Value::Real(a), Value::Integer(b)) => a.total_cmp(&(*b as f64)).then(Ordering::Greater),
            (Value::Text(a), Value::Text(b)) => a.cmp(b),
            (Value::Blob(a), Value::Blob(b)) => a.cmp(b),
            (a, b) => a.rank().cmp(&b.rank()),
        }
    }
}

impl PartialOrd for Value {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_literal())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(v: Value) {
        let literal = v.to_literal();
        assert_eq!(Value::from_literal(&literal).unwrap(), v, "literal {literal}");
    }

    #[test]
    fn test_literal_round_trip() {
        round_trip(Value::Integer(0));
        round_trip(Value::Integer(i64::MIN));
        round_trip(Value::Integer(i64::MAX));
        round_trip(Value::Real(1.0));
        round_trip(Value::Real(-0.1));
        round_trip(Value::Real(1e-7));
        round_trip(Value::Real(6.02214076e23));
        round_trip(Value::Real(f64::INFINITY));
        round_trip(Value::Real(f64::NEG_INFINITY));
        round_trip(Value::Text(String::new()));
        round_trip(Value::Text("O'Brien said ''hi''".to_string()));
        round_trip(Value::Text("ünïcödé".to_string()));
        round_trip(Value::Blob(vec![]));
        round_trip(Value::Blob(vec![0, 1, 0xfe, 0xff]));
    }

    #[test]
    fn test_null_uses_sentinel() {
        assert_eq!(Value::Null.to_literal(), "NULL");
        assert_eq!(Value::from_literal("null").unwrap(), Value::Null);
        assert_eq!(Value::Real(f64::NAN).to_literal(), "NULL");
    }

    #[test]
    fn test_real_literal_keeps_real_type() {
        assert_eq!(Value::Real(3.0).to_literal(), "3.0");
        assert!(matches!(Value::from_literal("3.0").unwrap(), Value::Real(_)));
        assert!(matches!(Value::from_literal("3").unwrap(), Value::Integer(3)));
    }

    #[test]
    fn test_invalid_literals() {
        assert!(matches!(Value::from_literal("hello"), Err(ValueError::InvalidLiteral(_))));
        assert!(matches!(Value::from_literal("X'abc'"), Err(ValueError::InvalidBlob(_))));
        assert!(matches!(Value::from_literal("X'zz'"), Err(ValueError::InvalidBlob(_))));
        assert!(Value::from_literal("'a'b'").is_err());
    }

    #[test]
    fn test_equality_is_tagged() {
        assert_ne!(Value::Integer(1), Value::Real(1.0));
        assert_eq!(Value::Real(f64::NAN), Value::Real(f64::NAN));
        assert_ne!(Value::Text("1".into()), Value::Integer(1));
    }

    #[test]
    fn test_lossy_coercion() {
        assert_eq!(Value::Text(" 42 ".into()).as_integer(), Some(42));
        assert_eq!(Value::Text("4.9".into()).as_integer(), Some(4));
        assert_eq!(Value::Real(-2.7).as_integer(), Some(-2));
        assert_eq!(Value::Integer(3).as_real(), Some(3.0));
        assert_eq!(Value::Integer(7).as_text().as_deref(), Some("7"));
        assert_eq!(Value::Blob(b"hi".to_vec()).as_text().as_deref(), Some("hi"));
        assert_eq!(Value::Text("abc".into()).as_integer(), None);
        assert_eq!(Value::Null.as_text(), None);
        assert_eq!(Value::Integer(2).as_bool(), Some(true));
    }

    #[test]
    fn test_ordering_follows_storage_classes() {
        let mut values = vec![
            Value::Blob(vec![1]),
            Value::Text("a".into()),
            Value::Real(1.5),
            Value::Null,
            Value::Integer(1),
        ];
        values.sort();
        assert_eq!(
            values,
            vec![
                Value::Null,
                Value::Integer(1),
                Value::Real(1.5),
                Value::Text("a".into()),
                Value::Blob(vec![1]),
            ]
        );
        assert_eq!(Value::Integer(1).cmp(&Value::Real(1.0)), Ordering::Less);
    }
}
