//! Conversions between Rust scalars and [`Value`].
//!
//! The set of supported source types is closed: fixed-width integers,
//! floats, booleans, strings, byte buffers, `Option<T>` of any of those, and
//! enums with an integer or string raw representation (via
//! [`value_enum!`](crate::value_enum)).
//!
//! Encoding is infallible (`From<T> for Value`); decoding goes through
//! [`FromValue`] and reports a [`DecodeError`] instead of silently producing
//! a default.

use crate::model::DecodeError;
use crate::value::Value;

/// Decodes a Rust value from a database cell.
pub trait FromValue: Sized {
    /// Converts `value`, failing when it cannot represent `Self`.
    fn from_value(value: &Value) -> Result<Self, DecodeError>;
}

fn mismatch(expected: &'static str, value: &Value) -> DecodeError {
    DecodeError::TypeMismatch {
        expected,
        found: value.to_literal(),
    }
}

macro_rules! integer_conversions {
    ($($ty:ty),*) => {$(
        impl From<$ty> for Value {
            fn from(v: $ty) -> Self {
                Value::Integer(i64::from(v))
            }
        }

        impl FromValue for $ty {
            fn from_value(value: &Value) -> Result<Self, DecodeError> {
                let i = value.as_integer().ok_or_else(|| mismatch(stringify!($ty), value))?;
                <$ty>::try_from(i).map_err(|_| mismatch(stringify!($ty), value))
            }
        }
    )*};
}

integer_conversions!(i8, i16, i32, i64, u8, u16, u32);

macro_rules! checked_integer_conversions {
    ($($ty:ty),*) => {$(
        /// Values above `i64::MAX` saturate.
        impl From<$ty> for Value {
            fn from(v: $ty) -> Self {
                Value::Integer(i64::try_from(v).unwrap_or(i64::MAX))
            }
        }

        impl FromValue for $ty {
            fn from_value(value: &Value) -> Result<Self, DecodeError> {
                let i = value.as_integer().ok_or_else(|| mismatch(stringify!($ty), value))?;
                <$ty>::try_from(i).map_err(|_| mismatch(stringify!($ty), value))
            }
        }
    )*};
}

checked_integer_conversions!(u64, usize, isize);

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Real(v)
    }
}

impl From<f32> for Value {
    fn from(v: f32) -> Self {
        Value::Real(f64::from(v))
    }
}

impl FromValue for f64 {
    fn from_value(value: &Value) -> Result<Self, DecodeError> {
        value.as_real().ok_or_else(|| mismatch("f64", value))
    }
}

impl FromValue for f32 {
    fn from_value(value: &Value) -> Result<Self, DecodeError> {
        value.as_real().map(|r| r as f32).ok_or_else(|| mismatch("f32", value))
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Integer(i64::from(v))
    }
}

impl FromValue for bool {
    fn from_value(value: &Value) -> Result<Self, DecodeError> {
        value.as_bool().ok_or_else(|| mismatch("bool", value))
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl FromValue for String {
    fn from_value(value: &Value) -> Result<Self, DecodeError> {
        value.as_text().map(|s| s.into_owned()).ok_or_else(|| mismatch("String", value))
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Blob(v)
    }
}

impl From<&[u8]> for Value {
    fn from(v: &[u8]) -> Self {
        Value::Blob(v.to_vec())
    }
}

impl FromValue for Vec<u8> {
    fn from_value(value: &Value) -> Result<Self, DecodeError> {
        value.as_blob().map(|b| b.into_owned()).ok_or_else(|| mismatch("Vec<u8>", value))
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Value::Null)
    }
}

impl<T: FromValue> FromValue for Option<T> {
    fn from_value(value: &Value) -> Result<Self, DecodeError> {
        if value.is_null() {
            Ok(None)
        } else {
            T::from_value(value).map(Some)
        }
    }
}

impl FromValue for Value {
    fn from_value(value: &Value) -> Result<Self, DecodeError> {
        Ok(value.clone())
    }
}

/// Implements [`Value`] conversions for a fieldless enum with an explicit
/// raw representation.
///
/// ```
/// use roost_core::{FromValue, Value, value_enum};
///
/// #[derive(Debug, Clone, Copy, PartialEq)]
/// enum Priority { Low, High }
///
/// value_enum!(Priority: i64 { Low => 0, High => 10 });
///
/// assert_eq!(Value::from(Priority::High), Value::Integer(10));
/// assert_eq!(Priority::from_value(&Value::Integer(0)).unwrap(), Priority::Low);
///
/// #[derive(Debug, Clone, Copy, PartialEq)]
/// enum Mood { Calm, Loud }
///
/// value_enum!(Mood: &str { Calm => "calm", Loud => "loud" });
///
/// assert_eq!(Value::from(Mood::Loud), Value::Text("loud".into()));
/// assert!(Mood::from_value(&Value::Text("angry".into())).is_err());
/// ```
#[macro_export]
macro_rules! value_enum {
    ($ty:ident : i64 { $($variant:ident => $raw:expr),+ $(,)? }) => {
        impl ::std::convert::From<$ty> for $crate::Value {
            fn from(v: $ty) -> Self {
                match v {
                    $($ty::$variant => $crate::Value::Integer($raw),)+
                }
            }
        }

        impl $crate::FromValue for $ty {
            fn from_value(value: &$crate::Value) -> ::std::result::Result<Self, $crate::DecodeError> {
                match value.as_integer() {
                    $(Some(raw) if raw == $raw => Ok($ty::$variant),)+
                    _ => Err($crate::DecodeError::TypeMismatch {
                        expected: stringify!($ty),
                        found: value.to_literal(),
                    }),
                }
            }
        }
    };
    ($ty:ident : &str { $($variant:ident => $raw:expr),+ $(,)? }) => {
        impl ::std::convert::From<$ty> for $crate::Value {
            fn from(v: $ty) -> Self {
                match v {
                    $($ty::$variant => $crate::Value::Text(::std::string::String::from($raw)),)+
                }
            }
        }

        impl $crate::FromValue for $ty {
            fn from_value(value: &$crate::Value) -> ::std::result::Result<Self, $crate::DecodeError> {
                match value.as_text().as_deref() {
                    $(Some(raw) if raw == $raw => Ok($ty::$variant),)+
                    _ => Err($crate::DecodeError::TypeMismatch {
                        expected: stringify!($ty),
                        found: value.to_literal(),
                    }),
                }
            }
        }
    };
}
