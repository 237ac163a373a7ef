//! Positional statement arguments
//!
//! Statements are stored before they are sent (batches queue them per
//! shard), so arguments are owned values rather than borrowed binds.

use std::fmt;

use chrono::{DateTime, Utc};
use sqlx::postgres::{PgArguments, Postgres};
use sqlx::query::Query;
use uuid::Uuid;

/// One positional argument (`$1`, `$2`, ...)
///
/// `Null` is sent as a text-typed NULL; cast it in SQL (`$1::bigint`) when the
/// column has another type, or use `Option<T>` which keeps the type.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(Option<bool>),
    Int2(Option<i16>),
    Int4(Option<i32>),
    Int8(Option<i64>),
    Float4(Option<f32>),
    Float8(Option<f64>),
    Text(Option<String>),
    Bytea(Option<Vec<u8>>),
    Uuid(Option<Uuid>),
    Timestamptz(Option<DateTime<Utc>>),
    Json(Option<serde_json::Value>),
}

impl Value {
    pub fn is_null(&self) -> bool {
        match self {
            Value::Null => true,
            Value::Bool(v) => v.is_none(),
            Value::Int2(v) => v.is_none(),
            Value::Int4(v) => v.is_none(),
            Value::Int8(v) => v.is_none(),
            Value::Float4(v) => v.is_none(),
            Value::Float8(v) => v.is_none(),
            Value::Text(v) => v.is_none(),
            Value::Bytea(v) => v.is_none(),
            Value::Uuid(v) => v.is_none(),
            Value::Timestamptz(v) => v.is_none(),
            Value::Json(v) => v.is_none(),
        }
    }

    /// Text form used by `COPY ... (FORMAT csv)`; `None` for NULL.
    pub(crate) fn to_copy_text(&self) -> Option<String> {
        match self {
            Value::Null => None,
            Value::Bool(v) => v.map(|b| if b { "t".to_string() } else { "f".to_string() }),
            Value::Int2(v) => v.map(|n| n.to_string()),
            Value::Int4(v) => v.map(|n| n.to_string()),
            Value::Int8(v) => v.map(|n| n.to_string()),
            Value::Float4(v) => v.map(|n| n.to_string()),
            Value::Float8(v) => v.map(|n| n.to_string()),
            Value::Text(v) => v.clone(),
            Value::Bytea(v) => v.as_ref().map(|bytes| {
                let mut out = String::with_capacity(2 + bytes.len() * 2);
                out.push_str("\\x");
                for b in bytes {
                    out.push_str(&format!("{:02x}", b));
                }
                out
            }),
            Value::Uuid(v) => v.map(|u| u.to_string()),
            Value::Timestamptz(v) => v.map(|t| t.to_rfc3339()),
            Value::Json(v) => v.as_ref().map(|j| j.to_string()),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.to_copy_text() {
            Some(text) => match self {
                Value::Bytea(Some(bytes)) => write!(f, "<{} bytes>", bytes.len()),
                _ => f.write_str(&text),
            },
            None => f.write_str("NULL"),
        }
    }
}

macro_rules! value_from {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(
            impl From<$ty> for Value {
                fn from(v: $ty) -> Self {
                    Value::$variant(Some(v.into()))
                }
            }

            impl From<Option<$ty>> for Value {
                fn from(v: Option<$ty>) -> Self {
                    Value::$variant(v.map(Into::into))
                }
            }
        )*
    };
}

value_from! {
    bool => Bool,
    i16 => Int2,
    i32 => Int4,
    i64 => Int8,
    u32 => Int8,
    f32 => Float4,
    f64 => Float8,
    String => Text,
    &str => Text,
    Vec<u8> => Bytea,
    &[u8] => Bytea,
    Uuid => Uuid,
    DateTime<Utc> => Timestamptz,
    serde_json::Value => Json,
}

/// Build an argument list: `args![1_i64, "name", None::<i32>]`.
#[macro_export]
macro_rules! args {
    () => { ::std::vec::Vec::<$crate::Value>::new() };
    ($($arg:expr),+ $(,)?) => { vec![$($crate::Value::from($arg)),+] };
}

/// Bind `args` to `query` in order.
pub(crate) fn bind_all<'q>(
    mut query: Query<'q, Postgres, PgArguments>,
    args: &'q [Value],
) -> Query<'q, Postgres, PgArguments> {
    for arg in args {
        query = match arg {
            Value::Null => query.bind(None::<String>),
            Value::Bool(v) => query.bind(*v),
            Value::Int2(v) => query.bind(*v),
            Value::Int4(v) => query.bind(*v),
            Value::Int8(v) => query.bind(*v),
            Value::Float4(v) => query.bind(*v),
            Value::Float8(v) => query.bind(*v),
            Value::Text(v) => query.bind(v.as_deref()),
            Value::Bytea(v) => query.bind(v.as_deref()),
            Value::Uuid(v) => query.bind(*v),
            Value::Timestamptz(v) => query.bind(*v),
            Value::Json(v) => query.bind(v.as_ref().map(sqlx::types::Json)),
        };
    }
    query
}
