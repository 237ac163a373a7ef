//! Connection surface shared by pooled, transactional, bucket-scoped and
//! failed connections.

mod batch;
mod error_conn;

use std::fmt;

use async_trait::async_trait;
use sqlx::postgres::PgRow;
use sqlx::FromRow;

use crate::env::Env;
use crate::error::{Error, Result};
use crate::provider::LargeObjects;
use crate::txmgr::TxOptions;
use crate::value::Value;

pub use batch::{Batch, BatchResults, Statement, StatementOutput};
pub use error_conn::ErrorConnection;

/// Outcome of a statement that does not return rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CommandTag {
    pub rows_affected: u64,
}

impl CommandTag {
    pub fn new(rows_affected: u64) -> Self {
        Self { rows_affected }
    }
}

impl From<sqlx::postgres::PgQueryResult> for CommandTag {
    fn from(res: sqlx::postgres::PgQueryResult) -> Self {
        Self::new(res.rows_affected())
    }
}

/// Possibly schema-qualified table name (`["bucket_3", "users"]`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identifier(pub Vec<String>);

impl Identifier {
    pub fn new<I, S>(parts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(parts.into_iter().map(Into::into).collect())
    }

    /// Quoted form safe to splice into SQL.
    pub fn sanitize(&self) -> String {
        self.0
            .iter()
            .map(|part| format!("\"{}\"", part.replace('\0', "").replace('"', "\"\"")))
            .collect::<Vec<_>>()
            .join(".")
    }

    pub(crate) fn map_parts(&self, f: impl Fn(&str) -> String) -> Self {
        Self(self.0.iter().map(|part| f(part)).collect())
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.join("."))
    }
}

impl From<&str> for Identifier {
    fn from(name: &str) -> Self {
        Self::new(name.split('.'))
    }
}

/// Statement execution plus transaction introspection.
///
/// A connection is a transient view: pooled when the environment it was
/// obtained with carries no transaction, bound to that transaction otherwise.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Execute a statement that returns no rows.
    async fn exec(&self, env: &Env, sql: &str, args: &[Value]) -> Result<CommandTag>;

    /// Execute a statement and collect its rows.
    async fn query(&self, env: &Env, sql: &str, args: &[Value]) -> Result<Vec<PgRow>>;

    /// First row of the result; [`Error::NoRows`] when there is none.
    async fn query_row(&self, env: &Env, sql: &str, args: &[Value]) -> Result<PgRow>;

    /// Run every statement of `batch` in order on one connection.
    async fn send_batch(&self, env: &Env, batch: &Batch) -> BatchResults;

    /// Bulk load `rows` into `table` with `COPY ... FROM STDIN`.
    async fn copy_from(
        &self,
        env: &Env,
        table: &Identifier,
        columns: &[&str],
        rows: Vec<Vec<Value>>,
    ) -> Result<u64>;

    /// Large-object access. Only available inside a transaction.
    ///
    /// # Panics
    ///
    /// Panics when the connection is not transactional.
    fn large_objects(&self) -> LargeObjects;

    fn in_transaction(&self) -> bool;

    /// Options of the bound transaction; defaults when not transactional.
    fn transaction_options(&self) -> TxOptions;

    fn without_transaction(&self, env: &Env) -> Env {
        env.without_transaction()
    }
}

/// Typed decoding helpers available on every connection.
#[async_trait]
pub trait ConnectionExt: Connection {
    async fn query_as<T>(&self, env: &Env, sql: &str, args: &[Value]) -> Result<Vec<T>>
    where
        T: for<'r> FromRow<'r, PgRow> + Send + Unpin,
    {
        let rows = self.query(env, sql, args).await?;
        rows.iter()
            .map(|row| T::from_row(row).map_err(Error::from))
            .collect()
    }

    async fn query_row_as<T>(&self, env: &Env, sql: &str, args: &[Value]) -> Result<T>
    where
        T: for<'r> FromRow<'r, PgRow> + Send + Unpin,
    {
        let row = self.query_row(env, sql, args).await?;
        T::from_row(&row).map_err(Error::from)
    }
}

impl<C: Connection + ?Sized> ConnectionExt for C {}
