use std::sync::Arc;

use async_trait::async_trait;
use sqlx::postgres::PgRow;

use crate::conn::{Batch, BatchResults, CommandTag, Connection, Identifier};
use crate::env::Env;
use crate::error::{Error, Result};
use crate::provider::LargeObjects;
use crate::txmgr::TxOptions;
use crate::value::Value;

/// Connection that reports a precomputed error from every operation.
///
/// Returned when routing fails so call sites always get a connection-shaped
/// value; the error only surfaces once the connection is used.
#[derive(Debug, Clone)]
pub struct ErrorConnection {
    err: Arc<Error>,
}

impl ErrorConnection {
    pub fn new(err: Error) -> Self {
        let err = match err {
            Error::Shared(shared) => shared,
            other => Arc::new(other),
        };
        Self { err }
    }

    pub fn error(&self) -> &Error {
        &self.err
    }

    fn err(&self) -> Error {
        Error::Shared(self.err.clone())
    }
}

#[async_trait]
impl Connection for ErrorConnection {
    async fn exec(&self, _env: &Env, _sql: &str, _args: &[Value]) -> Result<CommandTag> {
        Err(self.err())
    }

    async fn query(&self, _env: &Env, _sql: &str, _args: &[Value]) -> Result<Vec<PgRow>> {
        Err(self.err())
    }

    async fn query_row(&self, _env: &Env, _sql: &str, _args: &[Value]) -> Result<PgRow> {
        Err(self.err())
    }

    async fn send_batch(&self, _env: &Env, _batch: &Batch) -> BatchResults {
        BatchResults::failed(self.err())
    }

    async fn copy_from(
        &self,
        _env: &Env,
        _table: &Identifier,
        _columns: &[&str],
        _rows: Vec<Vec<Value>>,
    ) -> Result<u64> {
        Err(self.err())
    }

    fn large_objects(&self) -> LargeObjects {
        panic!("failed to get large objects: {}", self.err)
    }

    fn in_transaction(&self) -> bool {
        false
    }

    fn transaction_options(&self) -> TxOptions {
        TxOptions::default()
    }

    fn without_transaction(&self, env: &Env) -> Env {
        env.clone()
    }
}
