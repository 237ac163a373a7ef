use std::sync::Arc;

use async_trait::async_trait;
use sqlx::postgres::PgRow;

use super::{prepare_bucket_sql_with, BucketId};
use crate::conn::{Batch, BatchResults, CommandTag, Connection, Identifier};
use crate::env::Env;
use crate::error::Result;
use crate::provider::LargeObjects;
use crate::txmgr::TxOptions;
use crate::value::Value;

/// Connection scoped to one bucket: placeholders in statement text and in
/// `COPY` table names are rewritten, and the bucket is recorded on the env
/// handed to the shard connection.
pub(crate) struct BucketConnection {
    inner: Box<dyn Connection>,
    bucket: BucketId,
    prefix: Arc<str>,
}

impl BucketConnection {
    pub(crate) fn new(inner: Box<dyn Connection>, bucket: BucketId, prefix: Arc<str>) -> Self {
        Self {
            inner,
            bucket,
            prefix,
        }
    }

    fn scoped(&self, env: &Env) -> Env {
        env.with_bucket(self.bucket)
    }

    fn rewrite(&self, sql: &str) -> String {
        prepare_bucket_sql_with(sql, &self.prefix, self.bucket)
    }
}

#[async_trait]
impl Connection for BucketConnection {
    async fn exec(&self, env: &Env, sql: &str, args: &[Value]) -> Result<CommandTag> {
        self.inner.exec(&self.scoped(env), &self.rewrite(sql), args).await
    }

    async fn query(&self, env: &Env, sql: &str, args: &[Value]) -> Result<Vec<PgRow>> {
        self.inner.query(&self.scoped(env), &self.rewrite(sql), args).await
    }

    async fn query_row(&self, env: &Env, sql: &str, args: &[Value]) -> Result<PgRow> {
        self.inner
            .query_row(&self.scoped(env), &self.rewrite(sql), args)
            .await
    }

    /// Batches are rewritten when statements are queued, so `batch` is sent as is.
    async fn send_batch(&self, env: &Env, batch: &Batch) -> BatchResults {
        self.inner.send_batch(&self.scoped(env), batch).await
    }

    async fn copy_from(
        &self,
        env: &Env,
        table: &Identifier,
        columns: &[&str],
        rows: Vec<Vec<Value>>,
    ) -> Result<u64> {
        let table = table.map_parts(|part| self.rewrite(part));
        self.inner
            .copy_from(&self.scoped(env), &table, columns, rows)
            .await
    }

    fn large_objects(&self) -> LargeObjects {
        self.inner.large_objects()
    }

    fn in_transaction(&self) -> bool {
        self.inner.in_transaction()
    }

    fn transaction_options(&self) -> TxOptions {
        self.inner.transaction_options()
    }

    fn without_transaction(&self, env: &Env) -> Env {
        self.inner.without_transaction(env)
    }
}
