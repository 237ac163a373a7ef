use async_trait::async_trait;
use sqlx::pool::PoolConnection;
use sqlx::postgres::{PgPool, PgRow, Postgres};

use super::exec::{self, QueryLog};
use super::LargeObjects;
use crate::conn::{Batch, BatchResults, CommandTag, Connection, Identifier, StatementOutput};
use crate::env::Env;
use crate::error::{Error, Result};
use crate::txmgr::TxOptions;
use crate::value::Value;

/// Connection that checks a pooled connection out per statement.
pub(crate) struct PooledConnection {
    pool: PgPool,
    log: QueryLog,
}

impl PooledConnection {
    pub(crate) fn new(pool: PgPool, log: QueryLog) -> Self {
        Self { pool, log }
    }

    async fn acquire(&self, env: &Env) -> Result<PoolConnection<Postgres>> {
        env.guard(async { Ok(self.pool.acquire().await?) }).await
    }

    async fn batch_in_implicit_tx(
        &self,
        env: &Env,
        batch: &Batch,
    ) -> Result<Vec<Result<StatementOutput>>> {
        let mut tx = env
            .guard(async { self.pool.begin().await.map_err(Error::Begin) })
            .await?;
        let (items, failed) = exec::run_batch(&mut tx, env, batch).await;
        if failed {
            tx.rollback().await.map_err(Error::Rollback)?;
        } else {
            tx.commit().await.map_err(Error::Commit)?;
        }
        Ok(items)
    }
}

#[async_trait]
impl Connection for PooledConnection {
    async fn exec(&self, env: &Env, sql: &str, args: &[Value]) -> Result<CommandTag> {
        env.check()?;
        self.log
            .run(env, "exec", sql, args, async {
                let mut conn = self.acquire(env).await?;
                exec::execute(&mut conn, sql, args).await
            })
            .await
    }

    async fn query(&self, env: &Env, sql: &str, args: &[Value]) -> Result<Vec<PgRow>> {
        env.check()?;
        self.log
            .run(env, "query", sql, args, async {
                let mut conn = self.acquire(env).await?;
                exec::fetch_all(&mut conn, sql, args).await
            })
            .await
    }

    async fn query_row(&self, env: &Env, sql: &str, args: &[Value]) -> Result<PgRow> {
        env.check()?;
        self.log
            .run(env, "query_row", sql, args, async {
                let mut conn = self.acquire(env).await?;
                exec::fetch_one(&mut conn, sql, args).await
            })
            .await
    }

    async fn send_batch(&self, env: &Env, batch: &Batch) -> BatchResults {
        if batch.is_empty() {
            return BatchResults::new(Vec::new());
        }
        let started = self.log.start();
        match self.batch_in_implicit_tx(env, batch).await {
            Ok(items) => {
                self.log.batch(env, batch, started, exec::first_error(&items));
                BatchResults::new(items)
            }
            Err(err) => {
                self.log.batch(env, batch, started, Some(&err));
                BatchResults::failed(err)
            }
        }
    }

    async fn copy_from(
        &self,
        env: &Env,
        table: &Identifier,
        columns: &[&str],
        rows: Vec<Vec<Value>>,
    ) -> Result<u64> {
        env.check()?;
        let command = exec::copy_statement(table, columns);
        self.log
            .run(env, "copy", &command, &[], async {
                let mut conn = self.acquire(env).await?;
                exec::copy_rows(&mut conn, &command, &rows).await
            })
            .await
    }

    fn large_objects(&self) -> LargeObjects {
        panic!("large objects are only available inside a transaction")
    }

    fn in_transaction(&self) -> bool {
        false
    }

    fn transaction_options(&self) -> TxOptions {
        TxOptions::default()
    }
}
