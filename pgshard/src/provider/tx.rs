use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use sqlx::postgres::types::Oid;
use sqlx::postgres::{PgConnection, PgRow, Postgres};
use sqlx::Transaction;
use tokio::sync::{Mutex, MutexGuard};

use super::exec::{self, QueryLog};
use super::ProviderId;
use crate::conn::{Batch, BatchResults, CommandTag, Connection, Identifier};
use crate::env::Env;
use crate::error::{Error, Result};
use crate::txmgr::TxOptions;
use crate::value::Value;

type TxSlot = Option<Transaction<'static, Postgres>>;

/// Open transaction carried by an [`Env`].
///
/// Statements issued through the environment serialize on the inner mutex.
/// Once committed or rolled back the slot is empty and every further use
/// fails with [`Error::TransactionClosed`].
pub struct TxHandle {
    owner: ProviderId,
    options: TxOptions,
    inner: Mutex<TxSlot>,
}

impl TxHandle {
    pub(crate) fn new(owner: ProviderId, options: TxOptions, tx: Transaction<'static, Postgres>) -> Self {
        Self {
            owner,
            options,
            inner: Mutex::new(Some(tx)),
        }
    }

    /// Handle with no database transaction behind it, for in-crate fakes.
    #[cfg(test)]
    pub(crate) fn detached(owner: ProviderId, options: TxOptions) -> Self {
        Self {
            owner,
            options,
            inner: Mutex::new(None),
        }
    }

    pub(crate) fn owner(&self) -> ProviderId {
        self.owner
    }

    pub(crate) fn options(&self) -> TxOptions {
        self.options
    }

    /// Panics when the handle was opened by another provider.
    pub(crate) fn assert_owner(&self, provider: ProviderId, database: &str) {
        if self.owner != provider {
            panic!(
                "transaction opened by provider {} used with database {database} (provider {provider})",
                self.owner
            );
        }
    }

    pub(crate) async fn lock(&self) -> MutexGuard<'_, TxSlot> {
        self.inner.lock().await
    }

    pub(crate) async fn take(&self) -> Option<Transaction<'static, Postgres>> {
        self.inner.lock().await.take()
    }

    /// Drop the transaction without waiting; sqlx rolls it back when the
    /// connection returns to the pool.
    pub(crate) fn abandon(&self) -> bool {
        match self.inner.try_lock() {
            Ok(mut slot) => slot.take().is_some(),
            Err(_) => false,
        }
    }
}

impl fmt::Debug for TxHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TxHandle")
            .field("owner", &self.owner)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

fn live<'g>(slot: &'g mut MutexGuard<'_, TxSlot>) -> Result<&'g mut PgConnection> {
    match slot.as_mut() {
        Some(tx) => Ok(&mut **tx),
        None => Err(Error::TransactionClosed),
    }
}

/// Connection bound to the transaction carried by the environment.
pub(crate) struct TransactionalConnection {
    tx: Arc<TxHandle>,
    log: QueryLog,
}

impl TransactionalConnection {
    pub(crate) fn new(tx: Arc<TxHandle>, log: QueryLog) -> Self {
        Self { tx, log }
    }
}

#[async_trait]
impl Connection for TransactionalConnection {
    async fn exec(&self, env: &Env, sql: &str, args: &[Value]) -> Result<CommandTag> {
        env.check()?;
        self.log
            .run(env, "exec", sql, args, async {
                let mut slot = self.tx.lock().await;
                exec::execute(live(&mut slot)?, sql, args).await
            })
            .await
    }

    async fn query(&self, env: &Env, sql: &str, args: &[Value]) -> Result<Vec<PgRow>> {
        env.check()?;
        self.log
            .run(env, "query", sql, args, async {
                let mut slot = self.tx.lock().await;
                exec::fetch_all(live(&mut slot)?, sql, args).await
            })
            .await
    }

    async fn query_row(&self, env: &Env, sql: &str, args: &[Value]) -> Result<PgRow> {
        env.check()?;
        self.log
            .run(env, "query_row", sql, args, async {
                let mut slot = self.tx.lock().await;
                exec::fetch_one(live(&mut slot)?, sql, args).await
            })
            .await
    }

    async fn send_batch(&self, env: &Env, batch: &Batch) -> BatchResults {
        if batch.is_empty() {
            return BatchResults::new(Vec::new());
        }
        let started = self.log.start();
        let mut slot = self.tx.lock().await;
        let items = match live(&mut slot) {
            Ok(conn) => exec::run_batch(conn, env, batch).await.0,
            Err(err) => return BatchResults::failed(err),
        };
        drop(slot);
        self.log.batch(env, batch, started, exec::first_error(&items));
        BatchResults::new(items)
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
                let mut slot = self.tx.lock().await;
                exec::copy_rows(live(&mut slot)?, &command, &rows).await
            })
            .await
    }

    fn large_objects(&self) -> LargeObjects {
        LargeObjects {
            tx: self.tx.clone(),
        }
    }

    fn in_transaction(&self) -> bool {
        true
    }

    fn transaction_options(&self) -> TxOptions {
        self.tx.options()
    }
}

/// Server-side large objects, accessed through the owning transaction.
#[derive(Debug, Clone)]
pub struct LargeObjects {
    tx: Arc<TxHandle>,
}

impl LargeObjects {
    /// Create an empty large object and return its oid.
    pub async fn create(&self, env: &Env) -> Result<Oid> {
        env.check()?;
        let mut slot = self.tx.lock().await;
        let (oid,): (Oid,) = sqlx::query_as("SELECT lo_create(0)")
            .fetch_one(live(&mut slot)?)
            .await?;
        Ok(oid)
    }

    /// Write `data` at byte `offset`, growing the object as needed.
    pub async fn write(&self, env: &Env, oid: Oid, offset: i64, data: &[u8]) -> Result<()> {
        env.check()?;
        let mut slot = self.tx.lock().await;
        sqlx::query("SELECT lo_put($1, $2, $3)")
            .bind(oid)
            .bind(offset)
            .bind(data)
            .execute(live(&mut slot)?)
            .await?;
        Ok(())
    }

    /// Read up to `len` bytes starting at `offset`.
    pub async fn read(&self, env: &Env, oid: Oid, offset: i64, len: i32) -> Result<Vec<u8>> {
        env.check()?;
        let mut slot = self.tx.lock().await;
        let (data,): (Vec<u8>,) = sqlx::query_as("SELECT lo_get($1, $2, $3)")
            .bind(oid)
            .bind(offset)
            .bind(len)
            .fetch_one(live(&mut slot)?)
            .await?;
        Ok(data)
    }

    pub async fn read_all(&self, env: &Env, oid: Oid) -> Result<Vec<u8>> {
        env.check()?;
        let mut slot = self.tx.lock().await;
        let (data,): (Vec<u8>,) = sqlx::query_as("SELECT lo_get($1)")
            .bind(oid)
            .fetch_one(live(&mut slot)?)
            .await?;
        Ok(data)
    }

    pub async fn unlink(&self, env: &Env, oid: Oid) -> Result<()> {
        env.check()?;
        let mut slot = self.tx.lock().await;
        sqlx::query("SELECT lo_unlink($1)")
            .bind(oid)
            .execute(live(&mut slot)?)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn detached_handle_reports_closed() {
        let handle = Arc::new(TxHandle::detached(ProviderId::next(), TxOptions::read_only()));
        let conn = TransactionalConnection::new(handle.clone(), QueryLog::new("shard-1", false));
        let env = Env::new();

        assert!(conn.in_transaction());
        assert_eq!(conn.transaction_options(), TxOptions::read_only());
        assert!(matches!(
            conn.exec(&env, "SELECT 1", &[]).await,
            Err(Error::TransactionClosed)
        ));

        let mut results = conn.send_batch(&env, &{
            let mut batch = Batch::unscoped();
            batch.queue("SELECT 1", Vec::new());
            batch
        })
        .await;
        assert!(matches!(results.exec(), Err(Error::Shared(_))));
        assert!(!handle.abandon());
    }

    #[test]
    #[should_panic(expected = "used with database shard-2")]
    fn foreign_handle_panics() {
        let handle = TxHandle::detached(ProviderId::next(), TxOptions::default());
        handle.assert_owner(ProviderId::next(), "shard-2");
    }
}
