//! In-memory providers for unit tests.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use async_trait::async_trait;
use sqlx::postgres::PgRow;

use crate::bucket::BucketId;
use crate::conn::{Batch, BatchResults, CommandTag, Connection, Identifier, StatementOutput};
use crate::env::Env;
use crate::error::{Error, Result};
use crate::provider::{ConnectionProvider, LargeObjects, ProviderId, TxHandle};
use crate::shard::{ShardId, ShardInfo};
use crate::txmgr::{TransactionBeginner, TransactionInformer, TxFinisher, TxOptions};
use crate::value::Value;

/// One statement seen by a fake connection.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Executed {
    pub shard: ShardId,
    pub sql: String,
    pub args: Vec<Value>,
    pub bucket: Option<BucketId>,
    pub in_tx: bool,
}

/// Provider double with begin/commit/rollback spies.
///
/// Statements succeed with `rows_affected` equal to their first integer
/// argument (0 without one) unless their SQL contains `fail_on`.
pub(crate) struct FakeProvider {
    me: Weak<FakeProvider>,
    id: ProviderId,
    shard: ShardId,
    pub begins: AtomicUsize,
    pub commits: AtomicUsize,
    pub rollbacks: AtomicUsize,
    pub starts: AtomicUsize,
    pub stops: AtomicUsize,
    pub fail_rollback: AtomicBool,
    pub fail_start: AtomicBool,
    open: AtomicUsize,
    fail_on: Mutex<Option<String>>,
    log: Mutex<Vec<Executed>>,
}

impl FakeProvider {
    pub(crate) fn new(shard: u32) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            id: ProviderId::next(),
            shard: ShardId(shard),
            begins: AtomicUsize::new(0),
            commits: AtomicUsize::new(0),
            rollbacks: AtomicUsize::new(0),
            starts: AtomicUsize::new(0),
            stops: AtomicUsize::new(0),
            fail_rollback: AtomicBool::new(false),
            fail_start: AtomicBool::new(false),
            open: AtomicUsize::new(0),
            fail_on: Mutex::new(None),
            log: Mutex::new(Vec::new()),
        })
    }

    pub(crate) fn info(self: &Arc<Self>) -> ShardInfo {
        ShardInfo::from_provider(self.shard, self.clone())
    }

    /// Transactions begun and not yet finished.
    pub(crate) fn acquired(&self) -> usize {
        self.open.load(Ordering::SeqCst)
    }

    pub(crate) fn fail_on(&self, needle: &str) {
        *self.fail_on.lock().unwrap_or_else(PoisonError::into_inner) = Some(needle.to_string());
    }

    pub(crate) fn executed(&self) -> Vec<Executed> {
        self.log.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn run(&self, env: &Env, sql: &str, args: &[Value]) -> Result<StatementOutput> {
        env.check()?;
        let in_tx = match env.transaction() {
            Some(tx) => {
                tx.assert_owner(self.id, &self.shard.to_string());
                true
            }
            None => false,
        };
        self.log
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Executed {
                shard: self.shard,
                sql: sql.to_string(),
                args: args.to_vec(),
                bucket: env.bucket(),
                in_tx,
            });

        let fail = self
            .fail_on
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_deref()
            .is_some_and(|needle| sql.contains(needle));
        if fail {
            return Err(Error::other(format!("injected failure on shard {}", self.shard)));
        }

        let rows_affected = args
            .iter()
            .find_map(|arg| match arg {
                Value::Int8(Some(n)) => Some(*n as u64),
                Value::Int4(Some(n)) => Some(*n as u64),
                _ => None,
            })
            .unwrap_or(0);
        Ok(StatementOutput {
            tag: CommandTag::new(rows_affected),
            rows: Vec::new(),
        })
    }

    fn finish(&self) {
        self.open.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl ConnectionProvider for FakeProvider {
    fn name(&self) -> &str {
        "fake"
    }

    async fn start(&self, env: &Env) -> Result<()> {
        env.check()?;
        self.starts.fetch_add(1, Ordering::SeqCst);
        if self.fail_start.load(Ordering::SeqCst) {
            return Err(Error::config(format!("shard {} refused to start", self.shard)));
        }
        Ok(())
    }

    async fn stop(&self, _env: &Env) -> Result<()> {
        self.stops.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn connection(&self, env: &Env) -> Box<dyn Connection> {
        let tx = env
            .transaction()
            .filter(|tx| tx.owner() == self.id)
            .map(|tx| tx.options());
        match self.me.upgrade() {
            Some(provider) => Box::new(FakeConnection { provider, tx }),
            None => Box::new(crate::conn::ErrorConnection::new(Error::NotStarted {
                name: "fake".into(),
            })),
        }
    }
}

impl TransactionInformer for FakeProvider {
    fn in_transaction(&self, env: &Env) -> bool {
        env.transaction().is_some_and(|tx| tx.owner() == self.id)
    }

    fn transaction_options(&self, env: &Env) -> TxOptions {
        env.transaction()
            .filter(|tx| tx.owner() == self.id)
            .map(|tx| tx.options())
            .unwrap_or_default()
    }
}

#[async_trait]
impl TransactionBeginner for FakeProvider {
    async fn begin_tx(&self, env: &Env, opts: TxOptions) -> Result<(Env, Box<dyn TxFinisher>)> {
        env.check()?;
        let provider = self.me.upgrade().ok_or(Error::NotStarted {
            name: "fake".into(),
        })?;
        self.begins.fetch_add(1, Ordering::SeqCst);
        self.open.fetch_add(1, Ordering::SeqCst);

        let handle = Arc::new(TxHandle::detached(self.id, opts));
        Ok((
            env.with_transaction(handle),
            Box::new(FakeFinisher { provider }),
        ))
    }
}

struct FakeFinisher {
    provider: Arc<FakeProvider>,
}

#[async_trait]
impl TxFinisher for FakeFinisher {
    async fn commit(self: Box<Self>) -> Result<()> {
        self.provider.commits.fetch_add(1, Ordering::SeqCst);
        self.provider.finish();
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        self.provider.rollbacks.fetch_add(1, Ordering::SeqCst);
        self.provider.finish();
        if self.provider.fail_rollback.load(Ordering::SeqCst) {
            return Err(Error::TransactionClosed);
        }
        Ok(())
    }
}

struct FakeConnection {
    provider: Arc<FakeProvider>,
    tx: Option<TxOptions>,
}

#[async_trait]
impl Connection for FakeConnection {
    async fn exec(&self, env: &Env, sql: &str, args: &[Value]) -> Result<CommandTag> {
        tokio::task::yield_now().await;
        self.provider.run(env, sql, args).map(|out| out.tag)
    }

    async fn query(&self, env: &Env, sql: &str, args: &[Value]) -> Result<Vec<PgRow>> {
        tokio::task::yield_now().await;
        self.provider.run(env, sql, args).map(|out| out.rows)
    }

    async fn query_row(&self, env: &Env, sql: &str, args: &[Value]) -> Result<PgRow> {
        self.query(env, sql, args)
            .await?
            .into_iter()
            .next()
            .ok_or(Error::NoRows)
    }

    async fn send_batch(&self, env: &Env, batch: &Batch) -> BatchResults {
        tokio::task::yield_now().await;
        let mut failed = false;
        let items = batch
            .statements()
            .iter()
            .enumerate()
            .map(|(index, stmt)| {
                if failed {
                    return Err(Error::BatchAborted { index });
                }
                let res = self.provider.run(env, &stmt.sql, &stmt.args);
                failed = res.is_err();
                res
            })
            .collect::<Vec<_>>();
        BatchResults::new(items)
    }

    async fn copy_from(
        &self,
        env: &Env,
        table: &Identifier,
        columns: &[&str],
        rows: Vec<Vec<Value>>,
    ) -> Result<u64> {
        let sql = format!("COPY {} ({})", table, columns.join(", "));
        self.provider.run(env, &sql, &[])?;
        Ok(rows.len() as u64)
    }

    fn large_objects(&self) -> LargeObjects {
        panic!("large objects are not available on fake connections")
    }

    fn in_transaction(&self) -> bool {
        self.tx.is_some()
    }

    fn transaction_options(&self) -> TxOptions {
        self.tx.unwrap_or_default()
    }
}
