use std::collections::BTreeMap;
use std::future::Future;

use futures::future::join_all;
use sqlx::postgres::PgRow;
use sqlx::FromRow;
use tracing::warn;

use super::BucketRouter;
use crate::conn::{Batch, BatchResults, CommandTag};
use crate::env::Env;
use crate::error::{Error, Result};
use crate::shard::ShardId;
use crate::value::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Open,
    Sent,
    Closed,
}

#[derive(Debug, Default)]
struct Slot {
    batch: Batch,
    results: Option<BatchResults>,
    processed: usize,
}

/// Statements for many keys, grouped into one batch per shard.
///
/// Queue statements, [`send`](ShardBatch::send) every shard's batch at once,
/// then read one result per queued statement. Results of one shard come back
/// in the order they were queued; the order across shards is unspecified.
pub struct ShardBatch<'r, K: ?Sized = str> {
    router: &'r BucketRouter<K>,
    slots: BTreeMap<ShardId, Slot>,
    state: State,
}

impl<'r, K: ?Sized> ShardBatch<'r, K> {
    pub fn new(router: &'r BucketRouter<K>) -> Self {
        Self {
            router,
            slots: BTreeMap::new(),
            state: State::Open,
        }
    }

    /// Queue `sql` for the bucket of `key`, rewriting its placeholder.
    pub fn queue(&mut self, key: &K, sql: &str, args: Vec<Value>) -> Result<()> {
        if self.state != State::Open {
            return Err(Error::BatchClosed);
        }
        let (shard, bucket) = self.router.bucket_by_key(key)?;
        let sql = self.router.prepare_sql(sql, bucket);
        self.slots.entry(shard).or_default().batch.queue(&sql, args);
        Ok(())
    }

    /// Statements queued across all shards.
    pub fn len(&self) -> usize {
        self.slots.values().map(|slot| slot.batch.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Send every shard's batch concurrently and wait for all of them.
    ///
    /// Per-shard failures are reported by the results of that shard.
    pub async fn send(&mut self, env: &Env) -> Result<()> {
        if self.state != State::Open {
            return Err(Error::BatchClosed);
        }
        env.check()?;

        let router = self.router;
        join_all(self.slots.iter_mut().map(|(shard, slot)| async move {
            let conn = router.shard_connection(env, *shard);
            slot.results = Some(conn.send_batch(env, &slot.batch).await);
        }))
        .await;

        self.state = State::Sent;
        Ok(())
    }

    fn next_result(&mut self) -> Result<&mut BatchResults> {
        match self.state {
            State::Closed => return Err(Error::BatchClosed),
            State::Open if self.is_empty() => return Err(Error::NoMoreResults),
            State::Open => return Err(Error::BatchNotSent),
            State::Sent => {}
        }

        let slot = self
            .slots
            .values_mut()
            .find(|slot| slot.processed < slot.batch.len())
            .ok_or(Error::NoMoreResults)?;
        slot.processed += 1;
        slot.results.as_mut().ok_or(Error::BatchNotSent)
    }

    pub fn exec(&mut self) -> Result<CommandTag> {
        self.next_result()?.exec()
    }

    pub fn query(&mut self) -> Result<Vec<PgRow>> {
        self.next_result()?.query()
    }

    pub fn query_row(&mut self) -> Result<PgRow> {
        self.next_result()?.query_row()
    }

    /// Release every shard's results and mark the batch unusable. Close
    /// errors of different shards are joined. Closing again is a no-op.
    pub fn close(&mut self) -> Result<()> {
        self.state = State::Closed;

        let errors = self
            .slots
            .iter_mut()
            .filter_map(|(shard, slot)| {
                let mut results = slot.results.take()?;
                results
                    .close()
                    .err()
                    .map(|err| Error::context(format!("failed to close batch of shard {shard}"), err))
            })
            .collect();

        match Error::join(errors) {
            None => Ok(()),
            Some(err) => Err(err),
        }
    }

    /// Send, execute every queued statement, then close.
    pub async fn exec_all(&mut self, env: &Env) -> Result<()> {
        self.send(env).await?;

        let mut outcome = Ok(());
        for _ in 0..self.len() {
            if let Err(err) = self.exec() {
                outcome = Err(err);
                break;
            }
        }
        self.finish(outcome)
    }

    /// Send, decode the rows of every result as `T` and hand them to `f`
    /// result by result, then close.
    pub async fn query_all_func<T, F, Fut>(&mut self, env: &Env, mut f: F) -> Result<()>
    where
        T: for<'row> FromRow<'row, PgRow>,
        F: FnMut(Env, Vec<T>) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        self.send(env).await?;

        let mut outcome = Ok(());
        for _ in 0..self.len() {
            let decoded = self.query().and_then(|rows| {
                rows.iter()
                    .map(|row| T::from_row(row).map_err(Error::from))
                    .collect::<Result<Vec<T>>>()
            });
            let step = match decoded {
                Ok(rows) => f(env.clone(), rows).await,
                Err(err) => Err(err),
            };
            if let Err(err) = step {
                outcome = Err(err);
                break;
            }
        }
        self.finish(outcome)
    }

    /// Send and append the rows of every result to `dst`, in the order the
    /// results were read.
    pub async fn query_all_into<T>(&mut self, env: &Env, dst: &mut Vec<T>) -> Result<()>
    where
        T: for<'row> FromRow<'row, PgRow>,
    {
        self.query_all_func(env, |_env, rows| {
            dst.extend(rows);
            std::future::ready(Ok(()))
        })
        .await
    }

    fn finish(&mut self, outcome: Result<()>) -> Result<()> {
        let closed = self.close();
        match (outcome, closed) {
            (Err(err), Err(close_err)) => {
                warn!(router = %self.router.name(), error = %close_err, "failed to close batch");
                Err(err)
            }
            (Err(err), Ok(())) | (Ok(()), Err(err)) => Err(err),
            (Ok(()), Ok(())) => Ok(()),
        }
    }
}
