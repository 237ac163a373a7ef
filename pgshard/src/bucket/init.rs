use tracing::{debug, error};

use super::BucketRouter;
use crate::env::Env;
use crate::error::{Error, Result};
use crate::shard::ShardId;
use crate::txmgr::TxOptions;

impl<K: ?Sized> BucketRouter<K> {
    /// Create every bucket schema and apply `sql` to it.
    ///
    /// `sql` addresses tables as `__bucket__.name`, e.g.
    /// `CREATE TABLE IF NOT EXISTS __bucket__.users (id BIGINT PRIMARY KEY)`.
    /// Shards are initialized concurrently; the buckets of one shard run one
    /// after another, each in its own transaction, since concurrent
    /// `CREATE SCHEMA` on one database contends for catalog locks.
    pub async fn init_cluster(&self, env: &Env, sql: &str) -> Result<()> {
        let res = self
            .run_shard_func(env, |env, shard, _conn| self.init_shard(env, shard, sql))
            .await;

        match &res {
            Ok(()) => debug!(router = %self.name(), "cluster initialized"),
            Err(err) => error!(router = %self.name(), error = %err, "failed to init cluster"),
        }
        res
    }

    async fn init_shard(&self, env: Env, shard: ShardId, sql: &str) -> Result<()> {
        let tx_manager = self
            .tx_manager(shard)
            .ok_or_else(|| Error::ShardNotFound { key: shard.to_string() })?;

        for bucket in self.buckets_of(shard) {
            env.check()?;
            let schema = self.schema(bucket);
            let prepared = self.prepare_sql(sql, bucket);

            tx_manager
                .begin(&env, TxOptions::default(), |tx_env| async move {
                    let conn = self.shard_connection(&tx_env, shard);
                    conn.exec(&tx_env, &format!("CREATE SCHEMA IF NOT EXISTS {schema}"), &[])
                        .await?;
                    conn.exec(&tx_env, &prepared, &[]).await?;
                    debug!(router = %self.name(), %shard, %bucket, "bucket initialized");
                    Ok(())
                })
                .await
                .map_err(|err| Error::context(format!("failed to init bucket {bucket}"), err))?;
        }
        Ok(())
    }
}
