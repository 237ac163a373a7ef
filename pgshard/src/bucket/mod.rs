//! Bucket routing
//!
//! Application keys hash to a fixed number of buckets; contiguous bucket
//! ranges are assigned to shards. Every bucket lives in its own schema
//! (`bucket_<id>` by default) and statements address it through the
//! `__bucket__` placeholder, rewritten before they reach the database.

mod init;
mod shard_batch;
mod wrapper;

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use sqlx::postgres::PgRow;
use tracing::{debug, warn};

use crate::conn::{Batch, BatchResults, CommandTag, Connection, ErrorConnection, Identifier};
use crate::env::Env;
use crate::error::{Error, Result};
use crate::fanout::run_bounded;
use crate::provider::LargeObjects;
use crate::shard::{ShardId, ShardRegistry};
use crate::txmgr::{TransactionManager, TxFinisher, TxOptions};
use crate::value::Value;

pub use shard_batch::ShardBatch;

pub(crate) use wrapper::BucketConnection;

/// Placeholder standing for the current bucket schema in SQL text.
pub const BUCKET_ALIAS: &str = "__bucket__";

/// Default prefix of bucket schema names.
pub const BUCKET_PREFIX: &str = "bucket_";

/// Upper bound on the number of buckets one router may address.
pub const MAX_BUCKETS: u32 = 1 << 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BucketId(pub u32);

impl BucketId {
    /// Schema name under the default prefix.
    pub fn schema(self) -> String {
        format!("{BUCKET_PREFIX}{}", self.0)
    }
}

impl fmt::Display for BucketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Replace every bucket placeholder in `sql` with the schema of `bucket`.
///
/// Plain text substitution: the placeholder must not appear inside literals.
pub fn prepare_bucket_sql(sql: &str, bucket: BucketId) -> String {
    prepare_bucket_sql_with(sql, BUCKET_PREFIX, bucket)
}

pub(crate) fn prepare_bucket_sql_with(sql: &str, prefix: &str, bucket: BucketId) -> String {
    sql.replace(BUCKET_ALIAS, &format!("{prefix}{}", bucket.0))
}

/// Closed interval `[from, to]` of bucket ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BucketRange {
    pub from: BucketId,
    pub to: BucketId,
}

impl BucketRange {
    pub fn new(from: u32, to: u32) -> Self {
        Self {
            from: BucketId(from),
            to: BucketId(to),
        }
    }

    /// Zero for a reversed range. Wide enough for `0..=u32::MAX`.
    pub fn count(&self) -> u64 {
        if self.to < self.from {
            0
        } else {
            u64::from(self.to.0) - u64::from(self.from.0) + 1
        }
    }

    pub fn contains(&self, bucket: BucketId) -> bool {
        bucket >= self.from && bucket <= self.to
    }

    pub fn iter(&self) -> impl Iterator<Item = BucketId> {
        (self.from.0..=self.to.0).map(BucketId)
    }
}

/// Buckets hosted by one shard.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BucketInfo {
    pub shard: ShardId,
    pub range: BucketRange,
}

impl BucketInfo {
    pub fn new(shard: ShardId, range: BucketRange) -> Self {
        Self { shard, range }
    }
}

pub fn bucket_count(buckets: &[BucketInfo]) -> u64 {
    buckets.iter().map(|info| info.range.count()).sum()
}

/// Ranges must be well formed, disjoint, cover `0..n` without gaps, name
/// registered shards and stay within [`MAX_BUCKETS`]. Returns `n`.
pub(crate) fn validate_ranges(name: &str, buckets: &[BucketInfo], registry: &ShardRegistry) -> Result<u32> {
    if buckets.is_empty() {
        return Err(Error::config(format!("bucket router {name}: no bucket ranges")));
    }
    let total = bucket_count(buckets);
    if total > u64::from(MAX_BUCKETS) {
        return Err(Error::config(format!(
            "bucket router {name}: {total} buckets exceed the limit of {MAX_BUCKETS}"
        )));
    }

    let mut sorted = buckets.to_vec();
    sorted.sort_by_key(|info| info.range.from);

    let mut next = 0u32;
    for info in &sorted {
        let BucketRange { from, to } = info.range;
        if from > to {
            return Err(Error::config(format!(
                "bucket router {name}: range {from}..={to} of shard {} is reversed",
                info.shard
            )));
        }
        if from.0 < next {
            return Err(Error::config(format!(
                "bucket router {name}: range {from}..={to} of shard {} overlaps bucket {}",
                info.shard,
                next - 1
            )));
        }
        if from.0 > next {
            return Err(Error::config(format!(
                "bucket router {name}: buckets {next}..{from} are not assigned"
            )));
        }
        if !registry.contains(info.shard) {
            return Err(Error::config(format!(
                "bucket router {name}: shard {} is not registered",
                info.shard
            )));
        }
        next = to.0.saturating_add(1);
    }
    Ok(next)
}

/// 32-bit FNV-1a fed through `fmt::Write`, so any `Display` key hashes
/// without an intermediate allocation.
struct Fnv1a(u32);

impl Fnv1a {
    const OFFSET: u32 = 0x811c_9dc5;
    const PRIME: u32 = 0x0100_0193;

    fn new() -> Self {
        Self(Self::OFFSET)
    }
}

impl fmt::Write for Fnv1a {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for byte in s.bytes() {
            self.0 ^= u32::from(byte);
            self.0 = self.0.wrapping_mul(Self::PRIME);
        }
        Ok(())
    }
}

fn fnv1a<T: fmt::Display + ?Sized>(key: &T) -> u32 {
    use fmt::Write;

    let mut hasher = Fnv1a::new();
    // Fnv1a::write_str never fails.
    let _ = write!(hasher, "{key}");
    hasher.0
}

/// Spread keys over `n` buckets by the FNV-1a hash of their string form.
/// Keys with equal string forms share a bucket whatever their type.
///
/// # Panics
///
/// Panics when `n` is zero.
pub fn uniform_bucket_fn<K>(n: u32) -> impl Fn(&K) -> BucketId + Clone + Send + Sync + 'static
where
    K: fmt::Display + ?Sized + 'static,
{
    assert!(n > 0, "bucket count must be positive");
    move |key: &K| BucketId(fnv1a(key) % n)
}

/// Router settings.
#[derive(Debug, Clone)]
pub struct RouterOptions {
    /// Name used in logs.
    pub name: String,
    /// Maximum concurrent callbacks in [`BucketRouter::run_bucket_func`]; 0 runs them in sequence.
    pub run_limit: usize,
    /// Prefix of bucket schema names.
    pub schema_prefix: String,
}

impl Default for RouterOptions {
    fn default() -> Self {
        Self {
            name: "bucket_db".to_string(),
            run_limit: 10,
            schema_prefix: BUCKET_PREFIX.to_string(),
        }
    }
}

/// Hook run by [`BucketRouter::start`] once every shard is up.
pub type RouterAfterStart<K> =
    Arc<dyn for<'a> Fn(&'a Env, &'a BucketRouter<K>) -> BoxFuture<'a, Result<()>> + Send + Sync>;

/// Routes keys of type `K` to buckets and buckets to shards.
///
/// Bucket ranges are validated at construction: they must be well formed,
/// disjoint, cover `0..bucket_count` without gaps and name registered shards.
pub struct BucketRouter<K: ?Sized = str> {
    registry: ShardRegistry,
    buckets: Vec<BucketInfo>,
    shard_by_bucket: Vec<ShardId>,
    key_fn: Arc<dyn Fn(&K) -> BucketId + Send + Sync>,
    options: RouterOptions,
    prefix: Arc<str>,
    after_start: Option<RouterAfterStart<K>>,
}

impl<K: ?Sized> BucketRouter<K> {
    pub fn new<F>(
        registry: ShardRegistry,
        buckets: Vec<BucketInfo>,
        key_fn: F,
        options: RouterOptions,
    ) -> Result<Self>
    where
        F: Fn(&K) -> BucketId + Send + Sync + 'static,
    {
        let name = &options.name;
        if options.schema_prefix.is_empty() {
            return Err(Error::config(format!("bucket router {name}: empty schema prefix")));
        }
        validate_ranges(name, &buckets, &registry)?;

        let mut sorted = buckets.clone();
        sorted.sort_by_key(|info| info.range.from);

        let shard_by_bucket = sorted
            .iter()
            .flat_map(|info| info.range.iter().map(move |_| info.shard))
            .collect();
        let prefix = Arc::from(options.schema_prefix.as_str());

        Ok(Self {
            registry,
            buckets,
            shard_by_bucket,
            key_fn: Arc::new(key_fn),
            options,
            prefix,
            after_start: None,
        })
    }

    /// Run `f` after the shards started. When it fails the shards are
    /// stopped again and `start` returns its error.
    ///
    /// ```ignore
    /// let router = router.with_after_start(|env, router| {
    ///     Box::pin(async move { router.init_cluster(env, SCHEMA).await })
    /// });
    /// ```
    pub fn with_after_start<F>(mut self, f: F) -> Self
    where
        F: for<'a> Fn(&'a Env, &'a BucketRouter<K>) -> BoxFuture<'a, Result<()>> + Send + Sync + 'static,
    {
        self.after_start = Some(Arc::new(f));
        self
    }

    pub fn name(&self) -> &str {
        &self.options.name
    }

    pub fn options(&self) -> &RouterOptions {
        &self.options
    }

    pub fn registry(&self) -> &ShardRegistry {
        &self.registry
    }

    pub fn buckets(&self) -> &[BucketInfo] {
        &self.buckets
    }

    pub fn bucket_count(&self) -> u32 {
        self.shard_by_bucket.len() as u32
    }

    pub fn tx_manager(&self, shard: ShardId) -> Option<&TransactionManager> {
        self.registry.tx_manager(shard)
    }

    /// Shard hosting `bucket`.
    pub fn shard_of(&self, bucket: BucketId) -> Result<ShardId> {
        self.shard_by_bucket
            .get(bucket.0 as usize)
            .copied()
            .ok_or(Error::BucketNotFound { bucket })
    }

    /// Shard and bucket `key` routes to.
    pub fn bucket_by_key(&self, key: &K) -> Result<(ShardId, BucketId)> {
        let bucket = (self.key_fn)(key);
        Ok((self.shard_of(bucket)?, bucket))
    }

    /// Buckets hosted by `shard`, in ascending order.
    pub fn buckets_of(&self, shard: ShardId) -> impl Iterator<Item = BucketId> + '_ {
        self.shard_by_bucket
            .iter()
            .enumerate()
            .filter(move |(_, owner)| **owner == shard)
            .map(|(bucket, _)| BucketId(bucket as u32))
    }

    /// Schema of `bucket` under this router's prefix.
    pub fn schema(&self, bucket: BucketId) -> String {
        format!("{}{}", self.prefix, bucket.0)
    }

    pub fn prepare_sql(&self, sql: &str, bucket: BucketId) -> String {
        prepare_bucket_sql_with(sql, &self.prefix, bucket)
    }

    /// Bucket-scoped connection for `key`. Routing failures surface on use.
    pub fn connection(&self, env: &Env, key: &K) -> Box<dyn Connection> {
        match self.bucket_by_key(key) {
            Ok((shard, bucket)) => self.scoped(env, shard, bucket),
            Err(err) => Box::new(ErrorConnection::new(err)),
        }
    }

    pub fn bucket_connection(&self, env: &Env, bucket: BucketId) -> Box<dyn Connection> {
        match self.shard_of(bucket) {
            Ok(shard) => self.scoped(env, shard, bucket),
            Err(err) => Box::new(ErrorConnection::new(err)),
        }
    }

    /// Unscoped connection to one shard; placeholders are not rewritten.
    pub fn shard_connection(&self, env: &Env, shard: ShardId) -> Box<dyn Connection> {
        self.registry.connection_by_id(env, shard)
    }

    fn scoped(&self, env: &Env, shard: ShardId, bucket: BucketId) -> Box<dyn Connection> {
        Box::new(BucketConnection::new(
            self.shard_connection(env, shard),
            bucket,
            self.prefix.clone(),
        ))
    }

    pub async fn exec(&self, env: &Env, key: &K, sql: &str, args: &[Value]) -> Result<CommandTag> {
        self.connection(env, key).exec(env, sql, args).await
    }

    pub async fn query(&self, env: &Env, key: &K, sql: &str, args: &[Value]) -> Result<Vec<PgRow>> {
        self.connection(env, key).query(env, sql, args).await
    }

    pub async fn query_row(&self, env: &Env, key: &K, sql: &str, args: &[Value]) -> Result<PgRow> {
        self.connection(env, key).query_row(env, sql, args).await
    }

    /// Send a batch built with [`BucketRouter::new_batch`] to the shard of `key`.
    pub async fn send_batch(&self, env: &Env, key: &K, batch: &Batch) -> BatchResults {
        self.connection(env, key).send_batch(env, batch).await
    }

    /// Bulk load into `table`; a `__bucket__` schema part is rewritten.
    pub async fn copy_from(
        &self,
        env: &Env,
        key: &K,
        table: &Identifier,
        columns: &[&str],
        rows: Vec<Vec<Value>>,
    ) -> Result<u64> {
        self.connection(env, key)
            .copy_from(env, table, columns, rows)
            .await
    }

    /// # Panics
    ///
    /// Panics unless `env` carries a transaction of the shard `key` routes to.
    pub fn large_objects(&self, env: &Env, key: &K) -> LargeObjects {
        self.connection(env, key).large_objects()
    }

    /// Batch whose statements are rewritten for `bucket` under this router's prefix.
    pub fn new_batch(&self, bucket: BucketId) -> Batch {
        Batch::with_prefix(bucket, self.prefix.clone())
    }

    pub fn shard_batch(&self) -> ShardBatch<'_, K> {
        ShardBatch::new(self)
    }

    fn key_tx_manager(&self, key: &K) -> Result<&TransactionManager> {
        let (shard, _) = self.bucket_by_key(key)?;
        self.registry
            .tx_manager(shard)
            .ok_or_else(|| Error::ShardNotFound { key: shard.to_string() })
    }

    /// Run `body` in a transaction on the shard `key` routes to.
    pub async fn begin<T, F, Fut>(&self, env: &Env, key: &K, opts: TxOptions, body: F) -> Result<T>
    where
        F: FnOnce(Env) -> Fut + Send,
        Fut: Future<Output = Result<T>> + Send,
        T: Send,
    {
        self.key_tx_manager(key)?.begin(env, opts, body).await
    }

    pub async fn begin_tx(&self, env: &Env, key: &K, opts: TxOptions) -> Result<(Env, Box<dyn TxFinisher>)> {
        self.key_tx_manager(key)?.begin_tx(env, opts).await
    }

    /// Start every shard.
    pub async fn start(&self, env: &Env) -> Result<()> {
        self.registry.start_all(env).await?;
        if let Some(hook) = &self.after_start {
            if let Err(err) = hook(env, self).await {
                if let Err(stop_err) = self.registry.stop_all(env).await {
                    warn!(router = %self.options.name, error = %stop_err, "failed to stop shards");
                }
                return Err(Error::context("failed to run after start function", err));
            }
        }
        debug!(router = %self.options.name, buckets = self.shard_by_bucket.len(), "bucket router started");
        Ok(())
    }

    pub async fn stop(&self, env: &Env) -> Result<()> {
        self.registry.stop_all(env).await
    }

    /// Run `f` for every bucket with a connection scoped to it, at most
    /// `run_limit` at a time. Order is unspecified. The first failure cancels
    /// the rest and is returned wrapped with its shard and bucket.
    pub async fn run_bucket_func<F, Fut>(&self, env: &Env, f: F) -> Result<()>
    where
        F: Fn(Env, ShardId, BucketId, Box<dyn Connection>) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        // One flat work list under a single limit. Nesting a bounded bucket
        // stage inside a bounded shard stage can starve both.
        let work: Vec<(ShardId, BucketId)> = self
            .shard_by_bucket
            .iter()
            .enumerate()
            .map(|(bucket, shard)| (*shard, BucketId(bucket as u32)))
            .collect();

        run_bounded(env, work, self.options.run_limit, |env, (shard, bucket)| {
            let conn = self.scoped(&env, shard, bucket);
            let fut = f(env, shard, bucket, conn);
            async move {
                fut.await.map_err(|err| Error::Bucket {
                    shard,
                    bucket,
                    source: Box::new(err),
                })
            }
        })
        .await
    }

    /// Run `f` for every shard concurrently with an unscoped connection.
    pub async fn run_shard_func<F, Fut>(&self, env: &Env, f: F) -> Result<()>
    where
        F: Fn(Env, ShardId, Box<dyn Connection>) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        self.registry.run_func(env, self.registry.len(), f).await
    }

    /// Group `objs` by the shard hosting the bucket `bucket_of` assigns them.
    pub fn group_by_shard<T, G>(
        &self,
        objs: impl IntoIterator<Item = T>,
        bucket_of: G,
    ) -> Result<BTreeMap<ShardId, Vec<T>>>
    where
        G: Fn(&T) -> BucketId,
    {
        let mut groups: BTreeMap<ShardId, Vec<T>> = BTreeMap::new();
        for obj in objs {
            let shard = self.shard_of(bucket_of(&obj))?;
            groups.entry(shard).or_default().push(obj);
        }
        Ok(groups)
    }

    /// Group `objs` by shard, then run `f` once per group concurrently.
    pub async fn group_by_shard_func<T, G, F, Fut>(
        &self,
        env: &Env,
        objs: impl IntoIterator<Item = T>,
        bucket_of: G,
        f: F,
    ) -> Result<()>
    where
        G: Fn(&T) -> BucketId,
        F: Fn(Env, ShardId, Vec<T>) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let groups = self
            .group_by_shard(objs, bucket_of)
            .map_err(|err| Error::context("failed to group by shard", err))?;
        let limit = groups.len().max(1);

        run_bounded(env, groups, limit, |env, (shard, objs)| {
            let fut = f(env, shard, objs);
            async move {
                fut.await.map_err(|err| Error::Shard {
                    shard,
                    source: Box::new(err),
                })
            }
        })
        .await
    }
}

impl<K: ?Sized> fmt::Debug for BucketRouter<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BucketRouter")
            .field("name", &self.options.name)
            .field("buckets", &self.buckets)
            .field("run_limit", &self.options.run_limit)
            .field("schema_prefix", &self.prefix)
            .field("after_start", &self.after_start.is_some())
            .finish()
    }
}
