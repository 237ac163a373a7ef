//! Cluster description loaded from TOML.
//!
//! ```toml
//! name = "users"
//! run_limit = 10
//!
//! [pool]
//! max_connections = 10
//!
//! [[shards]]
//! id = 1
//! dsn = "postgres://app@db1/users?password=${DB1_PASSWORD}"
//!
//! [[buckets]]
//! shard = 1
//! from = 0
//! to = 7
//! ```

use std::collections::HashSet;
use std::env;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::bucket::{
    uniform_bucket_fn, validate_ranges, BucketInfo, BucketRange, BucketRouter, RouterOptions,
    BUCKET_PREFIX,
};
use crate::error::{Error, Result};
use crate::provider::{PgProvider, ProviderConfig};
use crate::shard::{default_shard_func, ShardId, ShardInfo, ShardRegistry};

static VAR_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("variable regex"));

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClusterConfig {
    #[serde(default = "default_name")]
    pub name: String,
    #[serde(default = "default_run_limit")]
    pub run_limit: usize,
    #[serde(default = "default_schema_prefix")]
    pub schema_prefix: String,
    #[serde(default)]
    pub log_queries: bool,
    #[serde(default)]
    pub pool: PoolConfig,
    pub shards: Vec<ShardConfig>,
    pub buckets: Vec<BucketConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PoolConfig {
    pub max_connections: u32,
    pub min_connections: u32,
    pub acquire_timeout_secs: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        let defaults = ProviderConfig::default();
        Self {
            max_connections: defaults.max_connections,
            min_connections: defaults.min_connections,
            acquire_timeout_secs: defaults.acquire_timeout.as_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ShardConfig {
    pub id: u32,
    /// `${VAR}` references are expanded from the environment on load.
    pub dsn: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct BucketConfig {
    pub shard: u32,
    pub from: u32,
    pub to: u32,
}

fn default_name() -> String {
    RouterOptions::default().name
}

fn default_run_limit() -> usize {
    RouterOptions::default().run_limit
}

fn default_schema_prefix() -> String {
    BUCKET_PREFIX.to_string()
}

impl ClusterConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|source| Error::ConfigRead {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    /// Parse, expand `${VAR}` references in DSNs and validate.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        Self::parse(content, |name| env::var(name).ok())
    }

    fn parse(content: &str, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config: Self = toml::from_str(content)?;
        for shard in &mut config.shards {
            shard.dsn = expand_vars(&shard.dsn, &lookup)?;
        }
        config.validate()?;
        Ok(config)
    }

    /// Checks that do not need the bucket router; ranges are checked by
    /// [`BucketRouter::new`] during [`build`](Self::build).
    pub fn validate(&self) -> Result<()> {
        if self.shards.is_empty() {
            return Err(Error::config("cluster has no shards"));
        }
        let mut seen = HashSet::new();
        for shard in &self.shards {
            if !seen.insert(shard.id) {
                return Err(Error::config(format!("shard {} is declared twice", shard.id)));
            }
            if shard.dsn.trim().is_empty() {
                return Err(Error::config(format!("shard {} has an empty dsn", shard.id)));
            }
        }
        for bucket in &self.buckets {
            if !seen.contains(&bucket.shard) {
                return Err(Error::config(format!(
                    "buckets {}..={} reference undeclared shard {}",
                    bucket.from, bucket.to, bucket.shard
                )));
            }
        }
        if self.pool.max_connections == 0 {
            return Err(Error::config("pool.max_connections must be at least 1"));
        }
        if self.pool.min_connections > self.pool.max_connections {
            return Err(Error::config("pool.min_connections exceeds pool.max_connections"));
        }
        Ok(())
    }

    fn provider_config(&self, shard: &ShardConfig) -> ProviderConfig {
        ProviderConfig {
            max_connections: self.pool.max_connections,
            min_connections: self.pool.min_connections,
            acquire_timeout: Duration::from_secs(self.pool.acquire_timeout_secs),
            log_queries: self.log_queries,
            ..ProviderConfig::from_dsn(format!("shard-{}", shard.id), &shard.dsn)
        }
    }

    pub fn bucket_infos(&self) -> Vec<BucketInfo> {
        self.buckets
            .iter()
            .map(|b| BucketInfo::new(ShardId(b.shard), BucketRange::new(b.from, b.to)))
            .collect()
    }

    /// Router over one [`PgProvider`] per shard, keyed by strings spread
    /// uniformly over all buckets. Providers are not started.
    pub fn build(&self) -> Result<BucketRouter<str>> {
        self.validate()?;

        let shards = self
            .shards
            .iter()
            .map(|shard| {
                let provider = PgProvider::new(self.provider_config(shard))?;
                Ok(ShardInfo::from_pg(ShardId(shard.id), provider))
            })
            .collect::<Result<Vec<_>>>()?;
        let registry = ShardRegistry::new(shards, Arc::new(default_shard_func), self.name.clone())?;

        let buckets = self.bucket_infos();
        let count = validate_ranges(&self.name, &buckets, &registry)?;

        let options = RouterOptions {
            name: self.name.clone(),
            run_limit: self.run_limit,
            schema_prefix: self.schema_prefix.clone(),
        };
        BucketRouter::new(registry, buckets, uniform_bucket_fn::<str>(count), options)
    }
}

/// Replace `${VAR}` with `lookup(VAR)`; unknown variables are an error.
fn expand_vars(input: &str, lookup: impl Fn(&str) -> Option<String>) -> Result<String> {
    let mut out = String::with_capacity(input.len());
    let mut last = 0;
    for caps in VAR_RE.captures_iter(input) {
        let (Some(whole), Some(name)) = (caps.get(0), caps.get(1)) else {
            continue;
        };
        let value = lookup(name.as_str())
            .ok_or_else(|| Error::config(format!("environment variable {} is not set", name.as_str())))?;
        out.push_str(&input[last..whole.start()]);
        out.push_str(&value);
        last = whole.end();
    }
    out.push_str(&input[last..]);
    Ok(out)
}
