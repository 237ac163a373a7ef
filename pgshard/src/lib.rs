pub mod bucket;
pub mod config;
pub mod conn;
pub mod env;
pub mod error;
mod fanout;
pub mod provider;
pub mod shard;
pub mod txmgr;
pub mod value;

#[cfg(test)]
mod testing;

pub use bucket::{
    bucket_count, prepare_bucket_sql, uniform_bucket_fn, BucketId, BucketInfo, BucketRange,
    BucketRouter, RouterAfterStart, RouterOptions, ShardBatch, BUCKET_ALIAS, BUCKET_PREFIX,
    MAX_BUCKETS,
};
pub use config::ClusterConfig;
pub use conn::{
    Batch, BatchResults, CommandTag, Connection, ConnectionExt, ErrorConnection, Identifier,
    StatementOutput,
};
pub use env::Env;
pub use error::{Error, Result};
pub use provider::{
    AfterStart, ConnectionProvider, LargeObjects, PgProvider, ProviderConfig, ProviderState,
    ProviderStats,
};
pub use shard::{default_shard_func, ShardFunc, ShardId, ShardInfo, ShardRegistry};
pub use txmgr::{AccessMode, IsolationLevel, TransactionManager, TxFinisher, TxOptions};
pub use value::Value;
