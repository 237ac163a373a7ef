/// Structured error types for the pgshard library.
///
/// Uses `thiserror` so callers can match on routing, lifecycle, transaction
/// and batch-state failures. The demo binary wraps these with `anyhow`.

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;

use crate::bucket::BucketId;
use crate::shard::ShardId;
use crate::txmgr::TxOptions;

/// Main error type for pgshard operations
#[derive(Error, Debug)]
pub enum Error {
    /// Bucket id is outside every configured range
    #[error("bucket {bucket} not found")]
    BucketNotFound { bucket: BucketId },

    /// Shard key did not resolve to a registered shard
    #[error("shard {key} not found")]
    ShardNotFound { key: String },

    /// Pool creation failed during start
    #[error("failed to create pool for database {name}: {source}")]
    PoolCreate {
        name: String,
        #[source]
        source: sqlx::Error,
    },

    /// Liveness check failed during start
    #[error("failed to connect to database {name}: {source}")]
    Ping {
        name: String,
        #[source]
        source: sqlx::Error,
    },

    /// Provider used before a successful start
    #[error("database {name} is not started")]
    NotStarted { name: String },

    /// Lifecycle transition not allowed from the current state
    #[error("database {name} cannot {action} while {state}")]
    InvalidState {
        name: String,
        action: &'static str,
        state: &'static str,
    },

    /// Nested begin asked for different guarantees than the active transaction
    #[error("transaction options mismatch: active {current}, requested {requested}")]
    TransactionOptionsMismatch {
        current: TxOptions,
        requested: TxOptions,
    },

    /// Driver failed to open a transaction
    #[error("failed to begin transaction: {0}")]
    Begin(#[source] sqlx::Error),

    /// Driver failed to commit
    #[error("failed to commit transaction: {0}")]
    Commit(#[source] sqlx::Error),

    /// Driver failed to roll back
    #[error("failed to roll back transaction: {0}")]
    Rollback(#[source] sqlx::Error),

    /// Body failed and the rollback that followed failed as well
    #[error("{source} (rollback error: {rollback})")]
    RollbackAfterError {
        #[source]
        source: Box<Error>,
        rollback: Box<Error>,
    },

    /// Transaction handle already committed or rolled back
    #[error("transaction is already closed")]
    TransactionClosed,

    /// Batch used after send or close
    #[error("batch is closed")]
    BatchClosed,

    /// Batch results requested before send
    #[error("batch was not sent")]
    BatchNotSent,

    /// Every queued statement already produced its result
    #[error("no more results in batch")]
    NoMoreResults,

    /// Statement skipped because an earlier statement in the same batch failed
    #[error("batch aborted before statement {index}")]
    BatchAborted { index: usize },

    /// Per-shard fan-out callback failed
    #[error("failed to run function for shard {shard}: {source}")]
    Shard {
        shard: ShardId,
        #[source]
        source: Box<Error>,
    },

    /// Per-bucket fan-out callback failed
    #[error("failed to run function for shard {shard}, bucket {bucket}: {source}")]
    Bucket {
        shard: ShardId,
        bucket: BucketId,
        #[source]
        source: Box<Error>,
    },

    /// Operation skipped because the environment was cancelled
    #[error("operation cancelled")]
    Cancelled,

    /// Operation skipped because the environment deadline passed
    #[error("deadline exceeded")]
    DeadlineExceeded,

    /// Query returned no rows where one was required
    #[error("no rows in result set")]
    NoRows,

    /// Underlying driver error
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Configuration rejected at construction time
    #[error("configuration error: {reason}")]
    Config { reason: String },

    /// Config file could not be read
    #[error("failed to read config {path:?}: {source}")]
    ConfigRead {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Config file is not valid TOML for the expected shape
    #[error("failed to parse config: {0}")]
    ConfigParse(#[from] toml::de::Error),

    /// Same error reported to several callers
    #[error(transparent)]
    Shared(Arc<Error>),

    /// Independent failures joined together
    #[error("{}", join_messages(.0))]
    Joined(Vec<Error>),

    /// Error annotated with the operation that produced it
    #[error("{context}: {source}")]
    Context {
        context: String,
        #[source]
        source: Box<Error>,
    },

    /// Error raised by caller code inside a transaction or fan-out body
    #[error(transparent)]
    Other(Box<dyn std::error::Error + Send + Sync>),
}

/// Result type alias for pgshard operations
pub type Result<T> = std::result::Result<T, Error>;

fn join_messages(errors: &[Error]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("\n")
}

impl Error {
    /// Create a config error
    pub fn config(reason: impl Into<String>) -> Self {
        Self::Config {
            reason: reason.into(),
        }
    }

    /// Annotate an error with context
    pub fn context(context: impl Into<String>, source: Error) -> Self {
        Self::Context {
            context: context.into(),
            source: Box::new(source),
        }
    }

    /// Wrap an arbitrary caller error
    pub fn other(err: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        Self::Other(err.into())
    }

    /// Combine a body error with the rollback error that followed it
    pub fn rollback_after(source: Error, rollback: Error) -> Self {
        Self::RollbackAfterError {
            source: Box::new(source),
            rollback: Box::new(rollback),
        }
    }

    /// Join independent errors; `None` when there are none, the error itself when there is one.
    pub fn join(mut errors: Vec<Error>) -> Option<Self> {
        match errors.len() {
            0 => None,
            1 => errors.pop(),
            _ => Some(Self::Joined(errors)),
        }
    }

    /// Innermost error, looking through sharing, context and fan-out wrappers.
    pub fn root(&self) -> &Error {
        match self {
            Self::Shared(inner) => inner.root(),
            Self::Context { source, .. }
            | Self::Shard { source, .. }
            | Self::Bucket { source, .. }
            | Self::RollbackAfterError { source, .. } => source.root(),
            other => other,
        }
    }

    pub fn is_bucket_not_found(&self) -> bool {
        matches!(self.root(), Self::BucketNotFound { .. })
    }

    pub fn is_shard_not_found(&self) -> bool {
        matches!(self.root(), Self::ShardNotFound { .. })
    }

    pub fn is_options_mismatch(&self) -> bool {
        matches!(self.root(), Self::TransactionOptionsMismatch { .. })
    }

    pub fn is_no_rows(&self) -> bool {
        matches!(
            self.root(),
            Self::NoRows | Self::Database(sqlx::Error::RowNotFound)
        )
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self.root(), Self::Cancelled | Self::DeadlineExceeded)
    }
}
