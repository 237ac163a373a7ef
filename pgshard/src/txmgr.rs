//! Database-agnostic transaction manager
//!
//! [`TransactionManager`] adds flattened nesting on top of a
//! [`TransactionBeginner`]: when the environment already carries a
//! transaction the body runs inline on it, provided the requested isolation
//! level and access mode match. No savepoints are used.

use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use serde::{Deserialize, Serialize};

use crate::env::Env;
use crate::error::{Error, Result};

/// Transaction isolation level, lowest to highest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IsolationLevel {
    ReadUncommitted,
    #[default]
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

impl IsolationLevel {
    pub fn as_sql(self) -> &'static str {
        match self {
            IsolationLevel::ReadUncommitted => "READ UNCOMMITTED",
            IsolationLevel::ReadCommitted => "READ COMMITTED",
            IsolationLevel::RepeatableRead => "REPEATABLE READ",
            IsolationLevel::Serializable => "SERIALIZABLE",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessMode {
    ReadOnly,
    #[default]
    ReadWrite,
}

impl AccessMode {
    pub fn as_sql(self) -> &'static str {
        match self {
            AccessMode::ReadOnly => "READ ONLY",
            AccessMode::ReadWrite => "READ WRITE",
        }
    }
}

/// Guarantees requested for a transaction.
///
/// `lock` is advisory: it tells call sites that rows read inside the
/// transaction are meant to be locked (`SELECT ... FOR UPDATE`). This layer
/// does not act on it and does not compare it when nesting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TxOptions {
    #[serde(default)]
    pub level: IsolationLevel,
    #[serde(default)]
    pub mode: AccessMode,
    #[serde(default)]
    pub lock: bool,
}

impl TxOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn level(mut self, level: IsolationLevel) -> Self {
        self.level = level;
        self
    }

    pub fn mode(mut self, mode: AccessMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn lock(mut self) -> Self {
        self.lock = true;
        self
    }

    pub fn read_only() -> Self {
        Self::default().mode(AccessMode::ReadOnly)
    }

    pub fn serializable() -> Self {
        Self::default().level(IsolationLevel::Serializable)
    }

    /// Whether a transaction opened with `self` can host a nested begin asking for `requested`.
    pub fn compatible_with(&self, requested: &TxOptions) -> bool {
        self.level == requested.level && self.mode == requested.mode
    }

    /// `SET TRANSACTION` statement applying these options.
    pub fn set_transaction_sql(&self) -> String {
        format!(
            "SET TRANSACTION ISOLATION LEVEL {}, {}",
            self.level.as_sql(),
            self.mode.as_sql()
        )
    }
}

impl fmt::Display for TxOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.level.as_sql(), self.mode.as_sql())?;
        if self.lock {
            f.write_str(" (lock)")?;
        }
        Ok(())
    }
}

/// Reports whether an environment carries a transaction.
pub trait TransactionInformer: Send + Sync {
    fn in_transaction(&self, env: &Env) -> bool;

    /// Options of the active transaction; defaults when there is none.
    fn transaction_options(&self, env: &Env) -> TxOptions;
}

/// Opens transactions on one database.
#[async_trait]
pub trait TransactionBeginner: Send + Sync {
    /// Open a transaction and return the environment carrying it together with
    /// the object that finishes it.
    async fn begin_tx(&self, env: &Env, opts: TxOptions) -> Result<(Env, Box<dyn TxFinisher>)>;

    fn without_transaction(&self, env: &Env) -> Env {
        env.without_transaction()
    }
}

/// Finishes a transaction exactly once.
#[async_trait]
pub trait TxFinisher: Send {
    async fn commit(self: Box<Self>) -> Result<()>;
    async fn rollback(self: Box<Self>) -> Result<()>;
}

/// Finisher handed out for nested scopes: the outer scope owns the real transaction.
pub struct NoopFinisher;

#[async_trait]
impl TxFinisher for NoopFinisher {
    async fn commit(self: Box<Self>) -> Result<()> {
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}

/// Handles begin/commit/rollback with flattened nesting.
#[derive(Clone)]
pub struct TransactionManager {
    beginner: Arc<dyn TransactionBeginner>,
    informer: Arc<dyn TransactionInformer>,
}

impl TransactionManager {
    pub fn new(beginner: Arc<dyn TransactionBeginner>, informer: Arc<dyn TransactionInformer>) -> Self {
        Self { beginner, informer }
    }

    /// `Some(env)` when `env` already carries a compatible transaction,
    /// `None` when a new one has to be opened.
    fn nested(&self, env: &Env, opts: &TxOptions) -> Result<Option<Env>> {
        if !self.informer.in_transaction(env) {
            return Ok(None);
        }

        let current = self.informer.transaction_options(env);
        if !current.compatible_with(opts) {
            return Err(Error::TransactionOptionsMismatch {
                current,
                requested: *opts,
            });
        }

        Ok(Some(env.clone()))
    }

    /// Run `body` inside a transaction.
    ///
    /// Commits when `body` succeeds and rolls back when it fails. When `body`
    /// panics the transaction is rolled back and the panic resumes. If `env`
    /// already carries a compatible transaction the body runs inline on it.
    pub async fn begin<T, F, Fut>(&self, env: &Env, opts: TxOptions, body: F) -> Result<T>
    where
        F: FnOnce(Env) -> Fut + Send,
        Fut: Future<Output = Result<T>> + Send,
        T: Send,
    {
        if let Some(env) = self.nested(env, &opts)? {
            return body(env).await;
        }

        let (tx_env, finisher) = self.beginner.begin_tx(env, opts).await?;

        let outcome = AssertUnwindSafe(async move { body(tx_env).await })
            .catch_unwind()
            .await;

        match outcome {
            Ok(Ok(value)) => {
                finisher.commit().await?;
                Ok(value)
            }
            Ok(Err(err)) => match finisher.rollback().await {
                Ok(()) => Err(err),
                Err(rollback) => Err(Error::rollback_after(err, rollback)),
            },
            Err(panic) => {
                if let Err(err) = finisher.rollback().await {
                    tracing::warn!(error = %err, "rollback after panic failed");
                }
                std::panic::resume_unwind(panic)
            }
        }
    }

    /// Open a transaction and hand back its environment and finisher.
    ///
    /// When `env` already carries a compatible transaction the returned
    /// finisher does nothing, so callers follow the same commit/rollback
    /// protocol regardless of nesting.
    pub async fn begin_tx(&self, env: &Env, opts: TxOptions) -> Result<(Env, Box<dyn TxFinisher>)> {
        if let Some(env) = self.nested(env, &opts)? {
            return Ok((env, Box::new(NoopFinisher)));
        }

        self.beginner.begin_tx(env, opts).await
    }

    pub fn in_transaction(&self, env: &Env) -> bool {
        self.informer.in_transaction(env)
    }

    pub fn without_transaction(&self, env: &Env) -> Env {
        self.beginner.without_transaction(env)
    }
}
