//! Postgres provider backed by a sqlx pool.

use std::fmt;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions};
use sqlx::Connection as _;
use tracing::{debug, warn};

use super::exec::QueryLog;
use super::pooled::PooledConnection;
use super::tx::{TransactionalConnection, TxHandle};
use super::{ConnectionProvider, ProviderId, ProviderState};
use crate::conn::{Connection, ErrorConnection};
use crate::env::Env;
use crate::error::{Error, Result};
use crate::txmgr::{TransactionBeginner, TransactionInformer, TxFinisher, TxOptions};

/// Default maximum connections per shard pool.
const DEFAULT_MAX_CONNECTIONS: u32 = 10;

/// Default wait for a free pooled connection.
const DEFAULT_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(30);

/// Hook run during [`PgProvider`] start once the pool answered its ping.
/// An error fails the start and closes the pool.
#[derive(Clone)]
pub struct AfterStart(Arc<dyn Fn(Env, PgPool) -> BoxFuture<'static, Result<()>> + Send + Sync>);

impl AfterStart {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(Env, PgPool) -> BoxFuture<'static, Result<()>> + Send + Sync + 'static,
    {
        Self(Arc::new(f))
    }
}

impl fmt::Debug for AfterStart {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AfterStart")
    }
}

/// Settings for one [`PgProvider`]. Exactly one of `dsn` and
/// `connect_options` must be set.
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    pub name: String,
    pub dsn: Option<String>,
    pub connect_options: Option<PgConnectOptions>,
    pub max_connections: u32,
    pub min_connections: u32,
    pub acquire_timeout: Duration,
    /// Log every statement with its latency at debug level.
    pub log_queries: bool,
    pub after_start: Option<AfterStart>,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            name: "pgdb".to_string(),
            dsn: None,
            connect_options: None,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            min_connections: 0,
            acquire_timeout: DEFAULT_ACQUIRE_TIMEOUT,
            log_queries: false,
            after_start: None,
        }
    }
}

impl ProviderConfig {
    pub fn from_dsn(name: impl Into<String>, dsn: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            dsn: Some(dsn.into()),
            ..Self::default()
        }
    }

    fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::config("database name must not be empty"));
        }
        match (&self.dsn, &self.connect_options) {
            (Some(_), Some(_)) => {
                return Err(Error::config(format!(
                    "database {}: set either dsn or connect_options, not both",
                    self.name
                )))
            }
            (None, None) => {
                return Err(Error::config(format!(
                    "database {}: no connection source configured",
                    self.name
                )))
            }
            _ => {}
        }
        if self.max_connections == 0 {
            return Err(Error::config(format!(
                "database {}: max_connections must be at least 1",
                self.name
            )));
        }
        if self.min_connections > self.max_connections {
            return Err(Error::config(format!(
                "database {}: min_connections ({}) exceeds max_connections ({})",
                self.name, self.min_connections, self.max_connections
            )));
        }
        Ok(())
    }
}

/// Pool occupancy, for leak checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProviderStats {
    pub size: u32,
    pub idle: usize,
    pub acquired: usize,
}

struct Lifecycle {
    state: ProviderState,
    pool: Option<PgPool>,
}

/// One Postgres database.
pub struct PgProvider {
    id: ProviderId,
    config: ProviderConfig,
    log: QueryLog,
    lifecycle: RwLock<Lifecycle>,
}

impl PgProvider {
    pub fn new(config: ProviderConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self::with_lifecycle(config, ProviderState::Uninitialized, None))
    }

    /// Wrap an existing pool. The provider starts out running; once stopped it
    /// cannot be restarted because it has no connection source of its own.
    pub fn from_pool(name: impl Into<String>, pool: PgPool) -> Self {
        let config = ProviderConfig {
            name: name.into(),
            ..ProviderConfig::default()
        };
        Self::with_lifecycle(config, ProviderState::Running, Some(pool))
    }

    fn with_lifecycle(config: ProviderConfig, state: ProviderState, pool: Option<PgPool>) -> Self {
        Self {
            id: ProviderId::next(),
            log: QueryLog::new(&config.name, config.log_queries),
            config,
            lifecycle: RwLock::new(Lifecycle { state, pool }),
        }
    }

    pub fn id(&self) -> ProviderId {
        self.id
    }

    pub fn config(&self) -> &ProviderConfig {
        &self.config
    }

    pub fn state(&self) -> ProviderState {
        self.read().state
    }

    /// `None` until the provider is running.
    pub fn stats(&self) -> Option<ProviderStats> {
        self.pool().map(|pool| {
            let size = pool.size();
            let idle = pool.num_idle();
            ProviderStats {
                size,
                idle,
                acquired: (size as usize).saturating_sub(idle),
            }
        })
    }

    /// Underlying pool while running.
    pub fn pool(&self) -> Option<PgPool> {
        let lifecycle = self.read();
        match lifecycle.state {
            ProviderState::Running => lifecycle.pool.clone(),
            _ => None,
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, Lifecycle> {
        self.lifecycle.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Lifecycle> {
        self.lifecycle.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn not_started(&self) -> Error {
        Error::NotStarted {
            name: self.config.name.clone(),
        }
    }

    fn owned_tx<'e>(&self, env: &'e Env) -> Option<&'e Arc<TxHandle>> {
        env.transaction().filter(|tx| tx.owner() == self.id)
    }

    /// Pools are created lazily; the first connection is opened by the ping.
    fn create_pool(&self) -> Result<PgPool> {
        let options = PgPoolOptions::new()
            .max_connections(self.config.max_connections)
            .min_connections(self.config.min_connections)
            .acquire_timeout(self.config.acquire_timeout);

        let pool_create = |source| Error::PoolCreate {
            name: self.config.name.clone(),
            source,
        };

        match (&self.config.connect_options, &self.config.dsn) {
            (Some(connect), _) => Ok(options.connect_lazy_with(connect.clone())),
            (None, Some(dsn)) => options.connect_lazy(dsn).map_err(pool_create),
            (None, None) => Err(Error::config(format!(
                "database {} has no connection source",
                self.config.name
            ))),
        }
    }

    async fn ping(&self, pool: &PgPool) -> Result<()> {
        let ping = |source| Error::Ping {
            name: self.config.name.clone(),
            source,
        };
        let mut conn = pool.acquire().await.map_err(ping)?;
        conn.ping().await.map_err(ping)
    }
}

/// Puts a provider back to `Uninitialized` when `start` does not finish,
/// including when the start future is dropped.
struct StartRevert<'a> {
    provider: &'a PgProvider,
    armed: bool,
}

impl Drop for StartRevert<'_> {
    fn drop(&mut self) {
        if self.armed {
            let mut lifecycle = self.provider.write();
            lifecycle.state = ProviderState::Uninitialized;
            lifecycle.pool = None;
        }
    }
}

#[async_trait]
impl ConnectionProvider for PgProvider {
    fn name(&self) -> &str {
        &self.config.name
    }

    async fn start(&self, env: &Env) -> Result<()> {
        {
            let mut lifecycle = self.write();
            match lifecycle.state {
                ProviderState::Uninitialized | ProviderState::Stopped => {
                    lifecycle.state = ProviderState::Starting;
                }
                state => {
                    return Err(Error::InvalidState {
                        name: self.config.name.clone(),
                        action: "start",
                        state: state.as_str(),
                    })
                }
            }
        }
        let mut revert = StartRevert {
            provider: self,
            armed: true,
        };

        debug!(database = %self.config.name, "starting database");
        let pool = self.create_pool()?;

        debug!(database = %self.config.name, "checking database connection");
        if let Err(err) = env.guard(self.ping(&pool)).await {
            pool.close().await;
            return Err(err);
        }

        if let Some(hook) = &self.config.after_start {
            if let Err(err) = (hook.0)(env.clone(), pool.clone()).await {
                pool.close().await;
                return Err(Error::context("failed to run after start function", err));
            }
        }

        {
            let mut lifecycle = self.write();
            lifecycle.pool = Some(pool);
            lifecycle.state = ProviderState::Running;
        }
        revert.armed = false;

        debug!(database = %self.config.name, "database connection established");
        Ok(())
    }

    async fn stop(&self, _env: &Env) -> Result<()> {
        let pool = {
            let mut lifecycle = self.write();
            match lifecycle.state {
                ProviderState::Uninitialized | ProviderState::Stopped | ProviderState::Stopping => {
                    return Ok(())
                }
                ProviderState::Starting => {
                    return Err(Error::InvalidState {
                        name: self.config.name.clone(),
                        action: "stop",
                        state: ProviderState::Starting.as_str(),
                    })
                }
                ProviderState::Running => {}
            }
            lifecycle.state = ProviderState::Stopping;
            lifecycle.pool.take()
        };

        if let Some(pool) = pool {
            pool.close().await;
        }
        self.write().state = ProviderState::Stopped;

        debug!(database = %self.config.name, "database stopped");
        Ok(())
    }

    fn connection(&self, env: &Env) -> Box<dyn Connection> {
        if let Some(tx) = env.transaction() {
            tx.assert_owner(self.id, &self.config.name);
            return Box::new(TransactionalConnection::new(tx.clone(), self.log.clone()));
        }

        match self.pool() {
            Some(pool) => Box::new(PooledConnection::new(pool, self.log.clone())),
            None => Box::new(ErrorConnection::new(self.not_started())),
        }
    }
}

impl TransactionInformer for PgProvider {
    fn in_transaction(&self, env: &Env) -> bool {
        self.owned_tx(env).is_some()
    }

    fn transaction_options(&self, env: &Env) -> TxOptions {
        self.owned_tx(env)
            .map(|tx| tx.options())
            .unwrap_or_default()
    }
}

#[async_trait]
impl TransactionBeginner for PgProvider {
    async fn begin_tx(&self, env: &Env, opts: TxOptions) -> Result<(Env, Box<dyn TxFinisher>)> {
        let pool = self.pool().ok_or_else(|| self.not_started())?;

        let mut tx = env
            .guard(async { pool.begin().await.map_err(Error::Begin) })
            .await?;
        sqlx::query(&opts.set_transaction_sql())
            .execute(&mut *tx)
            .await
            .map_err(Error::Begin)?;

        debug!(database = %self.config.name, options = %opts, "transaction started");

        let handle = Arc::new(TxHandle::new(self.id, opts, tx));
        let finisher = PgTxFinisher {
            handle: handle.clone(),
            database: self.config.name.clone(),
        };
        Ok((env.with_transaction(handle), Box::new(finisher)))
    }
}

/// Finishes a transaction opened by [`PgProvider::begin_tx`]. Dropping it
/// unfinished rolls the transaction back.
struct PgTxFinisher {
    handle: Arc<TxHandle>,
    database: String,
}

#[async_trait]
impl TxFinisher for PgTxFinisher {
    async fn commit(self: Box<Self>) -> Result<()> {
        let tx = self.handle.take().await.ok_or(Error::TransactionClosed)?;
        tx.commit().await.map_err(Error::Commit)?;
        debug!(database = %self.database, "transaction committed");
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        let tx = self.handle.take().await.ok_or(Error::TransactionClosed)?;
        tx.rollback().await.map_err(Error::Rollback)?;
        debug!(database = %self.database, "transaction rolled back");
        Ok(())
    }
}

impl Drop for PgTxFinisher {
    fn drop(&mut self) {
        if self.handle.abandon() {
            warn!(database = %self.database, "transaction dropped unfinished, rolling back");
        }
    }
}
