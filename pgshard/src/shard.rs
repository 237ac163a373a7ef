//! Shard registry
//!
//! A fixed set of databases addressed by [`ShardId`]. Keys are resolved to a
//! shard through an injectable [`ShardFunc`]; every shard carries its own
//! provider and [`TransactionManager`].

use std::collections::HashSet;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::conn::{Connection, ErrorConnection};
use crate::env::Env;
use crate::error::{Error, Result};
use crate::fanout::run_bounded;
use crate::provider::{ConnectionProvider, PgProvider};
use crate::txmgr::{TransactionBeginner, TransactionInformer, TransactionManager, TxFinisher, TxOptions};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ShardId(pub u32);

impl ShardId {
    /// Id no registry contains; returned by shard functions that cannot resolve a key.
    pub const NONE: ShardId = ShardId(u32::MAX);
}

impl fmt::Display for ShardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Resolves a shard key to a shard id.
pub type ShardFunc = Arc<dyn Fn(&str) -> ShardId + Send + Sync>;

/// Parses the key as a shard number; anything else maps to [`ShardId::NONE`].
pub fn default_shard_func(key: &str) -> ShardId {
    key.parse().map(ShardId).unwrap_or(ShardId::NONE)
}

/// One shard: its id, its provider and the transaction seams of that provider.
#[derive(Clone)]
pub struct ShardInfo {
    pub id: ShardId,
    pub provider: Arc<dyn ConnectionProvider>,
    pub beginner: Arc<dyn TransactionBeginner>,
    pub informer: Arc<dyn TransactionInformer>,
}

impl ShardInfo {
    pub fn new(
        id: ShardId,
        provider: Arc<dyn ConnectionProvider>,
        beginner: Arc<dyn TransactionBeginner>,
        informer: Arc<dyn TransactionInformer>,
    ) -> Self {
        Self {
            id,
            provider,
            beginner,
            informer,
        }
    }

    /// Use one object for all three roles.
    pub fn from_provider<P>(id: ShardId, provider: Arc<P>) -> Self
    where
        P: ConnectionProvider + TransactionBeginner + TransactionInformer + 'static,
    {
        Self::new(id, provider.clone(), provider.clone(), provider)
    }

    pub fn from_pg(id: ShardId, provider: PgProvider) -> Self {
        Self::from_provider(id, Arc::new(provider))
    }
}

impl fmt::Debug for ShardInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShardInfo")
            .field("id", &self.id)
            .field("provider", &self.provider.name())
            .finish()
    }
}

struct Shard {
    info: ShardInfo,
    tx_manager: TransactionManager,
}

/// Every shard of the cluster. Few shards, so lookups scan a vector.
pub struct ShardRegistry {
    name: String,
    shard_func: ShardFunc,
    shards: Vec<Shard>,
}

impl ShardRegistry {
    pub fn new(shards: Vec<ShardInfo>, shard_func: ShardFunc, name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        if shards.is_empty() {
            return Err(Error::config(format!("shard registry {name}: no shards")));
        }
        let mut seen = HashSet::new();
        for info in &shards {
            if !seen.insert(info.id) {
                return Err(Error::config(format!(
                    "shard registry {name}: duplicate shard {}",
                    info.id
                )));
            }
        }

        let shards = shards
            .into_iter()
            .map(|info| Shard {
                tx_manager: TransactionManager::new(info.beginner.clone(), info.informer.clone()),
                info,
            })
            .collect();

        Ok(Self {
            name,
            shard_func,
            shards,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.shards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shards.is_empty()
    }

    pub fn shards(&self) -> Vec<ShardId> {
        self.shards.iter().map(|shard| shard.info.id).collect()
    }

    pub fn contains(&self, id: ShardId) -> bool {
        self.by_id(id).is_some()
    }

    pub fn info(&self, id: ShardId) -> Option<&ShardInfo> {
        self.by_id(id).map(|shard| &shard.info)
    }

    pub fn tx_manager(&self, id: ShardId) -> Option<&TransactionManager> {
        self.by_id(id).map(|shard| &shard.tx_manager)
    }

    pub fn shard_func(&self) -> &ShardFunc {
        &self.shard_func
    }

    fn by_id(&self, id: ShardId) -> Option<&Shard> {
        self.shards.iter().find(|shard| shard.info.id == id)
    }

    fn by_key(&self, key: &str) -> Result<&Shard> {
        self.by_id((self.shard_func)(key))
            .ok_or_else(|| Error::ShardNotFound { key: key.to_string() })
    }

    fn by_id_or_err(&self, id: ShardId) -> Result<&Shard> {
        self.by_id(id)
            .ok_or_else(|| Error::ShardNotFound { key: id.to_string() })
    }

    /// Connection for the shard `key` resolves to. Resolution failures are
    /// reported when the connection is used.
    pub fn connection(&self, env: &Env, key: &str) -> Box<dyn Connection> {
        match self.by_key(key) {
            Ok(shard) => shard.info.provider.connection(env),
            Err(err) => Box::new(ErrorConnection::new(err)),
        }
    }

    pub fn connection_by_id(&self, env: &Env, id: ShardId) -> Box<dyn Connection> {
        match self.by_id_or_err(id) {
            Ok(shard) => shard.info.provider.connection(env),
            Err(err) => Box::new(ErrorConnection::new(err)),
        }
    }

    /// Run `body` in a transaction on the shard `key` resolves to.
    pub async fn begin<T, F, Fut>(&self, env: &Env, key: &str, opts: TxOptions, body: F) -> Result<T>
    where
        F: FnOnce(Env) -> Fut + Send,
        Fut: Future<Output = Result<T>> + Send,
        T: Send,
    {
        self.by_key(key)?.tx_manager.begin(env, opts, body).await
    }

    pub async fn begin_tx(&self, env: &Env, key: &str, opts: TxOptions) -> Result<(Env, Box<dyn TxFinisher>)> {
        self.by_key(key)?.tx_manager.begin_tx(env, opts).await
    }

    /// `env` without the transaction of the shard `key` resolves to. An
    /// unresolvable key returns `env` unchanged.
    pub fn without_transaction(&self, env: &Env, key: &str) -> Env {
        match self.by_key(key) {
            Ok(shard) => shard.tx_manager.without_transaction(env),
            Err(err) => {
                warn!(registry = %self.name, key, error = %err, "without transaction failed");
                env.clone()
            }
        }
    }

    /// Start every shard concurrently and wait for all of them.
    ///
    /// Shards that started are left running when another one fails; they are
    /// logged so the caller can stop the registry.
    pub async fn start_all(&self, env: &Env) -> Result<()> {
        let results = join_all(self.shards.iter().map(|shard| async move {
            let id = shard.info.id;
            let res = shard.info.provider.start(env).await;
            (id, res)
        }))
        .await;

        let mut started = Vec::new();
        let mut errors = Vec::new();
        for (shard, res) in results {
            match res {
                Ok(()) => started.push(shard),
                Err(err) => errors.push(Error::context(
                    format!("failed to start shard db {shard}"),
                    err,
                )),
            }
        }

        match Error::join(errors) {
            None => {
                debug!(registry = %self.name, shards = self.shards.len(), "all shards started");
                Ok(())
            }
            Some(err) => {
                if !started.is_empty() {
                    warn!(registry = %self.name, ?started, error = %err, "shards left running after failed start");
                }
                Err(err)
            }
        }
    }

    /// Stop every shard concurrently; failures are joined.
    pub async fn stop_all(&self, env: &Env) -> Result<()> {
        let results = join_all(self.shards.iter().map(|shard| async move {
            shard.info.provider.stop(env).await.map_err(|err| {
                Error::context(format!("failed to stop shard db {}", shard.info.id), err)
            })
        }))
        .await;

        let errors = results.into_iter().filter_map(|res| res.err()).collect();
        match Error::join(errors) {
            None => {
                debug!(registry = %self.name, "all shards stopped");
                Ok(())
            }
            Some(err) => Err(err),
        }
    }

    /// Run `f` for every shard, at most `limit` at a time (0 runs them in
    /// sequence). The first failure cancels the rest and is returned wrapped
    /// with its shard.
    pub async fn run_func<F, Fut>(&self, env: &Env, limit: usize, f: F) -> Result<()>
    where
        F: Fn(Env, ShardId, Box<dyn Connection>) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        run_bounded(env, self.shards.iter(), limit, |env, shard| {
            let id = shard.info.id;
            let conn = shard.info.provider.connection(&env);
            let fut = f(env, id, conn);
            async move {
                fut.await.map_err(|err| Error::Shard {
                    shard: id,
                    source: Box::new(err),
                })
            }
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;
    use std::sync::Mutex;

    use super::*;
    use crate::testing::FakeProvider;

    fn registry(providers: &[Arc<FakeProvider>]) -> ShardRegistry {
        let infos = providers.iter().map(|p| p.info()).collect();
        ShardRegistry::new(infos, Arc::new(default_shard_func), "test").unwrap()
    }

    #[test]
    fn default_shard_func_parses_numbers() {
        assert_eq!(default_shard_func("3"), ShardId(3));
        assert_eq!(default_shard_func("x"), ShardId::NONE);
        assert_eq!(default_shard_func("-1"), ShardId::NONE);
    }

    #[test]
    fn rejects_empty_and_duplicate_shards() {
        let err = ShardRegistry::new(Vec::new(), Arc::new(default_shard_func), "empty")
            .err()
            .unwrap();
        assert!(matches!(err, Error::Config { .. }));

        let a = FakeProvider::new(1);
        let b = FakeProvider::new(1);
        let err = ShardRegistry::new(vec![a.info(), b.info()], Arc::new(default_shard_func), "dup")
            .err()
            .unwrap();
        assert!(err.to_string().contains("duplicate shard 1"));
    }

    #[tokio::test]
    async fn unknown_key_yields_error_connection() {
        let reg = registry(&[FakeProvider::new(1)]);
        let env = Env::new();

        let conn = reg.connection(&env, "7");
        let err = conn.exec(&env, "SELECT 1", &[]).await.unwrap_err();
        assert!(err.is_shard_not_found());

        let err = reg
            .begin(&env, "nope", TxOptions::default(), |_env| async { Ok(()) })
            .await
            .unwrap_err();
        assert!(err.is_shard_not_found());
    }

    #[tokio::test]
    async fn connection_routes_by_key() {
        let one = FakeProvider::new(1);
        let two = FakeProvider::new(2);
        let reg = registry(&[one.clone(), two.clone()]);
        let env = Env::new();

        reg.connection(&env, "2").exec(&env, "SELECT 2", &[]).await.unwrap();

        assert!(one.executed().is_empty());
        assert_eq!(two.executed()[0].sql, "SELECT 2");
    }

    #[tokio::test]
    async fn begin_uses_the_shard_transaction() {
        let one = FakeProvider::new(1);
        let reg = registry(&[one.clone()]);

        reg.begin(&Env::new(), "1", TxOptions::default(), |env| {
            let conn = reg.connection(&env, "1");
            async move {
                assert!(conn.in_transaction());
                conn.exec(&env, "UPDATE t SET x = 1", &[]).await?;
                Ok(())
            }
        })
        .await
        .unwrap();

        assert_eq!(one.commits.load(Ordering::SeqCst), 1);
        assert!(one.executed()[0].in_tx);

        let (tx_env, finisher) = reg.begin_tx(&Env::new(), "1", TxOptions::default()).await.unwrap();
        assert!(reg.without_transaction(&tx_env, "1").transaction().is_none());
        assert!(reg.without_transaction(&tx_env, "missing").transaction().is_some());
        finisher.rollback().await.unwrap();
        assert_eq!(one.acquired(), 0);
    }

    #[tokio::test]
    async fn start_all_reports_every_failure() {
        let one = FakeProvider::new(1);
        let two = FakeProvider::new(2);
        let three = FakeProvider::new(3);
        two.fail_start.store(true, Ordering::SeqCst);
        three.fail_start.store(true, Ordering::SeqCst);
        let reg = registry(&[one.clone(), two.clone(), three.clone()]);

        let err = reg.start_all(&Env::new()).await.unwrap_err();
        assert!(matches!(err, Error::Joined(ref errors) if errors.len() == 2));
        assert_eq!(one.starts.load(Ordering::SeqCst), 1);
        assert_eq!(two.starts.load(Ordering::SeqCst), 1);
        assert_eq!(three.starts.load(Ordering::SeqCst), 1);

        reg.stop_all(&Env::new()).await.unwrap();
        assert_eq!(one.stops.load(Ordering::SeqCst), 1);
        assert_eq!(three.stops.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn run_func_visits_every_shard_once() {
        let providers: Vec<_> = (1..=4).map(FakeProvider::new).collect();
        let reg = registry(&providers);
        let seen = Mutex::new(Vec::new());

        reg.run_func(&Env::new(), 2, |env, shard, conn| {
            let seen = &seen;
            async move {
                conn.exec(&env, "SELECT 1", &[]).await?;
                seen.lock().unwrap().push(shard);
                Ok(())
            }
        })
        .await
        .unwrap();

        let mut seen = seen.into_inner().unwrap();
        seen.sort();
        assert_eq!(seen, vec![ShardId(1), ShardId(2), ShardId(3), ShardId(4)]);
    }

    #[tokio::test]
    async fn run_func_wraps_first_error_with_shard() {
        let one = FakeProvider::new(1);
        let two = FakeProvider::new(2);
        two.fail_on("boom");
        let reg = registry(&[one, two]);

        let err = reg
            .run_func(&Env::new(), 0, |env, _shard, conn| async move {
                conn.exec(&env, "SELECT boom", &[]).await.map(|_| ())
            })
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Shard { shard: ShardId(2), .. }));
    }
}
