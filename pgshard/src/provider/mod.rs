//! Connection providers
//!
//! A provider owns the pool of one database and hands out [`Connection`]s:
//! bound to the environment's transaction when it carries one opened by
//! this provider, pooled otherwise.

mod exec;
mod pg;
mod pooled;
mod tx;

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;

use crate::conn::Connection;
use crate::env::Env;
use crate::error::Result;

pub use pg::{AfterStart, PgProvider, ProviderConfig, ProviderStats};
pub use tx::{LargeObjects, TxHandle};

/// Start/stop lifecycle plus connection access for one database.
#[async_trait]
pub trait ConnectionProvider: Send + Sync {
    fn name(&self) -> &str;

    async fn start(&self, env: &Env) -> Result<()>;

    /// Idempotent.
    async fn stop(&self, env: &Env) -> Result<()>;

    fn connection(&self, env: &Env) -> Box<dyn Connection>;
}

/// Process-unique provider identity, stamped on every transaction handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProviderId(u64);

impl ProviderId {
    pub(crate) fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ProviderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Lifecycle of a provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderState {
    Uninitialized,
    Starting,
    Running,
    Stopping,
    Stopped,
}

impl ProviderState {
    pub fn as_str(self) -> &'static str {
        match self {
            ProviderState::Uninitialized => "uninitialized",
            ProviderState::Starting => "starting",
            ProviderState::Running => "running",
            ProviderState::Stopping => "stopping",
            ProviderState::Stopped => "stopped",
        }
    }
}

impl fmt::Display for ProviderState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_ids_are_unique() {
        let a = ProviderId::next();
        let b = ProviderId::next();
        assert_ne!(a, b);
        assert!(a.to_string().starts_with('#'));
    }
}
