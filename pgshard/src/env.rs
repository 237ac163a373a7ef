//! Request-scoped environment
//!
//! An [`Env`] travels down every call: it carries cancellation, an optional
//! deadline, the active transaction (if any) and the bucket a statement is
//! scoped to. It is never mutated in place. Every `with_*` method returns a
//! new value layered on the old one, so clones handed to concurrent work
//! cannot observe each other's transactions.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::bucket::BucketId;
use crate::error::{Error, Result};
use crate::provider::TxHandle;

#[derive(Clone, Default)]
pub struct Env {
    cancel: CancellationToken,
    deadline: Option<Instant>,
    tx: Option<Arc<TxHandle>>,
    bucket: Option<BucketId>,
}

impl Env {
    pub fn new() -> Self {
        Self::default()
    }

    /// Environment driven by an externally owned cancellation token.
    pub fn with_cancellation(&self, token: CancellationToken) -> Self {
        Self {
            cancel: token,
            ..self.clone()
        }
    }

    /// Deadline `timeout` from now. An earlier existing deadline wins.
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    pub fn with_deadline(&self, deadline: Instant) -> Self {
        let deadline = match self.deadline {
            Some(current) if current < deadline => current,
            _ => deadline,
        };
        Self {
            deadline: Some(deadline),
            ..self.clone()
        }
    }

    /// Environment with a child token: cancelling the child leaves `self` untouched,
    /// cancelling `self` cancels the child.
    pub fn child(&self) -> Self {
        Self {
            cancel: self.cancel.child_token(),
            ..self.clone()
        }
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Fails when the environment is cancelled or past its deadline.
    pub fn check(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Err(Error::DeadlineExceeded),
            _ => Ok(()),
        }
    }

    /// Race a wait (pool acquisition, BEGIN) against cancellation and the deadline.
    pub async fn guard<T, F>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        self.check()?;
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(Error::Cancelled),
            _ = wait_deadline(self.deadline) => Err(Error::DeadlineExceeded),
            res = fut => res,
        }
    }

    pub(crate) fn transaction(&self) -> Option<&Arc<TxHandle>> {
        self.tx.as_ref()
    }

    pub(crate) fn with_transaction(&self, tx: Arc<TxHandle>) -> Self {
        Self {
            tx: Some(tx),
            ..self.clone()
        }
    }

    /// Same environment with no active transaction: statements issued with it
    /// go through the pool even while an outer transaction is open.
    pub fn without_transaction(&self) -> Self {
        Self {
            tx: None,
            ..self.clone()
        }
    }

    /// Bucket the current statement is scoped to, when issued through a bucket connection.
    pub fn bucket(&self) -> Option<BucketId> {
        self.bucket
    }

    pub(crate) fn with_bucket(&self, bucket: BucketId) -> Self {
        Self {
            bucket: Some(bucket),
            ..self.clone()
        }
    }
}

impl std::fmt::Debug for Env {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Env")
            .field("cancelled", &self.cancel.is_cancelled())
            .field("deadline", &self.deadline)
            .field("in_transaction", &self.tx.is_some())
            .field("bucket", &self.bucket)
            .finish()
    }
}

async fn wait_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn child_cancel_does_not_reach_parent() {
        let parent = Env::new();
        let child = parent.child();

        child.cancel();
        assert!(child.is_cancelled());
        assert!(!parent.is_cancelled());
        assert!(matches!(child.check(), Err(Error::Cancelled)));
        assert!(parent.check().is_ok());
    }

    #[test]
    fn parent_cancel_reaches_child() {
        let parent = Env::new();
        let child = parent.child();

        parent.cancel();
        assert!(child.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn guard_reports_deadline() {
        let env = Env::new().with_timeout(Duration::from_millis(50));

        let res: Result<()> = env
            .guard(async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .await;

        assert!(matches!(res, Err(Error::DeadlineExceeded)));
        assert!(matches!(env.check(), Err(Error::DeadlineExceeded)));
    }

    #[tokio::test]
    async fn guard_passes_result_through() {
        let env = Env::new();
        let res = env.guard(async { Ok(7) }).await.unwrap();
        assert_eq!(res, 7);
    }

    #[test]
    fn earlier_deadline_wins() {
        let env = Env::new().with_timeout(Duration::from_secs(1));
        let first = env.deadline().unwrap();

        let later = env.with_timeout(Duration::from_secs(60));
        assert_eq!(later.deadline(), Some(first));
    }

    #[test]
    fn bucket_is_layered() {
        let env = Env::new();
        let scoped = env.with_bucket(BucketId(4));

        assert_eq!(scoped.bucket(), Some(BucketId(4)));
        assert_eq!(env.bucket(), None);
    }
}
