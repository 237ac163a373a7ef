//! Bounded fail-fast fan-out.

use std::future::Future;

use futures::stream::{self, TryStreamExt};

use crate::env::Env;
use crate::error::{Error, Result};

/// Run `f` for every item with at most `limit` calls in flight; `limit == 0`
/// runs them one after another.
///
/// All calls share a child of `env`. The first failure cancels it, drops the
/// calls still pending and is returned. Completion order is unspecified.
pub(crate) async fn run_bounded<I, F, Fut>(env: &Env, items: I, limit: usize, f: F) -> Result<()>
where
    I: IntoIterator,
    F: Fn(Env, I::Item) -> Fut,
    Fut: Future<Output = Result<()>>,
{
    let group = env.child();

    if limit == 0 {
        for item in items {
            group.check()?;
            f(group.clone(), item).await?;
        }
        return Ok(());
    }

    stream::iter(items.into_iter().map(Ok::<_, Error>))
        .try_for_each_concurrent(limit, |item| {
            let member = group.clone();
            let fut = f(group.clone(), item);
            async move {
                member.check()?;
                let res = fut.await;
                if res.is_err() {
                    member.cancel();
                }
                res
            }
        })
        .await
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn respects_the_limit() {
        let running = AtomicUsize::new(0);
        let peak = AtomicUsize::new(0);

        run_bounded(&Env::new(), 0..12, 3, |_env, _i| {
            let (running, peak) = (&running, &peak);
            async move {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                running.fetch_sub(1, Ordering::SeqCst);
                Ok(())
            }
        })
        .await
        .unwrap();

        assert!(peak.load(Ordering::SeqCst) <= 3);
        assert!(peak.load(Ordering::SeqCst) >= 2);
    }

    #[tokio::test]
    async fn calls_wait_on_each_other_without_blocking() {
        let barrier = tokio::sync::Barrier::new(4);

        tokio::time::timeout(
            Duration::from_secs(1),
            run_bounded(&Env::new(), 0..4, 4, |_env, _i| {
                let barrier = &barrier;
                async move {
                    barrier.wait().await;
                    Ok(())
                }
            }),
        )
        .await
        .expect("calls did not run concurrently")
        .unwrap();
    }

    #[tokio::test]
    async fn zero_limit_is_sequential_and_stops_at_first_error() {
        let visited = AtomicUsize::new(0);

        let err = run_bounded(&Env::new(), 0..5, 0, |_env, i| {
            let visited = &visited;
            async move {
                visited.fetch_add(1, Ordering::SeqCst);
                if i == 2 {
                    Err(Error::NoRows)
                } else {
                    Ok(())
                }
            }
        })
        .await
        .unwrap_err();

        assert!(matches!(err, Error::NoRows));
        assert_eq!(visited.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn first_error_drops_siblings_but_not_parent() {
        let parent = Env::new();

        let res = tokio::time::timeout(
            Duration::from_secs(1),
            run_bounded(&parent, 0..4, 4, |env, i| async move {
                if i == 0 {
                    return Err(Error::NoRows);
                }
                tokio::select! {
                    _ = env.cancellation().cancelled() => Err(Error::Cancelled),
                    _ = tokio::time::sleep(Duration::from_secs(30)) => Ok(()),
                }
            }),
        )
        .await
        .expect("fan-out did not stop at the first error");

        assert!(matches!(res, Err(Error::NoRows)));
        assert!(!parent.is_cancelled());
    }
}
