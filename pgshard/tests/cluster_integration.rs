//! Cluster tests against a real Postgres.
//!
//! Both shards point at the database in `PGSHARD_TEST_DSN`; buckets are
//! separate schemas, so each test uses its own schema prefix.
//!
//! `PGSHARD_TEST_DSN=postgres://postgres@localhost/postgres cargo test -- --ignored`

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use pgshard::{
    args, default_shard_func, AfterStart, BucketId, BucketInfo, BucketRange, BucketRouter,
    ConnectionExt, ConnectionProvider, Env, Error, Identifier, PgProvider, ProviderConfig,
    ProviderState, RouterOptions, ShardId, ShardInfo, ShardRegistry, TransactionManager,
    TxOptions,
};

fn dsn() -> String {
    std::env::var("PGSHARD_TEST_DSN").expect("PGSHARD_TEST_DSN must point at a test database")
}

fn provider(shard: u32) -> PgProvider {
    PgProvider::new(ProviderConfig::from_dsn(format!("shard-{shard}"), dsn())).unwrap()
}

/// Ten buckets over two shards; keys are bucket numbers.
fn cluster(schema_prefix: &str) -> BucketRouter<str> {
    let registry = ShardRegistry::new(
        vec![
            ShardInfo::from_pg(ShardId(1), provider(1)),
            ShardInfo::from_pg(ShardId(2), provider(2)),
        ],
        Arc::new(default_shard_func),
        "integration",
    )
    .unwrap();
    let buckets = vec![
        BucketInfo::new(ShardId(1), BucketRange::new(0, 4)),
        BucketInfo::new(ShardId(2), BucketRange::new(5, 9)),
    ];
    let options = RouterOptions {
        run_limit: 3,
        schema_prefix: schema_prefix.to_string(),
        ..RouterOptions::default()
    };
    BucketRouter::new(
        registry,
        buckets,
        |key: &str| BucketId(key.parse().unwrap_or(u32::MAX)),
        options,
    )
    .unwrap()
}

async fn reset(router: &BucketRouter<str>, env: &Env) {
    router
        .init_cluster(
            env,
            "CREATE TABLE IF NOT EXISTS __bucket__.items (id BIGINT PRIMARY KEY, name TEXT NOT NULL)",
        )
        .await
        .unwrap();
    router
        .run_bucket_func(env, |env, _shard, _bucket, conn| async move {
            conn.exec(&env, "DELETE FROM __bucket__.items", &[]).await?;
            Ok(())
        })
        .await
        .unwrap();
}

async fn drop_schemas(router: &BucketRouter<str>, env: &Env) {
    router
        .run_bucket_func(env, |env, _shard, _bucket, conn| async move {
            conn.exec(&env, "DROP SCHEMA IF EXISTS __bucket__ CASCADE", &[])
                .await?;
            Ok(())
        })
        .await
        .unwrap();
}

async fn count_all(router: &BucketRouter<str>, env: &Env) -> i64 {
    let total = AtomicI64::new(0);
    router
        .run_bucket_func(env, |env, _shard, _bucket, conn| {
            let total = &total;
            async move {
                let (n,): (i64,) = conn
                    .query_row_as(&env, "SELECT count(*) FROM __bucket__.items", &[])
                    .await?;
                total.fetch_add(n, Ordering::SeqCst);
                Ok(())
            }
        })
        .await
        .unwrap();
    total.load(Ordering::SeqCst)
}

#[tokio::test]
#[ignore = "requires database"]
async fn sharded_batch_rows_are_counted_per_bucket() {
    let router = cluster("it_batch_");
    let env = Env::new().with_timeout(Duration::from_secs(30));
    router.start(&env).await.unwrap();
    reset(&router, &env).await;

    let mut batch = router.shard_batch();
    for id in 0..10_i64 {
        batch
            .queue(
                &id.to_string(),
                "INSERT INTO __bucket__.items (id, name) VALUES ($1, $2)",
                args![id, format!("item-{id}")],
            )
            .unwrap();
    }
    batch.exec_all(&env).await.unwrap();

    assert_eq!(count_all(&router, &env).await, 10);

    let row: (String,) = router
        .connection(&env, "7")
        .query_row_as(&env, "SELECT name FROM __bucket__.items WHERE id = $1", &args![7_i64])
        .await
        .unwrap();
    assert_eq!(row.0, "item-7");

    drop_schemas(&router, &env).await;
    router.stop(&env).await.unwrap();
}

#[tokio::test]
#[ignore = "requires database"]
async fn failed_batch_statement_aborts_the_rest_and_rolls_back() {
    let router = cluster("it_abort_");
    let env = Env::new();
    router.start(&env).await.unwrap();
    reset(&router, &env).await;

    let mut batch = router.new_batch(BucketId(4));
    batch.queue("INSERT INTO __bucket__.items VALUES ($1, $2)", args![1_i64, "a"]);
    batch.queue("INSERT INTO __bucket__.items VALUES ($1, $2)", args![2_i64, "b"]);
    batch.queue("INSERT INTO __bucket__.items VALUES ($1, $2)", args![1_i64, "dup"]);
    batch.queue("INSERT INTO __bucket__.items VALUES ($1, $2)", args![3_i64, "c"]);

    let mut results = router.send_batch(&env, "4", &batch).await;
    assert_eq!(results.exec().unwrap().rows_affected, 1);
    assert_eq!(results.exec().unwrap().rows_affected, 1);
    let err = results.exec().unwrap_err();
    assert!(!matches!(err, Error::BatchAborted { .. }), "{err}");
    assert!(matches!(results.exec(), Err(Error::BatchAborted { index: 3 })));
    assert!(matches!(results.exec(), Err(Error::NoMoreResults)));

    // The implicit transaction rolled back the statements that succeeded.
    assert_eq!(count_all(&router, &env).await, 0);

    drop_schemas(&router, &env).await;
    router.stop(&env).await.unwrap();
}

#[tokio::test]
#[ignore = "requires database"]
async fn failing_after_start_hook_reverts_the_provider() {
    let config = ProviderConfig {
        after_start: Some(AfterStart::new(|_env, pool| {
            Box::pin(async move {
                sqlx::query("SELECT 1").execute(&pool).await?;
                Err::<(), _>(Error::config("warmup refused"))
            })
        })),
        ..ProviderConfig::from_dsn("shard-1", dsn())
    };
    let provider = PgProvider::new(config).unwrap();

    let err = provider.start(&Env::new()).await.unwrap_err();

    assert!(err.to_string().contains("failed to run after start function"), "{err}");
    assert_eq!(provider.state(), ProviderState::Uninitialized);
    assert!(provider.pool().is_none());
}

#[tokio::test]
#[ignore = "requires database"]
async fn transaction_rolls_back_on_error_and_commits_on_success() {
    let router = cluster("it_tx_");
    let env = Env::new();
    router.start(&env).await.unwrap();
    reset(&router, &env).await;

    let res: pgshard::Result<()> = router
        .begin(&env, "3", TxOptions::default(), |env| {
            let conn = router.connection(&env, "3");
            async move {
                conn.exec(&env, "INSERT INTO __bucket__.items VALUES (1, 'a')", &[])
                    .await?;
                conn.exec(&env, "INSERT INTO __bucket__.items VALUES (1, 'dup')", &[])
                    .await?;
                Ok(())
            }
        })
        .await;
    assert!(res.is_err());
    assert_eq!(count_all(&router, &env).await, 0);

    router
        .begin(&env, "3", TxOptions::default(), |env| {
            let conn = router.connection(&env, "3");
            async move {
                conn.exec(&env, "INSERT INTO __bucket__.items VALUES (1, 'a')", &[])
                    .await?;
                Ok(())
            }
        })
        .await
        .unwrap();
    assert_eq!(count_all(&router, &env).await, 1);

    drop_schemas(&router, &env).await;
    router.stop(&env).await.unwrap();
}

#[tokio::test]
#[ignore = "requires database"]
async fn copy_from_loads_rows_into_the_bucket() {
    let router = cluster("it_copy_");
    let env = Env::new();
    router.start(&env).await.unwrap();
    reset(&router, &env).await;

    let copied = router
        .copy_from(
            &env,
            "6",
            &Identifier::from("__bucket__.items"),
            &["id", "name"],
            vec![args![1_i64, "one"], args![2_i64, "with \"quotes\", commas"]],
        )
        .await
        .unwrap();
    assert_eq!(copied, 2);

    let (name,): (String,) = router
        .connection(&env, "6")
        .query_row_as(&env, "SELECT name FROM __bucket__.items WHERE id = 2", &[])
        .await
        .unwrap();
    assert_eq!(name, "with \"quotes\", commas");

    drop_schemas(&router, &env).await;
    router.stop(&env).await.unwrap();
}

#[tokio::test]
#[ignore = "requires database"]
async fn large_objects_round_trip_inside_a_transaction() {
    let router = cluster("it_lo_");
    let env = Env::new();
    router.start(&env).await.unwrap();

    router
        .begin(&env, "0", TxOptions::default(), |env| {
            let lo = router.large_objects(&env, "0");
            async move {
                let oid = lo.create(&env).await?;
                lo.write(&env, oid, 0, b"hello world").await?;
                assert_eq!(lo.read(&env, oid, 6, 5).await?, b"world");
                assert_eq!(lo.read_all(&env, oid).await?, b"hello world");
                lo.unlink(&env, oid).await?;
                Ok(())
            }
        })
        .await
        .unwrap();

    router.stop(&env).await.unwrap();
}

/// Acquired connection count once released connections made it back to the
/// pool, which happens in the background.
async fn settled_acquired(provider: &PgProvider) -> usize {
    let mut acquired = provider.stats().unwrap().acquired;
    for _ in 0..50 {
        if acquired == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        acquired = provider.stats().unwrap().acquired;
    }
    acquired
}

#[tokio::test]
#[ignore = "requires database"]
async fn panicking_body_rolls_back_and_returns_the_connection() {
    let provider = Arc::new(provider(1));
    let env = Env::new();
    provider.start(&env).await.unwrap();
    let tm = TransactionManager::new(provider.clone(), provider.clone());

    provider
        .connection(&env)
        .exec(&env, "SELECT 1", &[])
        .await
        .unwrap();
    assert_eq!(settled_acquired(&provider).await, 0);

    let outcome = AssertUnwindSafe(tm.begin(&env, TxOptions::default(), |env| {
        let conn = provider.connection(&env);
        async move {
            conn.exec(&env, "SELECT 1", &[]).await?;
            if conn.in_transaction() {
                panic!("body failed");
            }
            Ok(())
        }
    }))
    .catch_unwind()
    .await;
    assert!(outcome.is_err());
    assert_eq!(settled_acquired(&provider).await, 0);

    provider.stop(&env).await.unwrap();
}
