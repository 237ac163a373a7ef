use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use pgshard::{
    args, BucketId, BucketRouter, ClusterConfig, ConnectionExt, Env, Error, Identifier, ShardId,
};
use tracing::{info, warn};

mod tracing_setup;

use tracing_setup::{init_tracing, TracingConfig};

const DEFAULT_SCHEMA: &str = "CREATE TABLE IF NOT EXISTS __bucket__.events (\
    id BIGINT PRIMARY KEY, \
    payload TEXT NOT NULL, \
    created_at TIMESTAMPTZ NOT NULL DEFAULT now())";

const INSERT_EVENT: &str =
    "INSERT INTO __bucket__.events (id, payload) VALUES ($1, $2) ON CONFLICT (id) DO NOTHING";

#[derive(Parser, Debug)]
#[command(name = "pgshard-demo", author, version, about = "Drive a bucket-sharded PostgreSQL cluster")]
struct Cli {
    /// Cluster description (TOML)
    #[arg(long, short = 'c', env = "PGSHARD_CONFIG", default_value = "pgshard.toml", global = true)]
    config: PathBuf,

    /// Enable debug logging
    #[arg(long, global = true)]
    debug: bool,

    /// Give up after this many seconds
    #[arg(long, value_name = "SECS", global = true)]
    timeout: Option<u64>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print the shard and bucket layout without connecting
    Check,
    #[command(flatten)]
    Cluster(ClusterCommand),
}

/// Commands that start the cluster first.
#[derive(Subcommand, Debug)]
enum ClusterCommand {
    /// Create bucket schemas and apply a table definition to every bucket
    Init(InitArgs),
    /// Insert events through one batch per shard
    Insert(InsertArgs),
    /// Count rows in every bucket
    Count(CountArgs),
}

#[derive(Args, Debug)]
struct InitArgs {
    /// DDL addressing tables as __bucket__.name (defaults to the events table)
    #[arg(long)]
    sql: Option<String>,
}

#[derive(Args, Debug)]
struct InsertArgs {
    /// Number of events to insert
    #[arg(long, default_value_t = 10)]
    rows: i64,

    /// First event id
    #[arg(long, default_value_t = 0)]
    start: i64,
}

#[derive(Args, Debug)]
struct CountArgs {
    /// Table to count in every bucket schema
    #[arg(long, default_value = "events")]
    table: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_tracing(&TracingConfig { debug: cli.debug }).ok();

    let config = ClusterConfig::load(&cli.config)
        .with_context(|| format!("failed to load {}", cli.config.display()))?;
    let router = config.build().context("invalid cluster config")?;

    let command = match cli.command {
        Commands::Check => {
            print_layout(&router);
            return Ok(());
        }
        Commands::Cluster(command) => command,
    };

    let env = root_env(cli.timeout);
    router.start(&env).await.context("failed to start cluster")?;
    let res = run(&router, &env, command).await;
    if let Err(err) = router.stop(&Env::new()).await {
        warn!(error = %err, "failed to stop cluster");
    }
    res
}

/// Root environment: cancelled on Ctrl-C, bounded by `--timeout`.
fn root_env(timeout: Option<u64>) -> Env {
    let env = match timeout {
        Some(secs) => Env::new().with_timeout(Duration::from_secs(secs)),
        None => Env::new(),
    };
    let signal = env.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupted, cancelling");
            signal.cancel();
        }
    });
    env
}

async fn run(router: &BucketRouter<str>, env: &Env, command: ClusterCommand) -> Result<()> {
    match command {
        ClusterCommand::Init(args) => {
            let sql = args.sql.as_deref().unwrap_or(DEFAULT_SCHEMA);
            router
                .init_cluster(env, sql)
                .await
                .context("failed to initialize cluster")?;
            println!("initialized {} buckets", router.bucket_count());
            Ok(())
        }
        ClusterCommand::Insert(args) => insert(router, env, args).await,
        ClusterCommand::Count(args) => count(router, env, args).await,
    }
}

fn print_layout(router: &BucketRouter<str>) {
    println!(
        "cluster {}: {} shards, {} buckets",
        router.name(),
        router.registry().len(),
        router.bucket_count()
    );
    for info in router.buckets() {
        println!(
            "shard {}: buckets {}..={} ({} .. {})",
            info.shard,
            info.range.from,
            info.range.to,
            router.schema(info.range.from),
            router.schema(info.range.to)
        );
    }
}

async fn insert(router: &BucketRouter<str>, env: &Env, args: InsertArgs) -> Result<()> {
    let mut batch = router.shard_batch();
    for id in args.start..args.start + args.rows {
        batch
            .queue(&id.to_string(), INSERT_EVENT, args![id, format!("event-{id}")])
            .with_context(|| format!("failed to queue event {id}"))?;
    }
    let queued = batch.len();
    batch.exec_all(env).await.context("failed to insert events")?;

    info!(rows = queued, "events inserted");
    println!("inserted {queued} events");
    Ok(())
}

async fn count(router: &BucketRouter<str>, env: &Env, args: CountArgs) -> Result<()> {
    let sql = format!(
        "SELECT count(*) FROM __bucket__.{}",
        Identifier::new([args.table.as_str()]).sanitize()
    );
    let counts: Mutex<Vec<(ShardId, BucketId, i64)>> = Mutex::new(Vec::new());

    router
        .run_bucket_func(env, |env, shard, bucket, conn| {
            let (sql, counts) = (&sql, &counts);
            async move {
                let (n,): (i64,) = conn.query_row_as(&env, sql, &[]).await?;
                counts
                    .lock()
                    .map_err(|_| Error::other("count results lock poisoned"))?
                    .push((shard, bucket, n));
                Ok(())
            }
        })
        .await
        .with_context(|| format!("failed to count {}", args.table))?;

    let mut counts = counts
        .into_inner()
        .map_err(|_| anyhow!("count results lock poisoned"))?;
    counts.sort_by_key(|(_, bucket, _)| *bucket);
    for (shard, bucket, n) in &counts {
        println!("shard {shard} bucket {bucket}: {n}");
    }
    println!("total: {}", counts.iter().map(|(_, _, n)| n).sum::<i64>());
    Ok(())
}
