//! Statement execution on a single connection plus optional query logging.

use std::fmt::Write as _;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use futures::TryStreamExt;
use sqlx::postgres::{PgConnection, PgRow};
use sqlx::Either;

use crate::conn::{Batch, CommandTag, Identifier, Statement, StatementOutput};
use crate::env::Env;
use crate::error::{Error, Result};
use crate::value::{bind_all, Value};

/// Statements of a batch rendered into one log line, at most.
const BATCH_LOG_LIMIT: usize = 10;

pub(crate) async fn execute(conn: &mut PgConnection, sql: &str, args: &[Value]) -> Result<CommandTag> {
    let res = bind_all(sqlx::query(sql), args).execute(conn).await?;
    Ok(res.into())
}

pub(crate) async fn fetch_all(conn: &mut PgConnection, sql: &str, args: &[Value]) -> Result<Vec<PgRow>> {
    Ok(bind_all(sqlx::query(sql), args).fetch_all(conn).await?)
}

pub(crate) async fn fetch_one(conn: &mut PgConnection, sql: &str, args: &[Value]) -> Result<PgRow> {
    bind_all(sqlx::query(sql), args)
        .fetch_optional(conn)
        .await?
        .ok_or(Error::NoRows)
}

/// Run one statement keeping both its command tag and its rows.
#[allow(deprecated)]
async fn run_statement(conn: &mut PgConnection, stmt: &Statement) -> Result<StatementOutput> {
    let mut out = StatementOutput::default();
    let mut stream = bind_all(sqlx::query(&stmt.sql), &stmt.args).fetch_many(conn);
    while let Some(item) = stream.try_next().await? {
        match item {
            Either::Left(done) => out.tag.rows_affected += done.rows_affected(),
            Either::Right(row) => out.rows.push(row),
        }
    }
    Ok(out)
}

/// Run every statement of `batch` in order. The first failure aborts the
/// statements after it. The flag reports whether anything failed.
pub(crate) async fn run_batch(
    conn: &mut PgConnection,
    env: &Env,
    batch: &Batch,
) -> (Vec<Result<StatementOutput>>, bool) {
    let mut items = Vec::with_capacity(batch.len());
    let mut failed = false;

    for (index, stmt) in batch.statements().iter().enumerate() {
        if failed {
            items.push(Err(Error::BatchAborted { index }));
            continue;
        }
        let res = match env.check() {
            Ok(()) => run_statement(&mut *conn, stmt).await,
            Err(err) => Err(err),
        };
        failed = res.is_err();
        items.push(res);
    }

    (items, failed)
}

pub(crate) fn first_error(items: &[Result<StatementOutput>]) -> Option<&Error> {
    items.iter().find_map(|item| item.as_ref().err())
}

pub(crate) fn copy_statement(table: &Identifier, columns: &[&str]) -> String {
    let columns = columns
        .iter()
        .map(|col| Identifier::new([*col]).sanitize())
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "COPY {} ({}) FROM STDIN (FORMAT csv)",
        table.sanitize(),
        columns
    )
}

/// CSV body for `COPY ... (FORMAT csv)`: NULL is an unquoted empty field,
/// every other value is quoted.
fn encode_csv(rows: &[Vec<Value>]) -> Vec<u8> {
    let mut out = String::new();
    for row in rows {
        for (i, value) in row.iter().enumerate() {
            if i > 0 {
                out.push(',');
            }
            if let Some(text) = value.to_copy_text() {
                out.push('"');
                out.push_str(&text.replace('"', "\"\""));
                out.push('"');
            }
        }
        out.push('\n');
    }
    out.into_bytes()
}

pub(crate) async fn copy_rows(conn: &mut PgConnection, statement: &str, rows: &[Vec<Value>]) -> Result<u64> {
    let mut copy = conn.copy_in_raw(statement).await?;
    let sent = copy.send(encode_csv(rows)).await.map(|_| ());
    match sent {
        Ok(()) => Ok(copy.finish().await?),
        Err(err) => {
            if let Err(abort) = copy.abort(err.to_string()).await {
                tracing::debug!(error = %abort, "copy abort failed");
            }
            Err(err.into())
        }
    }
}

/// Per-provider statement logging.
///
/// Disabled logging runs the statement untouched. Enabled logging emits one
/// `debug!` per statement, or `error!` when it fails; the error is still
/// returned to the caller.
#[derive(Debug, Clone)]
pub(crate) struct QueryLog {
    database: Arc<str>,
    enabled: bool,
}

impl QueryLog {
    pub(crate) fn new(database: &str, enabled: bool) -> Self {
        Self {
            database: Arc::from(database),
            enabled,
        }
    }

    pub(crate) fn start(&self) -> Option<Instant> {
        self.enabled.then(Instant::now)
    }

    pub(crate) async fn run<T, F>(
        &self,
        env: &Env,
        command: &'static str,
        sql: &str,
        args: &[Value],
        fut: F,
    ) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let started = self.start();
        let res = fut.await;
        if let Some(started) = started {
            self.record(env, command, sql, &render_args(args), started, res.as_ref().err());
        }
        res
    }

    pub(crate) fn batch(
        &self,
        env: &Env,
        batch: &Batch,
        started: Option<Instant>,
        err: Option<&Error>,
    ) {
        if let Some(started) = started {
            self.record(env, "batch", &render_batch(batch), "", started, err);
        }
    }

    fn record(
        &self,
        env: &Env,
        command: &'static str,
        sql: &str,
        args: &str,
        started: Instant,
        err: Option<&Error>,
    ) {
        let latency = started.elapsed();
        let bucket = env.bucket().map(|b| b.0);
        match err {
            None => tracing::debug!(
                database = %self.database,
                command,
                ?bucket,
                ?latency,
                query = sql,
                args,
                "dbquery"
            ),
            Some(err) => tracing::error!(
                database = %self.database,
                command,
                ?bucket,
                ?latency,
                query = sql,
                args,
                error = %err,
                "dbquery"
            ),
        }
    }
}

fn render_args(args: &[Value]) -> String {
    args.iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(",")
}

/// `[SELECT ... WHERE id = $1; ARGS: 7][...]...`
fn render_batch(batch: &Batch) -> String {
    let mut out = String::new();
    for (i, stmt) in batch.statements().iter().enumerate() {
        if i >= BATCH_LOG_LIMIT {
            out.push_str("...");
            break;
        }
        let _ = write!(out, "[{}; ARGS: {}]", stmt.sql, render_args(&stmt.args));
    }
    out
}
