use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use sqlx::postgres::PgRow;

use crate::bucket::{prepare_bucket_sql_with, BucketId, BUCKET_PREFIX};
use crate::conn::CommandTag;
use crate::error::{Error, Result};
use crate::value::Value;

/// One queued statement with its positional arguments.
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    pub sql: String,
    pub args: Vec<Value>,
}

/// Ordered statements scoped to one bucket.
///
/// The bucket placeholder is rewritten when a statement is queued, so the
/// batch holds the final SQL text.
#[derive(Debug, Clone)]
pub struct Batch {
    bucket: Option<BucketId>,
    schema_prefix: Arc<str>,
    statements: Vec<Statement>,
}

impl Default for Batch {
    fn default() -> Self {
        Self::unscoped()
    }
}

impl Batch {
    /// Batch whose statements are rewritten for `bucket`.
    pub fn new(bucket: BucketId) -> Self {
        Self::with_prefix(bucket, Arc::from(BUCKET_PREFIX))
    }

    pub(crate) fn with_prefix(bucket: BucketId, schema_prefix: Arc<str>) -> Self {
        Self {
            bucket: Some(bucket),
            schema_prefix,
            statements: Vec::new(),
        }
    }

    /// Batch that queues statements verbatim.
    pub fn unscoped() -> Self {
        Self {
            bucket: None,
            schema_prefix: Arc::from(BUCKET_PREFIX),
            statements: Vec::new(),
        }
    }

    pub fn bucket(&self) -> Option<BucketId> {
        self.bucket
    }

    pub fn queue(&mut self, sql: &str, args: Vec<Value>) {
        let sql = match self.bucket {
            Some(bucket) => prepare_bucket_sql_with(sql, &self.schema_prefix, bucket),
            None => sql.to_string(),
        };
        self.statements.push(Statement { sql, args });
    }

    /// Queue only when `bucket` is the batch's bucket.
    pub fn queue_bucket(&mut self, bucket: BucketId, sql: &str, args: Vec<Value>) {
        if self.bucket == Some(bucket) {
            self.queue(sql, args);
        }
    }

    pub fn len(&self) -> usize {
        self.statements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.statements.is_empty()
    }

    pub fn statements(&self) -> &[Statement] {
        &self.statements
    }
}

/// Result of one batch statement: its command tag and any rows it returned.
#[derive(Default)]
pub struct StatementOutput {
    pub tag: CommandTag,
    pub rows: Vec<PgRow>,
}

impl fmt::Debug for StatementOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StatementOutput")
            .field("tag", &self.tag)
            .field("rows", &self.rows.len())
            .finish()
    }
}

/// Per-statement results of a sent batch, consumed in enqueue order.
pub struct BatchResults {
    items: VecDeque<Result<StatementOutput>>,
    failure: Option<Arc<Error>>,
}

impl BatchResults {
    pub fn new(items: impl IntoIterator<Item = Result<StatementOutput>>) -> Self {
        Self {
            items: items.into_iter().collect(),
            failure: None,
        }
    }

    /// Results of a batch that never reached the database; every call reports `err`.
    pub fn failed(err: Error) -> Self {
        let failure = match err {
            Error::Shared(shared) => shared,
            other => Arc::new(other),
        };
        Self {
            items: VecDeque::new(),
            failure: Some(failure),
        }
    }

    /// Results still waiting to be read.
    pub fn remaining(&self) -> usize {
        self.items.len()
    }

    fn next_output(&mut self) -> Result<StatementOutput> {
        if let Some(failure) = &self.failure {
            return Err(Error::Shared(failure.clone()));
        }
        self.items.pop_front().unwrap_or(Err(Error::NoMoreResults))
    }

    pub fn exec(&mut self) -> Result<CommandTag> {
        self.next_output().map(|out| out.tag)
    }

    pub fn query(&mut self) -> Result<Vec<PgRow>> {
        self.next_output().map(|out| out.rows)
    }

    pub fn query_row(&mut self) -> Result<PgRow> {
        self.next_output()?.rows.into_iter().next().ok_or(Error::NoRows)
    }

    /// Discard unread results. Reports the transport failure, or the first
    /// error among the unread results. Draining makes later calls succeed.
    pub fn close(&mut self) -> Result<()> {
        if let Some(failure) = self.failure.take() {
            return Err(Error::Shared(failure));
        }
        let first_err = self.items.drain(..).find_map(|item| item.err());
        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

impl fmt::Debug for BatchResults {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BatchResults")
            .field("remaining", &self.items.len())
            .field("failure", &self.failure)
            .finish()
    }
}
