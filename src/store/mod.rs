//! Store Adapter — a thin contract over the document store backing the
//! dispatcher. The Dispatcher never talks to SQL directly; it only ever sees
//! this trait, so a different backing store can be substituted without
//! touching dispatcher logic.

mod sqlite;

pub use sqlite::SqliteStore;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

/// Errors surfaced by a [`StoreAdapter`]. The Dispatcher treats [`StoreError::Transient`]
/// as retryable (exponential backoff, max 5 tries per `spec.md` §4.1); the other
/// variants propagate to the caller.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("transient store error: {0}")]
    Transient(String),
    #[error("fatal store error: {0}")]
    Fatal(String),
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Transient(_))
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Ascending/descending sort order for a [`Query`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    Asc,
    Desc,
}

/// A single sort instruction: `(field, order)`.
#[derive(Debug, Clone)]
pub struct Sort {
    pub field: String,
    pub order: SortOrder,
}

/// A narrow, Elasticsearch-flavored filter expression. `SqliteStore` only
/// understands the field names the dispatcher and seeder actually issue
/// (`name`, `docId`, `numValidAnnotations`, `annotations`, `invalid`); this is
/// documented in `DESIGN.md` as a deliberate scope limitation rather than a
/// general-purpose document query language.
#[derive(Debug, Clone)]
pub enum Query {
    /// Match every record in the collection.
    All,
    /// `field == value`.
    Term { field: String, value: String },
    /// `field < lt` and/or `field > gt`, both ends optional.
    Range {
        field: String,
        lt: Option<i64>,
        gt: Option<i64>,
    },
    /// `field` is present (non-null / non-empty) on the record.
    Exists { field: String },
    /// All of `filter` must match, none of `must_not` may match.
    Bool {
        filter: Vec<Query>,
        must_not: Vec<Query>,
    },
}

impl Query {
    pub fn term(field: impl Into<String>, value: impl Into<String>) -> Self {
        Query::Term {
            field: field.into(),
            value: value.into(),
        }
    }

    pub fn exists(field: impl Into<String>) -> Self {
        Query::Exists {
            field: field.into(),
        }
    }

    pub fn not_exists(field: impl Into<String>) -> Self {
        Query::Bool {
            filter: vec![],
            must_not: vec![Query::exists(field)],
        }
    }

    pub fn range_lt_gt(field: impl Into<String>, lt: i64, gt: i64) -> Self {
        Query::Range {
            field: field.into(),
            lt: Some(lt),
            gt: Some(gt),
        }
    }

    pub fn and(clauses: Vec<Query>) -> Self {
        Query::Bool {
            filter: clauses,
            must_not: vec![],
        }
    }

    /// `self` filtered, with `extra` clauses added to `must_not`.
    pub fn and_not(self, extra: Vec<Query>) -> Self {
        match self {
            Query::Bool { filter, must_not } => {
                let mut must_not = must_not;
                must_not.extend(extra);
                Query::Bool { filter, must_not }
            }
            other => Query::Bool {
                filter: vec![other],
                must_not: extra,
            },
        }
    }
}

/// A cursored window returned by [`StoreAdapter::search`].
#[derive(Debug, Clone)]
pub struct Page {
    /// `(id, record)` pairs, in the order the query's sort demands.
    pub hits: Vec<(String, Value)>,
}

/// Contract over the document store. All operations are `async fn`s but are
/// implemented as blocking I/O dispatched to a worker thread (`spec.md` §4.1
/// describes them as "synchronous from the caller's perspective").
#[async_trait]
pub trait StoreAdapter: Send + Sync {
    /// Idempotent: create `index`/`type` if absent and install the documented
    /// field mapping (`spec.md` §6).
    async fn ensure_schema(&self, index: &str, doc_type: &str) -> Result<()>;

    async fn get(&self, index: &str, doc_type: &str, id: &str) -> Result<Value>;

    /// Create or overwrite.
    async fn put(&self, index: &str, doc_type: &str, id: &str, body: Value) -> Result<()>;

    /// Shallow merge of named top-level fields.
    async fn update(&self, index: &str, doc_type: &str, id: &str, patch: Value) -> Result<()>;

    /// Cursored window over matches, ordered by `sort` if given.
    async fn search(
        &self,
        index: &str,
        doc_type: &str,
        query: &Query,
        from: usize,
        size: usize,
        sort: Option<&Sort>,
    ) -> Result<Page>;

    /// All matches for `query`. Eagerly materialized: the only caller
    /// (`Dispatcher::fill_partial`) always drains it in full before serving
    /// any consumer, so a true streaming cursor buys nothing here.
    async fn scan(&self, index: &str, doc_type: &str, query: &Query) -> Result<Vec<(String, Value)>>;

    /// Batched put, for the seeder.
    async fn bulk_index(
        &self,
        index: &str,
        doc_type: &str,
        records: Vec<(String, Value)>,
    ) -> Result<()>;

    /// Lazily create a placeholder annotator record the first time an id is
    /// seen, mirroring the original's `open_session` behavior of indexing a
    /// new annotator document on first sight of an unknown session id
    /// (`SPEC_FULL.md` §3). The Dispatcher itself never calls this — it is
    /// convenience scaffolding for callers that manage annotator identity
    /// (e.g. the demo CLI), not a Dispatcher operation.
    async fn ensure_annotator(&self, index: &str, annotator_type: &str, id: &str) -> Result<()> {
        match self.get(index, annotator_type, id).await {
            Ok(_) => Ok(()),
            Err(StoreError::NotFound(_)) => {
                self.put(
                    index,
                    annotator_type,
                    id,
                    serde_json::json!({ "signup": chrono::Utc::now().to_rfc3339() }),
                )
                .await
            }
            Err(e) => Err(e),
        }
    }
}

/// Retry a fallible store operation with exponential backoff, per `spec.md`
/// §4.3/§7: `StoreError::Transient` is retried up to 5 attempts, anything else
/// propagates immediately.
pub async fn with_retry<F, Fut, T>(mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    const MAX_ATTEMPTS: u32 = 5;
    let mut attempt = 0;
    loop {
        attempt += 1;
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) if e.is_transient() && attempt < MAX_ATTEMPTS => {
                let backoff_ms = 50u64 * (1 << (attempt - 1));
                tracing::warn!(attempt, backoff_ms, error = %e, "transient store error, retrying");
                tokio::time::sleep(std::time::Duration::from_millis(backoff_ms)).await;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn with_retry_gives_up_after_five_transient_failures() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = with_retry(|| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(StoreError::Transient("db busy".into())) }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn with_retry_stops_immediately_on_fatal_error() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = with_retry(|| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(StoreError::Fatal("disk full".into())) }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn with_retry_succeeds_after_transient_failures() {
        let calls = AtomicU32::new(0);
        let result = with_retry(|| {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(StoreError::Transient("db busy".into()))
                } else {
                    Ok(42)
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(result, 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
