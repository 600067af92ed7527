use std::future::IntoFuture;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::stream::{self, Stream};
use serde_json::Value;
use tracing::{debug, trace};

use crate::error::{Error, Result};

// ---------------------------------------------------------------------------
// Database handle
// ---------------------------------------------------------------------------

/// A database that runs AQL text and hands back a cursor over the rows.
#[async_trait]
pub trait Database: Send + Sync {
    async fn query(&self, query: &str) -> Result<Box<dyn Cursor>>;
}

#[async_trait]
impl<D: Database + ?Sized> Database for Arc<D> {
    async fn query(&self, query: &str) -> Result<Box<dyn Cursor>> {
        (**self).query(query).await
    }
}

/// Rows of one query, pulled one at a time or drained.
#[async_trait]
pub trait Cursor: Send {
    async fn next(&mut self) -> Result<Option<Value>>;

    /// Drain every remaining row.
    async fn all(&mut self) -> Result<Vec<Value>> {
        let mut rows = Vec::new();
        while let Some(row) = self.next().await? {
            rows.push(row);
        }
        Ok(rows)
    }

    /// Total row count, when the backend knows it up front.
    fn count(&self) -> Option<usize> {
        None
    }
}

/// Cursor over rows that are already in memory.
#[derive(Debug)]
pub struct VecCursor {
    rows: std::vec::IntoIter<Value>,
    total: usize,
}

impl VecCursor {
    pub fn new(rows: Vec<Value>) -> Self {
        Self {
            total: rows.len(),
            rows: rows.into_iter(),
        }
    }
}

#[async_trait]
impl Cursor for VecCursor {
    async fn next(&mut self) -> Result<Option<Value>> {
        Ok(self.rows.next())
    }

    async fn all(&mut self) -> Result<Vec<Value>> {
        Ok(self.rows.by_ref().collect())
    }

    fn count(&self) -> Option<usize> {
        Some(self.total)
    }
}

// ---------------------------------------------------------------------------
// Query result
// ---------------------------------------------------------------------------

/// Result of a dispatched query.
///
/// Holds the pending round trip until the first call that needs rows, then
/// keeps the cursor it resolved to. The same value serves cursor-style use
/// (`next`, `batch`, `into_stream`) and eager use (`all`, or just `.await`).
/// If the round trip fails, that call returns the database's error and every
/// later call returns [`Error::CursorConsumed`].
pub struct QueryResult<'a> {
    pending: Option<BoxFuture<'a, Result<Box<dyn Cursor>>>>,
    cursor: Option<Box<dyn Cursor>>,
}

impl<'a> QueryResult<'a> {
    pub(crate) fn pending(round_trip: BoxFuture<'a, Result<Box<dyn Cursor>>>) -> Self {
        Self {
            pending: Some(round_trip),
            cursor: None,
        }
    }

    async fn cursor_mut(&mut self) -> Result<&mut Box<dyn Cursor>> {
        if let Some(round_trip) = self.pending.take() {
            self.cursor = Some(round_trip.await?);
        }
        self.cursor.as_mut().ok_or(Error::CursorConsumed)
    }

    pub async fn next(&mut self) -> Result<Option<Value>> {
        self.cursor_mut().await?.next().await
    }

    /// Up to `size` further rows. An empty batch means the cursor is done.
    pub async fn batch(&mut self, size: usize) -> Result<Vec<Value>> {
        let cursor = self.cursor_mut().await?;
        let mut rows = Vec::with_capacity(size);
        while rows.len() < size {
            match cursor.next().await? {
                Some(row) => rows.push(row),
                None => break,
            }
        }
        Ok(rows)
    }

    /// Drain every remaining row into memory.
    pub async fn all(&mut self) -> Result<Vec<Value>> {
        self.cursor_mut().await?.all().await
    }

    pub async fn count(&mut self) -> Result<Option<usize>> {
        Ok(self.cursor_mut().await?.count())
    }

    pub async fn into_cursor(mut self) -> Result<Box<dyn Cursor>> {
        self.cursor_mut().await?;
        self.cursor.take().ok_or(Error::CursorConsumed)
    }

    pub fn into_stream(self) -> impl Stream<Item = Result<Value>> + Send + 'a {
        stream::try_unfold(self, |mut result| async move {
            let row = result.next().await?;
            Ok::<_, Error>(row.map(|row| (row, result)))
        })
    }
}

impl<'a> IntoFuture for QueryResult<'a> {
    type Output = Result<Vec<Value>>;
    type IntoFuture = BoxFuture<'a, Result<Vec<Value>>>;

    fn into_future(mut self) -> Self::IntoFuture {
        Box::pin(async move { self.all().await })
    }
}

/// Dispatch `query` against `db`. The round trip starts on first use of the
/// returned value.
pub fn execute<'a, D>(db: &'a D, query: String) -> QueryResult<'a>
where
    D: Database + ?Sized,
{
    debug!(bytes = query.len(), "dispatching query");
    trace!(%query, "query text");
    QueryResult::pending(Box::pin(async move { db.query(&query).await }))
}
