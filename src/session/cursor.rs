//! Lazy query results.

use crate::entity::EntityInstance;
use crate::error::{OrmError, OrmResult};
use futures_util::Stream;
use futures_util::stream::{BoxStream, StreamExt};
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::task::{Context, Poll};
use tracing::debug;

/// Open-cursor bookkeeping shared between a session and its cursors.
#[derive(Debug, Clone, Default)]
pub(crate) struct CursorTracker {
    open: Arc<AtomicUsize>,
    /// Set when a cursor hit a connection-level failure.
    link_failed: Arc<AtomicBool>,
}

impl CursorTracker {
    pub(crate) fn open_count(&self) -> usize {
        self.open.load(Ordering::Acquire)
    }

    pub(crate) fn link_failed(&self) -> bool {
        self.link_failed.load(Ordering::Acquire)
    }

    fn register(&self) -> CursorHandle {
        self.open.fetch_add(1, Ordering::AcqRel);
        CursorHandle {
            tracker: self.clone(),
        }
    }
}

/// Decrements the open count when dropped.
#[derive(Debug)]
struct CursorHandle {
    tracker: CursorTracker,
}

impl Drop for CursorHandle {
    fn drop(&mut self) {
        self.tracker.open.fetch_sub(1, Ordering::AcqRel);
    }
}

/// A finite, single-pass sequence of query results.
///
/// Rows are pulled from the driver one at a time. The driver statement is
/// released as soon as the sequence is exhausted, when [`close`](Self::close)
/// is called, or when the cursor is dropped, whichever comes first.
///
/// The cursor borrows its session mutably, so the session cannot run other
/// statements while the cursor is alive.
pub struct QueryCursor<'a> {
    entity: String,
    stream: Option<BoxStream<'a, OrmResult<EntityInstance>>>,
    handle: Option<CursorHandle>,
    rows_read: usize,
}

impl<'a> QueryCursor<'a> {
    pub(crate) fn new(
        entity: impl Into<String>,
        stream: BoxStream<'a, OrmResult<EntityInstance>>,
        tracker: &CursorTracker,
    ) -> Self {
        let tracker = tracker.clone();
        let link_failed = Arc::clone(&tracker.link_failed);
        let stream = stream
            .inspect(move |item| {
                if let Err(e) = item {
                    if e.is_connection_broken() {
                        link_failed.store(true, Ordering::Release);
                    }
                }
            })
            .boxed();

        Self {
            entity: entity.into(),
            stream: Some(stream),
            handle: Some(tracker.register()),
            rows_read: 0,
        }
    }

    /// Fetch the next instance, or `None` once the sequence is exhausted.
    pub async fn next_instance(&mut self) -> OrmResult<Option<EntityInstance>> {
        self.next().await.transpose()
    }

    /// Collect the remaining instances.
    pub async fn collect_remaining(mut self) -> OrmResult<Vec<EntityInstance>> {
        let mut instances = Vec::new();
        while let Some(instance) = self.next_instance().await? {
            instances.push(instance);
        }
        Ok(instances)
    }

    /// Release the cursor without reading the remaining rows.
    pub fn close(mut self) {
        self.release();
    }

    pub fn is_closed(&self) -> bool {
        self.stream.is_none()
    }

    pub fn rows_read(&self) -> usize {
        self.rows_read
    }

    fn release(&mut self) {
        if self.stream.take().is_some() {
            debug!(entity = %self.entity, rows_read = self.rows_read, "Cursor released");
        }
        self.handle.take();
    }
}

impl Stream for QueryCursor<'_> {
    type Item = OrmResult<EntityInstance>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        let Some(stream) = this.stream.as_mut() else {
            return Poll::Ready(None);
        };
        match stream.as_mut().poll_next(cx) {
            Poll::Ready(Some(Ok(instance))) => {
                this.rows_read += 1;
                Poll::Ready(Some(Ok(instance)))
            }
            Poll::Ready(Some(Err(e))) => {
                // A failed statement cannot be resumed
                this.release();
                Poll::Ready(Some(Err(e)))
            }
            Poll::Ready(None) => {
                this.release();
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for QueryCursor<'_> {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for QueryCursor<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryCursor")
            .field("entity", &self.entity)
            .field("rows_read", &self.rows_read)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Error returned when a query unexpectedly yields more than one row.
pub(crate) fn non_unique(entity: &str, count: usize) -> OrmError {
    OrmError::NonUniqueResult {
        entity: entity.to_string(),
        count,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::Value;
    use futures_util::stream;

    fn rows(n: i64) -> BoxStream<'static, OrmResult<EntityInstance>> {
        stream::iter((1..=n).map(|i| {
            Ok(EntityInstance::from_row(
                "User",
                Value::Int(i),
                [("id".to_string(), Value::Int(i))].into_iter().collect(),
            ))
        }))
        .boxed()
    }

    #[tokio::test]
    async fn test_exhausted_cursor_is_released() {
        let tracker = CursorTracker::default();
        let mut cursor = QueryCursor::new("User", rows(2), &tracker);
        assert_eq!(tracker.open_count(), 1);

        assert!(cursor.next_instance().await.unwrap().is_some());
        assert!(cursor.next_instance().await.unwrap().is_some());
        assert!(cursor.next_instance().await.unwrap().is_none());
        assert!(cursor.is_closed());
        assert_eq!(tracker.open_count(), 0);
        assert_eq!(cursor.rows_read(), 2);
    }

    #[tokio::test]
    async fn test_abandoned_cursor_is_released() {
        let tracker = CursorTracker::default();
        {
            let mut cursor = QueryCursor::new("User", rows(3), &tracker);
            cursor.next_instance().await.unwrap();
            assert_eq!(tracker.open_count(), 1);
        }
        assert_eq!(tracker.open_count(), 0);
    }

    #[tokio::test]
    async fn test_connection_failure_is_recorded() {
        let tracker = CursorTracker::default();
        let failing: BoxStream<'static, OrmResult<EntityInstance>> =
            stream::iter(vec![Err(OrmError::connection_broken("reset"))]).boxed();
        let mut cursor = QueryCursor::new("User", failing, &tracker);
        assert!(cursor.next_instance().await.is_err());
        assert!(tracker.link_failed());
        assert!(cursor.is_closed());
    }
}
