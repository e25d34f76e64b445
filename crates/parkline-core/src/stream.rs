// ── Reactive log stream ──
//
// Snapshot subscription to the audit log, backed by a watch channel.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures_core::Stream;
use tokio::sync::watch;
use tokio_stream::wrappers::WatchStream;

use crate::audit::AuditLogEntry;

/// Shared, immutable view of the whole log (newest first).
pub type LogSnapshot = Arc<Vec<AuditLogEntry>>;

/// A subscription to the audit log.
///
/// Offers the snapshot taken at creation, the latest snapshot, and
/// change notification via [`changed`](Self::changed) or as a `Stream`.
pub struct LogStream {
    current: LogSnapshot,
    receiver: watch::Receiver<LogSnapshot>,
}

impl LogStream {
    pub(crate) fn new(receiver: watch::Receiver<LogSnapshot>) -> Self {
        let current = receiver.borrow().clone();
        Self { current, receiver }
    }

    pub fn current(&self) -> &LogSnapshot {
        &self.current
    }

    pub fn latest(&self) -> LogSnapshot {
        self.receiver.borrow().clone()
    }

    /// Wait for the next change. `None` once the aggregator is gone.
    pub async fn changed(&mut self) -> Option<LogSnapshot> {
        self.receiver.changed().await.ok()?;
        let snap = self.receiver.borrow_and_update().clone();
        self.current = snap.clone();
        Some(snap)
    }

    /// Yields the current snapshot first, then one per change.
    pub fn into_stream(self) -> LogWatchStream {
        LogWatchStream {
            inner: WatchStream::new(self.receiver),
        }
    }
}

pub struct LogWatchStream {
    inner: WatchStream<LogSnapshot>,
}

impl Stream for LogWatchStream {
    type Item = LogSnapshot;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}
