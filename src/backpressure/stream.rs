//! Pull-based iteration over a controller.
//!
//! [`Iter`] borrows a controller, [`BoundedStream`] shares ownership through
//! an `Arc` so it can move to a consumer thread. Both pull with `recv`, so
//! depth and metrics bookkeeping is identical to calling it directly, and
//! both end once the controller is closed and drained.

use super::core::BackpressureController;
use super::error::{RecvError, TryRecvError};
use super::metrics::MetricsSnapshot;
use std::fmt;
use std::iter::FusedIterator;
use std::sync::Arc;
use std::time::Duration;

/// Borrowing iterator returned by [`BackpressureController::iter`].
pub struct Iter<'a, T> {
    controller: &'a BackpressureController<T>,
    done: bool,
}

impl<'a, T: Send + 'static> Iterator for Iter<'a, T> {
    type Item = T;

    fn next(&mut self) -> Option<T> {
        if self.done {
            return None;
        }
        let item = self.controller.recv();
        self.done = item.is_none();
        item
    }
}

impl<'a, T: Send + 'static> FusedIterator for Iter<'a, T> {}

impl<'a, T> fmt::Debug for Iter<'a, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Iter").field("done", &self.done).finish()
    }
}

impl<T: Send + 'static> BackpressureController<T> {
    /// Iterates by blocking `recv` until the controller is closed and
    /// drained.
    pub fn iter(&self) -> Iter<'_, T> {
        Iter {
            controller: self,
            done: false,
        }
    }
}

impl<'a, T: Send + 'static> IntoIterator for &'a BackpressureController<T> {
    type Item = T;
    type IntoIter = Iter<'a, T>;

    fn into_iter(self) -> Iter<'a, T> {
        self.iter()
    }
}

/// Owning, finite, non-restartable stream of items from a shared controller.
///
/// ## Example
///
/// ```rust
/// use floodgate::{BackpressureController, BoundedStream, BufferKind, Strategy};
/// use std::sync::Arc;
/// use std::thread;
///
/// let controller = Arc::new(BackpressureController::new(4, Strategy::Block, BufferKind::Ring, None)?);
/// let stream = BoundedStream::new(Arc::clone(&controller));
///
/// let consumer = thread::spawn(move || stream.map(|x: u64| x * 2).sum::<u64>());
///
/// for i in 1..=100 {
///     controller.send(i).unwrap();
/// }
/// controller.close();
///
/// assert_eq!(consumer.join().unwrap(), 10_100);
/// # Ok::<(), floodgate::ConfigError>(())
/// ```
pub struct BoundedStream<T> {
    controller: Arc<BackpressureController<T>>,
    done: bool,
}

impl<T: Send + 'static> BoundedStream<T> {
    /// Creates a stream pulling from `controller`.
    pub fn new(controller: Arc<BackpressureController<T>>) -> Self {
        Self {
            controller,
            done: false,
        }
    }

    /// Waits at most `timeout` for the next item.
    ///
    /// `Err(RecvError::Cancelled)` means the timeout elapsed and the stream
    /// may still yield items; `Err(RecvError::Closed)` ends it.
    pub fn next_timeout(&mut self, timeout: Duration) -> Result<T, RecvError> {
        if self.done {
            return Err(RecvError::Closed);
        }
        let result = self.controller.recv_timeout(timeout);
        self.done = matches!(result, Err(RecvError::Closed));
        result
    }

    /// Takes the next item if one is buffered.
    pub fn try_next(&mut self) -> Result<T, TryRecvError> {
        if self.done {
            return Err(TryRecvError::Closed);
        }
        let result = self.controller.try_recv();
        self.done = matches!(result, Err(TryRecvError::Closed));
        result
    }

    /// Blocks for the next item, then takes up to `max` items in total.
    ///
    /// An empty batch (with `max > 0`) ends the stream.
    pub fn next_batch(&mut self, max: usize) -> Vec<T> {
        if self.done || max == 0 {
            return Vec::new();
        }
        let batch = self.controller.recv_batch(max);
        self.done = batch.is_empty();
        batch
    }

    /// Returns true once the stream has observed the end.
    pub fn is_finished(&self) -> bool {
        self.done
    }

    /// Metrics of the underlying controller.
    pub fn metrics(&self) -> MetricsSnapshot {
        self.controller.metrics()
    }

    /// The controller this stream pulls from.
    pub fn controller(&self) -> &Arc<BackpressureController<T>> {
        &self.controller
    }
}

impl<T: Send + 'static> Iterator for BoundedStream<T> {
    type Item = T;

    fn next(&mut self) -> Option<T> {
        if self.done {
            return None;
        }
        let item = self.controller.recv();
        self.done = item.is_none();
        item
    }
}

impl<T: Send + 'static> FusedIterator for BoundedStream<T> {}

impl<T> fmt::Debug for BoundedStream<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BoundedStream")
            .field("controller", &self.controller)
            .field("done", &self.done)
            .finish()
    }
}
