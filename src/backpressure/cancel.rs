//! Cooperative cancellation for blocking calls.
//!
//! A [`CancelToken`] is shared between the thread that may want to abort and
//! the threads blocked in `send_cancellable` / `recv_cancellable`. Cancelling
//! wakes every controller a blocked call is registered with, so the call
//! returns `Cancelled` promptly instead of at its next natural wakeup.

use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

/// Something that parks threads and must wake them on cancellation.
pub(crate) trait CancelWaker: Send + Sync {
    fn wake_all(&self);
}

struct TokenInner {
    cancelled: AtomicBool,
    // Used only by threads sleeping on the token itself.
    sleep_lock: Mutex<()>,
    sleep_cv: Condvar,
    wakers: Mutex<Vec<Weak<dyn CancelWaker>>>,
}

/// Cloneable cancellation flag.
///
/// ```rust
/// use floodgate::{BackpressureController, BufferKind, CancelToken, RecvError, Strategy};
/// use std::sync::Arc;
/// use std::thread;
/// use std::time::Duration;
///
/// let controller = Arc::new(BackpressureController::<u32>::new(
///     4, Strategy::Block, BufferKind::Ring, None,
/// )?);
/// let token = CancelToken::new();
///
/// let consumer = {
///     let controller = Arc::clone(&controller);
///     let token = token.clone();
///     thread::spawn(move || controller.recv_cancellable(&token))
/// };
///
/// thread::sleep(Duration::from_millis(20));
/// token.cancel();
/// assert_eq!(consumer.join().unwrap(), Err(RecvError::Cancelled));
/// # Ok::<(), floodgate::ConfigError>(())
/// ```
#[derive(Clone)]
pub struct CancelToken {
    inner: Arc<TokenInner>,
}

impl CancelToken {
    /// Creates a token that is not cancelled.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(TokenInner {
                cancelled: AtomicBool::new(false),
                sleep_lock: Mutex::new(()),
                sleep_cv: Condvar::new(),
                wakers: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Cancels the token and wakes every call blocked on it.
    ///
    /// Idempotent.
    pub fn cancel(&self) {
        if self.inner.cancelled.swap(true, Ordering::AcqRel) {
            return;
        }

        {
            let _guard = self.inner.sleep_lock.lock();
            self.inner.sleep_cv.notify_all();
        }

        let wakers: Vec<_> = self.inner.wakers.lock().drain(..).collect();
        for waker in wakers.iter().filter_map(Weak::upgrade) {
            waker.wake_all();
        }
    }

    /// Returns true once [`cancel`](Self::cancel) has been called on any
    /// clone.
    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
    }

    /// Sleeps for `duration` or until cancelled, whichever comes first.
    ///
    /// Returns true if the sleep ended because of cancellation.
    pub fn sleep(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        let mut guard = self.inner.sleep_lock.lock();
        while !self.is_cancelled() {
            if self
                .inner
                .sleep_cv
                .wait_until(&mut guard, deadline)
                .timed_out()
            {
                return self.is_cancelled();
            }
        }
        true
    }

    /// Registers a controller to be woken on cancellation.
    pub(crate) fn register(&self, waker: Weak<dyn CancelWaker>) {
        let mut wakers = self.inner.wakers.lock();
        wakers.retain(|w| w.strong_count() > 0);
        if !wakers.iter().any(|w| Weak::ptr_eq(w, &waker)) {
            wakers.push(waker);
        }
    }

    #[cfg(test)]
    fn registered(&self) -> usize {
        self.inner.wakers.lock().len()
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    struct CountingWaker(AtomicUsize);

    impl CancelWaker for CountingWaker {
        fn wake_all(&self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_cancel_is_shared_and_idempotent() {
        let token = CancelToken::new();
        let clone = token.clone();
        assert!(!clone.is_cancelled());

        token.cancel();
        token.cancel();
        assert!(clone.is_cancelled());
    }

    #[test]
    fn test_sleep_runs_to_completion() {
        let token = CancelToken::default();
        let start = Instant::now();
        assert!(!token.sleep(Duration::from_millis(20)));
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn test_sleep_interrupted_by_cancel() {
        let token = CancelToken::new();
        let sleeper = {
            let token = token.clone();
            thread::spawn(move || {
                let start = Instant::now();
                (token.sleep(Duration::from_secs(10)), start.elapsed())
            })
        };

        thread::sleep(Duration::from_millis(20));
        token.cancel();

        let (cancelled, elapsed) = sleeper.join().unwrap();
        assert!(cancelled);
        assert!(elapsed < Duration::from_secs(5));
    }

    #[test]
    fn test_wakers_deduplicated_and_called_once() {
        let token = CancelToken::new();
        let waker = Arc::new(CountingWaker(AtomicUsize::new(0)));
        let weak: Weak<dyn CancelWaker> = Arc::downgrade(&waker) as Weak<dyn CancelWaker>;

        token.register(weak.clone());
        token.register(weak);
        assert_eq!(token.registered(), 1);

        token.cancel();
        token.cancel();
        assert_eq!(waker.0.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_dead_wakers_pruned() {
        let token = CancelToken::new();
        {
            let waker = Arc::new(CountingWaker(AtomicUsize::new(0)));
            token.register(Arc::downgrade(&waker) as Weak<dyn CancelWaker>);
        }
        let live = Arc::new(CountingWaker(AtomicUsize::new(0)));
        token.register(Arc::downgrade(&live) as Weak<dyn CancelWaker>);
        assert_eq!(token.registered(), 1);
    }
}
