//! # Backpressure Controller Core
//!
//! The controller couples a bounded buffer with an overflow strategy and an
//! optional rate controller.
//!
//! ## How It Works
//!
//! ```text
//!     Producers                     Controller                      Consumers
//!     ─────────                     ──────────                      ─────────
//!                        ┌────────────────────────────────┐
//!     send(x) ──admit?──►│ Mutex<Inner>                   │
//!       (Adaptive only)  │  ├─ buffer  [a][b][c][ ]       │──► recv() → a
//!                        │  ├─ state   Open               │
//!     send(y) ──full───► │  ├─ reserved 0                 │
//!       Block: park in   │  └─ producers [w1][w2] (FIFO)  │
//!       FIFO queue       └────────────────────────────────┘
//!                                       │
//!                                 MetricsCollector (atomics)
//! ```
//!
//! ## Slot Handoff
//!
//! A `recv` that frees a slot hands it to the head of the producer queue and
//! marks it reserved, so a producer arriving later cannot take it:
//!
//! ```text
//!     depth 3/3, queue [w1, w2]
//!     recv()              → depth 2/3, reserved 1, w1 granted
//!     new send(z)         → no room (2 + 1 == 3), z queues behind w2
//!     w1 wakes            → pushes, reserved 0, depth 3/3
//! ```
//!
//! ## Lifecycle
//!
//! ```text
//!     Open ──close()──► Draining ──last recv()──► Closed
//!       │                   │                       ▲
//!       └───────────────────┴──────close_now()──────┘
//! ```
//!
//! All blocked producers and consumers are woken on every state change.

use super::buffer::{new_buffer, BufferManager};
use super::cancel::{CancelToken, CancelWaker};
use super::config::{AdaptiveMode, BufferKind, ControllerConfig, RateConfig, Strategy};
use super::error::{ConfigError, RecvError, SendError, TryRecvError};
use super::metrics::{
    BackpressureEvent, EventKind, EventObserver, MetricsCollector, MetricsSnapshot,
};
use super::rate::{RateController, RateDecision};
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Lifecycle state of a controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ControllerState {
    /// Accepts sends and receives.
    Open,
    /// Rejects sends; receives drain what is left.
    Draining,
    /// Terminal; both sides fail.
    Closed,
}

impl fmt::Display for ControllerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Open => write!(f, "open"),
            Self::Draining => write!(f, "draining"),
            Self::Closed => write!(f, "closed"),
        }
    }
}

/// A producer parked on a full buffer.
///
/// `granted` is only touched with the controller lock held.
#[derive(Default)]
struct Waiter {
    cv: Condvar,
    granted: AtomicBool,
}

impl Waiter {
    #[inline]
    fn is_granted(&self) -> bool {
        self.granted.load(Ordering::Relaxed)
    }
}

struct Inner<T> {
    buffer: Box<dyn BufferManager<T> + Send>,
    state: ControllerState,
    // Slots freed by recv and promised to a granted waiter.
    reserved: usize,
    producers: VecDeque<Arc<Waiter>>,
}

impl<T> Inner<T> {
    /// A new producer may store directly only if nobody is queued ahead of it.
    #[inline]
    fn has_room(&self) -> bool {
        self.producers.is_empty() && self.buffer.len() + self.reserved < self.buffer.capacity()
    }

    /// Hands free slots to queued producers in arrival order.
    fn grant_waiters(&mut self) {
        if self.state != ControllerState::Open {
            return;
        }
        while self.buffer.len() + self.reserved < self.buffer.capacity() {
            let Some(waiter) = self.producers.pop_front() else {
                break;
            };
            waiter.granted.store(true, Ordering::Relaxed);
            self.reserved += 1;
            waiter.cv.notify_one();
        }
    }

    /// Removes a producer that gives up, passing on any slot it was granted.
    fn abandon(&mut self, waiter: &Arc<Waiter>) {
        if waiter.is_granted() {
            self.reserved -= 1;
            self.grant_waiters();
        } else {
            self.producers.retain(|w| !Arc::ptr_eq(w, waiter));
        }
    }

    fn wake_all(&self, not_empty: &Condvar) {
        for waiter in &self.producers {
            waiter.cv.notify_one();
        }
        not_empty.notify_all();
    }
}

struct Shared<T> {
    inner: Mutex<Inner<T>>,
    not_empty: Condvar,
    metrics: MetricsCollector,
    rate: Option<Mutex<Box<dyn RateController>>>,
}

impl<T: Send> CancelWaker for Shared<T> {
    fn wake_all(&self) {
        let inner = self.inner.lock();
        inner.wake_all(&self.not_empty);
    }
}

/// How long a call may block.
#[derive(Clone, Copy)]
struct Wait<'a> {
    blocking: bool,
    deadline: Option<Instant>,
    token: Option<&'a CancelToken>,
}

impl<'a> Wait<'a> {
    fn forever() -> Self {
        Self {
            blocking: true,
            deadline: None,
            token: None,
        }
    }

    fn never() -> Self {
        Self {
            blocking: false,
            deadline: None,
            token: None,
        }
    }

    fn timeout(timeout: Duration) -> Self {
        Self {
            blocking: true,
            // An unrepresentable deadline is as good as none.
            deadline: Instant::now().checked_add(timeout),
            token: None,
        }
    }

    fn cancellable(token: &'a CancelToken) -> Self {
        Self {
            blocking: true,
            deadline: None,
            token: Some(token),
        }
    }

    fn interrupted(&self) -> bool {
        self.token.map_or(false, CancelToken::is_cancelled)
            || self.deadline.map_or(false, |d| Instant::now() >= d)
    }

    fn park<U>(&self, cv: &Condvar, guard: &mut MutexGuard<'_, U>) {
        match self.deadline {
            Some(deadline) => {
                cv.wait_until(guard, deadline);
            }
            None => cv.wait(guard),
        }
    }
}

/// Why a receive produced no item.
enum RecvFailure {
    Empty,
    Closed,
    Cancelled,
}

/// Bounded producer/consumer channel with backpressure.
///
/// Share it between threads with `Arc`; every method takes `&self`.
///
/// ## Example
///
/// ```rust
/// use floodgate::{BackpressureController, BufferKind, Strategy};
/// use std::sync::Arc;
/// use std::thread;
///
/// let controller = Arc::new(BackpressureController::new(
///     2,
///     Strategy::Block,
///     BufferKind::Fixed,
///     None,
/// )?);
///
/// let producer = {
///     let controller = Arc::clone(&controller);
///     thread::spawn(move || {
///         for i in 0..10 {
///             controller.send(i).unwrap();
///         }
///         controller.close();
///     })
/// };
///
/// let received: Vec<i32> = std::iter::from_fn(|| controller.recv()).collect();
/// producer.join().unwrap();
/// assert_eq!(received, (0..10).collect::<Vec<_>>());
/// # Ok::<(), floodgate::ConfigError>(())
/// ```
pub struct BackpressureController<T> {
    shared: Arc<Shared<T>>,
    strategy: Strategy,
    capacity: usize,
    observer: Option<EventObserver>,
}

impl<T: Send + 'static> BackpressureController<T> {
    /// Creates a controller.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the parameters are inconsistent, see
    /// [`ControllerConfig::validate`].
    pub fn new(
        capacity: usize,
        strategy: Strategy,
        buffer_kind: BufferKind,
        rate_config: Option<RateConfig>,
    ) -> Result<Self, ConfigError> {
        let mut config = ControllerConfig::new(capacity, strategy, buffer_kind);
        config.rate = rate_config;
        Self::with_config(config)
    }

    /// Creates a controller from a full configuration.
    pub fn with_config(config: ControllerConfig) -> Result<Self, ConfigError> {
        Self::from_parts(config, None)
    }

    pub(crate) fn from_parts(
        config: ControllerConfig,
        observer: Option<EventObserver>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;

        let metrics = MetricsCollector::new(config.capacity, config.ordering);
        let rate = config.rate.as_ref().map(|rc| {
            let controller = rc.build(Instant::now());
            metrics.set_rate_limit(controller.current_rate());
            Mutex::new(controller)
        });

        debug!(
            capacity = config.capacity,
            strategy = %config.strategy,
            buffer = ?config.buffer_kind,
            rate = rate.as_ref().map(|rc| rc.lock().name()),
            "backpressure controller created"
        );

        Ok(Self {
            shared: Arc::new(Shared {
                inner: Mutex::new(Inner {
                    buffer: new_buffer(config.buffer_kind, config.capacity),
                    state: ControllerState::Open,
                    reserved: 0,
                    producers: VecDeque::new(),
                }),
                not_empty: Condvar::new(),
                metrics,
                rate,
            }),
            strategy: config.strategy,
            capacity: config.capacity,
            observer,
        })
    }

    // ========================================================================
    // Producer side
    // ========================================================================

    /// Sends an item, applying the configured strategy if the buffer is full.
    ///
    /// Under [`Strategy::DropOldest`] and [`Strategy::DropNewest`] a drop is
    /// reported only through metrics and `Dropped` events; the call still
    /// returns `Ok(())`.
    ///
    /// # Errors
    ///
    /// - [`SendError::Closed`] if the controller is not open, including when
    ///   it closes while this call is blocked
    /// - [`SendError::RateLimited`] under the adaptive strategy
    pub fn send(&self, item: T) -> Result<(), SendError> {
        self.send_with(item, Wait::forever())
    }

    /// Sends without ever blocking.
    ///
    /// A full buffer under [`Strategy::Block`] or [`Strategy::Adaptive`]
    /// yields [`SendError::Full`]; adaptive delays yield
    /// [`SendError::RateLimited`] with the suggested wait.
    pub fn try_send(&self, item: T) -> Result<(), SendError> {
        self.send_with(item, Wait::never())
    }

    /// Sends, blocking for at most `timeout`.
    ///
    /// An expired timeout yields [`SendError::Cancelled`] and leaves the
    /// buffer untouched.
    pub fn send_timeout(&self, item: T, timeout: Duration) -> Result<(), SendError> {
        self.send_with(item, Wait::timeout(timeout))
    }

    /// Sends, blocking until stored, closed, or `token` is cancelled.
    ///
    /// A token that is already cancelled only matters if the call would
    /// have to wait.
    pub fn send_cancellable(&self, item: T, token: &CancelToken) -> Result<(), SendError> {
        self.send_with(item, Wait::cancellable(token))
    }

    fn send_with(&self, item: T, wait: Wait<'_>) -> Result<(), SendError> {
        let mut sampled_full = false;
        if let Strategy::Adaptive(mode) = self.strategy {
            let mode = if wait.blocking {
                mode
            } else {
                AdaptiveMode::NonBlocking
            };
            sampled_full = self.admit(mode, &wait)?;
        }

        let mut guard = self.shared.inner.lock();
        if guard.state != ControllerState::Open {
            return Err(SendError::Closed);
        }

        if guard.has_room() {
            guard.buffer.push(item);
            self.shared.metrics.set_depth(guard.buffer.len());
            drop(guard);
            self.stored();
            return Ok(());
        }

        let depth = guard.buffer.len();
        match self.strategy {
            Strategy::DropOldest => {
                let evicted = guard.buffer.push_overwrite(item);
                self.shared.metrics.set_depth(guard.buffer.len());
                drop(guard);
                drop(evicted);
                self.shared.metrics.record_produced(1);
                self.on_full(depth, sampled_full);
                self.dropped(1, depth);
                Ok(())
            }
            Strategy::DropNewest => {
                drop(guard);
                drop(item);
                // Discarded on arrival, but still accounted as produced.
                self.shared.metrics.record_produced(1);
                self.on_full(depth, sampled_full);
                self.dropped(1, depth);
                Ok(())
            }
            strategy if wait.blocking && strategy.blocks_when_full() => {
                self.send_blocking(guard, item, &wait, depth, sampled_full)
            }
            Strategy::Adaptive(_) if wait.blocking => {
                drop(guard);
                self.on_full(depth, sampled_full);
                Err(SendError::RateLimited {
                    retry_after: self.retry_hint(),
                })
            }
            _ => {
                drop(guard);
                self.on_full(depth, sampled_full);
                Err(SendError::Full)
            }
        }
    }

    /// Parks the producer in the FIFO queue until a slot is handed to it.
    fn send_blocking(
        &self,
        mut guard: MutexGuard<'_, Inner<T>>,
        item: T,
        wait: &Wait<'_>,
        depth: usize,
        sampled_full: bool,
    ) -> Result<(), SendError> {
        let waiter = Arc::new(Waiter::default());
        guard.producers.push_back(Arc::clone(&waiter));
        debug!(queued = guard.producers.len(), depth, "producer blocked on full buffer");

        // Queue position is held while the observer runs.
        MutexGuard::unlocked(&mut guard, || {
            self.on_full(depth, sampled_full);
            if let Some(token) = wait.token {
                token.register(self.waker());
            }
        });

        loop {
            if guard.state != ControllerState::Open {
                guard.abandon(&waiter);
                return Err(SendError::Closed);
            }
            if waiter.is_granted() {
                guard.reserved -= 1;
                guard.buffer.push(item);
                self.shared.metrics.set_depth(guard.buffer.len());
                drop(guard);
                self.stored();
                return Ok(());
            }
            if wait.interrupted() {
                guard.abandon(&waiter);
                return Err(SendError::Cancelled);
            }
            wait.park(&waiter.cv, &mut guard);
        }
    }

    /// Adaptive admission. Returns whether a full buffer was already fed
    /// back, so the same signal is not applied twice.
    ///
    /// Only the first sample carries feedback; the retry after a delay
    /// asks for a decision alone.
    fn admit(&self, mode: AdaptiveMode, wait: &Wait<'_>) -> Result<bool, SendError> {
        let Some(rate) = &self.shared.rate else {
            return Ok(false);
        };
        if self.shared.inner.lock().state != ControllerState::Open {
            return Err(SendError::Closed);
        }

        let mut retried = false;
        let mut fed_full = false;
        loop {
            let ratio = self.shared.metrics.depth_ratio();
            let decision = {
                let mut rc = rate.lock();
                let now = Instant::now();
                let decision = if retried {
                    rc.decide(ratio, now)
                } else {
                    fed_full = ratio >= 1.0;
                    rc.sample(ratio, now)
                };
                self.shared.metrics.set_rate_limit(rc.current_rate());
                decision
            };

            let delay = match decision {
                RateDecision::Accept => return Ok(fed_full),
                RateDecision::Reject => None,
                RateDecision::Delay(d) => Some(d),
            };

            self.shared.metrics.record_backpressure();
            self.emit(EventKind::RateLimited, self.shared.metrics.depth());

            match (mode, delay) {
                (AdaptiveMode::Blocking, Some(d)) if !retried => {
                    self.pause(d, wait)?;
                    retried = true;
                }
                _ => return Err(SendError::RateLimited { retry_after: delay }),
            }
        }
    }

    /// Sleeps out an adaptive delay, bounded by the call's deadline.
    fn pause(&self, delay: Duration, wait: &Wait<'_>) -> Result<(), SendError> {
        let (sleep_for, hits_deadline) = match wait.deadline {
            Some(deadline) => {
                let left = deadline.saturating_duration_since(Instant::now());
                (delay.min(left), left <= delay)
            }
            None => (delay, false),
        };

        let cancelled = match wait.token {
            Some(token) => token.sleep(sleep_for),
            None => {
                thread::sleep(sleep_for);
                false
            }
        };

        if cancelled || hits_deadline {
            Err(SendError::Cancelled)
        } else {
            Ok(())
        }
    }

    // ========================================================================
    // Consumer side
    // ========================================================================

    /// Receives the oldest item, blocking while the buffer is empty.
    ///
    /// Returns `None` once the controller is closed and drained.
    pub fn recv(&self) -> Option<T> {
        self.recv_with(Wait::forever()).ok()
    }

    /// Receives without blocking.
    pub fn try_recv(&self) -> Result<T, TryRecvError> {
        self.recv_with(Wait::never()).map_err(|e| match e {
            RecvFailure::Closed => TryRecvError::Closed,
            RecvFailure::Empty | RecvFailure::Cancelled => TryRecvError::Empty,
        })
    }

    /// Receives, blocking for at most `timeout`.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<T, RecvError> {
        self.recv_with(Wait::timeout(timeout)).map_err(recv_error)
    }

    /// Receives, blocking until an item arrives, the controller closes, or
    /// `token` is cancelled.
    pub fn recv_cancellable(&self, token: &CancelToken) -> Result<T, RecvError> {
        self.recv_with(Wait::cancellable(token)).map_err(recv_error)
    }

    /// Blocks for the first item, then takes whatever else is buffered, up
    /// to `max` items in total.
    ///
    /// Returns an empty vector once the controller is closed and drained,
    /// or if `max` is 0.
    pub fn recv_batch(&self, max: usize) -> Vec<T> {
        self.recv_batch_with(max, Wait::forever())
    }

    fn recv_batch_with(&self, max: usize, wait: Wait<'_>) -> Vec<T> {
        if max == 0 {
            return Vec::new();
        }

        let mut guard = self.shared.inner.lock();
        if self.wait_non_empty(&mut guard, &wait).is_err() {
            return Vec::new();
        }

        let mut items = Vec::with_capacity(max.min(guard.buffer.len()));
        while items.len() < max {
            match self.pop_locked(&mut guard) {
                Some(item) => items.push(item),
                None => break,
            }
        }
        drop(guard);

        self.shared.metrics.record_consumed(items.len() as u64);
        items
    }

    fn recv_with(&self, wait: Wait<'_>) -> Result<T, RecvFailure> {
        let mut guard = self.shared.inner.lock();
        self.wait_non_empty(&mut guard, &wait)?;
        let item = self.pop_locked(&mut guard).ok_or(RecvFailure::Empty)?;
        drop(guard);

        self.shared.metrics.record_consumed(1);
        Ok(item)
    }

    fn wait_non_empty(
        &self,
        guard: &mut MutexGuard<'_, Inner<T>>,
        wait: &Wait<'_>,
    ) -> Result<(), RecvFailure> {
        let mut registered = false;
        loop {
            if !guard.buffer.is_empty() {
                return Ok(());
            }
            match guard.state {
                ControllerState::Open => {}
                ControllerState::Draining => {
                    guard.state = ControllerState::Closed;
                    info!("controller drained and closed");
                    return Err(RecvFailure::Closed);
                }
                ControllerState::Closed => return Err(RecvFailure::Closed),
            }
            if !wait.blocking {
                return Err(RecvFailure::Empty);
            }
            if wait.interrupted() {
                return Err(RecvFailure::Cancelled);
            }
            if let (Some(token), false) = (wait.token, registered) {
                MutexGuard::unlocked(guard, || token.register(self.waker()));
                registered = true;
                continue;
            }
            wait.park(&self.shared.not_empty, guard);
        }
    }

    /// Pops the head, hands the freed slot on and finishes a drain.
    fn pop_locked(&self, guard: &mut MutexGuard<'_, Inner<T>>) -> Option<T> {
        let item = guard.buffer.pop()?;
        guard.grant_waiters();
        self.shared.metrics.set_depth(guard.buffer.len());

        if guard.state == ControllerState::Draining && guard.buffer.is_empty() {
            guard.state = ControllerState::Closed;
            info!("controller drained and closed");
        }
        Some(item)
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Stops accepting new items; buffered items can still be received.
    ///
    /// Wakes every blocked producer (they fail with `Closed`) and consumer.
    /// Closing an empty controller closes it immediately.
    pub fn close(&self) {
        let mut guard = self.shared.inner.lock();
        if guard.state != ControllerState::Open {
            return;
        }
        guard.state = if guard.buffer.is_empty() {
            ControllerState::Closed
        } else {
            ControllerState::Draining
        };
        info!(
            state = %guard.state,
            remaining = guard.buffer.len(),
            blocked_producers = guard.producers.len(),
            "controller closing"
        );
        guard.wake_all(&self.shared.not_empty);
    }

    /// Closes immediately and returns every undelivered item.
    ///
    /// The returned items are counted as dropped.
    pub fn close_now(&self) -> Vec<T> {
        let mut guard = self.shared.inner.lock();
        if guard.state == ControllerState::Closed && guard.buffer.is_empty() {
            return Vec::new();
        }
        let depth = guard.buffer.len();
        let items = guard.buffer.drain_all();
        guard.state = ControllerState::Closed;
        self.shared.metrics.set_depth(0);
        guard.wake_all(&self.shared.not_empty);
        drop(guard);

        if !items.is_empty() {
            warn!(discarded = items.len(), "controller closed with undelivered items");
        }
        self.dropped(items.len() as u64, depth);
        items
    }

    // ========================================================================
    // Introspection
    // ========================================================================

    /// Snapshot of the controller's counters.
    pub fn metrics(&self) -> MetricsSnapshot {
        self.shared.metrics.snapshot()
    }

    /// Items currently buffered.
    pub fn len(&self) -> usize {
        self.shared.inner.lock().buffer.len()
    }

    /// Returns true if nothing is buffered.
    pub fn is_empty(&self) -> bool {
        self.shared.inner.lock().buffer.is_empty()
    }

    /// Returns true if the buffer holds `capacity` items.
    pub fn is_full(&self) -> bool {
        self.shared.inner.lock().buffer.is_full()
    }

    /// Maximum number of buffered items.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ControllerState {
        self.shared.inner.lock().state
    }

    /// Returns true once the controller reached [`ControllerState::Closed`].
    pub fn is_closed(&self) -> bool {
        self.state() == ControllerState::Closed
    }

    /// Overflow strategy.
    pub fn strategy(&self) -> Strategy {
        self.strategy
    }

    /// Permitted rate in items per second, or 0.0 without rate control.
    pub fn current_rate(&self) -> f64 {
        self.shared
            .rate
            .as_ref()
            .map_or(0.0, |rc| rc.lock().current_rate())
    }

    /// Producers currently parked on a full buffer and not yet granted a slot.
    pub fn waiting_producers(&self) -> usize {
        self.shared.inner.lock().producers.len()
    }

    // ========================================================================
    // Bookkeeping
    // ========================================================================

    fn waker(&self) -> Weak<dyn CancelWaker> {
        let shared: Arc<dyn CancelWaker> = self.shared.clone();
        Arc::downgrade(&shared)
    }

    /// Counters and wakeup after an item was stored.
    #[inline]
    fn stored(&self) {
        self.shared.not_empty.notify_one();
        self.shared.metrics.record_produced(1);
    }

    /// Full-buffer bookkeeping, always run without the lock held.
    fn on_full(&self, depth: usize, sampled_full: bool) {
        self.shared.metrics.record_backpressure();
        if !sampled_full {
            if let Some(rate) = &self.shared.rate {
                let mut rc = rate.lock();
                rc.observe(1.0, Instant::now());
                self.shared.metrics.set_rate_limit(rc.current_rate());
            }
        }
        self.emit(EventKind::QueueFull, depth);
    }

    /// Accounts for `n` discarded items.
    fn dropped(&self, n: u64, depth: usize) {
        self.shared.metrics.record_dropped(n);
        for _ in 0..n {
            self.emit(EventKind::Dropped, depth);
        }
    }

    fn retry_hint(&self) -> Option<Duration> {
        let rate = self.current_rate();
        if rate > 0.0 {
            Duration::try_from_secs_f64(1.0 / rate).ok()
        } else {
            None
        }
    }

    #[inline]
    fn emit(&self, kind: EventKind, depth: usize) {
        if let Some(observer) = &self.observer {
            observer(&BackpressureEvent::now(kind, depth));
        }
    }
}

fn recv_error(failure: RecvFailure) -> RecvError {
    match failure {
        RecvFailure::Cancelled | RecvFailure::Empty => RecvError::Cancelled,
        RecvFailure::Closed => RecvError::Closed,
    }
}

impl<T> fmt::Debug for BackpressureController<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackpressureController")
            .field("capacity", &self.capacity)
            .field("strategy", &self.strategy)
            .field("depth", &self.shared.metrics.depth())
            .field("observer", &self.observer.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backpressure::config::{AimdConfig, SlidingWindowConfig, TokenBucketConfig};

    fn controller(capacity: usize, strategy: Strategy) -> BackpressureController<u32> {
        BackpressureController::new(capacity, strategy, BufferKind::Ring, None).unwrap()
    }

    fn observed(
        config: ControllerConfig,
    ) -> (BackpressureController<u32>, Arc<Mutex<Vec<BackpressureEvent>>>) {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        let observer: EventObserver = Arc::new(move |e: &BackpressureEvent| sink.lock().push(*e));
        let controller = BackpressureController::from_parts(config, Some(observer)).unwrap();
        (controller, events)
    }

    fn kinds(events: &Mutex<Vec<BackpressureEvent>>) -> Vec<EventKind> {
        events.lock().iter().map(|e| e.kind).collect()
    }

    fn wait_for_producers(controller: &BackpressureController<u32>, n: usize) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while controller.waiting_producers() < n {
            assert!(Instant::now() < deadline, "producers never blocked");
            thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn test_block_handoff_scenario() {
        let controller = Arc::new(controller(3, Strategy::Block));
        for i in 1..=3 {
            controller.send(i).unwrap();
        }

        let producer = {
            let controller = Arc::clone(&controller);
            thread::spawn(move || controller.send(4))
        };
        wait_for_producers(&controller, 1);
        assert_eq!(controller.len(), 3);

        assert_eq!(controller.recv(), Some(1));
        assert_eq!(producer.join().unwrap(), Ok(()));

        assert_eq!(controller.recv(), Some(2));
        assert_eq!(controller.recv(), Some(3));
        assert_eq!(controller.recv(), Some(4));

        let metrics = controller.metrics();
        assert_eq!(metrics.produced_count, 4);
        assert_eq!(metrics.consumed_count, 4);
        assert_eq!(metrics.backpressure_events, 1);
        assert_eq!(metrics.peak_depth, 3);
        assert!(metrics.is_balanced());
    }

    #[test]
    fn test_drop_oldest_scenario() {
        let config = ControllerConfig::new(2, Strategy::DropOldest, BufferKind::Ring);
        let (controller, events) = observed(config);

        for i in 1..=4 {
            assert_eq!(controller.send(i), Ok(()));
        }
        let metrics = controller.metrics();
        assert_eq!(metrics.dropped_count, 2);
        assert_eq!(metrics.current_depth, 2);
        assert_eq!(metrics.backpressure_events, 2);

        assert_eq!(controller.recv(), Some(3));
        assert_eq!(controller.recv(), Some(4));
        assert!(controller.metrics().is_balanced());
        assert_eq!(
            kinds(&events),
            vec![
                EventKind::QueueFull,
                EventKind::Dropped,
                EventKind::QueueFull,
                EventKind::Dropped
            ]
        );
        assert!(events.lock().iter().all(|e| e.depth_at_event == 2));
    }

    #[test]
    fn test_drop_newest_keeps_first_items() {
        let controller = controller(2, Strategy::DropNewest);
        for i in 1..=5 {
            assert_eq!(controller.try_send(i), Ok(()));
        }
        assert_eq!(controller.recv_batch(10), vec![1, 2]);

        let metrics = controller.metrics();
        assert_eq!(metrics.produced_count, 5);
        assert_eq!(metrics.dropped_count, 3);
        assert_eq!(metrics.consumed_count, 2);
        assert!(metrics.is_balanced());
    }

    #[test]
    fn test_drop_oldest_on_fixed_and_growing_buffers() {
        for kind in [BufferKind::Fixed, BufferKind::Growing { initial_capacity: 1 }] {
            let controller =
                BackpressureController::new(3, Strategy::DropOldest, kind, None).unwrap();
            for i in 0..10u32 {
                controller.send(i).unwrap();
            }
            assert_eq!(controller.len(), 3);
            assert_eq!(controller.recv_batch(3), vec![7, 8, 9]);
        }
    }

    #[test]
    fn test_try_send_full() {
        let controller = controller(1, Strategy::Block);
        controller.try_send(1).unwrap();
        assert_eq!(controller.try_send(2), Err(SendError::Full));
        assert!(controller.is_full());

        let metrics = controller.metrics();
        assert_eq!(metrics.produced_count, 1);
        assert_eq!(metrics.backpressure_events, 1);
    }

    #[test]
    fn test_close_drains_then_closes() {
        let controller = controller(4, Strategy::Block);
        controller.send(1).unwrap();
        controller.send(2).unwrap();

        controller.close();
        assert_eq!(controller.state(), ControllerState::Draining);
        assert_eq!(controller.send(3), Err(SendError::Closed));

        assert_eq!(controller.recv(), Some(1));
        assert_eq!(controller.try_recv(), Ok(2));
        assert!(controller.is_closed());
        assert_eq!(controller.recv(), None);
        assert_eq!(controller.try_recv(), Err(TryRecvError::Closed));
    }

    #[test]
    fn test_close_empty_is_immediate() {
        let controller = controller(4, Strategy::Block);
        assert_eq!(controller.try_recv(), Err(TryRecvError::Empty));
        controller.close();
        assert_eq!(controller.state(), ControllerState::Closed);
        controller.close();
        assert_eq!(controller.recv_timeout(Duration::from_secs(1)), Err(RecvError::Closed));
    }

    #[test]
    fn test_close_wakes_blocked_producer() {
        let controller = Arc::new(controller(1, Strategy::Block));
        controller.send(1).unwrap();

        let producer = {
            let controller = Arc::clone(&controller);
            thread::spawn(move || controller.send(2))
        };
        wait_for_producers(&controller, 1);

        controller.close();
        assert_eq!(producer.join().unwrap(), Err(SendError::Closed));
        assert_eq!(controller.recv(), Some(1));
        assert_eq!(controller.recv(), None);
        assert_eq!(controller.waiting_producers(), 0);
    }

    #[test]
    fn test_close_wakes_blocked_consumer() {
        let controller = Arc::new(controller(1, Strategy::Block));
        let consumer = {
            let controller = Arc::clone(&controller);
            thread::spawn(move || controller.recv())
        };
        thread::sleep(Duration::from_millis(20));
        controller.close();
        assert_eq!(consumer.join().unwrap(), None);
    }

    #[test]
    fn test_close_now_returns_items_as_dropped() {
        let config = ControllerConfig::new(4, Strategy::Block, BufferKind::Fixed);
        let (controller, events) = observed(config);
        for i in 0..3 {
            controller.send(i).unwrap();
        }
        assert_eq!(controller.recv(), Some(0));

        assert_eq!(controller.close_now(), vec![1, 2]);
        assert!(controller.is_closed());
        assert!(controller.close_now().is_empty());

        let metrics = controller.metrics();
        assert_eq!(metrics.dropped_count, 2);
        assert_eq!(metrics.current_depth, 0);
        assert!(metrics.is_balanced());
        assert_eq!(kinds(&events), vec![EventKind::Dropped, EventKind::Dropped]);
    }

    #[test]
    fn test_send_timeout_leaves_state_intact() {
        let controller = controller(1, Strategy::Block);
        controller.send(1).unwrap();

        let start = Instant::now();
        assert_eq!(
            controller.send_timeout(2, Duration::from_millis(30)),
            Err(SendError::Cancelled)
        );
        assert!(start.elapsed() >= Duration::from_millis(30));
        assert_eq!(controller.waiting_producers(), 0);
        assert_eq!(controller.len(), 1);
        assert_eq!(controller.recv(), Some(1));
        assert_eq!(controller.try_send(3), Ok(()));
    }

    #[test]
    fn test_recv_timeout_on_empty() {
        let controller = controller(1, Strategy::Block);
        assert_eq!(
            controller.recv_timeout(Duration::from_millis(10)),
            Err(RecvError::Cancelled)
        );
        controller.send(5).unwrap();
        assert_eq!(controller.recv_timeout(Duration::from_millis(10)), Ok(5));
    }

    #[test]
    fn test_cancel_blocked_producer() {
        let controller = Arc::new(controller(1, Strategy::Block));
        controller.send(1).unwrap();
        let token = CancelToken::new();

        let producer = {
            let controller = Arc::clone(&controller);
            let token = token.clone();
            thread::spawn(move || controller.send_cancellable(2, &token))
        };
        wait_for_producers(&controller, 1);

        token.cancel();
        assert_eq!(producer.join().unwrap(), Err(SendError::Cancelled));
        assert_eq!(controller.waiting_producers(), 0);
        assert_eq!(controller.metrics().produced_count, 1);
        assert_eq!(controller.recv(), Some(1));
        assert_eq!(controller.try_send(3), Ok(()));
    }

    #[test]
    fn test_cancelled_token_is_ignored_when_not_blocking() {
        let controller = controller(2, Strategy::Block);
        let token = CancelToken::new();
        token.cancel();
        assert_eq!(controller.send_cancellable(1, &token), Ok(()));
        assert_eq!(controller.recv_cancellable(&token), Ok(1));
        assert_eq!(controller.recv_cancellable(&token), Err(RecvError::Cancelled));
    }

    #[test]
    fn test_blocked_producers_served_in_order() {
        let controller = Arc::new(controller(1, Strategy::Block));
        controller.send(0).unwrap();

        let mut producers = Vec::new();
        for i in 1..=3u32 {
            let c = Arc::clone(&controller);
            producers.push(thread::spawn(move || c.send(i)));
            wait_for_producers(&controller, i as usize);
        }

        let received: Vec<u32> = (0..4).filter_map(|_| controller.recv()).collect();
        assert_eq!(received, vec![0, 1, 2, 3]);
        for p in producers {
            assert_eq!(p.join().unwrap(), Ok(()));
        }
    }

    #[test]
    fn test_handoff_reserves_slot() {
        let controller = Arc::new(controller(1, Strategy::Block));
        controller.send(0).unwrap();

        let producer = {
            let controller = Arc::clone(&controller);
            thread::spawn(move || controller.send(1))
        };
        wait_for_producers(&controller, 1);

        // The freed slot belongs to the parked producer, even before it runs.
        assert_eq!(controller.recv(), Some(0));
        assert_eq!(controller.try_send(99), Err(SendError::Full));

        producer.join().unwrap().unwrap();
        assert_eq!(controller.recv(), Some(1));
    }

    #[test]
    fn test_recv_batch() {
        let controller = controller(8, Strategy::Block);
        for i in 0..5 {
            controller.send(i).unwrap();
        }
        assert!(controller.recv_batch(0).is_empty());
        assert_eq!(controller.recv_batch(3), vec![0, 1, 2]);
        assert_eq!(controller.recv_batch(10), vec![3, 4]);
        controller.close();
        assert!(controller.recv_batch(10).is_empty());
        assert_eq!(controller.metrics().consumed_count, 5);
    }

    #[test]
    fn test_adaptive_requires_rate_config() {
        let result = BackpressureController::<u32>::new(
            4,
            Strategy::Adaptive(AdaptiveMode::NonBlocking),
            BufferKind::Ring,
            None,
        );
        assert_eq!(result.unwrap_err(), ConfigError::MissingRateConfig);
    }

    #[test]
    fn test_adaptive_non_blocking_rate_limited() {
        let config = ControllerConfig::new(
            16,
            Strategy::Adaptive(AdaptiveMode::NonBlocking),
            BufferKind::Ring,
        )
        .with_rate(TokenBucketConfig::new(2.0, 1.0));
        let (controller, events) = observed(config);

        controller.send(1).unwrap();
        controller.send(2).unwrap();
        match controller.send(3) {
            Err(SendError::RateLimited {
                retry_after: Some(d),
            }) => assert!(d > Duration::from_millis(500) && d <= Duration::from_secs(1)),
            other => panic!("expected rate limit, got {:?}", other),
        }

        let metrics = controller.metrics();
        assert_eq!(metrics.produced_count, 2);
        assert_eq!(metrics.backpressure_events, 1);
        assert_eq!(metrics.current_rate_limit, 1.0);
        assert_eq!(kinds(&events), vec![EventKind::RateLimited]);
        assert_eq!(controller.current_rate(), 1.0);
    }

    #[test]
    fn test_adaptive_blocking_waits_out_delay() {
        let controller = BackpressureController::new(
            16,
            Strategy::Adaptive(AdaptiveMode::Blocking),
            BufferKind::Ring,
            Some(TokenBucketConfig::new(1.0, 20.0).into()),
        )
        .unwrap();

        let start = Instant::now();
        controller.send(1u32).unwrap();
        controller.send(2).unwrap();
        assert!(start.elapsed() >= Duration::from_millis(30));
        assert_eq!(controller.len(), 2);
        assert_eq!(controller.metrics().backpressure_events, 1);
    }

    #[test]
    fn test_adaptive_blocking_respects_deadline() {
        let controller = BackpressureController::new(
            16,
            Strategy::Adaptive(AdaptiveMode::Blocking),
            BufferKind::Ring,
            Some(TokenBucketConfig::new(1.0, 0.5).into()),
        )
        .unwrap();

        controller.send(1u32).unwrap();
        let start = Instant::now();
        assert_eq!(
            controller.send_timeout(2, Duration::from_millis(20)),
            Err(SendError::Cancelled)
        );
        assert!(start.elapsed() < Duration::from_secs(1));
        assert_eq!(controller.len(), 1);
    }

    #[test]
    fn test_adaptive_full_buffer() {
        let rate = SlidingWindowConfig::new(100_000.0, Duration::from_secs(1));
        let controller = BackpressureController::new(
            1,
            Strategy::Adaptive(AdaptiveMode::NonBlocking),
            BufferKind::Fixed,
            Some(rate.into()),
        )
        .unwrap();

        controller.send(1u32).unwrap();
        assert!(matches!(
            controller.send(2),
            Err(SendError::RateLimited { retry_after: Some(_) })
        ));
        assert_eq!(controller.try_send(3), Err(SendError::Full));
        assert_eq!(controller.metrics().backpressure_events, 2);
        assert_eq!(controller.recv(), Some(1));
    }

    #[test]
    fn test_full_signal_feeds_rate_controller_under_block() {
        let controller = BackpressureController::new(
            1,
            Strategy::Block,
            BufferKind::Ring,
            Some(AimdConfig::new(100.0, 10.0, 1_000.0).into()),
        )
        .unwrap();

        controller.send(1u32).unwrap();
        assert_eq!(controller.current_rate(), 100.0);
        assert_eq!(controller.try_send(2), Err(SendError::Full));
        assert_eq!(controller.current_rate(), 50.0);
        assert_eq!(controller.metrics().current_rate_limit, 50.0);
        // Strategy unaffected: the slot frees and sends go through again.
        assert_eq!(controller.recv(), Some(1));
        assert_eq!(controller.try_send(3), Ok(()));
    }

    #[test]
    fn test_adaptive_retry_applies_full_signal_once() {
        let controller = BackpressureController::new(
            1,
            Strategy::Adaptive(AdaptiveMode::Blocking),
            BufferKind::Ring,
            Some(AimdConfig::new(100.0, 10.0, 1_000.0).into()),
        )
        .unwrap();

        // Empty buffer: accepted with an additive increase.
        controller.send(1u32).unwrap();
        assert_eq!(controller.current_rate(), 110.0);

        // One send into the full buffer is paced, retried, then blocks until
        // the deadline. The rate is halved once, not once per attempt.
        assert_eq!(
            controller.send_timeout(2, Duration::from_millis(200)),
            Err(SendError::Cancelled)
        );
        assert_eq!(controller.current_rate(), 55.0);
        assert_eq!(controller.metrics().current_rate_limit, 55.0);
        assert_eq!(controller.len(), 1);
    }

    #[test]
    fn test_send_after_close_under_adaptive() {
        let controller = BackpressureController::new(
            4,
            Strategy::Adaptive(AdaptiveMode::NonBlocking),
            BufferKind::Ring,
            Some(TokenBucketConfig::new(1.0, 1.0).into()),
        )
        .unwrap();
        controller.close();
        assert_eq!(controller.send(1u32), Err(SendError::Closed));
        // The closed check happens before any token is spent.
        assert_eq!(controller.metrics().backpressure_events, 0);
    }

    #[test]
    fn test_debug_output() {
        let controller = controller(2, Strategy::DropNewest);
        let debug = format!("{:?}", controller);
        assert!(debug.contains("BackpressureController"));
        assert!(debug.contains("DropNewest"));
        assert_eq!(controller.strategy(), Strategy::DropNewest);
        assert_eq!(controller.capacity(), 2);
        assert_eq!(controller.current_rate(), 0.0);
    }
}
