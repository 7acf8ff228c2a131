//! This module provides the counters behind every controller and the
//! snapshot type used to monitor them. It also defines the events delivered
//! to an observer when the controller applies backpressure.
//!
//! ## Metrics Overview
//!
//! ```text
//!     Metrics Dashboard:
//!     ┌─────────────────────────────────────┐
//!     │  Depth: 6/8                         │
//!     │  ▓▓▓▓▓▓▓▓▓▓▓▓▓▓▓░░░░░  (75%)        │
//!     │                                     │
//!     │  Produced: 1200   Consumed: 1150    │
//!     │  Dropped:    44   Events:    61     │
//!     │                                     │
//!     │  Health: ⚠️ Degraded                │
//!     │  Rate Limit: 250.0/s                │
//!     └─────────────────────────────────────┘
//! ```
//!
//! ## Accounting
//!
//! Every item handed to `send` is counted exactly once as produced, and ends
//! up either consumed, dropped or still buffered:
//!
//! ```text
//!     produced == consumed + dropped + current_depth
//! ```

use super::config::MemoryOrdering;
use super::utils::CacheAligned;
use std::fmt;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;

/// Callback invoked for every [`BackpressureEvent`].
///
/// Runs synchronously on the thread that triggered the event, after the
/// controller's lock has been released.
pub type EventObserver = Arc<dyn Fn(&BackpressureEvent) + Send + Sync>;

/// What kind of backpressure a controller applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// A send found the buffer full.
    QueueFull,
    /// The adaptive rate controller delayed or rejected a send.
    RateLimited,
    /// An item was discarded (evicted oldest, rejected newest, or
    /// abandoned by `close_now`).
    Dropped,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::QueueFull => write!(f, "queue_full"),
            Self::RateLimited => write!(f, "rate_limited"),
            Self::Dropped => write!(f, "dropped"),
        }
    }
}

/// Immutable record of a single backpressure occurrence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackpressureEvent {
    /// Milliseconds since UNIX epoch (see [`current_time_ms`](crate::current_time_ms)).
    pub timestamp_ms: u64,
    /// What happened.
    pub kind: EventKind,
    /// Buffer depth when the event was recorded.
    pub depth_at_event: usize,
}

impl BackpressureEvent {
    pub(crate) fn now(kind: EventKind, depth_at_event: usize) -> Self {
        Self {
            timestamp_ms: super::utils::current_time_ms(),
            kind,
            depth_at_event,
        }
    }
}

/// Lock-free counters for one controller.
///
/// Each counter lives on its own cache line. Writers are the controller's
/// producer and consumer paths; readers take a [`MetricsSnapshot`].
///
/// ```text
///     ┌──────────────┐┌──────────────┐┌──────────────┐┌──────────────┐
///     │ depth        ││ produced     ││ consumed     ││ dropped      │ ...
///     └──────────────┘└──────────────┘└──────────────┘└──────────────┘
/// ```
pub struct MetricsCollector {
    current_depth: CacheAligned<AtomicU64>,
    peak_depth: CacheAligned<AtomicU64>,
    produced: CacheAligned<AtomicU64>,
    consumed: CacheAligned<AtomicU64>,
    dropped: CacheAligned<AtomicU64>,
    backpressure_events: CacheAligned<AtomicU64>,
    // f64 bit pattern
    current_rate_limit: AtomicU64,
    capacity: usize,
    ordering: MemoryOrdering,
}

impl MetricsCollector {
    /// Creates zeroed counters for a controller of the given capacity.
    pub fn new(capacity: usize, ordering: MemoryOrdering) -> Self {
        Self {
            current_depth: CacheAligned::new(AtomicU64::new(0)),
            peak_depth: CacheAligned::new(AtomicU64::new(0)),
            produced: CacheAligned::new(AtomicU64::new(0)),
            consumed: CacheAligned::new(AtomicU64::new(0)),
            dropped: CacheAligned::new(AtomicU64::new(0)),
            backpressure_events: CacheAligned::new(AtomicU64::new(0)),
            current_rate_limit: AtomicU64::new(0f64.to_bits()),
            capacity,
            ordering,
        }
    }

    /// Publishes the exact depth and raises the peak if needed.
    #[inline]
    pub(crate) fn set_depth(&self, depth: usize) {
        let depth = depth as u64;
        self.current_depth.store(depth, self.ordering.store());
        self.peak_depth.fetch_max(depth, self.ordering.rmw());
    }

    #[inline]
    pub(crate) fn record_produced(&self, n: u64) {
        if n > 0 {
            self.produced.fetch_add(n, self.ordering.rmw());
        }
    }

    #[inline]
    pub(crate) fn record_consumed(&self, n: u64) {
        if n > 0 {
            self.consumed.fetch_add(n, self.ordering.rmw());
        }
    }

    #[inline]
    pub(crate) fn record_dropped(&self, n: u64) {
        if n > 0 {
            self.dropped.fetch_add(n, self.ordering.rmw());
        }
    }

    #[inline]
    pub(crate) fn record_backpressure(&self) {
        self.backpressure_events.fetch_add(1, self.ordering.rmw());
    }

    /// Publishes the rate controller's current permitted rate.
    #[inline]
    pub(crate) fn set_rate_limit(&self, rate: f64) {
        self.current_rate_limit
            .store(rate.max(0.0).to_bits(), self.ordering.store());
    }

    /// Current buffer depth.
    #[inline]
    pub fn depth(&self) -> usize {
        self.current_depth.load(self.ordering.load()) as usize
    }

    /// Depth divided by capacity, in `[0, 1]`.
    #[inline]
    pub fn depth_ratio(&self) -> f64 {
        self.depth() as f64 / self.capacity as f64
    }

    /// Current permitted rate in items per second (0.0 without rate control).
    #[inline]
    pub fn rate_limit(&self) -> f64 {
        f64::from_bits(self.current_rate_limit.load(self.ordering.load()))
    }

    /// Reads every counter independently.
    ///
    /// Counters may be updated between reads, so the snapshot is only
    /// approximately consistent under concurrent use.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let order = self.ordering.load();
        MetricsSnapshot {
            current_depth: self.current_depth.load(order) as usize,
            peak_depth: self.peak_depth.load(order) as usize,
            capacity: self.capacity,
            produced_count: self.produced.load(order),
            consumed_count: self.consumed.load(order),
            dropped_count: self.dropped.load(order),
            backpressure_events: self.backpressure_events.load(order),
            current_rate_limit: self.rate_limit(),
        }
    }
}

impl fmt::Debug for MetricsCollector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MetricsCollector")
            .field("snapshot", &self.snapshot())
            .field("ordering", &self.ordering)
            .finish()
    }
}

/// Point-in-time view of a controller's counters.
///
/// ## Example Usage
///
/// ```rust
/// use floodgate::{BackpressureController, BufferKind, Strategy};
///
/// let controller = BackpressureController::new(4, Strategy::DropNewest, BufferKind::Ring, None)?;
/// for i in 0..6 {
///     controller.send(i)?;
/// }
///
/// let metrics = controller.metrics();
/// assert_eq!(metrics.produced_count, 6);
/// assert_eq!(metrics.dropped_count, 2);
/// assert_eq!(metrics.current_depth, 4);
/// assert!(metrics.is_under_pressure());
/// println!("{}", metrics.summary());
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct MetricsSnapshot {
    /// Items buffered right now.
    pub current_depth: usize,
    /// Highest depth ever observed.
    pub peak_depth: usize,
    /// Configured capacity.
    pub capacity: usize,
    /// Items handed to `send` and accounted for (stored or dropped).
    pub produced_count: u64,
    /// Items returned to consumers.
    pub consumed_count: u64,
    /// Items discarded by a drop strategy or `close_now`.
    pub dropped_count: u64,
    /// Sends that found the buffer full or were rate limited.
    pub backpressure_events: u64,
    /// Permitted rate in items per second (0.0 without rate control).
    pub current_rate_limit: f64,
}

impl MetricsSnapshot {
    /// Fraction of capacity currently occupied.
    #[inline]
    pub fn utilization(&self) -> f64 {
        if self.capacity == 0 {
            0.0
        } else {
            self.current_depth as f64 / self.capacity as f64
        }
    }

    /// Highest fraction of capacity ever occupied.
    #[inline]
    pub fn peak_utilization(&self) -> f64 {
        if self.capacity == 0 {
            0.0
        } else {
            self.peak_depth as f64 / self.capacity as f64
        }
    }

    /// Fraction of produced items that were dropped.
    #[inline]
    pub fn drop_rate(&self) -> f64 {
        if self.produced_count == 0 {
            0.0
        } else {
            self.dropped_count as f64 / self.produced_count as f64
        }
    }

    /// Backpressure events per produced item.
    ///
    /// Can exceed 1.0 when rate-limited sends are retried.
    #[inline]
    pub fn pressure_ratio(&self) -> f64 {
        if self.produced_count == 0 {
            if self.backpressure_events > 0 {
                1.0
            } else {
                0.0
            }
        } else {
            self.backpressure_events as f64 / self.produced_count as f64
        }
    }

    /// Items neither consumed nor dropped yet.
    ///
    /// Equals `current_depth` whenever no operation is in flight.
    #[inline]
    pub fn in_flight(&self) -> u64 {
        self.produced_count
            .saturating_sub(self.consumed_count)
            .saturating_sub(self.dropped_count)
    }

    /// Returns true if `produced == consumed + dropped + depth`.
    #[inline]
    pub fn is_balanced(&self) -> bool {
        self.produced_count == self.consumed_count + self.dropped_count + self.current_depth as u64
    }

    /// Buffer nearly full right now (80% or more).
    #[inline]
    pub fn is_under_pressure(&self) -> bool {
        self.utilization() >= 0.8
    }

    /// Drops or backpressure events make up a significant share of traffic.
    ///
    /// Detected when more than 30% of produced items were dropped, or when
    /// more than half of all sends hit backpressure.
    #[inline]
    pub fn is_under_sustained_pressure(&self) -> bool {
        self.drop_rate() > 0.3 || self.pressure_ratio() > 0.5
    }

    /// Three-level assessment of the pipeline.
    ///
    /// # Example
    ///
    /// ```rust
    /// use floodgate::{BackpressureController, BufferKind, HealthStatus, Strategy};
    ///
    /// let controller = BackpressureController::<u32>::new(16, Strategy::Block, BufferKind::Fixed, None)?;
    /// match controller.metrics().health_status() {
    ///     HealthStatus::Healthy => println!("✅ All good"),
    ///     HealthStatus::Degraded => println!("⚠️ Consumers falling behind"),
    ///     HealthStatus::Critical => println!("🔴 Shedding load"),
    /// }
    /// # Ok::<(), floodgate::ConfigError>(())
    /// ```
    pub fn health_status(&self) -> HealthStatus {
        if self.is_under_sustained_pressure() {
            HealthStatus::Critical
        } else if self.is_under_pressure() {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        }
    }

    /// Generates a human-readable summary of the metrics.
    ///
    /// # Example Output
    ///
    /// ```text
    /// Backpressure Metrics:
    /// ├─ Buffer:
    /// │  ├─ Depth: 6/8
    /// │  ├─ Utilization: 75.00%
    /// │  └─ Peak Depth: 8
    /// ├─ Counters:
    /// │  ├─ Produced: 1200
    /// │  ├─ Consumed: 1150
    /// │  ├─ Dropped: 44
    /// │  └─ Backpressure Events: 61
    /// ├─ Rate Limit: 250.00/s
    /// └─ Health:
    ///    ├─ Status: Degraded
    ///    └─ Drop Rate: 3.67%
    /// ```
    pub fn summary(&self) -> String {
        format!(
            "Backpressure Metrics:\n\
             ├─ Buffer:\n\
             │  ├─ Depth: {}/{}\n\
             │  ├─ Utilization: {:.2}%\n\
             │  └─ Peak Depth: {}\n\
             ├─ Counters:\n\
             │  ├─ Produced: {}\n\
             │  ├─ Consumed: {}\n\
             │  ├─ Dropped: {}\n\
             │  └─ Backpressure Events: {}\n\
             ├─ Rate Limit: {:.2}/s\n\
             └─ Health:\n\
                ├─ Status: {:?}\n\
                └─ Drop Rate: {:.2}%",
            self.current_depth,
            self.capacity,
            self.utilization() * 100.0,
            self.peak_depth,
            self.produced_count,
            self.consumed_count,
            self.dropped_count,
            self.backpressure_events,
            self.current_rate_limit,
            self.health_status(),
            self.drop_rate() * 100.0,
        )
    }
}

impl fmt::Display for MetricsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.summary())
    }
}

/// Health status indicator for a pipeline.
///
/// ```text
///     Healthy ──────► Consumers keep up
///        │
///     Degraded ─────► Buffer nearly full, monitor closely
///        │
///     Critical ─────► Sustained drops or backpressure
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    /// Buffer below 80% and little backpressure.
    Healthy,

    /// Buffer at 80% or more, but drops and backpressure still rare.
    Degraded,

    /// Over 30% of items dropped, or most sends hitting backpressure.
    Critical,
}

impl HealthStatus {
    /// Returns true if the status indicates any problems.
    pub fn is_unhealthy(&self) -> bool {
        !matches!(self, Self::Healthy)
    }

    /// Returns a suggested action based on the health status.
    pub fn suggested_action(&self) -> &'static str {
        match self {
            Self::Healthy => "No action needed",
            Self::Degraded => "Monitor closely, consider adding consumers",
            Self::Critical => "Immediate action required: add consumers or reduce load",
        }
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Healthy => write!(f, "✅ Healthy"),
            Self::Degraded => write!(f, "⚠️ Degraded"),
            Self::Critical => write!(f, "🔴 Critical"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(depth: usize, produced: u64, consumed: u64, dropped: u64, events: u64) -> MetricsSnapshot {
        MetricsSnapshot {
            current_depth: depth,
            peak_depth: depth,
            capacity: 10,
            produced_count: produced,
            consumed_count: consumed,
            dropped_count: dropped,
            backpressure_events: events,
            current_rate_limit: 0.0,
        }
    }

    #[test]
    fn test_collector_counters() {
        let metrics = MetricsCollector::new(8, MemoryOrdering::AcquireRelease);
        metrics.record_produced(5);
        metrics.set_depth(5);
        metrics.record_consumed(2);
        metrics.set_depth(3);
        metrics.record_dropped(0);
        metrics.record_backpressure();

        let snap = metrics.snapshot();
        assert_eq!(snap.produced_count, 5);
        assert_eq!(snap.consumed_count, 2);
        assert_eq!(snap.dropped_count, 0);
        assert_eq!(snap.current_depth, 3);
        assert_eq!(snap.peak_depth, 5);
        assert_eq!(snap.backpressure_events, 1);
        assert!(snap.is_balanced());
        assert_eq!(metrics.depth(), 3);
        assert_eq!(metrics.depth_ratio(), 3.0 / 8.0);
    }

    #[test]
    fn test_rate_limit_bits() {
        let metrics = MetricsCollector::new(4, MemoryOrdering::Relaxed);
        assert_eq!(metrics.rate_limit(), 0.0);

        metrics.set_rate_limit(123.25);
        assert_eq!(metrics.rate_limit(), 123.25);

        metrics.set_rate_limit(-5.0);
        assert_eq!(metrics.rate_limit(), 0.0);
    }

    #[test]
    fn test_peak_is_monotonic() {
        let metrics = MetricsCollector::new(4, MemoryOrdering::Sequential);
        metrics.set_depth(4);
        metrics.set_depth(1);
        metrics.set_depth(2);
        assert_eq!(metrics.snapshot().peak_depth, 4);
        assert_eq!(metrics.snapshot().peak_utilization(), 1.0);
    }

    #[test]
    fn test_snapshot_calculations() {
        let snap = snapshot(5, 100, 85, 10, 20);
        assert_eq!(snap.utilization(), 0.5);
        assert_eq!(snap.drop_rate(), 0.1);
        assert_eq!(snap.pressure_ratio(), 0.2);
        assert_eq!(snap.in_flight(), 5);
        assert!(snap.is_balanced());
        assert_eq!(snap.health_status(), HealthStatus::Healthy);
    }

    #[test]
    fn test_health_levels() {
        assert_eq!(snapshot(8, 100, 92, 0, 5).health_status(), HealthStatus::Degraded);
        assert_eq!(snapshot(10, 100, 50, 40, 40).health_status(), HealthStatus::Critical);
        assert_eq!(snapshot(0, 10, 10, 0, 8).health_status(), HealthStatus::Critical);
    }

    #[test]
    fn test_edge_cases() {
        let empty = snapshot(0, 0, 0, 0, 0);
        assert_eq!(empty.drop_rate(), 0.0);
        assert_eq!(empty.pressure_ratio(), 0.0);
        assert!(empty.is_balanced());
        assert!(!empty.is_under_pressure());

        // Rate-limited before anything was ever accepted.
        let stalled = snapshot(0, 0, 0, 0, 3);
        assert_eq!(stalled.pressure_ratio(), 1.0);

        let mut zero_cap = snapshot(0, 0, 0, 0, 0);
        zero_cap.capacity = 0;
        assert_eq!(zero_cap.utilization(), 0.0);
        assert_eq!(zero_cap.peak_utilization(), 0.0);
    }

    #[test]
    fn test_health_status_methods() {
        assert!(!HealthStatus::Healthy.is_unhealthy());
        assert!(HealthStatus::Degraded.is_unhealthy());
        assert!(HealthStatus::Critical.is_unhealthy());

        assert_eq!(HealthStatus::Healthy.suggested_action(), "No action needed");
        assert!(HealthStatus::Degraded.suggested_action().contains("Monitor"));
        assert!(HealthStatus::Critical.suggested_action().contains("Immediate"));
        assert!(HealthStatus::Critical.to_string().contains("Critical"));
    }

    #[test]
    fn test_metrics_display() {
        let snap = snapshot(6, 1200, 1150, 44, 61);
        let display = format!("{}", snap);
        assert!(display.contains("Backpressure Metrics"));
        assert!(display.contains("Depth: 6/10"));
        assert!(display.contains("Dropped: 44"));
        assert_eq!(display, snap.summary());
    }

    #[test]
    fn test_event_construction() {
        let before = super::super::utils::current_time_ms();
        let event = BackpressureEvent::now(EventKind::Dropped, 3);
        assert!(event.timestamp_ms >= before);
        assert_eq!(event.kind, EventKind::Dropped);
        assert_eq!(event.depth_at_event, 3);
        assert_eq!(EventKind::QueueFull.to_string(), "queue_full");
    }
}
