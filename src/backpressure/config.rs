//! # Controller Configuration
//!
//! This module provides the configuration structures for controllers: how
//! much they buffer, what happens when the buffer is full, and how the
//! optional rate controller is tuned.
//!
//! ## Key Concepts
//!
//! ```text
//!     ControllerConfig
//!     ┌─────────────────────────────────────────┐
//!     │ capacity: 1024          ← hard depth bound
//!     │ strategy: Block         ← what a full buffer does
//!     │ buffer_kind: Ring       ← how slots are stored
//!     │ rate: Some(Aimd(..))    ← optional admission control
//!     │ ordering: AcqRel        ← atomics for metrics
//!     └─────────────────────────────────────────┘
//! ```
//!
//! ### Memory Ordering
//!
//! ```text
//!     Relaxed ──────► Fast but minimal guarantees
//!        │
//!     AcquireRelease ► Balanced (recommended)
//!        │
//!     Sequential ───► Slow but strongest guarantees
//! ```

use super::error::ConfigError;
use std::fmt;
use std::sync::atomic::Ordering;
use std::time::Duration;

/// Upper bound on the number of samples a sliding window may need to keep.
///
/// `target_rate * window` must not exceed this, which keeps the window's
/// memory bounded regardless of configuration.
pub const MAX_WINDOW_SAMPLES: usize = 1 << 20;

/// Memory ordering strategy for the metric atomics.
///
/// Buffer state is always protected by the controller's mutex; this only
/// affects how counters are published to concurrent observers.
///
/// ## Example
///
/// ```rust
/// use floodgate::{BufferKind, ControllerConfig, MemoryOrdering, Strategy};
///
/// let config = ControllerConfig::new(64, Strategy::Block, BufferKind::Fixed)
///     .with_ordering(MemoryOrdering::Relaxed);
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MemoryOrdering {
    /// Relaxed ordering - fastest but provides minimal guarantees.
    Relaxed,

    /// Acquire-Release ordering - balanced performance and correctness.
    #[default]
    AcquireRelease,

    /// Sequential consistency - strongest guarantees but slower.
    Sequential,
}

impl MemoryOrdering {
    /// Ordering for load (read) operations.
    #[inline(always)]
    pub(crate) fn load(&self) -> Ordering {
        match self {
            Self::Relaxed => Ordering::Relaxed,
            Self::AcquireRelease => Ordering::Acquire,
            Self::Sequential => Ordering::SeqCst,
        }
    }

    /// Ordering for store (write) operations.
    #[inline(always)]
    pub(crate) fn store(&self) -> Ordering {
        match self {
            Self::Relaxed => Ordering::Relaxed,
            Self::AcquireRelease => Ordering::Release,
            Self::Sequential => Ordering::SeqCst,
        }
    }

    /// Ordering for read-modify-write operations.
    #[inline(always)]
    pub(crate) fn rmw(&self) -> Ordering {
        match self {
            Self::Relaxed => Ordering::Relaxed,
            Self::AcquireRelease => Ordering::AcqRel,
            Self::Sequential => Ordering::SeqCst,
        }
    }
}

/// Whether the adaptive strategy waits out a rate-control delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AdaptiveMode {
    /// Return [`SendError::RateLimited`](crate::SendError::RateLimited)
    /// immediately when the rate controller does not accept.
    #[default]
    NonBlocking,

    /// Sleep for the suggested delay, then ask the rate controller once more.
    /// A full buffer after admission blocks like [`Strategy::Block`].
    Blocking,
}

/// What `send` does when the buffer is full.
///
/// Fixed for the lifetime of a controller.
///
/// ```text
///     buffer: [1][2][3]   send(4)
///
///     Block      → caller waits until recv() frees a slot
///     DropOldest → [2][3][4]    (1 dropped)
///     DropNewest → [1][2][3]    (4 dropped)
///     Adaptive   → rate controller decides; full buffer behaves per mode
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Strategy {
    /// Suspend the producer until space is available.
    #[default]
    Block,
    /// Evict the oldest buffered item to make room.
    DropOldest,
    /// Discard the incoming item.
    DropNewest,
    /// Consult the rate controller before every send.
    Adaptive(AdaptiveMode),
}

impl Strategy {
    /// Returns true for the adaptive strategy in either mode.
    #[inline]
    pub fn is_adaptive(&self) -> bool {
        matches!(self, Self::Adaptive(_))
    }

    /// Returns true if `send` may suspend when the buffer is full.
    #[inline]
    pub fn blocks_when_full(&self) -> bool {
        matches!(self, Self::Block | Self::Adaptive(AdaptiveMode::Blocking))
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Block => write!(f, "block"),
            Self::DropOldest => write!(f, "drop_oldest"),
            Self::DropNewest => write!(f, "drop_newest"),
            Self::Adaptive(AdaptiveMode::NonBlocking) => write!(f, "adaptive"),
            Self::Adaptive(AdaptiveMode::Blocking) => write!(f, "adaptive_blocking"),
        }
    }
}

/// Storage layout of the buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BufferKind {
    /// Preallocated slots; inserting into a full buffer is a bug.
    Fixed,
    /// Preallocated circular slots with O(1) overwrite of the oldest item.
    #[default]
    Ring,
    /// Starts at `initial_capacity` and doubles up to the controller
    /// capacity, trading memory spikes for burst tolerance.
    Growing {
        /// Slots allocated at construction.
        initial_capacity: usize,
    },
}

fn check_bounds(min_rate: f64, max_rate: f64) -> Result<(), ConfigError> {
    let valid = min_rate.is_finite()
        && max_rate.is_finite()
        && min_rate >= 0.0
        && max_rate > 0.0
        && min_rate <= max_rate;
    if valid {
        Ok(())
    } else {
        Err(ConfigError::InvalidRateBounds {
            min: min_rate,
            max: max_rate,
        })
    }
}

fn check_positive(name: &'static str, value: f64) -> Result<(), ConfigError> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(ConfigError::InvalidParameter {
            name,
            reason: "must be finite and greater than 0",
        })
    }
}

/// Tuning for the AIMD rate controller.
///
/// ```text
///     rate
///      │      ╱│      ╱│
///      │    ╱  │    ╱  │     +additive_increase per interval
///      │  ╱    │  ╱    │
///      │╱      ╰╱      ╰──   ×decrease_factor on a full buffer
///      └──────────────────── time
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct AimdConfig {
    /// Starting rate in items per second.
    pub initial_rate: f64,
    /// Floor for the rate. Zero is allowed and means "may fully stall".
    pub min_rate: f64,
    /// Ceiling for the rate.
    pub max_rate: f64,
    /// Items per second added on a low-pressure accept.
    pub additive_increase: f64,
    /// Multiplier applied on a full-buffer signal, in `(0, 1)`.
    pub decrease_factor: f64,
    /// Depth ratio below which the rate may grow, in `(0, 1]`.
    pub low_watermark: f64,
    /// Minimum time between two additive increases.
    pub increase_interval: Duration,
}

impl Default for AimdConfig {
    /// 100 items/s starting rate within `[1, 10_000]`, +10 per 100ms of low
    /// pressure, halved on every full buffer.
    fn default() -> Self {
        Self {
            initial_rate: 100.0,
            min_rate: 1.0,
            max_rate: 10_000.0,
            additive_increase: 10.0,
            decrease_factor: 0.5,
            low_watermark: 0.5,
            increase_interval: Duration::from_millis(100),
        }
    }
}

impl AimdConfig {
    /// Creates a config with the given starting rate and bounds and the
    /// default increase/decrease tuning.
    pub fn new(initial_rate: f64, min_rate: f64, max_rate: f64) -> Self {
        Self {
            initial_rate,
            min_rate,
            max_rate,
            ..Default::default()
        }
    }

    /// Sets the additive increase step.
    pub fn with_additive_increase(mut self, step: f64) -> Self {
        self.additive_increase = step;
        self
    }

    /// Sets the multiplicative decrease factor.
    pub fn with_decrease_factor(mut self, factor: f64) -> Self {
        self.decrease_factor = factor;
        self
    }

    /// Sets the low watermark.
    pub fn with_low_watermark(mut self, watermark: f64) -> Self {
        self.low_watermark = watermark;
        self
    }

    /// Sets the minimum spacing between additive increases.
    pub fn with_increase_interval(mut self, interval: Duration) -> Self {
        self.increase_interval = interval;
        self
    }

    /// Validates bounds and tuning parameters.
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_bounds(self.min_rate, self.max_rate)?;
        if !self.initial_rate.is_finite()
            || self.initial_rate < self.min_rate
            || self.initial_rate > self.max_rate
        {
            return Err(ConfigError::InvalidParameter {
                name: "initial_rate",
                reason: "must lie within [min_rate, max_rate]",
            });
        }
        check_positive("additive_increase", self.additive_increase)?;
        if !(self.decrease_factor > 0.0 && self.decrease_factor < 1.0) {
            return Err(ConfigError::InvalidParameter {
                name: "decrease_factor",
                reason: "must be in (0, 1)",
            });
        }
        if !(self.low_watermark > 0.0 && self.low_watermark <= 1.0) {
            return Err(ConfigError::InvalidParameter {
                name: "low_watermark",
                reason: "must be in (0, 1]",
            });
        }
        Ok(())
    }
}

/// Tuning for the token bucket rate controller.
///
/// Burst size is `capacity`; sustained rate is `refill_rate`.
#[derive(Debug, Clone, PartialEq)]
pub struct TokenBucketConfig {
    /// Maximum tokens the bucket holds (burst capacity). At least 1.
    pub capacity: f64,
    /// Tokens added per second.
    pub refill_rate: f64,
    /// Floor for the effective refill rate under sustained pressure.
    pub min_rate: f64,
    /// Ceiling for the effective refill rate.
    pub max_rate: f64,
}

impl Default for TokenBucketConfig {
    /// 10 items/s sustained with bursts of up to 50.
    fn default() -> Self {
        Self::new(50.0, 10.0)
    }
}

impl TokenBucketConfig {
    /// Creates a bucket whose rate bounds are `[0, refill_rate]`.
    ///
    /// # Example
    ///
    /// ```rust
    /// use floodgate::TokenBucketConfig;
    ///
    /// // Bursts of 5, one item per second sustained.
    /// let config = TokenBucketConfig::new(5.0, 1.0);
    /// assert!(config.validate().is_ok());
    /// ```
    pub fn new(capacity: f64, refill_rate: f64) -> Self {
        Self {
            capacity,
            refill_rate,
            min_rate: 0.0,
            max_rate: refill_rate,
        }
    }

    /// Per-second limiting with a burst capacity of twice the rate.
    pub fn per_second(items_per_second: f64) -> Self {
        Self::new(items_per_second * 2.0, items_per_second)
    }

    /// Sets the burst capacity as a multiple of the refill rate.
    pub fn with_burst_multiplier(mut self, multiplier: f64) -> Self {
        self.capacity = self.refill_rate * multiplier;
        self
    }

    /// Sets the rate bounds.
    pub fn with_bounds(mut self, min_rate: f64, max_rate: f64) -> Self {
        self.min_rate = min_rate;
        self.max_rate = max_rate;
        self
    }

    /// Validates bucket size, refill rate and bounds.
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_bounds(self.min_rate, self.max_rate)?;
        if !(self.capacity.is_finite() && self.capacity >= 1.0) {
            return Err(ConfigError::InvalidParameter {
                name: "capacity",
                reason: "must be at least 1 token",
            });
        }
        check_positive("refill_rate", self.refill_rate)?;
        if self.refill_rate < self.min_rate || self.refill_rate > self.max_rate {
            return Err(ConfigError::InvalidParameter {
                name: "refill_rate",
                reason: "must lie within [min_rate, max_rate]",
            });
        }
        Ok(())
    }
}

/// Tuning for the sliding window rate controller.
#[derive(Debug, Clone, PartialEq)]
pub struct SlidingWindowConfig {
    /// Accepted items per second averaged over `window`.
    pub target_rate: f64,
    /// Width of the measurement window.
    pub window: Duration,
    /// Lower bound reported for the permitted rate.
    pub min_rate: f64,
    /// Upper bound reported for the permitted rate.
    pub max_rate: f64,
}

impl Default for SlidingWindowConfig {
    /// 100 items/s over a one-second window.
    fn default() -> Self {
        Self::new(100.0, Duration::from_secs(1))
    }
}

impl SlidingWindowConfig {
    /// Creates a window whose rate bounds are `[0, target_rate]`.
    pub fn new(target_rate: f64, window: Duration) -> Self {
        Self {
            target_rate,
            window,
            min_rate: 0.0,
            max_rate: target_rate,
        }
    }

    /// Sets the rate bounds.
    pub fn with_bounds(mut self, min_rate: f64, max_rate: f64) -> Self {
        self.min_rate = min_rate;
        self.max_rate = max_rate;
        self
    }

    /// Validates the window and bounds.
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_bounds(self.min_rate, self.max_rate)?;
        check_positive("target_rate", self.target_rate)?;
        if self.target_rate < self.min_rate || self.target_rate > self.max_rate {
            return Err(ConfigError::InvalidParameter {
                name: "target_rate",
                reason: "must lie within [min_rate, max_rate]",
            });
        }
        if self.window.is_zero() {
            return Err(ConfigError::InvalidParameter {
                name: "window",
                reason: "must be greater than 0",
            });
        }
        if self.target_rate * self.window.as_secs_f64() > MAX_WINDOW_SAMPLES as f64 {
            return Err(ConfigError::InvalidParameter {
                name: "target_rate",
                reason: "target_rate * window exceeds MAX_WINDOW_SAMPLES",
            });
        }
        Ok(())
    }
}

/// Which rate controller to run and how to tune it.
#[derive(Debug, Clone, PartialEq)]
pub enum RateConfig {
    /// Additive-increase / multiplicative-decrease.
    Aimd(AimdConfig),
    /// Token bucket with burst capacity.
    TokenBucket(TokenBucketConfig),
    /// Moving-window throughput cap.
    SlidingWindow(SlidingWindowConfig),
}

impl RateConfig {
    /// Validates the selected variant.
    pub fn validate(&self) -> Result<(), ConfigError> {
        match self {
            Self::Aimd(c) => c.validate(),
            Self::TokenBucket(c) => c.validate(),
            Self::SlidingWindow(c) => c.validate(),
        }
    }

    /// Configured `(min_rate, max_rate)`.
    pub fn bounds(&self) -> (f64, f64) {
        match self {
            Self::Aimd(c) => (c.min_rate, c.max_rate),
            Self::TokenBucket(c) => (c.min_rate, c.max_rate),
            Self::SlidingWindow(c) => (c.min_rate, c.max_rate),
        }
    }
}

impl From<AimdConfig> for RateConfig {
    fn from(config: AimdConfig) -> Self {
        Self::Aimd(config)
    }
}

impl From<TokenBucketConfig> for RateConfig {
    fn from(config: TokenBucketConfig) -> Self {
        Self::TokenBucket(config)
    }
}

impl From<SlidingWindowConfig> for RateConfig {
    fn from(config: SlidingWindowConfig) -> Self {
        Self::SlidingWindow(config)
    }
}

/// Full configuration of a [`BackpressureController`](crate::BackpressureController).
///
/// ## Examples
///
/// ```rust
/// use floodgate::{
///     AdaptiveMode, AimdConfig, BufferKind, ControllerConfig, Strategy,
/// };
///
/// // Plain bounded queue.
/// let config = ControllerConfig::new(128, Strategy::Block, BufferKind::Fixed);
/// assert!(config.validate().is_ok());
///
/// // Lossy telemetry queue that keeps the freshest samples.
/// let config = ControllerConfig::new(1024, Strategy::DropOldest, BufferKind::Ring);
/// assert!(config.validate().is_ok());
///
/// // Admission-controlled producer.
/// let config = ControllerConfig::new(
///     256,
///     Strategy::Adaptive(AdaptiveMode::Blocking),
///     BufferKind::Growing { initial_capacity: 32 },
/// )
/// .with_rate(AimdConfig::new(500.0, 10.0, 5_000.0));
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct ControllerConfig {
    /// Hard upper bound on buffered items.
    pub capacity: usize,
    /// Behaviour when the buffer is full.
    pub strategy: Strategy,
    /// Storage layout.
    pub buffer_kind: BufferKind,
    /// Optional rate controller; required for [`Strategy::Adaptive`].
    pub rate: Option<RateConfig>,
    /// Memory ordering for the metric atomics.
    pub ordering: MemoryOrdering,
}

impl Default for ControllerConfig {
    /// 1024-slot ring buffer with the blocking strategy and no rate control.
    fn default() -> Self {
        Self::new(1024, Strategy::Block, BufferKind::Ring)
    }
}

impl ControllerConfig {
    /// Creates a configuration without rate control.
    pub fn new(capacity: usize, strategy: Strategy, buffer_kind: BufferKind) -> Self {
        Self {
            capacity,
            strategy,
            buffer_kind,
            rate: None,
            ordering: MemoryOrdering::default(),
        }
    }

    /// Attaches a rate controller.
    pub fn with_rate(mut self, rate: impl Into<RateConfig>) -> Self {
        self.rate = Some(rate.into());
        self
    }

    /// Sets the memory ordering used for metrics.
    pub fn with_ordering(mut self, ordering: MemoryOrdering) -> Self {
        self.ordering = ordering;
        self
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// - `capacity` is 0
    /// - a growing buffer's initial capacity is 0 or above `capacity`
    /// - the adaptive strategy is selected without a rate config
    /// - the rate config itself is invalid
    ///
    /// # Example
    ///
    /// ```rust
    /// use floodgate::{BufferKind, ConfigError, ControllerConfig, Strategy};
    ///
    /// let config = ControllerConfig::new(0, Strategy::Block, BufferKind::Ring);
    /// assert_eq!(config.validate(), Err(ConfigError::ZeroCapacity));
    /// ```
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.capacity == 0 {
            return Err(ConfigError::ZeroCapacity);
        }
        if let BufferKind::Growing { initial_capacity } = self.buffer_kind {
            if initial_capacity == 0 || initial_capacity > self.capacity {
                return Err(ConfigError::InvalidGrowth {
                    initial: initial_capacity,
                    max: self.capacity,
                });
            }
        }
        match &self.rate {
            Some(rate) => rate.validate(),
            None if self.strategy.is_adaptive() => Err(ConfigError::MissingRateConfig),
            None => Ok(()),
        }
    }
}
