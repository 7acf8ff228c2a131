//! # Floodgate - Backpressure and Flow Control for Rust
//!
//! A bounded, thread-safe pipeline between producers and consumers that keeps
//! a fast producer from overwhelming a slow consumer. When the buffer fills,
//! a configurable strategy decides what happens next: wait, evict, reject or
//! slow the producer down.
//!
//! ## What is Backpressure?
//!
//! Backpressure is the signal a consumer sends upstream when it cannot keep
//! up. Without it a queue grows until memory runs out; with it the producer
//! is told to wait, or work is shed in a controlled way.
//!
//! ```text
//!     Producer (1000/s) ──► [▓▓▓▓▓▓▓▓] ──► Consumer (200/s)
//!                              full!
//!                                │
//!              ┌─────────────────┼─────────────────┬──────────────────┐
//!              ▼                 ▼                 ▼                  ▼
//!            Block          DropOldest        DropNewest          Adaptive
//!        (wait for room)  (evict the head)  (reject the item)  (throttle the rate)
//! ```
//!
//! ## Features
//!
//! - 🧱 **Four Strategies** - Block, drop-oldest, drop-newest and adaptive admission
//! - 📦 **Three Buffers** - Fixed, ring (O(1) eviction) and growing storage
//! - 📉 **Rate Control** - AIMD, token bucket and sliding window controllers
//! - 🛑 **Cancellation** - Timeouts and cancel tokens for every blocking call
//! - 📊 **Real-time Metrics** - Depth, throughput, drops and health status
//! - 🗂️ **Keyed Pipelines** - A registry of independent controllers with sweeping
//!
//! ## Quick Start
//!
//! ### A Bounded Queue
//!
//! ```rust
//! use floodgate::{BackpressureController, BufferKind, Strategy};
//! use std::sync::Arc;
//! use std::thread;
//!
//! let controller = Arc::new(BackpressureController::new(
//!     16,
//!     Strategy::Block,
//!     BufferKind::Ring,
//!     None,
//! )?);
//!
//! let producer = {
//!     let controller = Arc::clone(&controller);
//!     thread::spawn(move || {
//!         for i in 0..1_000u32 {
//!             controller.send(i).unwrap();
//!         }
//!         controller.close();
//!     })
//! };
//!
//! let received: Vec<u32> = controller.iter().collect();
//! producer.join().unwrap();
//!
//! assert_eq!(received.len(), 1_000);
//! assert!(controller.metrics().peak_depth <= 16);
//! # Ok::<(), floodgate::ConfigError>(())
//! ```
//!
//! ### Adaptive Admission with the Builder
//!
//! ```rust
//! use floodgate::{AdaptiveMode, BackpressureBuilder, SendError, Strategy, TokenBucketConfig};
//!
//! let controller = BackpressureBuilder::<String>::new()
//!     .capacity(64)
//!     .strategy(Strategy::Adaptive(AdaptiveMode::NonBlocking))
//!     .rate(TokenBucketConfig::new(2.0, 1.0))
//!     .on_event(|event| println!("backpressure: {:?}", event.kind))
//!     .build()?;
//!
//! assert!(controller.send("a".into()).is_ok());
//! assert!(controller.send("b".into()).is_ok());
//! assert!(matches!(
//!     controller.send("c".into()),
//!     Err(SendError::RateLimited { .. })
//! ));
//! # Ok::<(), floodgate::ConfigError>(())
//! ```
//!
//! ## Architecture Overview
//!
//! ```text
//!                    ┌─────────────────────────┐
//!                    │   Your Application      │
//!                    └──────────┬──────────────┘
//!                               │
//!                    ┌──────────▼───────────────┐
//!                    │ BackpressureController   │
//!                    ├──────────────────────────┤
//!                    │  • send() / try_send()   │
//!                    │  • recv() / recv_batch() │
//!                    │  • close() / metrics()   │
//!                    └──────────┬───────────────┘
//!                               │
//!          ┌────────────────────┼────────────────────┐
//!          │                    │                    │
//!   ┌──────▼───────┐   ┌────────▼───────┐   ┌────────▼───────┐
//!   │    Buffer    │   │ Rate Controller│   │    Metrics     │
//!   ├──────────────┤   ├────────────────┤   ├────────────────┤
//!   │ • Fixed      │   │ • AIMD         │   │ • Depth, peak  │
//!   │ • Ring       │   │ • Token bucket │   │ • Counters     │
//!   │ • Growing    │   │ • Sliding win. │   │ • Events       │
//!   └──────────────┘   └────────────────┘   └────────────────┘
//! ```
//!
//! ## Performance Characteristics
//!
//! | Operation | Time Complexity | Notes |
//! |-----------|----------------|-------|
//! | send() | O(1) | Amortized for growing buffers |
//! | recv() | O(1) | |
//! | recv_batch(n) | O(n) | One lock acquisition |
//! | metrics() | O(1) | Lock-free counters |
//!
//! ## Thread Safety
//!
//! All types are thread-safe and can be shared across threads:
//! - `BackpressureController<T>` - Share via `Arc` ([`SharedController`])
//! - `PipelineRegistry<K, T>` - Share via `Arc` ([`SharedRegistry`])
//! - `CancelToken` - Clone freely, all clones observe the same flag
//!
//! ## Memory Ordering
//!
//! Metrics counters honour the configured [`MemoryOrdering`]:
//! - `Relaxed` - Fastest, counters may be observed slightly out of step
//! - `AcquireRelease` - Balanced (default)
//! - `Sequential` - Strongest guarantees

#![cfg_attr(docsrs, feature(doc_cfg))]
#![warn(
    missing_docs,
    rust_2018_idioms,
    unreachable_pub,
    missing_debug_implementations
)]
#![forbid(unsafe_op_in_unsafe_fn)]

// Internal module
mod backpressure;

// Public re-exports
pub use backpressure::{
    current_time_ms, new_buffer, AdaptiveMode, Aimd, AimdConfig, BackpressureController,
    BackpressureEvent, BoundedStream, BufferKind, BufferManager, CancelToken, ConfigError,
    ControllerConfig, ControllerState, EventKind, EventObserver, FixedBuffer, GrowingBuffer,
    HealthStatus, Iter, MemoryOrdering, MetricsCollector, MetricsSnapshot, PipelineRegistry,
    RateConfig, RateController, RateDecision, RecvError, RegistryStats, RingBuffer, SendError,
    SlidingWindow, SlidingWindowConfig, Strategy, TokenBucket, TokenBucketConfig, TryRecvError,
    CACHE_LINE_SIZE, DEFAULT_MAX_PIPELINES, DEFAULT_SWEEP_INTERVAL, LOW_PRESSURE_RATIO,
    MAX_WINDOW_SAMPLES, PRESSURE_REFILL_FACTOR, PRESSURE_STREAK_THRESHOLD,
};

use std::fmt;
use std::hash::Hash;
use std::marker::PhantomData;
use std::sync::Arc;

/// A controller wrapped in `Arc` for sharing between producers and
/// consumers.
///
/// # Example
/// ```rust
/// use floodgate::{BackpressureController, BufferKind, SharedController, Strategy};
/// use std::sync::Arc;
///
/// let shared: SharedController<u32> = Arc::new(BackpressureController::new(
///     8,
///     Strategy::DropNewest,
///     BufferKind::Fixed,
///     None,
/// )?);
///
/// let producer = shared.clone();
/// std::thread::spawn(move || {
///     producer.send(1).unwrap();
/// })
/// .join()
/// .unwrap();
///
/// assert_eq!(shared.recv(), Some(1));
/// # Ok::<(), floodgate::ConfigError>(())
/// ```
pub type SharedController<T> = Arc<BackpressureController<T>>;

/// A pipeline registry wrapped in `Arc`, as required by
/// [`PipelineRegistry::start_stoppable_sweeper`].
pub type SharedRegistry<K, T> = Arc<PipelineRegistry<K, T>>;

/// Version information for the crate.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Minimum supported Rust version.
///
/// This crate requires at least Rust 1.70.0 due to:
/// - `std::sync::OnceLock`
/// - `thread::available_parallelism`
/// - Edition 2021 features
pub const MSRV: &str = "1.70.0";

/// Prelude module for convenient imports.
///
/// Import everything you need with a single line:
/// ```rust
/// use floodgate::prelude::*;
/// ```
pub mod prelude {
    //! Common imports for typical flow-control use cases.
    //!
    //! # Example
    //! ```rust
    //! use floodgate::prelude::*;
    //!
    //! let controller = BackpressureBuilder::<u8>::new().capacity(4).build()?;
    //! let config = ControllerConfig::new(4, Strategy::DropOldest, BufferKind::Ring);
    //! let status = HealthStatus::Healthy;
    //! # let _ = (controller, config, status);
    //! # Ok::<(), ConfigError>(())
    //! ```

    pub use crate::{
        AdaptiveMode, AimdConfig, BackpressureBuilder, BackpressureController, BoundedStream,
        BufferKind, CancelToken, ConfigError, ControllerConfig, HealthStatus, MemoryOrdering,
        MetricsSnapshot, PipelineRegistry, RecvError, SendError, SharedController,
        SharedRegistry, SlidingWindowConfig, Strategy, TokenBucketConfig, TryRecvError,
    };
}

/// Builder for controllers with custom configuration.
///
/// Starts from [`ControllerConfig::default`] (capacity 1024, blocking, ring
/// buffer, no rate controller).
///
/// # Example
///
/// ```rust
/// use floodgate::{AimdConfig, BackpressureBuilder, BufferKind, MemoryOrdering, Strategy};
/// use std::time::Duration;
///
/// let controller = BackpressureBuilder::<Vec<u8>>::new()
///     .capacity(256)
///     .strategy(Strategy::Block)
///     .buffer_kind(BufferKind::Growing { initial_capacity: 16 })
///     .rate(AimdConfig::new(1_000.0, 10.0, 10_000.0).with_increase_interval(Duration::from_millis(50)))
///     .memory_ordering(MemoryOrdering::Relaxed)
///     .build()?;
///
/// assert_eq!(controller.capacity(), 256);
/// assert_eq!(controller.current_rate(), 1_000.0);
///
/// // Invalid configurations are reported, never panicked on.
/// assert!(BackpressureBuilder::<u8>::new().capacity(0).build().is_err());
/// # Ok::<(), floodgate::ConfigError>(())
/// ```
pub struct BackpressureBuilder<T> {
    config: ControllerConfig,
    observer: Option<EventObserver>,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Send + 'static> BackpressureBuilder<T> {
    /// Creates a builder with default configuration.
    pub fn new() -> Self {
        Self::from_config(ControllerConfig::default())
    }

    /// Creates a builder starting from an existing configuration.
    pub fn from_config(config: ControllerConfig) -> Self {
        Self {
            config,
            observer: None,
            _marker: PhantomData,
        }
    }

    /// Sets the maximum number of buffered items (must be > 0).
    pub fn capacity(mut self, capacity: usize) -> Self {
        self.config.capacity = capacity;
        self
    }

    /// Sets what happens when the buffer is full.
    pub fn strategy(mut self, strategy: Strategy) -> Self {
        self.config.strategy = strategy;
        self
    }

    /// Sets the storage behind the controller.
    pub fn buffer_kind(mut self, kind: BufferKind) -> Self {
        self.config.buffer_kind = kind;
        self
    }

    /// Attaches a rate controller.
    ///
    /// Required by [`Strategy::Adaptive`]; with any other strategy the
    /// controller only learns from the buffer's fill level.
    pub fn rate(mut self, rate: impl Into<RateConfig>) -> Self {
        self.config.rate = Some(rate.into());
        self
    }

    /// Sets the memory ordering used by the metrics counters.
    pub fn memory_ordering(mut self, ordering: MemoryOrdering) -> Self {
        self.config.ordering = ordering;
        self
    }

    /// Registers a callback for every [`BackpressureEvent`].
    ///
    /// The callback runs on the thread that triggered the event and must
    /// not block.
    pub fn on_event<F>(mut self, observer: F) -> Self
    where
        F: Fn(&BackpressureEvent) + Send + Sync + 'static,
    {
        self.observer = Some(Arc::new(observer));
        self
    }

    /// The configuration built so far.
    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    /// Builds the controller.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the configuration is invalid, see
    /// [`ControllerConfig::validate`].
    pub fn build(self) -> Result<BackpressureController<T>, ConfigError> {
        BackpressureController::from_parts(self.config, self.observer)
    }

    /// Builds the controller already wrapped in an `Arc`.
    pub fn build_shared(self) -> Result<SharedController<T>, ConfigError> {
        self.build().map(Arc::new)
    }

    /// Builds a registry whose pipelines all use this configuration and
    /// observer.
    pub fn build_registry<K>(self, max_pipelines: usize) -> Result<PipelineRegistry<K, T>, ConfigError>
    where
        K: Eq + Hash + Clone + fmt::Debug + Send + Sync + 'static,
    {
        let registry = PipelineRegistry::with_max_pipelines(self.config, max_pipelines)?;
        Ok(match self.observer {
            Some(observer) => registry.with_observer(observer),
            None => registry,
        })
    }
}

impl<T: Send + 'static> Default for BackpressureBuilder<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for BackpressureBuilder<T> {
    fn clone(&self) -> Self {
        Self {
            config: self.config.clone(),
            observer: self.observer.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T> fmt::Debug for BackpressureBuilder<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackpressureBuilder")
            .field("config", &self.config)
            .field("observer", &self.observer.is_some())
            .finish()
    }
}
