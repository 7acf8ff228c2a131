//! # Backpressure Module
//!
//! Internal implementation of the flow-control core. Each submodule owns one
//! concern and the controller in `core` composes them.
//!
//! ## Module Structure
//!
//! ```text
//!     backpressure/
//!     ├── mod.rs          (Module organization)
//!     ├── config.rs       (Strategies, buffer kinds, rate configs)
//!     ├── core.rs         (BackpressureController)
//!     ├── buffer.rs       (Fixed, ring and growing storage)
//!     ├── rate.rs         (AIMD, token bucket, sliding window)
//!     ├── cancel.rs       (Cooperative cancellation)
//!     ├── stream.rs       (Pull-based iteration)
//!     ├── manager.rs      (Keyed pipeline registry)
//!     ├── metrics.rs      (Counters, snapshots, events)
//!     ├── error.rs        (Error types)
//!     └── utils.rs        (Time and cache helpers)
//! ```
//!
//! ## Data Flow
//!
//! ```text
//!     Producer ──send──► ┌──────────────┐ ──recv──► Consumer
//!                        │  Controller  │
//!                        └──┬────┬───┬──┘
//!                           │    │   │
//!             ┌─────────────┘    │   └───────────┐
//!             ▼                  ▼               ▼
//!     ┌──────────────┐  ┌────────────────┐  ┌──────────┐
//!     │ BufferManager│  │ RateController │  │ Metrics  │
//!     └──────────────┘  └────────────────┘  └──────────┘
//! ```

mod buffer;
mod cancel;
mod config;
mod core;
mod error;
mod manager;
mod metrics;
mod rate;
mod stream;
mod utils;

/// Storage strategies behind a controller
pub use buffer::{new_buffer, BufferManager, FixedBuffer, GrowingBuffer, RingBuffer};

/// Cancellation of blocking calls
pub use cancel::CancelToken;

/// Configuration types
pub use config::{
    AdaptiveMode, AimdConfig, BufferKind, ControllerConfig, MemoryOrdering, RateConfig,
    SlidingWindowConfig, Strategy, TokenBucketConfig, MAX_WINDOW_SAMPLES,
};

/// The controller itself
pub use core::{BackpressureController, ControllerState};

/// Error types
pub use error::{ConfigError, RecvError, SendError, TryRecvError};

/// Keyed pipelines
pub use manager::{
    PipelineRegistry, RegistryStats, DEFAULT_MAX_PIPELINES, DEFAULT_SWEEP_INTERVAL,
};

/// Observability
pub use metrics::{
    BackpressureEvent, EventKind, EventObserver, HealthStatus, MetricsCollector,
    MetricsSnapshot,
};

/// Rate controllers
pub use rate::{
    Aimd, RateController, RateDecision, SlidingWindow, TokenBucket, LOW_PRESSURE_RATIO,
    PRESSURE_REFILL_FACTOR, PRESSURE_STREAK_THRESHOLD,
};

/// Iteration
pub use stream::{BoundedStream, Iter};

/// Time helpers
pub use utils::{current_time_ms, CACHE_LINE_SIZE};
