//! # Pipeline Registry
//!
//! A keyed collection of independent controllers built from one template.
//! Typical use is one pipeline per tenant, topic or downstream connection.
//!
//! ## Architecture
//!
//! ```text
//!     "orders"   ──┐
//!     "payments" ──┼──► PipelineRegistry ──► Arc<BackpressureController<T>>
//!     "audit"    ──┘         │
//!                            ▼
//!                      ┌──────────────┐
//!                      │  DashMap     │
//!                      │  ┌────────┐  │
//!                      │  │K → BC  │  │  BC = BackpressureController
//!                      │  │K → BC  │  │
//!                      │  └────────┘  │
//!                      └──────────────┘
//! ```
//!
//! ## Key Features
//!
//! 1. **Isolation**: each key has its own buffer, strategy state and metrics
//! 2. **Bounded Size**: at most `max_pipelines` entries
//! 3. **Sweeping**: pipelines that reached `Closed` are removed, on demand or
//!    from a background thread

use super::config::ControllerConfig;
use super::core::BackpressureController;
use super::error::ConfigError;
use super::metrics::EventObserver;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::fmt;
use std::hash::Hash;
use std::io;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Default bound on the number of pipelines.
pub const DEFAULT_MAX_PIPELINES: usize = 1_024;

/// Default interval of the background sweeper.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(30);

type PipelineMap<K, T> = DashMap<K, Arc<BackpressureController<T>>, ahash::RandomState>;

/// Concurrent map of named pipelines.
///
/// ## Example
///
/// ```rust
/// use floodgate::{BufferKind, ControllerConfig, PipelineRegistry, Strategy};
///
/// let template = ControllerConfig::new(64, Strategy::DropOldest, BufferKind::Ring);
/// let registry = PipelineRegistry::<&str, String>::new(template)?;
///
/// let orders = registry.get_or_create("orders").expect("below capacity");
/// orders.send("order-1".to_string())?;
///
/// assert_eq!(registry.active_pipelines(), 1);
/// assert_eq!(registry.get(&"orders").unwrap().len(), 1);
///
/// orders.close_now();
/// assert_eq!(registry.sweep_closed(), 1);
/// assert!(registry.is_empty());
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// ```
pub struct PipelineRegistry<K, T> {
    pipelines: Arc<PipelineMap<K, T>>,

    /// Fast capacity check without iterating the map.
    active_count: Arc<AtomicUsize>,

    template: ControllerConfig,
    observer: Option<EventObserver>,
    max_pipelines: usize,
    sweep_interval: Duration,

    total_created: Arc<AtomicU64>,
    total_removed: Arc<AtomicU64>,
}

impl<K, T> PipelineRegistry<K, T>
where
    K: Eq + Hash + Clone + fmt::Debug + Send + Sync + 'static,
    T: Send + 'static,
{
    /// Creates a registry with [`DEFAULT_MAX_PIPELINES`].
    ///
    /// # Errors
    ///
    /// Returns the template's validation error, so every later
    /// `get_or_create` is guaranteed to build.
    pub fn new(template: ControllerConfig) -> Result<Self, ConfigError> {
        Self::with_max_pipelines(template, DEFAULT_MAX_PIPELINES)
    }

    /// Creates a registry holding at most `max_pipelines` entries.
    pub fn with_max_pipelines(
        template: ControllerConfig,
        max_pipelines: usize,
    ) -> Result<Self, ConfigError> {
        template.validate()?;
        if max_pipelines == 0 {
            return Err(ConfigError::InvalidParameter {
                name: "max_pipelines",
                reason: "must be greater than 0",
            });
        }

        let num_shards = thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(8)
            .next_power_of_two()
            .max(2)
            .min(64);
        let initial_capacity = (max_pipelines / num_shards).clamp(4, 128) * num_shards;

        Ok(Self {
            pipelines: Arc::new(DashMap::with_capacity_and_hasher_and_shard_amount(
                initial_capacity,
                ahash::RandomState::new(),
                num_shards,
            )),
            active_count: Arc::new(AtomicUsize::new(0)),
            template,
            observer: None,
            max_pipelines,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
            total_created: Arc::new(AtomicU64::new(0)),
            total_removed: Arc::new(AtomicU64::new(0)),
        })
    }

    /// Attaches an observer shared by every pipeline created afterwards.
    pub fn with_observer(mut self, observer: EventObserver) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Sets the background sweeper interval.
    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    /// Returns the pipeline for `key`, creating it from the template if
    /// needed.
    ///
    /// Returns `None` if the registry is full even after sweeping closed
    /// pipelines.
    pub fn get_or_create(&self, key: K) -> Option<Arc<BackpressureController<T>>> {
        if let Some(pipeline) = self.pipelines.get(&key) {
            return Some(Arc::clone(pipeline.value()));
        }

        if self.active_count.load(Ordering::Acquire) >= self.max_pipelines {
            self.sweep_closed();
            if self.active_count.load(Ordering::Acquire) >= self.max_pipelines {
                warn!(?key, max = self.max_pipelines, "pipeline registry full, rejecting key");
                return None;
            }
        }

        match self.pipelines.entry(key) {
            Entry::Occupied(occupied) => Some(Arc::clone(occupied.get())),
            Entry::Vacant(vacant) => {
                let prev = self.active_count.fetch_add(1, Ordering::AcqRel);
                if prev >= self.max_pipelines {
                    self.active_count.fetch_sub(1, Ordering::AcqRel);
                    warn!(key = ?vacant.key(), "pipeline registry capacity race, rejecting key");
                    return None;
                }

                let pipeline = match BackpressureController::from_parts(
                    self.template.clone(),
                    self.observer.clone(),
                ) {
                    Ok(pipeline) => Arc::new(pipeline),
                    Err(err) => {
                        self.active_count.fetch_sub(1, Ordering::AcqRel);
                        warn!(%err, "pipeline template rejected");
                        return None;
                    }
                };

                debug!(key = ?vacant.key(), total = prev + 1, "created pipeline");
                vacant.insert(Arc::clone(&pipeline));
                self.total_created.fetch_add(1, Ordering::Relaxed);
                Some(pipeline)
            }
        }
    }

    /// Returns the pipeline for `key` if it exists.
    pub fn get(&self, key: &K) -> Option<Arc<BackpressureController<T>>> {
        self.pipelines.get(key).map(|p| Arc::clone(p.value()))
    }

    /// Removes the pipeline for `key` without closing it.
    pub fn remove(&self, key: &K) -> Option<Arc<BackpressureController<T>>> {
        let (_, pipeline) = self.pipelines.remove(key)?;
        self.active_count.fetch_sub(1, Ordering::AcqRel);
        self.total_removed.fetch_add(1, Ordering::Relaxed);
        Some(pipeline)
    }

    /// Calls [`close`](BackpressureController::close) on every pipeline.
    ///
    /// Pipelines stay registered until they drain and are swept.
    pub fn close_all(&self) {
        for pipeline in self.pipelines.iter() {
            pipeline.value().close();
        }
        info!(pipelines = self.pipelines.len(), "closed all pipelines");
    }

    /// Removes every pipeline that reached `Closed`. Returns how many were
    /// removed.
    pub fn sweep_closed(&self) -> usize {
        let mut removed = 0;
        self.pipelines.retain(|key, pipeline| {
            if pipeline.is_closed() {
                debug!(?key, "sweeping closed pipeline");
                removed += 1;
                false
            } else {
                true
            }
        });

        if removed > 0 {
            self.active_count.fetch_sub(removed, Ordering::AcqRel);
            self.total_removed.fetch_add(removed as u64, Ordering::Relaxed);
            debug!(removed, "swept closed pipelines");
        }
        removed
    }

    /// Number of registered pipelines.
    #[inline]
    pub fn active_pipelines(&self) -> usize {
        self.active_count.load(Ordering::Acquire)
    }

    /// Returns true if no pipeline is registered.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.active_pipelines() == 0
    }

    /// Keys of all registered pipelines, in no particular order.
    pub fn keys(&self) -> Vec<K> {
        self.pipelines.iter().map(|p| p.key().clone()).collect()
    }

    /// Aggregated statistics over every registered pipeline.
    ///
    /// ```rust
    /// use floodgate::{ControllerConfig, PipelineRegistry};
    ///
    /// let registry = PipelineRegistry::<u32, u64>::new(ControllerConfig::default())?;
    /// registry.get_or_create(1).unwrap().send(10)?;
    ///
    /// let stats = registry.stats();
    /// assert_eq!(stats.buffered_items, 1);
    /// println!("{}", stats.summary());
    /// # Ok::<(), Box<dyn std::error::Error>>(())
    /// ```
    pub fn stats(&self) -> RegistryStats {
        let mut stats = RegistryStats {
            active_pipelines: self.active_pipelines(),
            closed_pipelines: 0,
            total_created: self.total_created.load(Ordering::Relaxed),
            total_removed: self.total_removed.load(Ordering::Relaxed),
            capacity_used: self.active_pipelines() as f64 / self.max_pipelines as f64,
            max_pipelines: self.max_pipelines,
            buffered_items: 0,
            dropped_items: 0,
            backpressure_events: 0,
        };
        for pipeline in self.pipelines.iter() {
            let metrics = pipeline.value().metrics();
            if pipeline.value().is_closed() {
                stats.closed_pipelines += 1;
            }
            stats.buffered_items += metrics.current_depth as u64;
            stats.dropped_items += metrics.dropped_count;
            stats.backpressure_events += metrics.backpressure_events;
        }
        stats
    }

    /// Starts a background thread that sweeps closed pipelines every
    /// sweep interval until a message is sent on the returned channel or
    /// the sender is dropped.
    ///
    /// ```rust
    /// use floodgate::{ControllerConfig, PipelineRegistry};
    /// use std::sync::Arc;
    /// use std::time::Duration;
    ///
    /// let registry = Arc::new(
    ///     PipelineRegistry::<u32, u32>::new(ControllerConfig::default())?
    ///         .with_sweep_interval(Duration::from_millis(10)),
    /// );
    /// let (handle, stop_tx) = Arc::clone(&registry).start_stoppable_sweeper()?;
    ///
    /// stop_tx.send(()).unwrap();
    /// handle.join().unwrap();
    /// # Ok::<(), Box<dyn std::error::Error>>(())
    /// ```
    pub fn start_stoppable_sweeper(
        self: Arc<Self>,
    ) -> io::Result<(thread::JoinHandle<()>, mpsc::Sender<()>)> {
        let (stop_tx, stop_rx) = mpsc::channel();
        let registry = self;

        let handle = thread::Builder::new()
            .name("floodgate-sweeper".to_string())
            .spawn(move || {
                info!(interval = ?registry.sweep_interval, "started pipeline sweeper");
                loop {
                    match stop_rx.recv_timeout(registry.sweep_interval) {
                        Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => {
                            info!("pipeline sweeper stopping");
                            break;
                        }
                        Err(mpsc::RecvTimeoutError::Timeout) => {
                            registry.sweep_closed();
                            let stats = registry.stats();
                            if stats.is_near_capacity() {
                                warn!(
                                    active = stats.active_pipelines,
                                    max = stats.max_pipelines,
                                    "pipeline registry near capacity"
                                );
                            }
                        }
                    }
                }
            })?;

        Ok((handle, stop_tx))
    }

    /// Removes every pipeline, closing each one first.
    pub fn clear(&self) {
        let count = self.pipelines.len();
        for pipeline in self.pipelines.iter() {
            pipeline.value().close();
        }
        self.pipelines.clear();
        self.active_count.store(0, Ordering::Release);
        self.total_removed.fetch_add(count as u64, Ordering::Relaxed);
        info!(count, "cleared all pipelines");
    }
}

impl<K, T> Clone for PipelineRegistry<K, T> {
    fn clone(&self) -> Self {
        Self {
            pipelines: Arc::clone(&self.pipelines),
            active_count: Arc::clone(&self.active_count),
            template: self.template.clone(),
            observer: self.observer.clone(),
            max_pipelines: self.max_pipelines,
            sweep_interval: self.sweep_interval,
            total_created: Arc::clone(&self.total_created),
            total_removed: Arc::clone(&self.total_removed),
        }
    }
}

impl<K, T> fmt::Debug for PipelineRegistry<K, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineRegistry")
            .field("active_pipelines", &self.active_count.load(Ordering::Acquire))
            .field("max_pipelines", &self.max_pipelines)
            .field("template", &self.template)
            .field("sweep_interval", &self.sweep_interval)
            .finish()
    }
}

/// Statistics for a [`PipelineRegistry`].
#[derive(Debug, Clone, PartialEq)]
pub struct RegistryStats {
    /// Currently registered pipelines.
    pub active_pipelines: usize,

    /// Registered pipelines that are closed but not yet swept.
    pub closed_pipelines: usize,

    /// Pipelines created since startup.
    pub total_created: u64,

    /// Pipelines removed, swept or cleared since startup.
    pub total_removed: u64,

    /// Fraction of `max_pipelines` in use (0.0 to 1.0).
    pub capacity_used: f64,

    /// Maximum number of pipelines.
    pub max_pipelines: usize,

    /// Items buffered across all registered pipelines.
    pub buffered_items: u64,

    /// Items dropped across all registered pipelines.
    pub dropped_items: u64,

    /// Backpressure events across all registered pipelines.
    pub backpressure_events: u64,
}

impl RegistryStats {
    /// Returns a human-readable summary of the statistics.
    pub fn summary(&self) -> String {
        format!(
            "Pipeline Registry Stats:\n\
             ├─ Capacity:\n\
             │  ├─ Active Pipelines: {}/{}\n\
             │  ├─ Capacity Used: {:.2}%\n\
             │  └─ Closed (unswept): {}\n\
             ├─ Traffic:\n\
             │  ├─ Buffered Items: {}\n\
             │  ├─ Dropped Items: {}\n\
             │  └─ Backpressure Events: {}\n\
             └─ Lifetime:\n\
                ├─ Total Created: {}\n\
                └─ Total Removed: {}",
            self.active_pipelines,
            self.max_pipelines,
            self.capacity_used * 100.0,
            self.closed_pipelines,
            self.buffered_items,
            self.dropped_items,
            self.backpressure_events,
            self.total_created,
            self.total_removed,
        )
    }

    /// Returns true if more than 80% of the capacity is in use.
    pub fn is_near_capacity(&self) -> bool {
        self.capacity_used > 0.8
    }
}

impl fmt::Display for RegistryStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.summary())
    }
}
