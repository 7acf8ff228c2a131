//! # Rate Controllers
//!
//! Admission control for the adaptive strategy. A rate controller is fed the
//! buffer's depth ratio (`depth / capacity`) and answers whether the next
//! item may enter now, later, or not at all.
//!
//! ```text
//!     send(item)
//!        │
//!        ▼
//!     sample(depth_ratio, now) ──► Accept      → go to the buffer
//!                              ──► Delay(d)    → retry after d
//!                              ──► Reject      → RateLimited
//! ```
//!
//! Three algorithms are provided:
//!
//! | Controller      | State                         | Reacts to            |
//! |-----------------|-------------------------------|----------------------|
//! | [`Aimd`]        | rate, last accept/increase    | full buffer, low fill|
//! | [`TokenBucket`] | tokens, refill rate, streak   | elapsed time         |
//! | [`SlidingWindow`]| (instant, count) samples     | accepted throughput  |
//!
//! Every controller keeps its reported rate within the configured
//! `[min_rate, max_rate]`. A depth ratio exactly at a threshold counts as
//! above it.

use super::config::{AimdConfig, RateConfig, SlidingWindowConfig, TokenBucketConfig};
use std::collections::VecDeque;
use std::fmt;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Consecutive full-buffer signals after which a token bucket slows its
/// refill.
pub const PRESSURE_STREAK_THRESHOLD: u32 = 10;

/// Fraction of the nominal refill rate used under sustained pressure.
pub const PRESSURE_REFILL_FACTOR: f64 = 0.8;

/// Depth ratio below which a token bucket considers pressure relieved.
pub const LOW_PRESSURE_RATIO: f64 = 0.5;

/// Outcome of asking a rate controller about one item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    /// The item may proceed now.
    Accept,
    /// The item could be admitted after waiting this long.
    Delay(Duration),
    /// The controller is stalled and admits nothing.
    Reject,
}

impl RateDecision {
    /// Returns true for [`RateDecision::Accept`].
    #[inline]
    pub fn is_accept(&self) -> bool {
        matches!(self, Self::Accept)
    }
}

/// Algorithm deciding whether producers may proceed.
///
/// Implementations own their state exclusively; the controller serializes
/// access behind a mutex. Time is passed in so the algorithms stay
/// deterministic under test.
pub trait RateController: Send + fmt::Debug {
    /// Feeds `depth_ratio` back, then decides on one item.
    fn sample(&mut self, depth_ratio: f64, now: Instant) -> RateDecision {
        self.observe(depth_ratio, now);
        self.decide(depth_ratio, now)
    }

    /// Decides on one item without treating `depth_ratio` as new feedback.
    /// An `Accept` consumes whatever budget the item needs.
    ///
    /// Used when re-asking after a delay, so one full-buffer signal is
    /// applied once.
    fn decide(&mut self, depth_ratio: f64, now: Instant) -> RateDecision;

    /// Feedback without a decision, e.g. a full buffer seen under a
    /// non-adaptive strategy.
    fn observe(&mut self, depth_ratio: f64, now: Instant);

    /// Currently permitted rate in items per second.
    fn current_rate(&self) -> f64;

    /// Short algorithm name for logs.
    fn name(&self) -> &'static str;
}

impl RateConfig {
    /// Builds the configured controller, starting its clock at `now`.
    ///
    /// The config is expected to have passed [`RateConfig::validate`].
    pub fn build(&self, now: Instant) -> Box<dyn RateController> {
        match self {
            Self::Aimd(c) => Box::new(Aimd::new(c)),
            Self::TokenBucket(c) => Box::new(TokenBucket::new(c, now)),
            Self::SlidingWindow(c) => Box::new(SlidingWindow::new(c)),
        }
    }
}

/// Converts seconds into a delay rounded up to the microsecond, so waiting
/// it out always earns the budget. Non-finite or oversized values mean the
/// item can never be admitted at the current rate.
#[inline]
fn delay_secs(secs: f64) -> Option<Duration> {
    let micros = (secs.max(0.0) * 1e6).ceil();
    if micros.is_finite() && micros < u64::MAX as f64 {
        Some(Duration::from_micros(micros as u64))
    } else {
        None
    }
}

// ============================================================================
// AIMD
// ============================================================================

/// Additive-increase / multiplicative-decrease pacing.
///
/// Items are spaced `1 / rate` seconds apart. A full buffer multiplies the
/// rate by `decrease_factor`; an accept while the buffer is below the low
/// watermark adds `additive_increase`, at most once per `increase_interval`.
///
/// ```text
///     depth_ratio >= 1.0  →  rate = max(rate × factor, min_rate)
///     accept, ratio < low →  rate = min(rate + step, max_rate)
/// ```
///
/// A rate of zero (reachable only with `min_rate == 0`) rejects every item.
/// While stalled, a low-pressure sample probes the rate upward once per
/// `increase_interval` so the pipeline can recover.
#[derive(Debug, Clone)]
pub struct Aimd {
    rate: f64,
    min_rate: f64,
    max_rate: f64,
    additive_increase: f64,
    decrease_factor: f64,
    low_watermark: f64,
    increase_interval: Duration,
    last_accept: Option<Instant>,
    last_increase: Option<Instant>,
}

impl Aimd {
    /// Creates a controller at `config.initial_rate`.
    pub fn new(config: &AimdConfig) -> Self {
        Self {
            rate: config.initial_rate.clamp(config.min_rate, config.max_rate),
            min_rate: config.min_rate,
            max_rate: config.max_rate,
            additive_increase: config.additive_increase,
            decrease_factor: config.decrease_factor,
            low_watermark: config.low_watermark,
            increase_interval: config.increase_interval,
            last_accept: None,
            last_increase: None,
        }
    }

    fn increase_due(&self, now: Instant) -> bool {
        self.last_increase
            .map_or(true, |t| now.saturating_duration_since(t) >= self.increase_interval)
    }

    fn increase(&mut self, now: Instant) {
        let next = (self.rate + self.additive_increase).min(self.max_rate);
        if next > self.rate {
            debug!(from = self.rate, to = next, "aimd rate increased");
            self.rate = next;
        }
        self.last_increase = Some(now);
    }
}

impl RateController for Aimd {
    fn decide(&mut self, depth_ratio: f64, now: Instant) -> RateDecision {
        if self.rate <= 0.0 {
            if depth_ratio < self.low_watermark && self.increase_due(now) {
                self.increase(now);
            }
            return RateDecision::Reject;
        }

        let Some(interval) = delay_secs(1.0 / self.rate) else {
            return RateDecision::Reject;
        };
        if let Some(last) = self.last_accept {
            let elapsed = now.saturating_duration_since(last);
            if elapsed < interval {
                return RateDecision::Delay(interval - elapsed);
            }
        }

        self.last_accept = Some(now);
        if depth_ratio < self.low_watermark && self.increase_due(now) {
            self.increase(now);
        }
        RateDecision::Accept
    }

    fn observe(&mut self, depth_ratio: f64, _now: Instant) {
        if depth_ratio >= 1.0 {
            let next = (self.rate * self.decrease_factor).max(self.min_rate);
            if next < self.rate {
                debug!(from = self.rate, to = next, "aimd rate decreased");
                if next <= 0.0 {
                    warn!("aimd rate reached zero, producers stalled");
                }
                self.rate = next;
            }
        }
    }

    fn current_rate(&self) -> f64 {
        self.rate
    }

    fn name(&self) -> &'static str {
        "aimd"
    }
}

// ============================================================================
// Token Bucket
// ============================================================================

/// Token bucket with burst capacity and adaptive refill.
///
/// ```text
///     ┌─────────────┐
///     │ ● ● ● ● ●   │ ← capacity (burst)
///     │             │
///     └──────┬──────┘
///            │ refill_rate tokens/s
///            ▼
///     one token per accepted item
/// ```
///
/// More than [`PRESSURE_STREAK_THRESHOLD`] consecutive full-buffer signals
/// cut the effective refill rate to [`PRESSURE_REFILL_FACTOR`] of nominal
/// (never below `min_rate`). A sample below [`LOW_PRESSURE_RATIO`] restores
/// it.
#[derive(Debug, Clone)]
pub struct TokenBucket {
    capacity: f64,
    tokens: f64,
    nominal_refill: f64,
    effective_refill: f64,
    min_rate: f64,
    max_rate: f64,
    last_refill: Instant,
    pressure_streak: u32,
}

impl TokenBucket {
    /// Creates a full bucket whose clock starts at `now`.
    pub fn new(config: &TokenBucketConfig, now: Instant) -> Self {
        let refill = config.refill_rate.clamp(config.min_rate, config.max_rate);
        Self {
            capacity: config.capacity,
            tokens: config.capacity,
            nominal_refill: refill,
            effective_refill: refill,
            min_rate: config.min_rate,
            max_rate: config.max_rate,
            last_refill: now,
            pressure_streak: 0,
        }
    }

    /// Tokens currently available, as of the last refill.
    pub fn available_tokens(&self) -> f64 {
        self.tokens
    }

    /// Returns true while the refill rate is reduced.
    pub fn is_throttled(&self) -> bool {
        self.effective_refill < self.nominal_refill
    }

    fn refill(&mut self, now: Instant) {
        if now <= self.last_refill {
            return;
        }
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.effective_refill).min(self.capacity);
        self.last_refill = now;
    }
}

impl RateController for TokenBucket {
    fn decide(&mut self, _depth_ratio: f64, now: Instant) -> RateDecision {
        self.refill(now);

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            return RateDecision::Accept;
        }
        if self.effective_refill <= 0.0 {
            return RateDecision::Reject;
        }
        match delay_secs((1.0 - self.tokens) / self.effective_refill) {
            Some(delay) => RateDecision::Delay(delay),
            None => RateDecision::Reject,
        }
    }

    fn observe(&mut self, depth_ratio: f64, now: Instant) {
        // Settle tokens earned at the old rate before changing it.
        self.refill(now);

        if depth_ratio >= 1.0 {
            self.pressure_streak = self.pressure_streak.saturating_add(1);
            if self.pressure_streak > PRESSURE_STREAK_THRESHOLD && !self.is_throttled() {
                let reduced = (self.nominal_refill * PRESSURE_REFILL_FACTOR)
                    .max(self.min_rate)
                    .min(self.max_rate);
                if reduced < self.effective_refill {
                    info!(
                        nominal = self.nominal_refill,
                        reduced, "token bucket refill reduced under sustained pressure"
                    );
                    self.effective_refill = reduced;
                }
            }
        } else {
            self.pressure_streak = 0;
            if depth_ratio < LOW_PRESSURE_RATIO && self.is_throttled() {
                info!(rate = self.nominal_refill, "token bucket refill restored");
                self.effective_refill = self.nominal_refill;
            }
        }
    }

    fn current_rate(&self) -> f64 {
        self.effective_refill.clamp(self.min_rate, self.max_rate)
    }

    fn name(&self) -> &'static str {
        "token_bucket"
    }
}

// ============================================================================
// Sliding Window
// ============================================================================

/// Caps accepted throughput averaged over a moving window.
///
/// ```text
///     now - window                     now
///         │◄──────── window ──────────►│
///     ────┼──●───●●──●────●───●●───────┼──►
///         │  accepted samples          │
///
///     observed = count / window
///     observed < target → Accept
///     otherwise         → Delay(oldest + window - now)
/// ```
///
/// Samples taken at the same instant share one entry, and the window never
/// holds more than `target_rate * window + 1` items worth of entries.
#[derive(Debug, Clone)]
pub struct SlidingWindow {
    target_rate: f64,
    window: Duration,
    min_rate: f64,
    max_rate: f64,
    samples: VecDeque<(Instant, u64)>,
    count: u64,
}

impl SlidingWindow {
    /// Creates an empty window.
    pub fn new(config: &SlidingWindowConfig) -> Self {
        Self {
            target_rate: config.target_rate,
            window: config.window,
            min_rate: config.min_rate,
            max_rate: config.max_rate,
            samples: VecDeque::new(),
            count: 0,
        }
    }

    /// Accepted items per second over the window ending at `now`.
    pub fn observed_rate(&self, now: Instant) -> f64 {
        let cutoff = now.checked_sub(self.window);
        let in_window: u64 = self
            .samples
            .iter()
            .filter(|(t, _)| cutoff.map_or(true, |c| *t > c))
            .map(|(_, n)| *n)
            .sum();
        in_window as f64 / self.window.as_secs_f64()
    }

    /// Number of distinct sample entries currently held.
    pub fn sample_entries(&self) -> usize {
        self.samples.len()
    }

    fn prune(&mut self, now: Instant) {
        let Some(cutoff) = now.checked_sub(self.window) else {
            return;
        };
        // A sample exactly one window old has expired, so a delay computed
        // from the oldest survivor is always positive.
        while let Some(&(t, n)) = self.samples.front() {
            if t > cutoff {
                break;
            }
            self.samples.pop_front();
            self.count -= n;
        }
    }

    fn record(&mut self, now: Instant) {
        match self.samples.back_mut() {
            Some((t, n)) if *t == now => *n += 1,
            _ => self.samples.push_back((now, 1)),
        }
        self.count += 1;
    }
}

impl RateController for SlidingWindow {
    fn decide(&mut self, _depth_ratio: f64, now: Instant) -> RateDecision {
        self.prune(now);

        let observed = self.count as f64 / self.window.as_secs_f64();
        if observed < self.target_rate {
            self.record(now);
            return RateDecision::Accept;
        }

        match self.samples.front() {
            Some(&(oldest, _)) => {
                RateDecision::Delay((oldest + self.window).saturating_duration_since(now))
            }
            // Unreachable with a positive target; nothing to wait for.
            None => RateDecision::Reject,
        }
    }

    fn observe(&mut self, _depth_ratio: f64, now: Instant) {
        self.prune(now);
    }

    fn current_rate(&self) -> f64 {
        self.target_rate.clamp(self.min_rate, self.max_rate)
    }

    fn name(&self) -> &'static str {
        "sliding_window"
    }
}
