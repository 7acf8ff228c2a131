//! # Utility Functions (utils.rs)
//!
//! Time helpers and cache-line padding shared by the controller and its
//! metrics.
//!
//! ## Cache Line Sizes
//!
//! ```text
//!     x86_64 (Intel/AMD):   64 bytes
//!     AArch64 (ARM):       128 bytes
//!     Generic (fallback):   64 bytes (assumed)
//! ```

use std::ops::Deref;
use std::sync::OnceLock;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

/// Cache line size for x86_64 processors.
#[cfg(target_arch = "x86_64")]
pub const CACHE_LINE_SIZE: usize = 64;

/// Cache line size for ARM64 processors.
///
/// Many ARM cores prefetch in pairs of 64-byte lines, so padding to 128
/// bytes keeps neighbouring counters apart.
#[cfg(target_arch = "aarch64")]
pub const CACHE_LINE_SIZE: usize = 128;

/// Default cache line size for other architectures.
#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
pub const CACHE_LINE_SIZE: usize = 64;

// Wall-clock epoch captured once, advanced with a monotonic Instant so event
// timestamps never go backwards when the system clock is adjusted.
static START_TIME_BASE: OnceLock<(Instant, u64)> = OnceLock::new();

fn time_base() -> &'static (Instant, u64) {
    START_TIME_BASE.get_or_init(|| {
        let epoch_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;
        (Instant::now(), epoch_ms)
    })
}

/// Returns the current time in milliseconds since UNIX epoch.
///
/// Monotonic within a process: the epoch offset is sampled once and then
/// advanced with [`Instant`].
///
/// # Example
///
/// ```rust
/// use floodgate::current_time_ms;
///
/// let a = current_time_ms();
/// let b = current_time_ms();
/// assert!(b >= a);
/// ```
#[inline(always)]
pub fn current_time_ms() -> u64 {
    let (start, base_ms) = time_base();
    base_ms.saturating_add(start.elapsed().as_millis() as u64)
}

/// Cache-aligned wrapper for values to prevent false sharing.
///
/// ```text
///     Without alignment:
///     ┌──────────────────────────────┐
///     │ produced │ consumed │ dropped │ ← one line, every write invalidates all
///     └──────────────────────────────┘
///
///     With alignment:
///     ┌──────────┐┌──────────┐┌──────────┐
///     │ produced ││ consumed ││ dropped  │ ← own lines
///     └──────────┘└──────────┘└──────────┘
/// ```
#[cfg_attr(target_arch = "aarch64", repr(C, align(128)))]
#[cfg_attr(not(target_arch = "aarch64"), repr(C, align(64)))]
pub(crate) struct CacheAligned<T> {
    pub(crate) value: T,
}

impl<T> CacheAligned<T> {
    /// Creates a new cache-aligned value.
    #[inline(always)]
    pub(crate) const fn new(value: T) -> Self {
        Self { value }
    }
}

impl<T> Deref for CacheAligned<T> {
    type Target = T;

    #[inline(always)]
    fn deref(&self) -> &T {
        &self.value
    }
}

impl<T: Default> Default for CacheAligned<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for CacheAligned<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.value.fmt(f)
    }
}
