//! Error types for controllers, their configuration and the registry.
//!
//! Runtime failures (`Closed`, `Cancelled`, `RateLimited`, `Full`) are
//! returned to the immediate caller. Configuration failures are only produced
//! at construction time; no partially built controller ever exists.

use std::time::Duration;
use thiserror::Error;

/// Error returned by the producer side of a controller.
///
/// The item passed to the failing call is dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SendError {
    /// The controller is draining or closed and accepts no new items.
    #[error("controller is closed")]
    Closed,

    /// The call was cancelled through a token or its deadline expired.
    #[error("send was cancelled before the item was accepted")]
    Cancelled,

    /// The adaptive rate controller refused the item.
    ///
    /// `retry_after` is the controller's estimate of when a retry could be
    /// admitted, if it has one.
    #[error("rate limited{}", fmt_retry(.retry_after))]
    RateLimited {
        /// Suggested back-off before retrying.
        retry_after: Option<Duration>,
    },

    /// The buffer is full and the call was not allowed to block.
    #[error("buffer is full")]
    Full,
}

fn fmt_retry(retry_after: &Option<Duration>) -> String {
    match retry_after {
        Some(d) => format!(" (retry after {:?})", d),
        None => String::new(),
    }
}

impl SendError {
    /// Returns true for conditions that are expected under load and worth
    /// retrying after a back-off.
    ///
    /// `Closed` and `Cancelled` are terminal for the call that saw them and
    /// must not be retried blindly.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::RateLimited { .. } | Self::Full)
    }
}

/// Error returned by the blocking consumer calls that can be interrupted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RecvError {
    /// The controller is closed and no items remain.
    #[error("controller is closed and drained")]
    Closed,

    /// The call was cancelled through a token or its deadline expired.
    #[error("receive was cancelled")]
    Cancelled,
}

/// Error returned by [`try_recv`](crate::BackpressureController::try_recv).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TryRecvError {
    /// Nothing is buffered right now, but the controller is still open.
    #[error("buffer is empty")]
    Empty,

    /// The controller is closed and no items remain.
    #[error("controller is closed and drained")]
    Closed,
}

/// Invalid construction parameters.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    /// Capacity must be at least one slot.
    #[error("capacity must be greater than 0")]
    ZeroCapacity,

    /// Growing buffers need `0 < initial_capacity <= max_capacity`.
    #[error("growing buffer needs 0 < initial ({initial}) <= max ({max})")]
    InvalidGrowth {
        /// Requested starting allocation.
        initial: usize,
        /// Hard upper bound (the controller capacity).
        max: usize,
    },

    /// Rate bounds must be finite, non-negative and ordered.
    #[error("invalid rate bounds: min_rate {min} / max_rate {max}")]
    InvalidRateBounds {
        /// Configured lower bound.
        min: f64,
        /// Configured upper bound.
        max: f64,
    },

    /// A single rate-control parameter is out of range.
    #[error("invalid {name}: {reason}")]
    InvalidParameter {
        /// Parameter name as it appears in the config struct.
        name: &'static str,
        /// What is wrong with it.
        reason: &'static str,
    },

    /// The adaptive strategy was selected without a rate controller.
    #[error("adaptive strategy requires a rate configuration")]
    MissingRateConfig,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_send_error_display() {
        assert_eq!(SendError::Closed.to_string(), "controller is closed");
        assert_eq!(
            SendError::RateLimited { retry_after: None }.to_string(),
            "rate limited"
        );
        let limited = SendError::RateLimited {
            retry_after: Some(Duration::from_millis(250)),
        };
        assert!(limited.to_string().contains("250ms"));
    }

    #[test]
    fn test_retryable() {
        assert!(SendError::Full.is_retryable());
        assert!(SendError::RateLimited { retry_after: None }.is_retryable());
        assert!(!SendError::Closed.is_retryable());
        assert!(!SendError::Cancelled.is_retryable());
    }

    #[test]
    fn test_config_error_display() {
        let err = ConfigError::InvalidGrowth { initial: 0, max: 8 };
        assert!(err.to_string().contains("initial (0)"));

        let err = ConfigError::InvalidParameter {
            name: "decrease_factor",
            reason: "must be in (0, 1)",
        };
        assert_eq!(err.to_string(), "invalid decrease_factor: must be in (0, 1)");
    }
}
