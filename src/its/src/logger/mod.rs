// Copyright 2026 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Logging and metrics for the ITS driver.
//!
//! Messages go through the `log` facade; the embedding environment installs the logger.

mod metrics;

use std::sync::{LockResult, Mutex};
use std::time::{Duration, Instant};

pub use log::Level::*;
pub use log::*;

pub use crate::logger::metrics::{IncMetric, ItsMetrics, MetricsError, SharedIncMetric};

/// Default window of [`LogRateLimit`].
pub const DEFAULT_RATELIMIT_INTERVAL: Duration = Duration::from_secs(5);
/// Default number of messages let through per window.
pub const DEFAULT_RATELIMIT_BURST: u32 = 10;

pub(crate) fn extract_guard<G>(lock_result: LockResult<G>) -> G {
    match lock_result {
        Ok(guard) => guard,
        // The state behind our locks stays consistent across a panicking holder.
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[derive(Debug)]
struct RateLimitState {
    window_start: Option<Instant>,
    printed: u32,
    suppressed: u32,
}

/// Lets at most `burst` messages through per `interval`.
///
/// Used for diagnostics that can repeat in a tight loop, such as a stalled command queue.
#[derive(Debug)]
pub struct LogRateLimit {
    interval: Duration,
    burst: u32,
    state: Mutex<RateLimitState>,
}

impl LogRateLimit {
    /// Creates a limiter with the given window and burst.
    pub const fn new(interval: Duration, burst: u32) -> Self {
        LogRateLimit {
            interval,
            burst,
            state: Mutex::new(RateLimitState {
                window_start: None,
                printed: 0,
                suppressed: 0,
            }),
        }
    }

    /// Returns whether a message may be emitted now, and accounts for it.
    pub fn check(&self) -> bool {
        let mut state = extract_guard(self.state.lock());
        let now = Instant::now();
        let expired = match state.window_start {
            Some(start) => now.duration_since(start) >= self.interval,
            None => true,
        };
        if expired {
            if state.suppressed > 0 {
                warn!("{} messages suppressed", state.suppressed);
            }
            state.window_start = Some(now);
            state.printed = 0;
            state.suppressed = 0;
        }
        if state.printed < self.burst {
            state.printed += 1;
            true
        } else {
            state.suppressed += 1;
            false
        }
    }
}

impl Default for LogRateLimit {
    fn default() -> Self {
        LogRateLimit::new(DEFAULT_RATELIMIT_INTERVAL, DEFAULT_RATELIMIT_BURST)
    }
}

/// Logs an error through a [`LogRateLimit`].
#[macro_export]
macro_rules! error_ratelimited {
    ($limit:expr, $($arg:tt)+) => {
        if $limit.check() {
            $crate::logger::error!($($arg)+);
        }
    };
}
