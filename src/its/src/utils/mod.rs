// Copyright 2026 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Small helpers shared by the ITS modules.

use std::time::Duration;

/// 4 KiB.
pub const SZ_4K: usize = 0x1000;
/// 16 KiB.
pub const SZ_16K: usize = 0x4000;
/// 64 KiB.
pub const SZ_64K: usize = 0x1_0000;

/// Condition not met after {iterations} polls
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error, displaydoc::Display)]
pub struct Timeout {
    /// Number of polls performed.
    pub iterations: u32,
}

/// Bounded polling parameters: how many times to check and how long to wait in between.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    /// Maximum number of checks.
    pub max_iters: u32,
    /// Delay between two checks.
    pub delay: Duration,
}

impl Backoff {
    /// Polls `op` until it yields a value or the iteration budget is spent.
    pub fn retry<T, F>(&self, op: F) -> Result<T, Timeout>
    where
        F: FnMut() -> Option<T>,
    {
        retry_with_backoff(self.max_iters, self.delay, op)
    }
}

impl Default for Backoff {
    fn default() -> Self {
        // 1s worth of 1us delays.
        Backoff {
            max_iters: 1_000_000,
            delay: Duration::from_micros(1),
        }
    }
}

/// Calls `op` up to `max_iters` times (at least once), sleeping `delay` between two calls,
/// and returns the first `Some` it produces.
pub fn retry_with_backoff<T, F>(max_iters: u32, delay: Duration, mut op: F) -> Result<T, Timeout>
where
    F: FnMut() -> Option<T>,
{
    let iterations = max_iters.max(1);
    for attempt in 0..iterations {
        if let Some(val) = op() {
            return Ok(val);
        }
        if attempt + 1 == iterations {
            break;
        }
        if delay.is_zero() {
            std::hint::spin_loop();
        } else {
            std::thread::sleep(delay);
        }
    }
    Err(Timeout { iterations })
}

/// Safely converts a u64 value to a usize value.
/// This bypasses the Clippy lint check because we only support 64-bit platforms.
#[cfg(target_pointer_width = "64")]
#[inline]
#[allow(clippy::cast_possible_truncation)]
pub const fn u64_to_usize(num: u64) -> usize {
    num as usize
}

/// Safely converts a usize value to a u64 value.
/// This bypasses the Clippy lint check because we only support 64-bit platforms.
#[cfg(target_pointer_width = "64")]
#[inline]
#[allow(clippy::cast_possible_truncation)]
pub const fn usize_to_u64(num: usize) -> u64 {
    num as u64
}

/// Rounds `val` up to the next multiple of `align`, which must be a power of two.
#[inline]
pub const fn align_up(val: usize, align: usize) -> usize {
    (val + align - 1) & !(align - 1)
}

/// Builds a mask covering bits `low..=high`.
#[inline]
pub const fn genmask(high: u32, low: u32) -> u64 {
    (u64::MAX >> (63 - high)) & (u64::MAX << low)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_succeeds_eventually() {
        let mut calls = 0;
        let res = retry_with_backoff(10, Duration::ZERO, || {
            calls += 1;
            (calls == 3).then_some(calls)
        });
        assert_eq!(res, Ok(3));
        assert_eq!(calls, 3);
    }

    #[test]
    fn test_retry_is_bounded() {
        let mut calls = 0;
        let res: Result<(), _> = retry_with_backoff(5, Duration::ZERO, || {
            calls += 1;
            None
        });
        assert_eq!(res, Err(Timeout { iterations: 5 }));
        assert_eq!(calls, 5);

        // A zero budget still checks once.
        calls = 0;
        let res: Result<(), _> = retry_with_backoff(0, Duration::ZERO, || {
            calls += 1;
            None
        });
        assert_eq!(res, Err(Timeout { iterations: 1 }));
        assert_eq!(calls, 1);
    }

    #[test]
    fn test_masks_and_alignment() {
        assert_eq!(genmask(7, 0), 0xff);
        assert_eq!(genmask(63, 32), 0xffff_ffff_0000_0000);
        assert_eq!(genmask(51, 16), 0x000f_ffff_ffff_0000);
        assert_eq!(align_up(1, 256), 256);
        assert_eq!(align_up(256, 256), 256);
        assert_eq!(align_up(257, 256), 512);
    }
}
