// Copyright 2026 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Counters describing the activity of one ITS.
//!
//! Each controller owns an [`ItsMetrics`] instance. Flushing a snapshot with
//! [`ItsMetrics::write`] emits a single JSON line and resets the per-flush deltas, the same
//! way every [`SharedIncMetric`] serializes.

use std::io::Write;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Serialize, Serializer};

/// Errors related to flushing metrics.
#[derive(Debug, thiserror::Error, displaydoc::Display)]
pub enum MetricsError {
    /// Cannot serialize metrics: {0}
    Serde(String),
    /// Failed to write metrics: {0}
    Write(std::io::Error),
}

/// Used for defining new types of metrics that act as a counter (i.e they are continuously
/// updated by incrementing their value).
pub trait IncMetric {
    /// Adds `value` to the current counter.
    fn add(&self, value: u64);
    /// Increments by 1 unit the current counter.
    fn inc(&self) {
        self.add(1);
    }
    /// Returns current value of the counter.
    fn count(&self) -> u64;
    /// Returns diff of current and old value of the counter.
    fn fetch_diff(&self) -> u64;
}

/// Representation of a metric that is expected to be incremented from more than one thread.
// 1st member - current value being updated
// 2nd member - old value that gets the current value whenever metrics are flushed
#[derive(Debug, Default)]
pub struct SharedIncMetric(AtomicU64, AtomicU64);

impl SharedIncMetric {
    /// Const default construction.
    pub const fn new() -> Self {
        Self(AtomicU64::new(0), AtomicU64::new(0))
    }
}

impl IncMetric for SharedIncMetric {
    fn add(&self, value: u64) {
        self.0.fetch_add(value, Ordering::Relaxed);
    }

    fn count(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }

    fn fetch_diff(&self) -> u64 {
        self.0.load(Ordering::Relaxed) - self.1.load(Ordering::Relaxed)
    }
}

impl Serialize for SharedIncMetric {
    /// Serializing a counter emits the delta since the previous flush and resets it.
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let snapshot = self.0.load(Ordering::Relaxed);
        let res = serializer.serialize_u64(snapshot - self.1.load(Ordering::Relaxed));

        if res.is_ok() {
            self.1.store(snapshot, Ordering::Relaxed);
        }
        res
    }
}

/// Activity counters of a single ITS.
#[derive(Debug, Default, Serialize)]
pub struct ItsMetrics {
    /// Commands posted to the command queue, not counting the SYNC/VSYNC that follow them.
    pub commands_sent: SharedIncMetric,
    /// SYNC and VSYNC commands appended after another command.
    pub syncs_sent: SharedIncMetric,
    /// Enqueue attempts that found the command queue full and had to wait.
    pub queue_full_waits: SharedIncMetric,
    /// Enqueue attempts abandoned because the queue never drained.
    pub queue_stalls: SharedIncMetric,
    /// Completion waits that timed out.
    pub completion_timeouts: SharedIncMetric,
    /// Devices mapped with MAPD.
    pub devices_created: SharedIncMetric,
    /// Devices unmapped and released.
    pub devices_freed: SharedIncMetric,
    /// Second-level table pages published.
    pub table_pages: SharedIncMetric,
    /// VMOVP commands sent.
    pub vmovp_sent: SharedIncMetric,
    /// Doorbell proxy slots taken over from another VPE.
    pub proxy_evictions: SharedIncMetric,
}

impl ItsMetrics {
    /// Default constructor.
    pub const fn new() -> Self {
        Self {
            commands_sent: SharedIncMetric::new(),
            syncs_sent: SharedIncMetric::new(),
            queue_full_waits: SharedIncMetric::new(),
            queue_stalls: SharedIncMetric::new(),
            completion_timeouts: SharedIncMetric::new(),
            devices_created: SharedIncMetric::new(),
            devices_freed: SharedIncMetric::new(),
            table_pages: SharedIncMetric::new(),
            vmovp_sent: SharedIncMetric::new(),
            proxy_evictions: SharedIncMetric::new(),
        }
    }

    /// Writes the counters as one JSON line to `dest`.
    ///
    /// Any print of the metrics also resets their deltas.
    pub fn write<W: Write>(&self, dest: &mut W) -> Result<(), MetricsError> {
        let msg = serde_json::to_string(self).map_err(|err| MetricsError::Serde(err.to_string()))?;
        dest.write_all(format!("{msg}\n").as_bytes()).map_err(MetricsError::Write)
    }
}
