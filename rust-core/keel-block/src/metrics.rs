// SPDX-License-Identifier: PMPL-1.0-or-later
//
// Metrics-collecting wrapper for block devices.
// Copyright (c) 2026 Keel contributors
//
// Wraps any `BlockDevice` and transparently counts reads, writes and flush
// barriers together with byte totals and cumulative latency. The journal's
// benchmarks and the CLI `stat` command use it to report how many barriers a
// workload cost.

use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use serde::Serialize;

use crate::device::BlockDevice;
use crate::error::DeviceResult;

/// Accumulated statistics for a block device.
///
/// All counters are monotonically increasing for the lifetime of the
/// [`MetricsDevice`] that owns them, until [`MetricsDevice::reset_stats`].
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DeviceStats {
    /// Number of `read_block` calls.
    pub read_count: u64,
    /// Number of `write_block` calls.
    pub write_count: u64,
    /// Number of `flush` barriers.
    pub flush_count: u64,
    /// Number of calls that returned an error.
    pub error_count: u64,
    /// Total bytes read.
    pub bytes_read: u64,
    /// Total bytes written.
    pub bytes_written: u64,
    /// Cumulative wall-clock latency of all `flush` calls, in milliseconds.
    pub flush_latency_sum_ms: f64,
}

/// A block device wrapper that collects operation metrics.
///
/// # Example
///
/// ```rust
/// use keel_block::{BlockDevice, MemoryDevice, MetricsDevice};
///
/// let metered = MetricsDevice::new(MemoryDevice::new(512, 8).unwrap());
/// metered.write_block(1, &[1u8; 512]).unwrap();
/// metered.flush().unwrap();
///
/// let stats = metered.stats();
/// assert_eq!(stats.write_count, 1);
/// assert_eq!(stats.flush_count, 1);
/// ```
#[derive(Debug)]
pub struct MetricsDevice<D: BlockDevice> {
    /// The wrapped device that performs the actual I/O.
    inner: D,
    /// Shared, mutable statistics accumulator.
    stats: Arc<Mutex<DeviceStats>>,
}

impl<D: BlockDevice> MetricsDevice<D> {
    /// Wrap `inner` with metrics collection.
    pub fn new(inner: D) -> Self {
        Self {
            inner,
            stats: Arc::new(Mutex::new(DeviceStats::default())),
        }
    }

    /// Return a snapshot of the current statistics.
    pub fn stats(&self) -> DeviceStats {
        self.stats.lock().clone()
    }

    /// Reset all statistics to zero.
    pub fn reset_stats(&self) {
        *self.stats.lock() = DeviceStats::default();
    }

    /// Return a reference to the inner device.
    pub fn inner(&self) -> &D {
        &self.inner
    }
}

impl<D: BlockDevice> BlockDevice for MetricsDevice<D> {
    fn read_block(&self, block: u64, buf: &mut [u8]) -> DeviceResult<()> {
        let result = self.inner.read_block(block, buf);
        let mut stats = self.stats.lock();
        stats.read_count += 1;
        match result {
            Ok(()) => stats.bytes_read += buf.len() as u64,
            Err(_) => stats.error_count += 1,
        }
        result
    }

    fn write_block(&self, block: u64, data: &[u8]) -> DeviceResult<()> {
        let result = self.inner.write_block(block, data);
        let mut stats = self.stats.lock();
        stats.write_count += 1;
        match result {
            Ok(()) => stats.bytes_written += data.len() as u64,
            Err(_) => stats.error_count += 1,
        }
        result
    }

    fn flush(&self) -> DeviceResult<()> {
        let start = Instant::now();
        let result = self.inner.flush();
        let elapsed_ms = start.elapsed().as_secs_f64() * 1000.0;

        let mut stats = self.stats.lock();
        stats.flush_count += 1;
        stats.flush_latency_sum_ms += elapsed_ms;
        if result.is_err() {
            stats.error_count += 1;
        }
        result
    }

    fn block_size(&self) -> usize {
        self.inner.block_size()
    }

    fn block_count(&self) -> u64 {
        self.inner.block_count()
    }

    fn name(&self) -> &str {
        self.inner.name()
    }
}
