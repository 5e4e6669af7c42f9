// SPDX-License-Identifier: PMPL-1.0-or-later
//
// In-memory block device with a crash model.
// Copyright (c) 2026 Keel contributors
//
// Keeps two images: the one reads observe and the one that has been made
// durable by `flush`. A simulated crash produces a new device from the
// durable image, optionally keeping any subset of the writes that were
// still in flight. With history recording enabled every write and flush is
// logged so a test can crash the device "at" any operation index.

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::trace;

use crate::device::{check_access, check_block_size, BlockDevice};
use crate::error::{DeviceError, DeviceResult};

/// One recorded device operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceOp {
    /// A completed block write.
    Write {
        /// Target block.
        block: u64,
        /// Bytes written.
        data: Vec<u8>,
    },
    /// A completed durability barrier.
    Flush,
}

#[derive(Debug, Default)]
struct FaultPlan {
    /// Remaining writes that succeed before every following write fails.
    writes_before_failure: Option<u64>,
    fail_next_flush: bool,
    failing_blocks: HashSet<u64>,
}

#[derive(Debug)]
struct MemoryState {
    current: Vec<u8>,
    durable: Vec<u8>,
    /// Writes issued since the last flush, in issue order.
    unflushed: Vec<(u64, Vec<u8>)>,
    /// Durable image when history recording started.
    base: Option<Vec<u8>>,
    history: Option<Vec<DeviceOp>>,
    faults: FaultPlan,
    writes: u64,
    flushes: u64,
}

/// A RAM-backed block device that can simulate power loss.
///
/// Clones share the same storage.
///
/// # Example
///
/// ```rust
/// use keel_block::{BlockDevice, MemoryDevice};
///
/// let device = MemoryDevice::new(512, 16).unwrap();
/// device.write_block(3, &[7u8; 512]).unwrap();
///
/// // Not flushed: lost in a crash.
/// assert_eq!(device.crash().read_block_vec(3).unwrap(), vec![0u8; 512]);
///
/// device.flush().unwrap();
/// assert_eq!(device.crash().read_block_vec(3).unwrap(), vec![7u8; 512]);
/// ```
#[derive(Debug, Clone)]
pub struct MemoryDevice {
    state: Arc<Mutex<MemoryState>>,
    block_size: usize,
    block_count: u64,
}

impl MemoryDevice {
    /// Create a zero-filled device.
    pub fn new(block_size: usize, block_count: u64) -> DeviceResult<Self> {
        check_block_size(block_size)?;
        let len = usize::try_from(block_count)
            .ok()
            .and_then(|count| count.checked_mul(block_size))
            .ok_or_else(|| DeviceError::Geometry(format!("{block_count} blocks overflow memory")))?;
        Ok(Self::from_parts(vec![0u8; len], block_size, block_count))
    }

    /// Create a device whose durable contents are `image`.
    pub fn from_image(block_size: usize, image: Vec<u8>) -> DeviceResult<Self> {
        check_block_size(block_size)?;
        if image.len() % block_size != 0 {
            return Err(DeviceError::Geometry(format!(
                "image length {} is not a multiple of block size {block_size}",
                image.len()
            )));
        }
        let block_count = (image.len() / block_size) as u64;
        Ok(Self::from_parts(image, block_size, block_count))
    }

    fn from_parts(image: Vec<u8>, block_size: usize, block_count: u64) -> Self {
        Self {
            state: Arc::new(Mutex::new(MemoryState {
                current: image.clone(),
                durable: image,
                unflushed: Vec::new(),
                base: None,
                history: None,
                faults: FaultPlan::default(),
                writes: 0,
                flushes: 0,
            })),
            block_size,
            block_count,
        }
    }

    fn range(&self, block: u64) -> std::ops::Range<usize> {
        let start = block as usize * self.block_size;
        start..start + self.block_size
    }

    /// Start recording every write and flush from now on.
    ///
    /// Writes already in flight are recorded first so `crash_at` can still
    /// drop them.
    pub fn record_history(&self) {
        let mut state = self.state.lock();
        let ops = state
            .unflushed
            .iter()
            .map(|(block, data)| DeviceOp::Write {
                block: *block,
                data: data.clone(),
            })
            .collect();
        state.base = Some(state.durable.clone());
        state.history = Some(ops);
    }

    /// Number of recorded operations (0 when recording is off).
    pub fn history_len(&self) -> usize {
        self.state.lock().history.as_ref().map_or(0, Vec::len)
    }

    /// A copy of the recorded operations.
    pub fn history(&self) -> Vec<DeviceOp> {
        self.state.lock().history.clone().unwrap_or_default()
    }

    /// Simulate power loss: only flushed writes survive.
    pub fn crash(&self) -> MemoryDevice {
        self.crash_keeping(|_| false)
    }

    /// Simulate power loss where the in-flight writes for which `keep`
    /// returns `true` happened to reach the media.
    pub fn crash_keeping(&self, mut keep: impl FnMut(u64) -> bool) -> MemoryDevice {
        let state = self.state.lock();
        let mut image = state.durable.clone();
        for (block, data) in &state.unflushed {
            if keep(*block) {
                image[self.range(*block)].copy_from_slice(data);
            }
        }
        Self::from_parts(image, self.block_size, self.block_count)
    }

    /// Simulate power loss right before recorded operation `op_index`.
    ///
    /// Writes followed by a flush within the prefix are durable; writes after
    /// the last flush in the prefix survive only if `keep` says so.
    pub fn crash_at(
        &self,
        op_index: usize,
        mut keep: impl FnMut(u64) -> bool,
    ) -> DeviceResult<MemoryDevice> {
        let state = self.state.lock();
        let (Some(base), Some(history)) = (state.base.as_ref(), state.history.as_ref()) else {
            return Err(DeviceError::Injected(
                "crash_at requires record_history".to_string(),
            ));
        };
        let prefix = &history[..op_index.min(history.len())];
        let last_flush = prefix.iter().rposition(|op| *op == DeviceOp::Flush);

        let mut image = base.clone();
        for (index, op) in prefix.iter().enumerate() {
            if let DeviceOp::Write { block, data } = op {
                let durable = last_flush.is_some_and(|flush| index < flush);
                if durable || keep(*block) {
                    image[self.range(*block)].copy_from_slice(data);
                }
            }
        }
        Ok(Self::from_parts(image, self.block_size, self.block_count))
    }

    /// The durable contents of `block`.
    pub fn durable_block(&self, block: u64) -> Vec<u8> {
        self.state.lock().durable[self.range(block)].to_vec()
    }

    /// Number of writes issued since the last flush.
    pub fn unflushed_count(&self) -> usize {
        self.state.lock().unflushed.len()
    }

    /// Total successful writes.
    pub fn write_count(&self) -> u64 {
        self.state.lock().writes
    }

    /// Total successful flushes.
    pub fn flush_count(&self) -> u64 {
        self.state.lock().flushes
    }

    /// Let `successes` more writes complete, then fail every write after.
    pub fn fail_writes_after(&self, successes: u64) {
        self.state.lock().faults.writes_before_failure = Some(successes);
    }

    /// Fail the next flush.
    pub fn fail_next_flush(&self) {
        self.state.lock().faults.fail_next_flush = true;
    }

    /// Fail every write to `block`.
    pub fn fail_block(&self, block: u64) {
        self.state.lock().faults.failing_blocks.insert(block);
    }

    /// Remove all injected faults.
    pub fn clear_faults(&self) {
        self.state.lock().faults = FaultPlan::default();
    }
}

impl BlockDevice for MemoryDevice {
    fn read_block(&self, block: u64, buf: &mut [u8]) -> DeviceResult<()> {
        check_access(block, buf.len(), self.block_size, self.block_count)?;
        let state = self.state.lock();
        buf.copy_from_slice(&state.current[self.range(block)]);
        Ok(())
    }

    fn write_block(&self, block: u64, data: &[u8]) -> DeviceResult<()> {
        check_access(block, data.len(), self.block_size, self.block_count)?;
        let mut state = self.state.lock();

        if state.faults.failing_blocks.contains(&block) {
            return Err(DeviceError::Injected(format!("write to block {block}")));
        }
        if let Some(remaining) = state.faults.writes_before_failure.as_mut() {
            if *remaining == 0 {
                return Err(DeviceError::Injected(format!("write to block {block}")));
            }
            *remaining -= 1;
        }

        let range = self.range(block);
        state.current[range].copy_from_slice(data);
        state.unflushed.push((block, data.to_vec()));
        if let Some(history) = state.history.as_mut() {
            history.push(DeviceOp::Write {
                block,
                data: data.to_vec(),
            });
        }
        state.writes += 1;
        trace!(block, "memory device write");
        Ok(())
    }

    fn flush(&self) -> DeviceResult<()> {
        let mut state = self.state.lock();
        if state.faults.fail_next_flush {
            state.faults.fail_next_flush = false;
            return Err(DeviceError::Injected("flush".to_string()));
        }

        let pending = std::mem::take(&mut state.unflushed);
        for (block, data) in pending {
            let range = self.range(block);
            state.durable[range].copy_from_slice(&data);
        }
        if let Some(history) = state.history.as_mut() {
            history.push(DeviceOp::Flush);
        }
        state.flushes += 1;
        Ok(())
    }

    fn block_size(&self) -> usize {
        self.block_size
    }

    fn block_count(&self) -> u64 {
        self.block_count
    }

    fn name(&self) -> &str {
        "memory"
    }
}
