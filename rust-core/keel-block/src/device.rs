// SPDX-License-Identifier: PMPL-1.0-or-later
//
// Core block device trait.
// Copyright (c) 2026 Keel contributors
//
// The journal consumes storage only through `BlockDevice`: fixed-size block
// reads and writes by address plus a `flush` barrier. A call returning is the
// completion signal; `flush` returning means every write issued before it is
// on stable storage. Writes issued after the last `flush` may or may not
// survive a crash, in any combination.

use std::sync::Arc;

use crate::error::{DeviceError, DeviceResult};

/// A block-addressed storage device.
///
/// Implementations must be safe to share across threads. All buffers passed
/// in or out are exactly `block_size()` bytes long.
pub trait BlockDevice: Send + Sync {
    /// Read block `block` into `buf`.
    fn read_block(&self, block: u64, buf: &mut [u8]) -> DeviceResult<()>;

    /// Write `data` to block `block`. Not durable until the next `flush`.
    fn write_block(&self, block: u64, data: &[u8]) -> DeviceResult<()>;

    /// Durability barrier: every previously completed write is on stable
    /// storage when this returns `Ok`.
    fn flush(&self) -> DeviceResult<()>;

    /// Block size in bytes.
    fn block_size(&self) -> usize;

    /// Total number of addressable blocks.
    fn block_count(&self) -> u64;

    /// A human-readable name for this device, used in logging.
    fn name(&self) -> &str;

    /// Read a block into a freshly allocated buffer.
    fn read_block_vec(&self, block: u64) -> DeviceResult<Vec<u8>> {
        let mut buf = vec![0u8; self.block_size()];
        self.read_block(block, &mut buf)?;
        Ok(buf)
    }
}

impl<D: BlockDevice + ?Sized> BlockDevice for Arc<D> {
    fn read_block(&self, block: u64, buf: &mut [u8]) -> DeviceResult<()> {
        (**self).read_block(block, buf)
    }

    fn write_block(&self, block: u64, data: &[u8]) -> DeviceResult<()> {
        (**self).write_block(block, data)
    }

    fn flush(&self) -> DeviceResult<()> {
        (**self).flush()
    }

    fn block_size(&self) -> usize {
        (**self).block_size()
    }

    fn block_count(&self) -> u64 {
        (**self).block_count()
    }

    fn name(&self) -> &str {
        (**self).name()
    }
}

/// Validate an access against a device's geometry.
///
/// Shared by every implementation so they all reject the same inputs.
pub fn check_access(
    block: u64,
    len: usize,
    block_size: usize,
    block_count: u64,
) -> DeviceResult<()> {
    if block >= block_count {
        return Err(DeviceError::OutOfRange { block, block_count });
    }
    if len != block_size {
        return Err(DeviceError::BadLength {
            expected: block_size,
            actual: len,
        });
    }
    Ok(())
}

/// Validate a block size: non-zero power of two, at least 256 bytes.
pub fn check_block_size(block_size: usize) -> DeviceResult<()> {
    if block_size < 256 || !block_size.is_power_of_two() {
        return Err(DeviceError::Geometry(format!(
            "block size {block_size} must be a power of two >= 256"
        )));
    }
    Ok(())
}
