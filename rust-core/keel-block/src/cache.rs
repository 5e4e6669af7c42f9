// SPDX-License-Identifier: PMPL-1.0-or-later
//
// Buffer cache shared between the filesystem and the journal.
// Copyright (c) 2026 Keel contributors
//
// A cached block is an `Arc<BlockBuffer>`. Holding the `Arc` pins the block
// in the cache; `BlockBuffer::lock` gives exclusive access to its bytes for
// modification. The cache drops its own reference only when it is the last
// holder and the buffer is clean, so a buffer referenced by the journal can
// never be evicted underneath it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};
use tracing::trace;

use crate::device::BlockDevice;
use crate::error::DeviceResult;

/// One cached block.
#[derive(Debug)]
pub struct BlockBuffer {
    block: u64,
    data: Mutex<Vec<u8>>,
    dirty: AtomicBool,
}

impl BlockBuffer {
    fn new(block: u64, data: Vec<u8>) -> Self {
        Self {
            block,
            data: Mutex::new(data),
            dirty: AtomicBool::new(false),
        }
    }

    /// The block address this buffer caches.
    pub fn block(&self) -> u64 {
        self.block
    }

    /// Exclusive access to the block contents.
    pub fn lock(&self) -> MutexGuard<'_, Vec<u8>> {
        self.data.lock()
    }

    /// Copy of the current contents.
    pub fn snapshot(&self) -> Vec<u8> {
        self.data.lock().clone()
    }

    /// Whether the buffer holds changes not yet written to its home location.
    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    /// Flag the buffer as holding unwritten changes.
    pub fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::Release);
    }

    /// Flag the buffer as matching its home location.
    pub fn mark_clean(&self) {
        self.dirty.store(false, Ordering::Release);
    }
}

/// A read-through cache of block buffers.
pub struct BufferCache {
    device: Arc<dyn BlockDevice>,
    buffers: Mutex<HashMap<u64, Arc<BlockBuffer>>>,
}

impl std::fmt::Debug for BufferCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferCache")
            .field("device", &self.device.name())
            .field("cached", &self.buffers.lock().len())
            .finish()
    }
}

impl BufferCache {
    /// Create an empty cache in front of `device`.
    pub fn new(device: Arc<dyn BlockDevice>) -> Self {
        Self {
            device,
            buffers: Mutex::new(HashMap::new()),
        }
    }

    /// Pin `block`, reading it from the device on a miss.
    pub fn get(&self, block: u64) -> DeviceResult<Arc<BlockBuffer>> {
        if let Some(buffer) = self.buffers.lock().get(&block) {
            return Ok(Arc::clone(buffer));
        }

        // Read outside the map lock; a racing reader may insert first, in
        // which case its buffer wins.
        let data = self.device.read_block_vec(block)?;
        let mut buffers = self.buffers.lock();
        let buffer = buffers
            .entry(block)
            .or_insert_with(|| Arc::new(BlockBuffer::new(block, data)));
        trace!(block, "buffer cache miss");
        Ok(Arc::clone(buffer))
    }

    /// The cached buffer for `block`, if present. Never touches the device.
    pub fn get_if_cached(&self, block: u64) -> Option<Arc<BlockBuffer>> {
        self.buffers.lock().get(&block).cloned()
    }

    /// Release every buffer the cache is the last holder of and that is
    /// clean. Returns how many were dropped.
    pub fn evict_idle(&self) -> usize {
        let mut buffers = self.buffers.lock();
        let before = buffers.len();
        buffers.retain(|_, buffer| Arc::strong_count(buffer) > 1 || buffer.is_dirty());
        before - buffers.len()
    }

    /// Number of cached buffers.
    pub fn len(&self) -> usize {
        self.buffers.lock().len()
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.buffers.lock().is_empty()
    }

    /// The device behind the cache.
    pub fn device(&self) -> &Arc<dyn BlockDevice> {
        &self.device
    }
}
