// SPDX-License-Identifier: PMPL-1.0-or-later
//
// Keel block layer
// Copyright (c) 2026 Keel contributors
//
// The storage collaborators of the Keel journal: a block-addressed device
// interface with an explicit durability barrier, and a buffer cache through
// which the filesystem pins and modifies blocks before handing them to the
// journal.
//
// # Modules
//
// - [`device`] -- The `BlockDevice` trait.
// - [`error`] -- The `DeviceError` enum covering all device failure modes.
// - [`memory`] -- A RAM device that can simulate power loss at any write.
// - [`file`] -- A positional-I/O device over an image file.
// - [`metrics`] -- A transparent wrapper that counts operations.
// - [`cache`] -- Shared, pinnable block buffers.
//
// # Example
//
// ```rust
// use std::sync::Arc;
// use keel_block::{BlockDevice, BufferCache, MemoryDevice};
//
// let device = Arc::new(MemoryDevice::new(512, 64).unwrap());
// let cache = BufferCache::new(device.clone());
//
// let buffer = cache.get(10).unwrap();
// buffer.lock()[0] = 42;
// buffer.mark_dirty();
//
// // The device is untouched until someone writes the buffer home.
// assert_eq!(device.read_block_vec(10).unwrap()[0], 0);
// ```

pub mod cache;
pub mod device;
pub mod error;
pub mod file;
pub mod memory;
pub mod metrics;

// Re-export the most commonly used types at the crate root for convenience.
pub use cache::{BlockBuffer, BufferCache};
pub use device::BlockDevice;
pub use error::{DeviceError, DeviceResult};
pub use file::FileDevice;
pub use memory::{DeviceOp, MemoryDevice};
pub use metrics::{DeviceStats, MetricsDevice};
