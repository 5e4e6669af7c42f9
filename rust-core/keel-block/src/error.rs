// SPDX-License-Identifier: PMPL-1.0-or-later
//
// Block layer error types.
// Copyright (c) 2026 Keel contributors
//
// Every failure a block device or the buffer cache can report: host I/O
// errors, addressing outside the device, buffers of the wrong size, and
// faults injected by the in-memory test device.

use thiserror::Error;

/// Errors that can occur when talking to a block device.
#[derive(Debug, Error)]
pub enum DeviceError {
    /// An I/O error occurred in the underlying file or device.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The requested block lies beyond the end of the device.
    #[error("block {block} out of range (device has {block_count} blocks)")]
    OutOfRange {
        /// The block number that was requested.
        block: u64,
        /// Total number of blocks on the device.
        block_count: u64,
    },

    /// A buffer passed to the device does not match its block size.
    #[error("buffer length {actual} does not match block size {expected}")]
    BadLength {
        /// The device block size.
        expected: usize,
        /// The length of the supplied buffer.
        actual: usize,
    },

    /// The device geometry is unusable (zero or non power-of-two block size,
    /// file length not a multiple of the block size, ...).
    #[error("invalid device geometry: {0}")]
    Geometry(String),

    /// The device was opened read-only and a write was attempted.
    #[error("device is read-only")]
    ReadOnly,

    /// A fault injected by a test device.
    #[error("injected fault: {0}")]
    Injected(String),
}

/// Convenience alias for block layer results.
pub type DeviceResult<T> = Result<T, DeviceError>;
