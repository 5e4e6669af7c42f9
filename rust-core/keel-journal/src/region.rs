// SPDX-License-Identifier: PMPL-1.0-or-later
//
// Circular log region arithmetic
// Copyright (c) 2026 Keel contributors
//
// Slots are numbered `0..log_blocks`; slot `s` lives at device block
// `log_start + s`. A commit unit of `len` content blocks occupies `len + 2`
// consecutive slots, wrapping at the end of the region.

use crate::config::JournalGeometry;

/// The journal's footprint on the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogRegion {
    header_block: u64,
    log_start: u64,
    log_blocks: u64,
}

impl LogRegion {
    /// Region described by `geometry`.
    pub fn new(geometry: &JournalGeometry) -> Self {
        Self {
            header_block: geometry.header_block,
            log_start: geometry.log_start,
            log_blocks: geometry.log_blocks,
        }
    }

    /// Block holding the journal header.
    pub fn header_block(&self) -> u64 {
        self.header_block
    }

    /// Number of slots in the log.
    pub fn len(&self) -> u64 {
        self.log_blocks
    }

    /// Whether the log has no slots.
    pub fn is_empty(&self) -> bool {
        self.log_blocks == 0
    }

    /// Device block of `slot` (taken modulo the region size).
    pub fn slot_block(&self, slot: u64) -> u64 {
        self.log_start + slot % self.log_blocks
    }

    /// Slot `count` positions after `slot`.
    pub fn advance(&self, slot: u64, count: u64) -> u64 {
        (slot % self.log_blocks + count % self.log_blocks) % self.log_blocks
    }

    /// Forward distance from `from` to `to`.
    pub fn distance(&self, from: u64, to: u64) -> u64 {
        let from = from % self.log_blocks;
        let to = to % self.log_blocks;
        if to >= from {
            to - from
        } else {
            self.log_blocks - from + to
        }
    }

    /// Whether `block` belongs to the journal (header or log).
    pub fn contains(&self, block: u64) -> bool {
        block == self.header_block
            || (block >= self.log_start && block - self.log_start < self.log_blocks)
    }
}

/// Slots a unit with `len` content blocks occupies.
pub fn unit_slots(len: u64) -> u64 {
    len + 2
}
