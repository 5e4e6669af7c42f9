// SPDX-License-Identifier: PMPL-1.0-or-later
//
// Freed-block bitmaps
// Copyright (c) 2026 Keel contributors
//
// Each open transaction and each journal list carries one [`FreedBitmap`]
// recording the blocks it freed. The volume's address space is split into
// regions of `region_bits` blocks; a region's words are allocated when the
// first block inside it is freed.

use std::collections::HashMap;

/// Sparse set of freed block addresses.
#[derive(Debug, Clone)]
pub struct FreedBitmap {
    region_bits: u32,
    regions: HashMap<u64, Box<[u64]>>,
    count: usize,
}

impl FreedBitmap {
    /// An empty bitmap with regions of `region_bits` bits (a multiple of 64).
    pub fn new(region_bits: u32) -> Self {
        Self {
            region_bits: region_bits.max(64),
            regions: HashMap::new(),
            count: 0,
        }
    }

    fn locate(&self, block: u64) -> (u64, usize, u64) {
        let bits = u64::from(self.region_bits);
        let region = block / bits;
        let offset = block % bits;
        (region, (offset / 64) as usize, 1u64 << (offset % 64))
    }

    /// Set the bit for `block`. Returns `true` if it was not already set.
    pub fn mark(&mut self, block: u64) -> bool {
        let (region, word, mask) = self.locate(block);
        let words = (self.region_bits / 64) as usize;
        let chunk = self
            .regions
            .entry(region)
            .or_insert_with(|| vec![0u64; words].into_boxed_slice());
        if chunk[word] & mask != 0 {
            return false;
        }
        chunk[word] |= mask;
        self.count += 1;
        true
    }

    /// Whether `block` was freed.
    pub fn contains(&self, block: u64) -> bool {
        let (region, word, mask) = self.locate(block);
        self.regions
            .get(&region)
            .is_some_and(|chunk| chunk[word] & mask != 0)
    }

    /// Number of freed blocks.
    pub fn len(&self) -> usize {
        self.count
    }

    /// Whether nothing was freed.
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Bits per region.
    pub fn region_bits(&self) -> u32 {
        self.region_bits
    }

    /// Number of allocated regions.
    pub fn region_count(&self) -> usize {
        self.regions.len()
    }
}
