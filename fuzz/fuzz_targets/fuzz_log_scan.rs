// SPDX-License-Identifier: PMPL-1.0-or-later
// Fuzz target for log scanning over an arbitrary disk image
// Copyright (c) 2026 Keel contributors

#![no_main]

use keel_block::MemoryDevice;
use keel_journal::{scan_log, JournalGeometry};
use libfuzzer_sys::fuzz_target;

const BS: usize = 512;

fuzz_target!(|data: &[u8]| {
    // Pad the input to a 32-block image with the journal at block 1.
    let mut image = data.to_vec();
    image.resize(BS * 32, 0);
    let Ok(device) = MemoryDevice::from_image(BS, image) else {
        return;
    };
    let geometry = JournalGeometry::contiguous(1, 16);
    if let Ok(scan) = scan_log(&device, &geometry, 8) {
        assert!(scan.units.len() <= 16 / 2);
        for unit in &scan.units {
            assert!(unit.addresses.len() <= 8);
            assert!(unit.addresses.iter().all(|b| !geometry.contains(*b)));
        }
    }
});
