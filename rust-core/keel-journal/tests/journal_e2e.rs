// SPDX-License-Identifier: PMPL-1.0-or-later
//
// End-to-end tests for the Keel journal
// Copyright (c) 2026 Keel contributors
//
// Drives `Journal` over a `MemoryDevice`: transaction lifecycle, the on-disk
// log layout, freed-block rules, checkpoint ordering, crashes and replay.

use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use keel_block::{BlockDevice, FileDevice, MemoryDevice};
use keel_journal::layout::{self, CommitRecord, Descriptor, JournalHeader};
use keel_journal::{
    scan_log, CommitMode, EndFlags, Journal, JournalConfig, JournalError, JournalGeometry,
    RecoveryPolicy, ScanStop,
};

const BS: usize = 512;

/// Journal at the end of the volume so low block numbers are home blocks.
fn tail_geometry() -> JournalGeometry {
    JournalGeometry::contiguous(100, 32)
}

fn inline_config(geometry: JournalGeometry) -> JournalConfig {
    let mut config = JournalConfig::for_geometry(geometry);
    config.commit_mode = CommitMode::Inline;
    config
}

fn formatted(blocks: u64, geometry: &JournalGeometry) -> MemoryDevice {
    let device = MemoryDevice::new(BS, blocks).unwrap();
    Journal::format(&device, geometry).unwrap();
    device
}

fn open(device: &MemoryDevice, config: JournalConfig) -> Journal {
    Journal::open(Arc::new(device.clone()), config).unwrap()
}

/// One transaction writing `fill` into every block of `blocks`.
fn write_blocks(journal: &Journal, blocks: &[u64], fill: u8, flags: EndFlags) {
    let mut txn = journal.begin(blocks.len() as u32).unwrap();
    for &block in blocks {
        journal.register_dirty(&txn, block).unwrap().lock().fill(fill);
    }
    journal.end(&mut txn, flags).unwrap();
}

fn log_block(device: &MemoryDevice, geometry: &JournalGeometry, slot: u64) -> Vec<u8> {
    device.durable_block(geometry.log_start + slot)
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

#[test]
fn test_first_transaction_log_layout() {
    let geometry = tail_geometry();
    let device = formatted(256, &geometry);
    let journal = open(&device, inline_config(geometry));

    let mut txn = journal.begin(2).unwrap();
    journal.register_dirty(&txn, 10).unwrap().lock().fill(0x10);
    journal.register_dirty(&txn, 20).unwrap().lock().fill(0x20);
    journal.end(&mut txn, EndFlags::WAIT_FOR_DURABLE).unwrap();

    let descriptor = Descriptor::decode(&log_block(&device, &geometry, 0)).unwrap();
    assert_eq!(descriptor.txn_id, 1);
    assert_eq!(descriptor.len, 2);
    assert_eq!(descriptor.mount_id, 1);
    assert_eq!(descriptor.addresses, vec![10, 20]);

    assert_eq!(log_block(&device, &geometry, 1), vec![0x10; BS]);
    assert_eq!(log_block(&device, &geometry, 2), vec![0x20; BS]);

    let commit = CommitRecord::decode(&log_block(&device, &geometry, 3)).unwrap();
    assert_eq!(commit.txn_id, 1);
    assert_eq!(commit.len, 2);
    assert_eq!(
        commit.content_crc,
        layout::content_crc([&[0x10u8; BS][..], &[0x20u8; BS][..]])
    );

    // Logged, not yet home.
    assert_eq!(device.durable_block(10), vec![0u8; BS]);
    assert_eq!(journal.in_journal(10), vec![1]);

    journal.checkpoint(1, false).unwrap();
    assert_eq!(device.durable_block(10), vec![0x10; BS]);
    assert_eq!(device.durable_block(20), vec![0x20; BS]);
    assert!(journal.in_journal(10).is_empty());

    let header = JournalHeader::decode(&device.durable_block(100)).unwrap();
    assert_eq!(header.last_flush_id, 1);
    assert_eq!(header.first_unflushed, 4);
}

#[test]
fn test_dirty_then_freed_block_is_not_logged() {
    let geometry = tail_geometry();
    let device = formatted(256, &geometry);
    let journal = open(&device, inline_config(geometry));

    let mut txn = journal.begin(2).unwrap();
    journal.register_dirty(&txn, 5).unwrap().lock().fill(0x55);
    journal.register_dirty(&txn, 6).unwrap().lock().fill(0x66);
    journal.register_freed(&txn, 5).unwrap();
    assert!(!journal.may_allocate(5));
    assert!(journal.may_allocate(6));
    journal.end(&mut txn, EndFlags::WAIT_FOR_DURABLE).unwrap();

    assert!(journal.may_allocate(5));
    let descriptor = Descriptor::decode(&log_block(&device, &geometry, 0)).unwrap();
    assert_eq!(descriptor.addresses, vec![6]);
    assert_eq!(journal.stats().counters.freed_unlogged, 1);

    journal.release().unwrap();
    assert_eq!(device.durable_block(5), vec![0u8; BS]);
    assert_eq!(device.durable_block(6), vec![0x66; BS]);
}

#[test]
fn test_crash_during_checkpoint_keeps_newest_content() {
    let geometry = tail_geometry();
    let device = formatted(256, &geometry);
    let config = inline_config(geometry);
    let journal = open(&device, config.clone());

    write_blocks(&journal, &[7], 0xA0, EndFlags::WAIT_FOR_DURABLE);
    write_blocks(&journal, &[7], 0xB0, EndFlags::WAIT_FOR_DURABLE);

    device.record_history();
    assert_eq!(journal.checkpoint(0, true).unwrap(), 2);
    assert_eq!(journal.stats().counters.blocks_superseded, 1);
    drop(journal);

    for op in 0..=device.history_len() {
        for keep_inflight in [false, true] {
            let crashed = device.crash_at(op, |_| keep_inflight).unwrap();
            let remounted = open(&crashed, config.clone());
            assert_eq!(
                crashed.read_block_vec(7).unwrap(),
                vec![0xB0; BS],
                "crash before op {op} (keep in-flight: {keep_inflight})"
            );
            remounted.release().unwrap();
        }
    }
}

// ---------------------------------------------------------------------------
// Admission and batching
// ---------------------------------------------------------------------------

#[test]
fn test_concurrent_writers_share_transactions() {
    let geometry = JournalGeometry::contiguous(1, 64);
    let device = formatted(256, &geometry);
    let mut config = JournalConfig::for_geometry(geometry);
    config.max_trans_age_ms = 60_000;
    let journal = Arc::new(open(&device, config));

    let writers = 8u64;
    let barrier = Arc::new(Barrier::new(writers as usize));
    let handles: Vec<_> = (0..writers)
        .map(|i| {
            let journal = Arc::clone(&journal);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                let block = 100 + i;
                let mut txn = journal.begin(1).unwrap();
                journal
                    .register_dirty(&txn, block)
                    .unwrap()
                    .lock()
                    .fill(i as u8 + 1);
                journal.end(&mut txn, EndFlags::WAIT_FOR_DURABLE).unwrap();
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let stats = journal.stats();
    assert_eq!(stats.counters.blocks_logged, writers);
    assert!(stats.counters.commits >= 1 && stats.counters.commits <= writers);
    assert_eq!(stats.counters.writers_admitted, writers);

    // Everything acknowledged survives a crash.
    let crashed = device.crash();
    let remounted = open(&crashed, inline_config(geometry));
    for i in 0..writers {
        assert_eq!(crashed.read_block_vec(100 + i).unwrap(), vec![i as u8 + 1; BS]);
    }
    remounted.release().unwrap();
    journal.release().unwrap();
}

#[test]
fn test_try_begin_would_block_over_batch() {
    let geometry = JournalGeometry::contiguous(1, 64);
    let device = formatted(256, &geometry);
    let journal = open(&device, inline_config(geometry));
    let max_batch = journal.config().max_batch;

    let mut big = journal.begin(max_batch).unwrap();
    assert!(matches!(journal.try_begin(1), Err(JournalError::WouldBlock)));

    // A joiner gets in regardless.
    let mut joiner = journal.join(1).unwrap();
    assert_eq!(joiner.id(), big.id());
    journal.end(&mut joiner, EndFlags::NONE).unwrap();
    journal.end(&mut big, EndFlags::NONE).unwrap();

    // Idle and over budget: try_begin closes it and gets a fresh one.
    let mut next = journal.try_begin(1).unwrap();
    journal.end(&mut next, EndFlags::NONE).unwrap();
    assert_eq!(journal.stats().counters.empty_closes, 1);
    journal.release().unwrap();
}

#[test]
fn test_nested_handles_end_once() {
    let geometry = JournalGeometry::contiguous(1, 64);
    let device = formatted(256, &geometry);
    let journal = open(&device, inline_config(geometry));

    let mut txn = journal.begin(1).unwrap();
    journal.nest(&mut txn).unwrap();
    assert_eq!(txn.depth(), 2);
    journal.register_dirty(&txn, 80).unwrap().lock().fill(8);

    journal.end(&mut txn, EndFlags::FORCE_COMMIT).unwrap();
    assert!(txn.is_active());
    assert_eq!(journal.stats().open_writers, 1);
    assert_eq!(journal.stats().pending_lists, 0);

    journal.end(&mut txn, EndFlags::WAIT_FOR_DURABLE).unwrap();
    assert!(!txn.is_active());
    assert_eq!(journal.stats().open_writers, 0);
    assert_eq!(journal.stats().last_committed_id, 1);
    journal.release().unwrap();
}

#[test]
fn test_transaction_over_trans_max_is_rejected() {
    let geometry = JournalGeometry::contiguous(1, 64);
    let device = formatted(256, &geometry);
    let journal = open(&device, inline_config(geometry));
    let trans_max = journal.config().trans_max;

    assert!(matches!(
        journal.begin(trans_max + 1),
        Err(JournalError::TransactionFull { .. })
    ));

    let mut txn = journal.join(0).unwrap();
    for block in 0..u64::from(trans_max) {
        journal.register_dirty(&txn, 100 + block).unwrap();
    }
    // Re-registering is a relink, not a new block.
    journal.register_dirty(&txn, 100).unwrap();
    assert!(matches!(
        journal.register_dirty(&txn, 200),
        Err(JournalError::TransactionFull { .. })
    ));
    journal.end(&mut txn, EndFlags::WAIT_FOR_DURABLE).unwrap();
    assert_eq!(journal.stats().counters.relinks, 1);
    journal.release().unwrap();
}

#[test]
fn test_register_rejects_journal_blocks() {
    let geometry = JournalGeometry::contiguous(1, 64);
    let device = formatted(256, &geometry);
    let journal = open(&device, inline_config(geometry));

    let mut txn = journal.begin(1).unwrap();
    assert!(matches!(
        journal.register_dirty(&txn, 10),
        Err(JournalError::InvalidBlock { block: 10, .. })
    ));
    assert!(matches!(
        journal.register_dirty(&txn, 1_000),
        Err(JournalError::InvalidBlock { block: 1_000, .. })
    ));
    journal.end(&mut txn, EndFlags::NONE).unwrap();
    assert!(!journal.is_read_only());
    journal.release().unwrap();
}

#[test]
fn test_overlapping_writers_batch_into_one_unit() {
    let geometry = JournalGeometry::contiguous(1, 64);
    let device = formatted(256, &geometry);
    let mut config = inline_config(geometry);
    config.max_trans_age_ms = 60_000;
    let journal = open(&device, config);

    let mut a = journal.begin(2).unwrap();
    let mut b = journal.begin(1).unwrap();
    assert_eq!(a.id(), b.id());
    journal.register_dirty(&a, 100).unwrap().lock().fill(0xA0);
    journal.register_dirty(&b, 101).unwrap().lock().fill(0xB1);
    journal.register_dirty(&a, 101).unwrap().lock().fill(0xA1);
    journal.end(&mut a, EndFlags::NONE).unwrap();

    let mut c = journal.begin(1).unwrap();
    assert_eq!(c.id(), b.id());
    journal.register_dirty(&c, 102).unwrap().lock().fill(0xC2);
    journal.end(&mut c, EndFlags::NONE).unwrap();
    assert_eq!(journal.stats().last_committed_id, 0);

    journal.end(&mut b, EndFlags::WAIT_FOR_DURABLE).unwrap();

    let stats = journal.stats();
    assert_eq!(stats.counters.commits, 1);
    assert_eq!(stats.counters.relinks, 1);
    assert_eq!(stats.counters.blocks_logged, 3);

    let scan = scan_log(&device, &geometry, journal.config().trans_max).unwrap();
    assert_eq!(scan.units.len(), 1);
    assert_eq!(scan.units[0].txn_id, 1);
    assert_eq!(scan.units[0].addresses, vec![100, 101, 102]);
    // The re-registered block carries the last write.
    assert_eq!(log_block(&device, &geometry, 2), vec![0xA1; BS]);
    drop(journal);

    let crashed = device.crash();
    let remounted = open(&crashed, inline_config(geometry));
    assert_eq!(crashed.read_block_vec(100).unwrap(), vec![0xA0; BS]);
    assert_eq!(crashed.read_block_vec(101).unwrap(), vec![0xA1; BS]);
    assert_eq!(crashed.read_block_vec(102).unwrap(), vec![0xC2; BS]);
    remounted.release().unwrap();
}

#[test]
fn test_begin_waits_for_pending_close() {
    let geometry = JournalGeometry::contiguous(1, 64);
    let device = formatted(256, &geometry);
    let mut config = inline_config(geometry);
    config.max_trans_age_ms = 60_000;
    let journal = Arc::new(open(&device, config));

    let mut held = journal.begin(1).unwrap();
    journal.register_dirty(&held, 100).unwrap().lock().fill(1);
    let mut closer = journal.begin(1).unwrap();
    journal.register_dirty(&closer, 101).unwrap().lock().fill(2);
    journal.end(&mut closer, EndFlags::FORCE_COMMIT).unwrap();
    let first = held.id();

    let waiter = {
        let journal = Arc::clone(&journal);
        thread::spawn(move || journal.begin(1).unwrap())
    };
    thread::sleep(Duration::from_millis(300));
    assert!(!waiter.is_finished(), "begin entered a transaction that is closing");
    assert_eq!(journal.stats().open_writers, 1);

    journal.end(&mut held, EndFlags::NONE).unwrap();
    let mut next = waiter.join().unwrap();
    assert_eq!(next.id(), first + 1);
    assert_eq!(journal.stats().last_committed_id, first);
    assert!(journal.stats().counters.admission_waits >= 1);

    journal.end(&mut next, EndFlags::NONE).unwrap();
    journal.release().unwrap();
}

/// Small node pool: four blocks per transaction, two nodes of low water.
fn small_pool_config(geometry: JournalGeometry) -> JournalConfig {
    let mut config = inline_config(geometry);
    config.trans_max = 4;
    config.max_batch = 4;
    config.node_pool_size = 8;
    config.node_pool_low_water = 2;
    config.max_trans_age_ms = 60_000;
    config.max_commit_age_ms = 60_000;
    config
}

#[test]
fn test_node_pool_low_water_closes_transaction() {
    let geometry = JournalGeometry::contiguous(1, 64);
    let device = formatted(256, &geometry);
    let journal = open(&device, small_pool_config(geometry));

    write_blocks(&journal, &[100, 101, 102], 1, EndFlags::WAIT_FOR_DURABLE);
    assert_eq!(journal.stats().live_nodes, 3);
    assert_eq!(journal.stats().counters.checkpoints, 0);

    // Under max_batch and young, but the pool drops to low water.
    write_blocks(&journal, &[110, 111, 112], 2, EndFlags::NONE);
    let stats = journal.stats();
    assert_eq!(stats.counters.transactions_closed, 2);
    assert_eq!(stats.last_committed_id, 2);
    assert!(stats.counters.checkpoints >= 1);
    assert_eq!(stats.live_nodes, 0);
    assert_eq!(device.durable_block(112), vec![2u8; BS]);
    journal.release().unwrap();
}

#[test]
fn test_begin_waits_for_checkpoint_when_node_pool_is_low() {
    let geometry = JournalGeometry::contiguous(1, 64);
    let device = formatted(256, &geometry);
    let journal = Arc::new(open(&device, small_pool_config(geometry)));

    // Committed but not checkpointed: three nodes stay in use.
    write_blocks(&journal, &[100, 101, 102], 1, EndFlags::WAIT_FOR_DURABLE);
    assert_eq!(device.durable_block(100), vec![0u8; BS]);

    let mut held = journal.begin(3).unwrap();
    for block in [110, 111, 112] {
        journal.register_dirty(&held, block).unwrap().lock().fill(2);
    }
    let first = held.id();

    let waiter = {
        let journal = Arc::clone(&journal);
        thread::spawn(move || journal.begin(1).unwrap())
    };
    thread::sleep(Duration::from_millis(300));
    assert!(!waiter.is_finished(), "begin admitted with the node pool at low water");
    // The waiter forced the committed list home to reclaim its nodes.
    assert!(journal.stats().counters.checkpoints >= 1);
    assert_eq!(device.durable_block(100), vec![1u8; BS]);

    journal.end(&mut held, EndFlags::NONE).unwrap();
    let mut next = waiter.join().unwrap();
    assert_eq!(next.id(), first + 1);
    assert_eq!(journal.stats().last_committed_id, first);

    journal.end(&mut next, EndFlags::NONE).unwrap();
    journal.release().unwrap();
}

// ---------------------------------------------------------------------------
// Freed blocks
// ---------------------------------------------------------------------------

#[test]
fn test_freed_block_waits_for_commit() {
    let geometry = JournalGeometry::contiguous(1, 64);
    let device = formatted(256, &geometry);
    let journal = open(&device, inline_config(geometry));

    write_blocks(&journal, &[90], 0x90, EndFlags::WAIT_FOR_DURABLE);

    // A transaction that only frees still commits a zero-length unit.
    let mut txn = journal.begin(0).unwrap();
    journal.register_freed(&txn, 90).unwrap();
    assert!(!journal.may_allocate(90));
    journal.end(&mut txn, EndFlags::FORCE_COMMIT).unwrap();

    let last = journal.sync().unwrap();
    assert_eq!(last, 2);
    assert!(journal.may_allocate(90));

    let scan = scan_log(&device, &geometry, journal.config().trans_max).unwrap();
    assert_eq!(scan.units.len(), 2);
    assert!(scan.units[1].addresses.is_empty());

    // The stale write of block 90 is not checkpointed once the free is durable.
    journal.checkpoint(0, true).unwrap();
    assert_eq!(device.durable_block(90), vec![0u8; BS]);
    assert_eq!(journal.stats().counters.blocks_freed_skipped, 1);
    journal.release().unwrap();
}

// ---------------------------------------------------------------------------
// Log wrap and ordering
// ---------------------------------------------------------------------------

#[test]
fn test_log_wraps_and_header_advances_in_order() {
    let geometry = JournalGeometry::contiguous(1, 16);
    let device = formatted(128, &geometry);
    let config = inline_config(geometry);
    let journal = open(&device, config.clone());

    let mut expected = std::collections::BTreeMap::new();
    let mut last_flush = 0;
    for i in 0..20u64 {
        let blocks = [40 + (i % 5) * 2, 41 + (i % 5) * 2];
        let fill = i as u8 + 1;
        write_blocks(&journal, &blocks, fill, EndFlags::NONE);
        for block in blocks {
            expected.insert(block, fill);
        }

        let stats = journal.stats();
        assert!(stats.log_used_slots <= stats.log_slots);
        let header = JournalHeader::decode(&device.durable_block(1)).unwrap();
        assert!(header.last_flush_id >= last_flush);
        last_flush = header.last_flush_id;
    }
    assert!(journal.stats().counters.checkpoints > 0);
    journal.sync().unwrap();

    let crashed = device.crash();
    let scan = scan_log(&crashed, &geometry, config.trans_max).unwrap();
    for (i, unit) in scan.units.iter().enumerate() {
        assert_eq!(unit.txn_id, scan.header.last_flush_id + 1 + i as u64);
    }

    let remounted = open(&crashed, config);
    for (block, fill) in expected {
        assert_eq!(crashed.read_block_vec(block).unwrap(), vec![fill; BS]);
    }
    remounted.release().unwrap();
    drop(journal);
}

// ---------------------------------------------------------------------------
// Recovery
// ---------------------------------------------------------------------------

#[test]
fn test_replay_after_crash_is_idempotent() {
    let geometry = JournalGeometry::contiguous(1, 64);
    let device = formatted(256, &geometry);
    let config = inline_config(geometry);
    let journal = open(&device, config.clone());
    write_blocks(&journal, &[100, 101], 1, EndFlags::WAIT_FOR_DURABLE);
    write_blocks(&journal, &[101, 102], 2, EndFlags::WAIT_FOR_DURABLE);
    drop(journal);

    let crashed = device.crash();
    crashed.record_history();
    let first = open(&crashed, config.clone());
    let report = first.recovery_report().unwrap();
    assert_eq!(report.transactions_replayed, 2);
    assert_eq!(report.mount_id, 2);
    drop(first);

    // Crash at every step of recovery; the next mount still converges.
    for op in 0..=crashed.history_len() {
        let again = crashed.crash_at(op, |_| false).unwrap();
        let journal = open(&again, config.clone());
        assert_eq!(again.read_block_vec(100).unwrap(), vec![1u8; BS]);
        assert_eq!(again.read_block_vec(101).unwrap(), vec![2u8; BS]);
        assert_eq!(again.read_block_vec(102).unwrap(), vec![2u8; BS]);
        journal.release().unwrap();
    }
}

#[test]
fn test_file_image_replays_after_unclean_shutdown() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("volume.img");
    let geometry = tail_geometry();
    let config = inline_config(geometry);

    {
        let device = FileDevice::create(&path, BS, 256).unwrap();
        Journal::format(&device, &geometry).unwrap();
        let journal = Journal::open(Arc::new(device), config.clone()).unwrap();
        write_blocks(&journal, &[12, 13], 0x3C, EndFlags::WAIT_FOR_DURABLE);
        // No release: the unit is only in the log.
    }

    let device = FileDevice::open(&path, BS).unwrap();
    assert_eq!(device.read_block_vec(12).unwrap(), vec![0u8; BS]);
    let scan = scan_log(&device, &geometry, config.trans_max).unwrap();
    assert_eq!(scan.units.len(), 1);

    let journal = Journal::open(Arc::new(device), config).unwrap();
    assert_eq!(journal.recovery_report().unwrap().transactions_replayed, 1);
    assert_eq!(journal.device().read_block_vec(13).unwrap(), vec![0x3C; BS]);
    journal.release().unwrap();
}

#[test]
fn test_torn_unit_is_not_replayed() {
    let geometry = JournalGeometry::contiguous(1, 64);
    let device = formatted(256, &geometry);
    let config = inline_config(geometry);
    let journal = open(&device, config.clone());
    write_blocks(&journal, &[100], 1, EndFlags::WAIT_FOR_DURABLE);
    write_blocks(&journal, &[101], 2, EndFlags::WAIT_FOR_DURABLE);
    drop(journal);

    // Damage the content of the second unit (slots 3..6).
    device.write_block(geometry.log_start + 4, &[0xEE; BS]).unwrap();
    device.flush().unwrap();

    let crashed = device.crash();
    let journal = open(&crashed, config);
    let report = journal.recovery_report().unwrap();
    assert_eq!(report.transactions_replayed, 1);
    assert!(matches!(report.stop, ScanStop::EndOfLog { slot: 3, .. }));
    assert_eq!(crashed.read_block_vec(100).unwrap(), vec![1u8; BS]);
    assert_eq!(crashed.read_block_vec(101).unwrap(), vec![0u8; BS]);

    // New transactions continue after the last valid unit.
    write_blocks(&journal, &[103], 3, EndFlags::WAIT_FOR_DURABLE);
    let descriptor = Descriptor::decode(&crashed.durable_block(geometry.log_start + 3)).unwrap();
    assert_eq!(descriptor.txn_id, 2);
    assert_eq!(descriptor.mount_id, 2);
    journal.release().unwrap();
}

/// Log a unit by hand whose home block is inside the journal.
fn plant_corrupt_unit(device: &MemoryDevice, geometry: &JournalGeometry) {
    let content = vec![0x11u8; BS];
    let crc = layout::content_crc([content.as_slice()]);
    let (desc, commit) = layout::encode_unit(BS, 1, 0, &[geometry.log_start + 5], crc).unwrap();
    device.write_block(geometry.log_start, &desc).unwrap();
    device.write_block(geometry.log_start + 1, &content).unwrap();
    device.write_block(geometry.log_start + 2, &commit).unwrap();
    device.flush().unwrap();
}

#[test]
fn test_corrupt_log_fails_mount() {
    let geometry = JournalGeometry::contiguous(1, 64);
    let device = formatted(256, &geometry);
    plant_corrupt_unit(&device, &geometry);

    let err = Journal::open(Arc::new(device.clone()), inline_config(geometry)).unwrap_err();
    assert!(matches!(err, JournalError::Corruption { offset: 0, .. }));
    assert!(err.is_fatal());
}

#[test]
fn test_corrupt_log_mounts_read_only_by_policy() {
    let geometry = JournalGeometry::contiguous(1, 64);
    let device = formatted(256, &geometry);
    plant_corrupt_unit(&device, &geometry);

    let mut config = inline_config(geometry);
    config.recovery_policy = RecoveryPolicy::ReadOnly;
    let journal = open(&device, config);
    assert!(journal.is_read_only());
    assert!(journal.recovery_report().unwrap().read_only);
    assert!(matches!(journal.begin(1), Err(JournalError::ReadOnly)));

    // Header untouched: a later mount sees the same log.
    let header = JournalHeader::decode(&device.durable_block(1)).unwrap();
    assert_eq!(header.mount_id, 0);
    journal.release().unwrap();
}

#[test]
fn test_unformatted_device_is_rejected() {
    let device = MemoryDevice::new(BS, 256).unwrap();
    let geometry = JournalGeometry::contiguous(1, 64);
    let err = Journal::open(Arc::new(device), inline_config(geometry)).unwrap_err();
    assert!(matches!(err, JournalError::Format(_)));
}

// ---------------------------------------------------------------------------
// Failure handling
// ---------------------------------------------------------------------------

#[test]
fn test_device_failure_aborts_instance() {
    let geometry = JournalGeometry::contiguous(1, 64);
    let device = formatted(256, &geometry);
    let journal = open(&device, inline_config(geometry));

    device.fail_writes_after(1);
    let mut txn = journal.begin(1).unwrap();
    journal.register_dirty(&txn, 100).unwrap().lock().fill(1);
    let err = journal
        .end(&mut txn, EndFlags::WAIT_FOR_DURABLE)
        .unwrap_err();
    assert!(matches!(err, JournalError::Aborted(_)));
    assert!(journal.is_read_only());
    assert!(journal.stats().read_only);
    assert!(matches!(journal.begin(1), Err(JournalError::Aborted(_))));
    assert!(matches!(journal.release(), Err(JournalError::Aborted(_))));

    // Nothing half-written is replayed.
    device.clear_faults();
    let crashed = device.crash();
    let remounted = open(&crashed, inline_config(geometry));
    assert_eq!(remounted.recovery_report().unwrap().transactions_replayed, 0);
    assert_eq!(crashed.read_block_vec(100).unwrap(), vec![0u8; BS]);
    remounted.release().unwrap();
}

#[test]
fn test_ending_twice_is_a_contract_violation() {
    let geometry = JournalGeometry::contiguous(1, 64);
    let device = formatted(256, &geometry);
    let journal = open(&device, inline_config(geometry));

    let mut txn = journal.begin(1).unwrap();
    journal.end(&mut txn, EndFlags::NONE).unwrap();
    let err = journal.end(&mut txn, EndFlags::NONE).unwrap_err();
    assert!(matches!(err, JournalError::ContractViolation(_)));
    assert!(journal.is_read_only());
    assert!(matches!(journal.begin(1), Err(JournalError::Aborted(_))));
}

#[test]
fn test_explicit_abort_wakes_writers() {
    let geometry = JournalGeometry::contiguous(1, 64);
    let device = formatted(256, &geometry);
    let journal = open(&device, JournalConfig::for_geometry(geometry));
    journal.abort("operator request");
    assert!(journal.is_read_only());
    let err = journal.begin(1).unwrap_err();
    assert_eq!(err.to_string(), JournalError::Aborted("operator request".into()).to_string());
}

// ---------------------------------------------------------------------------
// Background committer and maintenance calls
// ---------------------------------------------------------------------------

#[test]
fn test_background_committer_closes_aged_transactions() {
    let geometry = JournalGeometry::contiguous(1, 64);
    let device = formatted(256, &geometry);
    let mut config = JournalConfig::for_geometry(geometry);
    config.max_trans_age_ms = 20;
    let journal = open(&device, config);

    write_blocks(&journal, &[120], 0x42, EndFlags::NONE);

    let mut committed = false;
    for _ in 0..200 {
        if journal.stats().last_committed_id == 1 {
            committed = true;
            break;
        }
        thread::sleep(Duration::from_millis(10));
    }
    assert!(committed, "committer never closed the aged transaction");
    journal.release().unwrap();
    assert_eq!(device.durable_block(120), vec![0x42; BS]);
}

#[test]
fn test_flush_old_closes_and_commits() {
    let geometry = JournalGeometry::contiguous(1, 64);
    let device = formatted(256, &geometry);
    let journal = open(&device, inline_config(geometry));

    write_blocks(&journal, &[130], 3, EndFlags::NONE);
    assert_eq!(journal.stats().open_blocks, 1);
    assert!(!journal.flush_old(Duration::from_secs(3600)).unwrap());
    assert!(journal.flush_old(Duration::ZERO).unwrap());
    let stats = journal.stats();
    assert_eq!(stats.open_blocks, 0);
    assert_eq!(stats.last_committed_id, 1);
    journal.release().unwrap();
}

#[test]
fn test_release_leaves_clean_log() {
    let geometry = JournalGeometry::contiguous(1, 64);
    let device = formatted(256, &geometry);
    let journal = open(&device, inline_config(geometry));
    write_blocks(&journal, &[140, 141], 9, EndFlags::NONE);
    journal.release().unwrap();
    assert!(matches!(journal.begin(1), Err(JournalError::NotMounted)));

    let header = JournalHeader::decode(&device.durable_block(1)).unwrap();
    assert_eq!(header.last_flush_id, 1);
    let scan = scan_log(&device, &geometry, 8).unwrap();
    assert!(scan.units.is_empty());
    assert_eq!(device.durable_block(141), vec![9u8; BS]);
}
