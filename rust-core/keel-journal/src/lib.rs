// SPDX-License-Identifier: PMPL-1.0-or-later
//
// Keel write-ahead block journal
// Copyright (c) 2026 Keel contributors
//
// Groups block writes into transactions that reach the disk atomically:
// either every block a transaction registered survives a power loss, or none
// does. Callers open a transaction, register the blocks they modify through
// the buffer cache, and end it; the journal batches concurrent writers into
// one commit unit, logs it, and later writes the blocks to their home
// locations (checkpoint). After a crash the log is replayed on mount.
//
// # Architecture
//
// The log is a fixed circular region of the volume plus one header block
// outside it. Each closed transaction occupies `len + 2` consecutive slots:
//
// ```text
// [descriptor: KEELDSC1, txn id, len, mount id, first addresses, crc32]
// [content block 0] ... [content block len-1]
// [commit:     KEELCMT1, txn id, len, mount id, content crc32, overflow addresses, crc32]
// ```
//
// The commit block is written only after everything before it is durable,
// so a unit whose commit block decodes and whose content checksum matches
// is complete. The header records the newest checkpointed transaction and
// the slot replay starts from.
//
// # Modules
//
// - [`journal`] -- `Journal`, admission, closing, the public API.
// - [`commit`] -- Writes closed transactions to the log.
// - [`checkpoint`] -- Writes logged blocks home and advances the header.
// - [`recovery`] -- Log scanning, replay, formatting.
// - [`layout`] -- Bit-exact header, descriptor and commit block encodings.
// - [`config`] -- Geometry, thresholds, policies.
// - [`stats`] -- Counters and gauges.
//
// # Example
//
// ```rust
// use std::sync::Arc;
// use keel_block::{BlockDevice, MemoryDevice};
// use keel_journal::{CommitMode, EndFlags, Journal, JournalConfig, JournalGeometry};
//
// let device = Arc::new(MemoryDevice::new(512, 256).unwrap());
// let geometry = JournalGeometry::contiguous(1, 64);
// Journal::format(device.as_ref(), &geometry).unwrap();
//
// let mut config = JournalConfig::for_geometry(geometry);
// config.commit_mode = CommitMode::Inline;
// let journal = Journal::open(device.clone(), config).unwrap();
//
// let mut txn = journal.begin(2).unwrap();
// journal.register_dirty(&txn, 100).unwrap().lock().fill(1);
// journal.register_freed(&txn, 101).unwrap();
// journal.end(&mut txn, EndFlags::WAIT_FOR_DURABLE).unwrap();
//
// // Durable in the log, not yet at home.
// assert_eq!(device.durable_block(100), vec![0u8; 512]);
// journal.checkpoint(0, true).unwrap();
// assert_eq!(device.durable_block(100), vec![1u8; 512]);
// ```

mod bitmap;
mod checkpoint;
mod commit;
pub mod config;
pub mod error;
mod index;
pub mod journal;
pub mod layout;
mod list;
mod node;
pub mod recovery;
pub mod region;
pub mod stats;
mod transaction;
mod worker;

pub use config::{CommitMode, JournalConfig, JournalGeometry, RecoveryPolicy};
pub use error::{JournalError, JournalResult};
pub use journal::Journal;
pub use layout::JournalHeader;
pub use list::ListState;
pub use node::TxnId;
pub use recovery::{scan_log, LogScan, RecoveryReport, ScanStop, UnitSummary};
pub use region::LogRegion;
pub use stats::{JournalCounters, JournalStats};
pub use transaction::{EndFlags, TransactionHandle};
