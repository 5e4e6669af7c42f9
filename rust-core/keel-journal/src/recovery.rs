// SPDX-License-Identifier: PMPL-1.0-or-later
//
// Keel journal - Log scanning and replay
// Copyright (c) 2026 Keel contributors
//
// Recovery runs once per mount, before any transaction is admitted. The
// scanner walks the circular log from the header's first-unflushed slot and
// yields commit units one at a time; each valid unit is replayed to its home
// locations before the next is read, so memory use is bounded by one unit.
// The scan ends at the first unit that fails validation or after a full lap
// of the region. Replay writes nothing but home blocks until the very end,
// where a fresh header is written; a crash anywhere before that replays the
// same run again.

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use keel_block::BlockDevice;

use crate::config::{JournalConfig, JournalGeometry, RecoveryPolicy};
use crate::error::{JournalError, JournalResult};
use crate::layout::{self, CommitRecord, Descriptor, JournalHeader};
use crate::node::TxnId;
use crate::region::{unit_slots, LogRegion};

/// Why a log scan stopped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ScanStop {
    /// The unit at `slot` is not a valid continuation of the log.
    EndOfLog {
        /// Slot of the rejected descriptor.
        slot: u64,
        /// What was wrong with it.
        reason: String,
    },
    /// The next unit would run past a full lap of the region.
    Wrapped {
        /// Slot where the scan stopped.
        slot: u64,
    },
    /// A valid unit names a home block that cannot be written.
    Corrupt {
        /// Slot of the offending descriptor.
        slot: u64,
        /// What was wrong with it.
        detail: String,
    },
}

/// One valid commit unit found in the log.
#[derive(Debug, Clone)]
pub struct ScannedUnit {
    /// Transaction id.
    pub txn_id: TxnId,
    /// Slot of the descriptor.
    pub slot: u64,
    /// Mount generation that wrote it.
    pub mount_id: u32,
    /// Home addresses in log order.
    pub addresses: Vec<u64>,
    /// Logged content, one entry per address.
    pub contents: Vec<Vec<u8>>,
}

/// Result of one scanner step.
#[derive(Debug)]
pub enum ScanStep {
    /// The next valid unit.
    Unit(ScannedUnit),
    /// The scan is over.
    Stop(ScanStop),
}

/// Streaming reader over the valid run of the log.
pub struct LogScanner<'a> {
    device: &'a dyn BlockDevice,
    region: LogRegion,
    trans_max: u32,
    slot: u64,
    consumed: u64,
    expected_id: TxnId,
    newest_mount: u32,
    finished: bool,
}

impl<'a> LogScanner<'a> {
    /// Start scanning at the slot recorded in `header`.
    pub fn new(
        device: &'a dyn BlockDevice,
        region: LogRegion,
        header: &JournalHeader,
        trans_max: u32,
    ) -> JournalResult<Self> {
        Ok(Self {
            device,
            region,
            trans_max,
            slot: header.first_unflushed % region.len(),
            consumed: 0,
            expected_id: header.next_txn_id()?,
            newest_mount: header.mount_id,
            finished: false,
        })
    }

    /// Slot right after the last unit returned.
    pub fn slot(&self) -> u64 {
        self.slot
    }

    /// Id the next valid unit must carry.
    pub fn expected_id(&self) -> TxnId {
        self.expected_id
    }

    /// Newest mount generation seen so far.
    pub fn newest_mount(&self) -> u32 {
        self.newest_mount
    }

    /// Read the next unit. Device failures are errors; everything else that
    /// ends the run is a [`ScanStep::Stop`].
    pub fn next_unit(&mut self) -> JournalResult<ScanStep> {
        if self.finished {
            return Err(JournalError::ContractViolation(
                "log scanner used after it stopped".to_string(),
            ));
        }
        let step = self.read_unit()?;
        match &step {
            ScanStep::Unit(unit) => {
                let slots = unit_slots(unit.addresses.len() as u64);
                self.slot = self.region.advance(self.slot, slots);
                self.consumed += slots;
                self.expected_id = self.expected_id.checked_add(1).ok_or_else(|| {
                    JournalError::Format(format!(
                        "transaction {} exhausts the id space",
                        unit.txn_id
                    ))
                })?;
                self.newest_mount = self.newest_mount.max(unit.mount_id);
            }
            ScanStep::Stop(_) => self.finished = true,
        }
        Ok(step)
    }

    fn end(&self, reason: impl Into<String>) -> ScanStep {
        ScanStep::Stop(ScanStop::EndOfLog {
            slot: self.slot,
            reason: reason.into(),
        })
    }

    fn read_unit(&self) -> JournalResult<ScanStep> {
        let region = &self.region;
        if self.consumed + unit_slots(0) > region.len() {
            return Ok(ScanStep::Stop(ScanStop::Wrapped { slot: self.slot }));
        }

        let raw = self.device.read_block_vec(region.slot_block(self.slot))?;
        let descriptor = match Descriptor::decode(&raw) {
            Ok(descriptor) => descriptor,
            Err(e) => return Ok(self.end(e.to_string())),
        };
        if descriptor.txn_id != self.expected_id {
            return Ok(self.end(format!(
                "transaction {} where {} was expected",
                descriptor.txn_id, self.expected_id
            )));
        }
        if descriptor.mount_id < self.newest_mount {
            return Ok(self.end(format!(
                "stale mount {} (newest seen {})",
                descriptor.mount_id, self.newest_mount
            )));
        }
        if descriptor.len > self.trans_max {
            return Ok(self.end(format!(
                "length {} exceeds trans_max {}",
                descriptor.len, self.trans_max
            )));
        }
        let len = u64::from(descriptor.len);
        if self.consumed + unit_slots(len) > region.len() {
            return Ok(ScanStep::Stop(ScanStop::Wrapped { slot: self.slot }));
        }

        let raw = self
            .device
            .read_block_vec(region.slot_block(self.slot + len + 1))?;
        let commit = match CommitRecord::decode(&raw) {
            Ok(commit) => commit,
            Err(e) => return Ok(self.end(e.to_string())),
        };
        let Some(addresses) = layout::pair_addresses(&descriptor, &commit) else {
            return Ok(self.end("descriptor and commit block disagree"));
        };

        let mut contents = Vec::with_capacity(addresses.len());
        for i in 0..len {
            contents.push(self.device.read_block_vec(region.slot_block(self.slot + 1 + i))?);
        }
        let crc = layout::content_crc(contents.iter().map(Vec::as_slice));
        if crc != commit.content_crc {
            return Ok(self.end(format!(
                "content checksum mismatch: stored {:#010x}, computed {crc:#010x}",
                commit.content_crc
            )));
        }

        let volume = self.device.block_count();
        if let Some(bad) = addresses.iter().find(|b| **b >= volume) {
            return Ok(ScanStep::Stop(ScanStop::Corrupt {
                slot: self.slot,
                detail: format!("home block {bad} lies outside the {volume}-block volume"),
            }));
        }
        if let Some(bad) = addresses.iter().find(|b| region.contains(**b)) {
            return Ok(ScanStep::Stop(ScanStop::Corrupt {
                slot: self.slot,
                detail: format!("home block {bad} lies inside the journal"),
            }));
        }

        Ok(ScanStep::Unit(ScannedUnit {
            txn_id: descriptor.txn_id,
            slot: self.slot,
            mount_id: descriptor.mount_id,
            addresses,
            contents,
        }))
    }
}

/// Read and validate the journal header.
pub fn read_header(device: &dyn BlockDevice, region: &LogRegion) -> JournalResult<JournalHeader> {
    let raw = device.read_block_vec(region.header_block())?;
    JournalHeader::decode(&raw).map_err(|e| {
        JournalError::Format(format!(
            "no journal header at block {}: {e}",
            region.header_block()
        ))
    })
}

/// Summary of one unit for inspection output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitSummary {
    /// Transaction id.
    pub txn_id: TxnId,
    /// Slot of the descriptor.
    pub slot: u64,
    /// Mount generation that wrote it.
    pub mount_id: u32,
    /// Home addresses in log order.
    pub addresses: Vec<u64>,
}

/// What a read-only scan of the log found.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogScan {
    /// The on-disk header.
    pub header: JournalHeader,
    /// Units that replay would apply, oldest first.
    pub units: Vec<UnitSummary>,
    /// Why the scan stopped.
    pub stop: ScanStop,
}

/// Scan the log without writing anything.
pub fn scan_log(
    device: &dyn BlockDevice,
    geometry: &JournalGeometry,
    trans_max: u32,
) -> JournalResult<LogScan> {
    let region = LogRegion::new(geometry);
    let header = read_header(device, &region)?;
    let mut scanner = LogScanner::new(device, region, &header, trans_max)?;
    let mut units = Vec::new();
    loop {
        match scanner.next_unit()? {
            ScanStep::Unit(unit) => units.push(UnitSummary {
                txn_id: unit.txn_id,
                slot: unit.slot,
                mount_id: unit.mount_id,
                addresses: unit.addresses,
            }),
            ScanStep::Stop(stop) => return Ok(LogScan { header, units, stop }),
        }
    }
}

/// Outcome of mount-time recovery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryReport {
    /// Mount generation found in the header.
    pub previous_mount_id: u32,
    /// Mount generation of this mount.
    pub mount_id: u32,
    /// Slot the scan started at.
    pub start_slot: u64,
    /// Slot the next transaction will be logged at.
    pub next_slot: u64,
    /// Transactions replayed.
    pub transactions_replayed: u64,
    /// Blocks written to their home locations.
    pub blocks_replayed: u64,
    /// Oldest transaction replayed.
    pub first_replayed: Option<TxnId>,
    /// Newest transaction replayed.
    pub last_replayed: Option<TxnId>,
    /// Why the scan stopped.
    pub stop: ScanStop,
    /// Whether the journal came up read-only.
    pub read_only: bool,
}

/// Recovery result handed to the journal.
#[derive(Debug)]
pub(crate) struct Recovered {
    pub header: JournalHeader,
    /// Id for the first transaction of this mount.
    pub next_id: TxnId,
    pub report: RecoveryReport,
    /// Set when recovery stopped at corruption and the policy keeps the
    /// volume mountable read-only.
    pub read_only: Option<String>,
}

/// Replay the valid run of the log and write a fresh header.
pub(crate) fn recover(
    device: &dyn BlockDevice,
    region: LogRegion,
    config: &JournalConfig,
) -> JournalResult<Recovered> {
    let header = read_header(device, &region)?;
    info!(
        last_flush_id = header.last_flush_id,
        first_unflushed = header.first_unflushed,
        mount_id = header.mount_id,
        device = device.name(),
        "Starting journal recovery"
    );

    let mut scanner = LogScanner::new(device, region, &header, config.trans_max)?;
    let mut transactions = 0u64;
    let mut blocks = 0u64;
    let mut first = None;
    let mut last = None;
    let stop = loop {
        match scanner.next_unit()? {
            ScanStep::Unit(unit) => {
                for (home, content) in unit.addresses.iter().zip(&unit.contents) {
                    device.write_block(*home, content)?;
                }
                debug!(
                    txn_id = unit.txn_id,
                    slot = unit.slot,
                    blocks = unit.addresses.len(),
                    "Replayed transaction"
                );
                transactions += 1;
                blocks += unit.addresses.len() as u64;
                first.get_or_insert(unit.txn_id);
                last = Some(unit.txn_id);
            }
            ScanStep::Stop(stop) => break stop,
        }
    };

    if transactions > 0 {
        device.flush()?;
    }

    let mut report = RecoveryReport {
        previous_mount_id: header.mount_id,
        mount_id: header.mount_id,
        start_slot: header.first_unflushed,
        next_slot: scanner.slot(),
        transactions_replayed: transactions,
        blocks_replayed: blocks,
        first_replayed: first,
        last_replayed: last,
        stop: stop.clone(),
        read_only: false,
    };

    if let ScanStop::Corrupt { slot, detail } = stop {
        warn!(slot, %detail, "Journal replay stopped at corrupt transaction");
        return match config.recovery_policy {
            RecoveryPolicy::FailMount => Err(JournalError::Corruption {
                offset: slot,
                detail,
            }),
            RecoveryPolicy::ReadOnly => {
                report.read_only = true;
                Ok(Recovered {
                    next_id: header.next_txn_id()?,
                    header,
                    report,
                    read_only: Some(format!("corrupt transaction at log slot {slot}: {detail}")),
                })
            }
        };
    }

    if let ScanStop::EndOfLog { slot, reason } = &report.stop {
        debug!(slot, %reason, "End of valid log run");
    }

    let fresh = JournalHeader {
        last_flush_id: scanner.expected_id() - 1,
        first_unflushed: scanner.slot(),
        mount_id: scanner.newest_mount().wrapping_add(1),
    };
    device.write_block(region.header_block(), &fresh.encode(device.block_size()))?;
    device.flush()?;
    report.mount_id = fresh.mount_id;

    info!(
        transactions,
        blocks,
        mount_id = fresh.mount_id,
        next_slot = fresh.first_unflushed,
        "Journal recovery complete"
    );
    Ok(Recovered {
        header: fresh,
        next_id: scanner.expected_id(),
        report,
        read_only: None,
    })
}

/// Lay down an empty journal: zeroed log region and a fresh header.
pub(crate) fn format(device: &dyn BlockDevice, geometry: &JournalGeometry) -> JournalResult<()> {
    let region = LogRegion::new(geometry);
    let zero = vec![0u8; device.block_size()];
    for slot in 0..region.len() {
        device.write_block(region.slot_block(slot), &zero)?;
    }
    let header = JournalHeader {
        last_flush_id: 0,
        first_unflushed: 0,
        mount_id: 0,
    };
    device.write_block(region.header_block(), &header.encode(device.block_size()))?;
    device.flush()?;
    info!(
        device = device.name(),
        header_block = geometry.header_block,
        log_blocks = geometry.log_blocks,
        "Formatted journal"
    );
    Ok(())
}
