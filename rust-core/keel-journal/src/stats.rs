// SPDX-License-Identifier: PMPL-1.0-or-later
//
// Journal statistics
// Copyright (c) 2026 Keel contributors

use serde::{Deserialize, Serialize};

/// Monotonic counters kept under the journal lock.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JournalCounters {
    /// Writers admitted by `begin`, `join` or `try_begin`.
    pub writers_admitted: u64,
    /// Admissions that had to wait at least once.
    pub admission_waits: u64,
    /// Transactions closed into a journal list.
    pub transactions_closed: u64,
    /// Closes that found nothing to commit.
    pub empty_closes: u64,
    /// Commit units made durable.
    pub commits: u64,
    /// Content blocks written to the log.
    pub blocks_logged: u64,
    /// Registrations that found the block already in the open transaction.
    pub relinks: u64,
    /// Dirty blocks dropped because they were freed in the same transaction.
    pub freed_unlogged: u64,
    /// Checkpoint passes that advanced the header.
    pub checkpoints: u64,
    /// Journal lists released by checkpoint.
    pub lists_checkpointed: u64,
    /// Blocks written to their home location by checkpoint.
    pub blocks_checkpointed: u64,
    /// Blocks skipped because a newer committed list holds them.
    pub blocks_superseded: u64,
    /// Blocks skipped because their freeing transaction is durable.
    pub blocks_freed_skipped: u64,
}

/// Point-in-time view of a journal instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JournalStats {
    /// Current mount generation.
    pub mount_id: u32,
    /// Whether the instance refuses new writers.
    pub read_only: bool,
    /// Id of the open transaction.
    pub open_txn_id: u64,
    /// Writers holding the open transaction.
    pub open_writers: u32,
    /// Blocks registered in the open transaction.
    pub open_blocks: u64,
    /// Journal lists not yet checkpointed.
    pub pending_lists: usize,
    /// Newest transaction whose commit block is durable.
    pub last_committed_id: u64,
    /// Newest transaction recorded as checkpointed in the header.
    pub last_flushed_id: u64,
    /// Log slots held by journal lists.
    pub log_used_slots: u64,
    /// Size of the log region.
    pub log_slots: u64,
    /// Nodes still available in the pool.
    pub free_nodes: usize,
    /// Nodes in use by the open transaction and journal lists.
    pub live_nodes: usize,
    /// Size of the node pool.
    pub node_capacity: usize,
    /// Distinct blocks held by journal lists.
    pub indexed_blocks: usize,
    /// Freed blocks that may not be reused yet.
    pub pending_frees: usize,
    /// Lifetime counters.
    pub counters: JournalCounters,
}

impl JournalStats {
    /// Fraction of the log region held by journal lists.
    pub fn log_usage(&self) -> f64 {
        if self.log_slots == 0 {
            return 0.0;
        }
        self.log_used_slots as f64 / self.log_slots as f64
    }
}
