// SPDX-License-Identifier: PMPL-1.0-or-later
//
// Journal lists: closed transactions on their way to the log and home
// Copyright (c) 2026 Keel contributors

use std::time::Instant;

use crate::bitmap::FreedBitmap;
use crate::node::{NodeId, TxnId};
use crate::region::unit_slots;

/// Where a journal list is in its life.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ListState {
    /// Closed, waiting for the committer.
    Dirty,
    /// Its unit is being written to the log.
    Committing,
    /// The commit block is durable.
    Committed,
    /// Its blocks are being written home.
    Checkpointing,
}

impl ListState {
    /// Whether the list's commit block is durable.
    pub fn is_durable(self) -> bool {
        matches!(self, ListState::Committed | ListState::Checkpointing)
    }
}

/// One closed transaction awaiting commit and checkpoint.
#[derive(Debug)]
pub(crate) struct JournalList {
    pub id: TxnId,
    /// First log slot of the unit (the descriptor).
    pub start: u64,
    /// Content blocks in the unit.
    pub len: u32,
    /// Nodes in log order.
    pub nodes: Vec<NodeId>,
    pub freed: FreedBitmap,
    pub mount_id: u32,
    pub state: ListState,
    pub closed_at: Instant,
    pub committed_at: Option<Instant>,
}

impl JournalList {
    pub fn new(
        id: TxnId,
        start: u64,
        nodes: Vec<NodeId>,
        freed: FreedBitmap,
        mount_id: u32,
    ) -> Self {
        Self {
            id,
            start,
            len: nodes.len() as u32,
            nodes,
            freed,
            mount_id,
            state: ListState::Dirty,
            closed_at: Instant::now(),
            committed_at: None,
        }
    }

    /// Log slots the unit occupies.
    pub fn slots(&self) -> u64 {
        unit_slots(u64::from(self.len))
    }

    /// Whether a block freed by this list may still be reused too early.
    pub fn blocks_reuse(&self, block: u64) -> bool {
        !self.state.is_durable() && self.freed.contains(block)
    }
}
