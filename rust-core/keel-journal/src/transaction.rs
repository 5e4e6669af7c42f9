// SPDX-License-Identifier: PMPL-1.0-or-later
//
// Transaction handles, end flags and the open transaction
// Copyright (c) 2026 Keel contributors

use std::time::{Duration, Instant};

use bitflags::bitflags;

use crate::bitmap::FreedBitmap;
use crate::node::{NodeChain, TxnId};

bitflags! {
    /// Flags for [`Journal::end`](crate::Journal::end).
    #[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Default)]
    pub struct EndFlags: u8 {
        /// Close the transaction as soon as its last writer ends.
        const FORCE_COMMIT = 1;
        /// Close the transaction and return once its commit block is durable.
        const WAIT_FOR_DURABLE = 1 << 1;
        /// Like `WAIT_FOR_DURABLE`, then checkpoint every committed list.
        const FLUSH_ALL = 1 << 2;
    }
}

impl EndFlags {
    /// Leave the transaction open for batching.
    pub const NONE: Self = Self::empty();

    /// Whether any flag asks for the transaction to close.
    pub fn requests_close(self) -> bool {
        !self.is_empty()
    }

    /// Whether the caller blocks until the commit is durable.
    pub fn waits(self) -> bool {
        self.intersects(Self::WAIT_FOR_DURABLE.union(Self::FLUSH_ALL))
    }
}

/// A writer's reference into the open transaction.
///
/// Obtained from `begin`, `join` or `try_begin` and consumed by `end`.
/// `nest` deepens the handle; only the outermost `end` releases it.
#[must_use = "a transaction handle must be passed to Journal::end"]
#[derive(Debug)]
pub struct TransactionHandle {
    pub(crate) id: TxnId,
    pub(crate) generation: u64,
    pub(crate) depth: u32,
}

impl TransactionHandle {
    pub(crate) fn new(id: TxnId, generation: u64) -> Self {
        Self {
            id,
            generation,
            depth: 1,
        }
    }

    /// Id of the transaction this handle writes into.
    pub fn id(&self) -> TxnId {
        self.id
    }

    /// Current nesting depth; zero once the handle has been ended.
    pub fn depth(&self) -> u32 {
        self.depth
    }

    /// Whether the handle can still be used.
    pub fn is_active(&self) -> bool {
        self.depth > 0
    }
}

/// The single transaction accepting writers.
#[derive(Debug)]
pub(crate) struct OpenTransaction {
    pub id: TxnId,
    /// Bumped on every close, including closes with nothing to commit.
    pub generation: u64,
    /// Log slot where this transaction's unit will start.
    pub start: u64,
    pub chain: NodeChain,
    pub writers: u32,
    /// Sum of the block hints of every writer admitted so far.
    pub reserved: u64,
    pub created: Instant,
    pub freed: FreedBitmap,
    pub close_requested: bool,
}

impl OpenTransaction {
    pub fn new(id: TxnId, generation: u64, start: u64, region_bits: u32) -> Self {
        Self {
            id,
            generation,
            start,
            chain: NodeChain::default(),
            writers: 0,
            reserved: 0,
            created: Instant::now(),
            freed: FreedBitmap::new(region_bits),
            close_requested: false,
        }
    }

    /// Blocks registered so far.
    pub fn len(&self) -> u64 {
        self.chain.len() as u64
    }

    /// Whether closing would produce a commit unit.
    pub fn has_work(&self) -> bool {
        !self.chain.is_empty() || !self.freed.is_empty()
    }

    /// Blocks this transaction may still log, as far as admission knows.
    pub fn projected(&self) -> u64 {
        self.len().max(self.reserved)
    }

    pub fn age(&self) -> Duration {
        self.created.elapsed()
    }

    /// Reset for the next batch of writers.
    pub fn restart(&mut self, id: TxnId, start: u64) {
        let region_bits = self.freed.region_bits();
        *self = Self::new(id, self.generation + 1, start, region_bits);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_combine() {
        let flags = EndFlags::FORCE_COMMIT | EndFlags::WAIT_FOR_DURABLE;
        assert!(flags.contains(EndFlags::FORCE_COMMIT));
        assert!(flags.waits());
        assert!(!flags.contains(EndFlags::FLUSH_ALL));
        assert!(!EndFlags::NONE.requests_close());
        assert!(EndFlags::FLUSH_ALL.waits());
        assert!(!EndFlags::FORCE_COMMIT.waits());
    }

    #[test]
    fn test_flags_debug() {
        assert_eq!(format!("{:?}", EndFlags::NONE), "EndFlags(0x0)");
        let mut flags = EndFlags::FORCE_COMMIT;
        flags |= EndFlags::FLUSH_ALL;
        assert_eq!(format!("{flags:?}"), "EndFlags(FORCE_COMMIT | FLUSH_ALL)");
    }

    #[test]
    fn test_restart_bumps_generation() {
        let mut open = OpenTransaction::new(4, 0, 10, 128);
        open.writers = 0;
        open.reserved = 12;
        open.close_requested = true;
        open.freed.mark(9);
        open.restart(5, 20);
        assert_eq!(open.id, 5);
        assert_eq!(open.generation, 1);
        assert_eq!(open.start, 20);
        assert_eq!(open.reserved, 0);
        assert!(!open.close_requested);
        assert!(!open.has_work());
    }

    #[test]
    fn test_projected_uses_larger_of_len_and_hints() {
        let mut open = OpenTransaction::new(1, 0, 0, 64);
        open.reserved = 6;
        assert_eq!(open.projected(), 6);
    }
}
