// SPDX-License-Identifier: PMPL-1.0-or-later
//
// Keel journal - Commit engine
// Copyright (c) 2026 Keel contributors
//
// Writes closed journal lists to the log, oldest first. For each unit:
//   1. descriptor + content blocks into consecutive log slots
//   2. flush: everything before the commit block is durable
//   3. commit block into the slot after the content
//   4. flush: the transaction is durable
// A commit block is never written before the blocks it vouches for, and
// unit N is never started before unit N-1 is durable. Any device failure
// aborts the instance.

use std::sync::Arc;
use std::time::Instant;

use tracing::debug;

use crate::error::JournalResult;
use crate::journal::{FlushGuard, JournalInner};
use crate::layout;
use crate::list::ListState;
use crate::node::TxnId;

/// Everything the commit engine needs to write one unit without the lock.
struct CommitJob {
    txn_id: TxnId,
    start: u64,
    mount_id: u32,
    addresses: Vec<u64>,
    contents: Vec<Arc<[u8]>>,
}

impl JournalInner {
    /// Commit every closed list. Returns how many units were made durable.
    pub(crate) fn commit_pending(&self, _flush: &FlushGuard<'_>) -> JournalResult<usize> {
        let mut committed = 0;
        while let Some(job) = self.next_commit_job()? {
            if let Err(e) = self.write_unit(&job) {
                return Err(self.fail(e, "commit"));
            }

            let mut state = self.state.lock();
            let mut waited = None;
            if let Some(list) = state.lists.iter_mut().find(|list| list.id == job.txn_id) {
                list.state = ListState::Committed;
                list.committed_at = Some(Instant::now());
                waited = Some(list.closed_at.elapsed());
            }
            state.last_committed = job.txn_id;
            state.counters.commits += 1;
            state.counters.blocks_logged += job.addresses.len() as u64;
            debug!(
                txn_id = job.txn_id,
                blocks = job.addresses.len(),
                slot = job.start,
                latency_us = waited.map_or(0, |d| d.as_micros() as u64),
                "Committed transaction"
            );
            self.changed.notify_all();
            committed += 1;
        }
        Ok(committed)
    }

    /// Claim the oldest dirty list, if any.
    fn next_commit_job(&self) -> JournalResult<Option<CommitJob>> {
        let mut guard = self.state.lock();
        guard.ensure_writable()?;
        let state = &mut *guard;

        let Some(position) = state
            .lists
            .iter()
            .position(|list| list.state == ListState::Dirty)
        else {
            return Ok(None);
        };
        let expected = state.last_committed + 1;
        let id = state.lists[position].id;
        if id != expected {
            return Err(self.violation(
                state,
                format!("transaction {id} ready to commit before {expected}"),
            ));
        }

        let list = &state.lists[position];
        let (start, mount_id) = (list.start, list.mount_id);
        let frozen: Option<Vec<(u64, Arc<[u8]>)>> = list
            .nodes
            .iter()
            .map(|node_id| {
                let node = state.arena.get(*node_id)?;
                node.frozen.clone().map(|data| (node.block, data))
            })
            .collect();
        let Some(frozen) = frozen else {
            return Err(self.violation(
                state,
                format!("transaction {id} holds a node without frozen content"),
            ));
        };

        state.lists[position].state = ListState::Committing;
        let (addresses, contents): (Vec<u64>, Vec<Arc<[u8]>>) = frozen.into_iter().unzip();
        Ok(Some(CommitJob {
            txn_id: id,
            start,
            mount_id,
            addresses,
            contents,
        }))
    }

    fn write_unit(&self, job: &CommitJob) -> JournalResult<()> {
        let region = &self.region;
        let crc = layout::content_crc(job.contents.iter().map(|data| &data[..]));
        let (descriptor, commit) =
            layout::encode_unit(self.block_size, job.txn_id, job.mount_id, &job.addresses, crc)?;
        let len = job.addresses.len() as u64;

        self.device
            .write_block(region.slot_block(job.start), &descriptor)?;
        for (i, data) in job.contents.iter().enumerate() {
            self.device
                .write_block(region.slot_block(job.start + 1 + i as u64), data)?;
        }
        self.device.flush()?;

        self.device
            .write_block(region.slot_block(job.start + len + 1), &commit)?;
        self.device.flush()?;
        Ok(())
    }
}
