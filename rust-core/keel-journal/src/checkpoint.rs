// SPDX-License-Identifier: PMPL-1.0-or-later
//
// Keel journal - Checkpoint engine
// Copyright (c) 2026 Keel contributors
//
// Writes the content of committed journal lists to their home locations and
// then advances the on-disk header past them, which frees their log slots.
// Only the contiguous run of oldest committed lists is eligible, so the
// header's first-unflushed pointer never skips a list.
//
// Per node, in list order:
// - freed by a transaction that is already durable: skip
// - a newer committed list holds the same block: skip (can-dirty rule)
// - otherwise: write the content frozen at close
// One flush after the home writes, one header write for the whole batch,
// one flush after the header.

use std::sync::Arc;

use tracing::debug;

use crate::error::JournalResult;
use crate::journal::{FlushGuard, JournalInner, JournalState};
use crate::layout::JournalHeader;
use crate::list::ListState;
use crate::node::TxnId;

/// How far a checkpoint pass may go.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CheckpointTarget {
    /// Every committed list at the front of the queue.
    All,
    /// Committed lists with ids up to and including this one.
    UpTo(TxnId),
}

impl CheckpointTarget {
    fn admits(self, id: TxnId) -> bool {
        match self {
            CheckpointTarget::All => true,
            CheckpointTarget::UpTo(limit) => id <= limit,
        }
    }
}

#[derive(Debug)]
struct CheckpointPlan {
    lists: Vec<TxnId>,
    writes: Vec<(u64, Arc<[u8]>)>,
    header: JournalHeader,
    superseded: u64,
    freed: u64,
}

impl JournalInner {
    /// Checkpoint the committed prefix allowed by `target`. Returns how many
    /// lists were released.
    pub(crate) fn checkpoint_committed(
        &self,
        _flush: &FlushGuard<'_>,
        target: CheckpointTarget,
    ) -> JournalResult<usize> {
        let plan = {
            let mut state = self.state.lock();
            state.ensure_writable()?;
            match plan_checkpoint(&mut state, target) {
                Some(plan) => plan,
                None => return Ok(0),
            }
        };

        if let Err(e) = self.write_checkpoint(&plan) {
            return Err(self.fail(e, "checkpoint"));
        }

        let mut guard = self.state.lock();
        let state = &mut *guard;
        for &list_id in &plan.lists {
            let list = match state.lists.pop_front() {
                Some(list) if list.id == list_id => list,
                _ => {
                    return Err(self.violation(
                        state,
                        format!("journal list {list_id} vanished during checkpoint"),
                    ))
                }
            };
            for node_id in list.nodes {
                let node = match state.arena.release(node_id) {
                    Ok(node) => node,
                    Err(e) => return Err(self.violation(state, e.to_string())),
                };
                state.index.remove_global(node.block, node_id);
                if state.index.lookup(node.block).is_none()
                    && state.index.lookup_any(node.block).is_empty()
                {
                    if let Some(buffer) = self.cache.get_if_cached(node.block) {
                        buffer.mark_clean();
                    }
                }
            }
        }

        state.header = plan.header;
        state.counters.checkpoints += 1;
        state.counters.lists_checkpointed += plan.lists.len() as u64;
        state.counters.blocks_checkpointed += plan.writes.len() as u64;
        state.counters.blocks_superseded += plan.superseded;
        state.counters.blocks_freed_skipped += plan.freed;
        debug!(
            lists = plan.lists.len(),
            blocks = plan.writes.len(),
            superseded = plan.superseded,
            freed = plan.freed,
            last_flush_id = plan.header.last_flush_id,
            first_unflushed = plan.header.first_unflushed,
            "Checkpointed journal lists"
        );
        self.changed.notify_all();
        Ok(plan.lists.len())
    }

    fn write_checkpoint(&self, plan: &CheckpointPlan) -> JournalResult<()> {
        for (block, data) in &plan.writes {
            self.device.write_block(*block, data)?;
        }
        self.device.flush()?;
        self.device.write_block(
            self.region.header_block(),
            &plan.header.encode(self.block_size),
        )?;
        self.device.flush()?;
        Ok(())
    }
}

/// Pick the lists to checkpoint and the blocks to write, and mark the lists
/// as checkpointing.
fn plan_checkpoint(state: &mut JournalState, target: CheckpointTarget) -> Option<CheckpointPlan> {
    let count = state
        .lists
        .iter()
        .take_while(|list| list.state == ListState::Committed && target.admits(list.id))
        .count();
    if count == 0 {
        return None;
    }

    let durable = state.last_committed;
    let mut plan = CheckpointPlan {
        lists: Vec::with_capacity(count),
        writes: Vec::new(),
        header: state.header,
        superseded: 0,
        freed: 0,
    };

    for list in state.lists.iter().take(count) {
        plan.lists.push(list.id);
        for &id in &list.nodes {
            let node = &state.arena[id];
            if node.freed_by.is_some_and(|freer| freer <= durable) {
                plan.freed += 1;
                continue;
            }
            let newer = state.index.lookup_any(node.block).iter().any(|other| {
                state
                    .arena
                    .get(*other)
                    .is_some_and(|o| o.owner > node.owner && o.owner <= durable)
            });
            if newer {
                plan.superseded += 1;
                continue;
            }
            if let Some(data) = &node.frozen {
                plan.writes.push((node.block, Arc::clone(data)));
            }
        }
    }

    for list in state.lists.iter_mut().take(count) {
        list.state = ListState::Checkpointing;
    }

    let last = state.lists[count - 1].id;
    let first_unflushed = state
        .lists
        .get(count)
        .map_or(state.open.start, |next| next.start);
    plan.header = JournalHeader {
        last_flush_id: last,
        first_unflushed,
        mount_id: state.header.mount_id,
    };
    Some(plan)
}
