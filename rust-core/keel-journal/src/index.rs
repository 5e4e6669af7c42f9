// SPDX-License-Identifier: PMPL-1.0-or-later
//
// Dirty-block index
// Copyright (c) 2026 Keel contributors
//
// Two tables. `current` maps a block to its node in the open transaction
// and is the only one touched on the register path. `global` maps a block
// to every node still held by a closed, not yet checkpointed journal list,
// oldest first; it is consulted at close, checkpoint, free and allocation
// checks.

use std::collections::HashMap;

use crate::node::NodeId;

/// Block address to node lookup for open and closed transactions.
#[derive(Debug, Default)]
pub struct DirtyIndex {
    current: HashMap<u64, NodeId>,
    global: HashMap<u64, Vec<NodeId>>,
}

impl DirtyIndex {
    /// An empty index.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `block` is registered in the open transaction as `id`.
    /// Returns the node it replaced, if any.
    pub fn insert_current(&mut self, block: u64, id: NodeId) -> Option<NodeId> {
        self.current.insert(block, id)
    }

    /// The open transaction's node for `block`.
    pub fn lookup(&self, block: u64) -> Option<NodeId> {
        self.current.get(&block).copied()
    }

    /// Drop `block` from the open transaction's table.
    pub fn remove_current(&mut self, block: u64) -> Option<NodeId> {
        self.current.remove(&block)
    }

    /// Empty the open transaction's table (its nodes moved to a list).
    pub fn clear_current(&mut self) {
        self.current.clear();
    }

    /// Number of blocks in the open transaction.
    pub fn current_len(&self) -> usize {
        self.current.len()
    }

    /// Record a closed transaction's node for `block`. Lists close in id
    /// order, so appending keeps each entry oldest first.
    pub fn insert_global(&mut self, block: u64, id: NodeId) {
        self.global.entry(block).or_default().push(id);
    }

    /// Every closed, unflushed node for `block`, oldest first.
    pub fn lookup_any(&self, block: u64) -> &[NodeId] {
        self.global.get(&block).map_or(&[], Vec::as_slice)
    }

    /// Drop one node from `block`'s global entry. Returns whether it was
    /// present.
    pub fn remove_global(&mut self, block: u64, id: NodeId) -> bool {
        let Some(nodes) = self.global.get_mut(&block) else {
            return false;
        };
        let Some(position) = nodes.iter().position(|n| *n == id) else {
            return false;
        };
        nodes.remove(position);
        if nodes.is_empty() {
            self.global.remove(&block);
        }
        true
    }

    /// Number of distinct blocks held by closed lists.
    pub fn global_blocks(&self) -> usize {
        self.global.len()
    }
}
