// SPDX-License-Identifier: PMPL-1.0-or-later
//
// Block reference nodes
// Copyright (c) 2026 Keel contributors
//
// A node binds one block address to the transaction that last modified it.
// Nodes live in a fixed-capacity arena and are addressed by [`NodeId`];
// every structure that refers to a node (the open transaction's chain, the
// dirty-block index, a journal list) holds ids, never references.

use std::ops::{Index, IndexMut};
use std::sync::Arc;

use keel_block::BlockBuffer;

use crate::error::{JournalError, JournalResult};

/// Transaction identifier. Ids start at 1 and are consecutive.
pub type TxnId = u64;

/// Stable handle to a node in the arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(u32);

impl NodeId {
    /// The arena slot this id addresses.
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// One block reference.
#[derive(Debug)]
pub struct BlockNode {
    /// Home address of the block.
    pub block: u64,
    /// Transaction that registered the block.
    pub owner: TxnId,
    /// Previous node in the open transaction's chain.
    pub prev: Option<NodeId>,
    /// Next node in the open transaction's chain.
    pub next: Option<NodeId>,
    /// The pinned cache buffer while the transaction is open.
    pub buffer: Option<Arc<BlockBuffer>>,
    /// Content captured when the transaction closed; this is what gets
    /// logged and checkpointed.
    pub frozen: Option<Arc<[u8]>>,
    /// Transaction that freed the block after this node was logged.
    pub freed_by: Option<TxnId>,
}

impl BlockNode {
    /// A fresh node for `block` owned by `owner`.
    pub fn new(block: u64, owner: TxnId, buffer: Arc<BlockBuffer>) -> Self {
        Self {
            block,
            owner,
            prev: None,
            next: None,
            buffer: Some(buffer),
            frozen: None,
            freed_by: None,
        }
    }
}

/// Fixed-capacity node pool.
#[derive(Debug)]
pub struct NodeArena {
    slots: Vec<Option<BlockNode>>,
    vacant: Vec<u32>,
    capacity: usize,
    live: usize,
}

impl NodeArena {
    /// An empty arena holding at most `capacity` nodes.
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: Vec::new(),
            vacant: Vec::new(),
            capacity,
            live: 0,
        }
    }

    /// Store `node`, failing when the pool is exhausted.
    pub fn alloc(&mut self, node: BlockNode) -> JournalResult<NodeId> {
        if self.live >= self.capacity {
            return Err(JournalError::ResourceExhausted(format!(
                "node pool of {} exhausted",
                self.capacity
            )));
        }
        self.live += 1;
        if let Some(slot) = self.vacant.pop() {
            self.slots[slot as usize] = Some(node);
            return Ok(NodeId(slot));
        }
        self.slots.push(Some(node));
        Ok(NodeId((self.slots.len() - 1) as u32))
    }

    /// Remove and return the node behind `id`.
    pub fn release(&mut self, id: NodeId) -> JournalResult<BlockNode> {
        let node = self
            .slots
            .get_mut(id.index())
            .and_then(Option::take)
            .ok_or_else(|| {
                JournalError::ContractViolation(format!("node {} released twice", id.0))
            })?;
        self.vacant.push(id.0);
        self.live -= 1;
        Ok(node)
    }

    /// The node behind `id`, if it is live.
    pub fn get(&self, id: NodeId) -> Option<&BlockNode> {
        self.slots.get(id.index()).and_then(Option::as_ref)
    }

    /// Mutable access to the node behind `id`, if it is live.
    pub fn get_mut(&mut self, id: NodeId) -> Option<&mut BlockNode> {
        self.slots.get_mut(id.index()).and_then(Option::as_mut)
    }

    /// Nodes that can still be allocated.
    pub fn free_count(&self) -> usize {
        self.capacity - self.live
    }

    /// Nodes currently allocated.
    pub fn live(&self) -> usize {
        self.live
    }

    /// Maximum number of nodes.
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Panics if `id` does not refer to a live node.
impl Index<NodeId> for NodeArena {
    type Output = BlockNode;

    fn index(&self, id: NodeId) -> &BlockNode {
        match self.get(id) {
            Some(node) => node,
            None => panic!("dangling node id {}", id.0),
        }
    }
}

impl IndexMut<NodeId> for NodeArena {
    fn index_mut(&mut self, id: NodeId) -> &mut BlockNode {
        match self.get_mut(id) {
            Some(node) => node,
            None => panic!("dangling node id {}", id.0),
        }
    }
}

/// Doubly linked chain of nodes threaded through `prev`/`next`.
#[derive(Debug, Default, Clone)]
pub struct NodeChain {
    head: Option<NodeId>,
    tail: Option<NodeId>,
    len: usize,
}

impl NodeChain {
    /// Append `id` at the tail.
    pub fn push_back(&mut self, arena: &mut NodeArena, id: NodeId) {
        arena[id].prev = self.tail;
        arena[id].next = None;
        match self.tail {
            Some(tail) => arena[tail].next = Some(id),
            None => self.head = Some(id),
        }
        self.tail = Some(id);
        self.len += 1;
    }

    /// Detach `id` from the chain.
    pub fn unlink(&mut self, arena: &mut NodeArena, id: NodeId) {
        let (prev, next) = (arena[id].prev, arena[id].next);
        match prev {
            Some(prev) => arena[prev].next = next,
            None => self.head = next,
        }
        match next {
            Some(next) => arena[next].prev = prev,
            None => self.tail = prev,
        }
        arena[id].prev = None;
        arena[id].next = None;
        self.len -= 1;
    }

    /// Move `id` to the tail.
    pub fn relink(&mut self, arena: &mut NodeArena, id: NodeId) {
        if self.tail != Some(id) {
            self.unlink(arena, id);
            self.push_back(arena, id);
        }
    }

    /// Node ids from head to tail.
    pub fn collect(&self, arena: &NodeArena) -> Vec<NodeId> {
        let mut ids = Vec::with_capacity(self.len);
        let mut cursor = self.head;
        while let Some(id) = cursor {
            ids.push(id);
            cursor = arena[id].next;
        }
        ids
    }

    /// Number of nodes in the chain.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the chain is empty.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Forget every link. The nodes themselves are untouched.
    pub fn clear(&mut self) {
        *self = Self::default();
    }
}
