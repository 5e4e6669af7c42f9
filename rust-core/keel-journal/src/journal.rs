// SPDX-License-Identifier: PMPL-1.0-or-later
//
// Keel journal - Transaction manager
// Copyright (c) 2026 Keel contributors
//
// One `JournalInner` per mounted volume. All bookkeeping (node arena, dirty
// index, open transaction, journal lists) lives in `JournalState` behind a
// single mutex that is never held across device I/O. Commit and checkpoint
// I/O is serialized by `flush_lock`; when both are needed `flush_lock` is
// taken first. Waiters (admission, durable ends, sync) park on `changed`.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex, MutexGuard};
use tracing::{debug, error, info, trace, warn};

use keel_block::{BlockBuffer, BlockDevice, BufferCache};

use crate::bitmap::FreedBitmap;
use crate::checkpoint::CheckpointTarget;
use crate::config::{CommitMode, JournalConfig, JournalGeometry};
use crate::error::{JournalError, JournalResult};
use crate::index::DirtyIndex;
use crate::layout::JournalHeader;
use crate::list::{JournalList, ListState};
use crate::node::{BlockNode, NodeArena, TxnId};
use crate::recovery::{self, RecoveryReport};
use crate::region::{unit_slots, LogRegion};
use crate::stats::{JournalCounters, JournalStats};
use crate::transaction::{EndFlags, OpenTransaction, TransactionHandle};
use crate::worker::CommitWorker;

/// Upper bound on a single condition-variable wait.
const WAIT_SLICE: Duration = Duration::from_millis(100);

/// Proof that the caller holds the flush lock.
pub(crate) type FlushGuard<'a> = MutexGuard<'a, ()>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Phase {
    Unmounted,
    Recovering,
    Live,
    /// Recovery stopped at corruption; nothing may be written.
    ReadOnly(String),
    /// A fatal error took the instance down.
    Aborted(String),
    Released,
}

#[derive(Debug)]
pub(crate) struct JournalState {
    pub phase: Phase,
    pub arena: NodeArena,
    pub index: DirtyIndex,
    pub open: OpenTransaction,
    /// Closed transactions, oldest first.
    pub lists: VecDeque<JournalList>,
    /// Copy of the on-disk header as last written.
    pub header: JournalHeader,
    /// Newest transaction whose commit block is durable.
    pub last_committed: TxnId,
    pub checkpoint_wanted: bool,
    pub shutdown: bool,
    pub counters: JournalCounters,
    pub report: Option<RecoveryReport>,
}

impl JournalState {
    pub fn ensure_writable(&self) -> JournalResult<()> {
        match &self.phase {
            Phase::Live => Ok(()),
            Phase::ReadOnly(_) => Err(JournalError::ReadOnly),
            Phase::Aborted(reason) => Err(JournalError::Aborted(reason.clone())),
            Phase::Unmounted | Phase::Recovering | Phase::Released => {
                Err(JournalError::NotMounted)
            }
        }
    }

    pub fn is_live(&self) -> bool {
        self.phase == Phase::Live
    }

    /// Log slots held by journal lists.
    pub fn used_slots(&self) -> u64 {
        self.lists.iter().map(JournalList::slots).sum()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Admission {
    Begin,
    Join,
    Try,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Blocker {
    /// The open transaction is closing; wait for its successor.
    ClosePending,
    /// The open transaction is over its size or age threshold.
    Batch,
    /// Not enough free log slots for the unit without overwriting a
    /// list that is not checkpointed.
    LogSpace,
    /// The node pool is at its low-water mark.
    NodePool,
}

/// State shared between the journal handle and its committer thread.
pub(crate) struct JournalInner {
    pub config: JournalConfig,
    pub device: Arc<dyn BlockDevice>,
    pub cache: Arc<BufferCache>,
    pub region: LogRegion,
    pub block_size: usize,
    pub state: Mutex<JournalState>,
    pub changed: Condvar,
    pub flush_lock: Mutex<()>,
}

impl JournalInner {
    /// Take the instance down. Idempotent; the first reason wins.
    pub fn abort_locked(&self, state: &mut JournalState, reason: String) {
        if matches!(state.phase, Phase::Live | Phase::ReadOnly(_)) {
            error!(%reason, device = self.device.name(), "Journal aborted; instance is read-only");
            state.phase = Phase::Aborted(reason);
        }
        self.changed.notify_all();
    }

    /// Abort for a broken usage contract and build the error to return.
    pub fn violation(&self, state: &mut JournalState, detail: impl Into<String>) -> JournalError {
        let detail = detail.into();
        self.abort_locked(state, format!("contract violation: {detail}"));
        JournalError::ContractViolation(detail)
    }

    /// Abort after a device failure during `during`.
    pub fn fail(&self, err: JournalError, during: &str) -> JournalError {
        let reason = format!("{during} failed: {err}");
        let mut state = self.state.lock();
        self.abort_locked(&mut state, reason.clone());
        match &state.phase {
            Phase::Aborted(first) => JournalError::Aborted(first.clone()),
            _ => JournalError::Aborted(reason),
        }
    }

    fn check_block(&self, block: u64) -> JournalResult<()> {
        if block >= self.device.block_count() {
            return Err(JournalError::InvalidBlock {
                block,
                reason: "outside the volume",
            });
        }
        if self.region.contains(block) {
            return Err(JournalError::InvalidBlock {
                block,
                reason: "inside the journal",
            });
        }
        Ok(())
    }

    fn check_handle(
        &self,
        state: &mut JournalState,
        handle: &TransactionHandle,
    ) -> JournalResult<()> {
        if !handle.is_active() {
            return Err(self.violation(
                state,
                format!("handle for transaction {} used after end", handle.id),
            ));
        }
        if handle.id != state.open.id
            || handle.generation != state.open.generation
            || state.open.writers == 0
        {
            return Err(self.violation(
                state,
                format!(
                    "handle for transaction {} does not refer to the open transaction {}",
                    handle.id, state.open.id
                ),
            ));
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Admission
    // -----------------------------------------------------------------------

    fn blocker(&self, state: &JournalState, hint: u64, mode: Admission) -> Option<Blocker> {
        let open = &state.open;
        let joining = mode == Admission::Join && open.writers > 0;
        if !joining {
            if open.close_requested {
                return Some(Blocker::ClosePending);
            }
            let busy = open.has_work() || open.reserved > 0;
            if busy
                && (open.projected() + hint > u64::from(self.config.max_batch)
                    || open.age() >= self.config.max_trans_age())
            {
                return Some(Blocker::Batch);
            }
        }

        let need = if joining {
            open.len() + hint
        } else {
            open.projected() + hint
        };
        if state.used_slots() + unit_slots(need) > self.region.len() {
            return Some(Blocker::LogSpace);
        }

        let outstanding = open.reserved.saturating_sub(open.len()) as usize;
        let low_water = if joining {
            0
        } else {
            self.config.node_pool_low_water
        };
        if state.arena.free_count().saturating_sub(outstanding) < hint as usize + low_water {
            return Some(Blocker::NodePool);
        }
        None
    }

    /// Close the open transaction now if it is idle, otherwise ask its last
    /// writer to close it.
    fn request_close(&self, state: &mut JournalState) {
        if state.open.writers == 0 {
            self.close_open(state);
        } else {
            state.open.close_requested = true;
        }
    }

    pub fn admit(&self, hint: u32, mode: Admission) -> JournalResult<TransactionHandle> {
        let mut state = self.state.lock();
        state.ensure_writable()?;
        if hint > self.config.trans_max {
            return Err(JournalError::TransactionFull {
                txn_id: state.open.id,
                len: hint,
                limit: self.config.trans_max,
            });
        }
        let hint = u64::from(hint);
        let mut waited = false;

        loop {
            state.ensure_writable()?;
            let Some(blocker) = self.blocker(&state, hint, mode) else {
                break;
            };
            let joining = mode == Admission::Join && state.open.writers > 0;
            match (mode, blocker) {
                (Admission::Try, Blocker::Batch) if state.open.writers == 0 => {
                    self.close_open(&mut state);
                    self.changed.notify_all();
                    continue;
                }
                (Admission::Try, _) => return Err(JournalError::WouldBlock),
                (_, Blocker::ClosePending) => {}
                (_, Blocker::Batch) => self.request_close(&mut state),
                (_, Blocker::LogSpace | Blocker::NodePool) => {
                    if joining && state.lists.is_empty() {
                        return Err(JournalError::ResourceExhausted(format!(
                            "no room to extend transaction {} by {hint} blocks",
                            state.open.id
                        )));
                    }
                    state.checkpoint_wanted = true;
                    if !joining && (state.open.has_work() || state.open.reserved > 0) {
                        self.request_close(&mut state);
                    }
                }
            }
            if !waited {
                trace!(?blocker, hint, "Admission waiting");
                state.counters.admission_waits += 1;
                waited = true;
            }
            self.changed.notify_all();
            self.wait(&mut state);
        }

        let open = &mut state.open;
        open.writers += 1;
        open.reserved += hint;
        let handle = TransactionHandle::new(open.id, open.generation);
        state.counters.writers_admitted += 1;
        trace!(txn_id = handle.id, hint, "Writer admitted");
        Ok(handle)
    }

    /// Park until something changes. In inline mode the waiter first tries
    /// to make progress itself.
    pub fn wait(&self, state: &mut MutexGuard<'_, JournalState>) {
        if self.config.commit_mode == CommitMode::Inline {
            let worked = MutexGuard::unlocked(state, || match self.pump() {
                Ok(worked) => worked,
                Err(e) => {
                    debug!(error = %e, "Inline commit failed while waiting");
                    false
                }
            });
            if worked {
                return;
            }
        }
        self.changed.wait_for(state, WAIT_SLICE);
    }

    // -----------------------------------------------------------------------
    // Closing
    // -----------------------------------------------------------------------

    fn should_close(&self, state: &JournalState) -> bool {
        let open = &state.open;
        open.close_requested
            || open.len() >= u64::from(self.config.max_batch)
            || open.age() >= self.config.max_trans_age()
            || state.arena.free_count() <= self.config.node_pool_low_water
    }

    /// Turn the open transaction into a journal list and open its successor.
    /// Returns whether a list was queued. Requires zero writers.
    pub fn close_open(&self, state: &mut JournalState) -> bool {
        let txn_id = state.open.id;
        let start = state.open.start;
        if !state.open.has_work() {
            // Nothing to log: keep the id so the log stays gapless.
            state.open.restart(txn_id, start);
            state.counters.empty_closes += 1;
            return false;
        }

        let nodes = state.open.chain.collect(&state.arena);
        debug_assert_eq!(nodes.len(), state.index.current_len());
        for &id in &nodes {
            let node = &mut state.arena[id];
            if let Some(buffer) = node.buffer.take() {
                node.frozen = Some(Arc::from(buffer.snapshot()));
            }
            state.index.insert_global(node.block, id);
        }
        state.index.clear_current();
        state.open.chain.clear();

        let freed = std::mem::replace(
            &mut state.open.freed,
            FreedBitmap::new(self.config.freed_region_bits),
        );
        let list = JournalList::new(txn_id, start, nodes, freed, state.header.mount_id);
        state.open.restart(txn_id + 1, self.region.advance(start, list.slots()));
        debug!(
            txn_id,
            blocks = list.len,
            freed = list.freed.len(),
            freed_regions = list.freed.region_count(),
            slot = start,
            "Closed transaction"
        );
        state.lists.push_back(list);
        state.counters.transactions_closed += 1;
        true
    }

    /// Whether the transaction a handle wrote into is durable.
    fn is_durable(state: &JournalState, id: TxnId, generation: u64) -> bool {
        state.open.generation != generation
            && state
                .lists
                .iter()
                .find(|list| list.id == id)
                .map_or(true, |list| list.state.is_durable())
    }

    pub fn end(&self, handle: &mut TransactionHandle, flags: EndFlags) -> JournalResult<()> {
        let mut state = self.state.lock();
        self.check_handle(&mut state, handle)?;
        handle.depth -= 1;
        if handle.depth > 0 {
            return Ok(());
        }

        state.open.writers -= 1;
        if flags.requests_close() {
            state.open.close_requested = true;
        }
        let queued = state.open.writers == 0 && self.should_close(&state) && {
            self.close_open(&mut state)
        };
        self.changed.notify_all();
        state.ensure_writable()?;

        if queued && self.config.commit_mode == CommitMode::Inline {
            MutexGuard::unlocked(&mut state, || self.pump())?;
        }

        if flags.waits() {
            while !Self::is_durable(&state, handle.id, handle.generation) {
                state.ensure_writable()?;
                self.wait(&mut state);
            }
            state.ensure_writable()?;
        }
        drop(state);

        if flags.contains(EndFlags::FLUSH_ALL) {
            self.checkpoint_now(CheckpointTarget::All)?;
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Background work
    // -----------------------------------------------------------------------

    /// Commit every closed list, then checkpoint if policy says so.
    pub fn pump(&self) -> JournalResult<bool> {
        let flush = self.flush_lock.lock();
        let committed = self.commit_pending(&flush)?;
        let target = {
            let mut state = self.state.lock();
            let target = self.checkpoint_due(&state);
            if target == Some(CheckpointTarget::All) {
                state.checkpoint_wanted = false;
            }
            target
        };
        let checkpointed = match target {
            Some(target) => self.checkpoint_committed(&flush, target)?,
            None => 0,
        };
        Ok(committed > 0 || checkpointed > 0)
    }

    /// Commit pending lists and checkpoint up to `target`.
    pub fn checkpoint_now(&self, target: CheckpointTarget) -> JournalResult<usize> {
        let flush = self.flush_lock.lock();
        self.commit_pending(&flush)?;
        self.checkpoint_committed(&flush, target)
    }

    /// Which lists the background policy wants checkpointed.
    pub fn checkpoint_due(&self, state: &JournalState) -> Option<CheckpointTarget> {
        let front = state.lists.front()?;
        if front.state != ListState::Committed {
            return None;
        }
        let usage = state.used_slots() as f64 / self.region.len() as f64;
        if state.checkpoint_wanted
            || usage > self.config.checkpoint_threshold
            || state.arena.free_count() <= self.config.node_pool_low_water
        {
            return Some(CheckpointTarget::All);
        }
        let max_age = self.config.max_commit_age();
        state
            .lists
            .iter()
            .take_while(|list| {
                list.state == ListState::Committed
                    && list.committed_at.is_some_and(|at| at.elapsed() >= max_age)
            })
            .last()
            .map(|list| CheckpointTarget::UpTo(list.id))
    }

    /// Whether the open transaction has aged out with no writers.
    pub fn idle_and_aged(&self, state: &JournalState) -> bool {
        let open = &state.open;
        open.writers == 0 && open.has_work() && open.age() >= self.config.max_trans_age()
    }

    pub fn has_background_work(&self, state: &JournalState) -> bool {
        state.is_live()
            && (state.lists.iter().any(|list| list.state == ListState::Dirty)
                || self.checkpoint_due(state).is_some()
                || self.idle_and_aged(state))
    }
}

// ---------------------------------------------------------------------------
// Journal
// ---------------------------------------------------------------------------

/// A write-ahead journal for one block volume.
///
/// # Example
///
/// ```rust
/// use std::sync::Arc;
/// use keel_block::{BlockDevice, MemoryDevice};
/// use keel_journal::{CommitMode, EndFlags, Journal, JournalConfig, JournalGeometry};
///
/// let device: Arc<dyn BlockDevice> = Arc::new(MemoryDevice::new(512, 256).unwrap());
/// let geometry = JournalGeometry::contiguous(1, 64);
/// Journal::format(device.as_ref(), &geometry).unwrap();
///
/// let mut config = JournalConfig::for_geometry(geometry);
/// config.commit_mode = CommitMode::Inline;
/// let journal = Journal::open(device, config).unwrap();
///
/// let mut txn = journal.begin(1).unwrap();
/// let buffer = journal.register_dirty(&txn, 100).unwrap();
/// buffer.lock().fill(0xAB);
/// journal.end(&mut txn, EndFlags::WAIT_FOR_DURABLE).unwrap();
/// journal.release().unwrap();
/// ```
pub struct Journal {
    inner: Arc<JournalInner>,
    worker: Mutex<Option<CommitWorker>>,
}

impl std::fmt::Debug for Journal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("Journal")
            .field("device", &self.inner.device.name())
            .field("phase", &state.phase)
            .field("open_txn", &state.open.id)
            .field("pending_lists", &state.lists.len())
            .finish()
    }
}

impl Journal {
    /// Write an empty journal onto `device`: zeroed log region and a fresh
    /// header. Destroys any previous journal content.
    pub fn format(device: &dyn BlockDevice, geometry: &JournalGeometry) -> JournalResult<()> {
        keel_block::device::check_block_size(device.block_size())?;
        geometry.validate(device.block_count())?;
        recovery::format(device, geometry)
    }

    /// Build an unmounted journal. Call [`Journal::mount_recover`] before
    /// using it.
    pub fn new(device: Arc<dyn BlockDevice>, config: JournalConfig) -> JournalResult<Self> {
        keel_block::device::check_block_size(device.block_size())?;
        config.validate(device.block_size(), device.block_count())?;
        let region = LogRegion::new(&config.geometry);
        let cache = Arc::new(BufferCache::new(Arc::clone(&device)));
        let state = JournalState {
            phase: Phase::Unmounted,
            arena: NodeArena::new(config.node_pool_size),
            index: DirtyIndex::new(),
            open: OpenTransaction::new(0, 0, 0, config.freed_region_bits),
            lists: VecDeque::new(),
            header: JournalHeader {
                last_flush_id: 0,
                first_unflushed: 0,
                mount_id: 0,
            },
            last_committed: 0,
            checkpoint_wanted: false,
            shutdown: false,
            counters: JournalCounters::default(),
            report: None,
        };
        let inner = JournalInner {
            block_size: device.block_size(),
            config,
            device,
            cache,
            region,
            state: Mutex::new(state),
            changed: Condvar::new(),
            flush_lock: Mutex::new(()),
        };
        Ok(Self {
            inner: Arc::new(inner),
            worker: Mutex::new(None),
        })
    }

    /// Build a journal and run recovery.
    pub fn open(device: Arc<dyn BlockDevice>, config: JournalConfig) -> JournalResult<Self> {
        let journal = Self::new(device, config)?;
        journal.mount_recover()?;
        Ok(journal)
    }

    /// Replay the log and make the journal ready for transactions. Runs once.
    pub fn mount_recover(&self) -> JournalResult<RecoveryReport> {
        {
            let mut state = self.inner.state.lock();
            if state.phase != Phase::Unmounted {
                return Err(JournalError::ContractViolation(
                    "mount_recover called on a mounted journal".to_string(),
                ));
            }
            state.phase = Phase::Recovering;
        }

        let recovered =
            match recovery::recover(self.inner.device.as_ref(), self.inner.region, &self.inner.config)
            {
                Ok(recovered) => recovered,
                Err(e) => {
                    self.inner.state.lock().phase = Phase::Unmounted;
                    return Err(e);
                }
            };

        let live = {
            let mut state = self.inner.state.lock();
            let header = recovered.header;
            state.header = header;
            state.last_committed = header.last_flush_id;
            state.open = OpenTransaction::new(
                recovered.next_id,
                0,
                header.first_unflushed,
                self.inner.config.freed_region_bits,
            );
            state.report = Some(recovered.report.clone());
            state.phase = match recovered.read_only {
                Some(reason) => {
                    warn!(%reason, "Journal mounted read-only");
                    Phase::ReadOnly(reason)
                }
                None => Phase::Live,
            };
            state.is_live()
        };

        if live && self.inner.config.commit_mode == CommitMode::Background {
            let worker = CommitWorker::spawn(Arc::clone(&self.inner))?;
            *self.worker.lock() = Some(worker);
        }
        info!(
            device = self.inner.device.name(),
            mount_id = recovered.report.mount_id,
            replayed = recovered.report.transactions_replayed,
            read_only = recovered.report.read_only,
            "Journal mounted"
        );
        Ok(recovered.report)
    }

    /// Join the open transaction, waiting while it is closing, over its
    /// thresholds, or short of log slots or nodes. `hint` is the number of
    /// blocks the caller expects to register.
    pub fn begin(&self, hint: u32) -> JournalResult<TransactionHandle> {
        self.inner.admit(hint, Admission::Begin)
    }

    /// Join the running transaction even if it is over its batching
    /// thresholds or closing.
    pub fn join(&self, hint: u32) -> JournalResult<TransactionHandle> {
        self.inner.admit(hint, Admission::Join)
    }

    /// Like [`Journal::begin`] but fails with `WouldBlock` instead of waiting.
    pub fn try_begin(&self, hint: u32) -> JournalResult<TransactionHandle> {
        self.inner.admit(hint, Admission::Try)
    }

    /// Deepen a handle; each nest needs a matching `end`.
    pub fn nest(&self, handle: &mut TransactionHandle) -> JournalResult<()> {
        let mut state = self.inner.state.lock();
        state.ensure_writable()?;
        self.inner.check_handle(&mut state, handle)?;
        handle.depth += 1;
        Ok(())
    }

    /// Release a writer reference. The outermost end of the last writer may
    /// close the transaction; with `WAIT_FOR_DURABLE` or `FLUSH_ALL` this
    /// returns only after the commit block is durable.
    ///
    /// Buffer guards obtained from `register_dirty` must be dropped first.
    pub fn end(&self, handle: &mut TransactionHandle, flags: EndFlags) -> JournalResult<()> {
        self.inner.end(handle, flags)
    }

    /// Add `block` to the open transaction and return its pinned buffer.
    /// Modifications to the buffer become part of the transaction.
    pub fn register_dirty(
        &self,
        handle: &TransactionHandle,
        block: u64,
    ) -> JournalResult<Arc<BlockBuffer>> {
        let inner = &self.inner;
        inner.check_block(block)?;
        let buffer = inner.cache.get(block)?;

        let mut guard = inner.state.lock();
        guard.ensure_writable()?;
        inner.check_handle(&mut guard, handle)?;
        let state = &mut *guard;

        if let Some(id) = state.index.lookup(block) {
            state.open.chain.relink(&mut state.arena, id);
            state.counters.relinks += 1;
            buffer.mark_dirty();
            return Ok(buffer);
        }

        let len = state.open.len();
        if len + 1 > u64::from(inner.config.trans_max) {
            return Err(JournalError::TransactionFull {
                txn_id: state.open.id,
                len: len as u32,
                limit: inner.config.trans_max,
            });
        }
        if state.used_slots() + unit_slots(len + 1) > inner.region.len() {
            return Err(JournalError::ResourceExhausted(format!(
                "no log slot left for block {block} in transaction {}",
                state.open.id
            )));
        }
        let id = state
            .arena
            .alloc(BlockNode::new(block, state.open.id, Arc::clone(&buffer)))?;
        state.open.chain.push_back(&mut state.arena, id);
        state.index.insert_current(block, id);
        buffer.mark_dirty();
        trace!(block, txn_id = state.open.id, "Registered dirty block");
        Ok(buffer)
    }

    /// Record that `block` was freed by the open transaction. It may not be
    /// reallocated until that transaction's commit is durable.
    pub fn register_freed(&self, handle: &TransactionHandle, block: u64) -> JournalResult<()> {
        let inner = &self.inner;
        inner.check_block(block)?;
        let mut guard = inner.state.lock();
        guard.ensure_writable()?;
        inner.check_handle(&mut guard, handle)?;
        let state = &mut *guard;

        if let Some(id) = state.index.remove_current(block) {
            state.open.chain.unlink(&mut state.arena, id);
            if let Err(e) = state.arena.release(id) {
                return Err(inner.violation(state, e.to_string()));
            }
            state.counters.freed_unlogged += 1;
            if state.index.lookup_any(block).is_empty() {
                if let Some(buffer) = inner.cache.get_if_cached(block) {
                    buffer.mark_clean();
                }
            }
        }

        state.open.freed.mark(block);
        let freer = state.open.id;
        for &id in state.index.lookup_any(block) {
            if let Some(node) = state.arena.get_mut(id) {
                node.freed_by.get_or_insert(freer);
            }
        }
        trace!(block, txn_id = freer, "Registered freed block");
        Ok(())
    }

    /// Whether the allocator may hand out `block`: false while a transaction
    /// that freed it has not made its commit durable.
    pub fn may_allocate(&self, block: u64) -> bool {
        let state = self.inner.state.lock();
        !(state.open.freed.contains(block)
            || state.lists.iter().any(|list| list.blocks_reuse(block)))
    }

    /// Transactions still holding `block`: closed but not checkpointed, and
    /// the open one if it registered the block.
    pub fn in_journal(&self, block: u64) -> Vec<TxnId> {
        let state = self.inner.state.lock();
        let mut owners: Vec<TxnId> = state
            .index
            .lookup_any(block)
            .iter()
            .filter_map(|id| state.arena.get(*id).map(|node| node.owner))
            .collect();
        if state.index.lookup(block).is_some() {
            owners.push(state.open.id);
        }
        owners
    }

    /// Close the open transaction if it is at least `max_age` old, then
    /// commit and checkpoint per policy. Returns whether it was closed.
    pub fn flush_old(&self, max_age: Duration) -> JournalResult<bool> {
        let closed = {
            let mut state = self.inner.state.lock();
            state.ensure_writable()?;
            if state.open.has_work() && state.open.age() >= max_age {
                if state.open.writers == 0 {
                    self.inner.close_open(&mut state)
                } else {
                    state.open.close_requested = true;
                    false
                }
            } else {
                false
            }
        };
        self.inner.changed.notify_all();
        self.inner.pump()?;
        Ok(closed)
    }

    /// Commit pending lists, then checkpoint every committed list up to and
    /// including `list_id` (all of them with `force_all`). Returns the
    /// number of lists released.
    pub fn checkpoint(&self, list_id: TxnId, force_all: bool) -> JournalResult<usize> {
        let target = if force_all {
            CheckpointTarget::All
        } else {
            CheckpointTarget::UpTo(list_id)
        };
        self.inner.state.lock().ensure_writable()?;
        self.inner.checkpoint_now(target)
    }

    /// Close the open transaction (once its writers finish) and make every
    /// closed transaction durable. Returns the newest committed id.
    pub fn sync(&self) -> JournalResult<TxnId> {
        let inner = &self.inner;
        {
            let mut state = inner.state.lock();
            state.ensure_writable()?;
            if state.open.has_work() {
                let generation = state.open.generation;
                inner.request_close(&mut state);
                inner.changed.notify_all();
                while state.open.generation == generation {
                    state.ensure_writable()?;
                    inner.wait(&mut state);
                }
            }
        }
        let flush = inner.flush_lock.lock();
        inner.commit_pending(&flush)?;
        let last = inner.state.lock().last_committed;
        Ok(last)
    }

    /// Clean unmount: commit and checkpoint everything, stop the committer.
    pub fn release(&self) -> JournalResult<()> {
        let phase = self.inner.state.lock().phase.clone();
        match phase {
            Phase::Live => {
                {
                    let mut state = self.inner.state.lock();
                    if state.open.writers > 0 {
                        let writers = state.open.writers;
                        return Err(self
                            .inner
                            .violation(&mut state, format!("release with {writers} active writers")));
                    }
                }
                self.sync()?;
                self.inner.checkpoint_now(CheckpointTarget::All)?;
                self.stop_worker();
                let mut state = self.inner.state.lock();
                state.phase = Phase::Released;
                self.inner.changed.notify_all();
                info!(
                    device = self.inner.device.name(),
                    last_flush_id = state.header.last_flush_id,
                    "Journal released"
                );
                Ok(())
            }
            Phase::ReadOnly(_) | Phase::Unmounted | Phase::Released => {
                self.stop_worker();
                self.inner.state.lock().phase = Phase::Released;
                Ok(())
            }
            Phase::Aborted(reason) => {
                self.stop_worker();
                Err(JournalError::Aborted(reason))
            }
            Phase::Recovering => Err(JournalError::NotMounted),
        }
    }

    /// Take the instance down: every later write fails and waiters wake
    /// with `Aborted`.
    pub fn abort(&self, reason: impl Into<String>) {
        let mut state = self.inner.state.lock();
        self.inner.abort_locked(&mut state, reason.into());
    }

    /// Whether the instance refuses writes (aborted or mounted read-only).
    pub fn is_read_only(&self) -> bool {
        matches!(
            self.inner.state.lock().phase,
            Phase::Aborted(_) | Phase::ReadOnly(_)
        )
    }

    /// Snapshot of counters and gauges.
    pub fn stats(&self) -> JournalStats {
        let state = self.inner.state.lock();
        JournalStats {
            mount_id: state.header.mount_id,
            read_only: matches!(state.phase, Phase::Aborted(_) | Phase::ReadOnly(_)),
            open_txn_id: state.open.id,
            open_writers: state.open.writers,
            open_blocks: state.open.len(),
            pending_lists: state.lists.len(),
            last_committed_id: state.last_committed,
            last_flushed_id: state.header.last_flush_id,
            log_used_slots: state.used_slots(),
            log_slots: self.inner.region.len(),
            free_nodes: state.arena.free_count(),
            live_nodes: state.arena.live(),
            node_capacity: state.arena.capacity(),
            indexed_blocks: state.index.global_blocks(),
            pending_frees: state.open.freed.len()
                + state
                    .lists
                    .iter()
                    .filter(|list| !list.state.is_durable())
                    .map(|list| list.freed.len())
                    .sum::<usize>(),
            counters: state.counters.clone(),
        }
    }

    /// Report from the last `mount_recover`.
    pub fn recovery_report(&self) -> Option<RecoveryReport> {
        self.inner.state.lock().report.clone()
    }

    /// The buffer cache in front of the device.
    pub fn cache(&self) -> &Arc<BufferCache> {
        &self.inner.cache
    }

    /// The device the journal writes to.
    pub fn device(&self) -> &Arc<dyn BlockDevice> {
        &self.inner.device
    }

    /// The configuration in effect.
    pub fn config(&self) -> &JournalConfig {
        &self.inner.config
    }

    fn stop_worker(&self) {
        let Some(worker) = self.worker.lock().take() else {
            return;
        };
        self.inner.state.lock().shutdown = true;
        self.inner.changed.notify_all();
        worker.join();
    }
}

impl Drop for Journal {
    fn drop(&mut self) {
        self.stop_worker();
    }
}
