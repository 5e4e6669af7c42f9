// SPDX-License-Identifier: PMPL-1.0-or-later
//
// Journal configuration
// Copyright (c) 2026 Keel contributors
//
// Geometry says where the journal lives on the volume; everything else is a
// tunable. Batching thresholds default from the log size the way classic
// block journals derive them:
// - trans_max: an eighth of the log, capped at 1024 blocks
// - max_batch: 90% of trans_max
// - max_trans_age: 5 s, max_commit_age: 30 s
// - node pool: one node per log slot plus one open transaction

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{JournalError, JournalResult};
use crate::layout;

/// Where the journal lives on the volume.
///
/// The header block sits outside the log region; the log region is
/// `log_blocks` consecutive blocks starting at `log_start`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct JournalGeometry {
    /// Block holding the journal header.
    pub header_block: u64,
    /// First block of the circular log region.
    pub log_start: u64,
    /// Number of blocks in the log region.
    pub log_blocks: u64,
}

impl JournalGeometry {
    /// Build a geometry with the header immediately before the log.
    pub fn contiguous(header_block: u64, log_blocks: u64) -> Self {
        Self {
            header_block,
            log_start: header_block + 1,
            log_blocks,
        }
    }

    /// Whether `block` belongs to the journal (header or log region).
    pub fn contains(&self, block: u64) -> bool {
        block == self.header_block
            || (block >= self.log_start && block < self.log_start + self.log_blocks)
    }

    /// Check the geometry fits a device of `block_count` blocks.
    pub fn validate(&self, block_count: u64) -> JournalResult<()> {
        if self.log_blocks < 8 {
            return Err(JournalError::Config(format!(
                "log region of {} blocks is too small (minimum 8)",
                self.log_blocks
            )));
        }
        let log_end = self
            .log_start
            .checked_add(self.log_blocks)
            .ok_or_else(|| JournalError::Config("log region overflows u64".to_string()))?;
        if log_end > block_count || self.header_block >= block_count {
            return Err(JournalError::Config(format!(
                "journal (header {}, log {}..{log_end}) does not fit a {block_count}-block device",
                self.header_block, self.log_start
            )));
        }
        if self.header_block >= self.log_start && self.header_block < log_end {
            return Err(JournalError::Config(
                "header block lies inside the log region".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for JournalGeometry {
    fn default() -> Self {
        Self::contiguous(1, 1024)
    }
}

/// Who performs commit I/O.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommitMode {
    /// A dedicated committer thread writes closed transactions.
    Background,
    /// The thread that closes a transaction writes it before returning.
    Inline,
}

/// What to do when replay meets a corrupt but well-formed transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryPolicy {
    /// Refuse to mount.
    FailMount,
    /// Replay up to the corrupt transaction and mount read-only.
    ReadOnly,
}

/// Configuration for a journal instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JournalConfig {
    /// On-disk location of the journal.
    pub geometry: JournalGeometry,
    /// Hard limit on blocks logged by a single transaction.
    pub trans_max: u32,
    /// High-water mark: a transaction reaching this many blocks is closed.
    pub max_batch: u32,
    /// A transaction older than this is closed when its writers finish.
    pub max_trans_age_ms: u64,
    /// Committed transactions older than this are checkpointed.
    pub max_commit_age_ms: u64,
    /// Capacity of the block reference node pool.
    pub node_pool_size: usize,
    /// Free node count at or below which transactions close early and
    /// admission waits for checkpoint.
    pub node_pool_low_water: usize,
    /// Bits per lazily allocated freed-block sub-bitmap.
    pub freed_region_bits: u32,
    /// Fraction of the log region in use above which checkpointing starts.
    pub checkpoint_threshold: f64,
    /// Who performs commit I/O.
    pub commit_mode: CommitMode,
    /// Reaction to corruption found during replay.
    pub recovery_policy: RecoveryPolicy,
}

impl JournalConfig {
    /// Defaults derived from the size of the log region.
    pub fn for_geometry(geometry: JournalGeometry) -> Self {
        let trans_max = (geometry.log_blocks / 8).clamp(1, 1024) as u32;
        let max_batch = (trans_max * 9 / 10).max(1);
        Self {
            geometry,
            trans_max,
            max_batch,
            max_trans_age_ms: 5_000,
            max_commit_age_ms: 30_000,
            node_pool_size: geometry.log_blocks as usize + trans_max as usize,
            node_pool_low_water: trans_max as usize / 4,
            freed_region_bits: 4096,
            checkpoint_threshold: 0.5,
            commit_mode: CommitMode::Background,
            recovery_policy: RecoveryPolicy::FailMount,
        }
    }

    /// `max_trans_age_ms` as a `Duration`.
    pub fn max_trans_age(&self) -> Duration {
        Duration::from_millis(self.max_trans_age_ms)
    }

    /// `max_commit_age_ms` as a `Duration`.
    pub fn max_commit_age(&self) -> Duration {
        Duration::from_millis(self.max_commit_age_ms)
    }

    /// Parse a JSON configuration. Missing fields take their defaults.
    pub fn from_json_str(json: &str) -> JournalResult<Self> {
        serde_json::from_str(json).map_err(|e| JournalError::Config(e.to_string()))
    }

    /// Load a JSON configuration file.
    pub fn from_file(path: impl AsRef<Path>) -> JournalResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| JournalError::Config(format!("{}: {e}", path.display())))?;
        Self::from_json_str(&text)
    }

    /// Check the configuration against a device's geometry.
    pub fn validate(&self, block_size: usize, block_count: u64) -> JournalResult<()> {
        self.geometry.validate(block_count)?;

        let capacity = layout::max_transaction_blocks(block_size);
        if self.trans_max == 0 || self.trans_max as usize > capacity {
            return Err(JournalError::Config(format!(
                "trans_max {} must be between 1 and {capacity} for {block_size}-byte blocks",
                self.trans_max
            )));
        }
        if u64::from(self.trans_max) + 2 > self.geometry.log_blocks / 2 {
            return Err(JournalError::Config(format!(
                "trans_max {} needs a log of at least {} blocks",
                self.trans_max,
                (u64::from(self.trans_max) + 2) * 2
            )));
        }
        if self.max_batch == 0 || self.max_batch > self.trans_max {
            return Err(JournalError::Config(format!(
                "max_batch {} must be between 1 and trans_max {}",
                self.max_batch, self.trans_max
            )));
        }
        if self.node_pool_size < self.trans_max as usize + self.node_pool_low_water {
            return Err(JournalError::Config(format!(
                "node_pool_size {} must cover trans_max {} plus low water {}",
                self.node_pool_size, self.trans_max, self.node_pool_low_water
            )));
        }
        if self.freed_region_bits == 0 || self.freed_region_bits % 64 != 0 {
            return Err(JournalError::Config(format!(
                "freed_region_bits {} must be a positive multiple of 64",
                self.freed_region_bits
            )));
        }
        if !(self.checkpoint_threshold > 0.0 && self.checkpoint_threshold <= 1.0) {
            return Err(JournalError::Config(format!(
                "checkpoint_threshold {} must be in (0, 1]",
                self.checkpoint_threshold
            )));
        }
        Ok(())
    }
}

impl Default for JournalConfig {
    fn default() -> Self {
        Self::for_geometry(JournalGeometry::default())
    }
}
