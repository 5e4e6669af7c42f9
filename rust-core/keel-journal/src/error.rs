// SPDX-License-Identifier: PMPL-1.0-or-later
//
// Keel journal - Error types
// Copyright (c) 2026 Keel contributors
//
// Four classes of failure: resource exhaustion (recoverable, callers wait or
// retry), device failure during commit or checkpoint (fatal, the instance
// goes read-only), corruption found while replaying the log (mount fails or
// comes up read-only), and contract violations by the caller (fatal).

use keel_block::DeviceError;
use thiserror::Error;

/// Errors that can occur during journal operations.
#[derive(Debug, Error)]
pub enum JournalError {
    /// The block device reported a failure.
    #[error("device error: {0}")]
    Device(#[from] DeviceError),

    /// A logged transaction failed validation in a way replay cannot skip
    /// (a valid description/commit pair pointing outside the volume or into
    /// the journal itself).
    #[error("journal corruption at log slot {offset}: {detail}")]
    Corruption {
        /// Log slot of the offending description block.
        offset: u64,
        /// What was wrong.
        detail: String,
    },

    /// A journal block could not be decoded (bad magic, checksum mismatch,
    /// impossible length). During replay this marks the end of the log.
    #[error("cannot decode {what} block: {detail}")]
    Decode {
        /// Which kind of block was being decoded.
        what: &'static str,
        /// Why decoding failed.
        detail: String,
    },

    /// The volume has no journal header; it was never formatted.
    #[error("invalid journal format: {0}")]
    Format(String),

    /// The configuration does not fit the device.
    #[error("invalid journal configuration: {0}")]
    Config(String),

    /// Node pool or log space exhausted; retry after checkpoint frees room.
    #[error("journal resources exhausted: {0}")]
    ResourceExhausted(String),

    /// A non-blocking admission would have had to wait.
    #[error("journal admission would block")]
    WouldBlock,

    /// The transaction cannot grow any further.
    #[error("transaction {txn_id} is full ({len} blocks, limit {limit})")]
    TransactionFull {
        /// The transaction that overflowed.
        txn_id: u64,
        /// Its current length in blocks.
        len: u32,
        /// The maximum number of blocks a transaction may log.
        limit: u32,
    },

    /// The block cannot be journaled (outside the volume or inside the
    /// journal area).
    #[error("block {block} cannot be journaled: {reason}")]
    InvalidBlock {
        /// The offending block address.
        block: u64,
        /// Why it was rejected.
        reason: &'static str,
    },

    /// The journal has been aborted; the instance is read-only.
    #[error("journal aborted: {0}")]
    Aborted(String),

    /// The journal is mounted read-only.
    #[error("journal is read-only")]
    ReadOnly,

    /// `mount_recover` has not been run (or the journal was released).
    #[error("journal is not mounted")]
    NotMounted,

    /// The caller broke the journal's usage contract (ending a transaction
    /// that is not open, freeing a node twice, ...). The instance is aborted.
    #[error("journal contract violation: {0}")]
    ContractViolation(String),
}

impl JournalError {
    /// Whether this error leaves the journal instance unusable for writes.
    pub fn is_fatal(&self) -> bool {
        match self {
            JournalError::Device(_)
            | JournalError::Corruption { .. }
            | JournalError::Format(_)
            | JournalError::Aborted(_)
            | JournalError::ReadOnly
            | JournalError::ContractViolation(_) => true,
            JournalError::Decode { .. }
            | JournalError::Config(_)
            | JournalError::ResourceExhausted(_)
            | JournalError::WouldBlock
            | JournalError::TransactionFull { .. }
            | JournalError::InvalidBlock { .. }
            | JournalError::NotMounted => false,
        }
    }
}

/// Convenience type alias for journal results.
pub type JournalResult<T> = Result<T, JournalError>;
