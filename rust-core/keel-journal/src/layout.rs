// SPDX-License-Identifier: PMPL-1.0-or-later
//
// Keel journal - On-disk block formats
// Copyright (c) 2026 Keel contributors
//
// Every journal block is exactly one device block. All integers are
// little-endian and the last four bytes of each block are a CRC32 of the
// bytes before them.
//
// Header block (outside the log region):
//   [0..8)    magic "KEELHDR1"
//   [8..16)   last_flush_id (u64)   -- newest transaction fully checkpointed
//   [16..24)  first_unflushed (u64) -- log slot of the oldest live unit
//   [24..28)  mount_id (u32)
//   [bs-4..)  crc32
//
// Descriptor block (first slot of a commit unit):
//   [0..8)    magic "KEELDSC1"
//   [8..16)   txn_id (u64)
//   [16..20)  len (u32)             -- number of content blocks
//   [20..24)  mount_id (u32)
//   [24..)    home addresses (u64 each), as many as fit
//   [bs-4..)  crc32
//
// Commit block (last slot of a commit unit):
//   [0..8)    magic "KEELCMT1"
//   [8..16)   txn_id (u64)
//   [16..20)  len (u32)
//   [20..24)  mount_id (u32)
//   [24..28)  content_crc (u32)     -- CRC32 over the content blocks in order
//   [28..)    addresses that did not fit in the descriptor
//   [bs-4..)  crc32

use crc32fast::Hasher as Crc32Hasher;
use serde::{Deserialize, Serialize};

use crate::error::{JournalError, JournalResult};

/// Magic bytes of the journal header block.
pub const HEADER_MAGIC: [u8; 8] = *b"KEELHDR1";

/// Magic bytes of a descriptor block.
pub const DESCRIPTOR_MAGIC: [u8; 8] = *b"KEELDSC1";

/// Magic bytes of a commit block.
pub const COMMIT_MAGIC: [u8; 8] = *b"KEELCMT1";

const CRC_SIZE: usize = 4;
const DESCRIPTOR_FIXED: usize = 24;
const COMMIT_FIXED: usize = 28;

/// Home addresses that fit in a descriptor block.
pub fn descriptor_capacity(block_size: usize) -> usize {
    block_size.saturating_sub(DESCRIPTOR_FIXED + CRC_SIZE) / 8
}

/// Overflow addresses that fit in a commit block.
pub fn commit_capacity(block_size: usize) -> usize {
    block_size.saturating_sub(COMMIT_FIXED + CRC_SIZE) / 8
}

/// Largest transaction the on-disk format can describe.
pub fn max_transaction_blocks(block_size: usize) -> usize {
    descriptor_capacity(block_size) + commit_capacity(block_size)
}

/// CRC32 over a sequence of content blocks, in log order.
pub fn content_crc<'a>(blocks: impl IntoIterator<Item = &'a [u8]>) -> u32 {
    let mut hasher = Crc32Hasher::new();
    for block in blocks {
        hasher.update(block);
    }
    hasher.finalize()
}

/// What a raw block looks like, judged by its magic alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockKind {
    /// Starts with the header magic.
    Header,
    /// Starts with the descriptor magic.
    Descriptor,
    /// Starts with the commit magic.
    Commit,
    /// Anything else (content blocks, stale data, zeroes).
    Other,
}

/// Classify a block by its magic.
pub fn peek_kind(buf: &[u8]) -> BlockKind {
    match buf.get(..8) {
        Some(magic) if magic == HEADER_MAGIC => BlockKind::Header,
        Some(magic) if magic == DESCRIPTOR_MAGIC => BlockKind::Descriptor,
        Some(magic) if magic == COMMIT_MAGIC => BlockKind::Commit,
        _ => BlockKind::Other,
    }
}

// ---------------------------------------------------------------------------
// JournalHeader
// ---------------------------------------------------------------------------

/// The journal header: where replay starts and which mount wrote it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct JournalHeader {
    /// Newest transaction whose blocks are all at their home locations.
    pub last_flush_id: u64,
    /// Log slot of the oldest commit unit that may still need replay.
    pub first_unflushed: u64,
    /// Mount generation that wrote this header.
    pub mount_id: u32,
}

impl JournalHeader {
    /// Serialize into one block of `block_size` bytes.
    pub fn encode(&self, block_size: usize) -> Vec<u8> {
        let mut buf = vec![0u8; block_size];
        buf[0..8].copy_from_slice(&HEADER_MAGIC);
        put_u64(&mut buf, 8, self.last_flush_id);
        put_u64(&mut buf, 16, self.first_unflushed);
        put_u32(&mut buf, 24, self.mount_id);
        seal(&mut buf);
        buf
    }

    /// Id the first transaction logged after this header will carry.
    pub fn next_txn_id(&self) -> JournalResult<u64> {
        self.last_flush_id.checked_add(1).ok_or_else(|| {
            JournalError::Format(format!(
                "header last_flush_id {} leaves no transaction ids",
                self.last_flush_id
            ))
        })
    }

    /// Parse a header block.
    pub fn decode(buf: &[u8]) -> JournalResult<Self> {
        check_frame(buf, &HEADER_MAGIC, 28 + CRC_SIZE, "header")?;
        Ok(Self {
            last_flush_id: get_u64(buf, 8),
            first_unflushed: get_u64(buf, 16),
            mount_id: get_u32(buf, 24),
        })
    }
}

// ---------------------------------------------------------------------------
// Descriptor
// ---------------------------------------------------------------------------

/// The first block of a commit unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Descriptor {
    /// Transaction this unit records.
    pub txn_id: u64,
    /// Number of content blocks in the unit.
    pub len: u32,
    /// Mount generation that wrote the unit.
    pub mount_id: u32,
    /// Leading home addresses; the rest live in the commit block.
    pub addresses: Vec<u64>,
}

impl Descriptor {
    /// Serialize into one block of `block_size` bytes.
    pub fn encode(&self, block_size: usize) -> JournalResult<Vec<u8>> {
        if self.addresses.len() > descriptor_capacity(block_size) {
            return Err(JournalError::Decode {
                what: "descriptor",
                detail: format!(
                    "{} addresses exceed capacity {}",
                    self.addresses.len(),
                    descriptor_capacity(block_size)
                ),
            });
        }
        let mut buf = vec![0u8; block_size];
        buf[0..8].copy_from_slice(&DESCRIPTOR_MAGIC);
        put_u64(&mut buf, 8, self.txn_id);
        put_u32(&mut buf, 16, self.len);
        put_u32(&mut buf, 20, self.mount_id);
        for (i, address) in self.addresses.iter().enumerate() {
            put_u64(&mut buf, DESCRIPTOR_FIXED + i * 8, *address);
        }
        seal(&mut buf);
        Ok(buf)
    }

    /// Parse a descriptor block.
    pub fn decode(buf: &[u8]) -> JournalResult<Self> {
        check_frame(buf, &DESCRIPTOR_MAGIC, DESCRIPTOR_FIXED + CRC_SIZE, "descriptor")?;
        let len = get_u32(buf, 16);
        if len as usize > max_transaction_blocks(buf.len()) {
            return Err(JournalError::Decode {
                what: "descriptor",
                detail: format!("length {len} exceeds what a unit can describe"),
            });
        }
        let count = (len as usize).min(descriptor_capacity(buf.len()));
        let addresses = (0..count)
            .map(|i| get_u64(buf, DESCRIPTOR_FIXED + i * 8))
            .collect();
        Ok(Self {
            txn_id: get_u64(buf, 8),
            len,
            mount_id: get_u32(buf, 20),
            addresses,
        })
    }
}

// ---------------------------------------------------------------------------
// CommitRecord
// ---------------------------------------------------------------------------

/// The last block of a commit unit. Its presence makes the unit valid.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitRecord {
    /// Transaction this unit records.
    pub txn_id: u64,
    /// Number of content blocks in the unit.
    pub len: u32,
    /// Mount generation that wrote the unit.
    pub mount_id: u32,
    /// CRC32 over the unit's content blocks in log order.
    pub content_crc: u32,
    /// Home addresses that did not fit in the descriptor.
    pub overflow: Vec<u64>,
}

impl CommitRecord {
    /// Serialize into one block of `block_size` bytes.
    pub fn encode(&self, block_size: usize) -> JournalResult<Vec<u8>> {
        if self.overflow.len() > commit_capacity(block_size) {
            return Err(JournalError::Decode {
                what: "commit",
                detail: format!(
                    "{} overflow addresses exceed capacity {}",
                    self.overflow.len(),
                    commit_capacity(block_size)
                ),
            });
        }
        let mut buf = vec![0u8; block_size];
        buf[0..8].copy_from_slice(&COMMIT_MAGIC);
        put_u64(&mut buf, 8, self.txn_id);
        put_u32(&mut buf, 16, self.len);
        put_u32(&mut buf, 20, self.mount_id);
        put_u32(&mut buf, 24, self.content_crc);
        for (i, address) in self.overflow.iter().enumerate() {
            put_u64(&mut buf, COMMIT_FIXED + i * 8, *address);
        }
        seal(&mut buf);
        Ok(buf)
    }

    /// Parse a commit block.
    pub fn decode(buf: &[u8]) -> JournalResult<Self> {
        check_frame(buf, &COMMIT_MAGIC, COMMIT_FIXED + CRC_SIZE, "commit")?;
        let len = get_u32(buf, 16) as usize;
        let in_descriptor = len.min(descriptor_capacity(buf.len()));
        let count = len - in_descriptor;
        if count > commit_capacity(buf.len()) {
            return Err(JournalError::Decode {
                what: "commit",
                detail: format!("length {len} exceeds what a unit can describe"),
            });
        }
        let overflow = (0..count)
            .map(|i| get_u64(buf, COMMIT_FIXED + i * 8))
            .collect();
        Ok(Self {
            txn_id: get_u64(buf, 8),
            len: len as u32,
            mount_id: get_u32(buf, 20),
            content_crc: get_u32(buf, 24),
            overflow,
        })
    }
}

/// Build the descriptor/commit pair for one transaction.
pub fn encode_unit(
    block_size: usize,
    txn_id: u64,
    mount_id: u32,
    addresses: &[u64],
    content_crc: u32,
) -> JournalResult<(Vec<u8>, Vec<u8>)> {
    let len = u32::try_from(addresses.len()).map_err(|_| JournalError::Decode {
        what: "descriptor",
        detail: "too many addresses".to_string(),
    })?;
    let split = addresses.len().min(descriptor_capacity(block_size));
    let descriptor = Descriptor {
        txn_id,
        len,
        mount_id,
        addresses: addresses[..split].to_vec(),
    };
    let commit = CommitRecord {
        txn_id,
        len,
        mount_id,
        content_crc,
        overflow: addresses[split..].to_vec(),
    };
    Ok((descriptor.encode(block_size)?, commit.encode(block_size)?))
}

/// Whether a descriptor and a commit block describe the same unit, and if
/// so the unit's full address list.
pub fn pair_addresses(descriptor: &Descriptor, commit: &CommitRecord) -> Option<Vec<u64>> {
    if descriptor.txn_id != commit.txn_id
        || descriptor.len != commit.len
        || descriptor.mount_id != commit.mount_id
    {
        return None;
    }
    let mut addresses = descriptor.addresses.clone();
    addresses.extend_from_slice(&commit.overflow);
    (addresses.len() == descriptor.len as usize).then_some(addresses)
}

fn check_frame(
    buf: &[u8],
    magic: &[u8; 8],
    min_len: usize,
    what: &'static str,
) -> JournalResult<()> {
    if buf.len() < min_len {
        return Err(JournalError::Decode {
            what,
            detail: format!("block of {} bytes is too short", buf.len()),
        });
    }
    if buf[0..8] != magic[..] {
        return Err(JournalError::Decode {
            what,
            detail: "bad magic".to_string(),
        });
    }
    let body = buf.len() - CRC_SIZE;
    let stored = get_u32(buf, body);
    let computed = crc32fast::hash(&buf[..body]);
    if stored != computed {
        return Err(JournalError::Decode {
            what,
            detail: format!("checksum mismatch: stored {stored:#010x}, computed {computed:#010x}"),
        });
    }
    Ok(())
}

fn seal(buf: &mut [u8]) {
    let body = buf.len() - CRC_SIZE;
    let crc = crc32fast::hash(&buf[..body]);
    put_u32(buf, body, crc);
}

fn put_u64(buf: &mut [u8], at: usize, value: u64) {
    buf[at..at + 8].copy_from_slice(&value.to_le_bytes());
}

fn put_u32(buf: &mut [u8], at: usize, value: u32) {
    buf[at..at + 4].copy_from_slice(&value.to_le_bytes());
}

fn get_u64(buf: &[u8], at: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&buf[at..at + 8]);
    u64::from_le_bytes(bytes)
}

fn get_u32(buf: &[u8], at: usize) -> u32 {
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&buf[at..at + 4]);
    u32::from_le_bytes(bytes)
}
