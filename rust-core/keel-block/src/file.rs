// SPDX-License-Identifier: PMPL-1.0-or-later
//
// File-backed block device.
// Copyright (c) 2026 Keel contributors
//
// Uses positional I/O (`pread`/`pwrite` via `FileExt`) so concurrent readers
// and writers never share a seek position. `flush` maps to `fdatasync`.

use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::device::{check_access, check_block_size, BlockDevice};
use crate::error::{DeviceError, DeviceResult};

/// A block device stored in a regular file or a raw device node.
#[derive(Debug)]
pub struct FileDevice {
    file: File,
    path: PathBuf,
    name: String,
    block_size: usize,
    block_count: u64,
    writable: bool,
}

impl FileDevice {
    /// Create (or truncate) an image file of `block_count` zeroed blocks.
    pub fn create(
        path: impl AsRef<Path>,
        block_size: usize,
        block_count: u64,
    ) -> DeviceResult<Self> {
        check_block_size(block_size)?;
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;
        file.set_len(block_count * block_size as u64)?;
        info!(path = %path.display(), block_size, block_count, "Created block image");
        Ok(Self::from_file(file, path, block_size, block_count, true))
    }

    /// Open an existing image. Falls back to read-only when the file cannot
    /// be opened for writing.
    pub fn open(path: impl AsRef<Path>, block_size: usize) -> DeviceResult<Self> {
        check_block_size(block_size)?;
        let path = path.as_ref().to_path_buf();
        let (file, writable) = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map(|file| (file, true))
            .or_else(|_| OpenOptions::new().read(true).open(&path).map(|file| (file, false)))?;

        let len = file.metadata()?.len();
        if len % block_size as u64 != 0 {
            return Err(DeviceError::Geometry(format!(
                "{} is {len} bytes, not a multiple of block size {block_size}",
                path.display()
            )));
        }
        let block_count = len / block_size as u64;
        debug!(path = %path.display(), block_count, writable, "Opened block image");
        Ok(Self::from_file(file, path, block_size, block_count, writable))
    }

    fn from_file(
        file: File,
        path: PathBuf,
        block_size: usize,
        block_count: u64,
        writable: bool,
    ) -> Self {
        let name = format!("file:{}", path.display());
        Self {
            file,
            path,
            name,
            block_size,
            block_count,
            writable,
        }
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether writes are permitted.
    pub fn is_writable(&self) -> bool {
        self.writable
    }

    fn offset(&self, block: u64) -> u64 {
        block * self.block_size as u64
    }
}

impl BlockDevice for FileDevice {
    fn read_block(&self, block: u64, buf: &mut [u8]) -> DeviceResult<()> {
        check_access(block, buf.len(), self.block_size, self.block_count)?;
        self.file.read_exact_at(buf, self.offset(block))?;
        Ok(())
    }

    fn write_block(&self, block: u64, data: &[u8]) -> DeviceResult<()> {
        check_access(block, data.len(), self.block_size, self.block_count)?;
        if !self.writable {
            return Err(DeviceError::ReadOnly);
        }
        self.file.write_all_at(data, self.offset(block))?;
        Ok(())
    }

    fn flush(&self) -> DeviceResult<()> {
        if self.writable {
            self.file.sync_data()?;
        }
        Ok(())
    }

    fn block_size(&self) -> usize {
        self.block_size
    }

    fn block_count(&self) -> u64 {
        self.block_count
    }

    fn name(&self) -> &str {
        &self.name
    }
}
