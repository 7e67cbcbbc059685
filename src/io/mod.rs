//! Block device facade.
//!
//! The metadata engine talks to its backing storage exclusively through the [`BlockDevice`]
//! trait: synchronous reads and writes of fixed 4 KiB blocks addressed by [`BlockNumber`].
//! [`MemDisk`] provides a RAM-backed implementation, useful as a scratch image and for tests.
//!
//! Mutations go through the refcounted buffers of [`cache::BufCache`] rather than straight to
//! the device, so a whole multi-block operation can be flushed at once.

pub mod cache;

use alloc::vec;
use alloc::vec::Vec;

use bytemuck::{Pod, Zeroable};
use hashbrown::HashSet;
use spin::RwLock;

use crate::errors::{CanFail, IOError};

/// Size of a device block, in bytes.
pub const BLOCK_SIZE: usize = 4096;

/// A physical block address on the backing device.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Pod, Zeroable)]
#[repr(transparent)]
pub struct BlockNumber(pub u32);

impl BlockNumber {
    /// Block number 0 holds the superblock, and doubles as the "no block" marker in inode
    /// records.
    pub const NONE: Self = Self(0);
}

impl core::fmt::Display for BlockNumber {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_fmt(format_args!("{}", self.0))
    }
}

impl From<BlockNumber> for u32 {
    fn from(value: BlockNumber) -> Self {
        value.0
    }
}

impl From<u32> for BlockNumber {
    fn from(value: u32) -> Self {
        BlockNumber(value)
    }
}

impl From<BlockNumber> for usize {
    fn from(value: BlockNumber) -> Self {
        value.0.try_into().expect("invalid block number")
    }
}

impl From<usize> for BlockNumber {
    fn from(value: usize) -> Self {
        BlockNumber(value.try_into().expect("invalid block number (not 32-bit)"))
    }
}

impl core::ops::Add<u32> for BlockNumber {
    type Output = BlockNumber;

    fn add(self, rhs: u32) -> Self::Output {
        BlockNumber(self.0 + rhs)
    }
}

impl core::ops::Sub<u32> for BlockNumber {
    type Output = BlockNumber;

    fn sub(self, rhs: u32) -> Self::Output {
        BlockNumber(self.0.saturating_sub(rhs))
    }
}

/// A range of physical blocks, bounded inclusively below and exclusively above.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BlockNumberRange(pub BlockNumber, pub BlockNumber);

impl Iterator for BlockNumberRange {
    type Item = BlockNumber;

    fn next(&mut self) -> Option<Self::Item> {
        if self.0 < self.1 {
            self.0 = self.0 + 1;
            return Some(self.0 - 1);
        }

        None
    }
}

/// Synchronous access to a fixed-size array of [`BLOCK_SIZE`] blocks.
///
/// `read_block` and `write_block` transfer exactly one block; `sync` pushes anything the device
/// itself buffers down to durable storage.
pub trait BlockDevice {
    /// Total number of addressable blocks.
    fn block_count(&self) -> u32;

    /// Reads block `bno` into `buf`, which must be [`BLOCK_SIZE`] bytes long.
    fn read_block(&self, bno: BlockNumber, buf: &mut [u8]) -> CanFail<IOError>;

    /// Writes `buf`, which must be [`BLOCK_SIZE`] bytes long, to block `bno`.
    fn write_block(&self, bno: BlockNumber, buf: &[u8]) -> CanFail<IOError>;

    /// Flushes device-side write buffers.
    fn sync(&self) -> CanFail<IOError>;
}

/// A RAM-backed [`BlockDevice`].
///
/// Individual blocks can be marked faulty, in which case any transfer touching them fails with
/// [`IOError::Device`].
pub struct MemDisk {
    blocks: RwLock<Vec<u8>>,
    faulty: RwLock<HashSet<u32>>,
}

impl MemDisk {
    /// Creates a zero-filled in-memory device of `nr_blocks` blocks.
    pub fn new(nr_blocks: u32) -> Self {
        Self {
            blocks: RwLock::new(vec![0u8; nr_blocks as usize * BLOCK_SIZE]),
            faulty: RwLock::new(HashSet::new()),
        }
    }

    /// Marks a block as faulty, or clears the mark.
    pub fn set_faulty(&self, bno: BlockNumber, faulty: bool) {
        if faulty {
            self.faulty.write().insert(bno.0);
        } else {
            self.faulty.write().remove(&bno.0);
        }
    }

    fn check_access(&self, bno: BlockNumber, buf_len: usize) -> CanFail<IOError> {
        if buf_len != BLOCK_SIZE {
            return Err(IOError::Unknown);
        }

        if bno.0 >= self.block_count() {
            return Err(IOError::OutOfBounds);
        }

        if self.faulty.read().contains(&bno.0) {
            return Err(IOError::Device);
        }

        Ok(())
    }
}

impl BlockDevice for MemDisk {
    fn block_count(&self) -> u32 {
        (self.blocks.read().len() / BLOCK_SIZE) as u32
    }

    fn read_block(&self, bno: BlockNumber, buf: &mut [u8]) -> CanFail<IOError> {
        self.check_access(bno, buf.len())?;

        let blocks = self.blocks.read();
        let start = usize::from(bno) * BLOCK_SIZE;
        buf.copy_from_slice(&blocks[start..start + BLOCK_SIZE]);

        Ok(())
    }

    fn write_block(&self, bno: BlockNumber, buf: &[u8]) -> CanFail<IOError> {
        self.check_access(bno, buf.len())?;

        let mut blocks = self.blocks.write();
        let start = usize::from(bno) * BLOCK_SIZE;
        blocks[start..start + BLOCK_SIZE].copy_from_slice(buf);

        Ok(())
    }

    fn sync(&self) -> CanFail<IOError> {
        Ok(())
    }
}
