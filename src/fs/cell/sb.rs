//! Superblock structures and free-space accounting.
//!
//! Block 0 carries the [`RawSuperblock`] record: the magic number, the pool sizes, the extent
//! of each metadata region and the two free counters. [`SbInfo`] is the in-memory, per-mount
//! companion holding the same counters next to the decoded bitmaps.
//!
//! The counters are authoritative for *how many* inodes and blocks are free; the bitmaps are
//! the source of truth for *which* ones. Both allocators below keep the two in step.

use bytemuck::{Pod, Zeroable};

use crate::fs::cell::bitmap::{BlockBitmap, InodeBitmap};
use crate::fs::cell::inode::{InodeNumber, RawInode, INODES_PER_BLOCK};
use crate::io::BlockNumber;

/// Magic number identifying the file system, spelled "DEADCELL" in hexspeak.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Pod, Zeroable)]
#[repr(transparent)]
pub struct FsMagic(pub u32);

impl FsMagic {
    pub const CELL: Self = Self(0xDEAD_CE11);

    pub fn is_valid(self) -> bool {
        self == Self::CELL
    }
}

/// On-disk superblock record, at the head of block 0. All fields little-endian `u32`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct RawSuperblock {
    pub magic: FsMagic,

    /// Total number of blocks, metadata regions included.
    pub nr_blocks: u32,

    /// Total number of inodes in the pool.
    pub nr_inodes: u32,

    /// Number of blocks used by the inode table.
    pub nr_istore_blocks: u32,

    /// Number of blocks used by the inode-free bitmap.
    pub nr_ifree_blocks: u32,

    /// Number of blocks used by the block-free bitmap.
    pub nr_bfree_blocks: u32,

    pub nr_free_inodes: u32,
    pub nr_free_blocks: u32,
}

/// Per-mount superblock information: the pool geometry, the free counters and the decoded
/// bitmaps.
///
/// One `SbInfo` exists per mounted file system and is threaded through every operation; there
/// is no process-global state.
pub struct SbInfo {
    pub nr_blocks: u32,
    pub nr_inodes: u32,
    pub nr_istore_blocks: u32,
    pub nr_ifree_blocks: u32,
    pub nr_bfree_blocks: u32,
    pub nr_free_inodes: u32,
    pub nr_free_blocks: u32,

    pub(crate) ifree: InodeBitmap,
    pub(crate) bfree: BlockBitmap,
}

impl SbInfo {
    pub(crate) fn new(raw: &RawSuperblock, ifree: InodeBitmap, bfree: BlockBitmap) -> Self {
        Self {
            nr_blocks: raw.nr_blocks,
            nr_inodes: raw.nr_inodes,
            nr_istore_blocks: raw.nr_istore_blocks,
            nr_ifree_blocks: raw.nr_ifree_blocks,
            nr_bfree_blocks: raw.nr_bfree_blocks,
            nr_free_inodes: raw.nr_free_inodes,
            nr_free_blocks: raw.nr_free_blocks,
            ifree,
            bfree,
        }
    }

    pub(crate) fn to_raw(&self) -> RawSuperblock {
        RawSuperblock {
            magic: FsMagic::CELL,
            nr_blocks: self.nr_blocks,
            nr_inodes: self.nr_inodes,
            nr_istore_blocks: self.nr_istore_blocks,
            nr_ifree_blocks: self.nr_ifree_blocks,
            nr_bfree_blocks: self.nr_bfree_blocks,
            nr_free_inodes: self.nr_free_inodes,
            nr_free_blocks: self.nr_free_blocks,
        }
    }

    /// First block of the inode table.
    pub fn istore_start(&self) -> BlockNumber {
        BlockNumber(1)
    }

    /// First block of the inode-free bitmap region.
    pub fn ifree_start(&self) -> BlockNumber {
        self.istore_start() + self.nr_istore_blocks
    }

    /// First block of the block-free bitmap region.
    pub fn bfree_start(&self) -> BlockNumber {
        self.ifree_start() + self.nr_ifree_blocks
    }

    /// First data block.
    pub fn data_start(&self) -> BlockNumber {
        self.bfree_start() + self.nr_bfree_blocks
    }

    /// Locates an inode record in the inode table: the block holding it, and the record's
    /// byte offset inside that block.
    pub(crate) fn inode_slot(&self, ino: InodeNumber) -> (BlockNumber, usize) {
        let idx = usize::from(ino);
        let block = self.istore_start() + (idx / INODES_PER_BLOCK) as u32;
        let offset = (idx % INODES_PER_BLOCK) * core::mem::size_of::<RawInode>();

        (block, offset)
    }

    /// Reserves the lowest free inode number. Inode 0 is never handed out.
    ///
    /// Returns `None` when the pool is exhausted.
    pub(crate) fn get_free_inode(&mut self) -> Option<InodeNumber> {
        let ino = self.ifree.first_free()?;
        self.ifree.set_inode_in_use(ino);
        self.nr_free_inodes -= 1;

        Some(ino)
    }

    /// Releases an inode number back to the pool.
    pub(crate) fn put_inode(&mut self, ino: InodeNumber) {
        debug_assert!(self.ifree.inode_in_use(ino), "double free of inode {ino}");

        self.ifree.free_inode(ino);
        self.nr_free_inodes += 1;
    }

    /// Reserves the lowest run of `n` consecutive free blocks, returning its first block.
    ///
    /// Returns `None` when no such run exists.
    pub(crate) fn get_free_blocks(&mut self, n: u32) -> Option<BlockNumber> {
        let bno = self.bfree.first_free_run(n)?;
        for blk in 0..n {
            self.bfree.set_blk_in_use(bno + blk);
        }
        self.nr_free_blocks -= n;

        Some(bno)
    }

    /// Releases a run of `n` blocks starting at `bno` back to the pool.
    pub(crate) fn put_blocks(&mut self, bno: BlockNumber, n: u32) {
        for blk in 0..n {
            debug_assert!(
                self.bfree.blk_in_use(bno + blk),
                "double free of block {}",
                bno + blk
            );
            self.bfree.free_blk(bno + blk);
        }
        self.nr_free_blocks += n;
    }
}
