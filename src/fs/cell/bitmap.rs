//! In-memory free bitmaps.
//!
//! Two bit arrays track which inodes and which blocks are in use: bit `k` corresponds to inode
//! or block number `k`. Both are loaded from their on-disk regions at mount time and written
//! back on sync. On disk the bits are packed LSB-first within each byte.
//!
//! Allocation is greedy-lowest; there is no defragmentation, freeing a contiguous run simply
//! restores it.

use alloc::vec;
use alloc::vec::Vec;

use vob::Vob;

use crate::fs::cell::inode::InodeNumber;
use crate::io::BlockNumber;

fn bits_from_bytes(raw: &[u8], count: usize) -> Vob {
    let mut bits = Vob::with_capacity(count);
    for k in 0..count {
        bits.push(raw[k / 8] >> (k % 8) & 1 == 1);
    }

    bits
}

fn bits_to_bytes(bits: &Vob) -> Vec<u8> {
    let mut raw = vec![0u8; bits.len().div_ceil(8)];
    for k in bits.iter_set_bits(..) {
        raw[k / 8] |= 1 << (k % 8);
    }

    raw
}

/// Returns the lowest index of `n` consecutive unset bits, starting the scan at `from`.
fn first_clear_run(bits: &Vob, from: usize, n: usize) -> Option<usize> {
    let mut run_start = 0;
    let mut prev = None;

    for idx in bits.iter_unset_bits(from..) {
        match prev {
            Some(p) if idx == p + 1 => (),
            _ => run_start = idx,
        }
        prev = Some(idx);

        if idx + 1 - run_start == n {
            return Some(run_start);
        }
    }

    None
}

/// Tracks whether each inode number of the pool is in use.
pub(crate) struct InodeBitmap(Vob);

impl InodeBitmap {
    /// Decodes an inode bitmap from its on-disk region. `raw` must cover at least
    /// `nr_inodes` bits.
    pub(crate) fn from_bytes(raw: &[u8], nr_inodes: u32) -> Self {
        Self(bits_from_bytes(raw, nr_inodes as usize))
    }

    /// Encodes the bitmap back to its on-disk byte representation.
    pub(crate) fn to_bytes(&self) -> Vec<u8> {
        bits_to_bytes(&self.0)
    }

    /// Checks if a given inode, identified by its [`InodeNumber`], is marked in-use.
    pub(crate) fn inode_in_use(&self, inode: InodeNumber) -> bool {
        self.0.get(usize::from(inode)).unwrap_or(true)
    }

    /// Marks a given inode, identified by its [`InodeNumber`], as in-use.
    pub(crate) fn set_inode_in_use(&mut self, inode: InodeNumber) -> bool {
        self.0.set(usize::from(inode), true)
    }

    /// Frees a given inode, identified by its [`InodeNumber`].
    pub(crate) fn free_inode(&mut self, inode: InodeNumber) -> bool {
        self.0.set(usize::from(inode), false)
    }

    /// Returns the lowest free inode number. Inode 0 is reserved and never returned.
    pub(crate) fn first_free(&self) -> Option<InodeNumber> {
        self.0.iter_unset_bits(1..).next().map(InodeNumber::from)
    }

    /// Returns the count of inodes marked as free.
    pub(crate) fn count_free(&self) -> u32 {
        self.0
            .iter_unset_bits(..)
            .count()
            .try_into()
            .expect("invalid conversion")
    }
}

/// Tracks whether each block of the pool is in use.
pub(crate) struct BlockBitmap(Vob);

impl BlockBitmap {
    /// Decodes a block bitmap from its on-disk region. `raw` must cover at least
    /// `nr_blocks` bits.
    pub(crate) fn from_bytes(raw: &[u8], nr_blocks: u32) -> Self {
        Self(bits_from_bytes(raw, nr_blocks as usize))
    }

    /// Encodes the bitmap back to its on-disk byte representation.
    pub(crate) fn to_bytes(&self) -> Vec<u8> {
        bits_to_bytes(&self.0)
    }

    /// Checks if a given block, identified by its [`BlockNumber`], is marked in-use.
    pub(crate) fn blk_in_use(&self, blk: BlockNumber) -> bool {
        self.0.get(usize::from(blk)).unwrap_or(true)
    }

    /// Marks a given block, identified by its [`BlockNumber`], as in-use.
    pub(crate) fn set_blk_in_use(&mut self, blk: BlockNumber) -> bool {
        self.0.set(usize::from(blk), true)
    }

    /// Frees a given block, identified by its [`BlockNumber`].
    pub(crate) fn free_blk(&mut self, blk: BlockNumber) -> bool {
        self.0.set(usize::from(blk), false)
    }

    /// Returns the lowest-index run of `n` consecutive free blocks. Block 0 holds the
    /// superblock and is never part of a run.
    pub(crate) fn first_free_run(&self, n: u32) -> Option<BlockNumber> {
        first_clear_run(&self.0, 1, n as usize).map(BlockNumber::from)
    }

    /// Returns the count of blocks marked as free.
    pub(crate) fn count_free(&self) -> u32 {
        self.0
            .iter_unset_bits(..)
            .count()
            .try_into()
            .expect("invalid conversion")
    }
}
