//! Image formatter.
//!
//! Lays down an empty `cellfs` on a block device: superblock, zeroed inode table, the two
//! bitmap regions and an empty root directory at inode 1 whose index block is the first data
//! block. Everything after the root's index block is free space.

use alloc::vec;

use bytemuck::bytes_of;

use crate::errors::FsError;
use crate::fs::cell::bitmap::{BlockBitmap, InodeBitmap};
use crate::fs::cell::inode::{Inode, InodeFileMode, InodeNumber, INODES_PER_BLOCK, INLINE_DATA_LEN};
use crate::fs::cell::sb::{FsMagic, RawSuperblock};
use crate::fs::FsResult;
use crate::io::{BlockDevice, BlockNumber, BLOCK_SIZE};
use crate::time::UnixTimestamp32;
use crate::info;

/// Bits held by one bitmap block.
const BITS_PER_BLOCK: u32 = (BLOCK_SIZE * 8) as u32;

/// Formats `dev` as an empty file system with a pool of `nr_inodes` inodes.
///
/// The block pool spans the whole device. Fails with [`FsError::Invalid`] when the inode pool
/// is too small to hold a root, and [`FsError::NoSpace`] when the device cannot fit its own
/// metadata regions plus the root directory.
pub fn format<D: BlockDevice>(dev: &D, nr_inodes: u32) -> FsResult<()> {
    if nr_inodes < 2 {
        return Err(FsError::Invalid);
    }

    let nr_blocks = dev.block_count();
    let nr_istore_blocks = nr_inodes.div_ceil(INODES_PER_BLOCK as u32);
    let nr_ifree_blocks = nr_inodes.div_ceil(BITS_PER_BLOCK);
    let nr_bfree_blocks = nr_blocks.div_ceil(BITS_PER_BLOCK);

    let data_start = 1 + nr_istore_blocks + nr_ifree_blocks + nr_bfree_blocks;
    // one data block is consumed right away by the root's index
    if nr_blocks <= data_start {
        return Err(FsError::NoSpace);
    }

    let root_index = BlockNumber(data_start);

    let sb = RawSuperblock {
        magic: FsMagic::CELL,
        nr_blocks,
        nr_inodes,
        nr_istore_blocks,
        nr_ifree_blocks,
        nr_bfree_blocks,
        nr_free_inodes: nr_inodes - 2,
        nr_free_blocks: nr_blocks - data_start - 1,
    };

    let mut block = vec![0u8; BLOCK_SIZE];
    block[..core::mem::size_of::<RawSuperblock>()].copy_from_slice(bytes_of(&sb));
    dev.write_block(BlockNumber(0), &block)?;

    // inode table: all records zero, except the root directory at inode 1
    let root = Inode {
        num: InodeNumber::ROOT,
        mode: InodeFileMode::S_IFDIR | InodeFileMode(0o755),
        uid: 0,
        gid: 0,
        size: BLOCK_SIZE as u32,
        ctime: UnixTimestamp32(0),
        atime: UnixTimestamp32(0),
        mtime: UnixTimestamp32(0),
        blocks: 1,
        nlink: 2,
        ei_block: root_index,
        i_data: [0; INLINE_DATA_LEN],
    };

    block.fill(0);
    let root_raw = root.to_raw();
    let root_offset = core::mem::size_of_val(&root_raw);
    block[root_offset..root_offset * 2].copy_from_slice(bytes_of(&root_raw));
    dev.write_block(BlockNumber(1), &block)?;

    block.fill(0);
    for bno in 2..=nr_istore_blocks {
        dev.write_block(BlockNumber(bno), &block)?;
    }

    // inode bitmap: 0 (reserved) and 1 (root) in use
    let mut ifree = InodeBitmap::from_bytes(&vec![0u8; nr_inodes.div_ceil(8) as usize], nr_inodes);
    ifree.set_inode_in_use(InodeNumber::NONE);
    ifree.set_inode_in_use(InodeNumber::ROOT);
    write_region(dev, 1 + nr_istore_blocks, nr_ifree_blocks, &ifree.to_bytes())?;

    // block bitmap: the metadata regions and the root's index block in use
    let mut bfree = BlockBitmap::from_bytes(&vec![0u8; nr_blocks.div_ceil(8) as usize], nr_blocks);
    for bno in 0..=data_start {
        bfree.set_blk_in_use(BlockNumber(bno));
    }
    write_region(
        dev,
        1 + nr_istore_blocks + nr_ifree_blocks,
        nr_bfree_blocks,
        &bfree.to_bytes(),
    )?;

    // the root directory starts with an empty extent list
    block.fill(0);
    dev.write_block(root_index, &block)?;

    dev.sync()?;

    info!(
        "cellfs",
        "formatted image: {} inodes, {} blocks ({} free)", nr_inodes, nr_blocks, sb.nr_free_blocks
    );

    Ok(())
}

fn write_region<D: BlockDevice>(
    dev: &D,
    start: u32,
    nr_blocks: u32,
    raw: &[u8],
) -> FsResult<()> {
    let mut block = vec![0u8; BLOCK_SIZE];

    for i in 0..nr_blocks as usize {
        block.fill(0);

        let lo = i * BLOCK_SIZE;
        let hi = usize::min(lo + BLOCK_SIZE, raw.len());
        if lo < hi {
            block[..hi - lo].copy_from_slice(&raw[lo..hi]);
        }

        dev.write_block(BlockNumber(start + i as u32), &block)?;
    }

    Ok(())
}
