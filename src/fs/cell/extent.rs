//! Extent lists and the per-inode index block.
//!
//! Every regular file and directory owns exactly one index block, named by the inode's
//! `ei_block` field. The index block starts with a live-entry count (meaningful for
//! directories only) followed by a fixed array of extents in ascending logical order; the
//! first unused extent slot terminates iteration. Each extent covers up to
//! [`MAX_BLOCKS_PER_EXTENT`] contiguous physical blocks.

use bytemuck::{Pod, Zeroable};

use crate::errors::FsError;
use crate::fs::cell::dir::{DirBlock, FILES_PER_BLOCK};
use crate::fs::cell::CellFs;
use crate::fs::FsResult;
use crate::io::{BlockDevice, BlockNumber, BlockNumberRange, BLOCK_SIZE};

/// Number of extents held by one index block.
pub const MAX_EXTENTS: usize = (BLOCK_SIZE - 4) / core::mem::size_of::<Extent>();

/// Number of blocks covered by one extent.
pub const MAX_BLOCKS_PER_EXTENT: usize = 8;

/// Number of directory slots covered by one extent.
pub const FILES_PER_EXT: usize = FILES_PER_BLOCK * MAX_BLOCKS_PER_EXTENT;

/// Maximum number of entries a directory can hold.
pub const MAX_SUBFILES: u32 = (FILES_PER_EXT * MAX_EXTENTS) as u32;

/// Maximum size of a regular file, in bytes.
pub const MAX_FILESIZE: u64 =
    (MAX_EXTENTS * MAX_BLOCKS_PER_EXTENT * BLOCK_SIZE) as u64;

/// One extent descriptor.
///
/// `ee_start == 0` marks the slot as unused. For directory inodes, `nr_files` counts the live
/// slots across the extent's blocks.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct Extent {
    /// First logical block this extent covers.
    pub ee_block: u32,

    /// Number of blocks covered by the extent.
    pub ee_len: u32,

    /// First physical block the extent points to.
    pub ee_start: BlockNumber,

    /// Number of live file slots in this extent (directories only).
    pub nr_files: u32,
}

impl Extent {
    pub fn is_live(&self) -> bool {
        self.ee_start != BlockNumber::NONE
    }

    /// The physical blocks covered by this extent.
    pub fn blocks(&self) -> BlockNumberRange {
        BlockNumberRange(self.ee_start, self.ee_start + self.ee_len)
    }

    /// Returns the slot to its unused state.
    pub(crate) fn clear(&mut self) {
        *self = Extent::zeroed();
    }
}

/// The content of an index block: a live-slot count and the extent array.
#[derive(Clone, Copy, Pod, Zeroable)]
#[repr(C)]
pub struct ExtentIndexBlock {
    /// Number of live file slots across the whole directory (zero for regular files).
    pub nr_files: u32,

    pub extents: [Extent; MAX_EXTENTS],
}

impl core::fmt::Debug for ExtentIndexBlock {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_fmt(format_args!("index block | nr_files = {}\n", self.nr_files))?;
        for (ei, ext) in self.live_extents() {
            f.write_fmt(format_args!(
                "  [{ei}] log {}..{} -> phys {} ({} live)\n",
                ext.ee_block,
                ext.ee_block + ext.ee_len,
                ext.ee_start,
                ext.nr_files
            ))?;
        }

        Ok(())
    }
}

impl ExtentIndexBlock {
    /// Iterates the live extents, in index order, stopping at the first unused slot.
    pub fn live_extents(&self) -> impl Iterator<Item = (usize, &Extent)> {
        self.extents
            .iter()
            .enumerate()
            .take_while(|(_, ext)| ext.is_live())
    }

    /// Whether the directory holding this index is at capacity.
    pub fn is_full(&self) -> bool {
        self.nr_files == MAX_SUBFILES
    }

    /// Picks the extent the next directory entry should land in: the first live extent that
    /// still has room, or failing that the first unused slot (which, extents being densely
    /// prefixed, sits right after the last live one).
    pub(crate) fn available_ext_idx(&self) -> Option<usize> {
        self.extents
            .iter()
            .position(|ext| !ext.is_live() || ext.nr_files != FILES_PER_EXT as u32)
    }

    /// Logical block offset a new extent at slot `ei` starts on.
    fn next_logical_start(&self, ei: usize) -> u32 {
        if ei == 0 {
            return 0;
        }

        let prev = &self.extents[ei - 1];
        prev.ee_block + prev.ee_len
    }
}

impl<D: BlockDevice> CellFs<D> {
    /// Allocates and initializes a fresh directory extent at index slot `ei`.
    ///
    /// Reserves [`MAX_BLOCKS_PER_EXTENT`] contiguous blocks, fills in the extent descriptor
    /// and resets every covered block to one block-wide free run. On an I/O failure after the
    /// blocks were reserved, the slot is cleared and the blocks returned to the bitmap.
    pub(crate) fn put_new_ext(&self, ei: usize, index: &mut ExtentIndexBlock) -> FsResult<()> {
        let nr_blocks = MAX_BLOCKS_PER_EXTENT as u32;
        let bno = self
            .sbi
            .write()
            .get_free_blocks(nr_blocks)
            .ok_or(FsError::NoSpace)?;

        index.extents[ei] = Extent {
            ee_block: index.next_logical_start(ei),
            ee_len: nr_blocks,
            ee_start: bno,
            nr_files: 0,
        };

        for blk in index.extents[ei].blocks() {
            let buf = match self.cache.get(blk) {
                Ok(buf) => buf,
                Err(err) => {
                    index.extents[ei].clear();
                    self.sbi.write().put_blocks(bno, nr_blocks);
                    return Err(err.into());
                }
            };

            let mut buf = buf.write();
            buf.zero();
            buf.write_as(&DirBlock::new_free());
        }

        Ok(())
    }
}
