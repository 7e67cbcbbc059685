//! The `cellfs` metadata engine.
//!
//! On-disk layout, all blocks 4096 bytes, all integers little-endian:
//!
//! ```text
//! +---------------+
//! |  superblock   |  1 block
//! +---------------+
//! |  inode table  |  sbi.nr_istore_blocks blocks
//! +---------------+
//! | ifree bitmap  |  sbi.nr_ifree_blocks blocks
//! +---------------+
//! | bfree bitmap  |  sbi.nr_bfree_blocks blocks
//! +---------------+
//! |  data blocks  |  rest of the device
//! +---------------+
//! ```
//!
//! [`CellFs`] is the per-mount handle: it owns the buffer cache over the backing device, the
//! in-memory superblock info (free counters + bitmaps) and the clock stamping mutations. The
//! host is expected to serialize mutating operations that touch overlapping inodes; reads may
//! overlap freely.

use alloc::boxed::Box;
use alloc::vec::Vec;

use spin::RwLock;

use crate::errors::{CanFail, FsError, IOError, MountError};
use crate::fs::cell::bitmap::{BlockBitmap, InodeBitmap};
use crate::fs::cell::inode::{Inode, InodeNumber, RawInode};
use crate::fs::cell::sb::{RawSuperblock, SbInfo};
use crate::fs::FsResult;
use crate::io::cache::BufCache;
use crate::io::{BlockDevice, BlockNumber, BlockNumberRange, BLOCK_SIZE};
use crate::time::{Clock, UnixTimestamp32};
use crate::{error, info};

pub(super) mod bitmap;
pub mod dir;
pub mod extent;
pub mod inode;
pub mod mkfs;
pub mod ops;
pub mod sb;

/// A mounted `cellfs` file system.
pub struct CellFs<D: BlockDevice> {
    pub(crate) cache: BufCache<D>,
    pub(crate) sbi: RwLock<SbInfo>,
    clock: Box<dyn Clock>,
}

impl<D: BlockDevice> core::fmt::Debug for CellFs<D> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("CellFs").finish_non_exhaustive()
    }
}

impl<D: BlockDevice> CellFs<D> {
    /// Attaches to a formatted device.
    ///
    /// Reads and validates the superblock, then decodes both free bitmaps from their on-disk
    /// regions.
    ///
    /// # Errors
    ///
    /// [`MountError::BadSuperblock`] when the magic number does not match,
    /// [`MountError::IOError`] when the metadata region cannot be read.
    pub fn mount(dev: D, clock: Box<dyn Clock>) -> Result<Self, MountError> {
        let cache = BufCache::new(dev);

        let sb_buf = cache.get(BlockNumber(0)).map_err(|_| MountError::IOError)?;
        let raw: RawSuperblock = sb_buf.read().read_as();

        if !raw.magic.is_valid() {
            error!(
                "cellfs",
                "invalid superblock magic {:#010x}", raw.magic.0
            );
            return Err(MountError::BadSuperblock);
        }

        let ifree_start = 1 + raw.nr_istore_blocks;
        let ifree_raw = Self::read_region(&cache, ifree_start, raw.nr_ifree_blocks)
            .map_err(|_| MountError::IOError)?;
        let bfree_raw = Self::read_region(
            &cache,
            ifree_start + raw.nr_ifree_blocks,
            raw.nr_bfree_blocks,
        )
        .map_err(|_| MountError::IOError)?;

        let ifree = InodeBitmap::from_bytes(&ifree_raw, raw.nr_inodes);
        let bfree = BlockBitmap::from_bytes(&bfree_raw, raw.nr_blocks);

        debug_assert_eq!(raw.nr_free_inodes, ifree.count_free());
        debug_assert_eq!(raw.nr_free_blocks, bfree.count_free());

        info!(
            "cellfs",
            "mounted filesystem: {} inodes ({} free), {} blocks ({} free)",
            raw.nr_inodes,
            raw.nr_free_inodes,
            raw.nr_blocks,
            raw.nr_free_blocks
        );

        Ok(Self {
            cache,
            sbi: RwLock::new(SbInfo::new(&raw, ifree, bfree)),
            clock,
        })
    }

    fn read_region(cache: &BufCache<D>, start: u32, nr_blocks: u32) -> Result<Vec<u8>, IOError> {
        let mut raw = Vec::with_capacity(nr_blocks as usize * BLOCK_SIZE);
        for bno in BlockNumberRange(BlockNumber(start), BlockNumber(start + nr_blocks)) {
            let buf = cache.get(bno)?;
            raw.extend_from_slice(buf.read().bytes());
        }

        Ok(raw)
    }

    /// Writes the superblock counters, both bitmap regions and every dirty buffer back to the
    /// device, then flushes the device itself.
    pub fn sync(&self) -> CanFail<IOError> {
        let sbi = self.sbi.read();

        let sb_buf = self.cache.get(BlockNumber(0))?;
        sb_buf.write().write_as(&sbi.to_raw());

        self.write_region(sbi.ifree_start(), sbi.nr_ifree_blocks, &sbi.ifree.to_bytes())?;
        self.write_region(sbi.bfree_start(), sbi.nr_bfree_blocks, &sbi.bfree.to_bytes())?;
        drop(sbi);

        self.cache.sync()
    }

    fn write_region(&self, start: BlockNumber, nr_blocks: u32, raw: &[u8]) -> CanFail<IOError> {
        for i in 0..nr_blocks as usize {
            let buf = self.cache.get(start + i as u32)?;
            let mut buf = buf.write();

            let bytes = buf.bytes_mut();
            bytes.fill(0);

            let lo = i * BLOCK_SIZE;
            let hi = usize::min(lo + BLOCK_SIZE, raw.len());
            if lo < hi {
                bytes[..hi - lo].copy_from_slice(&raw[lo..hi]);
            }

            buf.mark_dirty();
        }

        Ok(())
    }

    /// Reads an inode record from the inode table.
    ///
    /// # Errors
    ///
    /// [`FsError::Invalid`] when `ino` is outside the pool, [`FsError::Io`] when the table
    /// block cannot be read.
    pub fn iget(&self, ino: InodeNumber) -> FsResult<Inode> {
        let (block, offset) = {
            let sbi = self.sbi.read();
            if ino == InodeNumber::NONE || u32::from(ino) >= sbi.nr_inodes {
                return Err(FsError::Invalid);
            }

            sbi.inode_slot(ino)
        };

        let buf = self.cache.get(block)?;
        let raw: RawInode = buf.read().read_at(offset);

        Ok(Inode::from_raw(ino, &raw))
    }

    /// Encodes an inode back into its slot of the inode table.
    pub(crate) fn write_inode(&self, inode: &Inode) -> FsResult<()> {
        let (block, offset) = self.sbi.read().inode_slot(inode.num);

        let buf = self.cache.get(block)?;
        buf.write().write_at(offset, &inode.to_raw());

        Ok(())
    }

    /// Number of free inodes in the pool.
    pub fn free_inodes(&self) -> u32 {
        self.sbi.read().nr_free_inodes
    }

    /// Number of free blocks in the pool.
    pub fn free_blocks(&self) -> u32 {
        self.sbi.read().nr_free_blocks
    }

    /// Detaches from the file system, handing the device back.
    ///
    /// State that was not [`CellFs::sync`]ed is lost.
    pub fn into_device(self) -> D {
        self.cache.into_device()
    }

    pub(crate) fn now(&self) -> UnixTimestamp32 {
        self.clock.now()
    }
}
