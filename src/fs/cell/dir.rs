//! Directory blocks and the run-length free-gap encoding.
//!
//! A directory block holds [`FILES_PER_BLOCK`] file slots behind a live-slot count. The
//! `nr_blk` field of a slot is a skip counter coalescing adjacent free slots:
//!
//! - on a live slot, `nr_blk` is 1 plus the number of free slots immediately following it that
//!   belong to the run anchored there (always at least 1);
//! - on the anchor of a leading free run (first live slot not at index 0, or empty block),
//!   `nr_blk` is the length of that free run;
//! - a freshly initialized block is one block-wide free run: `files[0].nr_blk` equals
//!   [`FILES_PER_BLOCK`], every inode field zero.
//!
//! Walking anchor to anchor (`fi += files[fi].nr_blk`) visits every live slot exactly once
//! without per-slot tombstones. Summing `nr_blk` over the anchor sequence always yields
//! [`FILES_PER_BLOCK`], and `nr_files` always matches the number of slots with a non-zero
//! inode.

use bytemuck::{Pod, Zeroable};

use crate::errors::FsError;
use crate::fs::cell::extent::ExtentIndexBlock;
use crate::fs::cell::inode::{Inode, InodeNumber};
use crate::fs::cell::CellFs;
use crate::fs::FsResult;
use crate::io::{BlockDevice, BLOCK_SIZE};

/// Longest admissible file name, in bytes.
pub const FILENAME_LEN: usize = 255;

/// Number of file slots packed in one directory block.
pub const FILES_PER_BLOCK: usize = BLOCK_SIZE / core::mem::size_of::<FileSlot>();

/// File name held by a directory slot: up to [`FILENAME_LEN`] bytes, NUL-padded.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Pod, Zeroable)]
#[repr(transparent)]
pub struct FileName(pub [u8; FILENAME_LEN]);

impl FileName {
    /// Builds a slot name from raw bytes. `name` must be at most [`FILENAME_LEN`] bytes.
    pub fn new(name: &[u8]) -> Self {
        debug_assert!(name.len() <= FILENAME_LEN);

        let mut bytes = [0u8; FILENAME_LEN];
        bytes[..name.len()].copy_from_slice(name);

        Self(bytes)
    }

    /// Bytewise comparison against `name`, honoring the NUL padding.
    pub fn matches(&self, name: &[u8]) -> bool {
        if name.len() > FILENAME_LEN {
            return false;
        }

        self.0[..name.len()] == *name && (name.len() == FILENAME_LEN || self.0[name.len()] == 0)
    }

    /// The stored name, without its padding.
    pub fn as_bytes(&self) -> &[u8] {
        let end = self.0.iter().position(|&b| b == 0).unwrap_or(FILENAME_LEN);
        &self.0[..end]
    }

    /// Returns an [`Iterator`] over the characters of the name.
    pub fn chars(&self) -> impl Iterator<Item = char> + '_ {
        self.as_bytes().iter().copied().map(char::from)
    }
}

impl core::fmt::Debug for FileName {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str("\"")?;
        for ch in self.chars() {
            f.write_fmt(format_args!("{ch}"))?;
        }
        f.write_str("\"")
    }
}

/// One directory entry: a named reference to an inode, plus the skip counter.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct FileSlot {
    /// Referenced inode; [`InodeNumber::NONE`] marks the slot free.
    pub inode: InodeNumber,

    /// Skip counter of the run anchored at this slot.
    pub nr_blk: u32,

    pub filename: FileName,

    _pad: u8,
}

impl FileSlot {
    fn live(inode: InodeNumber, nr_blk: u32, filename: FileName) -> Self {
        Self {
            inode,
            nr_blk,
            filename,
            _pad: 0,
        }
    }

    fn free_run(len: u32) -> Self {
        Self {
            inode: InodeNumber::NONE,
            nr_blk: len,
            filename: FileName::zeroed(),
            _pad: 0,
        }
    }

    pub fn is_free(&self) -> bool {
        self.inode == InodeNumber::NONE
    }
}

/// The content of one block inside a directory extent.
#[derive(Clone, Copy, Pod, Zeroable)]
#[repr(C)]
pub struct DirBlock {
    /// Number of live slots in this block.
    pub nr_files: u32,

    pub files: [FileSlot; FILES_PER_BLOCK],
}

/// Outcome of the name-lookup walk over one directory block.
pub(crate) enum LookupStep {
    /// The name references this inode.
    Found(InodeNumber),

    /// A free slot was reached: directory blocks fill front to back, so nothing lives past
    /// this point and the whole search is over.
    Exhausted,

    /// Every live slot of the block was visited without a match.
    NotHere,
}

impl DirBlock {
    /// A block holding nothing but one block-wide free run.
    pub(crate) fn new_free() -> Self {
        let mut block = DirBlock::zeroed();
        block.files[0] = FileSlot::free_run(FILES_PER_BLOCK as u32);

        block
    }

    pub(crate) fn is_full(&self) -> bool {
        self.nr_files == FILES_PER_BLOCK as u32
    }

    /// Iterates `(index, slot)` over the live slots, anchor to anchor.
    pub(crate) fn live_slots(&self) -> LiveSlots<'_> {
        LiveSlots {
            block: self,
            fi: 0,
            seen: 0,
        }
    }

    /// The lookup walk: compare every live slot against `name`, giving up at the first free
    /// slot.
    pub(crate) fn lookup_walk(&self, name: &[u8]) -> LookupStep {
        let mut fi = 0;
        let mut seen = 0;

        while seen < self.nr_files && fi < FILES_PER_BLOCK {
            let slot = &self.files[fi];
            if slot.is_free() {
                return LookupStep::Exhausted;
            }

            if slot.filename.matches(name) {
                return LookupStep::Found(slot.inode);
            }

            seen += 1;
            fi += slot.nr_blk.max(1) as usize;
        }

        LookupStep::NotHere
    }

    /// Inserts a new entry while preserving the run-length encoding.
    ///
    /// The caller guarantees a free slot exists. The walk advances over packed live slots to
    /// the first anchor owning more than itself; a live anchor donates the slot right after
    /// it, a free anchor is replaced in place and its remainder re-anchored behind the new
    /// entry.
    pub(crate) fn insert(&mut self, inode: InodeNumber, filename: FileName) {
        debug_assert!(!self.is_full());

        let mut fi = 0;
        while fi < FILES_PER_BLOCK - 1 && !self.files[fi].is_free() && self.files[fi].nr_blk == 1
        {
            fi += 1;
        }

        let run = self.files[fi].nr_blk;
        if !self.files[fi].is_free() {
            self.files[fi].nr_blk = 1;
            self.files[fi + 1] = FileSlot::live(inode, run - 1, filename);
        } else {
            self.files[fi] = FileSlot::live(inode, 1, filename);
            if run > 1 {
                self.files[fi + 1] = FileSlot::free_run(run - 1);
            }
        }

        self.nr_files += 1;
    }

    /// Frees the slot at `fi`, merging its run into the nearest preceding anchor.
    ///
    /// The nearest preceding anchor is the closest lower index holding a live slot, or index
    /// 0 when the whole prefix is free (the removed run then extends the leading free run).
    pub(crate) fn remove_at(&mut self, fi: usize) {
        debug_assert!(!self.files[fi].is_free());

        self.files[fi].inode = InodeNumber::NONE;

        if fi > 0 {
            let mut i = fi - 1;
            loop {
                if !self.files[i].is_free() || i == 0 {
                    self.files[i].nr_blk += self.files[fi].nr_blk;
                    break;
                }
                i -= 1;
            }
        }

        self.nr_files -= 1;
    }
}

/// Iterator over the live slots of a [`DirBlock`], following the skip encoding.
pub(crate) struct LiveSlots<'blk> {
    block: &'blk DirBlock,
    fi: usize,
    seen: u32,
}

impl<'blk> Iterator for LiveSlots<'blk> {
    type Item = (usize, &'blk FileSlot);

    fn next(&mut self) -> Option<Self::Item> {
        while self.seen < self.block.nr_files && self.fi < FILES_PER_BLOCK {
            let fi = self.fi;
            let slot = &self.block.files[fi];
            self.fi += slot.nr_blk.max(1) as usize;

            if !slot.is_free() {
                self.seen += 1;
                return Some((fi, slot));
            }
        }

        None
    }
}

impl<D: BlockDevice> CellFs<D> {
    /// Searches a directory for `name`, returning the referenced inode number if present.
    pub(crate) fn dir_find(&self, dir: &Inode, name: &[u8]) -> FsResult<Option<InodeNumber>> {
        let index_buf = self.cache.get(dir.ei_block)?;
        let index: ExtentIndexBlock = index_buf.read().read_as();

        for (_, ext) in index.live_extents() {
            let mut seen_in_ext = 0;

            for blk in ext.blocks() {
                let buf = self.cache.get(blk)?;
                let dblock: DirBlock = buf.read().read_as();

                match dblock.lookup_walk(name) {
                    LookupStep::Found(ino) => return Ok(Some(ino)),
                    LookupStep::Exhausted => return Ok(None),
                    LookupStep::NotHere => (),
                }

                seen_in_ext += dblock.nr_files;
                if seen_in_ext == ext.nr_files {
                    break;
                }
            }
        }

        Ok(None)
    }

    /// Adds an entry `name -> child` to a directory, allocating a fresh extent when every
    /// live one is full.
    ///
    /// Keeps the block, extent and index live counts in step. When an extent had to be
    /// allocated and a later read fails, the extent is released again before the error is
    /// surfaced.
    pub(crate) fn dir_insert(
        &self,
        dir: &Inode,
        child: InodeNumber,
        filename: FileName,
    ) -> FsResult<()> {
        let index_buf = self.cache.get(dir.ei_block)?;
        let mut index: ExtentIndexBlock = index_buf.read().read_as();

        if index.is_full() {
            return Err(FsError::MaxLinks);
        }

        let ei = index.available_ext_idx().ok_or(FsError::MaxLinks)?;
        let mut fresh_extent = false;
        if !index.extents[ei].is_live() {
            self.put_new_ext(ei, &mut index)?;
            fresh_extent = true;
        }

        let mut target = None;
        for blk in index.extents[ei].blocks() {
            let buf = match self.cache.get(blk) {
                Ok(buf) => buf,
                Err(err) => {
                    if fresh_extent {
                        self.release_extent(&mut index.extents[ei]);
                    }
                    return Err(err.into());
                }
            };

            let dblock: DirBlock = buf.read().read_as();
            if !dblock.is_full() {
                target = Some((buf, dblock));
                break;
            }
        }

        // the chosen extent always has room: it is either freshly initialized or not full
        let Some((buf, mut dblock)) = target else {
            if fresh_extent {
                self.release_extent(&mut index.extents[ei]);
            }
            return Err(FsError::MaxLinks);
        };

        dblock.insert(child, filename);
        buf.write().write_as(&dblock);

        index.extents[ei].nr_files += 1;
        index.nr_files += 1;
        index_buf.write().write_as(&index);

        Ok(())
    }

    /// Removes the entry `name -> child` from a directory, if present.
    ///
    /// Returns whether an entry was removed. Absence is not an error here; callers that
    /// require presence resolve the name first.
    pub(crate) fn dir_remove(
        &self,
        dir: &Inode,
        child: InodeNumber,
        name: &[u8],
    ) -> FsResult<bool> {
        let index_buf = self.cache.get(dir.ei_block)?;
        let mut index: ExtentIndexBlock = index_buf.read().read_as();
        let mut remaining = index.nr_files;

        for ei in 0..index.extents.len() {
            if remaining == 0 {
                break;
            }

            let ext = index.extents[ei];
            if !ext.is_live() {
                continue;
            }
            remaining = remaining.saturating_sub(ext.nr_files);

            for blk in ext.blocks() {
                let buf = self.cache.get(blk)?;
                let mut dblock: DirBlock = buf.read().read_as();

                let found = dblock
                    .live_slots()
                    .find(|(_, slot)| slot.inode == child && slot.filename.matches(name))
                    .map(|(fi, _)| fi);

                if let Some(fi) = found {
                    dblock.remove_at(fi);
                    buf.write().write_as(&dblock);

                    index.extents[ei].nr_files -= 1;
                    index.nr_files -= 1;
                    if index.extents[ei].nr_files == 0 {
                        self.reclaim_empty_extent(&mut index, ei);
                    }
                    index_buf.write().write_as(&index);

                    return Ok(true);
                }
            }
        }

        Ok(false)
    }

    /// Rewrites the name of the entry `old_name -> child` in place.
    ///
    /// Returns whether the entry was found.
    pub(crate) fn dir_rename_slot(
        &self,
        dir: &Inode,
        child: InodeNumber,
        old_name: &[u8],
        new_name: FileName,
    ) -> FsResult<bool> {
        let index_buf = self.cache.get(dir.ei_block)?;
        let index: ExtentIndexBlock = index_buf.read().read_as();

        for (_, ext) in index.live_extents() {
            for blk in ext.blocks() {
                let buf = self.cache.get(blk)?;
                let mut dblock: DirBlock = buf.read().read_as();

                let found = dblock
                    .live_slots()
                    .find(|(_, slot)| slot.inode == child && slot.filename.matches(old_name))
                    .map(|(fi, _)| fi);

                if let Some(fi) = found {
                    dblock.files[fi].filename = new_name;
                    buf.write().write_as(&dblock);

                    return Ok(true);
                }
            }
        }

        Ok(false)
    }

    /// Returns an extent's blocks to the bitmap and clears its descriptor.
    fn release_extent(&self, ext: &mut crate::fs::cell::extent::Extent) {
        self.sbi.write().put_blocks(ext.ee_start, ext.ee_len);
        ext.clear();
    }

    /// Returns an emptied extent's blocks to the pool and compacts the extent array, so the
    /// live extents stay densely prefixed and their logical offsets contiguous.
    fn reclaim_empty_extent(&self, index: &mut ExtentIndexBlock, ei: usize) {
        self.release_extent(&mut index.extents[ei]);

        let mut i = ei;
        while i + 1 < index.extents.len() && index.extents[i + 1].is_live() {
            index.extents[i] = index.extents[i + 1];
            i += 1;
        }
        index.extents[i].clear();

        let mut logical = 0;
        for ext in index.extents.iter_mut().take_while(|ext| ext.is_live()) {
            ext.ee_block = logical;
            logical += ext.ee_len;
        }
    }
}
