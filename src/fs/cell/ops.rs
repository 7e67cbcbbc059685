//! Directory-tree operations.
//!
//! The classic namespace surface over the metadata layout: `lookup`, `create`, `mkdir`,
//! `symlink`, `link`, `unlink`, `rmdir`, `rename` and `get_link`. Every operation takes the
//! parent directory by inode number and resolves names itself; the host VFS is expected to
//! hold the involved inodes exclusively for the duration of one mutating call.
//!
//! Failure discipline: validation errors are reported before anything is written; a failure
//! after resources were reserved inside the same call releases them again. The few accepted
//! inconsistencies (leaking the data blocks of a file whose index block died, a rename
//! surfacing an error with the entry present under both names) are called out on the
//! operations below.

use alloc::vec::Vec;

use crate::errors::FsError;
use crate::fs::cell::dir::{FileName, FILENAME_LEN};
use crate::fs::cell::extent::ExtentIndexBlock;
use crate::fs::cell::inode::{
    FileKind, Inode, InodeFileMode, InodeNumber, INLINE_DATA_LEN,
};
use crate::fs::cell::CellFs;
use crate::fs::FsResult;
use crate::io::{BlockDevice, BlockNumber, BLOCK_SIZE};
use crate::warn;

/// Flags accepted by [`CellFs::rename`].
///
/// Only the flag values are understood; `EXCHANGE` and `WHITEOUT` semantics are not
/// implemented and are rejected up front.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RenameFlags(pub u32);

impl RenameFlags {
    pub const NONE: Self = Self(0);

    /// Fail instead of replacing an existing target.
    pub const NO_REPLACE: Self = Self(0x1);

    /// Atomically exchange source and target (unsupported).
    pub const EXCHANGE: Self = Self(0x2);

    /// Leave a whiteout entry behind (unsupported).
    pub const WHITEOUT: Self = Self(0x4);

    pub fn intersects(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }
}

impl core::ops::BitOr for RenameFlags {
    type Output = RenameFlags;

    fn bitor(self, rhs: Self) -> Self::Output {
        RenameFlags(self.0 | rhs.0)
    }
}

impl<D: BlockDevice> CellFs<D> {
    /// Searches directory `parent` for `name`.
    ///
    /// A miss is not an error: it is reported as `Ok(None)`.
    pub fn lookup(&self, parent: InodeNumber, name: &[u8]) -> FsResult<Option<InodeNumber>> {
        if name.len() > FILENAME_LEN {
            return Err(FsError::NameTooLong);
        }

        let dir = self.iget(parent)?;
        if !dir.mode.is_dir() {
            return Err(FsError::Invalid);
        }

        self.dir_find(&dir, name)
    }

    /// Creates a regular file or a directory named `name` under `parent`.
    ///
    /// Returns the new inode number. Symbolic links go through [`CellFs::symlink`], which
    /// carries the target.
    pub fn create(
        &self,
        parent: InodeNumber,
        name: &[u8],
        mode: InodeFileMode,
        uid: u32,
        gid: u32,
    ) -> FsResult<InodeNumber> {
        match mode.kind() {
            Some(FileKind::Regular | FileKind::Directory) => (),
            _ => return Err(FsError::Invalid),
        }

        self.create_entry(parent, name, mode, uid, gid, None)
    }

    /// Creates a directory named `name` under `parent`.
    pub fn mkdir(
        &self,
        parent: InodeNumber,
        name: &[u8],
        mode: InodeFileMode,
        uid: u32,
        gid: u32,
    ) -> FsResult<InodeNumber> {
        self.create_entry(
            parent,
            name,
            mode | InodeFileMode::S_IFDIR,
            uid,
            gid,
            None,
        )
    }

    /// Creates a symbolic link named `name` under `parent`, pointing at `target`.
    ///
    /// The target is stored inline in the inode and is limited to 31 bytes.
    pub fn symlink(
        &self,
        parent: InodeNumber,
        name: &[u8],
        target: &[u8],
        uid: u32,
        gid: u32,
    ) -> FsResult<InodeNumber> {
        if target.len() + 1 > INLINE_DATA_LEN {
            return Err(FsError::NameTooLong);
        }

        self.create_entry(
            parent,
            name,
            InodeFileMode::S_IFLNK | InodeFileMode::S_IRWXUGO,
            uid,
            gid,
            Some(target),
        )
    }

    /// Adds a hard link `name` under `parent` to the existing inode `target`.
    ///
    /// Directories cannot be hard-linked.
    pub fn link(&self, target: InodeNumber, parent: InodeNumber, name: &[u8]) -> FsResult<()> {
        if name.len() > FILENAME_LEN {
            return Err(FsError::NameTooLong);
        }

        let dir = self.iget(parent)?;
        if !dir.mode.is_dir() {
            return Err(FsError::Invalid);
        }

        let mut old = self.iget(target)?;
        if old.mode.is_dir() {
            return Err(FsError::Invalid);
        }

        self.dir_insert(&dir, old.num, FileName::new(name))?;

        old.nlink += 1;
        self.write_inode(&old)
    }

    /// Removes the entry `name` from `parent`, destroying the referenced file once its last
    /// link is gone.
    ///
    /// Directories are rejected; they are removed through [`CellFs::rmdir`].
    pub fn unlink(&self, parent: InodeNumber, name: &[u8]) -> FsResult<()> {
        let dir = self.iget(parent)?;
        if !dir.mode.is_dir() {
            return Err(FsError::Invalid);
        }

        let ino = self.dir_find(&dir, name)?.ok_or(FsError::NotFound)?;
        let inode = self.iget(ino)?;
        if inode.mode.is_dir() {
            return Err(FsError::Invalid);
        }

        self.do_unlink(dir, inode, name)
    }

    /// Removes the empty directory `name` from `parent`.
    pub fn rmdir(&self, parent: InodeNumber, name: &[u8]) -> FsResult<()> {
        let dir = self.iget(parent)?;
        if !dir.mode.is_dir() {
            return Err(FsError::Invalid);
        }

        let ino = self.dir_find(&dir, name)?.ok_or(FsError::NotFound)?;
        let inode = self.iget(ino)?;
        if !inode.mode.is_dir() {
            return Err(FsError::Invalid);
        }

        if inode.nlink > 2 {
            return Err(FsError::NotEmpty);
        }

        let index: ExtentIndexBlock = self.cache.get(inode.ei_block)?.read().read_as();
        if index.nr_files != 0 {
            return Err(FsError::NotEmpty);
        }

        self.do_unlink(dir, inode, name)
    }

    /// Moves the entry `old_name` of `old_parent` to `new_name` under `new_parent`.
    ///
    /// Within a single directory this rewrites the slot name in place. Across directories
    /// the entry is inserted under the new parent first and removed from the old one last,
    /// so an I/O failure in between surfaces the error but leaves the file reachable under
    /// both names rather than under none.
    pub fn rename(
        &self,
        old_parent: InodeNumber,
        old_name: &[u8],
        new_parent: InodeNumber,
        new_name: &[u8],
        flags: RenameFlags,
    ) -> FsResult<()> {
        if flags.intersects(RenameFlags::EXCHANGE | RenameFlags::WHITEOUT) {
            return Err(FsError::Invalid);
        }

        if new_name.len() > FILENAME_LEN {
            return Err(FsError::NameTooLong);
        }

        let old_dir = self.iget(old_parent)?;
        if !old_dir.mode.is_dir() {
            return Err(FsError::Invalid);
        }

        let src_ino = self.dir_find(&old_dir, old_name)?.ok_or(FsError::NotFound)?;

        if new_parent == old_parent {
            self.dir_rename_slot(&old_dir, src_ino, old_name, FileName::new(new_name))?;
            return Ok(());
        }

        let mut new_dir = self.iget(new_parent)?;
        if !new_dir.mode.is_dir() {
            return Err(FsError::Invalid);
        }

        if self.dir_find(&new_dir, new_name)?.is_some() {
            return Err(FsError::AlreadyExists);
        }

        let src = self.iget(src_ino)?;
        self.dir_insert(&new_dir, src_ino, FileName::new(new_name))?;

        let now = self.now();
        new_dir.touch(now);
        if src.mode.is_dir() {
            new_dir.nlink += 1;
        }
        self.write_inode(&new_dir)?;

        self.dir_remove(&old_dir, src_ino, old_name)?;

        let mut old_dir = old_dir;
        old_dir.touch(now);
        if src.mode.is_dir() {
            old_dir.nlink -= 1;
        }
        self.write_inode(&old_dir)
    }

    /// Returns the target of the symbolic link `ino`.
    pub fn get_link(&self, ino: InodeNumber) -> FsResult<Vec<u8>> {
        let inode = self.iget(ino)?;
        if !inode.mode.is_symlink() {
            return Err(FsError::Invalid);
        }

        Ok(inode.link_target().to_vec())
    }

    /// Reserves an inode number and builds the in-memory inode for a new file-system object.
    ///
    /// Regular files and directories also get one index block. Everything reserved here is
    /// released again if the rest of the creation fails.
    fn new_inode(&self, mode: InodeFileMode, uid: u32, gid: u32) -> FsResult<Inode> {
        let kind = mode.kind().ok_or(FsError::Invalid)?;

        {
            let sbi = self.sbi.read();
            if sbi.nr_free_inodes == 0 || sbi.nr_free_blocks == 0 {
                return Err(FsError::NoSpace);
            }
        }

        let ino = self.sbi.write().get_free_inode().ok_or(FsError::NoSpace)?;

        let now = self.now();
        let mut inode = Inode {
            num: ino,
            mode,
            uid,
            gid,
            size: 0,
            ctime: now,
            atime: now,
            mtime: now,
            blocks: 0,
            nlink: 1,
            ei_block: BlockNumber::NONE,
            i_data: [0; INLINE_DATA_LEN],
        };

        match kind {
            FileKind::Symlink => (),
            FileKind::Regular | FileKind::Directory => {
                let Some(bno) = self.sbi.write().get_free_blocks(1) else {
                    self.sbi.write().put_inode(ino);
                    return Err(FsError::NoSpace);
                };

                inode.ei_block = bno;
                inode.blocks = 1;
                if kind == FileKind::Directory {
                    inode.size = BLOCK_SIZE as u32;
                    inode.nlink = 2;
                }
            }
        }

        Ok(inode)
    }

    /// Releases everything [`CellFs::new_inode`] reserved.
    fn abort_new_inode(&self, inode: &Inode) {
        let mut sbi = self.sbi.write();
        if inode.ei_block != BlockNumber::NONE {
            sbi.put_blocks(inode.ei_block, 1);
        }
        sbi.put_inode(inode.num);
    }

    /// The shared creation path of `create`, `mkdir` and `symlink`.
    fn create_entry(
        &self,
        parent: InodeNumber,
        name: &[u8],
        mode: InodeFileMode,
        uid: u32,
        gid: u32,
        link_target: Option<&[u8]>,
    ) -> FsResult<InodeNumber> {
        if name.len() > FILENAME_LEN {
            return Err(FsError::NameTooLong);
        }

        let mut dir = self.iget(parent)?;
        if !dir.mode.is_dir() {
            return Err(FsError::Invalid);
        }

        let index: ExtentIndexBlock = self.cache.get(dir.ei_block)?.read().read_as();
        if index.is_full() {
            return Err(FsError::MaxLinks);
        }

        let mut inode = self.new_inode(mode, uid, gid)?;

        if let Some(target) = link_target {
            inode.i_data[..target.len()].copy_from_slice(target);
            inode.size = target.len() as u32;
        } else {
            // scrub the new index block so stale content cannot masquerade as extents
            match self.cache.get(inode.ei_block) {
                Ok(buf) => buf.write().zero(),
                Err(err) => {
                    self.abort_new_inode(&inode);
                    return Err(err.into());
                }
            }
        }

        if let Err(err) = self.write_inode(&inode) {
            self.abort_new_inode(&inode);
            return Err(err);
        }

        if let Err(err) = self.dir_insert(&dir, inode.num, FileName::new(name)) {
            self.abort_new_inode(&inode);
            return Err(err);
        }

        dir.touch(self.now());
        if inode.mode.is_dir() {
            dir.nlink += 1;
        }
        self.write_inode(&dir)?;

        Ok(inode.num)
    }

    /// The shared removal path of `unlink` and `rmdir`.
    ///
    /// If reading the victim's index block fails, the inode is reclaimed regardless and the
    /// blocks it referenced are permanently leaked; a dangling directory entry would be
    /// worse. A failure while scrubbing one data block does not keep that block out of the
    /// pool either.
    fn do_unlink(&self, mut dir: Inode, mut inode: Inode, name: &[u8]) -> FsResult<()> {
        self.dir_remove(&dir, inode.num, name)?;

        if inode.mode.is_symlink() {
            return self.drop_inode(inode);
        }

        dir.touch(self.now());
        if inode.mode.is_dir() {
            dir.nlink -= 1;
            inode.nlink -= 1;
        }
        self.write_inode(&dir)?;

        if inode.nlink > 1 {
            inode.nlink -= 1;
            return self.write_inode(&inode);
        }

        match self.cache.get(inode.ei_block) {
            Err(_) => {
                warn!(
                    "cellfs",
                    "index block {} of inode {} unreadable, its data blocks leak",
                    inode.ei_block,
                    inode.num
                );
            }
            Ok(index_buf) => {
                let index: ExtentIndexBlock = index_buf.read().read_as();

                for (_, ext) in index.live_extents() {
                    self.sbi.write().put_blocks(ext.ee_start, ext.ee_len);

                    // scrub released blocks on a best-effort basis
                    for blk in ext.blocks() {
                        match self.cache.get(blk) {
                            Ok(buf) => buf.write().zero(),
                            Err(_) => {
                                warn!("cellfs", "could not scrub released block {blk}");
                            }
                        }
                    }
                }

                index_buf.write().zero();
            }
        }

        self.drop_inode(inode)
    }

    /// Scrubs the inode record, frees its index block (symlinks own none) and returns the
    /// inode number to the pool.
    fn drop_inode(&self, mut inode: Inode) -> FsResult<()> {
        let symlink = inode.mode.is_symlink();
        let bno = inode.ei_block;

        inode.blocks = 0;
        inode.ei_block = BlockNumber::NONE;
        inode.size = 0;
        inode.uid = 0;
        inode.gid = 0;
        inode.touch(crate::time::UnixTimestamp32(0));
        inode.nlink = 0;
        inode.mode = InodeFileMode(0);

        {
            let mut sbi = self.sbi.write();
            if !symlink {
                sbi.put_blocks(bno, 1);
            }
            sbi.put_inode(inode.num);
        }

        self.write_inode(&inode)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::cell::dir::{DirBlock, FILES_PER_BLOCK};
    use crate::fs::cell::extent::{FILES_PER_EXT, MAX_BLOCKS_PER_EXTENT};
    use crate::fs::cell::mkfs;
    use crate::io::MemDisk;
    use crate::time::ManualClock;
    use alloc::boxed::Box;
    use alloc::format;
    use std::collections::{HashMap, HashSet};

    const ROOT: InodeNumber = InodeNumber::ROOT;

    fn reg_mode() -> InodeFileMode {
        InodeFileMode::S_IFREG | InodeFileMode(0o644)
    }

    fn dir_mode() -> InodeFileMode {
        InodeFileMode(0o755)
    }

    fn new_fs(nr_inodes: u32, nr_blocks: u32) -> CellFs<MemDisk> {
        let disk = MemDisk::new(nr_blocks);
        mkfs::format(&disk, nr_inodes).unwrap();

        CellFs::mount(disk, Box::new(ManualClock::new(1000))).unwrap()
    }

    /// Free counters plus both bitmaps, for bit-identical comparisons.
    fn snapshot(fs: &CellFs<MemDisk>) -> (u32, u32, alloc::vec::Vec<u8>, alloc::vec::Vec<u8>) {
        let sbi = fs.sbi.read();
        (
            sbi.nr_free_inodes,
            sbi.nr_free_blocks,
            sbi.ifree.to_bytes(),
            sbi.bfree.to_bytes(),
        )
    }

    fn read_index(fs: &CellFs<MemDisk>, ino: InodeNumber) -> ExtentIndexBlock {
        let inode = fs.iget(ino).unwrap();
        fs.cache.get(inode.ei_block).unwrap().read().read_as()
    }

    /// Full-image consistency check: counters against bitmap popcounts, per-directory live
    /// counts at every level, block ownership disjointness and link counts against the
    /// number of referencing slots.
    fn check_invariants(fs: &CellFs<MemDisk>) {
        let (nr_inodes, data_start) = {
            let sbi = fs.sbi.read();
            assert_eq!(sbi.nr_free_inodes, sbi.ifree.count_free());
            assert_eq!(sbi.nr_free_blocks, sbi.bfree.count_free());
            (sbi.nr_inodes, u32::from(sbi.data_start()))
        };

        let mut claimed: HashSet<u32> = (0..data_start).collect();
        let mut refs: HashMap<u32, u32> = HashMap::new();

        for raw_ino in 1..nr_inodes {
            let ino = InodeNumber(raw_ino);
            if !fs.sbi.read().ifree.inode_in_use(ino) {
                continue;
            }

            let inode = fs.iget(ino).unwrap();
            let kind = inode.kind().expect("live inode with an invalid mode");
            if kind == FileKind::Symlink {
                continue;
            }

            assert!(fs.sbi.read().bfree.blk_in_use(inode.ei_block));
            assert!(
                claimed.insert(inode.ei_block.into()),
                "index block {} owned twice",
                inode.ei_block
            );

            let index: ExtentIndexBlock =
                fs.cache.get(inode.ei_block).unwrap().read().read_as();

            let mut dir_live = 0;
            for (_, ext) in index.live_extents() {
                let mut ext_live = 0;

                for blk in ext.blocks() {
                    assert!(fs.sbi.read().bfree.blk_in_use(blk));
                    assert!(claimed.insert(blk.into()), "block {blk} owned twice");

                    if kind != FileKind::Directory {
                        continue;
                    }

                    let dblock: DirBlock = fs.cache.get(blk).unwrap().read().read_as();
                    let mut sum = 0;
                    let mut live = 0;
                    let mut fi = 0;
                    while fi < FILES_PER_BLOCK {
                        let slot = &dblock.files[fi];
                        sum += slot.nr_blk.max(1) as usize;
                        if !slot.is_free() {
                            live += 1;
                            *refs.entry(slot.inode.into()).or_default() += 1;
                        }
                        fi += slot.nr_blk.max(1) as usize;
                    }

                    assert_eq!(sum, FILES_PER_BLOCK, "skip runs must cover block {blk}");
                    assert_eq!(dblock.nr_files, live);
                    ext_live += live;
                }

                if kind == FileKind::Directory {
                    assert_eq!(ext.nr_files, ext_live);
                    dir_live += ext_live;
                }
            }

            if kind == FileKind::Directory {
                assert_eq!(index.nr_files, dir_live);
            }
        }

        for (child, count) in refs {
            let inode = fs.iget(InodeNumber(child)).unwrap();
            assert!(
                inode.nlink >= count,
                "inode {child} referenced {count} times with nlink {}",
                inode.nlink
            );
        }
    }

    #[test]
    fn end_to_end_scenario() {
        let fs = new_fs(64, 256);
        // layout: sb 0, istore 1-2, ifree 3, bfree 4, root index 5

        // step 1: mkdir root/a
        let a = fs.mkdir(ROOT, b"a", dir_mode(), 0, 0).unwrap();
        assert_eq!(a, InodeNumber(2));
        assert_eq!(fs.iget(ROOT).unwrap().nlink, 3);

        let a_inode = fs.iget(a).unwrap();
        assert!(a_inode.mode.is_dir());
        assert_eq!(a_inode.ei_block, BlockNumber(6), "first free data block");
        assert_eq!(a_inode.nlink, 2);

        let root_index = read_index(&fs, ROOT);
        let ext = root_index.extents[0];
        assert_eq!(ext.ee_start, BlockNumber(7));
        assert_eq!(ext.ee_len, MAX_BLOCKS_PER_EXTENT as u32);

        let first_block: DirBlock = fs.cache.get(ext.ee_start).unwrap().read().read_as();
        assert_eq!(first_block.files[0].inode, a);
        assert_eq!(first_block.files[0].nr_blk, 1);
        assert!(first_block.files[0].filename.matches(b"a"));
        assert!(first_block.files[1].is_free());
        assert_eq!(first_block.files[1].nr_blk, FILES_PER_BLOCK as u32 - 1);
        check_invariants(&fs);

        let pre_step2 = snapshot(&fs);

        // step 2: create a/f
        let f = fs.create(a, b"f", reg_mode(), 0, 0).unwrap();
        assert_eq!(f, InodeNumber(3));
        assert_eq!(fs.iget(f).unwrap().ei_block, BlockNumber(15));
        assert_eq!(read_index(&fs, a).nr_files, 1);
        check_invariants(&fs);

        // step 3: link root/g -> f
        fs.link(f, ROOT, b"g").unwrap();
        assert_eq!(fs.iget(f).unwrap().nlink, 2);
        assert_eq!(fs.lookup(ROOT, b"g").unwrap(), Some(f));
        assert_eq!(read_index(&fs, ROOT).nr_files, 2);
        check_invariants(&fs);

        // step 4: rename a/f -> root/h
        fs.rename(a, b"f", ROOT, b"h", RenameFlags::NONE).unwrap();
        assert_eq!(fs.lookup(ROOT, b"h").unwrap(), Some(f));
        assert_eq!(fs.lookup(a, b"f").unwrap(), None);
        assert_eq!(fs.iget(f).unwrap().nlink, 2);
        assert_eq!(read_index(&fs, a).nr_files, 0);
        check_invariants(&fs);

        // step 5: unlink root/g
        let pre_step5 = snapshot(&fs);
        fs.unlink(ROOT, b"g").unwrap();
        assert_eq!(fs.iget(f).unwrap().nlink, 1);
        assert_eq!(fs.lookup(ROOT, b"g").unwrap(), None);
        assert_eq!(fs.lookup(ROOT, b"h").unwrap(), Some(f));
        assert_eq!(snapshot(&fs), pre_step5, "dropping one of two links moves no bitmap bit");
        check_invariants(&fs);

        // step 6: unlink root/h
        fs.unlink(ROOT, b"h").unwrap();
        assert!(!fs.sbi.read().ifree.inode_in_use(f));
        assert_eq!(snapshot(&fs), pre_step2);
        check_invariants(&fs);
    }

    #[test]
    fn create_then_unlink_restores_the_bitmaps() {
        let fs = new_fs(64, 256);
        let before = snapshot(&fs);

        let ino = fs.create(ROOT, b"scratch", reg_mode(), 7, 7).unwrap();
        assert_eq!(fs.lookup(ROOT, b"scratch").unwrap(), Some(ino));

        fs.unlink(ROOT, b"scratch").unwrap();
        assert_eq!(fs.lookup(ROOT, b"scratch").unwrap(), None);
        assert_eq!(snapshot(&fs), before);
        check_invariants(&fs);
    }

    #[test]
    fn names_longer_than_the_slot_are_rejected() {
        let fs = new_fs(64, 256);
        let long = [b'n'; 256];

        assert_eq!(
            fs.create(ROOT, &long, reg_mode(), 0, 0).unwrap_err(),
            FsError::NameTooLong
        );
        assert_eq!(fs.lookup(ROOT, &long).unwrap_err(), FsError::NameTooLong);

        let max = [b'm'; 255];
        let ino = fs.create(ROOT, &max, reg_mode(), 0, 0).unwrap();
        assert_eq!(fs.lookup(ROOT, &max).unwrap(), Some(ino));
    }

    #[test]
    fn symlink_targets_are_bounded_by_the_inline_payload() {
        let fs = new_fs(64, 256);
        let before = snapshot(&fs);

        let target = [b't'; 31];
        let ino = fs.symlink(ROOT, b"ln", &target, 0, 0).unwrap();

        let inode = fs.iget(ino).unwrap();
        assert!(inode.mode.is_symlink());
        assert_eq!(inode.nlink, 1);
        assert_eq!(inode.size, 31);
        assert_eq!(inode.ei_block, BlockNumber::NONE);
        assert_eq!(fs.get_link(ino).unwrap(), target.to_vec());

        assert_eq!(
            fs.symlink(ROOT, b"ln2", &[b't'; 32], 0, 0).unwrap_err(),
            FsError::NameTooLong
        );

        assert_eq!(fs.get_link(ROOT).unwrap_err(), FsError::Invalid);

        fs.unlink(ROOT, b"ln").unwrap();
        assert_eq!(snapshot(&fs), before);
        check_invariants(&fs);
    }

    #[test]
    fn rmdir_requires_an_empty_directory() {
        let fs = new_fs(64, 256);
        let before = snapshot(&fs);

        let d = fs.mkdir(ROOT, b"d", dir_mode(), 0, 0).unwrap();
        fs.symlink(d, b"ln", b"elsewhere", 0, 0).unwrap();

        assert_eq!(fs.rmdir(ROOT, b"d").unwrap_err(), FsError::NotEmpty);

        fs.unlink(d, b"ln").unwrap();
        fs.rmdir(ROOT, b"d").unwrap();

        assert_eq!(fs.iget(ROOT).unwrap().nlink, 2);
        assert_eq!(fs.lookup(ROOT, b"d").unwrap(), None);
        assert_eq!(snapshot(&fs), before);
        check_invariants(&fs);
    }

    #[test]
    fn nested_directories_track_parent_links() {
        let fs = new_fs(64, 256);

        let a = fs.mkdir(ROOT, b"a", dir_mode(), 0, 0).unwrap();
        let b = fs.mkdir(a, b"b", dir_mode(), 0, 0).unwrap();

        assert_eq!(fs.iget(a).unwrap().nlink, 3);
        assert_eq!(fs.iget(b).unwrap().nlink, 2);

        fs.rmdir(a, b"b").unwrap();
        assert_eq!(fs.iget(a).unwrap().nlink, 2);
        check_invariants(&fs);
    }

    #[test]
    fn same_directory_rename_rewrites_the_slot() {
        let fs = new_fs(64, 256);

        let ino = fs.create(ROOT, b"x", reg_mode(), 0, 0).unwrap();
        let before = snapshot(&fs);

        fs.rename(ROOT, b"x", ROOT, b"y", RenameFlags::NONE).unwrap();

        assert_eq!(fs.lookup(ROOT, b"y").unwrap(), Some(ino));
        assert_eq!(fs.lookup(ROOT, b"x").unwrap(), None);
        assert_eq!(snapshot(&fs), before, "an in-place rename moves no counters");
        check_invariants(&fs);
    }

    #[test]
    fn rename_rejects_conflicts_and_unsupported_flags() {
        let fs = new_fs(64, 256);

        let d = fs.mkdir(ROOT, b"d", dir_mode(), 0, 0).unwrap();
        fs.create(ROOT, b"a", reg_mode(), 0, 0).unwrap();
        fs.create(d, b"b", reg_mode(), 0, 0).unwrap();

        assert_eq!(
            fs.rename(ROOT, b"a", d, b"b", RenameFlags::NONE).unwrap_err(),
            FsError::AlreadyExists
        );
        assert_eq!(
            fs.rename(ROOT, b"a", d, b"c", RenameFlags::EXCHANGE)
                .unwrap_err(),
            FsError::Invalid
        );
        assert_eq!(
            fs.rename(ROOT, b"missing", d, b"c", RenameFlags::NONE)
                .unwrap_err(),
            FsError::NotFound
        );

        // the accepted flag passes through
        fs.rename(ROOT, b"a", d, b"c", RenameFlags::NO_REPLACE).unwrap();
        assert_eq!(fs.lookup(ROOT, b"a").unwrap(), None);
        assert!(fs.lookup(d, b"c").unwrap().is_some());
        check_invariants(&fs);
    }

    #[test]
    fn cross_directory_rename_of_a_directory_moves_the_parent_link() {
        let fs = new_fs(64, 256);

        let a = fs.mkdir(ROOT, b"a", dir_mode(), 0, 0).unwrap();
        let b = fs.mkdir(ROOT, b"b", dir_mode(), 0, 0).unwrap();
        fs.mkdir(a, b"child", dir_mode(), 0, 0).unwrap();

        assert_eq!(fs.iget(a).unwrap().nlink, 3);
        assert_eq!(fs.iget(b).unwrap().nlink, 2);

        fs.rename(a, b"child", b, b"child", RenameFlags::NONE).unwrap();

        assert_eq!(fs.iget(a).unwrap().nlink, 2);
        assert_eq!(fs.iget(b).unwrap().nlink, 3);
        check_invariants(&fs);
    }

    #[test]
    fn filling_an_extent_spills_into_the_next_one() {
        let fs = new_fs(256, 512);
        let d = fs.mkdir(ROOT, b"d", dir_mode(), 0, 0).unwrap();

        for i in 0..FILES_PER_EXT {
            fs.create(d, format!("f{i}").as_bytes(), reg_mode(), 0, 0)
                .unwrap();
        }

        let index = read_index(&fs, d);
        assert_eq!(index.nr_files, FILES_PER_EXT as u32);
        assert_eq!(index.extents[0].nr_files, FILES_PER_EXT as u32);
        assert!(!index.extents[1].is_live());

        let free_before = fs.free_blocks();
        fs.create(d, b"overflow", reg_mode(), 0, 0).unwrap();

        let index = read_index(&fs, d);
        assert!(index.extents[1].is_live());
        assert_eq!(index.extents[1].ee_len, MAX_BLOCKS_PER_EXTENT as u32);
        assert_eq!(index.extents[1].ee_block, MAX_BLOCKS_PER_EXTENT as u32);
        assert_eq!(index.extents[1].nr_files, 1);
        assert_eq!(
            fs.free_blocks(),
            free_before - 1 - MAX_BLOCKS_PER_EXTENT as u32,
            "one index block plus a fresh 8-block extent"
        );
        check_invariants(&fs);
    }

    #[test]
    fn overflowing_a_block_opens_the_next_one() {
        let fs = new_fs(64, 256);
        let d = fs.mkdir(ROOT, b"d", dir_mode(), 0, 0).unwrap();

        let mut last = InodeNumber::NONE;
        for i in 0..=FILES_PER_BLOCK {
            last = fs
                .create(d, format!("f{i}").as_bytes(), reg_mode(), 0, 0)
                .unwrap();
        }

        let index = read_index(&fs, d);
        let ext = index.extents[0];
        assert_eq!(ext.nr_files, FILES_PER_BLOCK as u32 + 1);

        let first: DirBlock = fs.cache.get(ext.ee_start).unwrap().read().read_as();
        assert!(first.is_full());

        let second: DirBlock = fs.cache.get(ext.ee_start + 1).unwrap().read().read_as();
        assert_eq!(second.nr_files, 1);
        assert_eq!(second.files[0].inode, last);
        assert_eq!(second.files[0].nr_blk, 1);
        check_invariants(&fs);
    }

    #[test]
    fn deleting_from_the_middle_keeps_the_walk_complete() {
        let fs = new_fs(64, 256);
        let d = fs.mkdir(ROOT, b"d", dir_mode(), 0, 0).unwrap();

        let mut inos = alloc::vec::Vec::new();
        for i in 0..7 {
            inos.push(
                fs.create(d, format!("f{i}").as_bytes(), reg_mode(), 0, 0)
                    .unwrap(),
            );
        }

        fs.unlink(d, b"f3").unwrap();

        for (i, &ino) in inos.iter().enumerate() {
            let expected = if i == 3 { None } else { Some(ino) };
            assert_eq!(fs.lookup(d, format!("f{i}").as_bytes()).unwrap(), expected);
        }
        check_invariants(&fs);
    }

    #[test]
    fn exhausted_block_pool_rolls_the_creation_back() {
        // 64 inodes: sb + 2 istore + ifree + bfree + root index = 6 blocks, one left over
        let fs = new_fs(64, 7);
        assert_eq!(fs.free_blocks(), 1);
        let before = snapshot(&fs);

        assert_eq!(
            fs.create(ROOT, b"f", reg_mode(), 0, 0).unwrap_err(),
            FsError::NoSpace
        );
        assert_eq!(snapshot(&fs), before, "failed creation must release everything");
        assert_eq!(fs.lookup(ROOT, b"f").unwrap(), None);
        check_invariants(&fs);
    }

    #[test]
    fn unreadable_index_block_rolls_the_creation_back() {
        let fs = new_fs(64, 256);
        let before = snapshot(&fs);

        // the next creation will pick block 6, the lowest free one, for its index
        fs.cache.device().set_faulty(BlockNumber(6), true);

        assert_eq!(
            fs.create(ROOT, b"f", reg_mode(), 0, 0).unwrap_err(),
            FsError::Io(crate::errors::IOError::Device)
        );
        assert_eq!(snapshot(&fs), before);

        fs.cache.device().set_faulty(BlockNumber(6), false);
        fs.create(ROOT, b"f", reg_mode(), 0, 0).unwrap();
        check_invariants(&fs);
    }

    #[test]
    fn hard_links_share_the_inode_until_the_last_name_goes() {
        let fs = new_fs(64, 256);
        let before = snapshot(&fs);

        let d = fs.mkdir(ROOT, b"d", dir_mode(), 0, 0).unwrap();
        let f = fs.create(ROOT, b"f", reg_mode(), 0, 0).unwrap();

        assert_eq!(fs.link(d, ROOT, b"dir-link").unwrap_err(), FsError::Invalid);

        fs.link(f, d, b"alias").unwrap();
        assert_eq!(fs.iget(f).unwrap().nlink, 2);
        assert_eq!(fs.lookup(d, b"alias").unwrap(), Some(f));

        fs.unlink(ROOT, b"f").unwrap();
        assert_eq!(fs.iget(f).unwrap().nlink, 1);
        assert_eq!(fs.lookup(d, b"alias").unwrap(), Some(f));

        fs.unlink(d, b"alias").unwrap();
        fs.rmdir(ROOT, b"d").unwrap();
        assert_eq!(snapshot(&fs), before);
        check_invariants(&fs);
    }

    #[test]
    fn misdirected_operations_are_rejected() {
        let fs = new_fs(64, 256);

        fs.mkdir(ROOT, b"d", dir_mode(), 0, 0).unwrap();
        let f = fs.create(ROOT, b"f", reg_mode(), 0, 0).unwrap();

        assert_eq!(fs.unlink(ROOT, b"missing").unwrap_err(), FsError::NotFound);
        assert_eq!(fs.unlink(ROOT, b"d").unwrap_err(), FsError::Invalid);
        assert_eq!(fs.rmdir(ROOT, b"f").unwrap_err(), FsError::Invalid);
        assert_eq!(fs.lookup(f, b"x").unwrap_err(), FsError::Invalid);
        assert_eq!(
            fs.create(ROOT, b"s", InodeFileMode::S_IFLNK, 0, 0).unwrap_err(),
            FsError::Invalid
        );
        assert_eq!(fs.iget(InodeNumber(9999)).unwrap_err(), FsError::Invalid);
    }

    #[test]
    fn mutations_are_stamped_from_the_mount_clock() {
        let disk = MemDisk::new(256);
        mkfs::format(&disk, 64).unwrap();

        let fs = CellFs::mount(disk, Box::new(ManualClock::new(500))).unwrap();

        let f = fs.create(ROOT, b"f", reg_mode(), 3, 4).unwrap();
        let inode = fs.iget(f).unwrap();
        assert_eq!(inode.ctime.0, 500);
        assert_eq!(inode.mtime.0, 500);
        assert_eq!(inode.uid, 3);
        assert_eq!(inode.gid, 4);

        let root = fs.iget(ROOT).unwrap();
        assert_eq!(root.mtime.0, 500, "creation touches the parent");
    }

    #[test]
    fn sync_persists_the_image_across_a_remount() {
        let fs = new_fs(64, 256);

        let d = fs.mkdir(ROOT, b"d", dir_mode(), 0, 0).unwrap();
        let f = fs.create(d, b"f", reg_mode(), 0, 0).unwrap();
        fs.symlink(ROOT, b"ln", b"d/f", 0, 0).unwrap();
        let counters = (fs.free_inodes(), fs.free_blocks());

        fs.sync().unwrap();
        let disk = fs.into_device();

        let fs = CellFs::mount(disk, Box::new(ManualClock::new(2000))).unwrap();
        assert_eq!(fs.lookup(ROOT, b"d").unwrap(), Some(d));
        assert_eq!(fs.lookup(d, b"f").unwrap(), Some(f));
        let ln = fs.lookup(ROOT, b"ln").unwrap().unwrap();
        assert_eq!(fs.get_link(ln).unwrap(), b"d/f".to_vec());
        assert_eq!((fs.free_inodes(), fs.free_blocks()), counters);
        check_invariants(&fs);
    }
}
