//! Inode records and the packed inode table.
//!
//! Inodes are the base structure describing one file, directory or symbolic link. On disk they
//! are 72-byte packed records, densely laid out in the inode table that starts at block 1:
//! inode `i` lives in block `1 + i / INODES_PER_BLOCK`, at slot `i % INODES_PER_BLOCK`.

use core::fmt::{Display, Formatter};

use bytemuck::{Pod, Zeroable};

use crate::io::{BlockNumber, BLOCK_SIZE};
use crate::time::UnixTimestamp32;

/// Number of inode records packed in one block of the inode table.
pub const INODES_PER_BLOCK: usize = BLOCK_SIZE / core::mem::size_of::<RawInode>();

/// Size of the inline payload of an inode, holding the target of a symbolic link
/// (31 bytes plus a terminating NUL).
pub const INLINE_DATA_LEN: usize = 32;

/// Longest admissible symlink target.
pub const MAX_SYMLINK_LEN: usize = INLINE_DATA_LEN - 1;

/// A number identifying an inode.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Pod, Zeroable)]
#[repr(transparent)]
pub struct InodeNumber(pub u32);

impl InodeNumber {
    /// Inode 0 is reserved as "none"; a directory slot holding it is free.
    pub const NONE: Self = Self(0);

    /// Inode 1 is the root directory of the file system.
    pub const ROOT: Self = Self(1);
}

impl Display for InodeNumber {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        f.write_fmt(format_args!("{}", self.0))
    }
}

impl From<InodeNumber> for u32 {
    fn from(value: InodeNumber) -> Self {
        value.0
    }
}

impl From<u32> for InodeNumber {
    fn from(value: u32) -> Self {
        InodeNumber(value)
    }
}

impl From<InodeNumber> for usize {
    fn from(value: InodeNumber) -> Self {
        value.0.try_into().expect("invalid inode number")
    }
}

impl From<usize> for InodeNumber {
    fn from(value: usize) -> Self {
        InodeNumber(value.try_into().expect("invalid inode number (not 32-bit)"))
    }
}

/// File mode: a kind tag in the upper bits, permissions in the lower ones.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Pod, Zeroable)]
#[repr(transparent)]
pub struct InodeFileMode(pub u32);

impl InodeFileMode {
    /// Mask extracting the file kind bits.
    pub const S_IFMT: Self = Self(0xF000);

    /// Directory
    pub const S_IFDIR: Self = Self(0x4000);

    /// Regular file
    pub const S_IFREG: Self = Self(0x8000);

    /// Symbolic link
    pub const S_IFLNK: Self = Self(0xA000);

    /// Read, write and execute for everyone.
    pub const S_IRWXUGO: Self = Self(0o777);

    /// Checks if all mode bits of `mode` are set in this mode.
    pub fn contains(self, mode: InodeFileMode) -> bool {
        self.0 & mode.0 == mode.0
    }

    /// The kind tag of this mode, if it names a supported file kind.
    pub fn kind(self) -> Option<FileKind> {
        match Self(self.0 & Self::S_IFMT.0) {
            Self::S_IFDIR => Some(FileKind::Directory),
            Self::S_IFREG => Some(FileKind::Regular),
            Self::S_IFLNK => Some(FileKind::Symlink),
            _ => None,
        }
    }

    pub fn is_dir(self) -> bool {
        self.kind() == Some(FileKind::Directory)
    }

    pub fn is_regular(self) -> bool {
        self.kind() == Some(FileKind::Regular)
    }

    pub fn is_symlink(self) -> bool {
        self.kind() == Some(FileKind::Symlink)
    }
}

impl core::ops::BitOr for InodeFileMode {
    type Output = InodeFileMode;

    fn bitor(self, rhs: Self) -> Self::Output {
        InodeFileMode(self.0 | rhs.0)
    }
}

/// Kind associated to a given [`Inode`].
///
/// The engine dispatches per-kind behavior by matching on this tag.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FileKind {
    Regular,
    Directory,
    Symlink,
}

impl Display for FileKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        let kind_str = match self {
            FileKind::Regular => "file",
            FileKind::Directory => "directory",
            FileKind::Symlink => "symlink",
        };

        f.write_str(kind_str)
    }
}

/// On-disk inode record.
///
/// All integer fields are little-endian 32-bit. `ei_block` names the inode's extent-index
/// block and is meaningless for symlinks; `i_data` carries the symlink target and is
/// meaningless for files and directories.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct RawInode {
    pub i_mode: InodeFileMode,
    pub i_uid: u32,
    pub i_gid: u32,
    pub i_size: u32,
    pub i_ctime: UnixTimestamp32,
    pub i_atime: UnixTimestamp32,
    pub i_mtime: UnixTimestamp32,
    pub i_blocks: u32,
    pub i_nlink: u32,
    pub ei_block: BlockNumber,
    pub i_data: [u8; INLINE_DATA_LEN],
}

/// In-memory inode, as handed to and mutated by the metadata operations.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Inode {
    pub num: InodeNumber,
    pub mode: InodeFileMode,
    pub uid: u32,
    pub gid: u32,
    pub size: u32,
    pub ctime: UnixTimestamp32,
    pub atime: UnixTimestamp32,
    pub mtime: UnixTimestamp32,
    pub blocks: u32,
    pub nlink: u32,

    /// Block holding this inode's extent list (files and directories).
    pub ei_block: BlockNumber,

    /// Inline symlink payload (symlinks only).
    pub i_data: [u8; INLINE_DATA_LEN],
}

impl Inode {
    pub(crate) fn from_raw(num: InodeNumber, raw: &RawInode) -> Self {
        Self {
            num,
            mode: raw.i_mode,
            uid: raw.i_uid,
            gid: raw.i_gid,
            size: raw.i_size,
            ctime: raw.i_ctime,
            atime: raw.i_atime,
            mtime: raw.i_mtime,
            blocks: raw.i_blocks,
            nlink: raw.i_nlink,
            ei_block: raw.ei_block,
            i_data: raw.i_data,
        }
    }

    pub(crate) fn to_raw(&self) -> RawInode {
        RawInode {
            i_mode: self.mode,
            i_uid: self.uid,
            i_gid: self.gid,
            i_size: self.size,
            i_ctime: self.ctime,
            i_atime: self.atime,
            i_mtime: self.mtime,
            i_blocks: self.blocks,
            i_nlink: self.nlink,
            ei_block: self.ei_block,
            i_data: self.i_data,
        }
    }

    /// The kind tag of this inode.
    pub fn kind(&self) -> Option<FileKind> {
        self.mode.kind()
    }

    /// Sets the access, change and modification times in one go.
    pub(crate) fn touch(&mut self, now: UnixTimestamp32) {
        self.ctime = now;
        self.atime = now;
        self.mtime = now;
    }

    /// The symlink target stored inline in this inode.
    ///
    /// Empty for anything that is not a symbolic link.
    pub fn link_target(&self) -> &[u8] {
        let end = self
            .i_data
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(self.i_data.len());

        &self.i_data[..end]
    }
}
