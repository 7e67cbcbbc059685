use core::fmt::Debug;

/// `BaseError` is a common trait implemented by every error type defined in this crate.
///
/// It is dependent on the [`Debug`] trait, which makes sense as we are dealing with errors.
pub trait BaseError: Debug {}

/// `CanFail` is a return type for functions that are allowed to fail, and don't need to return
/// anything.
///
/// For instance, it could be used when writing a block back to the backing device, or when
/// flushing the dirty state of a mounted file system.
pub type CanFail<T> = Result<(), T>;

/// `IOError` defines several error types useful when communicating with a block device.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IOError {
    /// The requested block lies outside of the device.
    OutOfBounds,

    /// The underlying device rejected the read or the write.
    Device,

    Unknown,
}

impl BaseError for IOError {}

/// `MountError` defines the ways attaching to a file system image can fail.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MountError {
    /// Failure while reading the on-disk metadata.
    IOError,

    /// The superblock is missing, truncated or carries an invalid magic number.
    BadSuperblock,
}

impl BaseError for MountError {}

/// `FsError` defines the error kinds surfaced by the metadata operations.
///
/// A lookup miss is not an error: [`lookup`](crate::fs::cell::CellFs::lookup) reports absence
/// through its return value. Operations that must resolve their target themselves surface a
/// missing name as [`FsError::NotFound`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FsError {
    /// Unsupported file kind or flag.
    Invalid,

    /// File name longer than 255 bytes, or symlink target longer than 31 bytes.
    NameTooLong,

    /// Inode or block bitmap exhausted.
    NoSpace,

    /// The directory is full.
    MaxLinks,

    /// The destination name already exists.
    AlreadyExists,

    /// The directory still contains entries.
    NotEmpty,

    /// The named entry does not exist.
    NotFound,

    /// Failure while reading from or writing to the backing device.
    Io(IOError),
}

impl BaseError for FsError {}

impl From<IOError> for FsError {
    fn from(err: IOError) -> Self {
        FsError::Io(err)
    }
}
