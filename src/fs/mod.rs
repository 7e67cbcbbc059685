//! File-system metadata structures.
//!
//! Contains the on-disk data model and the directory-tree operations of the `cellfs` layout:
//! a superblock, a packed inode table, two free bitmaps and a data region of 4 KiB blocks,
//! with extent-indexed directories on top.

use crate::errors::FsError;

pub mod cell;

/// Return type of the metadata operations.
pub type FsResult<T> = Result<T, FsError>;
