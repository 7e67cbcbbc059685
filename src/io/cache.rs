//! Refcounted block buffers with dirty tracking.
//!
//! A [`Buf`] holds one block's worth of bytes. Buffers are handed out as
//! `Arc<RwLock<Buf>>` smart pointers: the [`Arc`] count is the buffer's reference count, and
//! releasing a buffer is simply dropping the last clone. Mutations become visible on the device
//! only after the buffer was marked dirty and the cache flushed through [`BufCache::sync`].

use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;

use bytemuck::{bytes_of, pod_read_unaligned, Pod};
use hashbrown::HashMap;
use spin::RwLock;

use crate::errors::{CanFail, IOError};
use crate::io::{BlockDevice, BlockNumber, BLOCK_SIZE};

/// Smart pointer to a locked [`Buf`].
pub type BufRef = Arc<RwLock<Buf>>;

/// In-memory copy of one device block.
#[derive(Debug)]
pub struct Buf {
    bno: BlockNumber,
    data: Vec<u8>,
    dirty: bool,
}

impl Buf {
    fn new(bno: BlockNumber) -> Self {
        Self {
            bno,
            data: vec![0u8; BLOCK_SIZE],
            dirty: false,
        }
    }

    /// Block this buffer mirrors.
    pub fn block_number(&self) -> BlockNumber {
        self.bno
    }

    /// The buffered bytes.
    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    /// Mutable access to the buffered bytes.
    ///
    /// The change only reaches the device if the buffer is marked dirty afterwards.
    pub fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Flags the buffer for write-back on the next [`BufCache::sync`].
    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Decodes a record of type `T` from the head of the buffer.
    pub fn read_as<T: Pod>(&self) -> T {
        self.read_at(0)
    }

    /// Decodes a record of type `T` starting at byte `offset`.
    pub fn read_at<T: Pod>(&self, offset: usize) -> T {
        pod_read_unaligned(&self.data[offset..offset + core::mem::size_of::<T>()])
    }

    /// Encodes `value` at the head of the buffer and marks it dirty.
    pub fn write_as<T: Pod>(&mut self, value: &T) {
        self.write_at(0, value);
    }

    /// Encodes `value` at byte `offset` and marks the buffer dirty.
    pub fn write_at<T: Pod>(&mut self, offset: usize, value: &T) {
        self.data[offset..offset + core::mem::size_of::<T>()].copy_from_slice(bytes_of(value));
        self.dirty = true;
    }

    /// Zero-fills the whole buffer and marks it dirty.
    pub fn zero(&mut self) {
        self.data.fill(0);
        self.dirty = true;
    }
}

/// Cache of [`Buf`] buffers over a [`BlockDevice`].
///
/// `get` reads a block at most once and then keeps serving the same refcounted buffer, so every
/// party mutating a block sees the same bytes.
pub struct BufCache<D: BlockDevice> {
    dev: D,
    bufs: RwLock<HashMap<BlockNumber, BufRef>>,
}

impl<D: BlockDevice> BufCache<D> {
    pub fn new(dev: D) -> Self {
        Self {
            dev,
            bufs: RwLock::new(HashMap::new()),
        }
    }

    /// The device backing this cache.
    pub fn device(&self) -> &D {
        &self.dev
    }

    /// Drops the cache, handing the device back. Unsynced dirty buffers are lost.
    pub fn into_device(self) -> D {
        self.dev
    }

    /// Returns the buffer for block `bno`, reading it from the device on first access.
    pub fn get(&self, bno: BlockNumber) -> Result<BufRef, IOError> {
        if let Some(buf) = self.bufs.read().get(&bno) {
            return Ok(buf.clone());
        }

        let mut buf = Buf::new(bno);
        self.dev.read_block(bno, buf.bytes_mut())?;

        // a concurrent reader may have populated the entry in the meantime; everyone must
        // end up holding the same buffer
        let buf = Arc::new(RwLock::new(buf));
        let buf = self
            .bufs
            .write()
            .entry(bno)
            .or_insert_with(|| buf)
            .clone();

        Ok(buf)
    }

    /// Writes every dirty buffer back to the device, then flushes the device itself.
    pub fn sync(&self) -> CanFail<IOError> {
        let bufs = self.bufs.read();

        for buf in bufs.values() {
            let mut buf = buf.write();
            if buf.is_dirty() {
                self.dev.write_block(buf.block_number(), buf.bytes())?;
                buf.dirty = false;
            }
        }

        self.dev.sync()
    }
}
