//! Timestamp representation and clock sources.
//!
//! On-disk timestamps are 32-bit second counts. The engine never reads a hardware clock itself:
//! the host hands a [`Clock`] to the mount, and every mutating operation stamps the touched
//! inodes from it.

use core::sync::atomic::{AtomicU32, Ordering};

use bytemuck::{Pod, Zeroable};

/// A 32-bit UNIX timestamp (seconds since the epoch), as stored in inode records.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Pod, Zeroable)]
#[repr(transparent)]
pub struct UnixTimestamp32(pub u32);

impl core::fmt::Display for UnixTimestamp32 {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_fmt(format_args!("{}", self.0))
    }
}

/// A source of "now" for timestamp updates.
pub trait Clock: Send + Sync {
    fn now(&self) -> UnixTimestamp32;
}

/// A [`Clock`] driven by its owner.
///
/// Starts at zero; the host (or a test) advances it explicitly.
#[derive(Debug, Default)]
pub struct ManualClock {
    secs: AtomicU32,
}

impl ManualClock {
    pub fn new(secs: u32) -> Self {
        Self {
            secs: AtomicU32::new(secs),
        }
    }

    /// Sets the current time, in seconds since the epoch.
    pub fn set(&self, secs: u32) {
        self.secs.store(secs, Ordering::Relaxed);
    }

    /// Moves the clock forward.
    pub fn advance(&self, secs: u32) {
        self.secs.fetch_add(secs, Ordering::Relaxed);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> UnixTimestamp32 {
        UnixTimestamp32(self.secs.load(Ordering::Relaxed))
    }
}
