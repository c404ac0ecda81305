//! OS backends.
//!
//! Both backends expose the same free functions: region queries, protection
//! changes, executable allocation near a target, instruction cache flushes and
//! module enumeration. `crate::memory` and the hook layer are written against
//! this surface only.

use thiserror::Error;

use crate::ffi::address::Address;

#[cfg(windows)]
mod windows;
#[cfg(windows)]
pub use self::windows::*;

#[cfg(unix)]
mod unix;
#[cfg(unix)]
pub use self::unix::*;

#[derive(Debug, Error)]
pub enum OsError {
    #[cfg(windows)]
    #[error("Windows core API error: {0}")]
    WindowsCore(#[from] ::windows::core::Error),

    #[error("Io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Input address is NULL")]
    NullAddress,

    #[error("Size can't be zero")]
    ZeroSize,

    #[error("No mapped region contains 0x{0:X}")]
    RegionNotFound(usize),

    #[error("Failed to allocate {0} bytes of executable memory")]
    AllocationFailed(usize),

    #[error("Module enumeration is not supported on this platform")]
    Unsupported,
}

pub type OsResult<T> = std::result::Result<T, OsError>;

/// Platform protection value, kept opaque so it can be restored verbatim
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PageProtection(pub u32);

/// One contiguous range of pages sharing the same state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Region {
    pub base: Address,
    pub size: usize,
    pub readable: bool,
    pub writable: bool,
    pub executable: bool,
    pub protection: PageProtection,
}

impl Region {
    pub fn end(&self) -> Address {
        self.base + self.size
    }

    pub fn contains(&self, address: Address) -> bool {
        address >= self.base && address < self.end()
    }
}
